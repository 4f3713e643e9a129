//! Managed (.NET) assemblies: identities and the metadata they declare

use crate::common::ScanError;
use crate::locator::find_files;
use crate::models::TargetProcessor;
use crate::pe::managed_target_processor;
use dotscope::metadata::customattributes::{
    parse_custom_attribute_blob, CustomAttributeArgument, CustomAttributeValue,
};
use dotscope::metadata::identity::Identity;
use dotscope::prelude::{CilObject, CilTypeReference, CustomAttributeRaw, ImplMapRaw, TableId, Token};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::fmt;
use std::path::{Path, PathBuf};

/// Name, version, culture and public key token of an assembly
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: Option<String>,
    pub culture: Option<String>,
    pub public_key_token: Option<String>,
}

impl AssemblyIdentity {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: None,
            culture: None,
            public_key_token: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_owned());
        self
    }

    /// Parse a display name like `System.Core, Version=4.0.0.0, Culture=neutral, PublicKeyToken=b77a5c561934e089`
    ///
    /// Keys other than Version, Culture and PublicKeyToken are ignored.
    pub fn parse(display_name: &str) -> Result<Self, ScanError> {
        let mut parts = display_name.split(',').map(str::trim);
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(ScanError::ParseError(format!(
                "Missing assembly name in '{display_name}'"
            )));
        }
        let mut ret = Self::new(name);
        for part in parts {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ScanError::ParseError(format!("Bad assembly name component '{part}'"))
            })?;
            let value = Some(value.trim().to_owned());
            match key.trim().to_ascii_lowercase().as_str() {
                "version" => ret.version = value,
                "culture" => ret.culture = value,
                "publickeytoken" => ret.public_key_token = value,
                _ => {}
            }
        }
        Ok(ret)
    }

    pub fn full_name(&self) -> String {
        let mut ret = self.name.clone();
        if let Some(version) = &self.version {
            ret += &format!(", Version={version}");
        }
        if let Some(culture) = &self.culture {
            ret += &format!(", Culture={culture}");
        }
        if let Some(token) = &self.public_key_token {
            ret += &format!(", PublicKeyToken={token}");
        }
        ret
    }
}

impl fmt::Display for AssemblyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// Everything the managed pipeline reads from one assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedAssembly {
    pub identity: AssemblyIdentity,
    pub file_path: Option<PathBuf>,
    pub is_il_only: bool,
    pub is_debug: Option<bool>,
    pub target_framework: Option<String>,
    pub has_entry_point: bool,
    pub target_processor: Option<TargetProcessor>,
    /// Declared assembly references, in metadata order
    pub references: Vec<AssemblyIdentity>,
    /// Distinct module names of DllImport declarations
    pub dll_imports: Vec<String>,
}

impl ManagedAssembly {
    pub fn new(identity: AssemblyIdentity) -> Self {
        Self {
            identity,
            file_path: None,
            is_il_only: true,
            is_debug: None,
            target_framework: None,
            has_entry_point: false,
            target_processor: None,
            references: Vec::new(),
            dll_imports: Vec::new(),
        }
    }
}

/// Where to load an assembly from
#[derive(Debug, Clone, Copy)]
pub enum AssemblySource<'a> {
    File(&'a Path),
    /// Resolve the identity against the global assembly locations
    Identity(&'a AssemblyIdentity),
}

pub trait ManagedMetadataReader {
    /// Identity of the assembly stored in a file; `NotManaged` if the file holds no CLI metadata
    fn read_identity(&self, path: &Path) -> Result<AssemblyIdentity, ScanError>;

    fn read_assembly(&self, source: AssemblySource<'_>) -> Result<ManagedAssembly, ScanError>;
}

const COMIMAGE_FLAGS_ILONLY: u32 = 0x1;
const COMIMAGE_FLAGS_32BITREQUIRED: u32 = 0x2;
const DEBUGGING_MODES_DEFAULT: u32 = 0x1;
/// Token of the single row of the Assembly table
const ASSEMBLY_TOKEN: u32 = 0x2000_0001;
const MEMBER_REF_TABLE: u8 = 0x0A;
const MODULE_REF_TABLE: u32 = 0x1A00_0000;

/// Reads CLI metadata from PE files through dotscope
#[derive(Debug, Clone, Default)]
pub struct CliMetadataReader {
    /// Roots searched when an assembly is requested by identity only
    pub global_dirs: Vec<PathBuf>,
}

impl CliMetadataReader {
    pub fn new(global_dirs: Vec<PathBuf>) -> Self {
        Self { global_dirs }
    }

    pub fn read_file(&self, path: &Path) -> Result<ManagedAssembly, ScanError> {
        let content = fs_err::read(path)?;
        let (machine, has_cli_header) = {
            let pe = goblin::pe::PE::parse(&content).map_err(|e| ScanError::bad_image(path, e.to_string()))?;
            let has_cli_header = pe
                .header
                .optional_header
                .as_ref()
                .and_then(|oh| {
                    oh.data_directories
                        .get_clr_runtime_header()
                        .as_ref()
                        .map(|d| d.virtual_address != 0 && d.size != 0)
                })
                .unwrap_or(false);
            (pe.header.coff_header.machine, has_cli_header)
        };
        if !has_cli_header {
            return Err(ScanError::NotManaged(path.to_owned()));
        }

        let object = CilObject::from_mem(content)
            .map_err(|e| ScanError::Malformed(format!("{}: {}", path.display(), e)))?;
        let assembly = object
            .assembly()
            .ok_or_else(|| ScanError::MissingIdentity(path.display().to_string()))?;
        let public_key = assembly
            .public_key
            .as_ref()
            .map(|key| Identity::PubKey(key.clone()));

        let flags = object.cor20header().flags;
        let is_il_only = flags & COMIMAGE_FLAGS_ILONLY != 0;
        let mut ret = ManagedAssembly::new(identity_from(
            &assembly.name,
            [
                assembly.major_version,
                assembly.minor_version,
                assembly.build_number,
                assembly.revision_number,
            ],
            assembly.culture.as_deref(),
            public_key.as_ref(),
        ));
        ret.file_path = Some(path.to_owned());
        ret.is_il_only = is_il_only;
        ret.has_entry_point = object.cor20header().entry_point_token != 0;
        ret.target_processor = managed_target_processor(
            machine,
            is_il_only,
            flags & COMIMAGE_FLAGS_32BITREQUIRED != 0,
        );
        ret.references = object
            .refs_assembly()
            .iter()
            .map(|entry| {
                let reference = entry.value();
                identity_from(
                    &reference.name,
                    [
                        reference.major_version,
                        reference.minor_version,
                        reference.build_number,
                        reference.revision_number,
                    ],
                    reference.culture.as_deref(),
                    reference.identifier.as_ref(),
                )
            })
            .collect();
        ret.dll_imports = read_dll_imports(&object);
        read_assembly_attributes(&object, &mut ret);
        Ok(ret)
    }

    /// Look for an assembly in the global locations, preferring the requested version
    pub fn resolve_identity(&self, identity: &AssemblyIdentity) -> Result<ManagedAssembly, ScanError> {
        let file_name = format!("{}.dll", identity.name);
        let mut candidates = Vec::new();
        for dir in &self.global_dirs {
            candidates.extend(find_files(&file_name, dir)?);
        }
        pick_version(identity, &candidates, |p| self.read_file(p))
    }
}

impl ManagedMetadataReader for CliMetadataReader {
    fn read_identity(&self, path: &Path) -> Result<AssemblyIdentity, ScanError> {
        Ok(self.read_file(path)?.identity)
    }

    fn read_assembly(&self, source: AssemblySource<'_>) -> Result<ManagedAssembly, ScanError> {
        match source {
            AssemblySource::File(path) => self.read_file(path),
            AssemblySource::Identity(identity) => self.resolve_identity(identity),
        }
    }
}

/// First candidate carrying the requested version, else the first readable one
fn pick_version<F>(identity: &AssemblyIdentity, candidates: &[PathBuf], read: F) -> Result<ManagedAssembly, ScanError>
where
    F: Fn(&Path) -> Result<ManagedAssembly, ScanError>,
{
    let mut fallback = None;
    for candidate in candidates {
        match read(candidate) {
            Ok(assembly) => {
                if identity.version.is_none() || assembly.identity.version == identity.version {
                    return Ok(assembly);
                }
                fallback.get_or_insert(assembly);
            }
            Err(e) => tracing::debug!("Skipping {}: {}", candidate.display(), e),
        }
    }
    fallback.ok_or_else(|| ScanError::AssemblyNotFound(identity.full_name()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Token of a full public key: last 8 bytes of its SHA-1, reversed
fn public_key_token(key: &[u8]) -> String {
    let digest = Sha1::digest(key);
    let token: Vec<u8> = digest.iter().rev().take(8).copied().collect();
    to_hex(&token)
}

fn identity_from(name: &str, version: [u32; 4], culture: Option<&str>, key: Option<&Identity>) -> AssemblyIdentity {
    let culture = culture.filter(|c| !c.is_empty()).unwrap_or("neutral");
    let token = match key {
        Some(Identity::PubKey(key)) if !key.is_empty() => public_key_token(key),
        // stored in display order, read back little-endian
        Some(Identity::Token(token)) => to_hex(&token.to_le_bytes()),
        _ => "null".to_owned(),
    };
    AssemblyIdentity {
        name: name.to_owned(),
        version: Some(format!("{}.{}.{}.{}", version[0], version[1], version[2], version[3])),
        culture: Some(culture.to_owned()),
        public_key_token: Some(token),
    }
}

/// Names in first-seen order, without repetitions or blanks
fn distinct_names(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut ret: Vec<String> = Vec::new();
    for name in names {
        if !name.is_empty() && !ret.contains(&name) {
            ret.push(name);
        }
    }
    ret
}

/// Modules named by ImplMap rows
fn read_dll_imports(object: &CilObject) -> Vec<String> {
    let Some(impl_maps) = object
        .tables()
        .and_then(|tables| tables.table::<ImplMapRaw>(TableId::ImplMap))
    else {
        return Vec::new();
    };
    let modules = object.refs_module();
    distinct_names(impl_maps.iter().filter_map(|row| {
        modules
            .get(&Token::new(MODULE_REF_TABLE | row.import_scope))
            .map(|entry| entry.value().name.clone())
    }))
}

fn read_assembly_attributes(object: &CilObject, assembly: &mut ManagedAssembly) {
    let (Some(tables), Some(blob)) = (object.tables(), object.blob()) else {
        return;
    };
    let Some(attributes) = tables.table::<CustomAttributeRaw>(TableId::CustomAttribute) else {
        return;
    };
    for row in attributes.iter() {
        if row.parent.token.value() != ASSEMBLY_TOKEN || row.constructor.token.table() != MEMBER_REF_TABLE {
            continue;
        }
        let Some(entry) = object.refs_members().get(&row.constructor.token) else {
            continue;
        };
        let ctor = entry.value();
        let CilTypeReference::TypeRef(declared_by) = &ctor.declaredby else {
            continue;
        };
        let namespace = declared_by.namespace().unwrap_or_default();
        let name = declared_by.name().unwrap_or_default();
        let value = match parse_custom_attribute_blob(blob, row.value, &ctor.params) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Unreadable {}.{} value: {}", namespace, name, e);
                continue;
            }
        };
        match (namespace.as_str(), name.as_str()) {
            ("System.Runtime.Versioning", "TargetFrameworkAttribute") => {
                assembly.target_framework = target_framework(&value);
            }
            ("System.Diagnostics", "DebuggableAttribute") => {
                assembly.is_debug = debuggable(&value);
            }
            _ => {}
        }
    }
}

fn target_framework(value: &CustomAttributeValue) -> Option<String> {
    match value.fixed_args.first() {
        Some(CustomAttributeArgument::String(moniker)) => Some(moniker.clone()),
        _ => None,
    }
}

fn debugging_modes(arg: &CustomAttributeArgument) -> Option<u32> {
    match arg {
        CustomAttributeArgument::I4(modes) => u32::try_from(*modes).ok(),
        CustomAttributeArgument::U4(modes) => Some(*modes),
        CustomAttributeArgument::Enum(_, inner) => debugging_modes(inner),
        _ => None,
    }
}

/// DebuggableAttribute in either its (bool, bool) or its DebuggingModes form
fn debuggable(value: &CustomAttributeValue) -> Option<bool> {
    let mut is_debug = match value.fixed_args.as_slice() {
        [CustomAttributeArgument::Bool(jit_tracking), ..] => *jit_tracking,
        [modes] => debugging_modes(modes)? & DEBUGGING_MODES_DEFAULT != 0,
        _ => return None,
    };
    // an explicit IsJITTrackingEnabled overrides the constructor arguments
    for arg in &value.named_args {
        if let ("IsJITTrackingEnabled", CustomAttributeArgument::Bool(enabled)) = (arg.name.as_str(), &arg.value) {
            is_debug = !enabled;
        }
    }
    Some(is_debug)
}
