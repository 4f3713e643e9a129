//! Low-level PE file format access through the goblin and pelite libraries

use crate::common::ScanError;
use crate::models::TargetProcessor;
use goblin::pe::header::{COFF_MACHINE_IA64, COFF_MACHINE_X86, COFF_MACHINE_X86_64};
use std::collections::HashSet;
use std::path::Path;

/// What the native pipeline needs to know about a PE file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeImage {
    /// COFF machine type
    pub machine: u16,
    pub is_64: bool,
    /// Names of the DLLs this file imports from, without duplicates
    pub imports: Vec<String>,
}

impl NativeImage {
    pub fn target_processor(&self) -> TargetProcessor {
        if self.is_64 {
            TargetProcessor::X64
        } else {
            TargetProcessor::X86
        }
    }
}

/// Fields of the version resource used to describe a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileVersionInfo {
    pub company_name: Option<String>,
    pub product_version: Option<String>,
    /// VS_FF_DEBUG is set in the fixed file info
    pub is_debug: bool,
}

pub trait NativeMetadataReader {
    fn read_image(&self, path: &Path) -> Result<NativeImage, ScanError>;

    /// Version resource of the file, if it has one
    fn read_version_info(&self, _path: &Path) -> Result<Option<FileVersionInfo>, ScanError> {
        Ok(None)
    }
}

/// Reads import tables with goblin, and with pelite where goblin gives up
#[derive(Debug, Clone, Copy, Default)]
pub struct PeImportReader;

impl NativeMetadataReader for PeImportReader {
    fn read_image(&self, path: &Path) -> Result<NativeImage, ScanError> {
        let content = fs_err::read(path)?;
        // prefer goblin since it seems to be less fragile
        match goblin::Object::parse(&content) {
            Ok(goblin::Object::PE(pe)) => Ok(NativeImage {
                machine: pe.header.coff_header.machine,
                is_64: pe.is_64,
                imports: distinct(pe.libraries.iter().copied()),
            }),
            Ok(other) => Err(ScanError::bad_image(
                path,
                format!("unexpected executable format: {other:?}"),
            )),
            Err(e) => {
                tracing::debug!("goblin could not read {}: {}", path.display(), e);
                read_image_pelite(&content).map_err(|e| ScanError::bad_image(path, e.to_string()))
            }
        }
    }

    fn read_version_info(&self, path: &Path) -> Result<Option<FileVersionInfo>, ScanError> {
        read_file_version(path)
    }
}

/// Case-insensitive de-duplication, keeping the first spelling of each name
fn distinct<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .filter(|n| seen.insert(n.to_lowercase()))
        .map(str::to_owned)
        .collect()
}

fn read_image_pelite(content: &[u8]) -> Result<NativeImage, ScanError> {
    match pelite::PeFile::from_bytes(content)? {
        pelite::Wrap::T32(pe) => {
            use pelite::pe32::Pe;
            let names = match pe.imports() {
                Ok(imports) => imports
                    .iter()
                    .map(|desc| desc.dll_name())
                    .collect::<Result<Vec<&pelite::util::CStr>, pelite::Error>>()?,
                // there is no import directory
                Err(pelite::Error::Null) => Vec::new(),
                Err(e) => return Err(ScanError::PEError(e)),
            };
            Ok(NativeImage {
                machine: pe.file_header().Machine,
                is_64: false,
                imports: distinct(names.iter().filter_map(|s| s.to_str().ok())),
            })
        }
        pelite::Wrap::T64(pe) => {
            use pelite::pe64::Pe;
            let names = match pe.imports() {
                Ok(imports) => imports
                    .iter()
                    .map(|desc| desc.dll_name())
                    .collect::<Result<Vec<&pelite::util::CStr>, pelite::Error>>()?,
                Err(pelite::Error::Null) => Vec::new(),
                Err(e) => return Err(ScanError::PEError(e)),
            };
            Ok(NativeImage {
                machine: pe.file_header().Machine,
                is_64: true,
                imports: distinct(names.iter().filter_map(|s| s.to_str().ok())),
            })
        }
    }
}

/// Map a COFF machine type to the processor a managed image targets
///
/// I386 images that contain only IL and do not demand a 32-bit process run anywhere.
pub fn managed_target_processor(
    machine: u16,
    il_only: bool,
    requires_32_bit: bool,
) -> Option<TargetProcessor> {
    match machine {
        COFF_MACHINE_X86 if il_only && !requires_32_bit => Some(TargetProcessor::AnyCpu),
        COFF_MACHINE_X86 => Some(TargetProcessor::X86),
        COFF_MACHINE_X86_64 | COFF_MACHINE_IA64 => Some(TargetProcessor::X64),
        _ => None,
    }
}

const VS_FF_DEBUG: u32 = 0x1;

/// Read CompanyName, ProductVersion and the debug flag from the version resource of a file
pub fn read_file_version<P: AsRef<Path>>(path: P) -> Result<Option<FileVersionInfo>, ScanError> {
    let filemap = pelite::FileMap::open(path.as_ref())?;
    let resources = match pelite::PeFile::from_bytes(&filemap)? {
        pelite::Wrap::T32(pe) => {
            use pelite::pe32::Pe;
            pe.resources()
        }
        pelite::Wrap::T64(pe) => {
            use pelite::pe64::Pe;
            pe.resources()
        }
    };
    let resources = match resources {
        Ok(resources) => resources,
        // there is no resource directory
        Err(pelite::Error::Null) => return Ok(None),
        Err(e) => return Err(ScanError::PEError(e)),
    };
    let version_info = match resources.version_info() {
        Ok(version_info) => version_info,
        Err(e) => {
            tracing::debug!("No version info in {}: {}", path.as_ref().display(), e);
            return Ok(None);
        }
    };

    let mut ret = FileVersionInfo {
        is_debug: version_info
            .fixed()
            .map(|fixed| fixed.dwFileFlags & VS_FF_DEBUG != 0)
            .unwrap_or(false),
        ..FileVersionInfo::default()
    };
    if let Some(&lang) = version_info.translation().first() {
        ret.company_name = version_info.value(lang, "CompanyName");
        ret.product_version = version_info.value(lang, "ProductVersion");
    }
    Ok(Some(ret))
}
