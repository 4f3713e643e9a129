//! Builder for synthetic PE images, and in-memory readers

use crate::cli::{AssemblyIdentity, AssemblySource, ManagedAssembly, ManagedMetadataReader};
use crate::common::{file_name_lowercase, ScanError};
use crate::graph::AssemblyGraph;
use crate::models::{NodeId, TargetProcessor};
use crate::pe::{NativeImage, NativeMetadataReader};
use goblin::pe::header::COFF_MACHINE_X86;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: usize = 0x1000;
const SECTION_RVA: usize = 0x1000;
const PE_OFFSET: usize = 0x80;
const OPTIONAL_HEADER_SIZE: usize = 224;
const CLI_HEADER_SIZE: usize = 72;

fn align(value: usize, to: usize) -> usize {
    (value + to - 1) / to * to
}

fn put_u16(out: &mut [u8], at: usize, v: u16) {
    out[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn pad_to(out: &mut Vec<u8>, alignment: usize) {
    out.resize(align(out.len(), alignment), 0);
}

/// A PE32 image with one section holding the import table and, optionally, a CLI header
pub struct PeBuilder {
    machine: u16,
    imports: Vec<String>,
    cli: Option<(Vec<u8>, u32, u32)>,
}

impl PeBuilder {
    pub fn new() -> Self {
        Self {
            machine: COFF_MACHINE_X86,
            imports: Vec::new(),
            cli: None,
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn import(mut self, dll: &str) -> Self {
        self.imports.push(dll.to_owned());
        self
    }

    /// Embed a CLI header with the given COR20 flags and entry point token, followed by the metadata bytes
    pub fn managed(mut self, metadata: Vec<u8>, flags: u32, entry_point: u32) -> Self {
        self.cli = Some((metadata, flags, entry_point));
        self
    }

    /// Returns the section contents and the (rva, size) of the import and CLI directories
    fn section(&self) -> (Vec<u8>, Option<(u32, u32)>, Option<(u32, u32)>) {
        let rva = |offset: usize| (SECTION_RVA + offset) as u32;
        let mut sec: Vec<u8> = Vec::new();

        let mut import_dir = None;
        if !self.imports.is_empty() {
            let descriptors_size = (self.imports.len() + 1) * 20;
            sec.resize(descriptors_size, 0);
            for (i, dll) in self.imports.iter().enumerate() {
                let name = sec.len();
                sec.extend_from_slice(dll.as_bytes());
                sec.push(0);
                pad_to(&mut sec, 2);

                let hint_name = sec.len();
                push_u16(&mut sec, 0);
                sec.extend_from_slice(b"Function\0");
                pad_to(&mut sec, 4);

                let lookup = sec.len();
                push_u32(&mut sec, rva(hint_name));
                push_u32(&mut sec, 0);
                let address = sec.len();
                push_u32(&mut sec, rva(hint_name));
                push_u32(&mut sec, 0);

                let d = i * 20;
                put_u32(&mut sec, d, rva(lookup));
                put_u32(&mut sec, d + 12, rva(name));
                put_u32(&mut sec, d + 16, rva(address));
            }
            import_dir = Some((rva(0), descriptors_size as u32));
        }

        let mut cli_dir = None;
        if let Some((metadata, flags, entry_point)) = &self.cli {
            pad_to(&mut sec, 4);
            let header = sec.len();
            sec.resize(header + CLI_HEADER_SIZE, 0);
            let metadata_offset = sec.len();
            sec.extend_from_slice(metadata);

            put_u32(&mut sec, header, CLI_HEADER_SIZE as u32);
            put_u16(&mut sec, header + 4, 2);
            put_u16(&mut sec, header + 6, 5);
            put_u32(&mut sec, header + 8, rva(metadata_offset));
            put_u32(&mut sec, header + 12, metadata.len() as u32);
            put_u32(&mut sec, header + 16, *flags);
            put_u32(&mut sec, header + 20, *entry_point);
            cli_dir = Some((rva(header), CLI_HEADER_SIZE as u32));
        }

        if sec.is_empty() {
            sec.resize(16, 0);
        }
        (sec, import_dir, cli_dir)
    }

    pub fn build(&self) -> Vec<u8> {
        let (sec, import_dir, cli_dir) = self.section();
        let raw_size = align(sec.len(), FILE_ALIGNMENT);
        let headers_size = FILE_ALIGNMENT;
        let mut out = vec![0u8; headers_size + raw_size];

        // DOS header
        out[0] = b'M';
        out[1] = b'Z';
        put_u32(&mut out, 0x3C, PE_OFFSET as u32);

        out[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");
        let coff = PE_OFFSET + 4;
        put_u16(&mut out, coff, self.machine);
        put_u16(&mut out, coff + 2, 1);
        put_u16(&mut out, coff + 16, OPTIONAL_HEADER_SIZE as u16);
        // executable image, 32-bit machine, DLL
        put_u16(&mut out, coff + 18, 0x2102);

        let opt = coff + 20;
        put_u16(&mut out, opt, 0x10b);
        put_u32(&mut out, opt + 4, raw_size as u32); // SizeOfCode
        put_u32(&mut out, opt + 20, SECTION_RVA as u32); // BaseOfCode
        put_u32(&mut out, opt + 28, 0x1000_0000); // ImageBase
        put_u32(&mut out, opt + 32, SECTION_ALIGNMENT as u32);
        put_u32(&mut out, opt + 36, FILE_ALIGNMENT as u32);
        put_u16(&mut out, opt + 40, 6); // MajorOperatingSystemVersion
        put_u16(&mut out, opt + 48, 6); // MajorSubsystemVersion
        put_u32(
            &mut out,
            opt + 56,
            (SECTION_RVA + align(sec.len(), SECTION_ALIGNMENT)) as u32,
        ); // SizeOfImage
        put_u32(&mut out, opt + 60, headers_size as u32);
        put_u16(&mut out, opt + 68, 3); // console subsystem
        put_u32(&mut out, opt + 72, 0x10_0000); // stack reserve
        put_u32(&mut out, opt + 76, 0x1000);
        put_u32(&mut out, opt + 80, 0x10_0000); // heap reserve
        put_u32(&mut out, opt + 84, 0x1000);
        put_u32(&mut out, opt + 92, 16); // NumberOfRvaAndSizes

        let dirs = opt + 96;
        if let Some((rva, size)) = import_dir {
            put_u32(&mut out, dirs + 8, rva);
            put_u32(&mut out, dirs + 12, size);
        }
        if let Some((rva, size)) = cli_dir {
            put_u32(&mut out, dirs + 14 * 8, rva);
            put_u32(&mut out, dirs + 14 * 8 + 4, size);
        }

        let section = opt + OPTIONAL_HEADER_SIZE;
        out[section..section + 5].copy_from_slice(b".text");
        put_u32(&mut out, section + 8, sec.len() as u32);
        put_u32(&mut out, section + 12, SECTION_RVA as u32);
        put_u32(&mut out, section + 16, raw_size as u32);
        put_u32(&mut out, section + 20, headers_size as u32);
        // code, execute, read
        put_u32(&mut out, section + 36, 0x6000_0020);

        out[headers_size..headers_size + sec.len()].copy_from_slice(&sec);
        out
    }

    pub fn write(&self, path: &Path) -> Result<(), ScanError> {
        fs_err::write(path, self.build())?;
        Ok(())
    }
}

/// Managed reader answering from a table of assemblies keyed by lowercase file name
///
/// Files not in the table are reported as native.
#[derive(Default)]
pub struct FakeManagedReader {
    pub by_file: HashMap<String, ManagedAssembly>,
    pub global: Vec<ManagedAssembly>,
    /// File names whose metadata is reported as malformed
    pub broken: Vec<String>,
    /// File names passed to read_assembly, in call order
    pub reads: Mutex<Vec<String>>,
}

impl FakeManagedReader {
    pub fn add(&mut self, file_name: &str, assembly: ManagedAssembly) {
        self.by_file.insert(file_name.to_lowercase(), assembly);
    }

    fn lookup(&self, path: &Path) -> Result<ManagedAssembly, ScanError> {
        let name = file_name_lowercase(path).unwrap_or_default();
        if self.broken.contains(&name) {
            return Err(ScanError::Malformed(format!("{name} is broken")));
        }
        let mut assembly = self
            .by_file
            .get(&name)
            .cloned()
            .ok_or_else(|| ScanError::NotManaged(path.to_owned()))?;
        assembly.file_path = Some(path.to_owned());
        Ok(assembly)
    }
}

impl ManagedMetadataReader for FakeManagedReader {
    fn read_identity(&self, path: &Path) -> Result<AssemblyIdentity, ScanError> {
        Ok(self.lookup(path)?.identity)
    }

    fn read_assembly(&self, source: AssemblySource<'_>) -> Result<ManagedAssembly, ScanError> {
        match source {
            AssemblySource::File(path) => {
                record(&self.reads, path);
                self.lookup(path)
            }
            AssemblySource::Identity(identity) => self
                .global
                .iter()
                .find(|a| a.identity.name == identity.name)
                .cloned()
                .ok_or_else(|| ScanError::AssemblyNotFound(identity.full_name())),
        }
    }
}

/// Native reader answering from a table of import lists keyed by lowercase file name
#[derive(Default)]
pub struct FakeNativeReader {
    pub images: HashMap<String, NativeImage>,
    /// File names passed to read_image, in call order
    pub reads: Mutex<Vec<String>>,
}

impl FakeNativeReader {
    pub fn add(&mut self, file_name: &str, imports: &[&str]) {
        self.images.insert(
            file_name.to_lowercase(),
            NativeImage {
                machine: 0x8664,
                is_64: true,
                imports: imports.iter().map(|s| s.to_string()).collect(),
            },
        );
    }
}

impl NativeMetadataReader for FakeNativeReader {
    fn read_image(&self, path: &Path) -> Result<NativeImage, ScanError> {
        record(&self.reads, path);
        let name = file_name_lowercase(path).unwrap_or_default();
        self.images
            .get(&name)
            .cloned()
            .ok_or_else(|| ScanError::bad_image(path, "not in the fake image table"))
    }
}

fn record(reads: &Mutex<Vec<String>>, path: &Path) {
    if let Ok(mut reads) = reads.lock() {
        reads.push(file_name_lowercase(path).unwrap_or_default());
    }
}

/// How often a file name shows up in a list of reads
pub fn read_count(reads: &Mutex<Vec<String>>, file_name: &str) -> usize {
    let file_name = file_name.to_lowercase();
    reads
        .lock()
        .map(|r| r.iter().filter(|n| **n == file_name).count())
        .unwrap_or_default()
}

/// A local managed assembly with the given version and (name, version) references
pub fn managed_assembly(name: &str, version: &str, references: &[(&str, &str)]) -> ManagedAssembly {
    let mut assembly = ManagedAssembly::new(AssemblyIdentity::new(name).with_version(version));
    assembly.target_processor = Some(TargetProcessor::AnyCpu);
    assembly.references = references
        .iter()
        .map(|(n, v)| AssemblyIdentity::new(n).with_version(v))
        .collect();
    assembly
}

/// Id of the node with the given name; panics if there is none
pub fn node_named(graph: &AssemblyGraph, name: &str) -> NodeId {
    graph
        .nodes()
        .find(|(_, n)| n.name == name)
        .map(|(id, _)| id)
        .unwrap_or_else(|| panic!("no node named {name}"))
}

/// Names of the direct dependencies of a node, in link order
pub fn child_names(graph: &AssemblyGraph, id: NodeId) -> Vec<String> {
    graph
        .node(id)
        .links
        .iter()
        .map(|l| graph.node(graph.link(*l).target).name.clone())
        .collect()
}

/// Create empty files, including missing parent directories
pub fn touch_all(root: &Path, relative: &[&str]) -> Result<Vec<PathBuf>, ScanError> {
    relative
        .iter()
        .map(|r| {
            let path = root.join(r);
            if let Some(parent) = path.parent() {
                fs_err::create_dir_all(parent)?;
            }
            fs_err::write(&path, b"")?;
            Ok(path)
        })
        .collect()
}
