//! Composition root and per-scan resolution engine

use crate::apiset::ApiSetMap;
use crate::cli::{CliMetadataReader, ManagedMetadataReader};
use crate::common::ScanError;
use crate::graph::{AssemblyGraph, ScanResult};
use crate::locator::FileLocator;
use crate::models::AssemblyNode;
use crate::pe::{NativeMetadataReader, PeImportReader};
use crate::query::ScanQuery;
use crate::settings::ScanSettings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub type SharedManagedReader = Arc<dyn ManagedMetadataReader + Send + Sync>;
pub type SharedNativeReader = Arc<dyn NativeMetadataReader + Send + Sync>;

/// Everything a scan needs that outlives a single scan
///
/// Cheap to clone: readers and the API set map are shared.
#[derive(Clone)]
pub struct Scanner {
    managed_reader: SharedManagedReader,
    native_reader: SharedNativeReader,
    apiset: Arc<ApiSetMap>,
    settings: ScanSettings,
    system_dir: Option<PathBuf>,
}

impl Scanner {
    pub fn new(managed_reader: SharedManagedReader, native_reader: SharedNativeReader) -> Self {
        Self {
            managed_reader,
            native_reader,
            apiset: Arc::new(ApiSetMap::new()),
            settings: ScanSettings::default(),
            system_dir: None,
        }
    }

    /// Scanner reading real files, configured by the query
    pub fn from_query(query: &ScanQuery) -> Self {
        let apiset = query
            .system
            .as_ref()
            .and_then(|s| s.apiset_map.clone())
            .unwrap_or_default();
        Self::new(
            Arc::new(CliMetadataReader::new(query.global_assembly_dirs.clone())),
            Arc::new(PeImportReader),
        )
        .with_apiset(Arc::new(apiset))
        .with_settings(query.settings)
        .with_system_dir(query.system_dir().map(Path::to_owned))
    }

    pub fn with_settings(mut self, settings: ScanSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_apiset(mut self, apiset: Arc<ApiSetMap>) -> Self {
        self.apiset = apiset;
        self
    }

    /// Directory where system libraries are looked up once the local search fails
    pub fn with_system_dir(mut self, system_dir: Option<PathBuf>) -> Self {
        self.system_dir = system_dir;
        self
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Resolve everything the entry file depends on, searching locally next to it
    ///
    /// Every call starts from empty caches.
    pub fn scan<P: AsRef<Path>>(&self, entry: P) -> Result<ScanResult, ScanError> {
        ResolutionEngine::new(self).resolve(entry.as_ref())
    }

    /// Like scan, but with the local search rooted at base_dir
    pub fn scan_in<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        entry: P,
        base_dir: Q,
    ) -> Result<ScanResult, ScanError> {
        ResolutionEngine::new(self).resolve_in(entry.as_ref(), base_dir.as_ref())
    }

    /// Run a scan on the blocking thread pool
    pub async fn scan_async<P: AsRef<Path>>(&self, entry: P) -> Result<ScanResult, ScanError> {
        let scanner = self.clone();
        let entry = entry.as_ref().to_owned();
        tokio::task::spawn_blocking(move || scanner.scan(entry)).await?
    }
}

/// Caches and collaborators of a single scan
///
/// Consumed by resolve, so caches never leak from one scan into the next.
pub struct ResolutionEngine {
    pub(crate) managed_reader: SharedManagedReader,
    pub(crate) native_reader: SharedNativeReader,
    pub(crate) apiset: Arc<ApiSetMap>,
    pub(crate) settings: ScanSettings,
    pub(crate) system_dir: Option<PathBuf>,
    pub(crate) locator: FileLocator,
    pub(crate) graph: AssemblyGraph,
}

impl ResolutionEngine {
    pub fn new(scanner: &Scanner) -> Self {
        Self {
            managed_reader: scanner.managed_reader.clone(),
            native_reader: scanner.native_reader.clone(),
            apiset: scanner.apiset.clone(),
            settings: scanner.settings,
            system_dir: scanner.system_dir.clone(),
            locator: FileLocator::new(),
            graph: AssemblyGraph::new(),
        }
    }

    pub fn resolve(self, entry: &Path) -> Result<ScanResult, ScanError> {
        let base_dir = entry
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_owned();
        self.resolve_in(entry, &base_dir)
    }

    pub fn resolve_in(mut self, entry: &Path, base_dir: &Path) -> Result<ScanResult, ScanError> {
        info!("Scanning {}", entry.display());
        let root = match self.managed_reader.read_identity(entry) {
            Ok(identity) => {
                let extension = entry
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "dll".to_owned());
                self.resolve_managed(&identity, base_dir, &extension, Some(entry))
            }
            Err(e) if e.is_format_mismatch() => {
                debug!("{} is not managed, switching to the native pipeline", entry.display());
                let file_name = entry
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .ok_or_else(|| ScanError::bad_image(entry, "no file name"))?;
                let root = self.resolve_native(&file_name, base_dir, Some(entry));
                if !self.graph.node(root).is_resolved {
                    return Err(ScanError::bad_image(entry, "not a readable executable image"));
                }
                root
            }
            Err(e) => return Err(e),
        };
        info!(
            nodes = self.graph.node_count(),
            links = self.graph.link_count(),
            "Scan of {} finished",
            entry.display()
        );
        Ok(ScanResult {
            root,
            graph: self.graph,
        })
    }

    /// Fill in what the file system and the version resource tell about a local file
    pub(crate) fn enrich(&self, node: &mut AssemblyNode) {
        let Some(path) = node.file_path.as_deref() else {
            return;
        };
        if let Ok(metadata) = fs_err::metadata(path) {
            node.creation_date = metadata.created().or_else(|_| metadata.modified()).ok();
        }
        match self.native_reader.read_version_info(path) {
            Ok(Some(info)) => {
                node.creator = info.company_name;
                if node.loaded_version.is_none() {
                    node.loaded_version = info.product_version;
                }
                node.is_debug.get_or_insert(info.is_debug);
            }
            Ok(None) => {}
            Err(e) => debug!("No version information for {}: {}", path.display(), e),
        }
    }
}
