//! Case-insensitive lookup of files by name below a base directory

use crate::common::{file_name_lowercase, ScanError};
use fs_err as fs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Finds files by name, remembering every directory tree it has already walked
///
/// Lives as long as one scan, so files added to the disk mid-scan may go unnoticed.
#[derive(Debug, Default)]
pub struct FileLocator {
    /// lowercase file name -> shallowest match, per base directory
    trees: HashMap<PathBuf, HashMap<String, PathBuf>>,
    /// lowercase file name -> actual file name, per folder
    folders: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl FileLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for a file anywhere below base_dir, ignoring case
    ///
    /// When several files match, the one closest to base_dir wins.
    pub fn find(&mut self, file_name: &str, base_dir: Option<&Path>) -> Option<PathBuf> {
        let base_dir = base_dir?;
        if !self.trees.contains_key(base_dir) {
            let index = match index_tree(base_dir) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!("Could not index {}: {}", base_dir.display(), e);
                    HashMap::new()
                }
            };
            self.trees.insert(base_dir.to_owned(), index);
        }
        self.trees
            .get(base_dir)
            .and_then(|index| index.get(&file_name.to_lowercase()))
            .cloned()
    }

    /// Look for a file directly inside folder, ignoring case
    pub fn find_in_folder<P: AsRef<Path>>(
        &mut self,
        file_name: &str,
        folder: P,
    ) -> Result<Option<PathBuf>, ScanError> {
        let folder = folder.as_ref();
        self.scan_folder(folder)?;
        Ok(self
            .folders
            .get(folder)
            .and_then(|dir| dir.get(&file_name.to_lowercase()))
            .map(|p| folder.join(p)))
    }

    fn scan_folder(&mut self, folder: &Path) -> Result<(), ScanError> {
        if let std::collections::hash_map::Entry::Vacant(e) =
            self.folders.entry(folder.to_owned())
        {
            let matching_entries: HashMap<String, PathBuf> = fs::read_dir(folder)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.metadata().map_or_else(|_| false, |m| m.is_file()))
                .filter_map(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .map(|s| (s.to_lowercase(), entry.file_name().into()))
                })
                .collect();
            e.insert(matching_entries);
        }
        Ok(())
    }
}

fn tree_pattern(base_dir: &Path, file_pattern: &str) -> String {
    let base = glob::Pattern::escape(&base_dir.to_string_lossy());
    format!("{}/**/{}", base.trim_end_matches(['/', '\\']), file_pattern)
}

fn index_tree(base_dir: &Path) -> Result<HashMap<String, PathBuf>, ScanError> {
    let mut index: HashMap<String, PathBuf> = HashMap::new();
    for entry in glob::glob(&tree_pattern(base_dir, "*"))? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let Some(name) = file_name_lowercase(&path) else {
            continue;
        };
        let depth = path.components().count();
        match index.get(&name) {
            Some(known) if known.components().count() <= depth => {}
            _ => {
                index.insert(name, path);
            }
        }
    }
    Ok(index)
}

/// Uncached recursive case-insensitive search; returns the shallowest match
pub fn find_file<P: AsRef<Path>>(file_name: &str, base_dir: P) -> Result<Option<PathBuf>, ScanError> {
    Ok(find_files(file_name, base_dir)?.into_iter().next())
}

/// Every file below base_dir with the given name, ignoring case, shallowest first
pub fn find_files<P: AsRef<Path>>(file_name: &str, base_dir: P) -> Result<Vec<PathBuf>, ScanError> {
    let options = glob::MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    let pattern = tree_pattern(base_dir.as_ref(), &glob::Pattern::escape(file_name));
    let mut found: Vec<PathBuf> = glob::glob_with(&pattern, options)?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    // stable, so equally deep matches keep the order glob reports them in
    found.sort_by_key(|p| p.components().count());
    Ok(found)
}
