//! Native pipeline: DLLs and their import tables

use crate::graph::{LinkKey, NodeKey};
use crate::models::{AssemblyLink, AssemblyNode, LinkId, NodeId};
use crate::scanner::ResolutionEngine;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Append .dll to names carrying neither .dll nor .exe
fn qualify(file_name: &str) -> String {
    let lowercase = file_name.to_lowercase();
    if lowercase.ends_with(".dll") || lowercase.ends_with(".exe") {
        file_name.to_owned()
    } else {
        format!("{file_name}.dll")
    }
}

impl ResolutionEngine {
    /// Node for a native library, created on first request
    ///
    /// Looked up below base_dir first, then in the system directory under its API set host name.
    /// A known path (the scan entry) is taken as is, under its own file name.
    pub(crate) fn resolve_native(&mut self, file_name: &str, base_dir: &Path, known_path: Option<&Path>) -> NodeId {
        let (name, path, is_local) = match known_path {
            Some(p) => (file_name.to_owned(), Some(p.to_owned()), true),
            None => self.locate_native(&qualify(file_name), base_dir),
        };
        let key = NodeKey::native(&name);
        if let Some(id) = self.graph.find_node(&key) {
            debug!("{} already known", name);
            return id;
        }

        let mut node = AssemblyNode::native(&name, path, is_local);
        let mut imports = Vec::new();
        if let Some(p) = node.file_path.as_deref() {
            match self.native_reader.read_image(p) {
                Ok(image) => {
                    node.is_resolved = true;
                    node.target_processor = Some(image.target_processor());
                    imports = image.imports;
                }
                Err(e) => warn!("Could not read {}: {}", p.display(), e),
            }
        }
        if node.is_resolved && node.is_local {
            self.enrich(&mut node);
        }
        let follow = node.is_resolved && (node.is_local || self.settings.scan_global_native);
        let id = self.graph.insert_node(key, node);

        if follow {
            for import in &imports {
                let link = self.native_link(id, import, base_dir);
                self.graph.attach(id, link);
            }
        }
        id
    }

    /// Edge from parent to a native library, shared by every parent importing it
    pub(crate) fn native_link(&mut self, parent: NodeId, file_name: &str, base_dir: &Path) -> LinkId {
        let target = self.resolve_native(file_name, base_dir, None);
        let parent_identity = self.graph.node(parent).full_identity.clone();
        let target_node = self.graph.node_mut(target);
        target_node.referenced_by.insert(parent_identity);
        // keyed by what was found, labelled with what was asked for
        let key = LinkKey::native(&target_node.full_identity);
        let link = AssemblyLink {
            target,
            requested_version: target_node.loaded_version.clone(),
            requested_identity: qualify(file_name),
        };
        self.graph.insert_link(key, link)
    }

    /// Real file name, location and locality of a library
    fn locate_native(&mut self, file_name: &str, base_dir: &Path) -> (String, Option<PathBuf>, bool) {
        if let Some(path) = self.locator.find(file_name, Some(base_dir)) {
            return (file_name.to_owned(), Some(path), true);
        }
        let real_name = self.apiset.resolve(file_name).to_owned();
        if real_name != file_name {
            debug!("{} redirected to {}", file_name, real_name);
        }
        let path = match &self.system_dir {
            Some(dir) => match self.locator.find_in_folder(&real_name, dir) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Could not list {}: {}", dir.display(), e);
                    None
                }
            },
            None => None,
        };
        (real_name, path, false)
    }
}
