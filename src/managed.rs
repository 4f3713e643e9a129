//! Managed pipeline: assemblies and the references they declare

use crate::cli::{AssemblyIdentity, AssemblySource, ManagedAssembly};
use crate::graph::{LinkKey, NodeKey};
use crate::models::{AssemblyLink, AssemblyNode, LinkId, NodeId};
use crate::scanner::ResolutionEngine;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

impl ResolutionEngine {
    /// Node for the assembly with the given identity, created on first request
    ///
    /// `{name}.{extension}` is searched below base_dir unless the file is already known.
    /// Assemblies not found there are resolved by identity through the reader.
    pub(crate) fn resolve_managed(
        &mut self,
        identity: &AssemblyIdentity,
        base_dir: &Path,
        extension: &str,
        known_path: Option<&Path>,
    ) -> NodeId {
        let key = NodeKey::managed(&identity.name);
        if let Some(id) = self.graph.find_node(&key) {
            debug!("{} already known", identity.name);
            return id;
        }

        let path: Option<PathBuf> = match known_path {
            Some(p) => Some(p.to_owned()),
            None => self
                .locator
                .find(&format!("{}.{}", identity.name, extension), Some(base_dir)),
        };
        let source = match &path {
            Some(p) => AssemblySource::File(p.as_path()),
            None => AssemblySource::Identity(identity),
        };
        let assembly = match self.managed_reader.read_assembly(source) {
            Ok(assembly) => Some(assembly),
            Err(e) => {
                warn!("Could not load {}: {}", identity, e);
                None
            }
        };

        let mut node = managed_node(identity, path.clone(), assembly.as_ref());
        if node.is_resolved && node.is_local {
            self.enrich(&mut node);
        }
        // inserted before recursing, so references back to this assembly find it
        let id = self.graph.insert_node(key, node);

        let Some(assembly) = assembly else {
            return id;
        };
        if !(path.is_some() || self.settings.scan_global_managed) {
            return id;
        }

        for reference in &assembly.references {
            let link = self.managed_link(id, reference, base_dir);
            self.graph.attach(id, link);
        }

        if !assembly.is_il_only && self.settings.scan_cli_references {
            if let Some(file_path) = &assembly.file_path {
                match self.native_reader.read_image(file_path) {
                    Ok(image) => {
                        for import in &image.imports {
                            let link = self.native_link(id, import, base_dir);
                            self.graph.attach(id, link);
                        }
                    }
                    Err(e) => warn!("Could not read the native imports of {}: {}", file_path.display(), e),
                }
            }
        }

        if self.settings.scan_dll_import {
            for module in &assembly.dll_imports {
                let link = self.native_link(id, module, base_dir);
                if !self.graph.attach(id, link) {
                    debug!("{} already linked from {}", module, identity.name);
                }
            }
        }

        id
    }

    /// Edge from parent to a referenced assembly, shared by every parent requesting the same identity
    pub(crate) fn managed_link(
        &mut self,
        parent: NodeId,
        reference: &AssemblyIdentity,
        base_dir: &Path,
    ) -> LinkId {
        let requested_identity = reference.full_name();
        let parent_identity = self.graph.node(parent).full_identity.clone();
        let key = LinkKey::managed(&requested_identity);
        if let Some(id) = self.graph.find_link(&key) {
            let target = self.graph.link(id).target;
            self.graph.node_mut(target).referenced_by.insert(parent_identity);
            return id;
        }

        let target = self.resolve_managed(reference, base_dir, "dll", None);
        self.graph.node_mut(target).referenced_by.insert(parent_identity);
        self.graph.insert_link(
            key,
            AssemblyLink {
                target,
                requested_version: reference.version.clone(),
                requested_identity,
            },
        )
    }
}

fn managed_node(
    requested: &AssemblyIdentity,
    located: Option<PathBuf>,
    assembly: Option<&ManagedAssembly>,
) -> AssemblyNode {
    let mut node = AssemblyNode::new(&requested.name);
    node.is_local = located.is_some();
    node.file_path = located;
    node.full_identity = requested.full_name();
    if let Some(assembly) = assembly {
        node.full_identity = assembly.identity.full_name();
        node.loaded_version = assembly.identity.version.clone();
        if assembly.file_path.is_some() {
            node.file_path = assembly.file_path.clone();
        }
        node.is_resolved = true;
        node.is_il_only = assembly.is_il_only;
        node.is_debug = assembly.is_debug;
        node.target_framework = assembly.target_framework.clone();
        node.has_entry_point = assembly.has_entry_point;
        node.target_processor = assembly.target_processor;
    }
    node
}
