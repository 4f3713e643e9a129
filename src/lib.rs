extern crate thiserror;

mod managed;
mod native;
mod system;

pub mod apiset;
pub mod cli;
pub mod common;
pub mod graph;
pub mod locator;
pub mod models;
pub mod pe;
pub mod query;
pub mod scanner;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use common::ScanError;
pub use common::{decanonicalize, osstring_to_string, path_to_string, readable_canonical_path};
pub use graph::{AssemblyGraph, ScanResult};
pub use models::{AssemblyLink, AssemblyNode, AssemblyTreeView, LinkId, NodeId, TargetProcessor};
pub use query::ScanQuery;
pub use scanner::Scanner;
pub use settings::ScanSettings;
pub use system::WindowsSystem;

/// Resolve the dependency graph described by the query, with cycles removed
pub fn scan(query: &ScanQuery) -> Result<ScanResult, ScanError> {
    let mut result = Scanner::from_query(query).scan_in(&query.entry, &query.base_dir)?;
    result.normalize();
    Ok(result)
}
