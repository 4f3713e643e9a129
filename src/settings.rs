//! Switches controlling how far a scan follows references

use crate::common::ScanError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Follow the references of managed assemblies found outside the scanned tree
    pub scan_global_managed: bool,
    /// Follow the imports of native libraries found outside the scanned tree
    pub scan_global_native: bool,
    /// Follow the native imports of mixed-mode assemblies
    pub scan_cli_references: bool,
    /// Follow the modules named by DllImport declarations
    pub scan_dll_import: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            scan_global_managed: false,
            scan_global_native: false,
            scan_cli_references: true,
            scan_dll_import: true,
        }
    }
}

impl ScanSettings {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ScanError> {
        let content = fs_err::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }
}
