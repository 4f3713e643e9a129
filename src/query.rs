//! Data structures that must be filled with the input and the parameters for the scan

use crate::common::ScanError;
use crate::settings::ScanSettings;
use crate::system::WindowsSystem;
use std::path::{Path, PathBuf};

/// Complete specification of a scan task
#[derive(Clone, Debug)]
pub struct ScanQuery {
    /// Path to the entry file
    pub entry: PathBuf,
    /// Root of the local search; the directory of the entry unless overridden
    pub base_dir: PathBuf,
    /// Windows installation providing the system directory and the API set map
    pub system: Option<WindowsSystem>,
    /// Global assembly cache locations searched for managed references
    pub global_assembly_dirs: Vec<PathBuf>,
    pub settings: ScanSettings,
}

impl ScanQuery {
    /// autodetects the parameters with sensible defaults
    ///
    /// The base directory will be set to the one containing the entry file.
    /// On Windows the host installation is used, elsewhere one mounted along the path to the entry.
    pub fn deduce_from_entry_location<P: AsRef<Path>>(entry: P) -> Result<Self, ScanError> {
        let entry = entry.as_ref();
        let base_dir = entry
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !entry.is_file() {
            return Err(ScanError::ContextDeductionError(format!(
                "Could not find the entry file {}",
                entry.display()
            )));
        }
        let system = WindowsSystem::from_entry_location(entry)?;
        let global_assembly_dirs = system
            .as_ref()
            .map(WindowsSystem::global_assembly_dirs)
            .unwrap_or_default();
        Ok(Self {
            entry: entry.to_owned(),
            base_dir: base_dir.to_owned(),
            system,
            global_assembly_dirs,
            settings: ScanSettings::default(),
        })
    }

    /// System directory of the Windows installation, if one is known
    pub fn system_dir(&self) -> Option<&Path> {
        self.system.as_ref().map(|s| s.sys_dir.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::touch_all;
    use pretty_assertions::assert_eq;

    #[test]
    fn deduce_from_mounted_installation() -> Result<(), ScanError> {
        let mount = tempfile::tempdir()?;
        let paths = touch_all(
            mount.path(),
            &[
                "Windows/System32/kernel32.dll",
                "Windows/assembly/GAC_MSIL/Lib/Lib.dll",
                "Program Files/App/App.exe",
            ],
        )?;

        let query = ScanQuery::deduce_from_entry_location(&paths[2])?;
        assert_eq!(query.entry, paths[2]);
        assert_eq!(query.base_dir, mount.path().join("Program Files").join("App"));
        assert_eq!(query.settings, ScanSettings::default());

        #[cfg(not(windows))]
        {
            let system_dir = mount.path().join("Windows").join("System32");
            assert_eq!(query.system_dir(), Some(system_dir.as_path()));
            assert_eq!(
                query.global_assembly_dirs,
                vec![mount.path().join("Windows").join("assembly")]
            );
        }
        Ok(())
    }

    #[test]
    fn missing_entry_is_a_context_error() -> Result<(), ScanError> {
        let dir = tempfile::tempdir()?;
        let res = ScanQuery::deduce_from_entry_location(dir.path().join("nothing.exe"));
        assert!(matches!(res, Err(ScanError::ContextDeductionError(_))));
        Ok(())
    }
}
