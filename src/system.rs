#[cfg(windows)]
extern crate winapi;
use crate::apiset::ApiSetMap;
use crate::common::ScanError;
#[cfg(windows)]
use fs_err as fs;
#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// Description of a Windows installation
/// If running from within Windows we ask the Windows API where the system directories are.
/// If running in another OS we can only guess the directories of a mounted partition.
#[derive(Debug, Clone)]
pub struct WindowsSystem {
    pub apiset_map: Option<ApiSetMap>,
    pub win_dir: PathBuf,
    pub sys_dir: PathBuf,
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, ScanError> {
        let win_dir = get_windows_directory()?;
        let sys_dir = get_system_directory()?;
        Ok(Self {
            apiset_map: load_apiset(&sys_dir),
            win_dir,
            sys_dir,
        })
    }

    /// Collect information about the Windows installation the entry file belongs to
    ///
    /// On Windows this is the host system, elsewhere one mounted along the path to the file.
    pub fn from_entry_location<P: AsRef<Path>>(p: P) -> Result<Option<Self>, ScanError> {
        #[cfg(windows)]
        {
            let _ = p;
            Self::current().map(Some)
        }
        #[cfg(not(windows))]
        {
            Ok(Self::find_root(&p).and_then(Self::from_root))
        }
    }

    /// Try finding a Windows installation along the path to the entry file
    /// Rationale: the user may have mounted a Windows partition at an unknown depth in the filesystem
    pub fn find_root<P: AsRef<Path>>(p: P) -> Option<PathBuf> {
        p.as_ref()
            .parent()?
            .ancestors()
            .find(|a| a.join("Windows").join("System32").is_dir())
            .map(Path::to_owned)
    }

    /// Collect information about the Windows installation at the given path
    /// The path should point to the C:\ partition
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        let win_dir = root_path.as_ref().join("Windows");
        let sys_dir = win_dir.join("System32");
        if sys_dir.is_dir() {
            Some(Self {
                apiset_map: load_apiset(&sys_dir),
                win_dir,
                sys_dir,
            })
        } else {
            None
        }
    }

    /// Locations of the global assembly caches of this installation that actually exist
    pub fn global_assembly_dirs(&self) -> Vec<PathBuf> {
        [
            self.win_dir.join("Microsoft.NET").join("assembly"),
            self.win_dir.join("assembly"),
        ]
        .into_iter()
        .filter(|d| d.is_dir())
        .collect()
    }
}

impl PartialEq for WindowsSystem {
    fn eq(&self, other: &Self) -> bool {
        self.sys_dir == other.sys_dir && self.win_dir == other.win_dir
    }
}

fn load_apiset(sys_dir: &Path) -> Option<ApiSetMap> {
    let schema = sys_dir.join("apisetschema.dll");
    if !schema.is_file() {
        return None;
    }
    match ApiSetMap::from_schema_file(&schema) {
        Ok(map) => Some(map),
        Err(e) => {
            tracing::warn!("Could not read {}: {}", schema.display(), e);
            None
        }
    }
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::io::Error;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        let valid_bfr = &bfr[..ret as usize];
        fs::canonicalize(OsString::from_wide(valid_bfr))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}
