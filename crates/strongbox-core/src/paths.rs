use directories::{BaseDirs, ProjectDirs};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "strongbox";

pub const PQ_KEYPAIR_FILE: &str = "pq-keypair";

pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).map(|dirs| dirs.data_dir().to_path_buf())
}

pub fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

/// `state` + `.enc` -> `state.enc`. Appends to the file name rather than
/// replacing an existing extension.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

pub fn lock_path(resource: &Path) -> PathBuf {
    with_suffix(resource, ".lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_is_appended_not_replaced() {
        let p = Path::new("/tmp/session.json");
        assert_eq!(with_suffix(p, ".enc"), PathBuf::from("/tmp/session.json.enc"));
        assert_eq!(lock_path(p), PathBuf::from("/tmp/session.json.lock"));
    }
}
