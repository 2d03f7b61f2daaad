use std::path::{Path, PathBuf};

const DEFAULT_DATA_DIR: &str = "/tmp/fleet";

/// Root directory for everything the harness writes to disk.
///
/// Default: `/tmp/fleet`. Layout:
/// - `<set>-<id>/` data directory of one replica set member
/// - `<name>/` data directory of any other named process
/// - `logs/<name>.log` captured stdout and stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { root: path.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_dir(&self, set: &str, member_id: u32) -> PathBuf {
        self.root.join(node_name(set, member_id))
    }

    pub fn process_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}.log"))
    }
}

/// Process name of a replica set member, also its data directory name.
pub fn node_name(set: &str, member_id: u32) -> String {
    format!("{set}-{member_id}")
}

impl Default for DataDir {
    fn default() -> Self {
        Self { root: PathBuf::from(DEFAULT_DATA_DIR) }
    }
}

impl From<PathBuf> for DataDir {
    fn from(path: PathBuf) -> Self {
        Self { root: path }
    }
}

impl From<&Path> for DataDir {
    fn from(path: &Path) -> Self {
        Self { root: path.to_owned() }
    }
}

impl AsRef<Path> for DataDir {
    fn as_ref(&self) -> &Path {
        &self.root
    }
}
