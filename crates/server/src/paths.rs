//! Central path resolution for PocketPing data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `POCKETPING_DATA_DIR` env > `~/.pocketping`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => default_data_dir(),
    };

    let mut guard = DATA_DIR
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(dir.clone());
    dir
}

fn default_data_dir() -> PathBuf {
    if let Ok(env_val) = std::env::var("POCKETPING_DATA_DIR") {
        return PathBuf::from(env_val);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".pocketping")
}

/// Current data directory, or the default one if `init_data_dir` was never called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
        .unwrap_or_else(default_data_dir)
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Config file picked up when `--config` is not given.
pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn ensure_dirs() -> io::Result<()> {
    std::fs::create_dir_all(data_dir())?;
    std::fs::create_dir_all(log_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins_and_subdirs_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("pp");

        assert_eq!(init_data_dir(Some(&root)), root);
        assert_eq!(data_dir(), root);
        assert_eq!(default_config_path(), root.join("config.toml"));

        ensure_dirs().unwrap();
        assert!(log_dir().is_dir());
    }
}
