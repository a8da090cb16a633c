// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cache configuration kept as JSON files on disk.
//!
//! Each key maps to `<key>.json` in a single directory: the platform config
//! directory for refcache by default (`~/.config/refcache` on Linux), or any
//! directory handed to [`FsConfigStore::with_base`]. Saves go through a
//! sibling temp file and a rename, so readers never see a half-written file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use refcache_core::{ConfigError, ConfigStore};

/// [`ConfigStore`] over one directory of `<key>.json` files.
#[derive(Debug, Clone)]
pub struct FsConfigStore {
    dir: PathBuf,
}

impl FsConfigStore {
    /// Store in the user's refcache config directory, created on demand.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("dev", "flyingrobots", "refcache").ok_or_else(|| {
            ConfigError::Unavailable("no home directory to place refcache config in".into())
        })?;
        Self::with_base(dirs.config_dir())
    }

    /// Store in `dir`, created on demand.
    pub fn with_base(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the files.
    pub fn base(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`.
    pub fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        fs::read(self.file_for(key)).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ConfigError::Missing(key.to_owned()),
            _ => ConfigError::Io(err),
        })
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let target = self.file_for(key);
        let staging = target.with_extension("json.tmp");
        fs::write(&staging, data)?;
        fs::rename(&staging, &target)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use refcache_core::{BuildMode, CacheConfig, ConfigService, CONFIG_KEY};

    #[test]
    fn absent_file_reads_as_missing_and_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::with_base(dir.path()).unwrap();
        assert!(matches!(
            store.load_raw("absent"),
            Err(ConfigError::Missing(key)) if key == "absent"
        ));
        assert_eq!(ConfigService::new(store).load().unwrap(), CacheConfig::default());
    }

    #[test]
    fn saved_config_is_read_back_from_a_created_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let service = ConfigService::new(FsConfigStore::with_base(&nested).unwrap());
        service.save(&CacheConfig::production()).unwrap();
        assert!(nested.join(format!("{CONFIG_KEY}.json")).is_file());
        assert!(!nested.join(format!("{CONFIG_KEY}.json.tmp")).exists());
        assert_eq!(service.load().unwrap().mode, BuildMode::Production);
    }

    #[test]
    fn resave_replaces_the_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let service = ConfigService::new(FsConfigStore::with_base(dir.path()).unwrap());
        service.save(&CacheConfig::production()).unwrap();
        service.save(&CacheConfig::default()).unwrap();
        assert_eq!(service.load().unwrap(), CacheConfig::default());
    }

    #[test]
    fn unparseable_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::with_base(dir.path()).unwrap();
        fs::write(store.file_for(CONFIG_KEY), b"{ not json").unwrap();
        let service = ConfigService::new(store);
        assert!(matches!(service.load(), Err(ConfigError::Parse(_))));
    }
}
