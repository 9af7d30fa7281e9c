//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Storage engine configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Rollover threshold in bytes. The active datafile is sealed and a new
    /// one opened before the next write once its size reaches this. A
    /// threshold of 1 rolls over on every write.
    pub datafile_threshold: u64,
    /// Merge runs when the number of read-only datafiles strictly exceeds
    /// this.
    pub num_readonly_files: usize,
    /// Period of the merge-check tick, in milliseconds.
    pub merge_frequency: u64,
    /// Whether to spawn the background merge worker. Merge can still be
    /// invoked explicitly when disabled.
    pub enable_auto_merge: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datafile_threshold: 65535,
            num_readonly_files: 100,
            merge_frequency: 5000,
            enable_auto_merge: true,
        }
    }
}

impl Config {
    /// Loads the configuration from the given file, if it exists, with
    /// environment variables taking precedence (e.g. CASKDB_MERGE_FREQUENCY).
    pub fn load(file: &str) -> Result<Self> {
        let defaults = Self::default();
        Ok(config::Config::builder()
            .set_default("datafile_threshold", defaults.datafile_threshold)?
            .set_default("num_readonly_files", defaults.num_readonly_files as u64)?
            .set_default("merge_frequency", defaults.merge_frequency)?
            .set_default("enable_auto_merge", defaults.enable_auto_merge)?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("CASKDB").try_parsing(true))
            .build()?
            .try_deserialize()?)
    }

    /// The merge-check tick period as a duration.
    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.merge_frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.datafile_threshold, 65535);
        assert_eq!(config.num_readonly_files, 100);
        assert_eq!(config.merge_frequency, 5000);
        assert!(config.enable_auto_merge);
    }

    #[test]
    fn load_missing_file_uses_defaults() -> crate::error::Result<()> {
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let path = dir.path().join("nonexistent.toml");
        let config = Config::load(path.to_str().expect("invalid path"))?;
        assert_eq!(config, Config::default());
        Ok(())
    }

    #[test]
    fn load_file_overrides_defaults() -> crate::error::Result<()> {
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let path = dir.path().join("caskdb.toml");
        std::fs::write(&path, "datafile_threshold = 1\nenable_auto_merge = false\n")?;
        let config = Config::load(path.to_str().expect("invalid path"))?;
        assert_eq!(config.datafile_threshold, 1);
        assert!(!config.enable_auto_merge);
        assert_eq!(config.num_readonly_files, 100);
        Ok(())
    }
}
