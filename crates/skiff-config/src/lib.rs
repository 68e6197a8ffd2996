//! # skiff-config
//!
//! Settings for the sharing core.
//!
//! Loads from a TOML file with environment-variable overrides; every
//! field has a default so a missing or partial file still yields a
//! working configuration. The core takes `Settings` by value; there
//! is no global instance.

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Share-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory for generated file lists and the share cache.
    pub config_dir: PathBuf,
    /// Share entries with the hidden flag set.
    pub share_hidden: bool,
    /// Reject the extended forbidden-extension set.
    pub remove_forbidden: bool,
    /// Skip zero-byte files.
    pub no_zero_byte: bool,
    /// Largest shareable file in MiB; 0 means unlimited.
    pub max_file_size_mb: i64,
    /// Share skip-list pattern; `;`-separated wildcards, or a regex
    /// when `skiplist_regex` is set.
    pub skiplist: String,
    pub skiplist_regex: bool,
    /// Log entries rejected by the skip-list.
    pub report_skiplist: bool,
    /// The unfinished-downloads directory; never shareable.
    pub temp_download_dir: PathBuf,
    /// Private key file; never shareable.
    pub private_key_file: Option<PathBuf>,
    /// Application name + version stamped into generated catalogs.
    pub generator: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("."),
            share_hidden: false,
            remove_forbidden: true,
            no_zero_byte: false,
            max_file_size_mb: 0,
            skiplist: String::new(),
            skiplist_regex: false,
            report_skiplist: true,
            temp_download_dir: PathBuf::new(),
            private_key_file: None,
            generator: concat!("skiff ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Listing-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSettings {
    /// Annotate browsed lists with share/queue duplicates.
    pub dupes_in_filelist: bool,
    /// Run auto-download rules after loading a full list.
    pub use_adls: bool,
    /// During list subtraction, directories left with fewer than two
    /// files also drop files smaller than this many KiB. 0 disables.
    pub skip_subtract_kb: i64,
    /// Substitute the remote directory date into download target
    /// templates instead of the local clock.
    pub format_dir_remote_time: bool,
}

impl Default for ListingSettings {
    fn default() -> Self {
        Self {
            dupes_in_filelist: true,
            use_adls: true,
            skip_subtract_kb: 0,
            format_dir_remote_time: false,
        }
    }
}

/// Combined on-disk configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub share: Settings,
    pub listing: ListingSettings,
}

impl Config {
    /// Load from `path`, then apply environment overrides. A missing
    /// file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SKIFF_CONFIG_DIR") {
            self.share.config_dir = PathBuf::from(dir);
        }
        if std::env::var("SKIFF_SHARE_HIDDEN").is_ok() {
            self.share.share_hidden = true;
        }
        if let Ok(list) = std::env::var("SKIFF_SKIPLIST") {
            self.share.skiplist = list;
        }
        if let Ok(kb) = std::env::var("SKIFF_SKIP_SUBTRACT_KB") {
            if let Ok(n) = kb.parse() {
                self.listing.skip_subtract_kb = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert!(!s.share_hidden);
        assert!(s.remove_forbidden);
        assert_eq!(s.max_file_size_mb, 0);
        assert!(s.generator.starts_with("skiff "));
    }

    #[test]
    fn test_load_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.listing.skip_subtract_kb, 0);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skiff.toml");
        std::fs::write(
            &path,
            "[share]\nno_zero_byte = true\n\n[listing]\nskip_subtract_kb = 16\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.share.no_zero_byte);
        assert_eq!(config.listing.skip_subtract_kb, 16);
        // Untouched fields keep their defaults.
        assert!(config.share.remove_forbidden);
        assert!(config.listing.use_adls);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skiff.toml");
        std::fs::write(&path, "share = not valid").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Toml(_))));
    }
}
