//! Global configuration loading.
//!
//! solbuild merges every `*.conf` file found in the vendor directory and then
//! the system directory, so `/etc/solbuild` always wins over
//! `/usr/share/solbuild` for stateless systems.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Locations searched for solbuild configuration and profile files.
/// Ordered by precedence: earlier entries override later ones.
pub const CONFIG_PATHS: &[&str] = &["/etc/solbuild", "/usr/share/solbuild"];

/// Suffix a file must have to be glob-loaded as configuration.
pub const CONFIG_SUFFIX: &str = ".conf";

/// Global defaults for solbuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the default profile to use.
    pub default_profile: String,

    /// Whether to generate a changelog from the recipe's git history.
    pub enable_history: bool,

    /// Whether to back the overlay with a tmpfs.
    pub enable_tmpfs: bool,

    /// Bounding size for the tmpfs, mount-style (e.g. `8G`).
    pub tmpfs_size: String,

    /// Root directory for per-recipe overlays.
    pub overlay_root_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_profile: "main-x86_64".to_string(),
            enable_history: false,
            enable_tmpfs: false,
            tmpfs_size: String::new(),
            overlay_root_dir: "/var/cache/solbuild".to_string(),
        }
    }
}

impl Config {
    /// Load configuration by merging all config files from the system paths.
    pub fn load() -> Result<Config> {
        Self::load_from(CONFIG_PATHS)
    }

    /// Load configuration from an explicit list of directories. Later
    /// directories are read first so that earlier ones take precedence.
    pub fn load_from<P: AsRef<Path>>(dirs: &[P]) -> Result<Config> {
        let mut config = Config::default();

        for dir in dirs.iter().rev() {
            let mut fragments = conf_fragments(dir.as_ref())?;
            fragments.sort();

            for path in fragments {
                debug!(path = %path.display(), "merging configuration fragment");

                let text = fs::read_to_string(&path)?;
                let overlay: ConfigOverlay = toml::from_str(&text).map_err(|e| {
                    Error::Config(format!("failed to parse {}: {e}", path.display()))
                })?;
                overlay.apply(&mut config);
            }
        }

        Ok(config)
    }
}

/// A partial configuration file. Every field is optional so fragments can
/// override a single key without restating the rest.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    default_profile: Option<String>,
    enable_history: Option<bool>,
    enable_tmpfs: Option<bool>,
    tmpfs_size: Option<String>,
    overlay_root_dir: Option<String>,
}

impl ConfigOverlay {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.default_profile {
            config.default_profile = v;
        }
        if let Some(v) = self.enable_history {
            config.enable_history = v;
        }
        if let Some(v) = self.enable_tmpfs {
            config.enable_tmpfs = v;
        }
        if let Some(v) = self.tmpfs_size {
            config.tmpfs_size = v;
        }
        if let Some(v) = self.overlay_root_dir {
            config.overlay_root_dir = v;
        }
    }
}

fn conf_fragments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();

    if !dir.is_dir() {
        return Ok(out);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(CONFIG_SUFFIX))
            && path.is_file()
        {
            out.push(path);
        }
    }

    Ok(out)
}

/// Determine if a string is a valid mount-style memory size: a numeric
/// prefix followed by one of the units G, T, P or E.
pub fn valid_mem_size(s: &str) -> bool {
    if s.is_empty() || !s.is_ascii() {
        return false;
    }

    let (prefix, unit) = s.split_at(s.len() - 1);
    if prefix.parse::<f64>().is_err() {
        return false;
    }

    matches!(unit, "G" | "T" | "P" | "E")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_without_files() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_from(&[tmp.path()]).unwrap();

        assert_eq!(config.default_profile, "main-x86_64");
        assert_eq!(config.overlay_root_dir, "/var/cache/solbuild");
        assert!(!config.enable_tmpfs);
    }

    #[test]
    fn etc_overrides_vendor() {
        let tmp = TempDir::new().unwrap();
        let etc = tmp.path().join("etc");
        let vendor = tmp.path().join("vendor");
        fs::create_dir_all(&etc).unwrap();
        fs::create_dir_all(&vendor).unwrap();

        fs::write(
            vendor.join("00-vendor.conf"),
            "default_profile = \"unstable-x86_64\"\nenable_tmpfs = true\n",
        )
        .unwrap();
        fs::write(etc.join("10-local.conf"), "default_profile = \"main-x86_64\"\n").unwrap();

        let config = Config::load_from(&[etc, vendor]).unwrap();
        assert_eq!(config.default_profile, "main-x86_64");
        // The vendor key without an /etc override still lands.
        assert!(config.enable_tmpfs);
    }

    #[test]
    fn fragments_merge_partially() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("tmpfs.conf"),
            "enable_tmpfs = true\ntmpfs_size = \"8G\"\n",
        )
        .unwrap();

        let config = Config::load_from(&[tmp.path()]).unwrap();
        assert!(config.enable_tmpfs);
        assert_eq!(config.tmpfs_size, "8G");
        assert_eq!(config.default_profile, "main-x86_64");
    }

    #[test]
    fn malformed_fragment_is_an_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("bad.conf"), "default_profile = [").unwrap();

        assert!(Config::load_from(&[tmp.path()]).is_err());
    }

    #[test]
    fn mem_size_validation() {
        assert!(valid_mem_size("8G"));
        assert!(valid_mem_size("1.5T"));
        assert!(valid_mem_size("16P"));
        assert!(valid_mem_size("2E"));

        assert!(!valid_mem_size(""));
        assert!(!valid_mem_size("8"));
        assert!(!valid_mem_size("8M"));
        assert!(!valid_mem_size("8XYZ"));
        assert!(!valid_mem_size("G"));
        assert!(!valid_mem_size("abcG"));
    }
}
