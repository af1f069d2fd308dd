//! Build profiles.
//!
//! A profile names a backing image and a repository policy: which repos to
//! remove from the image, which to add, and the definitions of any custom
//! repositories. The wildcard `"*"` means "all currently installed" for
//! removals and "all declared in the profile" for additions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::CONFIG_PATHS;
use crate::{path_exists, Error, Result};

/// Fixed extension for solbuild profile files.
pub const PROFILE_SUFFIX: &str = ".profile";

/// A repository to add to the build root during the build process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repo {
    /// Name of the repo, set from the table key, not TOML.
    #[serde(skip)]
    pub name: String,

    /// URI of the repository.
    pub uri: String,

    /// Local repository for bind mounting.
    #[serde(default)]
    pub local: bool,

    /// Enable automatic indexing of the repo.
    #[serde(default)]
    pub autoindex: bool,
}

/// A configuration defining what backing image to use and what repos to
/// add or remove.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Name of this profile, set by file name, not TOML.
    #[serde(skip)]
    pub name: String,

    /// The backing image for this profile.
    pub image: String,

    /// Repositories to enable, in priority order. `["*"]` enables all
    /// declared repositories.
    #[serde(default)]
    pub add_repos: Vec<String>,

    /// Repositories to remove first. `["*"]` removes everything currently
    /// installed in the image.
    #[serde(default)]
    pub remove_repos: Vec<String>,

    /// Custom repository definitions. A BTreeMap keeps encoding stable.
    #[serde(default, rename = "repo")]
    pub repos: BTreeMap<String, Repo>,
}

impl Profile {
    /// Attempt to load the named profile from the system paths.
    pub fn new(name: &str) -> Result<Profile> {
        Self::new_from_dirs(name, CONFIG_PATHS)
    }

    /// Attempt to load the named profile from an explicit list of
    /// directories, first hit wins.
    pub fn new_from_dirs<P: AsRef<Path>>(name: &str, dirs: &[P]) -> Result<Profile> {
        for dir in dirs {
            let path = dir.as_ref().join(format!("{name}{PROFILE_SUFFIX}"));
            if !path_exists(&path) {
                continue;
            }

            return Self::from_path(&path);
        }

        Err(Error::InvalidProfile(name.to_string()))
    }

    /// Attempt to load a profile from the given file name.
    pub fn from_path(path: &Path) -> Result<Profile> {
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidProfile(path.display().to_string()))?;

        let name = basename
            .strip_suffix(PROFILE_SUFFIX)
            .ok_or_else(|| Error::Config(format!("not a .profile file: {}", path.display())))?;

        let text = fs::read_to_string(path)?;
        let mut profile: Profile = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;

        profile.name = name.to_string();

        // Ensure all repos carry their table key as their name.
        for (key, repo) in profile.repos.iter_mut() {
            repo.name = key.clone();
        }

        // A wildcard add is always valid; otherwise every named repo must
        // have a definition.
        if !(profile.add_repos.len() == 1 && profile.add_repos[0] == "*") {
            for r in &profile.add_repos {
                if !profile.repos.contains_key(r) {
                    return Err(Error::UnknownRepo(r.clone()));
                }
            }
        }

        Ok(profile)
    }

    /// Serialize this profile back to TOML. The result round-trips the repo
    /// tables, attributes and both repo lists, including `"*"` sentinels.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(format!("profile encoding failed: {e}")))
    }

    /// The ordered set of repositories this profile enables. A wildcard (or
    /// an empty list) enables every declared repo.
    pub fn enabled_repos(&self) -> Vec<&Repo> {
        if (self.add_repos.len() == 1 && self.add_repos[0] == "*") || self.add_repos.is_empty() {
            self.repos.values().collect()
        } else {
            self.add_repos
                .iter()
                .filter_map(|name| self.repos.get(name))
                .collect()
        }
    }

    /// Whether this profile removes every repository installed in the image.
    pub fn removes_all_repos(&self) -> bool {
        self.remove_repos.len() == 1 && self.remove_repos[0] == "*"
    }
}

/// Locate all available profiles across the system paths.
pub fn all_profiles() -> Result<BTreeMap<String, Profile>> {
    all_profiles_from(CONFIG_PATHS)
}

/// Locate all available profiles in the given directories.
pub fn all_profiles_from<P: AsRef<Path>>(dirs: &[P]) -> Result<BTreeMap<String, Profile>> {
    let mut out = BTreeMap::new();

    for dir in dirs {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            continue;
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(PROFILE_SUFFIX))
            })
            .collect();
        paths.sort();

        for path in paths {
            let profile = Profile::from_path(&path)?;
            // First hit wins: /etc shadows the vendor directory.
            out.entry(profile.name.clone()).or_insert(profile);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const UNSTABLE: &str = r#"
image = "unstable-x86_64"
remove_repos = ["*"]
add_repos = ["Local", "Solus"]

[repo.Solus]
uri = "https://cdn.getsol.us/repo/unstable/eopkg-index.xml.xz"

[repo.Local]
uri = "/var/lib/solbuild/local"
local = true
autoindex = true
"#;

    fn write_profile(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(format!("{name}.profile"));
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn parse_full_profile() {
        let tmp = TempDir::new().unwrap();
        let path = write_profile(tmp.path(), "unstable-x86_64", UNSTABLE);

        let profile = Profile::from_path(&path).unwrap();
        assert_eq!(profile.name, "unstable-x86_64");
        assert_eq!(profile.image, "unstable-x86_64");
        assert!(profile.removes_all_repos());
        assert_eq!(profile.add_repos, vec!["Local", "Solus"]);

        let local = &profile.repos["Local"];
        assert_eq!(local.name, "Local");
        assert!(local.local);
        assert!(local.autoindex);
        assert!(!profile.repos["Solus"].local);
    }

    #[test]
    fn add_repos_order_is_priority_order() {
        let tmp = TempDir::new().unwrap();
        let path = write_profile(tmp.path(), "ordered", UNSTABLE);

        let profile = Profile::from_path(&path).unwrap();
        let enabled: Vec<&str> = profile.enabled_repos().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(enabled, vec!["Local", "Solus"]);
    }

    #[test]
    fn unknown_add_repo_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_profile(
            tmp.path(),
            "broken",
            "image = \"main-x86_64\"\nadd_repos = [\"nope\"]\n",
        );

        match Profile::from_path(&path) {
            Err(Error::UnknownRepo(name)) => assert_eq!(name, "nope"),
            other => panic!("expected UnknownRepo, got {other:?}"),
        }
    }

    #[test]
    fn wildcard_add_is_accepted_without_definitions() {
        let tmp = TempDir::new().unwrap();
        let path = write_profile(
            tmp.path(),
            "wild",
            "image = \"main-x86_64\"\nadd_repos = [\"*\"]\n",
        );

        let profile = Profile::from_path(&path).unwrap();
        assert_eq!(profile.add_repos, vec!["*"]);
    }

    #[test]
    fn toml_roundtrip_preserves_policy() {
        let tmp = TempDir::new().unwrap();
        let path = write_profile(tmp.path(), "rt", UNSTABLE);
        let profile = Profile::from_path(&path).unwrap();

        let encoded = profile.to_toml().unwrap();
        let reparsed_path = write_profile(tmp.path(), "rt2", &encoded);
        let mut reparsed = Profile::from_path(&reparsed_path).unwrap();
        reparsed.name = profile.name.clone();

        assert_eq!(reparsed.image, profile.image);
        assert_eq!(reparsed.add_repos, profile.add_repos);
        assert_eq!(reparsed.remove_repos, profile.remove_repos);
        assert_eq!(reparsed.repos, profile.repos);
    }

    #[test]
    fn discovery_prefers_earlier_directories() {
        let tmp = TempDir::new().unwrap();
        let etc = tmp.path().join("etc");
        let vendor = tmp.path().join("vendor");
        fs::create_dir_all(&etc).unwrap();
        fs::create_dir_all(&vendor).unwrap();

        write_profile(&vendor, "main-x86_64", "image = \"main-x86_64\"\n");
        write_profile(&etc, "main-x86_64", "image = \"unstable-x86_64\"\n");

        let profiles = all_profiles_from(&[etc, vendor]).unwrap();
        assert_eq!(profiles["main-x86_64"].image, "unstable-x86_64");
    }
}
