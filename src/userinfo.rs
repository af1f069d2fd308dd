//! Packager identity discovery.
//!
//! Builds stamp the packager's name and email into the produced packages.
//! The lookup order is: sudo-invoking user, then the Solus packager file,
//! then git configuration, then fixed fallbacks. Discovery always succeeds.

use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid, User};
use tracing::{debug, warn};

use crate::Result;

/// Name used when no packager details can be discovered.
pub const FALLBACK_USER_NAME: &str = "Automated Package Build";

/// Email used when no packager details can be discovered.
pub const FALLBACK_USER_EMAIL: &str = "no.email.set.in.config";

/// The identity a build runs on behalf of.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    /// Actual name.
    pub name: String,

    /// Actual email.
    pub email: String,

    /// Unix user ID, used to chown collected artifacts.
    pub uid: u32,

    /// Unix group ID.
    pub gid: u32,

    /// Home directory of the user.
    pub home_dir: PathBuf,

    /// Textual username.
    pub username: String,
}

impl UserInfo {
    /// Discover the packager identity, falling back until a valid
    /// combination of name and email exists.
    pub fn discover() -> UserInfo {
        let mut info = UserInfo::default();

        if !info.set_from_sudo() {
            info.set_from_current();
        }

        if info.set_from_packager() || info.set_from_git() {
            return info;
        }

        if info.name.is_empty() {
            info.name = FALLBACK_USER_NAME.to_string();
        }
        if info.email.is_empty() {
            info.email = match nix::unistd::gethostname() {
                Ok(host) => format!("{}@{}", info.username, host.to_string_lossy()),
                Err(_) => FALLBACK_USER_EMAIL.to_string(),
            };
        }

        info
    }

    /// Use the sudo-invoking user's identity when built via sudo, so
    /// artifacts land owned by the real user rather than root.
    fn set_from_sudo(&mut self) -> bool {
        let Ok(sudo_uid) = std::env::var("SUDO_UID") else {
            return false;
        };
        let sudo_gid = std::env::var("SUDO_GID").unwrap_or_else(|_| sudo_uid.clone());

        let Ok(uid) = sudo_uid.parse::<u32>() else {
            warn!(sudo_uid = %sudo_uid, "malformed SUDO_UID in environment");
            return false;
        };
        let Ok(gid) = sudo_gid.parse::<u32>() else {
            warn!(sudo_gid = %sudo_gid, "malformed SUDO_GID in environment");
            return false;
        };

        self.uid = uid;
        self.gid = gid;

        match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => {
                self.home_dir = user.dir;
                self.username = user.name.clone();
                self.name = user.gecos.to_string_lossy().into_owned();
                true
            }
            _ => {
                warn!(uid, "failed to look up SUDO_UID user entry");
                false
            }
        }
    }

    fn set_from_current(&mut self) {
        self.uid = Uid::current().as_raw();
        self.gid = Gid::current().as_raw();

        match User::from_uid(Uid::current()) {
            Ok(Some(user)) => {
                self.home_dir = user.dir;
                self.username = user.name.clone();
                self.name = user.gecos.to_string_lossy().into_owned();
            }
            _ => {
                self.username = std::env::var("USERNAME").unwrap_or_default();
                self.name = self.username.clone();
                self.home_dir = Path::new("/home").join(&self.username);
            }
        }
    }

    /// Try the Solus packager files under the home directory.
    fn set_from_packager(&mut self) -> bool {
        let candidates = [
            self.home_dir.join(".config/solus/packager"),
            self.home_dir.join(".solus/packager"),
            self.home_dir.join(".evolveos/packager"),
        ];

        for path in candidates {
            let Some((name, email)) = read_key_file(&path, "Name", "Email") else {
                continue;
            };

            debug!(path = %path.display(), "setting packager details from packager file");
            self.name = name;
            self.email = email;
            return true;
        }

        false
    }

    /// Fall back to the `[user]` section of ~/.gitconfig.
    fn set_from_git(&mut self) -> bool {
        let path = self.home_dir.join(".gitconfig");

        let Some((name, email)) = read_key_file(&path, "name", "email") else {
            return false;
        };

        debug!("setting packager details from git config");
        self.name = name;
        self.email = email;

        true
    }

    /// Write the packager file consumed inside the sandbox.
    pub fn write_packager(&self, path: &Path) -> Result<()> {
        let contents = format!("[Packager]\nName={}\nEmail={}\n", self.name, self.email);
        fs::write(path, contents)?;
        Ok(())
    }
}

/// Minimal INI-style lookup: find `key=value` pairs regardless of section,
/// tolerating whitespace. Good enough for packager and git config files.
fn read_key_file(path: &Path, name_key: &str, email_key: &str) -> Option<(String, String)> {
    let contents = fs::read_to_string(path).ok()?;

    let mut name = None;
    let mut email = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key.eq_ignore_ascii_case(name_key) {
            name = Some(value.to_string());
        } else if key.eq_ignore_ascii_case(email_key) {
            email = Some(value.to_string());
        }
    }

    match (name, email) {
        (Some(n), Some(e)) => Some((n, e)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn packager_file_is_parsed() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(".config/solus");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("packager"),
            "[Packager]\nName=Test Person\nEmail=test@getsol.us\n",
        )
        .unwrap();

        let mut info = UserInfo {
            home_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };

        assert!(info.set_from_packager());
        assert_eq!(info.name, "Test Person");
        assert_eq!(info.email, "test@getsol.us");
    }

    #[test]
    fn gitconfig_fallback() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(".gitconfig"),
            "[user]\n\tname = Git Person\n\temail = git@example.com\n",
        )
        .unwrap();

        let mut info = UserInfo {
            home_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };

        assert!(!info.set_from_packager());
        assert!(info.set_from_git());
        assert_eq!(info.name, "Git Person");
        assert_eq!(info.email, "git@example.com");
    }

    #[test]
    fn incomplete_packager_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(".config/solus");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("packager"), "[Packager]\nName=Only Name\n").unwrap();

        let mut info = UserInfo {
            home_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };

        assert!(!info.set_from_packager());
    }

    #[test]
    fn packager_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("packager");

        let info = UserInfo {
            name: "A Packager".to_string(),
            email: "a@b.c".to_string(),
            ..Default::default()
        };
        info.write_packager(&path).unwrap();

        let parsed = read_key_file(&path, "Name", "Email").unwrap();
        assert_eq!(parsed, ("A Packager".to_string(), "a@b.c".to_string()));
    }
}
