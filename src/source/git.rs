//! Git sources, cached as blob-filtered clones reused across builds.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;
use url::Url;

use crate::{path_exists, Error, Result, GIT_SOURCE_DIR};

/// Blob filter applied to clones, fetches and submodule updates. Build trees
/// only ever need the objects reachable from one ref.
const BLOB_FILTER: &str = "--filter=blob:none";

/// A git source as referenced by a modern recipe. Must carry a valid ref to
/// check out.
#[derive(Debug, Clone)]
pub struct GitSource {
    /// Upstream URI.
    pub uri: String,

    /// Branch, tag, or full commit hash.
    pub git_ref: String,

    /// Clone basename, always suffixed `.git`.
    pub base_name: String,

    /// Where the clone lives on the host.
    pub clone_path: PathBuf,
}

impl GitSource {
    /// Create a new git source for the given URI and ref combination.
    pub fn new(uri: &str, git_ref: &str) -> Result<GitSource> {
        let url = Url::parse(uri).map_err(|e| Error::Network {
            uri: uri.to_string(),
            reason: format!("invalid URI: {e}"),
        })?;

        let mut base_name = Path::new(url.path())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if !base_name.ends_with(".git") {
            base_name.push_str(".git");
        }

        let parent = Path::new(url.path())
            .parent()
            .map(|p| p.strip_prefix("/").unwrap_or(p).to_path_buf())
            .unwrap_or_default();

        let clone_path = Path::new(GIT_SOURCE_DIR)
            .join(url.host_str().unwrap_or("localhost"))
            .join(parent)
            .join(&base_name);

        Ok(GitSource {
            uri: uri.to_string(),
            git_ref: git_ref.to_string(),
            base_name,
            clone_path,
        })
    }

    /// A human readable identifier in the `uri#ref` form.
    pub fn identifier(&self) -> String {
        format!("{}#{}", self.uri, self.git_ref)
    }

    /// Git state can move under us between builds, so always re-fetch.
    pub fn is_fetched(&self) -> bool {
        false
    }

    /// Bind the clone into the container source directory; the in-sandbox
    /// tooling clones from it locally and checks out there.
    pub fn bind_spec(&self, source_dir: &Path) -> super::BindConfiguration {
        super::BindConfiguration {
            bind_source: self.clone_path.clone(),
            bind_target: source_dir.join(&self.base_name),
        }
    }

    /// Whether the configured ref is an explicit commit (40 hex chars)
    /// rather than a symbolic ref.
    pub fn ref_is_commit(&self) -> bool {
        self.git_ref.len() == 40 && self.git_ref.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Download the git tree locally, or update the existing clone, then
    /// pin the worktree to the requested ref and realize submodules.
    pub fn fetch(&self) -> Result<()> {
        if !path_exists(&self.clone_path) {
            debug!(uri = %self.uri, path = %self.clone_path.display(), "cloning git source");

            if let Some(parent) = self.clone_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let clone_path = self.clone_path.to_string_lossy();
            self.git_host(&[
                "clone",
                BLOB_FILTER,
                "--no-checkout",
                self.uri.as_str(),
                clone_path.as_ref(),
            ])?;
        } else {
            debug!(path = %self.clone_path.display(), "reusing existing git clone");

            // Upstream tags may have been force-moved since the last build.
            self.git(&["fetch", BLOB_FILTER, "--tags", "--force", "origin"])?;
        }

        if !self.ref_is_commit() {
            debug!(git_ref = %self.git_ref, "ref does not look like a hash; treating as symbolic");
        }

        self.git(&["switch", "--discard-changes", "--detach", self.git_ref.as_str()])
            .map_err(|_| Error::BadRef(self.git_ref.clone()))?;

        debug!("updating submodules");
        self.git(&[
            "submodule",
            "update",
            "--init",
            "--recursive",
            BLOB_FILTER,
        ])?;

        // Filtered clones can leave 0600 pack files, which would make the
        // bind-mounted clone unreadable for the unprivileged build user.
        fix_packfile_perms(&self.clone_path)?;

        Ok(())
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["-C".to_string(), self.clone_path.to_string_lossy().into_owned()];
        full.extend(args.iter().map(|s| s.to_string()));
        run_git(&full)
    }

    fn git_host(&self, args: &[&str]) -> Result<()> {
        let full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        run_git(&full)
    }
}

fn run_git(args: &[String]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .status()
        .map_err(|e| Error::Vcs(format!("unable to run git: {e}")))?;

    if !status.success() {
        return Err(Error::Git {
            args: args.join(" "),
            status: status.code().unwrap_or(-1),
        });
    }

    Ok(())
}

/// Make every pack file world readable.
fn fix_packfile_perms(clone_path: &Path) -> Result<()> {
    let pack_dir = clone_path.join(".git/objects/pack");
    if !pack_dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(&pack_dir)? {
        let entry = entry?;
        let mut perms = entry.metadata()?.permissions();
        perms.set_mode(0o644);
        fs::set_permissions(entry.path(), perms)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_path_mirrors_host_and_path() {
        let source = GitSource::new("https://github.com/solus/hello.git", "v1.0").unwrap();

        assert_eq!(source.base_name, "hello.git");
        assert_eq!(
            source.clone_path,
            PathBuf::from("/var/lib/solbuild/sources/git/github.com/solus/hello.git")
        );
    }

    #[test]
    fn missing_git_suffix_is_added() {
        let source = GitSource::new("https://github.com/solus/hello", "main").unwrap();
        assert_eq!(source.base_name, "hello.git");
    }

    #[test]
    fn forty_hex_chars_is_a_commit() {
        let commit = "0123456789abcdef0123456789abcdef01234567";
        let source = GitSource::new("https://example.com/x.git", commit).unwrap();
        assert!(source.ref_is_commit());

        for not_commit in ["v1.0", "main", "0123456789abcdef0123456789abcdef0123456z"] {
            let source = GitSource::new("https://example.com/x.git", not_commit).unwrap();
            assert!(!source.ref_is_commit(), "{not_commit} treated as commit");
        }
    }

    #[test]
    fn identifier_joins_uri_and_ref() {
        let source = GitSource::new("https://example.com/x.git", "v2").unwrap();
        assert_eq!(source.identifier(), "https://example.com/x.git#v2");
    }

    #[test]
    fn bind_target_is_the_clone_basename() {
        let source = GitSource::new("https://example.com/hello.git", "v1").unwrap();
        let spec = source.bind_spec(Path::new("/home/build/YPKG/sources"));
        assert_eq!(
            spec.bind_target,
            PathBuf::from("/home/build/YPKG/sources/hello.git")
        );
    }
}
