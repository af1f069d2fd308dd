//! Source acquisition.
//!
//! A recipe declares zero or more sources. Each is either a plain fetchable
//! artifact validated by checksum, or a git repository pinned to a ref. Both
//! share the same capability set: identify yourself, say whether you are
//! cached, fetch yourself into the host cache, and describe how to bind
//! yourself into the sandbox.

pub mod git;
pub mod simple;

use std::path::PathBuf;

use crate::Result;

pub use git::GitSource;
pub use simple::SimpleSource;

/// Prefix marking a git source in modern recipes, e.g.
/// `git|https://example.com/hello.git : v1.0`.
const GIT_PREFIX: &str = "git|";

/// The (host path, sandbox path) pair for bind mounting a source into the
/// build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindConfiguration {
    pub bind_source: PathBuf,
    pub bind_target: PathBuf,
}

/// A single source declaration from a recipe.
#[derive(Debug, Clone)]
pub enum Source {
    Simple(SimpleSource),
    Git(GitSource),
}

impl Source {
    /// Create the right source kind for a recipe declaration. `validator`
    /// is a checksum for plain sources and a ref for git sources.
    pub fn new(uri: &str, validator: &str, legacy: bool) -> Result<Source> {
        if let Some(stripped) = uri.strip_prefix(GIT_PREFIX) {
            Ok(Source::Git(GitSource::new(stripped, validator)?))
        } else {
            Ok(Source::Simple(SimpleSource::new(uri, validator, legacy)?))
        }
    }

    /// A human readable identifier for error reporting.
    pub fn identifier(&self) -> String {
        match self {
            Source::Simple(s) => s.identifier(),
            Source::Git(g) => g.identifier(),
        }
    }

    /// Whether the source is already present in the host cache.
    pub fn is_fetched(&self) -> bool {
        match self {
            Source::Simple(s) => s.is_fetched(),
            Source::Git(g) => g.is_fetched(),
        }
    }

    /// Fetch the source into the host cache, validating it on the way in.
    pub fn fetch(&self) -> Result<()> {
        match self {
            Source::Simple(s) => s.fetch(),
            Source::Git(g) => g.fetch(),
        }
    }

    /// Describe how to bind this source into the given in-sandbox source
    /// directory.
    pub fn bind_spec(&self, source_dir: &std::path::Path) -> BindConfiguration {
        match self {
            Source::Simple(s) => s.bind_spec(source_dir),
            Source::Git(g) => g.bind_spec(source_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_prefix_selects_git_source() {
        let source = Source::new("git|https://example.com/hello.git", "v1.0", false).unwrap();
        assert!(matches!(source, Source::Git(_)));
    }

    #[test]
    fn plain_uri_selects_simple_source() {
        let source = Source::new(
            "https://example.com/hello-1.0.tar.gz",
            "aa5f3c1713b4a7b0e32a0fdc0bfbc9d6e95cbf272a2bb4966e0d3f95ee86df08",
            false,
        )
        .unwrap();
        assert!(matches!(source, Source::Simple(_)));
    }
}
