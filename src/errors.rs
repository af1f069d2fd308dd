//! Crate-wide error taxonomy.
//!
//! Setup errors abort the session and trigger cleanup; errors raised *during*
//! cleanup are logged and never abort the teardown sequence. A cancelled
//! session always surfaces [`Error::Cancelled`], even when unrelated errors
//! were observed while tearing down.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration
    #[error("'{0}' is not a known profile")]
    InvalidProfile(String),

    #[error("'{0}' is not a known image")]
    InvalidImage(String),

    #[error("cannot enable unknown repo '{0}'")]
    UnknownRepo(String),

    #[error("invalid memory size '{0}': must be numeric with a G/T/P/E unit")]
    InvalidMemSize(String),

    #[error("configuration: {0}")]
    Config(String),

    // Identity
    #[error("the session has already been initialised")]
    AlreadyInitialised,

    #[error("you must first set a package to build it")]
    NoRecipe,

    #[error("profile '{0}' is not installed")]
    ProfileNotInstalled(String),

    #[error("root is locked by '{owner_process}' (pid {owner_pid})")]
    OwnedLock {
        owner_pid: i32,
        owner_process: String,
    },

    // Network
    #[error("failed to fetch {uri}: {reason}")]
    Network { uri: String, reason: String },

    #[error("too many redirects while fetching {0}")]
    RedirectLoop(String),

    // Integrity
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("layer {0} is missing its completion sentinel")]
    MissingSentinel(String),

    // Resolver
    #[error("unable to find provider or package {0}")]
    UnknownPackage(String),

    #[error("malformed repository index {uri}: {reason}")]
    IndexParse { uri: String, reason: String },

    // Recipe
    #[error("recipe: {0}")]
    Recipe(String),

    // Source acquisition
    #[error("cannot resolve git ref '{0}'")]
    BadRef(String),

    #[error("git {args} failed with status {status}")]
    Git { args: String, status: i32 },

    // Sandbox
    #[error("failed to configure namespace: {0}")]
    Namespace(nix::errno::Errno),

    #[error("chroot command '{command}' exited with status {status}")]
    CommandFailed { command: String, status: i32 },

    // Filesystem
    #[error("failed to mount {target}: {errno}")]
    Mount {
        target: PathBuf,
        errno: nix::errno::Errno,
    },

    #[error("failed to unmount {target}: {errno}")]
    Unmount {
        target: PathBuf,
        errno: nix::errno::Errno,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // Transit manifest
    #[error("the manifest file '{0}' is not an eopkg")]
    IllegalUpload(PathBuf),

    // History
    #[error("no usable git history found")]
    NoHistory,

    #[error("git history: {0}")]
    Vcs(String),

    // Cancellation
    #[error("the operation was cancelled by the user")]
    Cancelled,
}

impl Error {
    /// Whether this error represents user-driven cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
