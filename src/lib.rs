//! Core library for solbuild, the Solus package build orchestrator.
//!
//! solbuild constructs operating-system packages inside isolated, disposable
//! build roots. A build root is a union mount stacking three layers:
//!
//! - a read-only **backing image** published by the distribution,
//! - a content-addressed **dependency layer** materialized once per unique
//!   (image, dependency set) pair and reused across builds,
//! - a per-build writable **upper** directory.
//!
//! The [`session::Session`] type coordinates the whole lifecycle: locking the
//! shared on-disk state, resolving build dependencies against repository
//! indices, materializing the layer, bringing up the overlay and its virtual
//! filesystems inside fresh kernel namespaces, executing the in-sandbox build
//! command, and guaranteeing teardown on every exit path.
//!
//! ```text
//! session ──> resolver ──> layer cache ──> overlay ──> sandbox executor
//!    │            │             │             │
//!    │         indices       layers root   backing image
//!    └── lockfile, sources, history, transit manifest
//! ```

pub mod build;
pub mod cache;
pub mod config;
pub mod errors;
pub mod history;
pub mod image;
pub mod index;
pub mod layer;
pub mod lockfile;
pub mod manifest;
pub mod overlay;
pub mod pkgmanager;
pub mod profile;
pub mod recipe;
pub mod resolver;
pub mod sandbox;
pub mod session;
pub mod source;
pub mod userinfo;

pub use errors::{Error, Result};

use std::path::Path;

/// Where the rootfs images for build profiles are kept.
pub const IMAGES_DIR: &str = "/var/lib/solbuild/images";

/// Common suffix for all solbuild images.
pub const IMAGE_SUFFIX: &str = ".img";

/// Common suffix for a fetched compressed image.
pub const IMAGE_COMPRESSED_SUFFIX: &str = ".img.xz";

/// Storage area for published base images.
pub const IMAGE_BASE_URI: &str = "https://solbuild.getsol.us";

/// Where updates are performed on base images.
pub const IMAGE_ROOTS_DIR: &str = "/var/lib/solbuild/roots";

/// Where container layers are cached, identified by their sha256 hashes,
/// e.g. `/var/cache/solbuild/layers/3c0de53d6017469...`.
pub const LAYERS_DIR: &str = "/var/cache/solbuild/layers";

/// Key used when a real layer key cannot be computed. Always misses the cache.
pub const LAYERS_FAKE_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Where packages are shared between all builders.
pub const PACKAGE_CACHE_DIR: &str = "/var/lib/solbuild/packages";

/// Where per-tool build caches (ccache, sccache, ...) are stored host-side.
pub const CACHE_DIR: &str = "/var/lib/solbuild/cache";

/// Base directory for all cached plain sources.
pub const SOURCE_DIR: &str = "/var/lib/solbuild/sources";

/// Staging area for in-flight downloads.
pub const SOURCE_STAGING_DIR: &str = "/var/lib/solbuild/sources/staging";

/// Base directory for all cached git sources.
pub const GIT_SOURCE_DIR: &str = "/var/lib/solbuild/sources/git";

/// The user that builds run as inside the chroot.
pub const BUILD_USER: &str = "build";

/// The build user's numerical ID.
pub const BUILD_USER_ID: u32 = 1000;

/// The build user's group ID.
pub const BUILD_USER_GID: u32 = 1000;

/// The build user's home directory.
pub const BUILD_USER_HOME: &str = "/home/build";

/// The build user's description.
pub const BUILD_USER_GECOS: &str = "solbuild user";

/// The system shell for the build user.
pub const BUILD_USER_SHELL: &str = "/bin/bash";

/// Known, Solus-published, base profiles.
pub const VALID_IMAGES: &[&str] = &["main-x86_64", "unstable-x86_64"];

/// Determine the existence of a file path.
pub fn path_exists<P: AsRef<Path>>(path: P) -> bool {
    std::fs::symlink_metadata(path.as_ref()).is_ok()
}

/// Check if the specified image name is a known one.
pub fn is_valid_image(image: &str) -> bool {
    VALID_IMAGES.contains(&image)
}
