//! Transit manifests: hash-verified upload descriptors for built packages.
//!
//! Build servers emit a `.tram` file alongside the packages so the incoming
//! repository can verify that uploads are intentional, complete, and
//! unmodified.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::source::simple::hash_file;
use crate::{Error, Result};

/// Extension a valid transit manifest must have.
pub const TRANSIT_MANIFEST_SUFFIX: &str = ".tram";

/// The `[manifest]` header present in all .tram uploads, so both the sender
/// and recipient talk in the same fashion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitManifestHeader {
    /// Versioning to protect against future format changes.
    pub version: String,

    /// The repo the uploader intends to upload *to*.
    pub target: String,
}

/// Verification data for one file in the uploaded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitManifestFile {
    /// Relative filename, i.e. `nano-2.7.5-68-1-x86_64.eopkg`.
    pub path: String,

    /// Checksum for integrity checks post-upload and pre-merge.
    pub sha256: String,
}

/// A transit manifest accompanying produced packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitManifest {
    pub manifest: TransitManifestHeader,

    #[serde(default, rename = "file")]
    pub files: Vec<TransitManifestFile>,
}

impl TransitManifest {
    /// Create an empty manifest directed at the given repo target.
    pub fn new(target: &str) -> TransitManifest {
        TransitManifest {
            manifest: TransitManifestHeader {
                version: "1.0".to_string(),
                target: target.to_string(),
            },
            files: Vec::new(),
        }
    }

    /// Add a file to the payload. Only `.eopkg` files are legal uploads.
    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        if path.extension().and_then(|e| e.to_str()) != Some("eopkg") {
            return Err(Error::IllegalUpload(path.to_path_buf()));
        }

        let sha256 = hash_file::<Sha256>(path)?;
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.files.push(TransitManifestFile { path: base, sha256 });

        Ok(())
    }

    /// The conventional manifest filename for a package build.
    pub fn file_name(name: &str, version: &str, release: i64) -> String {
        format!("{name}-{version}-{release}{TRANSIT_MANIFEST_SUFFIX}")
    }

    /// Dump the manifest to the given file path.
    pub fn write(&self, path: &Path) -> Result<()> {
        let body = toml::to_string(self)
            .map_err(|e| Error::Config(format!("manifest encoding failed: {e}")))?;
        fs::write(path, body)?;
        Ok(())
    }

    /// Load a manifest back from disk.
    pub fn read(path: &Path) -> Result<TransitManifest> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("malformed manifest {}: {e}", path.display())))
    }
}

/// Build the conventional manifest path next to collected artifacts.
pub fn manifest_path(dir: &Path, name: &str, version: &str, release: i64) -> PathBuf {
    dir.join(TransitManifest::file_name(name, version, release))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn only_eopkg_files_are_legal() {
        let tmp = TempDir::new().unwrap();
        let rogue = tmp.path().join("nano-7.2-142-1-x86_64.rpm");
        fs::write(&rogue, b"nope").unwrap();

        let mut manifest = TransitManifest::new("unstable");
        match manifest.add_file(&rogue) {
            Err(Error::IllegalUpload(path)) => assert_eq!(path, rogue),
            other => panic!("expected IllegalUpload, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_preserves_files_and_target() {
        let tmp = TempDir::new().unwrap();

        let a = tmp.path().join("nano-7.2-142-1-x86_64.eopkg");
        let b = tmp.path().join("nano-dbginfo-7.2-142-1-x86_64.eopkg");
        fs::write(&a, b"payload-a").unwrap();
        fs::write(&b, b"payload-b").unwrap();

        let mut manifest = TransitManifest::new("unstable");
        manifest.add_file(&a).unwrap();
        manifest.add_file(&b).unwrap();

        let path = manifest_path(tmp.path(), "nano", "7.2", 142);
        assert!(path.ends_with("nano-7.2-142.tram"));

        manifest.write(&path).unwrap();
        let loaded = TransitManifest::read(&path).unwrap();

        assert_eq!(loaded, manifest);
        assert_eq!(loaded.manifest.version, "1.0");
        assert_eq!(loaded.manifest.target, "unstable");
        assert_eq!(loaded.files.len(), 2);
        assert_eq!(loaded.files[0].path, "nano-7.2-142-1-x86_64.eopkg");
    }

    #[test]
    fn checksums_are_real_sha256() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("x-1-1-1-x86_64.eopkg");
        fs::write(&pkg, b"hello").unwrap();

        let mut manifest = TransitManifest::new("t");
        manifest.add_file(&pkg).unwrap();

        assert_eq!(
            manifest.files[0].sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
