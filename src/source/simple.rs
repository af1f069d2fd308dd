//! Plain (tarball or single-file) sources, cached by content hash.
//!
//! The cache layout is `<source-root>/<sha256>/<basename>`. Legacy recipes
//! validate with sha1, so after a fetch we additionally leave a symlink named
//! by the sha1 pointing at the sha256 directory, letting both recipe
//! generations share one cache.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use reqwest::blocking::Client;
use reqwest::header;
use reqwest::redirect::Policy;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::{path_exists, Error, Result, SOURCE_DIR, SOURCE_STAGING_DIR};

/// Maximum number of redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// A tarball or other plain source for a package.
#[derive(Debug, Clone)]
pub struct SimpleSource {
    /// Canonical URI with any rename fragment stripped.
    pub uri: String,

    /// Basename of the cached file.
    pub file: String,

    legacy: bool,
    validator: String,

    source_dir: PathBuf,
    staging_dir: PathBuf,
}

impl SimpleSource {
    /// Create a new plain source. A URI fragment renames the destination
    /// basename, e.g. `https://host/raw?id=3#hello-1.0.tar.gz`.
    pub fn new(uri: &str, validator: &str, legacy: bool) -> Result<SimpleSource> {
        let mut url = Url::parse(uri).map_err(|e| Error::Network {
            uri: uri.to_string(),
            reason: format!("invalid URI: {e}"),
        })?;

        let mut file = Path::new(url.path())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if let Some(fragment) = url.fragment() {
            if !fragment.is_empty() {
                file = fragment.to_string();
                url.set_fragment(None);
            }
        }

        if file.is_empty() {
            return Err(Error::Network {
                uri: uri.to_string(),
                reason: "URI has no usable basename".to_string(),
            });
        }

        Ok(SimpleSource {
            uri: url.to_string(),
            file,
            legacy,
            validator: validator.to_string(),
            source_dir: PathBuf::from(SOURCE_DIR),
            staging_dir: PathBuf::from(SOURCE_STAGING_DIR),
        })
    }

    /// Redirect the cache roots, for tests and alternate layouts.
    pub fn with_roots(mut self, source_dir: &Path, staging_dir: &Path) -> SimpleSource {
        self.source_dir = source_dir.to_path_buf();
        self.staging_dir = staging_dir.to_path_buf();
        self
    }

    /// The URI associated with this source.
    pub fn identifier(&self) -> String {
        self.uri.clone()
    }

    /// Path of the cached file for the given hash.
    pub fn path(&self, hash: &str) -> PathBuf {
        self.source_dir.join(hash).join(&self.file)
    }

    /// Whether the canonical cached path exists.
    pub fn is_fetched(&self) -> bool {
        path_exists(self.path(&self.validator))
    }

    /// The (host, sandbox) bind pair for this source.
    pub fn bind_spec(&self, source_dir: &Path) -> super::BindConfiguration {
        super::BindConfiguration {
            bind_source: self.path(&self.validator),
            bind_target: source_dir.join(&self.file),
        }
    }

    /// Fetch the source and move it into the content-addressed cache.
    ///
    /// Modern recipes are validated against their declared sha256 before
    /// the file is admitted; a mismatch removes the staging file and fails
    /// hard. Legacy recipes are admitted unvalidated, keyed by sha1.
    pub fn fetch(&self) -> Result<()> {
        debug!(uri = %self.uri, "downloading source");

        fs::create_dir_all(&self.staging_dir)?;
        let staging_path = self.staging_dir.join(&self.file);

        if let Err(e) = self.acquire(&staging_path) {
            let _ = fs::remove_file(&staging_path);
            return Err(e);
        }

        let sha256 = hash_file::<Sha256>(&staging_path)?;

        if !self.legacy && sha256 != self.validator {
            let err = Error::ChecksumMismatch {
                path: staging_path.clone(),
                expected: self.validator.clone(),
                actual: sha256,
            };
            let _ = fs::remove_file(&staging_path);
            return Err(err);
        }

        let target_dir = self.source_dir.join(&sha256);
        fs::create_dir_all(&target_dir)?;
        fs::rename(&staging_path, target_dir.join(&self.file))?;

        // Legacy archives are looked up by their sha1, so alias it to the
        // sha256 directory.
        if self.legacy {
            let sha1 = hash_file::<Sha1>(&self.path(&sha256))?;
            let link = self.source_dir.join(sha1);
            if !path_exists(&link) {
                std::os::unix::fs::symlink(&sha256, &link)?;
            }
        }

        Ok(())
    }

    fn acquire(&self, dest: &Path) -> Result<()> {
        let url = Url::parse(&self.uri).map_err(|e| Error::Network {
            uri: self.uri.clone(),
            reason: e.to_string(),
        })?;

        if url.scheme() == "file" {
            let host_path = url
                .to_file_path()
                .map_err(|_| Error::Network {
                    uri: self.uri.clone(),
                    reason: "invalid file URI".to_string(),
                })?;
            fs::copy(&host_path, dest)?;
            return Ok(());
        }

        self.download(url, dest)
    }

    /// Resolve the redirect chain by hand, then stream the final body to
    /// `dest`. The Referer header is never forwarded between hops; some
    /// upstreams serve error pages when it is present.
    fn download(&self, url: Url, dest: &Path) -> Result<()> {
        let client = Client::builder()
            .redirect(Policy::none())
            .user_agent(concat!("solbuild/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network {
                uri: self.uri.clone(),
                reason: e.to_string(),
            })?;

        let mut current = url;

        for _ in 0..MAX_REDIRECTS {
            let response = client
                .get(current.clone())
                .header(header::ACCEPT, "*/*")
                .header(header::ACCEPT_ENCODING, "identity")
                .send()
                .map_err(|e| Error::Network {
                    uri: current.to_string(),
                    reason: e.to_string(),
                })?;

            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::Network {
                        uri: current.to_string(),
                        reason: format!("redirect ({status}) without a Location header"),
                    })?;

                current = current.join(location).map_err(|e| Error::Network {
                    uri: current.to_string(),
                    reason: format!("bad redirect target '{location}': {e}"),
                })?;
                continue;
            }

            if !status.is_success() {
                return Err(Error::Network {
                    uri: current.to_string(),
                    reason: format!("server returned {status}"),
                });
            }

            let mut out = File::create(dest)?;
            let mut reader = response;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).map_err(|e| Error::Network {
                    uri: current.to_string(),
                    reason: e.to_string(),
                })?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            out.sync_all()?;

            return Ok(());
        }

        Err(Error::RedirectLoop(self.uri.clone()))
    }
}

/// Stream a file through the given digest, returning lowercase hex.
pub fn hash_file<D: Digest>(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buf = [0u8; 1024 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn roots(tmp: &TempDir) -> (PathBuf, PathBuf) {
        (tmp.path().join("sources"), tmp.path().join("staging"))
    }

    #[test]
    fn fragment_renames_the_basename() {
        let source = SimpleSource::new(
            "https://example.com/archive/download?id=91#hello-1.0.tar.gz",
            "cafe",
            false,
        )
        .unwrap();

        assert_eq!(source.file, "hello-1.0.tar.gz");
        // The fragment is not part of the canonical URI.
        assert!(!source.uri.contains('#'));
    }

    #[test]
    fn plain_basename_comes_from_the_path() {
        let source =
            SimpleSource::new("https://example.com/dist/nano-7.2.tar.xz", "cafe", false).unwrap();
        assert_eq!(source.file, "nano-7.2.tar.xz");
    }

    #[test]
    fn file_uri_fetch_validates_and_caches() {
        let tmp = TempDir::new().unwrap();
        let (sources, staging) = roots(&tmp);

        let payload = tmp.path().join("hello-1.0.tar.gz");
        fs::write(&payload, b"hello world").unwrap();
        let expected = hash_file::<Sha256>(&payload).unwrap();

        let uri = format!("file://{}", payload.display());
        let source = SimpleSource::new(&uri, &expected, false)
            .unwrap()
            .with_roots(&sources, &staging);

        assert!(!source.is_fetched());
        source.fetch().unwrap();
        assert!(source.is_fetched());
        assert_eq!(
            fs::read(sources.join(&expected).join("hello-1.0.tar.gz")).unwrap(),
            b"hello world"
        );
    }

    #[test]
    fn checksum_mismatch_fails_and_removes_staging() {
        let tmp = TempDir::new().unwrap();
        let (sources, staging) = roots(&tmp);

        let payload = tmp.path().join("hello-1.0.tar.gz");
        fs::write(&payload, b"hello world").unwrap();

        let uri = format!("file://{}", payload.display());
        let source = SimpleSource::new(&uri, "deadbeef", false)
            .unwrap()
            .with_roots(&sources, &staging);

        match source.fetch() {
            Err(Error::ChecksumMismatch { expected, .. }) => assert_eq!(expected, "deadbeef"),
            other => panic!("expected ChecksumMismatch, got {other:?}"),
        }

        assert!(!staging.join("hello-1.0.tar.gz").exists());
        assert!(!source.is_fetched());
    }

    #[test]
    fn legacy_fetch_creates_sha1_alias() {
        let tmp = TempDir::new().unwrap();
        let (sources, staging) = roots(&tmp);

        let payload = tmp.path().join("nano-2.7.5.tar.xz");
        fs::write(&payload, b"legacy bytes").unwrap();
        let sha1 = hash_file::<Sha1>(&payload).unwrap();
        let sha256 = hash_file::<Sha256>(&payload).unwrap();

        let uri = format!("file://{}", payload.display());
        let source = SimpleSource::new(&uri, &sha1, true)
            .unwrap()
            .with_roots(&sources, &staging);

        source.fetch().unwrap();

        // The canonical path keys off the declared (sha1) validator and
        // resolves through the alias.
        assert!(source.is_fetched());
        let link = sources.join(&sha1);
        assert!(link.is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from(&sha256));
    }

    #[test]
    fn bind_spec_lands_in_the_sandbox_source_dir() {
        let source = SimpleSource::new("https://example.com/nano-7.2.tar.xz", "cafe", false).unwrap();

        let spec = source.bind_spec(Path::new("/home/build/YPKG/sources"));
        assert_eq!(
            spec.bind_target,
            PathBuf::from("/home/build/YPKG/sources/nano-7.2.tar.xz")
        );
        assert!(spec.bind_source.ends_with("cafe/nano-7.2.tar.xz"));
    }
}
