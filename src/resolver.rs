//! Build-dependency resolution against repository indices.
//!
//! The resolver walks the provides/requires graph of every configured
//! repository to compute the transitive closure of a seed set. The output is
//! sorted by name so that it is a deterministic function of its inputs; the
//! layer cache hashes it directly into the layer key.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;

use crate::index::{Index, Package};
use crate::profile::Profile;
use crate::{Error, Result};

/// Packages always seeded into 32-bit-enabled queries.
const EMUL32_SEEDS: &[&str] = &["glibc-32bit-devel", "libgcc-32bit", "libstdc++-32bit"];

/// A resolved dependency: a package name plus the upstream hash of its
/// payload, which keys layer reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dep {
    pub name: String,
    pub hash: String,
}

/// Indexed view over every repository the active profile declares.
#[derive(Debug, Default)]
pub struct Resolver {
    providers: BTreeMap<String, String>,
    packages: BTreeMap<String, Package>,
}

impl Resolver {
    pub fn new() -> Resolver {
        Resolver::default()
    }

    /// Merge an index into the resolver. First writer wins for both package
    /// names and provided capabilities, so repository priority order is
    /// add order.
    pub fn add_index(&mut self, index: &Index) {
        for pkg in &index.packages {
            if !self.packages.contains_key(&pkg.name) {
                self.packages.insert(pkg.name.clone(), pkg.clone());
            }

            if let Some(provides) = &pkg.provides {
                for cap in &provides.pkgconfig {
                    let provider = format!("pkgconfig({cap})");
                    self.providers.entry(provider).or_insert_with(|| pkg.name.clone());
                }
                for cap in &provides.pkgconfig32 {
                    let provider = format!("pkgconfig32({cap})");
                    self.providers.entry(provider).or_insert_with(|| pkg.name.clone());
                }
            }
        }
    }

    /// Fetch, decode and merge every repository the profile enables.
    /// Local repositories resolve through the file scheme; remote indices
    /// may be xz-framed, chosen by extension.
    pub fn add_profile_indices(&mut self, profile: &Profile) -> Result<()> {
        let mut uris = Vec::new();

        if profile.image.contains("unstable") {
            uris.push("https://cdn.getsol.us/repo/unstable/eopkg-index.xml.xz".to_string());
        } else if profile.image.contains("main") || profile.image.contains("stable") {
            uris.push("https://cdn.getsol.us/repo/shannon/eopkg-index.xml.xz".to_string());
        } else {
            warn!(image = %profile.image, "unrecognized image name, not adding default repo");
        }

        if !profile.remove_repos.is_empty() {
            uris.clear();
        }

        for repo in profile.enabled_repos() {
            if repo.local {
                uris.push(format!("file://{}/eopkg-index.xml", repo.uri));
            } else {
                uris.push(repo.uri.clone());
            }
        }

        for uri in uris {
            debug!(uri = %uri, "fetching repo index");
            self.add_index_uri(&uri)?;
            info!(uri = %uri, "parsed and added repo to resolver");
        }

        Ok(())
    }

    /// Fetch and merge a single index by URI.
    pub fn add_index_uri(&mut self, uri: &str) -> Result<()> {
        let index = if let Some(path) = uri.strip_prefix("file://") {
            read_index_file(Path::new(path), uri)?
        } else {
            read_index_remote(uri)?
        };

        self.add_index(&index);
        Ok(())
    }

    /// Compute the dependency closure of the given seeds.
    ///
    /// Seeds are unioned with `system.base` members, `system.devel` members
    /// and the fixed 32-bit seed set as requested. Virtual capabilities
    /// substitute their providers; unknown names fail the query. The result
    /// is sorted ascending by name and free of duplicates, independent of
    /// seed order.
    pub fn query(
        &self,
        seeds: &[String],
        with_base: bool,
        with_devel: bool,
        with_emul32: bool,
    ) -> Result<Vec<Dep>> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();

        if with_base || with_devel {
            for pkg in self.packages.values() {
                let wanted = (with_base && pkg.part_of == "system.base")
                    || (with_devel && pkg.part_of == "system.devel");
                if wanted {
                    self.walk(&pkg.name, &mut visited, &mut out)?;
                }
            }
        }

        if with_emul32 {
            for seed in EMUL32_SEEDS {
                self.walk(seed, &mut visited, &mut out)?;
            }
        }

        for seed in seeds {
            self.walk(seed, &mut visited, &mut out)?;
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(out)
    }

    fn walk(&self, name: &str, visited: &mut HashSet<String>, out: &mut Vec<Dep>) -> Result<()> {
        let name = self.providers.get(name).map(String::as_str).unwrap_or(name);

        if visited.contains(name) {
            return Ok(());
        }

        let pkg = self
            .packages
            .get(name)
            .ok_or_else(|| Error::UnknownPackage(name.to_string()))?;

        visited.insert(name.to_string());
        out.push(Dep {
            name: pkg.name.clone(),
            hash: pkg.package_hash.clone(),
        });

        if let Some(deps) = &pkg.runtime_dependencies {
            for dep in &deps.dependencies {
                self.walk(&dep.name, visited, out)?;
            }
        }

        Ok(())
    }
}

fn read_index_file(path: &Path, uri: &str) -> Result<Index> {
    let file = File::open(path).map_err(|e| Error::IndexParse {
        uri: uri.to_string(),
        reason: format!("failed to open index file: {e}"),
    })?;

    decode_index(BufReader::new(file), uri)
}

fn read_index_remote(uri: &str) -> Result<Index> {
    let response = reqwest::blocking::get(uri).map_err(|e| Error::Network {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;

    if !response.status().is_success() {
        return Err(Error::Network {
            uri: uri.to_string(),
            reason: format!("server returned {}", response.status()),
        });
    }

    decode_index(BufReader::new(response), uri)
}

fn decode_index<R: std::io::BufRead + 'static>(reader: R, uri: &str) -> Result<Index> {
    let index = if uri.ends_with(".xz") {
        Index::from_reader(BufReader::new(XzDecoder::new(reader)))
    } else if uri.ends_with(".xml") {
        Index::from_reader(reader)
    } else {
        return Err(Error::IndexParse {
            uri: uri.to_string(),
            reason: "unrecognized repo url extension".to_string(),
        });
    };

    index.map_err(|e| Error::IndexParse {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}
