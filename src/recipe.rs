//! Typed build-recipe descriptors.
//!
//! Recipes come in two flavours: the modern `package.yml` format and the
//! legacy `pspec.xml` format. Both parse down to the same [`Recipe`]
//! descriptor; the rest of the builder never looks at the documents again.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::source::Source;
use crate::{Error, Result};

/// The kind of recipe being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeType {
    /// The legacy pspec.xml format.
    Legacy,
    /// The native package.yml format.
    Modern,
    /// A faux type used by the index operation to reuse the overlay system.
    Index,
}

/// The parsed view of a build recipe.
#[derive(Debug, Clone)]
pub struct Recipe {
    /// Name of the package.
    pub name: String,

    /// Version of this package.
    pub version: String,

    /// Release number; upgrades are based entirely on this.
    pub release: i64,

    /// Modern or legacy.
    pub kind: RecipeType,

    /// Path to the build spec on the host.
    pub path: PathBuf,

    /// Sources to fetch before building.
    pub sources: Vec<Source>,

    /// Whether the build may keep networking. Modern recipes default to
    /// sandboxed; legacy builds always network.
    pub can_network: bool,

    /// Whether the build may use the compiler caches.
    pub can_ccache: bool,

    /// Build-time dependency seeds for the resolver. May name virtual
    /// capabilities like `pkgconfig(zlib)`.
    pub build_deps: Vec<String>,

    /// Whether the 32-bit seed set joins the dependency closure.
    pub emul32: bool,
}

/// Faux recipe used by the index operation to make use of the overlay
/// machinery without a spec file.
pub fn index_recipe() -> Recipe {
    Recipe {
        name: "index".to_string(),
        version: "1.4.5.2".to_string(),
        release: 1,
        kind: RecipeType::Index,
        path: PathBuf::new(),
        sources: Vec::new(),
        can_network: false,
        can_ccache: false,
        build_deps: Vec::new(),
        emul32: false,
    }
}

#[derive(Debug, Deserialize)]
struct YmlRecipe {
    name: Option<String>,
    version: Option<YmlScalar>,
    #[serde(default)]
    release: i64,
    #[serde(default)]
    networking: bool,
    #[serde(default = "default_true")]
    ccache: bool,
    #[serde(default)]
    emul32: bool,
    #[serde(default)]
    builddeps: Vec<String>,
    #[serde(default)]
    source: Vec<std::collections::BTreeMap<String, String>>,
}

/// Versions are frequently written unquoted in package.yml, so `1.0` may
/// arrive as a number. Accept both, preserving the written form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YmlScalar {
    Text(String),
    Number(serde_yaml::Number),
}

impl YmlScalar {
    fn into_string(self) -> String {
        match self {
            YmlScalar::Text(s) => s,
            YmlScalar::Number(n) => n.to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct XmlRecipe {
    #[serde(rename = "Source")]
    source: XmlSource,
    #[serde(rename = "History")]
    history: Option<XmlHistory>,
}

#[derive(Debug, Deserialize)]
struct XmlSource {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Archive", default)]
    archives: Vec<XmlArchive>,
}

#[derive(Debug, Deserialize)]
struct XmlArchive {
    #[serde(rename = "@sha1sum", default)]
    sha1sum: String,
    #[serde(rename = "$text", default)]
    uri: String,
}

#[derive(Debug, Deserialize)]
struct XmlHistory {
    #[serde(rename = "Update", default)]
    updates: Vec<XmlUpdate>,
}

#[derive(Debug, Deserialize)]
struct XmlUpdate {
    #[serde(rename = "@release")]
    release: i64,
    #[serde(rename = "Version")]
    version: String,
}

impl Recipe {
    /// Parse the recipe at the given path, choosing the format from the
    /// file extension.
    pub fn from_path(path: &Path) -> Result<Recipe> {
        if path.extension().and_then(|e| e.to_str()) == Some("xml") {
            Self::from_legacy_path(path)
        } else {
            Self::from_modern_path(path)
        }
    }

    /// Parse a modern package.yml at the given path.
    pub fn from_modern_path(path: &Path) -> Result<Recipe> {
        let bytes = fs::read(path)?;
        let mut recipe = Self::from_modern_bytes(&bytes)?;
        recipe.path = path.to_path_buf();

        Ok(recipe)
    }

    /// Parse a modern package.yml held in memory. Used directly by the
    /// history engine, which reads recipe blobs out of git.
    pub fn from_modern_bytes(bytes: &[u8]) -> Result<Recipe> {
        let yml: YmlRecipe = serde_yaml::from_slice(bytes)
            .map_err(|e| Error::Recipe(format!("malformed package.yml: {e}")))?;

        let mut recipe = Recipe {
            name: yml.name.unwrap_or_default().trim().to_string(),
            version: yml
                .version
                .map(YmlScalar::into_string)
                .unwrap_or_default()
                .trim()
                .to_string(),
            release: yml.release,
            kind: RecipeType::Modern,
            path: PathBuf::new(),
            sources: Vec::new(),
            can_network: yml.networking,
            can_ccache: yml.ccache,
            build_deps: yml.builddeps,
            emul32: yml.emul32,
        };

        for row in yml.source {
            for (uri, validator) in row {
                recipe.sources.push(Source::new(&uri, &validator, false)?);
            }
        }

        recipe.validate("ypkg")?;

        Ok(recipe)
    }

    /// Parse a legacy pspec.xml at the given path.
    pub fn from_legacy_path(path: &Path) -> Result<Recipe> {
        let text = fs::read_to_string(path)?;
        let xml: XmlRecipe = quick_xml::de::from_str(&text)
            .map_err(|e| Error::Recipe(format!("malformed pspec file: {e}")))?;

        let update = xml
            .history
            .and_then(|h| h.updates.into_iter().next())
            .ok_or_else(|| Error::Recipe("malformed pspec file: empty history".into()))?;

        let mut recipe = Recipe {
            name: xml.source.name.trim().to_string(),
            version: update.version.trim().to_string(),
            release: update.release,
            kind: RecipeType::Legacy,
            path: path.to_path_buf(),
            sources: Vec::new(),
            // Legacy builds cannot be meaningfully sandboxed.
            can_network: true,
            can_ccache: false,
            build_deps: Vec::new(),
            emul32: false,
        };

        for archive in xml.source.archives {
            recipe
                .sources
                .push(Source::new(archive.uri.trim(), &archive.sha1sum, true)?);
        }

        recipe.validate("xml")?;

        Ok(recipe)
    }

    fn validate(&self, kind: &str) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Recipe(format!("{kind}: missing name in package")));
        }

        if self.version.is_empty() {
            return Err(Error::Recipe(format!("{kind}: missing version in package")));
        }

        if self.release < 0 {
            return Err(Error::Recipe(format!(
                "{kind}: invalid release in package: {}",
                self.release
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;

    const MODERN: &str = r#"
name       : nano
version    : 7.2
release    : 142
source     :
    - https://www.nano-editor.org/dist/v7/nano-7.2.tar.xz : 86f3442768bd2873cec693f83cdf80b4b444ad3cc14760b74361474fc87a4526
    - git|https://example.com/nano-extras.git : v1.2
"#;

    const LEGACY: &str = r#"<PISI>
  <Source>
    <Name>nano</Name>
    <Archive sha1sum="0f033aa413f77d8a66cb6b48a564bd26ca0a3bd8">https://example.com/nano-2.7.5.tar.xz</Archive>
  </Source>
  <History>
    <Update release="68">
      <Date>2017-02-12</Date>
      <Version>2.7.5</Version>
      <Comment>Update nano</Comment>
    </Update>
  </History>
</PISI>
"#;

    #[test]
    fn modern_recipe_parses() {
        let recipe = Recipe::from_modern_bytes(MODERN.as_bytes()).unwrap();

        assert_eq!(recipe.name, "nano");
        assert_eq!(recipe.version, "7.2");
        assert_eq!(recipe.release, 142);
        assert_eq!(recipe.kind, RecipeType::Modern);
        assert!(!recipe.can_network);
        assert!(recipe.can_ccache);
        assert_eq!(recipe.sources.len(), 2);
        assert!(matches!(recipe.sources[1], Source::Git(_)));
    }

    #[test]
    fn legacy_recipe_parses() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("pspec.xml");
        std::fs::write(&path, LEGACY).unwrap();

        let recipe = Recipe::from_legacy_path(&path).unwrap();
        assert_eq!(recipe.name, "nano");
        assert_eq!(recipe.version, "2.7.5");
        assert_eq!(recipe.release, 68);
        assert_eq!(recipe.kind, RecipeType::Legacy);
        assert!(recipe.can_network);
        assert_eq!(recipe.sources.len(), 1);
    }

    #[test]
    fn missing_name_is_rejected() {
        let doc = "version: 1.0\nrelease: 1\n";
        assert!(matches!(
            Recipe::from_modern_bytes(doc.as_bytes()),
            Err(Error::Recipe(_))
        ));
    }

    #[test]
    fn negative_release_is_rejected() {
        let doc = "name: x\nversion: 1.0\nrelease: -3\n";
        assert!(matches!(
            Recipe::from_modern_bytes(doc.as_bytes()),
            Err(Error::Recipe(_))
        ));
    }

    #[test]
    fn unquoted_numeric_version_is_accepted() {
        let doc = "name: x\nversion: 1.5\nrelease: 1\n";
        let recipe = Recipe::from_modern_bytes(doc.as_bytes()).unwrap();
        assert_eq!(recipe.version, "1.5");
    }
}
