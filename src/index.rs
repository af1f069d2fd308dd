//! Data model for eopkg repository indices.
//!
//! An index is a single XML document listing every package in a repository
//! together with its runtime dependencies, component membership, and the
//! virtual capabilities it provides.

use serde::Deserialize;

/// A parsed `eopkg-index.xml` document.
#[derive(Debug, Default, Deserialize)]
pub struct Index {
    #[serde(rename = "Package", default)]
    pub packages: Vec<Package>,
}

/// One package record from a repository index.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Package {
    #[serde(rename = "Name")]
    pub name: String,

    /// Hash of the package payload as published upstream. Changes whenever
    /// the package is rebuilt, which is exactly what layer keys need.
    #[serde(rename = "PackageHash", default)]
    pub package_hash: String,

    /// Component this package belongs to, e.g. `system.base`.
    #[serde(rename = "PartOf", default)]
    pub part_of: String,

    #[serde(rename = "RuntimeDependencies", default)]
    pub runtime_dependencies: Option<Dependencies>,

    #[serde(rename = "Provides", default)]
    pub provides: Option<Provides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dependencies {
    #[serde(rename = "Dependency", default)]
    pub dependencies: Vec<Dependency>,
}

/// A runtime dependency edge. The package name is the element text; any
/// version constraints ride along as attributes we don't act on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dependency {
    #[serde(rename = "$text", default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Provides {
    #[serde(rename = "PkgConfig", default)]
    pub pkgconfig: Vec<String>,

    #[serde(rename = "PkgConfig32", default)]
    pub pkgconfig32: Vec<String>,
}

impl Index {
    /// Parse an index from a reader. The caller handles any xz framing.
    pub fn from_reader<R: std::io::BufRead>(reader: R) -> Result<Index, quick_xml::DeError> {
        quick_xml::de::from_reader(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"<PISI>
  <Distribution>
    <SourceName>Solus</SourceName>
  </Distribution>
  <Package>
    <Name>libfoo</Name>
    <PackageHash>abc123</PackageHash>
    <PartOf>system.base</PartOf>
    <RuntimeDependencies>
      <Dependency releaseFrom="12">libbar</Dependency>
    </RuntimeDependencies>
    <Provides>
      <PkgConfig>foo</PkgConfig>
      <PkgConfig32>foo</PkgConfig32>
    </Provides>
  </Package>
  <Package>
    <Name>libbar</Name>
    <PackageHash>def456</PackageHash>
  </Package>
</PISI>
"#;

    #[test]
    fn parses_packages_and_provides() {
        let index = Index::from_reader(INDEX.as_bytes()).unwrap();

        assert_eq!(index.packages.len(), 2);

        let foo = &index.packages[0];
        assert_eq!(foo.name, "libfoo");
        assert_eq!(foo.package_hash, "abc123");
        assert_eq!(foo.part_of, "system.base");
        assert_eq!(
            foo.runtime_dependencies.as_ref().unwrap().dependencies[0].name,
            "libbar"
        );
        assert_eq!(foo.provides.as_ref().unwrap().pkgconfig, vec!["foo"]);

        let bar = &index.packages[1];
        assert!(bar.runtime_dependencies.is_none());
        assert!(bar.part_of.is_empty());
    }
}
