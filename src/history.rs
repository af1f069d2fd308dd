//! Automatic changelog generation from recipe git history.
//!
//! Rather than maintaining dedicated changelog files, the builder walks the
//! commits that touched a recipe's directory, parses the recipe as it
//! existed at each commit, and synthesizes a `history.xml` document the
//! in-sandbox tooling merges into the package. Commit messages mentioning a
//! CVE identifier mark their update as a security update.

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use regex::Regex;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::debug;

use crate::recipe::Recipe;
use crate::{Error, Result};

/// Absolute maximum number of changelog entries parsed and emitted.
pub const MAX_CHANGELOG_ENTRIES: usize = 10;

/// Date format emitted into history.xml, e.g. 2016-09-24.
const UPDATE_DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

fn cve_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"CVE-[0-9]+-[0-9]+").expect("static regex"))
}

/// One point in the recipe's history, parsed from a git commit.
#[derive(Debug, Clone)]
pub struct PackageUpdate {
    /// The associated commit hash.
    pub commit: String,

    /// Author name of the change.
    pub author: String,

    /// Author email of the change.
    pub author_email: String,

    /// Commit message, transliterated to ASCII.
    pub body: String,

    /// When the update took place.
    pub time: OffsetDateTime,

    /// The recipe as parsed at this commit.
    pub recipe: Recipe,

    /// Whether the message mentions a CVE identifier.
    pub is_security: bool,
}

/// An automatic changelog for one recipe.
#[derive(Debug)]
pub struct PackageHistory {
    /// At most [`MAX_CHANGELOG_ENTRIES`] updates, sorted descending by
    /// (release, time), one per release.
    pub updates: Vec<PackageUpdate>,
}

impl PackageHistory {
    /// Analyze the git history of the repository containing `recipe_path`
    /// and build a usable changelog. Fails with [`Error::NoHistory`] when
    /// not a single commit yields a parseable recipe.
    pub fn new(recipe_path: &Path) -> Result<PackageHistory> {
        let recipe_path = recipe_path
            .canonicalize()
            .map_err(|e| Error::Vcs(format!("cannot resolve recipe path: {e}")))?;
        let recipe_dir = recipe_path
            .parent()
            .ok_or_else(|| Error::Vcs("recipe has no parent directory".into()))?;

        let refs = git_log(recipe_dir)?;
        debug!(commits = refs.len(), "scanning recipe history");

        let file_name = recipe_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Vcs("recipe has no file name".into()))?;

        let mut updates = Vec::new();
        for commit in refs {
            if let Some(update) = read_update(recipe_dir, &commit, file_name)? {
                updates.push(update);
            }
        }

        let updates = collapse_and_sort(updates);

        if updates.is_empty() {
            return Err(Error::NoHistory);
        }

        Ok(PackageHistory { updates })
    }

    /// Construct a history from pre-built updates. Used by tests and any
    /// caller with its own VCS plumbing.
    pub fn from_updates(updates: Vec<PackageUpdate>) -> Result<PackageHistory> {
        let updates = collapse_and_sort(updates);
        if updates.is_empty() {
            return Err(Error::NoHistory);
        }

        Ok(PackageHistory { updates })
    }

    /// The timestamp of the last real version bump, skipping plain release
    /// bumps. Feeds reproducible builds, so noise here means churn in
    /// delta packages.
    pub fn last_version_timestamp(&self) -> i64 {
        let mut last_time = self.updates[0].time;
        let last_version = &self.updates[0].recipe.version;

        for update in self.updates.iter().skip(1) {
            if update.recipe.version != *last_version {
                break;
            }
            last_time = update.time;
        }

        last_time.unix_timestamp()
    }

    /// Serialize the changelog to the XML document consumed in-sandbox.
    pub fn write_xml(&self, path: &Path) -> Result<()> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(xml_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("YPKG")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Start(BytesStart::new("History")))
            .map_err(xml_err)?;

        for update in &self.updates {
            let mut elem = BytesStart::new("Update");
            elem.push_attribute(("release", update.recipe.release.to_string().as_str()));
            if update.is_security {
                elem.push_attribute(("type", "security"));
            }
            writer.write_event(Event::Start(elem)).map_err(xml_err)?;

            let date = update
                .time
                .format(UPDATE_DATE_FORMAT)
                .map_err(|e| Error::Vcs(format!("cannot format update date: {e}")))?;

            write_text_element(&mut writer, "Date", &date)?;
            write_text_element(&mut writer, "Version", &update.recipe.version)?;
            write_cdata_element(&mut writer, "Comment", &update.body)?;
            write_cdata_element(&mut writer, "Name", &update.author)?;
            write_text_element(&mut writer, "Email", &update.author_email)?;

            writer
                .write_event(Event::End(BytesEnd::new("Update")))
                .map_err(xml_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("History")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("YPKG")))
            .map_err(xml_err)?;

        std::fs::write(path, writer.into_inner())?;

        Ok(())
    }
}

fn xml_err(e: std::io::Error) -> Error {
    Error::Io(e)
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}

fn write_cdata_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::CData(BytesCData::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}

/// Build a single update out of one commit, or None when the recipe blob
/// at that commit is missing or unparseable. Malformed recipes do happen
/// mid-history and must not abort the whole scan.
fn read_update(recipe_dir: &Path, commit: &str, file_name: &str) -> Result<Option<PackageUpdate>> {
    let Some(blob) = git_show_blob(recipe_dir, commit, file_name)? else {
        return Ok(None);
    };

    let recipe = match Recipe::from_modern_bytes(&blob) {
        Ok(recipe) => recipe,
        Err(_) => return Ok(None),
    };

    let meta = git_commit_meta(recipe_dir, commit)?;

    let body = to_ascii(&meta.body);
    let is_security = cve_regex().is_match(&body);

    Ok(Some(PackageUpdate {
        commit: commit.to_string(),
        author: to_ascii(&meta.author),
        author_email: meta.email,
        body,
        time: meta.time,
        recipe,
        is_security,
    }))
}

/// Keep one update per release (newest timestamp wins), sort descending by
/// (release, time), and truncate.
fn collapse_and_sort(updates: Vec<PackageUpdate>) -> Vec<PackageUpdate> {
    let mut by_release: std::collections::BTreeMap<i64, PackageUpdate> =
        std::collections::BTreeMap::new();

    for update in updates {
        let release = update.recipe.release;
        match by_release.get(&release) {
            Some(existing) if existing.time >= update.time => {}
            _ => {
                by_release.insert(release, update);
            }
        }
    }

    let mut out: Vec<PackageUpdate> = by_release.into_values().collect();
    out.sort_by(|a, b| {
        b.recipe
            .release
            .cmp(&a.recipe.release)
            .then_with(|| b.time.cmp(&a.time))
    });
    out.truncate(MAX_CHANGELOG_ENTRIES);

    out
}

/// Escape any non-ASCII rune the way Go's strconv.QuoteRuneToASCII does,
/// keeping the changelog safe for downstream consumers that still choke on
/// multibyte input.
fn to_ascii(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for c in s.chars() {
        if (c as u32) < 128 {
            out.push(c);
        } else {
            let escaped: String = c.escape_unicode().collect();
            out.push('\'');
            out.push_str(&escaped);
            out.push('\'');
        }
    }

    out
}

struct CommitMeta {
    author: String,
    email: String,
    body: String,
    time: OffsetDateTime,
}

fn git_output(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .map_err(|e| Error::Vcs(format!("unable to run git: {e}")))?;

    if !output.status.success() {
        return Err(Error::Vcs(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Commits that touched the recipe's containing directory, newest first.
fn git_log(dir: &Path) -> Result<Vec<String>> {
    let out = git_output(dir, &["log", "--pretty=format:%H", "--", "."])?;

    Ok(out
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// The recipe blob at a given commit, or None when the file wasn't present.
fn git_show_blob(dir: &Path, commit: &str, file_name: &str) -> Result<Option<Vec<u8>>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .arg("show")
        .arg(format!("{commit}:./{file_name}"))
        .output()
        .map_err(|e| Error::Vcs(format!("unable to run git: {e}")))?;

    if !output.status.success() {
        return Ok(None);
    }

    Ok(Some(output.stdout))
}

fn git_commit_meta(dir: &Path, commit: &str) -> Result<CommitMeta> {
    let out = git_output(
        dir,
        &["show", "-s", "--format=%an%x00%ae%x00%at%x00%B", commit],
    )?;

    let mut parts = out.splitn(4, '\0');
    let author = parts.next().unwrap_or("").to_string();
    let email = parts.next().unwrap_or("").to_string();
    let epoch: i64 = parts
        .next()
        .unwrap_or("")
        .trim()
        .parse()
        .map_err(|_| Error::Vcs(format!("bad commit timestamp for {commit}")))?;
    let body = parts.next().unwrap_or("").trim_end().to_string();

    let time = OffsetDateTime::from_unix_timestamp(epoch)
        .map_err(|_| Error::Vcs(format!("bad commit timestamp for {commit}")))?;

    Ok(CommitMeta {
        author,
        email,
        body,
        time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Recipe;

    fn recipe(version: &str, release: i64) -> Recipe {
        let doc = format!("name: nano\nversion: \"{version}\"\nrelease: {release}\n");
        Recipe::from_modern_bytes(doc.as_bytes()).unwrap()
    }

    fn update(version: &str, release: i64, epoch: i64, body: &str) -> PackageUpdate {
        let body = to_ascii(body);
        let is_security = cve_regex().is_match(&body);
        PackageUpdate {
            commit: format!("{release:040}"),
            author: "Test Author".to_string(),
            author_email: "test@example.com".to_string(),
            body,
            time: OffsetDateTime::from_unix_timestamp(epoch).unwrap(),
            recipe: recipe(version, release),
            is_security,
        }
    }

    #[test]
    fn sorted_descending_without_duplicate_releases() {
        let history = PackageHistory::from_updates(vec![
            update("1.0", 1, 100, "initial"),
            update("1.1", 2, 200, "bump"),
            // Two updates for release 3: the newer timestamp must win.
            update("1.2", 3, 300, "older"),
            update("1.2", 3, 350, "newer"),
        ])
        .unwrap();

        let releases: Vec<i64> = history.updates.iter().map(|u| u.recipe.release).collect();
        assert_eq!(releases, vec![3, 2, 1]);
        assert_eq!(history.updates[0].body, "newer");
    }

    #[test]
    fn truncated_to_ten_entries() {
        let updates = (1..=15)
            .map(|i| update("1.0", i, 100 * i, "change"))
            .collect();
        let history = PackageHistory::from_updates(updates).unwrap();

        assert_eq!(history.updates.len(), MAX_CHANGELOG_ENTRIES);
        assert_eq!(history.updates[0].recipe.release, 15);
        assert_eq!(history.updates[9].recipe.release, 6);
    }

    #[test]
    fn empty_history_is_an_error() {
        assert!(matches!(
            PackageHistory::from_updates(Vec::new()),
            Err(Error::NoHistory)
        ));
    }

    #[test]
    fn cve_mentions_mark_security_updates() {
        let history = PackageHistory::from_updates(vec![
            update("1.0", 1, 100, "Fix CVE-2023-12345 in parser"),
            update("1.1", 2, 200, "Routine bump"),
        ])
        .unwrap();

        assert!(history.updates[1].is_security);
        assert!(!history.updates[0].is_security);
    }

    #[test]
    fn last_version_timestamp_skips_release_bumps() {
        let history = PackageHistory::from_updates(vec![
            update("2.0", 5, 500, "bump release again"),
            update("2.0", 4, 400, "bump release"),
            update("2.0", 3, 300, "version change to 2.0"),
            update("1.0", 2, 200, "old version"),
        ])
        .unwrap();

        // All of releases 5, 4, 3 carry version 2.0; the bump moment is 300.
        assert_eq!(history.last_version_timestamp(), 300);
    }

    #[test]
    fn last_version_timestamp_single_entry() {
        let history = PackageHistory::from_updates(vec![update("1.0", 1, 123, "first")]).unwrap();
        assert_eq!(history.last_version_timestamp(), 123);
    }

    #[test]
    fn xml_document_shape() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("history.xml");

        let history = PackageHistory::from_updates(vec![
            update("1.1", 2, 86400 * 365, "Fix CVE-2020-1 again"),
            update("1.0", 1, 86400, "Packaging <rewrite> & cleanup"),
        ])
        .unwrap();

        history.write_xml(&path).unwrap();
        let doc = std::fs::read_to_string(&path).unwrap();

        assert!(doc.contains("<Update release=\"2\" type=\"security\">"));
        assert!(doc.contains("<Update release=\"1\">"));
        assert!(doc.contains("<Version>1.1</Version>"));
        assert!(doc.contains("<Date>1971-01-01</Date>"));
        // Angle brackets survive untouched inside CDATA.
        assert!(doc.contains("<![CDATA[Packaging <rewrite> & cleanup]]>"));
        assert!(doc.contains("<Email>test@example.com</Email>"));
    }

    #[test]
    fn non_ascii_is_transliterated() {
        let converted = to_ascii("Rêves blåbær");
        assert!(converted.is_ascii());
        assert!(converted.contains("R'\\u{ea}'ves"));
    }
}
