//! The concrete build flow for a recipe inside a mounted overlay.
//!
//! These helpers sit between the session orchestrator and the raw
//! subsystems: staging directories, source binds, cache binds, asset copies
//! in and artifact collection out.

use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};
use tracing::{debug, error, info, warn};

use crate::cache::caches;
use crate::history::PackageHistory;
use crate::manifest::TransitManifest;
use crate::overlay::Overlay;
use crate::recipe::{Recipe, RecipeType};
use crate::sandbox::{self, PidNotifier};
use crate::userinfo::UserInfo;
use crate::{
    path_exists, Error, Result, BUILD_USER, BUILD_USER_GID, BUILD_USER_HOME, BUILD_USER_ID,
    CACHE_DIR,
};

/// The chroot-internal work directory for the given build type.
pub fn work_dir_internal(recipe: &Recipe) -> PathBuf {
    if recipe.kind == RecipeType::Legacy {
        PathBuf::from("/WORK")
    } else {
        Path::new(BUILD_USER_HOME).join("work")
    }
}

/// The externally visible work directory.
pub fn work_dir(recipe: &Recipe, overlay: &Overlay) -> PathBuf {
    rebase(&overlay.mount_point, &work_dir_internal(recipe))
}

/// The chroot-internal source directory for the given build type.
pub fn source_dir_internal(recipe: &Recipe) -> PathBuf {
    if recipe.kind == RecipeType::Legacy {
        PathBuf::from("/var/cache/eopkg/archives")
    } else {
        Path::new(BUILD_USER_HOME).join("YPKG/sources")
    }
}

/// The externally visible source directory.
pub fn source_dir(recipe: &Recipe, overlay: &Overlay) -> PathBuf {
    rebase(&overlay.mount_point, &source_dir_internal(recipe))
}

fn rebase(mount_point: &Path, internal: &Path) -> PathBuf {
    mount_point.join(internal.strip_prefix("/").unwrap_or(internal))
}

/// Create the work and source trees, plus cache directories on both sides
/// of the mount for modern builds.
pub fn create_dirs(recipe: &Recipe, overlay: &Overlay) -> Result<()> {
    for dir in [work_dir(recipe, overlay), source_dir(recipe, overlay)] {
        fs::create_dir_all(&dir)?;
    }

    if recipe.kind == RecipeType::Modern {
        for cache in caches() {
            let in_root = cache.sandbox_dir(&overlay.mount_point);
            let host = cache.host_dir(Path::new(CACHE_DIR));

            fs::create_dir_all(&in_root)?;
            fs::create_dir_all(&host)?;

            // The unprivileged build user writes into these.
            chown(
                &host,
                Some(Uid::from_raw(BUILD_USER_ID)),
                Some(Gid::from_raw(BUILD_USER_GID)),
            )
            .map_err(|e| Error::Io(e.into()))?;
        }
    }

    Ok(())
}

/// Fetch every missing source into the host cache. No source is ever bound
/// into the sandbox before it is present here.
pub fn fetch_sources(recipe: &Recipe) -> Result<()> {
    for source in &recipe.sources {
        if source.is_fetched() {
            continue;
        }

        source.fetch().map_err(|e| {
            error!(source = %source.identifier(), err = %e, "failed to fetch source");
            e
        })?;
    }

    Ok(())
}

/// Bind every source read-only into the sandbox source directory.
pub fn bind_sources(recipe: &Recipe, overlay: &mut Overlay) -> Result<()> {
    let sources_root = source_dir(recipe, overlay);

    for source in &recipe.sources {
        let spec = source.bind_spec(&sources_root);

        if !path_exists(&sources_root) {
            fs::create_dir_all(&sources_root)?;
        }

        debug!(source = %spec.bind_source.display(), target = %spec.bind_target.display(),
            "exposing source to container");

        // The bind target must pre-exist with the right kind.
        if spec.bind_source.is_dir() {
            fs::create_dir_all(&spec.bind_target)?;
        } else {
            touch(&spec.bind_target)?;
        }

        overlay.bind_external(&spec.bind_source, &spec.bind_target, true)?;
    }

    Ok(())
}

/// Bind every declared build cache read-write into the sandbox.
pub fn bind_caches(recipe: &Recipe, overlay: &mut Overlay) -> Result<()> {
    if recipe.kind == RecipeType::Legacy {
        return Err(Error::Config(
            "build caches are only available to modern builds".to_string(),
        ));
    }

    for cache in caches() {
        let source = cache.host_dir(Path::new(CACHE_DIR));
        let target = cache.sandbox_dir(&overlay.mount_point);

        debug!(cache = cache.name, source = %source.display(), target = %target.display(),
            "exposing cache to build");

        overlay.bind_external(&source, &target, false)?;
    }

    Ok(())
}

/// Copy the recipe and its companion assets into the work directory, and
/// write the changelog document when a history is attached.
pub fn copy_assets(
    recipe: &Recipe,
    history: Option<&PackageHistory>,
    overlay: &Overlay,
) -> Result<()> {
    let base_dir = recipe
        .path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let base_dir = base_dir.canonicalize().unwrap_or(base_dir);

    let mut copy_paths: Vec<String> = vec![
        recipe
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        "files".to_string(),
        "comar".to_string(),
        "component.xml".to_string(),
    ];

    if recipe.kind == RecipeType::Legacy {
        copy_paths.push("actions.py".to_string());
    }

    let dest_dir = work_dir(recipe, overlay);

    for rel in copy_paths {
        let asset = base_dir.join(&rel);

        // component.xml sits beside the legacy work dir, not in it.
        let dest = if recipe.kind == RecipeType::Legacy && rel == "component.xml" {
            dest_dir.parent().unwrap_or(&dest_dir).to_path_buf()
        } else {
            dest_dir.clone()
        };

        copy_all(&asset, &dest)?;
    }

    if let Some(history) = history {
        let hist_path = dest_dir.join("history.xml");
        history.write_xml(&hist_path)?;
    }

    Ok(())
}

/// Search the work directory for produced artifacts and copy them back to
/// the invoking user's current directory, restoring their ownership.
///
/// When a manifest target is set, a transit manifest covering every .eopkg
/// is written and collected alongside.
pub fn collect_assets(
    recipe: &Recipe,
    overlay: &Overlay,
    usr: &UserInfo,
    manifest_target: Option<&str>,
) -> Result<()> {
    let collection_dir = work_dir(recipe, overlay);

    let mut collections = files_matching(&collection_dir, |name| name.ends_with(".eopkg"))?;
    if collections.is_empty() {
        error!("no .eopkg files were produced by the build");
        return Err(Error::Config(
            "internal error: .eopkg files are missing".to_string(),
        ));
    }
    collections.sort();

    if let Some(target) = manifest_target {
        let mut tram = TransitManifest::new(target);
        for pkg in &collections {
            tram.add_file(pkg)?;
        }

        let tram_path = crate::manifest::manifest_path(
            &collection_dir,
            &recipe.name,
            &recipe.version,
            recipe.release,
        );
        tram.write(&tram_path)?;

        collections.push(tram_path);
    }

    // ABI reports and generated pspecs ride along when present.
    collections.extend(files_matching(&collection_dir, |name| {
        name.starts_with("abi_")
    })?);
    if recipe.kind == RecipeType::Modern {
        collections.extend(files_matching(&collection_dir, |name| {
            name.starts_with("pspec_") && name.ends_with(".xml")
        })?);
    }

    debug!(count = collections.len(), "collecting files");

    let cwd = std::env::current_dir()?;

    for file in collections {
        let base = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = cwd.join(&base);

        debug!(path = %base, "collecting build artifact");
        fs::copy(&file, &target)?;

        debug!(uid = usr.uid, gid = usr.gid, path = %base, "setting file ownership for current user");
        if let Err(e) = chown(
            &target,
            Some(Uid::from_raw(usr.uid)),
            Some(Gid::from_raw(usr.gid)),
        ) {
            error!(path = %base, err = %e, "error restoring file ownership");
        }
    }

    Ok(())
}

/// Stage the packager identity file inside the sandbox and install build
/// dependencies for a modern build.
pub fn prep_modern(
    notif: &dyn PidNotifier,
    recipe: &Recipe,
    usr: &UserInfo,
    overlay: &Overlay,
    env: &[(String, String)],
    disable_colors: bool,
) -> Result<()> {
    debug!("writing packager file");

    let packager = overlay
        .mount_point
        .join(BUILD_USER_HOME.trim_start_matches('/'))
        .join(".config/solus/packager");
    if let Some(parent) = packager.parent() {
        fs::create_dir_all(parent)?;
    }
    usr.write_packager(&packager)?;

    let wdir = work_dir_internal(recipe);
    let yml_file = wdir.join(recipe.path.file_name().unwrap_or_default());

    let mut command = format!("ypkg-install-deps -f {}", yml_file.display());
    if disable_colors {
        command.push_str(" -n");
    }

    debug!(file = %yml_file.display(), "installing build dependencies");
    sandbox::chroot_exec(notif, &overlay.mount_point, &command, env)?;

    // Chown the tree before bringing up sources.
    let chown_cmd = format!("chown -R {BUILD_USER}:{BUILD_USER} {BUILD_USER_HOME}");
    sandbox::chroot_exec(notif, &overlay.mount_point, &chown_cmd, env)?;

    Ok(())
}

/// Assemble the in-sandbox build command for a modern recipe.
pub fn modern_build_command(
    recipe: &Recipe,
    history: Option<&PackageHistory>,
    disable_colors: bool,
) -> String {
    let wdir = work_dir_internal(recipe);
    let yml_file = wdir.join(recipe.path.file_name().unwrap_or_default());

    let mut command = format!("ypkg-build -D {} {}", wdir.display(), yml_file.display());
    if disable_colors {
        command.push_str(" -n");
    }

    // Pin reproducible-build timestamps to the last real version change.
    if let Some(history) = history {
        if !history.updates.is_empty() {
            command.push_str(&format!(" -t {}", history.last_version_timestamp()));
        }
    }

    command
}

/// Assemble the in-sandbox build command for a legacy recipe. Sandboxing
/// in eopkg itself is explicitly disabled; ours is the one that counts.
pub fn legacy_build_command(recipe: &Recipe, disable_colors: bool) -> String {
    let wdir = work_dir_internal(recipe);
    let xml_file = wdir.join(recipe.path.file_name().unwrap_or_default());

    let command = format!(
        "eopkg build --ignore-sandbox --yes-all -O {} {}",
        wdir.display(),
        xml_file.display()
    );

    if disable_colors {
        format!("{command} -N")
    } else {
        command
    }
}

/// Generate the ABI report for a finished modern build. Failures are
/// logged, never fatal.
pub fn generate_abi_report(
    notif: &dyn PidNotifier,
    recipe: &Recipe,
    overlay: &Overlay,
    env: &[(String, String)],
) {
    let wdir = work_dir_internal(recipe);
    let command = format!(
        "cd {}; abi-wizard {BUILD_USER_HOME}/YPKG/root/{}/install",
        wdir.display(),
        recipe.name
    );

    if let Err(e) = sandbox::chroot_exec(notif, &overlay.mount_point, &command, env) {
        warn!(err = %e, "failed to generate abi report");
    } else {
        info!("generated ABI report");
    }
}

/// Create the file if it doesn't exist, enabling its use as a bind target.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    Ok(())
}

/// Copy the source asset into the destination directory; directories copy
/// recursively. Missing sources are skipped. Directories are created as
/// 0755 throughout; only file contents matter to the build.
pub fn copy_all(source: &Path, dest_dir: &Path) -> Result<()> {
    let Ok(meta) = fs::metadata(source) else {
        return Ok(());
    };

    if meta.is_dir() {
        let nested = dest_dir.join(source.file_name().unwrap_or_default());
        let mut entries: Vec<PathBuf> = fs::read_dir(source)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        for entry in entries {
            copy_all(&entry, &nested)?;
        }
    } else {
        if !path_exists(dest_dir) {
            debug!(dir = %dest_dir.display(), "creating target directory");
            fs::create_dir_all(dest_dir)?;
        }

        let target = dest_dir.join(source.file_name().unwrap_or_default());
        debug!(source = %source.display(), target = %target.display(), "copying source asset");
        fs::copy(source, &target)?;
    }

    Ok(())
}

fn files_matching<F: Fn(&str) -> bool>(dir: &Path, pred: F) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();

    if !dir.is_dir() {
        return Ok(out);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(&pred)
        {
            out.push(path);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::BackingImage;
    use crate::recipe::Recipe;
    use tempfile::TempDir;

    fn modern_recipe() -> Recipe {
        let doc = "name: nano\nversion: \"7.2\"\nrelease: 142\n";
        let mut recipe = Recipe::from_modern_bytes(doc.as_bytes()).unwrap();
        recipe.path = PathBuf::from("/work/packages/nano/package.yml");
        recipe
    }

    fn overlay_for(tmp: &TempDir) -> Overlay {
        Overlay::at(tmp.path().join("ov"), &BackingImage::new("main-x86_64"))
    }

    #[test]
    fn modern_directories_live_under_the_build_home() {
        let tmp = TempDir::new().unwrap();
        let recipe = modern_recipe();
        let overlay = overlay_for(&tmp);

        assert_eq!(work_dir_internal(&recipe), Path::new("/home/build/work"));
        assert_eq!(
            source_dir_internal(&recipe),
            Path::new("/home/build/YPKG/sources")
        );
        assert_eq!(
            work_dir(&recipe, &overlay),
            overlay.mount_point.join("home/build/work")
        );
    }

    #[test]
    fn legacy_directories_use_the_old_layout() {
        let mut recipe = modern_recipe();
        recipe.kind = RecipeType::Legacy;

        assert_eq!(work_dir_internal(&recipe), Path::new("/WORK"));
        assert_eq!(
            source_dir_internal(&recipe),
            Path::new("/var/cache/eopkg/archives")
        );
    }

    #[test]
    fn modern_build_command_carries_history_timestamp() {
        use crate::history::PackageHistory;
        use time::OffsetDateTime;

        let recipe = modern_recipe();

        let base = modern_build_command(&recipe, None, false);
        assert_eq!(
            base,
            "ypkg-build -D /home/build/work /home/build/work/package.yml"
        );

        let update = crate::history::PackageUpdate {
            commit: "c".repeat(40),
            author: "A".to_string(),
            author_email: "a@b.c".to_string(),
            body: "change".to_string(),
            time: OffsetDateTime::from_unix_timestamp(1234).unwrap(),
            recipe: modern_recipe(),
            is_security: false,
        };
        let history = PackageHistory::from_updates(vec![update]).unwrap();

        let with_history = modern_build_command(&recipe, Some(&history), true);
        assert!(with_history.ends_with("-n -t 1234"));
    }

    #[test]
    fn legacy_build_command_disables_inner_sandbox() {
        let mut recipe = modern_recipe();
        recipe.kind = RecipeType::Legacy;
        recipe.path = PathBuf::from("/work/packages/nano/pspec.xml");

        let command = legacy_build_command(&recipe, false);
        assert!(command.contains("--ignore-sandbox"));
        assert!(command.contains("/WORK/pspec.xml"));
    }

    #[test]
    fn copy_all_copies_trees_and_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("pkg");
        fs::create_dir_all(src.join("files/patches")).unwrap();
        fs::write(src.join("package.yml"), "name: x\n").unwrap();
        fs::write(src.join("files/patches/fix.patch"), "patch").unwrap();

        let dest = tmp.path().join("work");

        copy_all(&src.join("package.yml"), &dest).unwrap();
        copy_all(&src.join("files"), &dest).unwrap();
        // Missing assets are fine.
        copy_all(&src.join("comar"), &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("package.yml")).unwrap(), "name: x\n");
        assert_eq!(
            fs::read_to_string(dest.join("files/patches/fix.patch")).unwrap(),
            "patch"
        );
    }

    #[test]
    fn bind_caches_refuses_legacy_builds() {
        let tmp = TempDir::new().unwrap();
        let mut recipe = modern_recipe();
        recipe.kind = RecipeType::Legacy;
        let mut overlay = overlay_for(&tmp);

        assert!(bind_caches(&recipe, &mut overlay).is_err());
        assert!(overlay.extra_mounts.is_empty());
    }

    #[test]
    fn touch_creates_bind_targets() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("union/home/build/YPKG/sources/nano.tar.xz");

        touch(&target).unwrap();
        assert!(target.is_file());

        // A second touch must not truncate.
        fs::write(&target, b"content").unwrap();
        touch(&target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"content");
    }
}
