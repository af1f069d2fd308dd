//! Driving eopkg inside the build root.
//!
//! The in-sandbox package manager is an opaque collaborator invoked by name;
//! this module owns the plumbing around it: host asset copies, the shared
//! package cache bind mount, D-Bus lifecycle, repository configuration and
//! the filesystem layout eopkg expects.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::overlay::{bind_mount, unmount_path, Overlay};
use crate::profile::{Profile, Repo};
use crate::sandbox::{chroot_exec, sane_environment, PidNotifier};
use crate::{path_exists, Error, Result, PACKAGE_CACHE_DIR};

/// Where local repositories are made available inside the build root.
pub const BIND_REPO_DIR: &str = "/hostRepos";

/// Where the index operation mounts the target repo.
pub const INDEX_BIND_TARGET: &str = "/hostRepo/Index";

/// Binary used for package operations inside the sandbox.
const INSTALL_COMMAND: &str = "eopkg.bin";

/// A repository discovered inside a build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EopkgRepo {
    pub id: String,
    pub uri: String,
}

/// Manager for all eopkg interaction within one root.
#[derive(Debug)]
pub struct EopkgManager {
    root: PathBuf,
    cache_source: PathBuf,
    cache_target: PathBuf,
    dbus_pid: PathBuf,
    dbus_active: bool,
    cache_mounted: bool,
    disable_colors: bool,
}

impl EopkgManager {
    pub fn new(root: &Path, disable_colors: bool) -> EopkgManager {
        EopkgManager {
            root: root.to_path_buf(),
            cache_source: PathBuf::from(PACKAGE_CACHE_DIR),
            cache_target: root.join("var/cache/eopkg/packages"),
            dbus_pid: root.join("var/run/dbus/pid"),
            dbus_active: false,
            cache_mounted: false,
            disable_colors,
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        sane_environment("root", "/root", self.disable_colors)
    }

    /// Wrap an eopkg invocation so colours are disabled where appropriate;
    /// eopkg largely ignores the console type by itself.
    fn eopkg_command(&self, command: &str) -> String {
        if self.disable_colors {
            format!("{command} -N")
        } else {
            command.to_string()
        }
    }

    /// Copy required host-side assets into the root. Reusable on purpose:
    /// an upgrade inside the root can clobber these files.
    pub fn copy_assets(&self) -> Result<()> {
        let assets = [
            ("/etc/resolv.conf", self.root.join("etc/resolv.conf")),
            ("/etc/eopkg/eopkg.conf", self.root.join("etc/eopkg/eopkg.conf")),
            (
                "/etc/ccache/ccache.conf",
                self.root.join("etc/ccache/ccache.conf"),
            ),
        ];

        for (source, target) in assets {
            if !path_exists(source) {
                continue;
            }

            if let Some(parent) = target.parent() {
                if !path_exists(parent) {
                    debug!(path = %parent.display(), "creating required directory");
                    fs::create_dir_all(parent)?;
                }
            }

            debug!(asset = source, "copying host asset");
            fs::copy(source, &target)?;
        }

        Ok(())
    }

    /// Basic preparation of the root: stale D-Bus pid removal, asset
    /// copies, and the shared package cache bind mount.
    pub fn init(&mut self) -> Result<()> {
        if path_exists(&self.dbus_pid) {
            fs::remove_file(&self.dbus_pid)?;
        }

        self.copy_assets()?;

        if !path_exists(&self.cache_source) {
            debug!(path = %self.cache_source.display(), "creating system-wide package cache");
            fs::create_dir_all(&self.cache_source)?;
        }

        fs::create_dir_all(&self.cache_target)?;
        bind_mount(&self.cache_source, &self.cache_target, false)?;
        self.cache_mounted = true;

        Ok(())
    }

    /// Bring up D-Bus within the root. eopkg needs it for COMAR.
    pub fn start_dbus(&mut self, notif: &dyn PidNotifier) -> Result<()> {
        if self.dbus_active {
            return Ok(());
        }

        fs::create_dir_all(self.root.join("run/dbus"))?;

        chroot_exec(notif, &self.root, "dbus-uuidgen --ensure", &self.env())?;
        chroot_exec(notif, &self.root, "dbus-daemon --system", &self.env())?;
        self.dbus_active = true;

        Ok(())
    }

    /// Tear D-Bus down again by killing the pid recorded in its pidfile.
    pub fn stop_dbus(&mut self) -> Result<()> {
        if !self.dbus_active {
            return Ok(());
        }

        let contents = fs::read_to_string(&self.dbus_pid)?;
        let pid = contents.lines().next().unwrap_or("").trim().to_string();

        let status = std::process::Command::new("kill")
            .arg("-9")
            .arg(&pid)
            .status()?;
        if !status.success() {
            warn!(pid = %pid, "failed to kill dbus daemon");
        }

        let _ = fs::remove_file(&self.dbus_pid);
        self.dbus_active = false;

        Ok(())
    }

    /// Take care of any work we have already done: D-Bus and the package
    /// cache mount. Failures are logged, never propagated.
    pub fn cleanup(&mut self) {
        if let Err(e) = self.stop_dbus() {
            warn!(err = %e, "failed to stop d-bus during cleanup");
        }

        if self.cache_mounted {
            if let Err(e) = unmount_path(&self.cache_target) {
                warn!(err = %e, "failed to unmount package cache");
            } else {
                self.cache_mounted = false;
            }
        }
    }

    /// Perform a full upgrade inside the root, then assert the extra
    /// requirements containerized builds need beyond system.base.
    pub fn upgrade(&self, notif: &dyn PidNotifier) -> Result<()> {
        let new_reqs = ["abi-wizard", "iproute2", "sccache"];

        chroot_exec(
            notif,
            &self.root,
            &self.eopkg_command(&format!("{INSTALL_COMMAND} upgrade -y")),
            &self.env(),
        )?;

        chroot_exec(
            notif,
            &self.root,
            &self.eopkg_command(&format!(
                "{INSTALL_COMMAND} install -y {}",
                new_reqs.join(" ")
            )),
            &self.env(),
        )
    }

    /// Install the named component inside the root.
    pub fn install_component(&self, notif: &dyn PidNotifier, component: &str) -> Result<()> {
        chroot_exec(
            notif,
            &self.root,
            &self.eopkg_command(&format!("{INSTALL_COMMAND} install -y -c {component}")),
            &self.env(),
        )
    }

    /// Install an explicit set of packages inside the root.
    pub fn install_packages(&self, notif: &dyn PidNotifier, packages: &[String]) -> Result<()> {
        let mut command = format!("eopkg it -y {}", packages.join(" "));
        if self.disable_colors {
            command.push_str(" -n");
        }

        chroot_exec(notif, &self.root, &command, &self.env())
    }

    /// Discover all the repos configured in the target filesystem.
    pub fn get_repos(&self) -> Result<Vec<EopkgRepo>> {
        let index_dir = self.root.join("var/lib/eopkg/index");

        debug!("discovering repos in rootfs");

        if !index_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut repos = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(&index_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        entries.sort();

        for dir in entries {
            let uri_file = dir.join("uri");
            if !uri_file.is_file() {
                continue;
            }

            let uri = fs::read_to_string(&uri_file)?;
            let id = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            repos.push(EopkgRepo {
                id,
                uri: uri.trim().to_string(),
            });
        }

        Ok(repos)
    }

    /// Add a repo to the root.
    pub fn add_repo(&self, notif: &dyn PidNotifier, id: &str, source: &str) -> Result<()> {
        chroot_exec(
            notif,
            &self.root,
            &self.eopkg_command(&format!("{INSTALL_COMMAND} add-repo '{id}' '{source}'")),
            &self.env(),
        )
    }

    /// Remove a named repo from the root.
    pub fn remove_repo(&self, notif: &dyn PidNotifier, id: &str) -> Result<()> {
        chroot_exec(
            notif,
            &self.root,
            &self.eopkg_command(&format!("{INSTALL_COMMAND} remove-repo '{id}'")),
            &self.env(),
        )
    }

    /// Apply the profile's repository policy: removals first (respecting
    /// the `"*"` wildcard), then ordered additions.
    pub fn configure_repos(
        &self,
        notif: &dyn PidNotifier,
        overlay: &mut Overlay,
        profile: &Profile,
    ) -> Result<()> {
        let installed = self.get_repos()?;

        let removals: Vec<String> = if profile.removes_all_repos() {
            installed.iter().map(|r| r.id.clone()).collect()
        } else {
            profile.remove_repos.clone()
        };

        for id in &removals {
            debug!(repo = %id, "removing repository");
            self.remove_repo(notif, id)?;
        }

        for repo in profile.enabled_repos() {
            if repo.local {
                debug!(name = %repo.name, uri = %repo.uri, "adding local repo to system");
                self.add_local_repo(notif, overlay, repo)?;
            } else {
                debug!(name = %repo.name, uri = %repo.uri, "adding repo to system");
                self.add_repo(notif, &repo.name, &repo.uri)?;
            }
        }

        Ok(())
    }

    fn add_local_repo(
        &self,
        notif: &dyn PidNotifier,
        overlay: &mut Overlay,
        repo: &Repo,
    ) -> Result<()> {
        if !path_exists(&repo.uri) {
            return Err(Error::Config(format!(
                "local repo '{}' does not exist at {}",
                repo.name, repo.uri
            )));
        }

        let target = overlay
            .mount_point
            .join(BIND_REPO_DIR.trim_start_matches('/'))
            .join(&repo.name);
        fs::create_dir_all(&target)?;

        overlay.bind_external(Path::new(&repo.uri), &target, false)?;

        if repo.autoindex {
            debug!(name = %repo.name, "reindexing repository");

            let command = format!(
                "cd {BIND_REPO_DIR}/{}; {}",
                repo.name,
                self.eopkg_command(&format!("{INSTALL_COMMAND} index --skip-signing ."))
            );
            chroot_exec(notif, &overlay.mount_point, &command, &self.env())?;
        } else {
            let index = target.join("eopkg-index.xml.xz");
            if !path_exists(&index) {
                warn!(repo = %repo.name, "repository index doesn't exist, please index it to use it");
            }
        }

        let chroot_index = format!("{BIND_REPO_DIR}/{}/eopkg-index.xml.xz", repo.name);
        self.add_repo(notif, &repo.name, &chroot_index)
    }
}

/// Enforce the filesystem layout eopkg expects before any work begins:
/// a fresh `/run`, `run/lock`, the package cache bind target, and the
/// `/var/lock` and `/var/run` compatibility symlinks.
pub fn ensure_eopkg_layout(root: &Path) -> Result<()> {
    let run_path = root.join("run");
    if path_exists(&run_path) {
        fs::remove_dir_all(&run_path)?;
    }
    fs::create_dir_all(&run_path)?;

    for dir in ["run/lock", "var", "var/cache/eopkg/packages"] {
        fs::create_dir_all(root.join(dir))?;
    }

    let lock_target = root.join("var/lock");
    if !path_exists(&lock_target) {
        std::os::unix::fs::symlink("../run/lock", &lock_target)?;
    }

    let run_target = root.join("var/run");
    if !path_exists(&run_target) {
        std::os::unix::fs::symlink("../run", &run_target)?;
    }

    Ok(())
}
