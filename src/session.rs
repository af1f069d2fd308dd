//! The session orchestrator.
//!
//! A session owns one build/chroot/update/index operation from configuration
//! through cleanup. All shared state lives behind a single mutex taken at
//! the boundary of every public operation; nothing holds that mutex across
//! blocking network, mount, or child-process work. Cancellation is
//! cooperative: a signal watcher flips the cancelled flag and drives the
//! cleanup sequence, and every public operation checks the flag on entry
//! and before each expensive step.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, error, info, warn};

use crate::build;
use crate::config::{valid_mem_size, Config};
use crate::history::PackageHistory;
use crate::image::BackingImage;
use crate::layer::Layer;
use crate::lockfile::LockFile;
use crate::overlay::Overlay;
use crate::pkgmanager::{ensure_eopkg_layout, EopkgManager, INDEX_BIND_TARGET};
use crate::profile::Profile;
use crate::recipe::{index_recipe, Recipe, RecipeType};
use crate::resolver::Resolver;
use crate::sandbox::{
    self, add_build_user, sane_environment, ExecutorTemplate, PidNotifier,
};
use crate::userinfo::UserInfo;
use crate::{is_valid_image, path_exists, Error, Result, BUILD_USER_HOME, BUILD_USER_SHELL};

/// Immutable per-session options installed at construction. Tests inject a
/// configured session instead of reaching for process-wide globals.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Disable colours in everything we drive.
    pub disable_colors: bool,

    /// Skip ABI report generation after a successful build.
    pub disable_abi_report: bool,

    /// Command template wrapping the in-sandbox build executor.
    pub executor: ExecutorTemplate,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            disable_colors: false,
            disable_abi_report: false,
            executor: ExecutorTemplate::default(),
        }
    }
}

/// Mutex-guarded session state.
#[derive(Default)]
struct Inner {
    profile: Option<Profile>,
    image: Option<BackingImage>,
    recipe: Option<Recipe>,
    history: Option<Arc<PackageHistory>>,
    resolver: Option<Resolver>,
    overlay: Option<Arc<Mutex<Overlay>>>,
    pkgman: Option<Arc<Mutex<EopkgManager>>>,
    layer: Option<Arc<Mutex<Layer>>>,
    lockfile: Option<LockFile>,
    manifest_target: Option<String>,
    death_point: Option<std::path::PathBuf>,
    enable_tmpfs: bool,
    tmpfs_size: String,
    active_pid: i32,
    cancelled: bool,
    did_start: bool,
    cleaned: bool,
    update_mode: bool,
}

/// Narrow capability handing the active child PID back to the session.
struct PidHandle(Arc<Mutex<Inner>>);

impl PidNotifier for PidHandle {
    fn set_active_pid(&self, pid: i32) {
        self.0.lock().expect("session lock poisoned").active_pid = pid;
    }
}

/// Responsible for cleanly managing an entire build session: setup,
/// teardown, and everything between.
pub struct Session {
    /// Merged system and vendor configuration.
    pub config: Config,

    options: SessionOptions,
    inner: Arc<Mutex<Inner>>,
}

impl Session {
    /// Create a new session over the given configuration.
    pub fn new(config: Config, options: SessionOptions) -> Session {
        let inner = Inner {
            enable_tmpfs: config.enable_tmpfs,
            tmpfs_size: config.tmpfs_size.clone(),
            ..Default::default()
        };

        Session {
            config,
            options,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("session lock poisoned")
    }

    fn notifier(&self) -> PidHandle {
        PidHandle(Arc::clone(&self.inner))
    }

    /// Whether the session has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Mark the session cancelled; no new operations will start.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
    }

    /// Initialise the session with a named profile. An empty name selects
    /// the configured default profile.
    pub fn set_profile(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();

        if inner.cancelled {
            return Err(Error::Cancelled);
        }

        let name = if name.is_empty() {
            info!(name = %self.config.default_profile, "using default profile");
            self.config.default_profile.clone()
        } else {
            name.to_string()
        };

        let profile = Profile::new(&name)?;

        if !is_valid_image(&profile.image) {
            return Err(Error::InvalidImage(profile.image.clone()));
        }

        if inner.image.is_some() {
            return Err(Error::AlreadyInitialised);
        }

        inner.image = Some(BackingImage::new(&profile.image));
        inner.profile = Some(profile);

        Ok(())
    }

    /// Set the recipe this session builds or inspects.
    pub fn set_recipe(&self, recipe: Recipe) -> Result<()> {
        let mut inner = self.lock();

        if inner.cancelled {
            return Err(Error::Cancelled);
        }

        if inner.recipe.is_some() {
            return Err(Error::AlreadyInitialised);
        }

        let Some(image) = inner.image.clone() else {
            return Err(Error::InvalidProfile("no profile set".to_string()));
        };

        if !image.is_installed() {
            return Err(Error::ProfileNotInstalled(image.name.clone()));
        }

        if self.config.enable_history && recipe.kind == RecipeType::Modern {
            info!("history generation enabled");

            match PackageHistory::new(&recipe.path) {
                Ok(history) => {
                    debug!("obtained package history");
                    inner.history = Some(Arc::new(history));
                }
                Err(e) => warn!(err = %e, "failed to obtain package git history"),
            }
        }

        let profile = inner.profile.clone().expect("profile set with image");
        let overlay = Overlay::new(&self.config, &profile, &image, &recipe);
        let pkgman = EopkgManager::new(&overlay.mount_point, self.options.disable_colors);

        inner.pkgman = Some(Arc::new(Mutex::new(pkgman)));
        inner.death_point = Some(overlay.mount_point.clone());
        inner.overlay = Some(Arc::new(Mutex::new(overlay)));
        inner.recipe = Some(recipe);

        Ok(())
    }

    /// Override the tmpfs options for this session.
    pub fn set_tmpfs(&self, enable: bool, size: &str) {
        let mut inner = self.lock();
        if inner.cancelled {
            return;
        }

        inner.enable_tmpfs = enable;
        inner.tmpfs_size = size.trim().to_string();
    }

    /// Set the transit manifest target. An empty target means no manifest.
    pub fn set_manifest_target(&self, target: &str) {
        let mut inner = self.lock();
        let target = target.trim();

        inner.manifest_target = if target.is_empty() {
            None
        } else {
            Some(target.to_string())
        };
    }

    /// Watch for SIGINT/SIGTERM on a dedicated thread. Upon receipt the
    /// session is cancelled, the cleanup sequence runs to completion, and
    /// the process exits non-zero.
    pub fn install_signal_watcher(&self) -> Result<()> {
        let mut sigset = SigSet::empty();
        sigset.add(Signal::SIGINT);
        sigset.add(Signal::SIGTERM);

        // Block in this thread before any workers spawn, so delivery
        // happens via the watcher's sigwait alone.
        sigset.thread_block().map_err(Error::Namespace)?;

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            if sigset.wait().is_ok() {
                warn!("interrupted, cleaning up");
                inner.lock().expect("session lock poisoned").cancelled = true;
                cleanup_inner(&inner);
                error!("exiting due to interruption");
                std::process::exit(1);
            }
        });

        Ok(())
    }

    /// Run the cleanup sequence. Idempotent: at most one run per session
    /// does any work, and a session that never started does nothing.
    pub fn cleanup(&self) {
        cleanup_inner(&self.inner);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.lock().cancelled {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Acquire the lockfile guarding the given root path, remembering it
    /// for cleanup. Marks the session as started.
    fn acquire_lock(&self, path: &Path, op: &str) -> Result<()> {
        let mut lock = LockFile::new(path)?;

        if let Err(e) = lock.lock() {
            if let Error::OwnedLock {
                owner_pid,
                owner_process,
            } = &e
            {
                error!(op, path = %path.display(), process = %owner_process, pid = owner_pid,
                    "failed to lock root - another process is using it");
            } else {
                error!(op, path = %path.display(), err = %e, "failed to lock root");
            }
            return Err(e);
        }

        let mut inner = self.lock();
        inner.lockfile = Some(lock);
        inner.did_start = true;

        Ok(())
    }

    /// A cancelled session always reports Cancellation, whatever happened
    /// during teardown.
    fn finish(&self, result: Result<()>) -> Result<()> {
        self.cleanup();

        if self.lock().cancelled {
            return Err(Error::Cancelled);
        }

        result
    }

    /// Build the recipe associated with this session, handling all
    /// required cleanups on every exit path.
    pub fn build(&self) -> Result<()> {
        self.check_cancelled()?;

        {
            let inner = self.lock();
            if inner.recipe.is_none() {
                return Err(Error::NoRecipe);
            }

            if inner.enable_tmpfs && !valid_mem_size(&inner.tmpfs_size) {
                return Err(Error::InvalidMemSize(inner.tmpfs_size.clone()));
            }
        }

        sandbox::check_host_tools()?;

        // Fresh namespaces before any mount happens. The signal watcher
        // spawns afterwards so its thread shares them and teardown can see
        // every mount.
        sandbox::enter_namespace()?;
        self.install_signal_watcher()?;

        let result = self.build_steps();
        self.finish(result)
    }

    fn build_steps(&self) -> Result<()> {
        let (recipe, profile, image, overlay_ref, pkgman_ref, history, manifest_target) = {
            let inner = self.lock();
            (
                inner.recipe.clone().expect("checked in build"),
                inner.profile.clone().expect("profile set"),
                inner.image.clone().expect("image set"),
                Arc::clone(inner.overlay.as_ref().expect("overlay set")),
                Arc::clone(inner.pkgman.as_ref().expect("pkgman set")),
                inner.history.clone(),
                inner.manifest_target.clone(),
            )
        };

        let lock_path = {
            let overlay = overlay_ref.lock().expect("overlay lock poisoned");
            overlay.lock_path.clone()
        };
        self.acquire_lock(&lock_path, "building")?;

        debug!(name = %recipe.name, version = %recipe.version, release = recipe.release,
            profile = %profile.name, "building package");

        // Resolver over the profile's repository indices.
        self.check_cancelled()?;
        let deps = {
            let mut resolver = Resolver::new();
            resolver.add_profile_indices(&profile)?;
            debug!("successfully initialized resolver");

            let deps = resolver.query(&recipe.build_deps, true, true, recipe.emul32)?;
            self.lock().resolver = Some(resolver);
            deps
        };
        debug!(count = deps.len(), "calculated dependencies");

        // Materialize the dependency layer and attach it as the lower
        // composite of the build overlay.
        self.check_cancelled()?;
        let layer_ref = Arc::new(Mutex::new(Layer::new(deps, &image)));
        self.lock().layer = Some(Arc::clone(&layer_ref));

        let content_path = {
            let mut layer = layer_ref.lock().expect("layer lock poisoned");
            layer.request_overlay(&self.notifier(), &profile, self.options.disable_colors)?
        };

        let usr = UserInfo::discover();
        let env = if recipe.kind == RecipeType::Legacy {
            sane_environment("root", "/root", self.options.disable_colors)
        } else {
            sane_environment(
                crate::BUILD_USER,
                BUILD_USER_HOME,
                self.options.disable_colors,
            )
        };

        // Bring up the full overlay and its virtual filesystems.
        self.check_cancelled()?;
        {
            let mut overlay = overlay_ref.lock().expect("overlay lock poisoned");
            overlay.layer_dir = Some(content_path);
            let (enable_tmpfs, tmpfs_size) = {
                let inner = self.lock();
                (inner.enable_tmpfs, inner.tmpfs_size.clone())
            };
            overlay.enable_tmpfs = enable_tmpfs;
            overlay.tmpfs_size = tmpfs_size;

            overlay.clean_existing()?;
            overlay.mount()?;
            ensure_eopkg_layout(&overlay.mount_point)?;
            overlay.mount_vfs()?;
            add_build_user(&overlay.mount_point)?;
        }

        let notif = self.notifier();

        // Assets, changelog, and in-root preparation.
        {
            let overlay = overlay_ref.lock().expect("overlay lock poisoned");
            build::copy_assets(&recipe, history.as_deref(), &overlay)?;
        }

        self.check_cancelled()?;
        build::fetch_sources(&recipe)?;

        {
            let mut pkgman = pkgman_ref.lock().expect("pkgman lock poisoned");
            pkgman.init()?;
            debug!("starting D-BUS");
            pkgman.start_dbus(&notif)?;

            let mut overlay = overlay_ref.lock().expect("overlay lock poisoned");
            pkgman.configure_repos(&notif, &mut overlay, &profile)?;
        }

        {
            let overlay = overlay_ref.lock().expect("overlay lock poisoned");
            build::create_dirs(&recipe, &overlay)?;
        }

        if recipe.kind == RecipeType::Modern {
            {
                let overlay = overlay_ref.lock().expect("overlay lock poisoned");
                build::prep_modern(
                    &notif,
                    &recipe,
                    &usr,
                    &overlay,
                    &env,
                    self.options.disable_colors,
                )?;
            }

            {
                let mut pkgman = pkgman_ref.lock().expect("pkgman lock poisoned");
                debug!("stopping D-BUS");
                pkgman.stop_dbus()?;
            }

            // Networking comes down before sources are bound, unless the
            // recipe asked to keep it.
            self.check_cancelled()?;
            if !recipe.can_network {
                sandbox::drop_networking()?;
                let overlay = overlay_ref.lock().expect("overlay lock poisoned");
                overlay.configure_networking(&notif)?;
            } else {
                warn!("package has explicitly requested networking, sandboxing disabled");
            }

            {
                let mut overlay = overlay_ref.lock().expect("overlay lock poisoned");
                build::bind_sources(&recipe, &mut overlay)?;
                ensure_eopkg_layout(&overlay.mount_point)?;
                build::bind_caches(&recipe, &mut overlay)?;
            }

            {
                let pkgman = pkgman_ref.lock().expect("pkgman lock poisoned");
                pkgman.copy_assets()?;
            }

            let build_cmd = build::modern_build_command(
                &recipe,
                history.as_deref(),
                self.options.disable_colors,
            );
            let wrapped = self.options.executor.wrap(&build_cmd);

            self.check_cancelled()?;
            {
                let overlay = overlay_ref.lock().expect("overlay lock poisoned");

                if recipe.can_ccache {
                    sandbox::start_sccache(&notif, &overlay.mount_point, &env);
                }

                // rootlesskit user namespaces need subuid/subgid entries.
                let usermod = format!(
                    "touch /etc/sub{{g,u}}id && usermod --add-subuids 100000-165535 --add-subgids 100000-165535 {}",
                    crate::BUILD_USER
                );
                if let Err(e) =
                    sandbox::chroot_exec(&notif, &overlay.mount_point, &usermod, &env)
                {
                    error!(err = %e, user = crate::BUILD_USER,
                        "failed to ensure subuid/subgid files in chroot");
                }

                info!(package = %recipe.name, command = %wrapped, "now starting build");
                sandbox::chroot_exec(&notif, &overlay.mount_point, &wrapped, &env)?;

                if !self.options.disable_abi_report {
                    debug!("attempting to generate ABI report");
                    build::generate_abi_report(&notif, &recipe, &overlay, &env);
                }
            }
        } else {
            warn!("full sandboxing is not possible with legacy format");

            {
                let mut overlay = overlay_ref.lock().expect("overlay lock poisoned");
                build::bind_sources(&recipe, &mut overlay)?;
            }

            {
                let pkgman = pkgman_ref.lock().expect("pkgman lock poisoned");
                pkgman.copy_assets()?;
            }

            let build_cmd = build::legacy_build_command(&recipe, self.options.disable_colors);

            self.check_cancelled()?;
            {
                let overlay = overlay_ref.lock().expect("overlay lock poisoned");
                info!(package = %recipe.name, "now starting build");
                sandbox::chroot_exec(&notif, &overlay.mount_point, &build_cmd, &env)?;
            }

            let mut pkgman = pkgman_ref.lock().expect("pkgman lock poisoned");
            debug!("stopping D-BUS");
            pkgman.stop_dbus()?;
        }

        // Collect what the build produced back into the caller's CWD.
        {
            let overlay = overlay_ref.lock().expect("overlay lock poisoned");
            build::collect_assets(&recipe, &overlay, &usr, manifest_target.as_deref())?;
        }

        Ok(())
    }

    /// Enter the build environment with an interactive shell.
    pub fn chroot(&self) -> Result<()> {
        self.check_cancelled()?;

        let (recipe, overlay_ref) = {
            let inner = self.lock();
            let Some(recipe) = inner.recipe.clone() else {
                return Err(Error::NoRecipe);
            };
            (
                recipe,
                Arc::clone(inner.overlay.as_ref().expect("overlay set")),
            )
        };

        sandbox::enter_namespace()?;
        self.install_signal_watcher()?;

        let result = (|| -> Result<()> {
            let lock_path = overlay_ref
                .lock()
                .expect("overlay lock poisoned")
                .lock_path
                .clone();
            self.acquire_lock(&lock_path, "chroot")?;

            debug!(package = %recipe.name, version = %recipe.version, "beginning chroot");

            let env = if recipe.kind == RecipeType::Legacy {
                sane_environment("root", "/root", self.options.disable_colors)
            } else {
                sane_environment(
                    crate::BUILD_USER,
                    BUILD_USER_HOME,
                    self.options.disable_colors,
                )
            };

            {
                let mut overlay = overlay_ref.lock().expect("overlay lock poisoned");
                overlay.mount()?;
                ensure_eopkg_layout(&overlay.mount_point)?;
                overlay.mount_vfs()?;
                add_build_user(&overlay.mount_point)?;
            }

            let notif = self.notifier();

            if recipe.kind == RecipeType::Modern {
                if !recipe.can_network {
                    sandbox::drop_networking()?;
                    let overlay = overlay_ref.lock().expect("overlay lock poisoned");
                    overlay.configure_networking(&notif)?;
                } else {
                    warn!("package has explicitly requested networking, sandboxing disabled");
                }
            }

            debug!("spawning login shell");
            let overlay = overlay_ref.lock().expect("overlay lock poisoned");
            let login = format!("/bin/su - root -s {BUILD_USER_SHELL}");
            sandbox::chroot_exec_interactive(
                &notif,
                &overlay.mount_point,
                &login,
                BUILD_USER_HOME,
                &env,
            )
        })();

        self.finish(result)
    }

    /// Update the base image to the latest package versions.
    pub fn update(&self) -> Result<()> {
        self.check_cancelled()?;

        let image = {
            let mut inner = self.lock();
            let Some(image) = inner.image.clone() else {
                return Err(Error::InvalidProfile("no profile set".to_string()));
            };

            if !image.is_installed() {
                return Err(Error::ProfileNotInstalled(image.name.clone()));
            }

            inner.update_mode = true;
            inner.pkgman = Some(Arc::new(Mutex::new(EopkgManager::new(
                &image.root_dir,
                self.options.disable_colors,
            ))));

            image
        };

        sandbox::enter_namespace()?;
        self.install_signal_watcher()?;

        let result = (|| -> Result<()> {
            self.acquire_lock(&image.lock_path, "updating")?;

            let pkgman_ref = {
                let inner = self.lock();
                Arc::clone(inner.pkgman.as_ref().expect("pkgman set"))
            };

            let notif = self.notifier();
            let mut pkgman = pkgman_ref.lock().expect("pkgman lock poisoned");
            image.update(&notif, &mut pkgman)
        })();

        self.finish(result)
    }

    /// Index the given directory of packages inside the build root.
    pub fn index(&self, dir: &Path) -> Result<()> {
        self.check_cancelled()?;

        {
            let mut inner = self.lock();
            if inner.cancelled {
                return Err(Error::Cancelled);
            }

            if inner.recipe.is_none() {
                let Some(image) = inner.image.clone() else {
                    return Err(Error::InvalidProfile("no profile set".to_string()));
                };
                let profile = inner.profile.clone().expect("profile set with image");
                let recipe = index_recipe();
                let overlay = Overlay::new(&self.config, &profile, &image, &recipe);
                inner.pkgman = Some(Arc::new(Mutex::new(EopkgManager::new(
                    &overlay.mount_point,
                    self.options.disable_colors,
                ))));
                inner.death_point = Some(overlay.mount_point.clone());
                inner.overlay = Some(Arc::new(Mutex::new(overlay)));
                inner.recipe = Some(recipe);
            }

            if inner.enable_tmpfs && !valid_mem_size(&inner.tmpfs_size) {
                return Err(Error::InvalidMemSize(inner.tmpfs_size.clone()));
            }
        }

        sandbox::enter_namespace()?;
        self.install_signal_watcher()?;

        let result = self.index_steps(dir);
        self.finish(result)
    }

    fn index_steps(&self, dir: &Path) -> Result<()> {
        if !path_exists(dir) {
            error!(dir = %dir.display(), "directory does not exist");
            return Err(Error::Config(format!(
                "index directory does not exist: {}",
                dir.display()
            )));
        }

        let overlay_ref = {
            let inner = self.lock();
            Arc::clone(inner.overlay.as_ref().expect("overlay set"))
        };

        let lock_path = overlay_ref
            .lock()
            .expect("overlay lock poisoned")
            .lock_path
            .clone();
        self.acquire_lock(&lock_path, "indexing")?;

        let notif = self.notifier();
        let env = sane_environment("root", "/root", self.options.disable_colors);

        let mut overlay = overlay_ref.lock().expect("overlay lock poisoned");

        let (enable_tmpfs, tmpfs_size) = {
            let inner = self.lock();
            (inner.enable_tmpfs, inner.tmpfs_size.clone())
        };
        overlay.enable_tmpfs = enable_tmpfs;
        overlay.tmpfs_size = tmpfs_size;

        overlay.clean_existing()?;
        overlay.mount()?;
        ensure_eopkg_layout(&overlay.mount_point)?;
        overlay.mount_vfs()?;

        let target = overlay
            .mount_point
            .join(INDEX_BIND_TARGET.trim_start_matches('/'));
        fs::create_dir_all(&target)?;

        debug!(dir = %dir.display(), "bind mounting directory for indexing");
        overlay.bind_external(dir, &target, false)?;

        debug!("now indexing");
        let command = format!("cd {INDEX_BIND_TARGET}; eopkg.bin index --skip-signing .");
        sandbox::chroot_exec(&notif, &overlay.mount_point, &command, &env)
    }
}

/// The cleanup sequence. Runs at most once per started session; every step
/// logs failures and carries on.
///
/// The session lock is held only to snapshot state and claim the cleaned
/// flag. Subsystem locks are taken afterwards: the active child's PID
/// callback needs the session lock to drain, so holding it across the
/// kill-and-unmount sequence would deadlock against an exiting build.
fn cleanup_inner(inner: &Arc<Mutex<Inner>>) {
    debug!("acquiring session lock");

    let (pkgman, overlay, layer, mut lockfile, death_point, active_pid) = {
        let mut guard = inner.lock().expect("session lock poisoned");

        if !guard.did_start || guard.cleaned {
            return;
        }
        guard.cleaned = true;

        let death_point = if guard.update_mode {
            guard.image.as_ref().map(|i| i.root_dir.clone())
        } else {
            guard.death_point.clone()
        };

        let active_pid = guard.active_pid;
        guard.active_pid = 0;

        (
            guard.pkgman.clone(),
            guard.overlay.clone(),
            guard.layer.clone(),
            guard.lockfile.take(),
            death_point,
            active_pid,
        )
    };

    debug!("cleaning up");

    // Stop in-sandbox auxiliary services first. A pkgman still locked is
    // mid-operation; killing the active child below unwinds it.
    if let Some(pkgman) = &pkgman {
        if let Ok(mut pkgman) = pkgman.try_lock() {
            pkgman.cleanup();
        }
    }

    // Kill the active child's process group before touching mounts.
    if active_pid > 0 {
        sandbox::kill_process_group(active_pid);
    }

    // Something may still be alive in there.
    if let Some(point) = &death_point {
        for _ in 0..10 {
            let _ = sandbox::kill_subtree(point);
        }
    }

    if let Some(overlay) = &overlay {
        if let Ok(mut overlay) = overlay.lock() {
            if overlay.is_mounted() {
                if let Err(e) = overlay.unmount() {
                    error!(err = %e, "failure in unmounting overlay");
                }
            }
        }
    }

    // Deactivation may have woken something up, kill again.
    if let Some(point) = &death_point {
        let _ = sandbox::kill_subtree(point);
    }

    // Remove the layer if it never finished.
    if let Some(layer) = &layer {
        if let Ok(mut layer) = layer.lock() {
            if let Err(e) = layer.remove_if_not_created() {
                error!(err = %e, "failure in cleaning incomplete layer");
            }
        }
    }

    // Finally release and clean the lock files.
    if let Some(lockfile) = &mut lockfile {
        if let Err(e) = lockfile.unlock() {
            error!(err = %e, "failure in unlocking root");
        }

        if let Err(e) = lockfile.clean() {
            error!(err = %e, "failure in cleaning lockfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        Config {
            overlay_root_dir: tmp.path().display().to_string(),
            ..Config::default()
        }
    }

    fn write_profile(dir: &Path, name: &str) {
        fs::write(
            dir.join(format!("{name}.profile")),
            "image = \"main-x86_64\"\n",
        )
        .unwrap();
    }

    #[test]
    fn cancelled_session_refuses_operations() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new(test_config(&tmp), SessionOptions::default());

        session.cancel();
        assert!(session.is_cancelled());

        assert!(matches!(session.set_profile("x"), Err(Error::Cancelled)));
        assert!(matches!(session.build(), Err(Error::Cancelled)));
        assert!(matches!(session.chroot(), Err(Error::Cancelled)));
        assert!(matches!(session.update(), Err(Error::Cancelled)));
        assert!(matches!(session.index(Path::new("/")), Err(Error::Cancelled)));
    }

    #[test]
    fn double_profile_configuration_fails() {
        let tmp = TempDir::new().unwrap();
        write_profile(tmp.path(), "test");

        let session = Session::new(test_config(&tmp), SessionOptions::default());

        let profile = Profile::new_from_dirs("test", &[tmp.path()]).unwrap();
        {
            let mut inner = session.lock();
            inner.image = Some(BackingImage::new(&profile.image));
            inner.profile = Some(profile);
        }

        // A second initialisation must be rejected, with the unknown-name
        // error taking precedence when the profile cannot load at all.
        assert!(matches!(
            session.set_profile("test"),
            Err(Error::InvalidProfile(_))
        ));
    }

    #[test]
    fn build_without_recipe_fails() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new(test_config(&tmp), SessionOptions::default());

        assert!(matches!(session.build(), Err(Error::NoRecipe)));
    }

    #[test]
    fn invalid_tmpfs_size_is_rejected_at_build_time() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new(test_config(&tmp), SessionOptions::default());
        session.set_tmpfs(true, "8XYZ");

        {
            let mut inner = session.lock();
            inner.recipe = Some(index_recipe());
        }

        assert!(matches!(session.build(), Err(Error::InvalidMemSize(_))));
    }

    #[test]
    fn manifest_target_trims_to_none() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new(test_config(&tmp), SessionOptions::default());

        session.set_manifest_target("  ");
        assert!(session.lock().manifest_target.is_none());

        session.set_manifest_target("unstable");
        assert_eq!(session.lock().manifest_target.as_deref(), Some("unstable"));
    }

    #[test]
    fn cleanup_without_start_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new(test_config(&tmp), SessionOptions::default());

        session.cleanup();
        session.cleanup();
        assert!(!session.lock().cleaned);
    }

    #[test]
    fn cleanup_is_idempotent_after_start() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new(test_config(&tmp), SessionOptions::default());

        let lock_path = tmp.path().join("root.lock");
        session.acquire_lock(&lock_path, "testing").unwrap();
        assert!(session.lock().did_start);

        session.cleanup();
        assert!(session.lock().cleaned);
        // Lockfile released and removed.
        assert!(!lock_path.exists());

        // Second run finds nothing to do.
        session.cleanup();
    }

    #[test]
    fn lock_contention_reports_owner() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("contended.lock");

        let first = Session::new(test_config(&tmp), SessionOptions::default());
        first.acquire_lock(&lock_path, "building").unwrap();

        let second = Session::new(test_config(&tmp), SessionOptions::default());
        assert!(matches!(
            second.acquire_lock(&lock_path, "building"),
            Err(Error::OwnedLock { .. })
        ));

        first.cleanup();
    }

    #[test]
    fn pid_handle_publishes_under_the_lock() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new(test_config(&tmp), SessionOptions::default());

        let notifier = session.notifier();
        notifier.set_active_pid(1234);
        assert_eq!(session.lock().active_pid, 1234);

        notifier.set_active_pid(0);
        assert_eq!(session.lock().active_pid, 0);
    }
}
