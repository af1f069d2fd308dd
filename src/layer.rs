//! The content-addressed dependency layer cache.
//!
//! A layer is a fully installed dependency tree keyed by the backing image
//! contents and the resolved dependency set. Builds with identical inputs
//! reuse the layer instead of reinstalling hundreds of packages; any change
//! to either input produces a different key and a fresh layer.
//!
//! Layout per layer: `<layers-root>/<key>/{content, work, img, union, lock}`
//! plus a `.complete` sentinel written only after every install step
//! succeeded. A layer without its sentinel is treated as invalid and
//! recreated from scratch.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::image::BackingImage;
use crate::lockfile::LockFile;
use crate::overlay::Overlay;
use crate::pkgmanager::EopkgManager;
use crate::profile::Profile;
use crate::resolver::Dep;
use crate::sandbox::PidNotifier;
use crate::source::simple::hash_file;
use crate::{path_exists, Error, Result, LAYERS_DIR, LAYERS_FAKE_HASH};

/// Sentinel file marking a fully created layer.
const COMPLETE_SENTINEL: &str = ".complete";

/// The canonical serialization hashed into a layer key.
#[derive(Debug, Serialize)]
struct LayerDescriptor<'a> {
    deps: &'a [Dep],
    image_hash: String,
}

/// A dependency layer in some state of existence.
#[derive(Debug)]
pub struct Layer {
    deps: Vec<Dep>,
    back: BackingImage,
    layers_root: PathBuf,
    created: bool,
    hash: Option<String>,
}

impl Layer {
    pub fn new(deps: Vec<Dep>, back: &BackingImage) -> Layer {
        Layer {
            deps,
            back: back.clone(),
            layers_root: PathBuf::from(LAYERS_DIR),
            created: false,
            hash: None,
        }
    }

    /// Redirect the layers root, for tests and alternate layouts.
    pub fn with_root(mut self, root: &Path) -> Layer {
        self.layers_root = root.to_path_buf();
        self
    }

    /// The deterministic key for this layer. Computed once; failure to
    /// hash the backing image is surfaced rather than guessed around, and
    /// only an unreadable *descriptor* degrades to the fake key.
    pub fn hash(&mut self) -> Result<String> {
        if let Some(hash) = &self.hash {
            return Ok(hash.clone());
        }

        if !path_exists(&self.back.image_path) {
            return Err(Error::Config(format!(
                "backing image doesn't exist at {}",
                self.back.image_path.display()
            )));
        }

        let image_hash = hash_file::<Sha256>(&self.back.image_path)?;

        let descriptor = LayerDescriptor {
            deps: &self.deps,
            image_hash,
        };

        let hash = match serde_json::to_vec(&descriptor) {
            Ok(bytes) => {
                let digest = Sha256::digest(&bytes);
                digest.iter().map(|b| format!("{b:02x}")).collect()
            }
            Err(_) => LAYERS_FAKE_HASH.to_string(),
        };

        self.hash = Some(hash.clone());
        Ok(hash)
    }

    /// Directory holding everything belonging to this layer.
    pub fn base_path(&mut self) -> Result<PathBuf> {
        let hash = self.hash()?;
        Ok(self.layers_root.join(hash))
    }

    /// Path of the realized dependency tree.
    pub fn content_path(&mut self) -> Result<PathBuf> {
        Ok(self.base_path()?.join("content"))
    }

    /// Whether this layer is committed: content present *and* the
    /// completion sentinel in place.
    pub fn is_committed(&mut self) -> Result<bool> {
        let base = self.base_path()?;
        Ok(path_exists(base.join("content")) && path_exists(base.join(COMPLETE_SENTINEL)))
    }

    /// Return the content path for this layer, creating the layer first if
    /// it is absent, unfinished, or keyed by the fake hash.
    ///
    /// Creation is serialized across processes by a lock adjacent to the
    /// layer directory, so at most one creator wins per key per host.
    pub fn request_overlay(
        &mut self,
        notif: &dyn PidNotifier,
        profile: &Profile,
        disable_colors: bool,
    ) -> Result<PathBuf> {
        let hash = self.hash()?;
        let content = self.content_path()?;

        if self.is_committed()? && hash != LAYERS_FAKE_HASH {
            info!(hash = %hash, "reusing layer");
            self.created = true;
            return Ok(content);
        }

        if path_exists(self.base_path()?) && !self.is_committed()? {
            debug!(hash = %hash, "layer missing completion sentinel, recreating");
        }

        info!(hash = %hash, "creating layer");
        self.create(notif, profile, disable_colors)
    }

    /// Remove the layer directory unless it was fully created. Safe to call
    /// on every teardown path.
    pub fn remove_if_not_created(&mut self) -> Result<()> {
        if self.created {
            return Ok(());
        }

        let base = self.base_path()?;
        debug!(path = %base.display(), "layer not fully created, removing");

        if path_exists(&base) {
            fs::remove_dir_all(&base)?;
        }

        Ok(())
    }

    fn create(
        &mut self,
        notif: &dyn PidNotifier,
        profile: &Profile,
        disable_colors: bool,
    ) -> Result<PathBuf> {
        let base = self.base_path()?;
        let content = self.content_path()?;

        fs::create_dir_all(&self.layers_root)?;

        // Serialize creators racing on the same key.
        let hash = self.hash()?;
        let lock_path = self.layers_root.join(format!("{}.lock", hash));
        let mut lock = LockFile::new(&lock_path)?;
        lock.lock()?;

        // Another creator may have won while we waited on the lock.
        if self.is_committed()? && self.hash()? != LAYERS_FAKE_HASH {
            self.created = true;
            lock.unlock()?;
            return Ok(content);
        }

        let result = self.populate(notif, profile, disable_colors, &base, &content);

        if let Err(e) = &result {
            debug!(err = %e, path = %base.display(), "layer creation failed, removing partial directory");
            let _ = fs::remove_dir_all(&base);
        }

        lock.unlock()?;
        lock.clean()?;

        result?;

        self.created = true;
        Ok(content)
    }

    /// Build the dependency tree: bring up a dedicated overlay whose upper
    /// directory *is* the layer content, then install everything through
    /// the in-sandbox package manager.
    fn populate(
        &mut self,
        notif: &dyn PidNotifier,
        profile: &Profile,
        disable_colors: bool,
        base: &Path,
        _content: &Path,
    ) -> Result<()> {
        let mut overlay = Overlay::at(base.to_path_buf(), &self.back)
            .with_upper(base.join("content"))
            .with_lock_path(base.join("lock"));

        overlay.clean_existing()?;
        overlay.ensure_dirs()?;

        if let Err(e) = overlay.mount() {
            let _ = overlay.unmount();
            return Err(e);
        }

        let result = self.populate_mounted(notif, profile, disable_colors, &mut overlay);

        // The overlay always comes down, even when installation failed.
        let unmount = overlay.unmount();

        result?;
        unmount?;

        fs::write(base.join(COMPLETE_SENTINEL), b"")?;

        Ok(())
    }

    fn populate_mounted(
        &mut self,
        notif: &dyn PidNotifier,
        profile: &Profile,
        disable_colors: bool,
        overlay: &mut Overlay,
    ) -> Result<()> {
        crate::pkgmanager::ensure_eopkg_layout(&overlay.mount_point)?;
        overlay.mount_vfs()?;

        let mut pman = EopkgManager::new(&overlay.mount_point, disable_colors);

        let result = (|| -> Result<()> {
            pman.init()?;

            debug!("starting D-BUS");
            pman.start_dbus(notif)?;

            pman.configure_repos(notif, overlay, profile)?;

            debug!("upgrading system base and other core packages");
            pman.upgrade(notif)?;

            debug!("asserting system.devel component installation");
            pman.install_component(notif, "system.devel")?;

            let packages: Vec<String> = self.deps.iter().map(|d| d.name.clone()).collect();
            debug!(count = packages.len(), "installing dependencies");
            pman.install_packages(notif, &packages)?;

            notif.set_active_pid(0);
            Ok(())
        })();

        pman.cleanup();

        result
    }
}
