//! Backing images: the immutable root filesystems underlying every overlay.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::overlay::mount_loop_image;
use crate::pkgmanager::{ensure_eopkg_layout, EopkgManager};
use crate::sandbox::{add_build_user, PidNotifier};
use crate::{
    path_exists, Result, IMAGES_DIR, IMAGE_BASE_URI, IMAGE_COMPRESSED_SUFFIX, IMAGE_ROOTS_DIR,
    IMAGE_SUFFIX,
};

/// The core of any given profile: an immutable, compressed disk image
/// distributed by the project, plus its decompressed form.
#[derive(Debug, Clone)]
pub struct BackingImage {
    /// Name of the profile this image backs.
    pub name: String,

    /// Absolute path to the decompressed .img file.
    pub image_path: PathBuf,

    /// Absolute path to the compressed .img.xz file.
    pub image_path_xz: PathBuf,

    /// URI of the image origin.
    pub image_uri: String,

    /// Where to mount the backing image for update operations.
    pub root_dir: PathBuf,

    /// Lock path for update operations.
    pub lock_path: PathBuf,
}

impl BackingImage {
    /// Return a correctly configured backing image for usage.
    pub fn new(name: &str) -> BackingImage {
        let images = Path::new(IMAGES_DIR);

        BackingImage {
            name: name.to_string(),
            image_path: images.join(format!("{name}{IMAGE_SUFFIX}")),
            image_path_xz: images.join(format!("{name}{IMAGE_COMPRESSED_SUFFIX}")),
            image_uri: format!("{IMAGE_BASE_URI}/{name}{IMAGE_COMPRESSED_SUFFIX}"),
            root_dir: Path::new(IMAGE_ROOTS_DIR).join(name),
            lock_path: images.join(format!("{name}.lock")),
        }
    }

    /// Whether the decompressed image has been installed to the global
    /// image directory.
    pub fn is_installed(&self) -> bool {
        path_exists(&self.image_path)
    }

    /// Whether the compressed image itself has been fetched.
    pub fn is_fetched(&self) -> bool {
        path_exists(&self.image_path_xz)
    }

    /// Update the backing image to the latest package versions in place.
    ///
    /// The image is loop-mounted read-write at the roots directory, the
    /// expected filesystem layout is asserted, /proc is brought up, and the
    /// in-sandbox package manager performs the upgrade.
    pub fn update(&self, notif: &dyn PidNotifier, pman: &mut EopkgManager) -> Result<()> {
        debug!(image = %self.name, "updating backing image");

        if !path_exists(&self.root_dir) {
            fs::create_dir_all(&self.root_dir)?;
            debug!(dir = %self.root_dir.display(), "created image root directory");
        }

        debug!(image = %self.image_path.display(), root = %self.root_dir.display(), "mounting rootfs");
        mount_loop_image(&self.image_path, &self.root_dir, false)?;

        ensure_eopkg_layout(&self.root_dir)?;

        // Package installs need /proc for their own tooling.
        let proc_point = self.root_dir.join("proc");
        fs::create_dir_all(&proc_point)?;
        crate::overlay::mount_proc(&proc_point)?;

        self.update_packages(notif, pman)?;

        add_build_user(&self.root_dir)?;

        info!(image = %self.name, "image successfully updated");

        Ok(())
    }

    fn update_packages(&self, notif: &dyn PidNotifier, pman: &mut EopkgManager) -> Result<()> {
        debug!("initialising package manager");
        pman.init()?;

        debug!("starting D-BUS");
        pman.start_dbus(notif)?;

        debug!("upgrading builder image");
        pman.upgrade(notif)?;

        debug!("asserting system.devel component");
        pman.install_component(notif, "system.devel")?;

        debug!("stopping D-BUS");
        pman.stop_dbus()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_derived_from_the_name() {
        let image = BackingImage::new("main-x86_64");

        assert_eq!(
            image.image_path,
            Path::new("/var/lib/solbuild/images/main-x86_64.img")
        );
        assert_eq!(
            image.image_path_xz,
            Path::new("/var/lib/solbuild/images/main-x86_64.img.xz")
        );
        assert_eq!(
            image.lock_path,
            Path::new("/var/lib/solbuild/images/main-x86_64.lock")
        );
        assert_eq!(image.root_dir, Path::new("/var/lib/solbuild/roots/main-x86_64"));
        assert_eq!(
            image.image_uri,
            "https://solbuild.getsol.us/main-x86_64.img.xz"
        );
    }
}
