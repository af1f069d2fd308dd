//! Overlay construction and mount lifecycle.
//!
//! An overlay is formed from a backing image and recipe combination. Using
//! it we bring up new temporary build roots with the overlayfs kernel
//! module. The mount lifecycle is strict:
//!
//! ```text
//! ensure_dirs -> mount (tmpfs? -> image -> union) -> mount_vfs -> work
//!                                  unmount runs strictly in reverse
//! ```
//!
//! Every successful `mount` must be matched by an `unmount` on every exit
//! path of the session, including signal-driven teardown.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{mount, umount, MsFlags};
use tracing::{debug, warn};

use crate::config::Config;
use crate::image::BackingImage;
use crate::profile::Profile;
use crate::recipe::Recipe;
use crate::{path_exists, Error, Result};

/// An overlay build root in some state of assembly.
#[derive(Debug)]
pub struct Overlay {
    /// The backing image mounted at `img`.
    pub back: BackingImage,

    /// Base directory containing the whole overlay.
    pub base_dir: PathBuf,

    /// overlayfs workdir.
    pub work_dir: PathBuf,

    /// Where real inode changes happen.
    pub upper_dir: PathBuf,

    /// Where the backing image is mounted read-only.
    pub img_dir: PathBuf,

    /// The union mount point.
    pub mount_point: PathBuf,

    /// Path to the lockfile for this overlay.
    pub lock_path: PathBuf,

    /// A cached dependency layer to composite under the upper dir.
    pub layer_dir: Option<PathBuf>,

    /// Whether to back the overlay with a tmpfs.
    pub enable_tmpfs: bool,

    /// Bounding size for the tmpfs, mount-style.
    pub tmpfs_size: String,

    /// Extra bind mounts to take care of when cleaning up.
    pub extra_mounts: Vec<PathBuf>,

    mounted_img: bool,
    mounted_overlay: bool,
    mounted_vfs: bool,
    mounted_tmpfs: bool,
}

impl Overlay {
    /// Create an overlay for a recipe build, rooted at
    /// `<overlay-root>/<profile>/<recipe-name>`.
    pub fn new(config: &Config, profile: &Profile, back: &BackingImage, recipe: &Recipe) -> Overlay {
        let base_dir = Path::new(&config.overlay_root_dir)
            .join(&profile.name)
            .join(&recipe.name);

        Self::at(base_dir, back)
    }

    /// Create an overlay rooted at an explicit base directory, used by the
    /// layer cache for dependency-building overlays.
    pub fn at(base_dir: PathBuf, back: &BackingImage) -> Overlay {
        // Appended, not with_extension: recipe names may contain dots.
        let lock_path = match base_dir.file_name() {
            Some(name) => {
                base_dir.with_file_name(format!("{}.lock", name.to_string_lossy()))
            }
            None => base_dir.with_extension("lock"),
        };

        Overlay {
            back: back.clone(),
            work_dir: base_dir.join("work"),
            upper_dir: base_dir.join("tmp"),
            img_dir: base_dir.join("img"),
            mount_point: base_dir.join("union"),
            lock_path,
            base_dir,
            layer_dir: None,
            enable_tmpfs: false,
            tmpfs_size: String::new(),
            extra_mounts: Vec::new(),
            mounted_img: false,
            mounted_overlay: false,
            mounted_vfs: false,
            mounted_tmpfs: false,
        }
    }

    /// Override the upper directory. The layer cache points it at the
    /// layer's `content` directory so the installed dependency tree becomes
    /// the cached artifact.
    pub fn with_upper(mut self, upper: PathBuf) -> Overlay {
        self.upper_dir = upper;
        self
    }

    /// Override the lock path, for overlays whose lock lives inside the
    /// base directory.
    pub fn with_lock_path(mut self, lock: PathBuf) -> Overlay {
        self.lock_path = lock;
        self
    }

    /// Make sure all directories are in place.
    pub fn ensure_dirs(&self) -> Result<()> {
        let paths = [
            &self.base_dir,
            &self.work_dir,
            &self.upper_dir,
            &self.img_dir,
            &self.mount_point,
        ];

        for path in paths {
            if path_exists(path) {
                continue;
            }
            debug!(dir = %path.display(), "creating overlay storage directory");
            fs::create_dir_all(path)?;
        }

        Ok(())
    }

    /// Purge an existing overlay workspace if present. Idempotent.
    pub fn clean_existing(&self) -> Result<()> {
        if !path_exists(&self.base_dir) {
            return Ok(());
        }
        debug!(dir = %self.base_dir.display(), "removing stale workspace");
        fs::remove_dir_all(&self.base_dir)?;
        Ok(())
    }

    /// Set up the overlayfs structure with lower and upper respected.
    pub fn mount(&mut self) -> Result<()> {
        debug!("mounting overlayfs");

        if self.enable_tmpfs {
            fs::create_dir_all(&self.base_dir)?;
            debug!(point = %self.base_dir.display(), size = %self.tmpfs_size, "mounting root tmpfs");

            let data = if self.tmpfs_size.is_empty() {
                None
            } else {
                Some(format!("size={}", self.tmpfs_size))
            };

            mount(
                Some("tmpfs-root"),
                &self.base_dir,
                Some("tmpfs"),
                MsFlags::MS_RELATIME,
                data.as_deref(),
            )
            .map_err(|errno| Error::Mount {
                target: self.base_dir.clone(),
                errno,
            })?;
            self.mounted_tmpfs = true;
        }

        self.ensure_dirs()?;

        debug!(image = %self.back.image_path.display(), "mounting backing image");
        mount_loop_image(&self.back.image_path, &self.img_dir, true)?;
        self.mounted_img = true;

        // Layer content sits over the raw image in the lower stack.
        let lowerdir = match &self.layer_dir {
            Some(layer) => format!("{}:{}", layer.display(), self.img_dir.display()),
            None => self.img_dir.display().to_string(),
        };

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdir,
            self.upper_dir.display(),
            self.work_dir.display()
        );

        debug!(options = %options, target = %self.mount_point.display(), "mounting overlayfs");

        mount(
            Some("overlay"),
            &self.mount_point,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|errno| Error::Mount {
            target: self.mount_point.clone(),
            errno,
        })?;
        self.mounted_overlay = true;

        Ok(())
    }

    /// Bring up the virtual filesystems within the build root.
    pub fn mount_vfs(&mut self) -> Result<()> {
        let dev = self.mount_point.join("dev");
        let pts = self.mount_point.join("dev/pts");
        let proc = self.mount_point.join("proc");
        let sys = self.mount_point.join("sys");
        let shm = self.mount_point.join("dev/shm");

        for point in [&dev, &pts, &proc, &sys, &shm] {
            if path_exists(point) {
                continue;
            }
            debug!(dir = %point.display(), "creating VFS directory");
            fs::create_dir_all(point)?;
        }

        debug!("mounting vfs /dev");
        mount(
            Some("devtmpfs"),
            &dev,
            Some("devtmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=755"),
        )
        .map_err(|errno| Error::Mount { target: dev, errno })?;
        self.mounted_vfs = true;

        debug!("mounting vfs /dev/pts");
        mount(
            Some("devpts"),
            &pts,
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("gid=5,mode=620"),
        )
        .map_err(|errno| Error::Mount { target: pts, errno })?;

        debug!("mounting vfs /proc");
        mount_proc(&proc)?;

        debug!("mounting vfs /sys");
        mount(
            Some("sysfs"),
            &sys,
            Some("sysfs"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|errno| Error::Mount { target: sys, errno })?;

        debug!("mounting vfs /dev/shm");
        mount(
            Some("tmpfs-shm"),
            &shm,
            Some("tmpfs"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|errno| Error::Mount { target: shm, errno })?;

        Ok(())
    }

    /// Bind an external path into the build root, tracking it for teardown.
    /// The target is recorded *before* the bind is attempted so a partial
    /// failure still unmounts correctly.
    pub fn bind_external(&mut self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        self.extra_mounts.push(target.to_path_buf());
        bind_mount(source, target, read_only)
    }

    /// Bring the loopback interface up inside the build root so localhost
    /// networking keeps working after network isolation.
    pub fn configure_networking(&self, notif: &dyn crate::sandbox::PidNotifier) -> Result<()> {
        debug!("configuring container networking");
        crate::sandbox::chroot_exec(
            notif,
            &self.mount_point,
            "/sbin/ip link set lo up",
            &crate::sandbox::sane_environment("root", "/root", true),
        )
    }

    /// Tear the overlay down again, in reverse mount order. Every unmount
    /// is attempted; the first failure is reported but never short-circuits
    /// the rest.
    pub fn unmount(&mut self) -> Result<()> {
        let mut first_err: Option<Error> = None;

        let mut record = |r: Result<()>| {
            if let Err(e) = r {
                warn!(err = %e, "unmount failure during teardown");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        for target in std::mem::take(&mut self.extra_mounts).iter().rev() {
            record(unmount_path(target));
        }

        if self.mounted_vfs {
            for rel in ["dev/pts", "dev/shm", "dev", "proc", "sys"] {
                record(unmount_path(&self.mount_point.join(rel)));
            }
            self.mounted_vfs = false;
        }

        if self.mounted_overlay {
            let r = unmount_path(&self.mount_point);
            if r.is_ok() {
                self.mounted_overlay = false;
            }
            record(r);
        }

        if self.mounted_img {
            let r = unmount_path(&self.img_dir);
            if r.is_ok() {
                self.mounted_img = false;
            }
            record(r);
        }

        if self.mounted_tmpfs {
            let r = unmount_path(&self.base_dir);
            if r.is_ok() {
                self.mounted_tmpfs = false;
            }
            record(r);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether any mount of this overlay is still active.
    pub fn is_mounted(&self) -> bool {
        self.mounted_img || self.mounted_overlay || self.mounted_vfs || self.mounted_tmpfs
    }
}

/// Loop-mount a disk image at the given directory.
///
/// Loop device setup is delegated to mount(8); the kernel autoclears the
/// device when the filesystem is unmounted.
pub fn mount_loop_image(image: &Path, target: &Path, read_only: bool) -> Result<()> {
    fs::create_dir_all(target)?;

    let options = if read_only { "ro,loop" } else { "loop" };

    let status = Command::new("mount")
        .arg("-o")
        .arg(options)
        .arg(image)
        .arg(target)
        .status()?;

    if !status.success() {
        return Err(Error::Mount {
            target: target.to_path_buf(),
            errno: nix::errno::Errno::EIO,
        });
    }

    Ok(())
}

/// Mount procfs at the given point with the standard hardening flags.
pub fn mount_proc(target: &Path) -> Result<()> {
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|errno| Error::Mount {
        target: target.to_path_buf(),
        errno,
    })
}

/// Bind-mount source onto target, creating the target first. Read-only
/// binds need a second remount pass; the kernel ignores MS_RDONLY on the
/// initial bind.
pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|errno| Error::Mount {
        target: target.to_path_buf(),
        errno,
    })?;

    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|errno| Error::Mount {
            target: target.to_path_buf(),
            errno,
        })?;
    }

    Ok(())
}

/// Unmount a single path.
pub fn unmount_path(target: &Path) -> Result<()> {
    umount(target).map_err(|errno| Error::Unmount {
        target: target.to_path_buf(),
        errno,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_overlay(tmp: &TempDir) -> Overlay {
        let back = BackingImage::new("main-x86_64");
        Overlay::at(tmp.path().join("main-x86_64/nano"), &back)
    }

    #[test]
    fn directory_layout_matches_convention() {
        let tmp = TempDir::new().unwrap();
        let overlay = test_overlay(&tmp);

        assert_eq!(overlay.work_dir, overlay.base_dir.join("work"));
        assert_eq!(overlay.upper_dir, overlay.base_dir.join("tmp"));
        assert_eq!(overlay.img_dir, overlay.base_dir.join("img"));
        assert_eq!(overlay.mount_point, overlay.base_dir.join("union"));
        assert_eq!(
            overlay.lock_path,
            tmp.path().join("main-x86_64/nano.lock")
        );
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let overlay = test_overlay(&tmp);

        overlay.ensure_dirs().unwrap();
        overlay.ensure_dirs().unwrap();

        assert!(overlay.work_dir.is_dir());
        assert!(overlay.upper_dir.is_dir());
        assert!(overlay.img_dir.is_dir());
        assert!(overlay.mount_point.is_dir());
    }

    #[test]
    fn clean_existing_removes_workspace() {
        let tmp = TempDir::new().unwrap();
        let overlay = test_overlay(&tmp);

        overlay.ensure_dirs().unwrap();
        overlay.clean_existing().unwrap();
        assert!(!overlay.base_dir.exists());

        // And again on a missing workspace.
        overlay.clean_existing().unwrap();
    }

    #[test]
    fn unmount_without_mounts_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let mut overlay = test_overlay(&tmp);

        assert!(!overlay.is_mounted());
        overlay.unmount().unwrap();
    }

    #[test]
    fn upper_override_for_layer_builds() {
        let tmp = TempDir::new().unwrap();
        let back = BackingImage::new("main-x86_64");
        let overlay = Overlay::at(tmp.path().join("layer"), &back)
            .with_upper(tmp.path().join("layer/content"))
            .with_lock_path(tmp.path().join("layer/lock"));

        assert_eq!(overlay.upper_dir, tmp.path().join("layer/content"));
        assert_eq!(overlay.lock_path, tmp.path().join("layer/lock"));
    }
}
