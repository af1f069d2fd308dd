//! Namespace isolation and the chroot executor.
//!
//! Everything executed inside a build root goes through this module: the
//! namespaces are unshared up front, commands run under chroot(1) in a new
//! session with a sanitized environment, and the active child PID is
//! published through the narrow [`PidNotifier`] capability so the session
//! can signal the whole process group during teardown.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use tracing::{debug, error, warn};

use crate::{
    path_exists, Error, Result, BUILD_USER, BUILD_USER_GECOS, BUILD_USER_GID, BUILD_USER_HOME,
    BUILD_USER_ID, BUILD_USER_SHELL,
};

/// Receives the PID of the currently blocking child process, so that
/// signal-directed cleanup can target the right process group.
pub trait PidNotifier: Send + Sync {
    fn set_active_pid(&self, pid: i32);
}

/// Enter new mount and IPC namespaces for the whole process.
pub fn enter_namespace() -> Result<()> {
    debug!("configuring container namespace");

    unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC).map_err(Error::Namespace)?;

    Ok(())
}

/// Additionally enter new network and UTS namespaces. The caller is
/// expected to bring loopback up inside the sandbox afterwards.
pub fn drop_networking() -> Result<()> {
    debug!("dropping container networking");

    unshare(CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWUTS).map_err(Error::Namespace)?;

    Ok(())
}

/// Generate a clean environment for chroot'd processes.
///
/// Only the enumerated variables exist inside the sandbox; proxy settings
/// and TERM pass through from the host when present. With colors disabled
/// TERM is forced to `dumb`.
pub fn sane_environment(username: &str, home: &str, disable_colors: bool) -> Vec<(String, String)> {
    let mut environment: Vec<(String, String)> = vec![
        ("PATH".into(), "/usr/bin:/usr/sbin:/bin/:/sbin".into()),
        ("LANG".into(), "en_US.UTF-8".into()),
        ("LC_ALL".into(), "en_US.UTF-8".into()),
        ("HOME".into(), home.into()),
        ("USER".into(), username.into()),
        ("USERNAME".into(), username.into()),
        (
            "CCACHE_DIR".into(),
            format!("{BUILD_USER_HOME}/.ccache"),
        ),
        (
            "SCCACHE_DIR".into(),
            format!("{BUILD_USER_HOME}/.cache/sccache"),
        ),
    ];

    let mut permitted = vec!["http_proxy", "https_proxy", "no_proxy", "ftp_proxy"];
    if !disable_colors {
        permitted.push("TERM");
    }

    for name in permitted {
        let value = std::env::var(name)
            .or_else(|_| std::env::var(name.to_uppercase()))
            .unwrap_or_default();

        if value.is_empty() {
            continue;
        }

        environment.push((name.into(), value));
    }

    if disable_colors {
        environment.push(("TERM".into(), "dumb".into()));
    }

    environment
}

/// Run a shell command inside the given root via chroot(1).
///
/// The child starts in a new session so the entire process group can be
/// signalled; its PID is published through `notif` before waiting.
pub fn chroot_exec(
    notif: &dyn PidNotifier,
    root: &Path,
    command: &str,
    env: &[(String, String)],
) -> Result<()> {
    debug!(dir = %root.display(), command, "executing in chroot");

    let mut cmd = Command::new("chroot");
    cmd.arg(root)
        .arg("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    unsafe {
        cmd.pre_exec(|| setsid().map(|_| ()).map_err(std::io::Error::from));
    }

    let mut child = cmd.spawn()?;
    notif.set_active_pid(child.id() as i32);

    let status = child.wait()?;
    notif.set_active_pid(0);

    if !status.success() {
        return Err(Error::CommandFailed {
            command: command.to_string(),
            status: status.code().unwrap_or(-1),
        });
    }

    Ok(())
}

/// Variant of [`chroot_exec`] keeping the controlling TTY attached, for
/// interactive chroot shells.
pub fn chroot_exec_interactive(
    notif: &dyn PidNotifier,
    root: &Path,
    command: &str,
    workdir: &str,
    env: &[(String, String)],
) -> Result<()> {
    debug!(dir = %root.display(), command, "spawning interactive chroot");

    let mut cmd = Command::new("chroot");
    cmd.arg(root)
        .arg("/bin/sh")
        .arg("-c")
        .arg(format!("cd {workdir} && {command}"))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut child = cmd.spawn()?;
    notif.set_active_pid(child.id() as i32);

    let status = child.wait()?;
    notif.set_active_pid(0);

    if !status.success() {
        return Err(Error::CommandFailed {
            command: command.to_string(),
            status: status.code().unwrap_or(-1),
        });
    }

    Ok(())
}

/// Find all processes whose working directory resolves under the given
/// root and kill them: SIGTERM first, SIGKILL ~400ms later for survivors.
pub fn kill_subtree(root: &Path) -> Result<()> {
    let root = fs::canonicalize(root)?;

    let victims = processes_under(&root)?;
    if victims.is_empty() {
        return Ok(());
    }

    for pid in &victims {
        debug!(pid, "terminating child process in chroot");
        if let Err(e) = kill(Pid::from_raw(*pid), Signal::SIGTERM) {
            warn!(pid, err = %e, "error terminating process");
        }
    }

    thread::sleep(Duration::from_millis(400));

    for pid in processes_under(&root)? {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
            error!(pid, err = %e, "error killing (-9) process");
        }
    }

    Ok(())
}

fn processes_under(root: &Path) -> Result<Vec<i32>> {
    let mut out = Vec::new();

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };

        let Ok(cwd) = fs::read_link(entry.path().join("cwd")) else {
            continue;
        };

        if cwd.starts_with(root) {
            out.push(pid);
        }
    }

    Ok(out)
}

/// Kill the process group of the given PID with SIGKILL, twice, with a
/// settling pause between rounds. Used against the active build child.
pub fn kill_process_group(pid: i32) {
    if pid <= 0 {
        return;
    }

    let group = Pid::from_raw(-pid);
    let _ = kill(group, Signal::SIGKILL);
    thread::sleep(Duration::from_secs(2));
    let _ = kill(group, Signal::SIGKILL);
}

/// Start an sccache server inside the root, detached from our lifetime.
pub fn start_sccache(notif: &dyn PidNotifier, root: &Path, env: &[(String, String)]) {
    debug!("starting sccache server");

    let mut full_env = env.to_vec();
    full_env.push(("SCCACHE_IDLE_TIMEOUT".into(), "0".into()));

    if let Err(e) = chroot_exec(
        notif,
        root,
        "/bin/su root -c 'sccache --start-server'",
        &full_env,
    ) {
        warn!(err = %e, "unable to start sccache server");
    }
}

/// Add the build user and group to the root filesystem if they are not
/// already present.
pub fn add_build_user(root: &Path) -> Result<()> {
    let etc = root.join("etc");
    let passwd_path = etc.join("passwd");

    let passwd = fs::read_to_string(&passwd_path)?;
    let exists = passwd
        .lines()
        .any(|line| line.split(':').next() == Some(BUILD_USER));
    if exists {
        return Ok(());
    }

    debug!(
        user = BUILD_USER,
        uid = BUILD_USER_ID,
        gid = BUILD_USER_GID,
        home = BUILD_USER_HOME,
        "adding build user to system"
    );

    append_line(
        &etc.join("group"),
        &format!("{BUILD_USER}:x:{BUILD_USER_GID}:"),
    )?;
    append_line(
        &passwd_path,
        &format!(
            "{BUILD_USER}:x:{BUILD_USER_ID}:{BUILD_USER_GID}:{BUILD_USER_GECOS}:{BUILD_USER_HOME}:{BUILD_USER_SHELL}"
        ),
    )?;

    let shadow = etc.join("shadow");
    if path_exists(&shadow) {
        append_line(&shadow, &format!("{BUILD_USER}:!:::::::"))?;
    }

    let home = root.join(BUILD_USER_HOME.trim_start_matches('/'));
    fs::create_dir_all(&home)?;

    Ok(())
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// The pluggable command template executing recipe builds inside the
/// sandbox, resolved from configuration rather than hard-coded.
#[derive(Debug, Clone)]
pub struct ExecutorTemplate {
    /// Wrapper around the build command, e.g. `fakeroot` or `rootlesskit`.
    pub wrapper: String,
}

impl Default for ExecutorTemplate {
    fn default() -> Self {
        ExecutorTemplate {
            wrapper: "rootlesskit".to_string(),
        }
    }
}

impl ExecutorTemplate {
    /// Wrap a build command line for in-sandbox execution.
    pub fn wrap(&self, command: &str) -> String {
        if self.wrapper.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", self.wrapper, command)
        }
    }
}

/// Resolve the full path of a host tool, erroring early with the tool name
/// when missing.
pub fn require_tool(name: &str) -> Result<PathBuf> {
    which::which(name)
        .map_err(|_| Error::Config(format!("required host tool '{name}' not found in PATH")))
}

/// Host tools every session needs before any real work starts. Checking
/// up front beats a cryptic failure halfway through a mounted build root.
pub const REQUIRED_TOOLS: &[&str] = &["chroot", "git", "mount"];

/// Verify all required host tools resolve.
pub fn check_host_tools() -> Result<()> {
    for tool in REQUIRED_TOOLS {
        require_tool(tool)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct RecordingNotifier(AtomicI32);

    impl PidNotifier for RecordingNotifier {
        fn set_active_pid(&self, pid: i32) {
            self.0.store(pid, Ordering::SeqCst);
        }
    }

    #[test]
    fn sane_environment_is_a_closed_set() {
        let env = sane_environment("build", "/home/build", true);
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();

        assert!(keys.contains(&"PATH"));
        assert!(keys.contains(&"LANG"));
        assert!(keys.contains(&"LC_ALL"));
        assert!(keys.contains(&"HOME"));
        assert!(keys.contains(&"USER"));
        assert!(keys.contains(&"USERNAME"));
        assert!(keys.contains(&"CCACHE_DIR"));
        assert!(keys.contains(&"SCCACHE_DIR"));

        // Nothing else beyond the permitted pass-throughs.
        for (key, _) in &env {
            assert!(
                [
                    "PATH",
                    "LANG",
                    "LC_ALL",
                    "HOME",
                    "USER",
                    "USERNAME",
                    "CCACHE_DIR",
                    "SCCACHE_DIR",
                    "http_proxy",
                    "https_proxy",
                    "no_proxy",
                    "ftp_proxy",
                    "TERM",
                ]
                .contains(&key.as_str()),
                "unexpected env var {key}"
            );
        }
    }

    #[test]
    fn colors_disabled_forces_dumb_term() {
        let env = sane_environment("root", "/root", true);
        let term = env.iter().find(|(k, _)| k == "TERM").unwrap();
        assert_eq!(term.1, "dumb");
    }

    #[test]
    fn user_details_propagate() {
        let env = sane_environment("build", "/home/build", true);
        let lookup = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(lookup("HOME"), "/home/build");
        assert_eq!(lookup("USER"), "build");
        assert_eq!(lookup("USERNAME"), "build");
    }

    #[test]
    fn add_build_user_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let etc = tmp.path().join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("passwd"), "root:x:0:0:root:/root:/bin/bash\n").unwrap();
        fs::write(etc.join("group"), "root:x:0:\n").unwrap();

        add_build_user(tmp.path()).unwrap();
        add_build_user(tmp.path()).unwrap();

        let passwd = fs::read_to_string(etc.join("passwd")).unwrap();
        assert_eq!(passwd.matches("build:x:1000:1000").count(), 1);

        let group = fs::read_to_string(etc.join("group")).unwrap();
        assert!(group.contains("build:x:1000:"));
        assert!(tmp.path().join("home/build").is_dir());
    }

    #[test]
    fn executor_template_wraps_commands() {
        let rootless = ExecutorTemplate::default();
        assert_eq!(rootless.wrap("ypkg-build x"), "rootlesskit ypkg-build x");

        let bare = ExecutorTemplate {
            wrapper: String::new(),
        };
        assert_eq!(bare.wrap("ypkg-build x"), "ypkg-build x");
    }

    #[test]
    fn processes_under_finds_ourselves() {
        let cwd = std::env::current_dir().unwrap();
        let pids = processes_under(&fs::canonicalize(&cwd).unwrap()).unwrap();
        assert!(pids.contains(&(std::process::id() as i32)));
    }

    #[test]
    fn notifier_records_pids() {
        let notifier = RecordingNotifier(AtomicI32::new(-1));
        notifier.set_active_pid(42);
        assert_eq!(notifier.0.load(Ordering::SeqCst), 42);
    }
}
