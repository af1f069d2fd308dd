use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use solbuild::config::Config;
use solbuild::recipe::Recipe;
use solbuild::session::{Session, SessionOptions};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  solbuild build [package.yml|pspec.xml] [-p profile] [-t target] [-m] [-n]\n  solbuild chroot [package.yml|pspec.xml] [-p profile] [-n]\n  solbuild update [-p profile] [-n]\n  solbuild index [directory] [-p profile] [-n]\n  solbuild delete-cache [-a] [-n]\n  solbuild version"
}

#[derive(Debug, Default)]
struct Args {
    command: String,
    positional: Vec<String>,
    profile: String,
    manifest_target: String,
    tmpfs: bool,
    no_color: bool,
    all_caches: bool,
}

fn parse_args(raw: Vec<String>) -> Option<Args> {
    let mut args = Args::default();
    let mut iter = raw.into_iter();

    args.command = iter.next()?;

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-p" | "--profile" => args.profile = iter.next()?,
            "-t" | "--transit-manifest" => args.manifest_target = iter.next()?,
            "-m" | "--tmpfs" => args.tmpfs = true,
            "-n" | "--no-color" => args.no_color = true,
            "-a" | "--all" => args.all_caches = true,
            other if !other.starts_with('-') => args.positional.push(other.to_string()),
            _ => return None,
        }
    }

    Some(args)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "solbuild=info".into()),
        )
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();

    let Some(args) = parse_args(raw) else {
        eprintln!("{}", usage());
        return ExitCode::FAILURE;
    };

    let result = match args.command.as_str() {
        "build" => run_build(&args),
        "chroot" => run_chroot(&args),
        "update" => run_update(&args),
        "index" => run_index(&args),
        "delete-cache" => run_delete_cache(&args),
        "version" => {
            println!("solbuild {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        _ => {
            eprintln!("{}", usage());
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(err = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn recipe_path(args: &Args) -> PathBuf {
    args.positional
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("package.yml"))
}

fn new_session(args: &Args) -> Result<Session> {
    let config = Config::load().context("loading solbuild configuration")?;
    let options = SessionOptions {
        disable_colors: args.no_color,
        ..SessionOptions::default()
    };

    let session = Session::new(config, options);
    session
        .set_profile(&args.profile)
        .context("initialising profile")?;

    Ok(session)
}

fn run_build(args: &Args) -> Result<()> {
    let session = new_session(args)?;

    let path = recipe_path(args);
    let recipe = Recipe::from_path(&path)
        .with_context(|| format!("parsing recipe '{}'", path.display()))?;
    session.set_recipe(recipe)?;

    if args.tmpfs {
        let size = session.config.tmpfs_size.clone();
        session.set_tmpfs(true, &size);
    }
    session.set_manifest_target(&args.manifest_target);

    session.build()?;
    Ok(())
}

fn run_chroot(args: &Args) -> Result<()> {
    let session = new_session(args)?;

    let path = recipe_path(args);
    let recipe = Recipe::from_path(&path)
        .with_context(|| format!("parsing recipe '{}'", path.display()))?;
    session.set_recipe(recipe)?;

    session.chroot()?;
    Ok(())
}

fn run_update(args: &Args) -> Result<()> {
    let session = new_session(args)?;
    session.update()?;
    Ok(())
}

fn run_index(args: &Args) -> Result<()> {
    let session = new_session(args)?;

    let dir = args
        .positional
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    session.index(&dir)?;
    Ok(())
}

/// Remove cached state: overlay workspaces always, plus layers, sources and
/// compiler caches with `-a`.
fn run_delete_cache(args: &Args) -> Result<()> {
    let config = Config::load().context("loading solbuild configuration")?;

    let mut victims: Vec<PathBuf> = vec![PathBuf::from(&config.overlay_root_dir)];

    if args.all_caches {
        victims.push(PathBuf::from(solbuild::LAYERS_DIR));
        victims.push(PathBuf::from(solbuild::SOURCE_DIR));
        victims.push(PathBuf::from(solbuild::CACHE_DIR));
        victims.push(PathBuf::from(solbuild::PACKAGE_CACHE_DIR));
    }

    for dir in victims {
        if !solbuild::path_exists(&dir) {
            continue;
        }

        // Never follow a cache root that is itself a symlink.
        if dir.is_symlink() {
            bail!("refusing to delete symlinked cache dir {}", dir.display());
        }

        println!("Removing {}", dir.display());
        remove_contents(&dir)
            .with_context(|| format!("emptying cache dir '{}'", dir.display()))?;
    }

    Ok(())
}

fn remove_contents(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }

    Ok(())
}
