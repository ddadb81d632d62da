//! `DIR[::ENV]` root directory arguments.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

const ENV_SEPARATOR: &str = "::";

/// Split `arg` into an absolute directory and an optional workspace
/// override. The directory must exist.
pub fn parse_root_dir(arg: &str) -> Result<(PathBuf, Option<String>)> {
    if arg.is_empty() {
        bail!("root directory argument is empty");
    }
    let (dir, env) = match arg.split_once(ENV_SEPARATOR) {
        Some((dir, env)) => (dir, Some(env).filter(|e| !e.is_empty()).map(str::to_string)),
        None => (arg, None),
    };
    let dir = if dir.is_empty() { "." } else { dir };

    let path = PathBuf::from(dir);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .context("failed to read the current directory")?
            .join(path)
    };

    let meta = std::fs::metadata(&path).with_context(|| format!("root directory {}", path.display()))?;
    if !meta.is_dir() {
        bail!("root directory {} is not a directory", path.display());
    }
    Ok((path, env))
}
