use std::ffi::OsString;
use std::io::{BufRead, Write};
use std::path::Path;
use std::process::Command;

use thiserror::Error;

use crate::cleanup::ChildRegistration;
use crate::config::LauncherConfig;
use crate::paths::ResolvedPaths;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("lost track of {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

/// Environment handed to calibre, built once from the settled paths.
/// Passthrough variables come first so the launcher's own values win.
pub fn build_launch_env(paths: &ResolvedPaths, config: &LauncherConfig) -> Vec<(String, OsString)> {
    let mut env: Vec<(String, OsString)> = config
        .passthrough
        .iter()
        .map(|(k, v)| (k.clone(), OsString::from(v)))
        .collect();

    let mut set = |key: &str, value: OsString| {
        env.retain(|(k, _)| k != key);
        env.push((key.to_string(), value));
    };

    if let Some(dir) = &paths.config_dir {
        set("CALIBRE_CONFIG_DIRECTORY", dir.clone().into_os_string());
    }
    if let Some(dir) = &paths.temp_dir {
        set("CALIBRE_TEMP_DIR", dir.clone().into_os_string());
    }
    if let Some(dir) = &paths.cache_dir {
        set("CALIBRE_CACHE_DIRECTORY", dir.clone().into_os_string());
    }
    if let Some(lang) = &config.override_lang {
        set("CALIBRE_OVERRIDE_LANG", OsString::from(lang));
    }
    if let Some(dir) = &paths.metadata_dir {
        set(
            "CALIBRE_OVERRIDE_DATABASE_PATH",
            dir.join("metadata.db").into_os_string(),
        );
    }
    if let Some(dir) = &paths.src_dir {
        set("CALIBRE_DEVELOP_FROM", dir.join("src").into_os_string());
    }
    env
}

/// Only an explicit "n" or "no" (any case) declines.
pub fn is_abort_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no")
}

/// Ask before starting. Returns false when the user declines; EOF counts as yes.
pub fn confirm_start<R: BufRead, W: Write>(mut input: R, mut output: W) -> std::io::Result<bool> {
    write!(output, "Start calibre now? [Y/n] ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(!is_abort_answer(&answer))
}

pub fn launch_command(program: &Path, library: Option<&Path>, env: &[(String, OsString)]) -> Command {
    let mut cmd = Command::new(program);
    if let Some(library) = library {
        cmd.arg("--with-library").arg(library);
    }
    cmd.envs(env.iter().map(|(k, v)| (k, v)));
    cmd
}

/// Start calibre and wait for it. The launcher stays alive so cleanup can
/// run afterwards; the child's exit status is passed through (128 + signal
/// for a signal death). Signals reaching the launcher meanwhile are forwarded
/// to calibre.
pub fn run_calibre(mut cmd: Command) -> Result<i32, LaunchError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    tracing::info!(%program, "starting calibre");
    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        program: program.clone(),
        source,
    })?;
    let registration = ChildRegistration::new(child.id());
    let status = child
        .wait()
        .map_err(|source| LaunchError::Wait { program, source })?;
    drop(registration);

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Ok(128 + sig);
        }
    }
    Ok(status.code().unwrap_or(1))
}
