//! Exit-time cleanup of the portable directories.
//!
//! The pending [`CleanupPlan`] sits in a global slot. Whoever gets there first
//! takes it and runs it: the [`CleanupGuard`] drop, an explicit
//! [`run_pending`] before `process::exit`, or the signal thread. The plan runs
//! while the slot is locked, so a late signal waits for a cleanup in progress
//! instead of exiting under it.
//!
//! While calibre runs, its PID is registered here. A signal is then forwarded
//! to calibre and the launcher keeps waiting; cleanup happens after calibre
//! has exited and `wait()` has returned.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::config::{LauncherConfig, Platform};
use crate::paths::{app_dir_for, ResolvedPaths};

static PENDING: OnceLock<Arc<Mutex<Option<CleanupPlan>>>> = OnceLock::new();

/// PID of the running calibre child, if any.
static RUNNING_CHILD: Mutex<Option<u32>> = Mutex::new(None);

/// Serializes tests that touch the global slot or the child registry.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

fn slot() -> Arc<Mutex<Option<CleanupPlan>>> {
    PENDING
        .get_or_init(|| Arc::new(Mutex::new(None)))
        .clone()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Directories to open up for other users and the temp tree to delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupPlan {
    relax: Vec<PathBuf>,
    temp_dir: Option<PathBuf>,
}

impl CleanupPlan {
    /// Locations known before any directory is resolved (used by the upgrade flow).
    pub fn for_config(config: &LauncherConfig) -> Self {
        let mut plan = CleanupPlan::default();
        plan.add(&config.config_dir);
        plan.add(&config.metadata_dir);
        plan.add(&config.src_dir);
        if let (Platform::MacOs, Some(bin)) = (config.platform, &config.bin_dir) {
            plan.add(&app_dir_for(bin));
        }
        plan
    }

    /// Fold in what the resolver settled on, including the temp dir.
    pub fn absorb(&mut self, paths: &ResolvedPaths) {
        for dir in [
            &paths.config_dir,
            &paths.library_dir,
            &paths.metadata_dir,
            &paths.src_dir,
            &paths.app_dir,
        ]
        .into_iter()
        .flatten()
        {
            self.add(dir);
        }
        if paths.temp_dir.is_some() {
            self.temp_dir = paths.temp_dir.clone();
        }
    }

    fn add(&mut self, dir: &Path) {
        if !self.relax.iter().any(|d| d == dir) {
            self.relax.push(dir.to_path_buf());
        }
    }

    /// Best effort: every error is ignored.
    pub fn run(&self) {
        for dir in &self.relax {
            if dir.is_dir() {
                tracing::debug!(dir = %dir.display(), "relaxing permissions");
                relax_permissions(dir);
            }
        }
        if let Some(temp) = &self.temp_dir {
            tracing::debug!(dir = %temp.display(), "removing temp dir");
            let _ = std::fs::remove_dir_all(temp);
        }
    }
}

/// Recursively grant read/write to everyone (plus traverse on directories).
///
/// `path` itself is followed when it is a symlink, like `chmod -R` does for
/// its operands. Symlinks found inside the tree are left alone.
pub fn relax_permissions(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        relax_entry(path, &meta);
    }
}

fn relax_entry(path: &Path, meta: &std::fs::Metadata) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let extra = if meta.is_dir() { 0o777 } else { 0o666 };
        let mode = meta.permissions().mode() | extra;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    {
        let mut perms = meta.permissions();
        perms.set_readonly(false);
        let _ = std::fs::set_permissions(path, perms);
    }

    if meta.is_dir() {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                let child = entry.path();
                match std::fs::symlink_metadata(&child) {
                    Ok(m) if !m.file_type().is_symlink() => relax_entry(&child, &m),
                    _ => {}
                }
            }
        }
    }
}

/// Take and run the pending plan, if there still is one.
pub fn run_pending() {
    let slot = slot();
    let mut pending = lock(&slot);
    if let Some(plan) = pending.take() {
        plan.run();
    }
}

/// Keeps calibre's PID registered until dropped.
pub struct ChildRegistration {
    pid: u32,
}

impl ChildRegistration {
    pub fn new(pid: u32) -> Self {
        *lock(&RUNNING_CHILD) = Some(pid);
        tracing::debug!(pid, "registered child process");
        Self { pid }
    }
}

impl Drop for ChildRegistration {
    fn drop(&mut self) {
        let mut running = lock(&RUNNING_CHILD);
        if *running == Some(self.pid) {
            *running = None;
            tracing::debug!(pid = self.pid, "unregistered child process");
        }
    }
}

/// Pass `sig` on to the running child. Returns false when there is none.
#[cfg(unix)]
fn forward_to_child(sig: i32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let running = lock(&RUNNING_CHILD);
    let Some(pid) = *running else {
        return false;
    };
    match Signal::try_from(sig) {
        Ok(signal) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
                tracing::warn!(pid, "failed to forward {signal} to calibre: {e}");
            }
        }
        Err(e) => tracing::warn!(sig, "cannot forward signal: {e}"),
    }
    true
}

/// What the signal thread does with one signal. `None` means it was handed to
/// calibre and the launcher keeps running; otherwise cleanup has run and the
/// value is the exit status to leave with.
#[cfg(unix)]
fn handle_signal(sig: i32) -> Option<i32> {
    if forward_to_child(sig) {
        tracing::info!(signal = sig, "forwarded signal to calibre");
        return None;
    }
    tracing::info!(signal = sig, "received signal, cleaning up");
    run_pending();
    Some(128 + sig)
}

/// RAII handle on the global cleanup slot. Dropping it runs the plan.
pub struct CleanupGuard {
    slot: Arc<Mutex<Option<CleanupPlan>>>,
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self { slot: slot() }
    }

    pub fn arm(&self, plan: CleanupPlan) {
        *lock(&self.slot) = Some(plan);
    }

    /// Amend an armed plan. Does nothing when cleanup is disabled.
    pub fn update(&self, f: impl FnOnce(&mut CleanupPlan)) {
        if let Some(plan) = lock(&self.slot).as_mut() {
            f(plan);
        }
    }
}

impl Default for CleanupGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        tracing::debug!("CleanupGuard dropped, running cleanup");
        let mut pending = lock(&self.slot);
        if let Some(plan) = pending.take() {
            plan.run();
        }
    }
}

/// Install the SIGINT / SIGTERM / SIGHUP thread. Call once at program start.
#[cfg(unix)]
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if let Some(code) = handle_signal(sig) {
                std::process::exit(code);
            }
        }
    });

    Ok(())
}

// No signal iterator off Unix; the guard still covers normal and error exits.
#[cfg(not(unix))]
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    Ok(())
}
