use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::{LauncherConfig, Platform, MAC_BUNDLE_SUFFIX};

/// Directories settled for this run. `None` means the location was not found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedPaths {
    pub config_dir: Option<PathBuf>,
    pub library_dir: Option<PathBuf>,
    pub metadata_dir: Option<PathBuf>,
    pub src_dir: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    pub app_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    /// What to run: a binary inside `bin_dir`, or a bare name searched on PATH.
    pub program: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(PathBuf),
    Created(PathBuf),
    Missing(PathBuf),
}

impl Resolution {
    /// The usable directory, if any.
    pub fn dir(&self) -> Option<&Path> {
        match self {
            Resolution::Found(p) | Resolution::Created(p) => Some(p),
            Resolution::Missing(_) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Resolution::Found(p) => p.display().to_string(),
            Resolution::Created(p) => format!("{} (created)", p.display()),
            Resolution::Missing(p) => format!("not found ({})", p.display()),
        }
    }
}

/// Check a single directory, creating it when `create` is set.
pub fn resolve_dir(path: &Path, create: bool) -> std::io::Result<Resolution> {
    if path.is_dir() {
        return Ok(Resolution::Found(path.to_path_buf()));
    }
    if create {
        std::fs::create_dir_all(path)?;
        tracing::info!(path = %path.display(), "created directory");
        return Ok(Resolution::Created(path.to_path_buf()));
    }
    Ok(Resolution::Missing(path.to_path_buf()))
}

/// First existing candidate wins. With nothing found and `create` set, the
/// last candidate is created. Returns `None` for an empty candidate list.
pub fn select_library(candidates: &[PathBuf], create: bool) -> std::io::Result<Option<Resolution>> {
    if let Some(found) = candidates.iter().find(|c| c.is_dir()) {
        return Ok(Some(Resolution::Found(found.clone())));
    }
    match candidates.last() {
        Some(fallback) => resolve_dir(fallback, create).map(Some),
        None => Ok(None),
    }
}

/// The directory holding `calibre.app`, derived from a bundle binary dir.
/// A bin dir outside a bundle is its own app dir.
pub fn app_dir_for(bin_dir: &Path) -> PathBuf {
    let suffix = Path::new(MAC_BUNDLE_SUFFIX);
    if bin_dir.ends_with(suffix) {
        let mut app = bin_dir.to_path_buf();
        for _ in suffix.components() {
            app.pop();
        }
        return app;
    }
    bin_dir.to_path_buf()
}

fn program_name() -> &'static str {
    if cfg!(windows) {
        "calibre.exe"
    } else {
        "calibre"
    }
}

/// Pick the calibre binary: inside `bin_dir` when it exists, otherwise the
/// bare program name for a PATH lookup.
pub fn resolve_program(bin_dir: Option<&Path>, configured: bool) -> PathBuf {
    match bin_dir {
        Some(dir) if dir.is_dir() => {
            eprintln!("[calibre-portable] binaries: {}", dir.display());
            dir.join(program_name())
        }
        Some(dir) => {
            if configured {
                eprintln!(
                    "[calibre-portable] warning: BIN_DIR {} not found, using calibre from PATH",
                    dir.display()
                );
            } else {
                eprintln!(
                    "[calibre-portable] no portable binaries at {}, using calibre from PATH",
                    dir.display()
                );
            }
            eprintln!("[calibre-portable] run with --upgrade-install to install a portable copy");
            PathBuf::from(program_name())
        }
        None => {
            eprintln!("[calibre-portable] binaries: calibre from PATH");
            PathBuf::from(program_name())
        }
    }
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Create an empty temp dir plus its cache subdirectory.
///
/// An explicitly configured dir is wiped first. Otherwise Linux gets a
/// randomly named dir under the system temp dir and macOS a `tempfile` dir.
pub fn prepare_temp_dir(
    configured: Option<&Path>,
    platform: Platform,
) -> std::io::Result<(PathBuf, PathBuf)> {
    let temp_dir = match configured {
        Some(dir) => {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
            std::fs::create_dir_all(dir)?;
            dir.to_path_buf()
        }
        None => match platform {
            Platform::Linux => {
                let dir = std::env::temp_dir().join(format!("CALIBRE_TEMP_{}", random_suffix(7)));
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
                std::fs::create_dir_all(&dir)?;
                dir
            }
            Platform::MacOs => tempfile::Builder::new()
                .prefix("CALIBRE_TEMP_")
                .tempdir()?
                .keep(),
        },
    };
    let cache_dir = temp_dir.join("calibre_cache");
    std::fs::create_dir_all(&cache_dir)?;
    tracing::debug!(temp = %temp_dir.display(), "temp dir ready");
    Ok((temp_dir, cache_dir))
}

/// Settle every directory for a launch, printing one status line per class.
pub fn resolve_all(config: &LauncherConfig, create: bool) -> anyhow::Result<ResolvedPaths> {
    let config_dir = resolve_dir(&config.config_dir, create)?;
    eprintln!("[calibre-portable] config:   {}", config_dir.describe());

    let library_dir = select_library(&config.library_candidates, create)?;
    match &library_dir {
        Some(r) => eprintln!("[calibre-portable] library:  {}", r.describe()),
        None => eprintln!("[calibre-portable] library:  not found"),
    }

    let metadata_dir = resolve_dir(&config.metadata_dir, false)?;
    eprintln!("[calibre-portable] metadata: {}", metadata_dir.describe());

    let src_dir = resolve_dir(&config.src_dir, false)?;
    eprintln!("[calibre-portable] source:   {}", src_dir.describe());

    let app_dir = match (config.platform, &config.bin_dir) {
        (Platform::MacOs, Some(bin)) => Some(app_dir_for(bin)).filter(|a| a.is_dir()),
        _ => None,
    };
    let program = resolve_program(config.bin_dir.as_deref(), config.bin_dir_configured);
    let bin_dir = config.bin_dir.clone().filter(|b| b.is_dir());

    let (temp_dir, cache_dir) = prepare_temp_dir(config.temp_dir.as_deref(), config.platform)?;
    eprintln!("[calibre-portable] temp:     {}", temp_dir.display());

    Ok(ResolvedPaths {
        config_dir: config_dir.dir().map(Path::to_path_buf),
        library_dir: library_dir.as_ref().and_then(|r| r.dir()).map(Path::to_path_buf),
        metadata_dir: metadata_dir.dir().map(Path::to_path_buf),
        src_dir: src_dir.dir().map(Path::to_path_buf),
        bin_dir,
        app_dir,
        temp_dir: Some(temp_dir),
        cache_dir: Some(cache_dir),
        program,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_config(root: &Path) -> LauncherConfig {
        LauncherConfig {
            platform: Platform::Linux,
            root: root.to_path_buf(),
            config_dir: root.join("CalibreConfig"),
            library_candidates: vec![root.join("CalibreLibrary")],
            metadata_dir: root.join("CalibreMetadata"),
            src_dir: root.join("Calibre Source"),
            bin_dir: Some(root.join("Calibre")),
            bin_dir_configured: false,
            temp_dir: Some(root.join("tmp")),
            override_lang: None,
            no_confirm: true,
            no_cleanup: false,
            passthrough: Vec::new(),
        }
    }

    #[test]
    fn first_existing_library_wins() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        std::fs::create_dir(&b).unwrap();
        std::fs::create_dir(&c).unwrap();

        let picked = select_library(&[a.clone(), b.clone(), c.clone()], false).unwrap();
        assert_eq!(picked, Some(Resolution::Found(b.clone())));

        // Order is what decides, not creation time.
        let picked = select_library(&[c.clone(), a, b], false).unwrap();
        assert_eq!(picked, Some(Resolution::Found(c)));
    }

    #[test]
    fn files_are_not_library_candidates() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        let picked = select_library(&[file.clone()], false).unwrap();
        assert_eq!(picked, Some(Resolution::Missing(file)));
    }

    #[test]
    fn missing_library_without_create_reports_not_found() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let picked = select_library(&[a.clone(), b.clone()], false).unwrap().unwrap();
        assert!(picked.dir().is_none());
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn missing_library_with_create_makes_only_the_last_candidate() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let picked = select_library(&[a.clone(), b.clone()], true).unwrap();
        assert_eq!(picked, Some(Resolution::Created(b.clone())));
        assert!(b.is_dir());
        assert!(!a.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn empty_candidate_list_selects_nothing() {
        assert_eq!(select_library(&[], true).unwrap(), None);
    }

    #[test]
    fn resolve_dir_reports_without_creating() {
        let dir = tempdir().unwrap();
        let cfg = dir.path().join("CalibreConfig");
        assert_eq!(resolve_dir(&cfg, false).unwrap(), Resolution::Missing(cfg.clone()));
        assert!(!cfg.exists());
        assert_eq!(resolve_dir(&cfg, true).unwrap(), Resolution::Created(cfg.clone()));
        assert_eq!(resolve_dir(&cfg, true).unwrap(), Resolution::Found(cfg));
    }

    #[test]
    fn app_dir_strips_bundle_suffix() {
        let bin = Path::new("/Volumes/USB/calibre.app/Contents/MacOS");
        assert_eq!(app_dir_for(bin), PathBuf::from("/Volumes/USB"));
        let plain = Path::new("/opt/calibre");
        assert_eq!(app_dir_for(plain), PathBuf::from("/opt/calibre"));
    }

    #[test]
    fn program_inside_existing_bin_dir() {
        let dir = tempdir().unwrap();
        let program = resolve_program(Some(dir.path()), true);
        assert_eq!(program, dir.path().join(program_name()));
    }

    #[test]
    fn program_falls_back_to_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("Calibre");
        assert_eq!(resolve_program(Some(&missing), true), PathBuf::from(program_name()));
        assert_eq!(resolve_program(None, true), PathBuf::from(program_name()));
    }

    #[test]
    fn configured_temp_dir_is_recreated_empty() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join("tmp");
        std::fs::create_dir_all(temp.join("stale")).unwrap();
        std::fs::write(temp.join("stale").join("f"), "old").unwrap();

        let (t, cache) = prepare_temp_dir(Some(&temp), Platform::Linux).unwrap();
        assert_eq!(t, temp);
        assert_eq!(cache, temp.join("calibre_cache"));
        assert!(cache.is_dir());
        assert!(!temp.join("stale").exists());
    }

    #[test]
    fn default_temp_dirs_are_unique() {
        let (a, _) = prepare_temp_dir(None, Platform::Linux).unwrap();
        let (b, _) = prepare_temp_dir(None, Platform::Linux).unwrap();
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("CALIBRE_TEMP_"));
        std::fs::remove_dir_all(&a).unwrap();
        std::fs::remove_dir_all(&b).unwrap();
    }

    #[test]
    fn mac_temp_dir_uses_tempfile() {
        let (t, cache) = prepare_temp_dir(None, Platform::MacOs).unwrap();
        assert!(t.is_dir());
        assert!(cache.is_dir());
        std::fs::remove_dir_all(&t).unwrap();
    }

    #[test]
    fn resolve_all_with_create_dirs() {
        let dir = tempdir().unwrap();
        let config = make_config(dir.path());
        let paths = resolve_all(&config, true).unwrap();
        assert_eq!(paths.config_dir, Some(dir.path().join("CalibreConfig")));
        assert_eq!(paths.library_dir, Some(dir.path().join("CalibreLibrary")));
        assert_eq!(paths.metadata_dir, None);
        assert_eq!(paths.src_dir, None);
        assert_eq!(paths.bin_dir, None);
        assert_eq!(paths.program, PathBuf::from(program_name()));
        assert_eq!(paths.temp_dir, Some(dir.path().join("tmp")));
        assert!(paths.cache_dir.unwrap().is_dir());
    }

    #[test]
    fn resolve_all_without_create_dirs_leaves_tree_alone() {
        let dir = tempdir().unwrap();
        let config = make_config(dir.path());
        let paths = resolve_all(&config, false).unwrap();
        assert_eq!(paths.config_dir, None);
        assert_eq!(paths.library_dir, None);
        assert!(!dir.path().join("CalibreConfig").exists());
        assert!(!dir.path().join("CalibreLibrary").exists());
    }

    #[test]
    fn resolve_all_finds_portable_binaries() {
        let dir = tempdir().unwrap();
        let config = make_config(dir.path());
        std::fs::create_dir_all(dir.path().join("Calibre")).unwrap();
        std::fs::create_dir_all(dir.path().join("Calibre Source")).unwrap();
        let paths = resolve_all(&config, false).unwrap();
        assert_eq!(paths.bin_dir, Some(dir.path().join("Calibre")));
        assert_eq!(paths.program, dir.path().join("Calibre").join(program_name()));
        assert_eq!(paths.src_dir, Some(dir.path().join("Calibre Source")));
        assert_eq!(paths.app_dir, None);
    }

    #[test]
    fn resolve_all_mac_derives_app_dir() {
        let dir = tempdir().unwrap();
        let mut config = make_config(dir.path());
        config.platform = Platform::MacOs;
        config.bin_dir = Some(dir.path().join(MAC_BUNDLE_SUFFIX));
        std::fs::create_dir_all(dir.path().join(MAC_BUNDLE_SUFFIX)).unwrap();
        let paths = resolve_all(&config, false).unwrap();
        assert_eq!(paths.app_dir, Some(dir.path().to_path_buf()));
        assert_eq!(paths.bin_dir, Some(dir.path().join(MAC_BUNDLE_SUFFIX)));
    }
}
