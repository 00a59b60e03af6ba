use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the settings file, looked up in the portable root.
pub const CONFIG_FILE_NAME: &str = "calibre-portable.conf";

pub const CONFIG_DIR: &str = "CONFIG_DIR";
pub const LIBRARY_DIRS: &str = "LIBRARY_DIRS";
pub const METADATA_DIR: &str = "METADATA_DIR";
pub const SRC_DIR: &str = "SRC_DIR";
pub const BIN_DIR: &str = "BIN_DIR";
pub const CALIBRE_TEMP_DIR: &str = "CALIBRE_TEMP_DIR";
pub const CALIBRE_OVERRIDE_LANG: &str = "CALIBRE_OVERRIDE_LANG";
pub const CALIBRE_NOCONFIRM_START: &str = "CALIBRE_NOCONFIRM_START";
pub const CALIBRE_NO_CLEANUP: &str = "CALIBRE_NO_CLEANUP";

const KNOWN_KEYS: [&str; 9] = [
    CONFIG_DIR,
    LIBRARY_DIRS,
    METADATA_DIR,
    SRC_DIR,
    BIN_DIR,
    CALIBRE_TEMP_DIR,
    CALIBRE_OVERRIDE_LANG,
    CALIBRE_NOCONFIRM_START,
    CALIBRE_NO_CLEANUP,
];

/// Path of the calibre binaries inside a macOS app bundle, relative to the app dir.
pub const MAC_BUNDLE_SUFFIX: &str = "calibre.app/Contents/MacOS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
}

impl Platform {
    /// Anything that is not macOS gets the Linux layout.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    fn default_bin_dir(self, cwd: &Path) -> PathBuf {
        match self {
            Platform::Linux => cwd.join("Calibre"),
            Platform::MacOs => cwd.join(MAC_BUNDLE_SUFFIX),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write config template {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Values read from `calibre-portable.conf`.
///
/// The file is a small, shell-compatible subset of `KEY=value` lines. It is
/// parsed, never executed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConfigFile {
    values: HashMap<String, String>,
    library_dirs: BTreeMap<usize, String>,
    exported: Vec<String>,
}

/// Outcome of looking for the config file.
#[derive(Debug)]
pub enum ConfigLoad {
    Loaded(ConfigFile),
    /// No file existed; a commented template was written in its place.
    Created,
}

impl ConfigFile {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// `LIBRARY_DIRS[n]` entries in index order, or `None` if the file declares none.
    pub fn library_dirs(&self) -> Option<Vec<String>> {
        if self.library_dirs.is_empty() {
            return None;
        }
        Some(
            self.library_dirs
                .values()
                .filter(|v| !v.is_empty())
                .cloned()
                .collect(),
        )
    }

    /// Exported variables that are not launcher settings, in declaration order.
    pub fn passthrough(&self) -> Vec<(String, String)> {
        self.exported
            .iter()
            .filter(|k| !KNOWN_KEYS.contains(&k.as_str()))
            .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn parse(text: &str, cwd: &Path, env: &HashMap<String, String>) -> Self {
        let mut file = ConfigFile::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !file.parse_line(line, cwd, env) {
                tracing::warn!(line = idx + 1, "ignoring unsupported config line: {line}");
            }
        }
        file
    }

    /// Read the config file, or write the template and report that it was created.
    pub fn load_or_create(
        path: &Path,
        cwd: &Path,
        env: &HashMap<String, String>,
        platform: Platform,
    ) -> Result<ConfigLoad, ConfigError> {
        if path.is_file() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "loaded config file");
            return Ok(ConfigLoad::Loaded(ConfigFile::parse(&text, cwd, env)));
        }
        write_template(path, platform)?;
        Ok(ConfigLoad::Created)
    }

    /// Returns false when the line is not a form we understand.
    fn parse_line(&mut self, line: &str, cwd: &Path, env: &HashMap<String, String>) -> bool {
        // `: ${KEY:=value}` / `: "${KEY:="value"}"`
        if let Some(rest) = line.strip_prefix(':') {
            let rest = rest.trim().trim_matches('"');
            let Some(body) = rest.strip_prefix("${").and_then(|r| r.strip_suffix('}')) else {
                return false;
            };
            let Some((key, value)) = body.split_once(":=") else {
                return false;
            };
            if !is_identifier(key) {
                return false;
            }
            if !self.values.contains_key(key) {
                let value = self.value_of(value, cwd, env);
                self.values.insert(key.to_string(), value);
            }
            return true;
        }

        let (exported, assignment) = match line.strip_prefix("export ") {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };

        let Some((lhs, rhs)) = assignment.split_once('=') else {
            // bare `export KEY`
            if exported && is_identifier(assignment) {
                self.mark_exported(assignment);
                return true;
            }
            return false;
        };

        if let Some((name, index)) = parse_indexed(lhs) {
            if name != LIBRARY_DIRS {
                return false;
            }
            let value = self.value_of(rhs, cwd, env);
            self.library_dirs.insert(index, value);
            return true;
        }

        if !is_identifier(lhs) {
            return false;
        }
        let value = self.value_of(rhs, cwd, env);
        self.values.insert(lhs.to_string(), value);
        if exported {
            self.mark_exported(lhs);
        }
        true
    }

    fn mark_exported(&mut self, key: &str) {
        if !self.exported.iter().any(|k| k == key) {
            self.exported.push(key.to_string());
        }
    }

    fn value_of(&self, raw: &str, cwd: &Path, env: &HashMap<String, String>) -> String {
        let lookup = |name: &str| {
            self.values
                .get(name)
                .or_else(|| env.get(name))
                .cloned()
        };
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix('\'') {
            return rest.split('\'').next().unwrap_or_default().to_string();
        }
        if let Some(rest) = raw.strip_prefix('"') {
            let inner = match rest.rfind('"') {
                Some(end) => &rest[..end],
                None => rest,
            };
            return expand(&inner.replace("\\\"", "\""), cwd, &lookup);
        }
        let bare = raw.split(" #").next().unwrap_or_default().trim_end();
        expand(bare, cwd, &lookup)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `NAME[3]` -> `("NAME", 3)`
fn parse_indexed(lhs: &str) -> Option<(&str, usize)> {
    let (name, rest) = lhs.split_once('[')?;
    let index = rest.strip_suffix(']')?.trim().parse().ok()?;
    is_identifier(name).then_some((name, index))
}

/// Shell-style expansion of `$(pwd)`, `$PWD`, `${NAME}` and `$NAME`.
/// Unknown names expand to the empty string.
fn expand(raw: &str, cwd: &Path, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let cwd_str = cwd.to_string_lossy();
    let var = |name: &str| {
        if name == "PWD" {
            cwd_str.to_string()
        } else {
            lookup(name).unwrap_or_default()
        }
    };

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        if let Some(after) = tail.strip_prefix("(pwd)") {
            out.push_str(&cwd_str);
            rest = after;
        } else if let Some(inner) = tail.strip_prefix('{') {
            match inner.find('}') {
                Some(end) => {
                    out.push_str(&var(&inner[..end]));
                    rest = &inner[end + 1..];
                }
                None => {
                    out.push('$');
                    rest = tail;
                }
            }
        } else {
            let len = tail
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(tail.len());
            if len == 0 {
                out.push('$');
            } else {
                out.push_str(&var(&tail[..len]));
            }
            rest = &tail[len..];
        }
    }
    out.push_str(rest);
    out
}

/// Text of the commented-out settings file written on first run.
pub fn template(platform: Platform) -> String {
    let bin_default = match platform {
        Platform::Linux => "$(pwd)/Calibre".to_string(),
        Platform::MacOs => format!("$(pwd)/{MAC_BUNDLE_SUFFIX}"),
    };
    format!(
        r#"# Settings for calibre-portable (written by calibre-portable {version}).
# Every line is commented out; the launcher uses its built-in defaults until
# you uncomment and edit one. Variables already exported in the environment
# take precedence over this file. "$(pwd)" stands for the portable root.

##############################################################################
# Locations
##############################################################################

# calibre preferences, plugins and other configuration.
# CONFIG_DIR="$(pwd)/CalibreConfig"

# Candidate libraries, tried in order; the first existing one is opened.
# With --create-dirs the last entry is created when none of them exist.
# LIBRARY_DIRS[0]="/path/to/first/CalibreLibrary"
# LIBRARY_DIRS[1]="/path/to/second/CalibreLibrary"
# LIBRARY_DIRS[2]="$(pwd)/CalibreLibrary"

# Keep metadata.db outside the library, for example on a faster local disk.
# METADATA_DIR="$(pwd)/CalibreMetadata"

# Run calibre from a source checkout when this directory exists.
# SRC_DIR="$(pwd)/Calibre Source"

# calibre binaries. Set to "" to start the calibre found on PATH instead.
# BIN_DIR="{bin_default}"

# Scratch space, emptied at every start and deleted on exit.
# CALIBRE_TEMP_DIR="/tmp/CALIBRE_TEMP"

##############################################################################
# Behaviour
##############################################################################

# Interface language, e.g. EN, DE, FR.
# CALIBRE_OVERRIDE_LANG="EN"

# Start without asking for confirmation.
# CALIBRE_NOCONFIRM_START=1

# Do not relax permissions or delete the temp dir on exit.
# CALIBRE_NO_CLEANUP=1

# Any other exported variable is handed to calibre unchanged, e.g.
# export CALIBRE_USE_SYSTEM_THEME=1
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}

pub fn write_template(path: &Path, platform: Platform) -> Result<(), ConfigError> {
    std::fs::write(path, template(platform)).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Environment first, then the config file. Defaults are the caller's last tier.
pub struct Layers<'a> {
    env: &'a HashMap<String, String>,
    file: &'a ConfigFile,
}

impl<'a> Layers<'a> {
    pub fn new(env: &'a HashMap<String, String>, file: &'a ConfigFile) -> Self {
        Self { env, file }
    }

    /// An empty string counts as set.
    pub fn resolve(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .cloned()
            .or_else(|| self.file.get(key).map(str::to_string))
    }

    fn resolve_or(&self, key: &str, default: PathBuf) -> PathBuf {
        self.resolve(key).map(PathBuf::from).unwrap_or(default)
    }

    fn flag(&self, key: &str) -> bool {
        self.resolve(key).is_some_and(|v| is_truthy(&v))
    }

    fn library_candidates(&self, default: PathBuf) -> Vec<PathBuf> {
        if let Some(list) = self.env.get(LIBRARY_DIRS) {
            let dirs: Vec<PathBuf> = std::env::split_paths(list)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !dirs.is_empty() {
                return dirs;
            }
        }
        match self.file.library_dirs() {
            Some(dirs) if !dirs.is_empty() => dirs.into_iter().map(PathBuf::from).collect(),
            _ => vec![default],
        }
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub platform: Platform,
    pub root: PathBuf,              // portable root (cwd)
    pub config_dir: PathBuf,        // CONFIG_DIR
    pub library_candidates: Vec<PathBuf>, // LIBRARY_DIRS, first existing wins
    pub metadata_dir: PathBuf,      // METADATA_DIR
    pub src_dir: PathBuf,           // SRC_DIR
    /// `None` when BIN_DIR is explicitly empty: use calibre from PATH.
    pub bin_dir: Option<PathBuf>,
    /// `true` when BIN_DIR came from the environment or the config file.
    pub bin_dir_configured: bool,
    pub temp_dir: Option<PathBuf>,  // CALIBRE_TEMP_DIR; None = platform default
    pub override_lang: Option<String>,
    pub no_confirm: bool,           // CALIBRE_NOCONFIRM_START
    pub no_cleanup: bool,           // CALIBRE_NO_CLEANUP
    pub passthrough: Vec<(String, String)>,
}

pub fn launcher_config(
    root: &Path,
    env: &HashMap<String, String>,
    file: &ConfigFile,
    platform: Platform,
) -> LauncherConfig {
    let layers = Layers::new(env, file);

    let bin_setting = layers.resolve(BIN_DIR);
    let bin_dir_configured = bin_setting.is_some();
    let bin_dir = match bin_setting {
        Some(v) if v.is_empty() => None,
        Some(v) => Some(PathBuf::from(v)),
        None => Some(platform.default_bin_dir(root)),
    };

    let override_lang = layers.resolve(CALIBRE_OVERRIDE_LANG).filter(|v| !v.is_empty());
    let temp_dir = layers
        .resolve(CALIBRE_TEMP_DIR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);

    LauncherConfig {
        platform,
        root: root.to_path_buf(),
        config_dir: layers.resolve_or(CONFIG_DIR, root.join("CalibreConfig")),
        library_candidates: layers.library_candidates(root.join("CalibreLibrary")),
        metadata_dir: layers.resolve_or(METADATA_DIR, root.join("CalibreMetadata")),
        src_dir: layers.resolve_or(SRC_DIR, root.join("Calibre Source")),
        bin_dir,
        bin_dir_configured,
        temp_dir,
        override_lang,
        no_confirm: layers.flag(CALIBRE_NOCONFIRM_START),
        no_cleanup: layers.flag(CALIBRE_NO_CLEANUP),
        passthrough: file.passthrough(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    // Serialize the one test that touches the real process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn root() -> PathBuf {
        PathBuf::from("/media/usb")
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = launcher_config(&root(), &env(&[]), &ConfigFile::default(), Platform::Linux);
        assert_eq!(config.config_dir, root().join("CalibreConfig"));
        assert_eq!(config.library_candidates, vec![root().join("CalibreLibrary")]);
        assert_eq!(config.metadata_dir, root().join("CalibreMetadata"));
        assert_eq!(config.src_dir, root().join("Calibre Source"));
        assert_eq!(config.bin_dir, Some(root().join("Calibre")));
        assert!(!config.bin_dir_configured);
        assert!(config.temp_dir.is_none());
        assert!(!config.no_confirm);
        assert!(!config.no_cleanup);
    }

    #[test]
    fn mac_bin_dir_lives_in_bundle() {
        let config = launcher_config(&root(), &env(&[]), &ConfigFile::default(), Platform::MacOs);
        assert_eq!(
            config.bin_dir,
            Some(root().join("calibre.app").join("Contents").join("MacOS"))
        );
    }

    #[test]
    fn env_beats_config_file() {
        let file = ConfigFile::parse("CONFIG_DIR=\"/from/file\"\nMETADATA_DIR=/meta\n", &root(), &env(&[]));
        let e = env(&[("CONFIG_DIR", "/from/env")]);
        let config = launcher_config(&root(), &e, &file, Platform::Linux);
        assert_eq!(config.config_dir, PathBuf::from("/from/env"));
        assert_eq!(config.metadata_dir, PathBuf::from("/meta"));
    }

    #[test]
    fn empty_bin_dir_means_system_path() {
        let file = ConfigFile::parse("BIN_DIR=\"\"\n", &root(), &env(&[]));
        let config = launcher_config(&root(), &env(&[]), &file, Platform::Linux);
        assert_eq!(config.bin_dir, None);
        assert!(config.bin_dir_configured);
    }

    #[test]
    fn pwd_expansion_and_quoting() {
        let text = r#"
# comment
CONFIG_DIR="$(pwd)/Conf"
SRC_DIR='$(pwd)/literal'
METADATA_DIR=${CONFIG_DIR}/meta # trailing comment
BIN_DIR="$PWD/bin"
"#;
        let file = ConfigFile::parse(text, &root(), &env(&[]));
        assert_eq!(file.get(CONFIG_DIR), Some("/media/usb/Conf"));
        assert_eq!(file.get(SRC_DIR), Some("$(pwd)/literal"));
        assert_eq!(file.get(METADATA_DIR), Some("/media/usb/Conf/meta"));
        assert_eq!(file.get(BIN_DIR), Some("/media/usb/bin"));
    }

    #[test]
    fn expansion_falls_back_to_environment() {
        let file = ConfigFile::parse("CONFIG_DIR=\"$HOME/cfg\"\nSRC_DIR=$NOPE/x\n", &root(), &env(&[("HOME", "/home/ann")]));
        assert_eq!(file.get(CONFIG_DIR), Some("/home/ann/cfg"));
        assert_eq!(file.get(SRC_DIR), Some("/x"));
    }

    #[test]
    fn library_dirs_ordered_by_index() {
        let text = "LIBRARY_DIRS[2]=\"/c\"\nLIBRARY_DIRS[0]=\"/a\"\nLIBRARY_DIRS[1]=\"\"\n";
        let file = ConfigFile::parse(text, &root(), &env(&[]));
        assert_eq!(file.library_dirs(), Some(vec!["/a".to_string(), "/c".to_string()]));
        let config = launcher_config(&root(), &env(&[]), &file, Platform::Linux);
        assert_eq!(config.library_candidates, vec![PathBuf::from("/a"), PathBuf::from("/c")]);
    }

    #[test]
    fn library_dirs_from_env_path_list() {
        let file = ConfigFile::parse("LIBRARY_DIRS[0]=/file\n", &root(), &env(&[]));
        let e = env(&[("LIBRARY_DIRS", "/one:/two")]);
        let config = launcher_config(&root(), &e, &file, Platform::Linux);
        assert_eq!(config.library_candidates, vec![PathBuf::from("/one"), PathBuf::from("/two")]);
    }

    #[test]
    fn set_if_unset_form_keeps_first_value() {
        let text = "CONFIG_DIR=/first\n: ${CONFIG_DIR:=/second}\n: \"${SRC_DIR:=\"$(pwd)/src\"}\"\n";
        let file = ConfigFile::parse(text, &root(), &env(&[]));
        assert_eq!(file.get(CONFIG_DIR), Some("/first"));
        assert_eq!(file.get(SRC_DIR), Some("/media/usb/src"));
    }

    #[test]
    fn flags_accept_common_truthy_values() {
        let file = ConfigFile::parse("CALIBRE_NOCONFIRM_START=1\nCALIBRE_NO_CLEANUP=no\n", &root(), &env(&[]));
        let config = launcher_config(&root(), &env(&[]), &file, Platform::Linux);
        assert!(config.no_confirm);
        assert!(!config.no_cleanup);
        let config = launcher_config(&root(), &env(&[("CALIBRE_NO_CLEANUP", "TRUE")]), &file, Platform::Linux);
        assert!(config.no_cleanup);
    }

    #[test]
    fn exported_unknown_keys_pass_through() {
        let text = "export CALIBRE_USE_SYSTEM_THEME=1\nFOO=bar\nexport FOO\nexport CALIBRE_OVERRIDE_LANG=DE\nLOCAL=x\n";
        let file = ConfigFile::parse(text, &root(), &env(&[]));
        assert_eq!(
            file.passthrough(),
            vec![
                ("CALIBRE_USE_SYSTEM_THEME".to_string(), "1".to_string()),
                ("FOO".to_string(), "bar".to_string()),
            ]
        );
        let config = launcher_config(&root(), &env(&[]), &file, Platform::Linux);
        assert_eq!(config.override_lang.as_deref(), Some("DE"));
    }

    #[test]
    fn unsupported_lines_are_skipped() {
        let file = ConfigFile::parse("echo hello\nCONFIG_DIR=/ok\nOTHER[1]=x\n", &root(), &env(&[]));
        assert_eq!(file.get(CONFIG_DIR), Some("/ok"));
        assert!(file.library_dirs().is_none());
    }

    #[test]
    fn template_is_fully_commented() {
        let text = template(Platform::Linux);
        let file = ConfigFile::parse(&text, &root(), &env(&[]));
        assert_eq!(file, ConfigFile::default());
        for key in KNOWN_KEYS {
            assert!(text.contains(key), "template should document {key}");
        }
        assert!(!text.contains("$(date"));
    }

    #[test]
    fn load_or_create_writes_template_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let first = ConfigFile::load_or_create(&path, dir.path(), &env(&[]), Platform::Linux).unwrap();
        assert!(matches!(first, ConfigLoad::Created));
        assert!(path.is_file());
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);

        let second = ConfigFile::load_or_create(&path, dir.path(), &env(&[]), Platform::Linux).unwrap();
        assert!(matches!(second, ConfigLoad::Loaded(f) if f == ConfigFile::default()));
    }

    #[test]
    fn load_reads_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "CONFIG_DIR=\"$(pwd)/c\"\n").unwrap();
        let loaded = ConfigFile::load_or_create(&path, dir.path(), &env(&[]), Platform::Linux).unwrap();
        let ConfigLoad::Loaded(file) = loaded else {
            panic!("expected an existing file to load");
        };
        let expected = dir.path().join("c");
        assert_eq!(file.get(CONFIG_DIR), Some(expected.to_str().unwrap()));
    }

    #[test]
    fn process_env_override_respected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("CONFIG_DIR", "/tmp/test-calibre-portable-cfg");
        let e: HashMap<String, String> = std::env::vars().collect();
        std::env::remove_var("CONFIG_DIR");
        let file = ConfigFile::parse("CONFIG_DIR=/file\n", &root(), &e);
        let config = launcher_config(&root(), &e, &file, Platform::Linux);
        assert_eq!(config.config_dir, PathBuf::from("/tmp/test-calibre-portable-cfg"));
    }
}
