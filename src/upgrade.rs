use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;
use semver::Version;
use thiserror::Error;

use crate::config::{LauncherConfig, Platform, MAC_BUNDLE_SUFFIX};
use crate::paths::app_dir_for;

const LINUX_INSTALLER_URL: &str = "https://download.calibre-ebook.com/linux-installer.sh";
const MAC_DOWNLOAD_PAGE: &str = "https://calibre-ebook.com/download_osx";
const DMG_LINK_PATTERN: &str =
    r#"https://download\.calibre-ebook\.com/([0-9][0-9.]*)/calibre-[0-9][0-9.]*\.dmg"#;
const MAC_MOUNT_POINT: &str = "/Volumes/calibre-portable-upgrade";

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error(
        "neither BIN_DIR ({bin_dir}) nor SRC_DIR ({src_dir}) exists; \
         create the BIN_DIR directory to install calibre there"
    )]
    NoInstallTarget { bin_dir: String, src_dir: String },
    #[error("app directory {0} does not exist; create it to install calibre.app there")]
    NoAppDir(PathBuf),
    #[error("no calibre disk image link found on {0}")]
    NoDiskImage(String),
    #[error("{program} failed (exit code {code})")]
    CommandFailed { program: String, code: i32 },
}

/// What `fetch` left on disk.
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub version: Option<Version>,
}

/// One platform's way of putting fresh calibre binaries into the portable root.
pub trait Upgrader {
    fn check_preconditions(&self) -> Result<(), UpgradeError>;
    fn fetch(&self, client: &reqwest::blocking::Client, workdir: &Path) -> anyhow::Result<Download>;
    /// Returns the binary directory of the new install.
    fn install(&self, download: &Download) -> anyhow::Result<PathBuf>;
}

pub struct LinuxUpgrader {
    root: PathBuf,
    bin_dir: Option<PathBuf>,
    src_dir: PathBuf,
}

pub struct MacUpgrader {
    app_dir: PathBuf,
}

pub fn upgrader_for(config: &LauncherConfig) -> Box<dyn Upgrader> {
    match config.platform {
        Platform::Linux => Box::new(LinuxUpgrader {
            root: config.root.clone(),
            bin_dir: config.bin_dir.clone(),
            src_dir: config.src_dir.clone(),
        }),
        Platform::MacOs => Box::new(MacUpgrader {
            app_dir: config
                .bin_dir
                .as_deref()
                .map(app_dir_for)
                .unwrap_or_else(|| config.root.clone()),
        }),
    }
}

fn http_client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .user_agent(format!("calibre-portable/{}", env!("CARGO_PKG_VERSION")))
        .build()?)
}

#[derive(Debug, Clone)]
pub struct Installed {
    pub bin_dir: PathBuf,
    pub version: Option<Version>,
}

/// Preconditions, download into a scratch dir, install. Nothing is fetched
/// when the preconditions fail.
pub fn run_upgrade(upgrader: &dyn Upgrader) -> anyhow::Result<Installed> {
    upgrader.check_preconditions()?;
    let client = http_client()?;
    let scratch = tempfile::Builder::new()
        .prefix("calibre-portable-upgrade")
        .tempdir()?;
    let download = upgrader.fetch(&client, scratch.path())?;
    let bin_dir = upgrader.install(&download)?;
    let _ = std::fs::remove_file(&download.path);
    Ok(Installed {
        bin_dir,
        version: download.version,
    })
}

fn download_to(client: &reqwest::blocking::Client, url: &str, dest: &Path) -> anyhow::Result<()> {
    tracing::info!(url, dest = %dest.display(), "downloading");
    let response = client.get(url).send()?.error_for_status()?;
    let written = save_stream(response, dest)?;
    tracing::debug!(bytes = written, "download complete");
    Ok(())
}

/// Stream `body` to `dest` without holding it in memory.
fn save_stream(mut body: impl Read, dest: &Path) -> std::io::Result<u64> {
    let mut file = std::fs::File::create(dest)?;
    std::io::copy(&mut body, &mut file)
}

fn run_checked(cmd: &mut Command, program: &str) -> anyhow::Result<()> {
    let status = cmd.status()?;
    if !status.success() {
        return Err(UpgradeError::CommandFailed {
            program: program.to_string(),
            code: status.code().unwrap_or(-1),
        }
        .into());
    }
    Ok(())
}

impl Upgrader for LinuxUpgrader {
    fn check_preconditions(&self) -> Result<(), UpgradeError> {
        let has_bin = self.bin_dir.as_deref().is_some_and(Path::is_dir);
        if has_bin || self.src_dir.is_dir() {
            return Ok(());
        }
        Err(UpgradeError::NoInstallTarget {
            bin_dir: self
                .bin_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "BIN_DIR".to_string()),
            src_dir: self.src_dir.display().to_string(),
        })
    }

    fn fetch(&self, client: &reqwest::blocking::Client, workdir: &Path) -> anyhow::Result<Download> {
        let path = workdir.join("linux-installer.sh");
        download_to(client, LINUX_INSTALLER_URL, &path)?;
        Ok(Download { path, version: None })
    }

    fn install(&self, download: &Download) -> anyhow::Result<PathBuf> {
        eprintln!("[calibre-portable] installing calibre into {}", self.root.display());
        run_checked(
            Command::new("sh")
                .arg(&download.path)
                .arg(format!("install_dir={}", self.root.display())),
            "calibre installer",
        )?;
        let bin_dir = self
            .bin_dir
            .clone()
            .unwrap_or_else(|| self.root.join("calibre"));
        if let Some(warning) = missing_install_warning(&bin_dir, &self.root) {
            eprintln!("[calibre-portable] warning: {warning}");
        }
        Ok(bin_dir)
    }
}

/// The installer always writes `<root>/calibre`. Explain when that is not
/// where the launcher will look.
fn missing_install_warning(bin_dir: &Path, root: &Path) -> Option<String> {
    if bin_dir.is_dir() {
        return None;
    }
    let installed = root.join("calibre");
    if installed.is_dir() {
        Some(format!(
            "{} does not exist but calibre was installed to {}; set BIN_DIR=\"{}\" in the config file",
            bin_dir.display(),
            installed.display(),
            installed.display()
        ))
    } else {
        Some(format!(
            "{} does not exist after the install; calibre will be looked up on PATH",
            bin_dir.display()
        ))
    }
}

/// Detaches the disk image on every exit path once it has been mounted.
struct Mount {
    point: PathBuf,
}

impl Mount {
    fn attach(image: &Path, point: &Path) -> anyhow::Result<Self> {
        run_checked(
            Command::new("hdiutil")
                .args(["attach", "-nobrowse", "-quiet", "-mountpoint"])
                .arg(point)
                .arg(image),
            "hdiutil attach",
        )?;
        Ok(Mount {
            point: point.to_path_buf(),
        })
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        let detached = Command::new("hdiutil")
            .args(["detach", "-quiet"])
            .arg(&self.point)
            .status();
        if !detached.is_ok_and(|s| s.success()) {
            eprintln!(
                "[calibre-portable] warning: could not detach {}",
                self.point.display()
            );
        }
    }
}

impl Upgrader for MacUpgrader {
    fn check_preconditions(&self) -> Result<(), UpgradeError> {
        if self.app_dir.is_dir() {
            Ok(())
        } else {
            Err(UpgradeError::NoAppDir(self.app_dir.clone()))
        }
    }

    fn fetch(&self, client: &reqwest::blocking::Client, workdir: &Path) -> anyhow::Result<Download> {
        let page = client
            .get(MAC_DOWNLOAD_PAGE)
            .send()?
            .error_for_status()?
            .text()?;
        let (url, version) = find_dmg_link(&page)
            .ok_or_else(|| UpgradeError::NoDiskImage(MAC_DOWNLOAD_PAGE.to_string()))?;

        let installed = std::fs::read_to_string(self.app_dir.join("calibre.app/Contents/Info.plist"))
            .ok()
            .and_then(|plist| bundle_version(&plist));
        match (&installed, &version) {
            (Some(old), Some(new)) if new > old => {
                eprintln!("[calibre-portable] upgrading calibre {old} -> {new}")
            }
            (Some(old), Some(_)) => {
                eprintln!("[calibre-portable] calibre {old} is current, reinstalling")
            }
            (_, Some(new)) => eprintln!("[calibre-portable] installing calibre {new}"),
            (_, None) => eprintln!("[calibre-portable] installing calibre from {url}"),
        }

        let path = workdir.join("calibre.dmg");
        download_to(client, &url, &path)?;
        Ok(Download { path, version })
    }

    fn install(&self, download: &Download) -> anyhow::Result<PathBuf> {
        let mount = Mount::attach(&download.path, Path::new(MAC_MOUNT_POINT))?;
        install_bundle(&mount.point.join("calibre.app"), &self.app_dir)?;
        drop(mount);
        Ok(self.app_dir.join(MAC_BUNDLE_SUFFIX))
    }
}

/// Copy `source` to `<app_dir>/calibre.app`. The copy goes to a staging name
/// first; the existing bundle is only replaced once the copy is complete.
fn install_bundle(source: &Path, app_dir: &Path) -> anyhow::Result<()> {
    let bundle = app_dir.join("calibre.app");
    let staged = app_dir.join(".calibre.app.new");
    let retired = app_dir.join(".calibre.app.old");
    for leftover in [&staged, &retired] {
        if leftover.exists() {
            std::fs::remove_dir_all(leftover)?;
        }
    }

    let copied = run_checked(Command::new("cp").arg("-R").arg(source).arg(&staged), "cp");
    if let Err(e) = copied {
        let _ = std::fs::remove_dir_all(&staged);
        return Err(e);
    }

    if bundle.exists() {
        std::fs::rename(&bundle, &retired)?;
    }
    if let Err(e) = std::fs::rename(&staged, &bundle) {
        if retired.exists() {
            let _ = std::fs::rename(&retired, &bundle);
        }
        return Err(e.into());
    }
    let _ = std::fs::remove_dir_all(&retired);
    Ok(())
}

/// calibre versions are sometimes published as `X.Y`; pad them for semver.
fn parse_calibre_version(s: &str) -> Option<Version> {
    let s = s.trim().trim_end_matches('.');
    match s.matches('.').count() {
        0 => Version::parse(&format!("{s}.0.0")).ok(),
        1 => Version::parse(&format!("{s}.0")).ok(),
        _ => Version::parse(s).ok(),
    }
}

/// First disk image link on the download page, with the version it carries.
pub fn find_dmg_link(page: &str) -> Option<(String, Option<Version>)> {
    let re = Regex::new(DMG_LINK_PATTERN).ok()?;
    let caps = re.captures(page)?;
    let url = caps.get(0)?.as_str().to_string();
    let version = caps.get(1).and_then(|m| parse_calibre_version(m.as_str()));
    Some((url, version))
}

/// `CFBundleShortVersionString` from an app bundle's Info.plist.
pub fn bundle_version(plist: &str) -> Option<Version> {
    let re = Regex::new(r"<key>CFBundleShortVersionString</key>\s*<string>([^<]+)</string>").ok()?;
    let caps = re.captures(plist)?;
    parse_calibre_version(caps.get(1)?.as_str())
}
