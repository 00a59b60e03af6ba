// main.rs: arg parsing and orchestration only.
// All I/O lives in the modules below; main.rs is the only file that wires them together.
mod cleanup;
mod config;
mod exec;
mod paths;
mod upgrade;

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::Path;
use std::process::Command;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cleanup::{CleanupGuard, CleanupPlan};
use config::{launcher_config, ConfigFile, ConfigLoad, Platform, CONFIG_FILE_NAME};
use exec::{build_launch_env, confirm_start, launch_command, run_calibre};
use paths::resolve_all;
use upgrade::{run_upgrade, upgrader_for};

/// Start calibre as a portable instance: configuration, libraries and
/// binaries all live next to this launcher.
#[derive(Parser, Debug)]
#[command(name = "calibre-portable", version)]
struct Cli {
    /// Download and install the latest calibre into the portable directory, then exit
    #[arg(short = 'u', long = "upgrade-install")]
    upgrade_install: bool,

    /// Create the config and library directories when they are missing
    #[arg(short = 'c', long = "create-dirs")]
    create_dirs: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Everything after argument parsing. Returns the process exit status.
/// `root` is the portable directory; `launch` starts calibre and waits for it.
fn run<R, W, L>(
    cli: &Cli,
    root: &Path,
    env: &HashMap<String, String>,
    platform: Platform,
    input: R,
    output: W,
    launch: L,
) -> anyhow::Result<i32>
where
    R: BufRead,
    W: Write,
    L: FnOnce(Command) -> anyhow::Result<i32>,
{
    let conf_path = root.join(CONFIG_FILE_NAME);
    let file = match ConfigFile::load_or_create(&conf_path, root, env, platform)? {
        ConfigLoad::Loaded(file) => file,
        ConfigLoad::Created => {
            eprintln!(
                "[calibre-portable] wrote {}; edit it to change the defaults",
                conf_path.display()
            );
            ConfigFile::default()
        }
    };
    let config = launcher_config(root, env, &file, platform);
    tracing::debug!(?config, "launcher config");

    let guard = CleanupGuard::new();
    if config.no_cleanup {
        eprintln!("[calibre-portable] CALIBRE_NO_CLEANUP set, leaving directories as they are");
    } else {
        guard.arm(CleanupPlan::for_config(&config));
    }

    if cli.upgrade_install {
        return match run_upgrade(upgrader_for(&config).as_ref()) {
            Ok(installed) => {
                match &installed.version {
                    Some(v) => eprintln!(
                        "[calibre-portable] calibre {v} installed, binaries in {}",
                        installed.bin_dir.display()
                    ),
                    None => eprintln!(
                        "[calibre-portable] calibre installed, binaries in {}",
                        installed.bin_dir.display()
                    ),
                }
                Ok(0)
            }
            Err(e) => {
                eprintln!("[calibre-portable] upgrade failed: {e:#}");
                Ok(1)
            }
        };
    }

    let paths = resolve_all(&config, cli.create_dirs)?;
    guard.update(|plan| plan.absorb(&paths));

    if let Some(bin) = &paths.bin_dir {
        tracing::info!(bin = %bin.display(), "using portable binaries");
    }
    let child_env = build_launch_env(&paths, &config);

    if !config.no_confirm {
        if !confirm_start(input, output)? {
            eprintln!("[calibre-portable] not starting calibre");
            return Ok(0);
        }
    }

    let cmd = launch_command(&paths.program, paths.library_dir.as_deref(), &child_env);
    launch(cmd)
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = cleanup::init_signal_handlers() {
        tracing::warn!("failed to install signal handlers: {e}");
    }

    let result = std::env::current_dir().map_err(anyhow::Error::from).and_then(|root| {
        let env: HashMap<String, String> = std::env::vars().collect();
        run(
            &cli,
            &root,
            &env,
            Platform::current(),
            std::io::stdin().lock(),
            std::io::stdout(),
            |cmd| Ok(run_calibre(cmd)?),
        )
    });
    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[calibre-portable] error: {e:#}");
            1
        }
    };
    // `process::exit` skips destructors. Normally a no-op: the guard in
    // `run` has already taken the plan.
    cleanup::run_pending();
    std::process::exit(code);
}
