//! CLI command implementations

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use passlock_guard::{DeviceIdentity, FileSettingsStore, GuardConfig, PasscodeGuard};

/// Passlock CLI - passcode guard with trusted-time lockout
#[derive(Parser)]
#[command(name = "passlock")]
#[command(about = "Passcode guard with brute-force lockout on network time")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set or replace the passcode
    Set {
        /// Passcode (read from stdin when omitted)
        #[arg(short, long)]
        passcode: Option<String>,
    },

    /// Check a passcode
    Verify {
        /// Passcode (read from stdin when omitted)
        #[arg(short, long)]
        passcode: Option<String>,
    },

    /// Show guard state
    Status,

    /// Minutes since the last successful unlock
    SinceUnlock,

    /// Record the current trusted time as the last unlock
    Touch,
}

/// Run the CLI
pub async fn run(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config);
    let config = load_or_init_config(&config_path)?;
    let guard = open_guard(&config).await?;

    let stdin = std::io::stdin();
    let output = execute(&guard, cli.command, &mut stdin.lock()).await?;
    println!("{}", output);
    Ok(())
}

/// Build a guard from configuration
pub async fn open_guard(config: &GuardConfig) -> Result<PasscodeGuard> {
    config.ensure_directories()?;

    let device = DeviceIdentity::load_or_create(&config.device_id_path)
        .context("loading device identity")?;
    let store = FileSettingsStore::open(&config.settings_path)
        .await
        .context("opening settings store")?;

    Ok(PasscodeGuard::new(
        Arc::new(store),
        Arc::new(config.time_provider()),
        device,
    )
    .with_policy(config.lockout_policy()?))
}

/// Execute one command, returning the text to print
pub async fn execute(
    guard: &PasscodeGuard,
    command: Commands,
    input: &mut impl BufRead,
) -> Result<String> {
    match command {
        Commands::Set { passcode } => {
            let passcode = read_passcode(passcode, input)?;
            guard.set_passcode(&passcode).await?;
            Ok("Passcode set".to_string())
        }

        Commands::Verify { passcode } => {
            let passcode = read_passcode(passcode, input)?;
            guard.verify(&passcode).await?;
            Ok("Passcode accepted".to_string())
        }

        Commands::Status => {
            let state = guard.state().await?;
            let mut lines = vec![format!("State: {}", state)];

            if let Some(settings) = guard.settings().await? {
                lines.push(format!("Failed attempts: {}", settings.failed_attempts));
                if let Some(locked_at) = settings.locked_at {
                    lines.push(format!("Locked at: {}", locked_at.to_rfc3339()));
                }
                if let Some(last_unlocked_at) = settings.last_unlocked_at {
                    lines.push(format!("Last unlocked: {}", last_unlocked_at.to_rfc3339()));
                }
            }

            Ok(lines.join("\n"))
        }

        Commands::SinceUnlock => {
            let minutes = guard.time_since_last_unlock().await?;
            Ok(format!("{} minutes since last unlock", minutes))
        }

        Commands::Touch => {
            guard.touch_last_unlocked().await?;
            Ok("Last unlock time updated".to_string())
        }
    }
}

/// Take the passcode from the argument or the first line of `input`
fn read_passcode(arg: Option<String>, input: &mut impl BufRead) -> Result<Zeroizing<String>> {
    let passcode = match arg {
        Some(passcode) => Zeroizing::new(passcode),
        None => {
            let mut line = Zeroizing::new(String::new());
            input.read_line(&mut line)?;
            Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string())
        }
    };

    if passcode.is_empty() {
        bail!("passcode must not be empty");
    }
    Ok(passcode)
}

fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("PASSLOCK_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| {
            #[cfg(unix)]
            let fallback = PathBuf::from("/etc");
            #[cfg(windows)]
            let fallback = PathBuf::from(r"C:\ProgramData");

            dirs::config_dir()
                .unwrap_or(fallback)
                .join("passlock")
                .join("config.json")
        })
}

fn load_or_init_config(path: &Path) -> Result<GuardConfig> {
    if path.exists() {
        return GuardConfig::load(path)
            .with_context(|| format!("loading config from {:?}", path));
    }

    let config = GuardConfig::default();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(path)?;
    info!("Created default config at {:?}", path);
    Ok(config)
}
