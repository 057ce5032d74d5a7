//! blepty: bridge a BLE serial module to a pseudo-terminal.
//!
//! `blepty connect` links one JNHuaMao-style module (HM-10 and friends) to a
//! freshly allocated PTY so that ordinary serial tools can talk to it through
//! the printed slave path. `blepty list` shows what is in range.

mod ble;
mod commands;
mod config;
mod pty;

use blepty_core::BridgeError;
use clap::{Parser, Subcommand};
use config::{BridgeConfig, Overrides};
use std::path::PathBuf;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// blepty: BLE serial module to PTY bridge
#[derive(Parser, Debug)]
#[command(name = "blepty", version, about = "Bridge a BLE serial module to a pseudo-terminal")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "~/.blepty/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for nearby devices
    List {
        /// Scan duration in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Connect to each device and print its characteristics
        #[arg(long)]
        characteristics: bool,

        /// Bluetooth adapter index
        #[arg(long)]
        adapter: Option<usize>,
    },

    /// Bridge a device to a new PTY
    Connect {
        /// Device address, e.g. 00:0E:0B:03:05:FA
        #[arg(required_unless_present = "name")]
        address: Option<String>,

        /// Resolve the device by its advertised name instead
        #[arg(long)]
        name: Option<String>,

        /// Bytes per characteristic write
        #[arg(long)]
        mtu: Option<usize>,

        /// Extra attempts after a failed write
        #[arg(long)]
        retries: Option<u32>,

        /// Serial characteristic UUID
        #[arg(long)]
        characteristic: Option<String>,

        /// Bluetooth adapter index
        #[arg(long)]
        adapter: Option<usize>,
    },
}

impl Command {
    fn overrides(&self) -> Overrides {
        match self {
            Command::List {
                timeout, adapter, ..
            } => Overrides {
                adapter: *adapter,
                scan_timeout: *timeout,
                ..Overrides::default()
            },
            Command::Connect {
                mtu,
                retries,
                characteristic,
                adapter,
                ..
            } => Overrides {
                adapter: *adapter,
                characteristic: characteristic.clone(),
                mtu: *mtu,
                write_retries: *retries,
                scan_timeout: None,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing. RUST_LOG wins over the command line.
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose)
        .init();

    let cfg = match BridgeConfig::load(Some(&cli.config), &cli.command.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            eprintln!("blepty: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let result = match cli.command {
        Command::List {
            characteristics, ..
        } => commands::list::run(&cfg, characteristics).await.map(|()| 0),
        Command::Connect { address, name, .. } => {
            match commands::connect::Target::from_args(address, name) {
                Ok(target) => commands::connect::run(&cfg, target)
                    .await
                    .map(|reason| if reason.is_clean() { 0 } else { 1 }),
                Err(e) => Err(e),
            }
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("blepty: {e:#}");
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

/// Exit status for a failed command, taken from the underlying
/// [`BridgeError`] when there is one.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BridgeError>())
        .map_or(1, BridgeError::exit_code)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
pub(crate) async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn connect_requires_a_target() {
        assert!(Cli::try_parse_from(["blepty", "connect"]).is_err());
        assert!(Cli::try_parse_from(["blepty", "connect", "--name", "HMSoft"]).is_ok());
    }

    #[test]
    fn connect_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "blepty",
            "connect",
            "00:0E:0B:03:05:FA",
            "--mtu",
            "64",
            "--retries",
            "5",
        ])
        .unwrap();
        let overrides = cli.command.overrides();
        assert_eq!(overrides.mtu, Some(64));
        assert_eq!(overrides.write_retries, Some(5));
        assert_eq!(overrides.adapter, None);
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["blepty", "list", "--timeout", "4", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.command.overrides().scan_timeout, Some(4));
    }

    #[test]
    fn exit_code_sees_through_context() {
        let err = Err::<(), _>(BridgeError::Allocation("no ptys".into()))
            .context("opening terminal")
            .unwrap_err();
        assert_eq!(exit_code(&err), 4);
        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }
}
