//! `blepty connect`: bridge one device to a new PTY.
//!
//! Resolves the target, brings the link up, prints the slave path on stdout
//! and relays until either side goes away or a signal arrives.

use anyhow::{bail, Context, Result};
use blepty_core::{ForwardingEngine, ShutdownReason};
use btleplug::api::BDAddr;
use std::future::Future;
use std::io::Write;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ble::{self, scanner, BtleLink};
use crate::config::BridgeConfig;
use crate::pty::NativePtyAllocator;
use crate::shutdown_signal;

/// Which device to bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(BDAddr),
    Name(String),
}

impl Target {
    /// Build the target from the positional address and `--name`. The
    /// address wins when both are given.
    pub fn from_args(address: Option<String>, name: Option<String>) -> Result<Self> {
        match (address, name) {
            (Some(address), _) => Ok(Target::Address(ble::parse_address(&address)?)),
            (None, Some(name)) if !name.is_empty() => Ok(Target::Name(name)),
            _ => bail!("a device address or --name is required"),
        }
    }
}

/// Run the bridge until it shuts down and report why.
pub async fn run(cfg: &BridgeConfig, target: Target) -> Result<ShutdownReason> {
    let adapter = ble::open_adapter(cfg.adapter)
        .await
        .context("failed to open bluetooth adapter")?;

    let address = match target {
        Target::Address(addr) => addr,
        Target::Name(name) => {
            info!(name = %name, "resolving device by name");
            let found = scanner::scan(&adapter, cfg.scan_timeout)
                .await
                .context("scan failed")?;
            scanner::resolve_name(found.iter().map(|d| &d.info), &name)?
        }
    };
    let address = address.to_string();

    let link = BtleLink::new(adapter, cfg.link_settings());
    let allocator = NativePtyAllocator::new(cfg.raw_mode, cfg.world_accessible);
    let engine = ForwardingEngine::new(cfg.engine.clone());

    let stop = engine.stop_token();
    let signals = cancel_on(shutdown_signal(), stop.clone());

    let session = tokio::select! {
        session = engine.establish(link, &address, &allocator) => {
            session.with_context(|| format!("cannot bridge {address}"))?
        }
        _ = stop.cancelled() => {
            info!("interrupted during setup");
            return Ok(ShutdownReason::Stopped);
        }
    };

    {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", session.slave_path().display())
            .context("failed to print slave path")?;
        out.flush().context("failed to flush stdout")?;
    }
    debug!(mtu = session.mtu(), link = %session.link_state(), "relaying");

    let reason = engine.run(session).await;
    signals.abort();
    Ok(reason)
}

/// Cancel `token` once `signal` completes. The listener stays installed for
/// the whole session, setup included.
fn cancel_on<F>(signal: F, token: CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        signal.await;
        info!("received shutdown signal");
        token.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn signal_cancels_token() {
        let token = CancellationToken::new();
        let (fire, fired) = tokio::sync::oneshot::channel::<()>();
        let handle = cancel_on(
            async move {
                let _ = fired.await;
            },
            token.clone(),
        );

        assert!(!token.is_cancelled());
        fire.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn signal_before_setup_finishes_is_kept() {
        let token = CancellationToken::new();
        let _handle = cancel_on(async {}, token.clone());

        // Nothing is awaiting the token yet; the cancellation must still stick.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(token.is_cancelled());
    }

    #[test]
    fn address_wins_over_name() {
        let target =
            Target::from_args(Some("00:0E:0B:03:05:FA".into()), Some("HMSoft".into())).unwrap();
        assert_eq!(
            target,
            Target::Address(BDAddr::from_str("00:0E:0B:03:05:FA").unwrap())
        );
    }

    #[test]
    fn name_only() {
        let target = Target::from_args(None, Some("HMSoft".into())).unwrap();
        assert_eq!(target, Target::Name("HMSoft".into()));
    }

    #[test]
    fn bad_address_exits_with_three() {
        let err = Target::from_args(Some("00:0E:0B".into()), None).unwrap_err();
        assert_eq!(crate::exit_code(&err), 3);
    }

    #[test]
    fn nothing_to_connect_to() {
        let err = Target::from_args(None, None).unwrap_err();
        assert_eq!(crate::exit_code(&err), 1);
    }
}
