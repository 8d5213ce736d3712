//! Minimal bootstrap binary: no terminal UI, no ASCII-art catalogue, no
//! discovery implementation (§1). Wiring order follows
//! `examples/original_source/scripts/main.py`: read identity, open the
//! store, bind the channel, run the event loop.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use cardlink::channel::SecureChannel;
use cardlink::config::Config;
use cardlink::credential::{CredentialProvider, SoftwareCredential};
use cardlink::forward::ForwardCoordinator;
use cardlink::store::Store;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let config = Config::parse();

    let common_name = prompt_identity_name()?;
    let credential: Arc<dyn CredentialProvider> = Arc::new(
        SoftwareCredential::generate(&common_name).context("failed to initialise identity")?,
    );
    let (_nickname, serial) = credential.identity();

    let data_dir = config.data_dir();
    let store = Arc::new(
        Store::open(&data_dir, credential.as_ref(), &serial)
            .context("failed to open encrypted store")?,
    );

    let bind_addr = format!("0.0.0.0:{}", config.port)
        .parse()
        .context("invalid bind address")?;
    let (mut channel, mut events) =
        SecureChannel::bind(bind_addr, credential, store.clone(), config.clone())
            .await
            .context("failed to bind secure channel")?;

    let coordinator = ForwardCoordinator::new(store, config.pending_flush_pace());

    info!("cardlink node \"{common_name}\" listening on port {}", config.port);

    loop {
        tokio::select! {
            result = channel.step() => {
                result.context("channel loop terminated")?;
            }
            Some(event) = events.recv() => {
                coordinator.handle_event(&mut channel, event).await;
            }
        }
    }
}

/// Stand-in for the smart-card PIN prompt (§6: "takes a PIN string at
/// process start; it is never written to disk and never re-prompted").
/// The software credential has no PIN to check, so this only collects the
/// display name that would otherwise come off the card's certificate.
fn prompt_identity_name() -> Result<String> {
    print!("identity name: ");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let name = line.trim();
    if name.is_empty() {
        anyhow::bail!("identity name must not be empty");
    }
    Ok(name.to_string())
}
