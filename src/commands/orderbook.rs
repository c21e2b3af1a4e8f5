// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use cojo_bitcoin::{IdentityKey, MemoryChain, SoftwareWallet, TransactionCache};
use cojo_net::{Daemon, DaemonEvent, IrcTransport, Offer};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::describe_fee;
use crate::config::Config;
use crate::error::{CliError, Result};
use crate::output::Output;

const JOIN_TIMEOUT: Duration = Duration::from_secs(60);

fn print_offers(out: &Output, offers: &[Offer]) {
    if offers.is_empty() {
        out.warn("No offers seen");
        return;
    }
    out.table_header(&[
        ("Counterparty", 18),
        ("Id", 5),
        ("Min", 12),
        ("Max", 14),
        ("Tx fee", 8),
        ("Cj fee", 16),
    ]);
    let mut offers = offers.to_vec();
    offers.sort_by(|a, b| a.key().cmp(&b.key()));
    for offer in &offers {
        let terms = &offer.terms;
        out.table_row(&[
            (&offer.counterparty, 18),
            (&terms.offer_id.to_string(), 5),
            (&terms.min_size.to_sat().to_string(), 12),
            (&terms.max_size.to_sat().to_string(), 14),
            (&terms.txfee.to_sat().to_string(), 8),
            (&describe_fee(&terms.cjfee), 16),
        ]);
    }
    out.newline();
    out.info(&format!("{} offers", offers.len()));
}

#[tracing::instrument(skip(out, cfg))]
pub fn cmd_orderbook(out: &Output, cfg: &Config, wait: u64, follow: bool) -> Result<()> {
    if cfg.channels.is_empty() {
        return Err(CliError::Config("no channels configured".into()));
    }

    out.header("Orderbook");
    for channel in &cfg.channels {
        out.field("Channel", &channel.label());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        // Watching needs an identity but never spends, so both are throwaway.
        let identity = IdentityKey::generate();
        let wallet = SoftwareWallet::new("watch-only", &rand::random::<[u8; 32]>())?;
        let mut daemon = Daemon::new(
            cfg.daemon_config(),
            Arc::new(identity),
            Arc::new(wallet),
            Arc::new(MemoryChain::new(1)),
        );
        for channel in &cfg.channels {
            daemon = daemon.with_channel(
                &channel.room,
                Box::new(IrcTransport::new(channel.irc_config())),
            );
        }
        if let Some(path) = &cfg.tx_cache {
            daemon = daemon.with_tx_cache(Arc::new(TransactionCache::open(path)?));
        }
        let (handle, task) = daemon.spawn()?;
        let mut events = handle.subscribe();

        let spinner = out.spinner("Joining channels...");
        let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(DaemonEvent::ChannelReady { channel, nick }) => {
                        info!(%channel, nick = %nick, "channel ready");
                        return Ok(());
                    }
                    Ok(DaemonEvent::ChannelFatal { channel, error }) => {
                        warn!(%channel, error = %error, "channel failed");
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(CliError::Net(cojo_net::NetError::DaemonStopped)),
                }
            }
        })
        .await;
        spinner.finish();
        match joined {
            Ok(result) => result?,
            Err(_) => return Err(CliError::Timeout("no channel could be joined".into())),
        }

        let asked = handle.request_orderbook().await?;
        debug!(channels = asked, "orderbook requested");
        let spinner = out.spinner(&format!("Collecting offers for {wait}s..."));
        tokio::time::sleep(Duration::from_secs(wait)).await;
        spinner.finish();
        print_offers(out, &handle.orderbook_snapshot().await?);

        if follow {
            out.info("Following offer updates... (Ctrl+C to stop)");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(DaemonEvent::OfferSeen(offer)) => out.info(&format!(
                            "+ {} #{} {}..{} {}",
                            offer.counterparty,
                            offer.terms.offer_id,
                            offer.terms.min_size.to_sat(),
                            offer.terms.max_size.to_sat(),
                            describe_fee(&offer.terms.cjfee)
                        )),
                        Ok(DaemonEvent::OfferCancelled { counterparty, offer_id }) => {
                            out.info(&format!("- {counterparty} #{offer_id}"));
                        }
                        Ok(DaemonEvent::PeerLeft { nick }) => debug!(nick = %nick, "peer left"),
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }

        handle.shutdown().await;
        let _ = task.await;
        Ok::<_, CliError>(())
    })
}
