//! Headless signal monitor.
//!
//! Connects with [`FeedConfig::from_env`], logs regime transitions and volatility spikes as they
//! arrive, and periodically logs store statistics until Ctrl-C.

use rustls::crypto::ring::default_provider;
use signal_feed::{
    FeedConfig, SignalClient, init_logging,
    highlight::HighlightTracker,
    selector,
    signal::kind::{RegimeUpdates, VolatilitySpikes},
    transport::{Channel, TransportEvent},
};
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(30);
const HISTORY_LIMIT: usize = 100;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let _ = default_provider().install_default();

    let config = FeedConfig::from_env()?;
    info!(endpoint = %config.transport.endpoint()?, wire_format = %config.transport.wire_format, "starting signal monitor");

    let highlights = HighlightTracker::new(config.highlight_ttl);
    let client = SignalClient::new(config)?;

    client.on_error(|error| {
        if error.is_terminal() {
            error!(%error, "transport gave up");
        } else {
            warn!(%error, "transport error");
        }
    });
    client.transport().on(Channel::Disconnect, |event| {
        if let TransportEvent::Disconnect(reason) = event {
            info!(%reason, "signal feed disconnected");
        }
    });

    client.bus().subscribe(RegimeUpdates, |signal, update| {
        info!(
            symbol = %signal.symbol,
            timeframe = %update.timeframe,
            regime = %update.regime,
            adx = update.adx,
            atr_pct = update.atr_pct,
            "regime update"
        );
    });
    client.bus().subscribe(VolatilitySpikes, |signal, spike| {
        info!(
            symbol = %signal.symbol,
            volatility = spike.volatility,
            change = spike.volatility_change,
            "volatility spike"
        );
    });

    // Seed regime history before going live, so the first render is not empty
    if let Some(subscription) = client.config().default_subscription.clone() {
        for symbol in &subscription.symbols {
            for timeframe in &subscription.timeframes {
                match client
                    .seed_regime_history(symbol, timeframe, HISTORY_LIMIT)
                    .await
                {
                    Ok(stored) => info!(%symbol, %timeframe, stored, "seeded regime history"),
                    Err(error) => warn!(%symbol, %timeframe, %error, "failed to seed regime history"),
                }
            }
        }
    }

    client.connect();

    let expiry = {
        let highlights = highlights.clone();
        tokio::spawn(async move {
            highlights
                .run_expiry(|expired| info!(expired, "highlights cleared"))
                .await
        })
    };

    let mut stats = interval(STATS_INTERVAL);
    let mut previous = Vec::new();

    loop {
        tokio::select! {
            _ = stats.tick() => {
                let (feed, version) = {
                    let store = client.store().read();
                    (selector::volatility_feed(&store), store.version())
                };
                let changed = highlights.mark_changes(&previous, &feed);

                info!(
                    status = %client.transport().status(),
                    version,
                    kinds = ?client.active_kinds(),
                    volatility_rows = feed.len(),
                    changed,
                    rooms = ?client.subscriptions().rooms(),
                    "store stats"
                );
                previous = feed;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    error!(%error, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    info!("shutting down");
    expiry.abort();
    client.shutdown();

    Ok(())
}
