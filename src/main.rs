use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use warp::Filter;

use sfu::conference::ConferenceParams;
use sfu::metrics::register_metrics;
use sfu::router::Router;
use sfu::signaling::{OutboundMessage, Recipient, SignalingEnvelope, SignalingTransport};
use sfu::{config, logging};

/// Bus adapter: outbound messages leave as newline-delimited JSON on
/// stdout; the store-and-forward service on the other side of the pipe
/// owns actual delivery.
struct JsonLinesTransport {
    stdout: Mutex<tokio::io::Stdout>,
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    to: &'a Recipient,
    message: &'a OutboundMessage,
}

#[async_trait]
impl SignalingTransport for JsonLinesTransport {
    async fn send(&self, to: &Recipient, message: OutboundMessage) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&OutboundFrame {
            to,
            message: &message,
        })?;
        line.push('\n');
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Reads inbound bus events (one JSON envelope per line) from stdin.
fn spawn_bus_reader(events_tx: mpsc::Sender<SignalingEnvelope>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<SignalingEnvelope>(&line) {
                        Ok(envelope) => {
                            if events_tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!(error = %err, "dropping malformed bus event"),
                    }
                }
                Ok(None) => {
                    info!("signaling bus closed (stdin EOF)");
                    return;
                }
                Err(err) => {
                    error!(error = %err, "bus read error");
                    return;
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Validate configuration before starting anything
    let cfg = config::load().unwrap_or_else(|e| {
        eprintln!("Configuration validation failed: {}", e);
        std::process::exit(1);
    });

    logging::init(&cfg.log);
    register_metrics();

    if let Some(telemetry) = &cfg.telemetry {
        info!(endpoint = %telemetry.endpoint, protocol = %telemetry.protocol, "telemetry export configured");
    }

    // Start Metrics Server
    let metrics_port = cfg.metrics_port;
    let metrics_handle = tokio::spawn(async move {
        let metrics_route = warp::path("metrics")
            .and(warp::get())
            .map(sfu::metrics::render);

        info!("Metrics server listening on 0.0.0.0:{}", metrics_port);
        warp::serve(metrics_route)
            .run(([0, 0, 0, 0], metrics_port))
            .await;
    });

    info!(user = %cfg.matrix.user_id, homeserver = %cfg.matrix.homeserver_url, "SFU starting");

    let transport = Arc::new(JsonLinesTransport {
        stdout: Mutex::new(tokio::io::stdout()),
    });
    let (events_tx, events_rx) = mpsc::channel(256);
    spawn_bus_reader(events_tx);

    let router = Router::new(ConferenceParams::from_config(&cfg), transport);
    let router_task = tokio::spawn(router.run(events_rx));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal (SIGINT/SIGTERM)");
        }
        _ = router_task => {
            info!("Router finished");
        }
    }

    metrics_handle.abort();
    info!("SFU shutdown complete");
    Ok(())
}
