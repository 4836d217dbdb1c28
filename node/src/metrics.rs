//! # Prometheus Metrics
//!
//! Operational metrics for a serving node, rendered at `/metrics`.
//!
//! Metrics live in a dedicated [`prometheus::Registry`] with an `omega`
//! prefix so they never collide with anything in the default registry.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use omega_protocol::Event;

/// Metric handles for the node. Cheap to clone.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Block count of the log.
    pub log_length: IntGauge,
    /// Payload bytes in the log.
    pub log_byte_length: IntGauge,
    /// Blocks the log has grown by since start, locally or from peers.
    pub appended_blocks_total: IntCounter,
    /// Blocks verified and stored after arriving from a peer.
    pub downloaded_blocks_total: IntCounter,
    /// Currently open replication connections.
    pub connected_peers: IntGauge,
}

impl NodeMetrics {
    /// Create and register every metric.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("omega".into()), None)?;

        let log_length = IntGauge::new("log_length", "Number of blocks in the log")?;
        registry.register(Box::new(log_length.clone()))?;

        let log_byte_length =
            IntGauge::new("log_byte_length", "Total payload bytes in the log")?;
        registry.register(Box::new(log_byte_length.clone()))?;

        let appended_blocks_total = IntCounter::new(
            "appended_blocks_total",
            "Blocks the log has grown by since start",
        )?;
        registry.register(Box::new(appended_blocks_total.clone()))?;

        let downloaded_blocks_total = IntCounter::new(
            "downloaded_blocks_total",
            "Blocks verified and stored after download from a peer",
        )?;
        registry.register(Box::new(downloaded_blocks_total.clone()))?;

        let connected_peers = IntGauge::new(
            "connected_peers",
            "Number of open replication connections",
        )?;
        registry.register(Box::new(connected_peers.clone()))?;

        Ok(Self {
            registry,
            log_length,
            log_byte_length,
            appended_blocks_total,
            downloaded_blocks_total,
            connected_peers,
        })
    }

    /// Fold one log event into the metrics.
    pub fn observe(&self, event: &Event) {
        match event {
            Event::Append {
                length,
                byte_length,
            } => {
                let previous = self.log_length.get().max(0) as u64;
                if *length > previous {
                    self.appended_blocks_total.inc_by(*length - previous);
                }
                self.log_length.set(*length as i64);
                self.log_byte_length.set(*byte_length as i64);
            }
            Event::Download { .. } => self.downloaded_blocks_total.inc(),
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Render `/metrics`. HTTP 500 if encoding fails.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_move_the_counters() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.log_length.set(2);
        metrics.observe(&Event::Append {
            length: 5,
            byte_length: 40,
        });
        metrics.observe(&Event::Download {
            index: 4,
            value: vec![1],
            peer: Some(0),
        });

        assert_eq!(metrics.log_length.get(), 5);
        assert_eq!(metrics.log_byte_length.get(), 40);
        assert_eq!(metrics.appended_blocks_total.get(), 3);
        assert_eq!(metrics.downloaded_blocks_total.get(), 1);

        let text = metrics.encode().unwrap();
        assert!(text.contains("omega_log_length 5"));
        assert!(text.contains("omega_downloaded_blocks_total 1"));
    }
}
