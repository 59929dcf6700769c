//! ==============================================================================
//! ingest.rs - line -> decode -> log -> broadcast
//! ==============================================================================
//!
//! ```text
//! purpose:
//!     the single driving loop of the host. lines are handled strictly one at
//!     a time in arrival order, so viewers see events in the order the radio
//!     received them.
//!
//!         line source ──► decoder ──┬─ reading ──► sink (try_send) ──► broadcast
//!                                   ├─ error   ──────────────────────► broadcast
//!                                   └─ no packet (skipped)
//!
//!     every collaborator is passed in, nothing is global, so tests drive the
//!     loop with in-memory streams and sinks.
//!
//! shutdown:
//!     the loop ends when the source is exhausted, the shutdown future fires,
//!     or the source fails. the sink is drained and flushed in all three cases
//!     before run() returns, bounded by the sink's close timeout.
//! ```
//!
//! ==============================================================================

use crate::decoder::{Clock, PacketDecoder};
use crate::dispatcher::Broadcaster;
use crate::domain::{DecodedReading, TelemetryEvent};
use crate::sink::SinkHandle;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::io;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("line source failed: {0}")]
    Source(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub lines: u64,
    pub readings: u64,
    pub errors: u64,
    pub skipped: u64,
}

pub struct IngestLoop {
    decoder: PacketDecoder,
    clock: Arc<dyn Clock>,
    broadcaster: Broadcaster,
    sink: Option<SinkHandle>,
    show_sensor_data: bool,
}

impl IngestLoop {
    pub fn new(
        decoder: PacketDecoder,
        clock: Arc<dyn Clock>,
        broadcaster: Broadcaster,
        sink: Option<SinkHandle>,
    ) -> Self {
        Self {
            decoder,
            clock,
            broadcaster,
            sink,
            show_sensor_data: false,
        }
    }

    /// echo every decoded reading at info level
    pub fn show_sensor_data(mut self, show: bool) -> Self {
        self.show_sensor_data = show;
        self
    }

    pub async fn run<S, F>(mut self, mut lines: S, shutdown: F) -> Result<IngestStats, IngestError>
    where
        S: Stream<Item = io::Result<String>> + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = IngestStats::default();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, stopping ingest");
                    break Ok(());
                }
                next = lines.next() => match next {
                    Some(Ok(line)) => self.process(&line, &mut stats).await,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "line source failed, stopping ingest");
                        break Err(e);
                    }
                    None => {
                        tracing::info!("line source ended");
                        break Ok(());
                    }
                },
            }
        };

        if let Some(sink) = self.sink.take() {
            if sink.close().await {
                tracing::info!("reading log closed");
            }
        }
        tracing::info!(
            lines = stats.lines,
            readings = stats.readings,
            errors = stats.errors,
            skipped = stats.skipped,
            "ingest finished"
        );

        outcome.map(|()| stats).map_err(IngestError::from)
    }

    async fn process(&self, line: &str, stats: &mut IngestStats) {
        stats.lines += 1;

        let event = match self.decoder.decode(line, self.clock.as_ref()) {
            Ok(Some(reading)) => {
                stats.readings += 1;
                if self.show_sensor_data {
                    tracing::info!(sensor = reading.sensor_id, "{}", format_fields(&reading));
                }
                if let Some(sink) = &self.sink {
                    sink.append(reading.clone());
                }
                TelemetryEvent::Reading(reading)
            }
            Ok(None) => {
                stats.skipped += 1;
                tracing::trace!(line, "not a packet");
                return;
            }
            Err(err) => {
                stats.errors += 1;
                tracing::warn!(reason = ?err.reason, line = %err.raw_line, "{}", err);
                TelemetryEvent::Error(err)
            }
        };

        let report = self.broadcaster.publish(&event).await;
        tracing::debug!(delivered = report.delivered, dropped = report.dropped, "event published");
    }
}

fn format_fields(reading: &DecodedReading) -> String {
    reading
        .fields
        .iter()
        .map(|f| format!("{}={}", f.name, f.value))
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SystemClock;
    use crate::registry::SubscriberRegistry;
    use futures::stream;

    fn lines(raw: &[&str]) -> impl Stream<Item = io::Result<String>> + Unpin {
        stream::iter(raw.iter().map(|l| Ok(l.to_string())).collect::<Vec<_>>())
    }

    fn ingest(registry: &SubscriberRegistry) -> IngestLoop {
        IngestLoop::new(
            PacketDecoder::default(),
            Arc::new(SystemClock),
            Broadcaster::new(registry.clone()),
            None,
        )
    }

    #[tokio::test]
    async fn test_counts_each_outcome() {
        let registry = SubscriberRegistry::default();
        let stats = ingest(&registry)
            .run(
                lines(&[
                    "Received packet: [2;1013.25,23.5,100.0]",
                    "RSSI: -41.00 dBm, SNR: 9.75 dB",
                    "Received packet: [99;1,2,3]",
                    "No packet received, RX timeout.",
                    "Received packet: [6;20.0,50.0]",
                ]),
                std::future::pending(),
            )
            .await
            .unwrap();
        assert_eq!(
            stats,
            IngestStats { lines: 5, readings: 2, errors: 1, skipped: 2 }
        );
    }

    #[tokio::test]
    async fn test_timeout_line_publishes_nothing() {
        let registry = SubscriberRegistry::default();
        let (_sub, mut rx) = registry.register().await;
        ingest(&registry)
            .run(
                lines(&["No packet received, RX timeout", "Received packet: [6;1,2]"]),
                std::future::pending(),
            )
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(first.contains("\"sensorId\":6"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_source_error_is_returned() {
        let registry = SubscriberRegistry::default();
        let source = stream::iter(vec![
            Ok("Received packet: [6;1,2]".to_string()),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
            Ok("Received packet: [6;3,4]".to_string()),
        ]);
        let err = ingest(&registry)
            .run(source, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Source(e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[tokio::test]
    async fn test_shutdown_stops_pending_source() {
        let registry = SubscriberRegistry::default();
        let stats = ingest(&registry)
            .run(stream::pending::<io::Result<String>>(), async {})
            .await
            .unwrap();
        assert_eq!(stats, IngestStats::default());
    }
}
