//! Destinations for the aggregated [ObserverBuffer] of each reporting window.

use crate::Result;
use crate::observer::buffer::ObserverBuffer;

/// Posts an `event_forwarding_metrics` event over HTTP.
mod metadata;

/// Pushes window totals into the Prometheus registry.
mod prometheus;

pub use metadata::MetadataReporter;
pub use prometheus::PrometheusStatsReceiver;

#[trait_variant::make(StatsReceiver: Send)]
#[allow(dead_code)]
pub trait LocalStatsReceiver {
    /// Receives the buffer of a window that just closed.
    async fn send(&self, buffer: &ObserverBuffer) -> Result<()>;
}
