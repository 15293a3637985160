//! Metrics collection and export for connection managers

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Metrics data for a connection manager
///
/// # Examples
///
/// ```
/// use esox_connection_manager::ManagerMetrics;
///
/// let metrics = ManagerMetrics::default();
/// let exported = metrics.export();
/// assert_eq!(exported["total_borrowed"], "0");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ManagerMetrics {
    /// Successful borrows, however they were satisfied
    pub total_borrowed: usize,

    /// Borrows served by the calling context's own idle slot
    pub total_reused: usize,

    /// Borrows served by taking over another context's idle slot
    pub total_stolen: usize,

    /// Borrows that opened a new connection
    pub total_created: usize,

    /// Explicit releases
    pub total_released: usize,

    /// Explicit closes
    pub total_closed: usize,

    /// Slots forced back to idle after the borrow timeout
    pub evicted_released: usize,

    /// Slots closed by eviction (idle timeout or size limit)
    pub evicted_closed: usize,

    /// Borrows rejected at the connection limit
    pub over_limit_rejections: usize,

    /// Disconnects that reported an error
    pub disconnect_failures: usize,

    /// Identities currently known
    pub identities: usize,

    /// Slots currently registered
    pub open_connections: usize,

    /// Slots currently borrowed
    pub borrowed_connections: usize,
}

impl ManagerMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_borrowed".to_string(), self.total_borrowed.to_string());
        metrics.insert("total_reused".to_string(), self.total_reused.to_string());
        metrics.insert("total_stolen".to_string(), self.total_stolen.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert("total_closed".to_string(), self.total_closed.to_string());
        metrics.insert("evicted_released".to_string(), self.evicted_released.to_string());
        metrics.insert("evicted_closed".to_string(), self.evicted_closed.to_string());
        metrics.insert("over_limit_rejections".to_string(), self.over_limit_rejections.to_string());
        metrics.insert("disconnect_failures".to_string(), self.disconnect_failures.to_string());
        metrics.insert("identities".to_string(), self.identities.to_string());
        metrics.insert("open_connections".to_string(), self.open_connections.to_string());
        metrics.insert("borrowed_connections".to_string(), self.borrowed_connections.to_string());
        metrics
    }

    /// Currently registered slots that are not borrowed
    pub fn idle_connections(&self) -> usize {
        self.open_connections.saturating_sub(self.borrowed_connections)
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "prometheus")]
pub struct MetricsExporter;

#[cfg(feature = "prometheus")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format.
    ///
    /// `manager_name` and every tag become constant labels on each series.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connection_manager::{ManagerMetrics, MetricsExporter};
    /// use std::collections::HashMap;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "ingest".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&ManagerMetrics::default(), "sftp", Some(&tags)).unwrap();
    /// assert!(output.contains("connections_open"));
    /// assert!(output.contains("service=\"ingest\""));
    /// ```
    pub fn export_prometheus(
        metrics: &ManagerMetrics,
        manager_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let mut labels = HashMap::new();
        labels.insert("manager".to_string(), manager_name.to_string());
        if let Some(tags) = tags {
            for (key, value) in tags {
                labels.insert(key.clone(), value.clone());
            }
        }
        let registry = Registry::new_custom(None, Some(labels))?;

        let gauges = [
            ("connections_identities", "Identities currently known", metrics.identities),
            ("connections_open", "Connections currently registered", metrics.open_connections),
            ("connections_borrowed", "Connections currently borrowed", metrics.borrowed_connections),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(Opts::new(name, help))?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge))?;
        }

        let counters = [
            ("connections_borrowed_total", "Successful borrows", metrics.total_borrowed),
            ("connections_reused_total", "Borrows served by the caller's idle slot", metrics.total_reused),
            ("connections_stolen_total", "Borrows served by another context's idle slot", metrics.total_stolen),
            ("connections_created_total", "Connections opened", metrics.total_created),
            ("connections_released_total", "Explicit releases", metrics.total_released),
            ("connections_closed_total", "Explicit closes", metrics.total_closed),
            ("connections_evicted_released_total", "Slots released by the borrow timeout", metrics.evicted_released),
            ("connections_evicted_closed_total", "Slots closed by eviction", metrics.evicted_closed),
            ("connections_over_limit_total", "Borrows rejected at the connection limit", metrics.over_limit_rejections),
            ("connections_disconnect_failures_total", "Failed disconnects", metrics.disconnect_failures),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            counter.inc_by(value as u64);
            registry.register(Box::new(counter))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Internal metrics tracker
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    pub total_borrowed: AtomicUsize,
    pub total_reused: AtomicUsize,
    pub total_stolen: AtomicUsize,
    pub total_created: AtomicUsize,
    pub total_released: AtomicUsize,
    pub total_closed: AtomicUsize,
    pub evicted_released: AtomicUsize,
    pub evicted_closed: AtomicUsize,
    pub over_limit_rejections: AtomicUsize,
    pub disconnect_failures: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, identities: usize, open: usize, borrowed: usize) -> ManagerMetrics {
        ManagerMetrics {
            total_borrowed: self.total_borrowed.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
            total_stolen: self.total_stolen.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            total_closed: self.total_closed.load(Ordering::Relaxed),
            evicted_released: self.evicted_released.load(Ordering::Relaxed),
            evicted_closed: self.evicted_closed.load(Ordering::Relaxed),
            over_limit_rejections: self.over_limit_rejections.load(Ordering::Relaxed),
            disconnect_failures: self.disconnect_failures.load(Ordering::Relaxed),
            identities,
            open_connections: open,
            borrowed_connections: borrowed,
        }
    }
}
