//! Health reporting for connection managers

use crate::registry::IdentityStatistics;

/// Health status of a connection manager
///
/// # Examples
///
/// ```
/// use esox_connection_manager::{HealthStatus, IdentityStatistics};
///
/// let stats = vec![IdentityStatistics {
///     host: "127.0.0.1".to_string(),
///     port: 2222,
///     username: "test".to_string(),
///     contexts: 2,
///     borrowed: 1,
/// }];
///
/// let health = HealthStatus::from_statistics(&stats, 8);
/// assert!(health.is_healthy());
/// assert_eq!(health.idle_connections, 1);
/// assert_eq!(health.utilization, 0.25);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthStatus {
    /// Whether the manager is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Registered slots over the capacity of all known identities (0.0 to 1.0)
    pub utilization: f64,

    /// Identities currently known
    pub identities: usize,

    /// Slots currently registered
    pub open_connections: usize,

    pub borrowed_connections: usize,

    pub idle_connections: usize,

    /// Configured per-identity connection limit
    pub max_connections_per_identity: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    pub fn from_statistics(statistics: &[IdentityStatistics], max_connection_size: usize) -> Self {
        let identities = statistics.len();
        let open: usize = statistics.iter().map(|stats| stats.contexts).sum();
        let borrowed: usize = statistics.iter().map(|stats| stats.borrowed).sum();

        let capacity = identities * max_connection_size;
        let utilization = if capacity > 0 {
            open as f64 / capacity as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        for stats in statistics {
            if stats.contexts >= max_connection_size {
                warnings.push(format!(
                    "{}@{}:{} is at its connection limit ({}/{})",
                    stats.username, stats.host, stats.port, stats.contexts, max_connection_size
                ));
                if stats.borrowed >= max_connection_size {
                    is_healthy = false;
                }
            }
        }

        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            identities,
            open_connections: open,
            borrowed_connections: borrowed,
            idle_connections: open.saturating_sub(borrowed),
            max_connections_per_identity: max_connection_size,
            warnings,
        }
    }

    /// Check if the manager is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
