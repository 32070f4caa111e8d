//! Skald fleet types.
//!
//! Skald records are in-memory only: they appear when an executor
//! registers itself in the cache and disappear on stale eviction. Status
//! is always derived, never written directly.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The deployment kind of a skald.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkaldKind {
    /// Full executor node; dispatch-eligible.
    Node,
    /// Edge executor running a local task bundle; never dispatched to.
    Edge,
}

impl SkaldKind {
    /// Returns true if the dispatcher may assign tasks to this kind.
    #[must_use]
    pub const fn is_dispatch_eligible(self) -> bool {
        matches!(self, Self::Node)
    }

    /// Parses the cache representation (`"node"` / `"edge"`,
    /// case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown kinds.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "node" => Ok(Self::Node),
            "edge" => Ok(Self::Edge),
            other => Err(Error::validation(format!("unknown skald kind: {other}"))),
        }
    }
}

impl std::fmt::Display for SkaldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node => write!(f, "Node"),
            Self::Edge => write!(f, "Edge"),
        }
    }
}

/// Derived liveness of a skald.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkaldStatus {
    /// Recently active with a moving heartbeat.
    Online,
    /// Stale registration or a hung heartbeat.
    Offline,
}

/// Derives skald status from raw observations.
///
/// Kept as a free function so the monitor and tests share one rule:
/// `Online` iff `now - last_active <= stale_threshold` and the last
/// `stuck_window` heartbeat samples are not all identical. A hung
/// executor that still touches the registry timestamp fails the second
/// clause.
#[must_use]
pub fn derive_status(
    now: DateTime<Utc>,
    last_active: DateTime<Utc>,
    stale_threshold: Duration,
    heartbeat_window: &[i32],
    stuck_window: usize,
) -> SkaldStatus {
    if now.signed_duration_since(last_active) > stale_threshold {
        return SkaldStatus::Offline;
    }
    if heartbeat_window.len() >= stuck_window {
        let recent = &heartbeat_window[heartbeat_window.len() - stuck_window..];
        if let Some(first) = recent.first() {
            if recent.iter().all(|sample| sample == first) {
                return SkaldStatus::Offline;
            }
        }
    }
    SkaldStatus::Online
}

impl std::fmt::Display for SkaldStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stale() -> Duration {
        Duration::seconds(10)
    }

    #[test]
    fn kind_parse_accepts_cache_values() {
        assert_eq!(SkaldKind::parse("node").unwrap(), SkaldKind::Node);
        assert_eq!(SkaldKind::parse("EDGE").unwrap(), SkaldKind::Edge);
        assert!(SkaldKind::parse("cloud").is_err());
    }

    #[test]
    fn only_nodes_are_dispatch_eligible() {
        assert!(SkaldKind::Node.is_dispatch_eligible());
        assert!(!SkaldKind::Edge.is_dispatch_eligible());
    }

    #[test]
    fn fresh_moving_heartbeat_is_online() {
        let now = Utc::now();
        let status = derive_status(now, now, stale(), &[1, 2, 3, 4, 5], 5);
        assert_eq!(status, SkaldStatus::Online);
    }

    #[test]
    fn stale_boundary_is_inclusive() {
        let now = Utc::now();
        // Exactly at the threshold: still online.
        let status = derive_status(now, now - stale(), stale(), &[1, 2], 5);
        assert_eq!(status, SkaldStatus::Online);
        // One millisecond past: offline.
        let status = derive_status(
            now,
            now - stale() - Duration::milliseconds(1),
            stale(),
            &[1, 2],
            5,
        );
        assert_eq!(status, SkaldStatus::Offline);
    }

    #[test]
    fn flat_heartbeat_window_forces_offline() {
        let now = Utc::now();
        // Fresh last-active but five identical samples: a hung executor.
        let status = derive_status(now, now, stale(), &[7, 7, 7, 7, 7], 5);
        assert_eq!(status, SkaldStatus::Offline);
        // A single differing sample keeps it online.
        let status = derive_status(now, now, stale(), &[7, 7, 8, 7, 7], 5);
        assert_eq!(status, SkaldStatus::Online);
    }

    #[test]
    fn unsaturated_window_does_not_force_offline() {
        let now = Utc::now();
        let status = derive_status(now, now, stale(), &[7, 7, 7], 5);
        assert_eq!(status, SkaldStatus::Online);
    }
}
