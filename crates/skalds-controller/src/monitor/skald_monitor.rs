//! Skald monitor: periodic fleet-view rebuild from the cache.
//!
//! Per cycle the monitor reads the fleet registry hash and the mode hash,
//! then the per-skald keys for every id still within the stale window. A
//! skald whose last-active already exceeds the threshold is marked
//! OFFLINE eagerly without further network I/O. Records for ids absent
//! from the registry beyond the evict threshold are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;

use skalds_core::cache::keys;
use skalds_core::model::skald::derive_status;
use skalds_core::{CacheBackend, Clock, SkaldId, SkaldKind, SkaldStatus};

use crate::error::Result;
use crate::metrics::{labels, names};
use crate::state::{SkaldRecord, SkaldStore};

/// Tuning for the skald monitor.
#[derive(Debug, Clone)]
pub struct SkaldMonitorConfig {
    /// Cycle interval.
    pub sync_interval: Duration,
    /// Last-active age after which a skald is OFFLINE.
    pub stale_threshold: Duration,
    /// Registry absence after which a record is evicted.
    pub evict_threshold: Duration,
    /// Heartbeat ring length used for hung-executor detection.
    pub stuck_window: usize,
}

/// Rebuilds the [`SkaldStore`] from cache state on a timer.
pub struct SkaldMonitor {
    cache: Arc<dyn CacheBackend>,
    store: Arc<SkaldStore>,
    clock: Arc<dyn Clock>,
    config: SkaldMonitorConfig,
    // When each known id was last present in the registry hash.
    registry_seen: Mutex<HashMap<SkaldId, DateTime<Utc>>>,
}

impl std::fmt::Debug for SkaldMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkaldMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SkaldMonitor {
    /// Creates a monitor over the given cache and store.
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        store: Arc<SkaldStore>,
        clock: Arc<dyn Clock>,
        config: SkaldMonitorConfig,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            config,
            registry_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Runs cycles until shutdown is requested.
    ///
    /// Failed cycles are logged and skipped; the loop never dies to a
    /// transient cache outage.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(error) = self.run_cycle().await {
                counter!(
                    names::MONITOR_CYCLE_FAILURES_TOTAL,
                    labels::COMPONENT => "skald_monitor",
                )
                .increment(1);
                tracing::warn!(error = %error, "skald monitor cycle failed; skipping");
            }
        }
        tracing::info!("skald monitor drained");
    }

    /// Runs one monitor cycle.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry hash cannot be read; per-skald
    /// read failures only skip that skald.
    pub async fn run_cycle(&self) -> Result<()> {
        let registry = self
            .cache
            .get_all_hash_fields(keys::SKALD_REGISTRY_HASH)
            .await?;
        let modes = self.cache.get_all_hash_fields(keys::SKALD_MODE_HASH).await?;
        let now = self.clock.now();

        for (field, last_active_raw) in &registry {
            let Ok(id) = SkaldId::new(field.clone()) else {
                continue;
            };
            let Some(last_active) = parse_millis(last_active_raw) else {
                tracing::warn!(skald_id = %id, value = %last_active_raw, "bad last-active value");
                continue;
            };
            self.registry_seen
                .lock()
                .expect("registry bookkeeping lock poisoned")
                .insert(id.clone(), now);

            let kind = modes
                .get(field)
                .map_or(SkaldKind::Node, |raw| SkaldKind::parse(raw).unwrap_or(SkaldKind::Node));

            if let Err(error) = self.refresh_skald(&id, kind, last_active, now).await {
                tracing::warn!(skald_id = %id, error = %error, "skald refresh failed; skipping");
            }
        }

        self.evict_departed(&registry, now);
        self.emit_gauges();
        Ok(())
    }

    async fn refresh_skald(
        &self,
        id: &SkaldId,
        kind: SkaldKind,
        last_active: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let stale =
            now.signed_duration_since(last_active) > chrono_duration(self.config.stale_threshold);

        let mut record = self
            .store
            .get(id)
            .unwrap_or_else(|| SkaldRecord::new(id.clone(), kind, last_active));
        record.kind = kind;
        record.last_active = last_active;

        if stale {
            // Eagerly offline: no per-skald I/O for a stale registration.
            record.status = SkaldStatus::Offline;
            self.store.upsert(record);
            return Ok(());
        }

        if let Some(heartbeat) = self
            .cache
            .get_string(&keys::skald_heartbeat(id))
            .await?
            .and_then(|raw| raw.trim().parse::<i32>().ok())
        {
            record.record_heartbeat(heartbeat, self.config.stuck_window);
        }

        let allowed = self
            .cache
            .read_list(&keys::skald_allowed_classes(id), 0, -1)
            .await?;
        record.supported_task_types = allowed.into_iter().collect();

        let claimed = self.cache.read_list(&keys::skald_all_tasks(id), 0, -1).await?;
        record.current_tasks = claimed
            .into_iter()
            .filter_map(|raw| skalds_core::TaskId::new(raw).ok())
            .collect();

        let window: Vec<i32> = record.heartbeat_history.iter().copied().collect();
        record.status = derive_status(
            now,
            last_active,
            chrono_duration(self.config.stale_threshold),
            &window,
            self.config.stuck_window,
        );

        self.store.upsert(record);
        Ok(())
    }

    fn evict_departed(&self, registry: &HashMap<String, String>, now: DateTime<Utc>) {
        let evict_after = chrono_duration(self.config.evict_threshold);
        let mut seen = self
            .registry_seen
            .lock()
            .expect("registry bookkeeping lock poisoned");

        for id in self.store.ids() {
            if registry.contains_key(id.as_str()) {
                continue;
            }
            // Unknown ids (e.g. after a controller restart) start their
            // absence clock now.
            let last_seen = *seen.entry(id.clone()).or_insert(now);
            if now.signed_duration_since(last_seen) > evict_after {
                tracing::info!(skald_id = %id, "evicting departed skald");
                self.store.remove(&id);
                seen.remove(&id);
            } else {
                // Still within the grace period, but no longer fresh.
                self.store.update_with(&id, |record| {
                    record.status = SkaldStatus::Offline;
                });
            }
        }
    }

    fn emit_gauges(&self) {
        let snapshot = self.store.snapshot();
        let online = snapshot
            .iter()
            .filter(|record| record.status == SkaldStatus::Online)
            .count();
        gauge!(names::SKALDS_REGISTERED, labels::STATUS => "online").set(online as f64);
        gauge!(names::SKALDS_REGISTERED, labels::STATUS => "offline")
            .set((snapshot.len() - online) as f64);
    }

    /// Component details for the status endpoint.
    #[must_use]
    pub fn status_details(&self) -> serde_json::Value {
        serde_json::json!({
            "intervalSecs": self.config.sync_interval.as_secs(),
            "staleThresholdSecs": self.config.stale_threshold.as_secs(),
            "registeredSkalds": self.store.len(),
        })
    }
}

fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_millis_accepts_epoch_strings() {
        let parsed = parse_millis("1700000000000").unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_700_000_000_000);
        assert!(parse_millis("soon").is_none());
        assert!(parse_millis("").is_none());
    }
}
