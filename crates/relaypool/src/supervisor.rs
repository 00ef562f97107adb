// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool supervisor - periodic enforcement of worker limits.
//!
//! Every tick the supervisor walks a snapshot of the pool's workers and
//! evicts those that outlived their TTL, grew past the per-worker memory
//! limit or sat idle too long. The memory of the remaining workers is
//! summed; when the total reaches the pool limit the whole pool is
//! destroyed and a `MaxPoolMemory` event asks the owner to rebuild it.
//!
//! Evictions go through [`StaticPool::remove_worker`], so a worker busy with
//! a request finishes it before being destroyed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{Event, PoolEventKind, WorkerEventKind};
use crate::pool::StaticPool;
use crate::stats::StatsProvider;
use crate::worker::{WorkerProcess, WorkerStatus};

const MB: u64 = 1024 * 1024;

/// Limit in bytes; absurdly large limits saturate instead of wrapping.
fn limit_bytes(limit_mb: u64) -> u64 {
    limit_mb.saturating_mul(MB)
}

/// Supervisor limits. Every limit is optional.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between two control passes.
    pub watch_tick: Duration,
    /// Maximum worker lifetime.
    pub ttl: Option<Duration>,
    /// Maximum time a `Ready` worker may stay unused.
    pub idle_ttl: Option<Duration>,
    /// Per-worker RSS limit in MiB.
    pub max_worker_memory_mb: Option<u64>,
    /// Limit for the summed RSS of all workers in MiB.
    pub max_pool_memory_mb: Option<u64>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watch_tick: Duration::from_secs(1),
            ttl: None,
            idle_ttl: None,
            max_worker_memory_mb: None,
            max_pool_memory_mb: None,
        }
    }
}

impl SupervisorConfig {
    /// Check the limits before the supervisor starts.
    pub fn validate(&self) -> Result<()> {
        if self.watch_tick.is_zero() {
            return Err(Error::InvalidConfig {
                field: "watch_tick",
                reason: "must be greater than zero",
            });
        }
        let zero_limit = |limit: Option<Duration>| limit.is_some_and(|d| d.is_zero());
        if zero_limit(self.ttl) || zero_limit(self.idle_ttl) {
            return Err(Error::InvalidConfig {
                field: "ttl",
                reason: "must be greater than zero when set",
            });
        }
        if self.max_worker_memory_mb == Some(0) {
            return Err(Error::InvalidConfig {
                field: "max_worker_memory_mb",
                reason: "must be greater than zero when set",
            });
        }
        if self.max_pool_memory_mb == Some(0) {
            return Err(Error::InvalidConfig {
                field: "max_pool_memory_mb",
                reason: "must be greater than zero when set",
            });
        }
        Ok(())
    }

    /// True when at least one limit is set.
    pub fn has_limits(&self) -> bool {
        self.ttl.is_some()
            || self.idle_ttl.is_some()
            || self.max_worker_memory_mb.is_some()
            || self.max_pool_memory_mb.is_some()
    }
}

/// Background task enforcing [`SupervisorConfig`] on a pool.
pub struct Supervisor {
    pool: Arc<StaticPool>,
    stats: Arc<dyn StatsProvider>,
    config: SupervisorConfig,
    shutdown: Arc<Notify>,
}

impl Supervisor {
    pub fn new(
        pool: Arc<StaticPool>,
        stats: Arc<dyn StatsProvider>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            pool,
            stats,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run control passes until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            watch_tick_ms = self.config.watch_tick.as_millis() as u64,
            ttl_secs = self.config.ttl.map(|d| d.as_secs()),
            idle_ttl_secs = self.config.idle_ttl.map(|d| d.as_secs()),
            max_worker_memory_mb = self.config.max_worker_memory_mb,
            max_pool_memory_mb = self.config.max_pool_memory_mb,
            "Supervisor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Supervisor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.watch_tick) => {
                    self.control().await;
                }
            }
        }

        info!("Supervisor stopped");
    }

    /// One control pass over the current workers.
    pub async fn control(&self) {
        let now = Utc::now();
        let mut pool_memory = 0u64;

        for worker in self.pool.workers().await {
            if worker.status() == WorkerStatus::Invalid {
                continue;
            }
            let Some(pid) = worker.pid() else {
                continue;
            };

            let stats = match self.stats.stats(pid) {
                Ok(stats) => stats,
                Err(e) => {
                    debug!(pid = pid, error = %e, "skipping worker without stats");
                    continue;
                }
            };

            if let Some(ttl) = self.config.ttl
                && (now - worker.created()).to_std().unwrap_or_default() >= ttl
            {
                if self
                    .evict(&worker, WorkerEventKind::Ttl, "ttl reached")
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }

            if let Some(limit) = self.config.max_worker_memory_mb
                && stats.memory_bytes >= limit_bytes(limit)
            {
                let detail = format!(
                    "memory {} MB over limit {} MB",
                    stats.memory_bytes / MB,
                    limit
                );
                if self
                    .evict(&worker, WorkerEventKind::MaxMemory, &detail)
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }

            if let Some(idle_ttl) = self.config.idle_ttl
                && worker.status() == WorkerStatus::Ready
                && (now - worker.last_used()).to_std().unwrap_or_default() >= idle_ttl
            {
                if self
                    .evict(&worker, WorkerEventKind::IdleTtl, "idle ttl reached")
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }

            pool_memory = pool_memory.saturating_add(stats.memory_bytes);
        }

        if let Some(limit) = self.config.max_pool_memory_mb
            && pool_memory >= limit_bytes(limit)
        {
            let detail = format!(
                "pool memory {} MB over limit {} MB",
                pool_memory / MB,
                limit
            );
            warn!(
                pool_memory_mb = pool_memory / MB,
                limit_mb = limit,
                "pool memory limit reached"
            );
            self.pool.destroy().await;
            self.pool
                .events()
                .publish(Event::pool(PoolEventKind::MaxPoolMemory, detail));
        }
    }

    /// Remove one worker; the event fires only when the removal happened.
    async fn evict(
        &self,
        worker: &WorkerProcess,
        kind: WorkerEventKind,
        detail: &str,
    ) -> Result<()> {
        let pid = worker.pid().unwrap_or_default();
        match self.pool.remove_worker(worker).await {
            Ok(true) => {
                info!(pid = pid, reason = ?kind, "worker evicted");
                self.pool
                    .events()
                    .publish(Event::worker_detail(kind, pid, detail));
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                error!(pid = pid, error = %e, "failed to remove worker");
                self.pool.events().publish(Event::pool(
                    PoolEventKind::SupervisorError,
                    format!("failed to remove worker {}: {}", pid, e),
                ));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_limits() {
        let config = SupervisorConfig::default();
        assert!(!config.has_limits());
        assert_eq!(config.watch_tick, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        SupervisorConfig::default().validate().unwrap();

        let tick = SupervisorConfig {
            watch_tick: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            tick.validate(),
            Err(Error::InvalidConfig {
                field: "watch_tick",
                ..
            })
        ));

        let idle = SupervisorConfig {
            idle_ttl: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(idle.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_memory_limits() {
        let worker = SupervisorConfig {
            max_worker_memory_mb: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            worker.validate(),
            Err(Error::InvalidConfig {
                field: "max_worker_memory_mb",
                ..
            })
        ));

        let pool = SupervisorConfig {
            max_pool_memory_mb: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            pool.validate(),
            Err(Error::InvalidConfig {
                field: "max_pool_memory_mb",
                ..
            })
        ));
    }

    #[test]
    fn test_limit_bytes_saturates() {
        assert_eq!(limit_bytes(256), 256 * MB);
        assert_eq!(limit_bytes(u64::MAX / 1024), u64::MAX);
    }

    #[test]
    fn test_any_limit_enables_supervision() {
        let config = SupervisorConfig {
            max_pool_memory_mb: Some(1024),
            ..Default::default()
        };
        assert!(config.has_limits());
    }
}
