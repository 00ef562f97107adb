// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the relaypool server.

use std::str::FromStr;
use std::time::Duration;

use relaypool_protocol::{RelayAddr, RelayAddrError};

use crate::command::WorkerCommand;
use crate::pool::PoolConfig;
use crate::supervisor::SupervisorConfig;

/// Default time a spawned worker has to connect its relay.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(60);

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker command line
    pub command: WorkerCommand,
    /// Transport between the pool and its workers
    pub relay: RelayAddr,
    /// Time a socket worker has to connect back
    pub relay_timeout: Duration,
    /// Pool sizing and timeouts
    pub pool: PoolConfig,
    /// Supervisor limits, `None` when no limit is configured
    pub supervisor: Option<SupervisorConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let command = var("RELAYPOOL_COMMAND")
            .as_deref()
            .and_then(WorkerCommand::parse)
            .ok_or(ConfigError::MissingEnvVar("RELAYPOOL_COMMAND"))?;

        let relay = match var("RELAYPOOL_RELAY") {
            Some(raw) => raw.parse()?,
            None => RelayAddr::Pipes,
        };

        let relay_timeout = parse_secs(&var, "RELAYPOOL_RELAY_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_RELAY_TIMEOUT);

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            num_workers: parse(&var, "RELAYPOOL_NUM_WORKERS")?.unwrap_or(defaults.num_workers),
            max_jobs: parse(&var, "RELAYPOOL_MAX_JOBS")?.unwrap_or(defaults.max_jobs),
            allocate_timeout: parse_secs(&var, "RELAYPOOL_ALLOCATE_TIMEOUT_SECS")?
                .unwrap_or(defaults.allocate_timeout),
            destroy_timeout: parse_secs(&var, "RELAYPOOL_DESTROY_TIMEOUT_SECS")?
                .unwrap_or(defaults.destroy_timeout),
            exec_ttl: parse_secs(&var, "RELAYPOOL_EXEC_TTL_SECS")?,
            debug: var("RELAYPOOL_DEBUG")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            ..defaults
        };

        let supervisor = SupervisorConfig {
            watch_tick: parse_secs(&var, "RELAYPOOL_SUPERVISOR_TICK_SECS")?
                .unwrap_or(SupervisorConfig::default().watch_tick),
            ttl: parse_secs(&var, "RELAYPOOL_TTL_SECS")?.filter(|ttl| !ttl.is_zero()),
            idle_ttl: parse_secs(&var, "RELAYPOOL_IDLE_TTL_SECS")?.filter(|ttl| !ttl.is_zero()),
            max_worker_memory_mb: parse(&var, "RELAYPOOL_MAX_WORKER_MEMORY_MB")?
                .filter(|&mb: &u64| mb > 0),
            max_pool_memory_mb: parse(&var, "RELAYPOOL_MAX_POOL_MEMORY_MB")?
                .filter(|&mb: &u64| mb > 0),
        };

        Ok(Self {
            command,
            relay,
            relay_timeout,
            pool,
            supervisor: supervisor.has_limits().then_some(supervisor),
        })
    }
}

fn parse<F, T>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    var(name)
        .map(|raw| raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)))
        .transpose()
}

fn parse_secs<F>(var: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<F, u64>(var, name)?.map(Duration::from_secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
    /// The relay address is malformed.
    #[error("Invalid relay address: {0}")]
    InvalidRelay(#[from] RelayAddrError),
}
