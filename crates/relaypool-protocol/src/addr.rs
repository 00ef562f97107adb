// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay addresses: `pipes`, `tcp://host:port`, `unix:///path/to.sock`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Environment variable telling a worker process how to reach the pool.
pub const RELAY_ENV: &str = "RELAYPOOL_RELAY";

/// How workers are connected to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAddr {
    /// Process stdin/stdout.
    Pipes,
    /// TCP socket, `host:port`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

/// Invalid relay address.
#[derive(Debug, Error)]
#[error("invalid relay address '{0}' (expected pipes, tcp://host:port or unix://path)")]
pub struct RelayAddrError(pub String);

impl FromStr for RelayAddr {
    type Err = RelayAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "pipes" || s == "pipe" {
            return Ok(RelayAddr::Pipes);
        }

        match s.split_once("://") {
            Some(("tcp", host)) if !host.is_empty() => Ok(RelayAddr::Tcp(host.to_string())),
            Some(("unix", path)) if !path.is_empty() => Ok(RelayAddr::Unix(PathBuf::from(path))),
            _ => Err(RelayAddrError(s.to_string())),
        }
    }
}

impl fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayAddr::Pipes => write!(f, "pipes"),
            RelayAddr::Tcp(host) => write!(f, "tcp://{}", host),
            RelayAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipes() {
        assert_eq!("pipes".parse::<RelayAddr>().unwrap(), RelayAddr::Pipes);
        assert_eq!("pipe".parse::<RelayAddr>().unwrap(), RelayAddr::Pipes);
    }

    #[test]
    fn test_parse_sockets() {
        assert_eq!(
            "tcp://127.0.0.1:6001".parse::<RelayAddr>().unwrap(),
            RelayAddr::Tcp("127.0.0.1:6001".to_string())
        );
        assert_eq!(
            "unix:///tmp/relay.sock".parse::<RelayAddr>().unwrap(),
            RelayAddr::Unix(PathBuf::from("/tmp/relay.sock"))
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!("udp://127.0.0.1:1".parse::<RelayAddr>().is_err());
        assert!("tcp://".parse::<RelayAddr>().is_err());
        assert!("".parse::<RelayAddr>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for raw in ["pipes", "tcp://localhost:7000", "unix://rr.sock"] {
            let addr: RelayAddr = raw.parse().unwrap();
            assert_eq!(addr.to_string(), raw);
        }
    }
}
