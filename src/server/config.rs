//! Replication server configuration and the shared server context.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::changelog::{ChangelogEnv, LogParams};
use crate::proto::ServerId;
use crate::utils::{ChorusError, ShutdownSignal};

/// What to do when a safe-data update asks for more acknowledging
/// replication servers than are currently eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafeDataShortfall {
    /// Lower the level to what is available.
    Cap,

    /// Lower the level and log a warning.
    Warn,
}

/// Configuration parameters of a replication server.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplServerConfig {
    /// ID of this replication server; fixed for the process lifetime.
    pub server_id: ServerId,

    /// Group ID of this replication server.
    pub group_id: u8,

    /// Relative weight announced in topology messages.
    pub weight: u32,

    /// Address to accept replication sessions on.
    pub listen_addr: String,

    /// Peer replication servers to stay connected to.
    pub replication_servers: Vec<String>,

    /// Suffixes to open domains for at startup.
    pub base_dns: Vec<String>,

    /// Directory of the change log files; empty keeps change logs in memory.
    pub changelog_dir: String,

    /// Capacity of each outbound queue, and record budget of each change
    /// log write buffer.
    pub queue_size: usize,

    /// Receive window granted to each peer.
    pub window_size: u32,

    /// Age after which change log records are trimmed; 0 keeps them forever.
    pub purge_delay_secs: u64,

    /// How long an assured update waits for its acknowledgments.
    pub assured_timeout_ms: u64,

    /// Missing changes at which a directory server turns DEGRADED; 0
    /// disables the status analyzer.
    pub degraded_status_threshold: u32,

    /// Real records between two change log counter records.
    pub counter_window: u64,

    /// Records per change log store write.
    pub flush_chunk: usize,

    pub flush_interval_ms: u64,
    pub trim_interval_ms: u64,
    pub status_analyzer_interval_ms: u64,

    /// Interval between attempts to (re)connect to peer replication
    /// servers.
    pub connect_retry_ms: u64,

    pub safe_data_shortfall: SafeDataShortfall,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplServerConfig {
    fn default() -> Self {
        ReplServerConfig {
            server_id: 1,
            group_id: 1,
            weight: 1,
            listen_addr: "127.0.0.1:8989".into(),
            replication_servers: vec![],
            base_dns: vec![],
            changelog_dir: "".into(),
            queue_size: 10000,
            window_size: 100,
            purge_delay_secs: 24 * 3600,
            assured_timeout_ms: 2000,
            degraded_status_threshold: 5000,
            counter_window: 1000,
            flush_chunk: 500,
            flush_interval_ms: 500,
            trim_interval_ms: 1000,
            status_analyzer_interval_ms: 5000,
            connect_retry_ms: 3000,
            safe_data_shortfall: SafeDataShortfall::Cap,
        }
    }
}

impl ReplServerConfig {
    /// Parses from an optional TOML string on top of the defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, ChorusError> {
        let config = parsed_config!(config_str => ReplServerConfig;
                                    server_id, group_id, weight, listen_addr,
                                    replication_servers, base_dns,
                                    changelog_dir, queue_size, window_size,
                                    purge_delay_secs, assured_timeout_ms,
                                    degraded_status_threshold, counter_window,
                                    flush_chunk, flush_interval_ms,
                                    trim_interval_ms,
                                    status_analyzer_interval_ms,
                                    connect_retry_ms, safe_data_shortfall)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChorusError> {
        if self.server_id <= 0 {
            return Err(ChorusError::msg(format!(
                "invalid server_id {}",
                self.server_id
            )));
        }
        if self.queue_size < 2 {
            return Err(ChorusError::msg(format!(
                "invalid queue_size {}",
                self.queue_size
            )));
        }
        if self.window_size < 2 {
            return Err(ChorusError::msg(format!(
                "invalid window_size {}",
                self.window_size
            )));
        }
        if self.assured_timeout_ms == 0 {
            return Err(ChorusError::msg("invalid assured_timeout_ms 0"));
        }
        if self.counter_window == 0 || self.flush_chunk == 0 {
            return Err(ChorusError::msg(format!(
                "invalid counter_window {} / flush_chunk {}",
                self.counter_window, self.flush_chunk
            )));
        }
        Ok(())
    }

    /// Change log parameters derived from this config.
    pub fn log_params(&self) -> LogParams {
        LogParams {
            queue_size: self.queue_size,
            flush_chunk: self.flush_chunk,
            counter_window: self.counter_window,
            flush_interval_ms: self.flush_interval_ms,
            trim_interval_ms: self.trim_interval_ms,
            purge_delay_ms: self.purge_delay_secs.saturating_mul(1000),
        }
    }
}

/// State shared by everything running inside one replication server
/// process: identity, current configuration, change log environment and
/// the termination signal. Owned by the `ReplicationServer` and handed to
/// each domain explicitly.
pub struct ServerContext {
    server_id: ServerId,
    config: RwLock<ReplServerConfig>,
    pub(crate) env: Arc<dyn ChangelogEnv>,
    pub(crate) shutdown: ShutdownSignal,
}

impl ServerContext {
    pub fn new(
        config: ReplServerConfig,
        env: Arc<dyn ChangelogEnv>,
        shutdown: ShutdownSignal,
    ) -> Self {
        ServerContext {
            server_id: config.server_id,
            config: RwLock::new(config),
            env,
            shutdown,
        }
    }

    #[inline]
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Reads a value out of the current configuration.
    pub fn with_config<R>(&self, f: impl FnOnce(&ReplServerConfig) -> R) -> R {
        match self.config.read() {
            Ok(config) => f(&config),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    pub fn config(&self) -> ReplServerConfig {
        self.with_config(|c| c.clone())
    }

    #[inline]
    pub fn group_id(&self) -> u8 {
        self.with_config(|c| c.group_id)
    }

    /// Swaps in a new configuration; the server ID never changes.
    pub(crate) fn set_config(&self, mut config: ReplServerConfig) {
        config.server_id = self.server_id;
        match self.config.write() {
            Ok(mut slot) => *slot = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn parse_defaults() -> Result<(), ChorusError> {
        let config = ReplServerConfig::parse(None)?;
        assert_eq!(config, ReplServerConfig::default());
        assert_eq!(config.log_params().purge_delay_ms, 86_400_000);
        Ok(())
    }

    #[test]
    fn parse_overrides() -> Result<(), ChorusError> {
        let config = ReplServerConfig::parse(Some(
            "server_id = 7\n\
             replication_servers = ['10.0.0.2:8989']\n\
             safe_data_shortfall = 'warn'\n\
             degraded_status_threshold = 0",
        ))?;
        assert_eq!(config.server_id, 7);
        assert_eq!(config.replication_servers, vec!["10.0.0.2:8989"]);
        assert_eq!(config.safe_data_shortfall, SafeDataShortfall::Warn);
        assert_eq!(config.degraded_status_threshold, 0);
        assert_eq!(config.window_size, 100);
        Ok(())
    }

    #[test]
    fn parse_rejects_bad_values() {
        assert!(ReplServerConfig::parse(Some("server_id = 0")).is_err());
        assert!(ReplServerConfig::parse(Some("queue_size = 1")).is_err());
        assert!(ReplServerConfig::parse(Some("no_such_knob = 1")).is_err());
        assert!(
            ReplServerConfig::parse(Some("safe_data_shortfall = 'panic'"))
                .is_err()
        );
    }
}
