//! # config
//!
//! why: keep every tunable of a server in one serde-loadable place
//! relations: RaftConfig drives node.rs timers, StorageConfig opens raft-storage, ServerConfig feeds server.rs
//! what: RaftConfig, ServerConfig, loading and validation

use crate::error::{RaftError, Result};
use raft_storage::{Member, StorageConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Protocol timing. All values are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    /// default timeout handed to sessions that do not ask for one
    pub session_timeout: u64,
    pub max_entries_per_append: u64,
    /// how long join and leave may take before the server gives up and goes inactive
    pub configuration_timeout: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            session_timeout: 5_000,
            max_entries_per_append: 100,
            configuration_timeout: 5_000,
        }
    }
}

impl RaftConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout range {}..{} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min / 2 {
            return Err(RaftError::Config(format!(
                "heartbeat_interval ({}) should be well below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Config("max_entries_per_append must be > 0".into()));
        }
        if self.session_timeout <= self.heartbeat_interval {
            return Err(RaftError::Config("session_timeout must exceed heartbeat_interval".into()));
        }
        Ok(())
    }
}

/// Everything needed to start one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: u64,
    pub address: String,
    /// the initial cluster; a server not listed here joins on start
    pub members: Vec<Member>,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ServerConfig {
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            members: Vec::new(),
            raft: RaftConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    pub fn with_members(mut self, members: impl IntoIterator<Item = Member>) -> Self {
        self.members = members.into_iter().collect();
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Loads a JSON configuration file and validates it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RaftError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: ServerConfig = serde_json::from_str(&contents)
            .map_err(|e| RaftError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(RaftError::Config("id must be > 0".into()));
        }
        if self.address.is_empty() {
            return Err(RaftError::Config("address is required".into()));
        }
        if self.storage.max_entries_per_segment == 0 {
            return Err(RaftError::Config("max_entries_per_segment must be > 0".into()));
        }

        let mut ids: Vec<u64> = self.members.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(RaftError::Config("member ids must be unique".into()));
        }

        self.raft.validate()
    }

    /// Whether this server is part of the initial cluster or has to join it.
    pub fn is_initial_member(&self) -> bool {
        self.members.iter().any(|member| member.id == self.id)
    }
}
