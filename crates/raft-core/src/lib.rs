//! # raft-core
//!
//! why: implement raft consensus with client sessions and membership changes on top of raft-storage
//! relations: depends on raft-storage for the log, term/vote and compaction watermarks
//! what: role state machine, cluster model, sessions and executor, transport boundary, async server
//!
//! ```text
//! ServerHandle ──> server (raft task) ──> RaftNode ──> Role / Cluster
//!                        │                    └──> raft_storage::Log
//!                        ├──> Transport (LocalTransport in process)
//!                        └──> server (apply task) ──> Executor ──> SessionManager
//!                                                        └──> StateMachine
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod message;
pub mod node;
mod role;
pub mod server;
pub mod session;
pub mod state_machine;
pub mod timer;
pub mod transport;

pub use cluster::{Cluster, ClusterConfiguration, MemberState, MemberStatus};
pub use config::{RaftConfig, ServerConfig};
pub use error::{ErrorKind, RaftError, Result};
pub use executor::{Applied, Executor, Output};
pub use message::{Request, Response, Status};
pub use node::{Completion, NodeStatus, RaftNode, Reply};
pub use role::RoleKind;
pub use server::{RaftServer, ServerHandle};
pub use session::{Session, SessionManager, SessionState};
pub use state_machine::{Commit, StateMachine};
pub use timer::Timer;
pub use transport::{Incoming, LocalTransport, Transport};

pub use raft_storage::{ConfigurationChange, Entry, EntryKind, Member, MemberType};
