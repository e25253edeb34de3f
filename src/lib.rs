//! # Conclave
//!
//! Cluster coordination for cooperating agent processes.
//!
//! A task is classified, routed to a template, and run as a cluster of
//! agent processes. Agents coordinate only through messages on a shared,
//! durable ledger; trigger predicates on those messages decide which agent
//! runs next and when the cluster is done.
//!
//! ## Architecture
//!
//! ```text
//!   ClusterRequest
//!        │
//!        ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ORCHESTRATOR                            │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │ TemplateResolver │  │   Topology   │  │  Cluster drivers   │  │
//! │  └──────────────────┘  └──────────────┘  └────────────────────┘  │
//! └──────────┬──────────────────────▲───────────────────┬────────────┘
//!            │ publish              │ trigger commands  │ launch
//!            ▼                      │                   ▼
//!   ┌─────────────────┐      ┌──────┴──────┐     ┌──────────────┐
//!   │   MessageBus    │─────▶│ subscribers │     │ AttachServer │◀── AttachClient
//!   └────────┬────────┘      └─────────────┘     │  (PTY + UDS) │
//!            │ commit, then notify               └──────┬───────┘
//!            ▼                                          ▼
//!   ┌─────────────────┐                          ┌──────────────┐
//!   │ Ledger (SQLite) │                          │ agent process│
//!   └─────────────────┘                          └──────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Cluster**: The agents working on one task, and their shared message history
//! - **Template**: A parameterized agent topology chosen by complexity and task type
//! - **Trigger**: Topic plus predicate deciding when an agent runs or the cluster ends
//! - **Ledger**: Append-only message store, the single source of truth for a cluster
//! - **Attach**: A PTY-wrapped agent process that clients can watch and drive over a socket

pub mod agent;
pub mod attach;
pub mod attach_client;
pub mod bus;
pub mod channel;
pub mod cluster;
pub mod config;
pub mod error;
pub mod ledger;
pub mod message;
pub mod orchestrator;
pub mod protocol;
pub mod ring_buffer;
pub mod template;
pub mod topology;
pub mod trigger;

pub use agent::{Agent, AgentHandle, AgentLauncher, AgentStatus, CommandLauncher, LaunchSpec};
pub use attach::{AttachError, AttachOptions, AttachServer};
pub use attach_client::AttachClient;
pub use bus::{BusError, MessageBus, Subscription};
pub use channel::{LiveObserver, ObserverChannel, ObserverEvent};
pub use cluster::{Cluster, ClusterState, ClusterStatus};
pub use config::{AttachConfig, ConclaveConfig, LedgerConfig, OrchestratorConfig};
pub use error::ConclaveError;
pub use ledger::{Cursor, Ledger, LedgerError, QueryCriteria};
pub use message::{Message, MessageContent, NewMessage, Topic, TokenUsage, ValidationOutcome};
pub use orchestrator::{ClusterRequest, Orchestrator, OrchestratorError};
pub use protocol::{ClientMessage, LifecycleState, ServerMessage, Signal, StateSnapshot};
pub use template::{
    route, AgentRole, AgentSpec, ClusterPlan, Complexity, ModelLevel, TaskType, TemplateError,
    TemplateResolver,
};
pub use topology::Topology;

/// Route test logs through `RUST_LOG`
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
