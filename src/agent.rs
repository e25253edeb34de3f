//! Agents - the processes a cluster supervises

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::attach::AttachServer;
use crate::message::Message;
use crate::protocol::LifecycleState;
use crate::template::{AgentRole, AgentSpec};

/// How to run one agent process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Everything a launcher knows about the run it is asked to start
pub struct LaunchRequest<'a> {
    pub cluster_id: &'a str,
    pub task: &'a str,
    pub agent: &'a AgentSpec,
    /// The message whose trigger fired
    pub trigger: &'a Message,
    /// 1-based run number of this agent
    pub iteration: u32,
}

/// Turns an agent run into a concrete command line
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch_spec(&self, request: &LaunchRequest<'_>) -> anyhow::Result<LaunchSpec>;
}

/// Runs the same program for every agent and describes the run through
/// `CONCLAVE_*` environment variables
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[async_trait]
impl AgentLauncher for CommandLauncher {
    async fn launch_spec(&self, request: &LaunchRequest<'_>) -> anyhow::Result<LaunchSpec> {
        let agent = request.agent;
        let mut env = BTreeMap::new();
        env.insert("CONCLAVE_CLUSTER_ID".into(), request.cluster_id.to_string());
        env.insert("CONCLAVE_AGENT_ID".into(), agent.id.clone());
        env.insert("CONCLAVE_AGENT_ROLE".into(), agent.role.as_str().to_string());
        env.insert("CONCLAVE_MODEL_LEVEL".into(), agent.model_level.as_str().to_string());
        env.insert("CONCLAVE_TRIGGER_TOPIC".into(), request.trigger.topic.to_string());
        env.insert("CONCLAVE_TRIGGER_ID".into(), request.trigger.id.to_string());
        env.insert("CONCLAVE_ITERATION".into(), request.iteration.to_string());
        env.insert("CONCLAVE_TASK".into(), request.task.to_string());
        if let Some(max_tokens) = agent.max_tokens {
            env.insert("CONCLAVE_MAX_TOKENS".into(), max_tokens.to_string());
        }

        Ok(LaunchSpec {
            command: self.program.clone(),
            args: self.args.clone(),
            env,
            cwd: self.cwd.clone(),
        })
    }
}

/// Agent status as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentStatus {
    /// Never launched
    Idle,
    Running,
    Exited {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// The last launch attempt failed
    Failed { reason: String },
}

/// Runtime state of one agent in a cluster
pub struct Agent {
    pub spec: AgentSpec,
    status: RwLock<AgentStatus>,
    iterations: RwLock<u32>,
    /// Server of the current or most recent run
    server: RwLock<Option<Arc<AttachServer>>>,
    /// Trigger that arrived while a run was in progress
    pending: Mutex<Option<Message>>,
}

impl Agent {
    pub fn new(spec: AgentSpec) -> Self {
        debug!(agent_id = %spec.id, role = spec.role.as_str(), "Registering agent");
        Self {
            spec,
            status: RwLock::new(AgentStatus::Idle),
            iterations: RwLock::new(0),
            server: RwLock::new(None),
            pending: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn role(&self) -> AgentRole {
        self.spec.role
    }

    pub fn status(&self) -> AgentStatus {
        self.status.read().clone()
    }

    pub fn set_status(&self, status: AgentStatus) {
        *self.status.write() = status;
    }

    pub fn iterations(&self) -> u32 {
        *self.iterations.read()
    }

    pub fn max_iterations(&self, default: u32) -> u32 {
        self.spec.max_iterations.unwrap_or(default)
    }

    /// Claim the next run, or `None` once `max` runs have happened
    pub fn begin_iteration(&self, max: u32) -> Option<u32> {
        let mut iterations = self.iterations.write();
        if *iterations >= max {
            return None;
        }
        *iterations += 1;
        Some(*iterations)
    }

    /// Whether the current run's process is still alive
    pub fn is_running(&self) -> bool {
        self.server.read().as_ref().is_some_and(|server| {
            matches!(
                server.lifecycle(),
                LifecycleState::Starting | LifecycleState::Running | LifecycleState::Exiting
            )
        })
    }

    pub fn server(&self) -> Option<Arc<AttachServer>> {
        self.server.read().clone()
    }

    pub fn set_server(&self, server: Arc<AttachServer>) {
        *self.server.write() = Some(server);
        self.set_status(AgentStatus::Running);
    }

    /// Hold a trigger until the current run exits; a newer one replaces it
    pub fn defer(&self, trigger: Message) {
        if let Some(replaced) = self.pending.lock().replace(trigger) {
            debug!(agent_id = %self.id(), trigger_id = replaced.id, "Superseded deferred trigger");
        }
    }

    pub fn take_pending(&self) -> Option<Message> {
        self.pending.lock().take()
    }

    /// Stop the current run, if any
    pub async fn stop(&self) {
        let Some(server) = self.server() else {
            return;
        };
        if self.is_running() {
            info!(agent_id = %self.id(), "Stopping agent");
        }
        server.stop().await;

        let snapshot = server.state();
        let current = self
            .server()
            .is_some_and(|latest| Arc::ptr_eq(&latest, &server));
        let mut status = self.status.write();
        if current
            && *status == AgentStatus::Running
            && matches!(snapshot.state, LifecycleState::Exited | LifecycleState::Stopped)
        {
            *status = AgentStatus::Exited {
                code: snapshot.exit_code,
                signal: snapshot.exit_signal,
            };
        }
    }
}

/// Shared handle to an agent
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<Agent>,
}

impl AgentHandle {
    pub fn new(agent: Agent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = Agent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
