//! Cluster - one task's agents, trigger subscriptions and lifecycle

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentHandle, AgentStatus};
use crate::bus::{MessageBus, Subscription};
use crate::message::Message;
use crate::template::{AgentRole, Complexity, TaskType, TriggerAction};
use crate::topology::Topology;
use crate::trigger::TriggerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Running,
    /// A completion trigger fired
    Completed,
    /// An agent ran out of iterations
    Failed,
    /// Stopped from outside
    Stopped,
}

impl ClusterState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ClusterState::Running)
    }
}

/// Work for a cluster's driver task
#[derive(Debug, Clone)]
pub enum ClusterCommand {
    /// Run an agent because `trigger` matched one of its triggers
    Execute { agent_id: String, trigger: Message },
    /// A completion trigger fired
    Complete { agent_id: String, trigger: Message },
    /// The cluster was shut down; the driver should exit
    Shutdown,
}

/// Introspection view of one agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub role: AgentRole,
    #[serde(flatten)]
    pub status: AgentStatus,
    pub iterations: u32,
    pub socket: Option<PathBuf>,
}

/// Introspection view of a cluster
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub id: String,
    pub template: String,
    pub state: ClusterState,
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub created_at: i64,
    pub agents: Vec<AgentSummary>,
}

/// A running task: its topology, supervised agents and trigger wiring
pub struct Cluster {
    pub id: String,
    pub task: String,
    pub complexity: Complexity,
    pub task_type: TaskType,
    topology: Arc<Topology>,
    /// Supervised agents; orchestrator-role agents only own triggers
    agents: HashMap<String, AgentHandle>,
    subscriptions: Mutex<Vec<Subscription>>,
    commands: mpsc::UnboundedSender<ClusterCommand>,
    state: watch::Sender<ClusterState>,
    shutting_down: AtomicBool,
    created_at: i64,
}

impl Cluster {
    pub fn new(
        id: impl Into<String>,
        task: impl Into<String>,
        complexity: Complexity,
        task_type: TaskType,
        topology: Topology,
    ) -> (Self, mpsc::UnboundedReceiver<ClusterCommand>) {
        let id = id.into();
        let agents = topology
            .supervised_agents()
            .into_iter()
            .map(|spec| (spec.id.clone(), AgentHandle::new(Agent::new(spec.clone()))))
            .collect();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ClusterState::Running);

        info!(cluster_id = %id, template = topology.template(), "Creating cluster");

        let cluster = Self {
            id,
            task: task.into(),
            complexity,
            task_type,
            topology: Arc::new(topology),
            agents,
            subscriptions: Mutex::new(Vec::new()),
            commands,
            state,
            shutting_down: AtomicBool::new(false),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        (cluster, commands_rx)
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn agent(&self, id: &str) -> Option<AgentHandle> {
        self.agents.get(id).cloned()
    }

    /// Supervised agent ids in template order
    pub fn agent_ids(&self) -> Vec<String> {
        self.topology
            .supervised_agents()
            .iter()
            .map(|spec| spec.id.clone())
            .collect()
    }

    pub fn state(&self) -> ClusterState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClusterState> {
        self.state.subscribe()
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<ClusterCommand> {
        self.commands.clone()
    }

    /// Register one bus subscription per trigger in the topology
    ///
    /// Callbacks only evaluate the predicate and queue a command; all
    /// process work happens on the driver task.
    pub fn subscribe_triggers(&self, bus: &Arc<MessageBus>) {
        let mut subscriptions = self.subscriptions.lock();
        for agent in self.topology.agents() {
            for trigger in &agent.triggers {
                let cluster_id = self.id.clone();
                let agent_id = agent.id.clone();
                let trigger = trigger.clone();
                let topology = Arc::clone(&self.topology);
                let bus_ref = Arc::downgrade(bus);
                let commands = self.commands.clone();

                let subscription = bus.subscribe_topic(trigger.topic.clone(), move |message| {
                    if message.cluster_id != cluster_id {
                        return;
                    }
                    let Some(bus) = bus_ref.upgrade() else {
                        return;
                    };
                    let ctx = TriggerContext {
                        cluster_id: &cluster_id,
                        message,
                        topology: &topology,
                        bus: &bus,
                    };
                    match trigger.predicate().evaluate(&ctx) {
                        Ok(true) => {
                            debug!(
                                cluster_id = %cluster_id,
                                agent_id = %agent_id,
                                topic = %message.topic,
                                "Trigger fired"
                            );
                            let command = match trigger.action {
                                TriggerAction::ExecuteTask => ClusterCommand::Execute {
                                    agent_id: agent_id.clone(),
                                    trigger: message.clone(),
                                },
                                TriggerAction::StopCluster => ClusterCommand::Complete {
                                    agent_id: agent_id.clone(),
                                    trigger: message.clone(),
                                },
                            };
                            let _ = commands.send(command);
                        }
                        Ok(false) => {}
                        Err(e) => warn!(
                            cluster_id = %cluster_id,
                            agent_id = %agent_id,
                            error = %e,
                            "Trigger evaluation failed"
                        ),
                    }
                });
                subscriptions.push(subscription);
            }
        }
        debug!(cluster_id = %self.id, count = subscriptions.len(), "Subscribed triggers");
    }

    pub fn unsubscribe_all(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }

    /// Mark the cluster as shutting down; only the first caller gets `true`
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop every agent concurrently
    pub async fn stop_agents(&self) {
        let mut stops = JoinSet::new();
        for agent in self.agents.values() {
            let agent = agent.clone();
            stops.spawn(async move { agent.stop().await });
        }
        while stops.join_next().await.is_some() {}
    }

    pub fn finish(&self, state: ClusterState) {
        self.state.send_replace(state);
        let _ = self.commands.send(ClusterCommand::Shutdown);
    }

    pub fn status(&self) -> ClusterStatus {
        let agents = self
            .agent_ids()
            .iter()
            .filter_map(|id| self.agents.get(id))
            .map(|agent| AgentSummary {
                id: agent.id().to_string(),
                role: agent.role(),
                status: agent.status(),
                iterations: agent.iterations(),
                socket: agent.server().map(|s| s.socket_path().to_path_buf()),
            })
            .collect();

        ClusterStatus {
            id: self.id.clone(),
            template: self.topology.template().to_string(),
            state: self.state(),
            complexity: self.complexity,
            task_type: self.task_type,
            created_at: self.created_at,
            agents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::message::{NewMessage, Topic, ValidationOutcome};
    use crate::template::TemplateResolver;

    fn cluster(
        complexity: Complexity,
    ) -> (Arc<MessageBus>, Cluster, mpsc::UnboundedReceiver<ClusterCommand>) {
        let bus = Arc::new(MessageBus::new(Arc::new(Ledger::in_memory().unwrap())));
        let topology = Topology::new(
            TemplateResolver::new()
                .resolve_for(complexity, TaskType::Task)
                .unwrap(),
        );
        let (cluster, rx) = Cluster::new("c1", "add a flag", complexity, TaskType::Task, topology);
        (bus, cluster, rx)
    }

    #[test]
    fn test_cluster_creation() {
        let (_bus, cluster, _rx) = cluster(Complexity::Simple);
        assert_eq!(cluster.state(), ClusterState::Running);
        assert_eq!(cluster.agent_ids(), vec!["worker", "validator"]);
        assert!(cluster.agent("completion-detector").is_none());

        let status = cluster.status();
        assert_eq!(status.template, "worker-validator");
        assert_eq!(status.agents.len(), 2);
        assert_eq!(status.agents[0].status, AgentStatus::Idle);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["agents"][0]["status"], "idle");
    }

    #[test]
    fn test_triggers_become_commands() {
        let (bus, cluster, mut rx) = cluster(Complexity::Simple);
        cluster.subscribe_triggers(&bus);
        assert_eq!(bus.subscriber_count(), 4);

        bus.publish(NewMessage::new("c1", Topic::IssueOpened, "user").with_text("go"))
            .unwrap();
        // Other clusters are ignored
        bus.publish(NewMessage::new("c2", Topic::IssueOpened, "user"))
            .unwrap();
        match rx.try_recv().unwrap() {
            ClusterCommand::Execute { agent_id, trigger } => {
                assert_eq!(agent_id, "worker");
                assert_eq!(trigger.topic, Topic::IssueOpened);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        bus.publish(ValidationOutcome::approved().into_message("c1", "validator"))
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClusterCommand::Complete { agent_id, .. } if agent_id == "completion-detector"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (bus, cluster, mut rx) = cluster(Complexity::Trivial);
        cluster.subscribe_triggers(&bus);

        assert!(cluster.begin_shutdown());
        assert!(!cluster.begin_shutdown());
        cluster.unsubscribe_all();
        cluster.unsubscribe_all();
        assert_eq!(bus.subscriber_count(), 0);

        cluster.stop_agents().await;
        cluster.finish(ClusterState::Stopped);
        assert!(cluster.state().is_terminal());
        assert!(matches!(rx.recv().await, Some(ClusterCommand::Shutdown)));
    }
}
