//! Main orchestrator - turns tasks into running clusters

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentHandle, AgentLauncher, AgentStatus, LaunchRequest};
use crate::attach::{AttachError, AttachOptions, AttachServer};
use crate::bus::{BusError, MessageBus};
use crate::cluster::{Cluster, ClusterCommand, ClusterState, ClusterStatus};
use crate::config::ConclaveConfig;
use crate::message::{Message, NewMessage, Topic};
use crate::protocol::LifecycleState;
use crate::template::{route, Complexity, TaskType, TemplateError, TemplateResolver};
use crate::topology::Topology;

/// Sender used for messages the orchestrator publishes itself
pub const ORCHESTRATOR_SENDER: &str = "orchestrator";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Cluster already exists: {0}")]
    ClusterExists(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Attach error: {0}")]
    Attach(#[from] AttachError),

    #[error("Failed to launch agent {agent}: {reason}")]
    Launch {
        agent: String,
        reason: anyhow::Error,
    },
}

/// A task to run as a cluster
#[derive(Debug, Clone)]
pub struct ClusterRequest {
    pub task: String,
    pub complexity: Complexity,
    pub task_type: TaskType,
    /// Generated when absent
    pub cluster_id: Option<String>,
}

impl ClusterRequest {
    pub fn new(task: impl Into<String>, complexity: Complexity, task_type: TaskType) -> Self {
        Self {
            task: task.into(),
            complexity,
            task_type,
            cluster_id: None,
        }
    }

    pub fn with_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }
}

struct Shared {
    config: ConclaveConfig,
    bus: Arc<MessageBus>,
    launcher: Arc<dyn AgentLauncher>,
    resolver: TemplateResolver,
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
    /// Snapshots of completed and failed clusters, oldest first
    finished: Mutex<VecDeque<ClusterStatus>>,
}

/// The cluster orchestrator
///
/// Owns every running cluster. Trigger hits are queued by bus callbacks and
/// handled by one driver task per cluster, so agent launches for a cluster
/// never overlap.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        config: ConclaveConfig,
        bus: Arc<MessageBus>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Self {
        Self::with_resolver(config, bus, launcher, TemplateResolver::new())
    }

    /// Use a resolver with extra or replaced templates
    pub fn with_resolver(
        config: ConclaveConfig,
        bus: Arc<MessageBus>,
        launcher: Arc<dyn AgentLauncher>,
        resolver: TemplateResolver,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                bus,
                launcher,
                resolver,
                clusters: RwLock::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.shared.bus
    }

    /// Create a cluster for `request` and open its issue
    #[instrument(skip(self, request), fields(complexity = request.complexity.as_str(), task_type = request.task_type.as_str()))]
    pub fn start_cluster(&self, request: ClusterRequest) -> Result<String, OrchestratorError> {
        let cluster_id = request
            .cluster_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.shared.clusters.read().contains_key(&cluster_id) {
            return Err(OrchestratorError::ClusterExists(cluster_id));
        }

        let plan = route(request.complexity, request.task_type);
        let resolved = self.shared.resolver.resolve(&plan.base, &plan.params)?;
        let topology = Topology::new(resolved);
        let (cluster, commands) = Cluster::new(
            cluster_id.clone(),
            request.task.clone(),
            request.complexity,
            request.task_type,
            topology,
        );
        let cluster = Arc::new(cluster);

        {
            let mut clusters = self.shared.clusters.write();
            if clusters.contains_key(&cluster_id) {
                return Err(OrchestratorError::ClusterExists(cluster_id));
            }
            clusters.insert(cluster_id.clone(), Arc::clone(&cluster));
        }

        cluster.subscribe_triggers(&self.shared.bus);
        tokio::spawn(drive(
            Arc::clone(&self.shared),
            Arc::clone(&cluster),
            commands,
        ));

        let issue = NewMessage::new(&cluster_id, Topic::IssueOpened, "user")
            .with_text(&request.task)
            .with_data(json!({
                "complexity": request.complexity.as_str(),
                "taskType": request.task_type.as_str(),
                "template": &plan.base,
            }));
        if let Err(e) = self.shared.bus.publish(issue) {
            error!(cluster_id = %cluster_id, error = %e, "Failed to open issue");
            cluster.begin_shutdown();
            cluster.unsubscribe_all();
            cluster.finish(ClusterState::Failed);
            self.shared.clusters.write().remove(&cluster_id);
            return Err(e.into());
        }

        info!(cluster_id = %cluster_id, template = %plan.base, "Cluster started");
        Ok(cluster_id)
    }

    /// Stop every agent of a cluster and forget it
    #[instrument(skip(self))]
    pub async fn stop_cluster(&self, cluster_id: &str) -> Result<(), OrchestratorError> {
        let live = self.shared.clusters.write().remove(cluster_id);
        let Some(cluster) = live else {
            let mut finished = self.shared.finished.lock();
            let before = finished.len();
            finished.retain(|status| status.id != cluster_id);
            if finished.len() == before {
                return Err(OrchestratorError::ClusterNotFound(cluster_id.to_string()));
            }
            debug!(cluster_id = %cluster_id, "Forgot finished cluster");
            return Ok(());
        };

        self.shared
            .shutdown_cluster(&cluster, ClusterState::Stopped)
            .await;
        info!(cluster_id = %cluster_id, "Cluster stopped");
        Ok(())
    }

    /// Ids of live clusters
    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.clusters.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live status, or the final snapshot of a completed or failed cluster
    pub fn cluster_status(&self, cluster_id: &str) -> Result<ClusterStatus, OrchestratorError> {
        match self.cluster(cluster_id) {
            Ok(cluster) => Ok(cluster.status()),
            Err(e) => self.shared.finished_status(cluster_id).ok_or(e),
        }
    }

    /// Wait until the cluster completed, failed or was stopped
    pub async fn wait_for_completion(
        &self,
        cluster_id: &str,
    ) -> Result<ClusterState, OrchestratorError> {
        let cluster = match self.cluster(cluster_id) {
            Ok(cluster) => cluster,
            Err(e) => {
                return self
                    .shared
                    .finished_status(cluster_id)
                    .map(|status| status.state)
                    .ok_or(e)
            }
        };
        let mut state = cluster.subscribe_state();
        let result = state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        Ok(result.unwrap_or_else(|_| cluster.state()))
    }

    /// Stop every cluster
    pub async fn shutdown(&self) {
        let clusters: Vec<Arc<Cluster>> = self
            .shared
            .clusters
            .write()
            .drain()
            .map(|(_, cluster)| cluster)
            .collect();
        info!(count = clusters.len(), "Shutting down orchestrator");
        for cluster in clusters {
            self.shared
                .shutdown_cluster(&cluster, ClusterState::Stopped)
                .await;
        }
    }

    fn cluster(&self, cluster_id: &str) -> Result<Arc<Cluster>, OrchestratorError> {
        self.shared
            .clusters
            .read()
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::ClusterNotFound(cluster_id.to_string()))
    }
}

/// Driver loop of one cluster
async fn drive(
    shared: Arc<Shared>,
    cluster: Arc<Cluster>,
    mut commands: mpsc::UnboundedReceiver<ClusterCommand>,
) {
    debug!(cluster_id = %cluster.id, "Cluster driver started");
    while let Some(command) = commands.recv().await {
        if matches!(command, ClusterCommand::Shutdown) {
            break;
        }
        if cluster.is_shutting_down() {
            continue;
        }
        match command {
            ClusterCommand::Execute { agent_id, trigger } => {
                shared.execute(&cluster, &agent_id, &trigger).await
            }
            ClusterCommand::Complete { agent_id, trigger } => {
                shared.complete(&cluster, &agent_id, &trigger).await
            }
            ClusterCommand::Shutdown => break,
        }
    }
    debug!(cluster_id = %cluster.id, "Cluster driver stopped");
}

impl Shared {
    async fn execute(&self, cluster: &Arc<Cluster>, agent_id: &str, trigger: &Message) {
        let Some(agent) = cluster.agent(agent_id) else {
            warn!(cluster_id = %cluster.id, agent_id, "Trigger for unknown agent");
            return;
        };
        if agent.is_running() {
            agent.defer(trigger.clone());
            if agent.is_running() {
                debug!(cluster_id = %cluster.id, agent_id, topic = %trigger.topic, "Agent busy, deferring trigger");
                return;
            }
            // The run ended meanwhile; whoever takes the trigger launches it
            if agent.take_pending().is_none() {
                return;
            }
        }

        let max = agent.max_iterations(self.config.orchestrator.default_max_iterations);
        let Some(iteration) = agent.begin_iteration(max) else {
            warn!(cluster_id = %cluster.id, agent_id, max, "Agent reached its iteration limit");
            self.publish(
                NewMessage::new(&cluster.id, Topic::ClusterFailed, ORCHESTRATOR_SENDER)
                    .with_text(format!("{agent_id} reached its limit of {max} iterations"))
                    .with_data(json!({
                        "reason": "max_iterations",
                        "agentId": agent_id,
                        "maxIterations": max,
                    })),
            );
            self.shutdown_cluster(cluster, ClusterState::Failed).await;
            return;
        };

        match self.launch(cluster, &agent, trigger, iteration).await {
            Ok(server) => {
                let pid = server.state().pid;
                info!(cluster_id = %cluster.id, agent_id, iteration, pid, "Agent started");
                self.publish(
                    NewMessage::new(&cluster.id, Topic::AgentLifecycle, agent_id).with_data(json!({
                        "event": "started",
                        "iteration": iteration,
                        "pid": pid,
                        "triggerId": trigger.id,
                        "socket": server.socket_path(),
                    })),
                );
                tokio::spawn(monitor(
                    Arc::clone(&self.bus),
                    cluster.id.clone(),
                    cluster.commands(),
                    agent,
                    server,
                    iteration,
                ));
            }
            Err(e) => {
                warn!(cluster_id = %cluster.id, agent_id, error = %e, "Agent launch failed");
                agent.set_status(AgentStatus::Failed {
                    reason: e.to_string(),
                });
                self.publish(
                    NewMessage::new(&cluster.id, Topic::AgentError, agent_id)
                        .with_text(e.to_string())
                        .with_data(json!({ "iteration": iteration })),
                );
            }
        }
    }

    async fn launch(
        &self,
        cluster: &Cluster,
        agent: &AgentHandle,
        trigger: &Message,
        iteration: u32,
    ) -> Result<Arc<AttachServer>, OrchestratorError> {
        let spec = self
            .launcher
            .launch_spec(&LaunchRequest {
                cluster_id: &cluster.id,
                task: &cluster.task,
                agent: &agent.spec,
                trigger,
                iteration,
            })
            .await
            .map_err(|reason| OrchestratorError::Launch {
                agent: agent.id().to_string(),
                reason,
            })?;

        // The previous run must release the socket path first
        if let Some(previous) = agent.server() {
            if previous.lifecycle() == LifecycleState::Exited {
                previous.wait_closed().await;
            }
        }

        let socket_path = self.config.attach.socket_path(&cluster.id, agent.id());
        let mut options =
            AttachOptions::from_config(&self.config.attach, agent.id(), socket_path, spec.command)
                .args(spec.args);
        for (key, value) in spec.env {
            options = options.env(key, value);
        }
        if let Some(cwd) = spec.cwd.or_else(|| self.config.orchestrator.agent_cwd.clone()) {
            options = options.cwd(cwd);
        }

        let server = Arc::new(AttachServer::new(options));
        server.start().await?;
        agent.set_server(Arc::clone(&server));

        if cluster.is_shutting_down() {
            debug!(cluster_id = %cluster.id, agent_id = %agent.id(), "Cluster stopping, stopping fresh agent");
            server.stop().await;
        }
        Ok(server)
    }

    async fn complete(&self, cluster: &Arc<Cluster>, agent_id: &str, trigger: &Message) {
        info!(cluster_id = %cluster.id, agent_id, trigger_id = trigger.id, "Cluster complete");
        self.publish(
            NewMessage::new(&cluster.id, Topic::ClusterComplete, ORCHESTRATOR_SENDER).with_data(
                json!({
                    "detector": agent_id,
                    "triggerId": trigger.id,
                    "topic": trigger.topic,
                }),
            ),
        );
        self.shutdown_cluster(cluster, ClusterState::Completed).await;
    }

    /// Idempotent; only the first call does the work
    async fn shutdown_cluster(&self, cluster: &Arc<Cluster>, state: ClusterState) {
        if !cluster.begin_shutdown() {
            return;
        }
        debug!(cluster_id = %cluster.id, state = ?state, "Shutting down cluster");
        cluster.unsubscribe_all();
        cluster.stop_agents().await;
        if state != ClusterState::Stopped {
            self.retire(cluster, state);
        }
        cluster.finish(state);
    }

    /// Swap a finished cluster for its status snapshot
    ///
    /// The snapshot goes in before the live entry leaves, so lookups never
    /// miss both.
    fn retire(&self, cluster: &Arc<Cluster>, state: ClusterState) {
        let mut snapshot = cluster.status();
        snapshot.state = state;
        {
            let mut finished = self.finished.lock();
            finished.retain(|status| status.id != cluster.id);
            finished.push_back(snapshot);
            while finished.len() > self.config.orchestrator.finished_history {
                if let Some(evicted) = finished.pop_front() {
                    debug!(cluster_id = %evicted.id, "Dropped finished cluster snapshot");
                }
            }
        }

        let mut clusters = self.clusters.write();
        if clusters
            .get(&cluster.id)
            .is_some_and(|live| Arc::ptr_eq(live, cluster))
        {
            clusters.remove(&cluster.id);
        }
        debug!(cluster_id = %cluster.id, state = ?state, "Retired cluster");
    }

    fn finished_status(&self, cluster_id: &str) -> Option<ClusterStatus> {
        self.finished
            .lock()
            .iter()
            .rev()
            .find(|status| status.id == cluster_id)
            .cloned()
    }

    fn publish(&self, message: NewMessage) {
        let topic = message.topic.clone();
        if let Err(e) = self.bus.publish(message) {
            warn!(topic = %topic, error = %e, "Failed to publish");
        }
    }
}

/// Record the exit of one agent run and replay a trigger deferred during it
async fn monitor(
    bus: Arc<MessageBus>,
    cluster_id: String,
    commands: mpsc::UnboundedSender<ClusterCommand>,
    agent: AgentHandle,
    server: Arc<AttachServer>,
    iteration: u32,
) {
    let snapshot = server.wait_for_exit().await;
    let current = agent
        .server()
        .is_some_and(|latest| Arc::ptr_eq(&latest, &server));
    if current {
        agent.set_status(AgentStatus::Exited {
            code: snapshot.exit_code,
            signal: snapshot.exit_signal.clone(),
        });
    }
    info!(
        cluster_id = %cluster_id,
        agent_id = %agent.id(),
        code = ?snapshot.exit_code,
        signal = ?snapshot.exit_signal,
        "Agent exited"
    );

    let message = NewMessage::new(&cluster_id, Topic::AgentLifecycle, agent.id()).with_data(json!({
        "event": "exited",
        "iteration": iteration,
        "code": snapshot.exit_code,
        "signal": snapshot.exit_signal,
    }));
    if let Err(e) = bus.publish(message) {
        warn!(cluster_id = %cluster_id, agent_id = %agent.id(), error = %e, "Failed to publish agent exit");
    }

    if !current {
        return;
    }
    if let Some(trigger) = agent.take_pending() {
        debug!(cluster_id = %cluster_id, agent_id = %agent.id(), trigger_id = trigger.id, "Replaying deferred trigger");
        let _ = commands.send(ClusterCommand::Execute {
            agent_id: agent.id().to_string(),
            trigger,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::agent::{CommandLauncher, LaunchSpec};
    use crate::ledger::{Ledger, QueryCriteria};
    use crate::message::ValidationOutcome;
    use crate::template::AgentRole;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        orchestrator: Orchestrator,
        bus: Arc<MessageBus>,
        _dir: tempfile::TempDir,
    }

    fn fixture(launcher: impl AgentLauncher + 'static) -> Fixture {
        fixture_with(launcher, |_| {})
    }

    fn fixture_with(
        launcher: impl AgentLauncher + 'static,
        tweak: impl FnOnce(&mut ConclaveConfig),
    ) -> Fixture {
        crate::init_test_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConclaveConfig::default();
        config.attach.socket_dir = dir.path().join("sockets");
        config.attach.stop_timeout_ms = 2_000;
        config.attach.exit_grace_ms = 10;
        tweak(&mut config);

        let bus = Arc::new(MessageBus::new(Arc::new(Ledger::in_memory().unwrap())));
        let orchestrator = Orchestrator::new(config, Arc::clone(&bus), Arc::new(launcher));
        Fixture {
            orchestrator,
            bus,
            _dir: dir,
        }
    }

    fn quick_agent() -> CommandLauncher {
        CommandLauncher::new("/bin/sh").args(["-c", "exit 0"])
    }

    /// Validators take a while, everyone else exits at once
    struct SlowValidators {
        quick: CommandLauncher,
        slow: CommandLauncher,
    }

    #[async_trait::async_trait]
    impl AgentLauncher for SlowValidators {
        async fn launch_spec(&self, request: &LaunchRequest<'_>) -> anyhow::Result<LaunchSpec> {
            if request.agent.role == AgentRole::Validator {
                self.slow.launch_spec(request).await
            } else {
                self.quick.launch_spec(request).await
            }
        }
    }

    async fn wait_for_messages(
        bus: &MessageBus,
        criteria: QueryCriteria,
        count: usize,
    ) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let found = bus.query(&criteria).unwrap();
            if found.len() >= count {
                return found;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} messages, have {}",
                found.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Plays the agents' side: publishes a reply each time an agent exits
    fn script_replies<F>(bus: &Arc<MessageBus>, reply: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&Message) -> Vec<NewMessage> + Send + 'static,
    {
        script_lifecycle(bus, "exited", reply)
    }

    fn script_lifecycle<F>(
        bus: &Arc<MessageBus>,
        event: &'static str,
        reply: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&Message) -> Vec<NewMessage> + Send + 'static,
    {
        let bus = Arc::clone(bus);
        let mut watch = bus.ledger().watch();
        tokio::spawn(async move {
            while let Ok(message) = watch.recv().await {
                let matched = message.topic == Topic::AgentLifecycle
                    && message.content.field("event").and_then(|v| v.as_str()) == Some(event);
                if !matched {
                    continue;
                }
                let replies = reply(&message);
                if !replies.is_empty() {
                    let _ = bus.batch_publish(replies);
                }
            }
        })
    }

    #[tokio::test]
    async fn test_trivial_cluster_completes() {
        let f = fixture(quick_agent());
        let script = script_replies(&f.bus, |exited| {
            vec![NewMessage::new(&exited.cluster_id, Topic::ImplementationReady, "worker")]
        });

        let id = assert_ok!(f.orchestrator.start_cluster(
            ClusterRequest::new("rename a variable", Complexity::Trivial, TaskType::Task)
                .with_id("trivial")
        ));
        assert_eq!(f.orchestrator.cluster_ids(), vec!["trivial"]);

        let state = f.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(state, ClusterState::Completed);

        let issue = f
            .bus
            .find_last(&QueryCriteria::cluster(&id).topic(Topic::IssueOpened))
            .unwrap()
            .unwrap();
        assert_eq!(issue.content.text.as_deref(), Some("rename a variable"));
        assert_eq!(*issue.content.field("template").unwrap(), "single-worker");

        let complete = f
            .bus
            .query(&QueryCriteria::cluster(&id).topic(Topic::ClusterComplete))
            .unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].sender, ORCHESTRATOR_SENDER);

        // Finished clusters leave the live set but keep a snapshot
        assert!(f.orchestrator.cluster_ids().is_empty());
        let status = f.orchestrator.cluster_status(&id).unwrap();
        assert_eq!(status.state, ClusterState::Completed);
        assert_eq!(status.agents[0].iterations, 1);
        assert_eq!(
            status.agents[0].status,
            AgentStatus::Exited {
                code: Some(0),
                signal: None
            }
        );
        assert_eq!(
            f.orchestrator.wait_for_completion(&id).await.unwrap(),
            ClusterState::Completed
        );
        assert_eq!(f.bus.subscriber_count(), 0);
        script.abort();
    }

    #[tokio::test]
    async fn test_finished_snapshots_are_bounded() {
        let f = fixture_with(quick_agent(), |config| {
            config.orchestrator.finished_history = 1;
        });
        let script = script_replies(&f.bus, |exited| {
            vec![NewMessage::new(&exited.cluster_id, Topic::ImplementationReady, "worker")]
        });

        for id in ["first", "second"] {
            f.orchestrator
                .start_cluster(
                    ClusterRequest::new("tidy up", Complexity::Trivial, TaskType::Task).with_id(id),
                )
                .unwrap();
            assert_eq!(
                f.orchestrator.wait_for_completion(id).await.unwrap(),
                ClusterState::Completed
            );
        }

        assert!(f.orchestrator.cluster_ids().is_empty());
        assert!(matches!(
            f.orchestrator.cluster_status("first"),
            Err(OrchestratorError::ClusterNotFound(_))
        ));
        assert_eq!(
            f.orchestrator.cluster_status("second").unwrap().state,
            ClusterState::Completed
        );

        // Stopping a finished cluster forgets its snapshot
        assert_ok!(f.orchestrator.stop_cluster("second").await);
        assert_err!(f.orchestrator.cluster_status("second"));
        script.abort();
    }

    #[tokio::test]
    async fn test_rejections_exhaust_iterations() {
        let f = fixture(quick_agent());
        let script = script_replies(&f.bus, |exited| match exited.sender.as_str() {
            "worker" => vec![NewMessage::new(
                &exited.cluster_id,
                Topic::ImplementationReady,
                "worker",
            )],
            "validator" => vec![ValidationOutcome::rejected(vec!["tests fail".into()])
                .into_message(&exited.cluster_id, "validator")],
            _ => vec![],
        });

        let id = f
            .orchestrator
            .start_cluster(ClusterRequest::new("fix it", Complexity::Simple, TaskType::Task))
            .unwrap();
        let state = f.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(state, ClusterState::Failed);

        let failed = f
            .bus
            .query(&QueryCriteria::cluster(&id).topic(Topic::ClusterFailed))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(*failed[0].content.field("agentId").unwrap(), "worker");
        assert_eq!(*failed[0].content.field("maxIterations").unwrap(), 3);

        let status = f.orchestrator.cluster_status(&id).unwrap();
        let worker = status.agents.iter().find(|a| a.id == "worker").unwrap();
        assert_eq!(worker.iterations, 3);
        assert!(f
            .bus
            .query(&QueryCriteria::cluster(&id).topic(Topic::ClusterComplete))
            .unwrap()
            .is_empty());
        script.abort();
    }

    #[tokio::test]
    async fn test_full_workflow_completes_on_batch_approval() {
        let f = fixture(quick_agent());
        let script = script_replies(&f.bus, |exited| {
            let cluster_id = exited.cluster_id.as_str();
            match exited.sender.as_str() {
                "planner" => vec![NewMessage::new(cluster_id, Topic::PlanReady, "planner")],
                "worker" => vec![
                    NewMessage::new(cluster_id, Topic::ImplementationReady, "worker"),
                    ValidationOutcome::approved().into_message(cluster_id, "validator-1"),
                    ValidationOutcome::approved().into_message(cluster_id, "validator-2"),
                ],
                _ => vec![],
            }
        });

        let id = f
            .orchestrator
            .start_cluster(
                ClusterRequest::new("add caching", Complexity::Standard, TaskType::Task)
                    .with_id("standard"),
            )
            .unwrap();
        let state = f.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(state, ClusterState::Completed);

        let complete = f
            .bus
            .query(&QueryCriteria::cluster(&id).topic(Topic::ClusterComplete))
            .unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(
            *complete[0].content.field("detector").unwrap(),
            "completion-detector"
        );
        let status = f.orchestrator.cluster_status(&id).unwrap();
        assert_eq!(status.template, "full-workflow");
        assert_eq!(status.agents.len(), 4);
        script.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_for_busy_agent_runs_after_exit() {
        let f = fixture(SlowValidators {
            quick: quick_agent(),
            slow: CommandLauncher::new("/bin/sh").args(["-c", "sleep 2"]),
        });
        let done = script_replies(&f.bus, |exited| {
            let cluster_id = exited.cluster_id.as_str();
            match exited.sender.as_str() {
                "planner" => vec![NewMessage::new(cluster_id, Topic::PlanReady, "planner")],
                "worker" => vec![NewMessage::new(cluster_id, Topic::ImplementationReady, "worker")],
                _ => vec![],
            }
        });
        // Validators reject on their first run and approve on their second,
        // so the second review round is triggered while they are still busy
        let verdicts = script_lifecycle(&f.bus, "started", |started| {
            if !started.sender.starts_with("validator") {
                return vec![];
            }
            let outcome = match started.content.field("iteration").and_then(|v| v.as_u64()) {
                Some(1) => ValidationOutcome::rejected(vec!["missing tests".into()]),
                _ => ValidationOutcome::approved(),
            };
            vec![outcome.into_message(&started.cluster_id, &started.sender)]
        });

        let id = f
            .orchestrator
            .start_cluster(
                ClusterRequest::new("add retries", Complexity::Standard, TaskType::Task)
                    .with_id("busy"),
            )
            .unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(30),
            f.orchestrator.wait_for_completion(&id),
        )
        .await
        .expect("cluster stalled")
        .unwrap();
        assert_eq!(state, ClusterState::Completed);

        let status = f.orchestrator.cluster_status(&id).unwrap();
        let iterations = |agent: &str| {
            status
                .agents
                .iter()
                .find(|a| a.id == agent)
                .map(|a| a.iterations)
        };
        assert_eq!(iterations("worker"), Some(2));
        assert_eq!(iterations("validator-1"), Some(2));
        assert_eq!(iterations("validator-2"), Some(2));
        done.abort();
        verdicts.abort();
    }

    #[tokio::test]
    async fn test_stop_cluster_terminates_agents() {
        let f = fixture(CommandLauncher::new("/bin/sh").args(["-c", "sleep 30"]));
        let id = f
            .orchestrator
            .start_cluster(
                ClusterRequest::new("long task", Complexity::Trivial, TaskType::Task)
                    .with_id("long"),
            )
            .unwrap();

        wait_for_messages(
            &f.bus,
            QueryCriteria::cluster(&id).topic(Topic::AgentLifecycle),
            1,
        )
        .await;
        let status = f.orchestrator.cluster_status(&id).unwrap();
        assert_eq!(status.agents[0].status, AgentStatus::Running);
        assert!(status.agents[0].socket.as_ref().unwrap().exists());

        // A busy agent defers the trigger instead of launching twice
        f.bus
            .publish(NewMessage::new(&id, Topic::IssueOpened, "user"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.orchestrator.cluster_status(&id).unwrap().agents[0].iterations, 1);

        assert_ok!(f.orchestrator.stop_cluster(&id).await);
        assert!(f.orchestrator.cluster_ids().is_empty());
        assert_eq!(f.bus.subscriber_count(), 0);

        let lifecycle = wait_for_messages(
            &f.bus,
            QueryCriteria::cluster(&id).topic(Topic::AgentLifecycle),
            2,
        )
        .await;
        assert_eq!(*lifecycle[1].content.field("event").unwrap(), "exited");
        assert_eq!(*lifecycle[1].content.field("signal").unwrap(), "SIGTERM");

        let err = assert_err!(f.orchestrator.stop_cluster(&id).await);
        assert!(matches!(err, OrchestratorError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_cluster_id() {
        let f = fixture(CommandLauncher::new("/bin/sh").args(["-c", "sleep 30"]));
        let request = ClusterRequest::new("task", Complexity::Trivial, TaskType::Task).with_id("dup");
        f.orchestrator.start_cluster(request.clone()).unwrap();

        let err = assert_err!(f.orchestrator.start_cluster(request));
        assert!(matches!(err, OrchestratorError::ClusterExists(id) if id == "dup"));
        assert_eq!(
            f.bus
                .count(&QueryCriteria::cluster("dup").topic(Topic::IssueOpened))
                .unwrap(),
            1
        );
        f.orchestrator.shutdown().await;
        assert!(f.orchestrator.cluster_ids().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_reports_agent_error() {
        let f = fixture(CommandLauncher::new("/nonexistent/conclave-agent"));
        let id = f
            .orchestrator
            .start_cluster(ClusterRequest::new("task", Complexity::Trivial, TaskType::Task))
            .unwrap();

        let errors = wait_for_messages(
            &f.bus,
            QueryCriteria::cluster(&id).topic(Topic::AgentError),
            1,
        )
        .await;
        assert_eq!(errors[0].sender, "worker");

        let status = f.orchestrator.cluster_status(&id).unwrap();
        assert_eq!(status.state, ClusterState::Running);
        assert!(matches!(status.agents[0].status, AgentStatus::Failed { .. }));
        f.orchestrator.stop_cluster(&id).await.unwrap();
    }

    #[test]
    fn test_unknown_cluster() {
        let f = fixture(quick_agent());
        assert!(matches!(
            f.orchestrator.cluster_status("nope"),
            Err(OrchestratorError::ClusterNotFound(_))
        ));
    }
}
