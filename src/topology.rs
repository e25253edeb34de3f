//! Agent topology of a cluster

use std::collections::HashMap;

use crate::message::Topic;
use crate::template::{AgentRole, AgentSpec, ResolvedTemplate, TriggerSpec};

/// Index over a resolved template
#[derive(Debug, Clone)]
pub struct Topology {
    template: String,
    /// Agents in template order
    agents: Vec<AgentSpec>,
    /// Agent position by id
    index: HashMap<String, usize>,
    /// `(agent position, trigger position)` by topic
    listeners: HashMap<Topic, Vec<(usize, usize)>>,
}

impl Topology {
    pub fn new(resolved: ResolvedTemplate) -> Self {
        let mut index = HashMap::new();
        let mut listeners: HashMap<Topic, Vec<(usize, usize)>> = HashMap::new();

        for (agent_pos, agent) in resolved.agents.iter().enumerate() {
            index.insert(agent.id.clone(), agent_pos);
            for (trigger_pos, trigger) in agent.triggers.iter().enumerate() {
                listeners
                    .entry(trigger.topic.clone())
                    .or_default()
                    .push((agent_pos, trigger_pos));
            }
        }

        Self {
            template: resolved.name,
            agents: resolved.agents,
            index,
            listeners,
        }
    }

    /// Name of the base template this topology came from
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn agent(&self, id: &str) -> Option<&AgentSpec> {
        self.index.get(id).map(|pos| &self.agents[*pos])
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn agents_with_role(&self, role: AgentRole) -> Vec<&AgentSpec> {
        self.agents.iter().filter(|a| a.role == role).collect()
    }

    /// Agents that run as supervised processes
    pub fn supervised_agents(&self) -> Vec<&AgentSpec> {
        self.agents
            .iter()
            .filter(|a| a.role != AgentRole::Orchestrator)
            .collect()
    }

    /// Triggers listening on `topic`, in template order
    pub fn listeners(&self, topic: &Topic) -> Vec<(&AgentSpec, &TriggerSpec)> {
        self.listeners
            .get(topic)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(a, t)| (&self.agents[*a], &self.agents[*a].triggers[*t]))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every topic some agent listens on
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.listeners.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{Complexity, TaskType, TemplateResolver, TriggerAction};

    fn topology(complexity: Complexity, task_type: TaskType) -> Topology {
        Topology::new(
            TemplateResolver::new()
                .resolve_for(complexity, task_type)
                .unwrap(),
        )
    }

    #[test]
    fn test_empty_topology() {
        let topology = Topology::new(ResolvedTemplate {
            name: "empty".into(),
            agents: vec![],
        });
        assert!(topology.is_empty());
        assert!(topology.topics().is_empty());
        assert!(topology.listeners(&Topic::IssueOpened).is_empty());
    }

    #[test]
    fn test_lookup_by_id_and_role() {
        let topology = topology(Complexity::Standard, TaskType::Task);
        assert_eq!(topology.template(), "full-workflow");
        assert_eq!(topology.len(), 5);
        assert_eq!(topology.agent("validator-2").unwrap().role, AgentRole::Validator);
        assert!(topology.agent("validator-3").is_none());
        assert_eq!(topology.agents_with_role(AgentRole::Validator).len(), 2);
    }

    #[test]
    fn test_supervised_agents_skip_orchestrator_role() {
        let topology = topology(Complexity::Trivial, TaskType::Task);
        let supervised: Vec<&str> = topology
            .supervised_agents()
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(supervised, vec!["worker"]);
    }

    #[test]
    fn test_listeners_in_template_order() {
        let topology = topology(Complexity::Critical, TaskType::Task);

        let on_implementation: Vec<&str> = topology
            .listeners(&Topic::ImplementationReady)
            .iter()
            .map(|(a, _)| a.id.as_str())
            .collect();
        assert_eq!(
            on_implementation,
            vec!["validator-1", "validator-2", "validator-3", "validator-4"]
        );

        let on_validation = topology.listeners(&Topic::ValidationResult);
        assert_eq!(on_validation.len(), 2);
        assert_eq!(on_validation[0].0.id, "worker");
        assert_eq!(on_validation[1].1.action, TriggerAction::StopCluster);
    }

    #[test]
    fn test_topics() {
        let topology = topology(Complexity::Simple, TaskType::Task);
        assert_eq!(
            topology.topics(),
            vec![
                Topic::IssueOpened,
                Topic::ImplementationReady,
                Topic::ValidationResult,
            ]
        );
    }
}
