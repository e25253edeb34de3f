//! Cluster templates
//!
//! A task is classified along two axes, complexity and task type. Routing
//! picks one of the base topologies below and derives the parameters it
//! needs; [`TemplateResolver::resolve`] then expands the base topology's
//! placeholders into a concrete agent list.
//!
//! A string value that is exactly one placeholder (`"{{validator_count}}"`)
//! is replaced by the parameter's JSON value, so numbers and booleans keep
//! their type. Placeholders embedded in longer strings are interpolated.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::message::Topic;

/// Template parameters by placeholder name
pub type TemplateParams = BTreeMap<String, Value>;

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("single-worker", include_str!("../templates/single-worker.json")),
    ("worker-validator", include_str!("../templates/worker-validator.json")),
    ("full-workflow", include_str!("../templates/full-workflow.json")),
    ("debug-workflow", include_str!("../templates/debug-workflow.json")),
];

/// Template errors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Base template not found: {0}")]
    NotFound(String),

    #[error("Template {template} is missing required params: {}", .missing.join(", "))]
    MissingParams {
        template: String,
        missing: Vec<String>,
    },

    #[error("Template {template} is invalid: {reason}")]
    Invalid { template: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Trivial,
    Simple,
    Standard,
    Critical,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Trivial => "TRIVIAL",
            Complexity::Simple => "SIMPLE",
            Complexity::Standard => "STANDARD",
            Complexity::Critical => "CRITICAL",
        }
    }

    pub fn validator_count(&self) -> u32 {
        match self {
            Complexity::Trivial => 0,
            Complexity::Simple => 1,
            Complexity::Standard => 2,
            Complexity::Critical => 4,
        }
    }

    pub fn max_tokens(&self) -> u64 {
        match self {
            Complexity::Trivial => 50_000,
            Complexity::Simple | Complexity::Standard => 100_000,
            Complexity::Critical => 150_000,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        match self {
            Complexity::Trivial => 1,
            Complexity::Simple => 3,
            Complexity::Standard => 5,
            Complexity::Critical => 7,
        }
    }

    /// Model tier for a role at this complexity
    pub fn model_level(&self, role: AgentRole) -> ModelLevel {
        match (self, role) {
            (Complexity::Trivial, _) => ModelLevel::Level1,
            (Complexity::Critical, AgentRole::Planner | AgentRole::Investigator) => {
                ModelLevel::Level3
            }
            _ => ModelLevel::Level2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Inquiry,
    Task,
    Debug,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Inquiry => "INQUIRY",
            TaskType::Task => "TASK",
            TaskType::Debug => "DEBUG",
        }
    }
}

/// Model tier, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelLevel {
    Level1,
    Level2,
    Level3,
}

impl ModelLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelLevel::Level1 => "level1",
            ModelLevel::Level2 => "level2",
            ModelLevel::Level3 => "level3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Worker,
    Validator,
    Investigator,
    /// Runs inside the orchestrator, never as a process
    Orchestrator,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Worker => "worker",
            AgentRole::Validator => "validator",
            AgentRole::Investigator => "investigator",
            AgentRole::Orchestrator => "orchestrator",
        }
    }
}

/// Named trigger predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Always,
    /// The triggering validation result rejected the work
    ValidationRejected,
    /// The triggering validation result approved the work
    ValidationApproved,
    /// Every validator reported on the latest implementation and at least one rejected
    ConsensusRejected,
    /// Every validator reported on the latest implementation and all approved
    ConsensusApproved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerLogic {
    pub script: Predicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    /// Run the agent (again)
    #[default]
    ExecuteTask,
    /// Finish the cluster
    StopCluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<TriggerLogic>,
    #[serde(default)]
    pub action: TriggerAction,
}

impl TriggerSpec {
    pub fn predicate(&self) -> Predicate {
        self.logic.map(|l| l.script).unwrap_or(Predicate::Always)
    }
}

/// One concrete agent of a resolved topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    pub role: AgentRole,
    pub model_level: ModelLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentTemplate {
    #[serde(flatten)]
    spec: AgentSpec,
    #[serde(default)]
    replicas: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct TemplateDocument {
    #[serde(default)]
    description: String,
    agents: Vec<AgentTemplate>,
}

/// Output of [`TemplateResolver::resolve`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTemplate {
    pub name: String,
    pub agents: Vec<AgentSpec>,
}

/// Introspection data for a base template
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateInfo {
    pub name: String,
    pub description: String,
    /// Placeholder names the template needs bound
    pub params: Vec<String>,
    pub agent_ids: Vec<String>,
}

/// Routing decision for one classification
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterPlan {
    pub base: String,
    pub params: TemplateParams,
}

/// Pick the base topology and derive its parameters
pub fn route(complexity: Complexity, task_type: TaskType) -> ClusterPlan {
    let level = |role| Value::from(complexity.model_level(role).as_str());
    let mut params = TemplateParams::new();
    params.insert("task_type".into(), json!(task_type.as_str()));
    params.insert("complexity".into(), json!(complexity.as_str()));
    params.insert("max_tokens".into(), json!(complexity.max_tokens()));

    let base = if task_type == TaskType::Debug && complexity != Complexity::Trivial {
        params.insert("investigator_level".into(), level(AgentRole::Investigator));
        params.insert("fixer_level".into(), level(AgentRole::Worker));
        params.insert("tester_level".into(), level(AgentRole::Validator));
        params.insert("validator_count".into(), json!(complexity.validator_count()));
        params.insert("max_iterations".into(), json!(complexity.max_iterations()));
        "debug-workflow"
    } else if complexity == Complexity::Trivial {
        params.insert("worker_level".into(), level(AgentRole::Worker));
        "single-worker"
    } else if complexity == Complexity::Simple {
        params.insert("worker_level".into(), level(AgentRole::Worker));
        params.insert("validator_level".into(), level(AgentRole::Validator));
        params.insert("max_iterations".into(), json!(complexity.max_iterations()));
        "worker-validator"
    } else {
        params.insert("planner_level".into(), level(AgentRole::Planner));
        params.insert("worker_level".into(), level(AgentRole::Worker));
        params.insert("validator_level".into(), level(AgentRole::Validator));
        params.insert("validator_count".into(), json!(complexity.validator_count()));
        params.insert("max_iterations".into(), json!(complexity.max_iterations()));
        "full-workflow"
    };

    ClusterPlan {
        base: base.to_string(),
        params,
    }
}

/// Expands base topologies into concrete agent lists
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    templates: BTreeMap<String, String>,
}

impl TemplateResolver {
    /// Resolver with the built-in topologies
    pub fn new() -> Self {
        let templates = BUILTIN_TEMPLATES
            .iter()
            .map(|(name, raw)| (name.to_string(), raw.to_string()))
            .collect();
        Self { templates }
    }

    /// Add or replace a base template
    pub fn register(&mut self, name: impl Into<String>, raw: impl Into<String>) -> Result<(), TemplateError> {
        let name = name.into();
        let raw = raw.into();
        let value: Value = serde_json::from_str(&raw).map_err(|e| TemplateError::Invalid {
            template: name.clone(),
            reason: e.to_string(),
        })?;
        if !value.get("agents").is_some_and(Value::is_array) {
            return Err(TemplateError::Invalid {
                template: name,
                reason: "missing agents array".into(),
            });
        }
        self.templates.insert(name, raw);
        Ok(())
    }

    pub fn list_templates(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    /// Metadata for a template; `None` if it does not exist
    pub fn template_info(&self, name: &str) -> Option<TemplateInfo> {
        let raw = self.templates.get(name)?;
        let value: Value = serde_json::from_str(raw).ok()?;

        let mut params = BTreeSet::new();
        collect_placeholders(&value, &mut params);

        let agent_ids = value
            .get("agents")
            .and_then(Value::as_array)
            .map(|agents| {
                agents
                    .iter()
                    .filter_map(|a| a.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Some(TemplateInfo {
            name: name.to_string(),
            description: value
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            params: params.into_iter().collect(),
            agent_ids,
        })
    }

    /// Expand `base` with `params`
    pub fn resolve(&self, base: &str, params: &TemplateParams) -> Result<ResolvedTemplate, TemplateError> {
        let raw = self
            .templates
            .get(base)
            .ok_or_else(|| TemplateError::NotFound(base.to_string()))?;
        let invalid = |reason: String| TemplateError::Invalid {
            template: base.to_string(),
            reason,
        };

        let value: Value = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;

        let mut missing = BTreeSet::new();
        let expanded = substitute(&value, params, &mut missing);
        if !missing.is_empty() {
            return Err(TemplateError::MissingParams {
                template: base.to_string(),
                missing: missing.into_iter().collect(),
            });
        }

        let document: TemplateDocument =
            serde_json::from_value(expanded).map_err(|e| invalid(e.to_string()))?;

        let mut agents = Vec::new();
        for template in document.agents {
            match template.replicas {
                None => agents.push(template.spec),
                Some(count) => {
                    for index in 1..=count {
                        let mut spec = template.spec.clone();
                        spec.id = format!("{}-{index}", template.spec.id);
                        agents.push(spec);
                    }
                }
            }
        }

        let mut seen = BTreeSet::new();
        for agent in &agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(invalid(format!("duplicate agent id {}", agent.id)));
            }
        }

        debug!(
            template = base,
            description = %document.description,
            agents = agents.len(),
            "Resolved template"
        );

        Ok(ResolvedTemplate {
            name: base.to_string(),
            agents,
        })
    }

    /// Route a classification and resolve the chosen template
    pub fn resolve_for(
        &self,
        complexity: Complexity,
        task_type: TaskType,
    ) -> Result<ResolvedTemplate, TemplateError> {
        let plan = route(complexity, task_type);
        self.resolve(&plan.base, &plan.params)
    }
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// `(start, end, name)` for every `{{name}}` in `s`
fn placeholders(s: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(open) = s[offset..].find("{{") {
        let start = offset + open;
        let Some(close) = s[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        found.push((start, end, s[start + 2..end - 2].trim()));
        offset = end;
    }
    found
}

fn collect_placeholders(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for (_, _, name) in placeholders(s) {
                out.insert(name.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, out)),
        _ => {}
    }
}

fn substitute(value: &Value, params: &TemplateParams, missing: &mut BTreeSet<String>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, params, missing),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute(v, params, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, params, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, params: &TemplateParams, missing: &mut BTreeSet<String>) -> Value {
    let found = placeholders(s);
    if found.is_empty() {
        return Value::String(s.to_string());
    }

    // Whole-value placeholder keeps the parameter's JSON type
    if let [(start, end, name)] = found.as_slice() {
        if *start == 0 && *end == s.len() {
            return match params.get(*name) {
                Some(value) => value.clone(),
                None => {
                    missing.insert(name.to_string());
                    Value::Null
                }
            };
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut cursor = 0;
    for (start, end, name) in found {
        out.push_str(&s[cursor..start]);
        match params.get(name) {
            Some(Value::String(text)) => out.push_str(text),
            Some(other) => out.push_str(&other.to_string()),
            None => {
                missing.insert(name.to_string());
            }
        }
        cursor = end;
    }
    out.push_str(&s[cursor..]);
    Value::String(out)
}
