//! Coordination messages exchanged between agents of a cluster

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known coordination topics
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Topic {
    /// A new task entered the cluster
    IssueOpened,
    /// A planner finished its plan
    PlanReady,
    /// A worker finished an implementation attempt
    ImplementationReady,
    /// A validator reported on an implementation
    ValidationResult,
    /// An investigator finished root-cause analysis
    InvestigationComplete,
    /// Agent process started or exited
    AgentLifecycle,
    /// An agent reported a failure
    AgentError,
    /// Token accounting report
    TokenUsage,
    /// The cluster finished successfully
    ClusterComplete,
    /// The cluster gave up
    ClusterFailed,
    /// Any other topic
    Custom(String),
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::IssueOpened => "ISSUE_OPENED",
            Topic::PlanReady => "PLAN_READY",
            Topic::ImplementationReady => "IMPLEMENTATION_READY",
            Topic::ValidationResult => "VALIDATION_RESULT",
            Topic::InvestigationComplete => "INVESTIGATION_COMPLETE",
            Topic::AgentLifecycle => "AGENT_LIFECYCLE",
            Topic::AgentError => "AGENT_ERROR",
            Topic::TokenUsage => "TOKEN_USAGE",
            Topic::ClusterComplete => "CLUSTER_COMPLETE",
            Topic::ClusterFailed => "CLUSTER_FAILED",
            Topic::Custom(name) => name,
        }
    }

    /// Empty custom topics count as a missing topic
    pub fn is_empty(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        match s {
            "ISSUE_OPENED" => Topic::IssueOpened,
            "PLAN_READY" => Topic::PlanReady,
            "IMPLEMENTATION_READY" => Topic::ImplementationReady,
            "VALIDATION_RESULT" => Topic::ValidationResult,
            "INVESTIGATION_COMPLETE" => Topic::InvestigationComplete,
            "AGENT_LIFECYCLE" => Topic::AgentLifecycle,
            "AGENT_ERROR" => Topic::AgentError,
            "TOKEN_USAGE" => Topic::TokenUsage,
            "CLUSTER_COMPLETE" => Topic::ClusterComplete,
            "CLUSTER_FAILED" => Topic::ClusterFailed,
            other => Topic::Custom(other.to_string()),
        }
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Topic::from(s.as_str())
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.as_str().to_string()
    }
}

impl FromStr for Topic {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Topic::from(s))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body: optional free text plus structured data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            data: Value::Null,
        }
    }

    pub fn data(data: Value) -> Self {
        Self { text: None, data }
    }

    /// Look up a top-level field of `data`
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// A message as persisted by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Ledger-assigned sequence number
    pub id: i64,
    pub cluster_id: String,
    pub topic: Topic,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_model: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    /// Ledger-assigned timestamp, milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Message {
    /// Parse this message as a validation result
    pub fn validation_outcome(&self) -> Option<ValidationOutcome> {
        if self.topic != Topic::ValidationResult {
            return None;
        }
        Some(ValidationOutcome::from_content(&self.content))
    }

    /// Token usage reported by this message, with the reporting role
    pub fn token_usage(&self) -> Option<(String, TokenUsage)> {
        let usage = self.content.field("token_usage")?;
        let usage: TokenUsage = serde_json::from_value(usage.clone()).ok()?;
        let role = self
            .content
            .field("role")
            .and_then(Value::as_str)
            .unwrap_or(&self.sender)
            .to_string();
        Some((role, usage))
    }
}

/// A message about to be published; the ledger assigns `id` and `timestamp`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub cluster_id: String,
    pub topic: Topic,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_model: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
}

impl NewMessage {
    pub fn new(
        cluster_id: impl Into<String>,
        topic: impl Into<Topic>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            topic: topic.into(),
            sender: sender.into(),
            sender_model: None,
            content: MessageContent::default(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.text = Some(text.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.content.data = data;
        self
    }

    pub fn with_sender_model(mut self, model: impl Into<String>) -> Self {
        self.sender_model = Some(model.into());
        self
    }

    /// Names of required fields that are missing or blank
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.cluster_id.trim().is_empty() {
            missing.push("cluster_id");
        }
        if self.topic.is_empty() {
            missing.push("topic");
        }
        if self.sender.trim().is_empty() {
            missing.push("sender");
        }
        missing
    }
}

/// Structured payload of a `VALIDATION_RESULT` message
///
/// `approved` is always a JSON boolean on the wire. Payloads carrying
/// anything else (including the strings `"true"`/`"false"`) are malformed
/// and read back as a rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn approved() -> Self {
        Self {
            approved: true,
            summary: None,
            errors: Vec::new(),
        }
    }

    pub fn rejected(errors: Vec<String>) -> Self {
        Self {
            approved: false,
            summary: None,
            errors,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    fn from_content(content: &MessageContent) -> Self {
        match serde_json::from_value::<ValidationOutcome>(content.data.clone()) {
            Ok(outcome) => outcome,
            Err(_) => Self::rejected(vec!["malformed validation result".into()]),
        }
    }

    /// Build the message a validator publishes
    pub fn into_message(
        self,
        cluster_id: impl Into<String>,
        validator_id: impl Into<String>,
    ) -> NewMessage {
        let text = self.summary.clone();
        let mut message = NewMessage::new(cluster_id, Topic::ValidationResult, validator_id)
            .with_data(serde_json::to_value(&self).unwrap_or(Value::Null));
        message.content.text = text;
        message
    }
}

/// Token usage counters reported by an agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    /// Number of reports folded into this value
    #[serde(default)]
    pub count: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Fold in one report; counters saturate instead of wrapping
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cost_usd += other.cost_usd;
        self.count = self.count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn persisted(topic: Topic, data: Value) -> Message {
        Message {
            id: 1,
            cluster_id: "c1".into(),
            topic,
            sender: "validator-1".into(),
            sender_model: None,
            content: MessageContent::data(data),
            timestamp: 0,
        }
    }

    #[test]
    fn test_topic_wire_names() {
        assert_eq!(Topic::from("VALIDATION_RESULT"), Topic::ValidationResult);
        assert_eq!(Topic::from("MY_TOPIC"), Topic::Custom("MY_TOPIC".into()));
        assert_eq!(
            serde_json::to_string(&Topic::PlanReady).unwrap(),
            "\"PLAN_READY\""
        );
        let topic: Topic = serde_json::from_str("\"ISSUE_OPENED\"").unwrap();
        assert_eq!(topic, Topic::IssueOpened);
    }

    #[test]
    fn test_missing_fields() {
        let msg = NewMessage::new("", Topic::Custom(" ".into()), "worker");
        assert_eq!(msg.missing_fields(), vec!["cluster_id", "topic"]);

        let msg = NewMessage::new("c1", Topic::PlanReady, "planner");
        assert!(msg.missing_fields().is_empty());
    }

    #[test]
    fn test_validation_outcome_requires_boolean() {
        let ok = persisted(Topic::ValidationResult, json!({ "approved": true }));
        assert!(ok.validation_outcome().unwrap().approved);

        let stringly = persisted(Topic::ValidationResult, json!({ "approved": "true" }));
        assert!(!stringly.validation_outcome().unwrap().approved);

        let other = persisted(Topic::PlanReady, json!({ "approved": true }));
        assert!(other.validation_outcome().is_none());
    }

    #[test]
    fn test_validation_outcome_into_message() {
        let msg = ValidationOutcome::rejected(vec!["tests fail".into()])
            .with_summary("needs work")
            .into_message("c1", "validator-2");
        assert_eq!(msg.topic, Topic::ValidationResult);
        assert_eq!(msg.content.text.as_deref(), Some("needs work"));
        assert_eq!(msg.content.data["approved"], json!(false));
    }

    #[test]
    fn test_token_usage_role_fallback() {
        let mut msg = persisted(
            Topic::TokenUsage,
            json!({ "token_usage": { "input_tokens": 10, "output_tokens": 5 } }),
        );
        let (role, usage) = msg.token_usage().unwrap();
        assert_eq!(role, "validator-1");
        assert_eq!(usage.total_tokens(), 15);

        msg.content.data["role"] = json!("validator");
        assert_eq!(msg.token_usage().unwrap().0, "validator");
    }

    #[test]
    fn test_token_usage_saturates() {
        let mut total = TokenUsage {
            input_tokens: u64::MAX - 1,
            output_tokens: 7,
            cost_usd: 0.5,
            count: 1,
        };
        total.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: u64::MAX,
            cost_usd: 0.25,
            count: 1,
        });
        assert_eq!(total.input_tokens, u64::MAX);
        assert_eq!(total.output_tokens, u64::MAX);
        assert_eq!(total.total_tokens(), u64::MAX);
        assert_eq!(total.count, 2);
        assert_eq!(total.cost_usd, 0.75);
    }
}
