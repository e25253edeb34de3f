//! Trigger predicate evaluation
//!
//! Predicates only read the ledger. They run from bus callbacks, which fire
//! after the triggering write committed, so a consensus check never sees
//! part of a batch. Every callback of a batch sees the whole batch, so the
//! consensus predicates fire only for the newest verdict of a round.

use std::collections::{HashMap, HashSet};

use crate::bus::{BusError, MessageBus};
use crate::ledger::QueryCriteria;
use crate::message::{Message, Topic};
use crate::template::{AgentRole, Predicate};
use crate::topology::Topology;

/// Inputs of a predicate evaluation
pub struct TriggerContext<'a> {
    pub cluster_id: &'a str,
    pub message: &'a Message,
    pub topology: &'a Topology,
    pub bus: &'a MessageBus,
}

/// Validator verdicts on the latest implementation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Consensus {
    pub expected: usize,
    pub approved: usize,
    pub rejected: usize,
    /// Id of the newest verdict counted
    pub last_id: Option<i64>,
}

impl Consensus {
    pub fn is_complete(&self) -> bool {
        self.expected > 0 && self.approved + self.rejected == self.expected
    }

    /// Complete, and `message` is the verdict that completed it
    fn decided_by(&self, message: &Message) -> bool {
        self.is_complete() && self.last_id == Some(message.id)
    }
}

impl Predicate {
    pub fn evaluate(&self, ctx: &TriggerContext<'_>) -> Result<bool, BusError> {
        Ok(match self {
            Predicate::Always => true,
            Predicate::ValidationRejected => ctx
                .message
                .validation_outcome()
                .is_some_and(|outcome| !outcome.approved),
            Predicate::ValidationApproved => ctx
                .message
                .validation_outcome()
                .is_some_and(|outcome| outcome.approved),
            Predicate::ConsensusRejected => {
                let consensus = consensus(ctx)?;
                consensus.decided_by(ctx.message) && consensus.rejected > 0
            }
            Predicate::ConsensusApproved => {
                let consensus = consensus(ctx)?;
                consensus.decided_by(ctx.message) && consensus.rejected == 0
            }
        })
    }
}

/// Latest verdict of every validator since the last `IMPLEMENTATION_READY`
pub fn consensus(ctx: &TriggerContext<'_>) -> Result<Consensus, BusError> {
    let validators: HashSet<&str> = ctx
        .topology
        .agents_with_role(AgentRole::Validator)
        .into_iter()
        .map(|agent| agent.id.as_str())
        .collect();
    if validators.is_empty() {
        return Ok(Consensus::default());
    }

    let after_id = ctx
        .bus
        .find_last(&QueryCriteria::cluster(ctx.cluster_id).topic(Topic::ImplementationReady))?
        .map(|m| m.id)
        .unwrap_or(0);

    let results = ctx.bus.query(
        &QueryCriteria::cluster(ctx.cluster_id)
            .topic(Topic::ValidationResult)
            .after_id(after_id),
    )?;

    let mut latest: HashMap<&str, bool> = HashMap::new();
    let mut last_id = None;
    for result in &results {
        if !validators.contains(result.sender.as_str()) {
            continue;
        }
        if let Some(outcome) = result.validation_outcome() {
            latest.insert(result.sender.as_str(), outcome.approved);
            last_id = Some(result.id);
        }
    }

    let approved = latest.values().filter(|ok| **ok).count();
    Ok(Consensus {
        expected: validators.len(),
        approved,
        rejected: latest.len() - approved,
        last_id,
    })
}
