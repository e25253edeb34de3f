//! Conclave error types

use thiserror::Error;

use crate::attach::AttachError;
use crate::bus::BusError;
use crate::channel::ChannelError;
use crate::ledger::LedgerError;
use crate::orchestrator::OrchestratorError;
use crate::protocol::ProtocolError;
use crate::template::TemplateError;

/// Any error the crate can produce
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Attach error: {0}")]
    Attach(#[from] AttachError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}
