//! The agency runtime.
//!
//! An [`Agency`] hosts many cooperative agents. Each agent is owned by an
//! [`AgentMedium`], which dispatches inbound messages to live protocol
//! instances (listeners), spawns interested-side protocol machines for
//! registered interests, and wraps every call into agent code in a journal
//! section so that the agent's execution can later be [replayed](Replay).

use models::{ProtocolType, SessionId};

mod agency;
mod interest;
mod medium;
pub mod protocols;
mod replay;
mod retrying;

pub use agency::{Agency, Agent, AgentFactory};
pub use interest::{Interest, InterestType};
pub use medium::{AgentMedium, Context};
pub use protocols::{
    contracts::{
        ContractManager, Contractor, ContractorMedium, ContractorState, ManagerMedium,
        ManagerState,
    },
    requests::{Replier, ReplierMedium, RequestState, Requester, RequesterMedium},
    tasks::{Task, TaskMedium, TaskState},
    InitiatorSide, InterestedSide, Listener, ProtocolFactory, ProtocolRef, Recorder,
    TerminalResult,
};
pub use replay::Replay;
pub use retrying::{RetryPolicy, RetryingProtocol};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no agent factory is registered for document type {0:?}")]
    UnknownAgentType(String),
    #[error("no protocol factory is registered for key {0:?}")]
    UnknownFactory(String),
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
    #[error("already interested in the {0}.{1} protocol")]
    DuplicateInterest(ProtocolType, String),
    #[error("{machine} cannot {event} while {state}")]
    InvalidTransition {
        machine: &'static str,
        event: &'static str,
        state: String,
    },
    #[error("the agency has been dropped")]
    AgencyGone,
    #[error("agent medium for {0:?} is gone")]
    MediumGone(String),
    #[error("replay diverged: {0}")]
    ReplayMismatch(String),
    #[error(transparent)]
    Journal(#[from] journal::Error),
    #[error(transparent)]
    Snapshot(#[from] snapshot::Error),
    #[error(transparent)]
    Store(#[from] docstore::Error),
    #[error(transparent)]
    Transport(#[from] messaging::Error),
    #[error("failed to (de)serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("agent failure: {0}")]
    Agent(#[source] anyhow::Error),
}

impl Error {
    /// Recover a typed error that travelled through a recorded side
    /// effect's `anyhow` envelope.
    pub(crate) fn from_effect(err: journal::Error) -> Error {
        match err {
            journal::Error::Effect(err) => match err.downcast::<Error>() {
                Ok(err) => err,
                Err(err) => match err.downcast::<docstore::Error>() {
                    Ok(err) => Error::Store(err),
                    Err(err) => Error::Agent(err),
                },
            },
            other => Error::Journal(other),
        }
    }
}

/// The terminal failure of a protocol instance, delivered to completion
/// waiters.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum ProtocolFailure {
    #[error("the protocol expired")]
    Expired,
    #[error("the exchange was cancelled")]
    Cancelled,
    #[error("our bid was rejected")]
    Rejected,
    #[error("the grant period ended without all reports: {0}")]
    Aborted(String),
    #[error("the agent side failed: {0}")]
    Failed(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("gave up after {0} attempts")]
    RetriesExhausted(u32),
}

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}
