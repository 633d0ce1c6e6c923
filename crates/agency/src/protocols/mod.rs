use crate::agency::Agent;
use crate::medium::Context;
use crate::{lock, Error, InterestType, ProtocolFailure};
use journal::JournalId;
use models::{Message, MessageClass, ProtocolType, SessionId};
use snapshot::{Live, Snapshot};
use std::sync::{Arc, Mutex};

pub mod contracts;
pub mod requests;
pub mod tasks;

/// Describes one protocol and builds its agent-side objects. Factories
/// are registered with the agency under a stable `key` at startup; both
/// live initiation and replay resolve through that registry.
pub trait ProtocolFactory: Send + Sync {
    /// Stable registry key, e.g. `"contract:buy"`.
    fn key(&self) -> &str;

    fn protocol_type(&self) -> ProtocolType;

    /// The conversation id messages carry (and public interests bind on).
    fn protocol_id(&self) -> &str;

    fn interest_type(&self) -> InterestType {
        InterestType::Private
    }

    /// The message class that opens a new interested-side conversation.
    fn initiator_class(&self) -> Option<MessageClass> {
        match self.protocol_type() {
            ProtocolType::Contract => Some(MessageClass::Announcement),
            ProtocolType::Request => Some(MessageClass::Request),
            ProtocolType::Task => None,
        }
    }

    /// The initiator-side agent object, when this factory can initiate.
    fn make_initiator(&self, agent: &Arc<dyn Agent>) -> Option<InitiatorSide> {
        let _ = agent;
        None
    }

    /// The interested-side agent object, when this factory accepts
    /// inbound conversations.
    fn make_interested(&self, agent: &Arc<dyn Agent>) -> Option<InterestedSide> {
        let _ = agent;
        None
    }
}

pub enum InitiatorSide {
    Manager(Arc<dyn contracts::ContractManager>),
    Requester(Arc<dyn requests::Requester>),
    Task(Arc<dyn tasks::Task>),
}

pub enum InterestedSide {
    Contractor(Arc<dyn contracts::Contractor>),
    Replier(Arc<dyn requests::Replier>),
}

/// Which side of a protocol a journaled `protocol_created` refers to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProtocolSide {
    Initiator,
    Interested,
    Retrying,
}

impl std::fmt::Display for ProtocolSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProtocolSide::Initiator => "initiator",
            ProtocolSide::Interested => "interested",
            ProtocolSide::Retrying => "retrying",
        })
    }
}

impl std::str::FromStr for ProtocolSide {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "initiator" => Ok(ProtocolSide::Initiator),
            "interested" => Ok(ProtocolSide::Interested),
            "retrying" => Ok(ProtocolSide::Retrying),
            other => Err(Error::ReplayMismatch(format!(
                "unknown protocol side {other:?}"
            ))),
        }
    }
}

/// A live protocol instance registered with its medium under a session id.
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn journal_id(&self) -> &JournalId;

    /// Snapshot of the agent-side protocol object.
    fn agent_side(&self) -> Live;

    fn as_recorder(self: Arc<Self>) -> Arc<dyn Recorder>;

    /// Deliver an inbound message of this conversation.
    async fn deliver(self: Arc<Self>, message: Message) -> Result<(), Error>;
}

/// Anything that emits journal entries and can be driven by replay.
#[async_trait::async_trait]
pub trait Recorder: Send + Sync {
    fn journal_id(&self) -> &JournalId;

    fn as_snapshot(self: Arc<Self>) -> Arc<dyn Snapshot>;

    /// Re-apply one recorded entry against this replica.
    async fn replay_call(&self, ctx: &Context, entry_id: &str, input: Live) -> Result<Live, Error>;
}

/// A handle on an initiated protocol, returned by `initiate_protocol`.
#[derive(Clone)]
pub enum ProtocolRef {
    Manager(Arc<contracts::ManagerMedium>),
    Requester(Arc<requests::RequesterMedium>),
    Task(Arc<tasks::TaskMedium>),
    Retrying(Arc<crate::retrying::RetryingProtocol>),
}

impl ProtocolRef {
    pub fn as_manager(&self) -> Option<&Arc<contracts::ManagerMedium>> {
        match self {
            ProtocolRef::Manager(machine) => Some(machine),
            _ => None,
        }
    }

    pub fn as_requester(&self) -> Option<&Arc<requests::RequesterMedium>> {
        match self {
            ProtocolRef::Requester(machine) => Some(machine),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&Arc<tasks::TaskMedium>> {
        match self {
            ProtocolRef::Task(machine) => Some(machine),
            _ => None,
        }
    }

    /// Wait for the protocol's terminal result.
    pub async fn notify_finish(&self) -> TerminalResult {
        match self {
            ProtocolRef::Manager(machine) => machine.notify_finish().await,
            ProtocolRef::Requester(machine) => machine.notify_finish().await,
            ProtocolRef::Task(machine) => machine.notify_finish().await,
            ProtocolRef::Retrying(wrapper) => wrapper.notify_finish().await,
        }
    }

    pub(crate) fn as_live(&self) -> Live {
        match self {
            ProtocolRef::Manager(machine) => Live::Handle(machine.clone().as_snapshot()),
            ProtocolRef::Requester(machine) => Live::Handle(machine.clone().as_snapshot()),
            ProtocolRef::Task(machine) => Live::Handle(machine.clone().as_snapshot()),
            ProtocolRef::Retrying(wrapper) => Live::Handle(wrapper.clone().as_snapshot()),
        }
    }

    pub(crate) fn from_handle(handle: &Arc<dyn Snapshot>) -> Option<ProtocolRef> {
        let any = handle.clone().as_any();
        if let Ok(machine) = any.clone().downcast::<contracts::ManagerMedium>() {
            return Some(ProtocolRef::Manager(machine));
        }
        if let Ok(machine) = any.clone().downcast::<requests::RequesterMedium>() {
            return Some(ProtocolRef::Requester(machine));
        }
        if let Ok(machine) = any.clone().downcast::<tasks::TaskMedium>() {
            return Some(ProtocolRef::Task(machine));
        }
        if let Ok(wrapper) = any.downcast::<crate::retrying::RetryingProtocol>() {
            return Some(ProtocolRef::Retrying(wrapper));
        }
        None
    }
}

/// The terminal outcome of a protocol instance.
pub type TerminalResult = Result<Live, ProtocolFailure>;

/// Resolves completion waiters exactly once.
pub(crate) struct Terminal {
    tx: tokio::sync::watch::Sender<Option<TerminalResult>>,
}

impl Terminal {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::watch::channel(None);
        Self { tx }
    }

    /// The first resolution wins; later ones are ignored.
    pub fn resolve(&self, result: TerminalResult) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }

    pub async fn wait(&self) -> TerminalResult {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.clone().expect("slot is resolved"),
            // The machine was dropped without resolving.
            Err(_) => Err(ProtocolFailure::Failed("protocol instance dropped".to_string())),
        };
        result
    }
}

/// At most one active expiration timer; setting a new deadline cancels
/// the prior one, and termination cancels unconditionally.
pub(crate) struct ExpirationTimer(Mutex<Option<tokio::task::JoinHandle<()>>>);

impl ExpirationTimer {
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    pub fn schedule<F>(&self, delay: std::time::Duration, fire: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        });
        if let Some(previous) = lock(&self.0).replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = lock(&self.0).take() {
            handle.abort();
        }
    }
}

impl Drop for ExpirationTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Publish through the medium as a named side effect of the open section,
/// returning the stamped message (live) or the recorded one (replay).
pub(crate) async fn send_recorded(
    medium: &Arc<crate::medium::AgentMedium>,
    ctx: &Context,
    effect_id: &str,
    recipients: &[models::Recipient],
    message: Message,
    sender_id: Option<SessionId>,
    handover: bool,
) -> Result<Message, Error> {
    let medium = medium.clone();
    let recipients = recipients.to_vec();
    let args = Live::List(vec![
        Live::Str(format!("{:?}", message.class)),
        Live::Int(recipients.len() as i64),
    ]);
    let out = ctx
        .section()
        .recorded(effect_id, args, || async move {
            let sent = medium
                .send_raw(&recipients, message, handover, sender_id)
                .await
                .map_err(anyhow::Error::new)?;
            Ok(message_to_live(&sent))
        })
        .await
        .map_err(Error::from_effect)?;
    message_from_live(&out)
}

/// True when an error signals journal/replay divergence rather than a
/// reproducible (recorded) failure.
pub(crate) fn is_replay_divergence(err: &Error) -> bool {
    matches!(
        err,
        Error::Journal(journal::Error::EffectMismatch { .. })
            | Error::Journal(journal::Error::Corrupt(_))
            | Error::ReplayMismatch(_)
    )
}

pub(crate) fn message_to_live(message: &Message) -> Live {
    serde_json::to_value(message)
        .map(|value| Live::from_json(&value))
        .unwrap_or(Live::Null)
}

pub(crate) fn message_from_live(live: &Live) -> Result<Message, Error> {
    Ok(serde_json::from_value(live.to_json()?)?)
}
