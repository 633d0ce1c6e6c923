use crate::agency::{Agency, Agent, AgentFactory};
use crate::interest::{Interest, InterestType};
use crate::protocols::{
    contracts::ContractorMedium,
    contracts::ManagerMedium,
    requests::{ReplierMedium, RequesterMedium},
    tasks::TaskMedium,
    InitiatorSide, InterestedSide, Listener, ProtocolFactory, ProtocolRef, ProtocolSide, Recorder,
};
use crate::retrying::{RetryPolicy, RetryingProtocol};
use crate::{lock, Error};
use indexmap::IndexMap;
use journal::{InstanceId, JournalId, Mode, Section};
use models::{Descriptor, Message, MessageId, ProtocolType, Recipient, SessionId, Timestamp};
use snapshot::{Live, Snapshot};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// The agency side of one agent: owns its descriptor, its listeners and
/// interests, its broker and database connections, and the journal
/// sections wrapped around every call into the agent.
pub struct AgentMedium {
    agency: Weak<Agency>,
    self_ref: Weak<AgentMedium>,
    mode: Mode,
    agent_id: String,
    journal_id: JournalId,
    state: Mutex<MediumState>,
    agent: OnceLock<Arc<dyn Agent>>,
    channel: OnceLock<Arc<dyn messaging::Channel>>,
    db: OnceLock<Arc<docstore::Connection>>,
    instance_seq: AtomicU64,
}

impl std::fmt::Debug for AgentMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMedium")
            .field("mode", &self.mode)
            .field("agent_id", &self.agent_id)
            .field("journal_id", &self.journal_id)
            .finish()
    }
}

struct MediumState {
    descriptor: Descriptor,
    // Insertion-ordered so snapshots and replay see listeners in the
    // order they were created.
    listeners: IndexMap<SessionId, Arc<dyn Listener>>,
    interests: HashMap<ProtocolType, HashMap<String, Interest>>,
}

impl AgentMedium {
    pub(crate) async fn create(
        agency: &Arc<Agency>,
        factory: &Arc<dyn AgentFactory>,
        descriptor: Descriptor,
    ) -> Result<Arc<Self>, Error> {
        let agent_id = descriptor.doc_id.clone();
        let shard = descriptor.shard.clone();

        let medium = Arc::new_cyclic(|weak: &Weak<AgentMedium>| AgentMedium {
            agency: Arc::downgrade(agency),
            self_ref: weak.clone(),
            mode: agency.mode(),
            journal_id: JournalId::root(&agent_id),
            agent_id,
            state: Mutex::new(MediumState {
                descriptor,
                listeners: IndexMap::new(),
                interests: HashMap::new(),
            }),
            agent: OnceLock::new(),
            channel: OnceLock::new(),
            db: OnceLock::new(),
            instance_seq: AtomicU64::new(0),
        });

        agency.journal_agent_created(&medium.agent_id, &medium.descriptor());

        let agent = factory.build(&medium);
        let _ = medium.agent.set(agent);
        agency.register(medium.clone());

        if medium.mode == Mode::Record {
            let sink: Weak<dyn messaging::MessageSink> = medium.self_ref.clone();
            let channel = agency.broker()?.get_connection(sink).await?;
            let _ = medium.channel.set(channel);
            let _ = medium.db.set(docstore::Connection::new(agency.store()?));

            // Enter the descriptor's shard: a personal binding on our own
            // document id.
            medium.create_binding(&medium.agent_id, &shard)?;
        }

        Ok(medium)
    }

    /// Await the agent's `initiate` inside its journal section.
    pub(crate) async fn call_initiate(&self) -> Result<(), Error> {
        let agent = self.agent()?;
        self.journaled(
            InstanceId::Recorder(self.journal_id.clone()),
            "initiate",
            None,
            Live::Null,
            |ctx| async move { agent.initiate(&ctx).await.map(|()| Live::Null) },
        )
        .await
        .map(|_| ())
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub fn descriptor(&self) -> Descriptor {
        lock(&self.state).descriptor.clone()
    }

    pub fn agency(&self) -> Result<Arc<Agency>, Error> {
        self.agency.upgrade().ok_or(Error::AgencyGone)
    }

    pub(crate) fn agent(&self) -> Result<Arc<dyn Agent>, Error> {
        self.agent
            .get()
            .cloned()
            .ok_or_else(|| Error::MediumGone(self.agent_id.clone()))
    }

    fn channel(&self) -> Result<Arc<dyn messaging::Channel>, Error> {
        self.channel
            .get()
            .cloned()
            .ok_or_else(|| Error::MediumGone(self.agent_id.clone()))
    }

    pub(crate) fn db(&self) -> Result<Arc<docstore::Connection>, Error> {
        self.db
            .get()
            .cloned()
            .ok_or_else(|| Error::MediumGone(self.agent_id.clone()))
    }

    fn self_arc(&self) -> Result<Arc<Self>, Error> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| Error::MediumGone(self.agent_id.clone()))
    }

    pub(crate) fn now(&self) -> Timestamp {
        match self.agency() {
            Ok(agency) => agency.get_time(),
            Err(_) => Timestamp::from_epoch_secs(0.0),
        }
    }

    /// The recipient other agents use to address this one.
    pub fn recipient(&self) -> Recipient {
        let state = lock(&self.state);
        Recipient::new(state.descriptor.doc_id.clone(), state.descriptor.shard.clone())
    }

    pub(crate) fn disconnect(&self) {
        if let Some(channel) = self.channel.get() {
            channel.disconnect();
        }
        if let Some(db) = self.db.get() {
            db.disconnect();
        }
    }

    // ### Journal sections ###

    /// Run `f` inside a recording journal section and append the entry
    /// when it closes. Errors are captured as the entry's output and then
    /// propagated.
    pub(crate) async fn journaled<F, Fut>(
        &self,
        instance_id: InstanceId,
        entry_id: &str,
        parent: Option<&Section>,
        input: Live,
        f: F,
    ) -> Result<Live, Error>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<Live>>,
    {
        if self.mode == Mode::Replay {
            return Err(Error::ReplayMismatch(format!(
                "live journaled call {entry_id:?} on a replay medium"
            )));
        }
        let section = Arc::new(match parent {
            Some(parent) => Section::record_nested(entry_id, parent),
            None => Section::record(entry_id),
        });
        let ctx = Context {
            medium: self.self_arc()?,
            section: section.clone(),
        };

        let result = f(ctx).await;

        let output = match &result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(format!("{err:#}")),
        };
        let agency = self.agency()?;
        agency.journal_write_entry(
            &self.agent_id,
            instance_id,
            entry_id,
            &section,
            &input,
            &section.finish(),
            &output,
        );
        result.map_err(Error::Agent)
    }

    // ### Listeners ###

    pub(crate) fn register_listener(&self, listener: Arc<dyn Listener>) -> Result<(), Error> {
        let session_id = listener.session_id();
        let mut state = lock(&self.state);
        if state.listeners.contains_key(&session_id) {
            return Err(Error::DuplicateSession(session_id));
        }
        tracing::debug!(agent_id = %self.agent_id, %session_id, "registering listener");
        state.listeners.insert(session_id, listener);
        Ok(())
    }

    /// Remove a terminated listener, journal `protocol_deleted`, and
    /// evict it from the recorder registry.
    pub(crate) fn unregister_listener(&self, session_id: SessionId) {
        let removed = lock(&self.state).listeners.shift_remove(&session_id);
        match removed {
            Some(listener) => {
                tracing::debug!(agent_id = %self.agent_id, %session_id, "unregistering listener");
                if let Ok(agency) = self.agency() {
                    agency.journal_protocol_deleted(
                        &self.agent_id,
                        listener.journal_id(),
                        session_id,
                    );
                    agency.unregister(listener.journal_id());
                }
            }
            None => {
                tracing::error!(
                    agent_id = %self.agent_id,
                    %session_id,
                    "tried to unregister an unknown listener"
                );
            }
        }
    }

    /// Replay-side listener removal, driven by `protocol_deleted`
    /// entries. Idempotent.
    pub(crate) fn replay_unregister(&self, session_id: SessionId) {
        if let Some(listener) = lock(&self.state).listeners.shift_remove(&session_id) {
            if let Ok(agency) = self.agency() {
                agency.unregister(listener.journal_id());
            }
        }
    }

    pub fn listener_sessions(&self) -> Vec<SessionId> {
        lock(&self.state).listeners.keys().copied().collect()
    }

    pub fn has_listener(&self, session_id: SessionId) -> bool {
        lock(&self.state).listeners.contains_key(&session_id)
    }

    /// Registered interests as `(protocol_type, protocol_id)` pairs.
    pub fn interests(&self) -> Vec<(ProtocolType, String)> {
        let state = lock(&self.state);
        state
            .interests
            .iter()
            .flat_map(|(protocol_type, by_id)| {
                by_id.keys().map(move |id| (*protocol_type, id.clone()))
            })
            .collect()
    }

    pub fn interest_has_binding(&self, protocol_type: ProtocolType, protocol_id: &str) -> bool {
        let state = lock(&self.state);
        state
            .interests
            .get(&protocol_type)
            .and_then(|by_id| by_id.get(protocol_id))
            .map(|interest| interest.has_binding())
            .unwrap_or(false)
    }

    /// Snapshot of everything related to the agent: its own state and the
    /// agent-side state of each live listener, in registration order.
    pub fn snapshot_agent(&self) -> (Live, Vec<Live>) {
        let agent = self
            .agent
            .get()
            .map(|agent| agent.snapshot())
            .unwrap_or(Live::Null);
        let listeners = lock(&self.state)
            .listeners
            .values()
            .map(|listener| listener.agent_side())
            .collect();
        (agent, listeners)
    }

    // ### Interests ###

    pub(crate) fn add_interest(&self, factory: &Arc<dyn ProtocolFactory>) -> Result<(), Error> {
        let protocol_type = factory.protocol_type();
        let protocol_id = factory.protocol_id().to_string();
        let mut state = lock(&self.state);
        let by_id = state.interests.entry(protocol_type).or_default();
        if by_id.contains_key(&protocol_id) {
            return Err(Error::DuplicateInterest(protocol_type, protocol_id));
        }
        by_id.insert(protocol_id, Interest::new(factory.clone()));
        Ok(())
    }

    pub(crate) fn remove_interest(
        &self,
        protocol_type: ProtocolType,
        protocol_id: &str,
    ) -> Option<Interest> {
        lock(&self.state)
            .interests
            .get_mut(&protocol_type)?
            .remove(protocol_id)
    }

    pub(crate) fn attach_interest_binding(
        &self,
        protocol_type: ProtocolType,
        protocol_id: &str,
        binding: Arc<dyn messaging::Binding>,
    ) {
        let state = lock(&self.state);
        if let Some(interest) = state
            .interests
            .get(&protocol_type)
            .and_then(|by_id| by_id.get(protocol_id))
        {
            interest.attach_binding(binding);
        }
    }

    pub(crate) fn create_binding(
        &self,
        key: &str,
        shard: &str,
    ) -> Result<Arc<dyn messaging::Binding>, Error> {
        Ok(self.channel()?.personal_binding(key, shard)?)
    }

    /// The broker bindings this medium currently holds in `shard`.
    pub fn bindings(&self, shard: &str) -> Vec<Arc<dyn messaging::Binding>> {
        self.channel()
            .map(|channel| channel.get_bindings(shard))
            .unwrap_or_default()
    }

    // ### Messaging ###

    /// Stamp and publish a message to each recipient. A handover forwards
    /// the message untouched, keeping the original `reply_to`,
    /// `sender_id`, and `message_id`.
    pub(crate) async fn send_raw(
        &self,
        recipients: &[Recipient],
        mut message: Message,
        handover: bool,
        sender_id: Option<SessionId>,
    ) -> Result<Message, Error> {
        if !handover {
            message.reply_to = Some(self.recipient());
            message.sender_id = sender_id;
            message.message_id = MessageId::generate();
        }
        let channel = self.channel()?;
        for recipient in recipients {
            tracing::debug!(
                agent_id = %self.agent_id,
                %recipient,
                class = ?message.class,
                "sending message"
            );
            channel
                .publish(&recipient.key, &recipient.shard, message.clone())
                .await?;
        }
        Ok(message)
    }

    // ### Protocol initiation ###

    pub(crate) fn next_instance_id(&self) -> JournalId {
        let seq = self.instance_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal_id.child(seq)
    }

    /// Construct and start an initiator-side protocol instance. The
    /// `protocol_created` entry is journaled before the machine runs, so
    /// replay rebuilds the instance before applying its entries.
    pub(crate) async fn start_initiator(
        &self,
        factory: &Arc<dyn ProtocolFactory>,
        recipients: Vec<Recipient>,
        args: serde_json::Value,
        parent: Option<&Section>,
    ) -> Result<ProtocolRef, Error> {
        let agent = self.agent()?;
        let side = factory
            .make_initiator(&agent)
            .ok_or_else(|| Error::UnknownFactory(factory.key().to_string()))?;

        let journal_id = self.next_instance_id();
        let session_id = SessionId::generate();
        let agency = self.agency()?;
        let extra = serde_json::to_value(&recipients)
            .map(|value| Live::from_json(&value))
            .unwrap_or(Live::Null);
        agency.journal_protocol_created(
            &self.agent_id,
            factory.key(),
            ProtocolSide::Initiator,
            &journal_id,
            session_id,
            extra,
            parent,
        );

        let this = self.self_arc()?;
        let protocol_id = factory.protocol_id().to_string();
        let protocol = match side {
            InitiatorSide::Manager(manager) => {
                let machine = ManagerMedium::new(
                    &this,
                    journal_id,
                    session_id,
                    protocol_id,
                    recipients,
                    manager,
                );
                agency.register(machine.clone());
                self.register_listener(machine.clone())?;
                machine.start(args, parent).await?;
                ProtocolRef::Manager(machine)
            }
            InitiatorSide::Requester(requester) => {
                let machine = RequesterMedium::new(
                    &this,
                    journal_id,
                    session_id,
                    protocol_id,
                    recipients,
                    requester,
                );
                agency.register(machine.clone());
                self.register_listener(machine.clone())?;
                machine.start(args, parent).await?;
                ProtocolRef::Requester(machine)
            }
            InitiatorSide::Task(task) => {
                let machine = TaskMedium::new(&this, journal_id, session_id, task);
                agency.register(machine.clone());
                self.register_listener(machine.clone())?;
                machine.start(args);
                ProtocolRef::Task(machine)
            }
        };
        Ok(protocol)
    }

    /// Construct the interested-side protocol instance for a message that
    /// matched an interest.
    async fn spawn_interested(
        &self,
        factory: &Arc<dyn ProtocolFactory>,
        message: &Message,
    ) -> Result<Arc<dyn Listener>, Error> {
        tracing::debug!(
            agent_id = %self.agent_id,
            protocol_id = %message.protocol_id,
            class = ?message.class,
            "instantiating interest"
        );
        let agent = self.agent()?;
        let side = factory
            .make_interested(&agent)
            .ok_or_else(|| Error::UnknownFactory(factory.key().to_string()))?;

        let journal_id = self.next_instance_id();
        let session_id = SessionId::generate();
        let agency = self.agency()?;
        agency.journal_protocol_created(
            &self.agent_id,
            factory.key(),
            ProtocolSide::Interested,
            &journal_id,
            session_id,
            Live::Null,
            None,
        );

        let this = self.self_arc()?;
        let listener: Arc<dyn Listener> = match side {
            InterestedSide::Contractor(contractor) => {
                let machine = ContractorMedium::new(&this, journal_id, session_id, contractor);
                agency.register(machine.clone());
                machine
            }
            InterestedSide::Replier(replier) => {
                let machine = ReplierMedium::new(&this, journal_id, session_id, replier);
                agency.register(machine.clone());
                machine
            }
        };
        self.register_listener(listener.clone())?;
        Ok(listener)
    }

    /// Rebuild a protocol instance during replay of `protocol_created`.
    pub(crate) fn replay_protocol_created(
        &self,
        factory_key: &str,
        side: ProtocolSide,
        journal_id: JournalId,
        session_id: SessionId,
        extra: &Live,
    ) -> Result<(), Error> {
        // Keep the instance counter in step with the original run.
        self.instance_seq.fetch_add(1, Ordering::SeqCst);

        let agency = self.agency()?;
        let agent = self.agent()?;
        let this = self.self_arc()?;

        if side == ProtocolSide::Retrying {
            let wrapper = RetryingProtocol::replica(&this, journal_id);
            agency.register(wrapper);
            return Ok(());
        }

        let factory = agency.protocol_factory(factory_key)?;
        let protocol_id = factory.protocol_id().to_string();
        let listener: Arc<dyn Listener> = match side {
            ProtocolSide::Initiator => {
                let recipients: Vec<Recipient> = serde_json::from_value(extra.to_json()?)
                    .unwrap_or_default();
                match factory
                    .make_initiator(&agent)
                    .ok_or_else(|| Error::UnknownFactory(factory_key.to_string()))?
                {
                    InitiatorSide::Manager(manager) => {
                        let machine = ManagerMedium::new(
                            &this,
                            journal_id,
                            session_id,
                            protocol_id,
                            recipients,
                            manager,
                        );
                        agency.register(machine.clone());
                        machine
                    }
                    InitiatorSide::Requester(requester) => {
                        let machine = RequesterMedium::new(
                            &this,
                            journal_id,
                            session_id,
                            protocol_id,
                            recipients,
                            requester,
                        );
                        agency.register(machine.clone());
                        machine
                    }
                    InitiatorSide::Task(task) => {
                        let machine = TaskMedium::new(&this, journal_id, session_id, task);
                        agency.register(machine.clone());
                        machine
                    }
                }
            }
            ProtocolSide::Interested => match factory
                .make_interested(&agent)
                .ok_or_else(|| Error::UnknownFactory(factory_key.to_string()))?
            {
                InterestedSide::Contractor(contractor) => {
                    let machine = ContractorMedium::new(&this, journal_id, session_id, contractor);
                    agency.register(machine.clone());
                    machine
                }
                InterestedSide::Replier(replier) => {
                    let machine = ReplierMedium::new(&this, journal_id, session_id, replier);
                    agency.register(machine.clone());
                    machine
                }
            },
            ProtocolSide::Retrying => unreachable!("handled above"),
        };
        self.register_listener(listener)
    }
}

#[async_trait::async_trait]
impl messaging::MessageSink for AgentMedium {
    /// Inbound dispatch, in order: expired messages are dropped; a set
    /// `receiver_id` delivers to its listener; otherwise a matching
    /// interest spawns the interested side; otherwise the message is
    /// logged and discarded.
    async fn on_message(&self, message: Message) -> bool {
        if message.expired_at(self.now()) {
            tracing::debug!(agent_id = %self.agent_id, "throwing away an expired message");
            return false;
        }

        if let Some(receiver_id) = message.receiver_id {
            let listener = lock(&self.state).listeners.get(&receiver_id).cloned();
            if let Some(listener) = listener {
                return match listener.deliver(message).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::error!(agent_id = %self.agent_id, %err, "listener failed");
                        false
                    }
                };
            }
        }

        let factory = {
            let state = lock(&self.state);
            state
                .interests
                .get(&message.protocol_type)
                .and_then(|by_id| by_id.get(&message.protocol_id))
                .filter(|interest| {
                    interest.factory.initiator_class() == Some(message.class)
                })
                .map(|interest| interest.factory.clone())
        };
        if let Some(factory) = factory {
            let Ok(medium) = self.self_arc() else {
                return false;
            };
            return match medium.spawn_interested(&factory, &message).await {
                Ok(listener) => match listener.deliver(message).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::error!(agent_id = %self.agent_id, %err, "interested side failed");
                        false
                    }
                },
                Err(err) => {
                    tracing::error!(agent_id = %self.agent_id, %err, "could not spawn interest");
                    false
                }
            };
        }

        tracing::error!(
            agent_id = %self.agent_id,
            protocol_type = %message.protocol_type,
            protocol_id = %message.protocol_id,
            class = ?message.class,
            "no listener or interest for message"
        );
        false
    }
}

impl Snapshot for AgentMedium {
    fn type_name(&self) -> &str {
        "agent-medium"
    }
    fn journal_ref(&self) -> Option<String> {
        Some(self.journal_id.to_string())
    }
    fn snapshot(&self) -> Live {
        Live::Null
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[async_trait::async_trait]
impl Recorder for AgentMedium {
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }

    fn as_snapshot(self: Arc<Self>) -> Arc<dyn Snapshot> {
        self
    }

    async fn replay_call(&self, ctx: &Context, entry_id: &str, input: Live) -> Result<Live, Error> {
        let agent = self.agent()?;
        match entry_id {
            "initiate" => agent
                .initiate(ctx)
                .await
                .map(|()| Live::Null)
                .map_err(Error::Agent),
            other => agent.dispatch(ctx, other, input).await.map_err(Error::Agent),
        }
    }
}

/// The agent's view of its medium within one journal section. External
/// interactions made through the context are recorded as named side
/// effects; during replay the same calls consume the recorded results
/// instead of reaching the outside world.
#[derive(Clone)]
pub struct Context {
    medium: Arc<AgentMedium>,
    section: Arc<Section>,
}

impl Context {
    pub(crate) fn new(medium: Arc<AgentMedium>, section: Arc<Section>) -> Self {
        Self { medium, section }
    }

    pub fn medium(&self) -> &Arc<AgentMedium> {
        &self.medium
    }

    pub(crate) fn section(&self) -> &Arc<Section> {
        &self.section
    }

    /// Current time, as a recorded side effect.
    pub async fn get_time(&self) -> Result<Timestamp, Error> {
        let medium = self.medium.clone();
        let out = self
            .section
            .recorded("medium.get_time", Live::Null, || async move {
                Ok(Live::Float(medium.now().as_epoch_secs()))
            })
            .await
            .map_err(Error::from_effect)?;
        match out {
            Live::Float(secs) => Ok(Timestamp::from_epoch_secs(secs)),
            other => Err(Error::ReplayMismatch(format!(
                "get_time replayed {other:?}"
            ))),
        }
    }

    /// A copy of the agent's descriptor, as a recorded side effect.
    pub async fn get_descriptor(&self) -> Result<Descriptor, Error> {
        let medium = self.medium.clone();
        let out = self
            .section
            .recorded("medium.get_descriptor", Live::Null, || async move {
                let value = serde_json::to_value(medium.descriptor())?;
                Ok(Live::from_json(&value))
            })
            .await
            .map_err(Error::from_effect)?;
        Ok(serde_json::from_value(out.to_json()?)?)
    }

    /// Write the descriptor through the database and adopt the returned
    /// revision.
    pub async fn update_descriptor(&self, descriptor: Descriptor) -> Result<Descriptor, Error> {
        let medium = self.medium.clone();
        let out = self
            .section
            .recorded(
                "medium.update_descriptor",
                Live::Str(descriptor.doc_id.clone()),
                || async move {
                    let mut descriptor = descriptor;
                    medium
                        .db()
                        .map_err(anyhow::Error::new)?
                        .save_document(&mut descriptor)
                        .await?;
                    lock(&medium.state).descriptor = descriptor.clone();
                    let value = serde_json::to_value(descriptor)?;
                    Ok(Live::from_json(&value))
                },
            )
            .await
            .map_err(Error::from_effect)?;
        Ok(serde_json::from_value(out.to_json()?)?)
    }

    /// Enter a shard: create a binding for our document id there.
    pub async fn join_shard(&self, shard: &str) -> Result<(), Error> {
        let medium = self.medium.clone();
        let shard = shard.to_string();
        self.section
            .recorded(
                "medium.join_shard",
                Live::Str(shard.clone()),
                || async move {
                    medium
                        .create_binding(&medium.agent_id, &shard)
                        .map_err(anyhow::Error::new)?;
                    Ok(Live::Null)
                },
            )
            .await
            .map_err(Error::from_effect)?;
        Ok(())
    }

    /// Leave a shard: revoke every binding held there.
    pub async fn leave_shard(&self, shard: &str) -> Result<(), Error> {
        let medium = self.medium.clone();
        let shard = shard.to_string();
        self.section
            .recorded(
                "medium.leave_shard",
                Live::Str(shard.clone()),
                || async move {
                    let channel = medium.channel().map_err(anyhow::Error::new)?;
                    for binding in channel.get_bindings(&shard) {
                        binding.revoke();
                    }
                    Ok(Live::Null)
                },
            )
            .await
            .map_err(Error::from_effect)?;
        Ok(())
    }

    /// Additionally accept conversations addressed to `key` in the
    /// well-known lobby shard.
    pub async fn bind_to_lobby(&self, key: &str) -> Result<(), Error> {
        let medium = self.medium.clone();
        let key = key.to_string();
        self.section
            .recorded(
                "medium.bind_to_lobby",
                Live::Str(key.clone()),
                || async move {
                    medium
                        .create_binding(&key, "lobby")
                        .map_err(anyhow::Error::new)?;
                    Ok(Live::Null)
                },
            )
            .await
            .map_err(Error::from_effect)?;
        Ok(())
    }

    /// Declare an interest in new conversations of a protocol. Refused
    /// when an interest for the same `(protocol_type, protocol_id)` is
    /// already present.
    pub async fn register_interest(&self, factory_key: &str) -> Result<(), Error> {
        let medium = self.medium.clone();
        let factory = medium.agency()?.protocol_factory(factory_key)?;
        medium.add_interest(&factory)?;

        let public = factory.interest_type() == InterestType::Public;
        self.section
            .recorded(
                "medium.register_interest",
                Live::Str(factory_key.to_string()),
                || async move {
                    if public {
                        let shard = medium.descriptor().shard;
                        let binding = medium
                            .create_binding(factory.protocol_id(), &shard)
                            .map_err(anyhow::Error::new)?;
                        medium.attach_interest_binding(
                            factory.protocol_type(),
                            factory.protocol_id(),
                            binding,
                        );
                    }
                    Ok(Live::Null)
                },
            )
            .await
            .map_err(Error::from_effect)?;
        Ok(())
    }

    /// Revoke a previously registered interest, dropping its binding.
    /// Returns false (with an error log) when no such interest exists.
    pub async fn revoke_interest(
        &self,
        protocol_type: ProtocolType,
        protocol_id: &str,
    ) -> Result<bool, Error> {
        let Some(interest) = self.medium.remove_interest(protocol_type, protocol_id) else {
            tracing::error!(
                %protocol_type,
                protocol_id,
                "requested to revoke an interest we do not hold"
            );
            return Ok(false);
        };
        self.section
            .recorded(
                "medium.revoke_interest",
                Live::Str(protocol_id.to_string()),
                || async move {
                    interest.revoke();
                    Ok(Live::Null)
                },
            )
            .await
            .map_err(Error::from_effect)?;
        Ok(true)
    }

    /// Initiate a protocol toward `recipients` and return the agent-side
    /// handle of the new instance.
    pub async fn initiate_protocol(
        &self,
        factory_key: &str,
        recipients: Vec<Recipient>,
        args: serde_json::Value,
    ) -> Result<ProtocolRef, Error> {
        let medium = self.medium.clone();
        let factory = medium.agency()?.protocol_factory(factory_key)?;

        let effect_args = Live::List(vec![
            Live::Str(factory_key.to_string()),
            serde_json::to_value(&recipients)
                .map(|value| Live::from_json(&value))
                .unwrap_or(Live::Null),
        ]);
        let section = self.section.clone();
        let out = self
            .section
            .recorded("medium.initiate_protocol", effect_args, || async move {
                let protocol = medium
                    .start_initiator(&factory, recipients, args, Some(section.as_ref()))
                    .await
                    .map_err(anyhow::Error::new)?;
                Ok(protocol.as_live())
            })
            .await
            .map_err(Error::from_effect)?;

        match out {
            Live::Handle(handle) => ProtocolRef::from_handle(&handle).ok_or_else(|| {
                Error::ReplayMismatch("initiate_protocol resolved a foreign handle".to_string())
            }),
            other => Err(Error::ReplayMismatch(format!(
                "initiate_protocol replayed {other:?}"
            ))),
        }
    }

    /// Initiate a protocol that is restarted with exponential backoff
    /// until it succeeds or the policy gives up.
    pub async fn retrying_protocol(
        &self,
        factory_key: &str,
        recipients: Vec<Recipient>,
        policy: RetryPolicy,
        args: serde_json::Value,
    ) -> Result<ProtocolRef, Error> {
        let medium = self.medium.clone();
        // Resolve early so an unknown key surfaces as a typed error.
        medium.agency()?.protocol_factory(factory_key)?;

        let factory_key = factory_key.to_string();
        let out = self
            .section
            .recorded(
                "medium.retrying_protocol",
                Live::Str(factory_key.clone()),
                || async move {
                    let wrapper = RetryingProtocol::start(
                        &medium,
                        factory_key,
                        recipients,
                        policy,
                        args,
                    )
                    .map_err(anyhow::Error::new)?;
                    Ok(Live::Handle(wrapper.as_snapshot()))
                },
            )
            .await
            .map_err(Error::from_effect)?;

        match out {
            Live::Handle(handle) => ProtocolRef::from_handle(&handle).ok_or_else(|| {
                Error::ReplayMismatch("retrying_protocol resolved a foreign handle".to_string())
            }),
            other => Err(Error::ReplayMismatch(format!(
                "retrying_protocol replayed {other:?}"
            ))),
        }
    }

    /// Publish a message to each recipient. Unless this is a handover the
    /// message is stamped with a fresh id and our return address.
    pub async fn send_msg(
        &self,
        recipients: &[Recipient],
        message: Message,
        handover: bool,
    ) -> Result<Message, Error> {
        let medium = self.medium.clone();
        let recipients = recipients.to_vec();
        let args = Live::List(vec![
            Live::Str(format!("{:?}", message.class)),
            Live::Int(recipients.len() as i64),
        ]);
        let out = self
            .section
            .recorded("medium.send_msg", args, || async move {
                let sent = medium
                    .send_raw(&recipients, message, handover, None)
                    .await
                    .map_err(anyhow::Error::new)?;
                Ok(crate::protocols::message_to_live(&sent))
            })
            .await
            .map_err(Error::from_effect)?;
        crate::protocols::message_from_live(&out)
    }

    /// Suspend for `secs`, as a recorded side effect (instant on replay).
    pub async fn sleep(&self, secs: f64) -> Result<(), Error> {
        self.section
            .recorded("medium.sleep", Live::Float(secs), || async move {
                tokio::time::sleep(std::time::Duration::from_secs_f64(secs.max(0.0))).await;
                Ok(Live::Null)
            })
            .await
            .map_err(Error::from_effect)?;
        Ok(())
    }

    // ### Documents ###

    pub async fn save_document<D>(&self, doc: &mut D) -> Result<(), Error>
    where
        D: docstore::Document + Clone + Send,
    {
        let medium = self.medium.clone();
        let mut working = doc.clone();
        let out = self
            .section
            .recorded(
                "medium.save_document",
                Live::Str(doc.doc_id().to_string()),
                || async move {
                    medium
                        .db()
                        .map_err(anyhow::Error::new)?
                        .save_document(&mut working)
                        .await?;
                    Ok(Live::from_json(&serde_json::to_value(&working)?))
                },
            )
            .await
            .map_err(Error::from_effect)?;
        *doc = serde_json::from_value(out.to_json()?)?;
        Ok(())
    }

    pub async fn get_document<D>(&self, doc_id: &str) -> Result<D, Error>
    where
        D: docstore::Document + Send,
    {
        let medium = self.medium.clone();
        let doc_id_owned = doc_id.to_string();
        let out = self
            .section
            .recorded(
                "medium.get_document",
                Live::Str(doc_id.to_string()),
                || async move {
                    let doc: D = medium
                        .db()
                        .map_err(anyhow::Error::new)?
                        .get_document(&doc_id_owned)
                        .await?;
                    Ok(Live::from_json(&serde_json::to_value(&doc)?))
                },
            )
            .await
            .map_err(Error::from_effect)?;
        Ok(serde_json::from_value(out.to_json()?)?)
    }

    /// Fetch the latest revision of a document already held.
    pub async fn reload_document<D>(&self, doc: &D) -> Result<D, Error>
    where
        D: docstore::Document + Send,
    {
        self.get_document(doc.doc_id()).await
    }

    pub async fn delete_document<D>(&self, doc: &mut D) -> Result<(), Error>
    where
        D: docstore::Document + Clone + Send,
    {
        let medium = self.medium.clone();
        let mut working = doc.clone();
        let out = self
            .section
            .recorded(
                "medium.delete_document",
                Live::Str(doc.doc_id().to_string()),
                || async move {
                    medium
                        .db()
                        .map_err(anyhow::Error::new)?
                        .delete_document(&mut working)
                        .await?;
                    Ok(Live::from_json(&serde_json::to_value(&working)?))
                },
            )
            .await
            .map_err(Error::from_effect)?;
        *doc = serde_json::from_value(out.to_json()?)?;
        Ok(())
    }
}
