use crate::medium::{AgentMedium, Context};
use crate::protocols::{ProtocolFactory, ProtocolSide, Recorder};
use crate::{lock, Error};
use journal::{Entry, InstanceId, JournalId, MemorySink, Mode, Section, SideEffect};
use models::{Descriptor, SessionId, Timestamp};
use snapshot::{Live, Snapshot, Tree};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// An agent's behavior, driven by its medium. Every method is invoked
/// inside a journal section; external interactions must go through the
/// [`Context`] so that replay can substitute their recorded results.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Called once after the agent is registered to an agency.
    async fn initiate(&self, ctx: &Context) -> anyhow::Result<()>;

    /// The agent's replayable state.
    fn snapshot(&self) -> Live {
        Live::Null
    }

    /// Dispatch for agent-defined journal entries beyond `initiate`.
    async fn dispatch(&self, ctx: &Context, entry_id: &str, input: Live) -> anyhow::Result<Live> {
        let _ = (ctx, input);
        anyhow::bail!("unknown journal entry {entry_id:?}")
    }
}

/// Builds agents from their persisted document type.
pub trait AgentFactory: Send + Sync {
    fn document_type(&self) -> &str;
    fn build(&self, medium: &Arc<AgentMedium>) -> Arc<dyn Agent>;
}

/// The process-wide runtime: a collection of agent mediums, the journal
/// sink, the weak recorder registry, the factory registries, and the
/// connections to the outside world.
pub struct Agency {
    self_ref: Weak<Agency>,
    mode: Mode,
    broker: Option<Arc<dyn messaging::ConnectionFactory>>,
    store: Option<Arc<dyn docstore::Driver>>,
    sink: MemorySink,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    agents: Vec<Arc<AgentMedium>>,
    agent_factories: HashMap<String, Arc<dyn AgentFactory>>,
    protocol_factories: HashMap<String, Arc<dyn ProtocolFactory>>,
    // Non-owning: ownership lives in the mediums' listener tables.
    registry: HashMap<String, Weak<dyn Recorder>>,
}

impl Agency {
    pub fn new(
        broker: Arc<dyn messaging::ConnectionFactory>,
        store: Arc<dyn docstore::Driver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            mode: Mode::Record,
            broker: Some(broker),
            store: Some(store),
            sink: MemorySink::new(),
            state: Mutex::new(State::default()),
        })
    }

    /// A fresh agency in replay mode sharing this one's factory
    /// registries, with no outside connections.
    pub fn replay_replica(&self) -> Arc<Self> {
        let state = lock(&self.state);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            mode: Mode::Replay,
            broker: None,
            store: None,
            sink: MemorySink::new(),
            state: Mutex::new(State {
                agent_factories: state.agent_factories.clone(),
                protocol_factories: state.protocol_factories.clone(),
                ..State::default()
            }),
        })
    }

    fn self_arc(&self) -> Result<Arc<Self>, Error> {
        self.self_ref.upgrade().ok_or(Error::AgencyGone)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn broker(&self) -> Result<Arc<dyn messaging::ConnectionFactory>, Error> {
        self.broker.clone().ok_or(Error::AgencyGone)
    }

    pub(crate) fn store(&self) -> Result<Arc<dyn docstore::Driver>, Error> {
        self.store.clone().ok_or(Error::AgencyGone)
    }

    /// Seconds since the Unix epoch.
    pub fn get_time(&self) -> Timestamp {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);
        Timestamp::from_epoch_secs(secs)
    }

    pub fn register_agent_factory(&self, factory: Arc<dyn AgentFactory>) {
        let document_type = factory.document_type().to_string();
        let previous = lock(&self.state)
            .agent_factories
            .insert(document_type.clone(), factory);
        if previous.is_some() {
            panic!("an agent factory for {document_type:?} is already registered");
        }
    }

    pub fn register_protocol(&self, factory: Arc<dyn ProtocolFactory>) {
        let key = factory.key().to_string();
        let previous = lock(&self.state)
            .protocol_factories
            .insert(key.clone(), factory);
        if previous.is_some() {
            panic!("a protocol factory for {key:?} is already registered");
        }
    }

    pub fn protocol_factory(&self, key: &str) -> Result<Arc<dyn ProtocolFactory>, Error> {
        lock(&self.state)
            .protocol_factories
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownFactory(key.to_string()))
    }

    pub(crate) fn agent_factory(
        &self,
        document_type: &str,
    ) -> Result<Arc<dyn AgentFactory>, Error> {
        lock(&self.state)
            .agent_factories
            .get(document_type)
            .cloned()
            .ok_or_else(|| Error::UnknownAgentType(document_type.to_string()))
    }

    /// Start hosting an agent: resolve its factory, construct a medium
    /// that owns it, and await the agent's `initiate`. On initiation
    /// failure the medium is discarded again and `agent_deleted` is
    /// journaled.
    pub async fn start_agent(&self, descriptor: Descriptor) -> Result<Arc<AgentMedium>, Error> {
        let factory = self.agent_factory(&descriptor.document_type)?;
        tracing::info!(
            doc_id = %descriptor.doc_id,
            document_type = %descriptor.document_type,
            "starting agent"
        );

        let this = self.self_arc()?;
        let medium = AgentMedium::create(&this, &factory, descriptor).await?;
        lock(&self.state).agents.push(medium.clone());

        match medium.call_initiate().await {
            Ok(()) => Ok(medium),
            Err(err) => {
                tracing::error!(agent_id = %medium.agent_id(), %err, "agent failed to initiate");
                self.discard_agent(&medium);
                Err(err)
            }
        }
    }

    pub(crate) fn adopt_medium(&self, medium: Arc<AgentMedium>) {
        lock(&self.state).agents.push(medium);
    }

    /// Find a hosted medium by its agent id.
    pub fn medium(&self, agent_id: &str) -> Option<Arc<AgentMedium>> {
        lock(&self.state)
            .agents
            .iter()
            .find(|medium| medium.agent_id() == agent_id)
            .cloned()
    }

    pub(crate) fn discard_agent(&self, medium: &Arc<AgentMedium>) {
        self.journal_agent_deleted(medium.agent_id());
        medium.disconnect();
        let mut state = lock(&self.state);
        state
            .agents
            .retain(|hosted| hosted.agent_id() != medium.agent_id());
        state.registry.remove(medium.journal_id().as_str());
    }

    // ### Journal ###

    pub fn journal(&self) -> &MemorySink {
        &self.sink
    }

    /// All journal entries of one agent, in append order.
    pub fn agent_journal(&self, agent_id: &str) -> Vec<Entry> {
        self.sink.for_agent(agent_id)
    }

    /// Snapshot `input` and `side_effects`, freeze `output`, and append
    /// the entry. Purely in-memory; never blocks on I/O.
    pub(crate) fn journal_write_entry(
        &self,
        agent_id: &str,
        instance_id: InstanceId,
        entry_id: &str,
        section: &Section,
        input: &Live,
        side_effects: &[SideEffect],
        output: &Result<Live, String>,
    ) {
        if self.mode == Mode::Replay {
            return;
        }
        self.sink.append(Entry {
            agent_id: agent_id.to_string(),
            instance_id,
            entry_id: entry_id.to_string(),
            fiber_id: section.fiber_id(),
            fiber_depth: section.fiber_depth(),
            input: snapshot::convert(input, self),
            side_effects: journal::pack_effects(side_effects, self),
            output: journal::output_tree(output, self),
        });
    }

    /// An agency-level entry (`instance_id = agency`), recording only its
    /// input. Used for agent and protocol lifecycle events.
    pub(crate) fn journal_agency_entry(
        &self,
        agent_id: &str,
        entry_id: &str,
        input: Live,
        parent: Option<&Section>,
    ) {
        if self.mode == Mode::Replay {
            return;
        }
        let section = match parent {
            Some(parent) => Section::record_nested(entry_id, parent),
            None => Section::record(entry_id),
        };
        self.journal_write_entry(
            agent_id,
            InstanceId::Agency,
            entry_id,
            &section,
            &input,
            &[],
            &Ok(Live::Null),
        );
    }

    pub(crate) fn journal_agent_created(&self, agent_id: &str, descriptor: &Descriptor) {
        let descriptor = serde_json::to_value(descriptor)
            .map(|value| Live::from_json(&value))
            .unwrap_or(Live::Null);
        let input = Live::List(vec![Live::Str(agent_id.to_string()), descriptor]);
        self.journal_agency_entry(agent_id, "agent_created", input, None);
    }

    pub(crate) fn journal_agent_deleted(&self, agent_id: &str) {
        let input = Live::List(vec![Live::Str(agent_id.to_string())]);
        self.journal_agency_entry(agent_id, "agent_deleted", input, None);
    }

    pub(crate) fn journal_protocol_created(
        &self,
        agent_id: &str,
        factory_key: &str,
        side: ProtocolSide,
        journal_id: &JournalId,
        session_id: SessionId,
        extra: Live,
        parent: Option<&Section>,
    ) {
        let input = Live::List(vec![
            Live::Str(factory_key.to_string()),
            Live::Str(side.to_string()),
            Live::Str(journal_id.to_string()),
            Live::Str(session_id.to_string()),
            extra,
        ]);
        self.journal_agency_entry(agent_id, "protocol_created", input, parent);
    }

    pub(crate) fn journal_protocol_deleted(
        &self,
        agent_id: &str,
        journal_id: &JournalId,
        session_id: SessionId,
    ) {
        let input = Live::List(vec![
            Live::Str(journal_id.to_string()),
            Live::Str(session_id.to_string()),
        ]);
        self.journal_agency_entry(agent_id, "protocol_deleted", input, None);
    }

    // ### Recorder registry ###

    /// Add a recorder to the weak registry. A duplicate journal id is a
    /// programming error.
    pub(crate) fn register(&self, recorder: Arc<dyn Recorder>) {
        let journal_id = recorder.journal_id().to_string();
        tracing::debug!(%journal_id, "registering recorder");
        let mut state = lock(&self.state);
        if state
            .registry
            .get(&journal_id)
            .is_some_and(|known| known.upgrade().is_some())
        {
            panic!("a recorder with journal id {journal_id:?} is already registered");
        }
        state.registry.insert(journal_id, Arc::downgrade(&recorder));
    }

    pub(crate) fn unregister(&self, journal_id: &JournalId) {
        lock(&self.state).registry.remove(journal_id.as_str());
    }

    pub(crate) fn lookup_recorder(&self, journal_id: &str) -> Option<Arc<dyn Recorder>> {
        lock(&self.state).registry.get(journal_id)?.upgrade()
    }

    /// The snapshot of everything related to an agent: the agent's own
    /// state and its listeners' agent-side states, serialized with this
    /// agency's externalizer.
    pub fn snapshot_agent_tree(&self, agent_id: &str) -> Result<Tree, Error> {
        let medium = self
            .medium(agent_id)
            .ok_or_else(|| Error::MediumGone(agent_id.to_string()))?;
        let (agent, listeners) = medium.snapshot_agent();
        let combined = Live::List(vec![agent, Live::List(listeners)]);
        Ok(snapshot::convert(&combined, self))
    }
}

// Objects that are recorders *and* present in the registry serialize as
// their journal id; everything else serializes by value.
impl snapshot::Externalizer for Agency {
    fn identify(&self, handle: &Arc<dyn Snapshot>) -> Option<String> {
        let journal_ref = handle.journal_ref()?;
        let registered = self.lookup_recorder(&journal_ref)?;
        let same = Arc::as_ptr(&registered.clone().as_snapshot()) as *const ()
            == Arc::as_ptr(handle) as *const ();
        same.then_some(journal_ref)
    }
}

// During replay, externalized ids resolve to the freshly rebuilt replicas.
impl snapshot::Resolver for Agency {
    fn lookup(&self, journal_ref: &str) -> Option<Live> {
        let recorder = self.lookup_recorder(journal_ref)?;
        Some(Live::Handle(recorder.as_snapshot()))
    }
}
