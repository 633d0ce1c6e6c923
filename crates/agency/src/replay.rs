use crate::agency::Agency;
use crate::medium::{AgentMedium, Context};
use crate::protocols::{is_replay_divergence, ProtocolSide};
use crate::Error;
use journal::{unpack_effects, Entry, InstanceId, JournalId, Section};
use models::{Descriptor, SessionId};
use snapshot::{unpack, Live, Tree};
use std::sync::Arc;

/// Reconstructs an agent's state from its journal alone.
///
/// A replay owns a fresh agency in replay mode that shares the source
/// agency's factory registries but has no outside connections. Applying
/// the agent's entries in append order rebuilds the agent, its protocol
/// instances, and their states; recorded side effects substitute for
/// every external interaction.
pub struct Replay {
    agency: Arc<Agency>,
    agent_id: String,
}

impl Replay {
    pub fn new(source: &Agency, agent_id: &str) -> Self {
        Self {
            agency: source.replay_replica(),
            agent_id: agent_id.to_string(),
        }
    }

    /// The replica agency hosting the rebuilt agent.
    pub fn agency(&self) -> &Arc<Agency> {
        &self.agency
    }

    pub fn medium(&self) -> Option<Arc<AgentMedium>> {
        self.agency.medium(&self.agent_id)
    }

    pub async fn apply_all(&self, entries: &[Entry]) -> Result<(), Error> {
        for entry in entries {
            self.apply(entry).await?;
        }
        Ok(())
    }

    /// Apply one recorded entry to the replica.
    pub async fn apply(&self, entry: &Entry) -> Result<(), Error> {
        if entry.agent_id != self.agent_id {
            tracing::debug!(
                entry_agent = %entry.agent_id,
                replaying = %self.agent_id,
                "skipping entry of another agent"
            );
            return Ok(());
        }
        match &entry.instance_id {
            InstanceId::Agency => self.apply_agency(entry).await,
            InstanceId::Recorder(journal_id) => self.apply_recorded(journal_id, entry).await,
        }
    }

    /// Snapshot of the rebuilt agent, for comparison against the
    /// original's `snapshot_agent_tree`.
    pub fn snapshot_tree(&self) -> Result<Tree, Error> {
        self.agency.snapshot_agent_tree(&self.agent_id)
    }

    async fn apply_agency(&self, entry: &Entry) -> Result<(), Error> {
        let input = unpack(&entry.input, self.agency.as_ref())?;
        match entry.entry_id.as_str() {
            "agent_created" => {
                let [_, descriptor] = expect_parts::<2>(&input, &entry.entry_id)?;
                let descriptor: Descriptor = serde_json::from_value(descriptor.to_json()?)?;
                let factory = self.agency.agent_factory(&descriptor.document_type)?;
                let medium = AgentMedium::create(&self.agency, &factory, descriptor).await?;
                self.agency.adopt_medium(medium);
                Ok(())
            }
            "protocol_created" => {
                let [factory_key, side, journal_id, session_id, extra] =
                    expect_parts::<5>(&input, &entry.entry_id)?;
                let medium = self.require_medium()?;
                medium.replay_protocol_created(
                    expect_str(factory_key)?,
                    expect_str(side)?.parse::<ProtocolSide>()?,
                    JournalId::root(expect_str(journal_id)?),
                    parse_session(expect_str(session_id)?)?,
                    extra,
                )
            }
            "protocol_deleted" => {
                let [_, session_id] = expect_parts::<2>(&input, &entry.entry_id)?;
                let medium = self.require_medium()?;
                medium.replay_unregister(parse_session(expect_str(session_id)?)?);
                Ok(())
            }
            "agent_deleted" => {
                if let Some(medium) = self.medium() {
                    self.agency.discard_agent(&medium);
                }
                Ok(())
            }
            other => Err(Error::ReplayMismatch(format!(
                "unknown agency entry {other:?}"
            ))),
        }
    }

    async fn apply_recorded(&self, journal_id: &JournalId, entry: &Entry) -> Result<(), Error> {
        let recorder = self
            .agency
            .lookup_recorder(journal_id.as_str())
            .ok_or_else(|| {
                Error::ReplayMismatch(format!("no replica recorder for {journal_id}"))
            })?;

        let resolver = self.agency.as_ref();
        let effects = unpack_effects(&entry.side_effects, resolver)?;
        let input = unpack(&entry.input, resolver)?;
        let section = Arc::new(Section::replay(
            entry.entry_id.clone(),
            entry.fiber_id,
            entry.fiber_depth,
            effects,
        ));
        let ctx = Context::new(self.require_medium()?, section);

        match recorder.replay_call(&ctx, &entry.entry_id, input).await {
            Ok(_) => Ok(()),
            Err(err) if is_replay_divergence(&err) => Err(err),
            // The original call failed the same way; that is equivalence,
            // not divergence.
            Err(err) => {
                tracing::debug!(%journal_id, entry_id = %entry.entry_id, %err, "replayed a recorded failure");
                Ok(())
            }
        }
    }

    fn require_medium(&self) -> Result<Arc<AgentMedium>, Error> {
        self.medium()
            .ok_or_else(|| Error::ReplayMismatch("agent_created has not been applied".to_string()))
    }
}

fn expect_parts<'l, const N: usize>(
    input: &'l Live,
    entry_id: &str,
) -> Result<[&'l Live; N], Error> {
    let Live::List(items) = input else {
        return Err(Error::ReplayMismatch(format!(
            "{entry_id} input is not a list"
        )));
    };
    if items.len() != N {
        return Err(Error::ReplayMismatch(format!(
            "{entry_id} input has {} parts, expected {N}",
            items.len()
        )));
    }
    let mut parts = [input; N];
    for (slot, item) in parts.iter_mut().zip(items.iter()) {
        *slot = item;
    }
    Ok(parts)
}

fn expect_str(live: &Live) -> Result<&str, Error> {
    match live {
        Live::Str(value) => Ok(value),
        other => Err(Error::ReplayMismatch(format!(
            "expected a string, found {other:?}"
        ))),
    }
}

fn parse_session(raw: &str) -> Result<SessionId, Error> {
    raw.parse::<SessionId>()
        .map_err(|err| Error::ReplayMismatch(format!("bad session id {raw:?}: {err}")))
}
