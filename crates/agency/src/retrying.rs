use crate::medium::{AgentMedium, Context};
use crate::protocols::{ProtocolSide, Recorder, Terminal, TerminalResult};
use crate::{lock, Error, ProtocolFailure};
use journal::JournalId;
use models::{Recipient, SessionId};
use snapshot::{Live, Snapshot};
use std::sync::{Arc, Mutex, Weak};

/// Restart behavior for a [`RetryingProtocol`]: give up after
/// `max_retries` retries (never, when None), delay retries starting at
/// `initial_delay` seconds and doubling up to `max_delay`.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: Option<u32>,
    pub initial_delay: f64,
    pub max_delay: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: 1.0,
            max_delay: None,
        }
    }
}

/// Restarts a failing protocol with exponentially growing delay.
///
/// The wrapper itself records no entries; each spawned protocol instance
/// journals normally and replay reconstructs those from their own
/// `protocol_created` entries. A replayed wrapper is dormant.
pub struct RetryingProtocol {
    medium: Weak<AgentMedium>,
    journal_id: JournalId,
    attempts: Mutex<u32>,
    terminal: Terminal,
}

impl RetryingProtocol {
    pub(crate) fn start(
        medium: &Arc<AgentMedium>,
        factory_key: String,
        recipients: Vec<Recipient>,
        policy: RetryPolicy,
        args: serde_json::Value,
    ) -> Result<Arc<Self>, Error> {
        let journal_id = medium.next_instance_id();
        let agency = medium.agency()?;
        agency.journal_protocol_created(
            medium.agent_id(),
            &factory_key,
            ProtocolSide::Retrying,
            &journal_id,
            SessionId::generate(),
            Live::Null,
            None,
        );

        let wrapper = Arc::new(Self {
            medium: Arc::downgrade(medium),
            journal_id,
            attempts: Mutex::new(0),
            terminal: Terminal::new(),
        });
        agency.register(wrapper.clone());

        let runner = wrapper.clone();
        tokio::spawn(async move {
            runner.run(factory_key, recipients, policy, args).await;
        });
        Ok(wrapper)
    }

    /// A dormant replica used during replay.
    pub(crate) fn replica(medium: &Arc<AgentMedium>, journal_id: JournalId) -> Arc<Self> {
        Arc::new(Self {
            medium: Arc::downgrade(medium),
            journal_id,
            attempts: Mutex::new(0),
            terminal: Terminal::new(),
        })
    }

    pub fn attempts(&self) -> u32 {
        *lock(&self.attempts)
    }

    pub async fn notify_finish(&self) -> TerminalResult {
        self.terminal.wait().await
    }

    async fn run(
        self: Arc<Self>,
        factory_key: String,
        recipients: Vec<Recipient>,
        policy: RetryPolicy,
        args: serde_json::Value,
    ) {
        let mut delay = policy.initial_delay.max(0.0);
        loop {
            let Some(medium) = self.medium.upgrade() else {
                return;
            };
            let factory = match medium.agency().and_then(|agency| {
                agency.protocol_factory(&factory_key)
            }) {
                Ok(factory) => factory,
                Err(err) => {
                    self.terminal
                        .resolve(Err(ProtocolFailure::Failed(err.to_string())));
                    return;
                }
            };

            let attempt = {
                let mut attempts = lock(&self.attempts);
                *attempts += 1;
                *attempts
            };
            let outcome = match medium
                .start_initiator(&factory, recipients.clone(), args.clone(), None)
                .await
            {
                Ok(protocol) => protocol.notify_finish().await,
                Err(err) => Err(ProtocolFailure::Failed(err.to_string())),
            };

            let failure = match outcome {
                Ok(value) => {
                    self.terminal.resolve(Ok(value));
                    return;
                }
                Err(failure) => failure,
            };

            let retries_done = attempt - 1;
            if policy
                .max_retries
                .is_some_and(|max_retries| retries_done >= max_retries)
            {
                tracing::warn!(
                    journal_id = %self.journal_id,
                    attempts = attempt,
                    %failure,
                    "giving up on retried protocol"
                );
                self.terminal
                    .resolve(Err(ProtocolFailure::RetriesExhausted(attempt)));
                return;
            }

            tracing::info!(
                journal_id = %self.journal_id,
                attempt,
                delay,
                %failure,
                "protocol failed; retrying"
            );
            tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
            delay *= 2.0;
            if let Some(max_delay) = policy.max_delay {
                delay = delay.min(max_delay);
            }
        }
    }
}

impl Snapshot for RetryingProtocol {
    fn type_name(&self) -> &str {
        "retrying-protocol"
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
impl Recorder for RetryingProtocol {
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn as_snapshot(self: Arc<Self>) -> Arc<dyn Snapshot> {
        self
    }

    async fn replay_call(
        &self,
        _ctx: &Context,
        entry_id: &str,
        _input: Live,
    ) -> Result<Live, Error> {
        Err(Error::ReplayMismatch(format!(
            "retrying protocol records no entries, got {entry_id:?}"
        )))
    }
}
