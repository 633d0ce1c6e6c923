use crate::medium::{AgentMedium, Context};
use crate::protocols::{ExpirationTimer, Listener, Recorder, Terminal, TerminalResult};
use crate::{lock, Error, ProtocolFailure};
use journal::{InstanceId, JournalId, Mode};
use models::{Message, SessionId};
use snapshot::{Live, Snapshot};
use std::sync::{Arc, Mutex, Weak};

/// A one-shot background activity of an agent. Tasks exchange no
/// messages; they either complete, fail, or run out of time.
#[async_trait::async_trait]
pub trait Task: Send + Sync {
    fn snapshot(&self) -> Live {
        Live::Null
    }

    /// Seconds this task may run before it expires.
    fn timeout(&self) -> f64;

    /// The task body. Its result is the protocol's terminal value.
    async fn initiate(
        &self,
        ctx: &Context,
        medium: &Arc<TaskMedium>,
        args: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;

    /// The timeout fired before the body settled. Runs exactly once.
    async fn expired(&self, ctx: &Context, medium: &Arc<TaskMedium>) -> anyhow::Result<()> {
        let _ = (ctx, medium);
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskState {
    Performing,
    Completed,
    Expired,
    Error,
}

/// The medium of one running task.
pub struct TaskMedium {
    medium: Weak<AgentMedium>,
    self_ref: Weak<TaskMedium>,
    journal_id: JournalId,
    session_id: SessionId,
    task: Arc<dyn Task>,
    inner: Mutex<TaskInner>,
    timer: ExpirationTimer,
    terminal: Terminal,
}

struct TaskInner {
    state: TaskState,
}

impl TaskMedium {
    pub(crate) fn new(
        medium: &Arc<AgentMedium>,
        journal_id: JournalId,
        session_id: SessionId,
        task: Arc<dyn Task>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            medium: Arc::downgrade(medium),
            self_ref: self_ref.clone(),
            journal_id,
            session_id,
            task,
            inner: Mutex::new(TaskInner {
                state: TaskState::Performing,
            }),
            timer: ExpirationTimer::new(),
            terminal: Terminal::new(),
        })
    }

    pub fn state(&self) -> TaskState {
        lock(&self.inner).state
    }

    pub async fn notify_finish(&self) -> TerminalResult {
        self.terminal.wait().await
    }

    /// Schedule the expiration timer at `now + task.timeout()` and defer
    /// the task body onto a fresh fiber.
    pub(crate) fn start(&self, args: serde_json::Value) {
        if self.is_replay() {
            return;
        }
        let Some(machine) = self.self_ref.upgrade() else {
            return;
        };
        let Some(medium) = self.medium.upgrade() else {
            return;
        };

        let deadline = medium.now().offset(self.task.timeout());
        {
            let fired = machine.clone();
            self.timer
                .schedule(deadline.duration_since(medium.now()), async move {
                    fired.on_expiration().await;
                });
        }

        tokio::spawn(async move {
            let input = Live::from_json(&args);
            let applied = machine.clone();
            let result = medium
                .journaled(
                    InstanceId::Recorder(machine.journal_id.clone()),
                    "initiate",
                    None,
                    input,
                    |ctx| async move { applied.apply_initiate(&ctx, args).await },
                )
                .await;

            // Expiration may have fired while the body was in flight; in
            // that case the settled result is dropped.
            match (result, machine.state()) {
                (Ok(value), TaskState::Completed) => machine.terminate(Ok(value)).await,
                (Err(err), TaskState::Error) => {
                    machine
                        .terminate(Err(ProtocolFailure::Failed(err.to_string())))
                        .await
                }
                (result, state) => {
                    tracing::debug!(
                        ?state,
                        settled_ok = result.is_ok(),
                        "task settled without a transition"
                    );
                }
            }
        });
    }

    async fn apply_initiate(&self, ctx: &Context, args: serde_json::Value) -> anyhow::Result<Live> {
        let machine = self.self_arc()?;
        match self.task.initiate(ctx, &machine, args).await {
            Ok(value) => {
                let mut inner = lock(&self.inner);
                if inner.state == TaskState::Performing {
                    inner.state = TaskState::Completed;
                }
                Ok(Live::from_json(&value))
            }
            Err(err) => {
                let mut inner = lock(&self.inner);
                if inner.state == TaskState::Performing {
                    inner.state = TaskState::Error;
                }
                Err(err)
            }
        }
    }

    async fn apply_expired(&self, ctx: &Context) -> anyhow::Result<Live> {
        lock(&self.inner).state = TaskState::Expired;
        let machine = self.self_arc()?;
        self.task.expired(ctx, &machine).await?;
        Ok(Live::Null)
    }

    async fn on_expiration(self: Arc<Self>) {
        if self.state() != TaskState::Performing {
            return;
        }
        let Ok(medium) = self.medium() else { return };
        let machine = self.clone();
        let _ = medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "expired",
                None,
                Live::Null,
                |ctx| async move { machine.apply_expired(&ctx).await },
            )
            .await;
        self.terminate(Err(ProtocolFailure::Expired)).await;
    }

    fn medium(&self) -> Result<Arc<AgentMedium>, Error> {
        self.medium
            .upgrade()
            .ok_or_else(|| Error::MediumGone(self.journal_id.to_string()))
    }

    fn self_arc(&self) -> Result<Arc<Self>, Error> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| Error::MediumGone(self.journal_id.to_string()))
    }

    fn is_replay(&self) -> bool {
        self.medium
            .upgrade()
            .map(|medium| medium.mode() == Mode::Replay)
            .unwrap_or(true)
    }

    async fn terminate(&self, result: TerminalResult) {
        self.timer.cancel();
        if let Ok(medium) = self.medium() {
            medium.unregister_listener(self.session_id);
        }
        self.terminal.resolve(result);
    }
}

#[async_trait::async_trait]
impl Listener for TaskMedium {
    fn session_id(&self) -> SessionId {
        self.session_id
    }
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn agent_side(&self) -> Live {
        self.task.snapshot()
    }
    fn as_recorder(self: Arc<Self>) -> Arc<dyn Recorder> {
        self
    }

    async fn deliver(self: Arc<Self>, message: Message) -> Result<(), Error> {
        // Tasks hold no conversations; routing a message here is a
        // programming error.
        let _ = message;
        Err(Error::InvalidTransition {
            machine: "task",
            event: "on_message",
            state: format!("{:?}", self.state()),
        })
    }
}

impl Snapshot for TaskMedium {
    fn type_name(&self) -> &str {
        "task-medium"
    }
    fn journal_ref(&self) -> Option<String> {
        Some(self.journal_id.to_string())
    }
    fn snapshot(&self) -> Live {
        self.task.snapshot()
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[async_trait::async_trait]
impl Recorder for TaskMedium {
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn as_snapshot(self: Arc<Self>) -> Arc<dyn Snapshot> {
        self
    }

    async fn replay_call(&self, ctx: &Context, entry_id: &str, input: Live) -> Result<Live, Error> {
        let out = match entry_id {
            "initiate" => self.apply_initiate(ctx, input.to_json()?).await,
            "expired" => self.apply_expired(ctx).await,
            other => {
                return Err(Error::ReplayMismatch(format!(
                    "task has no entry {other:?}"
                )))
            }
        };
        out.map_err(Error::Agent)
    }
}
