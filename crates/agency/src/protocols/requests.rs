use crate::medium::{AgentMedium, Context};
use crate::protocols::{
    is_replay_divergence, message_from_live, message_to_live, send_recorded, ExpirationTimer,
    Listener, Recorder, Terminal, TerminalResult,
};
use crate::{lock, Error, ProtocolFailure};
use journal::{InstanceId, JournalId, Mode};
use models::{Message, MessageClass, ProtocolType, Recipient, SessionId, Timestamp};
use snapshot::{Live, Snapshot};
use std::sync::{Arc, Mutex, Weak};

/// The initiator side of a request exchange.
#[async_trait::async_trait]
pub trait Requester: Send + Sync {
    fn snapshot(&self) -> Live {
        Live::Null
    }

    /// Open the exchange; typically calls `medium.request`.
    async fn initiate(
        &self,
        ctx: &Context,
        medium: &Arc<RequesterMedium>,
        args: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// The reply arrived.
    async fn got_reply(
        &self,
        ctx: &Context,
        medium: &Arc<RequesterMedium>,
        reply: Message,
    ) -> anyhow::Result<()> {
        let _ = (ctx, medium, reply);
        Ok(())
    }

    async fn expired(&self, ctx: &Context, medium: &Arc<RequesterMedium>) -> anyhow::Result<()> {
        let _ = (ctx, medium);
        Ok(())
    }
}

/// The interested side of a request exchange.
#[async_trait::async_trait]
pub trait Replier: Send + Sync {
    fn snapshot(&self) -> Live {
        Live::Null
    }

    /// A request arrived; typically calls `medium.reply`.
    async fn requested(
        &self,
        ctx: &Context,
        medium: &Arc<ReplierMedium>,
        request: Message,
    ) -> anyhow::Result<()>;
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RequestState {
    Requested,
    Closed,
    Expired,
}

/// Initiator-side request machine.
pub struct RequesterMedium {
    medium: Weak<AgentMedium>,
    self_ref: Weak<RequesterMedium>,
    journal_id: JournalId,
    session_id: SessionId,
    protocol_id: String,
    recipients: Vec<Recipient>,
    requester: Arc<dyn Requester>,
    inner: Mutex<RequesterInner>,
    timer: ExpirationTimer,
    terminal: Terminal,
}

struct RequesterInner {
    state: RequestState,
    reply: Option<Message>,
}

impl RequesterMedium {
    pub(crate) fn new(
        medium: &Arc<AgentMedium>,
        journal_id: JournalId,
        session_id: SessionId,
        protocol_id: String,
        recipients: Vec<Recipient>,
        requester: Arc<dyn Requester>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            medium: Arc::downgrade(medium),
            self_ref: self_ref.clone(),
            journal_id,
            session_id,
            protocol_id,
            recipients,
            requester,
            inner: Mutex::new(RequesterInner {
                state: RequestState::Requested,
                reply: None,
            }),
            timer: ExpirationTimer::new(),
            terminal: Terminal::new(),
        })
    }

    pub fn state(&self) -> RequestState {
        lock(&self.inner).state
    }

    /// The reply, once the exchange closed.
    pub fn reply(&self) -> Option<Message> {
        lock(&self.inner).reply.clone()
    }

    pub async fn notify_finish(&self) -> TerminalResult {
        self.terminal.wait().await
    }

    pub(crate) async fn start(
        &self,
        args: serde_json::Value,
        parent: Option<&journal::Section>,
    ) -> Result<(), Error> {
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = Live::from_json(&args);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "initiate",
                parent,
                input,
                |ctx| async move {
                    machine
                        .requester
                        .initiate(&ctx, &machine, args)
                        .await
                        .map(|()| Live::Null)
                },
            )
            .await
            .map(|_| ())
    }

    /// Send the request; the exchange expires `timeout` seconds from now
    /// unless a reply arrives first.
    pub async fn request(
        &self,
        ctx: &Context,
        payload: serde_json::Value,
        timeout: f64,
    ) -> Result<Message, Error> {
        let expiration = ctx.get_time().await?.offset(timeout);
        let message = Message::new(
            ProtocolType::Request,
            self.protocol_id.clone(),
            MessageClass::Request,
            expiration,
            payload,
        );
        let medium = self.medium()?;
        let sent = match send_recorded(
            &medium,
            ctx,
            "requester.request",
            &self.recipients,
            message,
            Some(self.session_id),
            false,
        )
        .await
        {
            Ok(sent) => sent,
            Err(err) if !is_replay_divergence(&err) => {
                lock(&self.inner).state = RequestState::Expired;
                self.schedule_terminate(Err(ProtocolFailure::Transport(err.to_string())));
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        self.reset_timer(expiration);
        Ok(sent)
    }

    async fn apply_got_reply(&self, ctx: &Context, reply: Message) -> anyhow::Result<Live> {
        {
            let mut inner = lock(&self.inner);
            inner.reply = Some(reply.clone());
            inner.state = RequestState::Closed;
        }
        let machine = self.self_arc()?;
        self.requester.got_reply(ctx, &machine, reply).await?;
        Ok(Live::Null)
    }

    async fn apply_expired(&self, ctx: &Context) -> anyhow::Result<Live> {
        lock(&self.inner).state = RequestState::Expired;
        let machine = self.self_arc()?;
        self.requester.expired(ctx, &machine).await?;
        Ok(Live::Null)
    }

    async fn on_reply(&self, message: Message) -> Result<(), Error> {
        if self.state() != RequestState::Requested {
            tracing::warn!(session_id = %self.session_id, "dropping out-of-order reply");
            return Ok(());
        }
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = message_to_live(&message);
        let result = message_to_live(&message);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "got_reply",
                None,
                input,
                |ctx| async move { machine.apply_got_reply(&ctx, message).await },
            )
            .await?;
        self.terminate(Ok(result)).await;
        Ok(())
    }

    async fn on_expiration(self: Arc<Self>) {
        if self.state() != RequestState::Requested {
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

    fn reset_timer(&self, at: Timestamp) {
        if self.is_replay() {
            return;
        }
        let Some(machine) = self.self_ref.upgrade() else {
            return;
        };
        let now = machine
            .medium
            .upgrade()
            .map(|medium| medium.now())
            .unwrap_or(at);
        self.timer.schedule(at.duration_since(now), async move {
            machine.on_expiration().await;
        });
    }

    fn schedule_terminate(&self, result: TerminalResult) {
        if self.is_replay() {
            return;
        }
        let Some(machine) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            machine.terminate(result).await;
        });
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
impl Listener for RequesterMedium {
    fn session_id(&self) -> SessionId {
        self.session_id
    }
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn agent_side(&self) -> Live {
        self.requester.snapshot()
    }
    fn as_recorder(self: Arc<Self>) -> Arc<dyn Recorder> {
        self
    }

    async fn deliver(self: Arc<Self>, message: Message) -> Result<(), Error> {
        match message.class {
            MessageClass::Response => self.on_reply(message).await,
            other => {
                tracing::warn!(
                    session_id = %self.session_id,
                    class = ?other,
                    "requester dropping unexpected message"
                );
                Ok(())
            }
        }
    }
}

impl Snapshot for RequesterMedium {
    fn type_name(&self) -> &str {
        "requester-medium"
    }
    fn journal_ref(&self) -> Option<String> {
        Some(self.journal_id.to_string())
    }
    fn snapshot(&self) -> Live {
        self.requester.snapshot()
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[async_trait::async_trait]
impl Recorder for RequesterMedium {
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn as_snapshot(self: Arc<Self>) -> Arc<dyn Snapshot> {
        self
    }

    async fn replay_call(&self, ctx: &Context, entry_id: &str, input: Live) -> Result<Live, Error> {
        let out = match entry_id {
            "initiate" => {
                let machine = self.self_arc()?;
                self.requester
                    .initiate(ctx, &machine, input.to_json()?)
                    .await
                    .map(|()| Live::Null)
            }
            "got_reply" => self.apply_got_reply(ctx, message_from_live(&input)?).await,
            "expired" => self.apply_expired(ctx).await,
            other => {
                return Err(Error::ReplayMismatch(format!(
                    "requester has no entry {other:?}"
                )))
            }
        };
        out.map_err(Error::Agent)
    }
}

/// Interested-side request machine.
pub struct ReplierMedium {
    medium: Weak<AgentMedium>,
    self_ref: Weak<ReplierMedium>,
    journal_id: JournalId,
    session_id: SessionId,
    replier: Arc<dyn Replier>,
    inner: Mutex<ReplierInner>,
    timer: ExpirationTimer,
    terminal: Terminal,
}

struct ReplierInner {
    state: RequestState,
    request: Option<Message>,
}

impl ReplierMedium {
    pub(crate) fn new(
        medium: &Arc<AgentMedium>,
        journal_id: JournalId,
        session_id: SessionId,
        replier: Arc<dyn Replier>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            medium: Arc::downgrade(medium),
            self_ref: self_ref.clone(),
            journal_id,
            session_id,
            replier,
            inner: Mutex::new(ReplierInner {
                state: RequestState::Requested,
                request: None,
            }),
            timer: ExpirationTimer::new(),
            terminal: Terminal::new(),
        })
    }

    pub fn state(&self) -> RequestState {
        lock(&self.inner).state
    }

    pub async fn notify_finish(&self) -> TerminalResult {
        self.terminal.wait().await
    }

    /// Answer the pending request and close the exchange.
    pub async fn reply(&self, ctx: &Context, payload: serde_json::Value) -> Result<Message, Error> {
        let request = {
            let inner = lock(&self.inner);
            if inner.state != RequestState::Requested {
                return Err(Error::InvalidTransition {
                    machine: "replier",
                    event: "reply",
                    state: format!("{:?}", inner.state),
                });
            }
            inner.request.clone().ok_or(Error::InvalidTransition {
                machine: "replier",
                event: "reply",
                state: "no request".to_string(),
            })?
        };
        let Some(reply_to) = request.reply_to.clone() else {
            return Err(Error::InvalidTransition {
                machine: "replier",
                event: "reply",
                state: "peer has no return address".to_string(),
            });
        };
        let message = Message::reply_to(
            &request,
            MessageClass::Response,
            request.expiration_time,
            payload,
        );
        let medium = self.medium()?;
        let sent = match send_recorded(
            &medium,
            ctx,
            "replier.reply",
            &[reply_to],
            message,
            Some(self.session_id),
            false,
        )
        .await
        {
            Ok(sent) => sent,
            Err(err) if !is_replay_divergence(&err) => {
                lock(&self.inner).state = RequestState::Expired;
                self.schedule_terminate(Err(ProtocolFailure::Transport(err.to_string())));
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        lock(&self.inner).state = RequestState::Closed;
        self.schedule_terminate(Ok(message_to_live(&sent)));
        Ok(sent)
    }

    async fn apply_requested(&self, ctx: &Context, request: Message) -> anyhow::Result<Live> {
        let expiration = request.expiration_time;
        lock(&self.inner).request = Some(request.clone());
        self.reset_timer(expiration);
        let machine = self.self_arc()?;
        self.replier.requested(ctx, &machine, request).await?;
        Ok(Live::Null)
    }

    async fn apply_expired(&self, ctx: &Context) -> anyhow::Result<Live> {
        let _ = ctx;
        lock(&self.inner).state = RequestState::Expired;
        Ok(Live::Null)
    }

    async fn on_request(&self, message: Message) -> Result<(), Error> {
        if lock(&self.inner).request.is_some() {
            tracing::warn!(session_id = %self.session_id, "dropping duplicate request");
            return Ok(());
        }
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = message_to_live(&message);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "requested",
                None,
                input,
                |ctx| async move { machine.apply_requested(&ctx, message).await },
            )
            .await?;
        Ok(())
    }

    async fn on_expiration(self: Arc<Self>) {
        if self.state() != RequestState::Requested {
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

    fn reset_timer(&self, at: Timestamp) {
        if self.is_replay() {
            return;
        }
        let Some(machine) = self.self_ref.upgrade() else {
            return;
        };
        let now = machine
            .medium
            .upgrade()
            .map(|medium| medium.now())
            .unwrap_or(at);
        self.timer.schedule(at.duration_since(now), async move {
            machine.on_expiration().await;
        });
    }

    fn schedule_terminate(&self, result: TerminalResult) {
        if self.is_replay() {
            return;
        }
        let Some(machine) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            machine.terminate(result).await;
        });
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
impl Listener for ReplierMedium {
    fn session_id(&self) -> SessionId {
        self.session_id
    }
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn agent_side(&self) -> Live {
        self.replier.snapshot()
    }
    fn as_recorder(self: Arc<Self>) -> Arc<dyn Recorder> {
        self
    }

    async fn deliver(self: Arc<Self>, message: Message) -> Result<(), Error> {
        match message.class {
            MessageClass::Request => self.on_request(message).await,
            other => {
                tracing::warn!(
                    session_id = %self.session_id,
                    class = ?other,
                    "replier dropping unexpected message"
                );
                Ok(())
            }
        }
    }
}

impl Snapshot for ReplierMedium {
    fn type_name(&self) -> &str {
        "replier-medium"
    }
    fn journal_ref(&self) -> Option<String> {
        Some(self.journal_id.to_string())
    }
    fn snapshot(&self) -> Live {
        self.replier.snapshot()
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[async_trait::async_trait]
impl Recorder for ReplierMedium {
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn as_snapshot(self: Arc<Self>) -> Arc<dyn Snapshot> {
        self
    }

    async fn replay_call(&self, ctx: &Context, entry_id: &str, input: Live) -> Result<Live, Error> {
        let out = match entry_id {
            "requested" => self.apply_requested(ctx, message_from_live(&input)?).await,
            "expired" => self.apply_expired(ctx).await,
            other => {
                return Err(Error::ReplayMismatch(format!(
                    "replier has no entry {other:?}"
                )))
            }
        };
        out.map_err(Error::Agent)
    }
}
