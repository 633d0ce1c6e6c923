use crate::medium::{AgentMedium, Context};
use crate::protocols::{
    is_replay_divergence, message_from_live, message_to_live, send_recorded, ExpirationTimer,
    Listener, Recorder, Terminal, TerminalResult,
};
use crate::{lock, Error, ProtocolFailure};
use indexmap::IndexMap;
use journal::{InstanceId, JournalId, Mode};
use models::{Message, MessageClass, ProtocolType, Recipient, SessionId, Timestamp};
use snapshot::{Live, Snapshot};
use std::sync::{Arc, Mutex, Weak};

/// The manager side of a contract-net exchange.
#[async_trait::async_trait]
pub trait ContractManager: Send + Sync {
    /// The manager's replayable state.
    fn snapshot(&self) -> Live {
        Live::Null
    }

    /// Open the exchange; typically announces.
    async fn initiate(
        &self,
        ctx: &Context,
        medium: &Arc<ManagerMedium>,
        args: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// A bid arrived (duplicates from one bidder replace each other).
    async fn bid(
        &self,
        ctx: &Context,
        medium: &Arc<ManagerMedium>,
        bid: Message,
    ) -> anyhow::Result<()> {
        let _ = (ctx, medium, bid);
        Ok(())
    }

    /// The announce period closed with at least one bid; typically grants.
    async fn closed(&self, ctx: &Context, medium: &Arc<ManagerMedium>) -> anyhow::Result<()>;

    /// Every granted contractor has reported.
    async fn completed(
        &self,
        ctx: &Context,
        medium: &Arc<ManagerMedium>,
        reports: Vec<Message>,
    ) -> anyhow::Result<()> {
        let _ = (ctx, medium, reports);
        Ok(())
    }

    /// An update report arrived from a granted contractor.
    async fn update(
        &self,
        ctx: &Context,
        medium: &Arc<ManagerMedium>,
        report: Message,
    ) -> anyhow::Result<()> {
        let _ = (ctx, medium, report);
        Ok(())
    }

    /// The announce period closed without a quorum.
    async fn expired(&self, ctx: &Context, medium: &Arc<ManagerMedium>) -> anyhow::Result<()> {
        let _ = (ctx, medium);
        Ok(())
    }

    /// The grant period ended before all reports arrived.
    async fn aborted(&self, ctx: &Context, medium: &Arc<ManagerMedium>) -> anyhow::Result<()> {
        let _ = (ctx, medium);
        Ok(())
    }
}

/// The contractor side of a contract-net exchange.
#[async_trait::async_trait]
pub trait Contractor: Send + Sync {
    fn snapshot(&self) -> Live {
        Live::Null
    }

    /// An announcement opened this conversation; bid or refuse.
    async fn announced(
        &self,
        ctx: &Context,
        medium: &Arc<ContractorMedium>,
        announcement: Message,
    ) -> anyhow::Result<()>;

    /// Our bid was granted; do the work and send the final report.
    async fn granted(
        &self,
        ctx: &Context,
        medium: &Arc<ContractorMedium>,
        grant: Message,
    ) -> anyhow::Result<()>;

    async fn rejected(
        &self,
        ctx: &Context,
        medium: &Arc<ContractorMedium>,
        rejection: Message,
    ) -> anyhow::Result<()> {
        let _ = (ctx, medium, rejection);
        Ok(())
    }

    async fn cancelled(
        &self,
        ctx: &Context,
        medium: &Arc<ContractorMedium>,
        cancellation: Message,
    ) -> anyhow::Result<()> {
        let _ = (ctx, medium, cancellation);
        Ok(())
    }

    async fn expired(&self, ctx: &Context, medium: &Arc<ContractorMedium>) -> anyhow::Result<()> {
        let _ = (ctx, medium);
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ManagerState {
    Initiated,
    Announced,
    Granted,
    Cancelled,
    Completed,
    Expired,
    Aborted,
}

/// Initiator-side contract machine.
pub struct ManagerMedium {
    medium: Weak<AgentMedium>,
    self_ref: Weak<ManagerMedium>,
    journal_id: JournalId,
    session_id: SessionId,
    protocol_id: String,
    recipients: Vec<Recipient>,
    manager: Arc<dyn ContractManager>,
    inner: Mutex<ManagerInner>,
    timer: ExpirationTimer,
    terminal: Terminal,
}

struct ManagerInner {
    state: ManagerState,
    announcement: Option<Message>,
    // Last-write-wins per bidder key.
    bids: IndexMap<String, Message>,
    refusals: IndexMap<String, Message>,
    granted: Vec<String>,
    reports: IndexMap<String, Message>,
}

impl ManagerMedium {
    pub(crate) fn new(
        medium: &Arc<AgentMedium>,
        journal_id: JournalId,
        session_id: SessionId,
        protocol_id: String,
        recipients: Vec<Recipient>,
        manager: Arc<dyn ContractManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            medium: Arc::downgrade(medium),
            self_ref: self_ref.clone(),
            journal_id,
            session_id,
            protocol_id,
            recipients,
            manager,
            inner: Mutex::new(ManagerInner {
                state: ManagerState::Initiated,
                announcement: None,
                bids: IndexMap::new(),
                refusals: IndexMap::new(),
                granted: Vec::new(),
                reports: IndexMap::new(),
            }),
            timer: ExpirationTimer::new(),
            terminal: Terminal::new(),
        })
    }

    pub fn state(&self) -> ManagerState {
        lock(&self.inner).state
    }

    pub async fn notify_finish(&self) -> TerminalResult {
        self.terminal.wait().await
    }

    /// Drive the manager's `initiate` inside its own journal section.
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
                |ctx| async move { machine.apply_initiate(&ctx, args).await },
            )
            .await
            .map(|_| ())
    }

    /// Send the announcement to every recipient and start collecting bids
    /// until `timeout` seconds from now.
    pub async fn announce(
        &self,
        ctx: &Context,
        payload: serde_json::Value,
        timeout: f64,
    ) -> Result<Message, Error> {
        self.ensure_state(&[ManagerState::Initiated], "announce")?;
        let expiration = ctx.get_time().await?.offset(timeout);

        let mut message = Message::new(
            ProtocolType::Contract,
            self.protocol_id.clone(),
            MessageClass::Announcement,
            expiration,
            payload,
        );
        message.receiver_id = None;
        let medium = self.medium()?;
        let sent = match send_recorded(
            &medium,
            ctx,
            "manager.announce",
            &self.recipients,
            message,
            Some(self.session_id),
            false,
        )
        .await
        {
            Ok(sent) => sent,
            Err(err) if !is_replay_divergence(&err) => {
                // Transport failure is treated as expiration.
                self.set_state(ManagerState::Expired);
                self.schedule_terminate(Err(ProtocolFailure::Transport(err.to_string())));
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        {
            let mut inner = lock(&self.inner);
            inner.announcement = Some(sent.clone());
            inner.state = ManagerState::Announced;
        }
        self.reset_timer(expiration);
        Ok(sent)
    }

    /// Grant chosen bidders and reject the rest. Reports are awaited
    /// until `report_timeout` seconds from now.
    pub async fn grant(
        &self,
        ctx: &Context,
        grants: Vec<(Recipient, serde_json::Value)>,
        report_timeout: f64,
    ) -> Result<(), Error> {
        self.ensure_state(&[ManagerState::Announced], "grant")?;
        let expiration = ctx.get_time().await?.offset(report_timeout);
        let medium = self.medium()?;

        let mut granted_keys = Vec::new();
        for (recipient, payload) in &grants {
            let Some(bid) = lock(&self.inner).bids.get(&recipient.key).cloned() else {
                tracing::warn!(
                    session_id = %self.session_id,
                    bidder = %recipient,
                    "granting a recipient that never bid; skipping"
                );
                continue;
            };
            let message = Message::reply_to(
                &bid,
                MessageClass::Grant,
                expiration,
                payload.clone(),
            );
            self.checked_send(
                ctx,
                &medium,
                "manager.grant",
                std::slice::from_ref(recipient),
                message,
            )
            .await?;
            granted_keys.push(recipient.key.clone());
        }

        // Reject every bidder that was not granted.
        let rejected: Vec<(String, Message)> = {
            let inner = lock(&self.inner);
            inner
                .bids
                .iter()
                .filter(|(key, _)| !granted_keys.contains(key))
                .map(|(key, bid)| (key.clone(), bid.clone()))
                .collect()
        };
        for (key, bid) in rejected {
            let Some(reply_to) = bid.reply_to.clone() else {
                continue;
            };
            let message = Message::reply_to(
                &bid,
                MessageClass::Rejection,
                expiration,
                serde_json::Value::Null,
            );
            tracing::debug!(session_id = %self.session_id, bidder = %key, "rejecting bid");
            self.checked_send(ctx, &medium, "manager.reject", &[reply_to], message)
                .await?;
        }

        {
            let mut inner = lock(&self.inner);
            inner.granted = granted_keys;
            inner.state = ManagerState::Granted;
        }
        self.reset_timer(expiration);
        Ok(())
    }

    /// Cancel the exchange, notifying every engaged contractor.
    pub async fn cancel(&self, ctx: &Context, payload: serde_json::Value) -> Result<(), Error> {
        self.ensure_state(&[ManagerState::Announced, ManagerState::Granted], "cancel")?;
        let medium = self.medium()?;
        let expiration = ctx.get_time().await?.offset(10.0);

        let engaged: Vec<Message> = {
            let inner = lock(&self.inner);
            inner.bids.values().cloned().collect()
        };
        for bid in engaged {
            let Some(reply_to) = bid.reply_to.clone() else {
                continue;
            };
            let message = Message::reply_to(
                &bid,
                MessageClass::Cancellation,
                expiration,
                payload.clone(),
            );
            self.checked_send(ctx, &medium, "manager.cancel", &[reply_to], message)
                .await?;
        }
        self.set_state(ManagerState::Cancelled);
        self.schedule_terminate(Err(ProtocolFailure::Cancelled));
        Ok(())
    }

    /// Hand an in-flight grant over to another manager. The message is
    /// forwarded untouched: no fresh `message_id`, no `reply_to` stamping.
    pub async fn handover(
        &self,
        ctx: &Context,
        to: Recipient,
        grant: Message,
    ) -> Result<(), Error> {
        self.ensure_state(&[ManagerState::Announced, ManagerState::Granted], "handover")?;
        let medium = self.medium()?;
        send_recorded(
            &medium,
            ctx,
            "manager.handover",
            &[to],
            grant,
            Some(self.session_id),
            true,
        )
        .await?;
        self.set_state(ManagerState::Completed);
        self.schedule_terminate(Ok(Live::record([("handover", true)])));
        Ok(())
    }

    pub fn bids(&self) -> Vec<Message> {
        lock(&self.inner).bids.values().cloned().collect()
    }

    /// The announcement as it was sent, once announced.
    pub fn announcement(&self) -> Option<Message> {
        lock(&self.inner).announcement.clone()
    }

    // ### Entry application (live and replay) ###

    async fn apply_initiate(
        &self,
        ctx: &Context,
        args: serde_json::Value,
    ) -> anyhow::Result<Live> {
        let machine = self.self_arc()?;
        self.manager.initiate(ctx, &machine, args).await?;
        Ok(Live::Null)
    }

    async fn apply_bid(&self, ctx: &Context, bid: Message) -> anyhow::Result<Live> {
        let key = bid
            .reply_to
            .as_ref()
            .map(|reply_to| reply_to.key.clone())
            .unwrap_or_default();
        lock(&self.inner).bids.insert(key, bid.clone());
        let machine = self.self_arc()?;
        self.manager.bid(ctx, &machine, bid).await?;
        Ok(Live::Null)
    }

    async fn apply_closed(&self, ctx: &Context) -> anyhow::Result<Live> {
        let machine = self.self_arc()?;
        self.manager.closed(ctx, &machine).await?;
        Ok(Live::Null)
    }

    async fn apply_completed(
        &self,
        ctx: &Context,
        reports: Vec<Message>,
    ) -> anyhow::Result<Live> {
        {
            let mut inner = lock(&self.inner);
            for report in &reports {
                let key = report
                    .reply_to
                    .as_ref()
                    .map(|reply_to| reply_to.key.clone())
                    .unwrap_or_default();
                inner.reports.insert(key, report.clone());
            }
        }
        let machine = self.self_arc()?;
        self.manager.completed(ctx, &machine, reports).await?;
        lock(&self.inner).state = ManagerState::Completed;
        Ok(Live::Null)
    }

    async fn apply_update(&self, ctx: &Context, report: Message) -> anyhow::Result<Live> {
        let machine = self.self_arc()?;
        self.manager.update(ctx, &machine, report).await?;
        Ok(Live::Null)
    }

    async fn apply_expired(&self, ctx: &Context) -> anyhow::Result<Live> {
        let machine = self.self_arc()?;
        self.manager.expired(ctx, &machine).await?;
        lock(&self.inner).state = ManagerState::Expired;
        Ok(Live::Null)
    }

    async fn apply_aborted(&self, ctx: &Context) -> anyhow::Result<Live> {
        let machine = self.self_arc()?;
        self.manager.aborted(ctx, &machine).await?;
        lock(&self.inner).state = ManagerState::Aborted;
        Ok(Live::Null)
    }

    // ### Live delivery ###

    async fn on_bid(&self, message: Message) -> Result<(), Error> {
        if self.state() != ManagerState::Announced {
            tracing::warn!(session_id = %self.session_id, "dropping out-of-order bid");
            return Ok(());
        }
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = message_to_live(&message);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "bid",
                None,
                input,
                |ctx| async move { machine.apply_bid(&ctx, message).await },
            )
            .await?;
        self.maybe_close_early().await;
        Ok(())
    }

    async fn on_refusal(&self, message: Message) -> Result<(), Error> {
        if self.state() != ManagerState::Announced {
            tracing::warn!(session_id = %self.session_id, "dropping out-of-order refusal");
            return Ok(());
        }
        let key = message
            .reply_to
            .as_ref()
            .map(|reply_to| reply_to.key.clone())
            .unwrap_or_default();
        lock(&self.inner).refusals.insert(key, message);
        if let Some(machine) = self.self_ref.upgrade() {
            machine.maybe_close_early().await;
        }
        Ok(())
    }

    async fn on_final_report(&self, message: Message) -> Result<(), Error> {
        if self.state() != ManagerState::Granted {
            tracing::warn!(session_id = %self.session_id, "dropping out-of-order report");
            return Ok(());
        }
        let complete = {
            let mut inner = lock(&self.inner);
            let key = message
                .reply_to
                .as_ref()
                .map(|reply_to| reply_to.key.clone())
                .unwrap_or_default();
            inner.reports.insert(key, message);
            inner
                .granted
                .iter()
                .all(|granted| inner.reports.contains_key(granted))
        };
        if !complete {
            return Ok(());
        }

        let reports: Vec<Message> = lock(&self.inner).reports.values().cloned().collect();
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = Live::List(reports.iter().map(|m| message_to_live(m)).collect());
        let applied = reports.clone();
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "completed",
                None,
                input,
                |ctx| async move { machine.apply_completed(&ctx, applied).await },
            )
            .await?;
        let result = Live::List(reports.iter().map(|m| message_to_live(m)).collect());
        self.terminate(Ok(result)).await;
        Ok(())
    }

    async fn on_update(&self, message: Message) -> Result<(), Error> {
        if self.state() != ManagerState::Granted {
            tracing::warn!(session_id = %self.session_id, "dropping out-of-order update");
            return Ok(());
        }
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = message_to_live(&message);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "update",
                None,
                input,
                |ctx| async move { machine.apply_update(&ctx, message).await },
            )
            .await?;
        Ok(())
    }

    /// Close the announce period as soon as every recipient responded.
    async fn maybe_close_early(&self) {
        let responded = {
            let inner = lock(&self.inner);
            inner.state == ManagerState::Announced
                && self.recipients.iter().all(|recipient| {
                    inner.bids.contains_key(&recipient.key)
                        || inner.refusals.contains_key(&recipient.key)
                })
        };
        if responded {
            tracing::debug!(session_id = %self.session_id, "all recipients responded; closing");
            self.close_announce_period().await;
        }
    }

    async fn close_announce_period(&self) {
        if self.state() != ManagerState::Announced {
            return;
        }
        let Ok(medium) = self.medium() else { return };
        let Ok(machine) = self.self_arc() else { return };

        let have_bids = !lock(&self.inner).bids.is_empty();
        if have_bids {
            let machine = machine.clone();
            let result = medium
                .journaled(
                    InstanceId::Recorder(self.journal_id.clone()),
                    "closed",
                    None,
                    Live::Null,
                    |ctx| async move { machine.apply_closed(&ctx).await },
                )
                .await;
            if let Err(err) = result {
                tracing::error!(session_id = %self.session_id, %err, "manager.closed failed");
            }
        }

        // Still announced: no grant was emitted; the exchange expires.
        if self.state() == ManagerState::Announced {
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
    }

    async fn on_expiration(self: Arc<Self>) {
        match self.state() {
            ManagerState::Announced => self.close_announce_period().await,
            ManagerState::Granted => {
                let Ok(medium) = self.medium() else { return };
                let machine = self.clone();
                let _ = medium
                    .journaled(
                        InstanceId::Recorder(self.journal_id.clone()),
                        "aborted",
                        None,
                        Live::Null,
                        |ctx| async move { machine.apply_aborted(&ctx).await },
                    )
                    .await;
                let missing = {
                    let inner = lock(&self.inner);
                    inner
                        .granted
                        .iter()
                        .filter(|key| !inner.reports.contains_key(*key))
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                self.terminate(Err(ProtocolFailure::Aborted(missing))).await;
            }
            _ => (),
        }
    }

    // ### Plumbing ###

    async fn checked_send(
        &self,
        ctx: &Context,
        medium: &Arc<AgentMedium>,
        effect_id: &str,
        recipients: &[Recipient],
        message: Message,
    ) -> Result<Message, Error> {
        match send_recorded(
            medium,
            ctx,
            effect_id,
            recipients,
            message,
            Some(self.session_id),
            false,
        )
        .await
        {
            Ok(sent) => Ok(sent),
            Err(err) if !is_replay_divergence(&err) => {
                self.set_state(ManagerState::Expired);
                self.schedule_terminate(Err(ProtocolFailure::Transport(err.to_string())));
                Err(err)
            }
            Err(err) => Err(err),
        }
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

    fn set_state(&self, state: ManagerState) {
        let mut inner = lock(&self.inner);
        tracing::debug!(
            session_id = %self.session_id,
            from = ?inner.state,
            to = ?state,
            "contract manager transition"
        );
        inner.state = state;
    }

    fn ensure_state(&self, allowed: &[ManagerState], event: &'static str) -> Result<(), Error> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                machine: "contract-manager",
                event,
                state: format!("{state:?}"),
            })
        }
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
        self.timer
            .schedule(at.duration_since(now), async move {
                machine.on_expiration().await;
            });
    }

    /// Defer termination until the enclosing journal section has closed.
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

    /// Delete the timer, unregister from the medium, resolve waiters.
    async fn terminate(&self, result: TerminalResult) {
        self.timer.cancel();
        if let Ok(medium) = self.medium() {
            medium.unregister_listener(self.session_id);
        }
        self.terminal.resolve(result);
    }
}

#[async_trait::async_trait]
impl Listener for ManagerMedium {
    fn session_id(&self) -> SessionId {
        self.session_id
    }
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn agent_side(&self) -> Live {
        self.manager.snapshot()
    }
    fn as_recorder(self: Arc<Self>) -> Arc<dyn Recorder> {
        self
    }

    async fn deliver(self: Arc<Self>, message: Message) -> Result<(), Error> {
        match message.class {
            MessageClass::Bid => self.on_bid(message).await,
            MessageClass::Refusal => self.on_refusal(message).await,
            MessageClass::FinalReport => self.on_final_report(message).await,
            MessageClass::UpdateReport => self.on_update(message).await,
            other => {
                tracing::warn!(
                    session_id = %self.session_id,
                    class = ?other,
                    "contract manager dropping unexpected message"
                );
                Ok(())
            }
        }
    }
}

impl Snapshot for ManagerMedium {
    fn type_name(&self) -> &str {
        "manager-medium"
    }
    fn journal_ref(&self) -> Option<String> {
        Some(self.journal_id.to_string())
    }
    fn snapshot(&self) -> Live {
        self.manager.snapshot()
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[async_trait::async_trait]
impl Recorder for ManagerMedium {
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn as_snapshot(self: Arc<Self>) -> Arc<dyn Snapshot> {
        self
    }

    async fn replay_call(&self, ctx: &Context, entry_id: &str, input: Live) -> Result<Live, Error> {
        let machine = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::MediumGone(self.journal_id.to_string()))?;
        let out = match entry_id {
            "initiate" => {
                machine
                    .apply_initiate(ctx, input.to_json()?)
                    .await
            }
            "bid" => machine.apply_bid(ctx, message_from_live(&input)?).await,
            "closed" => machine.apply_closed(ctx).await,
            "completed" => {
                let Live::List(items) = &input else {
                    return Err(Error::ReplayMismatch(
                        "completed entry input is not a list".to_string(),
                    ));
                };
                let reports = items
                    .iter()
                    .map(message_from_live)
                    .collect::<Result<Vec<_>, _>>()?;
                machine.apply_completed(ctx, reports).await
            }
            "update" => machine.apply_update(ctx, message_from_live(&input)?).await,
            "expired" => machine.apply_expired(ctx).await,
            "aborted" => machine.apply_aborted(ctx).await,
            other => {
                return Err(Error::ReplayMismatch(format!(
                    "contract manager has no entry {other:?}"
                )))
            }
        };
        out.map_err(Error::Agent)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ContractorState {
    Announced,
    Bid,
    Refused,
    Granted,
    Cancelled,
    Completed,
    Reported,
    Expired,
}

/// Interested-side contract machine.
pub struct ContractorMedium {
    medium: Weak<AgentMedium>,
    self_ref: Weak<ContractorMedium>,
    journal_id: JournalId,
    session_id: SessionId,
    contractor: Arc<dyn Contractor>,
    inner: Mutex<ContractorInner>,
    timer: ExpirationTimer,
    terminal: Terminal,
}

struct ContractorInner {
    state: ContractorState,
    announcement: Option<Message>,
    own_bid: Option<Message>,
    grant: Option<Message>,
}

impl ContractorMedium {
    pub(crate) fn new(
        medium: &Arc<AgentMedium>,
        journal_id: JournalId,
        session_id: SessionId,
        contractor: Arc<dyn Contractor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            medium: Arc::downgrade(medium),
            self_ref: self_ref.clone(),
            journal_id,
            session_id,
            contractor,
            inner: Mutex::new(ContractorInner {
                state: ContractorState::Announced,
                announcement: None,
                own_bid: None,
                grant: None,
            }),
            timer: ExpirationTimer::new(),
            terminal: Terminal::new(),
        })
    }

    pub fn state(&self) -> ContractorState {
        lock(&self.inner).state
    }

    pub async fn notify_finish(&self) -> TerminalResult {
        self.terminal.wait().await
    }

    /// The bid we placed, if any.
    pub fn own_bid(&self) -> Option<Message> {
        lock(&self.inner).own_bid.clone()
    }

    /// Bid on the current announcement.
    pub async fn bid(&self, ctx: &Context, payload: serde_json::Value) -> Result<Message, Error> {
        self.ensure_state(&[ContractorState::Announced], "bid")?;
        let announcement = self.announcement()?;
        let message = Message::reply_to(
            &announcement,
            MessageClass::Bid,
            announcement.expiration_time,
            payload,
        );
        let sent = self.checked_send(ctx, "contractor.bid", &announcement, message).await?;
        let mut inner = lock(&self.inner);
        inner.own_bid = Some(sent.clone());
        inner.state = ContractorState::Bid;
        Ok(sent)
    }

    /// Refuse the current announcement and terminate.
    pub async fn refuse(&self, ctx: &Context, payload: serde_json::Value) -> Result<Message, Error> {
        self.ensure_state(&[ContractorState::Announced], "refuse")?;
        let announcement = self.announcement()?;
        let message = Message::reply_to(
            &announcement,
            MessageClass::Refusal,
            announcement.expiration_time,
            payload,
        );
        let sent = self
            .checked_send(ctx, "contractor.refuse", &announcement, message)
            .await?;
        lock(&self.inner).state = ContractorState::Refused;
        self.schedule_terminate(Ok(message_to_live(&sent)));
        Ok(sent)
    }

    /// Report progress while granted.
    pub async fn update_report(
        &self,
        ctx: &Context,
        payload: serde_json::Value,
    ) -> Result<Message, Error> {
        self.ensure_state(&[ContractorState::Granted], "update_report")?;
        let grant = self.grant()?;
        let message = Message::reply_to(
            &grant,
            MessageClass::UpdateReport,
            grant.expiration_time,
            payload,
        );
        self.checked_send(ctx, "contractor.update_report", &grant, message)
            .await
    }

    /// Send the final report and terminate successfully.
    pub async fn final_report(
        &self,
        ctx: &Context,
        payload: serde_json::Value,
    ) -> Result<Message, Error> {
        self.ensure_state(&[ContractorState::Granted], "final_report")?;
        let grant = self.grant()?;
        lock(&self.inner).state = ContractorState::Reported;
        let message = Message::reply_to(
            &grant,
            MessageClass::FinalReport,
            grant.expiration_time,
            payload,
        );
        let sent = self
            .checked_send(ctx, "contractor.final_report", &grant, message)
            .await?;
        lock(&self.inner).state = ContractorState::Completed;
        self.schedule_terminate(Ok(message_to_live(&sent)));
        Ok(sent)
    }

    // ### Entry application (live and replay) ###

    async fn apply_announced(
        &self,
        ctx: &Context,
        announcement: Message,
    ) -> anyhow::Result<Live> {
        let expiration = announcement.expiration_time;
        lock(&self.inner).announcement = Some(announcement.clone());
        self.reset_timer(expiration);
        let machine = self.self_arc()?;
        self.contractor.announced(ctx, &machine, announcement).await?;
        Ok(Live::Null)
    }

    async fn apply_granted(&self, ctx: &Context, grant: Message) -> anyhow::Result<Live> {
        let expiration = grant.expiration_time;
        {
            let mut inner = lock(&self.inner);
            inner.grant = Some(grant.clone());
            inner.state = ContractorState::Granted;
        }
        self.reset_timer(expiration);
        let machine = self.self_arc()?;
        self.contractor.granted(ctx, &machine, grant).await?;
        Ok(Live::Null)
    }

    async fn apply_rejected(
        &self,
        ctx: &Context,
        rejection: Message,
    ) -> anyhow::Result<Live> {
        lock(&self.inner).state = ContractorState::Cancelled;
        let machine = self.self_arc()?;
        self.contractor.rejected(ctx, &machine, rejection).await?;
        Ok(Live::Null)
    }

    async fn apply_cancelled(
        &self,
        ctx: &Context,
        cancellation: Message,
    ) -> anyhow::Result<Live> {
        lock(&self.inner).state = ContractorState::Cancelled;
        let machine = self.self_arc()?;
        self.contractor.cancelled(ctx, &machine, cancellation).await?;
        Ok(Live::Null)
    }

    async fn apply_expired(&self, ctx: &Context) -> anyhow::Result<Live> {
        lock(&self.inner).state = ContractorState::Expired;
        let machine = self.self_arc()?;
        self.contractor.expired(ctx, &machine).await?;
        Ok(Live::Null)
    }

    // ### Live delivery ###

    async fn on_announcement(&self, message: Message) -> Result<(), Error> {
        if lock(&self.inner).announcement.is_some() {
            tracing::warn!(session_id = %self.session_id, "dropping duplicate announcement");
            return Ok(());
        }
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = message_to_live(&message);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "announced",
                None,
                input,
                |ctx| async move { machine.apply_announced(&ctx, message).await },
            )
            .await?;
        Ok(())
    }

    async fn on_grant(&self, message: Message) -> Result<(), Error> {
        match self.state() {
            ContractorState::Bid => (),
            ContractorState::Refused => {
                tracing::debug!(
                    session_id = %self.session_id,
                    "ignoring a grant arriving after our refusal"
                );
                return Ok(());
            }
            state => {
                tracing::warn!(
                    session_id = %self.session_id,
                    ?state,
                    "dropping out-of-order grant"
                );
                return Ok(());
            }
        }
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = message_to_live(&message);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "granted",
                None,
                input,
                |ctx| async move { machine.apply_granted(&ctx, message).await },
            )
            .await?;
        Ok(())
    }

    async fn on_rejection(&self, message: Message) -> Result<(), Error> {
        if self.state() != ContractorState::Bid {
            tracing::warn!(session_id = %self.session_id, "dropping out-of-order rejection");
            return Ok(());
        }
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = message_to_live(&message);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "rejected",
                None,
                input,
                |ctx| async move { machine.apply_rejected(&ctx, message).await },
            )
            .await?;
        self.terminate(Err(ProtocolFailure::Rejected)).await;
        Ok(())
    }

    async fn on_cancellation(&self, message: Message) -> Result<(), Error> {
        match self.state() {
            ContractorState::Announced | ContractorState::Bid | ContractorState::Granted => (),
            state => {
                // Cancellation in a terminal state is ignored.
                tracing::debug!(session_id = %self.session_id, ?state, "ignoring cancellation");
                return Ok(());
            }
        }
        let medium = self.medium()?;
        let machine = self.self_arc()?;
        let input = message_to_live(&message);
        medium
            .journaled(
                InstanceId::Recorder(self.journal_id.clone()),
                "cancelled",
                None,
                input,
                |ctx| async move { machine.apply_cancelled(&ctx, message).await },
            )
            .await?;
        self.terminate(Err(ProtocolFailure::Cancelled)).await;
        Ok(())
    }

    async fn on_expiration(self: Arc<Self>) {
        match self.state() {
            ContractorState::Announced | ContractorState::Bid | ContractorState::Granted => (),
            _ => return,
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

    // ### Plumbing ###

    fn announcement(&self) -> Result<Message, Error> {
        lock(&self.inner)
            .announcement
            .clone()
            .ok_or_else(|| Error::InvalidTransition {
                machine: "contractor",
                event: "reply",
                state: "no announcement".to_string(),
            })
    }

    fn grant(&self) -> Result<Message, Error> {
        lock(&self.inner)
            .grant
            .clone()
            .ok_or_else(|| Error::InvalidTransition {
                machine: "contractor",
                event: "report",
                state: "no grant".to_string(),
            })
    }

    /// Send a reply within this conversation, routed back to the peer.
    async fn checked_send(
        &self,
        ctx: &Context,
        effect_id: &str,
        in_reply_to: &Message,
        message: Message,
    ) -> Result<Message, Error> {
        let medium = self.medium()?;
        let Some(reply_to) = in_reply_to.reply_to.clone() else {
            return Err(Error::InvalidTransition {
                machine: "contractor",
                event: "reply",
                state: "peer has no return address".to_string(),
            });
        };
        match send_recorded(
            &medium,
            ctx,
            effect_id,
            &[reply_to],
            message,
            Some(self.session_id),
            false,
        )
        .await
        {
            Ok(sent) => Ok(sent),
            Err(err) if !is_replay_divergence(&err) => {
                lock(&self.inner).state = ContractorState::Expired;
                self.schedule_terminate(Err(ProtocolFailure::Transport(err.to_string())));
                Err(err)
            }
            Err(err) => Err(err),
        }
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

    fn ensure_state(&self, allowed: &[ContractorState], event: &'static str) -> Result<(), Error> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                machine: "contractor",
                event,
                state: format!("{state:?}"),
            })
        }
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
        self.timer
            .schedule(at.duration_since(now), async move {
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
impl Listener for ContractorMedium {
    fn session_id(&self) -> SessionId {
        self.session_id
    }
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn agent_side(&self) -> Live {
        self.contractor.snapshot()
    }
    fn as_recorder(self: Arc<Self>) -> Arc<dyn Recorder> {
        self
    }

    async fn deliver(self: Arc<Self>, message: Message) -> Result<(), Error> {
        match message.class {
            MessageClass::Announcement => self.on_announcement(message).await,
            MessageClass::Grant => self.on_grant(message).await,
            MessageClass::Rejection => self.on_rejection(message).await,
            MessageClass::Cancellation => self.on_cancellation(message).await,
            other => {
                tracing::warn!(
                    session_id = %self.session_id,
                    class = ?other,
                    "contractor dropping unexpected message"
                );
                Ok(())
            }
        }
    }
}

impl Snapshot for ContractorMedium {
    fn type_name(&self) -> &str {
        "contractor-medium"
    }
    fn journal_ref(&self) -> Option<String> {
        Some(self.journal_id.to_string())
    }
    fn snapshot(&self) -> Live {
        self.contractor.snapshot()
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[async_trait::async_trait]
impl Recorder for ContractorMedium {
    fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }
    fn as_snapshot(self: Arc<Self>) -> Arc<dyn Snapshot> {
        self
    }

    async fn replay_call(&self, ctx: &Context, entry_id: &str, input: Live) -> Result<Live, Error> {
        let machine = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::MediumGone(self.journal_id.to_string()))?;
        let out = match entry_id {
            "announced" => {
                machine
                    .apply_announced(ctx, message_from_live(&input)?)
                    .await
            }
            "granted" => machine.apply_granted(ctx, message_from_live(&input)?).await,
            "rejected" => {
                machine
                    .apply_rejected(ctx, message_from_live(&input)?)
                    .await
            }
            "cancelled" => {
                machine
                    .apply_cancelled(ctx, message_from_live(&input)?)
                    .await
            }
            "expired" => machine.apply_expired(ctx).await,
            other => {
                return Err(Error::ReplayMismatch(format!(
                    "contractor has no entry {other:?}"
                )))
            }
        };
        out.map_err(Error::Agent)
    }
}
