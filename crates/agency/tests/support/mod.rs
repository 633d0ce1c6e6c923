//! Shared fixtures: an agency over the emulated broker and store, a
//! scriptable test agent, and the protocol factories the scenarios use.
#![allow(dead_code)]

use agency::{
    Agency, Agent, AgentFactory, AgentMedium, ContractManager, Contractor, ContractorMedium,
    Context, InitiatorSide, InterestType, InterestedSide, ManagerMedium, ProtocolFactory,
    ProtocolRef, Replier, ReplierMedium, Requester, RequesterMedium, Task, TaskMedium,
};
use models::{Descriptor, ProtocolType, Recipient};
use snapshot::Live;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_agency() -> Arc<Agency> {
    test_agency_with_broker().0
}

/// Like [`test_agency`], also handing back the emulation broker so tests
/// can attach raw subscribers.
pub fn test_agency_with_broker() -> (Arc<Agency>, messaging::Broker) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let broker = messaging::Broker::new();
    let agency = Agency::new(
        Arc::new(broker.clone()),
        Arc::new(docstore::Database::new()),
    );
    (agency, broker)
}

pub fn descriptor(doc_id: &str, document_type: &str) -> Descriptor {
    Descriptor::new(doc_id, document_type, "shard")
}

/// Poll `check` until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn finish(protocol: &ProtocolRef) -> agency::TerminalResult {
    tokio::time::timeout(Duration::from_secs(2), protocol.notify_finish())
        .await
        .expect("protocol finishes within two seconds")
}

#[derive(Clone, Default)]
pub struct AgentConfig {
    /// Factory keys to register interests for during initiate.
    pub interests: Vec<String>,
    /// A protocol to initiate: (factory key, recipients, args).
    pub kickoff: Option<(String, Vec<Recipient>, serde_json::Value)>,
    /// Run the kickoff through the retrying wrapper.
    pub retry: Option<agency::RetryPolicy>,
    /// Record the current time into the log.
    pub record_time: bool,
    /// Write the descriptor through the database and log the revision.
    pub update_descriptor: bool,
}

/// Decode a terminal value that carries a message.
pub fn message_from(live: &Live) -> models::Message {
    serde_json::from_value(live.to_json().expect("terminal value renders to JSON"))
        .expect("terminal value is a message")
}

/// A scriptable agent whose replayable state is a plain log of strings.
pub struct TestAgent {
    config: AgentConfig,
    pub log: Mutex<Vec<String>>,
    pub protocol: Mutex<Option<ProtocolRef>>,
}

impl TestAgent {
    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait::async_trait]
impl Agent for TestAgent {
    async fn initiate(&self, ctx: &Context) -> anyhow::Result<()> {
        if self.config.record_time {
            let now = ctx.get_time().await?;
            self.push(format!("time:{}", now.as_epoch_secs()));
        }
        if self.config.update_descriptor {
            let mut descriptor = ctx.get_descriptor().await?;
            descriptor
                .payload
                .insert("generation".to_string(), serde_json::json!(1));
            let saved = ctx.update_descriptor(descriptor).await?;
            self.push(format!("rev:{}", saved.rev.unwrap_or_default()));
        }
        for key in &self.config.interests {
            ctx.register_interest(key).await?;
            self.push(format!("interested:{key}"));
        }
        if let Some((key, recipients, args)) = self.config.kickoff.clone() {
            let protocol = match self.config.retry {
                Some(policy) => {
                    ctx.retrying_protocol(&key, recipients, policy, args).await?
                }
                None => ctx.initiate_protocol(&key, recipients, args).await?,
            };
            self.push(format!("initiated:{key}"));
            *self.protocol.lock().unwrap() = Some(protocol);
        }
        Ok(())
    }

    fn snapshot(&self) -> Live {
        Live::List(
            self.log
                .lock()
                .unwrap()
                .iter()
                .map(|entry| Live::Str(entry.clone()))
                .collect(),
        )
    }
}

pub struct TestAgentFactory {
    document_type: String,
    config: AgentConfig,
    pub built: Mutex<Vec<Arc<TestAgent>>>,
}

impl TestAgentFactory {
    pub fn new(document_type: &str, config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            document_type: document_type.to_string(),
            config,
            built: Mutex::new(Vec::new()),
        })
    }

    /// The most recently built agent instance.
    pub fn agent(&self) -> Arc<TestAgent> {
        self.built
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("an agent was built")
    }
}

impl AgentFactory for TestAgentFactory {
    fn document_type(&self) -> &str {
        &self.document_type
    }

    fn build(&self, _medium: &Arc<AgentMedium>) -> Arc<dyn Agent> {
        let agent = Arc::new(TestAgent {
            config: self.config.clone(),
            log: Mutex::new(Vec::new()),
            protocol: Mutex::new(None),
        });
        self.built.lock().unwrap().push(agent.clone());
        agent
    }
}

// ### The "buy" contract ###

/// Manager announces, grants the cheapest bid, and completes on the
/// final report. Contractors bid a price derived from their agent id.
pub struct BuyContract;

impl ProtocolFactory for BuyContract {
    fn key(&self) -> &str {
        "contract:buy"
    }
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Contract
    }
    fn protocol_id(&self) -> &str {
        "buy"
    }
    fn interest_type(&self) -> InterestType {
        InterestType::Public
    }
    fn make_initiator(&self, _agent: &Arc<dyn Agent>) -> Option<InitiatorSide> {
        Some(InitiatorSide::Manager(Arc::new(BuyManager::default())))
    }
    fn make_interested(&self, _agent: &Arc<dyn Agent>) -> Option<InterestedSide> {
        Some(InterestedSide::Contractor(Arc::new(BuyContractor::default())))
    }
}

#[derive(Default)]
pub struct BuyManager {
    pub log: Mutex<Vec<String>>,
}

impl BuyManager {
    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait::async_trait]
impl ContractManager for BuyManager {
    fn snapshot(&self) -> Live {
        log_snapshot(&self.log)
    }

    async fn initiate(
        &self,
        ctx: &Context,
        medium: &Arc<ManagerMedium>,
        args: serde_json::Value,
    ) -> anyhow::Result<()> {
        medium.announce(ctx, args, 5.0).await?;
        self.push("announced".to_string());
        Ok(())
    }

    async fn bid(
        &self,
        _ctx: &Context,
        _medium: &Arc<ManagerMedium>,
        bid: models::Message,
    ) -> anyhow::Result<()> {
        self.push(format!("bid:{}", bid.payload["price"]));
        Ok(())
    }

    async fn closed(&self, ctx: &Context, medium: &Arc<ManagerMedium>) -> anyhow::Result<()> {
        let mut bids = medium.bids();
        bids.sort_by_key(|bid| bid.payload["price"].as_i64().unwrap_or(i64::MAX));
        let best = bids.first().cloned().ok_or_else(|| anyhow::anyhow!("no bids"))?;
        let to = best
            .reply_to
            .clone()
            .ok_or_else(|| anyhow::anyhow!("bid without return address"))?;
        self.push(format!("granting:{}", to.key));
        medium
            .grant(ctx, vec![(to, serde_json::json!({"go": true}))], 5.0)
            .await?;
        Ok(())
    }

    async fn completed(
        &self,
        _ctx: &Context,
        _medium: &Arc<ManagerMedium>,
        reports: Vec<models::Message>,
    ) -> anyhow::Result<()> {
        self.push(format!("completed:{}", reports.len()));
        Ok(())
    }
}

#[derive(Default)]
pub struct BuyContractor {
    pub log: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Contractor for BuyContractor {
    fn snapshot(&self) -> Live {
        log_snapshot(&self.log)
    }

    async fn announced(
        &self,
        ctx: &Context,
        medium: &Arc<ContractorMedium>,
        announcement: models::Message,
    ) -> anyhow::Result<()> {
        let price = agent_price(ctx.medium().agent_id());
        if let Some(max_price) = announcement.payload["max_price"].as_i64() {
            if price > max_price {
                self.log.lock().unwrap().push("refusing".to_string());
                medium
                    .refuse(ctx, serde_json::json!({"price": price}))
                    .await?;
                return Ok(());
            }
        }
        self.log.lock().unwrap().push(format!("bidding:{price}"));
        medium.bid(ctx, serde_json::json!({"price": price})).await?;
        Ok(())
    }

    async fn granted(
        &self,
        ctx: &Context,
        medium: &Arc<ContractorMedium>,
        _grant: models::Message,
    ) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("working".to_string());
        medium
            .final_report(ctx, serde_json::json!({"done": true}))
            .await?;
        self.log.lock().unwrap().push("reported".to_string());
        Ok(())
    }

    async fn rejected(
        &self,
        _ctx: &Context,
        _medium: &Arc<ContractorMedium>,
        _rejection: models::Message,
    ) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("rejected".to_string());
        Ok(())
    }
}

/// A contract whose manager cancels as soon as the first bid arrives.
pub struct CancelContract;

impl ProtocolFactory for CancelContract {
    fn key(&self) -> &str {
        "contract:cancel"
    }
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Contract
    }
    fn protocol_id(&self) -> &str {
        "cancel"
    }
    fn interest_type(&self) -> InterestType {
        InterestType::Public
    }
    fn make_initiator(&self, _agent: &Arc<dyn Agent>) -> Option<InitiatorSide> {
        Some(InitiatorSide::Manager(Arc::new(CancellingManager)))
    }
    fn make_interested(&self, _agent: &Arc<dyn Agent>) -> Option<InterestedSide> {
        Some(InterestedSide::Contractor(Arc::new(BuyContractor::default())))
    }
}

pub struct CancellingManager;

#[async_trait::async_trait]
impl ContractManager for CancellingManager {
    async fn initiate(
        &self,
        ctx: &Context,
        medium: &Arc<ManagerMedium>,
        args: serde_json::Value,
    ) -> anyhow::Result<()> {
        medium.announce(ctx, args, 5.0).await?;
        Ok(())
    }

    async fn bid(
        &self,
        ctx: &Context,
        medium: &Arc<ManagerMedium>,
        _bid: models::Message,
    ) -> anyhow::Result<()> {
        medium
            .cancel(ctx, serde_json::json!({"reason": "changed our mind"}))
            .await?;
        Ok(())
    }

    async fn closed(&self, _ctx: &Context, _medium: &Arc<ManagerMedium>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A deterministic per-agent price: the digits of the agent id.
pub fn agent_price(agent_id: &str) -> i64 {
    agent_id
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(99)
}

fn log_snapshot(log: &Mutex<Vec<String>>) -> Live {
    Live::List(
        log.lock()
            .unwrap()
            .iter()
            .map(|entry| Live::Str(entry.clone()))
            .collect(),
    )
}

// ### The "echo" request ###

pub struct EchoRequest;

impl ProtocolFactory for EchoRequest {
    fn key(&self) -> &str {
        "request:echo"
    }
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Request
    }
    fn protocol_id(&self) -> &str {
        "echo"
    }
    fn make_initiator(&self, _agent: &Arc<dyn Agent>) -> Option<InitiatorSide> {
        Some(InitiatorSide::Requester(Arc::new(EchoRequester::default())))
    }
    fn make_interested(&self, _agent: &Arc<dyn Agent>) -> Option<InterestedSide> {
        Some(InterestedSide::Replier(Arc::new(EchoReplier)))
    }
}

#[derive(Default)]
pub struct EchoRequester {
    pub log: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Requester for EchoRequester {
    fn snapshot(&self) -> Live {
        log_snapshot(&self.log)
    }

    async fn initiate(
        &self,
        ctx: &Context,
        medium: &Arc<RequesterMedium>,
        args: serde_json::Value,
    ) -> anyhow::Result<()> {
        medium.request(ctx, args, 1.0).await?;
        self.log.lock().unwrap().push("requested".to_string());
        Ok(())
    }

    async fn got_reply(
        &self,
        _ctx: &Context,
        _medium: &Arc<RequesterMedium>,
        reply: models::Message,
    ) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("reply:{}", reply.payload["text"]));
        Ok(())
    }
}

pub struct EchoReplier;

#[async_trait::async_trait]
impl Replier for EchoReplier {
    async fn requested(
        &self,
        ctx: &Context,
        medium: &Arc<ReplierMedium>,
        request: models::Message,
    ) -> anyhow::Result<()> {
        let text = request.payload["text"].clone();
        medium.reply(ctx, serde_json::json!({ "text": text })).await?;
        Ok(())
    }
}

/// An echo replier that fails its first `fail_first` conversations, for
/// exercising retries.
pub struct FlakyEchoRequest {
    pub failures_left: Arc<AtomicU32>,
}

impl FlakyEchoRequest {
    pub fn new(fail_first: u32) -> (Arc<Self>, Arc<AtomicU32>) {
        let failures = Arc::new(AtomicU32::new(fail_first));
        (
            Arc::new(Self {
                failures_left: failures.clone(),
            }),
            failures,
        )
    }
}

impl ProtocolFactory for FlakyEchoRequest {
    fn key(&self) -> &str {
        "request:flaky-echo"
    }
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Request
    }
    fn protocol_id(&self) -> &str {
        "flaky-echo"
    }
    fn make_initiator(&self, _agent: &Arc<dyn Agent>) -> Option<InitiatorSide> {
        Some(InitiatorSide::Requester(Arc::new(EchoRequester::default())))
    }
    fn make_interested(&self, _agent: &Arc<dyn Agent>) -> Option<InterestedSide> {
        Some(InterestedSide::Replier(Arc::new(FlakyReplier {
            failures_left: self.failures_left.clone(),
        })))
    }
}

pub struct FlakyReplier {
    failures_left: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Replier for FlakyReplier {
    async fn requested(
        &self,
        ctx: &Context,
        medium: &Arc<ReplierMedium>,
        request: models::Message,
    ) -> anyhow::Result<()> {
        let failures = self.failures_left.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures_left.store(failures - 1, Ordering::SeqCst);
            anyhow::bail!("flaking out on purpose");
        }
        let text = request.payload["text"].clone();
        medium.reply(ctx, serde_json::json!({ "text": text })).await?;
        Ok(())
    }
}

// ### Tasks ###

pub struct SleepTaskProtocol {
    key: String,
    timeout: f64,
    stuck: bool,
    pub expired_count: Arc<AtomicU32>,
}

impl SleepTaskProtocol {
    pub fn new(key: &str, timeout: f64, stuck: bool) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            timeout,
            stuck,
            expired_count: Arc::new(AtomicU32::new(0)),
        })
    }
}

impl ProtocolFactory for SleepTaskProtocol {
    fn key(&self) -> &str {
        &self.key
    }
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Task
    }
    fn protocol_id(&self) -> &str {
        "sleep"
    }
    fn make_initiator(&self, _agent: &Arc<dyn Agent>) -> Option<InitiatorSide> {
        Some(InitiatorSide::Task(Arc::new(SleepTask {
            timeout: self.timeout,
            stuck: self.stuck,
            expired_count: self.expired_count.clone(),
        })))
    }
}

pub struct SleepTask {
    timeout: f64,
    stuck: bool,
    expired_count: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Task for SleepTask {
    fn timeout(&self) -> f64 {
        self.timeout
    }

    async fn initiate(
        &self,
        _ctx: &Context,
        _medium: &Arc<TaskMedium>,
        args: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        if self.stuck {
            std::future::pending::<()>().await;
        }
        Ok(args)
    }

    async fn expired(&self, _ctx: &Context, _medium: &Arc<TaskMedium>) -> anyhow::Result<()> {
        self.expired_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
