use crate::{Binding, Channel, ConnectionFactory, Error, MessageSink};
use models::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// The in-memory emulation broker.
///
/// Each connection owns an unbounded queue drained by a single pump task,
/// so messages reach a sink in publish order (FIFO per connection, and
/// therefore per session).
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_conn: u64,
    connections: HashMap<u64, ConnEntry>,
}

struct ConnEntry {
    tx: mpsc::UnboundedSender<Message>,
    bindings: Vec<Arc<EmuBinding>>,
}

struct EmuBinding {
    key: String,
    shard: String,
    revoked: AtomicBool,
}

impl Binding for EmuBinding {
    fn key(&self) -> &str {
        &self.key
    }
    fn shard(&self) -> &str {
        &self.shard
    }
    fn revoke(&self) {
        self.revoked.store(true, Ordering::Relaxed);
    }
    fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Relaxed)
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&self, owner: Weak<dyn MessageSink>) -> Arc<EmuChannel> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(owner) = owner.upgrade() else { break };
                if !owner.on_message(message).await {
                    tracing::debug!("sink did not consume a delivered message");
                }
            }
        });

        let mut state = lock(&self.inner.state);
        let conn_id = state.next_conn;
        state.next_conn += 1;
        state.connections.insert(
            conn_id,
            ConnEntry {
                tx,
                bindings: Vec::new(),
            },
        );

        Arc::new(EmuChannel {
            broker: self.inner.clone(),
            conn_id,
        })
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for Broker {
    async fn get_connection(&self, owner: Weak<dyn MessageSink>) -> Result<Arc<dyn Channel>, Error> {
        Ok(self.connect(owner))
    }
}

pub struct EmuChannel {
    broker: Arc<Inner>,
    conn_id: u64,
}

#[async_trait::async_trait]
impl Channel for EmuChannel {
    async fn publish(&self, key: &str, shard: &str, message: Message) -> Result<(), Error> {
        let queues: Vec<mpsc::UnboundedSender<Message>> = {
            let mut state = lock(&self.broker.state);
            state
                .connections
                .values_mut()
                .filter_map(|conn| {
                    // Drop revoked bindings as they are encountered.
                    conn.bindings.retain(|binding| !binding.is_revoked());
                    conn.bindings
                        .iter()
                        .any(|binding| binding.key == key && binding.shard == shard)
                        .then(|| conn.tx.clone())
                })
                .collect()
        };

        tracing::trace!(key, shard, matches = queues.len(), "publish");
        for tx in queues {
            // A closed queue means the receiving connection is gone.
            let _ = tx.send(message.clone());
        }
        Ok(())
    }

    fn personal_binding(&self, key: &str, shard: &str) -> Result<Arc<dyn Binding>, Error> {
        let mut state = lock(&self.broker.state);
        let conn = state
            .connections
            .get_mut(&self.conn_id)
            .ok_or(Error::Disconnected)?;
        let binding = Arc::new(EmuBinding {
            key: key.to_string(),
            shard: shard.to_string(),
            revoked: AtomicBool::new(false),
        });
        conn.bindings.push(binding.clone());
        Ok(binding)
    }

    fn get_bindings(&self, shard: &str) -> Vec<Arc<dyn Binding>> {
        let state = lock(&self.broker.state);
        let Some(conn) = state.connections.get(&self.conn_id) else {
            return Vec::new();
        };
        conn.bindings
            .iter()
            .filter(|binding| binding.shard == shard && !binding.is_revoked())
            .map(|binding| binding.clone() as Arc<dyn Binding>)
            .collect()
    }

    fn disconnect(&self) {
        // Dropping the sender ends the pump after the queue drains.
        lock(&self.broker.state).connections.remove(&self.conn_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{MessageClass, ProtocolType, Timestamp};
    use std::time::Duration;

    struct Collector(mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
    impl MessageSink for Collector {
        async fn on_message(&self, message: Message) -> bool {
            self.0.send(message).is_ok()
        }
    }

    fn message(n: i64) -> Message {
        Message::new(
            ProtocolType::Request,
            "echo",
            MessageClass::Request,
            Timestamp::from_epoch_secs(1e12),
            serde_json::json!(n),
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery within a second")
            .expect("pump alive")
    }

    #[tokio::test]
    async fn publish_routes_to_matching_bindings_in_order() {
        let broker = Broker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn MessageSink> = Arc::new(Collector(tx));

        let channel = broker
            .get_connection(Arc::downgrade(&sink))
            .await
            .unwrap();
        channel.personal_binding("w1", "s").unwrap();

        channel.publish("w1", "s", message(1)).await.unwrap();
        channel.publish("w1", "other-shard", message(2)).await.unwrap();
        channel.publish("w2", "s", message(3)).await.unwrap();
        channel.publish("w1", "s", message(4)).await.unwrap();

        assert_eq!(recv(&mut rx).await.payload, serde_json::json!(1));
        assert_eq!(recv(&mut rx).await.payload, serde_json::json!(4));
    }

    #[tokio::test]
    async fn revoked_bindings_stop_matching_and_revoke_is_idempotent() {
        let broker = Broker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn MessageSink> = Arc::new(Collector(tx));

        let channel = broker
            .get_connection(Arc::downgrade(&sink))
            .await
            .unwrap();
        let binding = channel.personal_binding("buy", "s").unwrap();
        assert_eq!(channel.get_bindings("s").len(), 1);

        binding.revoke();
        binding.revoke();
        assert!(binding.is_revoked());
        assert!(channel.get_bindings("s").is_empty());

        channel.publish("buy", "s", message(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_the_connection() {
        let broker = Broker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn MessageSink> = Arc::new(Collector(tx));

        let channel = broker
            .get_connection(Arc::downgrade(&sink))
            .await
            .unwrap();
        channel.disconnect();
        assert!(matches!(
            channel.personal_binding("w1", "s"),
            Err(Error::Disconnected)
        ));
    }
}
