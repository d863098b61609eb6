//! In-process topic broker for standalone mode and tests.
//!
//! Models the parts of an AMQP broker the bus relies on: durable topic
//! exchanges, exclusive/auto-delete and named queues, wildcard bindings,
//! per-queue FIFO delivery and auto-acknowledged consumers. Each queue feeds
//! its consumer through an unbounded tokio mpsc channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    routing_matches, BrokerChannel, BrokerConnection, BusError, Connector, Message,
    MessageStream, QueueSpec, Result, TopicSpec,
};

/// Queue attached to a live consumer.
struct Consumer {
    channel_id: u64,
    tag: String,
    sender: mpsc::UnboundedSender<Message>,
}

struct QueueState {
    spec: QueueSpec,
    /// Connection that declared an exclusive queue.
    owner: Option<u64>,
    /// (exchange, pattern) pairs.
    bindings: Vec<(String, String)>,
    /// Messages routed here while nobody was consuming.
    pending: VecDeque<Message>,
    consumer: Option<Consumer>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, TopicSpec>,
    queues: HashMap<String, QueueState>,
}

impl BrokerState {
    /// Drop consumers on a closing channel; auto-delete queues go with them.
    fn cancel_consumers(&mut self, channel_id: u64) {
        self.queues.retain(|name, queue| {
            let owned = matches!(&queue.consumer, Some(c) if c.channel_id == channel_id);
            if !owned {
                return true;
            }
            if let Some(consumer) = queue.consumer.take() {
                debug!(queue = %name, consumer_tag = %consumer.tag, "Consumer cancelled");
            }
            if queue.spec.auto_delete {
                debug!(queue = %name, "Auto-delete queue removed");
                return false;
            }
            true
        });
    }

    /// Exclusive queues die with the connection that declared them.
    fn drop_exclusive(&mut self, connection_id: u64) {
        self.queues
            .retain(|_, queue| queue.owner != Some(connection_id));
    }
}

/// Shared in-process broker.
///
/// Cloning is cheap; every clone talks to the same exchanges and queues.
/// `ChannelBroker` is also a `Connector`, so it can stand in for RabbitMQ
/// anywhere the bus expects one.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<AtomicU64>,
    /// Number of upcoming connection attempts to refuse.
    refusals: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl ChannelBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self::default()
    }

    /// Refuse the next `n` connection attempts, as a broker that is still starting would.
    pub fn refuse_connections(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts seen, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Open a connection directly, bypassing refusal simulation.
    pub fn connection(&self) -> ChannelConnection {
        ChannelConnection {
            broker: self.clone(),
            id: self.next_id(),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Names of all queues currently declared.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of messages waiting in a queue without a consumer.
    pub fn pending(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for ChannelBroker {
    async fn connect(&self, address: &str) -> Result<Box<dyn BrokerConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BusError::Connection(format!(
                "{}: connection refused",
                address
            )));
        }
        Ok(Box::new(self.connection()))
    }
}

/// Connection to a `ChannelBroker`.
pub struct ChannelConnection {
    broker: ChannelBroker,
    id: u64,
    /// Close flags of channels opened here.
    channels: Mutex<Vec<(u64, Arc<AtomicBool>)>>,
    closed: AtomicBool,
}

impl ChannelConnection {
    fn channels(&self) -> MutexGuard<'_, Vec<(u64, Arc<AtomicBool>)>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels = std::mem::take(&mut *self.channels());
        let mut state = self.broker.state();
        for (channel_id, closed) in channels {
            if !closed.swap(true, Ordering::SeqCst) {
                state.cancel_consumers(channel_id);
            }
        }
        state.drop_exclusive(self.id);
        debug!(connection_id = self.id, "Channel connection closed");
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl BrokerConnection for ChannelConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let id = self.broker.next_id();
        let closed = Arc::new(AtomicBool::new(false));
        self.channels().push((id, closed.clone()));
        Ok(Box::new(ChannelChannel {
            broker: self.broker.clone(),
            id,
            connection_id: self.id,
            closed,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

/// Logical channel on a `ChannelConnection`.
pub struct ChannelChannel {
    broker: ChannelBroker,
    id: u64,
    connection_id: u64,
    closed: Arc<AtomicBool>,
}

impl ChannelChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.state().cancel_consumers(self.id);
        }
    }

    /// Exclusive queues are only usable from the declaring connection.
    fn check_access(&self, name: &str, queue: &QueueState) -> Result<()> {
        match queue.owner {
            Some(owner) if owner != self.connection_id => Err(BusError::Channel(format!(
                "queue '{}' is exclusive to another connection",
                name
            ))),
            _ => Ok(()),
        }
    }
}

impl Drop for ChannelChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl BrokerChannel for ChannelChannel {
    async fn declare_topic(&self, topic: &TopicSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        match state.exchanges.get(&topic.name) {
            Some(existing) if existing == topic => Ok(()),
            Some(existing) => Err(BusError::Declare(format!(
                "exchange '{}' exists with durable={} auto_delete={}, requested durable={} auto_delete={}",
                topic.name, existing.durable, existing.auto_delete, topic.durable, topic.auto_delete
            ))),
            None => {
                state.exchanges.insert(topic.name.clone(), topic.clone());
                debug!(exchange = %topic.name, "Exchange declared");
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String> {
        self.ensure_open()?;
        let name = if queue.name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            queue.name.clone()
        };

        let mut state = self.broker.state();
        if let Some(existing) = state.queues.get(&name) {
            self.check_access(&name, existing)?;
            if existing.spec.durable != queue.durable
                || existing.spec.exclusive != queue.exclusive
                || existing.spec.auto_delete != queue.auto_delete
            {
                return Err(BusError::Declare(format!(
                    "queue '{}' exists with different settings",
                    name
                )));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                spec: QueueSpec {
                    name: name.clone(),
                    ..queue.clone()
                },
                owner: queue.exclusive.then_some(self.connection_id),
                bindings: Vec::new(),
                pending: VecDeque::new(),
                consumer: None,
            },
        );
        debug!(queue = %name, exclusive = queue.exclusive, "Queue declared");
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, topic: &str, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains_key(topic) {
            return Err(BusError::Declare(format!("no exchange '{}'", topic)));
        }
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Declare(format!("no queue '{}'", queue)))?;
        let binding = (topic.to_string(), pattern.to_string());
        if !entry.bindings.contains(&binding) {
            entry.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains_key(topic) {
            return Err(BusError::Publish(format!("no exchange '{}'", topic)));
        }

        let mut routed = 0usize;
        for queue in state.queues.values_mut() {
            let bound = queue
                .bindings
                .iter()
                .any(|(ex, pattern)| ex == topic && routing_matches(pattern, &message.routing_key));
            if !bound {
                continue;
            }
            routed += 1;
            let undelivered = match &queue.consumer {
                Some(consumer) => consumer.sender.send(message.clone()).err().map(|e| e.0),
                None => Some(message.clone()),
            };
            if let Some(message) = undelivered {
                // Receiving stream is gone; forget the consumer.
                if let Some(consumer) = queue.consumer.take() {
                    debug!(consumer_tag = %consumer.tag, "Consumer stream dropped");
                }
                queue.pending.push_back(message);
            }
        }

        debug!(
            exchange = %topic,
            routing_key = %message.routing_key,
            queues = routed,
            "Published message"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<MessageStream> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Subscribe(format!("no queue '{}'", queue)))?;
        self.check_access(queue, entry)?;
        if entry.consumer.is_some() {
            return Err(BusError::Subscribe(format!(
                "queue '{}' already has a consumer",
                queue
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        // Backlog first, so delivery order matches publish order.
        for message in entry.pending.drain(..) {
            let _ = sender.send(message);
        }
        entry.consumer = Some(Consumer {
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            sender,
        });

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}
