// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process implementation of the channel seams used by the test suite.
//!
//! It keeps just enough broker state to observe the delivery contract:
//! attribute checks on redeclaration, default/direct/fanout/topic routing,
//! per-channel delivery tags, prefetch accounting, manual acknowledgment and
//! requeue-with-redelivered on channel close.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Delivery, DeliveryStream, PublishProperties},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeHandle, ExchangeKind},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    props: PublishProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    channel: u64,
    tag: String,
    no_ack: bool,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct MemoryQueue {
    def: QueueDefinition,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    open: bool,
    next_tag: u64,
    prefetch: u16,
    global_prefetch: u16,
    unacked: BTreeMap<u64, Unacked>,
}

impl ChannelState {
    fn has_room_for(&self, slot: &ConsumerSlot) -> bool {
        if slot.no_ack {
            return true;
        }

        let per_consumer = slot.prefetch == 0
            || self
                .unacked
                .values()
                .filter(|u| u.consumer_tag == slot.tag)
                .count()
                < usize::from(slot.prefetch);
        let per_channel =
            self.global_prefetch == 0 || self.unacked.len() < usize::from(self.global_prefetch);

        per_consumer && per_channel
    }
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelState>,
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, ExchangeDefinition>,
    bindings: Vec<QueueBinding>,
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&mut self, id: u64) -> Result<&mut ChannelState, AmqpError> {
        match self.channels.get_mut(&id) {
            Some(ch) if ch.open => Ok(ch),
            _ => Err(AmqpError::ChannelError(format!("channel {id} is closed"))),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return Err(AmqpError::ChannelError(format!("no exchange '{exchange}'")));
        };

        let mut targets: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let routed = match def.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if routed && !targets.contains(&binding.queue_name) {
                targets.push(binding.queue_name.clone());
            }
        }

        Ok(targets)
    }

    /// Pushes ready messages to consumers with spare prefetch capacity,
    /// round-robin, until the queue is empty or every consumer is full.
    fn dispatch(&mut self, name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        loop {
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let picked = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|idx| {
                    let slot = &queue.consumers[*idx];
                    channels
                        .get(&slot.channel)
                        .is_some_and(|ch| ch.open && ch.has_room_for(slot))
                });
            let Some(idx) = picked else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            let slot = &queue.consumers[idx];
            let Some(ch) = channels.get_mut(&slot.channel) else {
                return;
            };
            ch.next_tag += 1;
            let tag = ch.next_tag;

            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                persistent: message.props.persistent,
                message_id: message.props.message_id.clone(),
                headers: message.props.headers.clone(),
                data: message.data.clone(),
            };

            if slot.tx.send(Ok(delivery)).is_err() {
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            if !slot.no_ack {
                ch.unacked.insert(
                    tag,
                    Unacked {
                        queue: name.to_owned(),
                        consumer_tag: slot.tag.clone(),
                        message,
                    },
                );
            }
            queue.next_consumer = idx + 1;
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue_name != name);
    }

    fn remove_consumers(&mut self, channel: u64, tag: Option<&str>) {
        let mut emptied = vec![];
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| c.channel != channel || tag.is_some_and(|t| t != c.tag));
            if before > 0 && queue.consumers.is_empty() && queue.def.delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }
    }

    fn close_channel(&mut self, id: u64) {
        let unacked = match self.channels.get_mut(&id) {
            Some(ch) if ch.open => {
                ch.open = false;
                std::mem::take(&mut ch.unacked)
            }
            _ => return,
        };

        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        self.remove_consumers(id, None);
        self.dispatch_all();
    }

    fn close_connection(&mut self, id: u64) {
        self.connections.insert(id, false);

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == id)
            .map(|(cid, _)| *cid)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
    }
}

/// Matches a topic routing key against a binding pattern.
fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => match_words(&pattern[1..], &key[1..]),
        _ => false,
    }
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn connect(&self) -> Arc<MemoryConnection> {
        let id = {
            let mut st = self.lock();
            let id = st.allocate_id();
            st.connections.insert(id, true);
            id
        };
        Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        })
    }

    /// Messages waiting in `queue` that no consumer holds.
    pub(crate) fn ready_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Messages from `queue` delivered but not yet acknowledged.
    pub(crate) fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub(crate) fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }
}

pub(crate) struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryConnection {
    pub(crate) async fn open_channel(&self) -> Arc<dyn AmqpChannel> {
        match self.create_channel().await {
            Ok(channel) => channel,
            Err(err) => panic!("memory connection refused a channel: {err}"),
        }
    }
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut st = self.broker.lock();
        if !st.connections.get(&self.id).copied().unwrap_or(false) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = st.allocate_id();
        st.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                next_tag: 0,
                prefetch: 0,
                global_prefetch: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().close_connection(self.id);
        Ok(())
    }
}

pub(crate) struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .is_some_and(|ch| ch.open)
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        let mut st = self.broker.lock();
        let connection = st.open_channel(self.id)?.connection;

        let name = if def.is_anonymous() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            def.name().to_owned()
        };

        if let Some(existing) = st.queues.get(&name) {
            let locked = existing.owner.is_some_and(|owner| owner != connection);
            let same = existing.def.durable == def.durable
                && existing.def.exclusive == def.exclusive
                && existing.def.delete == def.delete;
            if locked || !same {
                return Err(AmqpError::DeclareQueueError(name));
            }
            return Ok(QueueHandle {
                name,
                message_count: existing.ready.len() as u32,
                consumer_count: existing.consumers.len() as u32,
            });
        }

        st.queues.insert(
            name.clone(),
            MemoryQueue {
                def: QueueDefinition {
                    name: name.clone(),
                    ..def.clone()
                },
                owner: def.exclusive.then_some(connection),
                ready: VecDeque::new(),
                consumers: vec![],
                next_consumer: 0,
            },
        );

        Ok(QueueHandle {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn exchange_declare(
        &self,
        def: &ExchangeDefinition,
    ) -> Result<ExchangeHandle, AmqpError> {
        let mut st = self.broker.lock();
        st.open_channel(self.id)?;

        if def.name().is_empty() {
            return Err(AmqpError::DeclareExchangeError(String::new()));
        }

        if let Some(existing) = st.exchanges.get(def.name()) {
            if existing != def {
                return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
            }
        } else {
            st.exchanges.insert(def.name().to_owned(), def.clone());
        }

        Ok(ExchangeHandle {
            name: def.name().to_owned(),
            kind: def.kind,
        })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        st.open_channel(self.id)?;

        if !st.queues.contains_key(binding.queue_name())
            || !st.exchanges.contains_key(binding.exchange_name())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        if !st.bindings.contains(binding) {
            st.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        st.open_channel(self.id)?;

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            props: props.clone(),
            data: payload.to_vec(),
            redelivered: false,
        };

        for name in st.route(exchange, routing_key)? {
            if let Some(queue) = st.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
            }
            st.dispatch(&name);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        let ch = st.open_channel(self.id)?;
        if global {
            ch.global_prefetch = prefetch_count;
        } else {
            ch.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut st = self.broker.lock();
        let ch = st.open_channel(self.id)?;
        let (connection, prefetch) = (ch.connection, ch.prefetch);

        let duplicate_tag = st
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .any(|c| c.channel == self.id && c.tag == consumer_tag);

        let Some(target) = st.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };
        if duplicate_tag || target.owner.is_some_and(|owner| owner != connection) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        target.consumers.push(ConsumerSlot {
            channel: self.id,
            tag: consumer_tag.to_owned(),
            no_ack,
            prefetch,
            tx,
        });
        st.dispatch(queue);

        let deliveries: DeliveryStream = Box::pin(futures_util::stream::unfold(
            rx,
            |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
        ));
        Ok(deliveries)
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        let ch = st.open_channel(self.id)?;

        if !ch.unacked.contains_key(&delivery_tag) {
            return Err(AmqpError::AckMessageError(delivery_tag));
        }

        if multiple {
            ch.unacked.retain(|tag, _| *tag > delivery_tag);
        } else {
            ch.unacked.remove(&delivery_tag);
        }

        st.dispatch_all();
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        st.open_channel(self.id)?;
        st.remove_consumers(self.id, Some(consumer_tag));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::with_channel,
        dispatcher::{ConsumerDefinition, RabbitMQDispatcher, Subscription, SubscriptionState},
        handler::{ConsumerHandler, ConsumerMessage},
        publisher::{PublishMessage, Publisher, RabbitMQPublisher},
        topology::{AmqpTopology, Topology},
        workload::TaskWorker,
    };
    use opentelemetry::Context;
    use std::time::Duration;
    use tokio::{
        sync::{mpsc::UnboundedReceiver, Semaphore},
        time::Instant,
    };

    #[derive(Debug)]
    struct Seen {
        body: String,
        redelivered: bool,
        persistent: bool,
    }

    /// Records deliveries. Bodies equal to `boom` make it panic.
    struct Probe {
        tx: mpsc::UnboundedSender<Seen>,
        ack: bool,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl ConsumerHandler for Probe {
        async fn exec(&self, _: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
            if msg.body() == "boom" {
                panic!("boom");
            }

            let seen = Seen {
                body: msg.body().into_owned(),
                redelivered: msg.redelivered(),
                persistent: msg.delivery().persistent,
            };

            match &self.gate {
                Some(gate) => {
                    let _ = self.tx.send(seen);
                    let _permit = gate
                        .acquire()
                        .await
                        .map_err(|err| AmqpError::InternalError(err.to_string()))?;
                    if self.ack {
                        msg.ack().await?;
                    }
                }
                None => {
                    if self.ack {
                        msg.ack().await?;
                    }
                    let _ = self.tx.send(seen);
                }
            }
            Ok(())
        }
    }

    fn probe(ack: bool) -> (Arc<Probe>, UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Probe {
                tx,
                ack,
                gate: None,
            }),
            rx,
        )
    }

    async fn declare(channel: &Arc<dyn AmqpChannel>, def: QueueDefinition) -> String {
        AmqpTopology::new(channel.clone())
            .declare_queue(&def)
            .await
            .unwrap()
            .name
    }

    async fn publish(channel: &Arc<dyn AmqpChannel>, msg: PublishMessage) {
        RabbitMQPublisher::new(channel.clone())
            .publish(&Context::new(), &msg)
            .await
            .unwrap();
    }

    async fn subscribe(
        channel: &Arc<dyn AmqpChannel>,
        def: ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Subscription {
        RabbitMQDispatcher::new(channel.clone())
            .consume(def, handler)
            .await
            .unwrap()
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("kern.*", "kern.critical"));
        assert!(!topic_matches("kern.*", "kern.critical.disk"));
        assert!(topic_matches("#.critical", "kern.disk.critical"));
        assert!(topic_matches("auth.#", "auth"));
        assert!(!topic_matches("auth", "cron"));
    }

    #[tokio::test]
    async fn hello_world_round_trip_with_auto_ack() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await;
        let queue = declare(&channel, QueueDefinition::new("hello")).await;

        let (handler, mut rx) = probe(false);
        let _sub = subscribe(&channel, ConsumerDefinition::new(&queue).auto_ack(), handler).await;
        publish(&channel, PublishMessage::to_queue("hello", "Hello World!")).await;

        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.body, "Hello World!");
        assert!(!seen.redelivered);
        assert_eq!(broker.ready_count("hello"), Some(0));
        assert_eq!(broker.unacked_count("hello"), 0);
    }

    #[tokio::test]
    async fn acknowledged_messages_are_removed_from_the_queue() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let channel = conn.open_channel().await;
        declare(&channel, QueueDefinition::new("task_queue").durable()).await;

        let (handler, mut rx) = probe(true);
        let sub = subscribe(&channel, ConsumerDefinition::new("task_queue"), handler).await;
        publish(&channel, PublishMessage::to_queue("task_queue", "task")).await;

        assert_eq!(rx.recv().await.unwrap().body, "task");
        sub.cancel().await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(broker.ready_count("task_queue"), Some(0));
        assert_eq!(broker.unacked_count("task_queue"), 0);
    }

    #[tokio::test]
    async fn unacknowledged_messages_are_redelivered_after_the_channel_closes() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let publisher = conn.open_channel().await;
        declare(&publisher, QueueDefinition::new("task_queue").durable()).await;

        let first = conn.open_channel().await;
        let (forgetful, mut first_rx) = probe(false);
        let sub = subscribe(&first, ConsumerDefinition::new("task_queue"), forgetful).await;
        publish(&publisher, PublishMessage::to_queue("task_queue", "task").persistent()).await;

        let seen = first_rx.recv().await.unwrap();
        assert!(!seen.redelivered);
        assert_eq!(broker.unacked_count("task_queue"), 1);

        first.close().await.unwrap();
        sub.wait().await;
        assert_eq!(sub.state(), SubscriptionState::Terminal);
        assert_eq!(broker.ready_count("task_queue"), Some(1));

        let second = conn.open_channel().await;
        let (handler, mut second_rx) = probe(true);
        let _sub = subscribe(&second, ConsumerDefinition::new("task_queue"), handler).await;

        let seen = second_rx.recv().await.unwrap();
        assert_eq!(seen.body, "task");
        assert!(seen.redelivered);
        assert!(seen.persistent);
    }

    #[tokio::test]
    async fn fanout_copies_reach_every_bound_queue_only() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await;

        let logs = ExchangeDefinition::new("logs").fanout();
        let audit = QueueDefinition::new("audit");
        let handles = AmqpTopology::new(channel.clone())
            .exchange(&logs)
            .queue(&QueueDefinition::anonymous())
            .queue(&QueueDefinition::anonymous())
            .queue(&audit)
            .install()
            .await
            .unwrap();
        let (left, right) = (handles[0].name.clone(), handles[1].name.clone());
        assert_ne!(left, right);

        let topology = AmqpTopology::new(channel.clone());
        for queue in [&left, &right] {
            let binding = QueueBinding::new(queue).exchange("logs");
            topology.bind_queue(&binding).await.unwrap();
            topology.bind_queue(&binding).await.unwrap();
        }

        let (forgetful, mut left_rx) = probe(false);
        let (echo, mut right_rx) = probe(false);
        let _left = subscribe(&channel, ConsumerDefinition::new(&left), forgetful).await;
        let _right = subscribe(&channel, ConsumerDefinition::new(&right).auto_ack(), echo).await;

        for line in ["info: one", "warning: two"] {
            publish(&channel, PublishMessage::new("logs", "ignored", line)).await;
        }

        for rx in [&mut left_rx, &mut right_rx] {
            assert_eq!(rx.recv().await.unwrap().body, "info: one");
            assert_eq!(rx.recv().await.unwrap().body, "warning: two");
        }
        assert_eq!(broker.unacked_count(&left), 2);
        assert_eq!(broker.unacked_count(&right), 0);
        assert_eq!(broker.ready_count("audit"), Some(0));
    }

    #[tokio::test]
    async fn redeclaring_with_other_attributes_is_a_topology_error() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await;
        let topology = AmqpTopology::new(channel.clone());

        let durable = QueueDefinition::new("task_queue").durable();
        topology.declare_queue(&durable).await.unwrap();
        publish(&channel, PublishMessage::to_queue("task_queue", "kept")).await;

        let again = topology.declare_queue(&durable).await.unwrap();
        assert_eq!(again.message_count, 1);

        let err = topology
            .declare_queue(&QueueDefinition::new("task_queue"))
            .await
            .unwrap_err();
        assert!(err.is_topology_error());

        let err = topology
            .declare_exchange(&ExchangeDefinition::new("logs").fanout())
            .await
            .and(
                topology
                    .declare_exchange(&ExchangeDefinition::new("logs").direct())
                    .await,
            )
            .unwrap_err();
        assert_eq!(err, AmqpError::DeclareExchangeError("logs".to_owned()));
    }

    #[tokio::test]
    async fn prefetch_of_one_holds_back_the_next_message_until_the_ack() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await;
        declare(&channel, QueueDefinition::new("task_queue").durable()).await;

        let dispatcher = RabbitMQDispatcher::new(channel.clone());
        dispatcher.set_prefetch(1, false).await.unwrap();

        let gate = Arc::new(Semaphore::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Probe {
            tx,
            ack: true,
            gate: Some(gate.clone()),
        });
        let _sub = dispatcher
            .consume(ConsumerDefinition::new("task_queue"), handler)
            .await
            .unwrap();

        for body in ["first", "second"] {
            publish(&channel, PublishMessage::to_queue("task_queue", body).persistent()).await;
        }

        assert_eq!(rx.recv().await.unwrap().body, "first");
        assert_eq!(broker.unacked_count("task_queue"), 1);
        assert_eq!(broker.ready_count("task_queue"), Some(1));

        gate.add_permits(1);
        assert_eq!(rx.recv().await.unwrap().body, "second");
        assert_eq!(broker.ready_count("task_queue"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn work_queue_task_takes_one_unit_per_dot_before_the_next_delivery() {
        struct Timed {
            worker: TaskWorker,
            tx: mpsc::UnboundedSender<(String, bool, Instant)>,
        }

        #[async_trait]
        impl ConsumerHandler for Timed {
            async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
                self.worker.exec(ctx, msg).await?;
                let _ = self
                    .tx
                    .send((msg.body().into_owned(), msg.delivery().persistent, Instant::now()));
                Ok(())
            }
        }

        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await;
        declare(&channel, QueueDefinition::new("task_queue").durable()).await;

        let dispatcher = RabbitMQDispatcher::new(channel.clone());
        dispatcher.set_prefetch(1, false).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Timed {
            worker: TaskWorker::new(Duration::from_secs(1)),
            tx,
        });
        let _sub = dispatcher
            .consume(ConsumerDefinition::new("task_queue"), handler)
            .await
            .unwrap();

        let start = Instant::now();
        publish(&channel, PublishMessage::to_queue("task_queue", "a.b.c").persistent()).await;
        publish(&channel, PublishMessage::to_queue("task_queue", "next").persistent()).await;
        assert_eq!(broker.ready_count("task_queue"), Some(1));

        let (body, persistent, done) = rx.recv().await.unwrap();
        assert_eq!(body, "a.b.c");
        assert!(persistent);
        assert!(done - start >= Duration::from_secs(2));

        let (body, _, next_done) = rx.recv().await.unwrap();
        assert_eq!(body, "next");
        assert!(next_done >= done);
        assert_eq!(broker.unacked_count("task_queue"), 0);
        assert_eq!(broker.ready_count("task_queue"), Some(0));
    }

    #[tokio::test]
    async fn a_panicking_handler_does_not_stop_the_subscription() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await;
        declare(&channel, QueueDefinition::new("task_queue")).await;

        let (handler, mut rx) = probe(true);
        let sub = subscribe(&channel, ConsumerDefinition::new("task_queue"), handler).await;
        for body in ["boom", "fine"] {
            publish(&channel, PublishMessage::to_queue("task_queue", body)).await;
        }

        assert_eq!(rx.recv().await.unwrap().body, "fine");
        assert_eq!(sub.state(), SubscriptionState::Delivering);
        assert_eq!(broker.unacked_count("task_queue"), 1);
    }

    #[tokio::test]
    async fn a_single_consumer_sees_messages_in_publish_order() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await;
        declare(&channel, QueueDefinition::new("hello")).await;

        for n in 1..=5 {
            publish(&channel, PublishMessage::to_queue("hello", n.to_string())).await;
        }

        let (handler, mut rx) = probe(false);
        let _sub = subscribe(&channel, ConsumerDefinition::new("hello").auto_ack(), handler).await;

        for n in 1..=5 {
            assert_eq!(rx.recv().await.unwrap().body, n.to_string());
        }
    }

    #[tokio::test]
    async fn auto_delete_and_exclusive_queues_are_cleaned_up() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let channel = conn.open_channel().await;

        let temporary = declare(&channel, QueueDefinition::new("tmp").delete()).await;
        let (handler, _rx) = probe(false);
        let sub = subscribe(&channel, ConsumerDefinition::new(&temporary), handler).await;
        assert!(broker.has_queue("tmp"));
        sub.cancel().await.unwrap();
        assert!(!broker.has_queue("tmp"));

        let anonymous = declare(&channel, QueueDefinition::anonymous()).await;
        assert!(anonymous.starts_with("amq.gen-"));

        let other = broker.connect().open_channel().await;
        let (handler, _rx) = probe(false);
        let stolen = RabbitMQDispatcher::new(other)
            .consume(ConsumerDefinition::new(&anonymous), handler)
            .await;
        assert!(matches!(stolen, Err(AmqpError::BindingConsumerError(_))));

        conn.close().await.unwrap();
        assert!(!broker.has_queue(&anonymous));
    }

    #[tokio::test]
    async fn unknown_delivery_tags_are_rejected() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await;

        assert_eq!(
            channel.basic_ack(99, false).await,
            Err(AmqpError::AckMessageError(99))
        );
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn with_channel_releases_the_connection() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let shared: Arc<dyn AmqpConnection> = conn.clone();

        let name = with_channel(shared, |channel| async move {
            AmqpTopology::new(channel)
                .declare_queue(&QueueDefinition::new("hello"))
                .await
                .map(|handle| handle.name)
        })
        .await
        .unwrap();

        assert_eq!(name, "hello");
        assert!(!conn.is_open());
        assert!(conn.create_channel().await.is_err());
    }
}
