//! Publish/subscribe façade over the ledger
//!
//! The bus is the only place topic routing happens. Every message goes to
//! the ledger first; subscribers and live observers are notified only after
//! the write committed, so nobody observes a torn batch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::{LiveObserver, ObserverEvent};
use crate::ledger::{Cursor, Ledger, LedgerError, QueryCriteria};
use crate::message::{Message, NewMessage, Topic, TokenUsage};

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    /// Caller bug: a required field was missing
    #[error("Invalid message{}: missing {}", position(.index), .missing.join(", "))]
    Validation {
        index: Option<usize>,
        missing: Vec<&'static str>,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

fn position(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" at batch position {i}"),
        None => String::new(),
    }
}

pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identifier of a registered live observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

enum Filter {
    All,
    Topics(Vec<Topic>),
}

impl Filter {
    fn matches(&self, topic: &Topic) -> bool {
        match self {
            Filter::All => true,
            Filter::Topics(topics) => topics.contains(topic),
        }
    }
}

struct SubscriberRecord {
    id: u64,
    filter: Filter,
    active: Arc<AtomicBool>,
    callback: Callback,
}

type Registry = Mutex<Vec<SubscriberRecord>>;

/// Handle returned by the `subscribe*` methods
///
/// Unsubscribing is idempotent and safe from inside the subscriber's own
/// callback. Dropping the handle keeps the subscription alive.
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().retain(|record| record.id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct ObserverRecord {
    id: ObserverId,
    observer: Box<dyn LiveObserver>,
}

/// Message bus for all clusters sharing one ledger
pub struct MessageBus {
    ledger: Arc<Ledger>,
    subscribers: Arc<Registry>,
    observers: Mutex<Vec<ObserverRecord>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Persist and fan out one message
    ///
    /// Returns `Ok(None)` without notifying anyone if the ledger is closed.
    pub fn publish(&self, message: NewMessage) -> Result<Option<Message>, BusError> {
        let missing = message.missing_fields();
        if !missing.is_empty() {
            return Err(BusError::Validation {
                index: None,
                missing,
            });
        }

        let Some(persisted) = self.ledger.append(message)? else {
            debug!("Ledger closed, dropping publish");
            return Ok(None);
        };

        self.dispatch(&persisted);
        Ok(Some(persisted))
    }

    /// Persist several messages atomically, then notify once per message
    /// in batch order
    pub fn batch_publish(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>, BusError> {
        for (index, message) in messages.iter().enumerate() {
            let missing = message.missing_fields();
            if !missing.is_empty() {
                return Err(BusError::Validation {
                    index: Some(index),
                    missing,
                });
            }
        }

        let persisted = self.ledger.batch_append(messages)?;
        for message in &persisted {
            self.dispatch(message);
        }
        Ok(persisted)
    }

    /// Subscribe to every message
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(Filter::All, Arc::new(callback))
    }

    /// Subscribe to one topic
    pub fn subscribe_topic<F>(&self, topic: impl Into<Topic>, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(Filter::Topics(vec![topic.into()]), Arc::new(callback))
    }

    /// Subscribe to several topics with one callback
    pub fn subscribe_topics<F>(&self, topics: Vec<Topic>, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(Filter::Topics(topics), Arc::new(callback))
    }

    fn register(&self, filter: Filter, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.subscribers.lock().push(SubscriberRecord {
            id,
            filter,
            active: Arc::clone(&active),
            callback,
        });
        Subscription {
            id,
            active,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Register a live observer
    pub fn add_observer(&self, observer: Box<dyn LiveObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push(ObserverRecord { id, observer });
        id
    }

    /// Remove a live observer; unknown ids are ignored
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|record| record.id != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    fn dispatch(&self, message: &Message) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let (global, topical): (Vec<_>, Vec<_>) = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|record| record.filter.matches(&message.topic))
                .map(|record| {
                    (
                        matches!(record.filter, Filter::All),
                        Arc::clone(&record.active),
                        Arc::clone(&record.callback),
                    )
                })
                .partition(|(is_global, _, _)| *is_global)
        };

        for (_, active, callback) in global.into_iter().chain(topical) {
            // An earlier callback may have unsubscribed this one
            if active.load(Ordering::SeqCst) {
                callback(message);
            }
        }

        self.notify_observers(message);
    }

    fn notify_observers(&self, message: &Message) {
        let mut observers = self.observers.lock();
        if observers.is_empty() {
            return;
        }

        let payload = match serde_json::to_string(&ObserverEvent::Message(message.clone())) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, message_id = message.id, "Failed to serialize observer event");
                return;
            }
        };

        observers.retain(|record| match record.observer.send(&payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(observer = record.id.0, error = %e, "Dropping live observer");
                false
            }
        });
    }

    pub fn query(&self, criteria: &QueryCriteria) -> Result<Vec<Message>, BusError> {
        Ok(self.ledger.query(criteria)?)
    }

    pub fn find_last(&self, criteria: &QueryCriteria) -> Result<Option<Message>, BusError> {
        Ok(self.ledger.find_last(criteria)?)
    }

    pub fn count(&self, criteria: &QueryCriteria) -> Result<usize, BusError> {
        Ok(self.ledger.count(criteria)?)
    }

    pub fn since(&self, cluster_id: &str, cursor: Cursor) -> Result<Vec<Message>, BusError> {
        Ok(self.ledger.since(cluster_id, cursor)?)
    }

    pub fn get_all(&self, cluster_id: &str) -> Result<Vec<Message>, BusError> {
        Ok(self.ledger.get_all(cluster_id)?)
    }

    pub fn tokens_by_role(
        &self,
        cluster_id: &str,
    ) -> Result<BTreeMap<String, TokenUsage>, BusError> {
        Ok(self.ledger.tokens_by_role(cluster_id)?)
    }

    /// Close the underlying ledger; later publishes return `None`
    pub fn close(&self) {
        self.ledger.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, ObserverChannel};
    use std::sync::atomic::AtomicUsize;

    fn bus() -> MessageBus {
        MessageBus::new(Arc::new(Ledger::in_memory().unwrap()))
    }

    struct Broken;

    impl LiveObserver for Broken {
        fn send(&self, _payload: &str) -> Result<(), ChannelError> {
            Err(ChannelError::Closed)
        }
    }

    #[test]
    fn test_publish_validates_required_fields() {
        let bus = bus();
        let err = bus
            .publish(NewMessage::new("c1", Topic::PlanReady, ""))
            .unwrap_err();
        assert!(matches!(err, BusError::Validation { ref missing, .. } if missing == &vec!["sender"]));
        assert!(bus.get_all("c1").unwrap().is_empty());

        let err = bus
            .batch_publish(vec![
                NewMessage::new("c1", Topic::PlanReady, "planner"),
                NewMessage::new("", Topic::PlanReady, "planner"),
            ])
            .unwrap_err();
        assert!(matches!(err, BusError::Validation { index: Some(1), .. }));
        assert!(bus.get_all("c1").unwrap().is_empty());
    }

    #[test]
    fn test_topic_routing() {
        let bus = bus();
        let all = Arc::new(AtomicUsize::new(0));
        let plans = Arc::new(AtomicUsize::new(0));
        let either = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&all);
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&plans);
        bus.subscribe_topic(Topic::PlanReady, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&either);
        bus.subscribe_topics(vec![Topic::PlanReady, Topic::IssueOpened], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(NewMessage::new("c1", Topic::IssueOpened, "system")).unwrap();
        bus.publish(NewMessage::new("c1", Topic::PlanReady, "planner")).unwrap();
        bus.publish(NewMessage::new("c1", Topic::ImplementationReady, "worker")).unwrap();

        assert_eq!(all.load(Ordering::SeqCst), 3);
        assert_eq!(plans.load(Ordering::SeqCst), 1);
        assert_eq!(either.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_inside_callback() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let counter = Arc::clone(&hits);
        let own = Arc::clone(&slot);
        let sub = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = own.lock().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        let others = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&others);
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(NewMessage::new("c1", Topic::IssueOpened, "system")).unwrap();
        bus.publish(NewMessage::new("c1", Topic::PlanReady, "planner")).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(others.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_batch_notifies_after_whole_batch_is_visible() {
        let bus = Arc::new(bus());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let reader = Arc::clone(&bus);
        let log = Arc::clone(&seen);
        bus.subscribe_topic(Topic::ValidationResult, move |message| {
            let visible = reader
                .count(&QueryCriteria::cluster("c1").topic(Topic::ValidationResult))
                .unwrap();
            log.lock().push((message.sender.clone(), visible));
        });

        bus.batch_publish(
            (1..=3)
                .map(|i| NewMessage::new("c1", Topic::ValidationResult, format!("validator-{i}")))
                .collect(),
        )
        .unwrap();

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("validator-1".to_string(), 3),
                ("validator-2".to_string(), 3),
                ("validator-3".to_string(), 3),
            ]
        );
    }

    #[test]
    fn test_closed_ledger_skips_notification() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.close();
        let result = bus.publish(NewMessage::new("c1", Topic::IssueOpened, "system"));
        assert!(matches!(result, Ok(None)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_observer_is_removed_alone() {
        let bus = bus();
        let (mut channel, sink) = ObserverChannel::new();
        bus.add_observer(Box::new(Broken));
        bus.add_observer(Box::new(sink));
        assert_eq!(bus.observer_count(), 2);

        let published = bus
            .publish(NewMessage::new("c1", Topic::IssueOpened, "system"))
            .unwrap()
            .unwrap();

        assert_eq!(bus.observer_count(), 1);
        let ObserverEvent::Message(received) = channel.recv_event().await.unwrap();
        assert_eq!(received, published);
        assert_eq!(bus.get_all("c1").unwrap().len(), 1);
    }

    #[test]
    fn test_remove_observer() {
        let bus = bus();
        let (_channel, sink) = ObserverChannel::new();
        let id = bus.add_observer(Box::new(sink));
        assert!(bus.remove_observer(id));
        assert!(!bus.remove_observer(id));
    }
}
