//! The event bus
//!
//! Publishing only touches the message channel, so producers never wait for observers. Delivery
//! holds the registry lock while it calls the observers of a message: a call to `unsubscribe`
//! that returned can't be followed by another delivery to the removed observer.
//!
//! Handlers run on the delivering thread with the registry locked. When they subscribe or
//! unsubscribe, the change to the registry is queued and applied right after the current message
//! was delivered. An observer a handler unsubscribed is skipped for the rest of that message
//! already.

use message::{Handler, Message, ObserverId, Payload};
use registry::ObserverRegistry;
use task::{StopFlag, Task};

use crossbeam_channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard, RwLock};

use std::cell::Cell;
use std::error::Error;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// How long the delivery thread sleeps on an empty queue before looking at its stop flag.
const DELIVERY_WAKEUP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Messages that may wait for delivery before `publish` refuses new ones
    pub queue_capacity: usize,
    /// Registry lock wait after which a warning is logged
    pub registry_wait_warn: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            queue_capacity: 1024,
            registry_wait_warn: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Topics must be non-empty
    EmptyTopic,
    /// The queue is at capacity. The message was dropped.
    QueueFull { topic: String, capacity: usize },
    /// The bus was closed
    Stopped,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BusError::EmptyTopic => f.write_str("empty topic"),
            BusError::QueueFull { ref topic, capacity } => {
                write!(f, "message queue full ({} messages), dropped message for {}", capacity,
                    topic)
            }
            BusError::Stopped => f.write_str("event bus closed"),
        }
    }
}

impl Error for BusError {}

/// Registry changes made by a handler during delivery.
enum Deferred {
    Subscribe(String, ObserverId, Handler),
    Unsubscribe(ObserverId),
    UnsubscribeTopic(String, ObserverId),
}

impl Deferred {
    /// Whether this change takes `observer` off `topic`.
    fn removes(&self, topic: &str, observer: ObserverId) -> bool {
        match *self {
            Deferred::Subscribe(..) => false,
            Deferred::Unsubscribe(id) => id == observer,
            Deferred::UnsubscribeTopic(ref t, id) => id == observer && t == topic,
        }
    }
}

struct Shared {
    config: BusConfig,
    /// `None` once the bus is closed. Dropping the sender ends the delivery thread after it
    /// delivered what's left.
    sender: RwLock<Option<Sender<Message>>>,
    receiver: Receiver<Message>,
    registry: Mutex<ObserverRegistry>,
    deferred: Mutex<Vec<Deferred>>,
}

thread_local! {
    /// Address of the bus this thread is delivering a message of, 0 if none.
    static DELIVERING: Cell<usize> = Cell::new(0);
}

/// Marks the current thread as delivering for a bus until dropped.
struct DeliveryGuard(usize);

impl DeliveryGuard {
    fn enter(bus: usize) -> DeliveryGuard {
        DeliveryGuard(DELIVERING.with(|d| d.replace(bus)))
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        let previous = self.0;
        DELIVERING.with(|d| d.set(previous));
    }
}

/// Shared handle to an event bus. Clones refer to the same bus.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        // a zero capacity channel would only accept messages while the receiver waits
        let (sender, receiver) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        EventBus {
            shared: Arc::new(Shared {
                config: config,
                sender: RwLock::new(Some(sender)),
                receiver: receiver,
                registry: Mutex::new(ObserverRegistry::new()),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    fn id(&self) -> usize {
        &*self.shared as *const Shared as usize
    }

    fn delivering(&self) -> bool {
        let id = self.id();
        DELIVERING.with(|d| d.get() == id)
    }

    /// Locks the registry. Waiting longer than `registry_wait_warn` is logged, then the wait
    /// goes on.
    fn registry(&self) -> MutexGuard<ObserverRegistry> {
        let wait = self.shared.config.registry_wait_warn;
        match self.shared.registry.try_lock_for(wait) {
            Some(guard) => guard,
            None => {
                warn!("observer registry locked for more than {:?}, still waiting", wait);
                self.shared.registry.lock()
            }
        }
    }

    fn defer(&self, change: Deferred) {
        self.shared.deferred.lock().push(change);
    }

    /// Subscribes `observer` to `topic`. Subscribing again to the same topic changes nothing.
    pub fn subscribe<F>(&self, topic: &str, observer: ObserverId, handler: F)
        -> Result<(), BusError>
    where F: Fn(&Message) + Send + Sync + 'static {
        if topic.is_empty() {
            warn!("ignoring subscription of {:?} to an empty topic", observer);
            return Err(BusError::EmptyTopic);
        }

        let handler: Handler = Arc::new(handler);
        if self.delivering() {
            self.defer(Deferred::Subscribe(topic.to_owned(), observer, handler));
        } else {
            self.apply(Deferred::Subscribe(topic.to_owned(), observer, handler));
        }
        Ok(())
    }

    /// Removes `observer` from every topic. No handler of it runs once this returned.
    pub fn unsubscribe(&self, observer: ObserverId) {
        if self.delivering() {
            self.defer(Deferred::Unsubscribe(observer));
        } else {
            self.apply(Deferred::Unsubscribe(observer));
        }
    }

    /// Removes `observer` from `topic`, leaving its other subscriptions alone.
    pub fn unsubscribe_topic(&self, topic: &str, observer: ObserverId) {
        if self.delivering() {
            self.defer(Deferred::UnsubscribeTopic(topic.to_owned(), observer));
        } else {
            self.apply(Deferred::UnsubscribeTopic(topic.to_owned(), observer));
        }
    }

    fn apply(&self, change: Deferred) {
        let mut registry = self.registry();
        match change {
            Deferred::Subscribe(topic, observer, handler) => {
                if !registry.subscribe(&topic, observer, handler) {
                    debug!("{:?} already subscribed to {}", observer, topic);
                }
            }
            Deferred::Unsubscribe(observer) => {
                let n = registry.unsubscribe(observer);
                trace!("{:?} unsubscribed from {} topics", observer, n);
            }
            Deferred::UnsubscribeTopic(topic, observer) => {
                registry.unsubscribe_topic(&topic, observer);
            }
        }
    }

    fn apply_deferred(&self) {
        let changes = {
            let mut deferred = self.shared.deferred.lock();
            if deferred.is_empty() {
                return;
            }
            deferred.drain(..).collect::<Vec<_>>()
        };
        for change in changes {
            self.apply(change);
        }
    }

    /// Whether a handler of the message being delivered unsubscribed `observer` from `topic`.
    fn removed_during_delivery(&self, topic: &str, observer: ObserverId) -> bool {
        self.shared.deferred.lock().iter().any(|change| change.removes(topic, observer))
    }

    /// Number of observers of `topic`.
    ///
    /// The registry is busy while a message is delivered, handlers get 0.
    pub fn observer_count(&self, topic: &str) -> usize {
        if self.delivering() {
            warn!("observer_count called during delivery");
            return 0;
        }
        self.registry().observer_count(topic)
    }

    /// Topics `observer` is subscribed to. Empty when called by a handler.
    pub fn topics_of(&self, observer: ObserverId) -> Vec<String> {
        if self.delivering() {
            warn!("topics_of called during delivery");
            return Vec::new();
        }
        self.registry().topics_of(observer)
    }

    /// Queues a message for the observers of `topic`. Never blocks on delivery.
    pub fn publish(&self, topic: &str, source: ObserverId, payload: Payload)
        -> Result<(), BusError> {
        self.enqueue(Message::new(topic, source, payload))
    }

    /// Queues a message that's delivered to `handler` alone, bypassing the topic's observers.
    pub fn publish_with_handler<F>(&self, topic: &str, source: ObserverId, payload: Payload,
        handler: F) -> Result<(), BusError>
    where F: Fn(&Message) + Send + Sync + 'static {
        let mut msg = Message::new(topic, source, payload);
        msg.handler = Some(Arc::new(handler));
        self.enqueue(msg)
    }

    fn enqueue(&self, msg: Message) -> Result<(), BusError> {
        if msg.topic.is_empty() {
            warn!("dropping message without topic");
            return Err(BusError::EmptyTopic);
        }

        let sender = self.shared.sender.read();
        let sender = match *sender {
            Some(ref sender) => sender,
            None => return Err(BusError::Stopped),
        };
        match sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                let capacity = self.shared.config.queue_capacity;
                warn!("message queue full, dropping message for {}", msg.topic);
                Err(BusError::QueueFull { topic: msg.topic, capacity: capacity })
            }
            // the receiver lives as long as the sender, both are in `Shared`
            Err(TrySendError::Disconnected(_)) => Err(BusError::Stopped),
        }
    }

    /// Number of messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Delivers everything queued right now on the calling thread. Returns the number of
    /// messages delivered.
    pub fn pump(&self) -> usize {
        if self.delivering() {
            warn!("pump called during delivery, ignored");
            return 0;
        }
        let mut delivered = 0;
        while let Ok(msg) = self.shared.receiver.try_recv() {
            self.deliver(msg);
            delivered += 1;
        }
        delivered
    }

    fn deliver(&self, msg: Message) {
        {
            let _guard = DeliveryGuard::enter(self.id());
            match msg.handler {
                Some(ref handler) => invoke(handler, &msg, None),
                None => {
                    let registry = self.registry();
                    let subscriptions = registry.subscriptions(&msg.topic);
                    if subscriptions.is_empty() {
                        trace!("no observers for {}", msg.topic);
                    }
                    for sub in subscriptions {
                        if self.removed_during_delivery(&msg.topic, sub.observer) {
                            trace!("{:?} was unsubscribed, skipped", sub.observer);
                            continue;
                        }
                        invoke(&sub.handler, &msg, Some(sub.observer));
                    }
                    // let a waiting `subscribe`/`unsubscribe` in before the next message
                    MutexGuard::unlock_fair(registry);
                }
            }
        }
        self.apply_deferred();
    }

    /// Starts the delivery thread. It ends when stopped or once the bus is closed and drained.
    pub fn start(&self) -> io::Result<Task> {
        let bus = self.clone();
        Task::spawn("event-bus", move |stop| bus.run(&stop))
    }

    fn run(&self, stop: &StopFlag) {
        while !stop.is_set() {
            match self.shared.receiver.recv_timeout(DELIVERY_WAKEUP) {
                Ok(msg) => self.deliver(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("event bus closed and drained");
                    return;
                }
            }
        }
    }

    /// Refuses further messages and drops every subscription. Queued messages are still
    /// delivered (to nobody but their one-shot handlers).
    pub fn close(&self) {
        self.shared.sender.write().take();
        if self.delivering() {
            warn!("close called during delivery, observers are kept");
        } else {
            self.registry().clear();
        }
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.shared.sender.read().is_none()
    }
}

/// Calls one handler. A panicking handler is logged and doesn't keep the message from the rest.
fn invoke(handler: &Handler, msg: &Message, observer: Option<ObserverId>) {
    if panic::catch_unwind(AssertUnwindSafe(|| (**handler)(msg))).is_err() {
        match observer {
            Some(id) => error!("{:?} panicked while handling a {} message", id, msg.topic),
            None => error!("one-shot handler for a {} message panicked", msg.topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message::{CoreInfo, EVENT_CORE_STARTED};

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn bus() -> EventBus {
        EventBus::new(BusConfig::default())
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = bus();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        bus.subscribe("numbers", ObserverId::unique(), move |msg| {
            tx.lock().send(*msg.custom::<u32>().unwrap()).unwrap();
        }).unwrap();

        for i in 0..100u32 {
            bus.publish("numbers", ObserverId::anonymous(), Payload::custom(i)).unwrap();
            bus.publish("other", ObserverId::anonymous(), Payload::None).unwrap();
        }
        assert_eq!(bus.pump(), 200);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), (0..100u32).collect::<Vec<_>>());
    }

    #[test]
    fn observers_called_in_subscription_order() {
        let bus = bus();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in &["first", "second"] {
            let calls = calls.clone();
            let name = *name;
            bus.subscribe(EVENT_CORE_STARTED, ObserverId::unique(), move |msg| {
                if let Payload::CoreStarted(ref info) = msg.payload {
                    calls.lock().push((name, info.id));
                }
            }).unwrap();
        }

        let info = CoreInfo { path: "cores/menu.rbf".into(), id: Some(7) };
        bus.publish(EVENT_CORE_STARTED, ObserverId::anonymous(), Payload::CoreStarted(info))
            .unwrap();
        bus.pump();
        assert_eq!(*calls.lock(), vec![("first", Some(7)), ("second", Some(7))]);
    }

    #[test]
    fn double_subscription_delivers_once() {
        let bus = bus();
        let count = Arc::new(Mutex::new(0));
        let id = ObserverId::unique();
        for _ in 0..2 {
            let count = count.clone();
            bus.subscribe("t", id, move |_| *count.lock() += 1).unwrap();
        }
        assert_eq!(bus.observer_count("t"), 1);
        bus.publish("t", id, Payload::None).unwrap();
        bus.pump();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn empty_topic_rejected() {
        let bus = bus();
        assert_eq!(bus.subscribe("", ObserverId::unique(), |_| {}), Err(BusError::EmptyTopic));
        assert_eq!(bus.publish("", ObserverId::anonymous(), Payload::None),
            Err(BusError::EmptyTopic));
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn full_queue_refuses_without_blocking() {
        let bus = EventBus::new(BusConfig { queue_capacity: 2, ..BusConfig::default() });
        bus.publish("t", ObserverId::anonymous(), Payload::None).unwrap();
        bus.publish("t", ObserverId::anonymous(), Payload::None).unwrap();
        assert_eq!(bus.publish("t", ObserverId::anonymous(), Payload::None),
            Err(BusError::QueueFull { topic: "t".to_owned(), capacity: 2 }));
        bus.pump();
        bus.publish("t", ObserverId::anonymous(), Payload::None).unwrap();
    }

    #[test]
    fn panicking_observer_isolated() {
        let bus = bus();
        let reached = Arc::new(AtomicBool::new(false));
        bus.subscribe("t", ObserverId::unique(), |_| panic!("observer failure")).unwrap();
        let r = reached.clone();
        bus.subscribe("t", ObserverId::unique(), move |_| r.store(true, Ordering::SeqCst))
            .unwrap();

        bus.publish("t", ObserverId::anonymous(), Payload::None).unwrap();
        bus.pump();
        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn unsubscribe_from_handler() {
        let bus = bus();
        let id = ObserverId::unique();
        let count = Arc::new(Mutex::new(0));
        let (b, c) = (bus.clone(), count.clone());
        bus.subscribe("t", id, move |_| {
            *c.lock() += 1;
            b.unsubscribe(id);
        }).unwrap();

        bus.publish("t", id, Payload::None).unwrap();
        bus.publish("t", id, Payload::None).unwrap();
        bus.pump();
        assert_eq!(*count.lock(), 1);
        assert!(bus.topics_of(id).is_empty());
        bus.close();
    }

    #[test]
    fn one_shot_handler_bypasses_observers() {
        let bus = bus();
        let observed = Arc::new(AtomicBool::new(false));
        let o = observed.clone();
        bus.subscribe("t", ObserverId::unique(), move |_| o.store(true, Ordering::SeqCst))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        bus.publish_with_handler("t", ObserverId::anonymous(), Payload::custom("reply"),
            move |msg| tx.lock().send(*msg.custom::<&str>().unwrap()).unwrap()).unwrap();
        bus.pump();

        assert_eq!(rx.try_recv(), Ok("reply"));
        assert!(!observed.load(Ordering::SeqCst));
    }

    #[test]
    fn no_delivery_after_unsubscribe_returns() {
        let bus = bus();
        let task = bus.start().unwrap();
        let id = ObserverId::unique();
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let late = Arc::new(AtomicBool::new(false));

        let (u, l) = (unsubscribed.clone(), late.clone());
        bus.subscribe("t", id, move |_| {
            if u.load(Ordering::SeqCst) {
                l.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(50));
        }).unwrap();

        for _ in 0..200 {
            bus.publish("t", ObserverId::anonymous(), Payload::None).unwrap();
        }
        thread::sleep(Duration::from_millis(2));
        bus.unsubscribe(id);
        unsubscribed.store(true, Ordering::SeqCst);

        while bus.pending() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        task.stop();
        assert!(!late.load(Ordering::SeqCst));
    }

    #[test]
    fn closed_bus_refuses_messages() {
        let bus = bus();
        bus.subscribe("t", ObserverId::unique(), |_| {}).unwrap();
        bus.close();
        assert_eq!(bus.observer_count("t"), 0);
        assert_eq!(bus.publish("t", ObserverId::anonymous(), Payload::None),
            Err(BusError::Stopped));
    }

    #[test]
    fn handler_unsubscribing_another_observer_stops_its_delivery() {
        let bus = bus();
        let (a, b, c) = (ObserverId::unique(), ObserverId::unique(), ObserverId::unique());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let (handle, log) = (bus.clone(), calls.clone());
        bus.subscribe("t", a, move |_| {
            log.lock().push("a");
            handle.unsubscribe(b);
            handle.unsubscribe_topic("t", c);
        }).unwrap();
        for &(id, name) in &[(b, "b"), (c, "c")] {
            let log = calls.clone();
            bus.subscribe("t", id, move |_| log.lock().push(name)).unwrap();
        }
        let log = calls.clone();
        bus.subscribe("other", c, move |_| log.lock().push("c-other")).unwrap();

        bus.publish("t", a, Payload::None).unwrap();
        bus.publish("other", a, Payload::None).unwrap();
        bus.pump();
        assert_eq!(*calls.lock(), vec!["a", "c-other"]);
        assert!(bus.topics_of(b).is_empty());
        assert_eq!(bus.topics_of(c), vec!["other".to_owned()]);
    }

    #[test]
    fn delivery_thread_ends_once_closed_and_drained() {
        let bus = bus();
        let delivered = Arc::new(AtomicBool::new(false));
        let d = delivered.clone();
        bus.publish_with_handler("t", ObserverId::anonymous(), Payload::None,
            move |_| d.store(true, Ordering::SeqCst)).unwrap();
        bus.close();
        assert!(bus.is_closed());

        let (tx, rx) = mpsc::channel();
        let b = bus.clone();
        thread::spawn(move || {
            b.run(&StopFlag::new());
            tx.send(()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(()));
        assert!(delivered.load(Ordering::SeqCst));
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn slow_registry_lock_still_acquired() {
        let bus = EventBus::new(BusConfig {
            registry_wait_warn: Duration::from_millis(5),
            ..BusConfig::default()
        });
        bus.subscribe("t", ObserverId::unique(), |_| {}).unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let b = bus.clone();
        let holder = thread::spawn(move || {
            let _registry = b.shared.registry.lock();
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
        });
        locked_rx.recv().unwrap();
        assert_eq!(bus.observer_count("t"), 1);
        holder.join().unwrap();
    }
}
