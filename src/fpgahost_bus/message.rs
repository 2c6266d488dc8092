//! Messages, their payloads and the topics they travel under

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const EVENT_KEYBOARD: &'static str = "input.keyboard";
pub const EVENT_MOUSE: &'static str = "input.mouse";
pub const EVENT_JOYSTICK: &'static str = "input.joystick";
pub const EVENT_DEVICE_INSERTED: &'static str = "device.inserted";
pub const EVENT_DEVICE_REMOVED: &'static str = "device.removed";
pub const EVENT_CORE_STARTED: &'static str = "core.started";

/// Identity of an observer (or of a message source).
///
/// Either derived from the address of a value that lives as long as the subscription, or
/// allocated with `unique`. Unique ids have the top bit set, which no user space address has, so
/// the two kinds never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(usize);

const UNIQUE_TAG: usize = !(!0 >> 1);

impl ObserverId {
    /// The identity of `value`, based on its address.
    pub fn of<T: ?Sized>(value: &T) -> ObserverId {
        ObserverId(value as *const T as *const u8 as usize)
    }

    /// A fresh identity that's never returned again.
    pub fn unique() -> ObserverId {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        ObserverId(UNIQUE_TAG | NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Identity used as `source` by producers that don't care about theirs.
    pub fn anonymous() -> ObserverId {
        ObserverId(0)
    }
}

/// Called with every message delivered to an observer.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// One decoded input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// A key or button changed state (`EV_KEY`). Autorepeat counts as pressed.
    Key { code: u16, pressed: bool },
    /// Relative pointer motion (`EV_REL`), accumulated over one packet
    RelativeMove { dx: i32, dy: i32, wheel: i32 },
    /// Absolute axis position (`EV_ABS`)
    AbsoluteMove { axis: u16, value: i32 },
}

/// The events of one input packet (everything up to a `SYN_REPORT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBatch {
    /// Device node the events came from
    pub device: PathBuf,
    pub events: Vec<InputEvent>,
}

/// What `EVENT_CORE_STARTED` carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreInfo {
    /// Bitstream the core was loaded from
    pub path: PathBuf,
    /// Id the core reported, if it answered
    pub id: Option<u8>,
}

/// Message contents. Owned by the message and dropped once it has been delivered.
pub enum Payload {
    None,
    Keyboard(InputBatch),
    Mouse(InputBatch),
    Joystick(InputBatch),
    DeviceInserted(PathBuf),
    DeviceRemoved(PathBuf),
    CoreStarted(CoreInfo),
    /// Anything else, e.g. traffic between a core translator and its core
    Custom(Box<dyn Any + Send>),
}

impl Payload {
    pub fn custom<T: Any + Send>(value: T) -> Payload {
        Payload::Custom(Box::new(value))
    }

    /// The input batch, for any of the input payloads.
    pub fn batch(&self) -> Option<&InputBatch> {
        match *self {
            Payload::Keyboard(ref b) | Payload::Mouse(ref b) | Payload::Joystick(ref b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Payload::None => f.write_str("None"),
            Payload::Keyboard(ref b) => f.debug_tuple("Keyboard").field(b).finish(),
            Payload::Mouse(ref b) => f.debug_tuple("Mouse").field(b).finish(),
            Payload::Joystick(ref b) => f.debug_tuple("Joystick").field(b).finish(),
            Payload::DeviceInserted(ref p) => f.debug_tuple("DeviceInserted").field(p).finish(),
            Payload::DeviceRemoved(ref p) => f.debug_tuple("DeviceRemoved").field(p).finish(),
            Payload::CoreStarted(ref c) => f.debug_tuple("CoreStarted").field(c).finish(),
            Payload::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A published message.
pub struct Message {
    pub topic: String,
    pub source: ObserverId,
    pub payload: Payload,
    /// Receives the message instead of the topic's observers
    pub(crate) handler: Option<Handler>,
}

impl Message {
    pub fn new(topic: &str, source: ObserverId, payload: Payload) -> Message {
        Message {
            topic: topic.to_owned(),
            source: source,
            payload: payload,
            handler: None,
        }
    }

    /// The custom payload, if it's a `T`.
    pub fn custom<T: Any>(&self) -> Option<&T> {
        match self.payload {
            Payload::Custom(ref value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("source", &self.source)
            .field("payload", &self.payload)
            .field("one_shot", &self.handler.is_some())
            .finish()
    }
}

#[test]
fn identities() {
    let a = 5u32;
    let b = 5u32;
    assert_eq!(ObserverId::of(&a), ObserverId::of(&a));
    assert!(ObserverId::of(&a) != ObserverId::of(&b));
    assert!(ObserverId::unique() != ObserverId::unique());
    assert!(ObserverId::unique() != ObserverId::of(&a));
}

#[test]
fn custom_payloads() {
    let msg = Message::new("t", ObserverId::anonymous(), Payload::custom(42u16));
    assert_eq!(msg.custom::<u16>(), Some(&42));
    assert_eq!(msg.custom::<u32>(), None);
    assert!(msg.payload.batch().is_none());
}
