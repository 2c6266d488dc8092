//! Event bus shared by the input pipeline, the menu layer and the main loop.
//!
//! Producers `publish` owned, typed payloads under a topic. A delivery thread (or a caller of
//! `pump`) hands every message to the topic's observers, in publish order and in the order the
//! observers subscribed.

#![deny(unused_import_braces)]

#[macro_use] extern crate log;
extern crate crossbeam_channel;
extern crate parking_lot;

#[macro_use] mod log_util;

pub mod bus;
pub mod message;
pub mod registry;
pub mod task;

pub use bus::{BusConfig, BusError, EventBus};
pub use message::*;
pub use task::{ErrorBudget, StopFlag, Task};
