//! SIGINT/SIGTERM turn into a flag the main loop checks.

use libc::{self, c_int};

use std::sync::atomic::{AtomicBool, Ordering};

static RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: c_int) {
    RECEIVED.store(true, Ordering::SeqCst);
}

pub fn install() {
    let handler = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

/// Whether the process was asked to quit.
pub fn received() -> bool {
    RECEIVED.load(Ordering::SeqCst)
}
