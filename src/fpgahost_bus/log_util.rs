//! Logging utility macros

/// Evaluates the given expression once (when first reached), no matter how many threads get there.
///
/// Exported for the other fpgahost crates, which import it with `#[macro_use] extern crate`.
#[macro_export]
macro_rules! once {
    ( $e:expr ) => {{
        static ONCE: ::std::sync::Once = ::std::sync::Once::new();
        ONCE.call_once(|| { $e; });
    }}
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn once_runs_first_time_only() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        fn site() {
            once!(RUNS.fetch_add(1, Ordering::SeqCst));
        }

        let threads: Vec<_> = (0..4).map(|_| thread::spawn(site)).collect();
        for t in threads {
            t.join().unwrap();
        }
        site();
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }
}
