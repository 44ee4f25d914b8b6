//! A one-shot, idempotent completion signal.
//!
//! The Coordinator's core synchronization primitive (design notes §9,
//! "wait on first of N signals"): publishers call `fire()` from anywhere,
//! any number of times, without blocking; exactly one waiter races
//! `wait()` against the other signals via `tokio::select!`. A fresh
//! `OnceSignal` is constructed per invocation rather than reset in place —
//! that sidesteps the lost-wakeup hazard of reusing a `Notify` across
//! invocations.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
pub struct OnceSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl OnceSignal {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Mark the signal as fired. Redundant fires are no-ops.
    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_one();
    }

    /// True once `fire()` has been called.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once `fire()` has been (or already was) called.
    pub async fn wait(&self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }
}
