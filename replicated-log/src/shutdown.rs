//! One-shot cancellation signal.
//!
//! Triggering drops the only sender of a zero-capacity channel, so every
//! clone of the receiver becomes ready at once. This makes the signal usable
//! directly inside `crossbeam_channel::select!`. Triggering is idempotent.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, bounded};

#[derive(Clone)]
pub struct ShutdownSignal {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    closed: Receiver<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            closed: rx,
        }
    }

    /// Fires the signal. Returns `true` only for the call that fired it.
    pub fn trigger(&self) -> bool {
        self.trigger
            .lock()
            .expect("shutdown signal poisoned")
            .take()
            .is_some()
    }

    pub fn is_triggered(&self) -> bool {
        self.trigger
            .lock()
            .expect("shutdown signal poisoned")
            .is_none()
    }

    /// Receiver that disconnects once the signal fires; for `select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.closed
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        // Nothing is ever sent, so this only returns on disconnect.
        let _ = self.closed.recv();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_trigger_twice_is_harmless() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_wait_releases_every_clone() {
        let signal = ShutdownSignal::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                thread::spawn(move || signal.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        signal.trigger();
        for waiter in waiters {
            waiter.join().expect("waiter panicked");
        }
    }

    #[test]
    fn test_select_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        crossbeam_channel::select! {
            recv(signal.receiver()) -> msg => assert!(msg.is_err()),
            default(Duration::from_secs(1)) => panic!("signal not observed"),
        }
    }
}
