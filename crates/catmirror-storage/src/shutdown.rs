//! Caller-supplied cancellation: an explicit trigger plus an optional wall-clock deadline.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
    deadline: Option<DateTime<Utc>>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx },
        ShutdownSignal {
            rx: Some(rx),
            deadline: None,
        },
    )
}

impl ShutdownSignal {
    /// A signal that never fires and has no deadline.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// True once triggered or once `now` has reached the deadline.
    pub fn should_stop(&self, now: DateTime<Utc>) -> bool {
        self.is_triggered() || self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Resolves when the trigger fires. Pends forever for `never()` or a dropped trigger.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}
