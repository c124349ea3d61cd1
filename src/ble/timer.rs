//! Cancellable one-shot timers that post back into the serialized context

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Kinds of timer a channel runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ConnectionComplete,
    Reconnection,
    MessageAck,
    DataAck,
    NotifyDisconnection,
    Disconnection,
    Resume,
}

/// One-shot timer
///
/// Firing is delivered as an event on the owner's inbox, tagged with the
/// generation it was started with. `cancel` bumps the generation, so a firing
/// that raced with cancellation is recognised as stale by [`Timer::fire`].
#[derive(Debug, Default)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start the timer. Any previous run is cancelled first.
    pub fn start<E, F>(&mut self, after: Duration, inbox: &mpsc::UnboundedSender<E>, make_event: F)
    where
        E: Send + 'static,
        F: FnOnce(u64) -> E,
    {
        self.cancel();
        let event = make_event(self.generation);
        let inbox = inbox.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(event);
        }));
    }

    /// Stop the timer. Safe to call in any state, any number of times.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Accept a firing if it belongs to the current run. Consumes the run.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.handle.is_none() || generation != self.generation {
            return false;
        }
        self.handle = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Every timer owned by one channel
#[derive(Debug, Default)]
pub struct ChannelTimers {
    pub connection_complete: Timer,
    pub reconnection: Timer,
    pub message_ack: Timer,
    pub data_ack: Timer,
    pub notify_disconnection: Timer,
    pub disconnection: Timer,
    pub resume: Timer,
}

impl ChannelTimers {
    pub fn get_mut(&mut self, kind: TimerKind) -> &mut Timer {
        match kind {
            TimerKind::ConnectionComplete => &mut self.connection_complete,
            TimerKind::Reconnection => &mut self.reconnection,
            TimerKind::MessageAck => &mut self.message_ack,
            TimerKind::DataAck => &mut self.data_ack,
            TimerKind::NotifyDisconnection => &mut self.notify_disconnection,
            TimerKind::Disconnection => &mut self.disconnection,
            TimerKind::Resume => &mut self.resume,
        }
    }

    pub fn cancel_all(&mut self) {
        self.connection_complete.cancel();
        self.reconnection.cancel();
        self.message_ack.cancel();
        self.data_ack.cancel();
        self.notify_disconnection.cancel();
        self.disconnection.cancel();
        self.resume.cancel();
    }
}
