//! Debounced mutation callback.
//!
//! Each session with a callback gets one driver task. Mutations are
//! queued to it and coalesced by a [`Debouncer`]:
//!
//! ```text
//!   trigger ──► deadline = now + wait              (reset on every trigger)
//!               max_deadline = first_trigger + max_wait (set once per batch)
//!   fire when now >= min(deadline, max_deadline), then clear both
//! ```
//!
//! A burst inside the quiet window produces one invocation; a continuous
//! stream still fires at least once per `max_wait`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::config::DebounceConfig;

/// External side effect run after document mutations settle.
///
/// Runs on the session's notifier task; long work should be handed off
/// to a separate task.
pub trait MutationCallback: Send + Sync + 'static {
    /// `updates` are the encoded updates applied since the last call, in order.
    fn on_mutation(&self, session: &str, updates: Vec<Vec<u8>>);
}

impl<F> MutationCallback for F
where
    F: Fn(&str, Vec<Vec<u8>>) + Send + Sync + 'static,
{
    fn on_mutation(&self, session: &str, updates: Vec<Vec<u8>>) {
        self(session, updates)
    }
}

/// Logs each settled batch. The callback the server binary installs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMutations;

impl MutationCallback for LogMutations {
    fn on_mutation(&self, session: &str, updates: Vec<Vec<u8>>) {
        let bytes: usize = updates.iter().map(Vec::len).sum();
        log::info!(
            "Session '{session}' changed: {} updates, {bytes} bytes",
            updates.len()
        );
    }
}

/// Trailing-edge debounce timer with a max-wait bound.
#[derive(Debug, Clone)]
pub struct Debouncer {
    wait: Duration,
    max_wait: Duration,
    deadline: Option<Instant>,
    max_deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            wait: config.wait,
            max_wait: config.max_wait,
            deadline: None,
            max_deadline: None,
        }
    }

    /// Record a mutation at `now`.
    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.wait);
        if self.max_deadline.is_none() {
            self.max_deadline = Some(now + self.max_wait);
        }
    }

    /// Earliest instant at which the pending batch fires.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.deadline, self.max_deadline) {
            (Some(d), Some(m)) => Some(d.min(m)),
            (d, m) => d.or(m),
        }
    }

    /// Returns `true` (and clears the timer) if the batch is due at `now`.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_deadline() {
            Some(due) if now >= due => {
                self.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Clear the timer. Returns whether a batch was pending.
    pub fn cancel(&mut self) -> bool {
        let pending = self.is_pending();
        self.deadline = None;
        self.max_deadline = None;
        pending
    }
}

enum Command {
    Mutation(Vec<u8>),
    Finish(oneshot::Sender<()>),
}

/// Handle to one session's notifier task.
pub struct MutationNotifier {
    tx: mpsc::UnboundedSender<Command>,
}

impl MutationNotifier {
    /// Start the driver task for `session`.
    pub fn spawn(
        session: String,
        callback: Arc<dyn MutationCallback>,
        config: DebounceConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(session, callback, Debouncer::new(config), rx));
        Self { tx }
    }

    /// Schedule a debounced invocation carrying `update`.
    pub fn notify(&self, update: Vec<u8>) {
        let _ = self.tx.send(Command::Mutation(update));
    }

    /// Fire any pending batch now and stop the task.
    pub async fn finish(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Finish(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn drive(
    session: String,
    callback: Arc<dyn MutationCallback>,
    mut debouncer: Debouncer,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut batch: Vec<Vec<u8>> = Vec::new();

    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Mutation(update)) => {
                    batch.push(update);
                    debouncer.trigger(Instant::now());
                }
                Some(Command::Finish(ack)) => {
                    if debouncer.cancel() {
                        fire(&session, callback.as_ref(), &mut batch);
                    }
                    let _ = ack.send(());
                    break;
                }
                None => {
                    if debouncer.cancel() {
                        fire(&session, callback.as_ref(), &mut batch);
                    }
                    break;
                }
            },

            _ = wait_until(deadline) => {
                if debouncer.poll(Instant::now()) {
                    fire(&session, callback.as_ref(), &mut batch);
                }
            }
        }
    }
    log::trace!("Notifier for '{session}' stopped");
}

fn fire(session: &str, callback: &dyn MutationCallback, batch: &mut Vec<Vec<u8>>) {
    let updates = std::mem::take(batch);
    log::debug!("Mutation callback for '{session}' ({} updates)", updates.len());
    callback.on_mutation(session, updates);
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
