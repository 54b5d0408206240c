// Connection supervisor shared by both channels.
//
// One supervisor task per channel owns the physical connection. It runs a
// connection attempt to completion, then either schedules a reconnect from
// the backoff schedule or parks the channel in `Idle` when nothing is
// subscribed. A single watch signal cancels the task, its backoff sleep, and
// every connection-scoped task below it.
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Ready,
    Closing,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Status {
    pub(crate) state: ConnectionState,
    pub(crate) client_id: Option<String>,
    // Set by a manual disconnect, cleared by the next start.
    pub(crate) closed: bool,
}

/// Hook invoked with the active key snapshot when an established connection
/// goes away.
pub type DisconnectHook = Arc<dyn Fn(&[String]) + Send + Sync>;

#[derive(Default)]
pub(crate) struct DisconnectHooks {
    hooks: Mutex<Vec<DisconnectHook>>,
}

impl DisconnectHooks {
    pub(crate) fn add(&self, hook: DisconnectHook) {
        self.hooks.lock().push(hook);
    }

    pub(crate) fn fire(&self, keys: &[String]) {
        let hooks = self.hooks.lock().clone();
        for hook in hooks {
            let _ = catch_unwind(AssertUnwindSafe(|| hook(keys)));
        }
    }
}

/// Channel-specific half of the supervisor.
#[async_trait]
pub(crate) trait Session: Send + Sync + 'static {
    fn lifecycle(&self) -> &Lifecycle;

    fn backoff(&self) -> &Backoff;

    fn has_subscriptions(&self) -> bool;

    /// Open the connection and run the read loop until it ends. `Ok` means the
    /// server closed cleanly; either way the supervisor decides what's next.
    async fn run_connection(self: Arc<Self>) -> anyhow::Result<()>;

    /// Called after every connection attempt ends, before any backoff.
    fn connection_lost(&self, was_ready: bool);
}

struct Supervisor {
    id: u64,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub(crate) struct Lifecycle {
    channel: &'static str,
    status: watch::Sender<Status>,
    supervisor: Mutex<Option<Supervisor>>,
    attempts: AtomicUsize,
    next_id: AtomicU64,
}

impl Lifecycle {
    pub(crate) fn new(channel: &'static str) -> Self {
        let (status, _) = watch::channel(Status::default());
        Self {
            channel,
            status,
            supervisor: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.status.borrow().client_id.clone()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Spawn the supervisor unless one is already running.
    pub(crate) fn start<S: Session>(&self, session: &Arc<S>) {
        let mut slot = self.supervisor.lock();
        if slot.is_some() {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancel_rx) = watch::channel(false);
        self.attempts.store(0, Ordering::Relaxed);
        // Under the slot lock so a concurrent shutdown never overwrites this state.
        self.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.client_id = None;
            status.closed = false;
        });
        debug!(channel = self.channel, "starting connection supervisor");
        let handle = tokio::spawn(supervise(Arc::clone(session), id, cancel_rx));
        *slot = Some(Supervisor { id, cancel, handle });
    }

    pub(crate) fn mark_ready(&self, client_id: String) {
        self.attempts.store(0, Ordering::Relaxed);
        info!(channel = self.channel, client_id = %client_id, "connection ready");
        self.status.send_modify(|status| {
            status.state = ConnectionState::Ready;
            status.client_id = Some(client_id);
        });
        self.report_ready(true);
    }

    /// Wait until `Ready`. A manual disconnect while waiting is
    /// `ConnectionClosed`; anything else that ends the wait is `NotConnected`.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut status = self.status.subscribe();
        let wait = async {
            loop {
                {
                    let current = status.borrow_and_update();
                    match current.state {
                        ConnectionState::Ready => return Ok(()),
                        ConnectionState::Closing => return Err(Error::ConnectionClosed),
                        ConnectionState::Idle if current.closed => {
                            return Err(Error::ConnectionClosed);
                        }
                        ConnectionState::Idle => return Err(Error::NotConnected),
                        ConnectionState::Connecting => {}
                    }
                }
                if status.changed().await.is_err() {
                    return Err(Error::ConnectionClosed);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::NotConnected),
        }
    }

    /// Cancel the supervisor and wait for it to stop. Returns the state the
    /// channel was in beforehand.
    ///
    /// A `start` that lands while the old supervisor is still winding down
    /// owns the state from then on: the final `Idle` reset, and `on_idle`,
    /// only apply while no new supervisor has taken the slot.
    pub(crate) async fn shutdown(&self, on_idle: impl FnOnce() + Send) -> ConnectionState {
        let mut previous = ConnectionState::Idle;
        let supervisor = {
            let mut slot = self.supervisor.lock();
            self.status.send_modify(|status| {
                previous = status.state;
                if status.state != ConnectionState::Idle {
                    status.state = ConnectionState::Closing;
                }
                status.closed = true;
            });
            slot.take()
        };
        if let Some(supervisor) = supervisor {
            let _ = supervisor.cancel.send(true);
            if let Err(err) = supervisor.handle.await
                && err.is_panic()
            {
                warn!(channel = self.channel, "connection supervisor panicked");
            }
        }
        {
            let slot = self.supervisor.lock();
            if slot.is_none() {
                self.status.send_modify(|status| {
                    status.state = ConnectionState::Idle;
                    status.client_id = None;
                });
                self.report_ready(false);
                on_idle();
            }
        }
        if previous != ConnectionState::Idle {
            info!(channel = self.channel, "disconnected");
        }
        previous
    }

    /// Synchronous teardown for drop paths.
    pub(crate) fn abort(&self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            let _ = supervisor.cancel.send(true);
            supervisor.handle.abort();
        }
        self.status.send_modify(|status| {
            status.state = ConnectionState::Idle;
            status.client_id = None;
            status.closed = true;
        });
        self.report_ready(false);
    }

    // Returns whether the lost connection had reached `Ready`.
    fn connection_dropped(&self) -> bool {
        let mut was_ready = false;
        self.status.send_modify(|status| {
            was_ready = status.state == ConnectionState::Ready;
            status.client_id = None;
            if status.state == ConnectionState::Ready {
                status.state = ConnectionState::Connecting;
            }
        });
        self.report_ready(false);
        was_ready
    }

    fn report_ready(&self, ready: bool) {
        t_gauge!("stratus_connection_ready", "channel" => self.channel)
            .set(if ready { 1.0 } else { 0.0 });
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn supervise<S: Session>(session: Arc<S>, id: u64, mut cancel: watch::Receiver<bool>) {
    let lifecycle = session.lifecycle();
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return,
            outcome = Arc::clone(&session).run_connection() => outcome,
        };
        if *cancel.borrow() {
            return;
        }
        match outcome {
            Ok(()) => info!(channel = lifecycle.channel, "connection closed by server"),
            Err(err) => warn!(channel = lifecycle.channel, error = %format!("{err:#}"), "connection failed"),
        }
        let was_ready = lifecycle.connection_dropped();
        session.connection_lost(was_ready);

        let attempt = {
            let mut slot = lifecycle.supervisor.lock();
            if !session.has_subscriptions() {
                if slot.as_ref().is_some_and(|supervisor| supervisor.id == id) {
                    *slot = None;
                }
                lifecycle.status.send_modify(|status| {
                    status.state = ConnectionState::Idle;
                    status.client_id = None;
                });
                info!(channel = lifecycle.channel, "no active subscriptions, not reconnecting");
                return;
            }
            lifecycle.attempts.fetch_add(1, Ordering::Relaxed)
        };
        let delay = session.backoff().next(attempt);
        t_counter!("stratus_reconnect_attempts_total", "channel" => lifecycle.channel).increment(1);
        debug!(
            channel = lifecycle.channel,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
