//! Poll scheduler: one supervised task per bridged mailbox.
//!
//! Each task:
//! 1. Connects (retrying every `connect_backoff` until it succeeds)
//! 2. Fetches new mail and runs it through the `MailPipeline`
//! 3. Sleeps for the room's poll interval, or until woken by `poll_now`
//! 4. Rebuilds its connection after `staleness_threshold` cycles, or after
//!    `error_threshold` consecutive fetch errors
//!
//! Tasks are registered under their room id. Stopping a room raises the
//! task's cancellation flag; the task notices it at the next wait or loop
//! boundary. A fetch already in flight completes first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{MailboxConnector, MailboxParams, MailboxSession};
use crate::config::SchedulerConfig;
use crate::pipeline::MailPipeline;
use crate::store::InboundAccount;

/// How long `shutdown` waits for a task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-room poll statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCounters {
    /// Poll cycles on the current connection.
    pub cycles: u32,
    /// Consecutive failed fetches.
    pub errors: u32,
    /// Connections rebuilt because of fetch errors.
    pub login_errors: u32,
    /// Connections rebuilt for any reason.
    pub reconnects: u32,
}

/// Counters of one task, shared between the task and the registry.
#[derive(Clone, Default)]
struct CounterHandle(Arc<Mutex<PollCounters>>);

impl CounterHandle {
    async fn update<F: FnOnce(&mut PollCounters)>(&self, f: F) -> PollCounters {
        let mut counters = self.0.lock().await;
        f(&mut counters);
        *counters
    }

    async fn get(&self) -> PollCounters {
        *self.0.lock().await
    }
}

struct PollTask {
    cancel: watch::Sender<bool>,
    wake: Arc<Notify>,
    counters: CounterHandle,
    handle: JoinHandle<()>,
}

struct Shared {
    connector: Arc<dyn MailboxConnector>,
    pipeline: Arc<MailPipeline>,
    config: SchedulerConfig,
    tasks: Mutex<HashMap<String, PollTask>>,
}

/// Owns all running poll tasks and their counters.
#[derive(Clone)]
pub struct PollScheduler {
    shared: Arc<Shared>,
}

enum Exit {
    Cancelled,
    Reconnect,
}

impl PollScheduler {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        pipeline: Arc<MailPipeline>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                pipeline,
                config,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start polling `account`, replacing any task already running for its
    /// room. With `silent` set, the first successful fetch only records mail.
    pub async fn start(&self, account: InboundAccount, silent: bool) {
        let room = account.room_id.clone();
        let (cancel, cancel_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let counters = CounterHandle::default();

        let mut tasks = self.shared.tasks.lock().await;
        if let Some(previous) = tasks.remove(&room) {
            previous.cancel.send_replace(true);
        }

        let handle = tokio::spawn(run_account(
            Arc::clone(&self.shared),
            account,
            silent,
            TaskSignals {
                cancel: cancel_rx,
                wake: Arc::clone(&wake),
                counters: counters.clone(),
            },
        ));
        tasks.insert(
            room.clone(),
            PollTask {
                cancel,
                wake,
                counters,
                handle,
            },
        );
        info!(room = %room, silent, "Mail poller started");
    }

    /// Cancel the room's task. Stopping an unknown room is a no-op.
    pub async fn stop(&self, room: &str) -> bool {
        let removed = self.shared.tasks.lock().await.remove(room);
        match removed {
            Some(task) => {
                task.cancel.send_replace(true);
                info!(room = %room, "Mail poller stopped");
                true
            }
            None => false,
        }
    }

    /// Start a task for every account, e.g. at startup.
    pub async fn start_all(&self, accounts: Vec<InboundAccount>, silent: bool) -> usize {
        let count = accounts.len();
        for account in accounts {
            self.start(account, silent).await;
        }
        info!("Started {count} mail poller(s)");
        count
    }

    /// Cut the current sleep of the room's task short. Returns false if no
    /// task runs for the room.
    pub async fn poll_now(&self, room: &str) -> bool {
        match self.shared.tasks.lock().await.get(room) {
            Some(task) => {
                task.wake.notify_one();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, room: &str) -> bool {
        self.shared.tasks.lock().await.contains_key(room)
    }

    pub async fn counters(&self, room: &str) -> Option<PollCounters> {
        let handle = self
            .shared
            .tasks
            .lock()
            .await
            .get(room)
            .map(|task| task.counters.clone())?;
        Some(handle.get().await)
    }

    /// Cancel every task and wait briefly for them to exit.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, PollTask)> = self.shared.tasks.lock().await.drain().collect();

        for (_, task) in &tasks {
            task.cancel.send_replace(true);
        }
        for (room, task) in tasks {
            let abort = task.handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task.handle).await.is_err() {
                warn!(room = %room, "Mail poller did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("Mail pollers shut down");
    }
}

/// The task's end of its registry entry.
struct TaskSignals {
    cancel: watch::Receiver<bool>,
    wake: Arc<Notify>,
    counters: CounterHandle,
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Resolves once cancellation is requested or the scheduler is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Body of one poll task.
async fn run_account(
    shared: Arc<Shared>,
    account: InboundAccount,
    mut silent: bool,
    mut signals: TaskSignals,
) {
    let room = account.room_id.clone();
    let params = MailboxParams::from(&account);
    let interval = Duration::from_secs(account.poll_interval.max(1));

    loop {
        let Some(mut session) = connect(&shared, &params, &room, &mut signals.cancel).await else {
            return;
        };

        let exit = poll_loop(
            &shared,
            &account,
            session.as_mut(),
            &mut silent,
            interval,
            &mut signals,
        )
        .await;
        session.logout().await;

        match exit {
            Exit::Cancelled => {
                debug!(room = %room, "Mail poller exiting");
                return;
            }
            Exit::Reconnect => {
                let counters = signals
                    .counters
                    .update(|c| {
                        c.cycles = 0;
                        c.reconnects += 1;
                    })
                    .await;
                info!(
                    room = %room,
                    username = %account.username,
                    reconnects = counters.reconnects,
                    "Reconnecting mailbox"
                );
            }
        }
    }
}

/// Connecting state. Returns `None` when cancelled.
async fn connect(
    shared: &Shared,
    params: &MailboxParams,
    room: &str,
    cancel: &mut watch::Receiver<bool>,
) -> Option<Box<dyn MailboxSession>> {
    loop {
        if is_cancelled(cancel) {
            return None;
        }
        match shared.connector.connect(params).await {
            Ok(session) => return Some(session),
            Err(e) => {
                info!(
                    room = %room,
                    host = %params.host,
                    error = %e,
                    "Could not connect to mailbox, retrying in {}s",
                    shared.config.connect_backoff.as_secs()
                );
                tokio::select! {
                    _ = tokio::time::sleep(shared.config.connect_backoff) => {}
                    _ = cancelled(cancel) => return None,
                }
            }
        }
    }
}

/// Polling state, until cancelled or a reconnect is due.
async fn poll_loop(
    shared: &Shared,
    account: &InboundAccount,
    session: &mut dyn MailboxSession,
    silent: &mut bool,
    interval: Duration,
    signals: &mut TaskSignals,
) -> Exit {
    let room = account.room_id.as_str();
    let config = &shared.config;
    let TaskSignals {
        cancel,
        wake,
        counters: handle,
    } = signals;

    loop {
        if is_cancelled(cancel) {
            return Exit::Cancelled;
        }

        let cycles = handle.get().await.cycles;
        if cycles >= config.staleness_threshold {
            return Exit::Reconnect;
        }

        match session.fetch_new().await {
            Ok(mails) => {
                if is_cancelled(cancel) {
                    return Exit::Cancelled;
                }
                handle.update(|c| c.errors = 0).await;
                shared
                    .pipeline
                    .process_batch(account, mails, *silent)
                    .await;
                *silent = false;
            }
            Err(e) => {
                let counters = handle.update(|c| c.errors += 1).await;
                debug!(room = %room, errors = counters.errors, error = %e, "Mail fetch failed");

                if counters.errors >= config.error_threshold {
                    let counters = handle
                        .update(|c| {
                            c.errors = 0;
                            c.login_errors += 1;
                        })
                        .await;
                    if counters.login_errors > config.login_error_warning {
                        error!(
                            room = %room,
                            username = %account.username,
                            login_errors = counters.login_errors,
                            "Mail account keeps failing"
                        );
                    }
                    return Exit::Reconnect;
                }
            }
        }

        handle.update(|c| c.cycles += 1).await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => debug!(room = %room, "Poll requested"),
            _ = cancelled(cancel) => return Exit::Cancelled,
        }
    }
}
