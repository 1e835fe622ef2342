//! Debounced fan-in of markers into reconciliation fetches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parley_protocol::{Channel, ReconcileRequest, ReconcileResponse};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::config::SyncConfig;

use super::{ReconciliationFetcher, SubscribeAck, SubscriptionTransport, SyncError};

/// Debounce timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Quiet period after the latest marker before fetching.
    pub window: Duration,
    /// Upper bound on how long the first pending marker may wait. `None`
    /// gives a pure sliding window.
    pub max_wait: Option<Duration>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(300),
            max_wait: Some(Duration::from_millis(1000)),
        }
    }
}

impl From<&SyncConfig> for DebounceConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            window: config.debounce_window(),
            max_wait: config.debounce_max_wait(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    /// Markers arrived and the debounce timer fired.
    Debounced,
    /// The transport (re)connected; every declared slot was re-read.
    Reconnected,
}

/// Output of the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    Reconciled {
        reason: FetchReason,
        response: ReconcileResponse,
    },
    FetchFailed {
        reason: FetchReason,
        slots: Vec<String>,
        error: SyncError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub channel: Channel,
    pub slots: BTreeSet<String>,
    pub subscribed: bool,
}

/// Point-in-time view of the multiplexer, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub entries: Vec<EntrySnapshot>,
    pub pending: BTreeSet<String>,
    pub timer_armed: bool,
    pub fetches: usize,
}

/// What a `reconfigure` did, per channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigureReport {
    pub subscribed: Vec<Channel>,
    pub rejected: Vec<Channel>,
    /// Kept, retried on the next connection.
    pub failed: Vec<Channel>,
    pub removed: Vec<Channel>,
}

enum Command {
    Register {
        channel: Channel,
        slots: BTreeSet<String>,
        reply: oneshot::Sender<Result<SubscribeAck, SyncError>>,
    },
    Reconfigure {
        bindings: BTreeMap<Channel, BTreeSet<String>>,
        reply: oneshot::Sender<ReconfigureReport>,
    },
    Event(Channel),
    Connected,
    Disconnected,
    Snapshot(oneshot::Sender<SyncSnapshot>),
    Teardown(Option<oneshot::Sender<()>>),
}

struct Entry {
    slots: BTreeSet<String>,
    subscribed: bool,
}

/// Cheap, cloneable handle to a running multiplexer.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SyncHandle {
    /// Bind `channel` to `slots`, subscribing if it is not subscribed yet.
    ///
    /// Re-registering a subscribed channel only replaces its slots. A
    /// rejected channel is dropped; one that failed on the transport is kept
    /// and retried on the next connection.
    pub async fn register<I, S>(&self, channel: Channel, slots: I) -> Result<SubscribeAck, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            channel,
            slots: slots.into_iter().map(Into::into).collect(),
            reply,
        })?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    /// Replace the whole channel -> slots map.
    pub async fn reconfigure(
        &self,
        bindings: BTreeMap<Channel, BTreeSet<String>>,
    ) -> Result<ReconfigureReport, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reconfigure { bindings, reply })?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// A marker arrived for `channel`.
    pub fn on_event(&self, channel: Channel) -> Result<(), SyncError> {
        self.send(Command::Event(channel))
    }

    /// The transport (re)connected.
    pub fn on_connected(&self) -> Result<(), SyncError> {
        self.send(Command::Connected)
    }

    pub fn on_disconnected(&self) -> Result<(), SyncError> {
        self.send(Command::Disconnected)
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Unsubscribe everything, cancel the timer and stop the multiplexer.
    pub async fn teardown(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Teardown(Some(reply)))?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::Stopped)
    }
}

/// Owns a multiplexer for the lifetime of a scope. Dropping it tears the
/// multiplexer down.
pub struct SyncScope {
    handle: SyncHandle,
}

impl SyncScope {
    pub fn new(handle: SyncHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &SyncHandle {
        &self.handle
    }
}

impl Drop for SyncScope {
    fn drop(&mut self) {
        let _ = self.handle.commands.send(Command::Teardown(None));
    }
}

/// Single-task state machine behind [`SyncHandle`].
pub struct SyncMultiplexer {
    transport: Arc<dyn SubscriptionTransport>,
    fetcher: Arc<dyn ReconciliationFetcher>,
    debounce: DebounceConfig,
    updates: mpsc::UnboundedSender<SyncUpdate>,
    entries: BTreeMap<Channel, Entry>,
    pending: BTreeSet<String>,
    first_pending_at: Option<Instant>,
    deadline: Option<Instant>,
    fetches: usize,
}

impl SyncMultiplexer {
    /// Start the multiplexer task.
    ///
    /// The task ends on `teardown`, or once every handle is dropped, and
    /// unsubscribes everything on its way out.
    pub fn spawn(
        transport: Arc<dyn SubscriptionTransport>,
        fetcher: Arc<dyn ReconciliationFetcher>,
        debounce: DebounceConfig,
    ) -> (SyncHandle, mpsc::UnboundedReceiver<SyncUpdate>, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let multiplexer = Self {
            transport,
            fetcher,
            debounce,
            updates,
            entries: BTreeMap::new(),
            pending: BTreeSet::new(),
            first_pending_at: None,
            deadline: None,
            fetches: 0,
        };
        let task = tokio::spawn(multiplexer.run(rx));
        (SyncHandle { commands }, updates_rx, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Teardown(reply)) => {
                        self.teardown().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                _ = timer => self.fire().await,
            }
        }
        debug!("Sync multiplexer stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                channel,
                slots,
                reply,
            } => {
                let result = self.register(channel, slots).await;
                let _ = reply.send(result);
            }
            Command::Reconfigure { bindings, reply } => {
                let report = self.reconfigure(bindings).await;
                let _ = reply.send(report);
            }
            Command::Event(channel) => self.on_event(&channel),
            Command::Connected => self.on_connected().await,
            Command::Disconnected => {
                for entry in self.entries.values_mut() {
                    entry.subscribed = false;
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            Command::Teardown(_) => {}
        }
    }

    async fn register(
        &mut self,
        channel: Channel,
        slots: BTreeSet<String>,
    ) -> Result<SubscribeAck, SyncError> {
        if let Some(entry) = self.entries.get_mut(&channel)
            && entry.subscribed
        {
            entry.slots = slots;
            self.prune_pending();
            return Ok(SubscribeAck::Confirmed);
        }

        self.entries.insert(
            channel.clone(),
            Entry {
                slots,
                subscribed: false,
            },
        );
        let ack = self.subscribe_entry(&channel).await;
        // Slots only the previous binding declared must not be fetched.
        self.prune_pending();
        ack
    }

    /// Subscribe an existing entry, dropping it on rejection.
    async fn subscribe_entry(&mut self, channel: &Channel) -> Result<SubscribeAck, SyncError> {
        match self.transport.subscribe(channel).await {
            Ok(SubscribeAck::Confirmed) => {
                if let Some(entry) = self.entries.get_mut(channel) {
                    entry.subscribed = true;
                }
                debug!("Subscribed to {}", channel);
                Ok(SubscribeAck::Confirmed)
            }
            Ok(SubscribeAck::Rejected) => {
                self.entries.remove(channel);
                self.prune_pending();
                info!("Subscription to {} rejected", channel);
                Ok(SubscribeAck::Rejected)
            }
            Err(e) => {
                warn!("Subscribe to {} failed, will retry on reconnect: {}", channel, e);
                Err(e)
            }
        }
    }

    async fn reconfigure(
        &mut self,
        bindings: BTreeMap<Channel, BTreeSet<String>>,
    ) -> ReconfigureReport {
        let mut report = ReconfigureReport::default();

        let removed: Vec<Channel> = self
            .entries
            .keys()
            .filter(|channel| !bindings.contains_key(*channel))
            .cloned()
            .collect();
        for channel in removed {
            if let Some(entry) = self.entries.remove(&channel)
                && entry.subscribed
                && let Err(e) = self.transport.unsubscribe(&channel).await
            {
                debug!("Unsubscribe from {} failed: {}", channel, e);
            }
            report.removed.push(channel);
        }

        for (channel, slots) in bindings {
            match self.register(channel.clone(), slots).await {
                Ok(SubscribeAck::Confirmed) => report.subscribed.push(channel),
                Ok(SubscribeAck::Rejected) => report.rejected.push(channel),
                Err(_) => report.failed.push(channel),
            }
        }

        self.prune_pending();
        report
    }

    fn on_event(&mut self, channel: &Channel) {
        let Some(entry) = self.entries.get(channel) else {
            debug!("Marker for unregistered channel {}", channel);
            return;
        };
        if entry.slots.is_empty() {
            return;
        }
        self.pending.extend(entry.slots.iter().cloned());

        let now = Instant::now();
        let first = *self.first_pending_at.get_or_insert(now);
        let mut deadline = now + self.debounce.window;
        if let Some(max_wait) = self.debounce.max_wait {
            deadline = deadline.min(first + max_wait);
        }
        self.deadline = Some(deadline);
    }

    async fn on_connected(&mut self) {
        self.cancel_timer();

        let channels: Vec<Channel> = self.entries.keys().cloned().collect();
        for channel in &channels {
            if let Some(entry) = self.entries.get_mut(channel) {
                entry.subscribed = false;
            }
            let _ = self.subscribe_entry(channel).await;
        }
        info!(
            "Resubscribed {} of {} channel(s) after connect",
            self.entries.values().filter(|e| e.subscribed).count(),
            channels.len()
        );

        let slots: BTreeSet<String> = self
            .entries
            .values()
            .flat_map(|entry| entry.slots.iter().cloned())
            .collect();
        if !slots.is_empty() {
            self.fetch(slots, FetchReason::Reconnected).await;
        }
    }

    async fn fire(&mut self) {
        let slots = std::mem::take(&mut self.pending);
        self.cancel_timer();
        if !slots.is_empty() {
            self.fetch(slots, FetchReason::Debounced).await;
        }
    }

    async fn fetch(&mut self, slots: BTreeSet<String>, reason: FetchReason) {
        self.fetches += 1;
        let request = ReconcileRequest::new(slots);
        debug!("Reconciling {} slot(s) ({:?})", request.slots.len(), reason);

        let update = match self.fetcher.fetch(request.clone()).await {
            Ok(mut response) => {
                response.retain_requested(&request);
                SyncUpdate::Reconciled { reason, response }
            }
            Err(error) => {
                warn!("Reconciliation fetch failed: {}", error);
                SyncUpdate::FetchFailed {
                    reason,
                    slots: request.slots,
                    error,
                }
            }
        };
        let _ = self.updates.send(update);
    }

    async fn teardown(&mut self) {
        self.cancel_timer();
        let entries = std::mem::take(&mut self.entries);
        for (channel, entry) in entries {
            if entry.subscribed
                && let Err(e) = self.transport.unsubscribe(&channel).await
            {
                debug!("Unsubscribe from {} failed during teardown: {}", channel, e);
            }
        }
    }

    fn cancel_timer(&mut self) {
        self.pending.clear();
        self.first_pending_at = None;
        self.deadline = None;
    }

    /// Drop pending slots no remaining channel is bound to.
    fn prune_pending(&mut self) {
        let bound: BTreeSet<&String> = self
            .entries
            .values()
            .flat_map(|entry| entry.slots.iter())
            .collect();
        self.pending.retain(|slot| bound.contains(slot));
        if self.pending.is_empty() {
            self.cancel_timer();
        }
    }

    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            entries: self
                .entries
                .iter()
                .map(|(channel, entry)| EntrySnapshot {
                    channel: channel.clone(),
                    slots: entry.slots.clone(),
                    subscribed: entry.subscribed,
                })
                .collect(),
            pending: self.pending.clone(),
            timer_armed: self.deadline.is_some(),
            fetches: self.fetches,
        }
    }
}
