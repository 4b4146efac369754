use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use shared::{
    domain::{Channel, Identity, Message},
    error::{ErrorKind, SessionError},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod gateway;
pub mod log;
pub mod prefs;
mod push;
mod reconciler;

pub use gateway::{ChannelGateway, HttpChannelGateway, MessageEvent, DEFAULT_CHANNEL_NAME};
pub use log::{MergeOrigin, MessageLog};
pub use prefs::{
    resolve_identity, IdentityResolution, JsonPreferenceStore, PreferenceStore, StoredIdentity,
    PLACEHOLDER_NICKNAME,
};

use log::LogCommand;
use reconciler::ReconcilerHandle;

/// How many messages the initial history seed asks for.
const HISTORY_WINDOW: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Seeding,
    Active,
    SwitchingChannel,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    PhaseChanged(SessionPhase),
    ChannelSelected(Channel),
    /// Metadata refresh for the active channel (member count and friends).
    ChannelUpdated(Channel),
    LogChanged {
        origin: MergeOrigin,
        admitted: usize,
    },
    /// One reconciliation pass finished; `admitted` may be zero.
    AutoSynced {
        admitted: usize,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

pub(crate) struct ControllerState {
    phase: SessionPhase,
    identity: Option<Identity>,
    active_channel: Option<Channel>,
    last_error: Option<SessionError>,
}

struct ChannelTasks {
    push: JoinHandle<()>,
    reconciler: ReconcilerHandle,
}

impl ChannelTasks {
    fn abort(self) {
        self.push.abort();
        self.reconciler.stop();
    }
}

enum SeedOutcome {
    Activated,
    /// Another start/select advanced the epoch mid-flight; that flow owns
    /// the session state now.
    Superseded,
}

/// Session/channel controller. Owns the phase state machine, the epoch
/// counter that cancels in-flight work, the merge loop, and the per-channel
/// push/reconciler tasks. The message log is the only shared mutable state
/// and is written exclusively by the merge loop.
pub struct ChatClient {
    pub(crate) gateway: Arc<dyn ChannelGateway>,
    pub(crate) inner: Mutex<ControllerState>,
    log: Arc<Mutex<MessageLog>>,
    pub(crate) epoch: Arc<AtomicU64>,
    pub(crate) merge_tx: mpsc::UnboundedSender<LogCommand>,
    tasks: Mutex<Option<ChannelTasks>>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(gateway: Arc<dyn ChannelGateway>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (merge_tx, merge_rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(MessageLog::new()));
        let epoch = Arc::new(AtomicU64::new(0));

        tokio::spawn(log::run_merge_loop(
            merge_rx,
            Arc::clone(&log),
            Arc::clone(&epoch),
            events.clone(),
        ));

        Arc::new(Self {
            gateway,
            inner: Mutex::new(ControllerState {
                phase: SessionPhase::Idle,
                identity: None,
                active_channel: None,
                last_error: None,
            }),
            log,
            epoch,
            merge_tx,
            tasks: Mutex::new(None),
            events,
        })
    }

    /// Connect, resolve the default channel, seed its history, and bring up
    /// real-time delivery and reconciliation. Retry after a failure is the
    /// caller's decision; the controller never reconnects on its own.
    pub async fn start(self: &Arc<Self>, identity: Identity) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.phase {
                SessionPhase::Idle | SessionPhase::Failed | SessionPhase::Closed => {}
                other => {
                    return Err(SessionError::connection(format!(
                        "cannot start a session while {other:?}"
                    )))
                }
            }
            inner.identity = Some(identity.clone());
        }
        self.set_phase(SessionPhase::Connecting).await;
        let epoch = self.advance_epoch();

        if let Err(err) = self.gateway.connect(&identity).await {
            let error = SessionError::connection(err.to_string());
            self.fail_with(error.clone()).await;
            return Err(error);
        }
        info!(user = %identity.user_id, "sync: connected");
        self.set_phase(SessionPhase::Seeding).await;

        let channel = match self.gateway.resolve_default_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                let error = SessionError::channel_resolution(err.to_string());
                self.fail_with(error.clone()).await;
                return Err(error);
            }
        };

        match self.seed_and_activate(channel, epoch).await {
            Ok(_) => Ok(()),
            // a newer selection owns the session state; do not clobber it
            Err(_) if self.epoch.load(Ordering::SeqCst) != epoch => Ok(()),
            Err(err) => {
                let error = SessionError::fetch(err.to_string());
                self.fail_with(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Tear down the current channel's tasks, empty the log, and reseed from
    /// the target channel. On failure the log intentionally stays empty and
    /// the phase stays `SwitchingChannel`; stale or mixed data is never shown.
    pub async fn select_channel(self: &Arc<Self>, channel: &Channel) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.phase {
                SessionPhase::Active | SessionPhase::SwitchingChannel | SessionPhase::Seeding => {}
                other => {
                    return Err(SessionError::channel_switch(format!(
                        "cannot switch channels while {other:?}"
                    )))
                }
            }
            inner.phase = SessionPhase::SwitchingChannel;
        }
        let _ = self
            .events
            .send(ClientEvent::PhaseChanged(SessionPhase::SwitchingChannel));
        info!(channel = %channel.url, "sync: switching channel");

        let epoch = self.advance_epoch();
        self.stop_channel_tasks().await;
        if let Err(err) = self.reset_log(epoch).await {
            let error = SessionError::channel_switch(err.to_string());
            self.report_error(error.clone()).await;
            return Err(error);
        }

        match self.seed_and_activate(channel.clone(), epoch).await {
            Ok(_) => Ok(()),
            // a newer selection owns the session state; do not clobber it
            Err(_) if self.epoch.load(Ordering::SeqCst) != epoch => Ok(()),
            Err(err) => {
                let error = SessionError::channel_switch(err.to_string());
                self.report_error(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Sends the trimmed text to the active channel and merges the backend's
    /// authoritative copy into the log. A failed send never fabricates an id
    /// and never touches the log.
    pub async fn send_message(&self, text: &str) -> Result<Message, SessionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SessionError::send("message text is empty"));
        }
        let (channel_url, epoch) = {
            let inner = self.inner.lock().await;
            if inner.phase != SessionPhase::Active {
                return Err(SessionError::send("session is not active"));
            }
            let channel = inner
                .active_channel
                .as_ref()
                .ok_or_else(|| SessionError::send("no active channel"))?;
            (channel.url.clone(), self.epoch.load(Ordering::SeqCst))
        };

        match self.gateway.send(&channel_url, trimmed).await {
            Ok(message) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let _ = self.merge_tx.send(LogCommand::Admit {
                    epoch,
                    origin: MergeOrigin::Send,
                    messages: vec![message.clone()],
                    reply: Some(reply_tx),
                });
                let _ = reply_rx.await;
                Ok(message)
            }
            Err(err) => {
                let error = SessionError::send(err.to_string());
                self.report_error(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Runs one reconciliation pass outside the regular cadence.
    pub async fn trigger_manual_sync(&self) -> Result<(), SessionError> {
        {
            let inner = self.inner.lock().await;
            if inner.phase != SessionPhase::Active {
                return Err(SessionError::fetch("session is not active"));
            }
        }
        let tasks = self.tasks.lock().await;
        match tasks.as_ref() {
            Some(tasks) => {
                tasks.reconciler.trigger();
                Ok(())
            }
            None => Err(SessionError::fetch("no reconciler is running")),
        }
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>, SessionError> {
        match self.gateway.list_channels().await {
            Ok(channels) => Ok(channels),
            Err(err) => {
                let error = SessionError::fetch(format!("channel list failed: {err}"));
                self.report_error(error.clone()).await;
                Err(error)
            }
        }
    }

    pub async fn create_channel(&self, name: &str) -> Result<Channel, SessionError> {
        match self.gateway.create_channel(name).await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                let error = SessionError::fetch(format!("channel creation failed: {err}"));
                self.report_error(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Ends the session from any state. Stops both sync tasks, empties the
    /// log, and clears session state.
    pub async fn close(&self) {
        let epoch = self.advance_epoch();
        self.stop_channel_tasks().await;
        if let Err(err) = self.reset_log(epoch).await {
            warn!("sync: log reset on close failed: {err}");
        }
        {
            let mut inner = self.inner.lock().await;
            inner.phase = SessionPhase::Closed;
            inner.identity = None;
            inner.active_channel = None;
            inner.last_error = None;
        }
        let _ = self
            .events
            .send(ClientEvent::PhaseChanged(SessionPhase::Closed));
        info!("sync: session closed");
    }

    /// Ordered, deduplicated view of the active channel's log.
    pub async fn snapshot(&self) -> Vec<Message> {
        self.log.lock().await.snapshot()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    /// True while the controller is between a caller action and Active.
    pub async fn is_loading(&self) -> bool {
        matches!(
            self.inner.lock().await.phase,
            SessionPhase::Connecting | SessionPhase::Seeding | SessionPhase::SwitchingChannel
        )
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.inner.lock().await.identity.clone()
    }

    pub async fn active_channel(&self) -> Option<Channel> {
        self.inner.lock().await.active_channel.clone()
    }

    /// Latest surfaced error; each new failure overwrites the previous one.
    pub async fn last_error(&self) -> Option<SessionError> {
        self.inner.lock().await.last_error.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn seed_and_activate(
        self: &Arc<Self>,
        channel: Channel,
        epoch: u64,
    ) -> anyhow::Result<SeedOutcome> {
        if let Err(err) = self.gateway.mark_read(&channel.url).await {
            warn!(channel = %channel.url, "sync: mark-read failed: {err}");
            self.report_error(SessionError::fetch(format!("mark-read failed: {err}")))
                .await;
        }

        let history = self
            .gateway
            .fetch_history(&channel.url, HISTORY_WINDOW, Utc::now())
            .await
            .with_context(|| format!("history seed failed for {}", channel.url))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.merge_tx
            .send(LogCommand::Admit {
                epoch,
                origin: MergeOrigin::History,
                messages: history,
                reply: Some(reply_tx),
            })
            .map_err(|_| anyhow!("merge loop is gone"))?;
        let admitted = reply_rx.await.context("merge loop dropped the seed reply")?;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            info!(channel = %channel.url, "sync: seeding superseded by a newer selection");
            return Ok(SeedOutcome::Superseded);
        }
        info!(channel = %channel.url, admitted, "sync: history seeded");

        let push = push::spawn_push_listener(Arc::clone(self), channel.url.clone(), epoch);
        let recon = reconciler::spawn_reconciler(Arc::clone(self), channel.url.clone(), epoch);
        {
            // re-checked under the lock: a newer selection may have installed
            // its tasks while this one waited here, and those must survive
            let mut tasks = self.tasks.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                push.abort();
                recon.stop();
                return Ok(SeedOutcome::Superseded);
            }
            if let Some(previous) = tasks.replace(ChannelTasks {
                push,
                reconciler: recon,
            }) {
                previous.abort();
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Ok(SeedOutcome::Superseded);
            }
            inner.active_channel = Some(channel.clone());
            inner.phase = SessionPhase::Active;
        }
        let _ = self
            .events
            .send(ClientEvent::PhaseChanged(SessionPhase::Active));
        let _ = self.events.send(ClientEvent::ChannelSelected(channel));
        Ok(SeedOutcome::Activated)
    }

    /// Flows through the merge queue, so the reset lands strictly after any
    /// merge that was already queued when the switch began.
    async fn reset_log(&self, epoch: u64) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.merge_tx
            .send(LogCommand::Reset {
                epoch,
                reply: reply_tx,
            })
            .map_err(|_| anyhow!("merge loop is gone"))?;
        reply_rx.await.context("merge loop dropped the reset reply")?;
        Ok(())
    }

    fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn stop_channel_tasks(&self) {
        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.abort();
        }
    }

    async fn set_phase(&self, phase: SessionPhase) {
        self.inner.lock().await.phase = phase;
        let _ = self.events.send(ClientEvent::PhaseChanged(phase));
    }

    pub(crate) async fn report_error(&self, error: SessionError) {
        warn!(kind = ?error.kind, "sync: {}", error.message);
        self.inner.lock().await.last_error = Some(error.clone());
        let _ = self.events.send(ClientEvent::Error {
            kind: error.kind,
            message: error.message,
        });
    }

    pub(crate) async fn fail_with(&self, error: SessionError) {
        {
            let mut inner = self.inner.lock().await;
            inner.phase = SessionPhase::Failed;
            inner.last_error = Some(error.clone());
        }
        let _ = self
            .events
            .send(ClientEvent::PhaseChanged(SessionPhase::Failed));
        let _ = self.events.send(ClientEvent::Error {
            kind: error.kind,
            message: error.message,
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
