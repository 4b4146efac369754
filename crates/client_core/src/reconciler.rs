use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use chrono::Utc;
use shared::{domain::ChannelUrl, error::SessionError};
use tokio::{
    sync::{oneshot, Notify},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    log::{LogCommand, MergeOrigin},
    ChatClient, ClientEvent,
};

pub(crate) const SYNC_INTERVAL: Duration = Duration::from_secs(15);
pub(crate) const SYNC_WINDOW: u32 = 10;
/// Manually triggered passes look further back than scheduled ones.
pub(crate) const MANUAL_SYNC_WINDOW: u32 = 20;

pub(crate) struct ReconcilerHandle {
    task: JoinHandle<()>,
    manual: Arc<Notify>,
}

impl ReconcilerHandle {
    /// Runs one extra pass out of cadence.
    pub(crate) fn trigger(&self) {
        self.manual.notify_one();
    }

    /// No further ticks run after this returns. A pass blocked on a fetch
    /// is aborted at its await point; a pass that already queued its batch
    /// is neutralized by the merge loop's epoch check.
    pub(crate) fn stop(self) {
        self.task.abort();
    }
}

pub(crate) fn spawn_reconciler(
    client: Arc<ChatClient>,
    channel_url: ChannelUrl,
    epoch: u64,
) -> ReconcilerHandle {
    let manual = Arc::new(Notify::new());
    let task = tokio::spawn(run(client, channel_url, epoch, Arc::clone(&manual)));
    ReconcilerHandle { task, manual }
}

async fn run(client: Arc<ChatClient>, channel_url: ChannelUrl, epoch: u64, manual: Arc<Notify>) {
    let mut last_sync_time = Utc::now();
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // interval fires immediately, so the first pass runs on activation
    loop {
        let window = tokio::select! {
            _ = ticker.tick() => SYNC_WINDOW,
            _ = manual.notified() => MANUAL_SYNC_WINDOW,
        };
        if client.epoch.load(Ordering::SeqCst) != epoch {
            break;
        }

        let anchor = Utc::now();
        let fetched = match client
            .gateway
            .fetch_history(&channel_url, window, anchor)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                // cursor stays put; the next tick is the retry
                warn!(channel = %channel_url, "sync: reconciliation fetch failed: {err}");
                client
                    .report_error(SessionError::fetch(format!(
                        "reconciliation fetch failed: {err}"
                    )))
                    .await;
                continue;
            }
        };
        if client.epoch.load(Ordering::SeqCst) != epoch {
            break;
        }

        let fresh: Vec<_> = fetched
            .into_iter()
            .filter(|message| message.sent_at > last_sync_time)
            .collect();
        // advanced even when the window was quiet, so a quiet period is
        // never re-processed
        last_sync_time = anchor;

        let admitted = if fresh.is_empty() {
            0
        } else {
            let (reply_tx, reply_rx) = oneshot::channel();
            if client
                .merge_tx
                .send(LogCommand::Admit {
                    epoch,
                    origin: MergeOrigin::Reconcile,
                    messages: fresh,
                    reply: Some(reply_tx),
                })
                .is_err()
            {
                break;
            }
            reply_rx.await.unwrap_or(0)
        };
        if admitted > 0 {
            info!(channel = %channel_url, admitted, "sync: reconciliation admitted messages");
        }
        let _ = client.events.send(ClientEvent::AutoSynced { admitted });
    }
}
