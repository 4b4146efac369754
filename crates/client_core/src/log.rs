use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use shared::domain::{ChannelUrl, Message, MessageId};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::debug;

use crate::ClientEvent;

/// Which source produced a batch of log candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrigin {
    History,
    Push,
    Reconcile,
    Send,
}

type MessageKey = (ChannelUrl, MessageId);

/// In-memory ordered, deduplicated message collection for the active
/// channel. Ordering choice: admission appends then stable-sorts on
/// `sent_at`, so timestamp ties keep their arrival order. Identity is
/// `(channel_url, id)`; the log knows nothing about the network.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    seen: HashSet<MessageKey>,
    deleted: HashSet<MessageKey>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits every candidate whose identity has not been seen before.
    /// Returns the number of newly admitted messages.
    pub fn merge(&mut self, candidates: Vec<Message>) -> usize {
        let mut admitted = 0;
        for candidate in candidates {
            let key = (candidate.channel_url.clone(), candidate.id);
            if self.seen.insert(key) {
                self.entries.push(candidate);
                admitted += 1;
            }
        }
        if admitted > 0 {
            self.entries.sort_by_key(|message| message.sent_at);
        }
        admitted
    }

    /// Replaces the stored copy of an edited message. An update for an id
    /// the log never saw is admitted instead (it is a message the log
    /// missed); an update for a tombstoned id is ignored. Returns true when
    /// the visible log changed.
    pub fn apply_update(&mut self, message: Message) -> bool {
        let key = (message.channel_url.clone(), message.id);
        if self.deleted.contains(&key) {
            return false;
        }
        if !self.seen.contains(&key) {
            return self.merge(vec![message]) > 0;
        }
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.channel_url == key.0 && entry.id == key.1)
        else {
            return false;
        };
        *entry = message;
        self.entries.sort_by_key(|entry| entry.sent_at);
        true
    }

    /// Tombstones a deleted message: the entry leaves the snapshot and the
    /// id stays pinned so no later fetch can resurrect it.
    pub fn apply_delete(&mut self, channel_url: &ChannelUrl, id: MessageId) -> bool {
        let key = (channel_url.clone(), id);
        self.seen.insert(key.clone());
        self.deleted.insert(key);
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.channel_url == *channel_url && entry.id == id));
        self.entries.len() != before
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.seen.clear();
        self.deleted.clear();
    }

    /// Current view, non-decreasing in `sent_at`.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub(crate) enum LogCommand {
    Admit {
        epoch: u64,
        origin: MergeOrigin,
        messages: Vec<Message>,
        reply: Option<oneshot::Sender<usize>>,
    },
    Update {
        epoch: u64,
        message: Message,
    },
    Remove {
        epoch: u64,
        channel_url: ChannelUrl,
        id: MessageId,
    },
    Reset {
        epoch: u64,
        reply: oneshot::Sender<()>,
    },
}

/// Sole consumer of log mutations. Every producer stamps its command with
/// the epoch it captured at issue time; a command whose epoch no longer
/// matches is dropped here, which is what keeps an in-flight fetch from a
/// previous channel from leaking into the current one.
pub(crate) async fn run_merge_loop(
    mut commands: mpsc::UnboundedReceiver<LogCommand>,
    log: Arc<Mutex<MessageLog>>,
    epoch: Arc<AtomicU64>,
    events: broadcast::Sender<ClientEvent>,
) {
    while let Some(command) = commands.recv().await {
        let current = epoch.load(Ordering::SeqCst);
        match command {
            LogCommand::Admit {
                epoch: issued,
                origin,
                messages,
                reply,
            } => {
                let admitted = if issued == current {
                    log.lock().await.merge(messages)
                } else {
                    debug!(issued, current, "log: dropped stale admit batch");
                    0
                };
                if admitted > 0 {
                    let _ = events.send(ClientEvent::LogChanged { origin, admitted });
                }
                if let Some(reply) = reply {
                    let _ = reply.send(admitted);
                }
            }
            LogCommand::Update {
                epoch: issued,
                message,
            } => {
                if issued != current {
                    debug!(issued, current, "log: dropped stale update");
                    continue;
                }
                if log.lock().await.apply_update(message) {
                    let _ = events.send(ClientEvent::LogChanged {
                        origin: MergeOrigin::Push,
                        admitted: 0,
                    });
                }
            }
            LogCommand::Remove {
                epoch: issued,
                channel_url,
                id,
            } => {
                if issued != current {
                    debug!(issued, current, "log: dropped stale removal");
                    continue;
                }
                if log.lock().await.apply_delete(&channel_url, id) {
                    let _ = events.send(ClientEvent::LogChanged {
                        origin: MergeOrigin::Push,
                        admitted: 0,
                    });
                }
            }
            LogCommand::Reset {
                epoch: issued,
                reply,
            } => {
                if issued == current {
                    log.lock().await.reset();
                }
                let _ = reply.send(());
            }
        }
    }
}
