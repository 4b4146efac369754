use std::sync::{atomic::Ordering, Arc};

use shared::{domain::ChannelUrl, error::SessionError};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    gateway::MessageEvent,
    log::{LogCommand, MergeOrigin},
    ChatClient, ClientEvent,
};

/// Forwards the gateway's push events for one channel into the merge queue.
/// The listener is bound to the epoch captured at spawn time; once the
/// session's epoch moves past it, the loop exits and anything still in
/// flight is discarded by the merge loop's own epoch check.
pub(crate) fn spawn_push_listener(
    client: Arc<ChatClient>,
    channel_url: ChannelUrl,
    epoch: u64,
) -> JoinHandle<()> {
    let mut events = client.gateway.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push: listener lagged; reconciliation will recover");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if client.epoch.load(Ordering::SeqCst) != epoch {
                break;
            }
            match event {
                MessageEvent::Message(message) => {
                    if message.channel_url != channel_url {
                        debug!(channel = %message.channel_url, "push: discarding event for inactive channel");
                        continue;
                    }
                    let _ = client.merge_tx.send(LogCommand::Admit {
                        epoch,
                        origin: MergeOrigin::Push,
                        messages: vec![message],
                        reply: None,
                    });
                }
                MessageEvent::Updated(message) => {
                    if message.channel_url != channel_url {
                        continue;
                    }
                    let _ = client.merge_tx.send(LogCommand::Update { epoch, message });
                }
                MessageEvent::Deleted {
                    channel_url: url,
                    id,
                } => {
                    if url != channel_url {
                        continue;
                    }
                    let _ = client.merge_tx.send(LogCommand::Remove {
                        epoch,
                        channel_url: url,
                        id,
                    });
                }
                MessageEvent::ChannelChanged(channel) => {
                    if channel.url != channel_url {
                        continue;
                    }
                    {
                        let mut inner = client.inner.lock().await;
                        inner.active_channel = Some(channel.clone());
                    }
                    let _ = client.events.send(ClientEvent::ChannelUpdated(channel));
                }
                MessageEvent::Disconnected => {
                    client
                        .fail_with(SessionError::connection("push stream disconnected"))
                        .await;
                    break;
                }
                MessageEvent::Unsupported => {}
            }
        }
    })
}
