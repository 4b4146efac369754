use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Client;
use shared::{
    domain::{Channel, ChannelUrl, Identity, Message, MessageId},
    protocol::{
        ChannelRecord, ConnectRequest, ConnectResponse, CreateChannelRequest, HistoryQuery,
        MessageRecord, PushFrame, SendMessageRequest,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::warn;

/// Name of the shared channel every user lands in. Resolution creates it
/// when the backend has no channel by this name yet.
pub const DEFAULT_CHANNEL_NAME: &str = "general";

/// Domain-level push event. Wire frames are decoded exactly once, here at
/// the gateway boundary; nothing downstream inspects a type tag.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// New user or admin message, already normalized (admin messages carry
    /// the reserved system sender).
    Message(Message),
    Updated(Message),
    Deleted { channel_url: ChannelUrl, id: MessageId },
    ChannelChanged(Channel),
    /// The push stream ended; real-time delivery has stopped.
    Disconnected,
    Unsupported,
}

#[async_trait]
pub trait ChannelGateway: Send + Sync {
    async fn connect(&self, identity: &Identity) -> Result<()>;
    /// Returns the conventional shared channel, creating it when absent.
    async fn resolve_default_channel(&self) -> Result<Channel>;
    async fn list_channels(&self) -> Result<Vec<Channel>>;
    async fn create_channel(&self, name: &str) -> Result<Channel>;
    /// Window of up to `limit` messages ending at `anchor`, oldest-first.
    async fn fetch_history(
        &self,
        channel_url: &ChannelUrl,
        limit: u32,
        anchor: DateTime<Utc>,
    ) -> Result<Vec<Message>>;
    async fn send(&self, channel_url: &ChannelUrl, text: &str) -> Result<Message>;
    async fn mark_read(&self, channel_url: &ChannelUrl) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<MessageEvent>;
}

/// Gateway over the chat backend's HTTP surface plus its websocket push
/// stream.
pub struct HttpChannelGateway {
    http: Client,
    base_url: String,
    default_channel_name: String,
    inner: Mutex<GatewayState>,
    events: broadcast::Sender<MessageEvent>,
}

struct GatewayState {
    user_id: Option<String>,
    push_task: Option<JoinHandle<()>>,
}

impl HttpChannelGateway {
    pub fn new(base_url: impl Into<String>) -> Arc<Self> {
        Self::with_default_channel(base_url, DEFAULT_CHANNEL_NAME)
    }

    pub fn with_default_channel(
        base_url: impl Into<String>,
        default_channel_name: impl Into<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            base_url: base_url.into(),
            default_channel_name: default_channel_name.into(),
            inner: Mutex::new(GatewayState {
                user_id: None,
                push_task: None,
            }),
            events,
        })
    }

    async fn session_user(&self) -> Result<String> {
        self.inner
            .lock()
            .await
            .user_id
            .clone()
            .ok_or_else(|| anyhow!("not connected: missing user id"))
    }

    fn push_stream_url(&self, user_id: &str) -> Result<String> {
        let ws_base = if self.base_url.starts_with("https://") {
            self.base_url.replacen("https://", "wss://", 1)
        } else if self.base_url.starts_with("http://") {
            self.base_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("base_url must start with http:// or https://"));
        };
        Ok(format!("{ws_base}/events?user_id={user_id}"))
    }

    async fn spawn_push_stream(&self, user_id: &str) -> Result<JoinHandle<()>> {
        let ws_url = self.push_stream_url(user_id)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect push stream: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let events = self.events.clone();
        Ok(tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<PushFrame>(&text) {
                        Ok(frame) => {
                            let _ = events.send(event_from_frame(frame));
                        }
                        Err(err) => {
                            warn!("gateway: discarding invalid push frame: {err}");
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("gateway: push stream receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = events.send(MessageEvent::Disconnected);
        }))
    }
}

pub(crate) fn event_from_frame(frame: PushFrame) -> MessageEvent {
    match frame {
        PushFrame::MessageReceived { message } => match message.into_message() {
            Some(message) => MessageEvent::Message(message),
            None => MessageEvent::Unsupported,
        },
        PushFrame::MessageUpdated { message } => match message.into_message() {
            Some(message) => MessageEvent::Updated(message),
            None => MessageEvent::Unsupported,
        },
        PushFrame::MessageDeleted {
            channel_url,
            message_id,
        } => MessageEvent::Deleted {
            channel_url: ChannelUrl(channel_url),
            id: MessageId(message_id),
        },
        PushFrame::ChannelChanged { channel } => MessageEvent::ChannelChanged(channel.into_channel()),
        PushFrame::Unsupported => MessageEvent::Unsupported,
    }
}

#[async_trait]
impl ChannelGateway for HttpChannelGateway {
    async fn connect(&self, identity: &Identity) -> Result<()> {
        let response: ConnectResponse = self
            .http
            .post(format!("{}/connect", self.base_url))
            .json(&ConnectRequest {
                user_id: identity.user_id.0.clone(),
                nickname: identity.nickname.clone(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let task = self.spawn_push_stream(&response.user_id).await?;
        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.push_task.take() {
            previous.abort();
        }
        guard.user_id = Some(response.user_id);
        guard.push_task = Some(task);
        Ok(())
    }

    async fn resolve_default_channel(&self) -> Result<Channel> {
        let channels = self.list_channels().await?;
        if let Some(channel) = channels
            .into_iter()
            .find(|channel| channel.name == self.default_channel_name)
        {
            return Ok(channel);
        }
        let name = self.default_channel_name.clone();
        self.create_channel(&name).await
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let user_id = self.session_user().await?;
        let records: Vec<ChannelRecord> = self
            .http
            .get(format!("{}/channels", self.base_url))
            .query(&[("user_id", user_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records
            .into_iter()
            .map(ChannelRecord::into_channel)
            .collect())
    }

    async fn create_channel(&self, name: &str) -> Result<Channel> {
        let user_id = self.session_user().await?;
        let record: ChannelRecord = self
            .http
            .post(format!("{}/channels", self.base_url))
            .json(&CreateChannelRequest {
                name: name.to_string(),
                operator_id: user_id,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(record.into_channel())
    }

    async fn fetch_history(
        &self,
        channel_url: &ChannelUrl,
        limit: u32,
        anchor: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let user_id = self.session_user().await?;
        let limit = limit.clamp(1, 100);
        let records: Vec<MessageRecord> = self
            .http
            .get(format!(
                "{}/channels/{}/messages",
                self.base_url, channel_url
            ))
            .query(&HistoryQuery {
                user_id,
                limit,
                anchor_ms: anchor.timestamp_millis(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // The backend serves windows most-recent-first; callers get
        // oldest-first.
        let mut messages: Vec<Message> = records
            .into_iter()
            .filter_map(MessageRecord::into_message)
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn send(&self, channel_url: &ChannelUrl, text: &str) -> Result<Message> {
        let user_id = self.session_user().await?;
        let record: MessageRecord = self
            .http
            .post(format!(
                "{}/channels/{}/messages",
                self.base_url, channel_url
            ))
            .json(&SendMessageRequest {
                sender_id: user_id,
                text: text.to_string(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        record
            .into_message()
            .ok_or_else(|| anyhow!("backend returned an unsupported record for a sent message"))
    }

    async fn mark_read(&self, channel_url: &ChannelUrl) -> Result<()> {
        let user_id = self.session_user().await?;
        self.http
            .post(format!("{}/channels/{}/read", self.base_url, channel_url))
            .query(&[("user_id", user_id)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
