use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-usable classification of a session failure. Every gateway
/// failure is mapped onto exactly one of these at the controller boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    ChannelResolution,
    Fetch,
    Send,
    ChannelSwitch,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn channel_resolution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChannelResolution, message)
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fetch, message)
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Send, message)
    }

    pub fn channel_switch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChannelSwitch, message)
    }
}
