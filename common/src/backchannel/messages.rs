// Back-channel wire messages and the sink they are delivered to

use crate::errors::ExecutionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message sent by a child process about its own run
///
/// Wire form: `{"type":"started"}`, `{"type":"progress","percent":54}`,
/// `{"type":"ended","exitCode":0}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackChannelMessage {
    Started,
    Progress {
        percent: f64,
    },
    Ended {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
}

impl BackChannelMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BackChannelMessage::Started => "started",
            BackChannelMessage::Progress { .. } => "progress",
            BackChannelMessage::Ended { .. } => "ended",
        }
    }
}

/// Consumer of back-channel messages, keyed by correlation id
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Apply a message to its run
    ///
    /// Fails with `ExecutionError::UnknownJobRun` for ids that are unknown or
    /// already finalised.
    async fn deliver(
        &self,
        correlation_id: Uuid,
        message: BackChannelMessage,
    ) -> Result<(), ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(
            serde_json::to_value(BackChannelMessage::Started).unwrap(),
            serde_json::json!({"type": "started"})
        );
        assert_eq!(
            serde_json::from_str::<BackChannelMessage>(r#"{"type":"progress","percent":54}"#)
                .unwrap(),
            BackChannelMessage::Progress { percent: 54.0 }
        );
        assert_eq!(
            serde_json::from_str::<BackChannelMessage>(r#"{"type":"ended","exitCode":-1}"#)
                .unwrap(),
            BackChannelMessage::Ended { exit_code: -1 }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<BackChannelMessage>(r#"{"type":"paused"}"#).is_err());
        assert!(serde_json::from_str::<BackChannelMessage>(r#"{"type":"progress"}"#).is_err());
    }
}
