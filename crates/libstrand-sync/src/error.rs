use std::fmt;

use libstrand_core::event_bus::BoxError;
use libstrand_core::StrandError;
use libstrand_reactor::ReactorError;
use thiserror::Error;

/// Which side of a channel a failure happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorSource {
    Inbox,
    Outbox,
}

impl ChannelErrorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelErrorSource::Inbox => "inbox",
            ChannelErrorSource::Outbox => "outbox",
        }
    }
}

/// Failure attached to a sync operation
///
/// `source` names the failing mailbox side, not an underlying error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelError {
    pub source: ChannelErrorSource,
    pub message: String,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.source.as_str(), self.message)
    }
}

impl std::error::Error for ChannelError {}

impl ChannelError {
    pub fn inbox(message: impl Into<String>) -> Self {
        Self {
            source: ChannelErrorSource::Inbox,
            message: message.into(),
        }
    }

    pub fn outbox(message: impl Into<String>) -> Self {
        Self {
            source: ChannelErrorSource::Outbox,
            message: message.into(),
        }
    }
}

/// Failures of one or more mailbox callbacks during a single delivery
#[derive(Debug, Error)]
#[error("{} mailbox callback(s) failed: {}", errors.len(), errors.join("; "))]
pub struct MailboxCallbackError {
    pub errors: Vec<String>,
}

impl MailboxCallbackError {
    pub(crate) fn from_errors(errors: Vec<BoxError>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self {
                errors: errors.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote with name '{0}' already exists")]
    DuplicatedRemote(String),

    #[error("remote with name '{0}' does not exist")]
    RemoteNotFound(String),

    #[error("unknown channel type '{0}'")]
    UnknownChannelType(String),

    #[error("invalid channel parameters: {0}")]
    InvalidChannel(String),

    #[error("Channel {0} is shutdown and cannot receive envelopes")]
    ChannelShutdown(String),

    #[error("sync manager is shut down")]
    ShutDown,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Mailbox(#[from] MailboxCallbackError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Storage(#[from] StrandError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_display() {
        assert_eq!(ChannelError::outbox("peer gone").to_string(), "outbox error: peer gone");
        assert_eq!(ChannelError::inbox("bad").source, ChannelErrorSource::Inbox);
    }

    #[test]
    fn test_callback_errors_aggregate() {
        assert!(MailboxCallbackError::from_errors(Vec::new()).is_ok());
        let err = MailboxCallbackError::from_errors(vec!["a".into(), "b".into()]).unwrap_err();
        assert_eq!(err.to_string(), "2 mailbox callback(s) failed: a; b");
    }
}
