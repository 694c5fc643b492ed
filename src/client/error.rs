use std::{io, sync::Arc};

use crate::messages::{ErrorCondition, MessageError};

#[derive(thiserror::Error, Debug, Clone)]
pub enum ClientError {
    #[error("No server answered the search for this channel name")]
    NameNotFound,
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("The channel or its circuit is disconnected")]
    Disconnected,
    #[error("Timed out waiting for the operation to complete")]
    Timeout,
    #[error("Send buffer is full")]
    ResourceExhausted,
    #[error("The channel has been destroyed")]
    ChannelDestroyed,
    #[error("The context is closing or has closed")]
    ContextClosed,
    #[error("Blocking calls cannot be made from inside a callback")]
    NotAllowedInCallback,
    #[error("Server reported failure ({0}): {1}")]
    Server(ErrorCondition, String),
    #[error("Failed to parse message from server")]
    ServerSentInvalidMessage,
    #[error("The server version ({0}) was incompatible")]
    ServerVersionMismatch(u16),
    #[error("{0}")]
    IO(Arc<io::Error>),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::IO(Arc::new(err))
    }
}

impl From<MessageError> for ClientError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::IO(err) => err.into(),
            MessageError::ProtocolViolation(reason) => ClientError::ProtocolViolation(reason),
            other => ClientError::ProtocolViolation(other.to_string()),
        }
    }
}

impl ClientError {
    /// Interpret a status code from a server reply
    pub(crate) fn check_status(status_code: u32) -> Result<(), ClientError> {
        match ErrorCondition::from_status_code(status_code) {
            Some(condition) if condition.is_success() => Ok(()),
            Some(condition) => Err(ClientError::Server(condition, condition.to_string())),
            None => Err(ClientError::ServerSentInvalidMessage),
        }
    }
}
