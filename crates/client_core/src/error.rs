use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect push transport: {0}")]
    Connect(String),
    #[error("push transport read failed: {0}")]
    Read(String),
    #[error("push transport write failed: {0}")]
    Write(String),
    #[error("push connection is not established")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("fetch rejected by server: {0}")]
    Api(#[from] ApiError),
    #[error("unexpected response body: {0}")]
    UnexpectedBody(String),
    #[error("not signed in")]
    NotSignedIn,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("send request failed: {source}")]
    Network {
        #[source]
        source: reqwest::Error,
        temp_id: Option<String>,
    },
    #[error("send rejected by server: {source}")]
    Rejected {
        #[source]
        source: ApiError,
        temp_id: Option<String>,
    },
    #[error("send over push connection failed: {source}")]
    Transport {
        #[source]
        source: TransportError,
        temp_id: Option<String>,
    },
    #[error("not signed in")]
    NotSignedIn,
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("no conversation is open")]
    NoConversation,
    #[error("message {0} is not part of the open conversation")]
    UnknownMessage(String),
    #[error("operation is not supported for this conversation: {0}")]
    Unsupported(String),
}

impl SendError {
    /// Temporary id of the optimistic message left behind in `Failed` state.
    pub fn temp_id(&self) -> Option<&str> {
        match self {
            SendError::Network { temp_id, .. }
            | SendError::Rejected { temp_id, .. }
            | SendError::Transport { temp_id, .. } => temp_id.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn with_temp_id(self, id: &str) -> Self {
        match self {
            SendError::Network { source, .. } => SendError::Network {
                source,
                temp_id: Some(id.to_string()),
            },
            SendError::Rejected { source, .. } => SendError::Rejected {
                source,
                temp_id: Some(id.to_string()),
            },
            SendError::Transport { source, .. } => SendError::Transport {
                source,
                temp_id: Some(id.to_string()),
            },
            other => other,
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(source: reqwest::Error) -> Self {
        SendError::Network {
            source,
            temp_id: None,
        }
    }
}

impl From<TransportError> for SendError {
    fn from(source: TransportError) -> Self {
        SendError::Transport {
            source,
            temp_id: None,
        }
    }
}

impl From<ApiError> for SendError {
    fn from(source: ApiError) -> Self {
        SendError::Rejected {
            source,
            temp_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
