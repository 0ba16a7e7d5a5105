use thiserror::Error;

/// Errors produced while generating or invoking client operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The schema document could not be parsed.
    #[error("failed to parse schema: {0}")]
    SchemaParse(String),

    /// The type graph references a type that does not exist, or a root is unusable.
    #[error("schema inconsistency: {0}")]
    SchemaInconsistency(String),

    #[error("operation `{operation}` is missing required argument `{argument}`")]
    MissingArgument { operation: String, argument: String },

    #[error("operation `{operation}` has no argument named `{argument}`")]
    UnknownArgument { operation: String, argument: String },

    #[error("invalid value for argument `{argument}` of `{operation}`: {reason}")]
    InvalidArgument {
        operation: String,
        argument: String,
        reason: String,
    },

    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    /// The request transport reported a failure for a single query or mutation.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The channel refused a subscribe push.
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// Transport-level failure on the subscription channel.
    #[error("channel error: {0}")]
    Channel(String),

    /// The multiplexer has been shut down.
    #[error("subscription channel closed")]
    ChannelClosed,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::RequestFailed(format!("invalid JSON: {}", err))
    }
}

impl From<serde_yaml::Error> for ClientError {
    fn from(err: serde_yaml::Error) -> Self {
        ClientError::Config(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::RequestFailed("request timed out".to_string())
        } else {
            ClientError::RequestFailed(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
