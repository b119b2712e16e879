/// Errors produced by the network-access layer.
///
/// This is a closed set: transport adapters classify whatever their
/// underlying client reports into one of these variants, and the executor
/// and connection manager only ever reason about the variant.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum NetError {
    /// The call was superseded or explicitly cancelled.
    #[error("aborted")]
    Aborted,

    #[error("client error: status={status} {message}")]
    Client { status: u16, message: String },

    #[error("transient error: {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("decode error: {cause}")]
    Decode { cause: String, payload: String },

    #[error("connection error: {cause}")]
    Connection { cause: String },
}

impl NetError {
    /// Returns `true` for errors the executor retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// HTTP-equivalent status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Client { status, .. } => Some(*status),
            Self::Transient { status, .. } => *status,
            _ => None,
        }
    }

    /// Classifies a non-success status code.
    ///
    /// 4xx is the caller's fault and never retried; everything else that is
    /// not a success is treated as a server-side condition worth retrying.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if (400..500).contains(&status) {
            Self::Client { status, message: message.into() }
        } else {
            Self::Transient { status: Some(status), message: message.into() }
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { status: None, message: message.into() }
    }

    pub fn decode(cause: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Decode { cause: cause.into(), payload: payload.into() }
    }

    pub fn connection(cause: impl Into<String>) -> Self {
        Self::Connection { cause: cause.into() }
    }
}

/// Errors raised while loading or validating [`crate::NetConfig`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}
