use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

/// Classification consumed by [`crate::backoff::BackoffPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Dns,
    Connect,
    ReadTimeout,
    Server,
    Unsupported,
    /// Errors that retrying cannot fix: local storage, contract violations, cancellation.
    Fatal,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Dns,
    ConnectionRefused,
    ConnectTimeout,
    ReadTimeout,
    Other,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkKind::Dns => "host resolution failed",
            NetworkKind::ConnectionRefused => "connection refused",
            NetworkKind::ConnectTimeout => "connect timed out",
            NetworkKind::ReadTimeout => "read timed out",
            NetworkKind::Other => "transport error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedKind {
    Photo,
    LiveStream,
    Story,
    Private,
    Other,
}

impl UnsupportedKind {
    pub fn from_server_message(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        if lower.contains("photo") || lower.contains("image post") || lower.contains("carousel") {
            UnsupportedKind::Photo
        } else if lower.contains("live") {
            UnsupportedKind::LiveStream
        } else if lower.contains("story") || lower.contains("stories") {
            UnsupportedKind::Story
        } else if lower.contains("private") || lower.contains("login") {
            UnsupportedKind::Private
        } else {
            UnsupportedKind::Other
        }
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("unsupported content: {reason}")]
    Unsupported { kind: UnsupportedKind, reason: String },

    #[error("network error ({kind}): {detail}")]
    Network { kind: NetworkKind, detail: String },

    #[error("server returned HTTP {status}")]
    Server { status: u16 },

    #[error("storage error: {source}")]
    Storage {
        full: bool,
        #[source]
        source: io::Error,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type DownloadResult<T> = Result<T, DownloadError>;

impl DownloadError {
    pub fn unsupported(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        DownloadError::Unsupported {
            kind: UnsupportedKind::from_server_message(&reason),
            reason,
        }
    }

    /// Maps a transport failure onto the network taxonomy.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return DownloadError::Server { status: status.as_u16() };
        }
        let kind = if err.is_timeout() {
            if err.is_connect() {
                NetworkKind::ConnectTimeout
            } else {
                NetworkKind::ReadTimeout
            }
        } else if err.is_connect() {
            if chain_mentions(err, &["dns error", "failed to lookup", "name or service", "no such host"]) {
                NetworkKind::Dns
            } else if chain_mentions(err, &["timed out"]) {
                NetworkKind::ConnectTimeout
            } else {
                NetworkKind::ConnectionRefused
            }
        } else {
            NetworkKind::Other
        };
        DownloadError::Network {
            kind,
            detail: err.to_string(),
        }
    }

    pub fn from_io(source: io::Error) -> Self {
        let full = source.kind() == io::ErrorKind::StorageFull || source.raw_os_error() == Some(28);
        DownloadError::Storage { full, source }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DownloadError::Unsupported { .. } => ErrorClass::Unsupported,
            DownloadError::Network { kind, .. } => match kind {
                NetworkKind::Dns => ErrorClass::Dns,
                NetworkKind::ConnectionRefused | NetworkKind::ConnectTimeout => ErrorClass::Connect,
                NetworkKind::ReadTimeout => ErrorClass::ReadTimeout,
                NetworkKind::Other => ErrorClass::Other,
            },
            DownloadError::Server { status } if *status >= 500 || *status == 408 => ErrorClass::Server,
            DownloadError::Server { .. } => ErrorClass::Fatal,
            DownloadError::Storage { .. } | DownloadError::MalformedResponse(_) | DownloadError::Cancelled => {
                ErrorClass::Fatal
            }
            DownloadError::Other(_) => ErrorClass::Other,
        }
    }

    /// The one place raw failures become user-facing text.
    pub fn user_message(&self) -> String {
        match self {
            DownloadError::Unsupported { kind, reason } => match kind {
                UnsupportedKind::Photo => "This is a photo post. Only video posts can be downloaded.".to_string(),
                UnsupportedKind::LiveStream => "Live streams can't be downloaded. Try again after the stream ends.".to_string(),
                UnsupportedKind::Story => "Stories can't be downloaded.".to_string(),
                UnsupportedKind::Private => "This content is private or requires a login.".to_string(),
                UnsupportedKind::Other => reason.clone(),
            },
            DownloadError::Network { kind, .. } => match kind {
                NetworkKind::Dns => "Can't reach the server. Check your internet connection.".to_string(),
                NetworkKind::ConnectionRefused => "The server refused the connection. It may be down.".to_string(),
                NetworkKind::ConnectTimeout => "Connecting to the server timed out.".to_string(),
                NetworkKind::ReadTimeout => "The server took too long to respond. It may be waking up, try again.".to_string(),
                NetworkKind::Other => "Network error while talking to the server.".to_string(),
            },
            DownloadError::Server { status } => match status {
                408 => "The server timed out processing this link.".to_string(),
                500 => "The server hit an internal error (500).".to_string(),
                502 | 503 | 504 => format!("The server is busy or restarting ({}). Try again shortly.", status),
                s if *s >= 500 => format!("Server error ({}).", s),
                s => format!("The server rejected the request ({}).", s),
            },
            DownloadError::Storage { full: true, .. } => "Not enough storage space to save the file.".to_string(),
            DownloadError::Storage { source, .. } => format!("Couldn't save the file: {}", source),
            DownloadError::MalformedResponse(_) => "The server sent an unexpected response.".to_string(),
            DownloadError::Cancelled => "Download cancelled.".to_string(),
            DownloadError::Other(message) => message.clone(),
        }
    }
}

impl From<io::Error> for DownloadError {
    fn from(err: io::Error) -> Self {
        DownloadError::from_io(err)
    }
}

fn chain_mentions(err: &(dyn StdError + 'static), needles: &[&str]) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_lowercase();
        if needles.iter().any(|n| text.contains(n)) {
            return true;
        }
        current = e.source();
    }
    false
}
