use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while parsing a feed document
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Document is not a recognizable feed: {0}")]
    NotParseable(String),

    #[error("XML error while reading feed: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// Classification of a failed load attempt, delivered to listeners.
///
/// Raw transport/parse errors never cross the event boundary; the loader
/// collapses them into one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// DNS failure, connection refused, timeout, null/malformed URL
    NotReachable,
    /// The fetched content is not a recognizable feed document
    NotParseable,
    /// The server responded with an authentication challenge
    AuthRequired,
    /// The caller declined or cancelled credential entry
    AccessDenied,
    /// The podcast is marked explicit and the caller's policy forbids it
    ExplicitBlocked,
    /// Null/invalid podcast reference or unclassified failure
    Unknown,
}

impl std::fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            LoadErrorKind::NotReachable => "feed not reachable",
            LoadErrorKind::NotParseable => "feed not parseable",
            LoadErrorKind::AuthRequired => "authentication required",
            LoadErrorKind::AccessDenied => "access denied",
            LoadErrorKind::ExplicitBlocked => "explicit content blocked",
            LoadErrorKind::Unknown => "unknown load failure",
        };
        f.write_str(text)
    }
}

/// Errors that can occur while loading a podcast feed
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to fetch {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Fetching {url} timed out")]
    Timeout { url: String },

    #[error("HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Feed body for {url} exceeds the size limit")]
    BodyTooLarge { url: String },

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Parse(#[from] FeedError),

    #[error("Podcast is marked explicit and explicit content is blocked")]
    ExplicitBlocked,

    #[error("Credential entry was declined")]
    AccessDenied,

    #[error("Load was cancelled")]
    Cancelled,

    #[error("Unknown podcast: {0}")]
    UnknownPodcast(String),
}

impl LoadError {
    /// Collapse to the listener-facing taxonomy
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            LoadError::FetchFailed { .. }
            | LoadError::Timeout { .. }
            | LoadError::BodyTooLarge { .. }
            | LoadError::InvalidUrl(_) => LoadErrorKind::NotReachable,
            LoadError::HttpStatus { status: 401, .. } => LoadErrorKind::AuthRequired,
            LoadError::HttpStatus { .. } => LoadErrorKind::NotReachable,
            LoadError::Parse(_) => LoadErrorKind::NotParseable,
            LoadError::ExplicitBlocked => LoadErrorKind::ExplicitBlocked,
            LoadError::AccessDenied => LoadErrorKind::AccessDenied,
            LoadError::Cancelled | LoadError::UnknownPodcast(_) => LoadErrorKind::Unknown,
        }
    }
}

/// Errors that can occur in the episode metadata store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read store file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write store file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse store file {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize store: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}
