pub mod error;
pub mod events;
pub mod feed;
pub mod http;
pub mod loader;
pub mod model;
pub mod registry;
pub mod store;

// Re-export main types for convenience
pub use error::{FeedError, LoadError, LoadErrorKind, StoreError};
pub use events::{EventBus, ListEvent, LoadEvent, Progress, Subscription};
pub use feed::{ParsedEpisode, ParsedFeed, parse_feed};
pub use http::{Credentials, HttpClient, HttpResponse, ReqwestClient};
pub use loader::{FeedLoader, LoaderOptions};
pub use model::{Episode, Podcast, normalize_feed_url, resolve_relative};
pub use registry::{OpmlEntry, PodcastRegistry};
pub use store::{DownloadState, EpisodeMeta, EpisodeMetaStore};
