// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::AbortHandle;
use url::Url;

use crate::error::{LoadError, LoadErrorKind};
use crate::events::{EventBus, LoadEvent, Progress, Subscription};
use crate::feed::{ParsedFeed, parse_feed};
use crate::http::{Credentials, HttpClient};
use crate::model::Podcast;
use crate::registry::PodcastRegistry;
use crate::store::EpisodeMetaStore;

/// Tuning knobs for the loader
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Concurrent fetch+parse+merge tasks across all podcasts
    pub max_concurrent_loads: usize,
    /// Per-fetch timeout; expiry classifies as not-reachable
    pub fetch_timeout: Duration,
    /// Upper bound on accepted feed documents
    pub max_feed_bytes: usize,
    /// Refuse episode content marked explicit
    pub block_explicit: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 3,
            fetch_timeout: Duration::from_secs(30),
            max_feed_bytes: 10 * 1024 * 1024,
            block_explicit: false,
        }
    }
}

/// Orchestrates feed loads: one fetch+parse+merge task per podcast on a
/// bounded pool, with at most one in-flight load per feed identity.
///
/// The in-flight mark is set before the fetch begins and cleared only
/// after listeners were notified, so a caller issuing `load` mid-flight
/// can never double-trigger a fetch. All lifecycle events fan out to
/// every registered subscriber through the [`EventBus`]. Errors are
/// classified here; listeners only ever see [`LoadErrorKind`]s.
pub struct FeedLoader<C: HttpClient + 'static> {
    inner: Arc<LoaderInner<C>>,
}

impl<C: HttpClient + 'static> Clone for FeedLoader<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct LoaderInner<C> {
    client: C,
    registry: Arc<PodcastRegistry>,
    store: Arc<EpisodeMetaStore>,
    options: LoaderOptions,
    events: EventBus<LoadEvent>,
    in_flight: Mutex<HashMap<Url, AbortHandle>>,
    pool: Semaphore,
}

impl<C: HttpClient + 'static> FeedLoader<C> {
    pub fn new(
        client: C,
        registry: Arc<PodcastRegistry>,
        store: Arc<EpisodeMetaStore>,
        options: LoaderOptions,
    ) -> Self {
        let pool = Semaphore::new(options.max_concurrent_loads.max(1));
        let inner = Arc::new(LoaderInner {
            client,
            registry,
            store,
            options,
            events: EventBus::new(),
            in_flight: Mutex::new(HashMap::new()),
            pool,
        });

        // Best-effort cancellation: when the last subscriber interested
        // in a loading podcast detaches, abort that load
        let weak = Arc::downgrade(&inner);
        inner.events.set_detach_hook(move |filter| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let candidates: Vec<Url> = match filter {
                Some(url) => vec![url.clone()],
                None => inner
                    .in_flight
                    .lock()
                    .expect("loader lock poisoned")
                    .keys()
                    .cloned()
                    .collect(),
            };
            for url in candidates {
                if !inner.events.has_interest(&url) {
                    inner.cancel(&url);
                }
            }
        });

        Self { inner }
    }

    /// Listen to load lifecycle events for all podcasts
    pub fn subscribe(&self) -> Subscription<LoadEvent> {
        self.inner.events.subscribe()
    }

    /// Listen to load lifecycle events for one podcast identity
    pub fn subscribe_to(&self, url: &Url) -> Subscription<LoadEvent> {
        self.inner.events.subscribe_to(Some(url.clone()))
    }

    pub fn registry(&self) -> &Arc<PodcastRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<EpisodeMetaStore> {
        &self.inner.store
    }

    /// Start loading a podcast by identity. A no-op (not an error) when
    /// a load for that identity is already in flight.
    pub fn load(&self, url: &Url) {
        self.start_load(url, None);
    }

    /// Retry a load with credentials the caller collected after an
    /// auth-required failure. The credentials stick to the podcast on
    /// success.
    pub fn load_with_credentials(&self, url: &Url, credentials: Credentials) {
        self.start_load(url, Some(credentials));
    }

    /// Refresh every subscribed podcast
    pub fn load_all(&self) {
        for podcast in self.inner.registry.snapshot() {
            self.load(podcast.url());
        }
    }

    /// Report that the user declined credential entry for this podcast
    pub fn decline_credentials(&self, url: &Url) {
        let inner = &self.inner;
        let Some(podcast) = inner.registry.find(url) else {
            inner.events.emit(LoadEvent::Failed {
                podcast: url.clone(),
                error: LoadErrorKind::Unknown,
            });
            return;
        };

        let mut updated = (*podcast).clone();
        updated.register_failed_load();
        inner.registry.install(updated);
        inner.events.emit(LoadEvent::Failed {
            podcast: url.clone(),
            error: LoadErrorKind::AccessDenied,
        });
    }

    /// Whether a load for this identity is currently in flight
    pub fn is_loading(&self, url: &Url) -> bool {
        self.inner
            .in_flight
            .lock()
            .expect("loader lock poisoned")
            .contains_key(url)
    }

    /// Abort an in-flight load. No completion or failure event fires.
    pub fn cancel(&self, url: &Url) {
        self.inner.cancel(url);
    }

    /// Fetch a podcast's logo bytes, independent of the parse cycle, and
    /// cache them on the snapshot
    pub async fn load_logo(&self, url: &Url) -> Result<Arc<Podcast>, LoadError> {
        let inner = &self.inner;
        let podcast = inner
            .registry
            .find(url)
            .ok_or_else(|| LoadError::UnknownPodcast(url.to_string()))?;

        let Some(logo_url) = podcast.logo_url().cloned() else {
            return Ok(podcast);
        };

        let bytes = tokio::time::timeout(
            inner.options.fetch_timeout,
            inner
                .client
                .get_bytes(logo_url.as_str(), podcast.credentials()),
        )
        .await
        .map_err(|_| LoadError::Timeout {
            url: logo_url.to_string(),
        })?
        .map_err(|source| LoadError::FetchFailed {
            url: logo_url.to_string(),
            source,
        })?;

        let mut updated = (*podcast).clone();
        updated.set_logo(bytes);
        let snapshot = inner.registry.install(updated);
        inner.events.emit(LoadEvent::LogoLoaded {
            podcast: Arc::clone(&snapshot),
        });
        Ok(snapshot)
    }

    fn start_load(&self, url: &Url, credentials: Option<Credentials>) {
        let inner = &self.inner;
        let Some(podcast) = inner.registry.find(url) else {
            inner.events.emit(LoadEvent::Failed {
                podcast: url.clone(),
                error: LoadErrorKind::Unknown,
            });
            return;
        };

        let mut in_flight = inner.in_flight.lock().expect("loader lock poisoned");
        if in_flight.contains_key(url) {
            return;
        }

        // The task waits for the gate so its abort handle is registered
        // before any work starts
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            if gate_rx.await.is_err() {
                return;
            }
            run_load(task_inner, podcast, credentials).await;
        });
        in_flight.insert(url.clone(), handle.abort_handle());
        drop(in_flight);

        let _ = gate_tx.send(());
    }
}

impl<C> LoaderInner<C> {
    fn cancel(&self, url: &Url) {
        let handle = self
            .in_flight
            .lock()
            .expect("loader lock poisoned")
            .remove(url);
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!(podcast = %url, "Cancelled in-flight load");
        }
    }
}

async fn run_load<C: HttpClient>(
    inner: Arc<LoaderInner<C>>,
    podcast: Arc<Podcast>,
    credentials: Option<Credentials>,
) {
    let url = podcast.url().clone();

    let Ok(_permit) = inner.pool.acquire().await else {
        return;
    };

    inner.events.emit(LoadEvent::Progress {
        podcast: url.clone(),
        progress: Progress::Connecting,
    });

    let result = fetch_and_parse(&inner, &podcast, credentials.as_ref()).await;

    match result {
        Ok(parsed) => {
            let mut updated = (*podcast).clone();
            if let Some(credentials) = credentials {
                updated.set_credentials(Some(credentials));
            }

            if inner.options.block_explicit && parsed.explicit {
                updated.apply_blocked(parsed);
                updated.register_failed_load();
                inner.registry.install(updated);
                inner.events.emit(LoadEvent::Failed {
                    podcast: url.clone(),
                    error: LoadErrorKind::ExplicitBlocked,
                });
            } else {
                let mut parsed = parsed;
                if inner.options.block_explicit {
                    // The podcast itself is clean; only its explicit
                    // episodes are stripped
                    parsed.episodes.retain(|episode| !episode.explicit);
                }
                updated.apply(parsed);
                let snapshot = inner.registry.install(updated);
                let new_episodes = inner.store.new_count(snapshot.episodes());
                inner.events.emit(LoadEvent::Loaded {
                    podcast: snapshot,
                    new_episodes,
                });
            }
        }
        Err(error) => {
            tracing::warn!(podcast = %url, %error, "Podcast load failed");
            let mut updated = (*podcast).clone();
            updated.register_failed_load();
            inner.registry.install(updated);
            inner.events.emit(LoadEvent::Failed {
                podcast: url.clone(),
                error: error.kind(),
            });
        }
    }

    // Clear the in-flight mark only now that listeners were notified
    inner
        .in_flight
        .lock()
        .expect("loader lock poisoned")
        .remove(&url);
}

async fn fetch_and_parse<C: HttpClient>(
    inner: &LoaderInner<C>,
    podcast: &Podcast,
    credentials: Option<&Credentials>,
) -> Result<ParsedFeed, LoadError> {
    let url = podcast.url();
    let credentials = credentials.or(podcast.credentials());

    let response = tokio::time::timeout(
        inner.options.fetch_timeout,
        inner.client.get_stream(url.as_str(), credentials),
    )
    .await
    .map_err(|_| LoadError::Timeout {
        url: url.to_string(),
    })?
    .map_err(|source| LoadError::FetchFailed {
        url: url.to_string(),
        source,
    })?;

    if response.status >= 400 {
        return Err(LoadError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    let content_length = response.content_length;
    let mut body = response.body;
    let mut bytes: Vec<u8> = Vec::new();
    let mut last_percent = None;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|source| LoadError::FetchFailed {
            url: url.to_string(),
            source,
        })?;

        if bytes.len().saturating_add(chunk.len()) > inner.options.max_feed_bytes {
            return Err(LoadError::BodyTooLarge {
                url: url.to_string(),
            });
        }
        bytes.extend_from_slice(&chunk);

        if let Some(total) = content_length.filter(|total| *total > 0) {
            let percent = ((bytes.len() as u64).saturating_mul(100) / total).min(100) as u8;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                inner.events.emit(LoadEvent::Progress {
                    podcast: url.clone(),
                    progress: Progress::Downloading(percent),
                });
            }
        }
    }

    inner.events.emit(LoadEvent::Progress {
        podcast: url.clone(),
        progress: Progress::Parsing,
    });

    Ok(parse_feed(&bytes, url)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, HttpResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE_FEED: &str = r#"<rss><channel><title>Test Podcast</title>
        <item><title>Episode 1</title>
        <pubDate>Mon, 01 Jan 2024 12:00:00 +0000</pubDate>
        <enclosure url="https://example.com/ep1.mp3"/></item>
        <item><title>Episode 2</title>
        <pubDate>Tue, 02 Jan 2024 12:00:00 +0000</pubDate>
        <enclosure url="https://example.com/ep2.mp3"/></item>
        </channel></rss>"#;

    struct MockHttpClient {
        body: Mutex<Vec<u8>>,
        delay: Duration,
        required_auth: Option<Credentials>,
        fetches: AtomicUsize,
    }

    impl MockHttpClient {
        fn raw(body: &str) -> MockHttpClient {
            MockHttpClient {
                body: Mutex::new(body.as_bytes().to_vec()),
                delay: Duration::ZERO,
                required_auth: None,
                fetches: AtomicUsize::new(0),
            }
        }

        fn serving(body: &str) -> Arc<Self> {
            Arc::new(Self::raw(body))
        }

        fn with_delay(body: &str, delay: Duration) -> Arc<Self> {
            let mut client = Self::raw(body);
            client.delay = delay;
            Arc::new(client)
        }

        fn protected(body: &str, auth: Credentials) -> Arc<Self> {
            let mut client = Self::raw(body);
            client.required_auth = Some(auth);
            Arc::new(client)
        }

        fn set_body(&self, body: &str) {
            *self.body.lock().unwrap() = body.as_bytes().to_vec();
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn effective_status(&self, credentials: Option<&Credentials>) -> u16 {
            match &self.required_auth {
                Some(required) if credentials != Some(required) => 401,
                _ => 200,
            }
        }
    }

    #[async_trait]
    impl HttpClient for Arc<MockHttpClient> {
        async fn get_bytes(
            &self,
            _url: &str,
            _credentials: Option<&Credentials>,
        ) -> Result<Bytes, reqwest::Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Bytes::from(self.body.lock().unwrap().clone()))
        }

        async fn get_stream(
            &self,
            _url: &str,
            credentials: Option<&Credentials>,
        ) -> Result<HttpResponse, reqwest::Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let status = self.effective_status(credentials);
            let data = self.body.lock().unwrap().clone();
            let len = data.len() as u64;
            let stream: ByteStream =
                Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }));

            Ok(HttpResponse {
                status,
                content_length: Some(len),
                body: stream,
            })
        }
    }

    struct Fixture {
        loader: FeedLoader<Arc<MockHttpClient>>,
        client: Arc<MockHttpClient>,
        url: Url,
        _dir: tempfile::TempDir,
    }

    fn fixture(client: Arc<MockHttpClient>, options: LoaderOptions) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = PodcastRegistry::new();
        let store = EpisodeMetaStore::new(dir.path().join("episodes.json"));
        let podcast = registry.add(Podcast::new(None, "http://example.com/feed").unwrap());
        let url = podcast.url().clone();
        Fixture {
            loader: FeedLoader::new(Arc::clone(&client), registry, store, options),
            client,
            url,
            _dir: dir,
        }
    }

    async fn next_terminal(events: &mut Subscription<LoadEvent>) -> LoadEvent {
        loop {
            match events.recv().await {
                Some(LoadEvent::Progress { .. }) => continue,
                Some(event) => return event,
                None => panic!("event bus closed"),
            }
        }
    }

    #[tokio::test]
    async fn successful_load_updates_registry_and_notifies() {
        let fx = fixture(MockHttpClient::serving(SAMPLE_FEED), LoaderOptions::default());
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);

        match next_terminal(&mut events).await {
            LoadEvent::Loaded {
                podcast,
                new_episodes,
            } => {
                assert_eq!(podcast.name(), Some("Test Podcast"));
                assert_eq!(podcast.episode_count(), 2);
                assert_eq!(new_episodes, 2);
                assert!(podcast.last_loaded().is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let current = fx.loader.registry().find(&fx.url).unwrap();
        assert_eq!(current.episode_count(), 2);
        assert!(!fx.loader.is_loading(&fx.url));
    }

    #[tokio::test]
    async fn progress_events_run_connecting_to_parsing() {
        let fx = fixture(MockHttpClient::serving(SAMPLE_FEED), LoaderOptions::default());
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);

        let mut phases = Vec::new();
        loop {
            match events.recv().await {
                Some(LoadEvent::Progress { progress, .. }) => phases.push(progress),
                Some(LoadEvent::Loaded { .. }) => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }

        assert_eq!(phases.first(), Some(&Progress::Connecting));
        assert_eq!(phases.last(), Some(&Progress::Parsing));
        assert!(phases.contains(&Progress::Downloading(100)));
    }

    #[tokio::test]
    async fn concurrent_loads_for_same_identity_fetch_once() {
        let client = MockHttpClient::with_delay(SAMPLE_FEED, Duration::from_millis(50));
        let fx = fixture(client, LoaderOptions::default());
        let mut first = fx.loader.subscribe();
        let mut second = fx.loader.subscribe();

        fx.loader.load(&fx.url);
        fx.loader.load(&fx.url);

        assert!(matches!(
            next_terminal(&mut first).await,
            LoadEvent::Loaded { .. }
        ));
        assert!(matches!(
            next_terminal(&mut second).await,
            LoadEvent::Loaded { .. }
        ));
        assert_eq!(fx.client.fetch_count(), 1);
    }

    #[tokio::test]
    async fn garbage_body_fails_as_not_parseable_and_keeps_prior_episodes() {
        let fx = fixture(MockHttpClient::serving(SAMPLE_FEED), LoaderOptions::default());
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);
        assert!(matches!(
            next_terminal(&mut events).await,
            LoadEvent::Loaded { .. }
        ));

        fx.client.set_body("<html>definitely no feed here</html>");
        fx.loader.load(&fx.url);

        match next_terminal(&mut events).await {
            LoadEvent::Failed { error, .. } => {
                assert_eq!(error, LoadErrorKind::NotParseable)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let current = fx.loader.registry().find(&fx.url).unwrap();
        assert_eq!(current.episode_count(), 2);
        assert_eq!(current.failed_load_attempts(), 1);
        assert!(current.last_loaded().is_some());
    }

    #[tokio::test]
    async fn failure_counter_resets_on_success() {
        let fx = fixture(
            MockHttpClient::serving("<html>broken</html>"),
            LoaderOptions::default(),
        );
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);
        next_terminal(&mut events).await;
        fx.loader.load(&fx.url);
        next_terminal(&mut events).await;
        assert_eq!(
            fx.loader.registry().find(&fx.url).unwrap().failed_load_attempts(),
            2
        );

        fx.client.set_body(SAMPLE_FEED);
        fx.loader.load(&fx.url);
        assert!(matches!(
            next_terminal(&mut events).await,
            LoadEvent::Loaded { .. }
        ));
        assert_eq!(
            fx.loader.registry().find(&fx.url).unwrap().failed_load_attempts(),
            0
        );
    }

    #[tokio::test]
    async fn timeout_classifies_as_not_reachable() {
        let client = MockHttpClient::with_delay(SAMPLE_FEED, Duration::from_millis(200));
        let options = LoaderOptions {
            fetch_timeout: Duration::from_millis(30),
            ..LoaderOptions::default()
        };
        let fx = fixture(client, options);
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);

        match next_terminal(&mut events).await {
            LoadEvent::Failed { error, .. } => {
                assert_eq!(error, LoadErrorKind::NotReachable)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_challenge_then_credentials_then_success() {
        let auth = Credentials::new("kevin", "monkey");
        let fx = fixture(
            MockHttpClient::protected(SAMPLE_FEED, auth.clone()),
            LoaderOptions::default(),
        );
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);
        match next_terminal(&mut events).await {
            LoadEvent::Failed { error, .. } => {
                assert_eq!(error, LoadErrorKind::AuthRequired)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        fx.loader.load_with_credentials(&fx.url, auth.clone());
        assert!(matches!(
            next_terminal(&mut events).await,
            LoadEvent::Loaded { .. }
        ));

        let current = fx.loader.registry().find(&fx.url).unwrap();
        assert_eq!(current.credentials(), Some(&auth));
        assert_eq!(current.failed_load_attempts(), 0);
    }

    #[tokio::test]
    async fn declining_credentials_reports_access_denied() {
        let fx = fixture(MockHttpClient::serving(SAMPLE_FEED), LoaderOptions::default());
        let mut events = fx.loader.subscribe();

        fx.loader.decline_credentials(&fx.url);

        match next_terminal(&mut events).await {
            LoadEvent::Failed { error, .. } => {
                assert_eq!(error, LoadErrorKind::AccessDenied)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            fx.loader.registry().find(&fx.url).unwrap().failed_load_attempts(),
            1
        );
    }

    #[tokio::test]
    async fn explicit_podcast_is_blocked_by_policy() {
        let explicit_feed = r#"<rss><channel><title>Rude Show</title>
            <itunes:explicit>yes</itunes:explicit>
            <item><title>Ep</title><enclosure url="https://example.com/1.mp3"/></item>
            </channel></rss>"#;
        let options = LoaderOptions {
            block_explicit: true,
            ..LoaderOptions::default()
        };
        let fx = fixture(MockHttpClient::serving(explicit_feed), options);
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);

        match next_terminal(&mut events).await {
            LoadEvent::Failed { error, .. } => {
                assert_eq!(error, LoadErrorKind::ExplicitBlocked)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let current = fx.loader.registry().find(&fx.url).unwrap();
        assert!(current.explicit());
        assert_eq!(current.episode_count(), 0);
        assert_eq!(current.name(), Some("Rude Show"));
        assert!(current.last_loaded().is_none());
        assert_eq!(current.failed_load_attempts(), 1);
    }

    #[tokio::test]
    async fn explicit_episodes_are_stripped_not_fatal() {
        let mixed_feed = r#"<rss><channel><title>Mostly Clean</title>
            <item><title>Clean</title><enclosure url="https://example.com/clean.mp3"/></item>
            <item><title>Rude</title><enclosure url="https://example.com/rude.mp3"/>
            <itunes:explicit>yes</itunes:explicit></item>
            </channel></rss>"#;
        let options = LoaderOptions {
            block_explicit: true,
            ..LoaderOptions::default()
        };
        let fx = fixture(MockHttpClient::serving(mixed_feed), options);
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);

        match next_terminal(&mut events).await {
            LoadEvent::Loaded { podcast, .. } => {
                assert_eq!(podcast.episode_count(), 1);
                assert_eq!(podcast.episodes()[0].name, "Clean");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn loading_unknown_podcast_fails_as_unknown() {
        let fx = fixture(MockHttpClient::serving(SAMPLE_FEED), LoaderOptions::default());
        let mut events = fx.loader.subscribe();

        let stranger = Url::parse("http://example.com/not-subscribed").unwrap();
        fx.loader.load(&stranger);

        match next_terminal(&mut events).await {
            LoadEvent::Failed { podcast, error } => {
                assert_eq!(podcast, stranger);
                assert_eq!(error, LoadErrorKind::Unknown);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_aborts_without_completion_events() {
        let client = MockHttpClient::with_delay(SAMPLE_FEED, Duration::from_millis(200));
        let fx = fixture(client, LoaderOptions::default());
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.loader.cancel(&fx.url);
        assert!(!fx.loader.is_loading(&fx.url));

        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Some(event) = events.try_recv() {
            assert!(
                matches!(event, LoadEvent::Progress { .. }),
                "cancelled load must not complete or fail: {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn last_interested_subscriber_detaching_cancels_the_load() {
        let client = MockHttpClient::with_delay(SAMPLE_FEED, Duration::from_millis(200));
        let fx = fixture(client, LoaderOptions::default());

        let subscription = fx.loader.subscribe_to(&fx.url);
        fx.loader.load(&fx.url);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.loader.is_loading(&fx.url));

        drop(subscription);
        assert!(!fx.loader.is_loading(&fx.url));
    }

    #[tokio::test]
    async fn load_all_refreshes_every_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PodcastRegistry::new();
        let store = EpisodeMetaStore::new(dir.path().join("episodes.json"));
        registry.add(Podcast::new(Some("A"), "http://example.com/a").unwrap());
        registry.add(Podcast::new(Some("B"), "http://example.com/b").unwrap());

        let client = MockHttpClient::serving(SAMPLE_FEED);
        let loader = FeedLoader::new(
            Arc::clone(&client),
            registry,
            store,
            LoaderOptions::default(),
        );
        let mut events = loader.subscribe();

        loader.load_all();

        let mut loaded = 0;
        while loaded < 2 {
            if matches!(next_terminal(&mut events).await, LoadEvent::Loaded { .. }) {
                loaded += 1;
            }
        }
        assert_eq!(client.fetch_count(), 2);
    }

    #[tokio::test]
    async fn logo_loads_outside_the_parse_cycle() {
        let with_logo = r#"<rss><channel><title>T</title>
            <itunes:image href="https://example.com/logo.png"/>
            <item><title>Ep</title><enclosure url="https://example.com/1.mp3"/></item>
            </channel></rss>"#;
        let fx = fixture(MockHttpClient::serving(with_logo), LoaderOptions::default());
        let mut events = fx.loader.subscribe();

        fx.loader.load(&fx.url);
        assert!(matches!(
            next_terminal(&mut events).await,
            LoadEvent::Loaded { .. }
        ));
        assert!(fx.loader.registry().find(&fx.url).unwrap().logo().is_none());

        let snapshot = fx.loader.load_logo(&fx.url).await.unwrap();
        assert!(snapshot.logo().is_some());
        assert!(matches!(
            next_terminal(&mut events).await,
            LoadEvent::LogoLoaded { .. }
        ));
    }
}
