// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::error::StoreError;
use crate::model::Episode;

const DEFAULT_SAVE_DELAY: Duration = Duration::from_secs(2);

/// Download bookkeeping for one episode. The actual transfer is the
/// download manager's business; only its state lives here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    NotDownloaded,
    Downloading {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },
    Downloaded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },
}

impl DownloadState {
    pub fn is_downloading(&self) -> bool {
        matches!(self, DownloadState::Downloading { .. })
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(self, DownloadState::Downloaded { .. })
    }
}

/// Durable per-episode state, keyed by the episode's media URL so it
/// survives re-parses of the owning feed and process restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMeta {
    /// Whether the episode has been seen/listened to; new = !old
    #[serde(default)]
    pub old: bool,
    /// Playback resume position in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<u64>,
    #[serde(default)]
    pub download: DownloadState,
    /// Dense, gap-free playlist slot; absent = not enqueued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_position: Option<usize>,

    // Enough of the episode itself to answer queries after a restart,
    // before (or without) the owning feed being re-parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub podcast_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_pub_date: Option<DateTime<Utc>>,
}

impl EpisodeMeta {
    /// An entry holding no actual state; pruned rather than persisted
    fn is_vacant(&self) -> bool {
        !self.old
            && self.resume_at.is_none()
            && self.download == DownloadState::NotDownloaded
            && self.playlist_position.is_none()
    }
}

/// Persistent store for per-episode metadata: read state, resume
/// position, download bookkeeping and the playlist ordering.
///
/// The in-memory map is populated by [`load`](Self::load); callers that
/// need synchronous guarantees await
/// [`block_until_loaded`](Self::block_until_loaded) once at startup.
/// Mutations go through the single writer lock and nudge a background
/// saver that coalesces them into one write per debounce window;
/// [`flush`](Self::flush) forces a write and must be called on teardown.
/// Construct inside a Tokio runtime — the saver is a spawned task.
pub struct EpisodeMetaStore {
    path: PathBuf,
    entries: RwLock<HashMap<Url, EpisodeMeta>>,
    save_tx: mpsc::UnboundedSender<()>,
    loaded_tx: watch::Sender<bool>,
    loaded_rx: watch::Receiver<bool>,
}

impl EpisodeMetaStore {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_save_delay(path, DEFAULT_SAVE_DELAY)
    }

    /// Store with a custom debounce window (tests use a short one)
    pub fn with_save_delay(path: impl Into<PathBuf>, save_delay: Duration) -> Arc<Self> {
        let (loaded_tx, loaded_rx) = watch::channel(false);
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            path: path.into(),
            entries: RwLock::new(HashMap::new()),
            save_tx,
            loaded_tx,
            loaded_rx,
        });

        tokio::spawn(saver(Arc::downgrade(&store), save_rx, save_delay));
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Populate the map from durable storage. A missing file is an empty
    /// store; a corrupt file starts empty but reports the error. Either
    /// way the store counts as loaded afterwards, so waiting callers
    /// unblock.
    pub async fn load(&self) -> Result<(), StoreError> {
        let result = match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                serde_json::from_slice::<HashMap<Url, EpisodeMeta>>(&bytes)
                    .map_err(|e| StoreError::JsonParseFailed {
                        path: self.path.clone(),
                        source: e,
                    })
                    .map(|map| {
                        *self.entries.write().expect("store lock poisoned") = map;
                    })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::ReadFailed {
                path: self.path.clone(),
                source: e,
            }),
        };

        if let Err(error) = &result {
            tracing::warn!(path = %self.path.display(), %error, "Episode metadata unreadable, starting empty");
        }

        let _ = self.loaded_tx.send(true);
        result
    }

    /// Wait until [`load`](Self::load) has completed. Call once at
    /// startup before trusting any metadata read.
    pub async fn block_until_loaded(&self) {
        let mut rx = self.loaded_rx.clone();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Current metadata for an episode; default state if none is stored
    pub fn meta(&self, episode: &Episode) -> EpisodeMeta {
        self.meta_for_url(&episode.media_url)
    }

    pub fn meta_for_url(&self, media_url: &Url) -> EpisodeMeta {
        self.entries
            .read()
            .expect("store lock poisoned")
            .get(media_url)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_old(&self, episode: &Episode) -> bool {
        self.meta(episode).old
    }

    /// Number of episodes in the given list not yet marked old
    pub fn new_count(&self, episodes: &[Episode]) -> usize {
        let entries = self.entries.read().expect("store lock poisoned");
        episodes
            .iter()
            .filter(|episode| {
                entries
                    .get(&episode.media_url)
                    .is_none_or(|meta| !meta.old)
            })
            .count()
    }

    pub fn set_old(&self, episode: &Episode, old: bool) {
        self.mutate(episode, |meta| meta.old = old);
    }

    pub fn set_resume_at(&self, episode: &Episode, resume_at: Option<u64>) {
        self.mutate(episode, |meta| meta.resume_at = resume_at);
    }

    pub fn set_download_state(&self, episode: &Episode, download: DownloadState) {
        self.mutate(episode, |meta| meta.download = download);
    }

    /// Forget a finished or in-flight download
    pub fn delete_download(&self, episode: &Episode) {
        self.mutate(episode, |meta| meta.download = DownloadState::NotDownloaded);
    }

    /// All episodes with an active download, optionally limited to one
    /// owning podcast
    pub fn downloading(&self, podcast: Option<&Url>) -> Vec<(Url, EpisodeMeta)> {
        self.collect_matching(podcast, |meta| meta.download.is_downloading())
    }

    /// All fully downloaded episodes, optionally limited to one owning
    /// podcast
    pub fn downloaded(&self, podcast: Option<&Url>) -> Vec<(Url, EpisodeMeta)> {
        self.collect_matching(podcast, |meta| meta.download.is_downloaded())
    }

    /// Append an episode to the end of the playlist. Re-enqueuing an
    /// episode that is already in the playlist moves it to the end.
    pub fn playlist_append(&self, episode: &Episode) {
        self.playlist_insert(episode, usize::MAX);
    }

    /// Put an episode at `position` in the playlist, shifting everything
    /// at or after it one slot up. Positions stay dense and gap-free;
    /// out-of-range positions clamp to the end.
    pub fn playlist_insert(&self, episode: &Episode, position: usize) {
        {
            let mut entries = self.entries.write().expect("store lock poisoned");

            // A move is a remove followed by an insert
            if let Some(current) = entries
                .get(&episode.media_url)
                .and_then(|meta| meta.playlist_position)
            {
                for meta in entries.values_mut() {
                    if let Some(pos) = meta.playlist_position
                        && pos > current
                    {
                        meta.playlist_position = Some(pos - 1);
                    }
                }
                if let Some(meta) = entries.get_mut(&episode.media_url) {
                    meta.playlist_position = None;
                }
            }

            let len = entries
                .values()
                .filter(|meta| meta.playlist_position.is_some())
                .count();
            let position = position.min(len);

            for meta in entries.values_mut() {
                if let Some(pos) = meta.playlist_position
                    && pos >= position
                {
                    meta.playlist_position = Some(pos + 1);
                }
            }

            let entry = entries
                .entry(episode.media_url.clone())
                .or_insert_with(|| fresh_meta(episode));
            entry.playlist_position = Some(position);
        }
        self.schedule_save();
    }

    /// Remove an episode from the playlist, shifting everything after it
    /// one slot down
    pub fn playlist_remove(&self, episode: &Episode) {
        {
            let mut entries = self.entries.write().expect("store lock poisoned");
            let Some(removed) = entries
                .get(&episode.media_url)
                .and_then(|meta| meta.playlist_position)
            else {
                return;
            };

            if let Some(meta) = entries.get_mut(&episode.media_url) {
                meta.playlist_position = None;
            }
            for meta in entries.values_mut() {
                if let Some(pos) = meta.playlist_position
                    && pos > removed
                {
                    meta.playlist_position = Some(pos - 1);
                }
            }
            entries.retain(|_, meta| !meta.is_vacant());
        }
        self.schedule_save();
    }

    pub fn playlist_position(&self, episode: &Episode) -> Option<usize> {
        self.entries
            .read()
            .expect("store lock poisoned")
            .get(&episode.media_url)
            .and_then(|meta| meta.playlist_position)
    }

    /// The playlist in order, optionally limited to one owning podcast
    pub fn playlist(&self, podcast: Option<&Url>) -> Vec<(Url, EpisodeMeta)> {
        let mut list = self.collect_matching(podcast, |meta| meta.playlist_position.is_some());
        list.sort_by_key(|(_, meta)| meta.playlist_position);
        list
    }

    /// Drop every entry. Only explicit user action gets here.
    pub fn reset(&self) {
        self.entries.write().expect("store lock poisoned").clear();
        self.schedule_save();
    }

    /// Write the current state out now. Called on teardown.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let snapshot: HashMap<Url, EpisodeMeta> = {
            let entries = self.entries.read().expect("store lock poisoned");
            entries
                .iter()
                .filter(|(_, meta)| !meta.is_vacant())
                .map(|(url, meta)| (url.clone(), meta.clone()))
                .collect()
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: self.path.clone(),
                source: e,
            })
    }

    fn mutate(&self, episode: &Episode, update: impl FnOnce(&mut EpisodeMeta)) {
        {
            let mut entries = self.entries.write().expect("store lock poisoned");
            let entry = entries
                .entry(episode.media_url.clone())
                .or_insert_with(|| fresh_meta(episode));
            update(entry);
            if entry.is_vacant() {
                entries.remove(&episode.media_url);
            }
        }
        self.schedule_save();
    }

    fn collect_matching(
        &self,
        podcast: Option<&Url>,
        predicate: impl Fn(&EpisodeMeta) -> bool,
    ) -> Vec<(Url, EpisodeMeta)> {
        let entries = self.entries.read().expect("store lock poisoned");
        entries
            .iter()
            .filter(|(_, meta)| predicate(meta))
            .filter(|(_, meta)| {
                podcast.is_none_or(|wanted| meta.podcast_url.as_ref() == Some(wanted))
            })
            .map(|(url, meta)| (url.clone(), meta.clone()))
            .collect()
    }

    fn schedule_save(&self) {
        let _ = self.save_tx.send(());
    }
}

/// Background writer: a nudge starts the debounce window, every further
/// nudge inside it rides along, then the map is written once
async fn saver(
    store: Weak<EpisodeMetaStore>,
    mut nudges: mpsc::UnboundedReceiver<()>,
    delay: Duration,
) {
    while nudges.recv().await.is_some() {
        tokio::time::sleep(delay).await;
        while nudges.try_recv().is_ok() {}

        let Some(store) = store.upgrade() else {
            break;
        };
        if let Err(error) = store.flush().await {
            tracing::warn!(%error, "Deferred episode metadata save failed");
        }
    }
}

fn fresh_meta(episode: &Episode) -> EpisodeMeta {
    EpisodeMeta {
        podcast_url: Some(episode.podcast_url.clone()),
        episode_name: Some(episode.name.clone()),
        episode_pub_date: episode.pub_date,
        ..EpisodeMeta::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn episode(media: &str) -> Episode {
        episode_of("http://example.com/feed", media)
    }

    fn episode_of(podcast: &str, media: &str) -> Episode {
        Episode {
            podcast_url: Url::parse(podcast).unwrap(),
            index: -1,
            name: media.rsplit('/').next().unwrap_or("ep").to_string(),
            media_url: Url::parse(media).unwrap(),
            pub_date: None,
            duration: -1,
            description: None,
            long_description: None,
            explicit: false,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> Arc<EpisodeMetaStore> {
        EpisodeMetaStore::with_save_delay(
            dir.path().join("episodes.json"),
            Duration::from_millis(20),
        )
    }

    fn playlist_urls(store: &EpisodeMetaStore) -> Vec<String> {
        store
            .playlist(None)
            .into_iter()
            .map(|(url, _)| url.to_string())
            .collect()
    }

    #[tokio::test]
    async fn meta_defaults_until_mutated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let ep = episode("http://example.com/1.mp3");

        let meta = store.meta(&ep);
        assert!(!meta.old);
        assert_eq!(meta.download, DownloadState::NotDownloaded);
        assert_eq!(meta.playlist_position, None);

        store.set_old(&ep, true);
        assert!(store.meta(&ep).old);
    }

    #[tokio::test]
    async fn metadata_survives_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let ep = episode("http://example.com/1.mp3");

        {
            let store = store_in(&dir);
            store.load().await.unwrap();
            store.set_old(&ep, true);
            store.set_resume_at(&ep, Some(90_000));
            store.set_download_state(
                &ep,
                DownloadState::Downloaded {
                    file: Some("1.mp3".into()),
                },
            );
            store.flush().await.unwrap();
        }

        let store = store_in(&dir);
        store.load().await.unwrap();
        store.block_until_loaded().await;

        let meta = store.meta(&ep);
        assert!(meta.old);
        assert_eq!(meta.resume_at, Some(90_000));
        assert!(meta.download.is_downloaded());
        assert_eq!(
            meta.podcast_url.as_ref().map(Url::as_str),
            Some("http://example.com/feed")
        );
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.load().await.unwrap();
        store.block_until_loaded().await;
        assert!(!store.meta(&episode("http://example.com/1.mp3")).old);
    }

    #[tokio::test]
    async fn playlist_insert_keeps_positions_dense() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let eps: Vec<_> = (1..=4)
            .map(|n| episode(&format!("http://example.com/{n}.mp3")))
            .collect();
        for ep in &eps[..3] {
            store.playlist_append(ep);
        }
        assert_eq!(
            playlist_urls(&store),
            vec![
                "http://example.com/1.mp3",
                "http://example.com/2.mp3",
                "http://example.com/3.mp3",
            ]
        );

        // Insert at the front: the other three shift to 1, 2, 3
        store.playlist_insert(&eps[3], 0);
        assert_eq!(
            playlist_urls(&store),
            vec![
                "http://example.com/4.mp3",
                "http://example.com/1.mp3",
                "http://example.com/2.mp3",
                "http://example.com/3.mp3",
            ]
        );
        let positions: Vec<_> = store
            .playlist(None)
            .iter()
            .map(|(_, meta)| meta.playlist_position.unwrap())
            .collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn playlist_remove_renumbers_contiguously() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let eps: Vec<_> = (1..=4)
            .map(|n| episode(&format!("http://example.com/{n}.mp3")))
            .collect();
        for ep in &eps {
            store.playlist_append(ep);
        }

        store.playlist_remove(&eps[1]);

        assert_eq!(
            playlist_urls(&store),
            vec![
                "http://example.com/1.mp3",
                "http://example.com/3.mp3",
                "http://example.com/4.mp3",
            ]
        );
        let positions: Vec<_> = store
            .playlist(None)
            .iter()
            .map(|(_, meta)| meta.playlist_position.unwrap())
            .collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn reenqueue_moves_instead_of_duplicating() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let a = episode("http://example.com/a.mp3");
        let b = episode("http://example.com/b.mp3");
        store.playlist_append(&a);
        store.playlist_append(&b);

        store.playlist_append(&a);

        assert_eq!(
            playlist_urls(&store),
            vec!["http://example.com/b.mp3", "http://example.com/a.mp3"]
        );
    }

    #[tokio::test]
    async fn playlist_filters_by_owning_podcast() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mine = episode_of("http://example.com/feed", "http://example.com/a.mp3");
        let other = episode_of("http://other.com/feed", "http://other.com/b.mp3");
        store.playlist_append(&mine);
        store.playlist_append(&other);

        let filter = Url::parse("http://example.com/feed").unwrap();
        let filtered = store.playlist(Some(&filter));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0.as_str(), "http://example.com/a.mp3");
        assert_eq!(store.playlist(None).len(), 2);
    }

    #[tokio::test]
    async fn download_queries_split_by_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let active = episode("http://example.com/active.mp3");
        let done = episode("http://example.com/done.mp3");
        store.set_download_state(&active, DownloadState::Downloading { percent: Some(40) });
        store.set_download_state(&done, DownloadState::Downloaded { file: None });

        let downloading = store.downloading(None);
        assert_eq!(downloading.len(), 1);
        assert_eq!(downloading[0].0.as_str(), "http://example.com/active.mp3");

        let downloaded = store.downloaded(None);
        assert_eq!(downloaded.len(), 1);
        assert_eq!(downloaded[0].0.as_str(), "http://example.com/done.mp3");
    }

    #[tokio::test]
    async fn delete_download_prunes_vacant_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let ep = episode("http://example.com/1.mp3");

        store.set_download_state(&ep, DownloadState::Downloaded { file: None });
        store.delete_download(&ep);
        store.flush().await.unwrap();

        let json = std::fs::read_to_string(store.path()).unwrap();
        let map: HashMap<String, serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn debounced_save_reaches_disk_without_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let ep = episode("http://example.com/1.mp3");

        store.set_old(&ep, true);
        assert!(!store.path().exists());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let ep = episode("http://example.com/1.mp3");

        store.set_old(&ep, true);
        store.playlist_append(&ep);
        store.reset();

        assert!(!store.meta(&ep).old);
        assert!(store.playlist(None).is_empty());
    }
}
