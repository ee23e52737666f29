// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::events::{EventBus, ListEvent, Subscription};
use crate::http::Credentials;
use crate::model::Podcast;

/// One line of an exchanged podcast list: the shape the OPML (or any
/// other) import/export glue round-trips through the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpmlEntry {
    pub name: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// The catalog of subscribed podcasts.
///
/// Holds immutable snapshots (`Arc<Podcast>`): a successful load installs
/// a fresh snapshot via [`install`](Self::install), so readers never see
/// a half-merged podcast. The list is kept in display order
/// (case-insensitive by name). Add/remove fan out as [`ListEvent`]s.
pub struct PodcastRegistry {
    podcasts: RwLock<Vec<Arc<Podcast>>>,
    events: EventBus<ListEvent>,
}

impl PodcastRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            podcasts: RwLock::new(Vec::new()),
            events: EventBus::new(),
        })
    }

    /// Listen for podcast-list changes
    pub fn subscribe(&self) -> Subscription<ListEvent> {
        self.events.subscribe()
    }

    /// Add a subscription. Adding an already-known identity is a no-op
    /// that returns the existing snapshot.
    pub fn add(&self, podcast: Podcast) -> Arc<Podcast> {
        let snapshot = {
            let mut podcasts = self.podcasts.write().expect("registry lock poisoned");
            if let Some(existing) = podcasts.iter().find(|p| p.url() == podcast.url()) {
                return Arc::clone(existing);
            }

            let snapshot = Arc::new(podcast);
            podcasts.push(Arc::clone(&snapshot));
            podcasts.sort_by(|a, b| a.cmp_by_name(b));
            snapshot
        };

        self.events.emit(ListEvent::Added(Arc::clone(&snapshot)));
        snapshot
    }

    /// Remove a subscription by identity
    pub fn remove(&self, url: &Url) -> Option<Arc<Podcast>> {
        let removed = {
            let mut podcasts = self.podcasts.write().expect("registry lock poisoned");
            let position = podcasts.iter().position(|p| p.url() == url)?;
            podcasts.remove(position)
        };

        self.events.emit(ListEvent::Removed(url.clone()));
        Some(removed)
    }

    /// Look up a podcast by its normalized feed URL
    pub fn find(&self, url: &Url) -> Option<Arc<Podcast>> {
        self.podcasts
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|p| p.url() == url)
            .cloned()
    }

    /// The subscribed podcasts in display order
    pub fn snapshot(&self) -> Vec<Arc<Podcast>> {
        self.podcasts
            .read()
            .expect("registry lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.podcasts.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace a podcast's snapshot after a load. Skipped (returning the
    /// given state unregistered) when the podcast was removed mid-load.
    pub fn install(&self, updated: Podcast) -> Arc<Podcast> {
        let snapshot = Arc::new(updated);
        let mut podcasts = self.podcasts.write().expect("registry lock poisoned");
        if let Some(slot) = podcasts.iter_mut().find(|p| p.url() == snapshot.url()) {
            *slot = Arc::clone(&snapshot);
            podcasts.sort_by(|a, b| a.cmp_by_name(b));
        }
        snapshot
    }

    /// Bring in a podcast list from the import boundary
    pub fn import(&self, entries: Vec<OpmlEntry>) -> Vec<Arc<Podcast>> {
        entries
            .into_iter()
            .filter_map(|entry| {
                let credentials = match (entry.username, entry.password) {
                    (Some(username), Some(password)) => {
                        Some(Credentials::new(username, password))
                    }
                    _ => None,
                };
                match Podcast::new(entry.name.as_deref(), &entry.url) {
                    Ok(podcast) => Some(self.add(podcast.with_credentials(credentials))),
                    Err(error) => {
                        tracing::warn!(url = entry.url, %error, "Skipping unparsable import entry");
                        None
                    }
                }
            })
            .collect()
    }

    /// Produce the podcast list for the export boundary. Lossless with
    /// respect to [`import`](Self::import).
    pub fn export(&self) -> Vec<OpmlEntry> {
        self.snapshot()
            .iter()
            .map(|podcast| OpmlEntry {
                name: podcast.name().map(str::to_string),
                url: podcast.url().to_string(),
                username: podcast.credentials().map(|c| c.username.clone()),
                password: podcast.credentials().map(|c| c.password.clone()),
            })
            .collect()
    }
}
