// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use url::Url;

use crate::feed::ParsedFeed;
use crate::http::Credentials;
use crate::model::episode::Episode;
use crate::model::url::normalize_feed_url;

/// One subscribed podcast: feed identity, metadata and the episode list
/// from the most recent successful parse.
///
/// Two podcasts are equal iff their normalized feed URLs are equal,
/// independent of name. A successful load produces a fresh snapshot via
/// [`Podcast::apply`]; readers never observe a half-merged state because
/// the loader works on a clone and installs it wholesale.
#[derive(Debug, Clone)]
pub struct Podcast {
    name: Option<String>,
    url: Url,
    credentials: Option<Credentials>,
    episodes: Vec<Episode>,
    logo_url: Option<Url>,
    logo: Option<Bytes>,
    last_loaded: Option<DateTime<Utc>>,
    failed_load_attempts: u32,
    explicit: bool,
}

impl Podcast {
    /// Create a podcast from a name and raw feed location. The location
    /// is normalized (scheme rewrites, feedburner canonicalization) and
    /// becomes the podcast's identity.
    pub fn new(name: Option<&str>, raw_url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            name: name.map(str::to_string).filter(|n| !n.is_empty()),
            url: normalize_feed_url(raw_url)?,
            credentials: None,
            episodes: Vec::new(),
            logo_url: None,
            logo: None,
            last_loaded: None,
            failed_load_attempts: 0,
            explicit: false,
        })
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// The podcast's name, if one is known. Always set after the first
    /// successful parse.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for display purposes; falls back to the feed URL
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.url.as_str())
    }

    /// The normalized feed URL, the podcast's identity
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
    }

    /// Episodes from the most recent successful parse, newest first
    pub fn episodes(&self) -> &[Episode] {
        &self.episodes
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.len()
    }

    pub fn logo_url(&self) -> Option<&Url> {
        self.logo_url.as_ref()
    }

    /// Cached logo bytes, populated independently of the parse cycle
    pub fn logo(&self) -> Option<&Bytes> {
        self.logo.as_ref()
    }

    pub fn set_logo(&mut self, logo: Bytes) {
        self.logo = Some(logo);
    }

    /// When this podcast was last parsed successfully, `None` until then
    pub fn last_loaded(&self) -> Option<DateTime<Utc>> {
        self.last_loaded
    }

    pub fn failed_load_attempts(&self) -> u32 {
        self.failed_load_attempts
    }

    pub fn explicit(&self) -> bool {
        self.explicit
    }

    /// Fold a freshly parsed feed into this podcast.
    ///
    /// The name is only taken from the feed while unset and falls back
    /// to the feed URL so display never shows blank; the episode list is
    /// rebuilt strictly from the parse result, ordered and deduplicated
    /// by the episode comparator. Resets the failure counter and stamps
    /// `last_loaded`. Callers must not invoke this for failed parses —
    /// the prior state stays untouched simply by not applying.
    pub fn apply(&mut self, parsed: ParsedFeed) {
        self.apply_scalars(&parsed);

        let ordered: BTreeSet<Episode> = parsed
            .episodes
            .into_iter()
            .map(|episode| Episode::from_parsed(&self.url, episode))
            .collect();
        self.episodes = ordered.into_iter().collect();

        self.last_loaded = Some(Utc::now());
        self.failed_load_attempts = 0;
    }

    /// Apply podcast-level fields of a parse whose episode content is
    /// blocked by the explicit policy. The episode list is emptied and
    /// `last_loaded` stays untouched — the load counts as failed.
    pub fn apply_blocked(&mut self, parsed: ParsedFeed) {
        self.apply_scalars(&parsed);
        self.episodes.clear();
    }

    fn apply_scalars(&mut self, parsed: &ParsedFeed) {
        if self.name.is_none() {
            self.name = parsed.title.clone().filter(|t| !t.is_empty());
        }
        if self.name.is_none() {
            self.name = Some(self.url.to_string());
        }

        self.explicit = parsed.explicit;

        if parsed.logo_url.is_some() && parsed.logo_url != self.logo_url {
            self.logo_url = parsed.logo_url.clone();
            // Cached bytes belong to the previous logo location
            self.logo = None;
        }
    }

    /// Failure bookkeeping, driven by the loader: transport failures
    /// never reach the parser, so the parse path cannot count them
    pub fn register_failed_load(&mut self) {
        self.failed_load_attempts += 1;
    }

    /// Display ordering: case-insensitive by name, unnamed podcasts
    /// first. Deliberately a method rather than `Ord` — it is not
    /// consistent with equality (which is by URL) and must not be used
    /// for set membership.
    pub fn cmp_by_name(&self, other: &Podcast) -> Ordering {
        match (&self.name, &other.name) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(mine), Some(theirs)) => mine.to_lowercase().cmp(&theirs.to_lowercase()),
        }
    }
}

impl PartialEq for Podcast {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Podcast {}

impl Hash for Podcast {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.as_str().hash(state);
    }
}
