// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::feed::ParsedEpisode;

/// One episode of a podcast. Identity is the media URL: two episodes are
/// the same episode iff their media URLs are equal, regardless of any
/// other field.
#[derive(Debug, Clone)]
pub struct Episode {
    /// Identity of the owning podcast (its normalized feed URL)
    pub podcast_url: Url,
    /// Position in the feed at parse time, -1 if unknown. Only used as
    /// an ordering tie-break.
    pub index: i32,
    pub name: String,
    pub media_url: Url,
    pub pub_date: Option<DateTime<Utc>>,
    /// Seconds, -1 if unknown
    pub duration: i32,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub explicit: bool,
}

impl Episode {
    pub fn from_parsed(podcast_url: &Url, parsed: ParsedEpisode) -> Self {
        Self {
            podcast_url: podcast_url.clone(),
            index: parsed.index,
            name: parsed.name,
            media_url: parsed.media_url,
            pub_date: parsed.pub_date,
            duration: parsed.duration,
            description: parsed.description,
            long_description: parsed.long_description,
            explicit: parsed.explicit,
        }
    }

    /// Stable hash of the identity, for the final ordering tie-break
    fn identity_hash(&self) -> u64 {
        let digest = Sha256::digest(self.media_url.as_str().as_bytes());
        u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
    }
}

impl PartialEq for Episode {
    fn eq(&self, other: &Self) -> bool {
        self.media_url == other.media_url
    }
}

impl Eq for Episode {}

impl Hash for Episode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.media_url.as_str().hash(state);
    }
}

impl PartialOrd for Episode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Episode {
    /// Total order, descending by recency.
    ///
    /// Returns `Equal` only for identity-equal episodes; the episode
    /// collection is an ordered set that deduplicates by this comparator,
    /// so collapsing distinct episodes would silently drop them. Episodes
    /// without a date sort after dated ones; ties between distinct
    /// episodes fall back to the feed index, then to a stable hash of the
    /// media URL (and the URL itself on hash collision, so the order
    /// stays total).
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }

        let by_date = match (&self.pub_date, &other.pub_date) {
            (Some(mine), Some(theirs)) => theirs.cmp(mine),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if by_date != Ordering::Equal {
            return by_date;
        }

        if self.index >= 0 && other.index >= 0 && self.index != other.index {
            return self.index.cmp(&other.index);
        }

        let (mine, theirs) = (self.identity_hash(), other.identity_hash());
        if mine != theirs {
            return mine.cmp(&theirs);
        }
        self.media_url.as_str().cmp(other.media_url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn episode(media: &str, index: i32, date: Option<DateTime<Utc>>) -> Episode {
        Episode {
            podcast_url: Url::parse("http://example.com/feed").unwrap(),
            index,
            name: format!("Episode {index}"),
            media_url: Url::parse(media).unwrap(),
            pub_date: date,
            duration: -1,
            description: None,
            long_description: None,
            explicit: false,
        }
    }

    fn date(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn equality_depends_only_on_media_url() {
        let a = episode("http://example.com/1.mp3", 0, Some(date(100)));
        let mut b = episode("http://example.com/1.mp3", 7, None);
        b.name = "Something else".into();

        assert_eq!(a, b);

        let c = episode("http://example.com/2.mp3", 0, Some(date(100)));
        assert_ne!(a, c);
    }

    #[test]
    fn more_recent_sorts_first() {
        let newer = episode("http://example.com/new.mp3", 0, Some(date(200)));
        let older = episode("http://example.com/old.mp3", 1, Some(date(100)));

        assert_eq!(newer.cmp(&older), Ordering::Less);
        assert_eq!(older.cmp(&newer), Ordering::Greater);
    }

    #[test]
    fn undated_sorts_after_dated() {
        let dated = episode("http://example.com/dated.mp3", 5, Some(date(100)));
        let undated = episode("http://example.com/undated.mp3", 0, None);

        assert_eq!(dated.cmp(&undated), Ordering::Less);
        assert_eq!(undated.cmp(&dated), Ordering::Greater);
    }

    #[test]
    fn equal_dates_fall_back_to_feed_index() {
        let first = episode("http://example.com/a.mp3", 0, Some(date(100)));
        let second = episode("http://example.com/b.mp3", 1, Some(date(100)));

        assert_eq!(first.cmp(&second), Ordering::Less);
        assert_eq!(second.cmp(&first), Ordering::Greater);
    }

    #[test]
    fn both_undated_preserve_feed_order() {
        let first = episode("http://example.com/a.mp3", 0, None);
        let second = episode("http://example.com/b.mp3", 1, None);

        assert_eq!(first.cmp(&second), Ordering::Less);
    }

    #[test]
    fn distinct_episodes_never_compare_equal() {
        // Same date, same (unknown) index: the hash fallback must still
        // produce a non-zero result or an ordered set would eat one
        let a = episode("http://example.com/a.mp3", -1, Some(date(100)));
        let b = episode("http://example.com/b.mp3", -1, Some(date(100)));

        assert_ne!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn compare_zero_iff_equal() {
        let episodes = [
            episode("http://example.com/a.mp3", 0, Some(date(100))),
            episode("http://example.com/b.mp3", 1, Some(date(100))),
            episode("http://example.com/c.mp3", -1, None),
            episode("http://example.com/a.mp3", 3, None),
        ];

        for a in &episodes {
            for b in &episodes {
                assert_eq!(a == b, a.cmp(b) == Ordering::Equal, "{} vs {}", a.media_url, b.media_url);
            }
        }
    }

    #[test]
    fn ordered_set_dedups_by_identity() {
        use std::collections::BTreeSet;

        let mut set = BTreeSet::new();
        set.insert(episode("http://example.com/a.mp3", 0, Some(date(200))));
        set.insert(episode("http://example.com/a.mp3", 1, Some(date(200))));
        set.insert(episode("http://example.com/b.mp3", 2, Some(date(100))));

        assert_eq!(set.len(), 2);
    }
}
