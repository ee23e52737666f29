// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::reader::Reader;
use url::Url;

use crate::error::FeedError;
use crate::model::resolve_relative;

/// Result of parsing one feed document: podcast-level fields plus the
/// episode records in document order. Consumed exactly once by
/// `Podcast::apply()`.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub logo_url: Option<Url>,
    pub explicit: bool,
    pub episodes: Vec<ParsedEpisode>,
}

/// One episode record extracted from a feed item
#[derive(Debug, Clone)]
pub struct ParsedEpisode {
    /// Position in the feed document, counting every item element
    pub index: i32,
    pub name: String,
    pub media_url: Url,
    pub pub_date: Option<DateTime<Utc>>,
    /// Seconds, -1 if unknown or unparsable
    pub duration: i32,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub explicit: bool,
}

/// Leaf tag whose text content we are currently collecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    ChannelTitle,
    ImageUrl,
    ItemTitle,
    PubDate,
    Duration,
    Description,
    LongDescription,
    Explicit,
}

#[derive(Default)]
struct ItemDraft {
    title: Option<String>,
    enclosure_url: Option<String>,
    pub_date: Option<String>,
    duration: Option<String>,
    description: Option<String>,
    long_description: Option<String>,
    explicit: bool,
}

/// Parse feed document bytes into a [`ParsedFeed`].
///
/// Tag names are matched case-insensitively. Malformed field values
/// (dates, durations) degrade to their unknown representation instead of
/// failing the parse; only a document without any recognizable feed
/// structure is an error. Items without a resolvable enclosure URL or
/// with an empty title are dropped. Relative enclosure and logo URLs are
/// resolved against the feed URL.
pub fn parse_feed(bytes: &[u8], feed_url: &Url) -> Result<ParsedFeed, FeedError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();

    let mut feed = ParsedFeed::default();
    // itunes:image / media:thumbnail beat <image><url>; within each slot
    // the first value written wins
    let mut href_logo: Option<String> = None;
    let mut text_logo: Option<String> = None;

    let mut saw_structure = false;
    let mut in_channel = false;
    let mut in_image = false;
    let mut in_item = false;
    let mut item: ItemDraft = ItemDraft::default();
    let mut item_index: i32 = 0;
    let mut dropped = 0usize;

    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let (prefix, local) = split_name(e.name());

                match local.as_str() {
                    "rss" => saw_structure = true,
                    "channel" | "feed" => {
                        saw_structure = true;
                        in_channel = true;
                    }
                    "item" | "entry" => {
                        in_item = true;
                        item = ItemDraft::default();
                    }
                    "image" if !in_item => {
                        // itunes:image carries its location as an attribute,
                        // plain <image> nests a <url> element
                        if let Some(href) = get_attribute(e, "href") {
                            if href_logo.is_none() {
                                href_logo = Some(href);
                            }
                        } else if prefix.is_none() {
                            in_image = true;
                        }
                    }
                    "thumbnail" if !in_item => {
                        if let Some(url) = get_attribute(e, "url")
                            && href_logo.is_none()
                        {
                            href_logo = Some(url);
                        }
                    }
                    "url" if in_image => field = Some(Field::ImageUrl),
                    "title" if in_item => field = Some(Field::ItemTitle),
                    "title" if in_channel && !in_image => field = Some(Field::ChannelTitle),
                    "pubdate" | "date" if in_item => field = Some(Field::PubDate),
                    "duration" if in_item => field = Some(Field::Duration),
                    "description" if in_item => field = Some(Field::Description),
                    "encoded" if in_item && prefix.as_deref() == Some("content") => {
                        field = Some(Field::LongDescription)
                    }
                    "explicit" => field = Some(Field::Explicit),
                    "enclosure" if in_item => {
                        if let Some(url) = get_attribute(e, "url") {
                            item.enclosure_url = Some(url);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                let (_, local) = split_name(e.name());
                match local.as_str() {
                    "enclosure" if in_item => {
                        if let Some(url) = get_attribute(e, "url") {
                            item.enclosure_url = Some(url);
                        }
                    }
                    "image" if !in_item => {
                        if let Some(href) = get_attribute(e, "href")
                            && href_logo.is_none()
                        {
                            href_logo = Some(href);
                        }
                    }
                    "thumbnail" if !in_item => {
                        if let Some(url) = get_attribute(e, "url")
                            && href_logo.is_none()
                        {
                            href_logo = Some(url);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                if field.is_some() {
                    text.push_str(&e.decode().map(|s| s.into_owned()).unwrap_or_default());
                }
            }
            Ok(Event::CData(ref e)) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(e));
                }
            }
            // Entity references come as separate events; stitch them back
            // so the later unescape pass sees them
            Ok(Event::GeneralRef(ref e)) => {
                if field.is_some() {
                    text.push('&');
                    text.push_str(&String::from_utf8_lossy(e));
                    text.push(';');
                }
            }
            Ok(Event::End(ref e)) => {
                let (_, local) = split_name(e.name());

                if let Some(current) = field.take() {
                    apply_field(
                        current,
                        std::mem::take(&mut text),
                        &mut feed,
                        &mut item,
                        &mut text_logo,
                        in_item,
                        in_channel,
                    );
                }

                match local.as_str() {
                    "channel" | "feed" => in_channel = false,
                    "image" => in_image = false,
                    "item" | "entry" => {
                        in_item = false;
                        match finish_item(std::mem::take(&mut item), item_index, feed_url) {
                            Some(episode) => feed.episodes.push(episode),
                            None => dropped += 1,
                        }
                        item_index += 1;
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FeedError::Xml(e)),
            _ => {}
        }
        buf.clear();
    }

    if !saw_structure {
        return Err(FeedError::NotParseable(
            "no channel or feed element found".into(),
        ));
    }

    if dropped > 0 {
        tracing::warn!(
            feed = %feed_url,
            dropped = dropped,
            "Items without playable enclosure or title skipped"
        );
    }

    feed.logo_url = href_logo
        .or(text_logo)
        .and_then(|raw| resolve_relative(feed_url, &raw));

    Ok(feed)
}

fn apply_field(
    field: Field,
    raw: String,
    feed: &mut ParsedFeed,
    item: &mut ItemDraft,
    text_logo: &mut Option<String>,
    in_item: bool,
    in_channel: bool,
) {
    match field {
        Field::ChannelTitle => {
            if feed.title.is_none() {
                let title = clean_text(&raw);
                if !title.is_empty() {
                    feed.title = Some(title);
                }
            }
        }
        Field::ImageUrl => {
            if text_logo.is_none() && !raw.trim().is_empty() {
                *text_logo = Some(raw.trim().to_string());
            }
        }
        Field::ItemTitle => {
            if item.title.is_none() {
                item.title = Some(clean_text(&raw));
            }
        }
        Field::PubDate => {
            if item.pub_date.is_none() {
                item.pub_date = Some(raw);
            }
        }
        Field::Duration => item.duration = Some(raw),
        Field::Description => {
            if item.description.is_none() {
                item.description = Some(raw);
            }
        }
        Field::LongDescription => {
            if item.long_description.is_none() {
                item.long_description = Some(raw);
            }
        }
        Field::Explicit => {
            if is_explicit_marker(&raw) {
                if in_item {
                    item.explicit = true;
                } else if in_channel {
                    feed.explicit = true;
                }
            }
        }
    }
}

fn finish_item(item: ItemDraft, index: i32, feed_url: &Url) -> Option<ParsedEpisode> {
    let name = item.title.unwrap_or_default();
    if name.is_empty() {
        return None;
    }

    let media_url = item
        .enclosure_url
        .as_deref()
        .and_then(|raw| resolve_relative(feed_url, raw))?;

    Some(ParsedEpisode {
        index,
        name,
        media_url,
        pub_date: item.pub_date.as_deref().and_then(parse_pub_date),
        duration: item
            .duration
            .as_deref()
            .map(parse_duration)
            .unwrap_or(-1),
        description: item.description,
        long_description: item.long_description,
        explicit: item.explicit,
    })
}

/// Split a possibly prefixed tag name into (prefix, lowercased local name)
fn split_name(name: QName<'_>) -> (Option<String>, String) {
    let name = String::from_utf8_lossy(name.as_ref()).to_lowercase();
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name),
    }
}

fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_lowercase();
        if key == name {
            return Some(String::from_utf8_lossy(&attr.value).to_string());
        }
    }
    None
}

/// Unescape entities, trim, and collapse internal line breaks
fn clean_text(raw: &str) -> String {
    let unescaped = html_escape::decode_html_entities(raw);
    unescaped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_explicit_marker(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "yes" | "true" | "explicit"
    )
}

/// Parse an episode duration given as `SS`, `MM:SS` or `HH:MM:SS`.
/// Anything else degrades to -1.
pub fn parse_duration(value: &str) -> i32 {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i32>() {
        return if seconds < 0 { -1 } else { seconds };
    }

    let parts: Vec<&str> = value.split(':').collect();
    let parsed: Option<Vec<i32>> = parts
        .iter()
        .map(|p| p.parse::<i32>().ok().filter(|n| *n >= 0))
        .collect();

    match parsed.as_deref() {
        Some([minutes, seconds]) => minutes * 60 + seconds,
        Some([hours, minutes, seconds]) => hours * 3600 + minutes * 60 + seconds,
        _ => -1,
    }
}

/// Parse a publication date, RFC 2822 first, then a couple of formats
/// seen in the wild. Unparsable dates degrade to `None` so the ordering
/// tie-breaks take over.
pub fn parse_pub_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }

    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    for format in formats {
        if let Ok(date) = DateTime::parse_from_str(value, format) {
            return Some(date.with_timezone(&Utc));
        }
    }

    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date.with_timezone(&Utc));
    }

    tracing::debug!(value = value, "Episode has unparsable publication date");
    None
}
