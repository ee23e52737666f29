// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use url::Url;

/// Scheme prefixes that podcast directories hand out instead of plain http
const SCHEME_REWRITES: [&str; 3] = ["feed://", "itpc://", "itms://"];

const FEEDBURNER_HOST: &str = "feeds.feedburner.com";
const FEEDBURNER_ALT_HOST: &str = "feeds2.feedburner.com";

/// Normalize a raw feed location into the canonical URL that serves as
/// the podcast's identity.
///
/// Rewrites `feed://`, `itpc://` and `itms://` schemes to `http://`,
/// expands the `fb:` feedburner shorthand, and canonicalizes feedburner
/// URLs (alternate host, `?format=xml` suffix).
pub fn normalize_feed_url(raw: &str) -> Result<Url, url::ParseError> {
    let trimmed = raw.trim();

    let rewritten = if let Some(shortname) = strip_prefix_ignore_case(trimmed, "fb:") {
        format!("http://{FEEDBURNER_HOST}/{shortname}")
    } else {
        SCHEME_REWRITES
            .iter()
            .find_map(|prefix| strip_prefix_ignore_case(trimmed, prefix))
            .map(|rest| format!("http://{rest}"))
            .unwrap_or_else(|| trimmed.to_string())
    };

    let mut url = Url::parse(&rewritten)?;

    if url
        .host_str()
        .is_some_and(|host| host.eq_ignore_ascii_case(FEEDBURNER_ALT_HOST))
    {
        url.set_host(Some(FEEDBURNER_HOST))?;
    }

    if url
        .host_str()
        .is_some_and(|host| host.eq_ignore_ascii_case(FEEDBURNER_HOST))
        && url.query() == Some("format=xml")
    {
        url.set_query(None);
    }

    Ok(url)
}

/// Resolve a possibly relative URL reference against a feed URL.
///
/// Absolute inputs pass through, `/rooted` paths resolve against the
/// feed's scheme+authority, bare paths against the feed URL's directory.
/// Empty or unresolvable inputs yield `None`.
pub fn resolve_relative(base: &Url, value: &str) -> Option<Url> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    match Url::parse(value) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => base.join(value).ok(),
        Err(_) => None,
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}
