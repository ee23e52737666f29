mod parse;

pub use parse::{ParsedEpisode, ParsedFeed, parse_duration, parse_feed, parse_pub_date};
