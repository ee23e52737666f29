use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use url::Url;

use podcatch::{
    Credentials, Episode, EpisodeMetaStore, FeedLoader, LoadErrorKind, LoadEvent, LoaderOptions,
    OpmlEntry, Podcast, PodcastRegistry, Progress, ReqwestClient, normalize_feed_url,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static STAR: Emoji<'_, '_> = Emoji("✨ ", "[*] ");

/// Manage and refresh podcast subscriptions
#[derive(Parser, Debug)]
#[command(name = "podcatch")]
#[command(about = "Manage and refresh podcast subscriptions")]
#[command(version)]
struct Args {
    /// Directory holding the subscription list and episode state
    #[arg(short, long, default_value = ".podcatch")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a podcast feed
    Add {
        /// Feed URL (feed://, itpc://, itms:// and fb: shorthands work)
        url: String,
        /// Display name; read from the feed when omitted
        #[arg(short, long)]
        name: Option<String>,
        /// Username for a password-protected feed
        #[arg(long)]
        username: Option<String>,
        /// Password for a password-protected feed
        #[arg(long)]
        password: Option<String>,
    },

    /// Drop a subscription
    Remove { url: String },

    /// List subscriptions
    List,

    /// Refresh one feed, or all subscribed feeds
    Refresh {
        url: Option<String>,
        /// Refuse episode content marked explicit
        #[arg(long)]
        block_explicit: bool,
        /// Maximum number of feeds loading at once
        #[arg(short = 'c', long, default_value = "3")]
        concurrent: usize,
    },

    /// Show a feed's episodes (refreshes it first)
    Episodes {
        url: String,
        /// Only episodes not yet marked old
        #[arg(long)]
        new: bool,
    },

    /// Show the playlist, optionally for one podcast only
    Playlist { url: Option<String> },

    /// Mark an episode as listened (or new again with --new)
    Mark {
        url: String,
        media_url: String,
        #[arg(long)]
        new: bool,
    },

    /// Put an episode on the playlist
    Enqueue {
        url: String,
        media_url: String,
        /// Playlist position, appends when omitted
        #[arg(long)]
        at: Option<usize>,
    },

    /// Take an episode off the playlist
    Dequeue { url: String, media_url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    println!(
        "\n{}{} {}\n",
        MICROPHONE,
        "podcatch".bold().magenta(),
        "- Podcast Subscriptions".dimmed()
    );

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("Failed to create data dir {}", args.data_dir.display()))?;

    let registry = PodcastRegistry::new();
    load_subscriptions(&registry, &args.data_dir)?;

    let store = EpisodeMetaStore::new(args.data_dir.join("episodes.json"));
    if let Err(error) = store.load().await {
        eprintln!("{FAILURE}{}", format!("Episode state unreadable: {error}").red());
    }
    store.block_until_loaded().await;

    let options = match &args.command {
        Command::Refresh {
            block_explicit,
            concurrent,
            ..
        } => LoaderOptions {
            block_explicit: *block_explicit,
            max_concurrent_loads: (*concurrent).max(1),
            ..LoaderOptions::default()
        },
        _ => LoaderOptions::default(),
    };

    let loader = FeedLoader::new(
        ReqwestClient::new(),
        Arc::clone(&registry),
        Arc::clone(&store),
        options,
    );

    match args.command {
        Command::Add {
            url,
            name,
            username,
            password,
        } => {
            let credentials = match (username, password) {
                (Some(username), Some(password)) => Some(Credentials::new(username, password)),
                (None, None) => None,
                _ => bail!("--username and --password must be given together"),
            };
            let podcast = Podcast::new(name.as_deref(), &url)
                .with_context(|| format!("Invalid feed URL: {url}"))?
                .with_credentials(credentials);
            let added = registry.add(podcast);
            println!(
                "{SUCCESS}Subscribed to {} ({})",
                added.display_name().bold().green(),
                added.url().as_str().dimmed()
            );
        }

        Command::Remove { url } => {
            let url = normalize_feed_url(&url)?;
            match registry.remove(&url) {
                Some(removed) => println!(
                    "{SUCCESS}Unsubscribed from {}",
                    removed.display_name().bold()
                ),
                None => bail!("Not subscribed to {url}"),
            }
        }

        Command::List => {
            if registry.is_empty() {
                println!("No subscriptions yet. Try {}.", "podcatch add <URL>".cyan());
            }
            for podcast in registry.snapshot() {
                let episodes = match podcast.episode_count() {
                    0 => String::new(),
                    n => format!(" • {n} episodes"),
                };
                println!(
                    "  {}{} {}{}",
                    if podcast.failed_load_attempts() > 0 {
                        format!("{FAILURE}")
                    } else {
                        String::new()
                    },
                    podcast.display_name().bold(),
                    podcast.url().as_str().dimmed(),
                    episodes.dimmed()
                );
            }
        }

        Command::Refresh { url, .. } => {
            let targets: Vec<Url> = match url {
                Some(raw) => vec![normalize_feed_url(&raw)?],
                None => registry.snapshot().iter().map(|p| p.url().clone()).collect(),
            };
            if targets.is_empty() {
                bail!("Nothing to refresh, no subscriptions");
            }
            refresh(&loader, targets).await;
        }

        Command::Episodes { url, new } => {
            let url = normalize_feed_url(&url)?;
            let podcast = refresh_one_quietly(&loader, &url).await?;
            for episode in podcast.episodes() {
                let meta = store.meta(episode);
                if new && meta.old {
                    continue;
                }
                let marker = if meta.old { " " } else { "*" };
                let date = episode
                    .pub_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "????-??-??".into());
                println!(
                    "  {} {} {} {}",
                    marker.yellow().bold(),
                    date.dimmed(),
                    episode.name,
                    format_duration(episode.duration).dimmed()
                );
            }
        }

        Command::Playlist { url } => {
            let filter = url.map(|raw| normalize_feed_url(&raw)).transpose()?;
            let playlist = store.playlist(filter.as_ref());
            if playlist.is_empty() {
                println!("The playlist is empty.");
            }
            for (media_url, meta) in playlist {
                println!(
                    "  {:>3}. {} {}",
                    meta.playlist_position.unwrap_or_default() + 1,
                    meta.episode_name.as_deref().unwrap_or("<unknown>"),
                    media_url.as_str().dimmed()
                );
            }
        }

        Command::Mark { url, media_url, new } => {
            let episode = find_episode(&loader, &url, &media_url).await?;
            store.set_old(&episode, !new);
            println!(
                "{SUCCESS}Marked {} as {}",
                episode.name.bold(),
                if new { "new" } else { "old" }
            );
        }

        Command::Enqueue { url, media_url, at } => {
            let episode = find_episode(&loader, &url, &media_url).await?;
            match at {
                Some(position) => store.playlist_insert(&episode, position),
                None => store.playlist_append(&episode),
            }
            println!("{SUCCESS}Enqueued {}", episode.name.bold());
        }

        Command::Dequeue { url, media_url } => {
            let episode = find_episode(&loader, &url, &media_url).await?;
            store.playlist_remove(&episode);
            println!("{SUCCESS}Dequeued {}", episode.name.bold());
        }
    }

    save_subscriptions(&registry, &args.data_dir)?;
    store
        .flush()
        .await
        .context("Failed to write episode state")?;

    Ok(())
}

/// Refresh the given feeds concurrently, driving progress bars from the
/// loader's event stream
async fn refresh(loader: &FeedLoader<ReqwestClient>, targets: Vec<Url>) {
    let mut events = loader.subscribe();
    for url in &targets {
        loader.load(url);
    }

    let multi = MultiProgress::new();
    let bar_style = ProgressStyle::default_bar()
        .template("  {spinner:.green} [{bar:25.cyan/blue}] {wide_msg}")
        .unwrap()
        .progress_chars("█▓░");
    let mut bars: HashMap<Url, ProgressBar> = HashMap::new();

    let mut remaining = targets.len();
    let mut succeeded = 0usize;
    let mut failed: Vec<(Url, LoadErrorKind)> = Vec::new();

    while remaining > 0 {
        let Some(event) = events.recv().await else {
            break;
        };
        match event {
            LoadEvent::Progress { podcast, progress } => {
                let bar = bars.entry(podcast.clone()).or_insert_with(|| {
                    let bar = multi.add(ProgressBar::new(100));
                    bar.set_style(bar_style.clone());
                    bar
                });
                match progress {
                    Progress::Connecting => {
                        bar.set_message(format!("{SEARCH}{podcast}"));
                    }
                    Progress::Downloading(percent) => {
                        bar.set_position(percent as u64);
                    }
                    Progress::Parsing => {
                        bar.set_message(format!("parsing {podcast}"));
                    }
                }
            }
            LoadEvent::Loaded {
                podcast,
                new_episodes,
            } => {
                if let Some(bar) = bars.remove(podcast.url()) {
                    bar.finish_and_clear();
                }
                let _ = multi.println(format!(
                    "{SUCCESS}{} • {} episodes, {} new",
                    podcast.display_name().bold().green(),
                    podcast.episode_count().to_string().cyan(),
                    new_episodes.to_string().yellow()
                ));
                succeeded += 1;
                remaining -= 1;
            }
            LoadEvent::Failed { podcast, error } => {
                if let Some(bar) = bars.remove(&podcast) {
                    bar.finish_and_clear();
                }
                let _ = multi.println(format!(
                    "{FAILURE}{} - {}",
                    podcast.as_str().red(),
                    error.to_string().red()
                ));
                failed.push((podcast, error));
                remaining -= 1;
            }
            LoadEvent::LogoLoaded { .. } => {}
        }
    }

    println!(
        "\n{STAR}{} {} refreshed, {} failed",
        "Done:".bold().green(),
        succeeded.to_string().green().bold(),
        if failed.is_empty() {
            failed.len().to_string().green()
        } else {
            failed.len().to_string().red().bold()
        }
    );

    for (url, error) in &failed {
        if *error == LoadErrorKind::AuthRequired {
            println!(
                "  {} needs credentials, retry with {}",
                url.as_str().yellow(),
                "podcatch add --username --password".cyan()
            );
        }
    }
}

/// Refresh a single feed without progress output and return its snapshot
async fn refresh_one_quietly(
    loader: &FeedLoader<ReqwestClient>,
    url: &Url,
) -> Result<Arc<Podcast>> {
    let mut events = loader.subscribe_to(url);
    loader.load(url);

    loop {
        match events.recv().await {
            Some(LoadEvent::Progress { .. }) | Some(LoadEvent::LogoLoaded { .. }) => continue,
            Some(LoadEvent::Loaded { podcast, .. }) => return Ok(podcast),
            Some(LoadEvent::Failed { error, .. }) => bail!("Load failed: {error}"),
            None => bail!("Loader went away"),
        }
    }
}

async fn find_episode(
    loader: &FeedLoader<ReqwestClient>,
    raw_url: &str,
    media_url: &str,
) -> Result<Episode> {
    let url = normalize_feed_url(raw_url)?;
    let podcast = refresh_one_quietly(loader, &url).await?;
    podcast
        .episodes()
        .iter()
        .find(|episode| episode.media_url.as_str() == media_url)
        .cloned()
        .with_context(|| format!("No episode with media URL {media_url}"))
}

fn format_duration(seconds: i32) -> String {
    if seconds <= 0 {
        return String::new();
    }
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

fn subscriptions_path(data_dir: &Path) -> PathBuf {
    data_dir.join("subscriptions.json")
}

fn load_subscriptions(registry: &Arc<PodcastRegistry>, data_dir: &Path) -> Result<()> {
    let path = subscriptions_path(data_dir);
    if !path.exists() {
        return Ok(());
    }
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let entries: Vec<OpmlEntry> = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    registry.import(entries);
    Ok(())
}

fn save_subscriptions(registry: &Arc<PodcastRegistry>, data_dir: &Path) -> Result<()> {
    let path = subscriptions_path(data_dir);
    let json = serde_json::to_string_pretty(&registry.export())?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
}
