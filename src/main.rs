use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use log::debug;
use product_processor::{
    coordinator::{BatchCoordinator, CoordinatorOptions},
    discover::{DiscoverOptions, Discoverer},
    extractor::{HttpExtractor, HttpExtractorOptions},
    source::{FileUrlSource, MemoryUrlSource, RedisUrlSource, UrlSink, UrlSource},
    store::{ImageStore, MemoryImageStore, MemoryRecordStore, RecordStore},
    store::{RedisImageStore, RedisRecordStore},
    utils::{DEFAULT_URLS_KEY, IMAGES_PREFIX, RECORDS_KEY, REDIS_URL},
};
use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Product url batch processor", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: Opts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct Opts {
    /// Newline separated url list; the redis list is used when omitted
    #[arg(short = 'f', long, global = true)]
    urls_file: Option<PathBuf>,
    /// Redis list holding the urls
    #[arg(long, global = true, default_value = DEFAULT_URLS_KEY)]
    urls_key: String,
    /// Redis connection url, defaults to $REDIS_URL
    #[arg(long, global = true)]
    redis_url: Option<String>,
    /// Keep results in memory instead of writing them to redis
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,
    /// Attempts per url, the first one included
    #[arg(short = 'r', long, global = true, default_value_t = 3)]
    attempts: u32,
    /// Base delay in milliseconds between attempts, doubled each time
    #[arg(long, global = true, default_value_t = 1000)]
    retry_delay: u64,
    /// Pause in milliseconds between two batches of a session
    #[arg(long, global = true, default_value_t = 2000)]
    batch_delay: u64,
    /// Wall clock budget of a session in seconds
    #[arg(long, global = true, default_value_t = 900)]
    session_timeout: u64,
    /// Request timeout of the page fetcher in seconds
    #[arg(long, global = true, default_value_t = 30)]
    fetch_timeout: u64,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Show how many urls can be processed
    Info,
    /// Check that the url list is reachable
    Health,
    /// Scrape listing pages and append the product urls found to the url list
    Discover {
        #[arg(long)]
        start_page: usize,
        #[arg(long)]
        end_page: usize,
        /// Listing page url, `{page}` is replaced by the page number
        #[arg(long)]
        listing_url: Option<String>,
    },
    /// Process one index range as a single session
    Process {
        #[arg(short = 's', long)]
        start: usize,
        #[arg(short = 'e', long)]
        end: usize,
        #[arg(short = 'b', long)]
        batch_size: Option<usize>,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Split a large range into requests and run them as concurrent sessions
    Ranges {
        #[arg(short = 's', long)]
        start: usize,
        #[arg(short = 'e', long)]
        end: usize,
        /// Urls per session
        #[arg(short = 'n', long, default_value_t = 10)]
        per_request: usize,
        #[arg(short = 'b', long)]
        batch_size: Option<usize>,
    },
}

fn request_ranges(start: usize, end: usize, per_request: usize) -> Vec<(usize, usize)> {
    let step = per_request.max(1);
    (start..=end)
        .step_by(step)
        .map(|s| (s, (s + step - 1).min(end)))
        .collect()
}

fn redis_url(opts: &Opts) -> String {
    opts.redis_url.clone().unwrap_or_else(|| REDIS_URL.clone())
}

/// The shared url list, readable by sessions and writable by discovery.
fn url_list(opts: &Opts) -> anyhow::Result<(Arc<dyn UrlSource>, Arc<dyn UrlSink>)> {
    let redis_url = redis_url(opts);
    Ok(match &opts.urls_file {
        Some(path) => {
            let list = Arc::new(FileUrlSource::new(path.clone()));
            (list.clone() as Arc<dyn UrlSource>, list as Arc<dyn UrlSink>)
        }
        None => {
            let list = Arc::new(
                RedisUrlSource::new(&redis_url, &opts.urls_key)
                    .context(format!("could not open url list at {}", redis_url))?,
            );
            (list.clone() as Arc<dyn UrlSource>, list as Arc<dyn UrlSink>)
        }
    })
}

fn fetcher(opts: &Opts) -> anyhow::Result<HttpExtractor> {
    HttpExtractor::new(
        HttpExtractorOptions::default_builder()
            .timeout(opts.fetch_timeout)
            .build()?,
    )
    .context("could not build page fetcher")
}

fn build(
    opts: &Opts,
    urls: Arc<dyn UrlSource>,
    should_terminate: Arc<AtomicBool>,
) -> anyhow::Result<BatchCoordinator> {
    let redis_url = redis_url(opts);

    let (records, images): (Arc<dyn RecordStore>, Arc<dyn ImageStore>) = if opts.dry_run {
        (
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryImageStore::new()),
        )
    } else {
        (
            Arc::new(RedisRecordStore::new(&redis_url, RECORDS_KEY.as_str())?),
            Arc::new(RedisImageStore::new(&redis_url, IMAGES_PREFIX.as_str())?),
        )
    };

    let extractor = fetcher(opts)?;

    let options = CoordinatorOptions::default_builder()
        .max_attempts(opts.attempts)
        .retry_base_delay_ms(opts.retry_delay)
        .batch_delay_ms(opts.batch_delay)
        .session_timeout_ms(opts.session_timeout * 1000)
        .build()?;

    debug!("Starting coordinator with {:#?}", options);

    Ok(
        BatchCoordinator::new(urls, Arc::new(extractor), records, images, options)
            .with_termination_flag(should_terminate),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let should_terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

    let (urls, sink) = url_list(&cli.opts)?;
    let coordinator = build(&cli.opts, urls, should_terminate)?;

    match cli.command {
        Command::Info => {
            let info = coordinator.info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Health => {
            let health = coordinator.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if health.error.is_some() {
                std::process::exit(1);
            }
        }
        Command::Discover {
            start_page,
            end_page,
            listing_url,
        } => {
            let mut options = DiscoverOptions::default_builder();
            if let Some(listing_url) = listing_url {
                options.listing_url(listing_url);
            }
            // a dry run collects into memory and prints what would be appended
            let dry_sink = Arc::new(MemoryUrlSource::default());
            let sink: Arc<dyn UrlSink> = if cli.opts.dry_run {
                dry_sink.clone()
            } else {
                sink
            };
            let discoverer = Discoverer::new(Arc::new(fetcher(&cli.opts)?), sink, options.build()?);
            let report = discoverer.run(start_page, end_page).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if cli.opts.dry_run {
                for url in dry_sink.urls() {
                    println!("{}", url);
                }
            }
        }
        Command::Process {
            start,
            end,
            batch_size,
            session_id,
        } => {
            let summary = coordinator
                .process(start, end, batch_size, session_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Ranges {
            start,
            end,
            per_request,
            batch_size,
        } => {
            let ranges = request_ranges(start, end, per_request);
            debug!("running {} sessions: {:?}", ranges.len(), ranges);

            let runs = ranges.iter().map(|(s, e)| {
                coordinator.process(*s, *e, batch_size, Some(format!("range-{}-{}", s, e)))
            });
            for ((s, e), res) in ranges.iter().zip(join_all(runs).await) {
                match res {
                    Ok(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                    Err(err) => eprintln!("request {}-{} rejected: {}", s, e, err),
                }
            }
            println!("{}", serde_json::to_string_pretty(&coordinator.status())?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_requests() {
        assert_eq!(
            request_ranges(0, 29, 10),
            vec![(0, 9), (10, 19), (20, 29)]
        );
        assert_eq!(request_ranges(5, 7, 10), vec![(5, 7)]);
        assert_eq!(request_ranges(0, 4, 2), vec![(0, 1), (2, 3), (4, 4)]);
    }

    #[test]
    fn parses_discover_command() {
        let cli = Cli::parse_from([
            "processor",
            "discover",
            "--start-page",
            "1",
            "--end-page",
            "5",
        ]);
        match cli.command {
            Command::Discover {
                start_page,
                end_page,
                listing_url,
            } => {
                assert_eq!((start_page, end_page), (1, 5));
                assert!(listing_url.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_process_command() {
        let cli = Cli::parse_from([
            "processor",
            "--dry-run",
            "-f",
            "urls.txt",
            "process",
            "-s",
            "10",
            "-e",
            "19",
            "--session-id",
            "batch_1",
        ]);
        assert!(cli.opts.dry_run);
        match cli.command {
            Command::Process {
                start,
                end,
                batch_size,
                session_id,
            } => {
                assert_eq!((start, end, batch_size), (10, 19, None));
                assert_eq!(session_id.as_deref(), Some("batch_1"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
