pub mod models {
    pub mod message;
    pub mod reading;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    pub mod schema;
}
pub mod store;
pub mod services {
    pub mod aggregate;
    pub mod assess;
    pub mod cache;
    pub mod cycle;
    pub mod dashboard;
    pub mod ingest;
    pub mod interpret;
    pub mod retry;
    pub mod schedule;
    pub mod speech;
    #[cfg(test)]
    pub mod testing;
}

use crate::client::{ElevenLabsClient, OpenRouterClient, build_agent};
use crate::config::Config;
use crate::models::message::SchedulePhase;
use crate::models::reading::DeviceId;
use crate::services::aggregate::Aggregator;
use crate::services::cache::LatestStateCache;
use crate::services::cycle::Pipeline;
use crate::services::dashboard::Dashboard;
use crate::services::ingest::{self, Ingestor};
use crate::services::interpret::Interpreter;
use crate::services::retry::RetryPolicy;
use crate::services::schedule::{self, Scheduler};
use crate::services::speech::{AudioStore, Narrator};
use crate::store::{MemoryStore, PgStore, TimeSeriesStore};
use chrono::Utc;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DB_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One-shot dashboard reads: print the JSON document and exit.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Query {
    Status,
    Sensors,
    Latest,
    History(i64),
}

#[derive(Debug, Default, PartialEq)]
struct Options {
    env_file: Option<PathBuf>,
    stdin_ingest: bool,
    /// Tone of the manual cycle to run at startup.
    trigger_now: Option<SchedulePhase>,
    query: Option<Query>,
}

fn set_query(opts: &mut Options, query: Query) -> Result<(), String> {
    if opts.query.replace(query).is_some() {
        return Err("only one of --status, --sensors, --latest, --history may be given".to_string());
    }
    Ok(())
}

fn set_env_file(opts: &mut Options, value: &str) -> Result<(), String> {
    if opts.env_file.is_some() {
        return Err("`--env-file` provided more than once".to_string());
    }
    if value.is_empty() {
        return Err("`--env-file` requires a path argument".to_string());
    }
    opts.env_file = Some(PathBuf::from(value));
    Ok(())
}

fn parse_tone(value: &str) -> Result<SchedulePhase, String> {
    match SchedulePhase::parse(value) {
        Some(SchedulePhase::Sleep) | None => Err(format!(
            "`--trigger-now` expects wake, report or goodnight, got {:?}",
            value
        )),
        Some(tone) => Ok(tone),
    }
}

fn parse_options(args: impl IntoIterator<Item = String>) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--env-file" => {
                let value = args.next().unwrap_or_default();
                set_env_file(&mut opts, &value)?;
            }
            s if s.starts_with("--env-file=") => set_env_file(&mut opts, &s["--env-file=".len()..])?,
            "--stdin-ingest" => opts.stdin_ingest = true,
            "--trigger-now" => opts.trigger_now = Some(SchedulePhase::Report),
            s if s.starts_with("--trigger-now=") => {
                opts.trigger_now = Some(parse_tone(&s["--trigger-now=".len()..])?);
            }
            "--status" => set_query(&mut opts, Query::Status)?,
            "--sensors" => set_query(&mut opts, Query::Sensors)?,
            "--latest" => set_query(&mut opts, Query::Latest)?,
            "--history" => {
                let value = args.next().unwrap_or_default();
                let hours = value
                    .parse::<i64>()
                    .map_err(|_| format!("`--history` expects a number of hours, got {:?}", value))?;
                set_query(&mut opts, Query::History(hours))?;
            }
            "--" => break,
            other => return Err(format!("unrecognised argument: {}", other)),
        }
    }
    Ok(opts)
}

/// Loads the env file named on the command line, or `.env` from the working directory when present.
fn load_environment(opts: &Options) -> Result<Option<(PathBuf, usize)>, String> {
    let path = match &opts.env_file {
        Some(path) if !path.is_file() => return Err(format!("env file not found: {}", path.display())),
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            default_path
        }
    };
    let applied = config::load_env_file(&path)?;
    Ok(Some((path, applied)))
}

fn open_store(cfg: &Config) -> Result<Arc<dyn TimeSeriesStore>, String> {
    if cfg.uses_memory_store() {
        warn!("Using the in-process store; readings and messages are lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(&cfg.database_url, cfg.database_pool_size, DB_CONNECT_TIMEOUT)?;
    info!("Connected to database (pool size {})", cfg.database_pool_size);
    Ok(Arc::new(store))
}

fn run(opts: &Options) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (devices={}, primary={}, stage={}, tick={}s, window={}min, utc_offset={}, provider_timeout={}s, attempts={}, cycle_deadline={}s)",
        cfg.allowed_devices.len(),
        cfg.primary_device,
        cfg.growth_stage,
        cfg.tick_interval.as_secs(),
        cfg.schedule.window_minutes,
        cfg.schedule.offset,
        cfg.provider_timeout.as_secs(),
        cfg.provider_max_attempts,
        cfg.cycle_deadline.as_secs()
    );

    // 2) Storage
    let store = open_store(&cfg)?;

    // 3) Providers
    let agent = build_agent(cfg.provider_timeout);
    let llm = OpenRouterClient::new(
        agent.clone(),
        &cfg.llm.url,
        &cfg.llm.api_key,
        &cfg.llm.model,
        cfg.llm.max_tokens,
    );
    let tts = ElevenLabsClient::new(
        agent,
        &cfg.tts.base_url,
        &cfg.tts.api_key,
        &cfg.tts.voice_id,
        &cfg.tts.model_id,
    );
    let policy = RetryPolicy::new(cfg.provider_max_attempts, cfg.provider_backoff);

    // 4) Generation pipeline and scheduler
    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        DeviceId(cfg.primary_device.clone()),
        cfg.snapshot_window,
    ));
    let cache = Arc::new(LatestStateCache::restore(&cfg.latest_state_file));
    let pipeline = Arc::new(Pipeline::new(
        aggregator.clone(),
        Interpreter::new(Arc::new(llm), policy.clone(), &cfg.plant_name, cfg.growth_stage),
        Narrator::new(Arc::new(tts), AudioStore::new(&cfg.audio_dir, cfg.audio_keep), policy),
        cache.clone(),
        store.clone(),
        cfg.cycle_deadline,
    ));
    let scheduler = Arc::new(Scheduler::new(cfg.schedule.clone(), pipeline));
    scheduler.seed_from_store(&*store, Utc::now());
    let dashboard = Dashboard::new(
        aggregator,
        cache,
        scheduler.clone(),
        cfg.device_stale_after,
        cfg.growth_stage,
    );

    if let Some(query) = opts.query {
        let now = Utc::now();
        let document = match query {
            Query::Status => serde_json::to_value(dashboard.status(now)),
            Query::Sensors => {
                let sensors = dashboard.current_sensors(now).map_err(|e| format!("reading sensors failed: {}", e))?;
                serde_json::to_value(sensors)
            }
            Query::Latest => serde_json::to_value(dashboard.latest_message().as_deref()),
            Query::History(hours) => {
                let history = dashboard
                    .history(hours, now)
                    .map_err(|e| format!("reading history failed: {}", e))?;
                serde_json::to_value(history)
            }
        }
        .map_err(|e| format!("encoding {:?} failed: {}", query, e))?;
        println!("{:#}", document);
        return Ok(());
    }

    // 5) Device ingestion over stdin
    if opts.stdin_ingest {
        let ingestor = Ingestor::new(&cfg.allowed_devices, store.clone());
        thread::Builder::new()
            .name("stdin-ingest".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                let stdout = std::io::stdout();
                match ingest::serve_lines(&ingestor, stdin.lock(), stdout.lock()) {
                    Ok(()) => info!("Ingestion input closed"),
                    Err(e) => error!("Ingestion stopped: {}", e),
                }
            })
            .map_err(|e| format!("could not start ingestion thread: {}", e))?;
        info!("Accepting device readings on stdin");
    }

    // 6) Optional manual cycle
    if let Some(tone) = opts.trigger_now {
        match dashboard.trigger_now(Utc::now(), tone) {
            Ok(state) => info!(
                "Manual cycle published {} ({})",
                state.event.id,
                state.event.outcome.as_str()
            ),
            Err(e) => warn!("Manual cycle: {}", e),
        }
    }

    // 7) Scheduler loop (steady cadence)
    let now = Utc::now();
    info!(
        "Starting scheduler: phase={}, next update {} local, interval={}s",
        cfg.schedule.phase(now).phase,
        cfg.schedule.next_update(now),
        cfg.tick_interval.as_secs()
    );
    schedule::run_loop(&scheduler, cfg.tick_interval)
}

fn main() {
    let opts = match parse_options(std::env::args().skip(1)) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(2);
        }
    };
    let loaded_env = match load_environment(&opts) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some((path, applied)) = loaded_env {
        info!("Environment loaded from {} ({} variable(s) applied)", path.display(), applied);
    }

    info!(
        "plantvoice {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&opts) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
