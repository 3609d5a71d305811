//! Harness for the HubKit offline worker.
//!
//! Provides commands for:
//! - Running the install → activate → API fetch scenario against an origin
//! - Routing a single request through an activated worker
//! - Queueing requests and draining the background sync queue
//!
//! ## Usage
//!
//! ```bash
//! # Full lifecycle against a dev server
//! sw-harness scenario --origin http://localhost:3000
//!
//! # Route one request
//! sw-harness fetch http://localhost:3000/api/programs
//!
//! # Queue a request and replay it later
//! sw-harness enqueue /api/applications --method POST --body '{"startup":"Acme"}' \
//!     --header content-type=application/json
//! sw-harness sync
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hubkit_common::{init_logging, HubKitError, LogConfig, LogFormat};
use hubkit_idb::IDBFactory;
use hubkit_net::{FetchOptions, LoaderConfig, Request, ResourceLoader};
use hubkit_sw::{
    FetchOutcome, IdbPendingStore, ServiceWorker, ServiceWorkerError, WorkerConfig, WorkerEnv,
};
use serde_json::{json, Value};
use tracing::{error, info};
use url::Url;

#[derive(Parser)]
#[command(name = "sw-harness")]
#[command(about = "Drive the HubKit offline worker against a live origin")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    /// Worker configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Origin to control; overrides the configuration file
    #[arg(long, global = true)]
    origin: Option<String>,

    /// Directory holding the persistent sync queue
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install, activate, then fetch an API path twice
    Scenario {
        /// API path fetched twice
        #[arg(long, default_value = "/api/programs")]
        api_path: String,
    },

    /// Route one request through an activated worker
    Fetch {
        /// URL or origin-relative path
        url: String,
        /// Send as a navigation accepting HTML
        #[arg(long)]
        navigate: bool,
    },

    /// Queue a request for background sync
    Enqueue {
        /// URL or origin-relative path
        url: String,
        #[arg(short, long, default_value = "POST")]
        method: String,
        #[arg(short, long)]
        body: Option<String>,
        /// Header as name=value, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Replay queued requests
    Sync {
        /// Sync tag; defaults to the configured one
        #[arg(long)]
        tag: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format))?;

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let result = match load_config(cli.config.as_deref(), cli.origin) {
        Ok(config) => run(cli.command, config, &data_dir).await,
        Err(e) => Err(e),
    };

    let report = result.map_err(|e| {
        error!(
            category = e.category(),
            retryable = e.is_retryable(),
            error = %e,
            "Command failed"
        );
        e
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(
    command: Commands,
    config: WorkerConfig,
    data_dir: &Path,
) -> hubkit_common::Result<Value> {
    let report = match command {
        Commands::Scenario { api_path } => run_scenario(config, &api_path).await?,
        Commands::Fetch { url, navigate } => run_fetch(config, data_dir, &url, navigate).await?,
        Commands::Enqueue {
            url,
            method,
            body,
            headers,
        } => {
            let options = fetch_options(method, body, &headers)?;
            let (sw, _events) = build_worker(config, Some(data_dir)).await?;
            let id = sw.queue_request(&url, options).await?;
            json!({ "queued": id, "url": url })
        }
        Commands::Sync { tag } => {
            let tag = tag.unwrap_or_else(|| config.sync_tag.clone());
            let (sw, _events) = build_worker(config, Some(data_dir)).await?;
            match sw.handle_sync(&tag).await? {
                Some(report) => json!({
                    "tag": tag,
                    "report": report,
                    "remaining": sw.sync_queue().pending().await?.len(),
                }),
                None => json!({ "tag": tag, "ignored": true }),
            }
        }
    };
    Ok(report)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hubkit")
}

fn load_config(
    path: Option<&Path>,
    origin: Option<String>,
) -> hubkit_common::Result<WorkerConfig> {
    let mut config = match path {
        Some(p) => WorkerConfig::load(p)?,
        None => WorkerConfig::default(),
    };
    if let Some(origin) = origin {
        config.origin = origin;
    }
    config.validate()?;
    Ok(config)
}

fn fetch_options(
    method: String,
    body: Option<String>,
    headers: &[String],
) -> hubkit_common::Result<FetchOptions> {
    let mut options = FetchOptions {
        method: Some(method.to_ascii_uppercase()),
        body: body.map(Into::into),
        ..Default::default()
    };
    for header in headers {
        let Some((name, value)) = header.split_once('=') else {
            return Err(HubKitError::InvalidArgument(format!(
                "header must be name=value: {}",
                header
            )));
        };
        options
            .headers
            .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(options)
}

/// Worker over a live loader. With a data dir the sync queue is persisted.
async fn build_worker(
    config: WorkerConfig,
    data_dir: Option<&Path>,
) -> hubkit_common::Result<(
    ServiceWorker,
    tokio::sync::mpsc::UnboundedReceiver<hubkit_sw::WorkerEvent>,
)> {
    let loader = ResourceLoader::new(LoaderConfig::default())?;

    let factory = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            IDBFactory::persistent(&dir.join("hubkit.sqlite")).map_err(ServiceWorkerError::from)?
        }
        None => IDBFactory::new(),
    };
    let store = IdbPendingStore::open(factory).await?;

    let env = WorkerEnv::new(Arc::new(loader), Arc::new(store));
    Ok(ServiceWorker::new(config, env)?)
}

fn describe(outcome: FetchOutcome) -> Value {
    let source = outcome.source().map(|s| format!("{:?}", s).to_lowercase());
    match outcome {
        FetchOutcome::Passthrough(request) => json!({
            "outcome": "passthrough",
            "url": request.url.as_str(),
        }),
        FetchOutcome::Response { response, .. } => json!({
            "outcome": "response",
            "source": source,
            "status": response.status.as_u16(),
            "content_type": response.content_type().map(|m| m.to_string()),
            "bytes": response.bytes().len(),
        }),
        FetchOutcome::Error(e) => json!({
            "outcome": "error",
            "error": e.to_string(),
            "network_failure": e.is_network_failure(),
        }),
    }
}

async fn run_scenario(config: WorkerConfig, api_path: &str) -> hubkit_common::Result<Value> {
    let api_url = config.resolve(api_path)?;
    let (sw, _events) = build_worker(config, None).await?;

    sw.install().await?;
    let installed = sw.cached_urls().await;
    sw.activate().await?;
    info!(cache = sw.cache_name(), "Scenario worker active");

    let first = describe(sw.handle_fetch(Request::get(api_url.clone())).await);
    let second = describe(sw.handle_fetch(Request::get(api_url)).await);
    let revalidated = sw.settle().await;

    Ok(json!({
        "cache": sw.cache_name(),
        "installed": installed,
        "caches_after_activate": sw.cache_names().await,
        "state": sw.state().await,
        "first_fetch": first,
        "second_fetch": second,
        "background_tasks": revalidated,
    }))
}

async fn run_fetch(
    config: WorkerConfig,
    data_dir: &Path,
    target: &str,
    navigate: bool,
) -> hubkit_common::Result<Value> {
    let url: Url = config.resolve(target)?;
    let (sw, _events) = build_worker(config, Some(data_dir)).await?;
    sw.install().await?;
    sw.activate().await?;

    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    let outcome = describe(sw.handle_fetch(request).await);
    sw.settle().await;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_enqueue() {
        let cli = Cli::try_parse_from([
            "sw-harness",
            "-vv",
            "enqueue",
            "/api/applications",
            "-H",
            "content-type=application/json",
            "--body",
            "{}",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Enqueue { .. }));
    }

    #[test]
    fn test_fetch_options_from_flags() {
        let options = fetch_options(
            "put".into(),
            Some("{}".into()),
            &["Content-Type = application/json".into()],
        )
        .unwrap();
        assert_eq!(options.method.as_deref(), Some("PUT"));
        assert_eq!(options.headers["content-type"], "application/json");
        assert!(matches!(
            fetch_options("POST".into(), None, &["bad".into()]),
            Err(HubKitError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_load_config_origin_override() {
        let config = load_config(None, Some("https://hub.example".into())).unwrap();
        assert_eq!(config.origin, "https://hub.example");
        let err = load_config(None, Some("::".into())).unwrap_err();
        assert_eq!(err.category(), "config");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_sync_on_empty_queue_reports_nothing_remaining() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_config(None, Some("http://127.0.0.1:9".into())).unwrap();

        let report = run(Commands::Sync { tag: None }, config, dir.path()).await.unwrap();
        assert_eq!(report["tag"], "sync-pending-requests");
        assert_eq!(report["remaining"], 0);
    }
}
