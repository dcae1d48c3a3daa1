use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use turnstile::cli::{Cli, Commands};
use turnstile::{
    initialize_config, Checkpoint, ConcurrencyController, Config, Distributor, HttpTransport,
    InitOptions, LoggingConfig, MockTransport, RateLimiter, RequestSpec, RunSummary, Scheduler,
    Transport,
};

/// Parsed requests buffered ahead of the scheduler
const REQUEST_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init doesn't need config loading
    if let Commands::Init { no_prompt, force } = cli.command {
        init_logging(&cli, &LoggingConfig::default());
        initialize_config(InitOptions {
            config_path: cli.config,
            no_prompt,
            force,
        })
        .await?;
        return Ok(());
    }

    let config_path = Config::resolve_path(cli.config.as_deref());
    init_logging(&cli, &LoggingConfig::peek(&config_path));
    let mut config = Config::load_or_init(&config_path)?;

    let result = match &cli.command {
        Commands::Endpoints { checkpoint } => {
            let checkpoint = match checkpoint {
                Some(path) => Checkpoint::load(path)?,
                None => None,
            };
            print!("{}", render_endpoints(&config, checkpoint.as_ref()));
            Ok(())
        }
        Commands::Run {
            requests,
            checkpoint,
            dry_run,
            ..
        } => {
            config.apply(&cli.command.overrides());
            config.validate()?;
            run(config, requests.as_deref(), checkpoint.clone(), *dry_run).await
        }
        Commands::Init { .. } => unreachable!(), // Already handled above
    };

    if let Err(ref e) = result {
        eprintln!("{e:#}");
    }
    result
}

/// Installs the subscriber on stderr, leaving stdout for results. `RUST_LOG` wins when set.
fn init_logging(cli: &Cli, logging: &LoggingConfig) {
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.clone().unwrap_or_else(|| logging.level.clone())
    };
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| logging.format.clone());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

/// Endpoints in failover order with their quota usage, restored from `checkpoint` if given
fn render_endpoints(config: &Config, checkpoint: Option<&Checkpoint>) -> String {
    let mut endpoints: Vec<_> = config.endpoints.iter().collect();
    endpoints.sort_by(|(a_name, a), (b_name, b)| {
        a.priority.cmp(&b.priority).then_with(|| a_name.cmp(b_name))
    });

    let usage = |count: u64, limit: i64| {
        if limit < 0 {
            count.to_string()
        } else {
            format!("{count}/{limit}")
        }
    };

    endpoints
        .into_iter()
        .map(|(name, endpoint)| {
            let limiter = RateLimiter::new(
                name.clone(),
                endpoint,
                config.pacing.clone(),
                config.breaker.clone(),
            );
            if let Some(snapshot) = checkpoint.and_then(|c| c.quota_for(name)) {
                limiter.restore_quota(&snapshot);
            }
            let status = limiter.status();
            format!(
                "{:>4}  {:<16} {}  rate {} [{}, {}]  hour {}  day {}  month {}\n",
                status.priority,
                status.name,
                status.url,
                status.current_rate,
                endpoint.min_rate(),
                endpoint.max_rate(),
                usage(status.quota.hour.count, endpoint.limit_hour),
                usage(status.quota.day.count, endpoint.limit_day),
                usage(status.quota.month.count, endpoint.limit_month),
            )
        })
        .collect()
}

/// Sends one request per non-blank line until the input ends or the receiver goes away
fn read_requests(reader: impl BufRead, tx: &mpsc::Sender<RequestSpec>) -> Result<()> {
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let spec = serde_json::from_str(&line)
            .with_context(|| format!("Invalid request on line {}", index + 1))?;
        if tx.blocking_send(spec).is_err() {
            break;
        }
    }
    Ok(())
}

/// Reads requests on a dedicated thread so an open pipe never holds up dispatch.
///
/// A read or parse error closes the request channel and is delivered on the
/// second receiver.
fn spawn_reader(
    requests: Option<&Path>,
) -> Result<(mpsc::Receiver<RequestSpec>, oneshot::Receiver<anyhow::Error>)> {
    let input: Box<dyn BufRead + Send> = match requests {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
    let (error_tx, error_rx) = oneshot::channel();
    // a plain thread: a blocked stdin read must not keep the runtime alive at exit
    std::thread::spawn(move || {
        if let Err(e) = read_requests(input, &tx) {
            let _ = error_tx.send(e);
        }
    });
    Ok((rx, error_rx))
}

async fn run(
    config: Config,
    requests: Option<&Path>,
    checkpoint_path: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let (requests, mut read_error) = spawn_reader(requests)?;

    let summary = if dry_run {
        info!("Dry run: requests are answered locally");
        dispatch(config, MockTransport::new(), requests, checkpoint_path).await?
    } else {
        dispatch(config, HttpTransport::new(), requests, checkpoint_path).await?
    };

    if let Ok(e) = read_error.try_recv() {
        return Err(e);
    }
    if summary.dropped > 0 {
        bail!("{} requests could not be dispatched", summary.dropped);
    }
    Ok(())
}

async fn dispatch<T: Transport + 'static>(
    config: Config,
    transport: T,
    requests: mpsc::Receiver<RequestSpec>,
    checkpoint_path: Option<PathBuf>,
) -> Result<RunSummary> {
    let checkpoint = match &checkpoint_path {
        Some(path) => Checkpoint::load(path)?,
        None => None,
    };

    let controller = Arc::new(match &checkpoint {
        Some(checkpoint) => {
            info!("Resuming at concurrency {}", checkpoint.concurrency_level);
            ConcurrencyController::with_level(config.concurrency.clone(), checkpoint.concurrency_level)
        }
        None => ConcurrencyController::new(config.concurrency.clone()),
    });

    let distributor = Arc::new(Distributor::new(
        config.build_limiters(),
        controller.clone(),
        transport,
        config.transport.clone(),
    ));
    if let Some(checkpoint) = &checkpoint {
        checkpoint.restore_into(&*distributor);
    }

    let cancel = CancellationToken::new();
    let listener = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, finishing in-flight requests");
                cancel.cancel();
            }
        }
    });

    let mut scheduler = Scheduler::new(controller.clone(), config.scheduler.clone(), cancel);
    if let Some(path) = checkpoint_path {
        let controller = controller.clone();
        let distributor = distributor.clone();
        scheduler = scheduler.on_progress(move |summary| {
            let checkpoint = Checkpoint::capture(&controller, &*distributor);
            if let Err(e) = checkpoint.save(&path) {
                warn!("Failed to save checkpoint after {} requests: {:#}", summary.completed(), e);
            }
        });
    }

    let summary = scheduler
        .run_from(requests, |spec: RequestSpec| {
            let distributor = distributor.clone();
            async move {
                let dispatched = distributor.execute(&spec).await?;
                println!(
                    "{}",
                    json!({
                        "endpoint": dispatched.endpoint,
                        "status": dispatched.response.status,
                        "body": dispatched.response.body,
                    })
                );
                Ok(())
            }
        })
        .await;
    listener.abort();

    info!(
        "{} succeeded, {} dropped, final concurrency {}",
        summary.succeeded,
        summary.dropped,
        controller.current_level()
    );
    Ok(summary)
}
