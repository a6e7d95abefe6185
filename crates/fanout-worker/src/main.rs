mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use fanout::config::EngineConfig;
use fanout::engine::RecoveryScheduler;
use fanout::error::ConfigError;
use fanout::worker::crossbeam_channel;
use fanout::{
    load_config, Database, Engine, FanoutError, FileSplitter, OpenAiClient, TaskQueue,
    UnitProgressBroadcaster, WorkerError, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(version, about)]
/// Runs fanout task workers and the recovery sweeper until interrupted.
struct Args {
    /// Path to the JSON engine config
    #[arg(short = 'c', long = "config", default_value = "fanout.json")]
    config: PathBuf,

    /// Override the configured worker thread count
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Override the configured database file
    #[arg(long)]
    database: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(database) = args.database {
        config.database_path = Some(database);
    }

    if let Err(e) = logging::init(config.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: EngineConfig) -> Result<(), FanoutError> {
    info!("Starting fanout-worker v{}", env!("CARGO_PKG_VERSION"));

    let database_path = config
        .database_path
        .clone()
        .or_else(fanout::db::default_database_path)
        .ok_or_else(|| ConfigError::Validation {
            message: "database_path is not set and no home directory was found".to_string(),
        })?;
    let db = Database::open(&database_path)?;

    let api_key = config
        .completion
        .api_key
        .resolve()
        .map_err(ConfigError::from)?;
    let client = OpenAiClient::new(
        &config.completion.base_url,
        api_key,
        config.completion.timeout(),
    )?;

    let notifier = Arc::new(UnitProgressBroadcaster::new(config.notification_capacity));
    let (queue, receiver) = TaskQueue::new();
    let engine = Arc::new(Engine::new(
        &config,
        db,
        Arc::new(queue.clone()),
        Arc::new(client),
        notifier,
        Arc::new(FileSplitter),
    ));

    let pool = WorkerPool::spawn(queue.clone(), receiver, engine, config.worker_count)?;

    let (trigger_tx, trigger_rx) = tokio::sync::broadcast::channel(4);
    let scheduler = if config.sweeper.enabled {
        let scheduler = RecoveryScheduler::new(Arc::new(queue.clone()), config.sweeper.interval());
        let handle = scheduler.start(trigger_rx)?;
        // Pick up whatever a previous process left behind.
        let _ = trigger_tx.send(());
        Some((scheduler, handle))
    } else {
        info!("Recovery sweeper disabled");
        None
    };

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .map_err(|e| WorkerError::SpawnFailed(format!("signal handler: {}", e)))?;

    info!(
        "Running {} workers against {}",
        config.worker_count,
        database_path.display()
    );
    let _ = stop_rx.recv();
    info!("Shutdown requested");

    if let Some((scheduler, handle)) = scheduler {
        scheduler.stop();
        if handle.join().is_err() {
            error!("Recovery scheduler panicked");
        }
    }
    pool.wait();

    info!("fanout-worker stopped");
    Ok(())
}
