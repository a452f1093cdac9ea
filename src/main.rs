use std::sync::Arc;

use structopt::StructOpt;
use tracing::{event, Level};

use drudge::{
    backends::{MemoryKeyStore, MemoryQueue},
    consumer::Consumer,
    error::Error,
    invoker::Invoker,
    registry::Registry,
    settings::Settings,
    tracing_config,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "drudged", about = "Run the drudge task queue consumer")]
struct Args {
    #[structopt(help = "Path to the consumer configuration file")]
    config: String,

    #[structopt(long, help = "Worker pool size")]
    threads: Option<usize>,

    #[structopt(long, help = "Enable or disable periodic task enqueueing")]
    periodic: Option<bool>,

    #[structopt(long, help = "Idle backoff multiplier for the receiver")]
    backoff: Option<f64>,

    #[structopt(long, help = "Initial idle delay in milliseconds")]
    initial_delay_ms: Option<u64>,

    #[structopt(long, help = "Maximum idle delay in milliseconds")]
    max_delay_ms: Option<u64>,

    #[structopt(long, help = "Treat deferred etas as local wall time")]
    utc: Option<bool>,

    #[structopt(long, parse(from_os_str), help = "Write logs to this file instead of stdout")]
    logfile: Option<std::path::PathBuf>,

    #[structopt(long, help = "Default log level when LOG is unset")]
    loglevel: Option<String>,
}

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if args.threads.is_some() {
        settings.threads = args.threads;
    }
    if args.periodic.is_some() {
        settings.periodic = args.periodic;
    }
    if args.backoff.is_some() {
        settings.backoff = args.backoff;
    }
    if args.initial_delay_ms.is_some() {
        settings.initial_delay_ms = args.initial_delay_ms;
    }
    if args.max_delay_ms.is_some() {
        settings.max_delay_ms = args.max_delay_ms;
    }
    if args.utc.is_some() {
        settings.utc = args.utc;
    }
    if args.logfile.is_some() {
        settings.logfile = args.logfile.clone();
    }
    if args.loglevel.is_some() {
        settings.loglevel = args.loglevel.clone();
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let mut settings = Settings::load(&args.config)?;
    apply_overrides(&mut settings, &args);

    tracing_config::configure(
        "drudged",
        settings.logfile.as_deref(),
        settings.loglevel.as_deref(),
    );

    // The stock driver wires the in-process transport. Deployments with
    // real handlers and transports embed the library and build their own
    // registry and backends, then reuse Consumer::run.
    let registry = Arc::new(Registry::new());
    let config = settings.consumer_config();
    let invoker = Arc::new(
        Invoker::new(
            Arc::new(MemoryQueue::new(settings.queue_name())),
            Arc::new(MemoryKeyStore::new("results")),
            Arc::new(MemoryKeyStore::new("tasks")),
            registry,
        )
        .with_utc(config.utc),
    );

    if invoker.registry().is_empty() {
        event!(
            Level::WARN,
            "no handlers registered; the consumer will drop every message"
        );
    }

    let consumer = Consumer::new(invoker, config)?;
    consumer.run().await
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args = Args::from_args();
    if let Err(e) = run(args).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
