//! mongoprofd - MongoDB slow operation profiler daemon.
//!
//! Enables profiling on the listened database, tails `system.profile` and
//! stores every slow operation, plus one example per query shape, in the
//! internal database.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use mongoprof_core::config::{
    DEFAULT_SLOW_MS, DispatchConfig, ProfilerConfig, ProfilingLevel, RetentionConfig,
    RetryPolicy, SLOWOPS_EXPIRE_SECONDS, WatermarkPolicy,
};
use mongoprof_core::error::{ConfigError, ProfilerError};
use mongoprof_core::persistence::{SlowOpsPipeline, SlowOpsWriter};
use mongoprof_core::profiler::{BufferSizer, Dispatcher, Tailer};
use mongoprof_core::store::{MongoStore, StoreHandle, connect_with_retry};

/// MongoDB slow operation profiler daemon.
#[derive(Parser, Debug)]
#[command(
    name = "mongoprofd",
    about = "MongoDB slow operation profiler daemon",
    version
)]
struct Args {
    /// Connection string of the database to profile. Must name a database.
    #[arg(long, env = "MONGOPROF_LISTENED", value_name = "URI")]
    listened: String,

    /// Connection string of the database storing slow operations.
    #[arg(
        long,
        env = "MONGOPROF_INTERNAL",
        value_name = "URI",
        default_value = "mongodb://localhost:27017/profiler"
    )]
    internal: String,

    /// Operations slower than this many milliseconds are profiled.
    #[arg(long, default_value_t = DEFAULT_SLOW_MS)]
    slow_ms: u64,

    /// Profiling level: 1 profiles slow operations only, 2 profiles everything.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    profile_level: u8,

    /// Seconds to wait before reopening a closed cursor, also the base
    /// delay between connection attempts.
    #[arg(long, default_value = "10")]
    retry_after: u64,

    /// Number of tasks writing entries to the internal database.
    #[arg(long, default_value = "8")]
    workers: usize,

    /// Entries waiting to be written. When full, the oldest entry is dropped.
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,

    /// Seconds stored records are kept before expiring.
    #[arg(long, default_value_t = SLOWOPS_EXPIRE_SECONDS)]
    retention_secs: u64,

    /// Read system.profile from the start every time the cursor is reopened
    /// instead of resuming after the last entry seen.
    #[arg(long)]
    replay_from_start: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace including driver commands).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn profiler_config(&self) -> Result<ProfilerConfig, ConfigError> {
        let config = ProfilerConfig {
            level: ProfilingLevel::try_from(self.profile_level)?,
            slow_ms: self.slow_ms,
            retry_after: Duration::from_secs(self.retry_after),
            watermark: if self.replay_from_start {
                WatermarkPolicy::Fixed
            } else {
                WatermarkPolicy::Advance
            },
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig::new(self.workers, self.queue_capacity)
    }

    fn retention(&self) -> RetentionConfig {
        RetentionConfig::new(Duration::from_secs(self.retention_secs))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(self.retry_after),
            ..Default::default()
        }
    }

    fn log_config(&self) -> LogConfig {
        LogConfig {
            verbose: self.verbose,
            quiet: self.quiet,
        }
    }
}

/// Logging verbosity, decided once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LogConfig {
    verbose: u8,
    quiet: bool,
}

impl LogConfig {
    fn level(&self) -> Level {
        if self.quiet {
            return Level::ERROR;
        }
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    /// Driver events are only shown at the highest verbosity.
    fn driver_level(&self) -> Level {
        if self.quiet {
            Level::ERROR
        } else if self.verbose >= 2 {
            Level::DEBUG
        } else {
            Level::WARN
        }
    }

    fn directives(&self) -> Vec<String> {
        let level = self.level();
        vec![
            format!("mongoprofd={}", level),
            format!("mongoprof_core={}", level),
            format!("mongodb={}", self.driver_level()),
        ]
    }
}

fn init_logging(config: LogConfig) {
    let filter = config
        .directives()
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(EnvFilter::from_default_env(), EnvFilter::add_directive);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// SIGINT, SIGTERM and SIGQUIT all request a graceful stop.
struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_config());

    let signals = match ShutdownSignals::install() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install signal handlers");
            std::process::exit(1);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "mongoprofd starting");

    if let Err(e) = run(args, signals).await {
        error!(error = %e, "mongoprofd failed");
        std::process::exit(1);
    }
    info!("mongoprofd stopped");
}

async fn run(args: Args, mut signals: ShutdownSignals) -> Result<(), ProfilerError> {
    let config = args.profiler_config()?;
    let retry = args.retry_policy();

    let listened = Arc::new(
        MongoStore::from_uri(&args.listened)
            .await?
            .with_poll_interval(config.poll_interval),
    );
    let internal = Arc::new(MongoStore::from_uri(&args.internal).await?);
    if listened.target().same_database(internal.target()) {
        return Err(ConfigError::SameTarget(listened.target().database.clone()).into());
    }

    let writer = SlowOpsWriter::new(internal.clone(), args.retention());
    if let Startup::Interrupted(signal) =
        startup(listened.as_ref(), &writer, &retry, signals.recv()).await?
    {
        info!(signal, "received signal during startup, shutting down");
        let listened_closed = listened.shutdown().await.map_err(ProfilerError::Teardown);
        let internal_closed = internal.shutdown().await.map_err(ProfilerError::Teardown);
        return listened_closed.and(internal_closed);
    }

    let sizer = Arc::new(BufferSizer::new(listened.clone(), &config));
    sizer.grow().await?;

    let host = listened.target().host_label();
    let dispatcher = Dispatcher::start(
        args.dispatch_config(),
        Arc::new(SlowOpsPipeline::new(writer, host.clone())),
    );

    let shutdown = CancellationToken::new();
    let (tailer, handle) = Tailer::new(listened.clone(), sizer.clone(), &config, &shutdown);
    let mut tail_task = tokio::spawn(tailer.run(dispatcher.sender()));

    info!(
        hosts = %host,
        database = %listened.target().database,
        internal = %internal.target().database,
        "profiler running"
    );

    let finished = tokio::select! {
        signal = signals.recv() => {
            info!(signal, "received signal, shutting down");
            handle.stop();
            None
        }
        joined = &mut tail_task => Some(joined),
    };
    let joined = match finished {
        Some(joined) => joined,
        None => tail_task.await,
    };
    shutdown.cancel();

    let tail_result = match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            warn!(error = %e, "tailer task cancelled");
            Ok(())
        }
    };

    // Teardown runs even after a tailer failure so profiling is not left on.
    let teardown = teardown(&sizer, dispatcher, listened.as_ref(), internal.as_ref()).await;
    if let Some(dropped) = teardown.as_ref().ok().copied().filter(|d| *d > 0) {
        warn!(dropped, "entries dropped because the dispatch queue was full");
    }
    tail_result.and(teardown.map(|_| ()))
}

#[derive(Debug, PartialEq)]
enum Startup {
    Ready,
    Interrupted(&'static str),
}

/// Connects both stores and initializes the slowops collections, giving up
/// as soon as `stop` resolves. Profiling is not touched here, so an
/// interrupted startup leaves nothing to undo on the listened database.
async fn startup<L, I>(
    listened: &L,
    writer: &SlowOpsWriter<I>,
    retry: &RetryPolicy,
    stop: impl Future<Output = &'static str>,
) -> Result<Startup, ProfilerError>
where
    L: StoreHandle + ?Sized,
    I: StoreHandle + ?Sized,
{
    let ready = async {
        connect_with_retry(listened, retry).await?;
        connect_with_retry(writer.store().as_ref(), retry).await?;
        writer.init().await
    };
    tokio::select! {
        signal = stop => Ok(Startup::Interrupted(signal)),
        result = ready => result.map(|()| Startup::Ready),
    }
}

/// Disables profiling, drains pending entries and disconnects both stores.
/// Returns the number of entries the dispatcher had to drop.
async fn teardown(
    sizer: &BufferSizer<MongoStore>,
    dispatcher: Dispatcher,
    listened: &MongoStore,
    internal: &MongoStore,
) -> Result<u64, ProfilerError> {
    let disabled = sizer.disable().await;

    let dropped = dispatcher.dropped();
    dispatcher.shutdown().await;

    let listened_closed = listened.shutdown().await.map_err(ProfilerError::Teardown);
    let internal_closed = internal.shutdown().await.map_err(ProfilerError::Teardown);

    disabled.and(listened_closed).and(internal_closed)?;
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongoprof_core::config::{SLOWOPS_COLLECTION, SLOWOPS_EXAMPLE_COLLECTION};
    use mongoprof_core::error::StoreError;
    use mongoprof_core::store::{MemoryStore, StoreCall, StoreOp};

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["mongoprofd", "--listened", "mongodb://db1:27017/app"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.internal, "mongodb://localhost:27017/profiler");

        let config = args.profiler_config().unwrap();
        assert_eq!(config.level, ProfilingLevel::SlowOnly);
        assert_eq!(config.slow_ms, 100);
        assert_eq!(config.retry_after, Duration::from_secs(10));
        assert_eq!(config.watermark, WatermarkPolicy::Advance);

        let dispatch = args.dispatch_config();
        assert_eq!((dispatch.workers, dispatch.capacity), (8, 1024));
        assert_eq!(
            args.retention().expire_after,
            Duration::from_secs(7_884_000)
        );
        assert_eq!(args.retry_policy().max_attempts, 3);
    }

    #[test]
    fn listened_is_required() {
        assert!(Args::try_parse_from(["mongoprofd"]).is_err());
    }

    #[test]
    fn profile_level_is_bounded() {
        assert!(Args::try_parse_from(["mongoprofd", "--listened", "x", "--profile-level", "0"]).is_err());
        assert!(Args::try_parse_from(["mongoprofd", "--listened", "x", "--profile-level", "3"]).is_err());
        let args = parse(&["--profile-level", "2"]);
        assert_eq!(args.profiler_config().unwrap().level, ProfilingLevel::All);
    }

    #[test]
    fn replay_from_start_pins_watermark() {
        let args = parse(&["--replay-from-start"]);
        assert_eq!(
            args.profiler_config().unwrap().watermark,
            WatermarkPolicy::Fixed
        );
    }

    #[test]
    fn log_levels() {
        assert_eq!(LogConfig::default().level(), Level::INFO);
        assert_eq!(LogConfig { verbose: 1, quiet: false }.level(), Level::DEBUG);
        assert_eq!(LogConfig { verbose: 3, quiet: false }.level(), Level::TRACE);
        assert_eq!(LogConfig { verbose: 2, quiet: true }.level(), Level::ERROR);
    }

    #[test]
    fn driver_traces_need_two_v() {
        let quiet_driver = LogConfig { verbose: 1, quiet: false }.directives();
        assert!(quiet_driver.contains(&"mongodb=WARN".to_string()));
        let chatty = LogConfig { verbose: 2, quiet: false }.directives();
        assert!(chatty.contains(&"mongodb=DEBUG".to_string()));
        assert!(chatty.contains(&"mongoprof_core=TRACE".to_string()));
    }

    #[test]
    fn verbosity_flags() {
        let args = parse(&["-vv"]);
        assert_eq!(args.log_config(), LogConfig { verbose: 2, quiet: false });
        let args = parse(&["-q"]);
        assert!(args.log_config().quiet);
    }

    fn internal_writer() -> SlowOpsWriter<MemoryStore> {
        SlowOpsWriter::new(
            Arc::new(MemoryStore::new("profiler")),
            RetentionConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn signal_interrupts_connection_retries() {
        let listened = MemoryStore::new("app");
        for _ in 0..3 {
            listened.fail_next(StoreOp::Ping, StoreError::Connect("refused".to_string()));
        }
        let writer = internal_writer();
        let stop = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "SIGTERM"
        };

        let started = tokio::time::Instant::now();
        let outcome = startup(&listened, &writer, &RetryPolicy::default(), stop)
            .await
            .unwrap();

        assert_eq!(outcome, Startup::Interrupted("SIGTERM"));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(listened.calls(), vec![StoreCall::Ping]);
        assert_eq!(listened.profiling(), None);
        assert!(writer.store().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_without_signal_initializes_internal_store() {
        let listened = MemoryStore::new("app");
        let writer = internal_writer();

        let outcome = startup(
            &listened,
            &writer,
            &RetryPolicy::default(),
            std::future::pending::<&'static str>(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Startup::Ready);
        assert!(writer.store().has_collection(SLOWOPS_COLLECTION));
        assert!(writer.store().has_collection(SLOWOPS_EXAMPLE_COLLECTION));
        assert_eq!(listened.profiling(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_reports_exhausted_retries() {
        let listened = MemoryStore::new("app");
        for _ in 0..3 {
            listened.fail_next(StoreOp::Ping, StoreError::Connect("refused".to_string()));
        }
        let writer = internal_writer();

        let err = startup(
            &listened,
            &writer,
            &RetryPolicy::default(),
            std::future::pending::<&'static str>(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProfilerError::Connect { attempts: 3, .. }));
        assert!(writer.store().calls().is_empty());
    }
}
