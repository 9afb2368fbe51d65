//! Sensus Collector CLI
//!
//! Runs a location protocol over a simulated GPS, with optional surveys
//! answered on the console.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sensus_collector::{
    config::{Config, ProbeMode},
    datastore::{local::load_persisted, LocalDataStore, SharedSink},
    probe::{Datum, GpsReceiver, LocationMeasure, SimulatedGps, WakeLock},
    script::{
        load_template, PromptInput, PromptRequest, PromptResponder, ResponseKind, Script, TokioScheduler,
    },
    Probe, PropertyChange, Protocol, SharedProbe, StartOutcome, VERSION,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sensus")]
#[command(author = "Sensus")]
#[command(version = VERSION)]
#[command(about = "Probe-based sensing collector for research protocols", long_about = None)]
struct Cli {
    /// Log filter, e.g. "debug" or "sensus_collector=trace" (defaults to RUST_LOG, then info)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the protocol
    Start {
        /// How location probes obtain readings
        #[arg(long, value_enum)]
        mode: Option<ProbeMode>,

        /// Maximum data stored per second by each listening probe
        #[arg(long)]
        max_rate: Option<f64>,

        /// Survey script template to schedule once the protocol is running
        #[arg(long)]
        script: Option<PathBuf>,

        /// Milliseconds between simulated GPS fixes
        #[arg(long, default_value = "250")]
        gps_period_ms: u64,
    },

    /// Pause data collection
    Pause,

    /// Resume data collection
    Resume,

    /// Show current collection status
    Status,

    /// Show configuration
    Config,

    /// Validate a survey script template
    CheckScript {
        /// Path to the template
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Commands::Start {
            mode,
            max_rate,
            script,
            gps_period_ms,
        } => cmd_start(mode, max_rate, script, Duration::from_millis(gps_period_ms)),
        Commands::Pause => cmd_pause(),
        Commands::Resume => cmd_resume(),
        Commands::Status => cmd_status(),
        Commands::Config => cmd_config(),
        Commands::CheckScript { path } => cmd_check_script(&path),
    }
}

fn init_tracing(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    Ok(())
}

fn load_config() -> Config {
    Config::load().unwrap_or_else(|e| {
        warn!("Could not load configuration, using defaults: {e}");
        Config::default()
    })
}

fn cmd_start(
    mode: Option<ProbeMode>,
    max_rate: Option<f64>,
    script_path: Option<PathBuf>,
    gps_period: Duration,
) -> anyhow::Result<()> {
    println!("Sensus Collector v{VERSION}");
    println!();

    let mut config = load_config();
    if let Some(mode) = mode {
        config.location.mode = mode;
    }
    if let Some(rate) = max_rate {
        if rate.is_nan() || rate <= 0.0 {
            bail!("--max-rate must be positive");
        }
        config.location.max_data_per_second = rate;
    }
    if let Err(e) = config.ensure_directories() {
        warn!("Could not create data directory: {e}");
    }

    // Simulated hardware
    let receiver = match config.location.max_reading_age() {
        Some(age) => GpsReceiver::new().with_max_reading_age(age),
        None => GpsReceiver::new(),
    };
    let receiver = Arc::new(receiver);
    let mut gps = SimulatedGps::new(Arc::clone(&receiver), gps_period);
    gps.start().context("failed to start simulated GPS")?;

    let store = Arc::new(LocalDataStore::with_path(config.data_path.clone()));
    let sink: SharedSink = store.clone();
    let protocol = Protocol::new(config.protocol_name.clone(), Arc::clone(&sink));
    protocol.notifier().subscribe(Arc::new(|change: &PropertyChange| {
        debug!(source = %change.source_id, attribute = change.attribute, "Protocol changed");
    }));

    if config.location.enabled {
        let wake_lock = WakeLock::default();
        for measure in [LocationMeasure::Location, LocationMeasure::Altitude, LocationMeasure::Speed] {
            let probe: SharedProbe = match config.location.mode {
                ProbeMode::Listening => Arc::new(measure.listening_probe(
                    Arc::clone(&receiver),
                    wake_lock.clone(),
                    config.location.max_data_per_second,
                )),
                ProbeMode::Polling => Arc::new(measure.polling_probe(
                    Arc::clone(&receiver),
                    config.location.poll_interval,
                    config.location.poll_timeout,
                )),
            };
            protocol.add_probe(probe)?;
        }
    }

    println!("Protocol: {}", protocol.name());
    println!("  Location probes: {}", if config.location.enabled { "enabled" } else { "disabled" });
    println!("  Mode: {}", config.location.mode);
    match config.location.mode {
        ProbeMode::Listening => println!("  Max data per second: {}", config.location.max_data_per_second),
        ProbeMode::Polling => println!("  Poll interval: {}s", config.location.poll_interval.as_secs_f64()),
    }
    println!("  Data path: {}", config.data_path.display());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(Arc::clone(&running))?;

    // Support pause/resume from another process by polling the config file.
    let mut paused = config.paused;
    if paused {
        println!("Collection is currently paused.");
        println!("Run `sensus resume` to start collecting.");
        println!();
    } else {
        start_protocol(&protocol)?;
    }

    let scheduler = TokioScheduler::new()?;
    let script_handle = script_path
        .or_else(|| config.scripts.template_path.clone())
        .and_then(|path| load_template(&path))
        .map(|template| {
            let mut script = template.copy();
            script.set_prompt_timeout(config.scripts.prompt_timeout);
            let script = Arc::new(script);

            let trigger = receiver
                .latest()
                .and_then(|position| LocationMeasure::Location.convert(position))
                .map(|kind| Datum::new(protocol.id(), kind));

            let responses = Arc::clone(&store);
            let name = script.name().to_string();
            println!("Scheduled script \"{name}\" in {}s", script.delay().as_secs_f64());

            script.run_async(&scheduler, Arc::new(ConsoleInput), None, trigger, move |data| {
                let offered = data.len();
                let stored = responses.accept_batch(&name, data);
                info!(script = %name, offered, stored, "Script responses handed to the data store");
            })
        });

    let mut last_config_check = Instant::now();
    while running.load(Ordering::SeqCst) {
        // Periodically reload config so `sensus pause/resume` can control a running collector.
        if last_config_check.elapsed() >= Duration::from_secs(1) {
            if let Ok(cfg) = Config::load() {
                if cfg.paused != paused {
                    paused = cfg.paused;
                    if paused {
                        println!("Pausing collection...");
                        protocol.stop();
                    } else {
                        println!("Resuming collection...");
                        start_protocol(&protocol)?;
                    }
                }
            }
            last_config_check = Instant::now();
        }

        thread::sleep(Duration::from_millis(100));
    }

    println!();
    println!("Stopping collection...");
    if let Some(handle) = script_handle {
        handle.cancel();
    }
    protocol.stop();
    gps.stop();

    println!();
    println!("Probe Statistics:");
    for probe in protocol.probes() {
        let stats = probe.stats();
        println!(
            "  {}: {} stored, {} rate-limited",
            probe.display_name(),
            stats.stored,
            stats.rate_limited
        );
    }
    println!();
    println!("{}", store.summary());
    Ok(())
}

fn start_protocol(protocol: &Protocol) -> anyhow::Result<()> {
    match protocol.start() {
        StartOutcome::Started(count) => {
            println!("Started {count} probe(s).");
            Ok(())
        }
        StartOutcome::AlreadyRunning => Ok(()),
        StartOutcome::DataStoreUnavailable => bail!("data store is unavailable; see log for details"),
        StartOutcome::NoProbesStarted => bail!("no probes could be started"),
        StartOutcome::DataStoreStartFailed => bail!("data store failed to start"),
    }
}

fn cmd_pause() -> anyhow::Result<()> {
    let mut config = load_config();
    config.paused = true;
    config.save().context("Error saving config")?;
    println!("Collection paused. Use 'sensus resume' to continue.");
    Ok(())
}

fn cmd_resume() -> anyhow::Result<()> {
    let mut config = load_config();
    config.paused = false;
    config.save().context("Error saving config")?;
    println!("Collection resumed.");
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let config = load_config();

    println!("Sensus Collector Status");
    println!("=======================");
    println!();

    println!("Configuration:");
    println!("  Protocol: {}", config.protocol_name);
    println!(
        "  Location probes: {} ({})",
        if config.location.enabled { "enabled" } else { "disabled" },
        config.location.mode
    );
    match &config.scripts.template_path {
        Some(path) => println!("  Script template: {}", path.display()),
        None => println!("  Script template: none"),
    }
    println!("  Paused: {}", config.paused);
    println!();

    match load_persisted(&config.data_path) {
        Ok(Some(stats)) => {
            println!("Cumulative Statistics:");
            println!("  Data accepted: {}", stats.accepted);
            println!("  Data written: {}", stats.written);
            println!("  Data rejected while stopped: {}", stats.rejected);
            println!("  Last updated: {}", stats.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        Ok(None) => println!("No previous session data found."),
        Err(e) => warn!("Could not read data store statistics: {e}"),
    }
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    let config = load_config();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_check_script(path: &std::path::Path) -> anyhow::Result<()> {
    let script = Script::load(path).with_context(|| format!("invalid script {}", path.display()))?;

    println!("Script: {}", script.name());
    println!("  Delay: {}s", script.delay().as_secs_f64());
    println!("  Prompts: {}", script.prompts().len());
    for (index, prompt) in script.prompts().iter().enumerate() {
        println!(
            "    {}. [{:?}] {}{}",
            index + 1,
            prompt.response_kind(),
            prompt.message(),
            if prompt.is_complete() { " (complete)" } else { "" }
        );
    }
    Ok(())
}

/// Asks prompts on stdin. An empty line dismisses the prompt.
struct ConsoleInput;

impl PromptInput for ConsoleInput {
    fn request(&self, request: PromptRequest, responder: PromptResponder) {
        let hint = match request.response_kind {
            ResponseKind::Text => "",
            ResponseKind::YesNo => " [y/n]",
            ResponseKind::Number => " [number]",
        };

        println!();
        if request.is_rerun {
            println!(
                "(Reminder, first asked {})",
                request.first_run_timestamp.format("%H:%M:%S")
            );
        }
        print!("{}{hint} ", request.message);
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        let answer = match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) if line.trim().is_empty() => None,
            Ok(_) => Some(line),
        };
        responder.respond(answer);
    }
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")
}
