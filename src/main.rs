use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use rewatch::{
    AnchoredClock, CaptureSource, ClientConfig, Clock, HttpSessionApi, MachineState,
    RewatchError, SessionEvent, SessionMachine, SyntheticAccelSource, TermuxAccelSource,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "rewatch")]
#[command(about = "Smartwatch client for server-coordinated gait and reaction-time sessions", long_about = None)]
struct Args {
    /// Experiment to join
    #[arg(long)]
    experiment_id: String,

    /// Assessment server base URL (overrides the config file)
    #[arg(long)]
    base_url: Option<String>,

    /// JSON config file; missing keys take defaults
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Accelerometer source
    #[arg(long, value_enum, default_value_t = Source::Synthetic)]
    source: Source,

    /// Status poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Upload the gait calibration window
    #[arg(long)]
    upload_calibration: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Source {
    Synthetic,
    Termux,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(poll_ms) = args.poll_ms {
        config.poll_interval_ms = poll_ms;
    }
    if args.upload_calibration {
        config.upload_calibration = true;
    }
    config.validate().context("invalid configuration")?;

    println!("[{}] Rewatch starting", ts_now());
    println!("  Server: {}", config.base_url);
    println!("  Experiment: {}", args.experiment_id);
    println!("  Source: {:?}", args.source);
    println!("  Poll interval: {}ms", config.poll_interval_ms);

    let api = HttpSessionApi::new(&config.base_url, config.request_timeout())
        .context("building HTTP client")?;
    let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::new());

    let state = match args.source {
        Source::Synthetic => {
            let source = SyntheticAccelSource::new(clock.clone());
            run_session(api, source, clock, config, &args.experiment_id).await?
        }
        Source::Termux => {
            let source = TermuxAccelSource::new(clock.clone());
            run_session(api, source, clock, config, &args.experiment_id).await?
        }
    };

    match state {
        MachineState::Aborted(reason) => Err(RewatchError::SessionAborted(reason).into()),
        state => {
            println!("[{}] Session finished: {:?}", ts_now(), state);
            Ok(())
        }
    }
}

async fn run_session<S: CaptureSource>(
    api: HttpSessionApi,
    source: S,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    experiment_id: &str,
) -> Result<MachineState> {
    let (mut machine, mut events) = SessionMachine::new(api, source, clock, config);

    let leave = machine.leave_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, leaving session");
            leave.cancel();
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            report(&event);
        }
    });

    machine
        .join(experiment_id)
        .await
        .with_context(|| format!("joining experiment {}", experiment_id))?;
    let state = machine.run().await?;

    interrupt.abort();
    // Closing the event channel lets the printer drain and exit
    drop(machine);
    let _ = printer.await;
    Ok(state)
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => log::debug!("state -> {:?}", state),
        SessionEvent::Status(text) => {
            println!("[{}] {}", ts_now(), text.replace('\n', " / "))
        }
        SessionEvent::CaptureIndicator(on) => println!(
            "[{}] Capture {}",
            ts_now(),
            if *on { "ON" } else { "OFF" }
        ),
        SessionEvent::Navigate(screen) => println!("[{}] -> {:?} screen", ts_now(), screen),
        SessionEvent::Uploaded(receipt) => println!(
            "[{}] Uploaded {} samples as {}",
            ts_now(),
            receipt.samples,
            receipt.stage
        ),
        SessionEvent::UploadFailed {
            stage,
            window_id,
            error,
        } => eprintln!(
            "[{}] Upload of window {} ({}) failed: {}",
            ts_now(),
            window_id,
            stage,
            error
        ),
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
