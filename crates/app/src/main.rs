use std::path::PathBuf;
use std::time::Duration;

use beatsync_core::{AppConfig, BeatSyncError, BeatScheduler, RealtimeDriver, RenderGraph};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

fn main() -> beatsync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { page, steps, step_ms } => run_simulate(&page, steps, step_ms),
        Commands::Live { page, duration_secs } => run_live(&page, duration_secs),
    }
}

fn run_simulate(page: &PageArgs, steps: u32, step_ms: Option<f64>) -> beatsync_core::Result<()> {
    let config = page.load()?;
    let (scheduler, graph) = mount(&config)?;
    let step = step_ms.unwrap_or(config.scheduler.frame_interval_ms);
    tracing::info!(steps, step_ms = step, layers = graph.len(), "simulating");

    for _ in 0..steps {
        scheduler.advance_by(step)?;
        println!("{}", graph.frame(&scheduler).to_json_line()?);
    }

    scheduler.shutdown();
    Ok(())
}

fn run_live(page: &PageArgs, duration_secs: f64) -> beatsync_core::Result<()> {
    let config = page.load()?;
    let (scheduler, graph) = mount(&config)?;
    tracing::info!(duration_secs, layers = graph.len(), "starting live mode");

    let interval = seconds(config.scheduler.frame_interval_ms / 1_000.0, "frame interval")?;
    let duration = seconds(duration_secs, "duration")?;
    let driver = RealtimeDriver::new(scheduler.clone(), interval);
    let mut last_tick = scheduler.tick_count();
    driver.run_for(duration, |scheduler| {
        let ticks = scheduler.tick_count();
        if ticks != last_tick {
            last_tick = ticks;
            println!("{}", graph.frame(scheduler).to_json_line()?);
        }
        Ok(())
    })?;

    tracing::info!(ticks = scheduler.tick_count(), "live mode finished");
    scheduler.shutdown();
    Ok(())
}

fn seconds(value: f64, what: &str) -> beatsync_core::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|err| BeatSyncError::msg(format!("invalid {what} `{value}`: {err}")))
}

fn mount(config: &AppConfig) -> beatsync_core::Result<(BeatScheduler, RenderGraph)> {
    let scheduler = BeatScheduler::init(&config.scheduler)?;
    let mut graph = RenderGraph::new();
    for binding in &config.bindings {
        let factory = binding.factory(&config.scheduler)?;
        graph.mount(binding.name.clone(), factory.create(), &scheduler)?;
    }
    Ok((scheduler, graph))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronised animation scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct PageArgs {
    /// JSON config describing the scheduler and its bindings. Defaults to the
    /// kick/snare/logo demo page.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Overrides the configured tempo.
    #[arg(short, long)]
    tempo: Option<f64>,
}

impl PageArgs {
    fn load(&self) -> beatsync_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::demo(),
        };
        if let Some(tempo) = self.tempo {
            config.scheduler.tempo_bpm = tempo;
            config.validate()?;
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Step logical time deterministically and print one JSON frame per step.
    Simulate {
        #[command(flatten)]
        page: PageArgs,
        /// Number of steps to run.
        #[arg(short, long, default_value_t = 32)]
        steps: u32,
        /// Step length in milliseconds; defaults to the frame interval.
        #[arg(long)]
        step_ms: Option<f64>,
    },
    /// Run against the wall clock and print a frame on every tick.
    Live {
        #[command(flatten)]
        page: PageArgs,
        /// How long to run for.
        #[arg(short, long, default_value_t = 4.0)]
        duration_secs: f64,
    },
}
