use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use traci_probe::probe::{self, Probe, ProbeOptions};
use traci_probe::settings::Settings;
use traci_probe::traci::TraciSimulator;

#[derive(Parser)]
#[command(name = "traci_probe")]
#[command(about = "Start a SUMO simulation, run a diagnostic query and close it")]
struct Cli {
    /// Settings file (defaults to ./settings.toml when present)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Scenario config, overriding the settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulator binary, overriding the settings file
    #[arg(long)]
    sumo_binary: Option<String>,

    /// Which diagnostic to run
    #[arg(long, value_enum, default_value_t = Probe::VehicleIds)]
    probe: Probe,

    /// Maximum simulation steps for stepping probes
    #[arg(long, default_value_t = probe::DEFAULT_STEPS)]
    steps: u32,

    /// Seed for junction selection
    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::resolve(self.settings.as_deref())?;
        if let Some(config) = &self.config {
            settings.sumo_config = config.clone();
        }
        if let Some(binary) = &self.sumo_binary {
            settings.sumo_binary = binary.clone();
        }
        Ok(settings)
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn,traci_probe=info"),
    )
    .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let settings = cli.settings()?;
    let options = ProbeOptions {
        steps: cli.steps,
        seed: cli.seed,
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    probe::run(TraciSimulator::new(), &settings, cli.probe, &options, &mut out)
}
