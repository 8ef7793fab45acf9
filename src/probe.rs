//! Diagnostic routines run against a live simulation
//!
//! Each probe writes its findings to the given writer and leaves the
//! session open; [`run`] takes care of starting and closing it.

use std::collections::BTreeSet;
use std::io::Write;

use anyhow::{Context, Result};
use clap::ValueEnum;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;

use crate::session::{Query, Session, Simulator, Variable};
use crate::settings::Settings;

/// Radius around a junction in which vehicles are reported
pub const CONTEXT_RANGE: f64 = 42.0;

/// Steps taken by the stepping probes when not told otherwise
pub const DEFAULT_STEPS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Probe {
    /// Print the identifiers of all active vehicles
    #[default]
    VehicleIds,
    /// Watch random junctions until a vehicle comes near one
    JunctionContext,
    /// Follow vehicles as they depart
    Departures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Upper bound on simulation steps for stepping probes
    pub steps: u32,
    /// Seed for junction selection; random when unset
    pub seed: Option<u64>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            seed: None,
        }
    }
}

/// Start the simulator, run one probe and close the session.
///
/// The session is closed even when the probe fails; the probe's error wins.
pub fn run<S: Simulator>(
    simulator: S,
    settings: &Settings,
    probe: Probe,
    options: &ProbeOptions,
    out: &mut impl Write,
) -> Result<()> {
    let mut session = Session::start(simulator, settings).with_context(|| {
        format!(
            "Failed to start simulation {}",
            settings.sumo_config.display()
        )
    })?;

    info!("Running {:?} probe", probe);
    let outcome = match probe {
        Probe::VehicleIds => vehicle_ids(&mut session, out),
        Probe::JunctionContext => junction_context(&mut session, options, out),
        Probe::Departures => departures(&mut session, options.steps, out),
    };
    let closed = session.close().context("Failed to close simulation");

    outcome?;
    closed
}

/// List the vehicles currently in the network
pub fn vehicle_ids<S: Simulator>(session: &mut Session<S>, out: &mut impl Write) -> Result<()> {
    let ids = session.query(&Query::VehicleIds)?.into_ids()?;
    writeln!(out, "vehicle count: {}", ids.len())?;
    if !ids.is_empty() {
        writeln!(out, "vehicles: {}", ids.join(", "))?;
    }
    Ok(())
}

/// Picks junctions, from a seeded generator when asked for reproducibility
struct JunctionPicker {
    junctions: Vec<String>,
    rng: Option<StdRng>,
}

impl JunctionPicker {
    fn new(junctions: Vec<String>, seed: Option<u64>) -> Self {
        Self {
            junctions,
            rng: seed.map(StdRng::seed_from_u64),
        }
    }

    fn pick(&mut self) -> Option<String> {
        let choice = match &mut self.rng {
            Some(rng) => self.junctions.choose(rng),
            None => self.junctions.choose(&mut rand::rng()),
        };
        choice.cloned()
    }
}

/// Subscribe to vehicle speeds around a random junction and step until a
/// vehicle shows up, moving to another random junction after every empty
/// step.
pub fn junction_context<S: Simulator>(
    session: &mut Session<S>,
    options: &ProbeOptions,
    out: &mut impl Write,
) -> Result<()> {
    let junctions = session.query(&Query::JunctionIds)?.into_ids()?;
    let mut picker = JunctionPicker::new(junctions, options.seed);
    let Some(mut junction) = picker.pick() else {
        anyhow::bail!("Network has no junctions to watch");
    };

    let step_length = session.query(&Query::DeltaT)?.into_number()?;
    writeln!(out, "step length: {:.2}s", step_length)?;

    let mut subscribed = BTreeSet::new();
    for step in 1..=options.steps {
        if subscribed.insert(junction.clone()) {
            session.query(&Query::subscribe_junction_context(
                junction.as_str(),
                CONTEXT_RANGE,
                vec![Variable::Speed],
            ))?;
        }

        session.query(&Query::SimulationStep)?;
        let results = session
            .query(&Query::JunctionContextResults {
                junction: junction.clone(),
            })?
            .into_context()?;

        if !results.is_empty() {
            writeln!(out, "junction {} after {} steps:", junction, step)?;
            for (vehicle, values) in &results {
                match values.get(&Variable::Speed) {
                    Some(speed) => writeln!(out, "  {} speed {}", vehicle, speed)?,
                    None => writeln!(out, "  {} speed unavailable", vehicle)?,
                }
            }
            return Ok(());
        }

        if let Some(next) = picker.pick() {
            junction = next;
        }
        debug!("Step {}: nothing yet, trying junction {}", step, junction);
        writeln!(out, "testing junction {}", junction)?;
    }

    writeln!(
        out,
        "no vehicles near any junction after {} steps",
        options.steps
    )?;
    Ok(())
}

/// Step the simulation and report where departed vehicles are
pub fn departures<S: Simulator>(
    session: &mut Session<S>,
    steps: u32,
    out: &mut impl Write,
) -> Result<()> {
    let mut tracked = BTreeSet::new();

    for step in 1..=steps {
        session.query(&Query::SimulationStep)?;
        let departed = session.query(&Query::DepartedVehicleIds)?.into_ids()?;
        tracked.extend(departed);

        let active: BTreeSet<String> = session
            .query(&Query::VehicleIds)?
            .into_ids()?
            .into_iter()
            .collect();
        tracked.retain(|id| active.contains(id));

        if tracked.is_empty() {
            continue;
        }
        writeln!(out, "step {}:", step)?;
        for vehicle in &tracked {
            let (x, y) = session
                .query(&Query::VehiclePosition {
                    vehicle: vehicle.clone(),
                })?
                .into_position()?;
            writeln!(out, "  {} at ({:.2}, {:.2})", vehicle, x, y)?;
        }
    }
    Ok(())
}
