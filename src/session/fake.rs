//! In-memory simulator
//!
//! Behaves like a tiny remote-controlled simulation: it knows which
//! scenarios exist, holds a set of junctions and departs vehicles on a
//! fixed schedule as steps are taken. Vehicles never move once they have
//! departed, which keeps context subscription results predictable.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::debug;

use super::types::{ContextResults, Query, Response, Value, Variable};
use super::Simulator;
use crate::error::ConnectionError;
use crate::settings::Settings;

const CMD_GET_VEHICLE_VARIABLE: u8 = 0xa4;
const CMD_SUBSCRIBE_JUNCTION_CONTEXT: u8 = 0x89;

/// A vehicle that enters the fake network at some step
#[derive(Debug, Clone, PartialEq)]
pub struct FakeVehicle {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub speed: f64,
}

impl FakeVehicle {
    pub fn new(id: impl Into<String>, x: f64, y: f64, speed: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            speed,
        }
    }

    fn distance_to(&self, x: f64, y: f64) -> f64 {
        let dx = self.x - x;
        let dy = self.y - y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone)]
struct ContextSubscription {
    range: f64,
    variables: Vec<Variable>,
}

#[derive(Debug, Clone)]
pub struct FakeSimulator {
    scenarios: Vec<PathBuf>,
    junctions: BTreeMap<String, (f64, f64)>,
    schedule: BTreeMap<u32, Vec<FakeVehicle>>,
    delta_t: f64,

    running: bool,
    step: u32,
    vehicles: BTreeMap<String, FakeVehicle>,
    departed: Vec<String>,
    subscriptions: BTreeMap<String, ContextSubscription>,
    context_results: BTreeMap<String, ContextResults>,
    queries_seen: usize,
}

impl Default for FakeSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSimulator {
    /// A fake that accepts only `scenario.cfg` and has an empty network
    pub fn new() -> Self {
        Self {
            scenarios: vec![PathBuf::from("scenario.cfg")],
            junctions: BTreeMap::new(),
            schedule: BTreeMap::new(),
            delta_t: 1.0,
            running: false,
            step: 0,
            vehicles: BTreeMap::new(),
            departed: Vec::new(),
            subscriptions: BTreeMap::new(),
            context_results: BTreeMap::new(),
            queries_seen: 0,
        }
    }

    /// Accept an additional scenario path
    pub fn with_scenario(mut self, path: impl Into<PathBuf>) -> Self {
        self.scenarios.push(path.into());
        self
    }

    pub fn with_junction(mut self, id: impl Into<String>, x: f64, y: f64) -> Self {
        self.junctions.insert(id.into(), (x, y));
        self
    }

    pub fn with_delta_t(mut self, delta_t: f64) -> Self {
        self.delta_t = delta_t;
        self
    }

    /// Schedule `vehicle` to depart during step number `step` (1-based)
    pub fn depart_at(mut self, step: u32, vehicle: FakeVehicle) -> Self {
        self.schedule.entry(step).or_default().push(vehicle);
        self
    }

    /// Number of queries that reached the simulator
    pub fn queries_seen(&self) -> usize {
        self.queries_seen
    }

    /// Number of steps taken so far
    pub fn current_step(&self) -> u32 {
        self.step
    }

    fn advance(&mut self) {
        self.step += 1;
        self.departed.clear();
        if let Some(vehicles) = self.schedule.remove(&self.step) {
            for vehicle in vehicles {
                self.departed.push(vehicle.id.clone());
                self.vehicles.insert(vehicle.id.clone(), vehicle);
            }
        }
        let junctions: Vec<String> = self.subscriptions.keys().cloned().collect();
        for junction in junctions {
            self.refresh_context(&junction);
        }
        debug!(
            "Fake step {}: {} vehicles, {} departed",
            self.step,
            self.vehicles.len(),
            self.departed.len()
        );
    }

    fn refresh_context(&mut self, junction: &str) {
        let (Some(subscription), Some(&(jx, jy))) =
            (self.subscriptions.get(junction), self.junctions.get(junction))
        else {
            return;
        };

        let mut results = ContextResults::new();
        for vehicle in self.vehicles.values() {
            if vehicle.distance_to(jx, jy) > subscription.range {
                continue;
            }
            let values = subscription
                .variables
                .iter()
                .map(|variable| {
                    let value = match variable {
                        Variable::Speed => Value::Double(vehicle.speed),
                        Variable::Position => Value::Position2D {
                            x: vehicle.x,
                            y: vehicle.y,
                        },
                    };
                    (*variable, value)
                })
                .collect();
            results.insert(vehicle.id.clone(), values);
        }
        self.context_results.insert(junction.to_string(), results);
    }
}

impl Simulator for FakeSimulator {
    fn start(&mut self, settings: &Settings) -> Result<(), ConnectionError> {
        if self.running {
            return Err(ConnectionError::Launch(
                "simulation already running".to_string(),
            ));
        }
        if !self.scenarios.contains(&settings.sumo_config) {
            return Err(ConnectionError::Launch(format!(
                "scenario {} not found",
                settings.sumo_config.display()
            )));
        }
        self.running = true;
        Ok(())
    }

    fn query(&mut self, query: &Query) -> Result<Response, ConnectionError> {
        if !self.running {
            return Err(ConnectionError::Closed);
        }
        self.queries_seen += 1;

        match query {
            Query::VehicleIds => Ok(Response::Ids(self.vehicles.keys().cloned().collect())),
            Query::JunctionIds => Ok(Response::Ids(self.junctions.keys().cloned().collect())),
            Query::DepartedVehicleIds => Ok(Response::Ids(self.departed.clone())),
            Query::DeltaT => Ok(Response::Number(self.delta_t)),
            Query::VehiclePosition { vehicle } => self
                .vehicles
                .get(vehicle)
                .map(|v| Response::Position { x: v.x, y: v.y })
                .ok_or_else(|| ConnectionError::Command {
                    command: CMD_GET_VEHICLE_VARIABLE,
                    message: format!("Vehicle '{}' is not known", vehicle),
                }),
            Query::SimulationStep => {
                self.advance();
                Ok(Response::Done)
            }
            Query::SubscribeJunctionContext {
                junction,
                range,
                variables,
            } => {
                if !self.junctions.contains_key(junction) {
                    return Err(ConnectionError::Command {
                        command: CMD_SUBSCRIBE_JUNCTION_CONTEXT,
                        message: format!("Junction '{}' is not known", junction),
                    });
                }
                self.subscriptions.insert(
                    junction.clone(),
                    ContextSubscription {
                        range: *range,
                        variables: variables.clone(),
                    },
                );
                self.refresh_context(junction);
                Ok(Response::Context(
                    self.context_results.get(junction).cloned().unwrap_or_default(),
                ))
            }
            Query::JunctionContextResults { junction } => Ok(Response::Context(
                self.context_results.get(junction).cloned().unwrap_or_default(),
            )),
        }
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        if !self.running {
            return Err(ConnectionError::Closed);
        }
        self.running = false;
        Ok(())
    }
}
