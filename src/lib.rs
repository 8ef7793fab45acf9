//! SUMO remote-control probe
//!
//! Launches a traffic simulation, asks it a few diagnostic questions and
//! shuts it down again. The simulator is reached through the
//! [`session::Simulator`] trait, implemented for a real SUMO process by
//! [`traci::TraciSimulator`] and in memory by [`session::fake::FakeSimulator`].

pub mod error;
pub mod probe;
pub mod session;
pub mod settings;
pub mod traci;

pub use error::ConnectionError;
pub use probe::{run, Probe, ProbeOptions};
pub use session::{Query, Response, Session, Simulator};
pub use settings::Settings;
