//! Simulator sessions
//!
//! A [`Session`] owns one connection to a simulator for its whole life:
//! it is opened by [`Session::start`], used through [`Session::query`] and
//! released by [`Session::close`]. The actual simulator sits behind the
//! [`Simulator`] trait so the diagnostic code runs the same against a real
//! process or the in-memory [`fake::FakeSimulator`].

pub mod fake;
mod types;

use log::{debug, info};

use crate::error::ConnectionError;
use crate::settings::Settings;

pub use types::{ContextResults, Query, Response, Value, Variable};

/// Minimal capability interface of a remote-controlled simulator
pub trait Simulator {
    /// Launch the simulation described by `settings` and connect to it
    fn start(&mut self, settings: &Settings) -> Result<(), ConnectionError>;

    /// Issue one blocking request
    fn query(&mut self, query: &Query) -> Result<Response, ConnectionError>;

    /// Tear the connection down
    fn close(&mut self) -> Result<(), ConnectionError>;
}

/// An open connection to a simulator
pub struct Session<S: Simulator> {
    simulator: S,
    open: bool,
}

impl<S: Simulator> Session<S> {
    /// Start the simulator and wrap the live connection
    pub fn start(mut simulator: S, settings: &Settings) -> Result<Self, ConnectionError> {
        info!(
            "Starting simulator {} with {}",
            settings.sumo_binary,
            settings.sumo_config.display()
        );
        simulator.start(settings)?;
        info!("Simulator connected");
        Ok(Self {
            simulator,
            open: true,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn query(&mut self, query: &Query) -> Result<Response, ConnectionError> {
        if !self.open {
            return Err(ConnectionError::Closed);
        }
        debug!("Query {:?}", query);
        self.simulator.query(query)
    }

    /// Close the connection. Only the first call succeeds.
    pub fn close(&mut self) -> Result<(), ConnectionError> {
        if !self.open {
            return Err(ConnectionError::Closed);
        }
        self.open = false;
        self.simulator.close()?;
        info!("Simulator connection closed");
        Ok(())
    }

    /// Access the wrapped simulator
    pub fn simulator(&self) -> &S {
        &self.simulator
    }
}
