//! Requests and answers exchanged with a simulator session

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConnectionError;

/// Vehicle variables that can be requested through a context subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Variable {
    Speed,
    Position,
}

impl Variable {
    /// Wire identifier of the variable
    pub fn id(self) -> u8 {
        match self {
            Variable::Speed => 0x40,
            Variable::Position => 0x42,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x40 => Some(Variable::Speed),
            0x42 => Some(Variable::Position),
            _ => None,
        }
    }
}

/// A typed value reported by the simulator
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UByte(u8),
    Integer(i32),
    Double(f64),
    String(String),
    StringList(Vec<String>),
    Position2D { x: f64, y: f64 },
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::UByte(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{:.2}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::StringList(v) => write!(f, "[{}]", v.join(", ")),
            Value::Position2D { x, y } => write!(f, "({:.2}, {:.2})", x, y),
        }
    }
}

/// Context subscription results: vehicle id -> variable -> value
pub type ContextResults = BTreeMap<String, BTreeMap<Variable, Value>>;

/// One request issued against a running simulation
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// All vehicles currently in the network
    VehicleIds,
    /// All junctions in the network
    JunctionIds,
    /// Vehicles that entered the network during the last step
    DepartedVehicleIds,
    /// Length of one simulation step in seconds
    DeltaT,
    /// Position of one vehicle
    VehiclePosition { vehicle: String },
    /// Advance the simulation by one step
    SimulationStep,
    /// Ask for vehicle variables around a junction on every step
    SubscribeJunctionContext {
        junction: String,
        range: f64,
        variables: Vec<Variable>,
    },
    /// Latest results of a junction context subscription
    JunctionContextResults { junction: String },
}

impl Query {
    pub fn subscribe_junction_context(
        junction: impl Into<String>,
        range: f64,
        variables: Vec<Variable>,
    ) -> Self {
        Query::SubscribeJunctionContext {
            junction: junction.into(),
            range,
            variables,
        }
    }
}

/// Answer to a [`Query`]
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ids(Vec<String>),
    Number(f64),
    Position { x: f64, y: f64 },
    Context(ContextResults),
    Done,
}

impl Response {
    pub fn into_ids(self) -> Result<Vec<String>, ConnectionError> {
        match self {
            Response::Ids(ids) => Ok(ids),
            other => Err(unexpected("id list", &other)),
        }
    }

    pub fn into_number(self) -> Result<f64, ConnectionError> {
        match self {
            Response::Number(value) => Ok(value),
            other => Err(unexpected("number", &other)),
        }
    }

    pub fn into_position(self) -> Result<(f64, f64), ConnectionError> {
        match self {
            Response::Position { x, y } => Ok((x, y)),
            other => Err(unexpected("position", &other)),
        }
    }

    pub fn into_context(self) -> Result<ContextResults, ConnectionError> {
        match self {
            Response::Context(results) => Ok(results),
            other => Err(unexpected("context results", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Response) -> ConnectionError {
    ConnectionError::protocol(format!("expected {}, got {:?}", wanted, got))
}
