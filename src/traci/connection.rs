//! Request/response exchange over an established remote-control socket

use std::collections::BTreeMap;
use std::io::{Read, Write};

use log::{debug, trace};

use super::codec::{self, Decoder, Encoder, TYPE_DOUBLE, TYPE_POSITION_2D, TYPE_STRINGLIST};
use crate::error::ConnectionError;
use crate::session::{ContextResults, Variable};

pub const CMD_GETVERSION: u8 = 0x00;
pub const CMD_SIMSTEP: u8 = 0x02;
pub const CMD_CLOSE: u8 = 0x7f;

pub const CMD_GET_VEHICLE_VARIABLE: u8 = 0xa4;
pub const CMD_GET_JUNCTION_VARIABLE: u8 = 0xa9;
pub const CMD_GET_SIM_VARIABLE: u8 = 0xab;
pub const CMD_SUBSCRIBE_JUNCTION_CONTEXT: u8 = 0x89;

/// Responses to getters and subscriptions use the command id plus this offset
pub(super) const RESPONSE_OFFSET: u8 = 0x10;

pub const ID_LIST: u8 = 0x00;
pub const VAR_POSITION: u8 = 0x42;
pub const VAR_DEPARTED_VEHICLES_IDS: u8 = 0x74;
pub const VAR_DELTA_T: u8 = 0x7b;

/// Subscription window covering the whole simulation
const SUBSCRIBE_BEGIN: f64 = 0.0;
const SUBSCRIBE_END: f64 = 1.0e15;

/// One blocking request/response channel to the simulator
pub struct TraciConnection<S> {
    stream: S,
}

impl<S: Read + Write> TraciConnection<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Send one command and return the raw response body
    fn exchange(&mut self, command: Vec<u8>) -> Result<Vec<u8>, ConnectionError> {
        let msg = codec::message(&[command]);
        trace!("Sending {} bytes", msg.len());
        self.stream.write_all(&msg)?;
        self.stream.flush()?;

        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header)?;
        let total = u32::from_be_bytes(header) as usize;
        let body_len = total
            .checked_sub(4)
            .ok_or_else(|| ConnectionError::protocol(format!("message length {} too short", total)))?;
        let mut body = vec![0u8; body_len];
        self.stream.read_exact(&mut body)?;
        trace!("Received {} bytes", total);
        Ok(body)
    }

    /// Exchange the protocol version; returns the API level and simulator version
    pub fn get_version(&mut self) -> Result<(i32, String), ConnectionError> {
        let body = self.exchange(codec::command(CMD_GETVERSION, &[]))?;
        let mut decoder = Decoder::new(&body);
        decoder.status()?.check(CMD_GETVERSION)?;

        let (id, mut payload) = decoder.command()?;
        if id != CMD_GETVERSION {
            return Err(ConnectionError::protocol(format!(
                "unexpected version response 0x{:02x}",
                id
            )));
        }
        let api_version = payload.i32()?;
        let sumo_version = payload.string()?;
        Ok((api_version, sumo_version))
    }

    /// Issue a getter and return the raw bytes of its value
    fn get_variable(
        &mut self,
        domain: u8,
        variable: u8,
        object_id: &str,
        value_type: u8,
    ) -> Result<Vec<u8>, ConnectionError> {
        let mut payload = Encoder::new();
        payload.u8(variable).string(object_id);
        let body = self.exchange(codec::command(domain, &payload.into_bytes()))?;

        let mut decoder = Decoder::new(&body);
        decoder.status()?.check(domain)?;
        let (response_id, mut response) = decoder.command()?;
        if response_id != domain + RESPONSE_OFFSET {
            return Err(ConnectionError::protocol(format!(
                "response 0x{:02x} to getter 0x{:02x}",
                response_id, domain
            )));
        }
        let returned_variable = response.u8()?;
        let returned_id = response.string()?;
        if returned_variable != variable || returned_id != object_id {
            return Err(ConnectionError::protocol(format!(
                "answer for 0x{:02x} '{}' while asking 0x{:02x} '{}'",
                returned_variable, returned_id, variable, object_id
            )));
        }
        response.expect_type(value_type)?;
        Ok(response.rest().to_vec())
    }

    pub fn get_string_list(
        &mut self,
        domain: u8,
        variable: u8,
        object_id: &str,
    ) -> Result<Vec<String>, ConnectionError> {
        let raw = self.get_variable(domain, variable, object_id, TYPE_STRINGLIST)?;
        Decoder::new(&raw).string_list()
    }

    pub fn get_double(
        &mut self,
        domain: u8,
        variable: u8,
        object_id: &str,
    ) -> Result<f64, ConnectionError> {
        let raw = self.get_variable(domain, variable, object_id, TYPE_DOUBLE)?;
        Decoder::new(&raw).f64()
    }

    pub fn get_position(
        &mut self,
        domain: u8,
        variable: u8,
        object_id: &str,
    ) -> Result<(f64, f64), ConnectionError> {
        let raw = self.get_variable(domain, variable, object_id, TYPE_POSITION_2D)?;
        let mut decoder = Decoder::new(&raw);
        Ok((decoder.f64()?, decoder.f64()?))
    }

    /// Subscribe to vehicle variables within `range` of a junction
    pub fn subscribe_junction_context(
        &mut self,
        junction: &str,
        range: f64,
        variables: &[Variable],
    ) -> Result<ContextResults, ConnectionError> {
        let variable_count = u8::try_from(variables.len()).map_err(|_| {
            ConnectionError::protocol(format!(
                "cannot subscribe to {} variables at once",
                variables.len()
            ))
        })?;

        let mut payload = Encoder::new();
        payload
            .f64(SUBSCRIBE_BEGIN)
            .f64(SUBSCRIBE_END)
            .string(junction)
            .u8(CMD_GET_VEHICLE_VARIABLE)
            .f64(range)
            .u8(variable_count);
        for variable in variables {
            payload.u8(variable.id());
        }

        let body = self.exchange(codec::command(
            CMD_SUBSCRIBE_JUNCTION_CONTEXT,
            &payload.into_bytes(),
        ))?;
        let mut decoder = Decoder::new(&body);
        decoder.status()?.check(CMD_SUBSCRIBE_JUNCTION_CONTEXT)?;

        let (response_id, mut response) = decoder.command()?;
        if response_id != CMD_SUBSCRIBE_JUNCTION_CONTEXT + RESPONSE_OFFSET {
            return Err(ConnectionError::protocol(format!(
                "unexpected subscription response 0x{:02x}",
                response_id
            )));
        }
        let (_, results) = read_context_response(&mut response)?;
        Ok(results)
    }

    /// Advance one step; returns the junction context results it delivered
    pub fn simulation_step(&mut self) -> Result<Vec<(String, ContextResults)>, ConnectionError> {
        let mut payload = Encoder::new();
        payload.f64(0.0);
        let body = self.exchange(codec::command(CMD_SIMSTEP, &payload.into_bytes()))?;

        let mut decoder = Decoder::new(&body);
        decoder.status()?.check(CMD_SIMSTEP)?;

        let count = decoder.i32()?;
        let mut delivered = Vec::new();
        for _ in 0..count {
            let (response_id, mut response) = decoder.command()?;
            if response_id == CMD_SUBSCRIBE_JUNCTION_CONTEXT + RESPONSE_OFFSET {
                delivered.push(read_context_response(&mut response)?);
            } else {
                debug!("Ignoring subscription response 0x{:02x}", response_id);
            }
        }
        Ok(delivered)
    }

    pub fn close(&mut self) -> Result<(), ConnectionError> {
        let body = self.exchange(codec::command(CMD_CLOSE, &[]))?;
        Decoder::new(&body).status()?.check(CMD_CLOSE)
    }
}

/// Decode the body of a context subscription response
fn read_context_response(
    response: &mut Decoder<'_>,
) -> Result<(String, ContextResults), ConnectionError> {
    let reference = response.string()?;
    let _domain = response.u8()?;
    let variable_count = response.u8()?;
    let object_count = response.i32()?;

    let mut results = ContextResults::new();
    for _ in 0..object_count {
        let object_id = response.string()?;
        let mut values = BTreeMap::new();
        for _ in 0..variable_count {
            let variable_id = response.u8()?;
            let status = response.u8()?;
            let value = response.typed_value()?;
            if status != codec::RTYPE_OK {
                debug!(
                    "Variable 0x{:02x} of {} failed: {}",
                    variable_id, object_id, value
                );
                continue;
            }
            match Variable::from_id(variable_id) {
                Some(variable) => {
                    values.insert(variable, value);
                }
                None => debug!("Skipping unknown variable 0x{:02x}", variable_id),
            }
        }
        results.insert(object_id, values);
    }
    Ok((reference, results))
}
