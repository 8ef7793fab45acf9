//! Simulator backed by a real SUMO process
//!
//! The process is spawned with `--remote-port` and then driven over a TCP
//! socket. Only the handful of commands the probes need are supported.

pub mod codec;
mod connection;

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::ConnectionError;
use crate::session::{ContextResults, Query, Response, Simulator};
use crate::settings::Settings;

pub use connection::TraciConnection;
use connection::{
    CMD_GET_JUNCTION_VARIABLE, CMD_GET_SIM_VARIABLE, CMD_GET_VEHICLE_VARIABLE, ID_LIST,
    VAR_DELTA_T, VAR_DEPARTED_VEHICLES_IDS, VAR_POSITION,
};

/// Pause between connection attempts while the simulator boots
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct TraciSimulator {
    child: Option<Child>,
    connection: Option<TraciConnection<TcpStream>>,
    /// Last context results delivered per junction
    context_cache: HashMap<String, ContextResults>,
}

impl Default for TraciSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TraciSimulator {
    pub fn new() -> Self {
        Self {
            child: None,
            connection: None,
            context_cache: HashMap::new(),
        }
    }

    fn connection(&mut self) -> Result<&mut TraciConnection<TcpStream>, ConnectionError> {
        self.connection.as_mut().ok_or(ConnectionError::Closed)
    }

    /// Keep trying to reach the freshly spawned process
    fn connect(child: &mut Child, port: u16, retries: u32) -> Result<TcpStream, ConnectionError> {
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            if let Some(status) = child.try_wait()? {
                return Err(ConnectionError::Launch(format!(
                    "simulator exited early with {}",
                    status
                )));
            }
            match TcpStream::connect(("localhost", port)) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect attempt {} to port {} failed: {}", attempt, port, e);
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
        Err(ConnectionError::Handshake(format!(
            "could not connect to port {} after {} attempt(s)",
            port, attempts
        )))
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("Failed to kill simulator: {}", e);
            }
            let _ = child.wait();
        }
    }
}

/// Ask the OS for a port nobody is listening on
fn free_port() -> Result<u16, ConnectionError> {
    let listener = TcpListener::bind(("localhost", 0))?;
    Ok(listener.local_addr()?.port())
}

impl Simulator for TraciSimulator {
    fn start(&mut self, settings: &Settings) -> Result<(), ConnectionError> {
        if self.connection.is_some() {
            return Err(ConnectionError::Launch(
                "simulator already running".to_string(),
            ));
        }
        if !settings.sumo_config.is_file() {
            return Err(ConnectionError::Launch(format!(
                "scenario config {} does not exist",
                settings.sumo_config.display()
            )));
        }

        let port = match settings.remote_port {
            Some(port) => port,
            None => free_port()?,
        };
        let args = settings.launch_args(port);
        info!("Launching {}", args.join(" "));

        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| ConnectionError::Launch(format!("{}: {}", args[0], e)))?;

        let stream = match Self::connect(&mut child, port, settings.connect_retries) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        self.child = Some(child);

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not disable Nagle on simulator socket: {}", e);
        }
        let mut connection = TraciConnection::new(stream);
        match connection.get_version() {
            Ok((api_version, sumo_version)) => {
                info!("Connected to {} (API {})", sumo_version, api_version);
            }
            Err(e) => {
                self.kill_child();
                return Err(ConnectionError::Handshake(e.to_string()));
            }
        }
        self.connection = Some(connection);
        Ok(())
    }

    fn query(&mut self, query: &Query) -> Result<Response, ConnectionError> {
        match query {
            Query::VehicleIds => self
                .connection()?
                .get_string_list(CMD_GET_VEHICLE_VARIABLE, ID_LIST, "")
                .map(Response::Ids),
            Query::JunctionIds => self
                .connection()?
                .get_string_list(CMD_GET_JUNCTION_VARIABLE, ID_LIST, "")
                .map(Response::Ids),
            Query::DepartedVehicleIds => self
                .connection()?
                .get_string_list(CMD_GET_SIM_VARIABLE, VAR_DEPARTED_VEHICLES_IDS, "")
                .map(Response::Ids),
            Query::DeltaT => self
                .connection()?
                .get_double(CMD_GET_SIM_VARIABLE, VAR_DELTA_T, "")
                .map(Response::Number),
            Query::VehiclePosition { vehicle } => self
                .connection()?
                .get_position(CMD_GET_VEHICLE_VARIABLE, VAR_POSITION, vehicle)
                .map(|(x, y)| Response::Position { x, y }),
            Query::SimulationStep => {
                let delivered = self.connection()?.simulation_step()?;
                self.context_cache.clear();
                for (junction, results) in delivered {
                    self.context_cache.insert(junction, results);
                }
                Ok(Response::Done)
            }
            Query::SubscribeJunctionContext {
                junction,
                range,
                variables,
            } => {
                let results = self
                    .connection()?
                    .subscribe_junction_context(junction, *range, variables)?;
                self.context_cache.insert(junction.clone(), results.clone());
                Ok(Response::Context(results))
            }
            Query::JunctionContextResults { junction } => {
                self.connection()?;
                Ok(Response::Context(
                    self.context_cache.get(junction).cloned().unwrap_or_default(),
                ))
            }
        }
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        let mut connection = self.connection.take().ok_or(ConnectionError::Closed)?;
        let result = connection.close();
        drop(connection);
        self.context_cache.clear();

        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            debug!("Simulator exited with {}", status);
        }
        result
    }
}

impl Drop for TraciSimulator {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!("Simulator dropped without close, killing process");
            self.kill_child();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::codec::{self, Decoder, Encoder, RTYPE_OK, TYPE_STRINGLIST};
    use super::connection::{
        CMD_CLOSE, CMD_GETVERSION, CMD_GET_VEHICLE_VARIABLE, CMD_SIMSTEP,
        CMD_SUBSCRIBE_JUNCTION_CONTEXT, ID_LIST, RESPONSE_OFFSET,
    };
    use super::*;
    use crate::session::{Value, Variable};
    use std::io::{Read, Write};
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard};
    use std::thread::JoinHandle;

    /// Tests that spawn processes run one at a time so a fork never
    /// inherits a launcher script that is still open for writing.
    static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    fn spawn_lock() -> MutexGuard<'static, ()> {
        SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Shell script standing in for the simulator. It is passed as the
    /// scenario config, so with `sh` as the binary the launch command
    /// `sh -c <script> --remote-port <port>` runs it.
    #[cfg(unix)]
    fn launcher_settings(name: &str, body: &str, port: u16, retries: u32) -> Settings {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!(
            "traci_probe_{}_{}.sh",
            name,
            std::process::id()
        ));
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        Settings {
            sumo_binary: "sh".to_string(),
            sumo_config: path,
            remote_port: Some(port),
            connect_retries: retries,
            ..Settings::default()
        }
    }

    fn ok_status(command: u8) -> Vec<u8> {
        let mut payload = Encoder::new();
        payload.u8(RTYPE_OK).string("");
        codec::command(command, &payload.into_bytes())
    }

    fn reply_to(command: u8) -> Vec<u8> {
        match command {
            CMD_GETVERSION => {
                let mut payload = Encoder::new();
                payload.i32(21).string("SUMO test");
                codec::message(&[
                    ok_status(CMD_GETVERSION),
                    codec::command(CMD_GETVERSION, &payload.into_bytes()),
                ])
            }
            CMD_GET_VEHICLE_VARIABLE => {
                let mut payload = Encoder::new();
                payload.u8(ID_LIST).string("").u8(TYPE_STRINGLIST).i32(0);
                codec::message(&[
                    ok_status(CMD_GET_VEHICLE_VARIABLE),
                    codec::command(
                        CMD_GET_VEHICLE_VARIABLE + RESPONSE_OFFSET,
                        &payload.into_bytes(),
                    ),
                ])
            }
            CMD_SUBSCRIBE_JUNCTION_CONTEXT => {
                let mut payload = Encoder::new();
                payload
                    .string("j0")
                    .u8(CMD_GET_VEHICLE_VARIABLE)
                    .u8(1)
                    .i32(1)
                    .string("veh0")
                    .u8(Variable::Speed.id())
                    .u8(RTYPE_OK)
                    .typed_double(7.5);
                codec::message(&[
                    ok_status(CMD_SUBSCRIBE_JUNCTION_CONTEXT),
                    codec::command(
                        CMD_SUBSCRIBE_JUNCTION_CONTEXT + RESPONSE_OFFSET,
                        &payload.into_bytes(),
                    ),
                ])
            }
            // No subscription responses in this step
            CMD_SIMSTEP => codec::message(&[ok_status(CMD_SIMSTEP), 0i32.to_be_bytes().to_vec()]),
            other => codec::message(&[ok_status(other)]),
        }
    }

    /// Accept one client and answer until it sends close; returns the
    /// command ids it received
    fn serve(listener: TcpListener) -> JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            loop {
                let mut header = [0u8; 4];
                if stream.read_exact(&mut header).is_err() {
                    break;
                }
                let mut body = vec![0u8; u32::from_be_bytes(header) as usize - 4];
                stream.read_exact(&mut body).unwrap();
                let (command, _) = Decoder::new(&body).command().unwrap();
                seen.push(command);
                stream.write_all(&reply_to(command)).unwrap();
                if command == CMD_CLOSE {
                    break;
                }
            }
            seen
        })
    }

    fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_missing_scenario_is_rejected_before_launch() {
        let mut sim = TraciSimulator::new();
        let settings = Settings {
            sumo_config: PathBuf::from("missing.cfg"),
            ..Settings::default()
        };
        assert!(matches!(sim.start(&settings), Err(ConnectionError::Launch(_))));
        assert!(sim.child.is_none());
    }

    #[test]
    fn test_unknown_binary_is_launch_error() {
        let _guard = spawn_lock();
        let mut sim = TraciSimulator::new();
        let settings = Settings {
            sumo_binary: "definitely-not-a-simulator-binary".to_string(),
            sumo_config: PathBuf::from("Cargo.toml"),
            connect_retries: 1,
            ..Settings::default()
        };
        assert!(matches!(sim.start(&settings), Err(ConnectionError::Launch(_))));
    }

    #[test]
    fn test_query_without_start_is_closed() {
        let mut sim = TraciSimulator::new();
        assert!(matches!(
            sim.query(&Query::VehicleIds),
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(sim.close(), Err(ConnectionError::Closed)));
    }

    #[test]
    fn test_free_port_is_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_handshake_list_and_close_over_socket() {
        let _guard = spawn_lock();
        let (listener, port) = local_listener();
        let server = serve(listener);
        let settings = launcher_settings("session", "sleep 1", port, 5);

        let mut sim = TraciSimulator::new();
        sim.start(&settings).unwrap();
        let ids = sim.query(&Query::VehicleIds).unwrap().into_ids().unwrap();
        assert!(ids.is_empty());

        sim.close().unwrap();
        assert!(sim.child.is_none());
        assert!(matches!(sim.close(), Err(ConnectionError::Closed)));

        let seen = server.join().unwrap();
        assert_eq!(seen, vec![CMD_GETVERSION, CMD_GET_VEHICLE_VARIABLE, CMD_CLOSE]);
        let _ = std::fs::remove_file(&settings.sumo_config);
    }

    #[cfg(unix)]
    #[test]
    fn test_step_drops_context_results_not_redelivered() {
        let _guard = spawn_lock();
        let (listener, port) = local_listener();
        let server = serve(listener);
        let settings = launcher_settings("context", "sleep 1", port, 5);
        let results_for_j0 = Query::JunctionContextResults {
            junction: "j0".to_string(),
        };

        let mut sim = TraciSimulator::new();
        sim.start(&settings).unwrap();

        let initial = sim
            .query(&Query::subscribe_junction_context("j0", 42.0, vec![Variable::Speed]))
            .unwrap()
            .into_context()
            .unwrap();
        assert_eq!(initial["veh0"][&Variable::Speed], Value::Double(7.5));
        let cached = sim.query(&results_for_j0).unwrap().into_context().unwrap();
        assert_eq!(cached, initial);

        sim.query(&Query::SimulationStep).unwrap();
        let after_step = sim.query(&results_for_j0).unwrap().into_context().unwrap();
        assert!(after_step.is_empty());

        sim.close().unwrap();
        let seen = server.join().unwrap();
        assert_eq!(
            seen,
            vec![CMD_GETVERSION, CMD_SUBSCRIBE_JUNCTION_CONTEXT, CMD_SIMSTEP, CMD_CLOSE]
        );
        let _ = std::fs::remove_file(&settings.sumo_config);
    }

    #[cfg(unix)]
    #[test]
    fn test_simulator_exiting_before_connect_is_launch_error() {
        let _guard = spawn_lock();
        let port = free_port().unwrap();
        let settings = launcher_settings("early_exit", "exit 3", port, 5);

        let mut sim = TraciSimulator::new();
        match sim.start(&settings) {
            Err(ConnectionError::Launch(message)) => {
                assert!(message.contains("exited early"), "message: {}", message)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(sim.child.is_none());
        let _ = std::fs::remove_file(&settings.sumo_config);
    }

    #[cfg(unix)]
    #[test]
    fn test_no_listener_is_handshake_error_with_attempt_count() {
        let _guard = spawn_lock();
        let port = free_port().unwrap();
        let settings = launcher_settings("no_listener", "sleep 5", port, 0);

        let mut sim = TraciSimulator::new();
        match sim.start(&settings) {
            Err(ConnectionError::Handshake(message)) => {
                assert!(message.contains("after 1 attempt(s)"), "message: {}", message)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(sim.child.is_none());
        let _ = std::fs::remove_file(&settings.sumo_config);
    }
}
