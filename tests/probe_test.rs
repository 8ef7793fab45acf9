//! End-to-end probe runs against the in-memory simulator

use traci_probe::probe::{self, Probe, ProbeOptions};
use traci_probe::session::fake::{FakeSimulator, FakeVehicle};
use traci_probe::session::{Query, Session};
use traci_probe::{ConnectionError, Settings};

fn settings_for(config: &str) -> Settings {
    Settings {
        sumo_config: config.into(),
        ..Settings::default()
    }
}

fn run_probe(fake: FakeSimulator, config: &str, probe: Probe, options: ProbeOptions) -> anyhow::Result<String> {
    let mut out = Vec::new();
    probe::run(fake, &settings_for(config), probe, &options, &mut out)?;
    Ok(String::from_utf8(out).expect("probe output is utf-8"))
}

#[test]
fn test_valid_scenario_lists_no_vehicles() {
    let output = run_probe(
        FakeSimulator::new(),
        "scenario.cfg",
        Probe::VehicleIds,
        ProbeOptions::default(),
    )
    .unwrap();
    assert_eq!(output, "vehicle count: 0\n");
}

#[test]
fn test_missing_scenario_fails_before_any_query() {
    let err = run_probe(
        FakeSimulator::new(),
        "missing.cfg",
        Probe::VehicleIds,
        ProbeOptions::default(),
    )
    .unwrap_err();

    let cause = err
        .downcast_ref::<ConnectionError>()
        .expect("start failure keeps its ConnectionError");
    assert!(matches!(cause, ConnectionError::Launch(_)));
    assert!(format!("{:#}", err).contains("missing.cfg"));
}

#[test]
fn test_session_lifecycle() {
    let mut session = Session::start(FakeSimulator::new(), &settings_for("scenario.cfg")).unwrap();

    let ids = session.query(&Query::VehicleIds).unwrap().into_ids().unwrap();
    assert!(ids.is_empty());

    session.close().unwrap();
    assert!(matches!(session.close(), Err(ConnectionError::Closed)));
}

#[test]
fn test_vehicle_ids_after_departures() {
    let fake = FakeSimulator::new()
        .depart_at(1, FakeVehicle::new("veh0", 0.0, 0.0, 5.0))
        .depart_at(1, FakeVehicle::new("veh1", 3.0, 0.0, 5.0));
    let mut session = Session::start(fake, &settings_for("scenario.cfg")).unwrap();
    session.query(&Query::SimulationStep).unwrap();

    let mut out = Vec::new();
    probe::vehicle_ids(&mut session, &mut out).unwrap();
    session.close().unwrap();

    assert_eq!(
        String::from_utf8(out).unwrap(),
        "vehicle count: 2\nvehicles: veh0, veh1\n"
    );
}

#[test]
fn test_junction_context_reports_nearby_speed() {
    let fake = FakeSimulator::new()
        .with_junction("center", 0.0, 0.0)
        .with_delta_t(0.5)
        .depart_at(3, FakeVehicle::new("veh0", 10.0, 5.0, 13.25));

    let output = run_probe(
        fake,
        "scenario.cfg",
        Probe::JunctionContext,
        ProbeOptions {
            steps: 10,
            seed: Some(1),
        },
    )
    .unwrap();

    assert!(output.starts_with("step length: 0.50s\n"));
    assert!(output.contains("junction center after 3 steps:"));
    assert!(output.contains("  veh0 speed 13.25"));
}

#[test]
fn test_junction_context_gives_up_after_step_budget() {
    let fake = FakeSimulator::new()
        .with_junction("a", 0.0, 0.0)
        .with_junction("b", 500.0, 0.0)
        .depart_at(1, FakeVehicle::new("far", 250.0, 250.0, 9.0));

    let output = run_probe(
        fake,
        "scenario.cfg",
        Probe::JunctionContext,
        ProbeOptions {
            steps: 4,
            seed: Some(3),
        },
    )
    .unwrap();

    assert_eq!(output.matches("testing junction").count(), 4);
    assert!(output.ends_with("no vehicles near any junction after 4 steps\n"));
}

#[test]
fn test_junction_context_without_junctions_fails() {
    let result = run_probe(
        FakeSimulator::new(),
        "scenario.cfg",
        Probe::JunctionContext,
        ProbeOptions::default(),
    );
    assert!(result.is_err());
}

#[test]
fn test_departures_prints_positions() {
    let fake = FakeSimulator::new()
        .depart_at(2, FakeVehicle::new("veh0", 1.0, 2.0, 0.0))
        .depart_at(3, FakeVehicle::new("veh1", 4.5, 6.0, 0.0));

    let output = run_probe(
        fake,
        "scenario.cfg",
        Probe::Departures,
        ProbeOptions {
            steps: 3,
            seed: None,
        },
    )
    .unwrap();

    assert_eq!(
        output,
        "step 2:\n  veh0 at (1.00, 2.00)\n\
         step 3:\n  veh0 at (1.00, 2.00)\n  veh1 at (4.50, 6.00)\n"
    );
}

#[test]
fn test_alternate_scenario_accepted() {
    let fake = FakeSimulator::new().with_scenario("nets/grid.sumocfg");
    let output = run_probe(fake, "nets/grid.sumocfg", Probe::VehicleIds, ProbeOptions::default()).unwrap();
    assert_eq!(output, "vehicle count: 0\n");
}
