//! Integration tests for execution mode gating and simulation.

mod common;

use common::*;
use daq_runtime::cache::CacheBackend;
use daq_runtime::error::ErrorKind;
use daq_runtime::ExecutionMode;
use serde_json::json;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_slave_mode_rejects_all_writes() {
    let rig = rig();
    let hw = FakeAxis::at(0.0);
    rig.session.register_type(motor_type("Motor", hw.clone())).unwrap();
    let m1 = rig
        .session
        .create_device("m1", "Motor", config(json!({"unit": "mm"})))
        .await
        .unwrap();

    rig.session.set_mode(ExecutionMode::Slave).await.unwrap();
    for (param, value) in [("speed", json!(1.0)), ("target", json!(1.0)), ("unit", json!("m"))] {
        let err = m1.set(param, value).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mode, "set {param} in slave mode");
    }
    assert_eq!(m1.start(json!(5.0)).await.unwrap_err().kind(), ErrorKind::Mode);
    assert_eq!(m1.stop().await.unwrap_err().kind(), ErrorKind::Mode);
    assert_eq!(hw.moves(), 0);

    // reads still work
    assert_eq!(m1.read(Some(0.0)).await.unwrap(), json!(0.0));

    rig.session.set_mode(ExecutionMode::Maintenance).await.unwrap();
    assert!(m1.set("speed", json!(1.0)).await.is_ok());
}

#[tokio::test]
async fn test_simulated_move_timing_from_speed() {
    let rig = rig();
    let hw = FakeAxis::at(0.0);
    rig.session.register_type(motor_type("Motor", hw.clone())).unwrap();
    let m1 = rig
        .session
        .create_device("m1", "Motor", config(json!({"unit": "mm", "speed": 2.0})))
        .await
        .unwrap();
    m1.read(Some(0.0)).await.unwrap();
    let reads_before = hw.reads();

    rig.session.set_mode(ExecutionMode::Simulation).await.unwrap();
    // capture reads the last value from the still-valid cache
    assert_eq!(hw.reads(), reads_before);
    assert_eq!(m1.sim_state().value, Some(json!(0.0)));
    let sim_start = rig.session.sim_clock().time();

    m1.start(json!(10.0)).await.unwrap();
    let done = m1.wait().await.unwrap();

    assert_eq!(done.elapsed, 5.0);
    assert_eq!(done.value, json!(10.0));
    assert_eq!(rig.session.sim_clock().time(), sim_start + 5.0);
    assert_eq!(m1.read(None).await.unwrap(), json!(10.0));
    assert_eq!(hw.reads(), reads_before);
    assert_eq!(hw.moves(), 0);
    assert_eq!(*hw.position.lock(), 0.0);
}

#[tokio::test]
async fn test_simulated_move_timing_from_ramp() {
    let rig = rig_with_mode(ExecutionMode::Simulation);
    let hw = FakeAxis::at(0.0);
    rig.session.register_type(motor_type("Motor", hw.clone())).unwrap();
    let m1 = rig
        .session
        .create_device("m1", "Motor", config(json!({"unit": "K", "ramp": 30.0})))
        .await
        .unwrap();

    // no prior value: movement starts from zero
    let done = m1.maw(json!(4.0)).await.unwrap();
    assert_eq!(done.elapsed, 8.0);

    // without speed or ramp the move is instantaneous
    m1.set("ramp", json!(0.0)).await.unwrap();
    let done = m1.maw(json!(-6.0)).await.unwrap();
    assert_eq!(done.elapsed, 0.0);

    let sim = m1.sim_state();
    assert_eq!(sim.min, Some(-6.0));
    assert_eq!(sim.max, Some(4.0));
    assert_eq!(hw.reads(), 0);
}

#[tokio::test]
async fn test_setting_value_moves_the_device() {
    let rig = rig_with_mode(ExecutionMode::Simulation);
    let hw = FakeAxis::at(0.0);
    rig.session.register_type(motor_type("Motor", hw.clone())).unwrap();
    let m1 = rig
        .session
        .create_device("m1", "Motor", config(json!({"unit": "mm", "speed": 2.0})))
        .await
        .unwrap();

    assert_eq!(m1.set("value", json!(10)).await.unwrap(), json!(10.0));
    assert_eq!(m1.local("target"), Some(json!(10.0)));
    let done = m1.wait().await.unwrap();
    assert_eq!(done.elapsed, 5.0);
    assert_eq!(done.value, json!(10.0));
    assert_eq!(hw.moves(), 0);

    rig.session.set_mode(ExecutionMode::Master).await.unwrap();
    m1.set("value", json!(3.0)).await.unwrap();
    assert_eq!(hw.moves(), 1);
    assert_eq!(m1.read(Some(0.0)).await.unwrap(), json!(3.0));
}

#[tokio::test]
async fn test_simulation_drops_the_cache() {
    let rig = rig();
    let hw = FakeAxis::at(1.0);
    rig.session.register_type(motor_type("Motor", hw.clone())).unwrap();
    let m1 = rig
        .session
        .create_device("m1", "Motor", config(json!({"unit": "mm"})))
        .await
        .unwrap();

    rig.session.set_mode(ExecutionMode::Simulation).await.unwrap();
    m1.set("speed", json!(9.0)).await.unwrap();
    assert_eq!(m1.local("speed"), Some(json!(9.0)));
    assert_eq!(rig.cache.get_any("m1", "speed").await.unwrap(), Some(json!(0.0)));
    assert_eq!(hw.speed_writes.load(Ordering::SeqCst), 0);

    // back to master: cache and hardware are used again
    rig.session.set_mode(ExecutionMode::Master).await.unwrap();
    m1.set("speed", json!(3.0)).await.unwrap();
    assert_eq!(rig.cache.get_any("m1", "speed").await.unwrap(), Some(json!(3.0)));
    assert_eq!(hw.speed_writes.load(Ordering::SeqCst), 1);
    assert_eq!(m1.read(Some(0.0)).await.unwrap(), json!(1.0));
}

#[tokio::test]
async fn test_capture_tolerates_read_failures() {
    let rig = rig();
    let hw = FakeAxis::at(1.0);
    rig.session.register_type(sensor_type("Sensor", hw.clone())).unwrap();
    let s1 = rig
        .session
        .create_device("s1", "Sensor", config(json!({"unit": "V"})))
        .await
        .unwrap();
    hw.fail_reads.store(true, Ordering::SeqCst);

    rig.session.set_mode(ExecutionMode::Simulation).await.unwrap();
    assert_eq!(rig.session.mode(), ExecutionMode::Simulation);
    assert_eq!(s1.sim_state().value, None);
}

#[tokio::test]
async fn test_mode_snapshots_are_versioned() {
    let rig = rig();
    let mut rx = rig.session.mode_context().subscribe();

    let snap = rig.session.set_mode(ExecutionMode::Slave).await.unwrap();
    assert_eq!(snap.version, 1);
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow().mode, ExecutionMode::Slave);

    // same mode again is not a transition
    let again = rig.session.set_mode(ExecutionMode::Slave).await.unwrap();
    assert_eq!(again.version, 1);

    let snap = rig.session.set_mode(ExecutionMode::Master).await.unwrap();
    assert_eq!(snap.version, 2);
}
