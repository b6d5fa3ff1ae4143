//! Loading setups from TOML plus environment overrides.

mod common;

use anyhow::Result;
use common::*;
use daq_runtime::config::RuntimeConfig;
use daq_runtime::error::ErrorKind;
use daq_runtime::{ExecutionMode, Session};
use serde_json::json;
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const SETUP: &str = r#"
[application]
name = "beamline-7"
log_level = "debug"

[cache]
prefix = "bl7/"
lock_timeout_ms = 500

[[devices]]
name = "det"
type = "Sensor"

[devices.config]
unit = "counts"
maxage = 2.5

[[devices]]
name = "slit"
type = "Sensor"
config = { unit = "mm", description = "Entrance slit" }
"#;

fn write_setup(contents: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    Ok(file)
}

#[test]
#[serial]
fn test_load_setup_file() -> Result<()> {
    let file = write_setup(SETUP)?;
    let config = RuntimeConfig::load_validated(file.path())?;

    assert_eq!(config.application.name, "beamline-7");
    assert_eq!(config.cache.prefix, "bl7/");
    assert_eq!(config.cache.lock_timeout(), Duration::from_millis(500));
    // untouched sections keep their defaults
    assert_eq!(config.cache.lock_ttl_secs, 1800);
    assert_eq!(config.session.mode, ExecutionMode::Master);

    assert_eq!(config.devices.len(), 2);
    assert_eq!(config.devices[0].config.get("maxage"), Some(&json!(2.5)));
    assert_eq!(
        config.devices[1].config.get("description"),
        Some(&json!("Entrance slit"))
    );
    Ok(())
}

#[test]
#[serial]
fn test_environment_overrides_file() -> Result<()> {
    let file = write_setup(SETUP)?;
    std::env::set_var("DAQ_RUNTIME_SESSION__MODE", "simulation");
    std::env::set_var("DAQ_RUNTIME_SESSION__STRICT_CONFIG", "true");
    let loaded = RuntimeConfig::load_validated(file.path());
    std::env::remove_var("DAQ_RUNTIME_SESSION__MODE");
    std::env::remove_var("DAQ_RUNTIME_SESSION__STRICT_CONFIG");

    let config = loaded?;
    assert_eq!(config.session.mode, ExecutionMode::Simulation);
    assert!(config.session.strict_config);
    assert_eq!(config.application.log_level, "debug");
    Ok(())
}

#[test]
#[serial]
fn test_invalid_setup_names_the_file() -> Result<()> {
    let file = write_setup(
        r#"
[[devices]]
name = "m1"
type = "Motor"

[[devices]]
name = "M1"
type = "Motor"
"#,
    )?;
    let err = RuntimeConfig::load_validated(file.path()).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("Duplicate device name"));
    assert!(message.contains(&file.path().display().to_string()));

    let missing = RuntimeConfig::load_validated("/nonexistent/setup.toml");
    // a missing file is an empty provider, so defaults apply
    assert!(missing.is_ok());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_session_from_config_creates_on_demand() -> Result<()> {
    let file = write_setup(SETUP)?;
    let config = RuntimeConfig::load_validated(file.path())?;
    let session = Session::from_config(&config)?;
    session.register_type(sensor_type("Sensor", FakeAxis::at(7.0)))?;

    assert!(session.device_names().is_empty());
    let det = session.get_device("det").await?;
    assert_eq!(det.local("maxage"), Some(json!(2.5)));
    assert_eq!(det.read(Some(0.0)).await?, json!(7.0));
    assert_eq!(session.device_names(), vec!["det".to_string()]);

    let err = session.get_device("nothere").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_invalid_config_is_rejected_by_session() {
    let mut config = RuntimeConfig::default();
    config.cache.prefix = "no-slash".to_string();
    let err = Session::from_config(&config).err().map(|e| e.kind());
    assert_eq!(err, Some(ErrorKind::Configuration));
}
