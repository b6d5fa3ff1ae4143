//! Integration tests for device creation, rollback and teardown.

mod common;

use common::*;
use daq_runtime::attach::AttachSpec;
use daq_runtime::config::DeviceDefinition;
use daq_runtime::device::spec::{device_base, Capability};
use daq_runtime::device::DeviceType;
use daq_runtime::error::ErrorKind;
use daq_runtime::parameter::ParamSpec;
use daq_runtime::validation::Validator;
use daq_runtime::{DaqError, ExecutionMode};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_create_device_resolves_parameters() {
    let rig = rig();
    rig.session
        .register_type(motor_type("Motor", FakeAxis::at(0.0)))
        .unwrap();

    let m1 = rig
        .session
        .create_device("m1", "Motor", config(json!({"unit": "mm", "speed": 2})))
        .await
        .unwrap();

    assert_eq!(m1.local("unit"), Some(json!("mm")));
    assert_eq!(m1.local("speed"), Some(json!(2.0)));
    assert_eq!(m1.local("fmtstr"), Some(json!("%.3f")));
    assert_eq!(m1.local("maxage"), Some(json!(6.0)));
    assert_eq!(rig.session.device_names(), vec!["m1".to_string()]);
    // resolved values and the config snapshot land in the cache
    assert_eq!(rig.cache.entry("m1", "speed").unwrap().value, json!(2.0));
    assert_eq!(
        rig.cache.entry("m1", "_lastconfig_").unwrap().value,
        json!({"unit": "mm", "speed": 2})
    );
}

#[tokio::test]
async fn test_missing_mandatory_parameter_fails_cleanly() {
    let rig = rig();
    rig.session
        .register_type(motor_type("Motor", FakeAxis::at(0.0)))
        .unwrap();

    let err = rig
        .session
        .create_device("m1", "Motor", config(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("unit"));
    assert!(rig.session.device("m1").is_none());
    assert!(!rig.session.registry().contains("m1"));
}

#[tokio::test]
async fn test_attach_failure_rolls_back_edges() {
    let rig = rig();
    rig.session
        .register_type(motor_type("Motor", FakeAxis::at(0.0)))
        .unwrap();
    rig.session
        .register_type(
            DeviceType::builder("Table")
                .attach("x", AttachSpec::new("X axis", Capability::Moveable))
                .attach("y", AttachSpec::new("Y axis", Capability::Moveable))
                .hardware_access(false)
                .build()
                .unwrap(),
        )
        .unwrap();
    rig.session
        .create_device("mx", "Motor", config(json!({"unit": "mm"})))
        .await
        .unwrap();

    let err = rig
        .session
        .create_device("table", "Table", config(json!({"x": "mx", "y": "my"})))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!rig.session.registry().contains("table"));
    assert!(rig.session.registry().dependents("mx").is_empty());
    assert!(rig.session.shutdown_device("mx").await.is_ok());
}

#[tokio::test]
async fn test_attach_checks_capability() {
    let rig = rig();
    rig.session
        .register_type(sensor_type("Sensor", FakeAxis::at(1.0)))
        .unwrap();
    rig.session.register_type(table_type("Table")).unwrap();
    rig.session
        .create_device("s1", "Sensor", config(json!({"unit": "V"})))
        .await
        .unwrap();

    let err = rig
        .session
        .create_device("table", "Table", config(json!({"x": "s1"})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("must provide Moveable"));
    assert!(rig.session.registry().dependents("s1").is_empty());
}

#[tokio::test]
async fn test_attached_devices_are_created_on_demand() {
    let rig = rig();
    rig.session
        .register_type(motor_type("Motor", FakeAxis::at(0.0)))
        .unwrap();
    rig.session.register_type(table_type("Table")).unwrap();
    rig.session.define(DeviceDefinition {
        name: "mx".into(),
        r#type: "Motor".into(),
        config: config(json!({"unit": "mm"})),
    });
    rig.session.define(DeviceDefinition {
        name: "table".into(),
        r#type: "Table".into(),
        config: config(json!({"x": "mx"})),
    });

    let table = rig.session.get_device("table").await.unwrap();
    let mx = table.attached_one("x").unwrap();
    assert_eq!(mx.name(), "mx");
    assert_eq!(
        rig.session.registry().dependents("mx"),
        vec![("table".to_string(), "x".to_string())]
    );

    // cannot shut down while used
    let err = rig.session.shutdown_device("mx").await.unwrap_err();
    assert!(err.to_string().contains("still used by table"));
}

#[tokio::test]
async fn test_cyclic_attachment_fails_fast() {
    let rig = rig();
    let cyclic = DeviceType::builder("Linked")
        .attach("peer", AttachSpec::new("Partner", Capability::Device))
        .hardware_access(false)
        .build()
        .unwrap();
    rig.session.register_type(cyclic).unwrap();
    for (name, peer) in [("a", "b"), ("b", "a")] {
        rig.session.define(DeviceDefinition {
            name: name.into(),
            r#type: "Linked".into(),
            config: config(json!({"peer": peer})),
        });
    }

    let err = rig.session.get_device("a").await.unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)));
    assert!(err.to_string().contains("cyclic"));
    assert!(rig.session.device_names().is_empty());
}

#[tokio::test]
async fn test_concurrent_creation_shares_attached_device() {
    let rig = rig();
    let inits = Arc::new(AtomicUsize::new(0));
    let counter = inits.clone();
    let shared = DeviceType::builder("Shared")
        .extends(&device_base().unwrap())
        .on_init(move |_dev| {
            let inits = counter.clone();
            async move {
                // let the other creation observe the name as under construction
                tokio::task::yield_now().await;
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();
    let consumer = DeviceType::builder("Consumer")
        .attach("source", AttachSpec::new("Shared source", Capability::Device))
        .hardware_access(false)
        .build()
        .unwrap();
    rig.session.register_type(shared).unwrap();
    rig.session.register_type(consumer).unwrap();
    rig.session.define(DeviceDefinition {
        name: "d".into(),
        r#type: "Shared".into(),
        config: config(json!({})),
    });
    for name in ["c1", "c2"] {
        rig.session.define(DeviceDefinition {
            name: name.into(),
            r#type: "Consumer".into(),
            config: config(json!({"source": "d"})),
        });
    }

    let (c1, c2) = tokio::join!(rig.session.get_device("c1"), rig.session.get_device("c2"));
    let (c1, c2) = (c1.unwrap(), c2.unwrap());
    assert_eq!(inits.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(
        &c1.attached_one("source").unwrap(),
        &c2.attached_one("source").unwrap()
    ));
    assert_eq!(rig.session.registry().dependents("d").len(), 2);

    // a second explicit creation of a name in flight is refused
    let (first, second) = tokio::join!(
        rig.session.create_device("e", "Shared", config(json!({}))),
        rig.session.create_device("e", "Shared", config(json!({}))),
    );
    assert!(first.is_ok());
    assert!(second.unwrap_err().to_string().contains("already being created"));
}

#[tokio::test]
async fn test_cycle_is_not_tolerated_as_missing() {
    let rig = rig();
    let dtype = DeviceType::builder("Loose")
        .attach(
            "peer",
            AttachSpec::new("Partner", Capability::Device).tolerate_missing(),
        )
        .hardware_access(false)
        .build()
        .unwrap();
    rig.session.register_type(dtype).unwrap();
    for (name, peer) in [("a", "b"), ("b", "a")] {
        rig.session.define(DeviceDefinition {
            name: name.into(),
            r#type: "Loose".into(),
            config: config(json!({"peer": peer})),
        });
    }

    let err = rig.session.get_device("a").await.unwrap_err();
    assert!(err.to_string().contains("cyclic attachment"));
    assert!(rig.session.device_names().is_empty());
}

#[tokio::test]
async fn test_tolerated_missing_attachment() {
    let rig = rig();
    let dtype = DeviceType::builder("Shutter")
        .attach(
            "interlock",
            AttachSpec::new("Optional interlock", Capability::Readable).tolerate_missing(),
        )
        .hardware_access(false)
        .build()
        .unwrap();
    rig.session.register_type(dtype).unwrap();

    let shutter = rig
        .session
        .create_device("shutter", "Shutter", config(json!({"interlock": "gone"})))
        .await
        .unwrap();
    assert!(shutter.attached_one("interlock").is_none());
    assert_eq!(shutter.attached("interlock").len(), 1);
}

#[tokio::test]
async fn test_duplicate_names_and_non_unique_types() {
    let rig = rig();
    rig.session
        .register_type(sensor_type("Sensor", FakeAxis::at(1.0)))
        .unwrap();
    rig.session
        .create_device("s1", "Sensor", config(json!({"unit": "V"})))
        .await
        .unwrap();
    let err = rig
        .session
        .create_device("S1", "Sensor", config(json!({"unit": "V"})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));

    let temp = DeviceType::builder("Temp")
        .extends(&device_base().unwrap())
        .non_unique()
        .build()
        .unwrap();
    rig.session.register_type(temp).unwrap();
    let first = rig
        .session
        .create_device("t", "Temp", config(json!({"description": "first"})))
        .await
        .unwrap();
    let second = rig
        .session
        .create_device("t", "Temp", config(json!({"description": "second"})))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&rig.session.device("t").unwrap(), &second));
}

#[tokio::test]
async fn test_hook_order_and_preinit_parameters() {
    let rig = rig();
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let (pre, init) = (events.clone(), events.clone());
    let dtype = DeviceType::builder("Gauge")
        .extends(&device_base().unwrap())
        .param(ParamSpec::new("channel", Validator::Int).default(json!(1)))
        .on_pre_init(move |dev| {
            let events = pre.clone();
            async move {
                let seen = format!(
                    "pre_init loglevel={} channel={}",
                    dev.local("loglevel").is_some(),
                    dev.local("channel").is_some()
                );
                events.lock().push(seen);
                Ok(())
            }
        })
        .on_init(move |dev| {
            let events = init.clone();
            async move {
                events
                    .lock()
                    .push(format!("init channel={}", dev.local("channel").is_some()));
                Ok(())
            }
        })
        .build()
        .unwrap();
    rig.session.register_type(dtype).unwrap();

    rig.session
        .create_device("gauge", "Gauge", config(json!({})))
        .await
        .unwrap();
    assert_eq!(
        *events.lock(),
        vec![
            "pre_init loglevel=true channel=false".to_string(),
            "init channel=true".to_string()
        ]
    );
}

#[tokio::test]
async fn test_failing_init_hook_unregisters_device() {
    let rig = rig();
    let dtype = DeviceType::builder("Broken")
        .extends(&device_base().unwrap())
        .on_init(|dev| async move { Err(DaqError::communication(dev.name(), "no answer")) })
        .build()
        .unwrap();
    rig.session.register_type(dtype).unwrap();

    let err = rig
        .session
        .create_device("broken", "Broken", config(json!({})))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(!rig.session.registry().contains("broken"));

    // name is free again
    assert!(rig.session.registry().get("broken").is_none());
}

#[tokio::test]
async fn test_unknown_config_keys() {
    let rig = rig();
    rig.session
        .register_type(sensor_type("Sensor", FakeAxis::at(1.0)))
        .unwrap();
    rig.session
        .create_device("s1", "Sensor", config(json!({"unit": "V", "vendor_option": 3})))
        .await
        .unwrap();

    let strict = peer(&rig).with_strict_config(true);
    strict
        .register_type(sensor_type("Sensor", FakeAxis::at(1.0)))
        .unwrap();
    let err = strict
        .create_device("s2", "Sensor", config(json!({"unit": "V", "vendor_option": 3})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("vendor_option"));
}

#[tokio::test]
async fn test_shutdown_all_goes_dependents_first() {
    let rig = rig();
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let record = order.clone();
    let hw = FakeAxis::at(0.0);
    rig.session.register_type(motor_type("Motor", hw)).unwrap();
    let logged_table = DeviceType::builder("Table")
        .attach("x", AttachSpec::new("X axis", Capability::Moveable))
        .hardware_access(false)
        .on_shutdown(move |dev| {
            let order = record.clone();
            async move {
                order.lock().push(dev.name().to_string());
                Ok(())
            }
        })
        .build()
        .unwrap();
    rig.session.register_type(logged_table).unwrap();
    rig.session
        .create_device("mx", "Motor", config(json!({"unit": "mm"})))
        .await
        .unwrap();
    rig.session
        .create_device("table", "Table", config(json!({"x": "mx"})))
        .await
        .unwrap();

    rig.session.shutdown_all().await.unwrap();
    assert_eq!(*order.lock(), vec!["table".to_string()]);
    assert!(rig.session.device_names().is_empty());
}

#[tokio::test]
async fn test_shutdown_hook_skipped_in_simulation() {
    let rig = rig_with_mode(ExecutionMode::Simulation);
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let dtype = DeviceType::builder("Heater")
        .extends(&device_base().unwrap())
        .on_shutdown(move |_dev| {
            let calls = counter.clone();
            async move {
                *calls.lock() += 1;
                Ok(())
            }
        })
        .build()
        .unwrap();
    rig.session.register_type(dtype).unwrap();
    rig.session
        .create_device("heater", "Heater", config(json!({})))
        .await
        .unwrap();

    rig.session.shutdown_device("heater").await.unwrap();
    assert_eq!(*calls.lock(), 0);
    assert!(rig.session.device("heater").is_none());
}
