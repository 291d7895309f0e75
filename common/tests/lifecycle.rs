mod support;

use homelink_common::{
    devices::{LightOutput, SensorReadings},
    persistence::{schema_byte, HEADER_LEN},
    session::LastWill,
    CommandRequest, DeviceKind, DeviceModel, Gateway, LinkState, Millis, Node, OtaOutcome,
    OtaState, Qos, SensorNode, SessionState, SmartLight, SmartSwitch, TickOutcome,
};
use pretty_assertions::assert_eq;
use serde_json::json;

use support::{boot, button, FakeLight, FakeRelay, FakeSensors, RamStore, Rig, TestPlatform};

fn light(rig: &Rig, store: RamStore, driver: &FakeLight) -> Node<SmartLight, TestPlatform> {
    boot::<SmartLight>(
        Box::new(driver.clone()),
        rig.parts(store, Vec::new(), OtaOutcome::NoUpdateAvailable),
        button(),
    )
}

fn light_with_ota(rig: &Rig, steps: Vec<u8>, outcome: OtaOutcome) -> Node<SmartLight, TestPlatform> {
    boot::<SmartLight>(
        Box::new(FakeLight::default()),
        rig.parts(RamStore::blank(), steps, outcome),
        button(),
    )
}

#[test]
fn boot_announces_online_and_status() {
    let rig = Rig::default();
    let driver = FakeLight::default();
    let mut node = light(&rig, RamStore::blank(), &driver);
    let topics = rig.topics(DeviceKind::SmartLight);

    assert_eq!(node.tick(Millis(10)), TickOutcome::Continue);

    let broker = rig.broker.borrow();
    assert_eq!(
        broker.subscriptions,
        vec![topics.command().to_string(), topics.ota().unwrap().to_string()]
    );
    assert_eq!(
        broker.retained_json(topics.online()),
        Some(json!({ "online": true, "timestamp": 10 }))
    );
    assert_eq!(
        broker.retained_json(topics.status()),
        Some(json!({
            "device_id": "smart_light_a1b2c3d4e5f6",
            "device_type": "Smart Light",
            "firmware_version": "1.0.0",
            "mac_address": "A1:B2:C3:D4:E5:F6",
            "ip_address": "192.168.1.50",
            "online": true,
            "free_heap": 180000,
            "uptime": 10,
            "wifi_rssi": -61
        }))
    );
    assert_eq!(node.connectivity().link, LinkState::Connected);
    assert_eq!(node.connectivity().session, SessionState::Up);

    // Outputs were driven from the restored record before anything else.
    assert_eq!(driver.0.borrow()[0], SmartLight::default().output());
}

#[test]
fn toggle_publishes_state_and_survives_restart() {
    let rig = Rig::default();
    let driver = FakeLight::default();
    let mut node = light(&rig, RamStore::blank(), &driver);
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    rig.broker
        .borrow_mut()
        .deliver(topics.command(), r#"{"command":"toggle"}"#);
    node.tick(Millis(100));

    let states = rig.broker.borrow().on(topics.state());
    assert_eq!(states.len(), 1);
    assert_eq!(states[0]["power"], json!(true));
    assert_eq!(states[0]["timestamp"], json!(100));
    assert_eq!(states[0]["device_id"], json!("smart_light_a1b2c3d4e5f6"));
    assert!(driver.0.borrow().last().unwrap().relay_on);
    assert!(!node.is_dirty());

    let (parts, io) = node.into_parts();
    let restarted: Node<SmartLight, TestPlatform> = Node::new(
        support::identity(DeviceKind::SmartLight),
        &homelink_common::RuntimeConfig::for_kind(DeviceKind::SmartLight),
        io,
        parts,
        button(),
        Millis(0),
    );
    assert!(restarted.model().power);
}

#[test]
fn brightness_is_clamped_and_persisted() {
    let rig = Rig::default();
    let mut node = light(&rig, RamStore::blank(), &FakeLight::default());
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    rig.broker.borrow_mut().deliver(
        topics.command(),
        r#"{"command":"set_brightness","parameters":{"brightness":20}}"#,
    );
    rig.broker.borrow_mut().deliver(
        topics.command(),
        r#"{"command":"set_brightness","parameters":{"brightness":150}}"#,
    );
    node.tick(Millis(50));

    assert_eq!(node.model().brightness, 100);
    let store = node.store();
    assert_eq!(store.commits, 2);
    assert_eq!(
        &store.bytes[..HEADER_LEN + SmartLight::RECORD_LEN],
        &[schema_byte(1), 1, 0, 100, 255, 255, 255]
    );
}

#[test]
fn last_will_reaches_observers_on_unclean_drop() {
    let rig = Rig::default();
    let mut node = light(&rig, RamStore::blank(), &FakeLight::default());
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    assert_eq!(
        rig.broker.borrow().sessions[0].will,
        LastWill {
            topic: topics.online().to_string(),
            payload: br#"{"online":false}"#.to_vec(),
            qos: Qos::AtLeastOnce,
            retain: true,
        }
    );

    let published_before = rig.broker.borrow().published.len();
    rig.broker.borrow_mut().drop_unclean();

    let broker = rig.broker.borrow();
    assert_eq!(broker.published.len(), published_before + 1);
    assert_eq!(
        broker.retained_json(topics.online()),
        Some(json!({ "online": false }))
    );
    drop(broker);

    node.tick(Millis(100));
    assert_eq!(node.connectivity().session, SessionState::Down);
}

#[test]
fn session_reconnects_after_broker_loss() {
    let rig = Rig::default();
    let mut node = light(&rig, RamStore::blank(), &FakeLight::default());
    node.tick(Millis(0));

    rig.broker.borrow_mut().drop_unclean();
    node.tick(Millis(100));
    node.tick(Millis(200));

    assert_eq!(rig.broker.borrow().sessions.len(), 2);
    assert_eq!(node.connectivity().session, SessionState::Up);
}

#[test]
fn unknown_command_changes_nothing() {
    let rig = Rig::default();
    let mut node = light(&rig, RamStore::blank(), &FakeLight::default());
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    rig.broker
        .borrow_mut()
        .deliver(topics.command(), r#"{"command":"warp_drive","parameters":{}}"#);
    rig.broker
        .borrow_mut()
        .deliver(topics.command(), r#"{"command":"set_color","parameters":{"r":"red"}}"#);
    node.tick(Millis(100));

    assert_eq!(*node.model(), SmartLight::default());
    assert!(rig.broker.borrow().on(topics.state()).is_empty());
    assert_eq!(node.store().commits, 0);
}

#[test]
fn get_status_reports_status_and_state() {
    let rig = Rig::default();
    let mut node = light(&rig, RamStore::blank(), &FakeLight::default());
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    rig.broker
        .borrow_mut()
        .deliver(topics.command(), r#"{"command":"get_status"}"#);
    node.tick(Millis(2_000));

    let broker = rig.broker.borrow();
    let statuses = broker.on(topics.status());
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[1]["uptime"], json!(2_000));
    assert_eq!(broker.on(topics.state()).len(), 1);
}

#[test]
fn restart_command_goes_offline_then_restarts() {
    let rig = Rig::default();
    let mut node = light(&rig, RamStore::blank(), &FakeLight::default());
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    rig.broker
        .borrow_mut()
        .deliver(topics.command(), r#"{"command":"restart"}"#);
    rig.broker
        .borrow_mut()
        .deliver(topics.command(), r#"{"command":"toggle"}"#);

    assert_eq!(node.tick(Millis(100)), TickOutcome::Restart);
    assert_eq!(
        rig.broker.borrow().retained_json(topics.online()),
        Some(json!({ "online": false, "timestamp": 100 }))
    );
    assert_eq!(node.system().delays, vec![1_000]);
    assert_eq!(node.system().restarts, 1);

    // The rest of the iteration was skipped.
    assert!(!node.model().power);
    assert_eq!(node.tick(Millis(200)), TickOutcome::Restart);
    assert_eq!(node.system().restarts, 1);
}

#[test]
fn ota_update_reports_progress_then_restarts() {
    let rig = Rig::default();
    let mut node = light_with_ota(&rig, vec![10, 50, 100], OtaOutcome::Success);
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    rig.broker.borrow_mut().deliver(
        topics.ota().unwrap(),
        r#"{"action":"update","url":"http://fw.local/light-1.1.0.bin"}"#,
    );
    assert_eq!(node.tick(Millis(100)), TickOutcome::Restart);

    let reports: Vec<_> = rig
        .broker
        .borrow()
        .published
        .iter()
        .filter(|p| p.topic == topics.status() && !p.retain)
        .map(|p| p.json())
        .collect();
    let id = "smart_light_a1b2c3d4e5f6";
    assert_eq!(
        reports,
        vec![
            json!({ "device_id": id, "status": "updating", "progress": 0 }),
            json!({ "device_id": id, "status": "updating", "progress": 10 }),
            json!({ "device_id": id, "status": "updating", "progress": 50 }),
            json!({ "device_id": id, "status": "updating", "progress": 100 }),
            json!({ "device_id": id, "status": "success", "progress": 100 }),
        ]
    );
    assert_eq!(rig.ota.borrow().urls, vec!["http://fw.local/light-1.1.0.bin"]);
    assert_eq!(node.system().delays, vec![2_000]);
    assert_eq!(node.system().restarts, 1);
    assert_eq!(node.ota_state(), OtaState::Idle);
}

#[test]
fn ota_transfer_feeds_watchdog_on_every_chunk() {
    let rig = Rig::default();
    let mut node = light_with_ota(&rig, vec![0; 5], OtaOutcome::NoUpdateAvailable);
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));
    let before = node.system().watchdog_feeds;

    rig.broker.borrow_mut().deliver(
        topics.ota().unwrap(),
        r#"{"action":"update","url":"http://fw.local/chunked.bin"}"#,
    );
    node.tick(Millis(100));

    // One feed for the tick itself, one per transport callback.
    assert_eq!(node.system().watchdog_feeds - before, 1 + 5);
    let updating = rig
        .broker
        .borrow()
        .on(topics.status())
        .into_iter()
        .filter(|report| report["status"] == json!("updating"))
        .count();
    assert_eq!(updating, 1);
}

#[test]
fn second_update_request_while_busy_is_ignored() {
    let rig = Rig::default();
    let mut node = light_with_ota(&rig, Vec::new(), OtaOutcome::Failed("HTTP 500".to_string()));
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    let ota = topics.ota().unwrap();
    rig.broker
        .borrow_mut()
        .deliver(ota, r#"{"action":"update","url":"http://fw.local/a.bin"}"#);
    rig.broker
        .borrow_mut()
        .deliver(ota, r#"{"action":"update","url":"http://fw.local/b.bin"}"#);

    assert_eq!(node.tick(Millis(100)), TickOutcome::Continue);

    assert_eq!(rig.ota.borrow().urls, vec!["http://fw.local/a.bin"]);
    let terminal: Vec<_> = rig
        .broker
        .borrow()
        .published
        .iter()
        .filter(|p| p.topic == topics.status() && !p.retain)
        .map(|p| p.json())
        .filter(|report| report["status"] != json!("updating"))
        .collect();
    assert_eq!(
        terminal,
        vec![json!({
            "device_id": "smart_light_a1b2c3d4e5f6",
            "status": "failed",
            "progress": 0,
            "error": "HTTP 500"
        })]
    );
    assert_eq!(node.system().restarts, 0);
    assert_eq!(node.ota_state(), OtaState::Idle);
}

#[test]
fn ota_check_reports_version_without_starting_a_job() {
    let rig = Rig::default();
    let mut node = light_with_ota(&rig, Vec::new(), OtaOutcome::Success);
    let topics = rig.topics(DeviceKind::SmartLight);
    node.tick(Millis(0));

    rig.broker
        .borrow_mut()
        .deliver(topics.ota().unwrap(), r#"{"action":"check"}"#);
    node.tick(Millis(100));

    let statuses = rig.broker.borrow().on(topics.status());
    assert_eq!(
        statuses.last(),
        Some(&json!({
            "device_id": "smart_light_a1b2c3d4e5f6",
            "current_version": "1.0.0",
            "status": "ready_for_update"
        }))
    );
    assert!(rig.ota.borrow().urls.is_empty());
}

#[test]
fn button_toggles_once_per_debounce_window() {
    let rig = Rig::default();
    let flag = button();
    let driver = FakeLight::default();
    let mut node = boot::<SmartLight>(
        Box::new(driver.clone()),
        rig.parts(RamStore::blank(), Vec::new(), OtaOutcome::NoUpdateAvailable),
        flag,
    );
    node.tick(Millis(0));

    flag.raise();
    node.tick(Millis(1_000));
    assert!(node.model().power);

    flag.raise();
    node.tick(Millis(1_020));
    assert!(node.model().power);

    flag.raise();
    node.tick(Millis(1_100));
    assert!(!node.model().power);
    assert_eq!(node.store().commits, 2);
    assert_eq!(
        *driver.0.borrow().last().unwrap(),
        LightOutput {
            relay_on: false,
            duty: 0,
            rgb: [255, 255, 255]
        }
    );
}

#[test]
fn local_changes_persist_while_offline() {
    let rig = Rig::default();
    rig.link.borrow_mut().unreachable = true;
    let mut node = boot::<SmartSwitch>(
        Box::new(FakeRelay::default()),
        rig.parts(RamStore::blank(), Vec::new(), OtaOutcome::NoUpdateAvailable),
        button(),
    );

    node.queue_local(CommandRequest::new("set_power").with_param("power", true));
    node.tick(Millis(0));

    assert!(node.model().power);
    assert_eq!(node.store().commits, 1);
    assert!(rig.broker.borrow().published.is_empty());
    assert_eq!(node.connectivity().link, LinkState::Disconnected);
}

#[test]
fn repeated_link_failures_fall_back_to_provisioning() {
    let rig = Rig::default();
    rig.link.borrow_mut().unreachable = true;
    let mut node = boot::<SmartSwitch>(
        Box::new(FakeRelay::default()),
        rig.parts(RamStore::blank(), Vec::new(), OtaOutcome::NoUpdateAvailable),
        button(),
    );

    for attempt in 0..20 {
        node.tick(Millis(attempt * 501));
    }

    assert_eq!(rig.link.borrow().attempts, 20);
    assert_eq!(node.system().provisioning, 1);
    assert_eq!(node.supervisor().consecutive_failures(), 0);
}

#[test]
fn scheduler_drives_heartbeat_and_state_publishes() {
    let rig = Rig::default();
    let mut node = boot::<SmartSwitch>(
        Box::new(FakeRelay::default()),
        rig.parts(RamStore::blank(), Vec::new(), OtaOutcome::NoUpdateAvailable),
        button(),
    );
    let topics = rig.topics(DeviceKind::SmartSwitch);

    for step in 0..=310 {
        node.tick(Millis(step * 100));
    }

    let broker = rig.broker.borrow();
    // 5 s state cadence over 31 s, strictly-greater comparison.
    assert_eq!(broker.on(topics.state()).len(), 6);
    // Session announcement plus one heartbeat.
    assert_eq!(broker.on(topics.online()).len(), 2);
    assert_eq!(node.system().watchdog_feeds, 311);
}

#[test]
fn inbound_messages_are_bounded_per_tick() {
    let rig = Rig::default();
    let mut node = boot::<SmartSwitch>(
        Box::new(FakeRelay::default()),
        rig.parts(RamStore::blank(), Vec::new(), OtaOutcome::NoUpdateAvailable),
        button(),
    );
    let topics = rig.topics(DeviceKind::SmartSwitch);
    node.tick(Millis(0));

    for _ in 0..10 {
        rig.broker
            .borrow_mut()
            .deliver(topics.command(), r#"{"command":"toggle"}"#);
    }
    node.tick(Millis(100));

    assert_eq!(rig.broker.borrow().inbox.len(), 2);
    assert!(!node.model().power);
}

#[test]
fn sensor_node_polls_and_publishes_readings() {
    let rig = Rig::default();
    let sensors = FakeSensors(SensorReadings {
        temperature: Some(22.5),
        humidity: Some(41.0),
        pressure: Some(1013.25),
        light_level: Some(640),
        motion_detected: Some(true),
    });
    let mut node = boot::<SensorNode>(
        Box::new(sensors),
        rig.parts(RamStore::blank(), Vec::new(), OtaOutcome::NoUpdateAvailable),
        button(),
    );
    let topics = rig.topics(DeviceKind::SensorNode);

    node.tick(Millis(0));
    node.tick(Millis(5_001));
    assert_eq!(node.model().light_level, 640);
    assert!(rig.broker.borrow().on(topics.state()).is_empty());

    node.tick(Millis(30_001));
    let states = rig.broker.borrow().on(topics.state());
    assert_eq!(
        states,
        vec![json!({
            "device_id": "sensor_node_a1b2c3d4e5f6",
            "temperature": 22.5,
            "humidity": 41.0,
            "pressure": 1013.25,
            "light_level": 640,
            "motion_detected": true,
            "timestamp": 30001
        })]
    );
}

#[test]
fn gateway_has_no_ota_and_reports_free_memory() {
    let rig = Rig::default();
    let relay = FakeRelay::default();
    let mut node = boot::<Gateway>(
        Box::new(relay.clone()),
        rig.parts(RamStore::blank(), Vec::new(), OtaOutcome::Success),
        button(),
    );
    let topics = rig.topics(DeviceKind::Gateway);
    node.tick(Millis(0));

    let broker = rig.broker.borrow();
    assert_eq!(broker.subscriptions, vec![topics.command().to_string()]);
    let status = broker.retained_json(topics.status()).unwrap();
    assert_eq!(status["device_type"], json!("Arduino Gateway"));
    assert_eq!(status["free_memory"], json!(180000));
    assert!(status.get("free_heap").is_none());
    assert!(status.get("wifi_rssi").is_none());
    drop(broker);

    rig.broker
        .borrow_mut()
        .deliver(topics.command(), r#"{"command":"get_sensors"}"#);
    node.tick(Millis(100));

    assert_eq!(node.model().analog_value, 321);
    assert_eq!(*relay.0.borrow(), vec![false]);
}

#[test]
fn snapshot_reflects_node() {
    let rig = Rig::default();
    let mut node = light(&rig, RamStore::blank(), &FakeLight::default());
    node.tick(Millis(0));

    let snapshot = node.snapshot(Millis(4_000));
    assert_eq!(snapshot.device_id, "smart_light_a1b2c3d4e5f6");
    assert!(snapshot.online);
    assert_eq!(snapshot.uptime, 4_000);
    assert_eq!(snapshot.ota, OtaState::Idle);
    assert_eq!(snapshot.state["brightness"], json!(100));
}
