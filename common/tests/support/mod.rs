#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use homelink_common::{
    devices::{
        EnvironmentSensors, GatewayIo, GatewayReadings, LightDriver, LightOutput, RelayDriver,
        SensorReadings,
    },
    error::{ConnectError, PublishError, StorageError},
    session::LastWill,
    DeviceIdentity, DeviceKind, DeviceModel, InboundMessage, InputFlag, MacAddress, Millis,
    MqttClient, Node, NvStore, OtaOutcome, OtaTransport, Platform, PlatformParts, Qos,
    RuntimeConfig, SessionOptions, System, TopicSet, Transport,
};
use serde_json::Value;

pub const MAC: MacAddress = MacAddress([0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]);
pub const FIRMWARE: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

/// In-memory broker. Remembers the will from CONNECT and delivers it when the
/// client vanishes without a clean disconnect.
#[derive(Debug, Default)]
pub struct Broker {
    pub connected: bool,
    pub refuse: bool,
    pub sessions: Vec<SessionOptions>,
    pub will: Option<LastWill>,
    pub subscriptions: Vec<String>,
    pub published: Vec<Published>,
    pub retained: HashMap<String, Vec<u8>>,
    pub inbox: VecDeque<InboundMessage>,
}

impl Broker {
    pub fn deliver(&mut self, topic: &str, payload: &str) {
        self.inbox.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    pub fn drop_unclean(&mut self) {
        self.connected = false;
        if let Some(will) = self.will.take() {
            self.record(&will.topic, &will.payload, will.retain);
        }
    }

    pub fn on(&self, topic: &str) -> Vec<Value> {
        self.published
            .iter()
            .filter(|p| p.topic == topic)
            .map(Published::json)
            .collect()
    }

    pub fn retained_json(&self, topic: &str) -> Option<Value> {
        self.retained
            .get(topic)
            .map(|payload| serde_json::from_slice(payload).unwrap())
    }

    fn record(&mut self, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            self.retained.insert(topic.to_string(), payload.to_vec());
        }
        self.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
    }
}

pub struct FakeMqtt(pub Rc<RefCell<Broker>>);

impl MqttClient for FakeMqtt {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), ConnectError> {
        let mut broker = self.0.borrow_mut();
        if broker.refuse {
            return Err(ConnectError::Session("connection refused".to_string()));
        }
        broker.connected = true;
        broker.will = Some(options.will.clone());
        broker.sessions.push(options.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), ConnectError> {
        self.0.borrow_mut().subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError> {
        let mut broker = self.0.borrow_mut();
        if !broker.connected {
            return Err(PublishError::Client("not connected".to_string()));
        }
        broker.record(topic, payload, retain);
        Ok(())
    }

    fn poll_incoming(&mut self) -> Option<InboundMessage> {
        let mut broker = self.0.borrow_mut();
        if !broker.connected {
            return None;
        }
        broker.inbox.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct Link {
    pub unreachable: bool,
    pub up: bool,
    pub attempts: usize,
}

pub struct FakeTransport(pub Rc<RefCell<Link>>);

impl Transport for FakeTransport {
    fn connect(&mut self) -> Result<(), ConnectError> {
        let mut link = self.0.borrow_mut();
        link.attempts += 1;
        if link.unreachable {
            return Err(ConnectError::Transport("no route to broker".to_string()));
        }
        link.up = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.borrow().up
    }

    fn local_address(&self) -> String {
        "192.168.1.50".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct RamStore {
    pub bytes: Vec<u8>,
    pub commits: usize,
}

impl RamStore {
    pub fn blank() -> Self {
        Self {
            bytes: vec![0xFF; 512],
            commits: 0,
        }
    }
}

impl NvStore for RamStore {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read_byte(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    fn write_byte(&mut self, offset: usize, byte: u8) {
        self.bytes[offset] = byte;
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct OtaLog {
    pub urls: Vec<String>,
}

pub struct ScriptedOta {
    pub steps: Vec<u8>,
    pub outcome: OtaOutcome,
    pub log: Rc<RefCell<OtaLog>>,
}

impl OtaTransport for ScriptedOta {
    fn update(&mut self, url: &str, progress: &mut dyn FnMut(u8)) -> OtaOutcome {
        self.log.borrow_mut().urls.push(url.to_string());
        for step in &self.steps {
            progress(*step);
        }
        self.outcome.clone()
    }
}

#[derive(Debug, Default)]
pub struct FakeSystem {
    pub watchdog_feeds: usize,
    pub delays: Vec<u32>,
    pub restarts: usize,
    pub provisioning: usize,
}

impl System for FakeSystem {
    fn feed_watchdog(&mut self) {
        self.watchdog_feeds += 1;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }

    fn enter_provisioning(&mut self) {
        self.provisioning += 1;
    }

    fn free_memory(&self) -> u32 {
        180_000
    }

    fn wifi_rssi(&self) -> Option<i32> {
        Some(-61)
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Transport = FakeTransport;
    type Mqtt = FakeMqtt;
    type Store = RamStore;
    type Ota = ScriptedOta;
    type System = FakeSystem;
}

#[derive(Clone, Default)]
pub struct FakeLight(pub Rc<RefCell<Vec<LightOutput>>>);

impl LightDriver for FakeLight {
    fn write(&mut self, output: LightOutput) {
        self.0.borrow_mut().push(output);
    }
}

#[derive(Clone, Default)]
pub struct FakeRelay(pub Rc<RefCell<Vec<bool>>>);

impl RelayDriver for FakeRelay {
    fn set_relay(&mut self, on: bool) {
        self.0.borrow_mut().push(on);
    }
}

impl GatewayIo for FakeRelay {
    fn set_relay(&mut self, on: bool) {
        self.0.borrow_mut().push(on);
    }

    fn read(&mut self) -> GatewayReadings {
        GatewayReadings {
            temperature: Some(19.5),
            humidity: Some(48.0),
            analog_value: 321,
        }
    }
}

pub struct FakeSensors(pub SensorReadings);

impl EnvironmentSensors for FakeSensors {
    fn read(&mut self) -> SensorReadings {
        self.0
    }
}

/// Shared handles the test keeps after the node takes ownership of the parts.
#[derive(Clone, Default)]
pub struct Rig {
    pub broker: Rc<RefCell<Broker>>,
    pub link: Rc<RefCell<Link>>,
    pub ota: Rc<RefCell<OtaLog>>,
}

impl Rig {
    pub fn parts(
        &self,
        store: RamStore,
        ota_steps: Vec<u8>,
        outcome: OtaOutcome,
    ) -> PlatformParts<TestPlatform> {
        PlatformParts {
            transport: FakeTransport(self.link.clone()),
            mqtt: FakeMqtt(self.broker.clone()),
            store,
            ota: ScriptedOta {
                steps: ota_steps,
                outcome,
                log: self.ota.clone(),
            },
            system: FakeSystem::default(),
        }
    }

    pub fn topics(&self, kind: DeviceKind) -> TopicSet {
        let config = RuntimeConfig::for_kind(kind);
        TopicSet::for_identity(&config.device.namespace, &identity(kind))
    }
}

pub fn identity(kind: DeviceKind) -> DeviceIdentity {
    DeviceIdentity::from_mac(kind, MAC, FIRMWARE)
}

pub fn button() -> &'static InputFlag {
    Box::leak(Box::new(InputFlag::new()))
}

pub fn boot<M: DeviceModel>(
    io: Box<M::Io>,
    parts: PlatformParts<TestPlatform>,
    button: &'static InputFlag,
) -> Node<M, TestPlatform> {
    Node::new(
        identity(M::KIND),
        &RuntimeConfig::for_kind(M::KIND),
        io,
        parts,
        button,
        Millis(0),
    )
}
