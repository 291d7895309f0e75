use std::{
    collections::HashMap,
    fmt::Write as _,
    fs,
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS,
};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::{
    net::TcpListener,
    runtime::{Handle, Runtime},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use homelink_common::{
    devices::{
        EnvironmentSensors, GatewayIo, GatewayReadings, LightDriver, LightOutput, RelayDriver,
        SensorReadings,
    },
    error::{ConnectError, PublishError, StorageError},
    CommandRequest, DeviceIdentity, DeviceKind, DeviceModel, Gateway, InboundMessage, InputFlag,
    MacAddress, Millis, MonotonicClock, MqttClient, Node, NodeSnapshot, NvStore, OtaOutcome,
    OtaTransport, Platform, PlatformParts, Qos, RuntimeConfig, SensorNode, SessionOptions,
    SmartLight, SmartSwitch, System, TickOutcome, Transport,
};

const CONFIG_FILE: &str = "config.json";
const EEPROM_FILE: &str = "eeprom.bin";
const OTA_DIR: &str = "ota";
const STAGED_IMAGE: &str = "firmware.bin";
const STAGED_DIGEST: &str = "firmware.sha256";

const EEPROM_SIZE: usize = 512;
const OTA_CHUNK_SIZE: usize = 4096;
const DEFAULT_HTTP_PORT: u16 = 8080;
const MQTT_CHANNEL_CAPACITY: usize = 64;
const CONTROL_QUEUE_CAPACITY: usize = 16;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

static BUTTON: InputFlag = InputFlag::new();
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = data_dir();
    let mut config = load_runtime_config(&data_dir).unwrap_or_else(|err| {
        warn!(
            "failed to load runtime config from {}: {err:#}",
            data_dir.display()
        );
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.sanitize();

    let identity = host_identity(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("homelink-io")
        .build()
        .context("failed to start tokio runtime")?;

    let (command_tx, command_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
    let (snapshot_tx, snapshot_rx) = watch::channel(None);

    start_control_surface(
        &runtime,
        http_port(),
        ControlState {
            snapshot: snapshot_rx,
            commands: command_tx,
            power_control: has_power_control(identity.kind()),
        },
    )?;
    spawn_signal_listeners(&runtime);

    let mut runner = HostRunner {
        handle: runtime.handle().clone(),
        config,
        identity,
        data_dir,
        clock: HostClock::new(),
        commands: command_rx,
        snapshots: snapshot_tx,
    };

    let result = match runner.identity.kind() {
        DeviceKind::SmartLight => runner.run_device::<SmartLight>(Box::new(SimLight::default())),
        DeviceKind::SmartSwitch => runner.run_device::<SmartSwitch>(Box::new(SimRelay::default())),
        DeviceKind::SensorNode => runner.run_device::<SensorNode>(Box::new(SimSensors::default())),
        DeviceKind::Gateway => runner.run_device::<Gateway>(Box::new(SimGateway::default())),
    };

    drop(runner);
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

struct HostPlatform;

impl Platform for HostPlatform {
    type Transport = BrokerProbe;
    type Mqtt = HostMqtt;
    type Store = FileEeprom;
    type Ota = StagingOta;
    type System = HostSystem;
}

enum LoopExit {
    Shutdown,
    Restart,
}

struct HostRunner {
    handle: Handle,
    config: RuntimeConfig,
    identity: DeviceIdentity,
    data_dir: PathBuf,
    clock: HostClock,
    commands: mpsc::Receiver<CommandRequest>,
    snapshots: watch::Sender<Option<NodeSnapshot>>,
}

impl HostRunner {
    fn run_device<M: DeviceModel>(&mut self, io: Box<M::Io>) -> anyhow::Result<()> {
        let mut parts = self.platform_parts()?;
        let mut io = io;

        loop {
            let mut node: Node<M, HostPlatform> = Node::new(
                self.identity.clone(),
                &self.config,
                io,
                parts,
                &BUTTON,
                self.clock.now(),
            );

            match self.drive(&mut node) {
                LoopExit::Shutdown => {
                    info!("{} shutting down", self.identity.device_id());
                    return Ok(());
                }
                LoopExit::Restart => {
                    info!("simulated restart; rebuilding node from persisted state");
                    (parts, io) = node.into_parts();
                }
            }
        }
    }

    fn drive<M: DeviceModel>(&mut self, node: &mut Node<M, HostPlatform>) -> LoopExit {
        let interval = Duration::from_millis(u64::from(self.config.timing().loop_interval_ms));

        loop {
            if SHUTDOWN.load(Ordering::Acquire) {
                return LoopExit::Shutdown;
            }

            let started = Instant::now();
            while let Ok(request) = self.commands.try_recv() {
                node.queue_local(request);
            }

            let now = self.clock.now();
            let outcome = node.tick(now);
            self.snapshots.send_replace(Some(node.snapshot(now)));

            if outcome == TickOutcome::Restart {
                return LoopExit::Restart;
            }

            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    fn platform_parts(&self) -> anyhow::Result<PlatformParts<HostPlatform>> {
        let network = &self.config.network;
        let link = Arc::new(AtomicBool::new(false));

        Ok(PlatformParts {
            transport: BrokerProbe::new(&network.mqtt_host, network.mqtt_port, link.clone()),
            mqtt: HostMqtt::new(
                self.handle.clone(),
                &network.mqtt_host,
                network.mqtt_port,
                link,
            ),
            store: FileEeprom::open(self.data_dir.join(EEPROM_FILE))?,
            ota: StagingOta::new(self.data_dir.join(OTA_DIR)),
            system: HostSystem::new(self.config.timing().watchdog_timeout_secs),
        })
    }
}

struct HostClock {
    started: Instant,
}

impl HostClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl MonotonicClock for HostClock {
    fn now(&self) -> Millis {
        Millis::from_wide(
            self.started
                .elapsed()
                .as_millis()
                .try_into()
                .unwrap_or(u64::MAX),
        )
    }
}

/// Stands in for the WiFi link: "up" once the broker answers on TCP, "down"
/// when the MQTT event loop reports an I/O failure.
struct BrokerProbe {
    host: String,
    port: u16,
    link: Arc<AtomicBool>,
    local_ip: String,
}

impl BrokerProbe {
    fn new(host: &str, port: u16, link: Arc<AtomicBool>) -> Self {
        Self {
            host: host.to_string(),
            port,
            link,
            local_ip: "0.0.0.0".to_string(),
        }
    }
}

impl Transport for BrokerProbe {
    fn connect(&mut self) -> Result<(), ConnectError> {
        let addr = resolve(&self.host, self.port).map_err(ConnectError::Transport)?;
        TcpStream::connect_timeout(&addr, PROBE_TIMEOUT)
            .map_err(|err| ConnectError::Transport(format!("{addr}: {err}")))?;

        if let Some(ip) = local_ip_towards(addr) {
            self.local_ip = ip;
        }
        self.link.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.load(Ordering::Acquire)
    }

    fn local_address(&self) -> String {
        self.local_ip.clone()
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, String> {
    (host, port)
        .to_socket_addrs()
        .map_err(|err| format!("cannot resolve {host}: {err}"))?
        .next()
        .ok_or_else(|| format!("{host} has no addresses"))
}

/// The address the OS would route broker traffic from. UDP connect sends
/// nothing.
fn local_ip_towards(addr: SocketAddr) -> Option<String> {
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(addr).ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

enum MqttEvent {
    ConnAck(Result<(), String>),
    Message(InboundMessage),
}

struct HostMqtt {
    handle: Handle,
    host: String,
    port: u16,
    link: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    client: Option<AsyncClient>,
    events: Option<std_mpsc::Receiver<MqttEvent>>,
    poller: Option<JoinHandle<()>>,
}

impl HostMqtt {
    fn new(handle: Handle, host: &str, port: u16, link: Arc<AtomicBool>) -> Self {
        Self {
            handle,
            host: host.to_string(),
            port,
            link,
            connected: Arc::new(AtomicBool::new(false)),
            client: None,
            events: None,
            poller: None,
        }
    }

    fn disconnect(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.client = None;
        self.events = None;
        self.connected.store(false, Ordering::Release);
    }

    fn mqtt_options(&self, options: &SessionOptions) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), self.host.clone(), self.port);
        mqtt_options.set_keep_alive(Duration::from_secs(u64::from(options.keep_alive_secs)));
        mqtt_options.set_clean_session(true);

        if let Some(credentials) = &options.credentials {
            mqtt_options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }

        let will = &options.will;
        mqtt_options.set_last_will(rumqttc::LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            qos(will.qos),
            will.retain,
        ));
        mqtt_options
    }
}

impl Drop for HostMqtt {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl MqttClient for HostMqtt {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), ConnectError> {
        self.disconnect();

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(options), MQTT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = std_mpsc::channel();
        self.poller = Some(self.handle.spawn(poll_events(
            eventloop,
            events_tx,
            self.connected.clone(),
            self.link.clone(),
        )));

        match wait_for_connack(&events_rx) {
            Ok(()) => {
                info!("mqtt connected to {}:{}", self.host, self.port);
                self.client = Some(client);
                self.events = Some(events_rx);
                Ok(())
            }
            Err(reason) => {
                self.disconnect();
                Err(ConnectError::Session(reason))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn subscribe(&mut self, topic: &str, level: Qos) -> Result<(), ConnectError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConnectError::Session("not connected".to_string()))?;
        client
            .try_subscribe(topic, qos(level))
            .map_err(|err| ConnectError::Session(err.to_string()))
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        level: Qos,
        retain: bool,
    ) -> Result<(), PublishError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PublishError::Client("not connected".to_string()))?;
        client
            .try_publish(topic, qos(level), retain, payload.to_vec())
            .map_err(|err| PublishError::Client(err.to_string()))
    }

    fn poll_incoming(&mut self) -> Option<InboundMessage> {
        let events = self.events.as_ref()?;
        loop {
            match events.try_recv().ok()? {
                MqttEvent::Message(message) => return Some(message),
                MqttEvent::ConnAck(_) => continue,
            }
        }
    }
}

fn wait_for_connack(events: &std_mpsc::Receiver<MqttEvent>) -> Result<(), String> {
    let deadline = Instant::now() + CONNACK_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(MqttEvent::ConnAck(result)) => return result,
            Ok(MqttEvent::Message(_)) => continue,
            Err(_) => {
                return Err(format!(
                    "no CONNACK within {}s",
                    CONNACK_TIMEOUT.as_secs()
                ))
            }
        }
    }
}

/// Runs one broker session. Ends on the first error: reconnecting is the
/// session manager's job, not rumqttc's.
async fn poll_events(
    mut eventloop: EventLoop,
    events: std_mpsc::Sender<MqttEvent>,
    connected: Arc<AtomicBool>,
    link: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                let accepted = ack.code == ConnectReturnCode::Success;
                connected.store(accepted, Ordering::Release);
                let result = if accepted {
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
                if events.send(MqttEvent::ConnAck(result)).is_err() || !accepted {
                    break;
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(MqttEvent::Message(message)).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                if connected.swap(false, Ordering::AcqRel) {
                    warn!("mqtt connection lost: {err}");
                } else {
                    debug!("mqtt connect failed: {err}");
                }
                if matches!(err, ConnectionError::Io(_) | ConnectionError::NetworkTimeout) {
                    link.store(false, Ordering::Release);
                }
                let _ = events.send(MqttEvent::ConnAck(Err(err.to_string())));
                break;
            }
        }
    }
}

fn qos(level: Qos) -> QoS {
    match level {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// A 512-byte EEPROM image on disk. Writes land in memory; `commit` replaces
/// the file atomically.
struct FileEeprom {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl FileEeprom {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let mut bytes = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        bytes.resize(EEPROM_SIZE, 0xFF);
        Ok(Self { path, bytes })
    }
}

impl NvStore for FileEeprom {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read_byte(&self, offset: usize) -> u8 {
        self.bytes.get(offset).copied().unwrap_or(0xFF)
    }

    fn write_byte(&mut self, offset: usize, byte: u8) {
        if let Some(slot) = self.bytes.get_mut(offset) {
            *slot = byte;
        }
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        write_atomically(&self.path, &self.bytes)
            .map_err(|err| StorageError::Commit(format!("{err:#}")))
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("tmp");
    fs::write(&staging, bytes).with_context(|| format!("failed to write {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Copies `file://` images into the data directory. The digest of the staged
/// image stands in for the running firmware's identity.
struct StagingOta {
    dir: PathBuf,
}

impl StagingOta {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn installed_digest(&self) -> Option<String> {
        fs::read_to_string(self.dir.join(STAGED_DIGEST))
            .ok()
            .map(|digest| digest.trim().to_string())
    }

    fn stage(&self, source: &Path, progress: &mut dyn FnMut(u8)) -> anyhow::Result<OtaOutcome> {
        let mut image = fs::File::open(source)
            .with_context(|| format!("cannot open firmware image {}", source.display()))?;
        let total = image.metadata()?.len();
        if total == 0 {
            return Err(anyhow!("firmware image is empty"));
        }

        fs::create_dir_all(&self.dir)?;
        let pending = self.dir.join(STAGED_IMAGE).with_extension("pending");
        let mut staged = fs::File::create(&pending)?;

        let mut hasher = Sha256::new();
        let mut written = 0_u64;
        let mut chunk = [0_u8; OTA_CHUNK_SIZE];
        loop {
            let read = image.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            staged.write_all(&chunk[..read])?;
            hasher.update(&chunk[..read]);
            written = written.saturating_add(read as u64);
            progress((written.saturating_mul(100) / total).min(100) as u8);
        }
        staged.sync_all()?;
        drop(staged);

        let digest = hex_digest(&hasher.finalize());
        if self.installed_digest().as_deref() == Some(digest.as_str()) {
            fs::remove_file(&pending)?;
            info!("firmware {digest} is already installed");
            return Ok(OtaOutcome::NoUpdateAvailable);
        }

        fs::rename(&pending, self.dir.join(STAGED_IMAGE))?;
        fs::write(self.dir.join(STAGED_DIGEST), &digest)?;
        info!("staged firmware {digest} ({written} bytes)");
        Ok(OtaOutcome::Success)
    }
}

impl OtaTransport for StagingOta {
    fn update(&mut self, url: &str, progress: &mut dyn FnMut(u8)) -> OtaOutcome {
        if url.starts_with("http://") || url.starts_with("https://") {
            return OtaOutcome::Failed("HTTP downloads are only available in ESP32 builds".into());
        }
        let Some(source) = url.strip_prefix("file://") else {
            return OtaOutcome::Failed(format!("unsupported firmware url `{url}`"));
        };

        self.stage(Path::new(source), progress)
            .unwrap_or_else(|err| OtaOutcome::Failed(format!("{err:#}")))
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

struct HostSystem {
    watchdog_timeout: Duration,
    last_feed: Option<Instant>,
}

impl HostSystem {
    fn new(watchdog_timeout_secs: u32) -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(u64::from(watchdog_timeout_secs)),
            last_feed: None,
        }
    }
}

impl System for HostSystem {
    fn feed_watchdog(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_feed {
            let stalled = now.duration_since(last);
            if stalled > self.watchdog_timeout {
                warn!(
                    "main loop stalled for {}ms; a hardware watchdog would have reset the board",
                    stalled.as_millis()
                );
            }
        }
        self.last_feed = Some(now);
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn restart(&mut self) {
        info!("restart requested");
        self.last_feed = None;
    }

    fn enter_provisioning(&mut self) {
        warn!("broker unreachable after repeated attempts; no provisioning portal on host, still retrying");
    }

    fn free_memory(&self) -> u32 {
        fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_mem_available(&meminfo))
            .unwrap_or(0)
    }
}

fn parse_mem_available(meminfo: &str) -> Option<u32> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(u32::try_from(kib.saturating_mul(1024)).unwrap_or(u32::MAX))
}

#[derive(Default)]
struct SimLight {
    last: Option<LightOutput>,
}

impl LightDriver for SimLight {
    fn write(&mut self, output: LightOutput) {
        if self.last != Some(output) {
            info!(
                "light output: relay {} duty {} rgb {:?}",
                output.relay_on, output.duty, output.rgb
            );
            self.last = Some(output);
        }
    }
}

#[derive(Default)]
struct SimRelay {
    on: Option<bool>,
}

impl RelayDriver for SimRelay {
    fn set_relay(&mut self, on: bool) {
        if self.on != Some(on) {
            info!("relay {}", if on { "on" } else { "off" });
            self.on = Some(on);
        }
    }
}

#[derive(Default)]
struct SimSensors {
    samples: u32,
}

impl EnvironmentSensors for SimSensors {
    fn read(&mut self) -> SensorReadings {
        self.samples = self.samples.wrapping_add(1);
        let tick = self.samples;
        SensorReadings {
            temperature: Some(21.0 + (tick % 8) as f32 * 0.2),
            humidity: Some(45.0 + (tick % 6) as f32 * 0.5),
            pressure: Some(1013.25),
            light_level: Some(((tick * 37) % 1024) as u16),
            motion_detected: Some(tick % 10 == 0),
        }
    }
}

#[derive(Default)]
struct SimGateway {
    relay: SimRelay,
    samples: u32,
}

impl GatewayIo for SimGateway {
    fn set_relay(&mut self, on: bool) {
        RelayDriver::set_relay(&mut self.relay, on);
    }

    fn read(&mut self) -> GatewayReadings {
        self.samples = self.samples.wrapping_add(1);
        let tick = self.samples;
        GatewayReadings {
            temperature: Some(20.0 + (tick % 5) as f32 * 0.3),
            humidity: Some(50.0 + (tick % 4) as f32),
            analog_value: ((tick * 53) % 1024) as u16,
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("HOMELINK_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.homelink"))
}

fn http_port() -> u16 {
    std::env::var("HOMELINK_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT)
}

fn load_runtime_config(data_dir: &Path) -> anyhow::Result<RuntimeConfig> {
    let path = data_dir.join(CONFIG_FILE);
    match fs::read(&path) {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(
    config: &mut RuntimeConfig,
    var: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(kind) = var("DEVICE_KIND") {
        config.device.kind = kind.parse().context("invalid DEVICE_KIND")?;
    }
    if let Some(host) = var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = var("MQTT_PORT") {
        match port.parse::<u16>() {
            Ok(port) => config.network.mqtt_port = port,
            Err(_) => warn!("ignoring invalid MQTT_PORT `{port}`"),
        }
    }
    if let Some(user) = var("MQTT_USER") {
        config.network.mqtt_user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        config.network.mqtt_pass = pass;
    }
    Ok(())
}

fn host_identity(config: &RuntimeConfig) -> anyhow::Result<DeviceIdentity> {
    let kind = config.device.kind;
    let mac = match config.device.mac.as_deref() {
        Some(raw) => raw.parse().context("invalid device.mac")?,
        None => derived_mac(&hostname()),
    };
    let firmware = env!("CARGO_PKG_VERSION");

    match config.device.device_id.as_deref() {
        Some(device_id) => DeviceIdentity::with_device_id(kind, device_id, mac, firmware)
            .context("invalid device.device_id"),
        None => Ok(DeviceIdentity::from_mac(kind, mac, firmware)),
    }
}

/// Stable per host: locally administered, unicast.
fn derived_mac(seed: &str) -> MacAddress {
    let digest = Sha256::digest(seed.as_bytes());
    let mut octets = [0_u8; 6];
    octets.copy_from_slice(&digest[..6]);
    octets[0] = (octets[0] | 0x02) & !0x01;
    MacAddress(octets)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "homelink-host".to_string())
}

fn spawn_signal_listeners(runtime: &Runtime) {
    runtime.spawn(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            return;
        }
        info!("shutdown requested");
        SHUTDOWN.store(true, Ordering::Release);
    });

    #[cfg(unix)]
    runtime.spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut presses = match signal(SignalKind::user_defined1()) {
            Ok(presses) => presses,
            Err(err) => {
                warn!("failed to listen for SIGUSR1: {err}");
                return;
            }
        };
        while presses.recv().await.is_some() {
            debug!("SIGUSR1: button press");
            BUTTON.raise();
        }
    });
}

#[derive(Clone)]
struct ControlState {
    snapshot: watch::Receiver<Option<NodeSnapshot>>,
    commands: mpsc::Sender<CommandRequest>,
    /// False for kinds whose command table has no `set_power`.
    power_control: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct InfoView {
    device_id: String,
    device_type: &'static str,
    firmware_version: String,
    mac_address: String,
    ip_address: String,
    free_heap: u32,
    uptime: u32,
    online: bool,
    state: Value,
}

impl From<NodeSnapshot> for InfoView {
    fn from(snapshot: NodeSnapshot) -> Self {
        Self {
            device_id: snapshot.device_id,
            device_type: snapshot.device_type,
            firmware_version: snapshot.firmware_version,
            mac_address: snapshot.mac_address,
            ip_address: snapshot.ip_address,
            free_heap: snapshot.free_heap,
            uptime: snapshot.uptime,
            online: snapshot.online,
            state: snapshot.state,
        }
    }
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    queued: bool,
    power: bool,
}

fn start_control_surface(runtime: &Runtime, port: u16, state: ControlState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = runtime
        .block_on(TcpListener::bind(addr))
        .with_context(|| format!("failed to bind control surface at {addr}"))?;

    let app = control_router(state);
    runtime.spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("control surface stopped: {err}");
        }
    });

    info!("control surface listening on http://{addr}");
    Ok(())
}

fn has_power_control(kind: DeviceKind) -> bool {
    fn answers<M: DeviceModel>(command: &str) -> bool {
        M::commands().iter().any(|spec| spec.name == command)
    }

    match kind {
        DeviceKind::SmartLight => answers::<SmartLight>("set_power"),
        DeviceKind::SmartSwitch => answers::<SmartSwitch>("set_power"),
        DeviceKind::SensorNode => answers::<SensorNode>("set_power"),
        DeviceKind::Gateway => answers::<Gateway>("set_power"),
    }
}

fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/info", get(handle_get_info))
        .route("/control", post(handle_post_control))
        .with_state(state)
}

async fn handle_get_info(State(state): State<ControlState>) -> axum::response::Response {
    let snapshot = state.snapshot.borrow().clone();
    match snapshot {
        Some(snapshot) => Json(InfoView::from(snapshot)).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "Node is still starting"),
    }
}

async fn handle_post_control(
    State(state): State<ControlState>,
    Form(params): Form<HashMap<String, String>>,
) -> axum::response::Response {
    if !state.power_control {
        return error_response(StatusCode::NOT_FOUND, "This device has no power control");
    }
    let Some(value) = params.get("power") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'power' parameter");
    };
    let Some(power) = parse_power(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid power value. Use true, false, 1 or 0",
        );
    };

    let request = CommandRequest::new("set_power").with_param("power", power);
    if let Err(err) = state.commands.try_send(request) {
        warn!("dropping local control request: {err}");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Control queue is full");
    }

    Json(ControlResponse {
        queued: true,
        power,
    })
    .into_response()
}

fn parse_power(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
