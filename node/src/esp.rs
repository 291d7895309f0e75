use core::convert::TryInto;
use std::{
    fmt::Write as _,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use dht_sensor::dht22;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::Read,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{Ets, FreeRtos},
    gpio::{
        AnyIOPin, AnyInputPin, AnyOutputPin, Gpio36, IOPin, Input, InputOutput, InputPin,
        InterruptType, Output, OutputPin, PinDriver, Pull,
    },
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use homelink_common::{
    config::NetworkConfig,
    devices::{EnvironmentSensors, LightDriver, LightOutput, RelayDriver, SensorReadings},
    error::{ConnectError, PublishError, StorageError},
    DeviceIdentity, DeviceKind, DeviceModel, InboundMessage, InputFlag, MacAddress, Millis,
    MonotonicClock, MqttClient, Node, NvStore, OtaOutcome, OtaTransport, Platform, PlatformParts,
    Qos, RuntimeConfig, SensorNode, SessionOptions, SmartLight, SmartSwitch, System, TickOutcome,
    Transport,
};

const NVS_NAMESPACE: &str = "homelink";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_EEPROM_KEY: &str = "eeprom";

const EEPROM_SIZE: usize = 512;
const MAX_CONFIG_BYTES: usize = 4096;
const OTA_CHUNK_SIZE: usize = 4096;
const PWM_FREQUENCY_HZ: u32 = 5_000;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);
const OTA_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static BUTTON: InputFlag = InputFlag::new();

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut config);
    config.sanitize();

    let Peripherals {
        modem,
        pins,
        ledc,
        adc1,
        ..
    } = Peripherals::take()?;

    let transport = WifiTransport::new(modem, sys_loop, nvs_partition.clone(), &config.network)
        .context("wifi startup failed")?;
    let identity = board_identity(&config, transport.mac()?)?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(config.timing().watchdog_timeout_secs)?;
    add_current_task_to_watchdog()?;

    let mut button = PinDriver::input(pins.gpio0.downgrade_input())?;
    button.set_pull(Pull::Up)?;
    button.set_interrupt_type(InterruptType::NegEdge)?;
    // SAFETY: the handler only performs an atomic store.
    unsafe { button.subscribe(|| BUTTON.raise())? };
    button.enable_interrupt()?;

    let parts: PlatformParts<EspPlatform> = PlatformParts {
        transport,
        mqtt: EspMqtt::new(&config.network),
        store: NvsEeprom::open(nvs_partition)?,
        ota: HttpOta,
        system: EspSystem,
    };

    match identity.kind() {
        DeviceKind::SmartLight => {
            let io = EspLight::new(
                pins.gpio4.downgrade_output(),
                LedcDriver::new(
                    ledc.channel0,
                    LedcTimerDriver::new(
                        ledc.timer0,
                        &TimerConfig::default()
                            .frequency(Hertz(PWM_FREQUENCY_HZ))
                            .resolution(Resolution::Bits8),
                    )?,
                    pins.gpio2,
                )?,
            )?;
            run_node::<SmartLight>(identity, &config, Box::new(io), parts, &mut button)
        }
        DeviceKind::SmartSwitch => {
            let io = EspRelay::new(pins.gpio5.downgrade_output(), pins.gpio2.downgrade_output())?;
            run_node::<SmartSwitch>(identity, &config, Box::new(io), parts, &mut button)
        }
        DeviceKind::SensorNode => {
            let io = EspSensors::new(
                pins.gpio4.downgrade(),
                pins.gpio5.downgrade_input(),
                AdcChannelDriver::new(
                    AdcDriver::new(adc1)?,
                    pins.gpio36,
                    &AdcChannelConfig {
                        attenuation: DB_11,
                        ..Default::default()
                    },
                )?,
            )?;
            run_node::<SensorNode>(identity, &config, Box::new(io), parts, &mut button)
        }
        DeviceKind::Gateway => {
            bail!("the gateway is a wired board without WiFi; run it with the host build")
        }
    }
}

struct EspPlatform;

impl Platform for EspPlatform {
    type Transport = WifiTransport;
    type Mqtt = EspMqtt;
    type Store = NvsEeprom;
    type Ota = HttpOta;
    type System = EspSystem;
}

fn run_node<M: DeviceModel>(
    identity: DeviceIdentity,
    config: &RuntimeConfig,
    io: Box<M::Io>,
    parts: PlatformParts<EspPlatform>,
    button: &mut PinDriver<'static, AnyInputPin, Input>,
) -> anyhow::Result<()> {
    let clock = EspClock;
    let interval = Duration::from_millis(u64::from(config.timing().loop_interval_ms));
    let mut node: Node<M, EspPlatform> =
        Node::new(identity, config, io, parts, &BUTTON, clock.now());

    loop {
        let started = Instant::now();
        if node.tick(clock.now()) == TickOutcome::Restart {
            return Ok(());
        }

        // The driver disarms the interrupt after each edge.
        if let Err(err) = button.enable_interrupt() {
            warn!("failed to re-arm button interrupt: {err:?}");
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
}

struct EspClock;

impl MonotonicClock for EspClock {
    fn now(&self) -> Millis {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        Millis::from_wide(u64::try_from(micros / 1000).unwrap_or(0))
    }
}

fn board_identity(config: &RuntimeConfig, hardware_mac: [u8; 6]) -> anyhow::Result<DeviceIdentity> {
    let kind = config.device.kind;
    let mac = match config.device.mac.as_deref() {
        Some(raw) => raw.parse().context("invalid device.mac")?,
        None => MacAddress(hardware_mac),
    };
    let firmware = env!("CARGO_PKG_VERSION");

    match config.device.device_id.as_deref() {
        Some(device_id) => DeviceIdentity::with_device_id(kind, device_id, mac, firmware)
            .context("invalid device.device_id"),
        None => Ok(DeviceIdentity::from_mac(kind, mac, firmware)),
    }
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; MAX_CONFIG_BYTES];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

fn ensure_wifi_defaults(config: &mut RuntimeConfig) {
    if config.network.wifi_ssid.is_empty() {
        config.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if config.network.wifi_pass.is_empty() {
        config.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn build_static_ip_config(network: &NetworkConfig) -> anyhow::Result<Option<NetifConfiguration>> {
    if !network.use_static_ip {
        return Ok(None);
    }

    let static_ip = network
        .static_ip
        .ok_or_else(|| anyhow!("static_ip is required when use_static_ip is true"))?;
    let gateway = network
        .gateway
        .ok_or_else(|| anyhow!("gateway is required when use_static_ip is true"))?;
    let subnet = network
        .subnet
        .ok_or_else(|| anyhow!("subnet is required when use_static_ip is true"))?;

    let mask_ip = ipv4_from_octets(subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {}", mask_ip))?;

    let mut conf = NetifConfiguration::wifi_default_client();
    conf.key = "WIFI_STA_STATIC"
        .try_into()
        .map_err(|_| anyhow!("netif key too long"))?;
    conf.ip_configuration = Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
        IpClientSettings {
            ip: ipv4_from_octets(static_ip),
            subnet: Subnet {
                gateway: ipv4_from_octets(gateway),
                mask,
            },
            dns: network.dns.map(ipv4_from_octets),
            secondary_dns: None,
        },
    )));

    Ok(Some(conf))
}

/// Station-mode WiFi. Configured once at boot; `connect` joins the network
/// and waits for DHCP (or the static address).
struct WifiTransport {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl WifiTransport {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        if !has_station_credentials(network) {
            bail!("wifi credentials missing; build with WIFI_SSID/WIFI_PASS or store runtime_json in NVS");
        }

        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        if let Some(conf) = build_static_ip_config(network)? {
            let sta_netif =
                EspNetif::new_with_conf(&conf).context("failed to create static IP netif")?;
            esp_wifi
                .swap_netif_sta(sta_netif)
                .context("failed to apply static IP netif configuration")?;
        }

        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        info!("wifi started for `{}`", network.wifi_ssid);
        Ok(Self { wifi })
    }

    fn mac(&self) -> anyhow::Result<[u8; 6]> {
        Ok(self.wifi.wifi().sta_netif().get_mac()?)
    }
}

impl Transport for WifiTransport {
    fn connect(&mut self) -> Result<(), ConnectError> {
        let _ = self.wifi.disconnect();
        self.wifi
            .connect()
            .map_err(|err| ConnectError::Transport(format!("wifi connect failed: {err:?}")))?;
        self.wifi
            .wait_netif_up()
            .map_err(|err| ConnectError::Transport(format!("netif up failed: {err:?}")))?;
        disable_wifi_power_save();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn local_address(&self) -> String {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map(|info| info.ip.to_string())
            .unwrap_or_else(|_| "0.0.0.0".to_string())
    }
}

enum MqttEvent {
    Connected,
    Disconnected,
    Message(InboundMessage),
}

struct EspMqtt {
    url: String,
    client: Option<EspMqttClient<'static>>,
    events: Option<mpsc::Receiver<MqttEvent>>,
    connected: Arc<AtomicBool>,
}

impl EspMqtt {
    fn new(network: &NetworkConfig) -> Self {
        Self {
            url: format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port),
            client: None,
            events: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MqttClient for EspMqtt {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), ConnectError> {
        self.client = None;
        self.events = None;
        self.connected.store(false, Ordering::Release);

        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id.as_str()),
            username: options
                .credentials
                .as_ref()
                .map(|credentials| credentials.username.as_str()),
            password: options
                .credentials
                .as_ref()
                .map(|credentials| credentials.password.as_str()),
            keep_alive_interval: Some(Duration::from_secs(u64::from(options.keep_alive_secs))),
            lwt: Some(LwtConfiguration {
                topic: options.will.topic.as_str(),
                payload: &options.will.payload,
                qos: qos(options.will.qos),
                retain: options.will.retain,
            }),
            ..Default::default()
        };

        let (client, connection) = EspMqttClient::new(&self.url, &conf)
            .map_err(|err| ConnectError::Session(format!("{err:?}")))?;

        let (events_tx, events_rx) = mpsc::channel();
        let connected = self.connected.clone();
        thread::Builder::new()
            .name("mqtt-rx".into())
            .stack_size(12 * 1024)
            .spawn(move || poll_events(connection, events_tx, connected))
            .map_err(|err| ConnectError::Session(format!("failed to spawn mqtt thread: {err}")))?;

        let deadline = Instant::now() + CONNACK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events_rx.recv_timeout(remaining) {
                Ok(MqttEvent::Connected) => break,
                Ok(_) => continue,
                Err(_) => {
                    return Err(ConnectError::Session(format!(
                        "no CONNACK from {} within {}s",
                        self.url,
                        CONNACK_TIMEOUT.as_secs()
                    )))
                }
            }
        }

        self.client = Some(client);
        self.events = Some(events_rx);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn subscribe(&mut self, topic: &str, level: Qos) -> Result<(), ConnectError> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| ConnectError::Session("not connected".to_string()))?;
        client
            .subscribe(topic, qos(level))
            .map(|_| ())
            .map_err(|err| ConnectError::Session(format!("{err:?}")))
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
            .as_mut()
            .ok_or_else(|| PublishError::Client("not connected".to_string()))?;
        client
            .enqueue(topic, qos(level), retain, payload)
            .map(|_| ())
            .map_err(|err| PublishError::Client(format!("{err:?}")))
    }

    fn poll_incoming(&mut self) -> Option<InboundMessage> {
        let events = self.events.as_ref()?;
        loop {
            match events.try_recv().ok()? {
                MqttEvent::Message(message) => return Some(message),
                MqttEvent::Connected | MqttEvent::Disconnected => continue,
            }
        }
    }
}

fn poll_events(
    mut connection: EspMqttConnection,
    events: mpsc::Sender<MqttEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Ok(event) = connection.next() {
        let forwarded = match event.payload() {
            EventPayload::Connected(_) => {
                connected.store(true, Ordering::Release);
                events.send(MqttEvent::Connected)
            }
            EventPayload::Disconnected => {
                connected.store(false, Ordering::Release);
                events.send(MqttEvent::Disconnected)
            }
            EventPayload::Received {
                topic: Some(topic),
                data,
                details: Details::Complete,
                ..
            } => events.send(MqttEvent::Message(InboundMessage {
                topic: topic.to_string(),
                payload: data.to_vec(),
            })),
            _ => Ok(()),
        };

        if forwarded.is_err() {
            break;
        }
    }

    connected.store(false, Ordering::Release);
    debug!("mqtt receive thread exiting");
}

fn qos(level: Qos) -> QoS {
    match level {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// EEPROM emulation over one NVS blob.
struct NvsEeprom {
    nvs: EspNvs<NvsDefault>,
    bytes: [u8; EEPROM_SIZE],
}

impl NvsEeprom {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut bytes = [0xFF_u8; EEPROM_SIZE];
        let mut buffer = [0_u8; EEPROM_SIZE];

        if let Some(blob) = nvs.get_blob(NVS_EEPROM_KEY, &mut buffer)? {
            let len = blob.len().min(EEPROM_SIZE);
            bytes[..len].copy_from_slice(&blob[..len]);
        }
        Ok(Self { nvs, bytes })
    }
}

impl NvStore for NvsEeprom {
    fn capacity(&self) -> usize {
        EEPROM_SIZE
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
        self.nvs
            .set_blob(NVS_EEPROM_KEY, &self.bytes)
            .map_err(|err| StorageError::Commit(format!("{err:?}")))
    }
}

struct HttpOta;

impl OtaTransport for HttpOta {
    fn update(&mut self, url: &str, progress: &mut dyn FnMut(u8)) -> OtaOutcome {
        download_and_apply_ota(url, progress).unwrap_or_else(|err| {
            warn!("firmware update from {url} failed: {err:#}");
            OtaOutcome::Failed(format!("{err:#}"))
        })
    }
}

fn download_and_apply_ota(url: &str, progress: &mut dyn FnMut(u8)) -> anyhow::Result<OtaOutcome> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("url must start with http:// or https://");
    }

    let http_conf = HttpClientConfiguration {
        timeout: Some(OTA_HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if status == 304 {
        return Ok(OtaOutcome::NoUpdateAvailable);
    }
    if !(200..300).contains(&status) {
        bail!("firmware download failed with HTTP {status}");
    }

    let content_length = response
        .header("content-length")
        .or_else(|| response.header("Content-Length"))
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0);

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);

        // Called per chunk even without a length; the caller feeds the watchdog.
        let percent = content_length.map_or(0, |total| {
            (total_written.saturating_mul(100) / total).min(100) as u8
        });
        progress(percent);
    }

    if total_written == 0 {
        bail!("firmware download body is empty");
    }

    let mut digest_hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }

    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;

    info!("firmware {digest_hex} written ({total_written} bytes)");
    Ok(OtaOutcome::Success)
}

struct EspSystem;

impl System for EspSystem {
    fn feed_watchdog(&mut self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }

    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }

    fn restart(&mut self) {
        info!("restarting");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    fn enter_provisioning(&mut self) {
        warn!("wifi unreachable after repeated attempts; restarting for recovery");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    fn free_memory(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
    }

    fn wifi_rssi(&self) -> Option<i32> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then(|| i32::from(ap_info.rssi))
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

/// Relay on GPIO4, LED brightness on the LEDC channel. The board has a
/// single white LED, so the colour is state only.
struct EspLight {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    pwm: LedcDriver<'static>,
}

impl EspLight {
    fn new(relay_pin: AnyOutputPin, pwm: LedcDriver<'static>) -> anyhow::Result<Self> {
        let mut relay = PinDriver::output(relay_pin)?;
        relay.set_low()?;
        Ok(Self { relay, pwm })
    }
}

impl LightDriver for EspLight {
    fn write(&mut self, output: LightOutput) {
        let relay = if output.relay_on {
            self.relay.set_high()
        } else {
            self.relay.set_low()
        };
        if let Err(err) = relay {
            warn!("failed to drive light relay: {err:?}");
        }

        let duty = u32::from(output.duty) * self.pwm.get_max_duty() / 255;
        if let Err(err) = self.pwm.set_duty(duty) {
            warn!("failed to set light PWM duty: {err:?}");
        }
        debug!("light colour {:?}", output.rgb);
    }
}

/// Relay plus the inverted status LED.
struct EspRelay {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    led: PinDriver<'static, AnyOutputPin, Output>,
}

impl EspRelay {
    fn new(relay_pin: AnyOutputPin, led_pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut relay = PinDriver::output(relay_pin)?;
        relay.set_low()?;
        let mut led = PinDriver::output(led_pin)?;
        led.set_high()?;
        Ok(Self { relay, led })
    }
}

impl RelayDriver for EspRelay {
    fn set_relay(&mut self, on: bool) {
        let result = if on {
            self.relay.set_high().and_then(|_| self.led.set_low())
        } else {
            self.relay.set_low().and_then(|_| self.led.set_high())
        };
        if let Err(err) = result {
            warn!("failed to drive relay: {err:?}");
        }
    }
}

/// DHT22 on GPIO4, PIR on GPIO5, light sensor on ADC1 (GPIO36). The board
/// carries no pressure sensor driver, so pressure keeps its last value.
struct EspSensors {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    motion: PinDriver<'static, AnyInputPin, Input>,
    light: AdcChannelDriver<'static, Gpio36, AdcDriver<'static, ADC1>>,
    delay: Ets,
}

impl EspSensors {
    fn new(
        dht_pin: AnyIOPin,
        motion_pin: AnyInputPin,
        light: AdcChannelDriver<'static, Gpio36, AdcDriver<'static, ADC1>>,
    ) -> anyhow::Result<Self> {
        let mut dht_pin = PinDriver::input_output_od(dht_pin)?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        let motion = PinDriver::input(motion_pin)?;

        Ok(Self {
            dht_pin,
            motion,
            light,
            delay: Ets,
        })
    }

    fn read_climate(&mut self) -> (Option<f32>, Option<f32>) {
        if let Err(err) = self.dht_pin.set_high() {
            warn!("failed to set DHT22 line high before read: {err:?}");
            return (None, None);
        }

        match dht22::blocking::read(&mut self.delay, &mut self.dht_pin) {
            Ok(reading) => (Some(reading.temperature), Some(reading.relative_humidity)),
            Err(err) => {
                warn!("failed to read DHT22: {err:?}");
                (None, None)
            }
        }
    }
}

impl EnvironmentSensors for EspSensors {
    fn read(&mut self) -> SensorReadings {
        let (temperature, humidity) = self.read_climate();
        let light_level = match self.light.read_raw() {
            Ok(raw) => Some(raw),
            Err(err) => {
                warn!("failed to read light sensor: {err:?}");
                None
            }
        };

        SensorReadings {
            temperature,
            humidity,
            pressure: None,
            light_level,
            motion_detected: Some(self.motion.is_high()),
        }
    }
}
