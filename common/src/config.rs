use serde::{Deserialize, Serialize};

use log::warn;

use crate::{
    identity::{is_topic_safe, DeviceKind},
    topics::DEFAULT_NAMESPACE,
};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 512;
pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Overrides the MAC-derived id; must be topic-safe.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Overrides the hardware MAC, e.g. for a wired board with a fixed address.
    #[serde(default)]
    pub mac: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::SmartLight,
            namespace: default_namespace(),
            device_id: None,
            mac: None,
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub keep_alive_secs: u16,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            keep_alive_secs: 60,
            use_static_ip: false,
            static_ip: None,
            gateway: None,
            subnet: None,
            dns: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub loop_interval_ms: u32,
    pub poll_interval_ms: u32,
    pub state_publish_interval_ms: u32,
    pub heartbeat_interval_ms: u32,
    pub max_connect_attempts: u32,
    pub connect_retry_delay_ms: u32,
    pub restart_delay_ms: u32,
    pub ota_restart_delay_ms: u32,
    pub button_debounce_ms: u32,
    pub watchdog_timeout_secs: u32,
    pub ota_progress_step: u8,
    pub inbound_budget: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 100,
            poll_interval_ms: 5_000,
            state_publish_interval_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            max_connect_attempts: 20,
            connect_retry_delay_ms: 500,
            restart_delay_ms: 1_000,
            ota_restart_delay_ms: 2_000,
            button_debounce_ms: 50,
            watchdog_timeout_secs: 30,
            ota_progress_step: 10,
            inbound_budget: 8,
        }
    }
}

impl TimingConfig {
    /// Cadences each board shipped with.
    pub fn for_kind(kind: DeviceKind) -> Self {
        let base = Self::default();
        match kind {
            DeviceKind::SmartLight | DeviceKind::SmartSwitch => base,
            DeviceKind::SensorNode => Self {
                loop_interval_ms: 1_000,
                state_publish_interval_ms: 30_000,
                heartbeat_interval_ms: 60_000,
                ..base
            },
            DeviceKind::Gateway => Self {
                state_publish_interval_ms: 30_000,
                ..base
            },
        }
    }

    pub fn sanitize(&mut self) {
        self.loop_interval_ms = self.loop_interval_ms.clamp(10, 10_000);
        self.poll_interval_ms = self.poll_interval_ms.max(100);
        self.state_publish_interval_ms = self.state_publish_interval_ms.max(100);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(1_000);
        self.max_connect_attempts = self.max_connect_attempts.max(1);
        self.button_debounce_ms = self.button_debounce_ms.min(1_000);
        self.watchdog_timeout_secs = self.watchdog_timeout_secs.clamp(5, 300);
        self.ota_progress_step = self.ota_progress_step.clamp(1, 100);
        self.inbound_budget = self.inbound_budget.clamp(1, 64);
    }
}

/// The `timing` block as written in the config file. Fields left out keep
/// the cadence of the configured device kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingOverrides {
    pub loop_interval_ms: Option<u32>,
    pub poll_interval_ms: Option<u32>,
    pub state_publish_interval_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    pub max_connect_attempts: Option<u32>,
    pub connect_retry_delay_ms: Option<u32>,
    pub restart_delay_ms: Option<u32>,
    pub ota_restart_delay_ms: Option<u32>,
    pub button_debounce_ms: Option<u32>,
    pub watchdog_timeout_secs: Option<u32>,
    pub ota_progress_step: Option<u8>,
    pub inbound_budget: Option<usize>,
}

impl TimingOverrides {
    pub fn apply(&self, base: TimingConfig) -> TimingConfig {
        TimingConfig {
            loop_interval_ms: self.loop_interval_ms.unwrap_or(base.loop_interval_ms),
            poll_interval_ms: self.poll_interval_ms.unwrap_or(base.poll_interval_ms),
            state_publish_interval_ms: self.state_publish_interval_ms.unwrap_or(base.state_publish_interval_ms),
            heartbeat_interval_ms: self.heartbeat_interval_ms.unwrap_or(base.heartbeat_interval_ms),
            max_connect_attempts: self.max_connect_attempts.unwrap_or(base.max_connect_attempts),
            connect_retry_delay_ms: self.connect_retry_delay_ms.unwrap_or(base.connect_retry_delay_ms),
            restart_delay_ms: self.restart_delay_ms.unwrap_or(base.restart_delay_ms),
            ota_restart_delay_ms: self.ota_restart_delay_ms.unwrap_or(base.ota_restart_delay_ms),
            button_debounce_ms: self.button_debounce_ms.unwrap_or(base.button_debounce_ms),
            watchdog_timeout_secs: self.watchdog_timeout_secs.unwrap_or(base.watchdog_timeout_secs),
            ota_progress_step: self.ota_progress_step.unwrap_or(base.ota_progress_step),
            inbound_budget: self.inbound_budget.unwrap_or(base.inbound_budget),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timing: TimingOverrides,
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

impl RuntimeConfig {
    pub fn for_kind(kind: DeviceKind) -> Self {
        Self {
            device: DeviceConfig {
                kind,
                ..DeviceConfig::default()
            },
            network: NetworkConfig::default(),
            timing: TimingOverrides::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Kind defaults with the configured overrides applied, sanitized.
    pub fn timing(&self) -> TimingConfig {
        let mut timing = self.timing.apply(TimingConfig::for_kind(self.device.kind));
        timing.sanitize();
        timing
    }

    pub fn sanitize(&mut self) {
        let namespace = self.device.namespace.trim().trim_matches('/');
        self.device.namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else if !namespace.split('/').all(is_topic_safe) {
            warn!("namespace `{namespace}` is not topic-safe, using {DEFAULT_NAMESPACE}");
            DEFAULT_NAMESPACE.to_string()
        } else {
            namespace.to_string()
        };

        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = DEFAULT_MQTT_PORT;
        }
        self.network.keep_alive_secs = self.network.keep_alive_secs.clamp(5, 600);

        self.max_payload_bytes = self.max_payload_bytes.clamp(64, 4_096);
    }
}
