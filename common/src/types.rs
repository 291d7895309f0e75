use serde::Serialize;

use crate::clock::Millis;

/// Exact payload registered as the session's last will.
pub const WILL_PAYLOAD: &str = r#"{"online":false}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub link: LinkState,
    pub session: SessionState,
}

impl ConnectivityState {
    pub fn can_publish(self) -> bool {
        self.link == LinkState::Connected && self.session == SessionState::Up
    }
}

/// Retained snapshot on the `status` topic.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload<'a> {
    pub device_id: &'a str,
    pub device_type: &'a str,
    pub firmware_version: &'a str,
    pub mac_address: String,
    pub ip_address: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_heap: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_memory: Option<u32>,
    pub uptime: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OnlinePayload {
    pub online: bool,
    pub timestamp: Millis,
}

/// Device fields flattened between the id and a `timestamp`.
#[derive(Debug, Clone, Serialize)]
pub struct StatePayload<'a, S> {
    pub device_id: &'a str,
    #[serde(flatten)]
    pub state: &'a S,
    pub timestamp: Millis,
}

/// Reply to an OTA `check` action.
#[derive(Debug, Clone, Serialize)]
pub struct VersionReport<'a> {
    pub device_id: &'a str,
    pub current_version: &'a str,
    pub status: &'static str,
}

impl<'a> VersionReport<'a> {
    pub fn ready(device_id: &'a str, current_version: &'a str) -> Self {
        Self {
            device_id,
            current_version,
            status: "ready_for_update",
        }
    }
}
