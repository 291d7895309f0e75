use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    SmartLight,
    SmartSwitch,
    SensorNode,
    Gateway,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SmartLight => "smart_light",
            Self::SmartSwitch => "smart_switch",
            Self::SensorNode => "sensor_node",
            Self::Gateway => "gateway",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::SmartLight => "Smart Light",
            Self::SmartSwitch => "Smart Switch",
            Self::SensorNode => "Sensor Node",
            Self::Gateway => "Arduino Gateway",
        }
    }

    /// The wired gateway has no flash partition to update into.
    pub fn supports_ota(self) -> bool {
        !matches!(self, Self::Gateway)
    }

    /// WiFi boards report `free_heap` and `wifi_rssi`; the wired gateway
    /// reports `free_memory` instead.
    pub fn is_wireless(self) -> bool {
        !matches!(self, Self::Gateway)
    }

    /// Tag stored next to the persisted record so a record written by one
    /// device type is never decoded as another.
    pub fn storage_tag(self) -> u8 {
        match self {
            Self::SmartLight => 1,
            Self::SmartSwitch => 2,
            Self::SensorNode => 3,
            Self::Gateway => 4,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "smart_light" | "light" => Ok(Self::SmartLight),
            "smart_switch" | "switch" => Ok(Self::SmartSwitch),
            "sensor_node" | "sensor" => Ok(Self::SensorNode),
            "gateway" => Ok(Self::Gateway),
            _ => Err(IdentityError::UnknownKind(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Lowercase hex without separators, e.g. `a1b2c3d4e5f6`.
    pub fn compact_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || IdentityError::InvalidMac(value.to_string());
        let parts: Vec<&str> = value.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0_u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

/// Who this unit is. Built once at boot and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
    kind: DeviceKind,
    firmware_version: String,
    mac: MacAddress,
}

impl DeviceIdentity {
    /// Derives `<kind>_<mac hex>`, which is unique per board and topic-safe.
    pub fn from_mac(kind: DeviceKind, mac: MacAddress, firmware_version: impl Into<String>) -> Self {
        Self {
            device_id: format!("{}_{}", kind.as_str(), mac.compact_hex()),
            kind,
            firmware_version: firmware_version.into(),
            mac,
        }
    }

    pub fn with_device_id(
        kind: DeviceKind,
        device_id: impl Into<String>,
        mac: MacAddress,
        firmware_version: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let device_id = device_id.into();
        if !is_topic_safe(&device_id) {
            return Err(IdentityError::NotTopicSafe(device_id));
        }
        Ok(Self {
            device_id,
            kind,
            firmware_version: firmware_version.into(),
            mac,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn device_type(&self) -> &'static str {
        self.kind.display_name()
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }
}

/// Lowercase alphanumerics plus `_` and `-`: nothing that collides with the
/// topic delimiter or MQTT wildcards.
pub fn is_topic_safe(device_id: &str) -> bool {
    !device_id.is_empty()
        && device_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddress = MacAddress([0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]);

    #[test]
    fn device_id_is_derived_from_mac() {
        let identity = DeviceIdentity::from_mac(DeviceKind::SmartLight, MAC, "1.0.0");

        assert_eq!(identity.device_id(), "smart_light_a1b2c3d4e5f6");
        assert_eq!(identity.device_type(), "Smart Light");
        assert!(is_topic_safe(identity.device_id()));
    }

    #[test]
    fn rejects_ids_that_break_topics() {
        for bad in ["", "Light", "a/b", "a+b", "a#", "with space"] {
            assert!(
                DeviceIdentity::with_device_id(DeviceKind::Gateway, bad, MAC, "1.0.0").is_err(),
                "{bad:?} should be rejected"
            );
        }
        assert!(DeviceIdentity::with_device_id(
            DeviceKind::Gateway,
            "arduino_gateway_001",
            MAC,
            "1.0.0"
        )
        .is_ok());
    }

    #[test]
    fn mac_parses_and_prints() {
        let mac: MacAddress = "de:ad:be:ef:fe:ed".parse().unwrap();
        assert_eq!(mac.to_string(), "DE:AD:BE:EF:FE:ED");
        assert_eq!(mac.compact_hex(), "deadbeeffeed");
        assert_eq!("DE-AD-BE-EF-FE-ED".parse::<MacAddress>().unwrap(), mac);
        assert!("de:ad:be:ef:fe".parse::<MacAddress>().is_err());
        assert!("zz:ad:be:ef:fe:ed".parse::<MacAddress>().is_err());
    }

    #[test]
    fn kind_parses_loosely() {
        assert_eq!("light".parse::<DeviceKind>().unwrap(), DeviceKind::SmartLight);
        assert_eq!("Smart-Switch".parse::<DeviceKind>().unwrap(), DeviceKind::SmartSwitch);
        assert!("toaster".parse::<DeviceKind>().is_err());
    }
}
