use core::fmt;

use crate::identity::DeviceIdentity;

pub const DEFAULT_NAMESPACE: &str = "homeautomation/devices";

pub const SUFFIX_STATUS: &str = "status";
pub const SUFFIX_STATE: &str = "state";
pub const SUFFIX_ONLINE: &str = "online";
pub const SUFFIX_COMMAND: &str = "command";
pub const SUFFIX_OTA: &str = "ota";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Status,
    State,
    Online,
    Command,
    Ota,
}

impl TopicKind {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Status => SUFFIX_STATUS,
            Self::State => SUFFIX_STATE,
            Self::Online => SUFFIX_ONLINE,
            Self::Command => SUFFIX_COMMAND,
            Self::Ota => SUFFIX_OTA,
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Every topic a device talks on, all under `<namespace>/<device_id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    prefix: String,
    status: String,
    state: String,
    online: String,
    command: String,
    ota: Option<String>,
}

impl TopicSet {
    pub fn new(namespace: &str, device_id: &str, with_ota: bool) -> Self {
        let namespace = namespace.trim_matches('/');
        let prefix = format!("{namespace}/{device_id}/");
        let topic = |suffix: &str| format!("{prefix}{suffix}");

        Self {
            status: topic(SUFFIX_STATUS),
            state: topic(SUFFIX_STATE),
            online: topic(SUFFIX_ONLINE),
            command: topic(SUFFIX_COMMAND),
            ota: with_ota.then(|| topic(SUFFIX_OTA)),
            prefix,
        }
    }

    pub fn for_identity(namespace: &str, identity: &DeviceIdentity) -> Self {
        Self::new(namespace, identity.device_id(), identity.kind().supports_ota())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn online(&self) -> &str {
        &self.online
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn ota(&self) -> Option<&str> {
        self.ota.as_deref()
    }

    pub fn get(&self, kind: TopicKind) -> Option<&str> {
        match kind {
            TopicKind::Status => Some(self.status()),
            TopicKind::State => Some(self.state()),
            TopicKind::Online => Some(self.online()),
            TopicKind::Command => Some(self.command()),
            TopicKind::Ota => self.ota(),
        }
    }

    /// Topics the session subscribes to once it is up.
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        core::iter::once(self.command()).chain(self.ota())
    }
}
