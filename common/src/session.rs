use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    clock::Millis,
    error::{ConnectError, PublishError},
    topics::{TopicKind, TopicSet},
    types::{LinkState, OnlinePayload, SessionState, WILL_PAYLOAD},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// `None` when no username is configured; the broker is then anonymous.
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        (!username.is_empty()).then(|| Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// Everything the broker sees in CONNECT, will included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive_secs: u16,
    pub will: LastWill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub trait MqttClient {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), ConnectError>;
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), ConnectError>;
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError>;
    fn poll_incoming(&mut self) -> Option<InboundMessage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'p> {
    Command(&'p [u8]),
    Ota(&'p [u8]),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Unchanged,
    Established,
    Lost,
    Failed,
}

pub struct MqttSessionManager<C> {
    client: C,
    topics: TopicSet,
    options: SessionOptions,
    state: SessionState,
    established_at: Option<Millis>,
}

impl<C: MqttClient> MqttSessionManager<C> {
    pub fn new(
        client: C,
        topics: TopicSet,
        client_id: impl Into<String>,
        credentials: Option<Credentials>,
        keep_alive_secs: u16,
    ) -> Self {
        let will = LastWill {
            topic: topics.online().to_string(),
            payload: WILL_PAYLOAD.as_bytes().to_vec(),
            qos: Qos::AtLeastOnce,
            retain: true,
        };
        Self {
            client,
            options: SessionOptions {
                client_id: client_id.into(),
                credentials,
                keep_alive_secs,
                will,
            },
            topics,
            state: SessionState::Down,
            established_at: None,
        }
    }

    /// Brings the session up when the link allows it. `status` renders the
    /// retained status snapshot published right after the session comes up.
    pub fn ensure_session<S: Serialize>(
        &mut self,
        link: LinkState,
        now: Millis,
        status: impl FnOnce() -> S,
    ) -> SessionEvent {
        if link != LinkState::Connected {
            return self.mark_down("transport down");
        }
        if self.state == SessionState::Up {
            if self.client.is_connected() {
                return SessionEvent::Unchanged;
            }
            return self.mark_down("broker connection lost");
        }

        if let Err(err) = self.client.connect(&self.options) {
            warn!("mqtt connect as {} failed: {err}", self.options.client_id);
            return SessionEvent::Failed;
        }
        self.state = SessionState::Up;
        self.established_at = Some(now);
        info!("mqtt session up as {}", self.options.client_id);

        for topic in self.topics.subscriptions() {
            if let Err(err) = self.client.subscribe(topic, Qos::AtMostOnce) {
                warn!("subscribe to {topic} failed: {err}");
            }
        }

        let online = OnlinePayload {
            online: true,
            timestamp: now,
        };
        if let Err(err) = self.publish_json(TopicKind::Online, &online, true) {
            warn!("online announcement failed: {err}");
        }
        if let Err(err) = self.publish_json(TopicKind::Status, &status(), true) {
            warn!("status announcement failed: {err}");
        }

        SessionEvent::Established
    }

    /// Sends with QoS 0. Nothing is queued while the session is down.
    pub fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), PublishError> {
        Self::send(&mut self.client, &mut self.state, topic, payload, retained)
    }

    pub fn publish_json<T: Serialize + ?Sized>(
        &mut self,
        kind: TopicKind,
        value: &T,
        retained: bool,
    ) -> Result<(), PublishError> {
        let topic = self
            .topics
            .get(kind)
            .ok_or(PublishError::NoTopic(kind.suffix()))?;
        let payload =
            serde_json::to_vec(value).map_err(|err| PublishError::Encode(err.to_string()))?;
        Self::send(&mut self.client, &mut self.state, topic, &payload, retained)
    }

    pub fn poll_incoming(&mut self) -> Option<InboundMessage> {
        self.client.poll_incoming()
    }

    /// Routes by exact topic match.
    pub fn dispatch_incoming<'p>(&self, topic: &str, payload: &'p [u8]) -> Route<'p> {
        if topic == self.topics.command() {
            Route::Command(payload)
        } else if self.topics.ota() == Some(topic) {
            Route::Ota(payload)
        } else {
            Route::Ignored
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == SessionState::Up
    }

    pub fn established_at(&self) -> Option<Millis> {
        self.established_at
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn into_client(self) -> C {
        self.client
    }

    fn mark_down(&mut self, reason: &str) -> SessionEvent {
        if self.state == SessionState::Down {
            return SessionEvent::Unchanged;
        }
        warn!("mqtt session down: {reason}");
        self.state = SessionState::Down;
        self.established_at = None;
        SessionEvent::Lost
    }

    fn send(
        client: &mut C,
        state: &mut SessionState,
        topic: &str,
        payload: &[u8],
        retained: bool,
    ) -> Result<(), PublishError> {
        if *state == SessionState::Down {
            debug!("dropping publish to {topic}: session down");
            return Err(PublishError::SessionDown);
        }
        client
            .publish(topic, payload, Qos::AtMostOnce, retained)
            .inspect_err(|err| {
                warn!("publish to {topic} failed: {err}");
                *state = SessionState::Down;
            })
    }
}
