pub mod clock;
pub mod command;
pub mod config;
pub mod connectivity;
pub mod devices;
pub mod error;
pub mod identity;
pub mod input;
pub mod node;
pub mod ota;
pub mod persistence;
pub mod scheduler;
pub mod session;
pub mod system;
pub mod topics;
pub mod types;

pub use clock::{Millis, MonotonicClock};
pub use command::{CommandDispatcher, CommandOutcome, CommandRequest};
pub use config::{DeviceConfig, NetworkConfig, RuntimeConfig, TimingConfig, TimingOverrides};
pub use connectivity::{AttemptPolicy, ConnectivitySupervisor, Transport};
pub use devices::{DeviceModel, DeviceState, Gateway, SensorNode, SmartLight, SmartSwitch};
pub use error::{CommandError, ConnectError, IdentityError, OtaError, PublishError, StorageError};
pub use identity::{DeviceIdentity, DeviceKind, MacAddress};
pub use input::InputFlag;
pub use node::{Node, NodeSnapshot, Platform, PlatformParts, TickOutcome};
pub use ota::{OtaOutcome, OtaState, OtaStateMachine, OtaTransport};
pub use persistence::{NvStore, StatePersistence};
pub use scheduler::HeartbeatScheduler;
pub use session::{InboundMessage, MqttClient, MqttSessionManager, Qos, SessionOptions};
pub use system::System;
pub use topics::TopicSet;
pub use types::{ConnectivityState, LinkState, SessionState};
