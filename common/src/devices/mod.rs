use core::fmt::Debug;

use serde::Serialize;

use crate::{command::CommandSpec, identity::DeviceKind};

pub mod gateway;
pub mod light;
pub mod sensor;
pub mod switch;

pub use gateway::{Gateway, GatewayIo, GatewayReadings};
pub use light::{LightDriver, LightOutput, SmartLight};
pub use sensor::{EnvironmentSensors, SensorNode, SensorReadings};
pub use switch::{RelayDriver, SmartSwitch};

/// One device type: its state record, how that record is laid out in
/// non-volatile storage, which commands it answers, and how it maps onto its
/// peripherals.
pub trait DeviceModel: Clone + Default + PartialEq + Debug + Serialize + 'static {
    const KIND: DeviceKind;
    /// Bumped whenever the persisted record layout changes.
    const LAYOUT_VERSION: u8;
    const RECORD_LEN: usize;
    /// Whether the node should register the periodic peripheral poll.
    const HAS_SENSORS: bool = false;

    /// Peripheral driver the model writes outputs to and reads inputs from.
    type Io: ?Sized;

    fn commands() -> &'static [CommandSpec<Self>];

    /// Writes the persisted subset into `record` (exactly `RECORD_LEN` bytes).
    fn encode(&self, record: &mut [u8]);

    /// Rebuilds a model from `record`, sanitizing out-of-range values.
    fn decode(record: &[u8]) -> Self;

    fn drive_outputs(&self, io: &mut Self::Io);

    fn poll_inputs(&mut self, _io: &mut Self::Io) {}

    /// Local button press. Returns true when it changed the state.
    fn on_button(&mut self) -> bool {
        false
    }
}

/// The node's single copy of the device record plus its unsaved-change flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState<M> {
    model: M,
    dirty: bool,
}

impl<M: DeviceModel> DeviceState<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            dirty: false,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Replaces the record after a successful command mutation.
    pub fn replace(&mut self, model: M) {
        self.model = model;
        self.dirty = true;
    }

    /// Applies a local-input change; marks dirty only if `f` reports one.
    pub fn apply_local(&mut self, f: impl FnOnce(&mut M) -> bool) -> bool {
        let changed = f(&mut self.model);
        self.dirty |= changed;
        changed
    }

    /// Refreshes sensor readings. Readings are never persisted, so this does
    /// not touch the dirty flag.
    pub fn refresh(&mut self, io: &mut M::Io) {
        self.model.poll_inputs(io);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}
