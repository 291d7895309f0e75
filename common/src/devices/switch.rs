use serde::Serialize;

use crate::{
    command::{require_bool, CommandAction, CommandSpec, Parameters},
    devices::DeviceModel,
    error::CommandError,
    identity::DeviceKind,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SmartSwitch {
    pub power: bool,
}

pub trait RelayDriver {
    fn set_relay(&mut self, on: bool);
}

fn set_power(switch: &mut SmartSwitch, parameters: &Parameters) -> Result<(), CommandError> {
    switch.power = require_bool(parameters, "power")?;
    Ok(())
}

fn toggle(switch: &mut SmartSwitch, _: &Parameters) -> Result<(), CommandError> {
    switch.power = !switch.power;
    Ok(())
}

static COMMANDS: [CommandSpec<SmartSwitch>; 4] = [
    CommandSpec::mutate("set_power", set_power),
    CommandSpec::mutate("toggle", toggle),
    CommandSpec::new("get_status", CommandAction::ReportStatus),
    CommandSpec::new("restart", CommandAction::Restart),
];

impl DeviceModel for SmartSwitch {
    const KIND: DeviceKind = DeviceKind::SmartSwitch;
    const LAYOUT_VERSION: u8 = 1;
    const RECORD_LEN: usize = 1;

    type Io = dyn RelayDriver;

    fn commands() -> &'static [CommandSpec<Self>] {
        &COMMANDS
    }

    fn encode(&self, record: &mut [u8]) {
        record[0] = u8::from(self.power);
    }

    fn decode(record: &[u8]) -> Self {
        Self {
            power: record.first() == Some(&1),
        }
    }

    fn drive_outputs(&self, io: &mut Self::Io) {
        io.set_relay(self.power);
    }

    fn on_button(&mut self) -> bool {
        self.power = !self.power;
        true
    }
}
