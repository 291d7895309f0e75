use log::warn;
use serde_json::{Map, Value};

use crate::{
    devices::{DeviceModel, DeviceState},
    error::CommandError,
};

pub type Parameters = Map<String, Value>;

/// Applies a command to a scratch copy of the model. An `Err` discards the
/// copy, so a rejected command never leaves a half-applied record behind.
pub type MutateFn<M> = fn(&mut M, &Parameters) -> Result<(), CommandError>;

pub enum CommandAction<M> {
    Mutate(MutateFn<M>),
    ReportStatus,
    RefreshSensors,
    Restart,
}

/// One row of a device's capability table.
pub struct CommandSpec<M> {
    pub name: &'static str,
    pub action: CommandAction<M>,
}

impl<M> CommandSpec<M> {
    pub const fn mutate(name: &'static str, apply: MutateFn<M>) -> Self {
        Self {
            name,
            action: CommandAction::Mutate(apply),
        }
    }

    pub const fn new(name: &'static str, action: CommandAction<M>) -> Self {
        Self { name, action }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command: String,
    pub parameters: Parameters,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters: Parameters::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }
}

/// What the node still has to do once the dispatcher has run a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Ignored { command: String },
    /// State changed: drive outputs, publish `state`, persist.
    Mutated,
    ReportStatus,
    RefreshSensors,
    Restart,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandDispatcher {
    max_payload: usize,
}

impl CommandDispatcher {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn parse(&self, payload: &[u8]) -> Result<CommandRequest, CommandError> {
        let mut object = decode_object(payload, self.max_payload)?;

        let command = match object.remove("command") {
            Some(Value::String(command)) => command,
            _ => return Err(CommandError::MissingField("command")),
        };
        let parameters = match object.remove("parameters") {
            None | Some(Value::Null) => Parameters::new(),
            Some(Value::Object(parameters)) => parameters,
            Some(_) => {
                return Err(CommandError::InvalidParameter {
                    name: "parameters",
                    reason: "expected an object",
                })
            }
        };

        Ok(CommandRequest {
            command,
            parameters,
        })
    }

    pub fn handle<M: DeviceModel>(
        &self,
        state: &mut DeviceState<M>,
        payload: &[u8],
    ) -> Result<CommandOutcome, CommandError> {
        let request = self.parse(payload)?;
        self.execute(state, &request)
    }

    pub fn execute<M: DeviceModel>(
        &self,
        state: &mut DeviceState<M>,
        request: &CommandRequest,
    ) -> Result<CommandOutcome, CommandError> {
        let Some(spec) = M::commands()
            .iter()
            .find(|spec| spec.name == request.command)
        else {
            warn!(
                "{} ignores unknown command `{}`",
                M::KIND,
                request.command
            );
            return Ok(CommandOutcome::Ignored {
                command: request.command.clone(),
            });
        };

        match &spec.action {
            CommandAction::Mutate(apply) => {
                let mut next = state.model().clone();
                apply(&mut next, &request.parameters)?;
                state.replace(next);
                Ok(CommandOutcome::Mutated)
            }
            CommandAction::ReportStatus => Ok(CommandOutcome::ReportStatus),
            CommandAction::RefreshSensors => Ok(CommandOutcome::RefreshSensors),
            CommandAction::Restart => Ok(CommandOutcome::Restart),
        }
    }
}

/// Size-checks then parses `payload` as a JSON object.
pub(crate) fn decode_object(payload: &[u8], limit: usize) -> Result<Parameters, CommandError> {
    if payload.len() > limit {
        return Err(CommandError::PayloadTooLarge {
            size: payload.len(),
            limit,
        });
    }

    match serde_json::from_slice(payload) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(CommandError::ParseFailure("expected a JSON object".to_string())),
        Err(err) => Err(CommandError::ParseFailure(err.to_string())),
    }
}

pub fn require_bool(parameters: &Parameters, name: &'static str) -> Result<bool, CommandError> {
    match parameters.get(name) {
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(CommandError::InvalidParameter {
            name,
            reason: "expected a boolean",
        }),
        None => Err(CommandError::InvalidParameter {
            name,
            reason: "missing",
        }),
    }
}

/// Integers pass through; fractional numbers are truncated toward zero.
pub fn require_int(parameters: &Parameters, name: &'static str) -> Result<i64, CommandError> {
    let invalid = |reason| CommandError::InvalidParameter { name, reason };
    let Some(value) = parameters.get(name) else {
        return Err(invalid("missing"));
    };
    let Value::Number(number) = value else {
        return Err(invalid("expected a number"));
    };

    if let Some(value) = number.as_i64() {
        Ok(value)
    } else if let Some(value) = number.as_u64() {
        Ok(i64::try_from(value).unwrap_or(i64::MAX))
    } else {
        number
            .as_f64()
            .map(|value| value as i64)
            .ok_or_else(|| invalid("expected a number"))
    }
}

pub fn clamp_percent(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

pub fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::devices::{SmartLight, SmartSwitch};

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(512)
    }

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn oversized_payload_is_rejected_before_parsing() {
        let mut state = DeviceState::new(SmartSwitch::default());
        let payload = vec![b' '; 513];

        assert_eq!(
            dispatcher().handle(&mut state, &payload),
            Err(CommandError::PayloadTooLarge {
                size: 513,
                limit: 512
            })
        );
    }

    #[test]
    fn malformed_and_non_object_payloads_fail_to_parse() {
        let mut state = DeviceState::new(SmartSwitch::default());

        for payload in [&b"{not json"[..], &b"[1,2,3]"[..], &b"\"toggle\""[..]] {
            assert!(matches!(
                dispatcher().handle(&mut state, payload),
                Err(CommandError::ParseFailure(_))
            ));
        }
    }

    #[test]
    fn command_field_is_required_and_must_be_a_string() {
        let mut state = DeviceState::new(SmartSwitch::default());

        assert_eq!(
            dispatcher().handle(&mut state, br#"{"parameters":{}}"#),
            Err(CommandError::MissingField("command"))
        );
        assert_eq!(
            dispatcher().handle(&mut state, br#"{"command":7}"#),
            Err(CommandError::MissingField("command"))
        );
    }

    #[test]
    fn non_object_parameters_are_invalid() {
        let mut state = DeviceState::new(SmartSwitch::default());

        assert_eq!(
            dispatcher().handle(&mut state, br#"{"command":"set_power","parameters":[true]}"#),
            Err(CommandError::InvalidParameter {
                name: "parameters",
                reason: "expected an object"
            })
        );
    }

    #[test]
    fn unknown_command_is_ignored_without_mutation() {
        let mut state = DeviceState::new(SmartLight::default());
        let before = state.clone();

        let outcome = dispatcher()
            .handle(&mut state, br#"{"command":"self_destruct"}"#)
            .unwrap();

        assert_eq!(
            outcome,
            CommandOutcome::Ignored {
                command: "self_destruct".to_string()
            }
        );
        assert_eq!(state, before);
    }

    #[test]
    fn failed_mutation_leaves_state_untouched() {
        let mut state = DeviceState::new(SmartLight::default());
        let before = state.clone();

        let result = dispatcher().handle(
            &mut state,
            br#"{"command":"set_color","parameters":{"r":10,"g":20}}"#,
        );

        assert_eq!(
            result,
            Err(CommandError::InvalidParameter {
                name: "b",
                reason: "missing"
            })
        );
        assert_eq!(state, before);
        assert!(!state.is_dirty());
    }

    #[test]
    fn mutation_marks_state_dirty() {
        let mut state = DeviceState::new(SmartSwitch::default());

        let outcome = dispatcher()
            .handle(&mut state, br#"{"command":"toggle"}"#)
            .unwrap();

        assert_eq!(outcome, CommandOutcome::Mutated);
        assert!(state.model().power);
        assert!(state.is_dirty());
    }

    #[test]
    fn int_parameters_accept_whole_and_fractional_numbers() {
        let parameters = params(json!({ "a": 42, "b": 99.9, "c": "7", "d": -3 }));

        assert_eq!(require_int(&parameters, "a"), Ok(42));
        assert_eq!(require_int(&parameters, "b"), Ok(99));
        assert_eq!(require_int(&parameters, "d"), Ok(-3));
        assert!(require_int(&parameters, "c").is_err());
        assert!(require_int(&parameters, "missing").is_err());
    }

    #[test]
    fn bool_parameters_are_strict() {
        let parameters = params(json!({ "on": true, "one": 1 }));

        assert_eq!(require_bool(&parameters, "on"), Ok(true));
        assert!(require_bool(&parameters, "one").is_err());
    }
}
