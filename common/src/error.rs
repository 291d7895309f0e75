use thiserror::Error;

/// Why an inbound command payload was dropped. Never fatal: the node logs the
/// error and carries on with its state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("malformed payload: {0}")]
    ParseFailure(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("mqtt session is down")]
    SessionDown,
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("device has no `{0}` topic")]
    NoTopic(&'static str),
    #[error("mqtt client rejected publish: {0}")]
    Client(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("transport connect failed: {0}")]
    Transport(String),
    #[error("mqtt session connect failed: {0}")]
    Session(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("an update is already in progress")]
    Busy,
    #[error("update request carries no firmware url")]
    MissingUrl,
    #[error("unknown ota action `{0}`")]
    UnknownAction(String),
    #[error(transparent)]
    Request(#[from] CommandError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("record needs {needed} bytes but the store holds {capacity}")]
    OutOfRange { needed: usize, capacity: usize },
    #[error("commit failed: {0}")]
    Commit(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("device id `{0}` is not topic-safe")]
    NotTopicSafe(String),
    #[error("`{0}` is not a MAC address")]
    InvalidMac(String),
    #[error("unknown device kind `{0}`")]
    UnknownKind(String),
}
