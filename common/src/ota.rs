use log::{info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::{
    command::decode_object,
    error::{CommandError, OtaError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaState {
    Idle,
    Requested,
    InProgress,
    Succeeded,
    Failed,
    NoUpdateAvailable,
}

impl OtaState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::NoUpdateAvailable
        )
    }
}

/// Result of one blocking transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaOutcome {
    Success,
    Failed(String),
    NoUpdateAvailable,
}

/// Downloads and flashes an image. Blocks until the transfer is over and
/// reports percentage progress through `progress`.
pub trait OtaTransport {
    fn update(&mut self, url: &str, progress: &mut dyn FnMut(u8)) -> OtaOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaJob {
    pub state: OtaState,
    pub url: String,
    pub progress: u8,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaRequest {
    Update { url: String },
    Check,
}

/// Published to `status` (not retained) while an update runs and once it ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtaReport {
    pub device_id: String,
    pub status: &'static str,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub const STATUS_UPDATING: &str = "updating";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_NO_UPDATE: &str = "no_update";

#[derive(Debug)]
pub struct OtaStateMachine {
    device_id: String,
    max_payload: usize,
    progress_step: u8,
    job: Option<OtaJob>,
}

impl OtaStateMachine {
    pub fn new(device_id: impl Into<String>, max_payload: usize, progress_step: u8) -> Self {
        Self {
            device_id: device_id.into(),
            max_payload,
            progress_step: progress_step.max(1),
            job: None,
        }
    }

    pub fn state(&self) -> OtaState {
        self.job.as_ref().map_or(OtaState::Idle, |job| job.state)
    }

    pub fn job(&self) -> Option<&OtaJob> {
        self.job.as_ref()
    }

    pub fn parse_request(&self, payload: &[u8]) -> Result<OtaRequest, OtaError> {
        let object = decode_object(payload, self.max_payload)?;

        match object.get("action") {
            Some(Value::String(action)) if action == "update" => {
                let url = object
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(OtaRequest::Update { url })
            }
            Some(Value::String(action)) if action == "check" => Ok(OtaRequest::Check),
            Some(Value::String(action)) => Err(OtaError::UnknownAction(action.clone())),
            _ => Err(CommandError::MissingField("action").into()),
        }
    }

    /// Accepts a job unless one is already pending or running.
    pub fn request_update(&mut self, url: &str) -> Result<(), OtaError> {
        if matches!(self.state(), OtaState::Requested | OtaState::InProgress) {
            return Err(OtaError::Busy);
        }
        let url = url.trim();
        if url.is_empty() {
            return Err(OtaError::MissingUrl);
        }

        info!("ota update requested from {url}");
        self.job = Some(OtaJob {
            state: OtaState::Requested,
            url: url.to_string(),
            progress: 0,
            last_error: None,
        });
        Ok(())
    }

    /// `Requested -> InProgress`. Returns the report to publish before the
    /// transfer starts.
    pub fn begin(&mut self) -> Option<OtaReport> {
        let job = self.job.as_mut()?;
        if job.state != OtaState::Requested {
            return None;
        }
        job.state = OtaState::InProgress;
        job.progress = 0;
        Some(self.report(STATUS_UPDATING, 0, None))
    }

    /// Runs the transfer for an `InProgress` job and returns the terminal
    /// report. `on_progress` runs on every transport callback; it carries an
    /// `updating` report only when progress advanced by the configured step.
    pub fn run_step<T>(
        &mut self,
        transport: &mut T,
        mut on_progress: impl FnMut(Option<OtaReport>),
    ) -> Option<OtaReport>
    where
        T: OtaTransport + ?Sized,
    {
        let url = match &self.job {
            Some(job) if job.state == OtaState::InProgress => job.url.clone(),
            _ => return None,
        };

        let step = self.progress_step;
        let mut latest = 0_u8;
        let mut reported = 0_u8;
        let outcome = transport.update(&url, &mut |percent: u8| {
            latest = percent.min(100);
            if latest >= reported.saturating_add(step) {
                reported = latest;
                on_progress(Some(self.report(STATUS_UPDATING, latest, None)));
            } else {
                on_progress(None);
            }
        });

        let (state, status, progress, error) = match outcome {
            OtaOutcome::Success => (OtaState::Succeeded, STATUS_SUCCESS, 100, None),
            OtaOutcome::Failed(reason) => {
                warn!("ota update from {url} failed: {reason}");
                (OtaState::Failed, STATUS_FAILED, latest, Some(reason))
            }
            OtaOutcome::NoUpdateAvailable => {
                (OtaState::NoUpdateAvailable, STATUS_NO_UPDATE, latest, None)
            }
        };
        info!("ota finished: {status}");

        let report = self.report(status, progress, error.clone());
        if let Some(job) = self.job.as_mut() {
            job.state = state;
            job.progress = progress;
            job.last_error = error;
        }
        Some(report)
    }

    /// Drops a finished job, returning the terminal state it ended in.
    pub fn complete(&mut self) -> Option<OtaState> {
        let state = self.job.as_ref()?.state;
        if !state.is_terminal() {
            return None;
        }
        self.job = None;
        Some(state)
    }

    fn report(&self, status: &'static str, progress: u8, error: Option<String>) -> OtaReport {
        OtaReport {
            device_id: self.device_id.clone(),
            status,
            progress,
            error,
        }
    }
}
