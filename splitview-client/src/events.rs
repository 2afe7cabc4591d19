use serde::Serialize;
use splitview_core::{PairId, Role};
use thiserror::Error;

/// Why a pairing or push attempt did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    NoSource,
    NoTarget,
    NotIdle,
    InvalidPayload,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoSource => "no-source",
            FailureReason::NoTarget => "no-target",
            FailureReason::NotIdle => "not-idle",
            FailureReason::InvalidPayload => "invalid-payload",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a tab reports to whatever renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TabEvent {
    RoleChanged { role: Role, pair_id: Option<PairId> },
    MuteChanged { muted: bool },
    PairingFailed { reason: FailureReason },
    NavigationApplied { url: String },
    Notice { message: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("no source tab has been created yet")]
    NoSource,
    #[error("no live target tab for this pair")]
    NoTarget,
    #[error("tab already holds role {0}")]
    NotIdle(Role),
    #[error("tab is not paired")]
    NotPaired,
    #[error("invalid drag payload: {0}")]
    InvalidPayload(String),
}

impl PairingError {
    /// The user-visible reason, if this failure is reported to the UI.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            PairingError::NoSource => Some(FailureReason::NoSource),
            PairingError::NoTarget => Some(FailureReason::NoTarget),
            PairingError::NotIdle(_) => Some(FailureReason::NotIdle),
            PairingError::InvalidPayload(_) => Some(FailureReason::InvalidPayload),
            PairingError::NotPaired => None,
        }
    }
}
