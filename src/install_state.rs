//! Install State Machine
//!
//! Authoritative state of one logical install attempt. Transitions are validated
//! so an attempt cannot start while another is running, and a terminal state
//! cannot be reached without first being `InProgress`.
//!
//! # State Flow
//!
//! ```text
//! Idle ──begin──▶ InProgress ──succeed──▶ Success(package?)
//!   ▲                 │
//!   │                 └──────fail──────▶ Failure(message)
//!   └────────────── begin (from a terminal state) ──┘
//! ```

use std::fmt;
use thiserror::Error;

/// State of the current install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstallState {
    /// Nothing has been attempted yet
    #[default]
    Idle,
    /// A backend is working, or we are waiting for a broadcast
    InProgress,
    /// Terminal: installed (package id when known)
    Success(Option<String>),
    /// Terminal: failed with a human-readable message
    Failure(String),
}

impl InstallState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failure(_))
    }

    #[inline]
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::InProgress => "InProgress",
            Self::Success(_) => "Success",
            Self::Failure(_) => "Failure",
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(Some(package)) => write!(f, "Success({package})"),
            Self::Failure(message) => write!(f, "Failure({message})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Item of the executor's status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallCompletionStatus {
    InProgress,
    Success { package_id: Option<String> },
    Failure { message: String },
}

impl InstallCompletionStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl From<&InstallState> for Option<InstallCompletionStatus> {
    fn from(state: &InstallState) -> Self {
        match state {
            InstallState::Idle => None,
            InstallState::InProgress => Some(InstallCompletionStatus::InProgress),
            InstallState::Success(package_id) => Some(InstallCompletionStatus::Success {
                package_id: package_id.clone(),
            }),
            InstallState::Failure(message) => Some(InstallCompletionStatus::Failure {
                message: message.clone(),
            }),
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallTransitionError {
    /// A second attempt was started while one is running
    #[error("An install is already in progress")]
    AlreadyInProgress,

    /// A terminal transition was requested outside of `InProgress`
    #[error("Cannot transition from {from} to {to} (no install in progress)")]
    NotInProgress { from: String, to: &'static str },
}

/// Owns the state of one logical install target and records its history.
#[derive(Debug, Clone, Default)]
pub struct InstallStateMachine {
    current: InstallState,
    /// (state, unix timestamp) of every transition
    history: Vec<(InstallState, u64)>,
}

impl InstallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn current(&self) -> &InstallState {
        &self.current
    }

    pub fn history(&self) -> &[(InstallState, u64)] {
        &self.history
    }

    /// Enter `InProgress`.
    ///
    /// # Errors
    ///
    /// - `AlreadyInProgress` if an attempt is running
    pub fn begin(&mut self) -> Result<(), InstallTransitionError> {
        if self.current.is_in_progress() {
            return Err(InstallTransitionError::AlreadyInProgress);
        }
        self.record(InstallState::InProgress);
        Ok(())
    }

    /// # Errors
    ///
    /// - `NotInProgress` unless the machine is `InProgress`
    pub fn succeed(&mut self, package_id: Option<String>) -> Result<(), InstallTransitionError> {
        self.ensure_in_progress("Success")?;
        self.record(InstallState::Success(package_id));
        Ok(())
    }

    /// # Errors
    ///
    /// - `NotInProgress` unless the machine is `InProgress`
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), InstallTransitionError> {
        self.ensure_in_progress("Failure")?;
        self.record(InstallState::Failure(message.into()));
        Ok(())
    }

    /// Back to `Idle`, clearing history.
    pub fn reset(&mut self) {
        self.current = InstallState::Idle;
        self.history.clear();
    }

    fn ensure_in_progress(&self, to: &'static str) -> Result<(), InstallTransitionError> {
        if self.current.is_in_progress() {
            Ok(())
        } else {
            Err(InstallTransitionError::NotInProgress {
                from: self.current.to_string(),
                to,
            })
        }
    }

    fn record(&mut self, state: InstallState) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        log::debug!("Install state: {} -> {}", self.current, state);
        self.history.push((state.clone(), timestamp));
        self.current = state;
    }
}

impl From<InstallTransitionError> for crate::error::InstallError {
    fn from(err: InstallTransitionError) -> Self {
        crate::error::InstallError::State(err.to_string())
    }
}
