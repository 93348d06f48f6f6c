//! Error types for the bridge.

use crate::bus::BusError;
use crate::fieldbus::FieldBusError;
use crate::supervisor::BridgeState;
use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that reach the supervisor.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] maison_common::Error),

    /// Field-bus error.
    #[error("Field bus error: {0}")]
    FieldBus(#[from] FieldBusError),

    /// Message-bus error.
    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    /// Operation not allowed in the current lifecycle state.
    #[error("Bridge is {found}, expected {expected}")]
    InvalidState {
        expected: BridgeState,
        found: BridgeState,
    },
}
