// Copyright 2024 Antonio Estévez
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use crate::message::MsgAddress;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the dispatcher kernel.
///
/// Programmer errors (reentered poll loop, unknown addresses, failed
/// lifecycle hooks) surface here and abort the operation at the call site.
/// Routing misses are not errors: `send` returns a delivery count of zero
/// and logs instead.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The blocking poll loop was entered while already running.
    #[error("The dispatcher poll loop is already running.")]
    AlreadyPolling,
    /// The dispatcher was started twice.
    #[error("The dispatcher is already running.")]
    AlreadyRunning,
    /// A blocking or polling call was made before the dispatcher started.
    #[error("The dispatcher is not running.")]
    NotRunning,
    /// No work process is attached at the given address.
    #[error("No work process attached at {0}.")]
    UnknownAddress(MsgAddress),
    /// A work process failed to initialize.
    #[error("Work process {0} failed to initialize: {1}")]
    Init(MsgAddress, String),
    /// A work process failed to start.
    #[error("Work process {0} failed to start: {1}")]
    Start(MsgAddress, String),
    /// An identifier could not be parsed or was malformed.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
    /// A signal watch could not be installed.
    #[error("Signal {0} cannot be watched: {1}")]
    Signal(i32, String),
    /// A file descriptor could not be registered for readiness.
    #[error("Input fd {0} cannot be watched: {1}")]
    Input(i32, String),
    /// A subscription set could not be encoded or decoded.
    #[error("Subscription set error: {0}")]
    Subscription(String),
    /// Error that does not compromise the operation of the kernel.
    #[error("Error: {0}")]
    Functional(String),
}
