// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors raised by the recovery engine.

use thiserror::Error;

use crate::engine::{RecoveryEvent, RecoveryState};
use crate::errors::GraphError;

/// Failure modes of the recovery state machine.
///
/// An unexpected event is a programmer error: the transition table is total
/// over everything the engine can legitimately receive, so an unhandled
/// pairing halts the engine instead of being absorbed.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("unexpected event [{event:?}] in state [{state:?}]")]
    UnexpectedEvent {
        state: RecoveryState,
        event: RecoveryEvent,
    },

    #[error("no failed process recorded while entering state [{state:?}]")]
    MissingFailedProcess { state: RecoveryState },

    #[error("recovery engine is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Graph(#[from] GraphError),
}
