// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod events;
#[cfg(test)]
mod integration_tests;
mod launch;
mod recovery;

pub use events::RecoveryEvent;
pub use recovery::{RecoveryEngine, RecoverySettings, RecoveryState};
