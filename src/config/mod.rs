// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod loader;
mod serial;

pub use loader::{load_description, ManagedProcess, PolicySpec, SystemDescription};
pub use serial::{
    probe_serial, substitute_in_description, substitute_serial, SerialError, SERIAL_PATH,
    SERIAL_TOKEN,
};
