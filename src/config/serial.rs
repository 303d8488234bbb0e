// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Machine serial number probing and substitution.
//!
//! System descriptions are written once and deployed to many machines; any
//! place a per-machine value is needed they carry the literal token
//! `ZIPPY-SERIAL-NUMBER` instead. Before the process graph is built, every
//! occurrence of the token in executable paths, arguments, and environment
//! entries is replaced with the serial number provisioned on this host.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::SystemDescription;

/// Literal token replaced with the per-machine serial number.
pub const SERIAL_TOKEN: &str = "ZIPPY-SERIAL-NUMBER";

/// Where provisioning leaves the serial number on disk.
pub const SERIAL_PATH: &str = "/zippy-persistent/ZIPPY-SERIAL-NUMBER";

/// Failures while reading the machine serial number.
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to read serial number from [{path}]: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serial number [{value}] is not a dashed hex identifier")]
    Malformed { value: String },
}

/// Replace every occurrence of the serial token in `input`.
///
/// Matching is literal, non-overlapping, and left to right; input without
/// the token comes back unchanged.
pub fn substitute_serial(input: &str, serial: &str) -> String {
    input.replace(SERIAL_TOKEN, serial)
}

/// Rewrite a system description in place: executable paths, arguments, and
/// both keys and values of each process environment. Environment key
/// rewrites keep their value pairings.
pub fn substitute_in_description(description: &mut SystemDescription, serial: &str) {
    for process in &mut description.processes {
        process.executable_path = substitute_serial(&process.executable_path, serial);

        for argument in &mut process.arguments {
            *argument = substitute_serial(argument, serial);
        }

        let environment = std::mem::take(&mut process.environment);
        process.environment = environment
            .into_iter()
            .map(|(key, value)| {
                (
                    substitute_serial(&key, serial),
                    substitute_serial(&value, serial),
                )
            })
            .collect();
    }
}

/// Read the machine serial from `path`, normalizing to upper case.
pub fn probe_serial<P: AsRef<Path>>(path: P) -> Result<String, SerialError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| SerialError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let serial = content.lines().next().unwrap_or("").trim().to_uppercase();
    if !is_dashed_hex(&serial) {
        return Err(SerialError::Malformed { value: serial });
    }
    Ok(serial)
}

/// True for identifiers shaped 8-4-4-4-12 with upper case hex digits.
fn is_dashed_hex(value: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

    let mut parts = value.split('-');
    for expected in GROUPS {
        match parts.next() {
            Some(group)
                if group.len() == expected
                    && group.chars().all(|c| matches!(c, '0'..='9' | 'A'..='F')) => {}
            _ => return false,
        }
    }
    parts.next().is_none()
}
