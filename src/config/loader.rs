// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Complete description of the process fleet Mercury supervises.
///
/// This is the root structure of the system description file: a sequence of
/// managed process records from which the process graph is built. It is
/// typically loaded from a YAML file after the machine serial number has
/// been substituted into the path.
///
/// # Example
/// ```yaml
/// processes:
///   - process_name: "camera"
///     executable_path: "/opt/zippy/bin/camera"
///     provided_topics:
///       images: 10
///     policy:
///       relaunch_policy:
///         first_liveness_check_seconds: 5
///         liveness_check_period_milliseconds: 250
///         propagate_to_descendants: true
///   - process_name: "detector"
///     executable_path: "/opt/zippy/bin/detector"
///     required_topics: [images]
///     policy: ignore_policy
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SystemDescription {
    #[serde(default)]
    pub processes: Vec<ManagedProcess>,
}

/// One long-running program under Mercury's supervision.
///
/// # Fields
/// * `process_name` - Unique name of the process (required)
/// * `executable_path` - Path to the executable (required; must exist and
///   be readable and executable by the supervising user)
/// * `arguments` - Command line arguments, in order
/// * `environment` - Extra environment variables for the child
/// * `provided_topics` - Topics this process publishes; only the key set
///   matters for dependency edges, the value is an advertised queue depth
/// * `required_topics` - Topics this process subscribes to
/// * `additional_process_dependencies` - Names of processes this one
///   depends on beyond what the topic relations imply
/// * `logdir` - Directory for the per-process logfile (optional; stdout
///   and stderr are discarded when unset)
/// * `policy` - Watchdog policy (optional; defaults to treating any
///   failure as catastrophic)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManagedProcess {
    #[serde(default)]
    pub process_name: String,
    #[serde(default)]
    pub executable_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub provided_topics: BTreeMap<String, i64>,
    #[serde(default)]
    pub required_topics: Vec<String>,
    #[serde(default)]
    pub additional_process_dependencies: Vec<String>,
    #[serde(default)]
    pub logdir: Option<String>,
    #[serde(default)]
    pub policy: Option<PolicySpec>,
}

/// Watchdog policy attached to a managed process.
///
/// At most one variant may be present. An absent policy is a recoverable
/// condition (logged, then defaulted to catastrophic); an unrecognized tag
/// fails deserialization outright.
///
/// # Variants
/// * `FailPolicy` - A failure of this process takes the whole system down
/// * `RelaunchPolicy` - Stop and relaunch the process, optionally together
///   with everything downstream of it
/// * `IgnorePolicy` - Failures are logged and otherwise ignored
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySpec {
    FailPolicy {
        first_liveness_check_seconds: f64,
        liveness_check_period_milliseconds: u64,
    },
    RelaunchPolicy {
        first_liveness_check_seconds: f64,
        liveness_check_period_milliseconds: u64,
        #[serde(default)]
        propagate_to_descendants: bool,
    },
    IgnorePolicy,
}

/// Load a system description from a YAML file
pub fn load_description<P: AsRef<Path>>(
    path: P,
) -> Result<SystemDescription, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)?;
    let description: SystemDescription = serde_yaml::from_str(&content)?;
    Ok(description)
}
