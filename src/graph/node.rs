// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{access, AccessFlags};
use tracing::warn;

use crate::config::{ManagedProcess, PolicySpec};
use crate::errors::GraphError;
use crate::watcher::ProcessWatcher;

/// Index of a node within its graph. Nodes are stored in insertion order
/// and never removed, so an id stays valid for the life of the graph.
pub type NodeId = usize;

/// Traversal coloring shared by the depth-first and breadth-first walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeColor {
    White,
    Gray,
    Black,
}

/// Direction flag handed to traversal visitors: once when a node is first
/// discovered and once when the traversal is finished with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Enter,
    Exit,
}

/// Normalized watchdog policy for one managed process.
///
/// The liveness fields are carried for the (not yet implemented) liveness
/// watchdog; the three booleans drive recovery decisions today.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogPolicy {
    pub initial_watchdog_seconds: f64,
    pub watchdog_period_seconds: f64,
    pub failure_is_catastrophic: bool,
    pub ignore_failures: bool,
    pub propagate_to_descendants: bool,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            initial_watchdog_seconds: 1.0,
            watchdog_period_seconds: 0.01,
            failure_is_catastrophic: true,
            ignore_failures: false,
            propagate_to_descendants: false,
        }
    }
}

impl WatchdogPolicy {
    /// Materialize the policy for a process. A process without a policy is
    /// tolerated with a warning and treated as catastrophic on failure.
    pub fn from_spec(process_name: &str, spec: Option<&PolicySpec>) -> Self {
        match spec {
            None => {
                warn!(
                    process = process_name,
                    "did not specify any policy, defaulting to catastrophic failure policy"
                );
                Self::default()
            }
            Some(PolicySpec::FailPolicy {
                first_liveness_check_seconds,
                liveness_check_period_milliseconds,
            }) => Self {
                initial_watchdog_seconds: *first_liveness_check_seconds,
                watchdog_period_seconds: *liveness_check_period_milliseconds as f64 / 1000.0,
                ..Self::default()
            },
            Some(PolicySpec::RelaunchPolicy {
                first_liveness_check_seconds,
                liveness_check_period_milliseconds,
                propagate_to_descendants,
            }) => Self {
                initial_watchdog_seconds: *first_liveness_check_seconds,
                watchdog_period_seconds: *liveness_check_period_milliseconds as f64 / 1000.0,
                failure_is_catastrophic: false,
                propagate_to_descendants: *propagate_to_descendants,
                ..Self::default()
            },
            Some(PolicySpec::IgnorePolicy) => Self {
                failure_is_catastrophic: false,
                ignore_failures: true,
                ..Self::default()
            },
        }
    }
}

/// Everything needed to spawn one managed process.
///
/// Lives behind an `Arc` because relaunch tasks scheduled by the recovery
/// engine run after the engine lock has moved on.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub executable_path: PathBuf,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// `<logdir>/<process_name>.log`, opened in append mode at launch.
    pub logfile: Option<PathBuf>,
}

/// All supervisor-side state for one managed process.
pub struct ProcessNode {
    pub name: String,
    pub launch: Arc<LaunchSpec>,
    pub policy: WatchdogPolicy,
    pub provided_topics: Vec<String>,
    pub required_topics: Vec<String>,
    pub additional_dependencies: Vec<String>,
    /// Created at first launch and reused across restarts via `reset()`.
    pub watcher: Option<Arc<ProcessWatcher>>,

    // Traversal bookkeeping, reset before every traversal.
    pub(crate) color: NodeColor,
    pub(crate) predecessor: Option<NodeId>,
    pub(crate) discovery_time: usize,
    pub(crate) finishing_time: usize,
}

impl ProcessNode {
    /// Validate a managed process record and turn it into a node.
    pub fn from_config(config: &ManagedProcess) -> Result<Self, GraphError> {
        if config.process_name.is_empty() {
            return Err(GraphError::MissingRequiredField {
                field: "process_name",
            });
        }
        if config.executable_path.is_empty() {
            return Err(GraphError::MissingRequiredField {
                field: "executable_path",
            });
        }

        let executable_path = PathBuf::from(&config.executable_path);
        check_executable(&config.process_name, &executable_path)?;

        let policy = WatchdogPolicy::from_spec(&config.process_name, config.policy.as_ref());

        let logfile = config
            .logdir
            .as_ref()
            .map(|logdir| PathBuf::from(format!("{}/{}.log", logdir, config.process_name)));

        let launch = Arc::new(LaunchSpec {
            name: config.process_name.clone(),
            executable_path,
            arguments: config.arguments.clone(),
            environment: config.environment.clone(),
            logfile,
        });

        Ok(Self {
            name: config.process_name.clone(),
            launch,
            policy,
            provided_topics: config.provided_topics.keys().cloned().collect(),
            required_topics: config.required_topics.clone(),
            additional_dependencies: config.additional_process_dependencies.clone(),
            watcher: None,
            color: NodeColor::White,
            predecessor: None,
            discovery_time: usize::MAX,
            finishing_time: usize::MAX,
        })
    }

    pub(crate) fn reset_traversal_state(&mut self) {
        self.color = NodeColor::White;
        self.predecessor = None;
        self.discovery_time = usize::MAX;
        self.finishing_time = usize::MAX;
    }

    /// Depth of this node in the most recent breadth-first traversal; the
    /// start node sits at depth 1. The recovery engine uses this to group
    /// relaunches into waves.
    pub fn discovery_time(&self) -> usize {
        self.discovery_time
    }

    pub fn finishing_time(&self) -> usize {
        self.finishing_time
    }
}

fn check_executable(process: &str, path: &Path) -> Result<(), GraphError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => {
            return Err(GraphError::ExecutableNotFound {
                process: process.to_string(),
                path: path.to_path_buf(),
            })
        }
    };
    if !metadata.is_file() {
        return Err(GraphError::ExecutableNotFound {
            process: process.to_string(),
            path: path.to_path_buf(),
        });
    }
    if access(path, AccessFlags::R_OK | AccessFlags::X_OK).is_err() {
        return Err(GraphError::ExecutableNotRunnable {
            process: process.to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(())
}
