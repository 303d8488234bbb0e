// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::fmt;
use std::path::PathBuf;

/// Errors raised while assembling or traversing the process graph
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    /// A required field of a managed process record is empty
    MissingRequiredField {
        /// Name of the field that must be populated
        field: &'static str,
    },
    /// The configured executable does not exist or is not a regular file
    ExecutableNotFound {
        process: String,
        path: PathBuf,
    },
    /// The configured executable is not readable and executable by this user
    ExecutableNotRunnable {
        process: String,
        path: PathBuf,
    },
    /// Two managed processes share the same name
    DuplicateProcessName {
        process: String,
    },
    /// Building adjacency information uncovered unresolvable references
    Build(GraphBuildReport),
    /// An operation that requires an acyclic graph found a cycle
    Cyclic,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::MissingRequiredField { field } => {
                write!(
                    f,
                    "Expected field [{}] to be populated in the system description",
                    field
                )
            }
            GraphError::ExecutableNotFound { process, path } => {
                write!(
                    f,
                    "For process [{}], specified executable path [{}] either does not exist or is not a file",
                    process,
                    path.display()
                )
            }
            GraphError::ExecutableNotRunnable { process, path } => {
                write!(
                    f,
                    "For process [{}], specified executable path [{}] does not appear to be executable or readable",
                    process,
                    path.display()
                )
            }
            GraphError::DuplicateProcessName { process } => {
                write!(
                    f,
                    "Cannot have more than one managed process with name [{}]",
                    process
                )
            }
            GraphError::Build(report) => write!(f, "{}", report),
            GraphError::Cyclic => write!(f, "Detected cycle in process graph"),
        }
    }
}

impl std::error::Error for GraphError {}

/// A topic somebody subscribes to that nobody publishes
#[derive(Debug, Clone, PartialEq)]
pub struct MissingPublisher {
    pub topic: String,
    pub subscribers: Vec<String>,
}

/// A process whose explicit dependencies name unknown processes
#[derive(Debug, Clone, PartialEq)]
pub struct MissingDependency {
    pub process: String,
    pub dependencies: Vec<String>,
}

/// Everything wrong with the graph's edge inputs, collected in one pass so
/// a single build attempt reports every missing publisher and every
/// unresolved dependency at once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphBuildReport {
    pub missing_publishers: Vec<MissingPublisher>,
    pub missing_dependencies: Vec<MissingDependency>,
}

impl GraphBuildReport {
    pub fn is_empty(&self) -> bool {
        self.missing_publishers.is_empty() && self.missing_dependencies.is_empty()
    }
}

impl fmt::Display for GraphBuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Found errors when building adjacency information.")?;
        if !self.missing_dependencies.is_empty() {
            write!(
                f,
                " Found [{}] managed processes with missing dependencies:",
                self.missing_dependencies.len()
            )?;
            for missing in &self.missing_dependencies {
                write!(
                    f,
                    " managed process [{}] is missing [{}];",
                    missing.process,
                    missing.dependencies.join(", ")
                )?;
            }
        }
        if !self.missing_publishers.is_empty() {
            write!(
                f,
                " Found [{}] topics that do not have publishers:",
                self.missing_publishers.len()
            )?;
            for missing in &self.missing_publishers {
                write!(
                    f,
                    " topic [{}] with subscribers [{}];",
                    missing.topic,
                    missing.subscribers.join(", ")
                )?;
            }
        }
        Ok(())
    }
}
