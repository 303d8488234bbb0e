// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod graph;
mod recovery;

pub use graph::{GraphBuildReport, GraphError, MissingDependency, MissingPublisher};
pub use recovery::RecoveryError;
