// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod node;
mod process_graph;

pub use node::{LaunchSpec, NodeColor, NodeId, ProcessNode, Visit, WatchdogPolicy};
pub use process_graph::ProcessGraph;
