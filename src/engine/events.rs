// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

/// Events driving the recovery state machine.
///
/// `ProcessExited` and `ProcessLivenessCheckFailed` originate from process
/// watchers; everything else is produced by the engine itself as state
/// entry actions complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEvent {
    RequestLaunchProcesses,
    ProcessExited,
    ProcessLivenessCheckFailed,
    ProcessesLaunched,
    FailureIgnored,
    RequestStopSubgraph,
    CatastrophicFailure,
    ForceStopSubgraph,
    RestartFailedProcesses,
    RelaunchComplete,
}

impl RecoveryEvent {
    /// Every event, in declaration order.
    pub const ALL: [RecoveryEvent; 10] = [
        RecoveryEvent::RequestLaunchProcesses,
        RecoveryEvent::ProcessExited,
        RecoveryEvent::ProcessLivenessCheckFailed,
        RecoveryEvent::ProcessesLaunched,
        RecoveryEvent::FailureIgnored,
        RecoveryEvent::RequestStopSubgraph,
        RecoveryEvent::CatastrophicFailure,
        RecoveryEvent::ForceStopSubgraph,
        RecoveryEvent::RestartFailedProcesses,
        RecoveryEvent::RelaunchComplete,
    ];
}
