// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The recovery state machine.
//!
//! The engine sequences the entire lifecycle of the process fleet: the
//! initial launch in topological order, the reaction to a process death
//! according to its watchdog policy, the staged stop and relaunch of an
//! affected subgraph, and the system-wide wind-down when a failure is
//! unrecoverable.
//!
//! # Locking discipline
//!
//! A single async mutex guards the current state, the process graph, and
//! every state entry action. Dispatching an event acquires the lock,
//! computes the transition, runs the entry action *while still holding the
//! lock*, and only releases it before processing the action's follow-up
//! event. Two consequences fall out of this:
//!
//! * At most one entry action is ever in flight, so recovery actions can
//!   never interleave.
//! * The mutex hands the lock to waiters in FIFO order, so a failure that
//!   arrives while a recovery action is running is dispatched against
//!   whatever state that action left behind. A process dying in the middle
//!   of a relaunch therefore escalates to catastrophic shutdown, and the
//!   interrupted recovery's follow-up event is harmlessly absorbed by the
//!   catastrophic sink.
//!
//! Watcher notifications are dispatched by spawning one task per notice,
//! which is what puts them in contention for the lock in the first place.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::events::RecoveryEvent;
use crate::engine::launch::launch_process;
use crate::errors::RecoveryError;
use crate::graph::{NodeId, ProcessGraph, Visit};
use crate::watcher::{ProcessWatcher, WatchNotice};

/// States of the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Initial,
    LaunchingProcesses,
    Nominal,
    AttemptRecovery,
    RequestStopAffected,
    ForceStopAffected,
    RestartAffected,
    CatastrophicFailure,
}

impl RecoveryState {
    /// The transition table.
    ///
    /// `CatastrophicFailure` is a sink: every event maps back to it.
    /// Everywhere outside `Initial`, an exit, a liveness failure, or a
    /// catastrophic event escalates to `CatastrophicFailure` unless the
    /// state handles it more specifically. An event a state has no edge
    /// for is a fatal programmer error.
    pub fn next(self, event: RecoveryEvent) -> Result<RecoveryState, RecoveryError> {
        let next = match self {
            RecoveryState::CatastrophicFailure => RecoveryState::CatastrophicFailure,

            RecoveryState::Initial => match event {
                RecoveryEvent::RequestLaunchProcesses => RecoveryState::LaunchingProcesses,
                _ => return Err(unexpected(self, event)),
            },

            RecoveryState::LaunchingProcesses => match event {
                RecoveryEvent::ProcessesLaunched => RecoveryState::Nominal,
                RecoveryEvent::ProcessExited
                | RecoveryEvent::ProcessLivenessCheckFailed
                | RecoveryEvent::CatastrophicFailure => RecoveryState::CatastrophicFailure,
                _ => return Err(unexpected(self, event)),
            },

            RecoveryState::Nominal => match event {
                RecoveryEvent::ProcessExited | RecoveryEvent::ProcessLivenessCheckFailed => {
                    RecoveryState::AttemptRecovery
                }
                RecoveryEvent::CatastrophicFailure => RecoveryState::CatastrophicFailure,
                _ => return Err(unexpected(self, event)),
            },

            RecoveryState::AttemptRecovery => match event {
                RecoveryEvent::FailureIgnored => RecoveryState::Nominal,
                RecoveryEvent::RequestStopSubgraph => RecoveryState::RequestStopAffected,
                RecoveryEvent::ProcessExited
                | RecoveryEvent::ProcessLivenessCheckFailed
                | RecoveryEvent::CatastrophicFailure => RecoveryState::CatastrophicFailure,
                _ => return Err(unexpected(self, event)),
            },

            RecoveryState::RequestStopAffected => match event {
                RecoveryEvent::ForceStopSubgraph => RecoveryState::ForceStopAffected,
                RecoveryEvent::ProcessExited
                | RecoveryEvent::ProcessLivenessCheckFailed
                | RecoveryEvent::CatastrophicFailure => RecoveryState::CatastrophicFailure,
                _ => return Err(unexpected(self, event)),
            },

            RecoveryState::ForceStopAffected => match event {
                RecoveryEvent::RestartFailedProcesses => RecoveryState::RestartAffected,
                RecoveryEvent::ProcessExited
                | RecoveryEvent::ProcessLivenessCheckFailed
                | RecoveryEvent::CatastrophicFailure => RecoveryState::CatastrophicFailure,
                _ => return Err(unexpected(self, event)),
            },

            RecoveryState::RestartAffected => match event {
                RecoveryEvent::RelaunchComplete => RecoveryState::Nominal,
                RecoveryEvent::ProcessExited
                | RecoveryEvent::ProcessLivenessCheckFailed
                | RecoveryEvent::CatastrophicFailure => RecoveryState::CatastrophicFailure,
                _ => return Err(unexpected(self, event)),
            },
        };
        Ok(next)
    }
}

fn unexpected(state: RecoveryState, event: RecoveryEvent) -> RecoveryError {
    error!(?state, ?event, "unexpected event");
    RecoveryError::UnexpectedEvent { state, event }
}

/// Timing knobs for launch and recovery sequencing.
///
/// # Fields
/// * `inter_launch_delay` - Spacing between consecutive process launches,
///   and between relaunch waves
/// * `wave_lead_time` - Lead time before the first relaunch wave; doubled
///   into the slack the engine waits after scheduling the last wave
/// * `stop_grace_period` - Grace between a graceful stop request and the
///   forced kill during catastrophic shutdown; the event loop stops after
///   twice this
#[derive(Debug, Clone, Copy)]
pub struct RecoverySettings {
    pub inter_launch_delay: Duration,
    pub wave_lead_time: Duration,
    pub stop_grace_period: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            inter_launch_delay: Duration::from_secs(5),
            wave_lead_time: Duration::from_secs(1),
            stop_grace_period: Duration::from_secs(10),
        }
    }
}

/// Everything the state lock protects: the machine's position and the
/// graph whose nodes carry watcher and traversal state.
struct EngineCore {
    state: RecoveryState,
    graph: ProcessGraph,
}

/// Drives the whole fleet lifecycle. See the module docs for the locking
/// discipline.
pub struct RecoveryEngine {
    core: Mutex<EngineCore>,
    notices_tx: UnboundedSender<WatchNotice>,
    notices_rx: std::sync::Mutex<Option<UnboundedReceiver<WatchNotice>>>,
    fatal: std::sync::Mutex<Option<RecoveryError>>,
    settings: RecoverySettings,
    shutdown: CancellationToken,
}

impl RecoveryEngine {
    /// Create an engine over a built, acyclic graph. The `shutdown` token
    /// stops the event loop; the engine cancels it itself at the end of a
    /// catastrophic wind-down.
    pub fn new(
        graph: ProcessGraph,
        settings: RecoverySettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            core: Mutex::new(EngineCore {
                state: RecoveryState::Initial,
                graph,
            }),
            notices_tx,
            notices_rx: std::sync::Mutex::new(Some(notices_rx)),
            fatal: std::sync::Mutex::new(None),
            settings,
            shutdown,
        })
    }

    /// State the machine is currently in.
    pub async fn current_state(&self) -> RecoveryState {
        self.core.lock().await.state
    }

    /// Inject a liveness failure for `node`. Extension point for the
    /// liveness watchdog; nothing produces these yet.
    pub async fn notify_liveness_failed(&self, node: NodeId) -> Result<(), RecoveryError> {
        self.dispatch(Some(node), RecoveryEvent::ProcessLivenessCheckFailed)
            .await
    }

    /// Launch the fleet, then serve watcher notifications until the
    /// shutdown token fires or the engine halts on a fatal error.
    pub async fn run(self: &Arc<Self>) -> Result<(), RecoveryError> {
        let receiver = self
            .notices_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut notices) = receiver else {
            return Err(RecoveryError::AlreadyRunning);
        };

        // The launch runs as its own task so exit notices arriving while
        // processes are still coming up contend on the state lock and win
        // the race into the launching state, exactly like any other
        // mid-action failure.
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("sending request to launch processes");
            if let Err(error) = engine
                .dispatch(None, RecoveryEvent::RequestLaunchProcesses)
                .await
            {
                engine.halt(error);
            }
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("event loop stop requested");
                    break;
                }
                notice = notices.recv() => {
                    let Some(notice) = notice else { break };
                    self.handle_notice(notice);
                }
            }
        }

        let fatal = self
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn handle_notice(self: &Arc<Self>, notice: WatchNotice) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let (node, event) = match notice {
                WatchNotice::Exited { node, status } => {
                    info!(code = ?status.code(), "forwarding process exit to state machine");
                    (node, RecoveryEvent::ProcessExited)
                }
                WatchNotice::LivenessFailed { node } => {
                    (node, RecoveryEvent::ProcessLivenessCheckFailed)
                }
            };
            if let Err(error) = engine.dispatch(Some(node), event).await {
                engine.halt(error);
            }
        });
    }

    fn halt(&self, error: RecoveryError) {
        error!(%error, "halting recovery engine");
        let mut fatal = self
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fatal.is_none() {
            *fatal = Some(error);
        }
        self.shutdown.cancel();
    }

    /// Step the state machine through `event` and every follow-up event
    /// its entry actions produce. The lock is taken per event, not for the
    /// whole chain, which gives every event source a fair chance between
    /// steps.
    async fn dispatch(
        &self,
        failed: Option<NodeId>,
        event: RecoveryEvent,
    ) -> Result<(), RecoveryError> {
        let mut pending = Some(event);
        while let Some(event) = pending.take() {
            let mut core = self.core.lock().await;
            info!(state = ?core.state, ?event, "stepping state machine");

            let next = core.state.next(event)?;
            if next == core.state {
                debug!(state = ?core.state, "state remains unchanged");
                continue;
            }

            info!(from = ?core.state, to = ?next, "transitioning");
            core.state = next;
            pending = self.enter(next, &mut core, failed).await?;
        }
        Ok(())
    }

    /// Entry action for `state`, run while the caller holds the lock.
    async fn enter(
        &self,
        state: RecoveryState,
        core: &mut EngineCore,
        failed: Option<NodeId>,
    ) -> Result<Option<RecoveryEvent>, RecoveryError> {
        match state {
            RecoveryState::Initial | RecoveryState::Nominal => Ok(None),
            RecoveryState::LaunchingProcesses => self.launch_all(core).await,
            RecoveryState::AttemptRecovery => self.attempt_recovery(core, failed),
            RecoveryState::RequestStopAffected => self.request_stop_affected(core, failed),
            RecoveryState::ForceStopAffected => self.force_stop_affected(core, failed),
            RecoveryState::RestartAffected => self.restart_affected(core, failed).await,
            RecoveryState::CatastrophicFailure => self.catastrophic(core),
        }
    }

    /// Launch every node in topological order, spacing consecutive starts
    /// by the inter-launch delay.
    async fn launch_all(
        &self,
        core: &mut EngineCore,
    ) -> Result<Option<RecoveryEvent>, RecoveryError> {
        info!("determining process launch order via topological sort");
        let order = core.graph.topological_sort()?;

        for (position, id) in order.into_iter().enumerate() {
            if position > 0 {
                sleep(self.settings.inter_launch_delay).await;
            }
            let watcher = self.ensure_watcher(core, id);
            let spec = Arc::clone(&core.graph.node(id).launch);
            if let Err(error) = launch_process(&spec, &watcher) {
                error!(process = %spec.name, %error, "failed to launch process");
            }
        }

        info!("all processes launched");
        Ok(Some(RecoveryEvent::ProcessesLaunched))
    }

    /// First launch creates the watcher; relaunches reuse it after a reset.
    fn ensure_watcher(&self, core: &mut EngineCore, id: NodeId) -> Arc<ProcessWatcher> {
        let node = core.graph.node_mut(id);
        if let Some(watcher) = &node.watcher {
            watcher.reset();
            return Arc::clone(watcher);
        }
        let watcher = Arc::new(ProcessWatcher::new(
            node.name.clone(),
            id,
            self.notices_tx.clone(),
        ));
        node.watcher = Some(Arc::clone(&watcher));
        watcher
    }

    /// Decide what the failed node's policy says to do.
    fn attempt_recovery(
        &self,
        core: &mut EngineCore,
        failed: Option<NodeId>,
    ) -> Result<Option<RecoveryEvent>, RecoveryError> {
        let failed = failed.ok_or(RecoveryError::MissingFailedProcess {
            state: RecoveryState::AttemptRecovery,
        })?;
        let node = core.graph.node(failed);

        if node.policy.ignore_failures {
            info!(process = %node.name, "policy is to ignore failures");
            Ok(Some(RecoveryEvent::FailureIgnored))
        } else if node.policy.failure_is_catastrophic {
            info!(process = %node.name, "policy treats failures as catastrophic");
            Ok(Some(RecoveryEvent::CatastrophicFailure))
        } else {
            info!(process = %node.name, "policy is to attempt recovery");
            Ok(Some(RecoveryEvent::RequestStopSubgraph))
        }
    }

    /// BFS bound for the failed node: confined to the node itself unless
    /// its policy propagates to descendants.
    fn recovery_depth(core: &EngineCore, failed: NodeId) -> Option<usize> {
        if core.graph.node(failed).policy.propagate_to_descendants {
            None
        } else {
            Some(0)
        }
    }

    /// Walk the affected subgraph: events off on the way in, graceful stop
    /// on the way out.
    fn request_stop_affected(
        &self,
        core: &mut EngineCore,
        failed: Option<NodeId>,
    ) -> Result<Option<RecoveryEvent>, RecoveryError> {
        let failed = failed.ok_or(RecoveryError::MissingFailedProcess {
            state: RecoveryState::RequestStopAffected,
        })?;
        let max_depth = Self::recovery_depth(core, failed);

        core.graph
            .breadth_first_traversal(failed, max_depth, |_, node, visit| {
                let Some(watcher) = &node.watcher else { return };
                match visit {
                    Visit::Enter => watcher.disable_events(),
                    Visit::Exit => watcher.request_stop(),
                }
            });

        Ok(Some(RecoveryEvent::ForceStopSubgraph))
    }

    /// Second pass over the same subgraph: anything still alive is killed.
    fn force_stop_affected(
        &self,
        core: &mut EngineCore,
        failed: Option<NodeId>,
    ) -> Result<Option<RecoveryEvent>, RecoveryError> {
        let failed = failed.ok_or(RecoveryError::MissingFailedProcess {
            state: RecoveryState::ForceStopAffected,
        })?;
        let max_depth = Self::recovery_depth(core, failed);

        core.graph
            .breadth_first_traversal(failed, max_depth, |_, node, visit| {
                if visit == Visit::Exit {
                    if let Some(watcher) = &node.watcher {
                        watcher.force_stop();
                    }
                }
            });

        Ok(Some(RecoveryEvent::RestartFailedProcesses))
    }

    /// Relaunch the stopped subgraph in waves: every node at the same BFS
    /// depth starts together, consecutive waves are spaced by the
    /// inter-launch delay, and events come back on as each process does.
    async fn restart_affected(
        &self,
        core: &mut EngineCore,
        failed: Option<NodeId>,
    ) -> Result<Option<RecoveryEvent>, RecoveryError> {
        let failed = failed.ok_or(RecoveryError::MissingFailedProcess {
            state: RecoveryState::RestartAffected,
        })?;
        let max_depth = Self::recovery_depth(core, failed);
        let delay = self.settings.inter_launch_delay;
        let lead = self.settings.wave_lead_time;
        let mut max_wave = 0usize;

        core.graph
            .breadth_first_traversal(failed, max_depth, |_, node, visit| {
                if visit != Visit::Enter {
                    return;
                }
                let Some(watcher) = &node.watcher else {
                    warn!(process = %node.name, "never launched, nothing to relaunch");
                    return;
                };

                let wave = node.discovery_time();
                max_wave = max_wave.max(wave);
                let launch_at = lead + delay * wave as u32;
                info!(process = %node.name, wave, ?launch_at, "scheduling relaunch");

                watcher.reset();
                let spec = Arc::clone(&node.launch);
                let watcher = Arc::clone(watcher);
                tokio::spawn(async move {
                    sleep(launch_at).await;
                    match launch_process(&spec, &watcher) {
                        Ok(()) => watcher.enable_events(),
                        Err(error) => {
                            error!(process = %spec.name, %error, "failed to relaunch process")
                        }
                    }
                });
            });

        // Give the last wave time to come up before reporting completion.
        sleep(lead * 2 + delay * max_wave as u32).await;
        Ok(Some(RecoveryEvent::RelaunchComplete))
    }

    /// Wind the whole fleet down in reverse topological order: events off,
    /// graceful stop now, forced stop at T, event loop stop at 2T.
    fn catastrophic(&self, core: &mut EngineCore) -> Result<Option<RecoveryEvent>, RecoveryError> {
        let order = core.graph.topological_sort()?;
        let grace = self.settings.stop_grace_period;

        for id in order.into_iter().rev() {
            let node = core.graph.node(id);
            let Some(watcher) = &node.watcher else { continue };

            info!(process = %node.name, "disabling events");
            watcher.disable_events();
            info!(process = %node.name, "requesting stop");
            watcher.request_stop();

            info!(process = %node.name, ?grace, "scheduling force stop");
            let watcher = Arc::clone(watcher);
            tokio::spawn(async move {
                sleep(grace).await;
                watcher.force_stop();
            });
        }

        info!("scheduling event loop stop");
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            sleep(grace * 2).await;
            shutdown.cancel();
        });

        Ok(None)
    }
}
