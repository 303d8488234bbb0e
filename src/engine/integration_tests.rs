// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! End-to-end recovery scenarios against real child processes.
//!
//! Each scenario builds a small fleet of /bin/sh scripts in a tempdir.
//! Every script appends a line to a per-process marker file on startup, so
//! restart counts are observable from the outside.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::{ManagedProcess, PolicySpec};
use crate::engine::{RecoveryEngine, RecoverySettings, RecoveryState};
use crate::graph::ProcessGraph;

fn fast_settings() -> RecoverySettings {
    RecoverySettings {
        inter_launch_delay: Duration::from_millis(50),
        wave_lead_time: Duration::from_millis(50),
        stop_grace_period: Duration::from_millis(200),
    }
}

fn write_script(dir: &TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(format!("{}.sh", name));
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_str().unwrap().to_string()
}

/// Records a launch marker, then parks.
fn long_running(dir: &TempDir, name: &str) -> String {
    let root = dir.path().display();
    write_script(
        dir,
        name,
        &format!("echo up >> {root}/{name}.marker\nexec sleep 30"),
    )
}

/// Records a launch marker; exits with `code` after `delay` seconds on the
/// first run, parks on every later run.
fn exits_once(dir: &TempDir, name: &str, code: i32, delay: &str) -> String {
    let root = dir.path().display();
    write_script(
        dir,
        name,
        &format!(
            "echo up >> {root}/{name}.marker\n\
             if [ -f {root}/{name}.flag ]; then exec sleep 30; fi\n\
             touch {root}/{name}.flag\n\
             sleep {delay}\n\
             exit {code}"
        ),
    )
}

fn marker_count(dir: &TempDir, name: &str) -> usize {
    fs::read_to_string(dir.path().join(format!("{}.marker", name)))
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

fn process(name: &str, executable: &str, policy: PolicySpec) -> ManagedProcess {
    ManagedProcess {
        process_name: name.to_string(),
        executable_path: executable.to_string(),
        policy: Some(policy),
        ..Default::default()
    }
}

fn relaunch_policy(propagate_to_descendants: bool) -> PolicySpec {
    PolicySpec::RelaunchPolicy {
        first_liveness_check_seconds: 1.0,
        liveness_check_period_milliseconds: 100,
        propagate_to_descendants,
    }
}

fn fail_policy() -> PolicySpec {
    PolicySpec::FailPolicy {
        first_liveness_check_seconds: 1.0,
        liveness_check_period_milliseconds: 100,
    }
}

/// A -> B -> C through topics; policies supplied per node.
fn chain_fleet(a_exe: &str, b_exe: &str, c_exe: &str, b_policy: PolicySpec) -> ProcessGraph {
    let mut a = process("a", a_exe, PolicySpec::IgnorePolicy);
    a.provided_topics.insert("raw".to_string(), 0);
    let mut b = process("b", b_exe, b_policy);
    b.required_topics.push("raw".to_string());
    b.provided_topics.insert("refined".to_string(), 0);
    let mut c = process("c", c_exe, PolicySpec::IgnorePolicy);
    c.required_topics.push("refined".to_string());

    let mut graph = ProcessGraph::new();
    graph.add_node(&a).unwrap();
    graph.add_node(&b).unwrap();
    graph.add_node(&c).unwrap();
    graph.build().unwrap();
    assert!(!graph.has_cycle());
    graph
}

#[tokio::test]
async fn launches_fleet_and_reaches_nominal() {
    let dir = TempDir::new().unwrap();
    let a_exe = long_running(&dir, "a");
    let b_exe = long_running(&dir, "b");

    let mut a = process("a", &a_exe, PolicySpec::IgnorePolicy);
    a.provided_topics.insert("frames".to_string(), 0);
    let mut b = process("b", &b_exe, PolicySpec::IgnorePolicy);
    b.required_topics.push("frames".to_string());

    let mut graph = ProcessGraph::new();
    let a_id = graph.add_node(&a).unwrap();
    let b_id = graph.add_node(&b).unwrap();
    graph.build().unwrap();
    assert_eq!(graph.topological_sort().unwrap(), vec![a_id, b_id]);

    let shutdown = CancellationToken::new();
    let engine = RecoveryEngine::new(graph, fast_settings(), shutdown.clone());
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.current_state().await, RecoveryState::Nominal);
    assert_eq!(marker_count(&dir, "a"), 1);
    assert_eq!(marker_count(&dir, "b"), 1);

    shutdown.cancel();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn ignored_failure_leaves_fleet_alone() {
    let dir = TempDir::new().unwrap();
    let a_exe = long_running(&dir, "a");
    let b_exe = exits_once(&dir, "b", 1, "0.2");

    let mut a = process("a", &a_exe, PolicySpec::IgnorePolicy);
    a.provided_topics.insert("frames".to_string(), 0);
    let mut b = process("b", &b_exe, PolicySpec::IgnorePolicy);
    b.required_topics.push("frames".to_string());

    let mut graph = ProcessGraph::new();
    graph.add_node(&a).unwrap();
    graph.add_node(&b).unwrap();
    graph.build().unwrap();

    let shutdown = CancellationToken::new();
    let engine = RecoveryEngine::new(graph, fast_settings(), shutdown.clone());
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    sleep(Duration::from_secs(1)).await;
    assert_eq!(engine.current_state().await, RecoveryState::Nominal);
    // b exited but was not restarted.
    assert_eq!(marker_count(&dir, "a"), 1);
    assert_eq!(marker_count(&dir, "b"), 1);

    shutdown.cancel();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn relaunch_restarts_only_the_failed_process() {
    let dir = TempDir::new().unwrap();
    let a_exe = long_running(&dir, "a");
    let b_exe = exits_once(&dir, "b", 1, "0.2");
    let c_exe = long_running(&dir, "c");
    let graph = chain_fleet(&a_exe, &b_exe, &c_exe, relaunch_policy(false));

    let shutdown = CancellationToken::new();
    let engine = RecoveryEngine::new(graph, fast_settings(), shutdown.clone());
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.current_state().await, RecoveryState::Nominal);
    assert_eq!(marker_count(&dir, "a"), 1, "a must not be touched");
    assert_eq!(marker_count(&dir, "b"), 2, "b must be relaunched once");
    assert_eq!(marker_count(&dir, "c"), 1, "c must not be touched");

    shutdown.cancel();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn relaunch_restarts_descendants_in_waves() {
    let dir = TempDir::new().unwrap();
    let a_exe = long_running(&dir, "a");
    let b_exe = exits_once(&dir, "b", 1, "0.2");
    let c_exe = long_running(&dir, "c");
    let graph = chain_fleet(&a_exe, &b_exe, &c_exe, relaunch_policy(true));

    let shutdown = CancellationToken::new();
    let engine = RecoveryEngine::new(graph, fast_settings(), shutdown.clone());
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.current_state().await, RecoveryState::Nominal);
    assert_eq!(marker_count(&dir, "a"), 1, "a is upstream and untouched");
    assert_eq!(marker_count(&dir, "b"), 2, "b must be relaunched");
    assert_eq!(marker_count(&dir, "c"), 2, "c must be stopped and relaunched");

    shutdown.cancel();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn liveness_failure_is_handled_like_an_exit() {
    let dir = TempDir::new().unwrap();
    let a_exe = long_running(&dir, "a");
    let a = process("a", &a_exe, PolicySpec::IgnorePolicy);

    let mut graph = ProcessGraph::new();
    let a_id = graph.add_node(&a).unwrap();
    graph.build().unwrap();

    let shutdown = CancellationToken::new();
    let engine = RecoveryEngine::new(graph, fast_settings(), shutdown.clone());
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.current_state().await, RecoveryState::Nominal);

    // The liveness extension point feeds the same recovery path an exit
    // does; an ignore policy swallows it.
    engine.notify_liveness_failed(a_id).await.unwrap();
    assert_eq!(engine.current_state().await, RecoveryState::Nominal);

    shutdown.cancel();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn catastrophic_policy_winds_down_the_fleet() {
    let dir = TempDir::new().unwrap();
    let x_exe = exits_once(&dir, "x", 1, "0.2");
    let y_exe = long_running(&dir, "y");

    let x = process("x", &x_exe, fail_policy());
    let y = process("y", &y_exe, PolicySpec::IgnorePolicy);

    let mut graph = ProcessGraph::new();
    graph.add_node(&x).unwrap();
    graph.add_node(&y).unwrap();
    graph.build().unwrap();

    let shutdown = CancellationToken::new();
    let engine = RecoveryEngine::new(graph, fast_settings(), shutdown.clone());
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    // The engine cancels the loop itself at twice the grace period.
    timeout(Duration::from_secs(5), runner)
        .await
        .expect("engine must stop on its own")
        .unwrap()
        .unwrap();
    assert_eq!(
        engine.current_state().await,
        RecoveryState::CatastrophicFailure
    );
    assert!(shutdown.is_cancelled());
    assert_eq!(marker_count(&dir, "x"), 1, "x must not be relaunched");
}

#[tokio::test]
async fn exit_during_launch_escalates_to_catastrophic() {
    let dir = TempDir::new().unwrap();
    let a_exe = exits_once(&dir, "a", 1, "0.05");
    let b_exe = long_running(&dir, "b");
    let c_exe = long_running(&dir, "c");

    // Even an ignorable process brings the launch down: the exit arrives
    // while the launching action still holds the state lock, and queued
    // failures beat the action's own follow-up event to the next step.
    let mut a = process("a", &a_exe, PolicySpec::IgnorePolicy);
    a.provided_topics.insert("raw".to_string(), 0);
    let mut b = process("b", &b_exe, PolicySpec::IgnorePolicy);
    b.required_topics.push("raw".to_string());
    b.provided_topics.insert("refined".to_string(), 0);
    let mut c = process("c", &c_exe, PolicySpec::IgnorePolicy);
    c.required_topics.push("refined".to_string());

    let mut graph = ProcessGraph::new();
    graph.add_node(&a).unwrap();
    graph.add_node(&b).unwrap();
    graph.add_node(&c).unwrap();
    graph.build().unwrap();

    let settings = RecoverySettings {
        inter_launch_delay: Duration::from_millis(200),
        ..fast_settings()
    };
    let shutdown = CancellationToken::new();
    let engine = RecoveryEngine::new(graph, settings, shutdown.clone());
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    timeout(Duration::from_secs(5), runner)
        .await
        .expect("engine must stop on its own")
        .unwrap()
        .unwrap();
    assert_eq!(
        engine.current_state().await,
        RecoveryState::CatastrophicFailure
    );
}
