//! Test harness for render queue integration tests.
//!
//! Provides a scripted render engine, scene fixtures and event helpers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use render_queue::config::SchedulerConfig;
use render_queue::error::{RenderQueueError, Result};
use render_queue::scheduler::{Advance, Dispatch, Scheduler, SchedulerEvent};
use render_queue::store::Stores;
use render_queue::worker::{ProcessRunner, RenderMode, RenderProcess};

/// What a fake render invocation does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Exit immediately with the given code
    Exit(i32),
    /// Print the lines, then exit with the code
    Output(Vec<String>, i32),
    /// Run for a while, then exit with the code
    Sleep(Duration, i32),
    /// Never exit on its own
    Hang,
    /// Fail to start
    SpawnError,
}

/// A [`ProcessRunner`] that plays back scripts keyed by target file name.
///
/// Each start pops the next script queued for that name; with nothing
/// queued the render succeeds immediately.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    started: Mutex<Vec<(String, RenderMode)>>,
    kills: Arc<AtomicUsize>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, name: &str, scripts: impl IntoIterator<Item = Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .extend(scripts);
    }

    /// File names of every started render, in order.
    pub fn started(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn started_modes(&self) -> Vec<RenderMode> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(_, mode)| mode.clone())
            .collect()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn start(&self, target: &Path, mode: &RenderMode) -> Result<Box<dyn RenderProcess>> {
        let name = file_name(target);
        self.started
            .lock()
            .unwrap()
            .push((name.clone(), mode.clone()));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&name)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Script::Exit(0));

        let (lines, exit) = match script {
            Script::Exit(code) => (Vec::new(), FakeExit::Code(code)),
            Script::Output(lines, code) => (lines, FakeExit::Code(code)),
            Script::Sleep(duration, code) => (Vec::new(), FakeExit::After(duration, code)),
            Script::Hang => (Vec::new(), FakeExit::Never),
            Script::SpawnError => {
                return Err(RenderQueueError::Spawn(format!("{}: not found", name)));
            }
        };

        Ok(Box::new(FakeProcess {
            lines: lines.into(),
            exit,
            killed: false,
            kills: self.kills.clone(),
        }))
    }
}

enum FakeExit {
    Code(i32),
    After(Duration, i32),
    Never,
}

struct FakeProcess {
    lines: VecDeque<String>,
    exit: FakeExit,
    killed: bool,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderProcess for FakeProcess {
    async fn next_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed = true;
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&mut self) -> Result<i32> {
        if self.killed {
            return Ok(-1);
        }
        match self.exit {
            FakeExit::Code(code) => Ok(code),
            FakeExit::After(duration, code) => {
                tokio::time::sleep(duration).await;
                Ok(code)
            }
            FakeExit::Never => std::future::pending().await,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Create a scene file in `dir` and return its canonical path.
pub fn scene(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, b"BLENDER-v300").unwrap();
    std::fs::canonicalize(path).unwrap()
}

/// Create several scene files at once.
pub fn scenes(dir: &TempDir, names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(|name| scene(dir, name)).collect()
}

/// A scheduler with in-memory stores.
pub fn ephemeral_scheduler(auto_retry: bool) -> Scheduler {
    let config = SchedulerConfig {
        auto_retry,
        ..SchedulerConfig::default()
    };
    Scheduler::new(config, Stores::ephemeral())
}

/// Unwrap the dispatch out of an [`Advance`].
pub fn dispatched(advance: Advance) -> Dispatch {
    match advance {
        Advance::Dispatched(dispatch) => dispatch,
        other => panic!("expected a dispatch, got {:?}", other),
    }
}

/// Collect events until the batch completes or halts.
pub async fn collect_batch(
    events: &mut broadcast::Receiver<SchedulerEvent>,
    timeout_duration: Duration,
) -> Vec<SchedulerEvent> {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout_duration;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("batch did not finish in time")
            .expect("event channel closed");
        let done = matches!(
            event,
            SchedulerEvent::BatchCompleted { .. } | SchedulerEvent::BatchHalted { .. }
        );
        collected.push(event);
        if done {
            return collected;
        }
    }
}

/// Wait for the next event matching `predicate`.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SchedulerEvent>,
    timeout_duration: Duration,
    predicate: F,
) -> SchedulerEvent
where
    F: Fn(&SchedulerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout_duration;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("event did not arrive in time")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
