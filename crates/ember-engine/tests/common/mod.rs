//! Shared harness for engine integration tests: scripted package
//! engines and engine-state construction over a temp directory.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex},
};

use ember_core::{
    error::{EmberError, EmberResult},
    manifest::parse::parse_manifest,
};
use ember_engine::{
    engine::{
        DetectContext, EngineCallback, EngineKind, EngineMessage, ExecuteContext, PackageEngine,
    },
    state::EngineState,
};
use ember_events::{ActionState, PackageState, Restart, UxHandle};

/// One recorded execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub package_id: String,
    pub action: ActionState,
    pub rollback: bool,
}

/// Outcome scripted for one execution of one package.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed(Restart),
    Fail(i32),
    /// Emit these progress percentages, then succeed.
    Progress(Vec<u8>),
}

/// A package engine driven entirely by per-package scripts. Every
/// execution is recorded; unscripted runs succeed quietly.
#[derive(Default)]
pub struct MockEngine {
    detect_states: Mutex<HashMap<String, PackageState>>,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    executions: Mutex<Vec<ExecutionRecord>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_detect_state(&self, package_id: &str, state: PackageState) {
        self.detect_states
            .lock()
            .unwrap()
            .insert(package_id.to_string(), state);
    }

    pub fn script(&self, package_id: &str, outcome: ScriptedOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(package_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions.lock().unwrap().clone()
    }

    pub fn executed_ids(&self) -> Vec<String> {
        self.executions()
            .into_iter()
            .map(|r| {
                if r.rollback {
                    format!("{}:rollback", r.package_id)
                } else {
                    r.package_id
                }
            })
            .collect()
    }
}

impl PackageEngine for MockEngine {
    fn detect(&self, ctx: &DetectContext<'_>) -> EmberResult<PackageState> {
        Ok(self
            .detect_states
            .lock()
            .unwrap()
            .get(&ctx.package.id)
            .copied()
            .unwrap_or(PackageState::Absent))
    }

    fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        callback: &mut EngineCallback<'_>,
    ) -> EmberResult<Restart> {
        self.executions.lock().unwrap().push(ExecutionRecord {
            package_id: ctx.package.id.clone(),
            action: ctx.action,
            rollback: ctx.rollback,
        });

        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&ctx.package.id)
            .and_then(VecDeque::pop_front);

        match outcome {
            None | Some(ScriptedOutcome::Succeed(Restart::None)) => {
                callback(EngineMessage::Progress { percent: 100 });
                Ok(Restart::None)
            }
            Some(ScriptedOutcome::Succeed(restart)) => Ok(restart),
            Some(ScriptedOutcome::Fail(code)) => {
                callback(EngineMessage::Error {
                    code,
                    message: format!("scripted failure in '{}'", ctx.package.id),
                });
                Err(EmberError::PackageFailure {
                    package: ctx.package.id.clone(),
                    code,
                })
            }
            Some(ScriptedOutcome::Progress(percents)) => {
                for percent in percents {
                    callback(EngineMessage::Progress { percent });
                }
                Ok(Restart::None)
            }
        }
    }
}

/// Builds engine state over `root` with the mock engine registered
/// for every package kind.
pub fn engine_state(
    manifest_xml: &str,
    root: &Path,
    ux: UxHandle,
    mock: &Arc<MockEngine>,
) -> EngineState {
    let manifest = parse_manifest(manifest_xml).expect("test manifest must parse");
    let source_dir = root.join("source");
    ember_utils::fs::ensure_dir_exists(&source_dir).unwrap();

    let mut state = EngineState::initialize(
        manifest,
        root.join("cache"),
        source_dir,
        ux,
    )
    .expect("engine state");

    for kind in [
        EngineKind::Exe,
        EngineKind::Msi,
        EngineKind::Msp,
        EngineKind::Msu,
    ] {
        state.registry.register(kind, mock.clone());
    }
    state
}

/// Writes a payload's source file under the state's source folder.
pub fn stage_source_file(root: &Path, name: &str, contents: &[u8]) {
    ember_utils::fs::write_file(root.join("source").join(name), contents).unwrap();
}

/// Pre-caches a payload so plan sees the package fully cached.
pub fn precache_payload(state: &EngineState, package_id: &str, contents: &[u8]) {
    let (_, package) = state
        .manifest
        .package_by_id(package_id)
        .expect("package exists");
    for &payload_index in &package.payloads {
        let payload = &state.manifest.payloads[payload_index];
        let destination = state
            .cache
            .completed_dir(&package.cache_id)
            .join(&payload.file_path);
        ember_utils::fs::write_file(&destination, contents).unwrap();
    }
}
