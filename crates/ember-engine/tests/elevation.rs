//! Elevated-helper scenarios: authenticated connect, relayed
//! execution with echoed progress, and termination.

mod common;

use std::{
    sync::{Arc, Mutex},
    thread,
};

use common::{engine_state, precache_payload, MockEngine, ScriptedOutcome};
use ember_core::error::EmberError;
use ember_engine::{
    elevation::{self, ElevatedConnection},
    pipe::PipeConnection,
};
use ember_events::{ActionState, NullUx, Restart, UxAction, UxHandle};
use tempfile::TempDir;

const SINGLE_EXE: &str = r#"
<BundleManifest Id="bundle.elevated" Version="1.0.0.0" ProviderKey="bundle.elevated">
  <Payload Id="L1" FilePath="tool.bin" Size="4" SourcePath="tool.bin"/>
  <ExePackage Id="P1" PerMachine="yes" InstallArguments="/i" UninstallArguments="/x">
    <PayloadRef Id="L1"/>
  </ExePackage>
</BundleManifest>
"#;

/// Drives the child half on a thread against its own engine state,
/// the way the spawned helper process would.
fn spawn_child(
    connection: &PipeConnection,
    dir: &TempDir,
    mock: &Arc<MockEngine>,
) -> thread::JoinHandle<Result<u32, EmberError>> {
    let connection = PipeConnection {
        name: connection.name.clone(),
        secret: connection.secret.clone(),
    };
    let root = dir.path().to_path_buf();
    let mock = mock.clone();

    thread::spawn(move || {
        let ux: UxHandle = Arc::new(NullUx);
        let state = engine_state(SINGLE_EXE, &root, ux, &mock);
        precache_payload(&state, "P1", b"data");
        elevation::run_elevated_child(&state, &connection)
    })
}

#[test]
fn test_elevated_execution_echoes_progress_and_terminates() {
    let dir = TempDir::new().unwrap();
    let mock = MockEngine::new();
    mock.script("P1", ScriptedOutcome::Progress(vec![10, 50, 100]));

    // per-user side setup
    let connection = PipeConnection::create();
    let (control_listener, cache_listener) = connection.create_pipes().unwrap();

    let child = spawn_child(&connection, &dir, &mock);

    let control = connection.wait_for_child_connect(&control_listener).unwrap();
    let cache = connection.wait_for_child_connect(&cache_listener).unwrap();
    let mut conn = ElevatedConnection::from_streams(
        PipeConnection {
            name: connection.name.clone(),
            secret: connection.secret.clone(),
        },
        control,
        cache,
    );

    // relay an execute and collect the echoed progress
    let progress = Mutex::new(Vec::new());
    let restart = elevation::execute_package(
        &conn,
        "P1",
        ActionState::Install,
        false,
        &mut |percent| {
            progress.lock().unwrap().push(percent);
            UxAction::NoAction
        },
    )
    .unwrap();

    assert_eq!(restart, Restart::None);
    assert_eq!(*progress.lock().unwrap(), vec![10, 50, 100]);
    assert_eq!(
        mock.executions()
            .iter()
            .map(|r| r.package_id.as_str())
            .collect::<Vec<_>>(),
        vec!["P1"]
    );

    // initiate termination: the child exits with the given code
    conn.terminate(666);
    let exit_code = child.join().unwrap().unwrap();
    assert_eq!(exit_code, 666);

    connection.cleanup();
}

#[test]
fn test_elevated_package_failure_surfaces_to_parent() {
    let dir = TempDir::new().unwrap();
    let mock = MockEngine::new();
    mock.script("P1", ScriptedOutcome::Fail(1603));

    let connection = PipeConnection::create();
    let (control_listener, cache_listener) = connection.create_pipes().unwrap();
    let child = spawn_child(&connection, &dir, &mock);

    let control = connection.wait_for_child_connect(&control_listener).unwrap();
    let cache = connection.wait_for_child_connect(&cache_listener).unwrap();
    let mut conn = ElevatedConnection::from_streams(
        PipeConnection {
            name: connection.name.clone(),
            secret: connection.secret.clone(),
        },
        control,
        cache,
    );

    let result = elevation::execute_package(
        &conn,
        "P1",
        ActionState::Install,
        false,
        &mut |_| UxAction::NoAction,
    );
    assert!(matches!(
        result,
        Err(EmberError::PackageFailure { code: 1603, .. })
    ));

    conn.terminate(0);
    assert_eq!(child.join().unwrap().unwrap(), 0);
    connection.cleanup();
}

#[test]
fn test_wrong_secret_child_is_rejected() {
    let connection = PipeConnection::create();
    let (control_listener, _cache_listener) = connection.create_pipes().unwrap();

    let impostor = PipeConnection {
        name: connection.name.clone(),
        secret: "0000000000000000".to_string(),
    };
    let path = connection.control_path();
    let child = thread::spawn(move || impostor.child_connect(&path));

    let accepted = connection.wait_for_child_connect(&control_listener);
    assert!(matches!(accepted, Err(EmberError::AccessDenied(_))));

    // the impostor's connect itself succeeds; it is the parent that
    // refuses to talk
    child.join().unwrap().unwrap();
    connection.cleanup();
}

#[test]
fn test_cache_pipe_completes_payloads_on_the_child_side() {
    let dir = TempDir::new().unwrap();
    let mock = MockEngine::new();

    let connection = PipeConnection::create();
    let (control_listener, cache_listener) = connection.create_pipes().unwrap();
    let child = spawn_child(&connection, &dir, &mock);

    let control = connection.wait_for_child_connect(&control_listener).unwrap();
    let cache = connection.wait_for_child_connect(&cache_listener).unwrap();
    let mut conn = ElevatedConnection::from_streams(
        PipeConnection {
            name: connection.name.clone(),
            secret: connection.secret.clone(),
        },
        control,
        cache,
    );

    // stage a file the way the parent cache thread would, then ask
    // the child to verify and promote it
    let ux: UxHandle = Arc::new(NullUx);
    let parent_state = engine_state(SINGLE_EXE, dir.path(), ux, &mock);
    let staged = parent_state.cache.unverified_path("L1");
    ember_utils::fs::write_file(&staged, b"data").unwrap();

    elevation::cache_complete_payload(&conn, "P1", "L1", &staged, false).unwrap();

    let (_, package) = parent_state.manifest.package_by_id("P1").unwrap();
    assert!(parent_state
        .cache
        .completed_dir(&package.cache_id)
        .join("tool.bin")
        .is_file());

    conn.terminate(0);
    child.join().unwrap().unwrap();
    connection.cleanup();
}
