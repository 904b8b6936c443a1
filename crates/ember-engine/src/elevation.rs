//! Elevated-helper relay.
//!
//! Per-machine operations run in a separate helper process reached
//! through two authenticated pipes: the control pipe carries execute
//! and session traffic, the cache pipe carries payload staging so
//! progress never blocks execute messaging. The parent relays typed
//! requests; the child pumps them against its own engine state and
//! exits with the code carried by `Terminate`.

use std::{
    process::{Child, Command},
    sync::Mutex,
    os::unix::net::UnixStream,
};

use ember_core::{
    constants::{VARIABLE_BUNDLE_ELEVATED, VARIABLES_STATE_FILE},
    error::{EmberError, EmberResult},
};
use ember_events::{ActionState, Restart, UxAction};
use ember_utils::fs::write_file;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    engine::{EngineMessage, ExecuteContext},
    pipe::{self, PipeConnection, PipeMessage},
    state::EngineState,
};

// caller-defined message ids on the control pipe
pub const MSG_SESSION_BEGIN: u32 = 0x0001;
pub const MSG_SESSION_END: u32 = 0x0002;
pub const MSG_SAVE_STATE: u32 = 0x0003;
pub const MSG_EXECUTE_PACKAGE: u32 = 0x0004;
pub const MSG_CLEAN_PACKAGE: u32 = 0x0005;
pub const MSG_DETECT_RELATED_BUNDLES: u32 = 0x0006;
// child-to-parent while executing
pub const MSG_EXECUTE_PROGRESS: u32 = 0x0010;
pub const MSG_EXECUTE_ERROR: u32 = 0x0011;
// caller-defined message ids on the cache pipe
pub const MSG_CACHE_COMPLETE_PAYLOAD: u32 = 0x0020;
pub const MSG_CACHE_CLEANUP: u32 = 0x0021;

const RESULT_ERROR_BIT: u32 = 0x8000_0000;

#[derive(Serialize, Deserialize)]
struct ExecutePackageRequest {
    package_id: String,
    action: u8,
    rollback: bool,
}

#[derive(Serialize, Deserialize)]
struct SessionEndRequest {
    keep: bool,
    suspended: bool,
    restart_initiated: bool,
}

#[derive(Serialize, Deserialize)]
struct CachePayloadRequest {
    package_id: String,
    payload_key: String,
    staged: String,
    move_file: bool,
}

#[derive(Serialize, Deserialize)]
struct ProgressReport {
    percent: u8,
}

/// Established connection to the elevated helper.
pub struct ElevatedConnection {
    pub connection: PipeConnection,
    pub control: Mutex<UnixStream>,
    pub cache: Mutex<UnixStream>,
    child: Option<Child>,
}

impl ElevatedConnection {
    /// Wraps already-authenticated streams; used when the helper is
    /// driven in-process (tests and embedded hosts).
    pub fn from_streams(
        connection: PipeConnection,
        control: UnixStream,
        cache: UnixStream,
    ) -> Self {
        Self {
            connection,
            control: Mutex::new(control),
            cache: Mutex::new(cache),
            child: None,
        }
    }

    /// Sends `Terminate`, waits for the child to exit, and removes
    /// the socket files.
    pub fn terminate(&mut self, exit_code: u32) {
        if let Ok(mut control) = self.control.lock() {
            let _ = self.connection.terminate_child(&mut control, exit_code);
            let _ = control.shutdown(std::net::Shutdown::Both);
        }
        if let Ok(cache) = self.cache.lock() {
            let _ = cache.shutdown(std::net::Shutdown::Both);
        }
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => debug!(?status, "elevated helper exited"),
                Err(err) => warn!(error = %err, "failed to reap elevated helper"),
            }
        }
        self.connection.cleanup();
    }
}

/// Establishes the elevated helper: create the pipes, launch the
/// child with the `<pipe, secret, ppid>` tuple, and authenticate both
/// connections.
pub fn elevate(state: &mut EngineState) -> EmberResult<()> {
    if state.elevated.is_some() {
        return Ok(());
    }

    if state.ux.on_elevate_begin().is_cancel() {
        state.ux.on_elevate_complete(false);
        return Err(EmberError::UserExit);
    }

    let result = establish(state);
    state.ux.on_elevate_complete(result.is_ok());
    if result.is_ok() {
        state
            .variables
            .set_numeric(VARIABLE_BUNDLE_ELEVATED, 1, true)?;
    }
    result
}

fn establish(state: &mut EngineState) -> EmberResult<()> {
    let connection = PipeConnection::create();
    let (control_listener, cache_listener) = connection.create_pipes()?;

    let exe = std::env::current_exe()
        .map_err(|e| EmberError::Pipe(format!("cannot locate own executable: {e}")))?;
    let child = Command::new(&exe)
        .arg("-burn.elevated")
        .arg(&connection.name)
        .arg(&connection.secret)
        .arg(std::process::id().to_string())
        .spawn()
        .map_err(|e| EmberError::Pipe(format!("failed to launch elevated helper: {e}")))?;

    info!(pid = child.id(), "elevated helper launched");

    let control = connection.wait_for_child_connect(&control_listener)?;
    let cache = connection.wait_for_child_connect(&cache_listener)?;

    state.elevated = Some(ElevatedConnection {
        connection,
        control: Mutex::new(control),
        cache: Mutex::new(cache),
        child: Some(child),
    });
    Ok(())
}

fn check_result(result: u32) -> EmberResult<u32> {
    if result & RESULT_ERROR_BIT != 0 {
        Err(EmberError::Pipe(format!(
            "elevated operation failed with {:#x}",
            result & !RESULT_ERROR_BIT
        )))
    } else {
        Ok(result)
    }
}

// ---- parent-side relays ----

pub fn session_begin(conn: &ElevatedConnection, resume_command: &str) -> EmberResult<()> {
    let mut control = conn.control.lock().map_err(|_| EmberError::PoisonError)?;
    let result = pipe::send_message(
        &mut control,
        MSG_SESSION_BEGIN,
        resume_command.as_bytes(),
        None,
    )?;
    check_result(result).map(|_| ())
}

pub fn session_end(
    conn: &ElevatedConnection,
    keep: bool,
    suspended: bool,
    restart_initiated: bool,
) -> EmberResult<()> {
    let payload = serde_json::to_vec(&SessionEndRequest {
        keep,
        suspended,
        restart_initiated,
    })?;
    let mut control = conn.control.lock().map_err(|_| EmberError::PoisonError)?;
    let result = pipe::send_message(&mut control, MSG_SESSION_END, &payload, None)?;
    check_result(result).map(|_| ())
}

/// Ships the persisted variable stream to the protected store.
pub fn save_state(conn: &ElevatedConnection, variables: &[u8]) -> EmberResult<()> {
    let mut control = conn.control.lock().map_err(|_| EmberError::PoisonError)?;
    let result = pipe::send_message(&mut control, MSG_SAVE_STATE, variables, None)?;
    check_result(result).map(|_| ())
}

/// Executes a per-machine package in the helper, translating progress
/// messages back into the given callback.
pub fn execute_package(
    conn: &ElevatedConnection,
    package_id: &str,
    action: ActionState,
    rollback: bool,
    on_progress: &mut dyn FnMut(u8) -> UxAction,
) -> EmberResult<Restart> {
    let payload = serde_json::to_vec(&ExecutePackageRequest {
        package_id: package_id.to_string(),
        action: action_to_wire(action),
        rollback,
    })?;

    let mut canceled = false;
    let mut control = conn.control.lock().map_err(|_| EmberError::PoisonError)?;
    let result = pipe::send_message(
        &mut control,
        MSG_EXECUTE_PACKAGE,
        &payload,
        Some(&mut |message: &PipeMessage| match message.message_type {
            MSG_EXECUTE_PROGRESS => {
                let percent = serde_json::from_slice::<ProgressReport>(&message.data)
                    .map(|r| r.percent)
                    .unwrap_or(0);
                if on_progress(percent).is_cancel() {
                    canceled = true;
                    1
                } else {
                    0
                }
            }
            MSG_EXECUTE_ERROR => {
                warn!(
                    "elevated package error: {}",
                    String::from_utf8_lossy(&message.data)
                );
                0
            }
            _ => 0,
        }),
    )?;

    if canceled {
        return Err(EmberError::UserExit);
    }
    match check_result(result)? {
        0 => Ok(Restart::None),
        1 => Ok(Restart::Required),
        2 => Ok(Restart::Initiated),
        other => Err(EmberError::PackageFailure {
            package: package_id.to_string(),
            code: other as i32,
        }),
    }
}

pub fn cache_complete_payload(
    conn: &ElevatedConnection,
    package_id: &str,
    payload_key: &str,
    staged: &std::path::Path,
    move_file: bool,
) -> EmberResult<()> {
    let payload = serde_json::to_vec(&CachePayloadRequest {
        package_id: package_id.to_string(),
        payload_key: payload_key.to_string(),
        staged: staged.display().to_string(),
        move_file,
    })?;
    let mut cache = conn.cache.lock().map_err(|_| EmberError::PoisonError)?;
    let result = pipe::send_message(&mut cache, MSG_CACHE_COMPLETE_PAYLOAD, &payload, None)?;
    match check_result(result) {
        Ok(_) => Ok(()),
        Err(_) => Err(EmberError::VerifyFailed {
            key: payload_key.to_string(),
        }),
    }
}

pub fn cache_cleanup(conn: &ElevatedConnection) -> EmberResult<()> {
    let mut cache = conn.cache.lock().map_err(|_| EmberError::PoisonError)?;
    let result = pipe::send_message(&mut cache, MSG_CACHE_CLEANUP, &[], None)?;
    check_result(result).map(|_| ())
}

pub fn clean_package(conn: &ElevatedConnection, cache_id: &str) -> EmberResult<()> {
    let mut control = conn.control.lock().map_err(|_| EmberError::PoisonError)?;
    let result = pipe::send_message(
        &mut control,
        MSG_CLEAN_PACKAGE,
        cache_id.as_bytes(),
        None,
    )?;
    check_result(result).map(|_| ())
}

fn action_to_wire(action: ActionState) -> u8 {
    match action {
        ActionState::None => 0,
        ActionState::Uninstall => 1,
        ActionState::Install => 2,
        ActionState::Modify => 3,
        ActionState::Repair => 4,
    }
}

fn action_from_wire(action: u8) -> ActionState {
    match action {
        1 => ActionState::Uninstall,
        2 => ActionState::Install,
        3 => ActionState::Modify,
        4 => ActionState::Repair,
        _ => ActionState::None,
    }
}

// ---- child side ----

/// Runs the elevated helper: connect and authenticate both pipes,
/// pump the cache pipe on its own thread, pump the control pipe to
/// completion, and return the exit code from `Terminate`.
pub fn run_elevated_child(state: &EngineState, connection: &PipeConnection) -> EmberResult<u32> {
    let mut control = connection.child_connect(&connection.control_path())?;
    let cache = connection.child_connect(&connection.cache_path())?;
    let cache_shutdown = cache.try_clone().ok();
    info!(name = %connection.name, "connected to parent");

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut cache = cache;
            let result = pipe::pump_messages(&mut cache, &mut |message: &PipeMessage| {
                handle_cache_message(state, message)
            });
            if let Err(err) = result {
                // the pipe closing at teardown is normal
                debug!(error = %err, "cache pipe pump ended");
            }
        });

        let result = control_pump(state, &mut control);
        // unblock the cache pump so the scope can join it
        if let Some(stream) = &cache_shutdown {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        result
    })
}

/// Hand-rolled control pump: executing a package needs the stream to
/// raise progress requests mid-operation.
fn control_pump(state: &EngineState, control: &mut UnixStream) -> EmberResult<u32> {
    loop {
        let message = pipe::read_message(control)?;
        match message.message_type {
            pipe::PIPE_MESSAGE_TERMINATE => {
                let exit_code = if message.data.len() >= 4 {
                    u32::from_le_bytes([
                        message.data[0],
                        message.data[1],
                        message.data[2],
                        message.data[3],
                    ])
                } else {
                    0
                };
                info!(exit_code, "terminate received");
                return Ok(exit_code);
            }
            MSG_EXECUTE_PACKAGE => {
                let result = handle_execute_package(state, control, &message.data);
                pipe::write_message(
                    control,
                    pipe::PIPE_MESSAGE_COMPLETE,
                    &result.to_le_bytes(),
                )?;
            }
            _ => {
                let result = handle_control_message(state, &message);
                pipe::write_message(
                    control,
                    pipe::PIPE_MESSAGE_COMPLETE,
                    &result.to_le_bytes(),
                )?;
            }
        }
    }
}

fn handle_execute_package(state: &EngineState, control: &mut UnixStream, data: &[u8]) -> u32 {
    let request: ExecutePackageRequest = match serde_json::from_slice(data) {
        Ok(request) => request,
        Err(_) => return RESULT_ERROR_BIT | 1,
    };

    let Some((_, package)) = state.manifest.package_by_id(&request.package_id) else {
        return RESULT_ERROR_BIT | 2;
    };
    let engine = match state.registry.engine_for(package) {
        Ok(engine) => engine,
        Err(_) => return RESULT_ERROR_BIT | 3,
    };

    let primary_payload = package
        .payloads
        .first()
        .map(|&p| state.manifest.payloads[p].file_path.clone());
    let ctx = ExecuteContext {
        package,
        action: action_from_wire(request.action),
        rollback: request.rollback,
        variables: &state.variables,
        cached_dir: state.cache.completed_dir(&package.cache_id),
        primary_payload,
    };

    let outcome = engine.execute(&ctx, &mut |message: EngineMessage| {
        match message {
            EngineMessage::Progress { percent } => {
                let report = serde_json::to_vec(&ProgressReport { percent }).unwrap_or_default();
                match pipe::send_message(control, MSG_EXECUTE_PROGRESS, &report, None) {
                    Ok(1) => UxAction::Cancel,
                    _ => UxAction::NoAction,
                }
            }
            EngineMessage::Error { code, message } => {
                let text = format!("{code}: {message}");
                let _ = pipe::send_message(control, MSG_EXECUTE_ERROR, text.as_bytes(), None);
                UxAction::NoAction
            }
            _ => UxAction::NoAction,
        }
    });

    match outcome {
        Ok(Restart::None) => 0,
        Ok(Restart::Required) => 1,
        Ok(Restart::Initiated) => 2,
        Err(EmberError::PackageFailure { code, .. }) => RESULT_ERROR_BIT | (code as u32 & 0xFFFF),
        Err(_) => RESULT_ERROR_BIT | 4,
    }
}

fn handle_control_message(state: &EngineState, message: &PipeMessage) -> u32 {
    match message.message_type {
        MSG_SESSION_BEGIN => {
            let mut registration = state.registration.clone();
            registration.resume_command =
                String::from_utf8_lossy(&message.data).into_owned();
            match registration.register(&state.cache) {
                Ok(()) => 0,
                Err(_) => RESULT_ERROR_BIT | 1,
            }
        }
        MSG_SESSION_END => {
            let request: SessionEndRequest = match serde_json::from_slice(&message.data) {
                Ok(request) => request,
                Err(_) => return RESULT_ERROR_BIT | 1,
            };
            match state.registration.unregister(
                &state.cache,
                request.keep,
                request.suspended,
                request.restart_initiated,
            ) {
                Ok(()) => 0,
                Err(_) => RESULT_ERROR_BIT | 1,
            }
        }
        MSG_SAVE_STATE => {
            let path = state.cache.bundle_dir().join(VARIABLES_STATE_FILE);
            match write_file(&path, &message.data) {
                Ok(()) => 0,
                Err(_) => RESULT_ERROR_BIT | 1,
            }
        }
        MSG_CLEAN_PACKAGE => {
            let cache_id = String::from_utf8_lossy(&message.data);
            match state.cache.remove_package(&cache_id) {
                Ok(()) => 0,
                Err(_) => RESULT_ERROR_BIT | 1,
            }
        }
        MSG_DETECT_RELATED_BUNDLES => 0,
        other => {
            warn!(message_type = format_args!("{other:#x}"), "unknown control message");
            RESULT_ERROR_BIT | 0xFF
        }
    }
}

fn handle_cache_message(state: &EngineState, message: &PipeMessage) -> u32 {
    match message.message_type {
        MSG_CACHE_COMPLETE_PAYLOAD => {
            let request: CachePayloadRequest = match serde_json::from_slice(&message.data) {
                Ok(request) => request,
                Err(_) => return RESULT_ERROR_BIT | 1,
            };
            let Some((_, package)) = state.manifest.package_by_id(&request.package_id) else {
                return RESULT_ERROR_BIT | 2;
            };
            let Some(payload) = package
                .payloads
                .iter()
                .map(|&p| &state.manifest.payloads[p])
                .find(|p| p.key == request.payload_key)
            else {
                return RESULT_ERROR_BIT | 3;
            };
            match state.cache.complete_payload(
                payload,
                &package.cache_id,
                std::path::Path::new(&request.staged),
                request.move_file,
            ) {
                Ok(()) => 0,
                Err(_) => RESULT_ERROR_BIT | 4,
            }
        }
        MSG_CACHE_CLEANUP => match state.cache.cleanup(false) {
            Ok(()) => 0,
            Err(_) => RESULT_ERROR_BIT | 1,
        },
        other => {
            warn!(message_type = format_args!("{other:#x}"), "unknown cache message");
            RESULT_ERROR_BIT | 0xFF
        }
    }
}
