use std::{env, path::PathBuf, process::ExitCode, sync::Arc};

use args::{parse, Args, RunMode, USAGE};
use console::ConsoleUx;
use ember_core::{
    error::{EmberError, EmberResult},
    manifest::parse::parse_manifest,
};
use ember_engine::{
    apply::ApplyResult,
    elevation,
    pipe::PipeConnection,
    state::EngineState,
};
use ember_events::{Restart, UxHandle};
use ember_utils::fs::read_file;
use logging::setup_logging;
use tracing::{error, info};

mod args;
mod console;
mod logging;

// conventional installer exit codes
const EXIT_OK: u8 = 0;
const EXIT_USER_CANCEL: u16 = 1602;
const EXIT_FAILURE: u16 = 1603;
const EXIT_RESTART_REQUIRED: u16 = 3010;
const EXIT_RESTART_INITIATED: u16 = 1641;

fn main() -> ExitCode {
    let raw: Vec<String> = env::args().skip(1).collect();
    let args = match parse(&raw) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("ember: {err}");
            eprintln!("{USAGE}");
            return ExitCode::from(exit_code_for(EXIT_FAILURE));
        }
    };

    if args.help {
        print!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    setup_logging(&args);

    match run(&args) {
        Ok(result) => match result.restart {
            Restart::Initiated => ExitCode::from(exit_code_for(EXIT_RESTART_INITIATED)),
            Restart::Required => ExitCode::from(exit_code_for(EXIT_RESTART_REQUIRED)),
            Restart::None => ExitCode::from(EXIT_OK),
        },
        Err(err) => {
            let user_exit = err.is_user_exit();
            error!("{:?}", miette::Report::new(err));
            if user_exit {
                ExitCode::from(exit_code_for(EXIT_USER_CANCEL))
            } else {
                ExitCode::from(exit_code_for(EXIT_FAILURE))
            }
        }
    }
}

/// Installer exit codes do not fit in a byte; fold them the way
/// POSIX shells would observe them.
fn exit_code_for(code: u16) -> u8 {
    (code & 0xFF) as u8
}

fn run(args: &Args) -> EmberResult<ApplyResult> {
    let mut state = initialize(args)?;

    match &args.mode {
        // elevated helper mode: serve the parent and exit with its code
        RunMode::Elevated {
            pipe_name,
            secret,
            parent_pid,
        } => {
            info!(parent = parent_pid, "running as elevated helper");
            state.is_elevated_helper = true;
            let connection = PipeConnection {
                name: pipe_name.clone(),
                secret: secret.clone(),
            };
            let exit_code = elevation::run_elevated_child(&state, &connection)?;
            std::process::exit(exit_code as i32);
        }
        RunMode::Unelevated { parent_pid, .. } | RunMode::Embedded { parent_pid, .. } => {
            // hosted modes share the normal engine flow; the parent
            // drives us through the same operations
            info!(parent = parent_pid, "running hosted by another process");
        }
        RunMode::RunOnce | RunMode::Normal => {}
    }

    ember_engine::detect(&mut state)?;
    ember_engine::plan(&mut state, args.action())?;
    ember_engine::apply(&mut state)
}

fn initialize(args: &Args) -> EmberResult<EngineState> {
    let exe = env::current_exe()
        .map_err(|e| EmberError::Validation(format!("cannot locate own executable: {e}")))?;
    let source_dir = exe
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let manifest_path = match env::var("EMBER_BUNDLE_MANIFEST") {
        Ok(path) => PathBuf::from(path),
        Err(_) => source_dir.join("bundle.xml"),
    };
    let manifest_xml = read_file(&manifest_path)?;
    let manifest_xml = String::from_utf8(manifest_xml)
        .map_err(|_| EmberError::Manifest("manifest is not valid UTF-8".to_string()))?;
    let manifest = parse_manifest(&manifest_xml)?;

    info!(
        bundle = %manifest.bundle.id,
        version = %manifest.bundle.version,
        "bundle initialized"
    );

    let ux: UxHandle = Arc::new(ConsoleUx::new(args.display));
    let mut state = EngineState::initialize(manifest, cache_root(), source_dir, ux)?;

    state.display = args.display;
    state.restart_mode = args.restart_mode();
    state.relation_type = args.relation;
    if let Some(layout_dir) = &args.layout_directory {
        state
            .variables
            .set_string("LayoutDirectory", layout_dir, false)?;
    }
    if !args.ignore_dependencies.is_empty() {
        state.variables.set_string(
            "IgnoreDependencies",
            &args.ignore_dependencies.join(";"),
            false,
        )?;
    }

    Ok(state)
}

fn cache_root() -> PathBuf {
    if let Ok(root) = env::var("EMBER_CACHE_ROOT") {
        return PathBuf::from(root);
    }
    if let Ok(xdg) = env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg).join("ember");
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".cache/ember");
    }
    env::temp_dir().join("ember-cache")
}
