//! Apply: the whole-run state machine.
//!
//! Register, spawn the cache thread, run execute against the plan
//! (gated on sync-points, or after a full cache join when parallel
//! caching is off), roll back per boundary on failure, clean,
//! unregister, save. Terminal UX callbacks fire on every path.

pub mod cache;
pub mod execute;

use std::sync::atomic::AtomicU32;

use ember_core::error::{EmberError, EmberResult};
use ember_events::{BundleAction, Restart, UxAction};
use tracing::{info, warn};

use crate::{elevation, state::EngineState};
use cache::CacheThreadShared;
use execute::ExecuteOutcome;

/// What apply reports on success.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyResult {
    pub restart: Restart,
    pub suspended: bool,
}

pub fn apply(state: &mut EngineState) -> EmberResult<ApplyResult> {
    let activation = state.ux_host.activate()?;

    info!(action = ?state.plan.action, "apply begin");
    if state.ux.on_apply_begin().is_cancel() {
        state.ux.on_apply_complete(false, Restart::None);
        return Err(EmberError::UserExit);
    }

    let layout_only = state.plan.action == BundleAction::Layout;
    let mut registered = false;
    let mut keep_registration = state.plan.keep_registration_default;
    let mut outcome = ExecuteOutcome::default();
    let shared = CacheThreadShared::default();
    let ticks = AtomicU32::new(0);

    let result: EmberResult<()> = (|| {
        // per-machine plans need the elevated helper up before any
        // state changes
        if state.plan.per_machine && !state.is_elevated_helper {
            elevation::elevate(state)?;
        }

        if !layout_only {
            if state.ux.on_register_begin().is_cancel() {
                return Err(EmberError::UserExit);
            }
            let register_result = register(state);
            state.ux.on_register_complete(register_result.is_ok());
            register_result?;
            registered = true;
        }

        let state_ref: &EngineState = state;
        let mut execute_result: EmberResult<()> = Ok(());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let cache_result = cache::apply_cache(state_ref, &ticks);
                shared.finish(cache_result);
            });

            // with parallel caching off, the cache walk is fully
            // joined before execute begins; sync-points then find
            // their events already signalled
            if !state_ref.parallel_cache_and_execute {
                if let Err(err) = shared.wait_result() {
                    execute_result = Err(err);
                    return;
                }
            }

            if !layout_only && execute_result.is_ok() {
                execute_result =
                    execute::apply_execute(state_ref, &shared, &ticks, &mut outcome);
            }
            // the scope joins the cache thread on exit
        });

        execute_result?;
        if let Some(err) = shared.take_error() {
            return Err(err);
        }
        Ok(())
    })();

    let rollback = outcome.rollback || shared.rollback_flagged();
    if let Some(keep) = outcome.keep_registration {
        keep_registration = keep;
    }

    if result.is_ok()
        && !rollback
        && !outcome.suspend
        && outcome.restart != Restart::Initiated
    {
        execute::apply_clean(state);
    }

    if registered {
        state.ux.on_unregister_begin();
        let unregister_result = unregister(
            state,
            keep_registration,
            outcome.suspend,
            outcome.restart == Restart::Initiated,
        );
        if let Err(err) = &unregister_result {
            warn!(error = %err, "unregister failed");
        }
        state.ux.on_unregister_complete(unregister_result.is_ok());
    }

    if let Err(err) = save_state(state) {
        warn!(error = %err, "failed to save engine state");
    }

    if let Some(mut conn) = state.elevated.take() {
        let exit_code = match &result {
            Ok(()) => 0,
            Err(_) => 1,
        };
        conn.terminate(exit_code);
    }

    drop(activation);

    let mut restart = outcome.restart;
    let decision = state.ux.on_apply_complete(result.is_ok(), restart);
    if decision == UxAction::Restart {
        restart = restart.max(Restart::Required);
    }

    info!(
        success = result.is_ok(),
        ?restart,
        suspended = outcome.suspend,
        "apply complete"
    );

    result.map(|()| ApplyResult {
        restart,
        suspended: outcome.suspend,
    })
}

fn register(state: &EngineState) -> EmberResult<()> {
    if let Some(conn) = &state.elevated {
        elevation::session_begin(conn, &state.registration.resume_command)?;
    }
    state.registration.register(&state.cache)
}

fn unregister(
    state: &EngineState,
    keep: bool,
    suspended: bool,
    restart_initiated: bool,
) -> EmberResult<()> {
    if let Some(conn) = &state.elevated {
        elevation::session_end(conn, keep, suspended, restart_initiated)?;
    }
    state
        .registration
        .unregister(&state.cache, keep, suspended, restart_initiated)
}

/// Persists the variable stream, through the helper for per-machine
/// bundles.
fn save_state(state: &EngineState) -> EmberResult<()> {
    if let Some(conn) = &state.elevated {
        let stream = state.variables.serialize(true)?;
        elevation::save_state(conn, &stream)?;
    }
    state
        .registration
        .save_variables(&state.cache, &state.variables)
}
