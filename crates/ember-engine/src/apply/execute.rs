//! The execute walk.
//!
//! Walks the plan's execute actions, dispatching each package to its
//! engine (locally, or over the control pipe for per-machine
//! packages). A failure rolls back to the paired checkpoint; a vital
//! boundary then stops the run, a non-vital one seeks the next
//! boundary marker and continues. Restart severities fold with `max`
//! and an initiated restart short-circuits the remainder.

use std::sync::atomic::{AtomicU32, Ordering};

use ember_core::{
    error::{EmberError, EmberResult},
    manifest::{PackageIndex, PackageKind},
};
use ember_events::{ActionState, DependencyAction, Restart, UxAction};
use ember_utils::event::SyncEvent;
use tracing::{debug, info, warn};

use crate::{
    apply::cache::{clean_package, CacheThreadShared},
    elevation,
    engine::{msi_progress::MsiProgressTranslator, EngineMessage, ExecuteContext},
    plan::ExecuteAction,
    state::EngineState,
};

/// Results the execute walk reports beyond its error.
#[derive(Debug, Default)]
pub struct ExecuteOutcome {
    pub keep_registration: Option<bool>,
    pub suspend: bool,
    pub restart: Restart,
    pub rollback: bool,
}

struct ExecuteProgress<'a> {
    executed_packages: usize,
    total_packages: usize,
    ticks: &'a AtomicU32,
}

pub fn apply_execute(
    state: &EngineState,
    shared: &CacheThreadShared,
    ticks: &AtomicU32,
    outcome: &mut ExecuteOutcome,
) -> EmberResult<()> {
    if state
        .ux
        .on_execute_begin(state.plan.execute_package_count)
        .is_cancel()
    {
        state.ux.on_execute_complete(false);
        return Err(EmberError::UserExit);
    }

    let result = execute_loop(state, shared, ticks, outcome);
    state.ux.on_execute_complete(result.is_ok());
    result
}

fn execute_loop(
    state: &EngineState,
    shared: &CacheThreadShared,
    ticks: &AtomicU32,
    outcome: &mut ExecuteOutcome,
) -> EmberResult<()> {
    let mut checkpoint = 0u32;
    let mut boundary: Option<usize> = None;
    let mut seek_next_boundary = false;
    let mut progress = ExecuteProgress {
        executed_packages: 0,
        total_packages: state.plan.execute_package_count.max(1),
        ticks,
    };

    let mut result: EmberResult<()> = Ok(());

    for action in &state.plan.execute_actions {
        if seek_next_boundary {
            match action {
                ExecuteAction::RollbackBoundary { boundary: next } => {
                    boundary = Some(*next);
                    seek_next_boundary = false;
                }
                _ => continue,
            }
        }

        let step = do_execute_action(state, shared, action, &mut checkpoint, &mut boundary, &mut progress, outcome);

        if outcome.suspend || outcome.restart == Restart::Initiated {
            return Ok(());
        }

        match step {
            Ok(()) => {
                result = Ok(());
            }
            Err(err) => {
                if err.is_user_exit() || state.rollback_disabled {
                    outcome.rollback = state.rollback_disabled;
                    return Err(err);
                }

                do_rollback_actions(state, checkpoint, &mut progress, outcome);

                let vital_boundary = boundary
                    .map(|b| state.manifest.boundaries[b].vital)
                    .unwrap_or(true);
                if vital_boundary {
                    outcome.rollback = true;
                    return Err(err);
                }

                info!("advancing past non-vital rollback boundary");
                seek_next_boundary = true;
                result = Err(err);
            }
        }
    }

    result
}

#[allow(clippy::too_many_arguments)]
fn do_execute_action(
    state: &EngineState,
    shared: &CacheThreadShared,
    action: &ExecuteAction,
    checkpoint: &mut u32,
    boundary: &mut Option<usize>,
    progress: &mut ExecuteProgress<'_>,
    outcome: &mut ExecuteOutcome,
) -> EmberResult<()> {
    match action {
        ExecuteAction::Checkpoint { id } => {
            *checkpoint = *id;
        }
        ExecuteAction::Syncpoint { event } => {
            wait_for_cache_thread(event, shared)?;
        }
        ExecuteAction::RollbackBoundary { boundary: index } => {
            *boundary = Some(*index);
        }
        ExecuteAction::Registration { keep } => {
            outcome.keep_registration = Some(*keep);
        }
        ExecuteAction::Dependency { package, action } => {
            execute_dependency(state, *package, *action)?;
        }
        ExecuteAction::ExecutePackage { package, action } => {
            execute_package_with_decisions(state, *package, *action, progress, outcome)?;
        }
        ExecuteAction::RelatedBundle { bundle, action } => {
            let related = &state.related_bundles[*bundle];
            info!(bundle = %related.id, ?action, "processing related bundle");
            execute_related_bundle(state, *bundle, *action, progress);
        }
        ExecuteAction::UncachePackage { .. } => {
            return Err(EmberError::Fatal(
                "uncache action in forward execute plan".to_string(),
            ));
        }
    }
    Ok(())
}

/// Waits on the package's sync event, giving up if the cache thread
/// dies first.
fn wait_for_cache_thread(event: &SyncEvent, shared: &CacheThreadShared) -> EmberResult<()> {
    loop {
        if event.wait_timeout(std::time::Duration::from_millis(25)) {
            return Ok(());
        }
        if shared.is_done() {
            if let Some(err) = shared.take_error() {
                return Err(err);
            }
            if event.is_set() {
                return Ok(());
            }
            return Err(EmberError::Fatal(
                "cache thread exited unexpectedly".to_string(),
            ));
        }
    }
}

fn execute_dependency(
    state: &EngineState,
    package: PackageIndex,
    action: DependencyAction,
) -> EmberResult<()> {
    let package = &state.manifest.packages[package];
    for provider in &package.dependency_providers {
        match action {
            DependencyAction::Register => {
                state
                    .registration
                    .register_provider(&state.cache, &provider.key)?;
            }
            DependencyAction::Unregister => {
                state
                    .registration
                    .unregister_provider(&state.cache, &provider.key)?;
            }
            DependencyAction::None => {}
        }
    }
    Ok(())
}

/// Runs one package with the UX retry/ignore/suspend decision loop
/// around it.
fn execute_package_with_decisions(
    state: &EngineState,
    package_index: PackageIndex,
    action: ActionState,
    progress: &mut ExecuteProgress<'_>,
    outcome: &mut ExecuteOutcome,
) -> EmberResult<()> {
    let package = &state.manifest.packages[package_index];

    loop {
        let result = execute_one(state, package_index, action, false, progress);
        let (success, restart) = match &result {
            Ok(restart) => (true, *restart),
            Err(_) => (false, Restart::None),
        };

        outcome.restart = outcome.restart.max(restart);

        let recommendation = if success || package.vital {
            UxAction::NoAction
        } else {
            UxAction::Ignore
        };
        let decision = state.ux.on_execute_package_complete(
            &package.id,
            success,
            restart,
            recommendation,
        );

        progress.executed_packages += 1;
        let now = progress.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        state
            .ux
            .on_apply_progress(now, state.plan.overall_ticks_total);

        match (result, decision) {
            (Ok(_), UxAction::Suspend) => {
                info!(package = %package.id, "suspending after package");
                outcome.suspend = true;
                return Ok(());
            }
            (Ok(_), UxAction::Restart) => {
                outcome.restart = outcome.restart.max(Restart::Initiated);
                return Ok(());
            }
            (Ok(_), _) => return Ok(()),
            (Err(err), UxAction::Retry) => {
                if outcome.restart == Restart::Initiated {
                    return Err(err);
                }
                info!(package = %package.id, "retrying package execution");
                progress.executed_packages -= 1;
                continue;
            }
            (Err(_), UxAction::Ignore) if !package.vital => {
                info!(
                    package = %package.id,
                    "continuing past non-vital package failure"
                );
                return Ok(());
            }
            (Err(err), _) => return Err(err),
        }
    }
}

/// One engine run, forward or rollback, local or relayed.
fn execute_one(
    state: &EngineState,
    package_index: PackageIndex,
    action: ActionState,
    rollback: bool,
    progress: &mut ExecuteProgress<'_>,
) -> EmberResult<Restart> {
    let package = &state.manifest.packages[package_index];

    if state
        .ux
        .on_execute_package_begin(&package.id, !rollback)
        .is_cancel()
    {
        return Err(EmberError::UserExit);
    }

    debug!(
        package = %package.id,
        ?action,
        rollback,
        per_machine = package.per_machine,
        "executing package"
    );

    let executed = progress.executed_packages;
    let total = progress.total_packages;

    if package.per_machine {
        if let Some(conn) = &state.elevated {
            return elevation::execute_package(
                conn,
                &package.id,
                action,
                rollback,
                &mut |percent| {
                    let overall = overall_percent(executed, total, percent);
                    state.ux.on_execute_progress(&package.id, percent, overall)
                },
            );
        }
    }

    let engine = state.registry.engine_for(package)?;
    let primary_payload = package
        .payloads
        .first()
        .map(|&p| state.manifest.payloads[p].file_path.clone());
    let ctx = ExecuteContext {
        package,
        action,
        rollback,
        variables: &state.variables,
        cached_dir: state.cache.completed_dir(&package.cache_id),
        primary_payload,
    };

    // database-backed kinds report raw progress tuples; translate
    // them into the weighted overall percentage
    let mut translator = matches!(package.kind, PackageKind::Msi(_) | PackageKind::Msp(_))
        .then(|| MsiProgressTranslator::new(rollback));

    engine.execute(&ctx, &mut |message: EngineMessage| match message {
        EngineMessage::Progress { percent } => {
            let overall = overall_percent(executed, total, percent);
            state.ux.on_execute_progress(&package.id, percent, overall)
        }
        EngineMessage::MsiProgress { fields } => {
            let percent = translator
                .as_mut()
                .and_then(|t| t.handle(fields))
                .unwrap_or(0);
            let overall = overall_percent(executed, total, percent);
            state.ux.on_execute_progress(&package.id, percent, overall)
        }
        EngineMessage::MsiActionData => {
            match translator.as_mut().and_then(|t| t.handle_action_data()) {
                Some(percent) => {
                    let overall = overall_percent(executed, total, percent);
                    state.ux.on_execute_progress(&package.id, percent, overall)
                }
                None => UxAction::NoAction,
            }
        }
        EngineMessage::Error { code, message } => {
            state.ux.on_error(&package.id, code, &message)
        }
        EngineMessage::FilesInUse { files } => {
            state.ux.on_execute_files_in_use(&package.id, &files)
        }
    })
}

/// Runs a related bundle's operation. The other bundle is an
/// independent executable; a missing one is logged and skipped so an
/// orphaned registration cannot wedge this chain.
fn execute_related_bundle(
    state: &EngineState,
    bundle: usize,
    action: ActionState,
    progress: &mut ExecuteProgress<'_>,
) {
    let related = &state.related_bundles[bundle];
    let executable = state
        .cache
        .root()
        .join(&related.id)
        .join(format!("{}.run", related.id));

    progress.executed_packages += 1;
    let now = progress.ticks.fetch_add(1, Ordering::SeqCst) + 1;
    state
        .ux
        .on_apply_progress(now, state.plan.overall_ticks_total);

    if !executable.is_file() {
        warn!(bundle = %related.id, "related bundle executable not cached; skipping");
        return;
    }

    let mut command = std::process::Command::new(&executable);
    match action {
        ActionState::Uninstall => {
            command.arg("-uninstall");
        }
        ActionState::Repair => {
            command.arg("-repair");
        }
        _ => {}
    }
    command.arg("-quiet");

    match command.status() {
        Ok(status) if status.success() => {
            debug!(bundle = %related.id, "related bundle processed");
        }
        Ok(status) => {
            warn!(bundle = %related.id, ?status, "related bundle failed");
        }
        Err(err) => {
            warn!(bundle = %related.id, error = %err, "related bundle launch failed");
        }
    }
}

fn overall_percent(executed: usize, total: usize, package_percent: u8) -> u8 {
    let total = total.max(1);
    (((executed * 100) + package_percent as usize) / total).min(100) as u8
}

/// Scans the rollback list backward from the failing checkpoint,
/// running mirrors with every failure logged and swallowed so the
/// rollback reaches as far as it can.
pub fn do_rollback_actions(
    state: &EngineState,
    checkpoint: u32,
    progress: &mut ExecuteProgress<'_>,
    outcome: &mut ExecuteOutcome,
) {
    let actions = &state.plan.rollback_actions;
    let Some(stop) = actions
        .iter()
        .position(|a| a.checkpoint_id() == Some(checkpoint))
    else {
        return;
    };

    info!(checkpoint, "rolling back execution");
    for action in actions[..stop].iter().rev() {
        match action {
            ExecuteAction::Checkpoint { .. } => {}
            ExecuteAction::RollbackBoundary { .. } => break,
            ExecuteAction::Registration { keep } => {
                outcome.keep_registration = Some(*keep);
            }
            ExecuteAction::Dependency { package, action } => {
                if let Err(err) = execute_dependency(state, *package, *action) {
                    warn!(error = %err, "rollback dependency action failed");
                }
            }
            ExecuteAction::ExecutePackage { package, action } => {
                match execute_one(state, *package, *action, true, progress) {
                    Ok(restart) => outcome.restart = outcome.restart.max(restart),
                    Err(err) => {
                        let id = &state.manifest.packages[*package].id;
                        warn!(package = %id, error = %err, "rollback of package failed");
                    }
                }
            }
            ExecuteAction::UncachePackage { package } => {
                let package = &state.manifest.packages[*package];
                if let Err(err) = clean_package(state, package) {
                    warn!(package = %package.id, error = %err, "rollback uncache failed");
                }
            }
            ExecuteAction::RelatedBundle { bundle, action } => {
                execute_related_bundle(state, *bundle, *action, progress);
            }
            ExecuteAction::Syncpoint { .. } => {}
        }
    }
}

/// Removes cached files of packages that left the machine.
pub fn apply_clean(state: &EngineState) {
    for &package_index in &state.plan.clean_packages {
        let package = &state.manifest.packages[package_index];
        if let Err(err) = clean_package(state, package) {
            warn!(package = %package.id, error = %err, "clean failed");
        }
    }
}
