//! The cache walk.
//!
//! Runs on its own thread, staging every payload the plan needs and
//! signalling sync-points the executor waits on. Failures honor the
//! retry/skip anchors recorded by `PackageStart`: the UX can retry a
//! single payload, retry the whole package, or skip past a non-vital
//! package; anything unrecovered rolls the cache back to the last
//! checkpoint and flags rollback.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use ember_core::{
    constants::{CACHE_MAX_RECOMMENDED_VERIFY_TRYAGAIN_ATTEMPTS, VARIABLE_SOURCE_FOLDER},
    error::{EmberError, EmberResult},
    manifest::{Payload, PackageIndex},
};
use ember_dl::{copy::copy_local, download::download_url, types::Progress};
use ember_events::UxAction;
use ember_utils::event::SyncEvent;
use tracing::{info, warn};

use crate::{
    elevation,
    plan::{CacheAction, INVALID_ACTION_INDEX},
    state::EngineState,
};

/// Hand-off between the cache thread and its waiters.
#[derive(Default)]
pub struct CacheThreadShared {
    done: SyncEvent,
    result: Mutex<Option<EmberResult<()>>>,
    rollback: std::sync::atomic::AtomicBool,
}

impl CacheThreadShared {
    pub fn finish(&self, result: EmberResult<()>) {
        if result.is_err() {
            self.rollback.store(true, Ordering::SeqCst);
        }
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        self.done.set();
    }

    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    pub fn rollback_flagged(&self) -> bool {
        self.rollback.load(Ordering::SeqCst)
    }

    /// Takes the stored failure, if any. Each error surfaces once.
    pub fn take_error(&self) -> Option<EmberError> {
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(Err(err)) => Some(err),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Blocks until the cache walk ends, surfacing its failure.
    pub fn wait_result(&self) -> EmberResult<()> {
        self.done.wait();
        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Walks the plan's cache actions. Mirrors the execute walk's error
/// contract: the first unrecovered failure rolls the cache back and
/// returns.
pub fn apply_cache(state: &EngineState, ticks: &AtomicU32) -> EmberResult<()> {
    if state.ux.on_cache_begin().is_cancel() {
        state.ux.on_cache_complete(false);
        return Err(EmberError::UserExit);
    }

    let mut checkpoint = 0u32;
    let result = cache_loop(state, ticks, &mut checkpoint);

    if result.is_err() {
        do_rollback_cache(state, checkpoint);
    }

    // clean any remnants on the elevated side too
    if let Some(conn) = &state.elevated {
        if let Err(err) = elevation::cache_cleanup(conn) {
            warn!(error = %err, "elevated cache cleanup failed");
        }
    }
    if let Err(err) = state.cache.cleanup(false) {
        warn!(error = %err, "cache cleanup failed");
    }

    state.ux.on_cache_complete(result.is_ok());
    result
}

fn cache_loop(
    state: &EngineState,
    ticks: &AtomicU32,
    checkpoint: &mut u32,
) -> EmberResult<()> {
    let actions = &state.plan.cache_actions;

    let mut skip: Vec<bool> = actions
        .iter()
        .map(|action| match action {
            CacheAction::AcquireContainer {
                skip_until_retried, ..
            }
            | CacheAction::AcquirePayload {
                skip_until_retried, ..
            } => *skip_until_retried,
            _ => false,
        })
        .collect();
    let mut try_again_attempts = vec![0u32; actions.len()];

    let mut retry_index: Option<usize> = None;
    let mut overall_progress = 0u64;

    loop {
        let mut failure: Option<EmberError> = None;
        let mut retry_payload_index: Option<usize> = None;
        // retry anchor, skip anchor, package
        let mut started: Option<(usize, usize, PackageIndex)> = None;

        let start = match retry_index.take() {
            Some(retried) => {
                // a retried action is no longer skipped
                if let Some(flag) = skip.get_mut(retried) {
                    *flag = false;
                }
                retried
            }
            None => 0,
        };

        for index in start..actions.len() {
            if failure.is_some() {
                break;
            }
            if skip[index] {
                continue;
            }

            match &actions[index] {
                CacheAction::Checkpoint { id } => {
                    *checkpoint = *id;
                }
                CacheAction::LayoutBundle {
                    executable_name,
                    layout_dir,
                } => {
                    let result = layout_bundle(state, executable_name, layout_dir);
                    match result {
                        Ok(()) => {
                            let now = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                            state
                                .ux
                                .on_apply_progress(now, state.plan.overall_ticks_total);
                        }
                        Err(err) => failure = Some(err),
                    }
                }
                CacheAction::PackageStart {
                    package,
                    payload_count,
                    payload_size_total,
                    complete_index,
                } => {
                    started = Some((index, *complete_index, *package));
                    let id = &state.manifest.packages[*package].id;
                    if state
                        .ux
                        .on_cache_package_begin(id, *payload_count, *payload_size_total)
                        .is_cancel()
                    {
                        failure = Some(EmberError::UserExit);
                    }
                }
                CacheAction::AcquireContainer { container, .. } => {
                    let container = &state.manifest.containers[*container];
                    let staged = state.cache.unverified_path(&container.id);
                    if let Err(err) = acquire(
                        state,
                        &container.id,
                        &container.source_path,
                        container.download_url.as_deref(),
                        container.size,
                        &staged,
                        &mut overall_progress,
                    ) {
                        warn!(container = %container.id, error = %err, "failed to acquire container");
                        failure = Some(err);
                    }
                }
                CacheAction::ExtractContainer {
                    container,
                    payloads,
                    skip_until_acquired_by,
                } => {
                    if let Some(acquire_index) = skip_until_acquired_by {
                        if skip.get(*acquire_index).copied().unwrap_or(false) {
                            continue;
                        }
                    }
                    if let Err(err) = extract_container(state, *container, payloads) {
                        let id = &state.manifest.containers[*container].id;
                        warn!(container = %id, error = %err, "failed to extract container");
                        failure = Some(err);
                    }
                }
                CacheAction::AcquirePayload { payload, .. } => {
                    let payload = &state.manifest.payloads[*payload];
                    let staged = state.cache.unverified_path(&payload.key);
                    if let Err(err) = acquire(
                        state,
                        &payload.key,
                        &payload.source_path,
                        payload.download_url.as_deref(),
                        payload.size,
                        &staged,
                        &mut overall_progress,
                    ) {
                        warn!(payload = %payload.key, error = %err, "failed to acquire payload");
                        failure = Some(err);
                    }
                }
                CacheAction::CachePayload {
                    package,
                    payload,
                    move_file,
                    try_again_index,
                } => {
                    let outcome = cache_or_layout_payload(
                        state,
                        *package,
                        *payload,
                        None,
                        *move_file,
                        try_again_attempts[index],
                    );
                    handle_payload_outcome(
                        outcome,
                        index,
                        *try_again_index,
                        &mut try_again_attempts,
                        &mut retry_payload_index,
                        &mut failure,
                    );
                }
                CacheAction::LayoutPayload {
                    package,
                    payload,
                    layout_dir,
                    move_file,
                    try_again_index,
                } => {
                    let outcome = cache_or_layout_payload(
                        state,
                        package.unwrap_or(INVALID_ACTION_INDEX),
                        *payload,
                        Some(layout_dir),
                        *move_file,
                        try_again_attempts[index],
                    );
                    handle_payload_outcome(
                        outcome,
                        index,
                        *try_again_index,
                        &mut try_again_attempts,
                        &mut retry_payload_index,
                        &mut failure,
                    );
                }
                CacheAction::PackageStop { package } => {
                    let id = &state.manifest.packages[*package].id;
                    let now = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                    if state
                        .ux
                        .on_apply_progress(now, state.plan.overall_ticks_total)
                        .is_cancel()
                    {
                        failure = Some(EmberError::UserExit);
                    } else {
                        state
                            .ux
                            .on_cache_package_complete(id, true, UxAction::NoAction);
                        started = None;
                    }
                }
                CacheAction::Syncpoint { event } => {
                    event.set();
                }
                CacheAction::RollbackPackage { .. } => {
                    return Err(EmberError::Fatal(
                        "rollback action in forward cache plan".to_string(),
                    ));
                }
            }
        }

        if let Some(redo) = retry_payload_index {
            info!("retrying payload acquisition");
            skip[redo] = false;
            retry_index = Some(redo);
            continue;
        }

        if let Some((start_anchor, complete_anchor, package)) = started {
            let package = &state.manifest.packages[package];
            let success = failure.is_none();
            let recommendation = if success || package.vital {
                UxAction::NoAction
            } else {
                UxAction::Ignore
            };
            let decision =
                state
                    .ux
                    .on_cache_package_complete(&package.id, success, recommendation);

            if let Some(err) = failure {
                match decision {
                    UxAction::Retry => {
                        info!(package = %package.id, "retrying package cache");
                        retry_index = Some(start_anchor);
                        continue;
                    }
                    UxAction::Ignore
                        if !package.vital && complete_anchor != INVALID_ACTION_INDEX =>
                    {
                        info!(
                            package = %package.id,
                            "continuing past non-vital package cache failure"
                        );
                        let now = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                        state
                            .ux
                            .on_apply_progress(now, state.plan.overall_ticks_total);
                        retry_index = Some(complete_anchor + 1);
                        continue;
                    }
                    _ => return Err(err),
                }
            }
        } else if let Some(err) = failure {
            return Err(err);
        }

        return Ok(());
    }
}

/// Source resolution per acquisition: absolute-or-resolved local copy
/// first, then the UX decides, then download.
fn acquire(
    state: &EngineState,
    key: &str,
    source_path: &str,
    download: Option<&str>,
    size: u64,
    staged: &PathBuf,
    overall_progress: &mut u64,
) -> EmberResult<()> {
    let total = state.plan.cache_size_total;

    loop {
        let local = resolve_local_source(state, source_path)?;
        if local.is_file() {
            if state.ux.on_cache_acquire_begin(key, &local.display().to_string()).is_cancel() {
                return Err(EmberError::UserExit);
            }
            let copied = copy_local(
                &local,
                staged,
                &progress_bridge(state, key, *overall_progress, total),
                &state.cancel,
            )?;
            *overall_progress += if copied > 0 { copied } else { size };
            state.ux.on_cache_acquire_complete(key, true);
            return Ok(());
        }

        let decision = state
            .ux
            .on_resolve_source(key, &local.display().to_string(), download);
        match decision {
            UxAction::Retry => continue,
            UxAction::Cancel => return Err(EmberError::UserExit),
            UxAction::Download | UxAction::NoAction => {
                let Some(url) = download else {
                    if decision == UxAction::Download {
                        // asked to download without a URL to download from
                        return Err(EmberError::Validation(format!(
                            "no download URL for '{key}'"
                        )));
                    }
                    return Err(EmberError::NotFound(local.display().to_string()));
                };
                if state.ux.on_cache_acquire_begin(key, url).is_cancel() {
                    return Err(EmberError::UserExit);
                }
                let downloaded = download_url(
                    url,
                    staged,
                    &progress_bridge(state, key, *overall_progress, total),
                    &state.cancel,
                )?;
                *overall_progress += if downloaded > 0 { downloaded } else { size };
                state.ux.on_cache_acquire_complete(key, true);
                return Ok(());
            }
            _ => {
                return Err(EmberError::NotFound(local.display().to_string()));
            }
        }
    }
}

fn resolve_local_source(state: &EngineState, source_path: &str) -> EmberResult<PathBuf> {
    let path = PathBuf::from(source_path);
    if path.is_absolute() {
        return Ok(path);
    }
    let base = state
        .variables
        .get_string(VARIABLE_SOURCE_FOLDER)
        .unwrap_or_default();
    Ok(PathBuf::from(base).join(path))
}

fn progress_bridge<'a>(
    state: &'a EngineState,
    key: &'a str,
    overall_base: u64,
    overall_total: u64,
) -> impl Fn(Progress) + 'a {
    move |progress| {
        let (current, total) = match progress {
            Progress::Starting { total } => (0, total),
            Progress::Chunk { current, total } => (current, total),
            Progress::Complete { total } => (total, total),
        };
        let decision = state.ux.on_cache_acquire_progress(
            key,
            current,
            total,
            overall_base + current,
            overall_total,
        );
        if decision.is_cancel() {
            state.cancel.cancel();
        }
    }
}

fn extract_container(
    state: &EngineState,
    container_index: usize,
    wanted: &[usize],
) -> EmberResult<()> {
    let container = &state.manifest.containers[container_index];
    let staged = state.cache.unverified_path(&container.id);

    let stream: Vec<_> = container
        .stream
        .iter()
        .map(|&payload_index| {
            let payload = &state.manifest.payloads[payload_index];
            let destination = wanted
                .contains(&payload_index)
                .then(|| state.cache.unverified_path(&payload.key));
            (payload, destination)
        })
        .collect();

    state.extractor.extract(container, &stream, &staged)
}

enum PayloadOutcome {
    Done,
    TryAgain,
    Failed(EmberError),
}

/// Verify-and-place with the UX decision loop: `Retry` re-verifies,
/// `TryAgain` re-acquires (up to the recommended ceiling), anything
/// else fails.
fn cache_or_layout_payload(
    state: &EngineState,
    package_index: PackageIndex,
    payload_index: usize,
    layout_dir: Option<&PathBuf>,
    move_file: bool,
    attempts_so_far: u32,
) -> PayloadOutcome {
    let payload: &Payload = &state.manifest.payloads[payload_index];
    let staged = state.cache.unverified_path(&payload.key);

    loop {
        let result = match layout_dir {
            Some(layout_dir) => {
                state
                    .cache
                    .layout_payload(payload, layout_dir, &staged, move_file)
            }
            None => {
                let package = &state.manifest.packages[package_index];
                if package.per_machine && state.elevated.is_some() {
                    let conn = state.elevated.as_ref().unwrap();
                    elevation::cache_complete_payload(
                        conn,
                        &package.id,
                        &payload.key,
                        &staged,
                        move_file,
                    )
                } else {
                    state
                        .cache
                        .complete_payload(payload, &package.cache_id, &staged, move_file)
                }
            }
        };

        match result {
            Ok(()) => {
                state.ux.on_cache_verify_complete(&payload.key, true);
                return PayloadOutcome::Done;
            }
            Err(err @ EmberError::VerifyFailed { .. }) => {
                warn!(payload = %payload.key, "payload verification failed");
                match state.ux.on_cache_verify_complete(&payload.key, false) {
                    UxAction::Retry => continue,
                    UxAction::TryAgain
                        if attempts_so_far < CACHE_MAX_RECOMMENDED_VERIFY_TRYAGAIN_ATTEMPTS =>
                    {
                        return PayloadOutcome::TryAgain;
                    }
                    _ => return PayloadOutcome::Failed(err),
                }
            }
            Err(err) => return PayloadOutcome::Failed(err),
        }
    }
}

fn handle_payload_outcome(
    outcome: PayloadOutcome,
    action_index: usize,
    try_again_index: usize,
    try_again_attempts: &mut [u32],
    retry_payload_index: &mut Option<usize>,
    failure: &mut Option<EmberError>,
) {
    match outcome {
        PayloadOutcome::Done => {}
        PayloadOutcome::TryAgain => {
            try_again_attempts[action_index] += 1;
            *retry_payload_index = Some(try_again_index);
        }
        PayloadOutcome::Failed(err) => *failure = Some(err),
    }
}

fn layout_bundle(
    state: &EngineState,
    executable_name: &str,
    layout_dir: &PathBuf,
) -> EmberResult<()> {
    let current = std::env::current_exe()
        .map_err(|e| EmberError::NotFound(format!("own executable: {e}")))?;
    state.cache.layout_bundle(executable_name, layout_dir, &current)
}

/// Scans the rollback-cache list to the failing checkpoint and
/// removes everything staged before it.
pub fn do_rollback_cache(state: &EngineState, checkpoint: u32) {
    let actions = &state.plan.rollback_cache_actions;
    let Some(stop) = actions
        .iter()
        .position(|a| a.checkpoint_id() == Some(checkpoint))
    else {
        return;
    };

    info!(checkpoint, "rolling back cache");
    for action in actions[..stop].iter().rev() {
        match action {
            CacheAction::Checkpoint { .. } => {}
            CacheAction::RollbackPackage { package } => {
                let package = &state.manifest.packages[*package];
                if let Err(err) = clean_package(state, package) {
                    warn!(package = %package.id, error = %err, "rollback uncache failed");
                }
            }
            _ => {
                warn!("unexpected rollback cache action");
            }
        }
    }
}

/// Removes a package's cached files, on the elevated side when the
/// package is per-machine.
pub fn clean_package(
    state: &EngineState,
    package: &ember_core::manifest::Package,
) -> EmberResult<()> {
    if package.per_machine {
        if let Some(conn) = &state.elevated {
            return elevation::clean_package(conn, &package.cache_id);
        }
    }
    state.cache.remove_package(&package.cache_id)
}
