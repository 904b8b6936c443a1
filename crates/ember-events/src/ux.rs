//! The pluggable user experience.
//!
//! The engine drives every long-running operation through these
//! callbacks and honors the decision each one returns. The default
//! implementations make a do-nothing UX that lets operations run to
//! completion, so frontends only override the callbacks they care
//! about.

use crate::state::{ActionState, PackageState, RequestState, Restart};

/// Decision returned from a UX callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UxAction {
    /// Proceed with whatever the engine recommended.
    #[default]
    NoAction,
    Ok,
    /// Abort the surrounding operation; surfaces as a user-exit error.
    Cancel,
    /// Redo the failed step (re-verify, re-execute, ...).
    Retry,
    /// Skip past a non-vital failure.
    Ignore,
    /// Re-acquire the payload from its source, then verify again.
    TryAgain,
    /// Resolve a missing source by downloading it.
    Download,
    /// End execution now and record a suspended resume state.
    Suspend,
    /// Restart the machine once apply completes.
    Restart,
}

impl UxAction {
    /// True when the decision aborts the surrounding operation.
    pub fn is_cancel(self) -> bool {
        matches!(self, UxAction::Cancel)
    }
}

/// Lifecycle callbacks with decisions.
///
/// Terminal `on_*_complete` callbacks fire on every path, including
/// failure, so the UX can always display a result.
#[allow(unused_variables)]
pub trait Ux: Send + Sync {
    // ---- detect ----

    fn on_detect_begin(&self, package_count: usize) -> UxAction {
        UxAction::NoAction
    }

    fn on_detect_package_begin(&self, package_id: &str) -> UxAction {
        UxAction::NoAction
    }

    fn on_detect_package_complete(&self, package_id: &str, state: PackageState) {}

    fn on_detect_complete(&self, success: bool) {}

    // ---- plan ----

    fn on_plan_begin(&self, package_count: usize) -> UxAction {
        UxAction::NoAction
    }

    /// The UX may mutate `requested` to override the default request
    /// state the planner computed for the package.
    fn on_plan_package_begin(&self, package_id: &str, requested: &mut RequestState) -> UxAction {
        UxAction::NoAction
    }

    fn on_plan_package_complete(
        &self,
        package_id: &str,
        state: PackageState,
        requested: RequestState,
        execute: ActionState,
        rollback: ActionState,
    ) {
    }

    fn on_plan_complete(&self, success: bool) {}

    // ---- apply ----

    fn on_apply_begin(&self) -> UxAction {
        UxAction::NoAction
    }

    /// Overall progress in package ticks across cache and execute.
    fn on_apply_progress(&self, ticks: u32, total_ticks: u32) -> UxAction {
        UxAction::NoAction
    }

    /// May return [`UxAction::Restart`] to request a machine restart.
    fn on_apply_complete(&self, success: bool, restart: Restart) -> UxAction {
        UxAction::NoAction
    }

    fn on_elevate_begin(&self) -> UxAction {
        UxAction::NoAction
    }

    fn on_elevate_complete(&self, success: bool) {}

    fn on_register_begin(&self) -> UxAction {
        UxAction::NoAction
    }

    fn on_register_complete(&self, success: bool) {}

    fn on_unregister_begin(&self) {}

    fn on_unregister_complete(&self, success: bool) {}

    // ---- cache ----

    fn on_cache_begin(&self) -> UxAction {
        UxAction::NoAction
    }

    fn on_cache_package_begin(
        &self,
        package_id: &str,
        payload_count: usize,
        payload_size_total: u64,
    ) -> UxAction {
        UxAction::NoAction
    }

    fn on_cache_acquire_begin(&self, payload_key: &str, source: &str) -> UxAction {
        UxAction::NoAction
    }

    /// `current`/`total` are per-file bytes; `overall`/`overall_total`
    /// are cumulative bytes toward the bundle total. Returning
    /// [`UxAction::Cancel`] sets the cooperative cancel flag observed
    /// by the in-flight copy or download.
    fn on_cache_acquire_progress(
        &self,
        payload_key: &str,
        current: u64,
        total: u64,
        overall: u64,
        overall_total: u64,
    ) -> UxAction {
        UxAction::NoAction
    }

    fn on_cache_acquire_complete(&self, payload_key: &str, success: bool) {}

    /// Fired after payload verification. On failure the UX may return
    /// [`UxAction::Retry`] to re-verify or [`UxAction::TryAgain`] to
    /// re-acquire the payload from its source.
    fn on_cache_verify_complete(&self, payload_key: &str, success: bool) -> UxAction {
        UxAction::NoAction
    }

    /// `recommendation` is what the engine would do on its own:
    /// [`UxAction::Ignore`] for failed non-vital packages, otherwise
    /// [`UxAction::NoAction`].
    fn on_cache_package_complete(
        &self,
        package_id: &str,
        success: bool,
        recommendation: UxAction,
    ) -> UxAction {
        recommendation
    }

    fn on_cache_complete(&self, success: bool) {}

    /// A payload (or container) source could not be found. The UX may
    /// return [`UxAction::Retry`] after fixing the local path,
    /// [`UxAction::Download`] to use the download URL, or anything
    /// else to give up.
    fn on_resolve_source(
        &self,
        payload_key: &str,
        local_source: &str,
        download_url: Option<&str>,
    ) -> UxAction {
        UxAction::NoAction
    }

    // ---- execute ----

    fn on_execute_begin(&self, package_count: usize) -> UxAction {
        UxAction::NoAction
    }

    fn on_execute_package_begin(&self, package_id: &str, forward: bool) -> UxAction {
        UxAction::NoAction
    }

    fn on_execute_progress(
        &self,
        package_id: &str,
        package_percent: u8,
        overall_percent: u8,
    ) -> UxAction {
        UxAction::NoAction
    }

    fn on_error(&self, package_id: &str, code: i32, message: &str) -> UxAction {
        UxAction::NoAction
    }

    fn on_execute_files_in_use(&self, package_id: &str, files: &[String]) -> UxAction {
        UxAction::NoAction
    }

    /// `recommendation` is [`UxAction::Ignore`] when the failed package
    /// is non-vital. Returning [`UxAction::Retry`] re-runs the package,
    /// [`UxAction::Suspend`] ends execution and records suspended
    /// state.
    fn on_execute_package_complete(
        &self,
        package_id: &str,
        success: bool,
        restart: Restart,
        recommendation: UxAction,
    ) -> UxAction {
        recommendation
    }

    fn on_execute_complete(&self, success: bool) {}
}

/// Do-nothing UX for headless operation.
pub struct NullUx;

impl Ux for NullUx {}
