//! Recording UX used by tests and diagnostics.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use crate::{
    state::{ActionState, PackageState, RequestState, Restart},
    ux::{Ux, UxAction},
};

/// One recorded callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UxRecord {
    DetectBegin { package_count: usize },
    DetectPackageComplete { package_id: String, state: PackageState },
    DetectComplete { success: bool },
    PlanBegin { package_count: usize },
    PlanPackageBegin { package_id: String, requested: RequestState },
    PlanPackageComplete {
        package_id: String,
        requested: RequestState,
        execute: ActionState,
        rollback: ActionState,
    },
    PlanComplete { success: bool },
    ApplyBegin,
    ApplyProgress { ticks: u32, total_ticks: u32 },
    ApplyComplete { success: bool, restart: Restart },
    RegisterBegin,
    UnregisterComplete { success: bool },
    CacheBegin,
    CachePackageBegin { package_id: String },
    CacheAcquireProgress { payload_key: String, current: u64, total: u64 },
    CacheVerifyComplete { payload_key: String, success: bool },
    CachePackageComplete { package_id: String, success: bool },
    CacheComplete { success: bool },
    ResolveSource { payload_key: String, local_source: String },
    ExecuteBegin { package_count: usize },
    ExecutePackageBegin { package_id: String, forward: bool },
    ExecuteProgress { package_id: String, overall_percent: u8 },
    Error { package_id: String, code: i32 },
    ExecutePackageComplete { package_id: String, success: bool, restart: Restart },
    ExecuteComplete { success: bool },
}

/// A UX that records every callback and replays scripted decisions.
///
/// Responses are queued per callback name; when a queue runs dry the
/// callback falls back to the engine recommendation, so a test only
/// scripts the decisions it is about.
#[derive(Default)]
pub struct CollectorUx {
    records: Mutex<Vec<UxRecord>>,
    responses: Mutex<HashMap<&'static str, VecDeque<UxAction>>>,
    plan_overrides: Mutex<HashMap<String, RequestState>>,
}

impl CollectorUx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `action` as the next response for the named callback
    /// (e.g. `"on_execute_package_complete"`).
    pub fn push_response(&self, callback: &'static str, action: UxAction) {
        self.responses
            .lock()
            .unwrap()
            .entry(callback)
            .or_default()
            .push_back(action);
    }

    /// Makes `on_plan_package_begin` override the requested state for
    /// the given package.
    pub fn override_request(&self, package_id: &str, requested: RequestState) {
        self.plan_overrides
            .lock()
            .unwrap()
            .insert(package_id.to_string(), requested);
    }

    pub fn records(&self) -> Vec<UxRecord> {
        self.records.lock().unwrap().clone()
    }

    fn record(&self, record: UxRecord) {
        self.records.lock().unwrap().push(record);
    }

    fn next_response(&self, callback: &'static str, fallback: UxAction) -> UxAction {
        self.responses
            .lock()
            .unwrap()
            .get_mut(callback)
            .and_then(VecDeque::pop_front)
            .unwrap_or(fallback)
    }
}

impl Ux for CollectorUx {
    fn on_detect_begin(&self, package_count: usize) -> UxAction {
        self.record(UxRecord::DetectBegin { package_count });
        self.next_response("on_detect_begin", UxAction::NoAction)
    }

    fn on_detect_package_complete(&self, package_id: &str, state: PackageState) {
        self.record(UxRecord::DetectPackageComplete {
            package_id: package_id.to_string(),
            state,
        });
    }

    fn on_detect_complete(&self, success: bool) {
        self.record(UxRecord::DetectComplete { success });
    }

    fn on_plan_begin(&self, package_count: usize) -> UxAction {
        self.record(UxRecord::PlanBegin { package_count });
        self.next_response("on_plan_begin", UxAction::NoAction)
    }

    fn on_plan_package_begin(&self, package_id: &str, requested: &mut RequestState) -> UxAction {
        if let Some(overridden) = self.plan_overrides.lock().unwrap().get(package_id) {
            *requested = *overridden;
        }
        self.record(UxRecord::PlanPackageBegin {
            package_id: package_id.to_string(),
            requested: *requested,
        });
        self.next_response("on_plan_package_begin", UxAction::NoAction)
    }

    fn on_plan_package_complete(
        &self,
        package_id: &str,
        _state: PackageState,
        requested: RequestState,
        execute: ActionState,
        rollback: ActionState,
    ) {
        self.record(UxRecord::PlanPackageComplete {
            package_id: package_id.to_string(),
            requested,
            execute,
            rollback,
        });
    }

    fn on_plan_complete(&self, success: bool) {
        self.record(UxRecord::PlanComplete { success });
    }

    fn on_apply_begin(&self) -> UxAction {
        self.record(UxRecord::ApplyBegin);
        self.next_response("on_apply_begin", UxAction::NoAction)
    }

    fn on_apply_progress(&self, ticks: u32, total_ticks: u32) -> UxAction {
        self.record(UxRecord::ApplyProgress { ticks, total_ticks });
        self.next_response("on_apply_progress", UxAction::NoAction)
    }

    fn on_apply_complete(&self, success: bool, restart: Restart) -> UxAction {
        self.record(UxRecord::ApplyComplete { success, restart });
        self.next_response("on_apply_complete", UxAction::NoAction)
    }

    fn on_register_begin(&self) -> UxAction {
        self.record(UxRecord::RegisterBegin);
        self.next_response("on_register_begin", UxAction::NoAction)
    }

    fn on_unregister_complete(&self, success: bool) {
        self.record(UxRecord::UnregisterComplete { success });
    }

    fn on_cache_begin(&self) -> UxAction {
        self.record(UxRecord::CacheBegin);
        self.next_response("on_cache_begin", UxAction::NoAction)
    }

    fn on_cache_package_begin(
        &self,
        package_id: &str,
        _payload_count: usize,
        _payload_size_total: u64,
    ) -> UxAction {
        self.record(UxRecord::CachePackageBegin {
            package_id: package_id.to_string(),
        });
        self.next_response("on_cache_package_begin", UxAction::NoAction)
    }

    fn on_cache_acquire_progress(
        &self,
        payload_key: &str,
        current: u64,
        total: u64,
        _overall: u64,
        _overall_total: u64,
    ) -> UxAction {
        self.record(UxRecord::CacheAcquireProgress {
            payload_key: payload_key.to_string(),
            current,
            total,
        });
        self.next_response("on_cache_acquire_progress", UxAction::NoAction)
    }

    fn on_cache_verify_complete(&self, payload_key: &str, success: bool) -> UxAction {
        self.record(UxRecord::CacheVerifyComplete {
            payload_key: payload_key.to_string(),
            success,
        });
        self.next_response("on_cache_verify_complete", UxAction::NoAction)
    }

    fn on_cache_package_complete(
        &self,
        package_id: &str,
        success: bool,
        recommendation: UxAction,
    ) -> UxAction {
        self.record(UxRecord::CachePackageComplete {
            package_id: package_id.to_string(),
            success,
        });
        self.next_response("on_cache_package_complete", recommendation)
    }

    fn on_cache_complete(&self, success: bool) {
        self.record(UxRecord::CacheComplete { success });
    }

    fn on_resolve_source(
        &self,
        payload_key: &str,
        local_source: &str,
        _download_url: Option<&str>,
    ) -> UxAction {
        self.record(UxRecord::ResolveSource {
            payload_key: payload_key.to_string(),
            local_source: local_source.to_string(),
        });
        self.next_response("on_resolve_source", UxAction::NoAction)
    }

    fn on_execute_begin(&self, package_count: usize) -> UxAction {
        self.record(UxRecord::ExecuteBegin { package_count });
        self.next_response("on_execute_begin", UxAction::NoAction)
    }

    fn on_execute_package_begin(&self, package_id: &str, forward: bool) -> UxAction {
        self.record(UxRecord::ExecutePackageBegin {
            package_id: package_id.to_string(),
            forward,
        });
        self.next_response("on_execute_package_begin", UxAction::NoAction)
    }

    fn on_execute_progress(
        &self,
        package_id: &str,
        _package_percent: u8,
        overall_percent: u8,
    ) -> UxAction {
        self.record(UxRecord::ExecuteProgress {
            package_id: package_id.to_string(),
            overall_percent,
        });
        self.next_response("on_execute_progress", UxAction::NoAction)
    }

    fn on_error(&self, package_id: &str, code: i32, _message: &str) -> UxAction {
        self.record(UxRecord::Error {
            package_id: package_id.to_string(),
            code,
        });
        self.next_response("on_error", UxAction::NoAction)
    }

    fn on_execute_package_complete(
        &self,
        package_id: &str,
        success: bool,
        restart: Restart,
        recommendation: UxAction,
    ) -> UxAction {
        self.record(UxRecord::ExecutePackageComplete {
            package_id: package_id.to_string(),
            success,
            restart,
        });
        self.next_response("on_execute_package_complete", recommendation)
    }

    fn on_execute_complete(&self, success: bool) {
        self.record(UxRecord::ExecuteComplete { success });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_responses_drain_in_order() {
        let ux = CollectorUx::new();
        ux.push_response("on_cache_verify_complete", UxAction::Retry);
        ux.push_response("on_cache_verify_complete", UxAction::TryAgain);

        assert_eq!(ux.on_cache_verify_complete("p1", false), UxAction::Retry);
        assert_eq!(ux.on_cache_verify_complete("p1", false), UxAction::TryAgain);
        // queue dry: falls back to the recommendation
        assert_eq!(ux.on_cache_verify_complete("p1", false), UxAction::NoAction);
    }

    #[test]
    fn test_plan_override_mutates_requested() {
        let ux = CollectorUx::new();
        ux.override_request("pkgA", RequestState::Absent);

        let mut requested = RequestState::Present;
        ux.on_plan_package_begin("pkgA", &mut requested);
        assert_eq!(requested, RequestState::Absent);

        let mut untouched = RequestState::Present;
        ux.on_plan_package_begin("pkgB", &mut untouched);
        assert_eq!(untouched, RequestState::Present);
    }

    #[test]
    fn test_records_capture_order() {
        let ux = CollectorUx::new();
        ux.on_cache_begin();
        ux.on_cache_package_begin("pkgA", 1, 100);
        ux.on_cache_complete(true);

        let records = ux.records();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], UxRecord::CacheBegin));
        assert!(matches!(records[2], UxRecord::CacheComplete { success: true }));
    }

    #[test]
    fn test_default_recommendation_honored() {
        let ux = CollectorUx::new();
        assert_eq!(
            ux.on_execute_package_complete("pkgA", false, Restart::None, UxAction::Ignore),
            UxAction::Ignore
        );
    }
}
