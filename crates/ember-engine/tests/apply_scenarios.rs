//! Applier scenarios: transactional execution, rollback, retries,
//! and registration outcomes.

mod common;

use std::sync::{Arc, Mutex};

use common::{engine_state, precache_payload, stage_source_file, MockEngine, ScriptedOutcome};
use ember_core::constants::REGISTRATION_STATE_FILE;
use ember_events::{
    BundleAction, CollectorUx, PackageState, Restart, Ux, UxAction, UxHandle, UxRecord,
};
use tempfile::TempDir;

const SINGLE_MSI: &str = r#"
<BundleManifest Id="bundle.single" Name="Single" Version="1.0.0.0" ProviderKey="bundle.single">
  <Payload Id="L1" FilePath="first.msi" Size="4" SourcePath="first.msi"/>
  <MsiPackage Id="P1" ProductCode="{11111111-0000-0000-0000-000000000001}" Version="1.0.0.0">
    <PayloadRef Id="L1"/>
  </MsiPackage>
</BundleManifest>
"#;

const TWO_VITAL_IN_NONVITAL_BOUNDARY: &str = r#"
<BundleManifest Id="bundle.pair" Name="Pair" Version="1.0.0.0" ProviderKey="bundle.pair">
  <RollbackBoundary Id="B1" Vital="no"/>
  <Payload Id="L1" FilePath="p1.bin" Size="4" SourcePath="p1.bin"/>
  <Payload Id="L2" FilePath="p2.bin" Size="4" SourcePath="p2.bin"/>
  <ExePackage Id="P1" RollbackBoundaryForward="B1" RollbackBoundaryBackward="B1"
              InstallArguments="/i" UninstallArguments="/x">
    <PayloadRef Id="L1"/>
  </ExePackage>
  <ExePackage Id="P2" InstallArguments="/i" UninstallArguments="/x">
    <PayloadRef Id="L2"/>
  </ExePackage>
</BundleManifest>
"#;

const NONVITAL_PACKAGE: &str = r#"
<BundleManifest Id="bundle.soft" Name="Soft" Version="1.0.0.0" ProviderKey="bundle.soft">
  <Payload Id="L1" FilePath="p1.bin" Size="4" SourcePath="p1.bin"/>
  <ExePackage Id="P1" Vital="no" InstallArguments="/i" UninstallArguments="/x">
    <PayloadRef Id="L1"/>
  </ExePackage>
</BundleManifest>
"#;

struct Harness {
    _dir: TempDir,
    state: ember_engine::EngineState,
    mock: Arc<MockEngine>,
    ux: Arc<CollectorUx>,
}

fn harness(manifest: &str, setup: impl FnOnce(&mut Harness)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mock = MockEngine::new();
    let ux = Arc::new(CollectorUx::new());
    let handle: UxHandle = ux.clone();
    let state = engine_state(manifest, dir.path(), handle, &mock);

    let mut harness = Harness {
        _dir: dir,
        state,
        mock,
        ux,
    };
    setup(&mut harness);
    harness
}

fn detect_plan_apply(
    harness: &mut Harness,
    action: BundleAction,
) -> ember_core::error::EmberResult<ember_engine::ApplyResult> {
    ember_engine::detect(&mut harness.state)?;
    ember_engine::plan(&mut harness.state, action)?;
    ember_engine::apply(&mut harness.state)
}

fn registration_exists(state: &ember_engine::EngineState) -> bool {
    state
        .cache
        .bundle_dir()
        .join(REGISTRATION_STATE_FILE)
        .is_file()
}

// ---- scenario: install single vital MSI, succeeds ----

#[test]
fn test_install_single_msi_succeeds_and_keeps_registration() {
    let mut harness = harness(SINGLE_MSI, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        precache_payload(&h.state, "P1", b"data");
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install).unwrap();
    assert_eq!(result.restart, Restart::None);
    assert!(!result.suspended);

    assert_eq!(harness.mock.executed_ids(), vec!["P1"]);
    assert!(registration_exists(&harness.state));

    // terminal callbacks fired with success
    let records = harness.ux.records();
    assert!(records
        .iter()
        .any(|r| matches!(r, UxRecord::ApplyComplete { success: true, .. })));
    assert!(records
        .iter()
        .any(|r| matches!(r, UxRecord::ExecuteComplete { success: true })));
}

// ---- scenario: second package fails inside a non-vital boundary ----

#[test]
fn test_failure_in_nonvital_boundary_rolls_back_and_unregisters() {
    let mut harness = harness(TWO_VITAL_IN_NONVITAL_BOUNDARY, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        h.mock.set_detect_state("P2", PackageState::Absent);
        precache_payload(&h.state, "P1", b"data");
        precache_payload(&h.state, "P2", b"data");
        h.mock.script("P2", ScriptedOutcome::Fail(1603));
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install);
    assert!(result.is_err(), "no boundary left to advance to");

    let executed = harness.mock.executed_ids();
    assert_eq!(
        executed,
        vec!["P1", "P2", "P2:rollback", "P1:rollback"],
        "rollback must mirror the executed prefix"
    );

    // the rolled-back first install also drops registration
    assert!(!registration_exists(&harness.state));
}

// ---- scenario: non-vital package failure ignored ----

#[test]
fn test_nonvital_failure_ignored_continues() {
    let mut harness = harness(NONVITAL_PACKAGE, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        precache_payload(&h.state, "P1", b"data");
        h.mock.script("P1", ScriptedOutcome::Fail(1603));
        h.ux
            .push_response("on_execute_package_complete", UxAction::Ignore);
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install).unwrap();
    assert_eq!(result.restart, Restart::None);

    // no rollback was triggered
    assert_eq!(harness.mock.executed_ids(), vec!["P1"]);
    assert!(registration_exists(&harness.state));
}

// ---- scenario: retry after failure ----

#[test]
fn test_retry_reruns_failed_package() {
    let mut harness = harness(SINGLE_MSI, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        precache_payload(&h.state, "P1", b"data");
        h.mock.script("P1", ScriptedOutcome::Fail(1603));
        h.ux
            .push_response("on_execute_package_complete", UxAction::Retry);
    });

    detect_plan_apply(&mut harness, BundleAction::Install).unwrap();
    assert_eq!(harness.mock.executed_ids(), vec!["P1", "P1"]);
}

// ---- scenario: restart folding ----

#[test]
fn test_restart_required_folds_into_apply_result() {
    let mut harness = harness(TWO_VITAL_IN_NONVITAL_BOUNDARY, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        h.mock.set_detect_state("P2", PackageState::Absent);
        precache_payload(&h.state, "P1", b"data");
        precache_payload(&h.state, "P2", b"data");
        h.mock
            .script("P1", ScriptedOutcome::Succeed(Restart::Required));
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install).unwrap();
    assert_eq!(result.restart, Restart::Required);
    // both packages still ran
    assert_eq!(harness.mock.executed_ids(), vec!["P1", "P2"]);
}

#[test]
fn test_initiated_restart_short_circuits_execution() {
    let mut harness = harness(TWO_VITAL_IN_NONVITAL_BOUNDARY, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        h.mock.set_detect_state("P2", PackageState::Absent);
        precache_payload(&h.state, "P1", b"data");
        precache_payload(&h.state, "P2", b"data");
        h.mock
            .script("P1", ScriptedOutcome::Succeed(Restart::Initiated));
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install).unwrap();
    assert_eq!(result.restart, Restart::Initiated);
    assert_eq!(harness.mock.executed_ids(), vec!["P1"]);
}

// ---- scenario: suspend ----

#[test]
fn test_suspend_records_resumable_state() {
    let mut harness = harness(SINGLE_MSI, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        precache_payload(&h.state, "P1", b"data");
        h.ux
            .push_response("on_execute_package_complete", UxAction::Suspend);
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install).unwrap();
    assert!(result.suspended);
    assert!(registration_exists(&harness.state));

    let raw = std::fs::read(
        harness
            .state
            .cache
            .bundle_dir()
            .join(REGISTRATION_STATE_FILE),
    )
    .unwrap();
    let state: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(state["suspended"], serde_json::Value::Bool(true));
}

// ---- scenario: payload acquisition through the cache thread ----

#[test]
fn test_apply_stages_payloads_before_execution() {
    let mut harness = harness(SINGLE_MSI, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        stage_source_file(h._dir.path(), "first.msi", b"data");
    });

    detect_plan_apply(&mut harness, BundleAction::Install).unwrap();

    // the payload went through unverified staging into the completed
    // area before the engine ran
    let (_, package) = harness.state.manifest.package_by_id("P1").unwrap();
    assert!(harness
        .state
        .cache
        .completed_dir(&package.cache_id)
        .join("first.msi")
        .is_file());
    assert_eq!(harness.mock.executed_ids(), vec!["P1"]);

    let records = harness.ux.records();
    assert!(records
        .iter()
        .any(|r| matches!(r, UxRecord::CachePackageBegin { .. })));
    assert!(records
        .iter()
        .any(|r| matches!(r, UxRecord::CacheComplete { success: true })));
}

// ---- scenario: missing payload source, UX resolution ----

#[test]
fn test_resolve_source_download_without_url_fails() {
    let mut harness = harness(SINGLE_MSI, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        // source never staged; UX insists on downloading
        h.ux.push_response("on_resolve_source", UxAction::Download);
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install);
    assert!(result.is_err());
    assert!(harness.mock.executed_ids().is_empty());
}

/// UX that repairs the source on its first resolve callback and asks
/// for a retry.
struct RepairingUx {
    inner: CollectorUx,
    source_dir: std::path::PathBuf,
    repaired: Mutex<bool>,
}

impl Ux for RepairingUx {
    fn on_resolve_source(
        &self,
        payload_key: &str,
        local_source: &str,
        download_url: Option<&str>,
    ) -> UxAction {
        self.inner
            .on_resolve_source(payload_key, local_source, download_url);
        let mut repaired = self.repaired.lock().unwrap();
        if !*repaired {
            *repaired = true;
            ember_utils::fs::write_file(self.source_dir.join("first.msi"), b"data").unwrap();
            UxAction::Retry
        } else {
            UxAction::NoAction
        }
    }
}

#[test]
fn test_resolve_source_retry_after_fix_succeeds() {
    let dir = TempDir::new().unwrap();
    let mock = MockEngine::new();
    mock.set_detect_state("P1", PackageState::Absent);

    let ux = Arc::new(RepairingUx {
        inner: CollectorUx::new(),
        source_dir: dir.path().join("source"),
        repaired: Mutex::new(false),
    });
    let handle: UxHandle = ux.clone();
    let mut state = engine_state(SINGLE_MSI, dir.path(), handle, &mock);

    ember_engine::detect(&mut state).unwrap();
    ember_engine::plan(&mut state, BundleAction::Install).unwrap();
    ember_engine::apply(&mut state).unwrap();

    assert!(*ux.repaired.lock().unwrap());
    assert_eq!(mock.executed_ids(), vec!["P1"]);
}

// ---- scenario: verification failure decisions ----

#[test]
fn test_verify_failure_fails_package_without_ux_help() {
    const BAD_HASH: &str = r#"
<BundleManifest Id="bundle.hash" Version="1.0.0.0" ProviderKey="bundle.hash">
  <Payload Id="L1" FilePath="p.bin" Size="4" SourcePath="p.bin"
           Hash="0000000000000000000000000000000000000000000000000000000000000000"/>
  <ExePackage Id="P1" InstallArguments="/i" UninstallArguments="/x">
    <PayloadRef Id="L1"/>
  </ExePackage>
</BundleManifest>
"#;
    let mut harness = harness(BAD_HASH, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        stage_source_file(h._dir.path(), "p.bin", b"data");
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install);
    assert!(result.is_err());
    assert!(harness.mock.executed_ids().is_empty());

    let records = harness.ux.records();
    assert!(records
        .iter()
        .any(|r| matches!(r, UxRecord::CacheVerifyComplete { success: false, .. })));
}

// ---- scenario: cancellation from a progress callback ----

#[test]
fn test_cancel_during_acquire_aborts_apply() {
    let mut harness = harness(SINGLE_MSI, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        stage_source_file(h._dir.path(), "first.msi", b"data");
        h.ux
            .push_response("on_cache_acquire_progress", UxAction::Cancel);
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install);
    assert!(result.is_err());
    assert!(result.err().unwrap().is_user_exit());
    assert!(harness.mock.executed_ids().is_empty());
}

// ---- scenario: cache failure rolls staged packages back ----

#[test]
fn test_cache_failure_uncaches_earlier_packages() {
    let mut harness = harness(TWO_VITAL_IN_NONVITAL_BOUNDARY, |h| {
        h.mock.set_detect_state("P1", PackageState::Absent);
        h.mock.set_detect_state("P2", PackageState::Absent);
        // P1's source exists; P2's never will
        stage_source_file(h._dir.path(), "p1.bin", b"data");
    });

    let result = detect_plan_apply(&mut harness, BundleAction::Install);
    assert!(result.is_err());

    // rollback-cache runs strictly before the failing checkpoint:
    // everything staged so far is gone again
    let (_, p1) = harness.state.manifest.package_by_id("P1").unwrap();
    assert!(!harness.state.cache.completed_dir(&p1.cache_id).exists());

    // a forward execution of P1 may have raced the failure, but its
    // rollback mirror must have followed it
    let executed = harness.mock.executed_ids();
    if executed.contains(&"P1".to_string()) {
        assert!(executed.contains(&"P1:rollback".to_string()));
    }
    assert!(!executed.contains(&"P2".to_string()));
}

// ---- uninstall cleans the cache ----

#[test]
fn test_uninstall_removes_registration_and_cached_files() {
    let mut harness = harness(SINGLE_MSI, |h| {
        h.mock.set_detect_state("P1", PackageState::Present);
        precache_payload(&h.state, "P1", b"data");
    });
    // simulate a prior completed install
    harness.state.registration.installed = true;
    harness.state.registration.register(&harness.state.cache).unwrap();

    detect_plan_apply(&mut harness, BundleAction::Uninstall).unwrap();

    assert_eq!(harness.mock.executed_ids(), vec!["P1"]);
    assert!(!registration_exists(&harness.state));

    let (_, package) = harness.state.manifest.package_by_id("P1").unwrap();
    assert!(!harness
        .state
        .cache
        .completed_dir(&package.cache_id)
        .exists());
}
