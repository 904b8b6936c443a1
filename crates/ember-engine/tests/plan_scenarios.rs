//! Planner scenarios: action sequences, mirrors, and invariants.

mod common;

use std::sync::Arc;

use common::{engine_state, precache_payload, MockEngine};
use ember_engine::plan::{CacheAction, ExecuteAction};
use ember_events::{
    ActionState, BundleAction, CollectorUx, PackageState, RequestState, UxHandle,
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

const TWO_IN_BOUNDARY: &str = r#"
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

fn planned(
    manifest: &str,
    action: BundleAction,
    setup: impl FnOnce(&mut ember_engine::EngineState, &Arc<MockEngine>, &Arc<CollectorUx>),
) -> (TempDir, ember_engine::EngineState, Arc<MockEngine>, Arc<CollectorUx>) {
    let dir = TempDir::new().unwrap();
    let mock = MockEngine::new();
    let ux = Arc::new(CollectorUx::new());
    let handle: UxHandle = ux.clone();
    let mut state = engine_state(manifest, dir.path(), handle, &mock);

    setup(&mut state, &mock, &ux);

    ember_engine::detect(&mut state).unwrap();
    ember_engine::plan(&mut state, action).unwrap();
    (dir, state, mock, ux)
}

// ---- invariant helpers ----

fn execute_checkpoints(actions: &[ExecuteAction]) -> Vec<u32> {
    actions.iter().filter_map(|a| a.checkpoint_id()).collect()
}

fn assert_plan_symmetry(state: &ember_engine::EngineState) {
    let plan = &state.plan;
    let forward = execute_checkpoints(&plan.execute_actions);
    let mut backward: Vec<u32> = plan
        .rollback_actions
        .iter()
        .rev()
        .filter_map(|a| a.checkpoint_id())
        .collect();

    // strictly increasing forward
    for pair in forward.windows(2) {
        assert!(pair[0] < pair[1], "execute checkpoints not increasing: {forward:?}");
    }
    // strictly decreasing in rollback execution order, pairwise equal
    for pair in backward.windows(2) {
        assert!(pair[0] > pair[1], "rollback checkpoints not decreasing: {backward:?}");
    }
    backward.reverse();
    assert_eq!(forward, backward, "checkpoint sets differ");

    // every execute checkpoint pairs with a rollback position whose
    // backward scan yields it, and the package actions match
    for (index, action) in plan.execute_actions.iter().enumerate() {
        let ExecuteAction::ExecutePackage { package, .. } = action else {
            continue;
        };
        let checkpoint = plan.execute_actions[..index]
            .iter()
            .rev()
            .find_map(|a| a.checkpoint_id())
            .expect("package action without a preceding checkpoint");
        let mirror = plan
            .rollback_actions
            .iter()
            .position(|a| a.checkpoint_id() == Some(checkpoint))
            .expect("missing rollback checkpoint");
        let mirrored_package = plan.rollback_actions[..mirror]
            .iter()
            .rev()
            .find_map(|a| match a {
                ExecuteAction::ExecutePackage { package, .. } => Some(*package),
                _ => None,
            });
        if let Some(mirrored_package) = mirrored_package {
            assert_eq!(
                *package, mirrored_package,
                "checkpoint {checkpoint} pairs different packages"
            );
        }
    }
}

// ---- scenarios ----

#[test]
fn test_install_single_vital_msi_plan_shape() {
    let (_dir, state, _mock, _ux) = planned(SINGLE_MSI, BundleAction::Install, |state, mock, _| {
        mock.set_detect_state("P1", PackageState::Absent);
        precache_payload(state, "P1", b"data");
    });

    let plan = &state.plan;
    assert!(matches!(
        plan.execute_actions.as_slice(),
        [
            ExecuteAction::Registration { keep: true },
            ExecuteAction::Checkpoint { id: 1 },
            ExecuteAction::ExecutePackage {
                package: 0,
                action: ActionState::Install,
            },
        ]
    ));
    assert!(matches!(
        plan.rollback_actions.as_slice(),
        [
            ExecuteAction::Registration { keep: false },
            ExecuteAction::ExecutePackage {
                package: 0,
                action: ActionState::Uninstall,
            },
            ExecuteAction::Checkpoint { id: 1 },
        ]
    ));
    // fully cached: no cache span, no sync-point
    assert!(plan.cache_actions.is_empty());
    assert_plan_symmetry(&state);
}

#[test]
fn test_cache_plan_contiguous_per_package() {
    let (_dir, state, _mock, _ux) =
        planned(TWO_IN_BOUNDARY, BundleAction::Install, |_, mock, _| {
            mock.set_detect_state("P1", PackageState::Absent);
            mock.set_detect_state("P2", PackageState::Absent);
        });

    let plan = &state.plan;
    // per package: Checkpoint, PackageStart, Acquire, CachePayload,
    // PackageStop, Syncpoint
    let mut open: Option<usize> = None;
    let mut spans = 0;
    for action in &plan.cache_actions {
        match action {
            CacheAction::PackageStart { package, .. } => {
                assert!(open.is_none(), "package start inside another span");
                open = Some(*package);
                spans += 1;
            }
            CacheAction::PackageStop { package } => {
                assert_eq!(open, Some(*package), "stop does not match start");
                open = None;
            }
            CacheAction::AcquirePayload { package, .. } => {
                assert_eq!(package.unwrap(), open.unwrap(), "acquire outside its span");
            }
            CacheAction::CachePayload { package, .. } => {
                assert_eq!(*package, open.unwrap(), "cache outside its span");
            }
            _ => {}
        }
    }
    assert!(open.is_none());
    assert_eq!(spans, 2);

    // the start anchor points at the matching stop
    for (index, action) in plan.cache_actions.iter().enumerate() {
        if let CacheAction::PackageStart { complete_index, package, .. } = action {
            assert!(matches!(
                plan.cache_actions[*complete_index],
                CacheAction::PackageStop { package: stop } if stop == *package
            ));
            assert!(*complete_index > index);
        }
    }
}

#[test]
fn test_rollback_cache_mirror_keyed_on_checkpoints() {
    let (_dir, state, _mock, _ux) =
        planned(TWO_IN_BOUNDARY, BundleAction::Install, |_, mock, _| {
            mock.set_detect_state("P1", PackageState::Absent);
            mock.set_detect_state("P2", PackageState::Absent);
        });

    let plan = &state.plan;
    let execute_ids = execute_checkpoints(&plan.execute_actions);
    let rollback_cache_ids: Vec<u32> = plan
        .rollback_cache_actions
        .iter()
        .filter_map(|a| a.checkpoint_id())
        .collect();
    assert_eq!(execute_ids, rollback_cache_ids);

    // each RollbackPackage precedes its checkpoint, so a failure at
    // that checkpoint uncaches the package
    for (index, action) in plan.rollback_cache_actions.iter().enumerate() {
        if let CacheAction::Checkpoint { .. } = action {
            assert!(matches!(
                plan.rollback_cache_actions[index - 1],
                CacheAction::RollbackPackage { .. }
            ));
        }
    }
    assert_plan_symmetry(&state);
}

#[test]
fn test_uninstall_reverses_package_order() {
    let (_dir, state, _mock, _ux) =
        planned(TWO_IN_BOUNDARY, BundleAction::Uninstall, |_, mock, _| {
            mock.set_detect_state("P1", PackageState::Present);
            mock.set_detect_state("P2", PackageState::Present);
        });

    let order: Vec<usize> = state
        .plan
        .execute_actions
        .iter()
        .filter_map(|a| match a {
            ExecuteAction::ExecutePackage { package, action } => {
                assert_eq!(*action, ActionState::Uninstall);
                Some(*package)
            }
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![1, 0], "uninstall must run the chain backward");

    // remove-registration lands after the last non-permanent package
    let registration = state
        .plan
        .execute_actions
        .iter()
        .position(|a| matches!(a, ExecuteAction::Registration { keep: false }))
        .expect("uninstall must remove registration");
    let last_package = state
        .plan
        .execute_actions
        .iter()
        .rposition(|a| matches!(a, ExecuteAction::ExecutePackage { .. }))
        .unwrap();
    assert!(registration > last_package);
    assert_plan_symmetry(&state);
}

#[test]
fn test_ux_override_drops_package_from_plan() {
    let (_dir, state, _mock, _ux) =
        planned(TWO_IN_BOUNDARY, BundleAction::Install, |_, mock, ux| {
            mock.set_detect_state("P1", PackageState::Absent);
            mock.set_detect_state("P2", PackageState::Absent);
            ux.override_request("P2", RequestState::None);
        });

    let planned_packages: Vec<usize> = state
        .plan
        .execute_actions
        .iter()
        .filter_map(|a| match a {
            ExecuteAction::ExecutePackage { package, .. } => Some(*package),
            _ => None,
        })
        .collect();
    assert_eq!(planned_packages, vec![0]);
    assert_eq!(state.plan.package_states[1].requested, RequestState::None);
    assert_eq!(state.plan.package_states[1].execute, ActionState::None);
}

#[test]
fn test_install_condition_false_requests_absent() {
    const CONDITIONAL: &str = r#"
<BundleManifest Id="bundle.cond" Version="1.0.0.0" ProviderKey="bundle.cond">
  <Payload Id="L1" FilePath="p.bin" Size="4" SourcePath="p.bin"/>
  <ExePackage Id="P1" InstallCondition="NeverSet = 1" InstallArguments="/i" UninstallArguments="/x">
    <PayloadRef Id="L1"/>
  </ExePackage>
</BundleManifest>
"#;
    let (_dir, state, _mock, _ux) = planned(CONDITIONAL, BundleAction::Install, |_, mock, _| {
        mock.set_detect_state("P1", PackageState::Present);
    });

    assert_eq!(state.plan.package_states[0].requested, RequestState::Absent);
    assert_eq!(state.plan.package_states[0].execute, ActionState::Uninstall);
}

#[test]
fn test_planning_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mock = MockEngine::new();
    let ux = Arc::new(CollectorUx::new());
    let handle: UxHandle = ux.clone();
    let mut state = engine_state(TWO_IN_BOUNDARY, dir.path(), handle, &mock);
    mock.set_detect_state("P1", PackageState::Absent);
    mock.set_detect_state("P2", PackageState::Absent);

    ember_engine::detect(&mut state).unwrap();
    ember_engine::plan(&mut state, BundleAction::Install).unwrap();
    let first_execute = format!("{:?}", state.plan.execute_actions);
    let first_cache_len = state.plan.cache_actions.len();

    ember_engine::plan(&mut state, BundleAction::Install).unwrap();
    assert_eq!(format!("{:?}", state.plan.execute_actions), first_execute);
    assert_eq!(state.plan.cache_actions.len(), first_cache_len);
}

#[test]
fn test_layout_plans_bundle_and_payloads_without_registration() {
    let dir = TempDir::new().unwrap();
    let mock = MockEngine::new();
    let ux = Arc::new(CollectorUx::new());
    let handle: UxHandle = ux.clone();
    let mut state = engine_state(TWO_IN_BOUNDARY, dir.path(), handle, &mock);
    state
        .variables
        .set_string(
            "LayoutDirectory",
            &dir.path().join("stage").display().to_string(),
            false,
        )
        .unwrap();

    ember_engine::detect(&mut state).unwrap();
    ember_engine::plan(&mut state, BundleAction::Layout).unwrap();

    let plan = &state.plan;
    assert!(matches!(
        plan.cache_actions.first(),
        Some(CacheAction::LayoutBundle { .. })
    ));
    assert!(plan
        .cache_actions
        .iter()
        .any(|a| matches!(a, CacheAction::LayoutPayload { .. })));
    assert!(plan.execute_actions.is_empty());
    assert!(!plan
        .execute_actions
        .iter()
        .any(|a| matches!(a, ExecuteAction::Registration { .. })));
}

#[test]
fn test_dependency_providers_bracket_execution() {
    const WITH_PROVIDER: &str = r#"
<BundleManifest Id="bundle.dep" Version="1.0.0.0" ProviderKey="bundle.dep">
  <Payload Id="L1" FilePath="p.bin" Size="4" SourcePath="p.bin"/>
  <ExePackage Id="P1" InstallArguments="/i" UninstallArguments="/x">
    <PayloadRef Id="L1"/>
    <Provides Key="runtime/v1"/>
  </ExePackage>
</BundleManifest>
"#;
    let (_dir, state, _mock, _ux) = planned(WITH_PROVIDER, BundleAction::Install, |state, mock, _| {
        mock.set_detect_state("P1", PackageState::Absent);
        precache_payload(state, "P1", b"data");
    });

    use ember_events::DependencyAction;
    // forward: install then register
    let forward: Vec<&ExecuteAction> = state
        .plan
        .execute_actions
        .iter()
        .filter(|a| {
            matches!(
                a,
                ExecuteAction::ExecutePackage { .. } | ExecuteAction::Dependency { .. }
            )
        })
        .collect();
    assert!(matches!(
        forward.as_slice(),
        [
            ExecuteAction::ExecutePackage { action: ActionState::Install, .. },
            ExecuteAction::Dependency { action: DependencyAction::Register, .. },
        ]
    ));
    assert_eq!(
        state.plan.package_states[0].dependency,
        DependencyAction::Register
    );
}
