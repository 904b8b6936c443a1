//! The planner.
//!
//! Planning turns detect results, the requested action, and the
//! condition substrate into four ordered action sequences: execute
//! actions with a rollback mirror paired through checkpoint ids, and
//! cache actions with rollback-cache mirrors keyed on the same ids.
//! Planning is idempotent given identical inputs; the plan is rebuilt
//! from scratch on every call.

pub mod actions;

use std::path::PathBuf;

pub use actions::*;
use ember_core::{
    condition,
    constants::{VARIABLE_BUNDLE_ACTION, VARIABLE_SOURCE_FOLDER},
    error::{EmberError, EmberResult},
    manifest::{Package, PackageIndex},
};
use ember_events::{
    ActionState, BundleAction, DependencyAction, PackageState, RelationType, RequestState,
};
use ember_utils::event::SyncEvent;
use tracing::{debug, info};

use crate::state::EngineState;

/// Per-package state filled by plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackagePlanState {
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
    pub dependency: DependencyAction,
    pub planned_cache: bool,
}

/// The complete plan for one apply.
pub struct Plan {
    pub action: BundleAction,
    pub bundle_id: String,
    pub per_machine: bool,
    pub keep_registration_default: bool,
    pub layout_directory: Option<PathBuf>,
    pub execute_actions: Vec<ExecuteAction>,
    pub rollback_actions: Vec<ExecuteAction>,
    pub cache_actions: Vec<CacheAction>,
    pub rollback_cache_actions: Vec<CacheAction>,
    /// Packages whose cached files are removed after a successful
    /// apply.
    pub clean_packages: Vec<PackageIndex>,
    pub package_states: Vec<PackagePlanState>,
    pub cache_size_total: u64,
    pub execute_package_count: usize,
    pub overall_ticks_total: u32,
    checkpoint_counter: u32,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            action: BundleAction::Install,
            bundle_id: String::new(),
            per_machine: false,
            keep_registration_default: false,
            layout_directory: None,
            execute_actions: Vec::new(),
            rollback_actions: Vec::new(),
            cache_actions: Vec::new(),
            rollback_cache_actions: Vec::new(),
            clean_packages: Vec::new(),
            package_states: Vec::new(),
            cache_size_total: 0,
            execute_package_count: 0,
            overall_ticks_total: 0,
            checkpoint_counter: 0,
        }
    }
}

impl Plan {
    fn new_checkpoint(&mut self) -> u32 {
        self.checkpoint_counter += 1;
        self.checkpoint_counter
    }
}

/// Everything one package contributed, spliced into the plan as a
/// unit so checkpoints bracket correctly.
#[derive(Default)]
struct PackageContribution {
    checkpoint: u32,
    /// Cache gate, emitted before the checkpoint: a staging failure
    /// surfacing at the gate must not roll this package back.
    sync_event: Option<SyncEvent>,
    execute: Vec<ExecuteAction>,
    rollback: Vec<ExecuteAction>,
    planned_cache: bool,
}

impl PackageContribution {
    fn is_empty(&self) -> bool {
        self.execute.is_empty() && self.rollback.is_empty()
    }
}

/// Produces the plan for `action` into `state.plan`.
pub fn plan(state: &mut EngineState, action: BundleAction) -> EmberResult<()> {
    let _activation = state.ux_host.activate()?;

    info!(
        packages = state.manifest.packages.len(),
        ?action,
        "planning begin"
    );

    if state
        .ux
        .on_plan_begin(state.manifest.packages.len())
        .is_cancel()
    {
        state.ux.on_plan_complete(false);
        return Err(EmberError::UserExit);
    }

    let result = plan_inner(state, action);
    state.ux.on_plan_complete(result.is_ok());

    match &result {
        Ok(()) => info!("planning complete"),
        Err(err) => info!(error = %err, "planning failed"),
    }
    result
}

fn plan_inner(state: &mut EngineState, action: BundleAction) -> EmberResult<()> {
    // always reset the plan
    let mut plan = Plan {
        action,
        bundle_id: state.manifest.bundle.id.clone(),
        keep_registration_default: state.registration.installed,
        package_states: vec![PackagePlanState::default(); state.manifest.packages.len()],
        ..Plan::default()
    };

    state
        .variables
        .set_numeric(VARIABLE_BUNDLE_ACTION, action_code(action), true)?;

    // an interrupted run resumes with the same action
    state.registration.resume_command = resume_command(action);

    if action == BundleAction::Layout {
        let layout_dir = layout_directory(state)?;
        plan.cache_actions.push(CacheAction::LayoutBundle {
            executable_name: state.registration.executable_name.clone(),
            layout_dir: layout_dir.clone(),
        });
        plan_layout_loose_payloads(state, &mut plan, &layout_dir);
        plan.layout_directory = Some(layout_dir);
    } else if state.registration.per_machine {
        plan.per_machine = true;
    }

    // related bundles planned for removal go before the packages
    let early_execute_index = plan.execute_actions.len();
    let early_rollback_index = plan.rollback_actions.len();

    let mut open_boundary: Option<usize> = None;
    let mut first_nonpermanent_execute: Option<usize> = None;
    let mut first_nonpermanent_rollback: Option<usize> = None;
    let mut last_nonpermanent_execute: Option<usize> = None;
    let mut last_nonpermanent_rollback: Option<usize> = None;

    let package_count = state.manifest.packages.len();
    for ordinal in 0..package_count {
        let index = if action == BundleAction::Uninstall {
            package_count - 1 - ordinal
        } else {
            ordinal
        };

        let package = state.manifest.packages[index].clone();
        let detect = state.detect_states[index];

        // a package can open a new rollback boundary
        let effective_boundary = if action == BundleAction::Uninstall {
            package.rollback_boundary_backward
        } else {
            package.rollback_boundary_forward
        };
        if let Some(boundary) = effective_boundary {
            if open_boundary != Some(boundary) {
                plan.execute_actions
                    .push(ExecuteAction::RollbackBoundary { boundary });
                plan.rollback_actions
                    .push(ExecuteAction::RollbackBoundary { boundary });
                open_boundary = Some(boundary);
            }
        }

        let install_condition = match &package.install_condition {
            Some(install_condition) => condition::evaluate(install_condition, &state.variables)?,
            None => true,
        };
        let mut requested = default_request_state(
            action,
            detect.current_state,
            package.uninstallable,
            install_condition,
            state.relation_type,
        );

        if state
            .ux
            .on_plan_package_begin(&package.id, &mut requested)
            .is_cancel()
        {
            return Err(EmberError::UserExit);
        }

        let mut package_state = PackagePlanState {
            requested,
            ..PackagePlanState::default()
        };

        if requested != RequestState::None {
            if action == BundleAction::Layout {
                plan_layout_package(state, &mut plan, index, &package);
            } else {
                let contribution = plan_execute_package(
                    state,
                    &mut plan,
                    index,
                    &package,
                    detect.current_state,
                    &mut package_state,
                )?;

                if !contribution.is_empty() {
                    if package.uninstallable {
                        if first_nonpermanent_execute.is_none() {
                            first_nonpermanent_execute = Some(plan.execute_actions.len());
                            first_nonpermanent_rollback = Some(plan.rollback_actions.len());
                        }
                    }

                    splice_contribution(&mut plan, contribution, index, &mut package_state);

                    if package.uninstallable {
                        last_nonpermanent_execute = Some(plan.execute_actions.len());
                        last_nonpermanent_rollback = Some(plan.rollback_actions.len());
                    }
                }
            }
        } else if action != BundleAction::Layout {
            // keep dependency ref-counts correct even without a plan
            let dependency = dependency_for_unplanned(action, &package);
            if dependency != DependencyAction::None {
                package_state.dependency = dependency;
                let contribution = PackageContribution {
                    checkpoint: plan.new_checkpoint(),
                    sync_event: None,
                    execute: vec![ExecuteAction::Dependency {
                        package: index,
                        action: dependency,
                    }],
                    rollback: vec![ExecuteAction::Dependency {
                        package: index,
                        action: invert_dependency(dependency),
                    }],
                    planned_cache: false,
                };
                splice_contribution(&mut plan, contribution, index, &mut package_state);
            }
        }

        debug!(
            package = %package.id,
            current = ?detect.current_state,
            requested = ?package_state.requested,
            execute = ?package_state.execute,
            rollback = ?package_state.rollback,
            dependency = ?package_state.dependency,
            cache = package_state.planned_cache,
            "planned package"
        );

        plan.package_states[index] = package_state;
        state.ux.on_plan_package_complete(
            &package.id,
            detect.current_state,
            package_state.requested,
            package_state.execute,
            package_state.rollback,
        );
    }

    // bracket registration around the non-permanent packages
    if !state.registration.installed
        && matches!(
            action,
            BundleAction::Install | BundleAction::Modify | BundleAction::Repair
        )
    {
        if let (Some(execute_at), Some(rollback_at)) =
            (first_nonpermanent_execute, first_nonpermanent_rollback)
        {
            plan.execute_actions
                .insert(execute_at, ExecuteAction::Registration { keep: true });
            plan.rollback_actions
                .insert(rollback_at, ExecuteAction::Registration { keep: false });
        }
    } else if action == BundleAction::Uninstall {
        if let (Some(execute_at), Some(rollback_at)) =
            (last_nonpermanent_execute, last_nonpermanent_rollback)
        {
            plan.execute_actions
                .insert(execute_at, ExecuteAction::Registration { keep: false });
            plan.rollback_actions
                .insert(rollback_at, ExecuteAction::Registration { keep: true });
        }
    }

    if action != BundleAction::Layout {
        plan_related_bundles(state, &mut plan, early_execute_index, early_rollback_index);
    }

    finalize_checkpoints(&mut plan);

    plan.execute_package_count = plan
        .execute_actions
        .iter()
        .filter(|a| {
            matches!(
                a,
                ExecuteAction::ExecutePackage { .. } | ExecuteAction::RelatedBundle { .. }
            )
        })
        .count();
    let cache_ticks = plan
        .cache_actions
        .iter()
        .filter(|a| {
            matches!(
                a,
                CacheAction::PackageStart { .. } | CacheAction::LayoutBundle { .. }
            )
        })
        .count();
    plan.overall_ticks_total = (cache_ticks + plan.execute_package_count) as u32;

    state.plan = plan;
    Ok(())
}

fn action_code(action: BundleAction) -> i64 {
    match action {
        BundleAction::Install => 1,
        BundleAction::Uninstall => 2,
        BundleAction::Modify => 3,
        BundleAction::Repair => 4,
        BundleAction::Layout => 5,
    }
}

fn resume_command(action: BundleAction) -> String {
    match action {
        BundleAction::Install => String::new(),
        BundleAction::Uninstall => "-uninstall".to_string(),
        BundleAction::Modify => "-modify".to_string(),
        BundleAction::Repair => "-repair".to_string(),
        BundleAction::Layout => "-layout".to_string(),
    }
}

fn layout_directory(state: &EngineState) -> EmberResult<PathBuf> {
    if let Ok(dir) = state.variables.get_string("LayoutDirectory") {
        return Ok(PathBuf::from(dir));
    }
    Ok(PathBuf::from(
        state.variables.get_string(VARIABLE_SOURCE_FOLDER)?,
    ))
}

/// The default requested state, total over its inputs. Ties resolve
/// by action dominance: Install over Repair over Modify over
/// Uninstall.
fn default_request_state(
    action: BundleAction,
    current: PackageState,
    uninstallable: bool,
    install_condition: bool,
    relation: RelationType,
) -> RequestState {
    match action {
        BundleAction::Layout => RequestState::Cache,
        BundleAction::Uninstall => {
            if relation == RelationType::Upgrade {
                RequestState::ForceAbsent
            } else if uninstallable {
                RequestState::Absent
            } else {
                RequestState::None
            }
        }
        BundleAction::Install | BundleAction::Modify | BundleAction::Repair => {
            if !install_condition {
                return RequestState::Absent;
            }
            match action {
                BundleAction::Install => RequestState::Present,
                BundleAction::Repair => {
                    if current == PackageState::Present {
                        RequestState::Repair
                    } else {
                        RequestState::Present
                    }
                }
                BundleAction::Modify => {
                    if current == PackageState::Present {
                        RequestState::Present
                    } else {
                        RequestState::None
                    }
                }
                _ => unreachable!(),
            }
        }
    }
}

/// Forward and rollback action states for one package.
fn package_action_states(
    current: PackageState,
    requested: RequestState,
    uninstallable: bool,
) -> (ActionState, ActionState) {
    match requested {
        RequestState::None | RequestState::Cache => (ActionState::None, ActionState::None),
        RequestState::Present => match current {
            PackageState::Present => (ActionState::None, ActionState::None),
            _ => (
                ActionState::Install,
                if uninstallable {
                    ActionState::Uninstall
                } else {
                    ActionState::None
                },
            ),
        },
        RequestState::Repair => match current {
            PackageState::Present => (ActionState::Repair, ActionState::None),
            _ => (
                ActionState::Install,
                if uninstallable {
                    ActionState::Uninstall
                } else {
                    ActionState::None
                },
            ),
        },
        RequestState::Absent | RequestState::ForceAbsent => match current {
            PackageState::Present => (ActionState::Uninstall, ActionState::Install),
            _ => (ActionState::None, ActionState::None),
        },
    }
}

fn dependency_for_package(requested: RequestState, package: &Package) -> DependencyAction {
    if package.dependency_providers.is_empty() {
        return DependencyAction::None;
    }
    match requested {
        RequestState::Present | RequestState::Repair => DependencyAction::Register,
        RequestState::Absent | RequestState::ForceAbsent => DependencyAction::Unregister,
        _ => DependencyAction::None,
    }
}

fn dependency_for_unplanned(action: BundleAction, package: &Package) -> DependencyAction {
    if package.dependency_providers.is_empty() {
        return DependencyAction::None;
    }
    if action == BundleAction::Uninstall {
        DependencyAction::Unregister
    } else {
        DependencyAction::Register
    }
}

fn invert_dependency(action: DependencyAction) -> DependencyAction {
    match action {
        DependencyAction::Register => DependencyAction::Unregister,
        DependencyAction::Unregister => DependencyAction::Register,
        DependencyAction::None => DependencyAction::None,
    }
}

/// Plans the execute and rollback actions (and the cache span) for
/// one package.
fn plan_execute_package(
    state: &EngineState,
    plan: &mut Plan,
    index: PackageIndex,
    package: &Package,
    current: PackageState,
    package_state: &mut PackagePlanState,
) -> EmberResult<PackageContribution> {
    let (execute, rollback) =
        package_action_states(current, package_state.requested, package.uninstallable);
    let dependency = dependency_for_package(package_state.requested, package);

    package_state.execute = execute;
    package_state.rollback = rollback;
    package_state.dependency = dependency;

    let mut contribution = PackageContribution::default();
    if execute == ActionState::None
        && rollback == ActionState::None
        && dependency == DependencyAction::None
    {
        return Ok(contribution);
    }
    contribution.checkpoint = plan.new_checkpoint();

    // cache the payloads ahead of any forward operation that needs
    // them on disk
    let needs_payloads = matches!(
        execute,
        ActionState::Install | ActionState::Modify | ActionState::Repair
    );
    let fully_cached = package
        .payloads
        .iter()
        .all(|&p| state.cache.is_payload_cached(&package.cache_id, &state.manifest.payloads[p]));
    if needs_payloads && !package.payloads.is_empty() && !fully_cached {
        let event = plan_cache_package(state, plan, index, package, contribution.checkpoint);
        contribution.sync_event = Some(event);
        contribution.planned_cache = true;
        package_state.planned_cache = true;
    }

    match execute {
        ActionState::None => {}
        ActionState::Uninstall => {
            // release the ref-count before removing
            if dependency != DependencyAction::None {
                contribution.execute.push(ExecuteAction::Dependency {
                    package: index,
                    action: dependency,
                });
            }
            contribution.execute.push(ExecuteAction::ExecutePackage {
                package: index,
                action: execute,
            });
        }
        _ => {
            contribution.execute.push(ExecuteAction::ExecutePackage {
                package: index,
                action: execute,
            });
            if dependency != DependencyAction::None {
                contribution.execute.push(ExecuteAction::Dependency {
                    package: index,
                    action: dependency,
                });
            }
        }
    }

    // The rollback list is walked backward from the paired
    // checkpoint, so entries appear in forward order here: the last
    // list entry is the first rollback operation performed.
    if contribution.planned_cache {
        contribution
            .rollback
            .push(ExecuteAction::UncachePackage { package: index });
    }
    if execute == ActionState::Uninstall {
        if dependency != DependencyAction::None {
            contribution.rollback.push(ExecuteAction::Dependency {
                package: index,
                action: invert_dependency(dependency),
            });
        }
        if rollback != ActionState::None {
            contribution.rollback.push(ExecuteAction::ExecutePackage {
                package: index,
                action: rollback,
            });
        }
    } else {
        if rollback != ActionState::None {
            contribution.rollback.push(ExecuteAction::ExecutePackage {
                package: index,
                action: rollback,
            });
        }
        if dependency != DependencyAction::None {
            contribution.rollback.push(ExecuteAction::Dependency {
                package: index,
                action: invert_dependency(dependency),
            });
        }
    }

    // a package leaving the machine gives up its cached files after
    // the apply succeeds
    if matches!(
        package_state.requested,
        RequestState::Absent | RequestState::ForceAbsent
    ) && current == PackageState::Present
    {
        plan.clean_packages.push(index);
    }

    Ok(contribution)
}

/// Appends one package's actions with a shared checkpoint bracketing
/// execute and rollback, and mirrors the checkpoint into the
/// rollback-cache sequence when the package staged anything.
fn splice_contribution(
    plan: &mut Plan,
    contribution: PackageContribution,
    index: PackageIndex,
    package_state: &mut PackagePlanState,
) {
    let checkpoint = contribution.checkpoint;

    if let Some(event) = contribution.sync_event.clone() {
        plan.execute_actions.push(ExecuteAction::Syncpoint { event });
    }
    plan.execute_actions
        .push(ExecuteAction::Checkpoint { id: checkpoint });
    plan.execute_actions.extend(contribution.execute);

    plan.rollback_actions.extend(contribution.rollback);
    plan.rollback_actions
        .push(ExecuteAction::Checkpoint { id: checkpoint });

    if contribution.planned_cache {
        plan.rollback_cache_actions
            .push(CacheAction::RollbackPackage { package: index });
        plan.rollback_cache_actions
            .push(CacheAction::Checkpoint { id: checkpoint });
    }

    package_state.planned_cache |= contribution.planned_cache;
}

/// Emits the cache span for one package:
/// `PackageStart, Acquire*, [Extract]*, CachePayload*, PackageStop,
/// Syncpoint`. Returns the sync event the executor waits on.
fn plan_cache_package(
    state: &EngineState,
    plan: &mut Plan,
    index: PackageIndex,
    package: &Package,
    checkpoint: u32,
) -> SyncEvent {
    let event = SyncEvent::new();
    plan.cache_actions
        .push(CacheAction::Checkpoint { id: checkpoint });
    let start_index = plan.cache_actions.len();

    let pending: Vec<_> = package
        .payloads
        .iter()
        .copied()
        .filter(|&p| {
            !state
                .cache
                .is_payload_cached(&package.cache_id, &state.manifest.payloads[p])
        })
        .collect();

    let payload_size_total: u64 = pending
        .iter()
        .map(|&p| state.manifest.payloads[p].size)
        .sum();

    plan.cache_actions.push(CacheAction::PackageStart {
        package: index,
        payload_count: pending.len(),
        payload_size_total,
        complete_index: INVALID_ACTION_INDEX,
    });

    let mut planned_containers: Vec<(usize, usize)> = Vec::new(); // (container, acquire index)
    for &payload_index in &pending {
        let payload = &state.manifest.payloads[payload_index];
        let acquire_index = match payload.container {
            Some(container) => {
                match planned_containers.iter().find(|(c, _)| *c == container) {
                    Some(&(_, acquire_index)) => acquire_index,
                    None => {
                        let acquire_index = plan.cache_actions.len();
                        plan.cache_actions.push(CacheAction::AcquireContainer {
                            container,
                            skip_until_retried: false,
                        });
                        plan.cache_actions.push(CacheAction::ExtractContainer {
                            container,
                            payloads: state.manifest.containers[container].stream.clone(),
                            skip_until_acquired_by: Some(acquire_index),
                        });
                        planned_containers.push((container, acquire_index));
                        acquire_index
                    }
                }
            }
            None => {
                let acquire_index = plan.cache_actions.len();
                plan.cache_actions.push(CacheAction::AcquirePayload {
                    package: Some(index),
                    payload: payload_index,
                    skip_until_retried: false,
                });
                acquire_index
            }
        };

        plan.cache_actions.push(CacheAction::CachePayload {
            package: index,
            payload: payload_index,
            move_file: true,
            try_again_index: acquire_index,
        });
    }

    let stop_index = plan.cache_actions.len();
    plan.cache_actions
        .push(CacheAction::PackageStop { package: index });
    if let CacheAction::PackageStart { complete_index, .. } =
        &mut plan.cache_actions[start_index]
    {
        *complete_index = stop_index;
    }
    plan.cache_actions.push(CacheAction::Syncpoint {
        event: event.clone(),
    });

    plan.cache_size_total += payload_size_total;
    event
}

/// Layout planning for one package's payloads.
fn plan_layout_package(
    state: &EngineState,
    plan: &mut Plan,
    index: PackageIndex,
    package: &Package,
) {
    let Some(layout_dir) = plan.layout_directory.clone().or_else(|| {
        plan.cache_actions.iter().find_map(|a| match a {
            CacheAction::LayoutBundle { layout_dir, .. } => Some(layout_dir.clone()),
            _ => None,
        })
    }) else {
        return;
    };

    let pending: Vec<_> = package
        .payloads
        .iter()
        .copied()
        .filter(|&p| {
            let payload = &state.manifest.payloads[p];
            let target = layout_dir.join(&payload.file_path);
            match target.metadata() {
                Ok(metadata) => payload.size != 0 && metadata.len() != payload.size,
                Err(_) => true,
            }
        })
        .collect();
    if pending.is_empty() {
        return;
    }

    let payload_size_total: u64 = pending
        .iter()
        .map(|&p| state.manifest.payloads[p].size)
        .sum();
    let start_index = plan.cache_actions.len();
    plan.cache_actions.push(CacheAction::PackageStart {
        package: index,
        payload_count: pending.len(),
        payload_size_total,
        complete_index: INVALID_ACTION_INDEX,
    });

    for &payload_index in &pending {
        let acquire_index = plan.cache_actions.len();
        plan.cache_actions.push(CacheAction::AcquirePayload {
            package: Some(index),
            payload: payload_index,
            skip_until_retried: false,
        });
        plan.cache_actions.push(CacheAction::LayoutPayload {
            package: Some(index),
            payload: payload_index,
            layout_dir: layout_dir.clone(),
            move_file: true,
            try_again_index: acquire_index,
        });
    }

    let stop_index = plan.cache_actions.len();
    plan.cache_actions
        .push(CacheAction::PackageStop { package: index });
    if let CacheAction::PackageStart { complete_index, .. } =
        &mut plan.cache_actions[start_index]
    {
        *complete_index = stop_index;
    }

    plan.cache_size_total += payload_size_total;
}

/// Lays out payloads no package owns (UX resources and the like).
fn plan_layout_loose_payloads(state: &EngineState, plan: &mut Plan, layout_dir: &std::path::Path) {
    let mut owned = vec![false; state.manifest.payloads.len()];
    for package in &state.manifest.packages {
        for &payload in &package.payloads {
            owned[payload] = true;
        }
    }

    for (payload_index, payload) in state.manifest.payloads.iter().enumerate() {
        if owned[payload_index] {
            continue;
        }
        let acquire_index = plan.cache_actions.len();
        plan.cache_actions.push(CacheAction::AcquirePayload {
            package: None,
            payload: payload_index,
            skip_until_retried: false,
        });
        plan.cache_actions.push(CacheAction::LayoutPayload {
            package: None,
            payload: payload_index,
            layout_dir: layout_dir.to_path_buf(),
            move_file: true,
            try_again_index: acquire_index,
        });
        plan.cache_size_total += payload.size;
    }
}

/// Plans operations against detected related bundles: removals
/// (addons and patches during uninstall) run before the chain at the
/// early index; upgrades of older bundles run at the tail.
fn plan_related_bundles(
    state: &EngineState,
    plan: &mut Plan,
    early_execute_index: usize,
    early_rollback_index: usize,
) {
    let mut early_execute: Vec<ExecuteAction> = Vec::new();
    let mut early_rollback: Vec<ExecuteAction> = Vec::new();

    for (bundle_index, related) in state.related_bundles.iter().enumerate() {
        match (plan.action, related.relation) {
            (BundleAction::Uninstall, RelationType::Addon | RelationType::Patch) => {
                let checkpoint = plan.new_checkpoint();
                early_execute.push(ExecuteAction::Checkpoint { id: checkpoint });
                early_execute.push(ExecuteAction::RelatedBundle {
                    bundle: bundle_index,
                    action: ActionState::Uninstall,
                });
                early_rollback.push(ExecuteAction::RelatedBundle {
                    bundle: bundle_index,
                    action: ActionState::Install,
                });
                early_rollback.push(ExecuteAction::Checkpoint { id: checkpoint });
            }
            (
                BundleAction::Install | BundleAction::Modify | BundleAction::Repair,
                RelationType::Upgrade,
            ) if related.version < state.registration.version => {
                let checkpoint = plan.new_checkpoint();
                plan.execute_actions
                    .push(ExecuteAction::Checkpoint { id: checkpoint });
                plan.execute_actions.push(ExecuteAction::RelatedBundle {
                    bundle: bundle_index,
                    action: ActionState::Uninstall,
                });
                plan.rollback_actions.push(ExecuteAction::RelatedBundle {
                    bundle: bundle_index,
                    action: ActionState::Install,
                });
                plan.rollback_actions
                    .push(ExecuteAction::Checkpoint { id: checkpoint });
            }
            _ => {
                debug!(
                    bundle = %related.id,
                    relation = ?related.relation,
                    "related bundle requires no plan"
                );
            }
        }
    }

    if !early_execute.is_empty() {
        plan.execute_actions
            .splice(early_execute_index..early_execute_index, early_execute);
        plan.rollback_actions
            .splice(early_rollback_index..early_rollback_index, early_rollback);
    }
}

/// Renumbers checkpoints so ids strictly increase along the execute
/// sequence, mirroring the mapping into the rollback and
/// rollback-cache sequences. Insertions during planning can leave
/// provisional ids out of order; pairing is by id, so a stable
/// renumber preserves every pair.
fn finalize_checkpoints(plan: &mut Plan) {
    let mut mapping = std::collections::HashMap::new();
    let mut next = 0u32;

    for action in &mut plan.execute_actions {
        if let ExecuteAction::Checkpoint { id } = action {
            next += 1;
            mapping.insert(*id, next);
            *id = next;
        }
    }
    for action in &mut plan.rollback_actions {
        if let ExecuteAction::Checkpoint { id } = action {
            if let Some(new_id) = mapping.get(id) {
                *id = *new_id;
            }
        }
    }
    for action in plan
        .rollback_cache_actions
        .iter_mut()
        .chain(plan.cache_actions.iter_mut())
    {
        if let CacheAction::Checkpoint { id } = action {
            if let Some(new_id) = mapping.get(id) {
                *id = *new_id;
            }
        }
    }

    plan.checkpoint_counter = next;
}
