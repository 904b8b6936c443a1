//! Planned action types.
//!
//! The planner emits four ordered sequences: execute actions with a
//! rollback mirror paired through checkpoint ids, and cache actions
//! with a rollback-cache mirror keyed on the same ids.

use std::path::PathBuf;

use ember_core::manifest::{BoundaryIndex, ContainerIndex, PackageIndex, PayloadIndex};
use ember_events::{ActionState, DependencyAction};
use ember_utils::event::SyncEvent;

/// Index value meaning "no action".
pub const INVALID_ACTION_INDEX: usize = usize::MAX;

/// One entry in the execute or rollback sequence.
#[derive(Debug, Clone)]
pub enum ExecuteAction {
    /// Pairs a forward position with its rollback mirror.
    Checkpoint { id: u32 },
    /// Execute waits here until the cache side signals the event.
    Syncpoint { event: SyncEvent },
    /// Run a package engine forward or as a rollback mirror.
    ExecutePackage {
        package: PackageIndex,
        action: ActionState,
    },
    /// Register or unregister a dependency provider.
    Dependency {
        package: PackageIndex,
        action: DependencyAction,
    },
    /// Record whether bundle registration survives the run.
    Registration { keep: bool },
    /// Marks a rollback boundary; in the rollback sequence it
    /// terminates the backward scan.
    RollbackBoundary { boundary: BoundaryIndex },
    /// Remove a package's cached files during rollback.
    UncachePackage { package: PackageIndex },
    /// Execute an operation against a detected related bundle.
    RelatedBundle {
        bundle: usize,
        action: ActionState,
    },
}

impl ExecuteAction {
    pub fn checkpoint_id(&self) -> Option<u32> {
        match self {
            ExecuteAction::Checkpoint { id } => Some(*id),
            _ => None,
        }
    }

    /// Identifier of the package (or related bundle slot) the action
    /// operates on, for symmetry checks.
    pub fn package_index(&self) -> Option<PackageIndex> {
        match self {
            ExecuteAction::ExecutePackage { package, .. }
            | ExecuteAction::Dependency { package, .. }
            | ExecuteAction::UncachePackage { package } => Some(*package),
            _ => None,
        }
    }
}

/// One entry in the cache or rollback-cache sequence.
#[derive(Debug, Clone)]
pub enum CacheAction {
    /// Mirrors the execute checkpoint with the same id.
    Checkpoint { id: u32 },
    /// Stage the bundle executable into the layout directory.
    LayoutBundle {
        executable_name: String,
        layout_dir: PathBuf,
    },
    /// Opens a package's contiguous cache span. `complete_index`
    /// points at the matching [`CacheAction::PackageStop`] so a
    /// non-vital failure can skip past it.
    PackageStart {
        package: PackageIndex,
        payload_count: usize,
        payload_size_total: u64,
        complete_index: usize,
    },
    /// Copy or download a container to the staging area.
    AcquireContainer {
        container: ContainerIndex,
        /// Planned already-satisfied; runs only when a retry clears
        /// the skip.
        skip_until_retried: bool,
    },
    /// Extract a staged container's payload stream.
    ExtractContainer {
        container: ContainerIndex,
        payloads: Vec<PayloadIndex>,
        /// Skipped while the named acquire action is still skipped.
        skip_until_acquired_by: Option<usize>,
    },
    /// Copy or download an external payload to the staging area.
    AcquirePayload {
        package: Option<PackageIndex>,
        payload: PayloadIndex,
        skip_until_retried: bool,
    },
    /// Verify a staged payload and promote it into the completed
    /// area. `try_again_index` points back at the acquire action to
    /// redo when the UX asks for a re-acquire.
    CachePayload {
        package: PackageIndex,
        payload: PayloadIndex,
        move_file: bool,
        try_again_index: usize,
    },
    /// Verify a staged payload and place it in the layout directory.
    LayoutPayload {
        package: Option<PackageIndex>,
        payload: PayloadIndex,
        layout_dir: PathBuf,
        move_file: bool,
        try_again_index: usize,
    },
    /// Closes a package's cache span.
    PackageStop { package: PackageIndex },
    /// Signal the executor that this package's payloads are staged.
    Syncpoint { event: SyncEvent },
    /// Rollback-cache entry: remove the package's cached files.
    RollbackPackage { package: PackageIndex },
}

impl CacheAction {
    pub fn checkpoint_id(&self) -> Option<u32> {
        match self {
            CacheAction::Checkpoint { id } => Some(*id),
            _ => None,
        }
    }
}
