//! State vocabulary shared by detect, plan, and apply.

/// Top-level action requested of the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleAction {
    Install,
    Uninstall,
    Modify,
    Repair,
    /// Stage every payload into a user-chosen directory without
    /// executing anything.
    Layout,
}

/// Package presence as discovered by detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackageState {
    #[default]
    Unknown,
    Absent,
    Cached,
    Present,
}

/// State the planner (or the UX overriding it) requests for a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    #[default]
    None,
    ForceAbsent,
    Absent,
    Cache,
    Present,
    Repair,
}

/// Concrete operation planned against a package, forward or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionState {
    #[default]
    None,
    Uninstall,
    Install,
    Modify,
    Repair,
}

/// Dependency ref-count operation planned for a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyAction {
    #[default]
    None,
    Register,
    Unregister,
}

/// Restart requirement reported by a package execution. Ordered by
/// severity so the applier can fold per-package values with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Restart {
    #[default]
    None,
    Required,
    Initiated,
}

/// How this bundle relates to an already-installed bundle that spawned
/// it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelationType {
    #[default]
    None,
    Detect,
    Upgrade,
    Addon,
    Patch,
}

/// Display level requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Display {
    None,
    Passive,
    #[default]
    Full,
}

/// Restart policy requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartMode {
    #[default]
    Prompt,
    Never,
    Always,
}

#[cfg(test)]
mod tests {
    use super::Restart;

    #[test]
    fn test_restart_severity_order() {
        assert!(Restart::None < Restart::Required);
        assert!(Restart::Required < Restart::Initiated);
        assert_eq!(Restart::Required.max(Restart::None), Restart::Required);
    }
}
