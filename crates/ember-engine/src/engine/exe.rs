//! The native-executable package engine.
//!
//! Detection evaluates the package's detect condition against the
//! variable store. Execution runs the primary payload out of the
//! package's completed cache directory with the argument template
//! selected by the action state, then maps the process exit code
//! through the package's exit-code table.

use std::process::Command;

use ember_core::{
    condition,
    error::{EmberError, EmberResult, ErrorContext},
    manifest::{ExePackage, ExitCodeBehavior, PackageKind},
};
use ember_events::{ActionState, PackageState, Restart, UxAction};
use tracing::{debug, info};

use super::{DetectContext, EngineCallback, EngineMessage, ExecuteContext, PackageEngine};

pub struct ExeEngine;

impl ExeEngine {
    fn exe_data<'a>(ctx_kind: &'a PackageKind, package_id: &str) -> EmberResult<&'a ExePackage> {
        match ctx_kind {
            PackageKind::Exe(exe) => Ok(exe),
            _ => Err(EmberError::Fatal(format!(
                "exe engine invoked for non-exe package '{package_id}'"
            ))),
        }
    }

    fn map_exit_code(exe: &ExePackage, code: i32) -> ExitCodeBehavior {
        let mut wildcard = None;
        for mapping in &exe.exit_codes {
            match mapping.code {
                Some(mapped) if mapped == code => return mapping.behavior,
                None => wildcard = Some(mapping.behavior),
                _ => {}
            }
        }
        if let Some(behavior) = wildcard {
            return behavior;
        }
        // conventional default: zero succeeds, everything else fails
        if code == 0 {
            ExitCodeBehavior::Success
        } else {
            ExitCodeBehavior::Error
        }
    }
}

impl PackageEngine for ExeEngine {
    fn detect(&self, ctx: &DetectContext<'_>) -> EmberResult<PackageState> {
        let exe = Self::exe_data(&ctx.package.kind, &ctx.package.id)?;
        let state = match &exe.detect_condition {
            Some(detect_condition) => {
                if condition::evaluate(detect_condition, ctx.variables)? {
                    PackageState::Present
                } else {
                    PackageState::Absent
                }
            }
            None => PackageState::Absent,
        };
        debug!(package = %ctx.package.id, ?state, "exe package detected");
        Ok(state)
    }

    fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        callback: &mut EngineCallback<'_>,
    ) -> EmberResult<Restart> {
        let exe = Self::exe_data(&ctx.package.kind, &ctx.package.id)?;

        let template = match ctx.action {
            ActionState::Install | ActionState::Modify => exe.install_arguments.as_deref(),
            ActionState::Repair => exe
                .repair_arguments
                .as_deref()
                .or(exe.install_arguments.as_deref()),
            ActionState::Uninstall => exe.uninstall_arguments.as_deref(),
            ActionState::None => return Ok(Restart::None),
        };
        let arguments = ctx
            .variables
            .format_string(template.unwrap_or_default())?;

        // the primary payload is the executable
        let primary = ctx.primary_payload.as_deref().ok_or_else(|| {
            EmberError::Validation(format!(
                "exe package '{}' has no payloads",
                ctx.package.id
            ))
        })?;
        let program = ctx.cached_dir.join(primary);

        if callback(EngineMessage::Progress { percent: 0 }).is_cancel() {
            return Err(EmberError::UserExit);
        }

        info!(
            package = %ctx.package.id,
            program = %program.display(),
            arguments = %arguments,
            rollback = ctx.rollback,
            "running exe package"
        );

        let mut command = Command::new(&program);
        if !arguments.is_empty() {
            command.args(arguments.split_whitespace());
        }

        let status = command
            .status()
            .with_context(|| format!("spawning '{}'", program.display()))?;
        let code = status.code().unwrap_or(-1);

        let behavior = Self::map_exit_code(exe, code);
        debug!(package = %ctx.package.id, code, ?behavior, "exe package finished");

        match behavior {
            ExitCodeBehavior::Success => {
                callback(EngineMessage::Progress { percent: 100 });
                Ok(Restart::None)
            }
            ExitCodeBehavior::ScheduleReboot => {
                callback(EngineMessage::Progress { percent: 100 });
                Ok(Restart::Required)
            }
            ExitCodeBehavior::ForceReboot => Ok(Restart::Initiated),
            ExitCodeBehavior::Error => {
                let decision = callback(EngineMessage::Error {
                    code,
                    message: format!("package '{}' returned {code}", ctx.package.id),
                });
                if decision == UxAction::Ignore {
                    Ok(Restart::None)
                } else {
                    Err(EmberError::PackageFailure {
                        package: ctx.package.id.clone(),
                        code,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ember_core::manifest::ExitCodeMapping;

    use super::*;

    fn exe_with_codes(codes: Vec<ExitCodeMapping>) -> ExePackage {
        ExePackage {
            exit_codes: codes,
            ..ExePackage::default()
        }
    }

    #[test]
    fn test_exit_code_exact_match_wins_over_wildcard() {
        let exe = exe_with_codes(vec![
            ExitCodeMapping {
                code: None,
                behavior: ExitCodeBehavior::Error,
            },
            ExitCodeMapping {
                code: Some(3010),
                behavior: ExitCodeBehavior::ScheduleReboot,
            },
        ]);
        assert_eq!(
            ExeEngine::map_exit_code(&exe, 3010),
            ExitCodeBehavior::ScheduleReboot
        );
        assert_eq!(ExeEngine::map_exit_code(&exe, 1), ExitCodeBehavior::Error);
    }

    #[test]
    fn test_exit_code_default_convention() {
        let exe = exe_with_codes(Vec::new());
        assert_eq!(ExeEngine::map_exit_code(&exe, 0), ExitCodeBehavior::Success);
        assert_eq!(ExeEngine::map_exit_code(&exe, 1603), ExitCodeBehavior::Error);
    }
}
