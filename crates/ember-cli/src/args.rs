//! Command-line parsing.
//!
//! The bootstrapper's switch grammar is single-dash and
//! case-insensitive, with a private `-burn.` prefix for the
//! elevation/embedding plumbing. Unknown switches pass through to
//! the UX unchanged; unknown `-burn.*` switches are logged and
//! ignored for forward compatibility.

use ember_core::error::{EmberError, EmberResult};
use ember_events::{BundleAction, Display, RelationType, RestartMode};
use tracing::warn;

const BURN_PREFIX: &str = "burn.";

/// How this process was launched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Normal,
    /// The elevated helper side of the pipes.
    Elevated {
        pipe_name: String,
        secret: String,
        parent_pid: u32,
    },
    /// The unelevated side, re-launched by an elevated parent.
    Unelevated {
        pipe_name: String,
        secret: String,
        parent_pid: u32,
    },
    /// Hosted by another bootstrapper over a pipe.
    Embedded {
        pipe_name: String,
        secret: String,
        parent_pid: u32,
    },
    RunOnce,
}

#[derive(Debug)]
pub struct Args {
    pub help: bool,
    pub action: BundleAction,
    pub display: Display,
    pub restart: Option<RestartMode>,
    pub log_path: Option<String>,
    pub log_append: bool,
    pub layout_directory: Option<String>,
    pub mode: RunMode,
    pub disable_unelevate: bool,
    pub ignore_dependencies: Vec<String>,
    pub relation: RelationType,
    /// Switches the engine does not understand, for the UX.
    pub passthrough: Vec<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            help: false,
            action: BundleAction::Install,
            display: Display::default(),
            restart: None,
            log_path: None,
            log_append: false,
            layout_directory: None,
            mode: RunMode::default(),
            disable_unelevate: false,
            ignore_dependencies: Vec::new(),
            relation: RelationType::default(),
            passthrough: Vec::new(),
        }
    }
}

impl Args {
    pub fn action(&self) -> BundleAction {
        self.action
    }

    /// Restart policy: explicit switch, else prompt under a full
    /// display and never otherwise.
    pub fn restart_mode(&self) -> RestartMode {
        match self.restart {
            Some(mode) => mode,
            None => match self.display {
                Display::Full => RestartMode::Prompt,
                _ => RestartMode::Never,
            },
        }
    }
}

pub fn parse(raw: &[String]) -> EmberResult<Args> {
    let mut args = Args::default();
    let mut iter = raw.iter().peekable();

    while let Some(arg) = iter.next() {
        let Some(switch) = arg.strip_prefix('-').or_else(|| arg.strip_prefix('/')) else {
            args.passthrough.push(arg.clone());
            continue;
        };
        let lowered = switch.to_lowercase();

        match lowered.as_str() {
            "q" | "quiet" | "s" | "silent" => args.display = Display::None,
            "passive" => args.display = Display::Passive,
            "norestart" => args.restart = Some(RestartMode::Never),
            "forcerestart" => args.restart = Some(RestartMode::Always),
            "promptrestart" => args.restart = Some(RestartMode::Prompt),
            "uninstall" => args.action = BundleAction::Uninstall,
            "repair" => args.action = BundleAction::Repair,
            "modify" => args.action = BundleAction::Modify,
            "package" | "update" => args.action = BundleAction::Install,
            "layout" => {
                args.action = BundleAction::Layout;
                if let Some(next) = iter.peek() {
                    if !next.starts_with('-') && !next.starts_with('/') {
                        args.layout_directory = iter.next().cloned();
                    }
                }
            }
            "l" | "log" => {
                args.log_path = Some(required_value(&mut iter, arg)?);
                args.log_append = false;
            }
            "help" | "h" | "?" => args.help = true,
            _ => {
                if lowered.starts_with(BURN_PREFIX) {
                    // keep original casing for parameter values
                    let private = &switch[BURN_PREFIX.len()..];
                    parse_private_switch(&mut args, private, arg, &mut iter)?;
                } else {
                    // the UX may know this switch even though the
                    // engine does not
                    args.passthrough.push(arg.clone());
                }
            }
        }
    }

    Ok(args)
}

fn parse_private_switch(
    args: &mut Args,
    switch: &str,
    original: &str,
    iter: &mut std::iter::Peekable<std::slice::Iter<'_, String>>,
) -> EmberResult<()> {
    match switch.to_lowercase().as_str() {
        "elevated" => {
            let (pipe_name, secret, parent_pid) = pipe_tuple(iter, original)?;
            args.mode = RunMode::Elevated {
                pipe_name,
                secret,
                parent_pid,
            };
        }
        "unelevated" => {
            let (pipe_name, secret, parent_pid) = pipe_tuple(iter, original)?;
            args.mode = RunMode::Unelevated {
                pipe_name,
                secret,
                parent_pid,
            };
        }
        "embedded" => {
            let (pipe_name, secret, parent_pid) = pipe_tuple(iter, original)?;
            args.mode = RunMode::Embedded {
                pipe_name,
                secret,
                parent_pid,
            };
        }
        "runonce" => args.mode = RunMode::RunOnce,
        "disable.unelevate" => args.disable_unelevate = true,
        "log.append" => {
            args.log_path = Some(required_value(iter, original)?);
            args.log_append = true;
        }
        "related.detect" => args.relation = RelationType::Detect,
        "related.upgrade" => args.relation = RelationType::Upgrade,
        "related.addon" => args.relation = RelationType::Addon,
        "related.patch" => args.relation = RelationType::Patch,
        name if name.starts_with("ignoredependencies=") => {
            let list = &switch["ignoredependencies=".len()..];
            if list.is_empty() {
                return Err(EmberError::Validation(format!(
                    "missing required parameter for switch: {original}"
                )));
            }
            args.ignore_dependencies = list.split(';').map(str::to_string).collect();
        }
        _ => {
            // forward compatibility: never fail on a private switch
            // from a newer engine
            warn!(switch = original, "ignoring unknown private switch");
        }
    }
    Ok(())
}

fn pipe_tuple(
    iter: &mut std::iter::Peekable<std::slice::Iter<'_, String>>,
    original: &str,
) -> EmberResult<(String, String, u32)> {
    let pipe_name = required_value(iter, original)?;
    let secret = required_value(iter, original)?;
    let parent_pid = required_value(iter, original)?
        .parse::<u32>()
        .map_err(|_| {
            EmberError::Validation(format!("invalid parent process id for {original}"))
        })?;
    Ok((pipe_name, secret, parent_pid))
}

fn required_value(
    iter: &mut std::iter::Peekable<std::slice::Iter<'_, String>>,
    switch: &str,
) -> EmberResult<String> {
    iter.next().cloned().ok_or_else(|| {
        EmberError::Validation(format!(
            "missing required parameter for switch: {switch}"
        ))
    })
}

pub const USAGE: &str = "\
usage: ember [options]

  -layout [directory]   stage the bundle and payloads without installing
  -uninstall            remove the bundle
  -repair               repair installed packages
  -modify               change installed features
  -q, -quiet, -silent   no UI
  -passive              progress UI only
  -norestart            never restart
  -forcerestart         always restart when required
  -promptrestart        ask before restarting
  -l, -log <path>       write the log to <path>
  -help                 show this help
";
