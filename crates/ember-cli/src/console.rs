//! Console UX.
//!
//! Renders acquisition and execution progress with indicatif and
//! answers engine decisions non-interactively: cancel on Ctrl-C-set
//! flags is the frontend's job, everything else takes the engine's
//! recommendation. Quiet and passive displays draw nothing.

use std::sync::Mutex;

use ember_events::{Display, PackageState, Restart, Ux, UxAction};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{info, warn};

const SPINNER_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

pub struct ConsoleUx {
    display: Display,
    multi: MultiProgress,
    acquire_bar: Mutex<Option<ProgressBar>>,
    execute_bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleUx {
    pub fn new(display: Display) -> Self {
        Self {
            display,
            multi: MultiProgress::new(),
            acquire_bar: Mutex::new(None),
            execute_bar: Mutex::new(None),
        }
    }

    fn progress_enabled(&self) -> bool {
        self.display == Display::Full || self.display == Display::Passive
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix} [{wide_bar:.green/dim}] {bytes}/{total_bytes}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .tick_chars(SPINNER_CHARS)
        .progress_chars("━━─")
    }

    fn percent_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.cyan} {prefix} [{wide_bar:.green/dim}] {pos:>3}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_chars(SPINNER_CHARS)
            .progress_chars("━━─")
    }
}

impl Ux for ConsoleUx {
    fn on_detect_package_complete(&self, package_id: &str, state: PackageState) {
        info!("detected {package_id}: {state:?}");
    }

    fn on_cache_package_begin(
        &self,
        package_id: &str,
        payload_count: usize,
        payload_size_total: u64,
    ) -> UxAction {
        if self.progress_enabled() && payload_count > 0 {
            let bar = self.multi.add(ProgressBar::new(payload_size_total));
            bar.set_style(Self::bar_style());
            bar.set_prefix(format!("caching {package_id}"));
            *self.acquire_bar.lock().unwrap() = Some(bar);
        }
        UxAction::NoAction
    }

    fn on_cache_acquire_progress(
        &self,
        _payload_key: &str,
        _current: u64,
        _total: u64,
        overall: u64,
        overall_total: u64,
    ) -> UxAction {
        if let Some(bar) = self.acquire_bar.lock().unwrap().as_ref() {
            bar.set_length(overall_total.max(overall));
            bar.set_position(overall);
        }
        UxAction::NoAction
    }

    fn on_cache_verify_complete(&self, payload_key: &str, success: bool) -> UxAction {
        if !success {
            warn!("verification failed for payload {payload_key}");
        }
        UxAction::NoAction
    }

    fn on_cache_package_complete(
        &self,
        package_id: &str,
        success: bool,
        recommendation: UxAction,
    ) -> UxAction {
        if let Some(bar) = self.acquire_bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
        if !success {
            warn!("caching {package_id} failed");
        }
        recommendation
    }

    fn on_resolve_source(
        &self,
        payload_key: &str,
        local_source: &str,
        download_url: Option<&str>,
    ) -> UxAction {
        match download_url {
            Some(url) => {
                info!("source for {payload_key} missing locally, downloading {url}");
                UxAction::Download
            }
            None => {
                warn!("source for {payload_key} not found at {local_source}");
                UxAction::NoAction
            }
        }
    }

    fn on_execute_begin(&self, package_count: usize) -> UxAction {
        if self.progress_enabled() && package_count > 0 {
            let bar = self.multi.add(ProgressBar::new(100));
            bar.set_style(Self::percent_style());
            bar.set_prefix("applying");
            *self.execute_bar.lock().unwrap() = Some(bar);
        }
        UxAction::NoAction
    }

    fn on_execute_package_begin(&self, package_id: &str, forward: bool) -> UxAction {
        if forward {
            info!("installing {package_id}");
        } else {
            info!("rolling back {package_id}");
        }
        UxAction::NoAction
    }

    fn on_execute_progress(
        &self,
        _package_id: &str,
        _package_percent: u8,
        overall_percent: u8,
    ) -> UxAction {
        if let Some(bar) = self.execute_bar.lock().unwrap().as_ref() {
            bar.set_position(u64::from(overall_percent));
        }
        UxAction::NoAction
    }

    fn on_error(&self, package_id: &str, code: i32, message: &str) -> UxAction {
        warn!("{package_id} reported error {code}: {message}");
        UxAction::NoAction
    }

    fn on_execute_package_complete(
        &self,
        package_id: &str,
        success: bool,
        restart: Restart,
        recommendation: UxAction,
    ) -> UxAction {
        if !success {
            warn!("{package_id} failed");
        } else if restart != Restart::None {
            info!("{package_id} requires a restart");
        }
        recommendation
    }

    fn on_execute_complete(&self, _success: bool) {
        if let Some(bar) = self.execute_bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
    }

    fn on_apply_complete(&self, success: bool, restart: Restart) -> UxAction {
        if success {
            info!(
                "apply complete ({})",
                match restart {
                    Restart::None => "no restart required",
                    Restart::Required => "restart required",
                    Restart::Initiated => "restart initiated",
                }
            );
        }
        UxAction::NoAction
    }

    fn on_cache_acquire_begin(&self, payload_key: &str, source: &str) -> UxAction {
        info!("acquiring {payload_key} from {source}");
        UxAction::NoAction
    }
}
