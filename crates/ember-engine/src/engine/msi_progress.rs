//! Database-installer progress translation.
//!
//! The installer reports progress as a stream of 4-tuples
//! `[f0, f1, f2, f3]`. `f0` selects the message: `0` master reset
//! (push a new phase), `1` action start (toggle step increments),
//! `2` progress report (advance by `f1`), `3` total extension.
//! Overall percent is a weighted sum over the standard phases
//! (planning 15, execution 80, cleanup 5); phases already passed
//! contribute their full weight, phases ahead contribute nothing,
//! and rollback inverts completion within the current phase.

/// Weight of each standard installer phase, in percent.
const PHASE_WEIGHTS: [u64; 3] = [15, 80, 5];

/// Ticks added to the first phase total; the script-planning phase
/// habitually overshoots by about this much.
const FIRST_PHASE_FUDGE: u64 = 50;

#[derive(Debug, Clone, Copy, Default)]
struct Phase {
    total: u64,
    completed: u64,
    forward: bool,
    step: u64,
    step_enabled: bool,
    script_in_progress: bool,
}

/// State machine fed with raw progress tuples, yielding a clamped
/// overall percentage.
#[derive(Debug, Default)]
pub struct MsiProgressTranslator {
    phases: Vec<Phase>,
    rollback: bool,
}

impl MsiProgressTranslator {
    pub fn new(rollback: bool) -> Self {
        Self {
            phases: Vec::new(),
            rollback,
        }
    }

    /// Feeds one 4-tuple. Returns the overall percentage when the
    /// tuple changed it, `None` before the first master reset.
    pub fn handle(&mut self, fields: [i32; 4]) -> Option<u8> {
        match fields[0] {
            0 => {
                let mut phase = Phase {
                    total: fields[1].max(0) as u64,
                    completed: if fields[2] == 0 {
                        0
                    } else {
                        fields[1].max(0) as u64
                    },
                    forward: fields[2] == 0,
                    step: 0,
                    step_enabled: false,
                    script_in_progress: fields[3] == 1,
                };
                if self.phases.is_empty() {
                    phase.total += FIRST_PHASE_FUDGE;
                }
                self.phases.push(phase);
            }
            1 => {
                let phase = self.phases.last_mut()?;
                if fields[2] == 0 {
                    phase.step_enabled = false;
                } else {
                    phase.step_enabled = true;
                    phase.step = fields[1].max(0) as u64;
                }
            }
            2 => {
                let phase = self.phases.last_mut()?;
                if phase.total == 0 {
                    return None;
                }
                let delta = fields[1].max(0) as u64;
                if phase.forward {
                    phase.completed = phase.completed.saturating_add(delta);
                } else {
                    phase.completed = phase.completed.saturating_sub(delta);
                }
            }
            3 => {
                let phase = self.phases.last_mut()?;
                phase.total = phase.total.saturating_add(fields[1].max(0) as u64);
            }
            _ => return None,
        }

        if self.phases.is_empty() {
            None
        } else {
            Some(self.overall_percent())
        }
    }

    /// An action-data message advances the current phase by its step
    /// size when step increments are enabled.
    pub fn handle_action_data(&mut self) -> Option<u8> {
        let phase = self.phases.last_mut()?;
        if !phase.step_enabled || phase.total == 0 {
            return None;
        }
        if phase.forward {
            phase.completed = phase.completed.saturating_add(phase.step);
        } else {
            phase.completed = phase.completed.saturating_sub(phase.step);
        }
        Some(self.overall_percent())
    }

    /// Weighted sum across the standard phases, clamped to [0, 100].
    pub fn overall_percent(&self) -> u8 {
        let current = self.phases.len().saturating_sub(1);
        let mut percent = 0u64;

        for (index, weight) in PHASE_WEIGHTS.iter().enumerate() {
            if index < current {
                percent += weight;
            } else if index == current {
                if let Some(phase) = self.phases.get(index) {
                    if phase.total != 0 {
                        let completed = if self.rollback {
                            phase.total.saturating_sub(phase.completed)
                        } else {
                            phase.completed.min(phase.total)
                        };
                        percent += completed * weight / phase.total;
                    }
                }
            }
            // phases ahead contribute nothing
        }

        percent.min(100) as u8
    }

    /// True while the current phase executes a deferred script.
    pub fn script_in_progress(&self) -> bool {
        self.phases
            .last()
            .map(|p| p.script_in_progress)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::MsiProgressTranslator;

    #[test]
    fn test_no_percent_before_master_reset() {
        let mut translator = MsiProgressTranslator::new(false);
        assert_eq!(translator.handle([2, 10, 0, 0]), None);
        assert_eq!(translator.handle([1, 5, 1, 0]), None);
    }

    #[test]
    fn test_first_phase_fudge_prevents_overshoot() {
        let mut translator = MsiProgressTranslator::new(false);
        translator.handle([0, 100, 0, 0]);
        // completing the announced total leaves headroom
        let percent = translator.handle([2, 100, 0, 0]).unwrap();
        assert!(percent < 15, "phase 0 should stay under its weight, got {percent}");
    }

    #[test]
    fn test_phase_weights_accumulate() {
        let mut translator = MsiProgressTranslator::new(false);
        translator.handle([0, 100, 0, 0]); // planning
        translator.handle([0, 200, 0, 0]); // execution
        let mid = translator.handle([2, 100, 0, 0]).unwrap();
        assert_eq!(mid, 15 + 40); // full planning weight + half execution

        translator.handle([0, 10, 0, 0]); // cleanup
        let tail = translator.handle([2, 10, 0, 0]).unwrap();
        assert_eq!(tail, 100);
    }

    #[test]
    fn test_monotone_non_decreasing_forward() {
        let mut translator = MsiProgressTranslator::new(false);
        let stream = [
            [0, 50, 0, 0],
            [1, 5, 1, 0],
            [2, 10, 0, 0],
            [3, 20, 0, 0],
            [2, 25, 0, 0],
            [0, 100, 0, 0],
            [2, 30, 0, 0],
            [2, 70, 0, 0],
            [0, 10, 0, 1],
            [2, 10, 0, 0],
        ];
        let mut last = 0u8;
        for fields in stream {
            if let Some(percent) = translator.handle(fields) {
                assert!(percent >= last, "{percent} < {last}");
                assert!(percent <= 100);
                last = percent;
            }
        }
    }

    #[test]
    fn test_backward_phase_counts_down() {
        let mut translator = MsiProgressTranslator::new(false);
        // f2 != 0: backward phase starts at its total
        translator.handle([0, 100, 1, 0]);
        translator.handle([0, 100, 1, 0]); // move past phase 0 (fudged)
        let before = translator.overall_percent();
        translator.handle([2, 40, 0, 0]);
        let after = translator.overall_percent();
        assert!(after < before);
    }

    #[test]
    fn test_rollback_inverts_current_phase() {
        let mut translator = MsiProgressTranslator::new(true);
        translator.handle([0, 100, 0, 0]);
        // nothing completed yet: rollback reads as the full phase
        assert!(translator.overall_percent() > 0);
    }

    #[test]
    fn test_total_extension_dilutes_progress() {
        let mut translator = MsiProgressTranslator::new(false);
        translator.handle([0, 100, 0, 0]);
        translator.handle([0, 100, 0, 0]);
        translator.handle([2, 50, 0, 0]);
        let before = translator.overall_percent();
        translator.handle([3, 100, 0, 0]); // total grows, percent shrinks
        let after = translator.overall_percent();
        assert!(after < before);
    }

    #[test]
    fn test_action_data_steps_when_enabled() {
        let mut translator = MsiProgressTranslator::new(false);
        translator.handle([0, 100, 0, 0]);
        // steps disabled: action data is inert
        assert_eq!(translator.handle_action_data(), None);

        translator.handle([1, 10, 1, 0]);
        let before = translator.overall_percent();
        let after = translator.handle_action_data().unwrap();
        assert!(after >= before);

        translator.handle([1, 0, 0, 0]); // disable again
        assert_eq!(translator.handle_action_data(), None);
    }

    #[test]
    fn test_script_in_progress_flag() {
        let mut translator = MsiProgressTranslator::new(false);
        translator.handle([0, 10, 0, 1]);
        assert!(translator.script_in_progress());
        translator.handle([0, 10, 0, 0]);
        assert!(!translator.script_in_progress());
    }
}
