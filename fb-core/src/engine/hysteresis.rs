//! Control state machines for the orchestrator
//!
//! `CurveHysteresis` keeps fans forced through a cooldown window after the
//! curve drops to 0 %, so a sensor hovering near the curve's zero point does
//! not toggle forced/automatic every poll. `UnlockState` tracks the handshake
//! with the OS thermal daemon.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CurvePhase {
    /// Fans under OS control
    Automatic,
    /// Curve demands speed and fans are forced
    ForcedRising,
    /// Demand fell to 0 %, waiting out the cooldown before release
    CoolingDown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CurveAction {
    Apply(f64),
    Hold,
    Release,
}

#[derive(Debug, Clone)]
pub struct CurveHysteresis {
    phase: CurvePhase,
    last_demand_at: Option<Duration>,
    cooldown: Duration,
    immediate_off: bool,
}

impl CurveHysteresis {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            phase: CurvePhase::Automatic,
            last_demand_at: None,
            cooldown,
            immediate_off: false,
        }
    }

    pub fn phase(&self) -> CurvePhase {
        self.phase
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Clear all bookkeeping
    pub fn reset(&mut self) {
        self.phase = CurvePhase::Automatic;
        self.last_demand_at = None;
        self.immediate_off = false;
    }

    /// Allow the next 0 % evaluation to release forced fans without a cooldown.
    /// Used right after the curve mode is activated.
    pub fn arm_immediate_off(&mut self) {
        self.immediate_off = true;
    }

    /// Feed one curve evaluation.
    ///
    /// `fans_forced` tells whether the fans are currently held in forced mode
    /// (possibly by a previous mode).
    pub fn step(&mut self, demand: f64, now: Duration, fans_forced: bool) -> CurveAction {
        let immediate_off = std::mem::take(&mut self.immediate_off);

        if demand > 0.0 {
            self.phase = CurvePhase::ForcedRising;
            self.last_demand_at = Some(now);
            return CurveAction::Apply(demand);
        }

        match self.phase {
            CurvePhase::Automatic => {
                if immediate_off && fans_forced {
                    CurveAction::Release
                } else {
                    CurveAction::Hold
                }
            }
            CurvePhase::ForcedRising | CurvePhase::CoolingDown => {
                let since = *self.last_demand_at.get_or_insert(now);
                if immediate_off || now.saturating_sub(since) >= self.cooldown {
                    self.phase = CurvePhase::Automatic;
                    self.last_demand_at = None;
                    CurveAction::Release
                } else {
                    self.phase = CurvePhase::CoolingDown;
                    CurveAction::Hold
                }
            }
        }
    }
}

/// Progress of the force-unlock handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockState {
    Locked,
    Unlocking { started: Duration },
    Unlocked,
}

impl UnlockState {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, UnlockState::Unlocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(30);

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn demand_forces_and_zero_holds_through_cooldown() {
        let mut h = CurveHysteresis::new(COOLDOWN);
        assert_eq!(h.step(40.0, secs(0), false), CurveAction::Apply(40.0));
        assert_eq!(h.phase(), CurvePhase::ForcedRising);

        assert_eq!(h.step(0.0, secs(2), true), CurveAction::Hold);
        assert_eq!(h.phase(), CurvePhase::CoolingDown);
        assert_eq!(h.step(0.0, secs(29), true), CurveAction::Hold);
        assert_eq!(h.step(0.0, secs(30), true), CurveAction::Release);
        assert_eq!(h.phase(), CurvePhase::Automatic);
    }

    #[test]
    fn oscillation_never_releases_and_then_releases_once() {
        let mut h = CurveHysteresis::new(COOLDOWN);
        h.step(1.0, secs(0), false);

        let mut t = 0;
        for i in 0..100 {
            t += 2;
            let demand = if i % 2 == 0 { 0.0 } else { 1.0 };
            let action = h.step(demand, secs(t), true);
            assert_ne!(action, CurveAction::Release, "released at t={}", t);
            assert_ne!(h.phase(), CurvePhase::Automatic);
        }

        let mut releases = 0;
        for _ in 0..40 {
            t += 2;
            if h.step(0.0, secs(t), true) == CurveAction::Release {
                releases += 1;
            }
        }
        assert_eq!(releases, 1);
        assert_eq!(h.phase(), CurvePhase::Automatic);
    }

    #[test]
    fn renewed_demand_cancels_cooldown() {
        let mut h = CurveHysteresis::new(COOLDOWN);
        h.step(20.0, secs(0), false);
        h.step(0.0, secs(20), true);
        assert_eq!(h.step(5.0, secs(25), true), CurveAction::Apply(5.0));
        assert_eq!(h.phase(), CurvePhase::ForcedRising);
        // the window restarts from the last demand
        assert_eq!(h.step(0.0, secs(50), true), CurveAction::Hold);
        assert_eq!(h.step(0.0, secs(55), true), CurveAction::Release);
    }

    #[test]
    fn immediate_off_after_activation() {
        let mut h = CurveHysteresis::new(COOLDOWN);
        h.arm_immediate_off();
        assert_eq!(h.step(0.0, secs(0), true), CurveAction::Release);
        // only the first evaluation is exempt
        h.step(10.0, secs(1), true);
        assert_eq!(h.step(0.0, secs(2), true), CurveAction::Hold);
    }

    #[test]
    fn zero_demand_with_fans_in_auto_does_nothing() {
        let mut h = CurveHysteresis::new(COOLDOWN);
        h.arm_immediate_off();
        assert_eq!(h.step(0.0, secs(0), false), CurveAction::Hold);
        assert_eq!(h.step(0.0, secs(100), false), CurveAction::Hold);
    }
}
