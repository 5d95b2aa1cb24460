//! Fan-control orchestrator
//!
//! Turns a control mode into controller writes. Before the first forced
//! write it performs the unlock handshake with the OS thermal daemon, and
//! every speed change follows write, wait, read back, retry. Curve mode
//! runs through `CurveHysteresis` so fans are not released the moment the
//! curve touches 0 %.
//!
//! The orchestrator always hands the fans back to automatic control when it
//! is shut down or dropped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fb_error::{FanbridgeError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::board::FanBoard;
use super::curve::FanCurve;
use super::hysteresis::{CurveAction, CurveHysteresis, CurvePhase, UnlockState};
use crate::clock::Clock;
use crate::constants::{control, keys};
use crate::smc::{fans, FanDescriptor, SmcAccess};
use crate::temperature::TemperatureSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum ControlMode {
    Automatic,
    /// Fixed speed, 0-100 %
    Manual(f64),
    Curve(FanCurve),
}

impl ControlMode {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMode::Automatic => "automatic",
            ControlMode::Manual(_) => "manual",
            ControlMode::Curve(_) => "curve",
        }
    }
}

/// Per-fan request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FanSpeed {
    Percent(f64),
    Auto,
}

/// Waits and bounds of the unlock and write-verify sequences
#[derive(Debug, Clone)]
pub struct ControlTiming {
    pub unlock_poll_window: Duration,
    pub unlock_poll_interval: Duration,
    pub unlock_stabilize: Duration,
    pub verify_delay: Duration,
    pub relock_delay: Duration,
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl Default for ControlTiming {
    fn default() -> Self {
        Self {
            unlock_poll_window: control::UNLOCK_POLL_WINDOW,
            unlock_poll_interval: control::UNLOCK_POLL_INTERVAL,
            unlock_stabilize: control::UNLOCK_STABILIZE,
            verify_delay: control::VERIFY_DELAY,
            relock_delay: control::RELOCK_DELAY,
            max_attempts: control::MAX_WRITE_ATTEMPTS,
            cooldown: control::CURVE_COOLDOWN,
        }
    }
}

fn validate_percentage(value: f64) -> Result<f64> {
    if !(0.0..=100.0).contains(&value) {
        return Err(FanbridgeError::InvalidPercentage { value });
    }
    Ok(value)
}

/// Smallest change in curve output worth a new write
const CURVE_RESOLUTION: f64 = 0.5;

pub struct FanOrchestrator<A: SmcAccess, C: Clock> {
    smc: A,
    clock: C,
    temperature: Arc<dyn TemperatureSource>,
    timing: ControlTiming,
    mode: ControlMode,
    board: FanBoard,
    forced_fans: BTreeSet<u32>,
    last_applied: Option<f64>,
    hysteresis: CurveHysteresis,
    unlock: UnlockState,
    shut_down: bool,
}

impl<A: SmcAccess, C: Clock> FanOrchestrator<A, C> {
    pub fn new(smc: A, clock: C, temperature: Arc<dyn TemperatureSource>, timing: ControlTiming) -> Self {
        let hysteresis = CurveHysteresis::new(timing.cooldown);
        Self {
            smc,
            clock,
            temperature,
            timing,
            mode: ControlMode::Automatic,
            board: FanBoard::new(),
            forced_fans: BTreeSet::new(),
            last_applied: None,
            hysteresis,
            unlock: UnlockState::Locked,
            shut_down: false,
        }
    }

    /// Enumerate fans and publish them on the board
    pub fn discover(&mut self) -> usize {
        let found = fans::discover_fans(&mut self.smc);
        let count = found.len();
        self.board.replace(found);
        info!(count, "fan discovery complete");
        count
    }

    pub fn board(&self) -> FanBoard {
        self.board.clone()
    }

    pub fn mode(&self) -> &ControlMode {
        &self.mode
    }

    pub fn curve_phase(&self) -> CurvePhase {
        self.hysteresis.phase()
    }

    pub fn unlock_state(&self) -> UnlockState {
        self.unlock
    }

    /// Whether this orchestrator currently holds any fan in forced mode
    pub fn is_forced(&self) -> bool {
        !self.forced_fans.is_empty()
    }

    // ========================================================================
    // Mode transitions
    // ========================================================================

    /// Switch mode. Automatic releases the fans immediately; manual and
    /// curve modes write nothing until the next apply or `reevaluate()`.
    pub fn set_control_mode(&mut self, mode: ControlMode) -> Result<()> {
        if let ControlMode::Manual(pct) = mode {
            validate_percentage(pct)?;
        }
        info!(from = self.mode.name(), to = mode.name(), "control mode change");

        self.hysteresis.reset();
        self.last_applied = None;
        match mode {
            ControlMode::Automatic => {
                self.mode = ControlMode::Automatic;
                self.release_to_automatic();
            }
            ControlMode::Curve(_) => {
                self.hysteresis.arm_immediate_off();
                self.mode = mode;
            }
            ControlMode::Manual(_) => {
                self.mode = mode;
            }
        }
        Ok(())
    }

    /// Enter manual mode at `pct` and apply it to every fan
    pub fn set_manual_speed(&mut self, pct: f64) -> Result<bool> {
        let pct = validate_percentage(pct)?;
        if !matches!(self.mode, ControlMode::Manual(_)) {
            self.hysteresis.reset();
        }
        self.mode = ControlMode::Manual(pct);
        Ok(self.apply_all(pct))
    }

    /// One fan to a percentage, or back to automatic
    pub fn set_fan_speed(&mut self, index: u32, speed: FanSpeed) -> Result<bool> {
        if self.board.get(index).is_none() {
            return Err(FanbridgeError::NoSuchFan(index as usize));
        }
        match speed {
            FanSpeed::Percent(pct) => {
                let pct = validate_percentage(pct)?;
                Ok(self.apply(&[(index, pct)]))
            }
            FanSpeed::Auto => Ok(self.release_fan(index)),
        }
    }

    /// Every fan to one percentage without changing the mode
    pub fn set_all_fans_speed(&mut self, pct: f64) -> Result<bool> {
        let pct = validate_percentage(pct)?;
        Ok(self.apply_all(pct))
    }

    /// Release every fan. Manual mode ends here; a curve keeps evaluating.
    pub fn set_all_fans_auto(&mut self) -> bool {
        if matches!(self.mode, ControlMode::Manual(_)) {
            self.mode = ControlMode::Automatic;
        }
        self.hysteresis.reset();
        self.release_to_automatic()
    }

    // ========================================================================
    // Periodic evaluation
    // ========================================================================

    /// Refresh fan state and act on the current mode. Returns whether
    /// anything was written.
    pub fn reevaluate(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        self.refresh_board();

        match self.mode.clone() {
            ControlMode::Automatic => false,
            ControlMode::Manual(pct) => {
                if self.last_applied != Some(pct) {
                    return self.apply_all(pct);
                }
                if self.reclaimed() {
                    info!("thermal daemon reclaimed the fans, re-applying manual speed");
                    self.unlock = UnlockState::Locked;
                    return self.apply_all(pct);
                }
                false
            }
            ControlMode::Curve(curve) => self.evaluate_curve(&curve),
        }
    }

    fn evaluate_curve(&mut self, curve: &FanCurve) -> bool {
        let Some(temp) = self.temperature.current_temperature() else {
            debug!("no temperature reading, curve holds");
            return false;
        };
        let demand = curve.speed_for_temperature(temp);
        let now = self.clock.now();

        match self.hysteresis.step(demand, now, self.is_forced()) {
            CurveAction::Apply(pct) => {
                let changed = self
                    .last_applied
                    .map_or(true, |last| (last - pct).abs() >= CURVE_RESOLUTION);
                let reclaimed = !changed && self.reclaimed();
                if reclaimed {
                    info!("thermal daemon reclaimed the fans, re-applying curve speed");
                    self.unlock = UnlockState::Locked;
                }
                if changed || reclaimed {
                    debug!(temp, pct, "curve apply");
                    self.apply_all(pct)
                } else {
                    false
                }
            }
            CurveAction::Hold => false,
            CurveAction::Release => {
                info!(temp, "curve released fans to automatic");
                self.release_to_automatic();
                true
            }
        }
    }

    // ========================================================================
    // Unlock handshake and write-verify-retry
    // ========================================================================

    fn first_fan(&self) -> Option<u32> {
        self.board.snapshot().first().map(|f| f.index)
    }

    /// Ask the OS thermal daemon to let go, and wait for it to do so
    fn force_unlock(&mut self) {
        if self.unlock.is_unlocked() {
            return;
        }

        if !fans::set_unlock(&mut self.smc, true) {
            debug!("unlock flag not writable");
        }
        self.unlock = UnlockState::Unlocking {
            started: self.clock.now(),
        };

        while let UnlockState::Unlocking { started } = self.unlock {
            let mode = self
                .first_fan()
                .and_then(|i| fans::read_mode(&mut self.smc, i));
            match mode {
                Some(m) if m != keys::MODE_SYSTEM => {
                    debug!(mode = m, "thermal daemon yielded");
                    self.clock.sleep(self.timing.unlock_stabilize);
                    // it grabs the fan again right after yielding unless told twice
                    fans::set_unlock(&mut self.smc, true);
                    self.unlock = UnlockState::Unlocked;
                }
                None => {
                    debug!("fan mode unreadable, trusting the unlock write");
                    self.unlock = UnlockState::Unlocked;
                }
                Some(_) if self.clock.now().saturating_sub(started) >= self.timing.unlock_poll_window => {
                    info!("thermal daemon did not yield in time, proceeding");
                    self.unlock = UnlockState::Unlocked;
                }
                Some(_) => self.clock.sleep(self.timing.unlock_poll_interval),
            }
        }
    }

    fn write_targets(&mut self, targets: &[(u32, f64)]) {
        for &(index, pct) in targets {
            let Some(fan) = self.board.get(index) else {
                continue;
            };
            let rpm = fan.rpm_for_percentage(pct);
            let forced = fans::set_forced(&mut self.smc, index, true);
            // minimum overrides the target upward on some machines
            let min = fans::set_min_rpm(&mut self.smc, index, rpm);
            let target = fans::set_target_rpm(&mut self.smc, index, rpm);
            if !(forced && min && target) {
                debug!(fan = index, forced, min, target, "fan write reported failure");
            }
        }
    }

    fn apply_all(&mut self, pct: f64) -> bool {
        let targets: Vec<(u32, f64)> = self.board.snapshot().iter().map(|f| (f.index, pct)).collect();
        let ok = self.apply(&targets);
        self.last_applied = ok.then_some(pct);
        ok
    }

    /// Write, wait, read back one fan's mode, retry up to the attempt bound
    fn apply(&mut self, targets: &[(u32, f64)]) -> bool {
        let Some(&(probe, _)) = targets.first() else {
            warn!("no fans to control");
            return false;
        };

        self.force_unlock();

        for attempt in 1..=self.timing.max_attempts {
            self.write_targets(targets);
            self.clock.sleep(self.timing.verify_delay);

            match fans::is_forced(&mut self.smc, probe) {
                Some(false) => {
                    warn!(attempt, fan = probe, "fan not in forced mode after write");
                    if attempt < self.timing.max_attempts {
                        fans::set_unlock(&mut self.smc, true);
                        self.clock.sleep(self.timing.relock_delay);
                    }
                }
                verified => {
                    if verified.is_none() {
                        debug!(fan = probe, "forced state unreadable, accepting write unverified");
                    }
                    self.forced_fans.extend(targets.iter().map(|t| t.0));
                    self.refresh_board();
                    return true;
                }
            }
        }

        let err = FanbridgeError::ModeConflict {
            attempts: self.timing.max_attempts,
        };
        warn!("{}", err);
        self.refresh_board();
        false
    }

    fn reclaimed(&mut self) -> bool {
        match self.forced_fans.iter().next().copied() {
            Some(index) => fans::is_forced(&mut self.smc, index) == Some(false),
            None => false,
        }
    }

    // ========================================================================
    // Release
    // ========================================================================

    fn release_fan(&mut self, index: u32) -> bool {
        let min = self.board.get(index).map(|f| f.min);
        let mut ok = fans::set_forced(&mut self.smc, index, false);
        if let Some(min) = min {
            ok &= fans::set_min_rpm(&mut self.smc, index, min);
        }
        self.forced_fans.remove(&index);

        if self.forced_fans.is_empty() {
            ok &= fans::set_unlock(&mut self.smc, false);
            self.unlock = UnlockState::Locked;
            self.last_applied = None;
        }
        self.refresh_board();
        ok
    }

    fn release_to_automatic(&mut self) -> bool {
        let fans_now = self.board.snapshot();
        let ok = fans::reset_all_to_automatic(&mut self.smc, &fans_now);
        self.forced_fans.clear();
        self.unlock = UnlockState::Locked;
        self.last_applied = None;
        self.refresh_board();
        ok
    }

    fn refresh_board(&mut self) {
        let smc = &mut self.smc;
        self.board.update(|list: &mut Vec<FanDescriptor>| {
            for fan in list.iter_mut() {
                *fan = fans::read_fan(smc, fan);
            }
        });
    }

    /// Return every fan to automatic and clear the unlock flag. Runs once;
    /// later calls (including the one from `Drop`) do nothing.
    pub fn shutdown(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        self.shut_down = true;

        info!("SHUTDOWN: returning fans to automatic control");
        let fans_now = self.board.snapshot();
        let ok = fans::reset_all_to_automatic(&mut self.smc, &fans_now);
        if !ok {
            warn!("SHUTDOWN: some fans may still be forced");
        }
        self.forced_fans.clear();
        self.unlock = UnlockState::Locked;
        self.mode = ControlMode::Automatic;
        ok
    }
}

impl<A: SmcAccess, C: Clock> Drop for FanOrchestrator<A, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::smc::MemorySmc;
    use crate::temperature::{LatestTemperature, MockTemperatureSource};
    use fb_protocol::{SensorKey, TypeTag};

    fn k(s: &str) -> SensorKey {
        SensorKey::new(s).unwrap()
    }

    fn setup(fans: u32) -> (FanOrchestrator<MemorySmc, ManualClock>, MemorySmc, ManualClock, LatestTemperature) {
        let smc = MemorySmc::simulated_machine(fans);
        let clock = ManualClock::new();
        let temp = LatestTemperature::new();
        let mut orch = FanOrchestrator::new(
            smc.clone(),
            clock.clone(),
            Arc::new(temp.clone()),
            ControlTiming::default(),
        );
        assert_eq!(orch.discover(), fans as usize);
        (orch, smc, clock, temp)
    }

    fn count_writes(smc: &MemorySmc, key: &str, bytes: &[u8]) -> usize {
        smc.writes()
            .iter()
            .filter(|(wk, wb)| wk.as_str() == key && wb.as_slice() == bytes)
            .count()
    }

    #[test]
    fn manual_speed_forces_every_fan() {
        let (mut orch, smc, _clock, _temp) = setup(2);
        assert!(orch.set_manual_speed(50.0).unwrap());

        for fan in ["F0", "F1"] {
            assert_eq!(smc.value(k(&format!("{}Md", fan))), Some(1.0));
            assert_eq!(smc.value(k(&format!("{}Tg", fan))), Some(3600.0));
            assert_eq!(smc.value(k(&format!("{}Mn", fan))), Some(3600.0));
        }
        assert_eq!(smc.value(k("Ftst")), Some(1.0));
        assert!(orch.is_forced());
        assert_eq!(orch.board().get(0).unwrap().label, crate::smc::FanLabel::Pct(50));
    }

    #[test]
    fn unlock_is_reasserted_after_yield() {
        let (mut orch, smc, clock, _temp) = setup(1);
        orch.set_all_fans_speed(30.0).unwrap();
        // initial write plus the re-assert after the daemon yielded
        assert_eq!(count_writes(&smc, "Ftst", &[1]), 2);
        assert!(clock.now() >= control::UNLOCK_STABILIZE + control::VERIFY_DELAY);
        assert!(orch.unlock_state().is_unlocked());

        // already unlocked: no second handshake
        orch.set_all_fans_speed(40.0).unwrap();
        assert_eq!(count_writes(&smc, "Ftst", &[1]), 2);
    }

    #[test]
    fn gives_up_after_three_attempts_when_daemon_holds_fan() {
        let (mut orch, smc, clock, _temp) = setup(1);
        smc.insert_value(k("F0Md"), TypeTag::UI8, keys::MODE_SYSTEM as f64);
        smc.ignore_writes(k("F0Md"));

        assert!(!orch.set_all_fans_speed(60.0).unwrap());
        assert_eq!(count_writes(&smc, "F0Md", &[1]), 3);
        // initial unlock plus one re-send between each pair of attempts
        assert_eq!(count_writes(&smc, "Ftst", &[1]), 3);
        assert!(clock.now() >= control::UNLOCK_POLL_WINDOW);
        assert!(!orch.is_forced());
    }

    #[test]
    fn manual_mode_reapplies_after_reclaim() {
        let (mut orch, smc, _clock, _temp) = setup(1);
        orch.set_manual_speed(70.0).unwrap();
        assert!(!orch.reevaluate());

        // OS takes the fan back
        smc.insert_value(k("F0Md"), TypeTag::UI8, keys::MODE_SYSTEM as f64);
        assert!(orch.reevaluate());
        assert_eq!(smc.value(k("F0Md")), Some(1.0));
    }

    #[test]
    fn mode_change_to_manual_waits_for_evaluation() {
        let (mut orch, smc, _clock, _temp) = setup(1);
        orch.set_control_mode(ControlMode::Manual(40.0)).unwrap();
        assert!(smc.writes().is_empty());
        assert!(orch.reevaluate());
        assert_eq!(smc.value(k("F0Md")), Some(1.0));
    }

    #[test]
    fn automatic_mode_resets_fans() {
        let (mut orch, smc, _clock, _temp) = setup(1);
        orch.set_manual_speed(80.0).unwrap();
        orch.set_control_mode(ControlMode::Automatic).unwrap();

        assert_eq!(smc.value(k("F0Md")), Some(0.0));
        assert_eq!(smc.value(k("F0Mn")), Some(1200.0));
        assert_eq!(smc.value(k("FS! ")), Some(0.0));
        assert_eq!(smc.value(k("Ftst")), Some(0.0));
        assert!(!orch.is_forced());
    }

    #[test]
    fn curve_holds_through_cooldown_then_releases() {
        let (mut orch, smc, clock, temp) = setup(1);
        let curve = FanCurve::from_pairs(&[(30.0, 0.0), (60.0, 50.0), (90.0, 100.0)]).unwrap();
        orch.set_control_mode(ControlMode::Curve(curve)).unwrap();

        temp.set(Some(75.0));
        assert!(orch.reevaluate());
        assert_eq!(smc.value(k("F0Tg")), Some(1200.0 + 4800.0 * 0.75));
        assert_eq!(orch.curve_phase(), CurvePhase::ForcedRising);

        // same demand: nothing new to write
        assert!(!orch.reevaluate());

        temp.set(Some(20.0));
        assert!(!orch.reevaluate());
        assert_eq!(orch.curve_phase(), CurvePhase::CoolingDown);
        assert_eq!(smc.value(k("F0Md")), Some(1.0));

        clock.advance(control::CURVE_COOLDOWN);
        assert!(orch.reevaluate());
        assert_eq!(orch.curve_phase(), CurvePhase::Automatic);
        assert_eq!(smc.value(k("F0Md")), Some(0.0));
        assert_eq!(smc.value(k("Ftst")), Some(0.0));

        assert!(!orch.reevaluate());
    }

    #[test]
    fn curve_without_temperature_does_nothing() {
        let smc = MemorySmc::simulated_machine(1);
        let mut source = MockTemperatureSource::new();
        source.expect_current_temperature().returning(|| None);
        let mut orch = FanOrchestrator::new(
            smc.clone(),
            ManualClock::new(),
            Arc::new(source),
            ControlTiming::default(),
        );
        orch.discover();
        orch.set_control_mode(ControlMode::Curve(FanCurve::default())).unwrap();
        assert!(!orch.reevaluate());
        assert!(smc.writes().is_empty());
    }

    #[test]
    fn per_fan_control() {
        let (mut orch, smc, _clock, _temp) = setup(2);
        assert!(orch.set_fan_speed(1, FanSpeed::Percent(100.0)).unwrap());
        assert_eq!(smc.value(k("F1Md")), Some(1.0));
        assert_eq!(smc.value(k("F0Md")), Some(0.0));

        assert!(orch.set_fan_speed(1, FanSpeed::Auto).unwrap());
        assert_eq!(smc.value(k("F1Md")), Some(0.0));
        assert_eq!(smc.value(k("Ftst")), Some(0.0));
        assert!(!orch.is_forced());

        assert!(matches!(
            orch.set_fan_speed(5, FanSpeed::Auto),
            Err(FanbridgeError::NoSuchFan(5))
        ));
    }

    #[test]
    fn rejects_out_of_range_percentages() {
        let (mut orch, _smc, _clock, _temp) = setup(1);
        assert!(orch.set_manual_speed(101.0).is_err());
        assert!(orch.set_all_fans_speed(-1.0).is_err());
        assert!(orch.set_control_mode(ControlMode::Manual(250.0)).is_err());
        assert_eq!(orch.mode(), &ControlMode::Automatic);
    }

    #[test]
    fn all_fans_auto_ends_manual_mode() {
        let (mut orch, smc, _clock, _temp) = setup(1);
        orch.set_manual_speed(55.0).unwrap();
        assert!(orch.set_all_fans_auto());
        assert_eq!(orch.mode(), &ControlMode::Automatic);
        assert_eq!(smc.value(k("F0Md")), Some(0.0));
        assert!(!orch.reevaluate());
    }

    #[test]
    fn teardown_resets_exactly_once() {
        let (mut orch, smc, _clock, _temp) = setup(2);
        orch.set_manual_speed(90.0).unwrap();
        assert_eq!(count_writes(&smc, "Ftst", &[0]), 0);

        assert!(orch.shutdown());
        assert!(!orch.shutdown());
        drop(orch);

        assert_eq!(count_writes(&smc, "Ftst", &[0]), 1);
        assert_eq!(count_writes(&smc, "F0Md", &[0]), 1);
        assert_eq!(count_writes(&smc, "F1Md", &[0]), 1);
        assert_eq!(smc.value(k("FS! ")), Some(0.0));
    }

    #[test]
    fn drop_alone_resets_fans() {
        let (mut orch, smc, _clock, _temp) = setup(1);
        orch.set_manual_speed(90.0).unwrap();
        drop(orch);
        assert_eq!(count_writes(&smc, "Ftst", &[0]), 1);
        assert_eq!(smc.value(k("F0Md")), Some(0.0));
    }
}
