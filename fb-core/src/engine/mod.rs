//! Fan control engine
//!
//! Curve interpolation, the hysteresis and unlock state machines, the
//! orchestrator that drives the controller, and the worker thread it runs on.

mod board;
mod curve;
mod hysteresis;
mod orchestrator;
mod worker;

pub use board::FanBoard;
pub use curve::{CurvePoint, CurvePreset, FanCurve};
pub use hysteresis::{CurveAction, CurveHysteresis, CurvePhase, UnlockState};
pub use orchestrator::{ControlMode, ControlTiming, FanOrchestrator, FanSpeed};
pub use worker::{ControlCommand, ControlWorker};
