//! Fan curve: temperature to speed percentage
//!
//! Piecewise-linear between points, flat beyond the first and last point.
//! A curve always keeps at least two points.

use std::str::FromStr;

use fb_error::{FanbridgeError, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{curve as curve_const, default_curve};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Degrees Celsius
    pub temperature: f64,
    /// Fan speed, 0-100 %
    pub speed: f64,
}

impl CurvePoint {
    pub fn new(temperature: f64, speed: f64) -> Self {
        Self { temperature, speed }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CurvePoint>", into = "Vec<CurvePoint>")]
pub struct FanCurve {
    points: Vec<CurvePoint>,
}

fn normalize(points: &mut [CurvePoint]) {
    for p in points.iter_mut() {
        p.speed = p.speed.clamp(curve_const::MIN_PERCENT, curve_const::MAX_PERCENT);
    }
    points.sort_by(|a, b| a.temperature.total_cmp(&b.temperature));
}

impl FanCurve {
    /// Build a curve; points are sorted by temperature and speeds clamped
    pub fn new(mut points: Vec<CurvePoint>) -> Result<Self> {
        if points.len() < curve_const::MIN_POINTS {
            return Err(FanbridgeError::InvalidCurve(format!(
                "need at least {} points, got {}",
                curve_const::MIN_POINTS,
                points.len()
            )));
        }
        if points.iter().any(|p| !p.temperature.is_finite() || !p.speed.is_finite()) {
            return Err(FanbridgeError::InvalidCurve("non-finite point".into()));
        }
        normalize(&mut points);
        Ok(Self { points })
    }

    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self> {
        Self::new(pairs.iter().map(|&(t, s)| CurvePoint::new(t, s)).collect())
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Speed percentage for a temperature
    pub fn speed_for_temperature(&self, temp: f64) -> f64 {
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return curve_const::MAX_PERCENT,
        };

        if temp <= first.temperature {
            return first.speed;
        }
        if temp >= last.temperature {
            return last.speed;
        }

        for w in self.points.windows(2) {
            let (lo, hi) = (&w[0], &w[1]);
            if temp >= lo.temperature && temp <= hi.temperature {
                let span = hi.temperature - lo.temperature;
                if span.abs() < curve_const::FLOAT_EPSILON {
                    return lo.speed;
                }
                let ratio = (temp - lo.temperature) / span;
                return lo.speed + ratio * (hi.speed - lo.speed);
            }
        }

        last.speed
    }

    pub fn add_point(&mut self, point: CurvePoint) -> Result<()> {
        if !point.temperature.is_finite() || !point.speed.is_finite() {
            return Err(FanbridgeError::InvalidCurve("non-finite point".into()));
        }
        self.points.push(point);
        normalize(&mut self.points);
        Ok(())
    }

    /// Remove a point. Refused (returns false) when it would leave fewer than two.
    pub fn remove_point(&mut self, index: usize) -> bool {
        if self.points.len() <= curve_const::MIN_POINTS || index >= self.points.len() {
            return false;
        }
        self.points.remove(index);
        true
    }

    pub fn update_point(&mut self, index: usize, point: CurvePoint) -> Result<()> {
        if !point.temperature.is_finite() || !point.speed.is_finite() {
            return Err(FanbridgeError::InvalidCurve("non-finite point".into()));
        }
        let slot = self
            .points
            .get_mut(index)
            .ok_or_else(|| FanbridgeError::InvalidCurve(format!("no point {}", index)))?;
        *slot = point;
        normalize(&mut self.points);
        Ok(())
    }
}

impl Default for FanCurve {
    fn default() -> Self {
        CurvePreset::Balanced.to_curve()
    }
}

impl TryFrom<Vec<CurvePoint>> for FanCurve {
    type Error = FanbridgeError;

    fn try_from(points: Vec<CurvePoint>) -> Result<Self> {
        Self::new(points)
    }
}

impl From<FanCurve> for Vec<CurvePoint> {
    fn from(curve: FanCurve) -> Self {
        curve.points
    }
}

/// Built-in curves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurvePreset {
    Silent,
    Balanced,
    Performance,
}

impl CurvePreset {
    pub fn pairs(&self) -> Vec<(f64, f64)> {
        match self {
            CurvePreset::Silent => default_curve::silent(),
            CurvePreset::Balanced => default_curve::balanced(),
            CurvePreset::Performance => default_curve::performance(),
        }
    }

    pub fn to_curve(&self) -> FanCurve {
        let points = self
            .pairs()
            .into_iter()
            .map(|(t, s)| CurvePoint::new(t, s))
            .collect();
        FanCurve { points }
    }
}

impl FromStr for CurvePreset {
    type Err = FanbridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "silent" | "quiet" => Ok(CurvePreset::Silent),
            "balanced" => Ok(CurvePreset::Balanced),
            "performance" => Ok(CurvePreset::Performance),
            other => Err(FanbridgeError::InvalidCurve(format!("unknown preset '{}'", other))),
        }
    }
}
