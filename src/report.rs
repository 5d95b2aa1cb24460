/*
 * This file is part of Fanbridge.
 *
 * Copyright (C) 2025 Fanbridge contributors
 *
 * Fanbridge is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fanbridge is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fanbridge. If not, see <https://www.gnu.org/licenses/>.
 */

//! One-shot sensor snapshot and key listing

use std::fmt::Write as _;

use fb_core::smc::{classify, fans, SensorCategory};
use fb_core::temperature::{average_temperature, cpu_temperature_keys};
use fb_core::{FanDescriptor, FanLabel, SensorKey, SmcAccess};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub key: String,
    pub category: SensorCategory,
    pub value: f64,
    pub unit: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub cpu_temperature: Option<f64>,
    pub fans: Vec<FanDescriptor>,
    pub sensors: Vec<SensorReading>,
}

/// Read every known sensor once. Fan registers are reported per fan, not
/// as loose sensors.
pub fn collect<A: SmcAccess + ?Sized>(smc: &mut A, keys: &[SensorKey]) -> Snapshot {
    let mut sensors = Vec::new();
    for &key in keys {
        let category = classify(key);
        if matches!(category, SensorCategory::Fan | SensorCategory::Other) {
            continue;
        }
        if let Some(value) = smc.read_value(key) {
            sensors.push(SensorReading {
                key: key.to_string(),
                category,
                value,
                unit: category.unit(),
            });
        }
    }

    Snapshot {
        cpu_temperature: average_temperature(smc, &cpu_temperature_keys(keys)),
        fans: fans::discover_fans(smc),
        sensors,
    }
}

fn label_text(label: FanLabel) -> String {
    match label {
        FanLabel::Auto => "auto".to_string(),
        FanLabel::Max => "max".to_string(),
        FanLabel::Pct(p) => format!("{}%", p),
    }
}

pub fn render_text(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    match snapshot.cpu_temperature {
        Some(t) => {
            let _ = writeln!(out, "CPU temperature: {:.1} °C", t);
        }
        None => out.push_str("CPU temperature: unavailable\n"),
    }

    out.push_str("\nFans:\n");
    if snapshot.fans.is_empty() {
        out.push_str("  (none)\n");
    }
    for fan in &snapshot.fans {
        let _ = writeln!(
            out,
            "  F{}  {:>5.0} rpm  ({:.0}-{:.0})  target {:.0}  {}",
            fan.index,
            fan.current,
            fan.min,
            fan.max,
            fan.target,
            label_text(fan.label)
        );
    }

    out.push_str("\nSensors:\n");
    for s in &snapshot.sensors {
        let _ = writeln!(out, "  {}  {:>8.2} {}", s.key, s.value, s.unit);
    }
    out
}

pub fn render_json(snapshot: &Snapshot) -> serde_json::Result<String> {
    serde_json::to_string_pretty(snapshot)
}

/// `KEY  type  value` for every key; undecodable values show as `-`
pub fn render_key_list<A: SmcAccess + ?Sized>(smc: &mut A, keys: &[SensorKey]) -> String {
    let mut out = String::new();
    for &key in keys {
        let tag = smc
            .key_type(key)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "????".to_string());
        let value = smc
            .read_value(key)
            .map(|v| format!("{}", v))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(out, "{}  {}  {}", key, tag, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fb_core::MemorySmc;

    #[test]
    fn snapshot_of_simulated_machine() {
        let mut smc = MemorySmc::simulated_machine(2);
        let keys = smc.keys();
        let snapshot = collect(&mut smc, &keys);

        assert_eq!(snapshot.fans.len(), 2);
        // Tp01 48, Tp05 52.5, Te05 45
        let cpu = snapshot.cpu_temperature.unwrap();
        assert!((cpu - 48.5).abs() < 1e-9);
        assert!(snapshot.sensors.iter().any(|s| s.key == "TG0P"));
        assert!(snapshot.sensors.iter().all(|s| !s.key.starts_with("F0")));

        let text = render_text(&snapshot);
        assert!(text.contains("CPU temperature: 48.5 °C"));
        assert!(text.contains("F1   1800 rpm"));

        let json: serde_json::Value = serde_json::from_str(&render_json(&snapshot).unwrap()).unwrap();
        assert_eq!(json["fans"][0]["label"], "auto");
    }

    #[test]
    fn key_list_shows_type_and_value() {
        let mut smc = MemorySmc::simulated_machine(1);
        let keys = smc.keys();
        let listing = render_key_list(&mut smc, &keys);
        assert!(listing.contains("FNum  ui8   1"));
        assert!(listing.contains("F0Mx  flt   6000"));
    }
}
