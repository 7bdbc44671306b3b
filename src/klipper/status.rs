//! Printer status snapshot
//!
//! The printer link caches the last known value of every subscribed object
//! here. Status payloads arrive as partial JSON maps (only changed keys are
//! present), so applying one mutates exactly the fields it mentions.

use std::collections::HashMap;

use serde_json::Value;

/// Klipper `print_stats.state` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintState {
    Standby,
    Ready,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
    #[default]
    Unknown,
}

impl PrintState {
    pub fn parse(value: &str) -> Self {
        match value {
            "standby" => PrintState::Standby,
            "ready" => PrintState::Ready,
            "printing" => PrintState::Printing,
            "paused" => PrintState::Paused,
            "complete" => PrintState::Complete,
            "cancelled" => PrintState::Cancelled,
            "error" => PrintState::Error,
            _ => PrintState::Unknown,
        }
    }
}

impl std::fmt::Display for PrintState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PrintState::Standby => "standby",
            PrintState::Ready => "ready",
            PrintState::Printing => "printing",
            PrintState::Paused => "paused",
            PrintState::Complete => "complete",
            PrintState::Cancelled => "cancelled",
            PrintState::Error => "error",
            PrintState::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Per-extruder thermal state
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtruderStatus {
    pub can_extrude: bool,
    pub temperature: f64,
    pub target: f64,
}

/// A runout sensor subscription: Klipper object name plus the short name
/// and the extruder it guards.
#[derive(Debug, Clone)]
pub struct SensorBinding {
    pub object: String,
    pub name: String,
    pub extruder: u8,
}

/// Last known printer state, updated by the link's receive task.
#[derive(Debug, Clone, Default)]
pub struct PrinterSnapshot {
    pub print_state: PrintState,
    pub extruders: [ExtruderStatus; 2],
    pub active_extruder: u8,
    /// sensor short name → filament present
    pub sensors: HashMap<String, bool>,
    pub connected: bool,
}

impl PrinterSnapshot {
    /// Apply a (partial) status map from `notify_status_update` or a query
    /// response. Keys absent from the map keep their cached value.
    pub fn apply_status(&mut self, status: &serde_json::Map<String, Value>, bindings: &[SensorBinding]) {
        if let Some(state) = status
            .get("print_stats")
            .and_then(|stats| stats.get("state"))
            .and_then(Value::as_str)
        {
            self.print_state = PrintState::parse(state);
        }

        if let Some(active) = status
            .get("toolhead")
            .and_then(|toolhead| toolhead.get("extruder"))
            .and_then(Value::as_str)
        {
            self.active_extruder = if active == "extruder1" { 1 } else { 0 };
        }

        for (index, object) in ["extruder", "extruder1"].into_iter().enumerate() {
            if let Some(fields) = status.get(object) {
                let cached = &mut self.extruders[index];
                if let Some(flag) = fields.get("can_extrude").and_then(Value::as_bool) {
                    cached.can_extrude = flag;
                }
                if let Some(temp) = fields.get("temperature").and_then(Value::as_f64) {
                    cached.temperature = temp;
                }
                if let Some(target) = fields.get("target").and_then(Value::as_f64) {
                    cached.target = target;
                }
            }
        }

        for binding in bindings {
            if let Some(detected) = status
                .get(&binding.object)
                .and_then(|sensor| sensor.get("filament_detected"))
                .and_then(Value::as_bool)
            {
                self.sensors.insert(binding.name.clone(), detected);
            }
        }
    }

    /// Filament presence at a sensor, `None` until the first report
    pub fn sensor_present(&self, name: &str) -> Option<bool> {
        self.sensors.get(name).copied()
    }

    /// Thermal state of the currently active extruder
    pub fn active_extruder_status(&self) -> &ExtruderStatus {
        &self.extruders[usize::from(self.active_extruder.min(1))]
    }

    /// Drop the cached print state; used when the link goes down so a stale
    /// value is never re-announced.
    pub fn reset_print_state(&mut self) {
        self.print_state = PrintState::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Vec<SensorBinding> {
        vec![
            SensorBinding {
                object: "filament_switch_sensor Filament_Sensor0".to_string(),
                name: "Filament_Sensor0".to_string(),
                extruder: 0,
            },
            SensorBinding {
                object: "filament_switch_sensor Filament_Sensor1".to_string(),
                name: "Filament_Sensor1".to_string(),
                extruder: 1,
            },
        ]
    }

    fn as_map(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn applies_print_state() {
        let mut snapshot = PrinterSnapshot::default();
        snapshot.apply_status(&as_map(json!({"print_stats": {"state": "printing"}})), &bindings());
        assert_eq!(snapshot.print_state, PrintState::Printing);
    }

    #[test]
    fn partial_update_keeps_cached_fields() {
        let mut snapshot = PrinterSnapshot::default();
        snapshot.apply_status(
            &as_map(json!({
                "extruder": {"temperature": 205.4, "target": 210.0, "can_extrude": true}
            })),
            &bindings(),
        );
        snapshot.apply_status(&as_map(json!({"extruder": {"temperature": 206.1}})), &bindings());

        assert_eq!(snapshot.extruders[0].temperature, 206.1);
        assert_eq!(snapshot.extruders[0].target, 210.0);
        assert!(snapshot.extruders[0].can_extrude);
    }

    #[test]
    fn tracks_active_extruder() {
        let mut snapshot = PrinterSnapshot::default();
        assert_eq!(snapshot.active_extruder, 0);
        snapshot.apply_status(&as_map(json!({"toolhead": {"extruder": "extruder1"}})), &bindings());
        assert_eq!(snapshot.active_extruder, 1);
        snapshot.apply_status(&as_map(json!({"toolhead": {"extruder": "extruder"}})), &bindings());
        assert_eq!(snapshot.active_extruder, 0);
    }

    #[test]
    fn tracks_sensor_state_by_short_name() {
        let mut snapshot = PrinterSnapshot::default();
        assert_eq!(snapshot.sensor_present("Filament_Sensor0"), None);
        snapshot.apply_status(
            &as_map(json!({
                "filament_switch_sensor Filament_Sensor0": {"filament_detected": true},
                "filament_switch_sensor Filament_Sensor1": {"filament_detected": false}
            })),
            &bindings(),
        );
        assert_eq!(snapshot.sensor_present("Filament_Sensor0"), Some(true));
        assert_eq!(snapshot.sensor_present("Filament_Sensor1"), Some(false));
    }

    #[test]
    fn unknown_state_string_maps_to_unknown() {
        assert_eq!(PrintState::parse("warming_up"), PrintState::Unknown);
        assert_eq!(PrintState::parse("printing"), PrintState::Printing);
    }

    #[test]
    fn reset_clears_only_print_state() {
        let mut snapshot = PrinterSnapshot::default();
        snapshot.apply_status(
            &as_map(json!({
                "print_stats": {"state": "printing"},
                "extruder": {"temperature": 190.0}
            })),
            &bindings(),
        );
        snapshot.reset_print_state();
        assert_eq!(snapshot.print_state, PrintState::Unknown);
        assert_eq!(snapshot.extruders[0].temperature, 190.0);
    }
}
