use serde::{Deserialize, Serialize};

pub const GRID_POWER_FIELD: &str = "em_power_grid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Int,
    Float,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub target_unit: Option<&'static str>,
    pub target_type: TargetType,
}

const fn power(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        target_unit: Some("W"),
        target_type: TargetType::Int,
    }
}

const fn float(name: &'static str, unit: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        target_unit: Some(unit),
        target_type: TargetType::Float,
    }
}

/// Units and numeric types the ingestion endpoint expects per field.
pub const FIELD_SPECS: &[FieldSpec] = &[
    power(GRID_POWER_FIELD),
    power("em_power_consumption"),
    power("em_power_pv"),
    power("em_power_battery"),
    power("em_power_evcharger"),
    power("em_power_heatpump"),
    power("em_power_bhkw"),
    power("bat_dc_power"),
    float("bat_soc", "%"),
    float("bat_kwh_remaining", "kWh"),
    float("bat_dc_voltage", "V"),
    float("bat_dc_current", "A"),
    float("bat_dc_temperature", "°C"),
];

pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    FIELD_SPECS.iter().find(|spec| spec.name == name)
}

/// Optional fields a connection may map to an entity.
pub fn optional_field_names() -> impl Iterator<Item = &'static str> {
    FIELD_SPECS
        .iter()
        .map(|spec| spec.name)
        .filter(|name| *name != GRID_POWER_FIELD)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
}

impl From<FieldValue> for serde_json::Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Int(v) => v.into(),
            FieldValue::Float(v) => v.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
}

impl Reading {
    pub fn normalized(&self) -> FieldValue {
        normalize(self.value, self.unit.as_deref(), &self.name)
    }
}

/// Converts a raw reading into the unit and type expected for `field`.
///
/// Never fails: unknown fields pass through as floats and unknown unit pairs keep the raw value.
pub fn normalize(raw: f64, source_unit: Option<&str>, field: &str) -> FieldValue {
    let (target_unit, target_type) = match field_spec(field) {
        Some(spec) => (spec.target_unit, spec.target_type),
        None => (None, TargetType::Float),
    };

    let scaled = scale_value(raw, source_unit, target_unit);
    match target_type {
        TargetType::Int => FieldValue::Int(scaled.round() as i64),
        TargetType::Float => FieldValue::Float(scaled),
    }
}

fn scale_value(value: f64, from_unit: Option<&str>, to_unit: Option<&str>) -> f64 {
    let Some(to) = to_unit.map(str::trim) else {
        return value;
    };
    let from = from_unit.map(str::trim).unwrap_or("");

    // Bare or ratio sources for a percent field: values at or below 1.0 are fractions.
    // 1.0 itself is read as 100 %, see DESIGN.md.
    if to == "%" && matches!(from, "" | "ratio" | "1") {
        return if value <= 1.0 { value * 100.0 } else { value };
    }

    if from.is_empty() || from == to {
        return value;
    }

    match (from, to) {
        ("kW", "W") => value * 1_000.0,
        ("MW", "W") => value * 1_000_000.0,
        ("Wh", "kWh") => value / 1_000.0,
        ("MWh", "kWh") => value * 1_000.0,
        ("mV", "V") => value / 1_000.0,
        ("kV", "V") => value * 1_000.0,
        ("mA", "A") => value / 1_000.0,
        ("kA", "A") => value * 1_000.0,
        // Temperatures (°C) and anything else stay as reported.
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_in_kw_becomes_integer_watts() {
        assert_eq!(normalize(5.0, Some("kW"), GRID_POWER_FIELD), FieldValue::Int(5000));
        assert_eq!(normalize(0.0012, Some("MW"), "em_power_pv"), FieldValue::Int(1200));
        assert_eq!(normalize(-1.5, Some("kW"), "em_power_battery"), FieldValue::Int(-1500));
    }

    #[test]
    fn watts_are_rounded_to_nearest() {
        assert_eq!(normalize(149.5, Some("W"), GRID_POWER_FIELD), FieldValue::Int(150));
        assert_eq!(normalize(149.49, None, GRID_POWER_FIELD), FieldValue::Int(149));
    }

    #[test]
    fn ratio_percent_heuristic() {
        assert_eq!(normalize(0.5, Some(""), "bat_soc"), FieldValue::Float(50.0));
        assert_eq!(normalize(0.5, None, "bat_soc"), FieldValue::Float(50.0));
        assert_eq!(normalize(0.25, Some("ratio"), "bat_soc"), FieldValue::Float(25.0));
        assert_eq!(normalize(75.0, Some(""), "bat_soc"), FieldValue::Float(75.0));
        assert_eq!(normalize(1.0, Some("1"), "bat_soc"), FieldValue::Float(100.0));
        assert_eq!(normalize(0.5, Some("%"), "bat_soc"), FieldValue::Float(0.5));
    }

    #[test]
    fn energy_voltage_and_current_scaling() {
        assert_eq!(normalize(2500.0, Some("Wh"), "bat_kwh_remaining"), FieldValue::Float(2.5));
        assert_eq!(normalize(0.5, Some("MWh"), "bat_kwh_remaining"), FieldValue::Float(500.0));
        assert_eq!(normalize(52000.0, Some("mV"), "bat_dc_voltage"), FieldValue::Float(52.0));
        assert_eq!(normalize(0.5, Some("kV"), "bat_dc_voltage"), FieldValue::Float(500.0));
        assert_eq!(normalize(1500.0, Some("mA"), "bat_dc_current"), FieldValue::Float(1.5));
        assert_eq!(normalize(0.25, Some("kA"), "bat_dc_current"), FieldValue::Float(250.0));
    }

    #[test]
    fn unknown_pairs_and_fields_pass_through() {
        assert_eq!(normalize(77.0, Some("°F"), "bat_dc_temperature"), FieldValue::Float(77.0));
        assert_eq!(normalize(21.5, Some("C"), "bat_dc_temperature"), FieldValue::Float(21.5));
        assert_eq!(normalize(3.0, Some("kW"), "not_a_field"), FieldValue::Float(3.0));
        assert_eq!(normalize(3.0, Some("BTU"), GRID_POWER_FIELD), FieldValue::Int(3));
    }

    #[test]
    fn optional_fields_exclude_grid_power() {
        let names: Vec<_> = optional_field_names().collect();
        assert!(!names.contains(&GRID_POWER_FIELD));
        assert_eq!(names.len(), FIELD_SPECS.len() - 1);
    }
}
