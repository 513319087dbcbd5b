//! Built-in system patterns
//!
//! A small starter library so a fresh deployment can propose labelings
//! before any learned patterns exist. Operators curate the rest through
//! the admin surfaces.

use chrono::Utc;
use tagmine_core::{Pattern, PatternId, PatternRole};

fn role(
    name: &str,
    patterns: &[&str],
    unit: Option<&str>,
    range: Option<(f64, f64)>,
    update_ms: Option<f64>,
    required: bool,
    sort_order: u32,
) -> PatternRole {
    PatternRole {
        name: name.to_string(),
        name_patterns: patterns.iter().map(|p| p.to_string()).collect(),
        typical_unit: unit.map(str::to_string),
        typical_min: range.map(|(min, _)| min),
        typical_max: range.map(|(_, max)| max),
        typical_update_ms: update_ms,
        required,
        sort_order,
    }
}

fn pattern(name: &str, description: &str, confidence: f64, roles: Vec<PatternRole>) -> Pattern {
    Pattern {
        id: PatternId::new(),
        name: name.to_string(),
        description: Some(description.to_string()),
        confidence,
        active: true,
        system_defined: true,
        roles,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// The shipped pattern library, all at the configured initial confidence
pub fn builtin_patterns(initial_confidence: f64) -> Vec<Pattern> {
    vec![
        pattern(
            "Air Handling Unit",
            "Supply/return air temperatures with a supply fan",
            initial_confidence,
            vec![
                role(
                    "Supply Air Temperature",
                    &["sat", "sup.*air.*temp", "supply.*temp"],
                    Some("degC"),
                    Some((5.0, 35.0)),
                    None,
                    true,
                    0,
                ),
                role(
                    "Return Air Temperature",
                    &["rat", "ret.*air.*temp", "return.*temp"],
                    Some("degC"),
                    Some((10.0, 35.0)),
                    None,
                    true,
                    1,
                ),
                role(
                    "Supply Fan Status",
                    &["fan.*status", "sf_status", "fan.*run"],
                    None,
                    None,
                    None,
                    false,
                    2,
                ),
            ],
        ),
        pattern(
            "Chiller",
            "Chilled water loop temperatures with compressor power",
            initial_confidence,
            vec![
                role(
                    "Chilled Water Supply Temperature",
                    &["chws", "chw.*sup", "chilled.*supply"],
                    Some("degC"),
                    Some((4.0, 12.0)),
                    None,
                    true,
                    0,
                ),
                role(
                    "Chilled Water Return Temperature",
                    &["chwr", "chw.*ret", "chilled.*return"],
                    Some("degC"),
                    Some((8.0, 18.0)),
                    None,
                    true,
                    1,
                ),
                role(
                    "Compressor Power",
                    &["comp.*pow", "compressor.*kw", "\\bkw\\b"],
                    Some("kW"),
                    Some((0.0, 2000.0)),
                    None,
                    false,
                    2,
                ),
                role(
                    "Condenser Water Temperature",
                    &["cdw", "cond.*temp", "condenser"],
                    Some("degC"),
                    None,
                    None,
                    false,
                    3,
                ),
            ],
        ),
        pattern(
            "Wind Turbine Drivetrain",
            "Rotor and generator speeds with gearbox temperature and power",
            initial_confidence,
            vec![
                role(
                    "Rotor Speed",
                    &["rotor.*(speed|rpm)", "\\brs\\b"],
                    Some("rpm"),
                    Some((0.0, 25.0)),
                    None,
                    true,
                    0,
                ),
                role(
                    "Generator Speed",
                    &["gen.*(speed|rpm)"],
                    Some("rpm"),
                    Some((0.0, 2000.0)),
                    None,
                    true,
                    1,
                ),
                role(
                    "Gearbox Oil Temperature",
                    &["gearbox.*temp", "gbx.*oil"],
                    Some("degC"),
                    Some((20.0, 80.0)),
                    None,
                    false,
                    2,
                ),
                role(
                    "Active Power",
                    &["active.*power", "\\bkw\\b", "\\bmw\\b"],
                    Some("kW"),
                    None,
                    None,
                    false,
                    3,
                ),
            ],
        ),
    ]
}
