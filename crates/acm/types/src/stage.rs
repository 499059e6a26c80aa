//! Readers for the ordering properties of element definitions
//!
//! Element definition properties are opaque JSON. Only two keys are read by
//! the runtime: `startPhase` (an integer, default 0) and `stage`, which is
//! either a list of integers (migration stages) or an object with `migrate`
//! and `prepare` lists.

use serde_json::Value;
use std::collections::BTreeSet;

/// Opaque property bag attached to definitions and elements
pub type Properties = serde_json::Map<String, Value>;

pub const START_PHASE: &str = "startPhase";
pub const STAGE: &str = "stage";
pub const STAGE_MIGRATE: &str = "migrate";
pub const STAGE_PREPARE: &str = "prepare";

/// Highest stage number accepted from a definition
pub const MAX_STAGE: i32 = 1000;

/// Which stage list of an element definition to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Migrate,
    Prepare,
}

fn as_i32(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Start phase of an element definition
pub fn start_phase(properties: &Properties) -> i32 {
    properties.get(START_PHASE).and_then(as_i32).unwrap_or(0)
}

/// Stages an element participates in, never empty
pub fn stage_set(properties: &Properties, kind: StageKind) -> BTreeSet<i32> {
    let list = match (properties.get(STAGE), kind) {
        (Some(Value::Array(items)), StageKind::Migrate) => Some(items),
        (Some(Value::Object(map)), StageKind::Migrate) => {
            map.get(STAGE_MIGRATE).and_then(Value::as_array)
        }
        (Some(Value::Object(map)), StageKind::Prepare) => {
            map.get(STAGE_PREPARE).and_then(Value::as_array)
        }
        _ => None,
    };

    let stages: BTreeSet<i32> = list
        .map(|items| {
            items
                .iter()
                .filter_map(as_i32)
                .filter(|s| (0..=MAX_STAGE).contains(s))
                .collect()
        })
        .unwrap_or_default();

    if stages.is_empty() {
        BTreeSet::from([0])
    } else {
        stages
    }
}

/// First stage after `current` in `stages`
pub fn next_stage(stages: &BTreeSet<i32>, current: i32) -> Option<i32> {
    stages.range(current + 1..).next().copied()
}
