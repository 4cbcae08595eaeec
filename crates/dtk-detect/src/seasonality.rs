//! Seasonality-group adaptive adjustment of detector statistics.
//!
//! Each configured component partitions the window by the joint value of
//! its seasonality columns. The group containing the judged index
//! contributes multiplicative adjustments `group_stat / global_stat` to
//! the center and scale; storing multipliers rather than per-group
//! absolutes keeps the global distribution center stable while each
//! seasonal bucket tightens or widens its interval.

use serde::{Deserialize, Serialize};

use dtk_common::SeasonalityData;

use crate::stats::{StatFamily, EPSILON};

/// One seasonality component: a single column or a column interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentSpec {
    Single(String),
    Interaction(Vec<String>),
}

impl ComponentSpec {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            ComponentSpec::Single(name) => vec![name.as_str()],
            ComponentSpec::Interaction(names) => names.iter().map(String::as_str).collect(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ComponentSpec::Single(name) => name.clone(),
            ComponentSpec::Interaction(names) => names.join("*"),
        }
    }
}

/// Per-component adjustment recorded in detection metadata
#[derive(Debug, Clone, Serialize)]
pub struct GroupAdjustment {
    pub component: String,
    pub group_key: String,
    pub group_size: usize,
    pub center_multiplier: f64,
    pub scale_multiplier: f64,
}

/// Adjusted statistics plus the contributing groups
#[derive(Debug, Clone)]
pub struct Adjusted {
    pub center: f64,
    pub scale: f64,
    pub groups: Vec<GroupAdjustment>,
}

fn group_key(columns: &[&str], row: &SeasonalityData) -> Option<String> {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        parts.push(row.get(*column)?.key_part());
    }
    Some(parts.join("|"))
}

/// Derive the adjusted (center, scale) for the group containing `current`.
///
/// `samples` are the finite window samples as (position, value, weight);
/// `seasonality` is indexed by position. Components whose columns are
/// missing at the current index, or whose current group is smaller than
/// `min_samples_per_group`, contribute nothing.
#[allow(clippy::too_many_arguments)]
pub fn adjust(
    samples: &[(usize, f64, f64)],
    seasonality: &[SeasonalityData],
    current: usize,
    components: &[ComponentSpec],
    min_samples_per_group: usize,
    family: StatFamily,
    global_center: f64,
    global_scale: f64,
) -> Adjusted {
    let mut center = global_center;
    let mut scale = global_scale;
    let mut groups = Vec::new();

    for component in components {
        let columns = component.columns();
        let Some(current_key) = seasonality
            .get(current)
            .and_then(|row| group_key(&columns, row))
        else {
            continue;
        };

        let members: Vec<(f64, f64)> = samples
            .iter()
            .filter(|(position, _, _)| {
                seasonality
                    .get(*position)
                    .and_then(|row| group_key(&columns, row))
                    .as_deref()
                    == Some(current_key.as_str())
            })
            .map(|(_, value, weight)| (*value, *weight))
            .collect();
        if members.len() < min_samples_per_group {
            continue;
        }

        let (group_center, group_scale) = family.center_scale(&members);
        let center_multiplier = if global_center.abs() <= EPSILON {
            1.0
        } else {
            group_center / global_center
        };
        let scale_multiplier = if global_scale <= EPSILON {
            1.0
        } else {
            group_scale / global_scale
        };
        center *= center_multiplier;
        scale *= scale_multiplier;
        groups.push(GroupAdjustment {
            component: component.label(),
            group_key: current_key,
            group_size: members.len(),
            center_multiplier,
            scale_multiplier,
        });
    }

    Adjusted {
        center,
        scale: scale.max(EPSILON),
        groups,
    }
}
