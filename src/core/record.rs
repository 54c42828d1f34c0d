//! Records flowing through the pipeline

use crate::core::value::Value;
use serde::Serialize;
use std::collections::HashMap;

/// Variable binding threaded through query templates
pub type Vars = HashMap<String, Value>;

/// One unit of work flowing between stages
///
/// `sequence_start..=sequence_end` identifies which source rows the record
/// stands for. A fresh record covers exactly one row; batching widens the
/// range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub sequence_start: u64,
    pub sequence_end: u64,
    pub vars: Vars,
}

impl Record {
    /// Create an atomic record for a single source row
    pub fn new(sequence: u64, vars: Vars) -> Self {
        Self {
            sequence_start: sequence,
            sequence_end: sequence,
            vars,
        }
    }

    /// Create a record covering a range of source rows
    pub fn with_range(sequence_start: u64, sequence_end: u64, vars: Vars) -> Self {
        debug_assert!(sequence_start <= sequence_end);
        Self {
            sequence_start,
            sequence_end,
            vars,
        }
    }

    /// Identity string: `"7"` for an atomic record, `"3_7"` for a merged one
    pub fn id(&self) -> String {
        if self.is_atomic() {
            self.sequence_start.to_string()
        } else {
            format!("{}_{}", self.sequence_start, self.sequence_end)
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.sequence_start == self.sequence_end
    }

    /// Vars as a single map value, for nesting under `LEFT`/`RIGHT`
    pub fn vars_value(&self) -> Value {
        vars_to_value(&self.vars)
    }
}

/// Merge variable layers; later layers win on key conflicts
pub fn merge_vars<'a>(layers: impl IntoIterator<Item = &'a Vars>) -> Vars {
    let mut merged = Vars::new();
    for layer in layers {
        for (k, v) in layer {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

pub fn vars_to_value(vars: &Vars) -> Value {
    Value::Map(vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Union of two inclusive sequence ranges
pub fn merge_range(a: (u64, u64), b: (u64, u64)) -> (u64, u64) {
    (a.0.min(b.0), a.1.max(b.1))
}
