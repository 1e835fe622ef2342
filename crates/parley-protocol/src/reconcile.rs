//! Reconciliation request/response.
//!
//! A client names the state slots it wants re-read; the server answers with a
//! value for each of exactly those slots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReconcileRequest {
    pub slots: Vec<String>,
}

impl ReconcileRequest {
    pub fn new<I, S>(slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slots: slots.into_iter().map(Into::into).collect(),
        }
    }

    /// Requested slots without duplicates, in sorted order.
    pub fn unique_slots(&self) -> BTreeSet<&str> {
        self.slots.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReconcileResponse {
    pub slots: BTreeMap<String, Value>,
}

impl ReconcileResponse {
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.slots.get(slot)
    }

    /// Drop any slot that was not asked for.
    pub fn retain_requested(&mut self, request: &ReconcileRequest) {
        let wanted = request.unique_slots();
        self.slots.retain(|name, _| wanted.contains(name.as_str()));
    }
}
