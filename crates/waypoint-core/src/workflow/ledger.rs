//! Per-invocation view of a run's step ledger.
//!
//! The ledger is loaded once per invocation and then kept in sync with every
//! write the invocation makes. Steps are matched by position: each name gets
//! an occurrence counter that restarts at zero on every replay, so a loop
//! reusing one name produces `name#0`, `name#1`, ... deterministically.

use std::collections::HashMap;

use uuid::Uuid;
use waypoint_types::workflow::{StepKey, StepRecord};

/// Namespace for delivery tokens derived from a parent token.
const TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_52a0_3c2e_4d7b_9a4e_1f0c_8d3b_2a61);

/// Derive the owner token of a step created under `parent`.
///
/// Deterministic, so a redelivered invocation derives the same tokens as the
/// original one and is recognized as the creator of its steps.
pub fn derive_token(parent: &str, key: &StepKey) -> String {
    let seed = format!("{parent}|{}|{}", key.name, key.occurrence);
    Uuid::new_v5(&TOKEN_NAMESPACE, seed.as_bytes()).to_string()
}

/// Token owning the retry of `key` after `attempt` failed.
pub fn retry_token(owner: &str, key: &StepKey, attempt: u32) -> String {
    let seed = format!("{owner}|retry|{}|{}|{attempt}", key.name, key.occurrence);
    Uuid::new_v5(&TOKEN_NAMESPACE, seed.as_bytes()).to_string()
}

#[derive(Debug, Default)]
pub struct Ledger {
    records: Vec<StepRecord>,
    index: HashMap<StepKey, usize>,
    occurrences: HashMap<String, u32>,
}

impl Ledger {
    pub fn new(records: Vec<StepRecord>) -> Self {
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key.clone(), i))
            .collect();
        Self {
            records,
            index,
            occurrences: HashMap::new(),
        }
    }

    /// Key of the next step reached under `name` in this replay.
    pub fn next_key(&mut self, name: &str) -> StepKey {
        let counter = self.occurrences.entry(name.to_string()).or_insert(0);
        let key = StepKey::new(name, *counter);
        *counter += 1;
        key
    }

    pub fn get(&self, key: &StepKey) -> Option<&StepRecord> {
        self.index.get(key).map(|&i| &self.records[i])
    }

    /// Insert or replace the record stored under its key.
    pub fn upsert(&mut self, record: StepRecord) {
        match self.index.get(&record.key) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
