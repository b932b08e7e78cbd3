//! Durable record of every known alarm.
//!
//! An alarm that fires must still find its record here, or the fire is
//! treated as stale and dropped. Because the store survives restarts, this is
//! what lets [`reconcile`](crate::service::AlarmHandle::reconcile) bring
//! alarms back after the process was killed.

use std::sync::Arc;

use crate::alarm::{AlarmId, AlarmRecord};
use crate::store::{KeyValueStore, StoreError, StoreResult};
use crate::tracing::prelude::*;

const KEY_PREFIX: &str = "__alarm_id__";

pub struct AlarmRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl AlarmRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Persist `record`, replacing any record with the same id.
    pub fn save(&self, record: &AlarmRecord) -> StoreResult<()> {
        let value = serde_json::to_string(record)?;
        self.store.put(&key(record.id), &value)
    }

    pub fn remove(&self, id: AlarmId) -> StoreResult<()> {
        self.store.remove(&key(id))
    }

    pub fn exists(&self, id: AlarmId) -> StoreResult<bool> {
        Ok(self.store.get(&key(id))?.is_some())
    }

    pub fn get(&self, id: AlarmId) -> StoreResult<Option<AlarmRecord>> {
        self.store
            .get(&key(id))?
            .map(|value| serde_json::from_str(&value).map_err(StoreError::from))
            .transpose()
    }

    /// Every decodable record. Entries that fail to decode are logged and
    /// skipped so one bad record cannot hide the rest.
    pub fn list_all(&self) -> StoreResult<Vec<AlarmRecord>> {
        let mut records = Vec::new();
        for key in self.store.keys()? {
            if !key.starts_with(KEY_PREFIX) {
                continue;
            }
            let Some(value) = self.store.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<AlarmRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => error!(key = %key, error = %e, "Skipping undecodable alarm record"),
            }
        }
        Ok(records)
    }
}

fn key(id: AlarmId) -> String {
    format!("{KEY_PREFIX}{}", id.0)
}
