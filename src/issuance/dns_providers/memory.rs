use std::{
    collections::{BTreeMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use anyhow::{Result, anyhow};
use log::{debug, info};

use super::{DnsRecordProvider, fqdn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: String,
    pub name: String,
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

#[derive(Default)]
struct State {
    next_id: u64,
    records: BTreeMap<(String, String), StoredRecord>,
    upserts: Vec<String>,
    deletions: Vec<String>,
    failing_upserts: HashSet<String>,
    failing_deletes: HashSet<String>,
}

/// Keeps records in process memory. Backs dry runs (nothing is published) and
/// lets tests inspect what a run published and removed.
#[derive(Default)]
pub struct MemoryDnsProvider {
    state: Mutex<State>,
}

impl MemoryDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every upsert for the given fully qualified name fail.
    pub fn fail_upserts_for(&self, record_name: &str) {
        if let Ok(mut state) = self.lock() {
            state.failing_upserts.insert(record_name.to_string());
        }
    }

    /// Makes every delete for the given fully qualified name fail.
    pub fn fail_deletes_for(&self, record_name: &str) {
        if let Ok(mut state) = self.lock() {
            state.failing_deletes.insert(record_name.to_string());
        }
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.lock()
            .map(|state| state.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, record_name: &str) -> Option<StoredRecord> {
        self.lock().ok().and_then(|state| {
            state
                .records
                .values()
                .find(|record| record.name == record_name)
                .cloned()
        })
    }

    /// Fully qualified names passed to `upsert_record`, in call order.
    pub fn upserts(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.upserts.clone())
            .unwrap_or_default()
    }

    /// Fully qualified names passed to `delete_records`, in call order.
    pub fn deletions(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.deletions.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory DNS provider state poisoned"))
    }
}

impl DnsRecordProvider for MemoryDnsProvider {
    fn id(&self) -> &'static str {
        "memory"
    }

    fn upsert_record(
        &self,
        base_domain: &str,
        host_record: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> Result<String> {
        let name = fqdn(base_domain, host_record);
        let mut state = self.lock()?;
        state.upserts.push(name.clone());
        if state.failing_upserts.contains(&name) {
            return Err(anyhow!("simulated upsert failure for {name}"));
        }

        let key = (name.clone(), record_type.to_uppercase());
        if let Some(existing) = state.records.get_mut(&key) {
            existing.value = value.to_string();
            existing.ttl = ttl;
            debug!("[dns-memory] updated {} {} -> {}", record_type, name, value);
            return Ok(existing.id.clone());
        }

        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        state.records.insert(
            key,
            StoredRecord {
                id: id.clone(),
                name: name.clone(),
                record_type: record_type.to_uppercase(),
                value: value.to_string(),
                ttl,
            },
        );
        info!("[dns-memory] created {} {} (id {})", record_type, name, id);
        Ok(id)
    }

    fn delete_records(
        &self,
        base_domain: &str,
        host_record: &str,
        record_type: &str,
    ) -> Result<usize> {
        let name = fqdn(base_domain, host_record);
        let mut state = self.lock()?;
        state.deletions.push(name.clone());
        if state.failing_deletes.contains(&name) {
            return Err(anyhow!("simulated delete failure for {name}"));
        }
        let removed = state
            .records
            .remove(&(name.clone(), record_type.to_uppercase()))
            .map_or(0, |_| 1);
        info!("[dns-memory] deleted {} record(s) at {}", removed, name);
        Ok(removed)
    }
}
