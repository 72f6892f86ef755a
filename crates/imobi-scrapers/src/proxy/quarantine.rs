use super::ProxyRecord;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// A proxy sitting out a time-boxed suspension. The record is preserved so
/// the proxy can be reinstated without a provider round trip.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub record: ProxyRecord,
    pub release_at: DateTime<Utc>,
    pub severity: u64,
}

/// Address-keyed suspensions with escalating durations per severity tier.
#[derive(Debug)]
pub struct QuarantineLedger {
    entries: HashMap<String, QuarantineEntry>,
    tiers: [Duration; 3],
}

impl QuarantineLedger {
    pub fn new(tiers: [Duration; 3]) -> Self {
        Self {
            entries: HashMap::new(),
            tiers,
        }
    }

    /// Severity 1 maps to the first tier; anything past the last tier clamps.
    pub fn duration_for(&self, severity: u64) -> Duration {
        let index = severity.clamp(1, self.tiers.len() as u64) as usize - 1;
        self.tiers[index]
    }

    /// Suspend a proxy. Re-inserting an already-quarantined address updates
    /// its severity and pushes the release time out.
    pub fn insert(&mut self, record: ProxyRecord, severity: u64, now: DateTime<Utc>) {
        let release_at = now + self.duration_for(severity);
        self.entries.insert(
            record.address.clone(),
            QuarantineEntry {
                record,
                release_at,
                severity,
            },
        );
    }

    /// Bump an existing entry without replacing its saved record.
    pub fn escalate(&mut self, address: &str, severity: u64, now: DateTime<Utc>) -> bool {
        let release_at = now + self.duration_for(severity);
        match self.entries.get_mut(address) {
            Some(entry) => {
                entry.severity = severity;
                entry.release_at = release_at;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, address: &str) -> Option<QuarantineEntry> {
        self.entries.remove(address)
    }

    pub fn get(&self, address: &str) -> Option<&QuarantineEntry> {
        self.entries.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    /// Drain every entry whose suspension has expired.
    pub fn release_due(&mut self, now: DateTime<Utc>) -> Vec<ProxyRecord> {
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.release_at <= now)
            .map(|(address, _)| address.clone())
            .collect();

        due.into_iter()
            .filter_map(|address| self.entries.remove(&address))
            .map(|entry| entry.record)
            .collect()
    }

    /// Pull out the entry closest to release, regardless of its timer. Used
    /// by emergency recovery when the active pool is empty.
    pub fn force_release_soonest(&mut self) -> Option<ProxyRecord> {
        let address = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.release_at)
            .map(|(address, _)| address.clone())?;

        self.entries.remove(&address).map(|entry| entry.record)
    }

    pub fn soonest_release(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|entry| entry.release_at).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }
}
