//! TTL-bounded record cache with negative entries.
//!
//! TTLs become absolute expiry timestamps at insertion, clamped to
//! `[min_ttl, 2^31)` seconds. NXDOMAIN results are cached as records with a
//! null payload for the configured negative lifetime. Expired entries are
//! never returned and are pruned by the scans that find them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::wire::{Rdata, Record};

const TTL_CEILING: u64 = 1 << 31;

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) expiry: Instant,
    pub(crate) record: Record,
}

impl Entry {
    pub(crate) fn negative(&self) -> bool {
        self.record.rdata.is_none()
    }
}

pub(crate) struct Cache {
    map: HashMap<(String, u16), Vec<Entry>>,
    min_ttl: Duration,
    clear_nxdomain: Duration,
}

impl Cache {
    pub(crate) fn new(min_ttl: Duration, clear_nxdomain: Duration) -> Cache {
        Cache {
            map: HashMap::new(),
            min_ttl,
            clear_nxdomain,
        }
    }

    /// Insert one answer under its query name, replacing any negative entry.
    pub(crate) fn put(&mut self, qname: &str, record: Record, now: Instant) {
        let ttl = Duration::from_secs(
            (record.ttl as u64).clamp(self.min_ttl.as_secs(), TTL_CEILING - 1),
        );
        let key = (qname.to_ascii_lowercase(), record.qtype);
        let entries = self.map.entry(key).or_default();
        entries.retain(|entry| !entry.negative() && entry.expiry > now);
        entries.push(Entry {
            expiry: now + ttl,
            record,
        });
    }

    /// Cache an NXDOMAIN for the configured negative lifetime.
    pub(crate) fn put_nxdomain(&mut self, qname: &str, qtype: u16, now: Instant) {
        let key = (qname.to_ascii_lowercase(), qtype);
        let entries = self.map.entry(key).or_default();
        entries.clear();
        entries.push(Entry {
            expiry: now + self.clear_nxdomain,
            record: Record {
                name: qname.to_ascii_lowercase(),
                qtype,
                ttl: self.clear_nxdomain.as_secs() as u32,
                rdata: None,
            },
        });
    }

    /// Live entries for a name+type; `None` when nothing usable is cached.
    /// Prunes what it finds expired.
    pub(crate) fn get(&mut self, qname: &str, qtype: u16, now: Instant) -> Option<Vec<Entry>> {
        let key = (qname.to_ascii_lowercase(), qtype);
        let entries = self.map.get_mut(&key)?;
        entries.retain(|entry| entry.expiry > now);
        if entries.is_empty() {
            self.map.remove(&key);
            return None;
        }
        Some(entries.clone())
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::super::wire::QTYPE_A;
    use super::*;
    use std::net::Ipv4Addr;

    fn a_record(name: &str, ttl: u32) -> Record {
        Record {
            name: name.into(),
            qtype: QTYPE_A,
            ttl,
            rdata: Some(Rdata::A(Ipv4Addr::new(203, 0, 113, 7))),
        }
    }

    fn cache() -> Cache {
        Cache::new(Duration::from_secs(900), Duration::from_secs(43200))
    }

    #[test]
    fn ttl_clamped_to_floor() {
        let mut cache = cache();
        let now = Instant::now();
        cache.put("example.org", a_record("example.org", 1), now);
        let entries = cache.get("example.org", QTYPE_A, now).unwrap();
        // a one-second TTL is raised to the floor
        assert!(entries[0].expiry >= now + Duration::from_secs(900));
    }

    #[test]
    fn expired_entries_never_returned() {
        let mut cache = Cache::new(Duration::from_secs(0), Duration::from_secs(1));
        let now = Instant::now();
        cache.put("example.org", a_record("example.org", 0), now);
        assert!(cache.get("example.org", QTYPE_A, now).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn nxdomain_negative_entry() {
        let mut cache = cache();
        let now = Instant::now();
        cache.put_nxdomain("gone.example.org", QTYPE_A, now);
        let entries = cache.get("gone.example.org", QTYPE_A, now).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].negative());

        // a later positive answer displaces the negative
        cache.put("gone.example.org", a_record("gone.example.org", 3600), now);
        let entries = cache.get("gone.example.org", QTYPE_A, now).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].negative());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut cache = cache();
        let now = Instant::now();
        cache.put("Example.ORG", a_record("Example.ORG", 3600), now);
        assert!(cache.get("example.org", QTYPE_A, now).is_some());
    }
}
