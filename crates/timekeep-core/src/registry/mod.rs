//! Remote source registry: an open-addressed, quadratically-probed hash
//! table over source addresses, plus pool bookkeeping and tentative-source
//! reaping.
//!
//! Grounded on `ntp_sources.c`'s `find_slot`/`add_source`/`replace_source`/
//! `check_hashtable_size`/`rehash_records`/`NSR_ProcessReceive`. The
//! original's deletion already rebuilds the whole table to repair probe
//! chains (no tombstones in the source); this implementation keeps that
//! behaviour rather than introducing tombstones, per the design note's
//! "an implementer may use tombstones provided the probe-sequence invariant
//! is proved" — proving that invariant isn't worth the complexity here.

pub mod resolve;

pub use resolve::{Pool, ResolvedAddr, Resolver, UnresolvedEntry};

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Found {
    None,
    IpOnly,
    IpAndPort,
}

struct SourceRecord<T> {
    addr: IpAddr,
    port: u16,
    pool: Option<usize>,
    tentative: bool,
    /// Set once a reply has actually been received from this source (see
    /// `dispatch_receive`) and cleared by `mark_unreachable`; a source that
    /// is tentative has never been reachable by definition.
    reachable: bool,
    /// Whether the source is currently in burst sampling mode (e.g. under a
    /// manual `burst` command), tracked separately from reachability so the
    /// activity report can distinguish ordinary online/offline counts from
    /// burst-online/burst-offline per `RPT_ActivityReport`.
    burst: bool,
    state: T,
}

pub struct SourceReport {
    pub addr: IpAddr,
    pub port: u16,
    pub pool: Option<usize>,
    pub tentative: bool,
}

/// Mirrors the original's `RPT_ActivityReport` (`reports.h`): online/offline
/// counts split by whether the source is currently in burst sampling mode,
/// plus the count of names still awaiting resolution.
pub struct ActivityReport {
    pub online: usize,
    pub offline: usize,
    pub burst_online: usize,
    pub burst_offline: usize,
    pub unresolved: usize,
}

pub struct SourceRegistry<T> {
    slots: Vec<Option<SourceRecord<T>>>,
    capacity: usize,
    count: usize,
    pub pools: Vec<Pool>,
    pub unresolved: std::collections::VecDeque<UnresolvedEntry>,
}

fn hash_addr(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut h = 0u32;
            for lane in octets.chunks_exact(4) {
                h ^= u32::from_be_bytes([lane[0], lane[1], lane[2], lane[3]]);
            }
            h
        }
    }
}

/// Triangular-number probe offset for step `i`: `(i + i*i) / 2`.
fn triangular(i: usize) -> usize {
    (i + i * i) / 2
}

impl<T> SourceRegistry<T> {
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(4);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            capacity,
            count: 0,
            pools: Vec::new(),
            unresolved: std::collections::VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finds the slot for `(addr, port)`. Returns the slot index to use for
    /// either a lookup hit or an insertion (the first empty slot probed),
    /// and whether the IP (and optionally port) actually matched there.
    fn find_slot(&self, addr: IpAddr, port: u16) -> (usize, Found) {
        let hash = hash_addr(addr) as usize;
        for i in 0..self.capacity {
            let idx = (hash + triangular(i)) % self.capacity;
            match &self.slots[idx] {
                None => return (idx, Found::None),
                Some(rec) if rec.addr == addr => {
                    return (
                        idx,
                        if rec.port == port {
                            Found::IpAndPort
                        } else {
                            Found::IpOnly
                        },
                    );
                }
                Some(_) => continue,
            }
        }
        // Table full with no match: caller must grow before inserting.
        (usize::MAX, Found::None)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        let (_, found) = self.find_slot(addr, 0);
        !matches!(found, Found::None) || self.find_any_port(addr).is_some()
    }

    fn find_any_port(&self, addr: IpAddr) -> Option<usize> {
        let hash = hash_addr(addr) as usize;
        for i in 0..self.capacity {
            let idx = (hash + triangular(i)) % self.capacity;
            match &self.slots[idx] {
                None => return None,
                Some(rec) if rec.addr == addr => return Some(idx),
                Some(_) => continue,
            }
        }
        None
    }

    /// Adds a new source, rejecting duplicates by IP. New entries carrying
    /// `pool` start tentative.
    pub fn add(&mut self, addr: IpAddr, port: u16, pool: Option<usize>, state: T) -> Result<(), &'static str> {
        if self.find_any_port(addr).is_some() {
            return Err("duplicate source address");
        }

        self.maybe_grow();

        let (idx, _) = self.find_slot(addr, port);
        if idx == usize::MAX {
            return Err("hash table full");
        }
        self.slots[idx] = Some(SourceRecord {
            addr,
            port,
            pool,
            tentative: pool.is_some(),
            reachable: false,
            burst: false,
            state,
        });
        self.count += 1;
        Ok(())
    }

    /// Removes the source at `addr`, then rebuilds the table to repair any
    /// probe chains broken by the now-empty slot.
    pub fn remove(&mut self, addr: IpAddr) -> Option<T> {
        let idx = self.find_any_port(addr)?;
        let record = self.slots[idx].take().expect("found_any_port guarantees Some");
        self.count -= 1;
        self.rebuild_same_capacity();
        Some(record.state)
    }

    /// Replaces the address of an existing source, keeping its protocol
    /// state and pool membership, then rebuilds the table.
    pub fn replace_addr(&mut self, old: IpAddr, new: IpAddr, new_port: u16) -> Result<(), &'static str> {
        let idx = self.find_any_port(old).ok_or("source not found")?;
        let mut record = self.slots[idx].take().expect("found_any_port guarantees Some");
        record.addr = new;
        record.port = new_port;
        self.slots[idx] = None;
        self.count -= 1;
        self.rebuild_same_capacity();

        self.maybe_grow();
        let (new_idx, found) = self.find_slot(new, new_port);
        if !matches!(found, Found::None) {
            return Err("replacement address already present");
        }
        self.slots[new_idx] = Some(record);
        self.count += 1;
        Ok(())
    }

    fn maybe_grow(&mut self) {
        if 2 * self.count + 1 >= self.capacity {
            self.rebuild_at(self.capacity * 2);
        }
    }

    fn rebuild_same_capacity(&mut self) {
        let cap = self.capacity;
        self.rebuild_at(cap);
    }

    fn rebuild_at(&mut self, new_capacity: usize) {
        let old_slots = std::mem::replace(&mut self.slots, (0..new_capacity).map(|_| None).collect());
        self.capacity = new_capacity;
        for rec in old_slots.into_iter().flatten() {
            let (idx, _) = self.find_slot(rec.addr, rec.port);
            self.slots[idx] = Some(rec);
        }
    }

    /// Dispatch for a received packet: exact match delivers to the
    /// source's state; tentative sources are confirmed and, once a pool
    /// reaches `max_sources`, its remaining tentative entries are purged.
    /// Returns `None` on IP-only or no match (caller routes to the unknown
    /// handler).
    pub fn dispatch_receive(&mut self, addr: IpAddr, port: u16) -> Option<&mut T> {
        let (idx, found) = self.find_slot(addr, port);
        if !matches!(found, Found::IpAndPort) {
            return None;
        }

        let pool = self.slots[idx].as_ref().and_then(|r| r.pool);
        let was_tentative = self.slots[idx].as_ref().map(|r| r.tentative).unwrap_or(false);

        if let Some(rec) = self.slots[idx].as_mut() {
            rec.reachable = true;
        }

        if was_tentative {
            if let Some(rec) = self.slots[idx].as_mut() {
                rec.tentative = false;
            }
            if let Some(pool_idx) = pool {
                if let Some(p) = self.pools.get_mut(pool_idx) {
                    p.confirmed += 1;
                    if p.confirmed >= p.max_sources {
                        self.purge_tentative_in_pool(pool_idx);
                    }
                }
            }
        }

        self.slots[idx].as_mut().map(|r| &mut r.state)
    }

    /// Marks `addr` unreachable (e.g. a selection layer giving up on a
    /// source that stopped replying), moving it from the online/burst_online
    /// count into offline/burst_offline. No effect if `addr` is unknown.
    pub fn mark_unreachable(&mut self, addr: IpAddr) {
        if let Some(idx) = self.find_any_port(addr) {
            if let Some(rec) = self.slots[idx].as_mut() {
                rec.reachable = false;
            }
        }
    }

    /// Toggles burst-sampling mode for `addr`, moving it between the
    /// ordinary and burst_* activity-report buckets. No effect if `addr` is
    /// unknown.
    pub fn set_burst(&mut self, addr: IpAddr, burst: bool) {
        if let Some(idx) = self.find_any_port(addr) {
            if let Some(rec) = self.slots[idx].as_mut() {
                rec.burst = burst;
            }
        }
    }

    fn purge_tentative_in_pool(&mut self, pool_idx: usize) {
        let addrs: Vec<IpAddr> = self
            .slots
            .iter()
            .flatten()
            .filter(|r| r.pool == Some(pool_idx) && r.tentative)
            .map(|r| r.addr)
            .collect();
        for addr in addrs {
            self.remove(addr);
        }
    }

    /// Mirrors the original's `NCR_IncrementActivityCounters`: every
    /// occupied slot is bucketed by (burst, reachable) into exactly one of
    /// online/offline/burst_online/burst_offline. A tentative source has
    /// never replied, so it counts as offline (or burst_offline) until
    /// `dispatch_receive` marks it reachable.
    pub fn activity_report(&self) -> ActivityReport {
        let mut online = 0;
        let mut offline = 0;
        let mut burst_online = 0;
        let mut burst_offline = 0;
        for rec in self.slots.iter().flatten() {
            match (rec.burst, rec.reachable) {
                (false, true) => online += 1,
                (false, false) => offline += 1,
                (true, true) => burst_online += 1,
                (true, false) => burst_offline += 1,
            }
        }
        ActivityReport {
            online,
            offline,
            burst_online,
            burst_offline,
            unresolved: self.unresolved.len(),
        }
    }

    pub fn source_report(&self, addr: IpAddr) -> Option<SourceReport> {
        let idx = self.find_any_port(addr)?;
        self.slots[idx].as_ref().map(|r| SourceReport {
            addr: r.addr,
            port: r.port,
            pool: r.pool,
            tentative: r.tentative,
        })
    }

    /// Every occupied slot's report, for `REQ_SOURCES`-style listing
    /// queries. Plain scan, no new invariants.
    pub fn reports(&self) -> Vec<SourceReport> {
        self.slots
            .iter()
            .flatten()
            .map(|r| SourceReport {
                addr: r.addr,
                port: r.port,
                pool: r.pool,
                tentative: r.tentative,
            })
            .collect()
    }
}

impl<T> Default for SourceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(o: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, o))
    }

    #[test]
    fn add_then_remove_is_structurally_identical() {
        let mut reg: SourceRegistry<()> = SourceRegistry::new();
        reg.add(addr(1), 123, None, ()).unwrap();
        assert_eq!(reg.len(), 1);
        reg.remove(addr(1));
        assert_eq!(reg.len(), 0);
        assert!(!reg.contains(addr(1)));
    }

    #[test]
    fn duplicate_ip_rejected() {
        let mut reg: SourceRegistry<()> = SourceRegistry::new();
        reg.add(addr(1), 123, None, ()).unwrap();
        assert!(reg.add(addr(1), 456, None, ()).is_err());
    }

    #[test]
    fn grows_before_load_factor_violated() {
        let mut reg: SourceRegistry<()> = SourceRegistry::with_capacity(4);
        for i in 1..=3 {
            reg.add(addr(i), 123, None, ()).unwrap();
        }
        assert!(reg.capacity > 4);
        for i in 1..=3 {
            assert!(reg.contains(addr(i)));
        }
    }

    #[test]
    fn pool_confirmation_purges_remaining_tentative() {
        let mut reg: SourceRegistry<()> = SourceRegistry::with_capacity(32);
        reg.pools.push(Pool {
            name: "pool.example".into(),
            port: 123,
            confirmed: 0,
            max_sources: 2,
            last_replacement_secs: None,
        });
        for i in 1..=5 {
            reg.add(addr(i), 123, Some(0), ()).unwrap();
        }
        assert!(reg.dispatch_receive(addr(1), 123).is_some());
        assert!(reg.dispatch_receive(addr(2), 123).is_some());
        assert_eq!(reg.len(), 2);
        assert!(!reg.contains(addr(3)));
        assert!(!reg.contains(addr(4)));
        assert!(!reg.contains(addr(5)));
    }

    #[test]
    fn reports_lists_every_occupied_slot() {
        let mut reg: SourceRegistry<()> = SourceRegistry::new();
        reg.add(addr(1), 123, None, ()).unwrap();
        reg.add(addr(2), 123, None, ()).unwrap();
        let reports = reg.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().any(|r| r.addr == addr(1)));
        assert!(reports.iter().any(|r| r.addr == addr(2)));
    }

    #[test]
    fn ip_only_match_returns_none_for_dispatch() {
        let mut reg: SourceRegistry<()> = SourceRegistry::new();
        reg.add(addr(1), 123, None, ()).unwrap();
        assert!(reg.dispatch_receive(addr(1), 999).is_none());
    }

    #[test]
    fn activity_report_buckets_all_five_fields() {
        let mut reg: SourceRegistry<()> = SourceRegistry::new();
        reg.unresolved.push_back(UnresolvedEntry {
            name: "still.pending".into(),
            port: 123,
            payload: resolve::EntryPayload::NewSource {
                pool: None,
                max_new_sources: 1,
            },
        });

        // addr(1): never replied -> offline.
        reg.add(addr(1), 123, None, ()).unwrap();
        // addr(2): replied -> online.
        reg.add(addr(2), 123, None, ()).unwrap();
        assert!(reg.dispatch_receive(addr(2), 123).is_some());
        // addr(3): replied, then put into burst mode -> burst_online.
        reg.add(addr(3), 123, None, ()).unwrap();
        assert!(reg.dispatch_receive(addr(3), 123).is_some());
        reg.set_burst(addr(3), true);
        // addr(4): in burst mode but never replied -> burst_offline.
        reg.add(addr(4), 123, None, ()).unwrap();
        reg.set_burst(addr(4), true);

        let report = reg.activity_report();
        assert_eq!(report.online, 1);
        assert_eq!(report.offline, 1);
        assert_eq!(report.burst_online, 1);
        assert_eq!(report.burst_offline, 1);
        assert_eq!(report.unresolved, 1);
    }

    #[test]
    fn mark_unreachable_moves_source_back_to_offline() {
        let mut reg: SourceRegistry<()> = SourceRegistry::new();
        reg.add(addr(1), 123, None, ()).unwrap();
        assert!(reg.dispatch_receive(addr(1), 123).is_some());
        assert_eq!(reg.activity_report().online, 1);

        reg.mark_unreachable(addr(1));
        let report = reg.activity_report();
        assert_eq!(report.online, 0);
        assert_eq!(report.offline, 1);
    }
}
