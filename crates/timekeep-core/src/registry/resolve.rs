//! Asynchronous, strictly-sequential name resolution and pool replacement
//! scheduling.
//!
//! Grounded on `ntp_sources.c`'s `UnresolvedSource`/`resolve_sources`/
//! `process_resolved_name`/`NSR_HandleBadSource`: a FIFO of unresolved
//! entries drained one name query at a time, exponential retry backoff on a
//! partially-drained round, and pool replacement gated on a cooldown.

use std::net::IpAddr;

pub const RESOLVE_INTERVAL_UNIT_SECS: f64 = 7.0;
pub const MIN_RESOLVE_INTERVAL: u32 = 2;
pub const MAX_RESOLVE_INTERVAL: u32 = 9;
pub const MIN_POOL_RESOLVE_INTERVAL: u32 = 5;
pub const MAX_POOL_SOURCES: usize = 16;

#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    pub port: u16,
    pub confirmed: usize,
    pub max_sources: usize,
    pub last_replacement_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum EntryPayload {
    NewSource {
        pool: Option<usize>,
        max_new_sources: usize,
    },
    Replacement {
        replacing: IpAddr,
    },
}

#[derive(Debug, Clone)]
pub struct UnresolvedEntry {
    pub name: String,
    pub port: u16,
    pub payload: EntryPayload,
}

/// Resolves a name to zero or more addresses; implementations may be
/// synchronous (blocking, acknowledged quality-of-service cost per the
/// concurrency model) or backed by an async resolver polled elsewhere.
pub trait Resolver {
    fn resolve(&mut self, name: &str) -> ResolveAttempt;
}

pub enum ResolveAttempt {
    Success(Vec<IpAddr>),
    Pending,
    TemporaryFailure,
    PermanentFailure,
}

pub struct ResolvedAddr {
    pub addr: IpAddr,
    pub entry: UnresolvedEntry,
}

/// Drives the FIFO strictly sequentially: at most one outstanding query.
/// Tracks the retry interval exponent, reset to `MIN_RESOLVE_INTERVAL` on a
/// round that fully drains, incremented (capped at `MAX_RESOLVE_INTERVAL`)
/// on a round that ends with entries still unresolved.
pub struct ResolutionDriver {
    interval_exponent: u32,
}

impl ResolutionDriver {
    pub fn new() -> Self {
        Self {
            interval_exponent: MIN_RESOLVE_INTERVAL,
        }
    }

    /// Processes the FIFO head-to-tail, one name at a time, appending
    /// successes to `resolved` and leftovers (temporary failures, or
    /// entries behind a still-pending query) back onto the queue. Returns
    /// the delay in seconds until the next retry round should run.
    pub fn run_round(
        &mut self,
        queue: &mut std::collections::VecDeque<UnresolvedEntry>,
        resolver: &mut dyn Resolver,
        resolved: &mut Vec<ResolvedAddr>,
    ) -> f64 {
        let mut leftovers = std::collections::VecDeque::new();
        let mut any_leftover = false;

        while let Some(entry) = queue.pop_front() {
            match resolver.resolve(&entry.name) {
                ResolveAttempt::Success(addrs) => {
                    for addr in addrs {
                        resolved.push(ResolvedAddr {
                            addr,
                            entry: entry.clone(),
                        });
                    }
                }
                ResolveAttempt::Pending | ResolveAttempt::TemporaryFailure => {
                    any_leftover = true;
                    leftovers.push_back(entry);
                }
                ResolveAttempt::PermanentFailure => {
                    tracing::warn!(name = %entry.name, "dropping source: permanent resolution failure");
                }
            }
        }

        *queue = leftovers;

        if any_leftover {
            self.interval_exponent = (self.interval_exponent + 1).min(MAX_RESOLVE_INTERVAL);
        } else {
            self.interval_exponent = MIN_RESOLVE_INTERVAL;
        }

        RESOLVE_INTERVAL_UNIT_SECS * 2f64.powi(self.interval_exponent as i32)
    }
}

impl Default for ResolutionDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a `bad_source(addr)` report against a pool member should trigger
/// a replacement: only if the cooldown since the pool's last replacement has
/// elapsed.
pub fn pool_replacement_due(pool: &Pool, now_secs: f64) -> bool {
    let cooldown = RESOLVE_INTERVAL_UNIT_SECS * 2f64.powi(MIN_POOL_RESOLVE_INTERVAL as i32);
    match pool.last_replacement_secs {
        None => true,
        Some(last) => now_secs - last >= cooldown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedResolver(Vec<ResolveAttempt>);
    impl Resolver for ScriptedResolver {
        fn resolve(&mut self, _name: &str) -> ResolveAttempt {
            if self.0.is_empty() {
                ResolveAttempt::PermanentFailure
            } else {
                self.0.remove(0)
            }
        }
    }

    fn entry(name: &str) -> UnresolvedEntry {
        UnresolvedEntry {
            name: name.into(),
            port: 123,
            payload: EntryPayload::NewSource {
                pool: None,
                max_new_sources: 1,
            },
        }
    }

    #[test]
    fn full_drain_resets_interval() {
        let mut driver = ResolutionDriver::new();
        driver.interval_exponent = 7;
        let mut queue = std::collections::VecDeque::from(vec![entry("a")]);
        let mut resolver = ScriptedResolver(vec![ResolveAttempt::Success(vec!["10.0.0.1".parse().unwrap()])]);
        let mut resolved = Vec::new();
        driver.run_round(&mut queue, &mut resolver, &mut resolved);
        assert_eq!(driver.interval_exponent, MIN_RESOLVE_INTERVAL);
        assert!(queue.is_empty());
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn leftover_round_increments_interval_capped() {
        let mut driver = ResolutionDriver::new();
        driver.interval_exponent = MAX_RESOLVE_INTERVAL;
        let mut queue = std::collections::VecDeque::from(vec![entry("a")]);
        let mut resolver = ScriptedResolver(vec![ResolveAttempt::TemporaryFailure]);
        let mut resolved = Vec::new();
        driver.run_round(&mut queue, &mut resolver, &mut resolved);
        assert_eq!(driver.interval_exponent, MAX_RESOLVE_INTERVAL);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pool_replacement_respects_cooldown() {
        let pool = Pool {
            name: "p".into(),
            port: 123,
            confirmed: 0,
            max_sources: 4,
            last_replacement_secs: Some(100.0),
        };
        assert!(!pool_replacement_due(&pool, 101.0));
        let cooldown = RESOLVE_INTERVAL_UNIT_SECS * 2f64.powi(MIN_POOL_RESOLVE_INTERVAL as i32);
        assert!(pool_replacement_due(&pool, 100.0 + cooldown));
    }
}
