//! `timekeepd run` — wires the seven core modules into a running daemon.
//!
//! This is the "glue" layer: it builds a [`Scheduler`], a [`DisciplineEngine`]
//! over the platform's clock back-end, a [`SourceRegistry`] seeded from the
//! `[[server]]`/`[[pool]]` config tables, a set of [`RefclockInstance`]s from
//! `[[refclock]]`, and an optional [`KeyStore`]/[`TimeSmoother`], then hands
//! control to the scheduler's cooperative main loop. Per §1's scope note,
//! the selection/combination algorithm that would consume refclock and
//! registry measurements and drive `DisciplineEngine::accrue_offset` is an
//! external collaborator not modelled in core — this daemon wires the
//! pipeline up to the point of a filtered measurement and logs it, the way
//! an operator watching `journalctl` would see activity, without inventing
//! a selection policy the spec explicitly scopes out.

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};

use timekeep_core::clock::GenericClock;
use timekeep_core::discipline::StepListener;
use timekeep_core::refclock::{
    validate_sample_timing, PhcDriver, PpsDriver, RefclockDriver, RefclockParams, SampleOutcome,
    ShmDriver, SockDriver,
};
use timekeep_core::registry::resolve::{
    EntryPayload, ResolutionDriver, ResolveAttempt, ResolvedAddr, Resolver, UnresolvedEntry,
};
use timekeep_core::registry::Pool;
use timekeep_core::{
    cmdmon, read_raw_time, ControlSocket, DaemonError, DisciplineEngine, KeyStore, PlatformClock,
    RefclockInstance, Scheduler, SourceRegistry, TimeSmoother,
};
#[cfg(target_os = "linux")]
use timekeep_core::LinuxClock;

use crate::config::{DaemonConfig, RefclockEntry};
use crate::signal;

/// Opaque per-source protocol state. Packet wire encoding/decoding and the
/// authenticated-exchange state machine are out of core per §1; the
/// registry only needs *some* `T` to index source records by address.
type SourceState = ();

pub fn run(config: DaemonConfig, foreground: bool) -> Result<()> {
    if !foreground {
        tracing::info!("running detached under a service manager (no controlling terminal assumed)");
    }

    let platform = make_platform_clock();
    let mut discipline = DisciplineEngine::new(platform, config.daemon.max_slew_rate_ppm);

    let smoother = Arc::new(Mutex::new(TimeSmoother::new(
        config.smoothing.max_freq_ppm.unwrap_or(0.0),
        config.smoothing.max_wander_ppm_per_sec.unwrap_or(0.0),
        read_raw_time(),
    )));
    let refclocks: Arc<Mutex<Vec<RefclockInstance>>> = Arc::new(Mutex::new(Vec::new()));

    discipline.add_step_listener(Box::new(StepBroadcaster {
        refclocks: refclocks.clone(),
        smoother: smoother.clone(),
    }));
    let discipline = Arc::new(Mutex::new(discipline));

    let keystore: Arc<Mutex<Option<KeyStore>>> = Arc::new(Mutex::new(match &config.keys.keyfile {
        Some(path) => {
            let store = KeyStore::load_file(Path::new(path))
                .with_context(|| format!("loading keyfile {path}"))?;
            tracing::info!(keys = store.len(), path, "loaded key store");
            Some(store)
        }
        None => None,
    }));

    let registry: Arc<Mutex<SourceRegistry<SourceState>>> = Arc::new(Mutex::new(SourceRegistry::new()));
    seed_registry(&registry, &config);

    for entry in &config.refclocks {
        match build_refclock(entry) {
            Ok(instance) => refclocks.lock().unwrap().push(instance),
            Err(e) => tracing::error!(driver = %entry.driver, error = %e, "skipping refclock"),
        }
    }

    let mut scheduler = Scheduler::new();
    scheduler.set_step_threshold_secs(config.daemon.step_threshold_secs);
    {
        let discipline = discipline.clone();
        scheduler.set_step_callback(Box::new(move |step_secs| {
            tracing::warn!(step_secs, "unexpected clock step, resetting discipline state");
            discipline.lock().unwrap().notify_unknown_step();
        }));
    }

    install_signal_handling(&mut scheduler, keystore.clone(), config.keys.keyfile.clone())?;
    install_cmdmon_socket(&mut scheduler, &config.cmdmon.bind, registry.clone())?;
    schedule_refclock_polls(&mut scheduler, refclocks.clone(), discipline.clone());
    schedule_resolution_rounds(&mut scheduler, registry.clone());
    schedule_housekeeping_log(&mut scheduler, registry.clone(), discipline.clone());

    tracing::info!(
        servers = config.servers.len(),
        pools = config.pools.len(),
        refclocks = config.refclocks.len(),
        "timekeepd starting main loop"
    );
    scheduler.run_forever().map_err(|e: DaemonError| anyhow::anyhow!(e))
}

fn make_platform_clock() -> Box<dyn PlatformClock> {
    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxClock::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(GenericClock::new())
    }
}

/// Broadcasts discipline-engine step notifications to the refclock filters
/// and the time smoother, mirroring the original's `LCL_AddParameterChangeHandler`
/// subscriber list (§4.3 "change of local clock", §4.5 "on a step notification").
struct StepBroadcaster {
    refclocks: Arc<Mutex<Vec<RefclockInstance>>>,
    smoother: Arc<Mutex<TimeSmoother>>,
}

impl StepListener for StepBroadcaster {
    fn notify_step(&mut self, step_secs: f64, known: bool) {
        let mut refclocks = self.refclocks.lock().unwrap();
        for rc in refclocks.iter_mut() {
            if known {
                rc.on_slew(step_secs, 0.0);
            } else {
                rc.on_unknown_step();
            }
        }
        self.smoother.lock().unwrap().notify_step(step_secs, known);
    }
}

fn seed_registry(registry: &Arc<Mutex<SourceRegistry<SourceState>>>, config: &DaemonConfig) {
    let mut reg = registry.lock().unwrap();
    for pool in &config.pools {
        let idx = reg.pools.len();
        reg.pools.push(Pool {
            name: pool.name.clone(),
            port: pool.port,
            confirmed: 0,
            max_sources: pool.max_sources,
            last_replacement_secs: None,
        });
        reg.unresolved.push_back(UnresolvedEntry {
            name: pool.name.clone(),
            port: pool.port,
            payload: EntryPayload::NewSource {
                pool: Some(idx),
                max_new_sources: timekeep_core::registry::resolve::MAX_POOL_SOURCES,
            },
        });
    }
    for server in &config.servers {
        reg.unresolved.push_back(UnresolvedEntry {
            name: server.name.clone(),
            port: server.port,
            payload: EntryPayload::NewSource {
                pool: None,
                max_new_sources: 1,
            },
        });
    }
}

/// Blocking `getaddrinfo`-backed resolver, used where an async resolver
/// isn't wired up; the concurrency model acknowledges this as a
/// quality-of-service cost rather than a correctness issue (§5 "Blocking").
struct SyncResolver;

impl Resolver for SyncResolver {
    fn resolve(&mut self, name: &str) -> ResolveAttempt {
        use std::net::ToSocketAddrs;
        match (name, 0u16).to_socket_addrs() {
            Ok(iter) => {
                let addrs: Vec<IpAddr> = iter.map(|sa| sa.ip()).collect();
                if addrs.is_empty() {
                    ResolveAttempt::PermanentFailure
                } else {
                    ResolveAttempt::Success(addrs)
                }
            }
            Err(_) => ResolveAttempt::TemporaryFailure,
        }
    }
}

fn apply_resolved(reg: &mut SourceRegistry<SourceState>, resolved: Vec<ResolvedAddr>) {
    use std::collections::HashMap;
    let mut added_for_entry: HashMap<(String, u16), usize> = HashMap::new();

    for r in resolved {
        match r.entry.payload {
            EntryPayload::Replacement { replacing } => {
                if !reg.contains(r.addr) {
                    if let Err(e) = reg.replace_addr(replacing, r.addr, r.entry.port) {
                        tracing::warn!(error = e, "replacement failed");
                    }
                }
            }
            EntryPayload::NewSource { pool, max_new_sources } => {
                let key = (r.entry.name.clone(), r.entry.port);
                let count = added_for_entry.entry(key).or_insert(0);
                if *count >= max_new_sources || reg.contains(r.addr) {
                    continue;
                }
                if reg.add(r.addr, r.entry.port, pool, ()).is_ok() {
                    *count += 1;
                }
            }
        }
    }
}

/// Runs one resolution round immediately, then reschedules the next one at
/// the backoff interval `run_round` returns, for as long as the daemon runs.
fn schedule_resolution_rounds(sched: &mut Scheduler, registry: Arc<Mutex<SourceRegistry<SourceState>>>) {
    let resolver = Arc::new(Mutex::new(SyncResolver));
    let driver = Arc::new(Mutex::new(ResolutionDriver::new()));

    run_resolution_round(sched, registry, resolver, driver, 0.0);
}

fn run_resolution_round(
    sched: &mut Scheduler,
    registry: Arc<Mutex<SourceRegistry<SourceState>>>,
    resolver: Arc<Mutex<SyncResolver>>,
    driver: Arc<Mutex<ResolutionDriver>>,
    delay_secs: f64,
) {
    sched.add_timeout_after(
        delay_secs,
        Box::new(move |sched| {
            let mut resolved = Vec::new();
            let next_delay = {
                let mut reg = registry.lock().unwrap();
                let mut res = resolver.lock().unwrap();
                let mut drv = driver.lock().unwrap();
                drv.run_round(&mut reg.unresolved, &mut *res, &mut resolved)
            };
            if !resolved.is_empty() {
                let mut reg = registry.lock().unwrap();
                let n = resolved.len();
                apply_resolved(&mut reg, resolved);
                tracing::info!(resolved = n, total = reg.len(), "name resolution round applied");
            }
            run_resolution_round(sched, registry.clone(), resolver.clone(), driver.clone(), next_delay);
        }),
    );
}

fn build_refclock(entry: &RefclockEntry) -> Result<RefclockInstance> {
    let params = RefclockParams::parse(&entry.params);
    let driver: Box<dyn RefclockDriver> = match entry.driver.to_ascii_uppercase().as_str() {
        "SHM" => Box::new(ShmDriver {
            segment: params.field(0).and_then(|f| f.parse().ok()).unwrap_or(0),
        }),
        "SOCK" => Box::new(SockDriver {
            path: params.field(0).unwrap_or("/var/run/refclock.sock").to_string(),
        }),
        "PPS" => Box::new(PpsDriver {
            device: params.field(0).unwrap_or("/dev/pps0").to_string(),
        }),
        "PHC" => Box::new(PhcDriver {
            device: params.field(0).unwrap_or("/dev/ptp0").to_string(),
        }),
        other => anyhow::bail!("unknown refclock driver {other}"),
    };

    let ref_id = ref_id_bytes(entry.refid.as_deref().unwrap_or(&entry.driver));
    let mut instance = RefclockInstance::new(
        driver,
        params,
        entry.poll,
        entry.dpoll,
        ref_id,
        entry.precision,
        entry.maxdispersion,
    );
    instance.offset = entry.offset;
    instance.delay = entry.delay;
    instance.pps_rate = entry.rate;
    instance.lock_ref = entry.lock.clone();
    Ok(instance)
}

fn ref_id_bytes(s: &str) -> [u8; 4] {
    let b = s.as_bytes();
    let mut out = [0u8; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = *b.get(i).unwrap_or(&0);
    }
    out
}

/// Schedules a recurring driver-poll timeout per refclock instance, every
/// `2^driver_poll` seconds per §4.3. Driver stubs shipped in this repo
/// return no samples (real hardware integration is out of scope for the
/// in-tree drivers) so in practice this loop demonstrates the intake →
/// filter → emission wiring without synthesizing fake hardware data.
fn schedule_refclock_polls(
    sched: &mut Scheduler,
    refclocks: Arc<Mutex<Vec<RefclockInstance>>>,
    discipline: Arc<Mutex<DisciplineEngine>>,
) {
    let count = refclocks.lock().unwrap().len();
    for idx in 0..count {
        let driver_poll = refclocks.lock().unwrap()[idx].driver_poll;
        let interval = 2f64.powi(driver_poll);
        schedule_one_refclock_poll(sched, refclocks.clone(), discipline.clone(), idx, interval);
    }
}

fn schedule_one_refclock_poll(
    sched: &mut Scheduler,
    refclocks: Arc<Mutex<Vec<RefclockInstance>>>,
    discipline: Arc<Mutex<DisciplineEngine>>,
    idx: usize,
    interval_secs: f64,
) {
    sched.add_timeout_after(
        interval_secs.max(0.0),
        Box::new(move |sched| {
            let now = read_raw_time();
            let mut refclocks_guard = refclocks.lock().unwrap();
            if let Some(instance) = refclocks_guard.get_mut(idx) {
                if let Some(raw) = instance.driver.poll() {
                    match validate_sample_timing(raw.raw_time, now, raw.offset, instance.poll) {
                        SampleOutcome::Accepted => {
                            let (correction, _err) = discipline.lock().unwrap().offset_convert(raw.raw_time);
                            instance.add_sample(raw.raw_time, raw.offset + correction, 0.0);
                        }
                        SampleOutcome::Rejected(reason) => {
                            tracing::debug!(idx, reason, "refclock sample rejected");
                        }
                    }
                }
                if let Some(output) = instance.driver_poll_tick() {
                    tracing::info!(
                        idx,
                        offset = output.offset,
                        dispersion = output.dispersion,
                        "refclock filtered sample ready"
                    );
                }
            }
            drop(refclocks_guard);
            schedule_one_refclock_poll(sched, refclocks.clone(), discipline.clone(), idx, interval_secs);
        }),
    );
}

fn install_signal_handling(
    sched: &mut Scheduler,
    keystore: Arc<Mutex<Option<KeyStore>>>,
    keyfile_path: Option<String>,
) -> Result<()> {
    let fd = signal::install()?;
    sched
        .register_readable_fd(
            fd,
            Box::new(move |sched| {
                for sig in signal::drain(fd) {
                    if sig == libc::SIGTERM {
                        tracing::info!("received SIGTERM, requesting shutdown");
                        sched.request_exit();
                    } else if sig == libc::SIGHUP {
                        if let Some(path) = &keyfile_path {
                            match KeyStore::load_file(Path::new(path)) {
                                Ok(store) => {
                                    tracing::info!(keys = store.len(), "reloaded key store on SIGHUP");
                                    *keystore.lock().unwrap() = Some(store);
                                }
                                Err(e) => tracing::error!(error = %e, "keyfile reload failed, keeping old keys"),
                            }
                        }
                    }
                }
            }),
        )
        .map_err(|e: DaemonError| anyhow::anyhow!(e))
}

/// Binds the control-wire socket (if configured) and hooks it into the
/// scheduler's readiness table. Only enough handling to exercise the
/// length-arbitration table (§4.7) and the registry's read-only reporting
/// queries (§4.4) is implemented; the wire's actual field encoding is out
/// of core per §1/§6.1.
fn install_cmdmon_socket(
    sched: &mut Scheduler,
    bind: &str,
    registry: Arc<Mutex<SourceRegistry<SourceState>>>,
) -> Result<()> {
    let addr: SocketAddr = match bind.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(bind, error = %e, "invalid cmdmon bind address, control wire disabled");
            return Ok(());
        }
    };
    let socket = ControlSocket::bind(addr).with_context(|| format!("binding cmdmon socket to {bind}"))?;
    let fd = socket.as_raw_fd();
    tracing::info!(%addr, "control wire listening");

    sched
        .register_readable_fd(
            fd,
            Box::new(move |_sched| {
                let mut buf = [0u8; 512];
                while let Ok(Some((n, from))) = socket.recv_from(&mut buf) {
                    let reg = registry.lock().unwrap();
                    match handle_cmdmon_datagram(&buf[..n], &reg) {
                        Some(reply) => {
                            if let Err(e) = socket.send_to(&reply, from) {
                                tracing::debug!(error = %e, "cmdmon reply send failed");
                            }
                        }
                        None => tracing::debug!(%from, n, "dropped malformed control frame"),
                    }
                }
            }),
        )
        .map_err(|e: DaemonError| anyhow::anyhow!(e))
}

fn handle_cmdmon_datagram(buf: &[u8], registry: &SourceRegistry<SourceState>) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let version = buf[0];
    let code = buf[1] as u16;
    if cmdmon::request_wire_length(code, version) == 0 {
        return None;
    }

    match code {
        3 => {
            // REQ_ACTIVITY
            let report = registry.activity_report();
            let body_len = cmdmon::reply_unpadded_length(code, None);
            let mut reply = vec![version, code as u8];
            reply.extend_from_slice(&(report.online as u32).to_be_bytes());
            reply.extend_from_slice(&(report.offline as u32).to_be_bytes());
            reply.extend_from_slice(&(report.burst_online as u32).to_be_bytes());
            reply.extend_from_slice(&(report.burst_offline as u32).to_be_bytes());
            reply.extend_from_slice(&(report.unresolved as u32).to_be_bytes());
            reply.resize(2 + body_len, 0);
            Some(reply)
        }
        1 => {
            // REQ_SOURCES
            let reports = registry.reports();
            let n = reports.len().min(cmdmon::MAX_MANUAL_LIST_SAMPLES);
            let body_len = cmdmon::reply_unpadded_length(code, Some(n));
            if body_len == 0 {
                return None;
            }
            let mut reply = vec![version, code as u8];
            reply.extend_from_slice(&(n as u16).to_be_bytes());
            reply.resize(2 + body_len, 0); // per-record field encoding out of core
            Some(reply)
        }
        _ => None,
    }
}

/// Periodic liveness log: registry activity and the discipline engine's
/// currently-applied frequency, the way an operator tailing `journalctl`
/// would check the daemon is doing something without needing the control
/// wire.
fn schedule_housekeeping_log(
    sched: &mut Scheduler,
    registry: Arc<Mutex<SourceRegistry<SourceState>>>,
    discipline: Arc<Mutex<DisciplineEngine>>,
) {
    const INTERVAL_SECS: f64 = 60.0;
    schedule_one_housekeeping_log(sched, registry, discipline, INTERVAL_SECS);
}

fn schedule_one_housekeeping_log(
    sched: &mut Scheduler,
    registry: Arc<Mutex<SourceRegistry<SourceState>>>,
    discipline: Arc<Mutex<DisciplineEngine>>,
    interval_secs: f64,
) {
    sched.add_timeout_after(
        interval_secs,
        Box::new(move |sched| {
            let report = registry.lock().unwrap().activity_report();
            let freq = discipline.lock().unwrap().read_frequency().unwrap_or(0.0);
            tracing::info!(
                online = report.online,
                offline = report.offline,
                burst_online = report.burst_online,
                burst_offline = report.burst_offline,
                unresolved = report.unresolved,
                freq_ppm = freq,
                "housekeeping tick"
            );
            schedule_one_housekeeping_log(sched, registry.clone(), discipline.clone(), interval_secs);
        }),
    );
}
