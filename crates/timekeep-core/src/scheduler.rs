//! Single-threaded cooperative scheduler: a priority timer queue plus
//! readiness-based file-descriptor dispatch.
//!
//! Grounded on the original's timer-queue/dispatch-loop split (pool-allocated
//! doubly-linked list walked by `dispatch_timeouts`/`dispatch_filehandlers`,
//! `select()`-based `SCH_MainLoop`). The doubly-linked list becomes a
//! `BinaryHeap` index over a `HashMap` of live entries — cancellation is a
//! map removal (the heap entry becomes a tombstone, skipped on pop) rather
//! than the original's array walk, per the min-heap design note. Opaque C
//! `void *` handler arguments become plain closures, the same idiom this
//! codebase already uses for source dispatch (`Box<dyn TxSource>`).

use crate::clock::{read_raw_time, Instant};
use crate::discipline::StepListener;
use crate::error::DaemonError;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::os::unix::io::RawFd;
use std::time::Duration;

pub type TimerId = u64;
pub type TimerClass = u32;

/// A timeout or fd handler gets `&mut Scheduler` back, the idiomatic stand-in
/// for the original's reentrant `SCH_AddTimeout` calls from inside a handler
/// (e.g. a poll handler rescheduling itself) — the handler is removed from
/// `entries`/`fds` before it runs, so this is never a double-borrow.
pub type Handler = Box<dyn FnMut(&mut Scheduler) + Send>;

/// Forward time jump beyond which the scheduler treats elapsed raw time as
/// an unexpected step rather than scheduling jitter. Exposed as a config
/// knob per the spec's own note that the 10s constant is "a reasonable
/// extension" to make configurable; 10s remains the default.
pub const DEFAULT_STEP_THRESHOLD_SECS: f64 = 10.0;

struct TimerEntry {
    instant: Instant,
    class: TimerClass,
    handler: Handler,
}

/// Heap-ordered key: (instant, id). Reverse-ordered so `BinaryHeap` (a
/// max-heap) pops the earliest instant first.
struct HeapKey {
    instant: Instant,
    id: TimerId,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.instant == other.instant && self.id == other.id
    }
}
impl Eq for HeapKey {}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want min-instant-first.
        other
            .instant
            .as_secs_f64()
            .partial_cmp(&self.instant.as_secs_f64())
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub struct Scheduler {
    entries: HashMap<TimerId, TimerEntry>,
    heap: BinaryHeap<HeapKey>,
    next_id: TimerId,
    last_class_dispatch: HashMap<TimerClass, Instant>,
    fds: HashMap<RawFd, Handler>,
    /// fd currently having its handler run by `dispatch_filehandlers`, so
    /// `unregister_readable_fd` can tell "this handler is unregistering
    /// itself" apart from "nothing touched this fd's registration", which a
    /// plain `fds.remove` can't distinguish once the handler has already
    /// been taken out of the map to run it.
    dispatching_fd: Option<RawFd>,
    suppress_reregister: std::collections::HashSet<RawFd>,
    quit: bool,
    step_threshold_secs: f64,
    last_wake_cooked: Instant,
    last_wake_raw: Instant,
    last_wake_err: f64,
    /// Notified with the signed step size whenever step 5 of the main-loop
    /// contract detects an unexpected clock jump, so the daemon wiring can
    /// forward it to the discipline engine without the scheduler needing to
    /// own (or be owned by) the engine itself.
    step_callback: Option<Box<dyn FnMut(f64) + Send>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            next_id: 1,
            last_class_dispatch: HashMap::new(),
            fds: HashMap::new(),
            dispatching_fd: None,
            suppress_reregister: std::collections::HashSet::new(),
            quit: false,
            step_threshold_secs: DEFAULT_STEP_THRESHOLD_SECS,
            last_wake_cooked: Instant::ZERO,
            last_wake_raw: Instant::ZERO,
            last_wake_err: 0.0,
            step_callback: None,
        }
    }

    pub fn set_step_threshold_secs(&mut self, secs: f64) {
        self.step_threshold_secs = secs;
    }

    /// Registers the hook invoked when step 5 of the main-loop contract
    /// detects an unexpected clock jump. Typically wired to
    /// `DisciplineEngine::notify_unknown_step` by the daemon entrypoint.
    pub fn set_step_callback(&mut self, callback: Box<dyn FnMut(f64) + Send>) {
        self.step_callback = Some(callback);
    }

    pub fn register_readable_fd(
        &mut self,
        fd: RawFd,
        handler: Handler,
    ) -> Result<(), DaemonError> {
        if self.fds.contains_key(&fd) {
            return Err(DaemonError::SchedulerInvariant(
                "duplicate fd handler registration",
            ));
        }
        self.fds.insert(fd, handler);
        Ok(())
    }

    pub fn unregister_readable_fd(&mut self, fd: RawFd) {
        self.fds.remove(&fd);
        if self.dispatching_fd == Some(fd) {
            self.suppress_reregister.insert(fd);
        }
    }

    pub fn add_timeout_at(&mut self, instant: Instant, handler: Handler) -> TimerId {
        self.add_timeout_in_class_raw(instant, 0, handler)
    }

    pub fn add_timeout_after(&mut self, delay_secs: f64, handler: Handler) -> TimerId {
        assert!(delay_secs >= 0.0, "delay must be non-negative");
        let target = read_raw_time().add_secs(delay_secs);
        self.add_timeout_at(target, handler)
    }

    /// Adds a timeout with jittered min-delay/separation against other
    /// queued timeouts (and the last dispatch) in the same class.
    pub fn add_timeout_in_class(
        &mut self,
        min_delay_secs: f64,
        separation_secs: f64,
        randomness: f64,
        class: TimerClass,
        handler: Handler,
    ) -> TimerId {
        let u = pseudo_uniform();
        let jittered_delay = min_delay_secs * (1.0 + u * randomness);
        let jittered_sep = separation_secs * (1.0 + u * randomness);

        let now = read_raw_time();
        let mut target = now.add_secs(jittered_delay);

        if let Some(last) = self.last_class_dispatch.get(&class) {
            let earliest = last.add_secs(jittered_sep);
            if target.as_secs_f64() < earliest.as_secs_f64() {
                target = earliest;
            }
        }

        for entry in self.entries.values() {
            if entry.class == class {
                let earliest = entry.instant.add_secs(jittered_sep);
                if target.as_secs_f64() < earliest.as_secs_f64() {
                    target = earliest;
                }
            }
        }

        self.add_timeout_in_class_raw(target, class, handler)
    }

    fn add_timeout_in_class_raw(
        &mut self,
        instant: Instant,
        class: TimerClass,
        handler: Handler,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(HeapKey { instant, id });
        self.entries.insert(
            id,
            TimerEntry {
                instant,
                class,
                handler,
            },
        );
        id
    }

    /// No effect if `id` is unknown (already fired or never existed).
    pub fn cancel_timeout(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    pub fn request_exit(&mut self) {
        self.quit = true;
    }

    pub fn last_wake(&self) -> (Instant, Instant, f64) {
        (self.last_wake_cooked, self.last_wake_raw, self.last_wake_err)
    }

    /// Shifts every queued timer's target instant and every class's last
    /// dispatch instant by `delta_secs`, preserving dispatch order across a
    /// clock step. Implements `StepListener` so the discipline engine can
    /// broadcast steps to the scheduler the way the original's timer queue
    /// subscribed to `LCL_AddParameterChangeHandler`.
    pub fn shift_all(&mut self, delta_secs: f64) {
        let shifted: Vec<(TimerId, Instant)> = self
            .entries
            .iter()
            .map(|(id, e)| (*id, e.instant.add_secs(delta_secs)))
            .collect();
        for (id, new_instant) in &shifted {
            if let Some(e) = self.entries.get_mut(id) {
                e.instant = *new_instant;
            }
        }
        // The heap's old keys are now stale; since pop() re-validates
        // against `entries`, we must also requeue the shifted instants or
        // lookups will dispatch with the pre-shift ordering. Rebuild.
        let mut heap = BinaryHeap::with_capacity(self.entries.len());
        for (id, e) in &self.entries {
            heap.push(HeapKey {
                instant: e.instant,
                id: *id,
            });
        }
        self.heap = heap;

        for last in self.last_class_dispatch.values_mut() {
            *last = last.add_secs(delta_secs);
        }
    }

    /// Drains all timeouts whose instant has passed, running each to
    /// completion before considering the next. Aborts fatally if more than
    /// 4x the starting queue depth dispatch in one drain (infinite-loop
    /// guard, preserved from the original unconditionally).
    fn drain_timeouts(&mut self) -> Result<(), DaemonError> {
        let starting_depth = self.entries.len().max(1);
        let mut n_done = 0usize;

        loop {
            let now = read_raw_time();
            let ready = matches!(self.heap.peek(), Some(k) if k.instant.as_secs_f64() <= now.as_secs_f64());
            if !ready {
                break;
            }
            let key = self.heap.pop().expect("peeked Some above");
            let Some(mut entry) = self.entries.remove(&key.id) else {
                // Tombstone: cancelled since being queued.
                continue;
            };
            self.last_class_dispatch.insert(entry.class, key.instant);
            n_done += 1;
            if n_done > starting_depth * 4 {
                return Err(DaemonError::SchedulerInvariant(
                    "timer dispatch exceeded 4x starting queue depth",
                ));
            }
            (entry.handler)(self);
        }
        Ok(())
    }

    fn dispatch_filehandlers(&mut self, readable: &[RawFd]) {
        let mut sorted = readable.to_vec();
        sorted.sort_unstable();
        for fd in sorted {
            if let Some(mut handler) = self.fds.remove(&fd) {
                self.dispatching_fd = Some(fd);
                handler(self);
                self.dispatching_fd = None;
                // Re-register unless the handler itself unregistered (e.g.
                // on connection close) or replaced it with a new handler.
                if !self.suppress_reregister.remove(&fd) {
                    self.fds.entry(fd).or_insert(handler);
                }
            }
        }
    }

    fn wait_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|k| k.instant)
    }

    /// Blocks until a registered fd is readable or the deadline passes, via
    /// `libc::poll` over the registered descriptors.
    fn wait_for_readiness(&self, deadline: Option<Instant>) -> Result<Vec<RawFd>, DaemonError> {
        if self.fds.is_empty() && deadline.is_none() {
            return Err(DaemonError::SchedulerInvariant(
                "no timeouts or descriptors registered",
            ));
        }

        let timeout_ms: i32 = match deadline {
            None => -1,
            Some(d) => {
                let now = read_raw_time();
                let wait = d.diff_secs(&now).max(0.0);
                (wait * 1000.0).round().min(i32::MAX as f64).max(0.0) as i32
            }
        };

        let mut fds: Vec<RawFd> = self.fds.keys().copied().collect();
        fds.sort_unstable();
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        if pollfds.is_empty() {
            std::thread::sleep(Duration::from_millis(timeout_ms.max(0) as u64));
            return Ok(Vec::new());
        }

        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            return Err(DaemonError::Kernel(std::io::Error::last_os_error()));
        }

        Ok(pollfds
            .iter()
            .filter(|p| p.revents & libc::POLLIN != 0)
            .map(|p| p.fd)
            .collect())
    }

    /// Runs one iteration of the main-loop contract (steps 1-6). Public so
    /// tests and an embedding daemon can single-step; `run_forever` loops
    /// this until `request_exit` is called.
    pub fn run_once(&mut self) -> Result<bool, DaemonError> {
        self.drain_timeouts()?;
        if self.quit {
            return Ok(false);
        }

        let deadline = self.wait_deadline();
        let expected_wait = deadline.map(|d| d.diff_secs(&read_raw_time()).max(0.0));

        let before = read_raw_time();
        let readable = self.wait_for_readiness(deadline)?;
        let after = read_raw_time();

        self.handle_possible_step(expected_wait, before, after);

        self.last_wake_raw = after;
        self.last_wake_cooked = after; // cooked conversion applied by the caller via offset_convert
        self.dispatch_filehandlers(&readable);

        Ok(true)
    }

    /// Step 5 of the main-loop contract: compares the raw elapsed time
    /// against the wait that was expected and, if the discrepancy exceeds
    /// `step_threshold_secs`, shifts every queued deadline by the step so
    /// logical dispatch order survives the jump. `step = actual - expected`
    /// is positive when the clock read *forward* by more than was actually
    /// waited, so every deadline (computed against the pre-step scale) must
    /// be advanced by that same `+step` to still land at its originally
    /// intended moment — the same sign convention used throughout this
    /// codebase for step corrections (`DisciplineEngine::apply_step_offset`,
    /// `TimeSmoother::on_step`, `MedianFilter::slew_samples`). Split out of
    /// `run_once` so tests can drive it with injected instants instead of
    /// needing to provoke a real clock step.
    fn handle_possible_step(&mut self, expected_wait: Option<f64>, before: Instant, after: Instant) {
        let Some(expected) = expected_wait else {
            return;
        };
        let actual = after.diff_secs(&before);
        let step = actual - expected;
        if step.abs() <= self.step_threshold_secs {
            return;
        }
        tracing::warn!(
            actual_wait = actual,
            expected_wait = expected,
            "detected unexpected clock step"
        );
        self.shift_all(step);
        if let Some(callback) = self.step_callback.as_mut() {
            callback(step);
        }
    }

    pub fn run_forever(&mut self) -> Result<(), DaemonError> {
        while self.run_once()? {}
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl StepListener for Scheduler {
    fn notify_step(&mut self, step_secs: f64, _known: bool) {
        self.shift_all(step_secs);
    }
}

/// Cheap uniform [0, 1) generator for jitter; not cryptographic, matching
/// the original's use of `rand()` for scheduling jitter rather than secure
/// entropy (which is reserved for key generation, see `keys::generate_key`).
fn pseudo_uniform() -> f64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static STATE: AtomicU64 = AtomicU64::new(0x2545F4914F6CDD1D);
    let mut x = STATE.load(Ordering::Relaxed);
    if x == 0 {
        x = 0x2545F4914F6CDD1D;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STATE.store(x, Ordering::Relaxed);
    (x >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn timeouts_fire_in_order() {
        let mut sched = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = read_raw_time();

        for i in [2, 0, 1] {
            let order = order.clone();
            let target = now.add_secs(i as f64 * 0.0); // all "now" for this test
            sched.add_timeout_at(target, Box::new(move |_| order.lock().unwrap().push(i)));
        }
        sched.drain_timeouts().unwrap();
        // All three were due immediately; dispatch order follows heap order
        // by instant (ties broken by id, i.e. insertion order for equal
        // instants), not insertion order per se.
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn cancel_is_noop_for_unknown_id() {
        let mut sched = Scheduler::new();
        sched.cancel_timeout(9999);
    }

    #[test]
    fn fd_handler_unregistering_itself_is_not_reinstated() {
        let mut sched = Scheduler::new();
        let fd: RawFd = 7;
        sched
            .register_readable_fd(fd, Box::new(|sched| sched.unregister_readable_fd(7)))
            .unwrap();
        sched.dispatch_filehandlers(&[fd]);
        assert!(!sched.fds.contains_key(&fd));
    }

    #[test]
    fn fd_handler_replacing_itself_keeps_replacement() {
        let mut sched = Scheduler::new();
        let fd: RawFd = 8;
        sched
            .register_readable_fd(
                fd,
                Box::new(|sched| {
                    sched.register_readable_fd(8, Box::new(|_| {})).unwrap();
                }),
            )
            .unwrap();
        sched.dispatch_filehandlers(&[fd]);
        assert!(sched.fds.contains_key(&fd));
    }

    #[test]
    fn empty_scheduler_errors_on_wait() {
        let sched = Scheduler::new();
        let err = sched.wait_for_readiness(None);
        assert!(err.is_err());
    }

    #[test]
    fn shift_all_preserves_relative_order() {
        let mut sched = Scheduler::new();
        let now = read_raw_time();
        let order = Arc::new(Mutex::new(Vec::new()));
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                sched.add_timeout_at(
                    now.add_secs(i as f64),
                    Box::new(move |_| order.lock().unwrap().push(i)),
                )
            })
            .collect();
        assert_eq!(ids.len(), 3);

        sched.shift_all(-5.0);
        // After shifting back by 5s, all three are now due; they must still
        // come out least-instant-first, i.e. original relative order.
        sched.drain_timeouts().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn infinite_loop_guard_trips() {
        let mut sched = Scheduler::new();
        let now = read_raw_time();
        // A handler that re-adds itself, due immediately, forever: with a
        // starting depth of 1 the guard must trip once 4 dispatches happen.
        fn respawn(sched: &mut Scheduler) {
            let now = read_raw_time();
            sched.add_timeout_at(now, Box::new(|sched| respawn(sched)));
        }
        respawn(&mut sched);
        let result = sched.drain_timeouts();
        assert!(result.is_err());
    }

    /// Exercises the `run_once` step-detection path with injected instants
    /// (no real clock step needed): a deadline 1s out that took 11s to
    /// resolve is a +10s step, and every queued timer must be advanced by
    /// that same +10s to preserve its originally-intended firing moment.
    #[test]
    fn run_once_step_detection_shifts_deadlines_forward_by_positive_step() {
        let mut sched = Scheduler::new();
        let t0 = Instant::from_secs_f64(1_000.0);
        let ids: Vec<TimerId> = (0..3)
            .map(|i| sched.add_timeout_at(t0.add_secs(i as f64), Box::new(|_| {})))
            .collect();

        let observed_step = Arc::new(Mutex::new(None));
        {
            let observed_step = observed_step.clone();
            sched.set_step_callback(Box::new(move |step| {
                *observed_step.lock().unwrap() = Some(step);
            }));
        }

        let before = Instant::from_secs_f64(0.0);
        let after = Instant::from_secs_f64(11.0); // expected 1s wait, actually took 11s => step=+10
        sched.handle_possible_step(Some(1.0), before, after);

        assert_eq!(*observed_step.lock().unwrap(), Some(10.0));
        for (i, id) in ids.iter().enumerate() {
            let shifted = sched.entries.get(id).unwrap().instant;
            let expected = t0.add_secs(i as f64).add_secs(10.0);
            assert!((shifted.diff_secs(&expected)).abs() < 1e-9);
        }
    }

    #[test]
    fn step_listener_impl_shifts_forward_by_positive_step_secs() {
        let mut sched = Scheduler::new();
        let t0 = Instant::from_secs_f64(500.0);
        let id = sched.add_timeout_at(t0, Box::new(|_| {}));

        StepListener::notify_step(&mut sched, 7.5, true);

        let shifted = sched.entries.get(&id).unwrap().instant;
        assert!((shifted.diff_secs(&t0) - 7.5).abs() < 1e-9);
    }
}
