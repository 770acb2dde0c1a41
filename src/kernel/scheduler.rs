// Cooperative scheduler for resumable transactions
// NOTE: No dynamic allocation; instance slots and the ready queue are
// fixed-size. Single-threaded: handlers run to their next suspension
// and return, nothing here blocks.
//
// Each tick:
//   1. refresh the wait set of every running instance; an instance whose
//      conditions all cleared becomes ready
//   2. enforce the wait policy on instances still waiting
//   3. resume every ready instance once, in FIFO order
use core::fmt;

use log::{debug, error, info, warn};

use crate::codec::{CommandReader, ReplyWriter};
use crate::config::{COMMAND_CAP, MAX_INSTANCES, REPLY_CAP};
use crate::drivers::clock::deadline_reached;
use crate::drivers::peripherals::{BusError, Peripherals};
use crate::kernel::continuation::Status;
use crate::kernel::lease::{BusLeases, LeaseError};
use crate::kernel::plugin::{HandlerError, Plugin, TransactionState};
use crate::kernel::registry::{PluginId, RegisterError, Registry};
use crate::kernel::wait::{Wait, WaitSet};
use crate::kernel::wake::WakeFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u8);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How long an instance may sit at one resume point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Wait as long as it takes; liveness is the notifiers' problem.
    #[default]
    Forever,
    /// Fail the instance once it has waited `ms` at the same point.
    StepDeadline { ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerConfig {
    pub wait_policy: WaitPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed(HandlerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Free,
    /// Submitted; waiting for its bus lease before the first step
    Queued,
    Running,
    Finished(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    UnknownPlugin(PluginId),
    NoFreeSlot,
    CommandTooLong,
    Init(HandlerError),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::UnknownPlugin(id) => write!(f, "unknown {}", id),
            SubmitError::NoFreeSlot => write!(f, "no free instance slot"),
            SubmitError::CommandTooLong => write!(f, "command longer than {} bytes", COMMAND_CAP),
            SubmitError::Init(e) => write!(f, "init failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortError {
    NoSuchInstance(InstanceId),
    AlreadyFinished(InstanceId),
}

impl fmt::Display for AbortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortError::NoSuchInstance(id) => write!(f, "no instance {}", id),
            AbortError::AlreadyFinished(id) => write!(f, "instance {} already finished", id),
        }
    }
}

/// Reply bytes of a finished transaction, copied out of its slot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    buf: [u8; REPLY_CAP],
    len: usize,
}

impl Reply {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reply({:02x?})", self.as_bytes())
    }
}

// FIFO of instance ids; capacity equals the slot count, so every live
// instance fits at most once
struct ReadyQueue<const N: usize> {
    ids: [InstanceId; N],
    head: usize,
    len: usize,
}

impl<const N: usize> ReadyQueue<N> {
    const fn new() -> Self {
        Self {
            ids: [InstanceId(0); N],
            head: 0,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn iter(&self) -> impl Iterator<Item = InstanceId> + '_ {
        (0..self.len).map(move |i| self.ids[(self.head + i) % N])
    }

    fn contains(&self, id: InstanceId) -> bool {
        self.iter().any(|queued| queued == id)
    }

    // Enqueue unless already queued; false only when full.
    fn push(&mut self, id: InstanceId) -> bool {
        if self.contains(id) {
            return true;
        }
        if self.len == N {
            return false;
        }
        self.ids[(self.head + self.len) % N] = id;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<InstanceId> {
        if self.len == 0 {
            return None;
        }
        let id = self.ids[self.head];
        self.head = (self.head + 1) % N;
        self.len -= 1;
        Some(id)
    }
}

struct Slot<S> {
    phase: Phase,
    plugin: PluginId,
    state: S,
    waits: WaitSet,
    command: [u8; COMMAND_CAP],
    command_len: usize,
    command_pos: usize,
    reply: [u8; REPLY_CAP],
    reply_len: usize,
    // resume point after the last call, and when it was entered
    point: u8,
    entered_ms: u32,
    resumes: u32,
}

impl<S: TransactionState> Slot<S> {
    fn new() -> Self {
        Self {
            phase: Phase::Free,
            plugin: PluginId(0),
            state: S::default(),
            waits: WaitSet::new(),
            command: [0; COMMAND_CAP],
            command_len: 0,
            command_pos: 0,
            reply: [0; REPLY_CAP],
            reply_len: 0,
            point: 0,
            entered_ms: 0,
            resumes: 0,
        }
    }

    fn clear(&mut self) {
        self.phase = Phase::Free;
        self.state.reset();
        self.waits.clear();
        self.command_len = 0;
        self.command_pos = 0;
        self.reply_len = 0;
        self.point = 0;
        self.resumes = 0;
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub resumed: usize,
    pub finished: usize,
    pub failed: usize,
}

pub struct Scheduler<P: Plugin, const N: usize = MAX_INSTANCES> {
    config: SchedulerConfig,
    registry: Registry<P>,
    slots: [Slot<P::State>; N],
    ready: ReadyQueue<N>,
    leases: BusLeases,
}

impl<P: Plugin, const N: usize> Scheduler<P, N> {
    pub fn new(config: SchedulerConfig) -> Self {
        const { assert!(N <= u8::MAX as usize + 1, "instance ids are one byte") };
        Self {
            config,
            registry: Registry::new(),
            slots: core::array::from_fn(|_| Slot::new()),
            ready: ReadyQueue::new(),
            leases: BusLeases::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn register(&mut self, plugin: P) -> Result<PluginId, RegisterError> {
        self.registry.register(plugin)
    }

    pub fn registry(&self) -> &Registry<P> {
        &self.registry
    }

    pub fn leases(&self) -> &BusLeases {
        &self.leases
    }

    /// Start a transaction for `plugin` with `command` as its input.
    pub fn submit(&mut self, plugin: PluginId, command: &[u8]) -> Result<InstanceId, SubmitError> {
        let entry = self
            .registry
            .entry(plugin)
            .ok_or(SubmitError::UnknownPlugin(plugin))?;
        if command.len() > COMMAND_CAP {
            return Err(SubmitError::CommandTooLong);
        }
        let idx = self
            .slots
            .iter()
            .position(|s| s.phase == Phase::Free)
            .ok_or(SubmitError::NoFreeSlot)?;

        let slot = &mut self.slots[idx];
        slot.clear();
        entry.plugin.init(&mut slot.state).map_err(SubmitError::Init)?;
        slot.plugin = plugin;
        slot.command[..command.len()].copy_from_slice(command);
        slot.command_len = command.len();
        slot.phase = Phase::Queued;

        let id = InstanceId(idx as u8);
        self.ready.push(id);
        debug!("sched: {} submitted for {}", id, plugin);
        Ok(id)
    }

    pub fn phase(&self, id: InstanceId) -> Option<Phase> {
        self.slots.get(id.0 as usize).map(|s| s.phase)
    }

    /// Raw resume point of a live instance.
    pub fn resume_point(&self, id: InstanceId) -> Option<u8> {
        self.slot(id).map(|s| s.state.resume_point())
    }

    pub fn waits(&self, id: InstanceId) -> Option<&WaitSet> {
        self.slot(id).map(|s| &s.waits)
    }

    /// How many times the handler of `id` has been called.
    pub fn resumes(&self, id: InstanceId) -> Option<u32> {
        self.slot(id).map(|s| s.resumes)
    }

    fn slot(&self, id: InstanceId) -> Option<&Slot<P::State>> {
        self.slots
            .get(id.0 as usize)
            .filter(|s| s.phase != Phase::Free)
    }

    /// No instance is queued or running.
    pub fn is_idle(&self) -> bool {
        self.slots
            .iter()
            .all(|s| matches!(s.phase, Phase::Free | Phase::Finished(_)))
    }

    /// When the next tick is due: `now` if something can run right away,
    /// otherwise the earliest armed timer or step deadline.
    pub fn next_deadline(&self, now: u32) -> Option<u32> {
        if self.has_ready_work() {
            return Some(now);
        }
        let step = match self.config.wait_policy {
            WaitPolicy::Forever => None,
            WaitPolicy::StepDeadline { ms } => Some(ms),
        };
        self.slots
            .iter()
            .filter(|s| s.phase == Phase::Running)
            .flat_map(|s| {
                let timer = s.waits.next_deadline();
                let stall = step.map(|ms| s.entered_ms.wrapping_add(ms));
                timer.into_iter().chain(stall)
            })
            .min_by_key(|d| d.wrapping_sub(now))
    }

    /// Whether a tick now would make progress: a deadline is due, or
    /// `wake` flags a bus some running instance waits on.
    pub fn needs_tick(&self, now: u32, wake: Option<WakeFlags>) -> bool {
        if self
            .next_deadline(now)
            .is_some_and(|d| deadline_reached(now, d))
        {
            return true;
        }
        let Some(flags) = wake else {
            return false;
        };
        self.slots
            .iter()
            .filter(|s| s.phase == Phase::Running)
            .flat_map(|s| s.waits.iter())
            .filter_map(Wait::bus)
            .any(|bus| flags.bus(bus))
    }

    // Yielded instances, and queued ones whose bus is free.
    fn has_ready_work(&self) -> bool {
        self.ready.iter().any(|id| {
            let slot = &self.slots[id.0 as usize];
            match slot.phase {
                Phase::Running => true,
                Phase::Queued => self
                    .registry
                    .entry(slot.plugin)
                    .is_some_and(|e| self.leases.holder(e.plugin.bus()).is_none()),
                Phase::Free | Phase::Finished(_) => false,
            }
        })
    }

    /// Collect a finished transaction, freeing its slot.
    pub fn take_result(&mut self, id: InstanceId) -> Option<Result<Reply, HandlerError>> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let Phase::Finished(outcome) = slot.phase else {
            return None;
        };
        let result = match outcome {
            Outcome::Done => {
                let mut reply = Reply {
                    buf: [0; REPLY_CAP],
                    len: slot.reply_len,
                };
                reply.buf[..slot.reply_len].copy_from_slice(&slot.reply[..slot.reply_len]);
                Ok(reply)
            }
            Outcome::Failed(e) => Err(e),
        };
        slot.clear();
        Some(result)
    }

    /// Cancel an instance: stop its in-flight bus operation, discard its
    /// continuation and free the slot.
    pub fn abort<H: Peripherals>(&mut self, id: InstanceId, hw: &mut H) -> Result<(), AbortError> {
        let slot = self
            .slots
            .get_mut(id.0 as usize)
            .ok_or(AbortError::NoSuchInstance(id))?;
        match slot.phase {
            Phase::Free => return Err(AbortError::NoSuchInstance(id)),
            Phase::Finished(_) => return Err(AbortError::AlreadyFinished(id)),
            Phase::Queued => {}
            Phase::Running => {
                if let Some(entry) = self.registry.entry(slot.plugin) {
                    entry.plugin.abort(&mut slot.state, hw);
                    self.leases.release(entry.plugin.bus(), id);
                }
            }
        }
        info!("sched: {} aborted", id);
        slot.clear();
        Ok(())
    }

    /// One scheduling round. `now` is the clock reading in ms.
    pub fn tick<H: Peripherals>(&mut self, hw: &mut H, now: u32) -> TickReport {
        let mut report = TickReport::default();

        for idx in 0..N {
            if self.slots[idx].phase != Phase::Running {
                continue;
            }
            let id = InstanceId(idx as u8);
            let slot = &mut self.slots[idx];
            slot.waits.refresh(&*hw, now);
            if slot.waits.is_ready() {
                self.ready.push(id);
                continue;
            }
            if let WaitPolicy::StepDeadline { ms } = self.config.wait_policy {
                if deadline_reached(now, slot.entered_ms.wrapping_add(ms)) {
                    let point = slot.point;
                    self.fail(id, HandlerError::DeadlineExceeded { point }, hw);
                    report.failed += 1;
                }
            }
        }

        // only what is ready now; yields and lease waiters go next tick
        let mut later: ReadyQueue<N> = ReadyQueue::new();
        for _ in 0..self.ready.len() {
            let Some(id) = self.ready.pop() else { break };
            let idx = id.0 as usize;
            match self.slots[idx].phase {
                Phase::Queued => match self.start(id, &*hw, now) {
                    Ok(true) => {}
                    Ok(false) => {
                        later.push(id);
                        continue;
                    }
                    Err(e) => {
                        self.fail(id, e, hw);
                        report.failed += 1;
                        continue;
                    }
                },
                Phase::Running => {}
                Phase::Free | Phase::Finished(_) => continue,
            }

            report.resumed += 1;
            match self.resume(id, hw, now) {
                Ok(Status::Done) => {
                    self.finish(id);
                    report.finished += 1;
                }
                Ok(Status::Yield) => {
                    later.push(id);
                }
                Ok(Status::Waiting) => {}
                Err(e) => {
                    self.fail(id, e, hw);
                    report.failed += 1;
                }
            }
        }
        while let Some(id) = later.pop() {
            self.ready.push(id);
        }

        report
    }

    // Take the bus lease and move a queued instance to running.
    // Ok(false): another instance holds the bus, try again next tick.
    fn start<H: Peripherals>(
        &mut self,
        id: InstanceId,
        hw: &H,
        now: u32,
    ) -> Result<bool, HandlerError> {
        let slot = &mut self.slots[id.0 as usize];
        let entry = self
            .registry
            .entry(slot.plugin)
            .ok_or(HandlerError::Aborted)?;
        let bus = entry.plugin.bus();
        match self.leases.try_acquire(bus, id) {
            Ok(()) => {}
            Err(LeaseError::Held(holder)) => {
                debug!("sched: {} waiting for {} (held by {})", id, bus, holder);
                return Ok(false);
            }
            Err(LeaseError::NoSuchBus) => return Err(HandlerError::Bus(BusError::NoSuchBus)),
        }
        slot.phase = Phase::Running;
        slot.point = slot.state.resume_point();
        slot.entered_ms = now;
        // timers armed by the first step count from this tick
        slot.waits.refresh(hw, now);
        debug!("sched: {} started on {}", id, bus);
        Ok(true)
    }

    fn resume<H: Peripherals>(
        &mut self,
        id: InstanceId,
        hw: &mut H,
        now: u32,
    ) -> Result<Status, HandlerError> {
        let slot = &mut self.slots[id.0 as usize];
        let entry = self
            .registry
            .entry_mut(slot.plugin)
            .ok_or(HandlerError::Aborted)?;

        let mut input = CommandReader::at(&slot.command[..slot.command_len], slot.command_pos);
        let mut output = ReplyWriter::with_len(&mut slot.reply, slot.reply_len);
        slot.resumes = slot.resumes.wrapping_add(1);
        let status = entry.plugin.resume(
            &mut slot.state,
            &mut entry.persistent,
            &mut input,
            &mut output,
            &mut slot.waits,
            hw,
        );
        slot.command_pos = input.position();
        slot.reply_len = output.len();

        let point = slot.state.resume_point();
        if point != slot.point {
            slot.point = point;
            slot.entered_ms = now;
        }
        status
    }

    fn finish(&mut self, id: InstanceId) {
        let slot = &mut self.slots[id.0 as usize];
        if let Some(entry) = self.registry.entry(slot.plugin) {
            self.leases.release(entry.plugin.bus(), id);
        }
        slot.waits.clear();
        slot.phase = Phase::Finished(Outcome::Done);
        info!("sched: {} done after {} calls", id, slot.resumes);
    }

    fn fail<H: Peripherals>(&mut self, id: InstanceId, e: HandlerError, hw: &mut H) {
        let slot = &mut self.slots[id.0 as usize];
        if e.is_fatal() {
            error!("sched: {} {}; instance state corrupted", id, e);
        } else {
            warn!("sched: {} failed: {}", id, e);
        }
        if let Some(entry) = self.registry.entry(slot.plugin) {
            entry.plugin.abort(&mut slot.state, hw);
            self.leases.release(entry.plugin.bus(), id);
        }
        slot.waits.clear();
        slot.phase = Phase::Finished(Outcome::Failed(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::peripherals::{Bus, BusId};
    use crate::drivers::sim::{Op, SimPeripherals};
    use crate::kernel::continuation::Continuation;
    use crate::plugins::SpiSensor;

    fn sched() -> Scheduler<SpiSensor, 4> {
        Scheduler::new(SchedulerConfig::default())
    }

    crate::resume_points! {
        enum NapStep {
            Start = 0,
            Asleep = 1,
        }
    }

    #[derive(Debug, Default)]
    struct NapState {
        next: Continuation<NapStep>,
    }

    impl TransactionState for NapState {
        fn resume_point(&self) -> u8 {
            self.next.raw()
        }

        fn reset(&mut self) {
            self.next.reset();
        }
    }

    // arms its timer on the very first step
    struct Nap {
        ms: u32,
    }

    impl Plugin for Nap {
        type State = NapState;
        type Persistent = ();

        fn bus(&self) -> Bus {
            Bus::spi(3)
        }

        fn resume<H: Peripherals>(
            &self,
            state: &mut NapState,
            _: &mut (),
            _: &mut CommandReader<'_>,
            _: &mut ReplyWriter<'_>,
            waits: &mut WaitSet,
            _: &mut H,
        ) -> Result<Status, HandlerError> {
            match state.next.point()? {
                NapStep::Start => {
                    waits.add_wait_for_timeout(self.ms)?;
                    Ok(state.next.suspend(NapStep::Asleep))
                }
                NapStep::Asleep if waits.is_waiting_for_timeout() => Ok(Status::Waiting),
                NapStep::Asleep => Ok(state.next.finish()),
            }
        }
    }

    #[test]
    fn ready_queue_is_fifo_without_duplicates() {
        let mut q: ReadyQueue<3> = ReadyQueue::new();
        assert!(q.push(InstanceId(1)));
        assert!(q.push(InstanceId(2)));
        assert!(q.push(InstanceId(1)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(InstanceId(1)));

        assert!(q.push(InstanceId(0)));
        assert!(q.push(InstanceId(1)));
        assert!(!q.push(InstanceId(3)));
        assert_eq!(
            q.iter().collect::<Vec<_>>(),
            [InstanceId(2), InstanceId(0), InstanceId(1)]
        );
        while q.pop().is_some() {}
        assert!(q.is_empty());
    }

    #[test]
    fn first_step_timer_counts_from_the_starting_tick() {
        let mut s: Scheduler<Nap, 2> = Scheduler::new(SchedulerConfig::default());
        let mut hw = SimPeripherals::new();
        let p = s.register(Nap { ms: 1000 }).unwrap();

        let id = s.submit(p, &[]).unwrap();
        s.tick(&mut hw, 50_000);
        assert_eq!(s.next_deadline(50_000), Some(51_000));
        s.tick(&mut hw, 50_010);
        assert_eq!(s.phase(id), Some(Phase::Running));
        s.tick(&mut hw, 51_000);
        assert_eq!(s.phase(id), Some(Phase::Finished(Outcome::Done)));
        assert!(s.take_result(id).is_some());

        // the reused slot does not keep the previous time base
        let id = s.submit(p, &[]).unwrap();
        s.tick(&mut hw, 90_000);
        assert_eq!(s.waits(id).and_then(WaitSet::next_deadline), Some(91_000));
    }

    #[test]
    fn unknown_bus_fails_instead_of_queueing() {
        let mut s = sched();
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(7))).unwrap();
        let id = s.submit(p, &[1]).unwrap();

        let report = s.tick(&mut hw, 0);
        assert_eq!(report.failed, 1);
        assert!(s.is_idle());
        assert_eq!(
            s.take_result(id),
            Some(Err(HandlerError::Bus(BusError::NoSuchBus)))
        );
        assert_eq!(hw.issued(), 0);
    }

    #[test]
    fn yielded_instance_makes_the_next_tick_due_now() {
        let mut s = sched();
        let mut hw = SimPeripherals::new();
        let quick = s.register(SpiSensor::new(BusId(0)).with_settle_ms(0)).unwrap();
        let slow = s.register(SpiSensor::new(BusId(1))).unwrap();
        let a = s.submit(quick, &[1]).unwrap();
        let b = s.submit(slow, &[2]).unwrap();

        s.tick(&mut hw, 0);
        hw.complete_all();
        s.tick(&mut hw, 10);
        assert_eq!(s.resume_point(b), Some(2));
        assert_eq!(s.next_deadline(10), Some(10));
        assert!(s.needs_tick(10, None));

        s.tick(&mut hw, 10);
        assert_eq!(s.resume_point(a), Some(3));
        assert_eq!(s.next_deadline(10), Some(1010));
        assert!(!s.needs_tick(10, None));
    }

    #[test]
    fn wake_flags_only_matter_for_awaited_buses() {
        let mut s = sched();
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(2))).unwrap();
        s.submit(p, &[1]).unwrap();
        s.tick(&mut hw, 0);

        assert!(!s.needs_tick(5, None));
        let other = WakeFlags {
            buses: 1 << 0,
            timer: true,
        };
        assert!(!s.needs_tick(5, Some(other)));
        let mine = WakeFlags {
            buses: 1 << 2,
            timer: false,
        };
        assert!(s.needs_tick(5, Some(mine)));
    }

    #[test]
    fn step_deadline_is_reported_as_next_deadline() {
        let mut s: Scheduler<SpiSensor, 2> = Scheduler::new(SchedulerConfig {
            wait_policy: WaitPolicy::StepDeadline { ms: 300 },
        });
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(0))).unwrap();
        s.submit(p, &[1]).unwrap();
        s.tick(&mut hw, 100);
        assert_eq!(s.next_deadline(100), Some(400));
        assert!(s.needs_tick(400, None));
    }

    #[test]
    fn ids_cover_a_full_byte_of_slots() {
        let mut s: Scheduler<SpiSensor, 256> = Scheduler::new(SchedulerConfig::default());
        let p = s.register(SpiSensor::new(BusId(0))).unwrap();
        let mut last = None;
        for _ in 0..256 {
            last = Some(s.submit(p, &[1]).unwrap());
        }
        assert_eq!(last, Some(InstanceId(255)));
        assert_eq!(s.submit(p, &[1]), Err(SubmitError::NoFreeSlot));
    }

    #[test]
    fn runs_a_transaction_to_completion() {
        let mut s = sched();
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(0)).with_settle_ms(100)).unwrap();
        let id = s.submit(p, &[0x2A]).unwrap();
        assert_eq!(s.phase(id), Some(Phase::Queued));

        s.tick(&mut hw, 0);
        assert_eq!(s.phase(id), Some(Phase::Running));
        assert_eq!(s.resume_point(id), Some(1));
        assert_eq!(s.leases().holder(Bus::spi(0)), Some(id));

        // nothing cleared: not resumed again
        assert_eq!(s.tick(&mut hw, 10).resumed, 0);

        hw.complete(Bus::spi(0));
        s.tick(&mut hw, 20);
        assert_eq!(s.resume_point(id), Some(2));
        assert_eq!(s.next_deadline(20), Some(120));

        s.tick(&mut hw, 120);
        assert_eq!(s.resume_point(id), Some(3));

        hw.complete_receive(Bus::spi(0), 0x55);
        let report = s.tick(&mut hw, 130);
        assert_eq!(report.finished, 1);
        assert_eq!(s.leases().holder(Bus::spi(0)), None);
        assert!(s.is_idle());

        let reply = s.take_result(id).unwrap().unwrap();
        assert_eq!(reply.as_bytes(), &[0x55]);
        assert_eq!(s.phase(id), Some(Phase::Free));
        assert_eq!(s.registry().persistent(p).map(|st| st.completed), Some(1));
    }

    #[test]
    fn same_bus_instances_are_serialized() {
        let mut s = sched();
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(1)).with_settle_ms(0)).unwrap();
        let a = s.submit(p, &[1]).unwrap();
        let b = s.submit(p, &[2]).unwrap();

        s.tick(&mut hw, 0);
        assert_eq!(s.phase(a), Some(Phase::Running));
        assert_eq!(s.phase(b), Some(Phase::Queued));
        assert_eq!(hw.issued(), 1);

        for _ in 0..4 {
            hw.complete_all();
            s.tick(&mut hw, 0);
        }
        assert!(matches!(s.phase(a), Some(Phase::Finished(Outcome::Done))));
        assert_eq!(s.phase(b), Some(Phase::Running));

        // b's send only went out after a's receive completed
        let sends: usize = hw.count(|op| matches!(op, Op::SpiSend { .. }));
        assert_eq!(sends, 2);
        let order: [bool; 3] = {
            let mut ops = hw.ops();
            [
                matches!(ops.next(), Some(Op::SpiSend { payload: 1, .. })),
                matches!(ops.next(), Some(Op::SpiReceive { .. })),
                matches!(ops.next(), Some(Op::SpiSend { payload: 2, .. })),
            ]
        };
        assert_eq!(order, [true; 3]);
    }

    #[test]
    fn abort_releases_bus_and_cancels() {
        let mut s = sched();
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(0))).unwrap();
        let id = s.submit(p, &[1]).unwrap();
        s.tick(&mut hw, 0);
        assert!(hw.is_busy(Bus::spi(0)));

        s.abort(id, &mut hw).unwrap();
        assert!(!hw.is_busy(Bus::spi(0)));
        assert_eq!(s.leases().holder(Bus::spi(0)), None);
        assert_eq!(s.phase(id), Some(Phase::Free));
        assert_eq!(s.abort(id, &mut hw), Err(AbortError::NoSuchInstance(id)));
        // stale ready entries for the freed slot are skipped
        assert_eq!(s.tick(&mut hw, 5).resumed, 0);
    }

    #[test]
    fn step_deadline_fails_stalled_instance() {
        let mut s: Scheduler<SpiSensor, 2> = Scheduler::new(SchedulerConfig {
            wait_policy: WaitPolicy::StepDeadline { ms: 50 },
        });
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(0))).unwrap();
        let id = s.submit(p, &[1]).unwrap();
        s.tick(&mut hw, 0);
        s.tick(&mut hw, 49);
        assert_eq!(s.phase(id), Some(Phase::Running));

        let report = s.tick(&mut hw, 50);
        assert_eq!(report.failed, 1);
        assert_eq!(
            s.take_result(id),
            Some(Err(HandlerError::DeadlineExceeded { point: 1 }))
        );
        assert!(!hw.is_busy(Bus::spi(0)));
    }

    #[test]
    fn default_policy_waits_forever() {
        let mut s = sched();
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(0))).unwrap();
        let id = s.submit(p, &[1]).unwrap();
        s.tick(&mut hw, 0);
        s.tick(&mut hw, u32::MAX / 4);
        assert_eq!(s.phase(id), Some(Phase::Running));
        assert_eq!(s.resumes(id), Some(1));
    }

    #[test]
    fn handler_errors_finish_the_instance() {
        let mut s = sched();
        let mut hw = SimPeripherals::new();
        let p = s.register(SpiSensor::new(BusId(0))).unwrap();
        // truncated two-byte encoding
        let id = s.submit(p, &[0x80]).unwrap();
        let report = s.tick(&mut hw, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(s.leases().holder(Bus::spi(0)), None);
        assert!(matches!(
            s.take_result(id),
            Some(Err(HandlerError::Codec(_)))
        ));
    }

    #[test]
    fn submit_limits() {
        let mut s: Scheduler<SpiSensor, 1> = Scheduler::new(SchedulerConfig::default());
        assert_eq!(
            s.submit(PluginId(0), &[1]),
            Err(SubmitError::UnknownPlugin(PluginId(0)))
        );
        let p = s.register(SpiSensor::new(BusId(0))).unwrap();
        assert_eq!(
            s.submit(p, &[0; COMMAND_CAP + 1]),
            Err(SubmitError::CommandTooLong)
        );
        s.submit(p, &[1]).unwrap();
        assert_eq!(s.submit(p, &[1]), Err(SubmitError::NoFreeSlot));
    }
}
