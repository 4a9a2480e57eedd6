//! Test scaffolding: a simulated clock with an event queue, an in-memory
//! queue-pair substrate, and a recorded control-packet wire. Everything is
//! deterministic; time only moves when a test advances it, and deferred work
//! runs when a test pumps it.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::packet::ControlPacket;
use crate::qp::{
    QpError, QpFlags, QpHandle, QueuePair, QueuePairRequest, SendCtlError, SubscriptionId,
};
use crate::Dependencies;

// simulated time, represented in nanoseconds

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(u64);

impl Instant {
    pub const EPOCH: Self = Self(0);
}

impl std::ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.checked_add(rhs.0).unwrap())
    }
}

impl std::ops::Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0.checked_sub(rhs.0).unwrap())
    }
}

impl std::ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0.checked_sub(rhs.0).unwrap())
    }
}

impl std::ops::Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.checked_add(rhs.0).unwrap())
    }
}

impl std::ops::Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.checked_sub(rhs.0).unwrap())
    }
}

impl crate::util::time::Instant for Instant {
    type Duration = Duration;

    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }

    fn checked_add(&self, duration: Duration) -> Option<Self> {
        self.0.checked_add(duration.0).map(Self)
    }
}

impl crate::util::time::Duration for Duration {
    const MAX: Self = Self(u64::MAX);
    const ZERO: Self = Self(0);

    fn from_micros(micros: u64) -> Self {
        Self(micros.checked_mul(1_000).unwrap())
    }

    fn from_millis(millis: u64) -> Self {
        Self(millis.checked_mul(1_000_000).unwrap())
    }

    fn from_secs(secs: u64) -> Self {
        Self(secs.checked_mul(1_000_000_000).unwrap())
    }

    fn as_secs(&self) -> u64 {
        self.0 / 1_000_000_000
    }

    fn subsec_micros(&self) -> u32 {
        ((self.0 % 1_000_000_000) / 1_000) as u32
    }

    fn is_zero(&self) -> bool {
        self.0 == 0
    }

    fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Duration {
    pub fn from_millis(millis: u64) -> Self {
        <Self as crate::util::time::Duration>::from_millis(millis)
    }

    pub fn from_secs(secs: u64) -> Self {
        <Self as crate::util::time::Duration>::from_secs(secs)
    }
}

// timer events

struct Event {
    time: Instant,
    id: u64,
    callback: Box<dyn FnOnce() + Send>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("time", &self.time)
            .field("id", &self.id)
            .finish()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.time.cmp(&other.time).then(self.id.cmp(&other.id))
    }
}

#[derive(Debug, Default)]
struct EventQueue {
    queue: BinaryHeap<Reverse<Event>>,
    counter: u64,
}

impl EventQueue {
    fn push(&mut self, time: Instant, callback: Box<dyn FnOnce() + Send>) {
        self.queue.push(Reverse(Event {
            time,
            id: self.counter,
            callback,
        }));
        self.counter += 1;
    }

    fn pop_up_to(&mut self, time: Instant) -> Option<Event> {
        if self.queue.peek()?.0.time > time {
            return None;
        }
        Some(self.queue.pop().unwrap().0)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// the in-memory queue-pair substrate

/// One direction of a shared ring: absolute produce/consume counters over a
/// byte queue.
#[derive(Debug, Default)]
struct Ring {
    data: VecDeque<u8>,
    capacity: u64,
    /// Total bytes ever produced.
    tail: u64,
    /// Total bytes ever consumed.
    head: u64,
}

impl Ring {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    fn ready(&self) -> u64 {
        self.tail - self.head
    }

    fn free(&self) -> u64 {
        self.capacity - self.ready()
    }

    fn produce(&mut self, buf: &[u8]) -> usize {
        let n = std::cmp::min(buf.len() as u64, self.free()) as usize;
        self.data.extend(&buf[..n]);
        self.tail += n as u64;
        n
    }

    fn consume(&mut self, buf: &mut [u8], remove: bool) -> usize {
        let n = std::cmp::min(buf.len(), self.data.len());
        for (i, slot) in buf.iter_mut().enumerate().take(n) {
            *slot = self.data[i];
        }
        if remove {
            self.data.drain(..n);
            self.head += n as u64;
        }
        n
    }
}

#[derive(Debug)]
struct RingPair {
    /// Indexed by the allocating side: `rings[0]` is the allocator's produce
    /// ring, `rings[1]` the attacher's.
    rings: [Mutex<Ring>; 2],
}

/// The allocator gets side 0, the attacher side 1.
#[derive(Debug)]
pub struct MockQp {
    pair: Arc<RingPair>,
    side: usize,
}

impl MockQp {
    fn produce_ring(&self) -> MutexGuard<'_, Ring> {
        self.pair.rings[self.side].lock().unwrap()
    }

    fn consume_ring(&self) -> MutexGuard<'_, Ring> {
        self.pair.rings[1 - self.side].lock().unwrap()
    }
}

impl QueuePair for MockQp {
    fn enqueue(&self, buf: &[u8]) -> Result<usize, QpError> {
        Ok(self.produce_ring().produce(buf))
    }

    fn dequeue(&self, buf: &mut [u8]) -> Result<usize, QpError> {
        Ok(self.consume_ring().consume(buf, true))
    }

    fn peek(&self, buf: &mut [u8]) -> Result<usize, QpError> {
        Ok(self.consume_ring().consume(buf, false))
    }

    fn produce_buf_ready(&self) -> u64 {
        self.produce_ring().ready()
    }

    fn consume_buf_ready(&self) -> u64 {
        self.consume_ring().ready()
    }

    fn produce_free_space(&self) -> u64 {
        self.produce_ring().free()
    }

    fn consume_free_space(&self) -> u64 {
        self.consume_ring().free()
    }

    fn produce_indexes(&self) -> (u64, u64) {
        let ring = self.produce_ring();
        (ring.tail % ring.capacity, ring.head % ring.capacity)
    }

    fn consume_indexes(&self) -> (u64, u64) {
        let ring = self.consume_ring();
        (ring.tail % ring.capacity, ring.head % ring.capacity)
    }
}

// the shared world

#[derive(Default)]
struct SimState {
    events: EventQueue,
    work: VecDeque<Box<dyn FnOnce() + Send>>,
    /// Encoded control datagrams queued per destination context.
    wires: HashMap<u32, VecDeque<Vec<u8>>>,
    qp_registry: HashMap<QpHandle, Arc<RingPair>>,
    /// Queue pairs one side has detached from, in detach order.
    detached: Vec<QpHandle>,
    restricted: Vec<u32>,
    context_owners: HashMap<u32, u32>,
    next_resource: u32,
    next_subscription: u64,
    subscriptions: Vec<SubscriptionId>,
}

/// The shared simulation: one clock, one timer wheel, one work queue, one
/// wire, shared by every endpoint in a test.
pub struct Sim {
    now: AtomicU64,
    state: Mutex<SimState>,
}

impl Sim {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(0),
            state: Mutex::new(SimState {
                next_resource: 1000,
                ..Default::default()
            }),
        })
    }

    pub fn env(self: &Arc<Self>, cid: u32) -> TestEnv {
        TestEnv {
            sim: Arc::clone(self),
            cid,
            fail_sends: Arc::new(AtomicU32::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn now(&self) -> Instant {
        Instant(self.now.load(Ordering::SeqCst))
    }

    /// Run queued deferred work to completion, FIFO.
    pub fn run_work(&self) {
        loop {
            let Some(item) = self.state().work.pop_front() else {
                break;
            };
            item();
        }
    }

    /// Advance the clock, firing due timers in order and draining deferred
    /// work after each.
    pub fn advance(&self, duration: Duration) {
        let target = self.now() + duration;

        loop {
            let event = self.state().events.pop_up_to(target);
            let Some(event) = event else {
                break;
            };

            self.now.store(event.time.0, Ordering::SeqCst);
            (event.callback)();
            self.run_work();
        }

        self.now.store(target.0, Ordering::SeqCst);
        self.run_work();
    }

    pub fn pending_timers(&self) -> usize {
        self.state().events.len()
    }

    /// Take the next datagram queued for `cid` off the wire.
    pub fn pop_wire(&self, cid: u32) -> Option<Vec<u8>> {
        self.state().wires.get_mut(&cid)?.pop_front()
    }

    pub fn wire_len(&self, cid: u32) -> usize {
        self.state().wires.get(&cid).map_or(0, |q| q.len())
    }

    /// Queue pairs detached since the last call.
    pub fn take_detached(&self) -> Vec<QpHandle> {
        std::mem::take(&mut self.state().detached)
    }

    pub fn restrict_context(&self, cid: u32) {
        self.state().restricted.push(cid);
    }

    pub fn set_context_owner(&self, cid: u32, uid: u32) {
        self.state().context_owners.insert(cid, uid);
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }
}

/// Per-endpoint dependencies handed to a stack. Tests keep a clone to inject
/// failures.
#[derive(Clone)]
pub struct TestEnv {
    sim: Arc<Sim>,
    cid: u32,
    /// Next N control sends fail with a transient error.
    fail_sends: Arc<AtomicU32>,
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv").field("cid", &self.cid).finish()
    }
}

impl TestEnv {
    pub fn sim(&self) -> &Arc<Sim> {
        &self.sim
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }
}

impl Dependencies for TestEnv {
    type Instant = Instant;
    type Duration = Duration;
    type QueuePair = MockQp;

    fn current_time(&self) -> Instant {
        self.sim.now()
    }

    fn register_timer(&self, time: Instant, f: impl FnOnce() + Send + 'static) {
        self.sim.state().events.push(time, Box::new(f));
    }

    fn defer(&self, f: impl FnOnce() + Send + 'static) {
        self.sim.state().work.push_back(Box::new(f));
    }

    fn local_cid(&self) -> u32 {
        self.cid
    }

    fn context_restricted(&self, cid: u32) -> bool {
        self.sim.state().restricted.contains(&cid)
    }

    fn is_context_owner(&self, cid: u32, uid: u32) -> bool {
        self.sim.state().context_owners.get(&cid) == Some(&uid)
    }

    fn send_control(&self, pkt: &ControlPacket) -> Result<(), SendCtlError> {
        if self.fail_sends.load(Ordering::SeqCst) > 0 {
            self.fail_sends.fetch_sub(1, Ordering::SeqCst);
            return Err(SendCtlError::Again);
        }

        // The transport stamps the sender's real context id on delivery.
        let mut stamped = *pkt;
        stamped.dg_src.context = self.cid;

        let dst = stamped.dg_dst.context;
        self.sim
            .state()
            .wires
            .entry(dst)
            .or_default()
            .push_back(stamped.encode().to_vec());

        Ok(())
    }

    fn alloc_queue_pair(
        &self,
        req: QueuePairRequest,
    ) -> Result<(MockQp, QpHandle), QpError> {
        let mut state = self.sim.state();

        if req.flags.contains(QpFlags::ATTACH_ONLY) {
            let pair = state.qp_registry.get(&req.handle).ok_or(QpError::NotFound)?;
            return Ok((
                MockQp {
                    pair: Arc::clone(pair),
                    side: 1,
                },
                req.handle,
            ));
        }

        let handle = if req.handle.is_invalid() {
            state.next_resource += 1;
            QpHandle::new(self.cid, state.next_resource)
        } else {
            req.handle
        };

        let pair = Arc::new(RingPair {
            rings: [
                Mutex::new(Ring::new(req.produce_size)),
                Mutex::new(Ring::new(req.consume_size)),
            ],
        });
        state.qp_registry.insert(handle, Arc::clone(&pair));

        Ok((MockQp { pair, side: 0 }, handle))
    }

    fn detach_queue_pair(&self, qp: MockQp) {
        let mut state = self.sim.state();
        let handle = state
            .qp_registry
            .iter()
            .find(|(_, pair)| Arc::ptr_eq(pair, &qp.pair))
            .map(|(handle, _)| *handle);
        if let Some(handle) = handle {
            state.detached.push(handle);
        }
    }

    fn subscribe_peer_detach(&self, _handle: QpHandle) -> Result<SubscriptionId, QpError> {
        let mut state = self.sim.state();
        state.next_subscription += 1;
        let sub = SubscriptionId(state.next_subscription);
        state.subscriptions.push(sub);
        Ok(sub)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.sim.state();
        if let Some(pos) = state.subscriptions.iter().position(|s| *s == id) {
            state.subscriptions.remove(pos);
        }
    }
}
