use heapless::Deque;

use crate::signal::{SigSet, Signal, NUM_SIGNALS};

pub type Tid = i32;

/// Thread ids at or below this belong to kernel housekeeping threads and
/// cannot be signalled.
pub const RESERVED_TIDS: Tid = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Per-thread signal state: the block/ignore mask, one pending slot per
/// signal, and the arrival-order queue of pending signals.
///
/// A signal occupies its slot from the first undelivered `send` until
/// delivery; re-sends while the slot is occupied only replace the recorded
/// sender. The queue therefore never holds more than one entry per signal.
pub struct SignalState {
    pub(crate) mask: SigSet,
    pub(crate) pending: [Option<Tid>; NUM_SIGNALS],
    pub(crate) queue: Deque<Signal, NUM_SIGNALS>,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            mask: SigSet::empty(),
            pending: [None; NUM_SIGNALS],
            queue: Deque::new(),
        }
    }

    pub fn mask(&self) -> SigSet {
        self.mask
    }

    /// Sender of the pending signal `sig`, if one is outstanding.
    pub fn pending_sender(&self, sig: Signal) -> Option<Tid> {
        self.pending[sig.index()]
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Marks `sig` pending with `sender` recorded, coalescing with an
    /// already-pending instance (the latest sender wins; the queue entry is
    /// not duplicated). `send` funnels through here, as do kernel-generated
    /// signals (child exit, CPU limit).
    pub fn post(&mut self, sig: Signal, sender: Tid) {
        if self.pending[sig.index()].is_none() {
            let pushed = self.queue.push_back(sig);
            debug_assert!(pushed.is_ok());
        }
        self.pending[sig.index()] = Some(sender);
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// The slice of the scheduler's thread descriptor that the signal
/// subsystem reads and writes. The full descriptor (stacks, scheduling
/// links, the unblock-list element) lives with the scheduler.
pub struct Thread {
    pub tid: Tid,
    pub ptid: Tid,
    pub status: ThreadStatus,
    /// Ticks this thread has been scheduled for.
    pub lifetime: i64,
    /// Children spawned over the thread's lifetime.
    pub total: u32,
    /// Children still running.
    pub alive: u32,
    pub sig: SignalState,
}

impl Thread {
    pub fn new(tid: Tid, ptid: Tid) -> Self {
        Self {
            tid,
            ptid,
            status: ThreadStatus::Ready,
            lifetime: 0,
            total: 0,
            alive: 0,
            sig: SignalState::new(),
        }
    }
}

/// The scheduler's thread table, as seen by the signal subsystem.
///
/// All callbacks run inside an interrupt-disabled critical section, which
/// is what makes the `&mut Thread` access exclusive on a uniprocessor.
pub trait ThreadRegistry {
    /// Id of the thread currently on the CPU.
    fn running_tid(&self) -> Tid;

    fn with_current<T>(&self, f: impl FnOnce(&mut Thread) -> T) -> T;

    /// Looks up `tid`; `None` when no such thread exists.
    fn with_thread<T>(&self, tid: Tid, f: impl FnOnce(&mut Thread) -> T) -> Option<T>;

    /// Hands a blocked thread to the scheduler's unblock list.
    fn enqueue_unblock(&self, tid: Tid);

    /// Terminates the running thread at the next scheduling point.
    fn exit_current(&self);
}
