use core::fmt::Write;

use crate::error::{Error, Result};
use crate::interrupt::{InterruptGate, IntrGuard};
use crate::thread::{ThreadRegistry, ThreadStatus, Tid, RESERVED_TIDS};

pub const NUM_SIGNALS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    /// Terminate the target. Only deliverable by the target's parent.
    Kill = 0,
    /// User-defined notification.
    User = 1,
    /// CPU limit exceeded. Kernel-generated.
    Cpu = 2,
    /// A child thread exited. Kernel-generated.
    Chld = 3,
    /// Force a blocked thread back onto the ready queue.
    Ublock = 4,
}

impl Signal {
    /// Parses an untrusted signal number.
    pub fn from_raw(num: i32) -> Result<Signal> {
        match num {
            0 => Ok(Signal::Kill),
            1 => Ok(Signal::User),
            2 => Ok(Signal::Cpu),
            3 => Ok(Signal::Chld),
            4 => Ok(Signal::Ublock),
            _ => Err(Error::InvalidSignal(num)),
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    /// The signal's bit in a `SigSet`.
    pub const fn bit(self) -> SigSet {
        match self {
            Signal::Kill => SigSet::KILL,
            Signal::User => SigSet::USER,
            Signal::Cpu => SigSet::CPU,
            Signal::Chld => SigSet::CHLD,
            Signal::Ublock => SigSet::UBLOCK,
        }
    }
}

bitflags! {
    /// A set of signals; as a thread's mask, a set bit means the signal is
    /// blocked and ignored.
    pub struct SigSet: u32 {
        const KILL = 1 << 0;
        const USER = 1 << 1;
        const CPU = 1 << 2;
        const CHLD = 1 << 3;
        const UBLOCK = 1 << 4;
    }
}

impl SigSet {
    /// Parses an untrusted bit pattern, rejecting bits outside the valid
    /// signal range.
    pub fn from_raw(bits: u32) -> Result<SigSet> {
        SigSet::from_bits(bits).ok_or(Error::InvalidSigSet(bits))
    }
}

/// Disposition of a signal. There is no user-handler slot: a thread either
/// takes the default action or ignores, and "ignore" is the mask bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Default,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMaskHow {
    Block,
    Unblock,
    SetMask,
}

impl SigMaskHow {
    pub fn from_raw(how: i32) -> Result<SigMaskHow> {
        match how {
            0 => Ok(SigMaskHow::Block),
            1 => Ok(SigMaskHow::Unblock),
            2 => Ok(SigMaskHow::SetMask),
            _ => Err(Error::InvalidMaskHow(how)),
        }
    }
}

enum SendAction {
    Done,
    Unblock,
}

/// The signal subsystem. Each mutator brackets its work in an
/// interrupt-disabled critical section; on a uniprocessor that is the only
/// synchronization signal state needs.
pub struct Signals<'a, R, G> {
    threads: &'a R,
    intr: &'a G,
}

impl<'a, R: ThreadRegistry, G: InterruptGate> Signals<'a, R, G> {
    pub fn new(threads: &'a R, intr: &'a G) -> Self {
        Self { threads, intr }
    }

    /// Chooses between the default action and ignoring `signum` for the
    /// current thread, returning the previous choice.
    ///
    /// `Kill` is not overridable; the request is ignored and the fixed
    /// default disposition returned.
    pub fn install_handler(&self, signum: Signal, handler: Handler) -> Handler {
        if signum == Signal::Kill {
            return Handler::Default;
        }

        let _intr = IntrGuard::new(self.intr);
        self.threads.with_current(|t| {
            let old = if t.sig.mask.contains(signum.bit()) {
                Handler::Ignore
            } else {
                Handler::Default
            };
            if old != handler {
                t.sig.mask.toggle(signum.bit());
            }
            old
        })
    }

    /// Sends `sig` to thread `tid`.
    ///
    /// `Chld` and `Cpu` are kernel-generated and cannot be sent; tids at or
    /// below `RESERVED_TIDS` cannot be signalled; `Kill` is permitted only
    /// from the target's parent. A non-`Kill` signal the target blocks is
    /// silently suppressed, not queued. Re-sending an already-pending
    /// signal replaces the recorded sender without growing the queue.
    pub fn send(&self, tid: Tid, sig: Signal) -> Result<()> {
        if sig == Signal::Chld || sig == Signal::Cpu {
            return Err(Error::ReservedSignal(sig));
        }
        if tid <= RESERVED_TIDS {
            return Err(Error::ReservedThread(tid));
        }

        let _intr = IntrGuard::new(self.intr);
        let sender = self.threads.running_tid();

        let action = self
            .threads
            .with_thread(tid, |t| {
                if sig != Signal::Kill && t.sig.mask.contains(sig.bit()) {
                    return Ok(SendAction::Done);
                }
                if sig == Signal::Ublock {
                    if t.status == ThreadStatus::Blocked {
                        return Ok(SendAction::Unblock);
                    }
                    return Ok(SendAction::Done);
                }
                if sig == Signal::Kill && t.ptid != sender {
                    return Err(Error::NotParent { tid, sender });
                }
                t.sig.post(sig, sender);
                Ok(SendAction::Done)
            })
            .ok_or(Error::UnknownThread(tid))??;

        if let SendAction::Unblock = action {
            log::trace!("signal: unblocking tid {tid}");
            self.threads.enqueue_unblock(tid);
        }
        Ok(())
    }

    /// Examines and updates the current thread's signal mask.
    ///
    /// The prior mask is written to `oldset` first; with `set == None` this
    /// is a pure report. `Unblock` clears only valid signal bits.
    pub fn sigprocmask(&self, how: SigMaskHow, set: Option<SigSet>, oldset: Option<&mut SigSet>) {
        let _intr = IntrGuard::new(self.intr);
        self.threads.with_current(|t| {
            if let Some(old) = oldset {
                *old = t.sig.mask;
            }
            let Some(set) = set else { return };
            match how {
                SigMaskHow::Block => t.sig.mask |= set,
                SigMaskHow::Unblock => t.sig.mask &= !set,
                SigMaskHow::SetMask => t.sig.mask = set,
            }
        });
    }

    /// Drains the current thread's pending signals in arrival order,
    /// running default actions. Called by the scheduler before returning
    /// control to the thread.
    ///
    /// A signal whose mask bit is set by the time it is drained is consumed
    /// without an action. Delivery of `Kill` or `Cpu` terminates the thread
    /// and stops the drain.
    pub fn deliver_pending(&self, console: &mut dyn Write) {
        loop {
            let next = {
                let _intr = IntrGuard::new(self.intr);
                self.threads.with_current(|t| {
                    let sig = t.sig.queue.pop_front()?;
                    let sender = t.sig.pending[sig.index()]
                        .take()
                        .expect("queued signal without a pending slot");
                    Some((sig, sender, t.sig.mask.contains(sig.bit())))
                })
            };

            let Some((sig, sender, ignored)) = next else {
                break;
            };
            if ignored {
                continue;
            }
            if self.default_action(sig, sender, console) {
                break;
            }
        }
    }

    /// Runs the default action for `sig`; true if the thread terminated.
    fn default_action(&self, sig: Signal, by: Tid, console: &mut dyn Write) -> bool {
        let tid = self.threads.running_tid();
        match sig {
            Signal::Kill => {
                let _ = writeln!(console, "{tid} Killed by {by}");
                self.threads.exit_current();
                true
            }
            Signal::User => {
                let _ = writeln!(console, "{by} sent SIG_USER to {tid}");
                false
            }
            Signal::Cpu => {
                let lifetime = self.threads.with_current(|t| t.lifetime);
                let _ = writeln!(console, "Lifetime of {tid} = {lifetime}");
                self.threads.exit_current();
                true
            }
            Signal::Chld => {
                let (total, alive) = self.threads.with_current(|t| {
                    t.alive -= 1;
                    (t.total, t.alive)
                });
                let _ = writeln!(console, "Thread {tid}: {total} Children, {alive} alive");
                false
            }
            // Force-unblock acts entirely at send time and is never queued.
            Signal::Ublock => false,
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::{Cell, RefCell};
    use std::string::String;
    use std::vec::Vec;

    use super::*;
    use crate::interrupt::IntrLevel;
    use crate::thread::Thread;

    struct TestGate {
        level: Cell<IntrLevel>,
    }

    impl TestGate {
        fn new() -> Self {
            Self {
                level: Cell::new(IntrLevel::On),
            }
        }
    }

    impl InterruptGate for TestGate {
        fn level(&self) -> IntrLevel {
            self.level.get()
        }

        fn disable(&self) -> IntrLevel {
            self.level.replace(IntrLevel::Off)
        }

        fn restore(&self, prior: IntrLevel) {
            self.level.set(prior);
        }
    }

    struct TestThreads {
        current: Cell<Tid>,
        threads: RefCell<Vec<Thread>>,
        unblocked: RefCell<Vec<Tid>>,
        exited: RefCell<Vec<Tid>>,
    }

    impl TestThreads {
        fn new(threads: Vec<Thread>, current: Tid) -> Self {
            Self {
                current: Cell::new(current),
                threads: RefCell::new(threads),
                unblocked: RefCell::new(Vec::new()),
                exited: RefCell::new(Vec::new()),
            }
        }

        fn switch_to(&self, tid: Tid) {
            self.current.set(tid);
        }
    }

    impl ThreadRegistry for TestThreads {
        fn running_tid(&self) -> Tid {
            self.current.get()
        }

        fn with_current<T>(&self, f: impl FnOnce(&mut Thread) -> T) -> T {
            self.with_thread(self.current.get(), f).unwrap()
        }

        fn with_thread<T>(&self, tid: Tid, f: impl FnOnce(&mut Thread) -> T) -> Option<T> {
            let mut threads = self.threads.borrow_mut();
            threads.iter_mut().find(|t| t.tid == tid).map(f)
        }

        fn enqueue_unblock(&self, tid: Tid) {
            self.unblocked.borrow_mut().push(tid);
        }

        fn exit_current(&self) {
            self.exited.borrow_mut().push(self.current.get());
        }
    }

    // Threads 5 (parent) and 6, plus 10 whose parent is 5. Running: 5.
    fn registry() -> TestThreads {
        TestThreads::new(
            vec![Thread::new(5, 3), Thread::new(6, 3), Thread::new(10, 5)],
            5,
        )
    }

    #[test]
    fn send_queues_once_and_keeps_latest_sender() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        assert_eq!(signals.send(10, Signal::User), Ok(()));
        threads.switch_to(6);
        assert_eq!(signals.send(10, Signal::User), Ok(()));

        threads
            .with_thread(10, |t| {
                assert_eq!(t.sig.queued(), 1);
                assert_eq!(t.sig.pending_sender(Signal::User), Some(6));
            })
            .unwrap();

        threads.switch_to(10);
        let mut out = String::new();
        signals.deliver_pending(&mut out);
        assert_eq!(out, "6 sent SIG_USER to 10\n");

        threads
            .with_thread(10, |t| {
                assert_eq!(t.sig.queued(), 0);
                assert_eq!(t.sig.pending_sender(Signal::User), None);
            })
            .unwrap();
    }

    #[test]
    fn blocked_signal_is_suppressed_not_queued() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        threads
            .with_thread(10, |t| t.sig.mask.insert(Signal::User.bit()))
            .unwrap();

        assert_eq!(signals.send(10, Signal::User), Ok(()));
        threads
            .with_thread(10, |t| {
                assert_eq!(t.sig.queued(), 0);
                assert_eq!(t.sig.pending_sender(Signal::User), None);
            })
            .unwrap();
    }

    #[test]
    fn kill_is_parent_only_and_ignores_the_mask() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        threads.switch_to(6);
        assert_eq!(
            signals.send(10, Signal::Kill),
            Err(Error::NotParent { tid: 10, sender: 6 })
        );
        assert!(threads.exited.borrow().is_empty());

        // Masking KILL does not protect from the parent.
        threads
            .with_thread(10, |t| t.sig.mask.insert(Signal::Kill.bit()))
            .unwrap();
        threads.switch_to(5);
        assert_eq!(signals.send(10, Signal::Kill), Ok(()));
        threads
            .with_thread(10, |t| assert_eq!(t.sig.pending_sender(Signal::Kill), Some(5)))
            .unwrap();
    }

    #[test]
    fn reserved_signals_and_tids_are_rejected() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        assert_eq!(
            signals.send(10, Signal::Chld),
            Err(Error::ReservedSignal(Signal::Chld))
        );
        assert_eq!(
            signals.send(10, Signal::Cpu),
            Err(Error::ReservedSignal(Signal::Cpu))
        );
        assert_eq!(signals.send(2, Signal::User), Err(Error::ReservedThread(2)));
        assert_eq!(signals.send(99, Signal::User), Err(Error::UnknownThread(99)));
    }

    #[test]
    fn ublock_feeds_the_unblock_list_only_when_blocked() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        assert_eq!(signals.send(10, Signal::Ublock), Ok(()));
        assert!(threads.unblocked.borrow().is_empty());

        threads
            .with_thread(10, |t| t.status = ThreadStatus::Blocked)
            .unwrap();
        assert_eq!(signals.send(10, Signal::Ublock), Ok(()));
        assert_eq!(*threads.unblocked.borrow(), vec![10]);

        // No pending slot is involved either way.
        threads
            .with_thread(10, |t| assert_eq!(t.sig.queued(), 0))
            .unwrap();
    }

    #[test]
    fn sigprocmask_round_trips() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        signals.sigprocmask(
            SigMaskHow::SetMask,
            Some(SigSet::USER | SigSet::CHLD),
            None,
        );

        let mut saved = SigSet::empty();
        signals.sigprocmask(SigMaskHow::Block, Some(SigSet::CPU), Some(&mut saved));
        assert_eq!(saved, SigSet::USER | SigSet::CHLD);

        signals.sigprocmask(SigMaskHow::Unblock, Some(SigSet::USER), None);
        let mut now = SigSet::empty();
        signals.sigprocmask(SigMaskHow::SetMask, None, Some(&mut now));
        assert_eq!(now, SigSet::CHLD | SigSet::CPU);

        // Restoring the saved mask is idempotent.
        signals.sigprocmask(SigMaskHow::SetMask, Some(saved), None);
        let mut round = SigSet::empty();
        signals.sigprocmask(SigMaskHow::SetMask, Some(saved), Some(&mut round));
        assert_eq!(round, saved);
    }

    #[test]
    fn install_handler_toggles_the_mask_bit() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        assert_eq!(
            signals.install_handler(Signal::User, Handler::Ignore),
            Handler::Default
        );
        assert_eq!(
            signals.install_handler(Signal::User, Handler::Ignore),
            Handler::Ignore
        );
        assert_eq!(
            signals.install_handler(Signal::User, Handler::Default),
            Handler::Ignore
        );
        threads.with_current(|t| assert!(t.sig.mask.is_empty()));

        // KILL's disposition is fixed.
        assert_eq!(
            signals.install_handler(Signal::Kill, Handler::Ignore),
            Handler::Default
        );
        threads.with_current(|t| assert!(t.sig.mask.is_empty()));
    }

    #[test]
    fn delivery_runs_in_arrival_order_and_stops_at_termination() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        threads.switch_to(6);
        assert_eq!(signals.send(10, Signal::User), Ok(()));
        threads.switch_to(5);
        assert_eq!(signals.send(10, Signal::Kill), Ok(()));

        threads.switch_to(10);
        let mut out = String::new();
        signals.deliver_pending(&mut out);
        assert_eq!(out, "6 sent SIG_USER to 10\n10 Killed by 5\n");
        assert_eq!(*threads.exited.borrow(), vec![10]);
    }

    #[test]
    fn kill_first_preempts_later_arrivals() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        assert_eq!(signals.send(10, Signal::Kill), Ok(()));
        threads.switch_to(6);
        assert_eq!(signals.send(10, Signal::User), Ok(()));

        threads.switch_to(10);
        let mut out = String::new();
        signals.deliver_pending(&mut out);
        assert_eq!(out, "10 Killed by 5\n");
        // The drain stopped; USER stays queued on the dying thread.
        threads
            .with_thread(10, |t| assert_eq!(t.sig.queued(), 1))
            .unwrap();
    }

    #[test]
    fn masked_at_delivery_is_consumed_silently() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        assert_eq!(signals.send(10, Signal::User), Ok(()));
        threads
            .with_thread(10, |t| t.sig.mask.insert(Signal::User.bit()))
            .unwrap();

        threads.switch_to(10);
        let mut out = String::new();
        signals.deliver_pending(&mut out);
        assert!(out.is_empty());
        threads
            .with_thread(10, |t| {
                assert_eq!(t.sig.queued(), 0);
                assert_eq!(t.sig.pending_sender(Signal::User), None);
            })
            .unwrap();
    }

    #[test]
    fn kernel_generated_signals_deliver_their_defaults() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        // The scheduler posts CHLD to the parent when a child exits, and
        // CPU to a thread over its limit.
        threads
            .with_thread(5, |t| {
                t.total = 3;
                t.alive = 2;
                t.sig.post(Signal::Chld, 10);
            })
            .unwrap();

        let mut out = String::new();
        signals.deliver_pending(&mut out);
        assert_eq!(out, "Thread 5: 3 Children, 1 alive\n");

        threads
            .with_thread(6, |t| {
                t.lifetime = 1234;
                t.sig.post(Signal::Cpu, 0);
            })
            .unwrap();
        threads.switch_to(6);
        out.clear();
        signals.deliver_pending(&mut out);
        assert_eq!(out, "Lifetime of 6 = 1234\n");
        assert_eq!(*threads.exited.borrow(), vec![6]);
    }

    #[test]
    fn interrupts_are_restored_on_every_path() {
        let threads = registry();
        let gate = TestGate::new();
        let signals = Signals::new(&threads, &gate);

        let _ = signals.send(10, Signal::User);
        assert_eq!(gate.level(), IntrLevel::On);
        let _ = signals.send(99, Signal::User);
        assert_eq!(gate.level(), IntrLevel::On);
        threads.switch_to(6);
        let _ = signals.send(10, Signal::Kill);
        assert_eq!(gate.level(), IntrLevel::On);
        signals.sigprocmask(SigMaskHow::Block, Some(SigSet::USER), None);
        assert_eq!(gate.level(), IntrLevel::On);
    }

    #[test]
    fn raw_boundary_rejects_out_of_range_values() {
        assert_eq!(Signal::from_raw(4), Ok(Signal::Ublock));
        assert_eq!(Signal::from_raw(5), Err(Error::InvalidSignal(5)));
        assert_eq!(Signal::from_raw(-1), Err(Error::InvalidSignal(-1)));
        assert_eq!(SigSet::from_raw(0x1f).map(|s| s.bits()), Ok(0x1f));
        assert_eq!(SigSet::from_raw(0x20), Err(Error::InvalidSigSet(0x20)));
        assert_eq!(SigMaskHow::from_raw(2), Ok(SigMaskHow::SetMask));
        assert_eq!(SigMaskHow::from_raw(3), Err(Error::InvalidMaskHow(3)));
    }
}
