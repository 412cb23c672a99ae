use crate::signal::Signal;
use crate::thread::Tid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Allocation request of zero bytes or beyond half a page.
    InvalidAllocSize(usize),
    /// The page provider has no pages left.
    HeapExhausted,
    /// Signal can only be generated inside the kernel.
    ReservedSignal(Signal),
    /// Target thread id is reserved for kernel threads.
    ReservedThread(Tid),
    /// No thread with this id exists.
    UnknownThread(Tid),
    /// Only the parent of a thread may kill it.
    NotParent { tid: Tid, sender: Tid },
    /// Raw signal number outside `0..NUM_SIGNALS`.
    InvalidSignal(i32),
    /// Raw signal set with bits outside the valid signal range.
    InvalidSigSet(u32),
    /// Raw `how` argument that names no mask operation.
    InvalidMaskHow(i32),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidAllocSize(size) => {
                write!(f, "Invalid allocation size `{size}`")
            }
            Error::HeapExhausted => write!(f, "Page provider exhausted"),
            Error::ReservedSignal(sig) => write!(f, "Signal {sig:?} is kernel-generated"),
            Error::ReservedThread(tid) => write!(f, "Thread id `{tid}` is reserved"),
            Error::UnknownThread(tid) => write!(f, "No such thread `{tid}`"),
            Error::NotParent { tid, sender } => {
                write!(f, "Thread `{sender}` is not the parent of `{tid}`")
            }
            Error::InvalidSignal(num) => write!(f, "Invalid signal number `{num}`"),
            Error::InvalidSigSet(bits) => write!(f, "Invalid signal set `{bits:#x}`"),
            Error::InvalidMaskHow(how) => write!(f, "Invalid mask operation `{how}`"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
