//! Cooperative FIFO thread scheduler (C3).
//!
//! Generalizes the push/pop `Vec`-backed ready queue of the teacher's
//! `process::sched` module (`examples/mark-i-m-os2/kernel/process/sched.rs`)
//! into an intrusive, allocation-free FIFO: since this crate never stands up
//! a kernel heap (unlike the teacher's newer `x86_64`/`bootloader`-based
//! variant), TCBs carry their own queue link instead of living in a `Vec`.
//!
//! Per the "kernel-services bundle, not static singletons" design note, a
//! `Scheduler` is an ordinary value owned by whoever boots the kernel and
//! passed by `&mut` to the disk driver and the file system — not a global.

use core::ptr;

/// Opaque except for what the scheduler and blocking disk need: an id for
/// tracing and a queue link. The saved stack pointer and the actual context
/// switch are the external collaborator's contract (the boot/IRQ trampoline
/// supplies `dispatch_to`); this spec only consumes it.
pub struct Tcb {
    pub id: u32,
    pub sp: u32,
    next: *mut Tcb,
}

impl Tcb {
    pub const fn new(id: u32) -> Self {
        Tcb {
            id,
            sp: 0,
            next: ptr::null_mut(),
        }
    }
}

/// An intrusive FIFO of `Tcb`s linked through their own `next` field.
///
/// A `Tcb` is in at most one `TcbQueue` at a time (queue-uniqueness
/// invariant, §8); nothing here enforces that beyond the caller's
/// discipline, same as the teacher's raw capability handles.
pub struct TcbQueue {
    head: *mut Tcb,
    tail: *mut Tcb,
}

impl TcbQueue {
    pub const fn new() -> Self {
        TcbQueue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn push_back(&mut self, t: *mut Tcb) {
        unsafe {
            (*t).next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = t;
            } else {
                (*self.tail).next = t;
            }
        }
        self.tail = t;
    }

    pub fn pop_front(&mut self) -> Option<*mut Tcb> {
        if self.head.is_null() {
            return None;
        }
        let t = self.head;
        unsafe {
            self.head = (*t).next;
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(t)
    }
}

/// Something `Scheduler::yield_now` can poll for I/O-completion priority,
/// composed rather than hard-wired — `BlockingDisk` is the one real
/// implementation, but tests can supply a stub.
pub trait IoWaiter {
    /// True iff a parked thread is ready to be resumed.
    fn ready(&self) -> bool;
    /// Resume exactly one ready waiter onto `sched`'s ready queue.
    fn resume(&mut self, sched: &mut Scheduler);
}

/// FIFO ready-queue scheduler. Exactly one thread runs at a time; the
/// running thread is not itself present in `ready`.
pub struct Scheduler {
    ready: TcbQueue,
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            ready: TcbQueue::new(),
        }
    }

    /// Enqueue `t` at the tail of the ready queue.
    pub fn add(&mut self, t: *mut Tcb) {
        self.ready.push_back(t);
    }

    /// Same as `add`; kept as a separate name because the spec uses both
    /// `resume` (after an I/O wakeup) and `add` (an ordinary enqueue) for
    /// the same FIFO-tail operation.
    pub fn resume(&mut self, t: *mut Tcb) {
        self.add(t);
    }

    /// Pure scheduling decision: poll `waiter` for I/O-completion priority,
    /// then take the new head of the ready queue, if any. Returns `None`
    /// when there is nothing else to run (the caller keeps running).
    ///
    /// Split out from `yield_now` so the FIFO-plus-I/O-priority policy is
    /// exercisable on the host without the external `dispatch_to` symbol.
    pub fn next_to_run(&mut self, waiter: Option<&mut dyn IoWaiter>) -> Option<*mut Tcb> {
        if let Some(w) = waiter {
            if w.ready() {
                w.resume(self);
            }
        }
        self.ready.pop_front()
    }

    /// Full cooperative yield: dispatches to the chosen thread and does not
    /// return to the caller unless the ready queue (and any polled waiter)
    /// were both empty.
    #[cfg(not(test))]
    pub fn yield_now(&mut self, waiter: Option<&mut dyn IoWaiter>) {
        if let Some(next) = self.next_to_run(waiter) {
            Self::dispatch(next)
        }
    }

    /// Raw context switch, split out of `yield_now` so a caller holding a
    /// lock on other kernel state (see `boot::KERNEL_SERVICES` in `lib.rs`)
    /// can release it before control leaves this stack — `dispatch_to`
    /// never returns here, so anything still borrowed at the call site
    /// would stay borrowed until this thread is scheduled again.
    #[cfg(not(test))]
    pub fn dispatch(t: *mut Tcb) -> ! {
        unsafe { dispatch_to(t) }
    }

    /// Release `t`'s resources (nothing owned at this layer beyond the
    /// queue link already severed by `pop_front`) and yield; never returns.
    /// Still polls `waiter` first, same as every other yield point — a
    /// terminating thread must not skip the one chance a blocked I/O waiter
    /// gets to run before the ready queue is consulted.
    #[cfg(not(test))]
    pub fn terminate(&mut self, _t: *mut Tcb, waiter: Option<&mut dyn IoWaiter>) -> ! {
        if let Some(next) = self.next_to_run(waiter) {
            Self::dispatch(next)
        }
        panic!("terminate: no other thread is ready to run")
    }
}

/// Context-switch trampoline. Supplied by the boot/IRQ glue (§6): switches
/// to `t`, never returning to the caller until some other thread later
/// dispatches back to it. Consumed, not defined, by this spec.
#[cfg(not(test))]
extern "C" {
    fn dispatch_to(t: *mut Tcb) -> !;
}
