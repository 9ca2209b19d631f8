//! Thread Control Block (TCB) view used by the transport
//!
//! A TCB here holds only what IPC needs:
//! - Saved register file (syscall registers, reached through [`SyscallRegisters`])
//! - UTCB (TCB region) owned exclusively by the thread
//! - IPC state (who it is sending to / willing to receive from)
//! - Whether the thread is currently scheduled on a CPU
//!
//! Scheduling and context switching live elsewhere; they hand the engine a
//! pair of TCBs that are already rendezvoused.
//!
//! ## IPC lifecycle
//!
//! ```text
//! Running ──send()──► Sending{to} ──transfer──► Running
//! Running ──receive()──► BlockedOnReceive{from} ──transfer──► Runnable
//! ```

use core::fmt;

use crate::registers::{RegisterFile, SyscallRegisters, Word, MR_SENDER, MR_TAG, SYS_DEST, SYS_SOURCE};
use crate::utcb::Utcb;

/// Register value meaning "receive from any thread"
pub const ANYTHREAD: Word = 0xFFFF_FFFF;

/// Thread identity as carried in registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub Word);

impl ThreadId {
    #[inline]
    pub const fn as_word(self) -> Word {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Which senders a blocked receiver accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvFrom {
    /// Open to every thread; the kernel reports the sender in `MR_SENDER`
    AnyThread,
    /// Directed receive from one thread
    Thread(ThreadId),
}

impl RecvFrom {
    /// Decode the source system register
    pub const fn from_word(word: Word) -> Self {
        if word == ANYTHREAD {
            RecvFrom::AnyThread
        } else {
            RecvFrom::Thread(ThreadId(word))
        }
    }

    /// Encode for the source system register
    pub const fn to_word(self) -> Word {
        match self {
            RecvFrom::AnyThread => ANYTHREAD,
            RecvFrom::Thread(tid) => tid.0,
        }
    }

    /// Whether a message from `sender` satisfies this receive
    #[inline]
    pub fn accepts(self, sender: ThreadId) -> bool {
        match self {
            RecvFrom::AnyThread => true,
            RecvFrom::Thread(tid) => tid == sender,
        }
    }
}

/// Thread state as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Not taking part in IPC (initial state)
    Inactive,

    /// Running on a CPU
    Running,

    /// Ready to run but not scheduled
    Runnable,

    /// Issued a send that has not been delivered yet
    Sending {
        /// Destination thread
        to: ThreadId,
    },

    /// Blocked waiting for a message
    BlockedOnReceive {
        /// Accepted senders
        from: RecvFrom,
    },
}

/// Per-thread control structure handed to the transfer engine
#[derive(Debug, Clone)]
pub struct Tcb<R = RegisterFile> {
    /// Thread ID
    tid: ThreadId,

    /// Saved (or live, if scheduled) syscall registers
    context: R,

    /// TCB region, exclusively owned by this thread
    utcb: Utcb,

    /// IPC state
    state: ThreadState,

    /// Currently executing on a CPU
    scheduled: bool,
}

impl<R: SyscallRegisters + Default> Tcb<R> {
    /// Create an inactive thread with zeroed registers and UTCB
    pub fn new(tid: ThreadId) -> Self {
        Self::with_context(tid, R::default())
    }
}

impl<R: SyscallRegisters> Tcb<R> {
    /// Create an inactive thread around an existing register file
    pub fn with_context(tid: ThreadId, context: R) -> Self {
        Self {
            tid,
            context,
            utcb: Utcb::new(),
            state: ThreadState::Inactive,
            scheduled: false,
        }
    }

    #[inline]
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    #[inline]
    pub fn context(&self) -> &R {
        &self.context
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut R {
        &mut self.context
    }

    #[inline]
    pub fn utcb(&self) -> &Utcb {
        &self.utcb
    }

    #[inline]
    pub fn utcb_mut(&mut self) -> &mut Utcb {
        &mut self.utcb
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    #[inline]
    pub fn set_scheduled(&mut self, scheduled: bool) {
        self.scheduled = scheduled;
    }

    /// Issue a send: load the destination and flags system registers
    ///
    /// Primary MRs must already hold the message.
    pub fn send(&mut self, to: ThreadId, flags: u32) {
        self.context.set_system_arg(SYS_DEST, to.0);
        self.context.set_flags(flags);
        self.state = ThreadState::Sending { to };
        self.scheduled = true;
    }

    /// Block in receive: load the source and flags system registers
    pub fn receive(&mut self, from: RecvFrom, flags: u32) {
        self.context.set_system_arg(SYS_SOURCE, from.to_word());
        self.context.set_flags(flags);
        self.state = ThreadState::BlockedOnReceive { from };
        self.scheduled = false;
    }

    /// Copy the live primaries into the UTCB mirror (syscall-exit spill)
    pub fn mirror_primaries(&mut self) {
        let mrs = self.context.primaries();
        self.utcb.set_primaries(&mrs);
    }

    /// Stack the current tag/sender so a nested IPC can reuse the registers
    pub fn save_nested(&mut self) {
        self.utcb.write_primary(MR_TAG, self.context.tag());
        self.utcb.write_primary(MR_SENDER, self.context.sender());
        self.utcb.save_nested();
    }

    /// Unstack the tag/sender saved by [`save_nested`](Self::save_nested)
    pub fn restore_nested(&mut self) {
        self.utcb.restore_nested();
        self.context.set_tag(self.utcb.read_primary(MR_TAG));
        self.context.set_sender(self.utcb.read_primary(MR_SENDER));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_from_register_encoding() {
        assert_eq!(RecvFrom::from_word(ANYTHREAD), RecvFrom::AnyThread);
        assert_eq!(RecvFrom::from_word(4), RecvFrom::Thread(ThreadId(4)));
        assert_eq!(RecvFrom::Thread(ThreadId(4)).to_word(), 4);
        assert!(RecvFrom::AnyThread.accepts(ThreadId(9)));
        assert!(!RecvFrom::Thread(ThreadId(4)).accepts(ThreadId(9)));
    }

    #[test]
    fn send_and_receive_load_system_registers() {
        let mut tcb: Tcb = Tcb::new(ThreadId(1));
        tcb.send(ThreadId(2), 0x1);
        assert_eq!(tcb.context().system_arg(SYS_DEST), 2);
        assert_eq!(tcb.context().flags(), 0x1);
        assert_eq!(tcb.state(), ThreadState::Sending { to: ThreadId(2) });
        assert!(tcb.is_scheduled());

        tcb.receive(RecvFrom::AnyThread, 0);
        assert_eq!(tcb.context().system_arg(SYS_SOURCE), ANYTHREAD);
        assert_eq!(
            tcb.state(),
            ThreadState::BlockedOnReceive { from: RecvFrom::AnyThread }
        );
        assert!(!tcb.is_scheduled());
    }

    #[test]
    fn nested_save_restore_through_registers() {
        let mut tcb: Tcb = Tcb::new(ThreadId(1));
        tcb.context_mut().set_tag(0xA);
        tcb.context_mut().set_sender(3);
        tcb.save_nested();

        tcb.context_mut().set_tag(0xB);
        tcb.context_mut().set_sender(8);
        tcb.restore_nested();

        assert_eq!(tcb.context().tag(), 0xA);
        assert_eq!(tcb.context().sender(), 3);
        assert_eq!(tcb.utcb().saved_tag(), 0xA);
        assert_eq!(tcb.utcb().saved_sender(), 3);
    }

    #[test]
    fn mirror_copies_all_primaries() {
        let mut tcb: Tcb = Tcb::new(ThreadId(1));
        tcb.context_mut().set_primaries(&[1, 2, 3, 4, 5, 6]);
        tcb.mirror_primaries();
        assert_eq!(tcb.utcb().primaries(), &[1, 2, 3, 4, 5, 6]);
    }
}
