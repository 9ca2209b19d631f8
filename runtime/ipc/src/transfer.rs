//! Transfer Engine
//!
//! Moves one message from a sender to a receiver that have already
//! rendezvoused. The protocol is picked by the sender's flags word:
//!
//! - **Short**: MR0-MR5 only, register to register. Never touches memory
//!   outside the TCBs.
//! - **Full**: short copy, then the whole secondary MR array between the two
//!   UTCBs. Fixed size, never faults (UTCBs belong to live threads).
//! - **Extended**: short copy plus up to `IPC_EXTENDED_MAX_SIZE` bytes from
//!   the sender's buffer to the receiver's. Either buffer may be paged out.
//!
//! ## Phases
//!
//! ```text
//! Idle ──► Encoding(sender) ──► InFlight ──► Completed
//!               │                   │
//!               └───────────────────┴──────► Faulted
//! ```
//!
//! Descriptors and the rendezvous are checked in `Encoding`; nothing is
//! copied until `InFlight`, the only phase in which page faults are resolved.
//!
//! ## Extended copy
//!
//! The receiver must never see half a message. The sender's bytes are first
//! staged into a fixed kernel buffer one page at a time, then every
//! destination page is made resident, and only then are the payload and the
//! primaries written. A fault that cannot be resolved aborts the transfer
//! with the receiver untouched.

use log::{debug, trace, warn};

use crate::config::{SenderPolicy, TransferConfig, IPC_EXTENDED_MAX_SIZE};
use crate::error::{DescriptorError, IpcError, Result};
use crate::fault::{page_remaining, Direction, FaultHandler, Resolution, VirtualMemory};
use crate::flags::{with_error, ErrorCode, IpcType};
use crate::registers::{SyscallRegisters, Word, MR_SENDER};
use crate::tcb::{RecvFrom, Tcb, ThreadId, ThreadState};
use crate::utcb::UTCB_FULL_BUFFER_SIZE;

/// Phase of the IPC operation driven by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcPhase {
    /// No operation started yet
    Idle,
    /// Validating the sender's descriptor and the rendezvous
    Encoding { sender: ThreadId },
    /// Copying
    InFlight,
    /// Delivered
    Completed,
    /// Aborted; nothing was delivered
    Faulted,
}

impl IpcPhase {
    fn can_enter(self, next: IpcPhase) -> bool {
        use IpcPhase::*;
        matches!(
            (self, next),
            (Idle | Completed | Faulted, Encoding { .. })
                | (Encoding { .. }, InFlight | Faulted)
                | (InFlight, Completed | Faulted)
        )
    }
}

/// Successful delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Protocol used
    pub ipc_type: IpcType,
    /// Bytes moved beyond the primaries
    pub bytes: usize,
    /// Pages brought in by the fault handler
    pub pages_resolved: usize,
}

/// Result of one transfer
pub type TransferOutcome = Result<Completion>;

/// Source and destination of an extended payload
#[derive(Debug, Clone, Copy)]
struct ExtendedPlan {
    source: Word,
    dest: Word,
    size: usize,
}

/// Executes short/full/extended transfers
pub struct TransferEngine {
    config: TransferConfig,
    phase: IpcPhase,
    /// Kernel-side copy of an extended payload
    staging: [u8; IPC_EXTENDED_MAX_SIZE],
}

impl TransferEngine {
    pub const fn new(config: TransferConfig) -> Self {
        Self {
            config,
            phase: IpcPhase::Idle,
            staging: [0; IPC_EXTENDED_MAX_SIZE],
        }
    }

    #[inline]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Phase of the current or most recent operation
    #[inline]
    pub fn phase(&self) -> IpcPhase {
        self.phase
    }

    fn enter(&mut self, next: IpcPhase) {
        debug_assert!(
            self.phase.can_enter(next),
            "illegal IPC phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        trace!("ipc: phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    /// Deliver the sender's pending message to the receiver
    ///
    /// Both parties must be rendezvoused: the sender in `Sending { to }`
    /// addressed to the receiver, the receiver blocked in a receive that
    /// accepts the sender. On return both threads are runnable again and the
    /// sender's `MR_RETURN` and flags error nibble describe the outcome.
    ///
    /// # Errors
    /// - `Malformed` if a descriptor is invalid (nothing copied)
    /// - `NoIpc` if the parties are not rendezvoused (nothing copied)
    /// - `MemoryFault` if an extended buffer page cannot be resolved
    ///   (receiver payload and primaries untouched)
    pub fn transfer<R, V>(&mut self, vm: &mut V, sender: &mut Tcb<R>, receiver: &mut Tcb<R>) -> TransferOutcome
    where
        R: SyscallRegisters,
        V: VirtualMemory,
    {
        self.enter(IpcPhase::Encoding { sender: sender.tid() });

        let outcome = self.run(vm, sender, receiver);
        match &outcome {
            Ok(done) => {
                self.enter(IpcPhase::Completed);
                debug!(
                    "ipc: {} -> {} {} transfer complete ({} bytes, {} pages resolved)",
                    sender.tid(),
                    receiver.tid(),
                    done.ipc_type.name(),
                    done.bytes,
                    done.pages_resolved
                );
            }
            Err(err) => {
                self.enter(IpcPhase::Faulted);
                warn!("ipc: {} -> {} failed: {}", sender.tid(), receiver.tid(), err);
            }
        }

        Self::finish(sender, receiver, &outcome);
        outcome
    }

    fn run<R, V>(&mut self, vm: &mut V, sender: &mut Tcb<R>, receiver: &mut Tcb<R>) -> TransferOutcome
    where
        R: SyscallRegisters,
        V: VirtualMemory,
    {
        let ipc_type = IpcType::decode(sender.context().flags())?;
        Self::check_rendezvous(sender, receiver)?;

        // Zero-size extended behaves exactly like short
        let plan = match ipc_type {
            IpcType::Extended(ext) if ext.size() > 0 => {
                Some(Self::plan_extended(sender, receiver, ext.size(), ext.index())?)
            }
            _ => None,
        };

        self.enter(IpcPhase::InFlight);

        let mut completion = Completion {
            ipc_type,
            bytes: 0,
            pages_resolved: 0,
        };

        match plan {
            Some(plan) => {
                let mut pager = FaultHandler::new(vm, sender.tid(), receiver.tid());
                self.stage(&mut pager, &plan)?;
                Self::probe(&mut pager, &plan)?;
                self.commit(&mut pager, &plan)?;
                completion.bytes = plan.size;
                completion.pages_resolved = pager.pages_resolved();

                Self::copy_primaries(sender, receiver);
            }
            None => {
                Self::copy_primaries(sender, receiver);
                if ipc_type == IpcType::Full {
                    let rest = *sender.utcb().rest();
                    *receiver.utcb_mut().rest_mut() = rest;
                    completion.bytes = UTCB_FULL_BUFFER_SIZE;
                }
            }
        }

        self.deliver_sender_id(sender.tid(), receiver);
        Ok(completion)
    }

    fn check_rendezvous<R: SyscallRegisters>(sender: &Tcb<R>, receiver: &Tcb<R>) -> Result<()> {
        let addressed = matches!(
            sender.state(),
            ThreadState::Sending { to } if to == receiver.tid()
        );
        let waiting = matches!(
            receiver.state(),
            ThreadState::BlockedOnReceive { from } if from.accepts(sender.tid())
        );

        if addressed && waiting {
            Ok(())
        } else {
            warn!(
                "ipc: no rendezvous between {} ({:?}) and {} ({:?})",
                sender.tid(),
                sender.state(),
                receiver.tid(),
                receiver.state()
            );
            Err(IpcError::NoIpc)
        }
    }

    fn plan_extended<R: SyscallRegisters>(
        sender: &Tcb<R>,
        receiver: &Tcb<R>,
        size: usize,
        index: usize,
    ) -> Result<ExtendedPlan> {
        let (capacity, recv_index) = match IpcType::decode(receiver.context().flags())? {
            IpcType::Extended(ext) => (ext.size(), ext.index()),
            other => {
                warn!(
                    "ipc: {} posted a {} receive for an extended send",
                    receiver.tid(),
                    other.name()
                );
                return Err(IpcError::NoIpc);
            }
        };
        if size > capacity {
            return Err(DescriptorError::ReceiverTooSmall { size, capacity }.into());
        }

        // Read before the primaries are overwritten by the copy
        let source = sender.context().primary(index);
        let dest = receiver.context().primary(recv_index);
        for address in [source, dest] {
            if address.checked_add((size - 1) as Word).is_none() {
                return Err(DescriptorError::AddressWrap { address, size }.into());
            }
        }

        Ok(ExtendedPlan { source, dest, size })
    }

    fn fault_in<V: VirtualMemory>(
        pager: &mut FaultHandler<'_, V>,
        address: Word,
        direction: Direction,
    ) -> Result<()> {
        match pager.resolve(address, direction) {
            Resolution::Resolved => Ok(()),
            Resolution::Unresolvable(cause) => Err(IpcError::MemoryFault {
                address,
                direction,
                cause,
            }),
        }
    }

    /// Copy the sender's buffer into the staging area, page by page
    fn stage<V: VirtualMemory>(&mut self, pager: &mut FaultHandler<'_, V>, plan: &ExtendedPlan) -> Result<()> {
        let mut offset = 0;
        while offset < plan.size {
            let address = plan.source + offset as Word;
            let len = page_remaining(address).min(plan.size - offset);
            match pager.read(address, &mut self.staging[offset..offset + len]) {
                Ok(()) => offset += len,
                Err(miss) => Self::fault_in(pager, miss.address, Direction::SenderRead)?,
            }
        }
        Ok(())
    }

    /// Make every destination page resident before writing any of them
    fn probe<V: VirtualMemory>(pager: &mut FaultHandler<'_, V>, plan: &ExtendedPlan) -> Result<()> {
        let mut offset = 0;
        while offset < plan.size {
            let address = plan.dest + offset as Word;
            if pager.is_resident(address, Direction::ReceiverWrite) {
                offset += page_remaining(address).min(plan.size - offset);
            } else {
                Self::fault_in(pager, address, Direction::ReceiverWrite)?;
            }
        }
        Ok(())
    }

    /// Write the staged payload into the (now resident) receiver buffer
    fn commit<V: VirtualMemory>(&self, pager: &mut FaultHandler<'_, V>, plan: &ExtendedPlan) -> Result<()> {
        let mut offset = 0;
        while offset < plan.size {
            let address = plan.dest + offset as Word;
            let len = page_remaining(address).min(plan.size - offset);
            match pager.write(address, &self.staging[offset..offset + len]) {
                Ok(()) => offset += len,
                // Probed pages stay resident while the pair is locked
                Err(miss) => Self::fault_in(pager, miss.address, Direction::ReceiverWrite)?,
            }
        }
        Ok(())
    }

    fn copy_primaries<R: SyscallRegisters>(sender: &Tcb<R>, receiver: &mut Tcb<R>) {
        let mrs = sender.context().primaries();
        receiver.context_mut().set_primaries(&mrs);
        if !receiver.is_scheduled() {
            receiver.utcb_mut().set_primaries(&mrs);
        }
    }

    fn deliver_sender_id<R: SyscallRegisters>(&self, sender: ThreadId, receiver: &mut Tcb<R>) {
        let anythread = matches!(
            receiver.state(),
            ThreadState::BlockedOnReceive { from: RecvFrom::AnyThread }
        );
        let overwrite = match self.config.sender_policy {
            SenderPolicy::AnyThreadOnly => anythread,
            SenderPolicy::Always => true,
            SenderPolicy::Never => false,
        };

        if overwrite {
            receiver.context_mut().set_sender(sender.as_word());
            if !receiver.is_scheduled() {
                receiver.utcb_mut().write_primary(MR_SENDER, sender.as_word());
            }
        }
    }

    /// Report the outcome and release both parties
    fn finish<R: SyscallRegisters>(sender: &mut Tcb<R>, receiver: &mut Tcb<R>, outcome: &TransferOutcome) {
        let code = outcome.as_ref().err().map(IpcError::code);

        let flags = with_error(sender.context().flags(), code);
        sender.context_mut().set_flags(flags);
        sender.context_mut().set_return_value(code.map_or(0, ErrorCode::nibble));
        sender.set_state(resumed(sender.is_scheduled()));

        // Descriptor and sequencing errors never reached the receiver
        let reached_receiver = matches!(outcome, Ok(_) | Err(IpcError::MemoryFault { .. }));
        if reached_receiver {
            let flags = with_error(receiver.context().flags(), code);
            receiver.context_mut().set_flags(flags);
            receiver.set_state(resumed(receiver.is_scheduled()));
        }
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}

fn resumed(scheduled: bool) -> ThreadState {
    if scheduled {
        ThreadState::Running
    } else {
        ThreadState::Runnable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::flags::{decode_error, IPC_FLAGS_FULL, IPC_FLAGS_SHORT};
    use crate::mock::MockMemory;
    use crate::registers::RegisterFile;

    const A: ThreadId = ThreadId(10);
    const B: ThreadId = ThreadId(20);
    const C: ThreadId = ThreadId(30);

    fn pair(flags: u32, from: RecvFrom, recv_flags: u32) -> (Tcb, Tcb) {
        let mut sender: Tcb<RegisterFile> = Tcb::new(A);
        let mut receiver: Tcb<RegisterFile> = Tcb::new(B);
        sender.context_mut().set_primaries(&[0x42, 0, 1, 2, 3, 4]);
        sender.send(B, flags);
        receiver.receive(from, recv_flags);
        (sender, receiver)
    }

    #[test]
    fn phases_follow_state_machine() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        assert_eq!(engine.phase(), IpcPhase::Idle);

        let (mut s, mut r) = pair(IPC_FLAGS_SHORT, RecvFrom::AnyThread, 0);
        engine.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(engine.phase(), IpcPhase::Completed);

        let (mut s, mut r) = pair(0x3, RecvFrom::AnyThread, 0);
        assert!(engine.transfer(&mut vm, &mut s, &mut r).is_err());
        assert_eq!(engine.phase(), IpcPhase::Faulted);
    }

    #[test]
    fn phase_transitions() {
        let encoding = IpcPhase::Encoding { sender: A };
        assert!(IpcPhase::Idle.can_enter(encoding));
        assert!(encoding.can_enter(IpcPhase::InFlight));
        assert!(encoding.can_enter(IpcPhase::Faulted));
        assert!(!encoding.can_enter(IpcPhase::Completed));
        assert!(!IpcPhase::Idle.can_enter(IpcPhase::InFlight));
        assert!(IpcPhase::InFlight.can_enter(IpcPhase::Completed));
    }

    #[test]
    fn directed_receive_from_other_thread_is_sequencing_fault() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let (mut s, mut r) = pair(IPC_FLAGS_SHORT, RecvFrom::Thread(C), 0);

        assert_eq!(engine.transfer(&mut vm, &mut s, &mut r), Err(IpcError::NoIpc));
        assert_eq!(decode_error(s.context().flags()), Some(ErrorCode::NoIpc));
        assert_eq!(s.context().return_value(), ErrorCode::NoIpc.nibble());
        // Receiver keeps waiting, untouched
        assert_eq!(
            r.state(),
            ThreadState::BlockedOnReceive { from: RecvFrom::Thread(C) }
        );
        assert_eq!(r.context().primaries(), [0; 6]);
    }

    #[test]
    fn receiver_not_blocked_is_sequencing_fault() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let (mut s, _) = pair(IPC_FLAGS_SHORT, RecvFrom::AnyThread, 0);
        let mut idle: Tcb = Tcb::new(B);

        assert_eq!(engine.transfer(&mut vm, &mut s, &mut idle), Err(IpcError::NoIpc));
        assert_eq!(idle.state(), ThreadState::Inactive);
    }

    #[test]
    fn directed_receive_keeps_sender_slot_as_payload() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let (mut s, mut r) = pair(IPC_FLAGS_SHORT, RecvFrom::Thread(A), 0);
        s.context_mut().set_sender(0xDEAD);

        engine.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(r.context().sender(), 0xDEAD);
    }

    #[test]
    fn sender_policy_always_and_never() {
        let mut vm = MockMemory::new();

        let mut always = TransferEngine::new(TransferConfig::with_sender_policy(SenderPolicy::Always));
        let (mut s, mut r) = pair(IPC_FLAGS_SHORT, RecvFrom::Thread(A), 0);
        always.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(r.context().sender(), A.as_word());

        let mut never = TransferEngine::new(TransferConfig::with_sender_policy(SenderPolicy::Never));
        let (mut s, mut r) = pair(IPC_FLAGS_SHORT, RecvFrom::AnyThread, 0);
        never.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(r.context().sender(), 0);
    }

    #[test]
    fn scheduled_receiver_gets_registers_only() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let (mut s, mut r) = pair(IPC_FLAGS_SHORT, RecvFrom::AnyThread, 0);
        r.set_scheduled(true);

        engine.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(r.context().tag(), 0x42);
        assert_eq!(r.utcb().primaries(), &[0; 6]);
        assert_eq!(r.state(), ThreadState::Running);
    }

    #[test]
    fn descheduled_receiver_gets_region_mirror() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let (mut s, mut r) = pair(IPC_FLAGS_SHORT, RecvFrom::AnyThread, 0);

        engine.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(r.utcb().primaries(), &[0x42, A.as_word(), 1, 2, 3, 4]);
        assert_eq!(r.state(), ThreadState::Runnable);
        assert_eq!(s.state(), ThreadState::Running);
    }

    #[test]
    fn full_reports_buffer_size() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let (mut s, mut r) = pair(IPC_FLAGS_FULL, RecvFrom::AnyThread, 0);

        let done = engine.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(done.ipc_type, IpcType::Full);
        assert_eq!(done.bytes, UTCB_FULL_BUFFER_SIZE);
    }

    #[test]
    fn extended_to_short_receiver_is_sequencing_fault() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let flags = IpcType::extended(16, 2).unwrap().encode();
        let (mut s, mut r) = pair(flags, RecvFrom::AnyThread, IPC_FLAGS_SHORT);

        assert_eq!(engine.transfer(&mut vm, &mut s, &mut r), Err(IpcError::NoIpc));
    }

    #[test]
    fn extended_larger_than_receiver_buffer_is_malformed() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let flags = IpcType::extended(64, 2).unwrap().encode();
        let recv_flags = IpcType::extended(32, 2).unwrap().encode();
        let (mut s, mut r) = pair(flags, RecvFrom::AnyThread, recv_flags);

        assert_eq!(
            engine.transfer(&mut vm, &mut s, &mut r),
            Err(IpcError::Malformed(DescriptorError::ReceiverTooSmall {
                size: 64,
                capacity: 32
            }))
        );
        assert_eq!(decode_error(s.context().flags()), Some(ErrorCode::Invalid));
    }

    #[test]
    fn extended_buffer_crossing_a_page_boundary() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let src = 0x1000 + PAGE_SIZE as Word - 8;
        let dst = 0x9000 + PAGE_SIZE as Word - 3;
        vm.map(A, src, 32);
        vm.map(B, dst, 32);
        let payload: [u8; 32] = core::array::from_fn(|i| i as u8 + 1);
        vm.fill(A, src, &payload);

        let flags = IpcType::extended(32, 2).unwrap().encode();
        let recv_flags = IpcType::extended(64, 3).unwrap().encode();
        let (mut s, mut r) = pair(flags, RecvFrom::AnyThread, recv_flags);
        s.context_mut().set_primary(2, src);
        r.context_mut().set_primary(3, dst);

        let done = engine.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(done.bytes, 32);
        assert_eq!(done.pages_resolved, 0);
        assert_eq!(vm.bytes(B, dst, 32), payload.to_vec());
    }

    #[test]
    fn sender_page_fault_resolved_mid_copy() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        let src = 0x2000 + PAGE_SIZE as Word - 4;
        vm.map(A, src, 4);
        vm.map_swapped(A, 0x3000, 4);
        vm.fill(A, src, &[1, 2, 3, 4, 5, 6, 7, 8]);
        vm.map(B, 0x8000, 8);

        let flags = IpcType::extended(8, 4).unwrap().encode();
        let recv_flags = IpcType::extended(8, 4).unwrap().encode();
        let (mut s, mut r) = pair(flags, RecvFrom::AnyThread, recv_flags);
        s.context_mut().set_primary(4, src);
        r.context_mut().set_primary(4, 0x8000);

        let done = engine.transfer(&mut vm, &mut s, &mut r).unwrap();
        assert_eq!(done.pages_resolved, 1);
        assert_eq!(vm.resolutions().len(), 1);
        assert_eq!(vm.resolutions()[0].address, 0x3000);
        assert_eq!(vm.resolutions()[0].direction, Direction::SenderRead);
        assert_eq!(vm.bytes(B, 0x8000, 8), std::vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn unresolvable_sender_page_leaves_receiver_untouched() {
        let mut engine = TransferEngine::default();
        let mut vm = MockMemory::new();
        vm.map_unresolvable(A, 0x5000, 16);
        vm.map(B, 0x8000, 16);

        let flags = IpcType::extended(16, 2).unwrap().encode();
        let (mut s, mut r) = pair(flags, RecvFrom::AnyThread, flags);
        s.context_mut().set_primary(2, 0x5000);
        r.context_mut().set_primary(2, 0x8000);
        let before = r.context().primaries();

        let err = engine.transfer(&mut vm, &mut s, &mut r).unwrap_err();
        assert!(matches!(
            err,
            IpcError::MemoryFault { address: 0x5000, direction: Direction::SenderRead, .. }
        ));
        assert_eq!(r.context().primaries(), before);
        assert_eq!(decode_error(r.context().flags()), Some(ErrorCode::Fault));
        assert_eq!(r.state(), ThreadState::Runnable);
    }
}
