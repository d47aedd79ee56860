// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Access statuses and the rules for merging them.
//!
//! A physical access that crosses several pages and handler intervals
//! produces one status per sub-range. The overall result is the worst of
//! them under a fixed total order, so that informational outcomes (pending
//! shadow table sync, deferred MMIO commits, ...) are never silently
//! dropped by a later successful sub-range.

/// Informational outcome of a guest physical memory access.
///
/// These are successes: the access itself completed (or must be completed
/// by the caller at a less restricted execution context). Hard failures are
/// reported through [`crate::Error`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    /// Access fully completed, nothing else to do.
    Ok,
    /// Access completed, but the shadow/nested paging structures need to be
    /// resynchronized before guest execution resumes.
    ShadowSyncPending,
    /// The read must be redispatched to the device emulation thread.
    RedispatchRead,
    /// The write must be redispatched to the device emulation thread.
    RedispatchWrite,
    /// The write was accepted but must be committed by the caller.
    CommitWrite,
    /// A debug event was hit; the VM should stop for the debugger.
    DebugStop,
    /// The access cannot be serviced here; emulate the current instruction.
    EmulateInstruction,
}

impl AccessStatus {
    /// Merge precedence. Higher wins when statuses are combined across
    /// sub-ranges of one access.
    fn priority(self) -> u32 {
        match self {
            AccessStatus::Ok => 0,
            AccessStatus::ShadowSyncPending => 1,
            AccessStatus::RedispatchRead => 2,
            AccessStatus::RedispatchWrite => 3,
            AccessStatus::CommitWrite => 4,
            AccessStatus::DebugStop => 5,
            AccessStatus::EmulateInstruction => 6,
        }
    }

    /// Combine the status of one sub-range with the accumulated status of
    /// the whole access. Merging with `Ok` never changes the other operand.
    pub fn merge(self, other: AccessStatus) -> AccessStatus {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }

    /// Whether a handler may legally return this status from a read
    /// callback. Anything outside this list is a handler bug.
    pub fn valid_for_read(self) -> bool {
        matches!(
            self,
            AccessStatus::Ok
                | AccessStatus::RedispatchRead
                | AccessStatus::DebugStop
                | AccessStatus::EmulateInstruction
        )
    }

    /// Whether a handler may legally return this status from a write
    /// callback.
    pub fn valid_for_write(self) -> bool {
        matches!(
            self,
            AccessStatus::Ok
                | AccessStatus::RedispatchWrite
                | AccessStatus::CommitWrite
                | AccessStatus::DebugStop
                | AccessStatus::EmulateInstruction
        )
    }

    /// True for statuses the caller must act on before resuming the guest.
    pub fn is_deferred(self) -> bool {
        self != AccessStatus::Ok
    }

    /// True for statuses that cut a multi-page access short: the copy loop
    /// stops at the sub-range that produced them instead of continuing.
    pub fn interrupts_access(self) -> bool {
        !matches!(self, AccessStatus::Ok | AccessStatus::ShadowSyncPending)
    }
}

/// What a registered access handler decided to do with an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler did not consume the access; perform the plain copy.
    UseDefault,
    /// The handler consumed the access with the given status.
    Done(AccessStatus),
}

/// Origin of a physical access.
///
/// The origin decides whether deferred statuses can be tolerated: the
/// hardware-execution fast path cannot unwind with an informational status
/// and must get a hard error before any handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOrigin {
    /// Hardware-assisted execution exit fast path.
    Hm,
    /// The instruction emulator.
    Emulator,
    /// A device model.
    Device,
    /// DMA on behalf of a device.
    Dma,
    /// The debugger.
    Debugger,
}

impl AccessOrigin {
    /// Whether the calling context can act on deferred statuses. When it
    /// cannot, hitting a handler is reported as a hard error and the caller
    /// re-dispatches the access from a friendlier context.
    pub fn tolerates_deferred_status(self) -> bool {
        !matches!(self, AccessOrigin::Hm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [AccessStatus; 7] = [
        AccessStatus::Ok,
        AccessStatus::ShadowSyncPending,
        AccessStatus::RedispatchRead,
        AccessStatus::RedispatchWrite,
        AccessStatus::CommitWrite,
        AccessStatus::DebugStop,
        AccessStatus::EmulateInstruction,
    ];

    #[test]
    fn merge_with_ok_is_identity() {
        for s in ALL {
            assert_eq!(AccessStatus::Ok.merge(s), s);
            assert_eq!(s.merge(AccessStatus::Ok), s);
        }
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        for a in ALL {
            assert_eq!(a.merge(a), a);
            for b in ALL {
                assert_eq!(a.merge(b), b.merge(a));
            }
        }
    }

    #[test]
    fn merge_is_associative() {
        for a in ALL {
            for b in ALL {
                for c in ALL {
                    assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
                }
            }
        }
    }

    #[test]
    fn worst_status_wins() {
        assert_eq!(
            AccessStatus::ShadowSyncPending.merge(AccessStatus::EmulateInstruction),
            AccessStatus::EmulateInstruction
        );
        assert_eq!(
            AccessStatus::CommitWrite.merge(AccessStatus::RedispatchWrite),
            AccessStatus::CommitWrite
        );
    }

    #[test]
    fn sync_statuses_do_not_interrupt() {
        assert!(!AccessStatus::Ok.interrupts_access());
        assert!(!AccessStatus::ShadowSyncPending.interrupts_access());
        assert!(AccessStatus::DebugStop.interrupts_access());
        assert!(AccessStatus::EmulateInstruction.interrupts_access());
    }

    #[test]
    fn allow_lists_are_direction_specific() {
        assert!(AccessStatus::RedispatchRead.valid_for_read());
        assert!(!AccessStatus::RedispatchRead.valid_for_write());
        assert!(AccessStatus::CommitWrite.valid_for_write());
        assert!(!AccessStatus::CommitWrite.valid_for_read());
    }

    #[test]
    fn hm_origin_is_restricted() {
        assert!(!AccessOrigin::Hm.tolerates_deferred_status());
        assert!(AccessOrigin::Emulator.tolerates_deferred_status());
        assert!(AccessOrigin::Dma.tolerates_deferred_status());
    }
}
