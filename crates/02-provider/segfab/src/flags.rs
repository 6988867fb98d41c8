//! Capability and operation flag bits.
//!
//! Capabilities, completion flags and per-operation flags share one 64-bit
//! space, as they do in the fabric interface this provider implements.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Flags: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const TAGGED = 1 << 3;
        const ATOMIC = 1 << 4;
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
        const MULTI_RECV = 1 << 16;
        const REMOTE_CQ_DATA = 1 << 17;
        const MORE = 1 << 18;
        const PEEK = 1 << 19;
        const COMPLETION = 1 << 24;
        const INJECT = 1 << 25;
        const SOURCE = 1 << 57;
    }
}

impl Flags {
    /// Alias used when binding queues to the transmit side.
    pub const TRANSMIT: Flags = Flags::SEND;
}

/// Two-sided messaging capabilities.
pub const MSG_CAPS: Flags = Flags::MSG.union(Flags::RECV).union(Flags::SEND);
/// One-sided RMA capabilities.
pub const RMA_CAPS: Flags = Flags::RMA
    .union(Flags::READ)
    .union(Flags::WRITE)
    .union(Flags::REMOTE_READ)
    .union(Flags::REMOTE_WRITE);
/// Everything a connected (MSG) endpoint supports.
pub const EP_MSG_CAPS: Flags = MSG_CAPS.union(RMA_CAPS);
/// Everything a connectionless (RDM) endpoint supports.
pub const EP_RDM_CAPS: Flags = RMA_CAPS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_caps() {
        assert!(EP_MSG_CAPS.contains(Flags::SEND | Flags::REMOTE_WRITE));
        assert!(!EP_RDM_CAPS.intersects(Flags::SEND));
        assert_eq!(EP_MSG_CAPS.difference(MSG_CAPS), RMA_CAPS);
    }

    #[test]
    fn unknown_bits_survive_and_fail_capability_checks() {
        let hints = Flags::MSG | Flags::from_bits_retain(1 << 40);
        assert_eq!(hints.bits(), (1 << 1) | (1 << 40));
        assert!(!EP_MSG_CAPS.contains(hints));
        assert_eq!(Flags::default(), Flags::empty());
    }
}
