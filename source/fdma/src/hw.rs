//! Hardware seams and the register map of one FDMA instance.
//!
//! The driver core never touches memory-mapped registers directly. A platform
//! hands it a [`RegisterBus`] for register access, an [`LluPool`] for
//! DMA-coherent node memory, and a [`FwSource`] for the firmware image, along
//! with a [`FdmaConfig`] describing where everything lives. The same driver
//! body then serves any SoC revision whose offsets fit the [`RegLayout`]
//! table.
// Unusual groupings are used in binary literals in this file in order to
// separate the bits by which field they represent, rather than by their byte.
#![allow(clippy::unusual_byte_groupings)]

use core::{fmt, ptr::NonNull};

use mycelium_bitfield::{bitfield, enum_from_bits};
use serde::{Deserialize, Serialize};

use crate::{
    desc::LluNode,
    fw::{FwError, FwImage},
};

/// A 32-bit bus address as the engine sees it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u32 {
        self.0
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Register access to one FDMA instance.
///
/// Offsets are relative to the instance base; the platform owns the base
/// address, any address translation, and the memory barriers its bus needs.
pub trait RegisterBus: Sync {
    fn read(&self, offset: u32) -> u32;
    fn write(&self, offset: u32, value: u32);
}

/// DMA-coherent allocation of [`LluNode`]s.
///
/// Returned nodes must be 32-byte aligned, zeroed, and mapped uncached (or
/// kept coherent by the platform); `phys` is the bus address the engine will
/// use to fetch the node.
pub trait LluPool: Sync {
    fn alloc(&self) -> Option<(NonNull<LluNode>, PhysAddr)>;
    fn free(&self, node: NonNull<LluNode>, phys: PhysAddr);
}

/// Supplies the parsed firmware image.
///
/// Locating and parsing the firmware container is the platform's business;
/// the driver only validates and loads the parsed segments.
pub trait FwSource: Sync {
    fn firmware(&self) -> Result<FwImage, FwError>;
}

/// One contiguous window of engine-addressable memory.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemWindow {
    /// Bus address of the first byte.
    pub base: u32,
    /// Window length in bytes.
    pub len: u32,
}

impl MemWindow {
    /// Whether `[addr, addr + len)` lies entirely inside this window.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let Some(window_end) = self.base.checked_add(self.len) else {
            return false;
        };
        addr >= self.base && end <= window_end
    }
}

/// Register offsets of one FDMA instance, relative to its base.
///
/// Per-channel and per-request-line registers are described as a first
/// offset plus a stride.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegLayout {
    /// Engine identification register.
    pub id: u32,
    /// Firmware revision register; reads nonzero once the firmware runs.
    pub revision: u32,
    /// Clock gate register.
    pub clk_gate: u32,
    /// Bus bridge synchronization register.
    pub sync: u32,
    /// Engine enable register.
    pub enable: u32,
    /// Command mailbox set register.
    pub mbox_set: u32,
    /// Command mailbox clear register.
    pub mbox_clr: u32,
    /// Interrupt status register.
    pub int_status: u32,
    /// Interrupt clear register.
    pub int_clr: u32,
    /// Channel 0 command register.
    pub cmd_base: u32,
    /// Spacing between consecutive channel command registers.
    pub cmd_stride: u32,
    /// Channel 0 status register.
    pub status_base: u32,
    /// Spacing between consecutive channel status registers.
    pub status_stride: u32,
    /// Channel 0 transfer count register.
    pub count_base: u32,
    /// Spacing between consecutive channel count registers.
    pub count_stride: u32,
    /// Request line 0 control register.
    pub req_base: u32,
    /// Spacing between consecutive request line control registers.
    pub req_stride: u32,
    /// Data memory window.
    pub dmem: MemWindow,
    /// Instruction memory window.
    pub imem: MemWindow,
}

impl RegLayout {
    /// Command register of channel `id`.
    pub fn chan_cmd(&self, id: u8) -> u32 {
        self.cmd_base + u32::from(id) * self.cmd_stride
    }

    /// Status register of channel `id`.
    pub fn chan_status(&self, id: u8) -> u32 {
        self.status_base + u32::from(id) * self.status_stride
    }

    /// Transfer count register of channel `id`.
    pub fn chan_count(&self, id: u8) -> u32 {
        self.count_base + u32::from(id) * self.count_stride
    }

    /// Control register of request line `line`.
    pub fn req_ctrl(&self, line: u8) -> u32 {
        self.req_base + u32::from(line) * self.req_stride
    }
}

/// Platform description of one FDMA instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FdmaConfig {
    /// Register offsets of this instance.
    pub layout: RegLayout,
    /// Crossbar id to route request lines through, if this instance sits
    /// behind one.
    #[serde(default)]
    pub xbar: Option<u8>,
    /// Descriptors pre-allocated per channel at channel allocation time.
    #[serde(default = "FdmaConfig::default_prealloc")]
    pub prealloc_descriptors: usize,
}

impl FdmaConfig {
    const fn default_prealloc() -> usize {
        8
    }
}

enum_from_bits! {
    /// Channel state code in bits `[1:0]` of the status word.
    #[derive(Debug, Eq, PartialEq)]
    #[cfg_attr(test, derive(proptest_derive::Arbitrary))]
    pub enum HwState<u8> {
        /// No transfer in flight.
        Idle = 0b00,
        /// Start accepted, first node not yet fetched.
        Start = 0b01,
        Running = 0b10,
        Paused = 0b11,
    }
}

enum_from_bits! {
    /// Error code in bits `[4:2]` of the status word.
    #[derive(Debug, Eq, PartialEq)]
    #[cfg_attr(test, derive(proptest_derive::Arbitrary))]
    pub enum HwErrorCode<u8> {
        None = 0b000,
        ReadFault = 0b001,
        WriteFault = 0b010,
        BadNode = 0b011,
        Firmware = 0b100,
        /// The firmware believes a completion interrupt was lost.
        MissedIrq = 0b101,
        Watchdog = 0b110,
        Unknown = 0b111,
    }
}

bitfield! {
    /// A channel status word.
    ///
    /// Nodes are 32-byte aligned, so their bus addresses have five low bits
    /// to spare; the firmware packs the state and error codes into them and
    /// the current node address into the rest.
    pub struct StatusWord<u32> {
        /// Channel state code.
        pub const STATE: HwState;
        /// Latest error code, `None` when healthy.
        pub const ERROR: HwErrorCode;
        /// Bits `[31:5]` of the current node's bus address.
        pub const NODE = 27;
    }
}

impl StatusWord {
    /// Bus address of the node the channel is currently executing.
    pub fn node_phys(self) -> u32 {
        self.get(Self::NODE) << 5
    }
}

/// Command mailbox lane encodings.
///
/// The mailbox set and clear registers carry one two-bit lane per channel.
pub mod mbox {
    /// Start the channel, or switch it to a new command pointer.
    pub const START: u32 = 0b01;
    /// Toggle the channel's pause state.
    pub const PAUSE: u32 = 0b10;
    /// Flush and reset the channel.
    pub const FLUSH: u32 = 0b11;
    /// Width of one channel's lane.
    pub const MASK: u32 = 0b11;

    /// The mailbox word issuing `cmd` to channel `id`.
    pub fn cmd(id: u8, cmd: u32) -> u32 {
        cmd << (u32::from(id) * 2)
    }

    /// Channel `id`'s lane of a mailbox word.
    pub fn get(word: u32, id: u8) -> u32 {
        (word >> (u32::from(id) * 2)) & MASK
    }
}

/// Interrupt status bit positions.
///
/// The interrupt status and clear registers carry a completion bit and an
/// error bit per channel.
pub mod irq {
    /// Completion bit of channel `id`.
    pub fn done(id: u8) -> u32 {
        1 << (u32::from(id) * 2)
    }

    /// Error bit of channel `id`.
    pub fn err(id: u8) -> u32 {
        1 << (u32::from(id) * 2 + 1)
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn status_word_is_valid() {
        StatusWord::assert_valid();
    }

    proptest! {
        #[test]
        fn pack_status_word(state: HwState, error: HwErrorCode, node in 0u32..(1 << 27)) {
            let status = StatusWord::new()
                .with(StatusWord::STATE, state)
                .with(StatusWord::ERROR, error)
                .with(StatusWord::NODE, node);

            let mut manual = state as u32;
            manual |= (error as u32) << 2;
            manual |= node << 5;

            prop_assert_eq!(
                manual,
                status.bits(),
                "\n{:032b} (expected), vs:\n{}",
                manual,
                status
            );
            prop_assert_eq!(status.node_phys(), node << 5);
        }
    }

    #[test]
    fn window_bounds() {
        let window = MemWindow {
            base: 0x1000,
            len: 0x100,
        };
        assert!(window.contains(0x1000, 0x100));
        assert!(window.contains(0x10ff, 1));
        assert!(window.contains(0x1080, 0));
        assert!(!window.contains(0x0fff, 1));
        assert!(!window.contains(0x1100, 1));
        assert!(!window.contains(0x10ff, 2));
        assert!(!window.contains(u32::MAX, 1));

        let end_of_space = MemWindow {
            base: 0xffff_ff00,
            len: 0xff,
        };
        assert!(end_of_space.contains(0xffff_ff00, 0xff));
        assert!(!end_of_space.contains(0xffff_ff00, 0x100));
    }

    #[test]
    fn mbox_lanes() {
        let word = mbox::cmd(3, mbox::START) | mbox::cmd(7, mbox::FLUSH);
        assert_eq!(mbox::get(word, 3), mbox::START);
        assert_eq!(mbox::get(word, 7), mbox::FLUSH);
        assert_eq!(mbox::get(word, 0), 0);
        assert_eq!(mbox::get(word, 15), 0);
    }

    #[test]
    fn per_channel_offsets() {
        let layout = RegLayout {
            id: 0x0,
            revision: 0x4,
            clk_gate: 0x8,
            sync: 0xc,
            enable: 0x10,
            mbox_set: 0x20,
            mbox_clr: 0x24,
            int_status: 0x28,
            int_clr: 0x2c,
            cmd_base: 0x100,
            cmd_stride: 0x4,
            status_base: 0x200,
            status_stride: 0x4,
            count_base: 0x300,
            count_stride: 0x4,
            req_base: 0x400,
            req_stride: 0x4,
            dmem: MemWindow {
                base: 0x8000,
                len: 0x4000,
            },
            imem: MemWindow {
                base: 0xc000,
                len: 0x4000,
            },
        };
        assert_eq!(layout.chan_cmd(0), 0x100);
        assert_eq!(layout.chan_cmd(15), 0x13c);
        assert_eq!(layout.chan_status(2), 0x208);
        assert_eq!(layout.chan_count(2), 0x308);
        assert_eq!(layout.req_ctrl(31), 0x47c);
    }
}
