//! Transfer [`Descriptor`]s and the linked-list units the engine executes.
// Unusual groupings are used in binary literals in this file in order to
// separate the bits by which field they represent, rather than by their byte.
#![allow(clippy::unusual_byte_groupings)]

use core::{iter, ptr::NonNull};

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use mycelium_bitfield::bitfield;

use crate::{
    channel::{Completion, Cookie, Direction, SlaveConfig},
    hw::{LluPool, PhysAddr},
};

/// One hardware-readable linked-list unit (LLU).
///
/// The engine's firmware walks chains of these in DMA-coherent memory. A node
/// is 1-D when `line_len == nbytes`; otherwise the engine moves `line_len`
/// bytes at a time, advancing each side by its stride between lines. The
/// 32-byte alignment keeps the low five bits of a node's bus address clear,
/// which the channel status word reuses for its state and error codes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C, align(32))]
pub struct LluNode {
    /// Bus address of the next node; 0 terminates the chain.
    pub next: u32,
    /// Packed [`LluControl`] word.
    pub control: u32,
    /// Total bytes moved by this node.
    pub nbytes: u32,
    /// Source bus address.
    pub saddr: u32,
    /// Destination bus address.
    pub daddr: u32,
    /// Bytes per line.
    pub line_len: u32,
    /// Source stride between lines.
    pub sstride: u32,
    /// Destination stride between lines.
    pub dstride: u32,
}

impl LluNode {
    pub const fn zeroed() -> Self {
        Self {
            next: 0,
            control: 0,
            nbytes: 0,
            saddr: 0,
            daddr: 0,
            line_len: 0,
            sstride: 0,
            dstride: 0,
        }
    }
}

bitfield! {
    /// The control word of an [`LluNode`].
    pub struct LluControl<u32> {
        /// Request line pacing this node, [`LluControl::FREE_RUN`] if unpaced.
        pub const REQ_MAP = 5;
        /// Advance the source address as the node progresses.
        pub const SRC_INCR: bool;
        const _RESERVED_0 = 1;
        /// Advance the destination address as the node progresses.
        pub const DST_INCR: bool;
        const _RESERVED_1 = 22;
        /// Halt the channel once this node completes.
        pub const PAUSE: bool;
        /// Raise the completion interrupt once this node completes.
        pub const IRQ: bool;
    }
}

impl LluControl {
    /// `REQ_MAP` value for a free-running (unpaced) node.
    pub const FREE_RUN: u32 = 0b11111;
}

/// Completion callback attached to a descriptor chain.
pub type CompletionFn = Box<dyn FnMut(Completion) + Send>;

/// A host-side transfer descriptor owning one coherent [`LluNode`].
///
/// A descriptor carries the rest of its chain as `children`; the whole chain
/// represents one logical transfer and is submitted, completed, and recycled
/// as a unit. At any time a descriptor belongs to exactly one of its channel's
/// free, queued, or active lists, or to the channel's parked slot.
pub struct Descriptor {
    node: NonNull<LluNode>,
    phys: PhysAddr,
    /// Shadow of the node's byte count, readable without touching coherent
    /// memory.
    nbytes: u32,
    children: Vec<Descriptor>,
    callback: Option<CompletionFn>,
    cookie: Option<Cookie>,
    acked: bool,
    cyclic: bool,
}

// The coherent node is owned by the platform pool and only touched while
// holding the owning channel's lock.
unsafe impl Send for Descriptor {}

impl Descriptor {
    pub(crate) fn new(node: NonNull<LluNode>, phys: PhysAddr) -> Self {
        Self {
            node,
            phys,
            nbytes: 0,
            children: Vec::new(),
            callback: None,
            cookie: None,
            acked: true,
            cyclic: false,
        }
    }

    /// Bus address of this descriptor's node.
    pub(crate) fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Bytes moved by this node alone (not counting children).
    pub(crate) fn nbytes(&self) -> u32 {
        self.nbytes
    }

    /// Bytes moved by the whole chain.
    pub(crate) fn total_bytes(&self) -> u32 {
        self.nodes().map(Self::nbytes).sum()
    }

    pub(crate) fn cookie(&self) -> Option<Cookie> {
        self.cookie
    }

    pub(crate) fn set_cookie(&mut self, cookie: Cookie) {
        self.cookie = Some(cookie);
    }

    pub(crate) fn take_callback(&mut self) -> Option<CompletionFn> {
        self.callback.take()
    }

    pub(crate) fn set_callback(&mut self, callback: CompletionFn) {
        self.callback = Some(callback);
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub(crate) fn acked(&self) -> bool {
        self.acked
    }

    pub(crate) fn set_acked(&mut self, acked: bool) {
        self.acked = acked;
    }

    pub(crate) fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    pub(crate) fn set_cyclic(&mut self, cyclic: bool) {
        self.cyclic = cyclic;
    }

    /// Reads the node payload back from coherent memory.
    pub(crate) fn read_node(&self) -> LluNode {
        unsafe { self.node.as_ptr().read_volatile() }
    }

    /// Writes the node payload out to coherent memory.
    pub(crate) fn program(&mut self, node: LluNode) {
        self.nbytes = node.nbytes;
        unsafe { self.node.as_ptr().write_volatile(node) }
    }

    /// Points this node's hardware link at `next`.
    pub(crate) fn set_next(&mut self, next: u32) {
        unsafe { core::ptr::addr_of_mut!((*self.node.as_ptr()).next).write_volatile(next) }
    }

    /// Reads this node's hardware link back from coherent memory.
    pub(crate) fn next_phys(&self) -> u32 {
        unsafe { core::ptr::addr_of!((*self.node.as_ptr()).next).read_volatile() }
    }

    /// Clears the node payload, callback, and cookie before reuse.
    pub(crate) fn recycle(&mut self) {
        self.program(LluNode::zeroed());
        self.callback = None;
        self.cookie = None;
        self.cyclic = false;
    }

    /// Chain-order iterator over this descriptor and its children.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Descriptor> + '_ {
        iter::once(self).chain(self.children.iter())
    }

    /// Returns the coherent node(s) of this chain to the platform pool.
    pub(crate) fn release(mut self, pool: &dyn LluPool) {
        for child in self.children.drain(..) {
            child.release(pool);
        }
        pool.free(self.node, self.phys);
    }
}

/// A channel's recycling list of acknowledged descriptors.
#[derive(Default)]
pub(crate) struct FreeList {
    list: VecDeque<Box<Descriptor>>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            list: VecDeque::new(),
        }
    }

    /// Splices a chain's children plus the chain head onto the list.
    pub(crate) fn put(&mut self, mut desc: Box<Descriptor>) {
        for mut child in desc.children.drain(..) {
            child.set_acked(true);
            self.list.push_back(Box::new(child));
        }
        desc.set_acked(true);
        self.list.push_back(desc);
    }

    /// Pops an acknowledged descriptor.
    ///
    /// Unacknowledged entries are skipped and retained: a stale completion
    /// handle may still reference them.
    pub(crate) fn pop(&mut self) -> Option<Box<Descriptor>> {
        for _ in 0..self.list.len() {
            let desc = self.list.pop_front()?;
            if desc.acked() {
                return Some(desc);
            }
            self.list.push_back(desc);
        }
        None
    }

    /// Adds a freshly allocated descriptor.
    pub(crate) fn push(&mut self, desc: Box<Descriptor>) {
        self.list.push_back(desc);
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Box<Descriptor>> + '_ {
        self.list.drain(..)
    }
}

/// Assembles fetched descriptors into one hardware-linked chain.
///
/// Each pushed descriptor becomes a child of the first one; the previous
/// tail's hardware link is pointed at the newcomer as it arrives.
pub(crate) struct ChainAssembler {
    head: Option<Box<Descriptor>>,
}

impl ChainAssembler {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    /// Appends `desc` to the chain, updating the previous tail's link.
    pub(crate) fn push(&mut self, mut desc: Box<Descriptor>) {
        desc.set_next(0);
        match self.head.as_mut() {
            None => self.head = Some(desc),
            Some(head) => {
                let phys = desc.phys().addr();
                match head.children.last_mut() {
                    Some(tail) => tail.set_next(phys),
                    None => head.set_next(phys),
                }
                head.children.push(*desc);
            }
        }
    }

    /// Points the tail's hardware link back at the head, closing a ring.
    pub(crate) fn close_ring(&mut self) {
        if let Some(head) = self.head.as_mut() {
            let phys = head.phys().addr();
            match head.children.last_mut() {
                Some(tail) => tail.set_next(phys),
                None => head.set_next(phys),
            }
        }
    }

    pub(crate) fn finish(self) -> Option<Box<Descriptor>> {
        self.head
    }
}

/// Node constructors for the prepared transfer shapes.
pub(crate) mod build {
    use super::*;

    /// A free-running 1-D copy node.
    pub(crate) fn copy_node(dst: u32, src: u32, len: u32) -> LluNode {
        let control = LluControl::new()
            .with(LluControl::REQ_MAP, LluControl::FREE_RUN)
            .with(LluControl::SRC_INCR, true)
            .with(LluControl::DST_INCR, true);
        LluNode {
            next: 0,
            control: control.bits(),
            nbytes: len,
            saddr: src,
            daddr: dst,
            line_len: len,
            sstride: 0,
            dstride: 0,
        }
    }

    /// A paced 1-D node moving `len` bytes between `buf` and the slave's
    /// device address.
    pub(crate) fn slave_node(slave: &SlaveConfig, line: u8, buf: u32, len: u32) -> LluNode {
        let control = LluControl::new().with(LluControl::REQ_MAP, u32::from(line));
        let (control, saddr, daddr) = match slave.direction {
            Direction::MemToDev => (
                control.with(LluControl::SRC_INCR, true),
                buf,
                slave.addr,
            ),
            Direction::DevToMem => (
                control.with(LluControl::DST_INCR, true),
                slave.addr,
                buf,
            ),
        };
        LluNode {
            next: 0,
            control: control.bits(),
            nbytes: len,
            saddr,
            daddr,
            line_len: len,
            sstride: 0,
            dstride: 0,
        }
    }

    /// A paced 2-D node moving `width` bytes out of each of `lines`
    /// consecutive frames of `frame_len` bytes.
    pub(crate) fn strided_node(
        slave: &SlaveConfig,
        line: u8,
        buf: u32,
        width: u32,
        lines: u32,
        frame_len: u32,
    ) -> LluNode {
        let mut node = slave_node(slave, line, buf, width * lines);
        node.line_len = width;
        match slave.direction {
            Direction::MemToDev => node.sstride = frame_len,
            Direction::DevToMem => node.dstride = frame_len,
        }
        node
    }

    /// Sets the completion-interrupt and pause flags on a node.
    pub(crate) fn with_flags(mut node: LluNode, irq: bool, pause: bool) -> LluNode {
        node.control = LluControl::from_bits(node.control)
            .with(LluControl::IRQ, irq)
            .with(LluControl::PAUSE, pause)
            .bits();
        node
    }
}
