//! Host-side register-level model of one FDMA instance.
//!
//! [`SimFdma`] backs all three of the driver's platform seams at once: it is
//! a [`RegisterBus`] over an in-process register file, an [`LluPool`] over a
//! fake coherent node area, and a [`FwSource`] supplying a well-formed image.
//! A node-at-a-time transfer engine stands in for the SLIM core:
//! [`step`](SimFdma::step) executes one linked-list node on every running
//! channel, moving real bytes between a fake data RAM and per-address FIFOs,
//! and latches completion bits the way the firmware would.
//!
//! The model is deliberately synchronous. Tests submit work through the
//! driver, call `step` to let the "hardware" make progress, and forward the
//! latched interrupt with [`Fdma::handle_interrupt`] while
//! [`irq_pending`](SimFdma::irq_pending) reports more work; command
//! acknowledgements raise fresh completion bits, so one `step` can need more
//! than one interrupt pass.
//!
//! [`Fdma::handle_interrupt`]: fdma::Fdma::handle_interrupt

use core::{cell::UnsafeCell, ptr::NonNull};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use tracing::trace;

use fdma::{
    desc::{LluControl, LluNode},
    fw::{FwError, FwImage, FwSegment, SLIM_IMAGE_FLAGS, SLIM_MACHINE_ID},
    hw::{
        irq, mbox, FdmaConfig, FwSource, HwErrorCode, HwState, LluPool, MemWindow, PhysAddr,
        RegLayout, RegisterBus, StatusWord,
    },
};

/// Channels modelled per instance.
const CHANNELS: usize = 16;

/// Nodes in the fake coherent pool.
const NODE_COUNT: usize = 64;

/// Bus address of the first pool node.
pub const NODE_BASE: u32 = 0x4000_0000;

/// Bus address of the fake data RAM.
pub const DATA_BASE: u32 = 0x8000_0000;

/// Size of the fake data RAM in bytes.
pub const DATA_LEN: u32 = 64 * 1024;

/// Value of the engine identification register.
const ENGINE_ID: u32 = 0x0000_fd0a;

/// Firmware revision published once the engine is enabled.
const FW_REVISION: u32 = 0x0001_0217;

/// One modelled FDMA instance.
///
/// The register file and channel engines live behind a mutex; the node area
/// and data RAM sit outside it, because the driver holds raw pointers into
/// the node area and the model reads through them like a bus master would.
pub struct SimFdma {
    state: Mutex<SimState>,
    nodes: UnsafeCell<Box<[LluNode]>>,
    data: UnsafeCell<Box<[u8]>>,
}

// Tests drive the driver and the model from one thread; the raw accesses to
// `nodes` and `data` mirror device DMA against coherent memory.
unsafe impl Sync for SimFdma {}

struct SimState {
    /// Registers with no modelled behavior, plus the engine memory windows.
    misc: HashMap<u32, u32>,
    int_status: u32,
    channels: [SimChannel; CHANNELS],
    node_next: usize,
    node_free: Vec<usize>,
    data_next: u32,
    /// Bytes a device would feed into non-incrementing reads, per address.
    fifo_in: HashMap<u32, VecDeque<u8>>,
    /// Bytes collected from non-incrementing writes, per address.
    fifo_out: HashMap<u32, Vec<u8>>,
}

#[derive(Copy, Clone)]
struct SimChannel {
    state: HwState,
    error: HwErrorCode,
    /// Bus address of the node the channel will execute next; 0 when idle.
    current: u32,
    /// What the transfer count register reads back.
    count: u32,
    /// Start target received while running, applied at the next node end.
    switch_to: Option<u32>,
}

impl SimChannel {
    fn new() -> Self {
        Self {
            state: HwState::Idle,
            error: HwErrorCode::None,
            current: 0,
            count: 0,
            switch_to: None,
        }
    }
}

impl SimFdma {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                misc: HashMap::new(),
                int_status: 0,
                channels: [SimChannel::new(); CHANNELS],
                node_next: 0,
                node_free: Vec::new(),
                data_next: 0,
                fifo_in: HashMap::new(),
                fifo_out: HashMap::new(),
            }),
            nodes: UnsafeCell::new(vec![LluNode::zeroed(); NODE_COUNT].into_boxed_slice()),
            data: UnsafeCell::new(vec![0u8; DATA_LEN as usize].into_boxed_slice()),
        }
    }

    /// The register layout the model implements.
    pub fn layout() -> RegLayout {
        RegLayout {
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
        }
    }

    /// A driver configuration matching the model.
    pub fn config() -> FdmaConfig {
        FdmaConfig {
            layout: Self::layout(),
            xbar: None,
            prealloc_descriptors: 8,
        }
    }

    /// Carves a 32-byte aligned buffer out of the fake data RAM.
    pub fn alloc_buffer(&self, len: u32) -> u32 {
        let mut state = self.lock();
        let rounded = (len + 31) & !31;
        assert!(
            state.data_next + rounded <= DATA_LEN,
            "fake data RAM exhausted"
        );
        let addr = DATA_BASE + state.data_next;
        state.data_next += rounded;
        addr
    }

    pub fn write_ram(&self, addr: u32, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            let offset = Self::data_offset(addr + i as u32)
                .unwrap_or_else(|| panic!("write outside the fake data RAM: {addr:#x}+{i}"));
            unsafe { *(*self.data.get()).as_mut_ptr().add(offset) = byte };
        }
    }

    pub fn read_ram(&self, addr: u32, len: u32) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let offset = Self::data_offset(addr + i)
                    .unwrap_or_else(|| panic!("read outside the fake data RAM: {addr:#x}+{i}"));
                unsafe { *(*self.data.get()).as_ptr().add(offset) }
            })
            .collect()
    }

    /// Queues bytes a device FIFO at `addr` will answer non-incrementing
    /// reads with.
    pub fn set_fifo_data(&self, addr: u32, bytes: &[u8]) {
        self.lock()
            .fifo_in
            .entry(addr)
            .or_default()
            .extend(bytes.iter().copied());
    }

    /// Everything non-incrementing writes have pushed at `addr` so far.
    pub fn fifo_written(&self, addr: u32) -> Vec<u8> {
        self.lock().fifo_out.get(&addr).cloned().unwrap_or_default()
    }

    /// Whether the interrupt line is asserted.
    pub fn irq_pending(&self) -> bool {
        self.lock().int_status != 0
    }

    /// Hardware state of channel `id`, as the status word would report it.
    pub fn hw_state(&self, id: u8) -> HwState {
        self.lock().channels[id as usize].state
    }

    /// What was last programmed into request line `line`'s control register.
    pub fn req_ctrl(&self, line: u8) -> u32 {
        let offset = Self::layout().req_ctrl(line);
        self.lock().misc.get(&offset).copied().unwrap_or(0)
    }

    /// Makes channel `id` report `code`, as if the firmware had faulted it.
    ///
    /// `hw` is the state the channel lands in; a fault caught mid-node leaves
    /// the channel `Paused` on the offender, one the firmware only noticed
    /// later leaves it `Running`.
    pub fn inject_error(&self, id: u8, code: HwErrorCode, hw: HwState) {
        let mut state = self.lock();
        let channel = &mut state.channels[id as usize];
        channel.error = code;
        channel.state = hw;
        state.int_status |= irq::err(id);
    }

    /// Executes one node on every running channel.
    ///
    /// Returns whether any channel made progress.
    pub fn step(&self) -> bool {
        let mut state = self.lock();
        let mut ran = false;
        for id in 0..CHANNELS as u8 {
            let idx = id as usize;
            match state.channels[idx].state {
                HwState::Idle | HwState::Paused => continue,
                HwState::Start => state.channels[idx].state = HwState::Running,
                HwState::Running => {}
            }

            let current = state.channels[idx].current;
            if current == 0 {
                let channel = &mut state.channels[idx];
                channel.state = HwState::Idle;
                channel.count = 0;
                continue;
            }

            let node = self.node(current);
            let control = LluControl::from_bits(node.control);
            self.move_bytes(&mut state, &node, &control);
            ran = true;

            if control.get(LluControl::IRQ) {
                state.int_status |= irq::done(id);
            }

            let next = state.channels[idx].switch_to.take().unwrap_or(node.next);
            let next_count = if next == 0 { 0 } else { self.node(next).nbytes };
            let channel = &mut state.channels[idx];
            channel.current = next;
            channel.count = next_count;
            if next == 0 {
                channel.state = HwState::Idle;
            } else if control.get(LluControl::PAUSE) {
                channel.state = HwState::Paused;
            }
            trace!(
                channel = id,
                node = ?format_args!("{current:#x}"),
                next = ?format_args!("{next:#x}"),
                state = ?channel.state,
                "executed node"
            );
        }
        ran
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Starts or switches channel `id` to its command register target.
    fn cmd_start(&self, state: &mut SimState, id: u8) {
        let target = state
            .misc
            .get(&Self::layout().chan_cmd(id))
            .copied()
            .unwrap_or(0);
        let channel = &mut state.channels[id as usize];
        match channel.state {
            // a running channel leaves its current node untouched and jumps
            // at the node boundary.
            HwState::Running | HwState::Start => {
                channel.switch_to = Some(target);
                trace!(channel = id, target = ?format_args!("{target:#x}"), "switch pending");
            }
            HwState::Idle | HwState::Paused => {
                channel.current = target;
                channel.state = HwState::Start;
                channel.error = HwErrorCode::None;
                channel.count = if target == 0 { 0 } else { self.node(target).nbytes };
                trace!(channel = id, target = ?format_args!("{target:#x}"), "started");
            }
        }
    }

    /// Toggles channel `id`'s pause state.
    ///
    /// Entering the paused state is acknowledged with a completion bit;
    /// resuming is silent.
    fn cmd_pause(&self, state: &mut SimState, id: u8) {
        let channel = &mut state.channels[id as usize];
        let acked = match channel.state {
            HwState::Running | HwState::Start | HwState::Idle => {
                channel.state = HwState::Paused;
                true
            }
            HwState::Paused => {
                channel.state = HwState::Running;
                false
            }
        };
        if acked {
            state.int_status |= irq::done(id);
        }
        trace!(channel = id, acked, "pause toggled");
    }

    fn cmd_flush(&self, state: &mut SimState, id: u8) {
        state.channels[id as usize] = SimChannel::new();
        trace!(channel = id, "flushed");
    }

    /// Reads a node back from the fake coherent area, like a bus master.
    fn node(&self, phys: u32) -> LluNode {
        let idx = Self::node_index(phys);
        unsafe { (*self.nodes.get()).as_ptr().add(idx).read_volatile() }
    }

    fn node_index(phys: u32) -> usize {
        let offset = phys.checked_sub(NODE_BASE).unwrap_or_else(|| {
            panic!("node address {phys:#x} below the coherent pool");
        });
        let idx = (offset / 32) as usize;
        assert!(
            offset % 32 == 0 && idx < NODE_COUNT,
            "node address {phys:#x} outside the coherent pool"
        );
        idx
    }

    /// Moves one node's worth of bytes.
    ///
    /// An incrementing side walks the fake data RAM line by line; a
    /// non-incrementing side reads from or appends to the FIFO registered
    /// at its fixed address.
    fn move_bytes(&self, state: &mut SimState, node: &LluNode, control: &LluControl) {
        if node.nbytes == 0 {
            return;
        }
        let line_len = node.line_len.max(1);
        let lines = node.nbytes / line_len;
        let src_incr = control.get(LluControl::SRC_INCR);
        let dst_incr = control.get(LluControl::DST_INCR);
        let sstep = if node.sstride != 0 { node.sstride } else { line_len };
        let dstep = if node.dstride != 0 { node.dstride } else { line_len };

        for line in 0..lines {
            for byte in 0..line_len {
                let value = if src_incr {
                    self.read_byte(node.saddr + line * sstep + byte)
                } else {
                    state
                        .fifo_in
                        .get_mut(&node.saddr)
                        .and_then(VecDeque::pop_front)
                        .unwrap_or(0)
                };
                if dst_incr {
                    self.write_byte(node.daddr + line * dstep + byte, value);
                } else {
                    state.fifo_out.entry(node.daddr).or_default().push(value);
                }
            }
        }
    }

    fn read_byte(&self, addr: u32) -> u8 {
        match Self::data_offset(addr) {
            Some(offset) => unsafe { *(*self.data.get()).as_ptr().add(offset) },
            None => 0,
        }
    }

    fn write_byte(&self, addr: u32, value: u8) {
        if let Some(offset) = Self::data_offset(addr) {
            unsafe { *(*self.data.get()).as_mut_ptr().add(offset) = value };
        }
    }

    fn data_offset(addr: u32) -> Option<usize> {
        (addr >= DATA_BASE && addr < DATA_BASE + DATA_LEN).then(|| (addr - DATA_BASE) as usize)
    }
}

impl Default for SimFdma {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBus for SimFdma {
    fn read(&self, offset: u32) -> u32 {
        let layout = Self::layout();
        let state = self.lock();
        if offset == layout.id {
            return ENGINE_ID;
        }
        if offset == layout.revision {
            let enabled = state.misc.get(&layout.enable).copied().unwrap_or(0) != 0;
            return if enabled { FW_REVISION } else { 0 };
        }
        if offset == layout.int_status {
            return state.int_status;
        }
        if let Some(id) = reg_index(offset, layout.status_base, layout.status_stride) {
            let channel = &state.channels[id];
            return StatusWord::new()
                .with(StatusWord::STATE, channel.state)
                .with(StatusWord::ERROR, channel.error)
                .with(StatusWord::NODE, channel.current >> 5)
                .bits();
        }
        if let Some(id) = reg_index(offset, layout.count_base, layout.count_stride) {
            return state.channels[id].count;
        }
        state.misc.get(&offset).copied().unwrap_or(0)
    }

    fn write(&self, offset: u32, value: u32) {
        let layout = Self::layout();
        let mut state = self.lock();
        if offset == layout.mbox_set {
            for id in 0..CHANNELS as u8 {
                match mbox::get(value, id) {
                    mbox::START => self.cmd_start(&mut state, id),
                    mbox::PAUSE => self.cmd_pause(&mut state, id),
                    mbox::FLUSH => self.cmd_flush(&mut state, id),
                    _ => {}
                }
            }
            return;
        }
        if offset == layout.int_clr {
            state.int_status &= !value;
            return;
        }
        if offset == layout.enable && value != 0 {
            let clk = state.misc.get(&layout.clk_gate).copied().unwrap_or(0);
            let sync = state.misc.get(&layout.sync).copied().unwrap_or(0);
            assert!(
                clk == 1 && sync == 1,
                "engine enabled before clock and sync bring-up"
            );
        }
        state.misc.insert(offset, value);
    }
}

/// Resolves `offset` against a per-channel register bank.
fn reg_index(offset: u32, base: u32, stride: u32) -> Option<usize> {
    if offset < base {
        return None;
    }
    let rel = offset - base;
    if rel % stride != 0 {
        return None;
    }
    let idx = (rel / stride) as usize;
    (idx < CHANNELS).then_some(idx)
}

impl LluPool for SimFdma {
    fn alloc(&self) -> Option<(NonNull<LluNode>, PhysAddr)> {
        let mut state = self.lock();
        let idx = match state.node_free.pop() {
            Some(idx) => idx,
            None if state.node_next < NODE_COUNT => {
                let idx = state.node_next;
                state.node_next += 1;
                idx
            }
            None => return None,
        };
        let ptr = unsafe { (*self.nodes.get()).as_mut_ptr().add(idx) };
        unsafe { ptr.write_volatile(LluNode::zeroed()) };
        NonNull::new(ptr).map(|node| (node, PhysAddr::new(NODE_BASE + (idx as u32) * 32)))
    }

    fn free(&self, _node: NonNull<LluNode>, phys: PhysAddr) {
        let idx = Self::node_index(phys.addr());
        self.lock().node_free.push(idx);
    }
}

impl FwSource for SimFdma {
    fn firmware(&self) -> Result<FwImage, FwError> {
        let layout = Self::layout();
        Ok(FwImage {
            machine: SLIM_MACHINE_ID,
            flags: SLIM_IMAGE_FLAGS,
            executable: true,
            segments: vec![
                FwSegment {
                    loadable: true,
                    addr: layout.imem.base,
                    data: (0..16).map(|i| 0x5350_0000 | i).collect(),
                },
                FwSegment {
                    loadable: true,
                    addr: layout.dmem.base,
                    data: vec![0x0000_0001, 0x0000_0002],
                },
            ],
        })
    }
}
