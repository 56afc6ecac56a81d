//! Shared fixtures for the unit tests.

use core::ptr::NonNull;
use std::sync::Mutex as StdMutex;

use crate::{
    desc::LluNode,
    hw::{LluPool, MemWindow, PhysAddr, RegLayout},
};

pub(crate) fn trace_init() {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        prelude::*,
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("fdma=debug").unwrap()
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .without_time()
        .finish()
        .try_init();
}

/// The register layout the unit tests program against.
pub(crate) fn test_layout() -> RegLayout {
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

/// A coherent node pool backed by the host allocator.
///
/// Bus addresses are synthesized, unique, and 32-byte aligned; they are only
/// ever compared, never dereferenced, by the code under test.
pub(crate) struct TestPool {
    state: StdMutex<PoolState>,
}

struct PoolState {
    next_phys: u32,
    outstanding: usize,
}

impl TestPool {
    pub(crate) fn new() -> Self {
        Self {
            state: StdMutex::new(PoolState {
                next_phys: 0x4000_0000,
                outstanding: 0,
            }),
        }
    }

    pub(crate) fn alloc_node(&self) -> Option<(NonNull<LluNode>, PhysAddr)> {
        let mut state = self.state.lock().unwrap();
        let phys = PhysAddr::new(state.next_phys);
        state.next_phys += 32;
        state.outstanding += 1;
        drop(state);
        NonNull::new(Box::into_raw(Box::new(LluNode::zeroed()))).map(|node| (node, phys))
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }
}

impl LluPool for TestPool {
    fn alloc(&self) -> Option<(NonNull<LluNode>, PhysAddr)> {
        self.alloc_node()
    }

    fn free(&self, node: NonNull<LluNode>, _phys: PhysAddr) {
        self.state.lock().unwrap().outstanding -= 1;
        unsafe { drop(Box::from_raw(node.as_ptr())) };
    }
}
