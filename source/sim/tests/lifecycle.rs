//! Lifecycle tests: firmware bring-up, channel and request line claims,
//! audio parking, and fault recovery.

mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use futures::executor::block_on;

use fdma::{
    channel::{BusWidth, ChannelKind, ChannelState, Completion, Direction, SlaveConfig, TxState},
    dreq::{DreqError, DreqRouter, LineSelect, RouterRegistry, RoutingFailed},
    fw::FwPhase,
    hw::{HwErrorCode, HwState},
    AllocError, ChannelConfig, ChannelHandle, Fdma,
};
use fdma_sim::SimFdma;

/// Bus address the tests register their device FIFOs at.
const FIFO: u32 = 0x0500_0000;

fn alloc_err(fdma: &Fdma<'_>, config: ChannelConfig) -> AllocError {
    match block_on(fdma.alloc_channel(config)) {
        Ok(_) => panic!("the allocation unexpectedly succeeded"),
        Err(err) => err,
    }
}

/// An audio channel streaming a two-period ring, parked after its first
/// period completion.
fn parked_audio<'a>(sim: &SimFdma, fdma: &'a Fdma<'a>) -> (ChannelHandle<'a>, Arc<AtomicUsize>) {
    let chan = common::paced(fdma, ChannelKind::Audio, 2);
    chan.configure_slave(SlaveConfig {
        addr: FIFO,
        buswidth: BusWidth::Four,
        maxburst: 4,
        direction: Direction::MemToDev,
    })
    .expect("program the request line");

    let buf = sim.alloc_buffer(64);
    sim.write_ram(buf, &[0x11; 64]);

    let done = Arc::new(AtomicUsize::new(0));
    let count = done.clone();
    chan.prep_cyclic(buf, 64, 32)
        .expect("build the ring")
        .with_callback(move |completion| {
            assert_eq!(completion, Completion::Done);
            count.fetch_add(1, Ordering::Relaxed);
        })
        .submit();

    assert!(sim.step());
    common::service(sim, fdma);
    assert_eq!(done.load(Ordering::Relaxed), 1);

    chan.park().expect("park the running ring");
    assert_eq!(chan.state(), ChannelState::Idle);
    (chan, done)
}

#[test]
fn parked_channel_keeps_servicing_and_unparks() {
    common::trace_init();
    let sim = SimFdma::new();
    let fdma = Fdma::new(SimFdma::config(), &sim, &sim, &sim, None);
    let (chan, done) = parked_audio(&sim, &fdma);

    // the period in flight when the park landed still raises its interrupt;
    // nothing is left to complete.
    assert!(sim.step());
    common::service(&sim, &fdma);
    assert_eq!(done.load(Ordering::Relaxed), 1);

    // the parking loop keeps feeding the peripheral without interrupts.
    let fed = sim.fifo_written(FIFO).len();
    for lap in 1..=3 {
        assert!(sim.step());
        assert!(!sim.irq_pending());
        assert_eq!(sim.fifo_written(FIFO).len(), fed + lap * 32);
    }

    // a missed-interrupt report against a parked channel is noise.
    sim.inject_error(chan.id(), HwErrorCode::MissedIrq, HwState::Running);
    common::service(&sim, &fdma);
    assert_eq!(chan.state(), ChannelState::Idle);
    assert_eq!(sim.hw_state(chan.id()), HwState::Running);

    // a new ring switches the engine off the parking node.
    let buf = sim.alloc_buffer(64);
    sim.write_ram(buf, &[0x22; 64]);
    let count = done.clone();
    chan.prep_cyclic(buf, 64, 32)
        .expect("build the second ring")
        .with_callback(move |completion| {
            assert_eq!(completion, Completion::Done);
            count.fetch_add(1, Ordering::Relaxed);
        })
        .submit();
    assert_eq!(chan.state(), ChannelState::Idle);

    // one last parking lap, then the new ring takes over.
    assert!(sim.step());
    assert!(!sim.irq_pending());
    assert_eq!(chan.state(), ChannelState::Idle);

    assert!(sim.step());
    common::service(&sim, &fdma);
    assert_eq!(done.load(Ordering::Relaxed), 2);
    assert_eq!(chan.state(), ChannelState::Running);

    chan.terminate_all();
    chan.free();
}

#[test]
fn fault_while_parked_latches_until_stopped() {
    common::trace_init();
    let sim = SimFdma::new();
    let fdma = Fdma::new(SimFdma::config(), &sim, &sim, &sim, None);
    let (chan, done) = parked_audio(&sim, &fdma);

    // settle onto the parking node.
    assert!(sim.step());
    common::service(&sim, &fdma);

    // a genuine fault unparks the channel and latches it.
    sim.inject_error(chan.id(), HwErrorCode::ReadFault, HwState::Paused);
    common::service(&sim, &fdma);
    assert_eq!(chan.state(), ChannelState::Idle);
    assert_eq!(sim.hw_state(chan.id()), HwState::Idle);

    // the latch holds new work back until an explicit stop.
    let buf = sim.alloc_buffer(64);
    sim.write_ram(buf, &[0x33; 64]);
    let count = done.clone();
    let cookie = chan
        .prep_cyclic(buf, 64, 32)
        .expect("build the ring")
        .with_callback(move |completion| {
            assert_eq!(completion, Completion::Done);
            count.fetch_add(1, Ordering::Relaxed);
        })
        .submit();
    assert!(!sim.step());
    assert_eq!(chan.tx_status(cookie).state, TxState::Error);

    chan.stop().expect("clear the fault latch");
    chan.issue_pending();
    assert!(sim.step());
    common::service(&sim, &fdma);
    assert_eq!(done.load(Ordering::Relaxed), 2);
    assert_eq!(chan.state(), ChannelState::Running);

    chan.terminate_all();
    chan.free();
}

#[test]
fn hardware_errors_report_and_recover() {
    common::trace_init();
    let sim = SimFdma::new();
    let fdma = Fdma::new(SimFdma::config(), &sim, &sim, &sim, None);
    let chan = block_on(fdma.alloc_channel(ChannelConfig::default())).expect("allocate a channel");

    let src = sim.alloc_buffer(32);
    let dst = sim.alloc_buffer(32);
    sim.write_ram(src, &[0x44; 32]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let first = chan
        .prep_memcpy(dst, src, 32)
        .expect("build the copy")
        .with_callback(move |completion| record.lock().unwrap().push(completion))
        .submit();

    sim.inject_error(chan.id(), HwErrorCode::BadNode, HwState::Running);
    common::service(&sim, &fdma);
    assert_eq!(
        *seen.lock().unwrap(),
        [Completion::Error(HwErrorCode::BadNode)]
    );
    assert_eq!(chan.tx_status(first).state, TxState::Error);
    assert_eq!(chan.state(), ChannelState::Idle);
    assert_eq!(sim.hw_state(chan.id()), HwState::Idle);

    // the fault latch holds the retry back until the client stops the
    // channel.
    let second = chan
        .prep_memcpy(dst, src, 32)
        .expect("build the retry")
        .submit();
    assert!(!sim.step());
    chan.stop().expect("clear the fault latch");
    chan.issue_pending();
    common::run_to_idle(&sim, &fdma);

    assert_eq!(chan.tx_status(second).state, TxState::Complete);
    assert_eq!(sim.read_ram(dst, 32), vec![0x44; 32]);
    // completions past the failure point pull the failed cookie into the
    // completed window.
    assert_eq!(chan.tx_status(first).state, TxState::Complete);
    chan.free();
}

#[test]
fn request_lines_are_exclusive() {
    common::trace_init();
    let sim = SimFdma::new();
    let fdma = Fdma::new(SimFdma::config(), &sim, &sim, &sim, None);

    assert_eq!(
        alloc_err(
            &fdma,
            ChannelConfig {
                kind: ChannelKind::Paced,
                ..ChannelConfig::default()
            }
        ),
        AllocError::NeedsLine
    );

    let holder = common::paced(&fdma, ChannelKind::Paced, 5);
    assert_eq!(
        alloc_err(
            &fdma,
            ChannelConfig {
                kind: ChannelKind::Paced,
                select: Some(LineSelect::Direct { line: 5 }),
                ..ChannelConfig::default()
            }
        ),
        AllocError::Dreq(DreqError::LineUnavailable(5))
    );
    assert_eq!(
        alloc_err(
            &fdma,
            ChannelConfig {
                kind: ChannelKind::Paced,
                select: Some(LineSelect::Routed { peripheral: 3 }),
                ..ChannelConfig::default()
            }
        ),
        AllocError::Dreq(DreqError::NoRouter)
    );

    // released lines can be claimed again.
    holder.free();
    let chan = common::paced(&fdma, ChannelKind::Paced, 5);
    chan.free();
}

#[test]
fn routed_lines_go_through_the_crossbar() {
    common::trace_init();

    static ROUTES: Mutex<Vec<(u32, u8)>> = Mutex::new(Vec::new());
    struct Crossbar;
    impl DreqRouter for Crossbar {
        fn route(&self, peripheral: u32, line: u8) -> Result<(), RoutingFailed> {
            ROUTES.lock().unwrap().push((peripheral, line));
            Ok(())
        }
    }
    static CROSSBAR: Crossbar = Crossbar;

    let registry = RouterRegistry::new();
    registry.register(1, &CROSSBAR).expect("register the router");

    let sim = SimFdma::new();
    let mut cfg = SimFdma::config();
    cfg.xbar = Some(1);
    let fdma = Fdma::new(cfg, &sim, &sim, &sim, Some(&registry));

    let chan = block_on(fdma.alloc_channel(ChannelConfig {
        kind: ChannelKind::Paced,
        select: Some(LineSelect::Routed { peripheral: 9 }),
        initiator: 1,
        holdoff: 2,
    }))
    .expect("allocate a routed channel");
    assert_eq!(*ROUTES.lock().unwrap(), [(9, 0)]);

    chan.configure_slave(SlaveConfig {
        addr: FIFO,
        buswidth: BusWidth::Two,
        maxburst: 8,
        direction: Direction::DevToMem,
    })
    .expect("program the request line");
    assert_eq!(sim.req_ctrl(0), 0b001 | (8 << 3) | (2 << 10) | (1 << 30));

    chan.free();
}

#[test]
fn channels_exhaust_at_sixteen() {
    common::trace_init();
    let sim = SimFdma::new();
    let fdma = Fdma::new(SimFdma::config(), &sim, &sim, &sim, None);

    let mut held: Vec<ChannelHandle<'_>> = (0..Fdma::CHANNEL_COUNT)
        .map(|id| {
            let chan = block_on(fdma.alloc_channel(ChannelConfig::default()))
                .expect("allocate a channel");
            assert_eq!(chan.id(), id);
            chan
        })
        .collect();
    assert_eq!(
        alloc_err(&fdma, ChannelConfig::default()),
        AllocError::NoChannels
    );

    // freed channels are handed out again, lowest first.
    held.remove(3).free();
    let chan = block_on(fdma.alloc_channel(ChannelConfig::default())).expect("allocate a channel");
    assert_eq!(chan.id(), 3);
    chan.free();
    for chan in held {
        chan.free();
    }
}

#[test]
fn concurrent_allocations_share_one_firmware_load() {
    common::trace_init();
    let sim = SimFdma::new();
    let fdma = Fdma::new(SimFdma::config(), &sim, &sim, &sim, None);
    assert_eq!(fdma.fw_phase(), FwPhase::Init);

    let (a, b) = block_on(futures::future::join(
        fdma.alloc_channel(ChannelConfig::default()),
        fdma.alloc_channel(ChannelConfig::default()),
    ));
    let a = a.expect("first allocation");
    let b = b.expect("second allocation");
    assert_eq!(fdma.fw_phase(), FwPhase::Loaded);
    assert_ne!(a.id(), b.id());
    a.free();
    b.free();
}

#[test]
#[should_panic(expected = "freed while busy")]
fn freeing_a_busy_channel_panics() {
    common::trace_init();
    let sim = SimFdma::new();
    let fdma = Fdma::new(SimFdma::config(), &sim, &sim, &sim, None);
    let chan = block_on(fdma.alloc_channel(ChannelConfig::default())).expect("allocate a channel");

    let src = sim.alloc_buffer(32);
    let dst = sim.alloc_buffer(32);
    chan.prep_memcpy(dst, src, 32)
        .expect("build the copy")
        .submit();
    chan.free();
}
