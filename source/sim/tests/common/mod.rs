//! Shared fixtures for the integration tests.

use futures::executor::block_on;

use fdma::{channel::ChannelKind, dreq::LineSelect, ChannelConfig, ChannelHandle, Fdma};
use fdma_sim::SimFdma;

pub fn trace_init() {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        prelude::*,
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("fdma=debug,fdma_sim=debug").unwrap()
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

/// Forwards the model's latched interrupt until the line drops.
///
/// Command acknowledgements raise fresh completion bits, so one hardware
/// step can take several interrupt passes to drain.
pub fn service(sim: &SimFdma, fdma: &Fdma<'_>) {
    while sim.irq_pending() {
        fdma.handle_interrupt();
    }
}

/// Steps the model to a standstill, servicing interrupts as they latch.
pub fn run_to_idle(sim: &SimFdma, fdma: &Fdma<'_>) {
    service(sim, fdma);
    while sim.step() {
        service(sim, fdma);
    }
}

/// Allocates a channel of `kind` bound directly to request line `line`.
pub fn paced<'a>(fdma: &'a Fdma<'a>, kind: ChannelKind, line: u8) -> ChannelHandle<'a> {
    block_on(fdma.alloc_channel(ChannelConfig {
        kind,
        select: Some(LineSelect::Direct { line }),
        initiator: 0,
        holdoff: 0,
    }))
    .expect("allocate a paced channel")
}
