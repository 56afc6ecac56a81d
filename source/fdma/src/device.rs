//! One FDMA instance: channel allocation and the interrupt dispatcher.
//!
//! An [`Fdma`] owns the sixteen channel state machines, the request line
//! table, and the firmware phase. Clients allocate a [`ChannelHandle`] with
//! [`alloc_channel`](Fdma::alloc_channel); the platform's interrupt handler
//! calls [`handle_interrupt`](Fdma::handle_interrupt), which acknowledges the
//! hardware, advances the affected channels, and delivers completion
//! callbacks after every channel lock has been dropped.

use core::{cell::RefCell, fmt, sync::atomic::Ordering};

use alloc::{boxed::Box, vec::Vec};
use critical_section::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    channel::{
        try_start, Channel, ChannelHandle, ChannelInner, ChannelKind, ChannelState, Completion,
        Finished,
    },
    desc::Descriptor,
    dreq::{DreqError, DreqSetup, DreqTable, LineSelect, RouterRegistry},
    fw::{FwPhase, FwState},
    hw::{
        irq, mbox, FdmaConfig, FwSource, HwErrorCode, HwState, LluPool, RegLayout, RegisterBus,
        StatusWord,
    },
};

/// Parameters of a channel allocation.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// What will drive the channel's transfers.
    pub kind: ChannelKind,
    /// Request line selection; required for every paced kind.
    pub select: Option<LineSelect>,
    /// Bus initiator the channel's paced accesses are issued on.
    pub initiator: u8,
    /// Cycles the request line holds off between bursts.
    pub holdoff: u8,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::FreeRunning,
            select: None,
            initiator: 0,
            holdoff: 0,
        }
    }
}

/// Errors returned by [`Fdma::alloc_channel`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocError {
    /// The engine firmware is not loaded and cannot become loaded.
    NotReady,
    /// All sixteen channels are claimed.
    NoChannels,
    /// A paced kind was requested without a request line selection.
    NeedsLine,
    /// The request line could not be claimed.
    Dreq(DreqError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => f.write_str("the engine firmware is not loaded"),
            Self::NoChannels => {
                write!(f, "all {} channels are claimed", Fdma::CHANNEL_COUNT)
            }
            Self::NeedsLine => f.write_str("a paced channel needs a request line selection"),
            Self::Dreq(err) => fmt::Display::fmt(err, f),
        }
    }
}

/// One FDMA engine instance.
pub struct Fdma<'a> {
    cfg: FdmaConfig,
    bus: &'a dyn RegisterBus,
    pool: &'a dyn LluPool,
    fw_source: &'a dyn FwSource,
    routers: Option<&'a RouterRegistry>,
    fw: FwState,
    dreq: Mutex<RefCell<DreqTable>>,
    channels: [Channel; Fdma::CHANNEL_COUNT as usize],
}

impl<'a> Fdma<'a> {
    /// Hardware channels per engine instance.
    pub const CHANNEL_COUNT: u8 = 16;

    /// Binds a driver to one engine instance.
    ///
    /// Nothing touches the hardware until the first
    /// [`alloc_channel`](Self::alloc_channel) triggers the firmware load.
    #[must_use]
    pub const fn new(
        cfg: FdmaConfig,
        bus: &'a dyn RegisterBus,
        pool: &'a dyn LluPool,
        fw_source: &'a dyn FwSource,
        routers: Option<&'a RouterRegistry>,
    ) -> Self {
        const NEW_CHANNEL: Channel = Channel::new();
        Self {
            cfg,
            bus,
            pool,
            fw_source,
            routers,
            fw: FwState::new(),
            dreq: Mutex::new(RefCell::new(DreqTable::new())),
            channels: [NEW_CHANNEL; Self::CHANNEL_COUNT as usize],
        }
    }

    pub(crate) fn bus(&self) -> &dyn RegisterBus {
        self.bus
    }

    pub(crate) fn layout(&self) -> &RegLayout {
        &self.cfg.layout
    }

    pub(crate) fn pool(&self) -> &dyn LluPool {
        self.pool
    }

    pub(crate) fn channel(&self, id: u8) -> &Channel {
        &self.channels[id as usize]
    }

    /// Load state of the engine firmware.
    pub fn fw_phase(&self) -> FwPhase {
        self.fw.phase()
    }

    /// Claims a free channel and prepares it for `config`.
    ///
    /// The first successful caller loads the engine firmware; concurrent
    /// callers wait for that load to settle. Paced kinds also claim a
    /// request line, through the crossbar when this instance sits behind
    /// one.
    #[tracing::instrument(
        name = "Fdma::alloc_channel",
        level = tracing::Level::DEBUG,
        skip(self),
        err(Debug),
    )]
    pub async fn alloc_channel(
        &'a self,
        config: ChannelConfig,
    ) -> Result<ChannelHandle<'a>, AllocError> {
        self.fw
            .ensure_loaded(self.bus, &self.cfg.layout, self.fw_source)
            .await
            .map_err(|_| AllocError::NotReady)?;

        let id = self.claim_channel().ok_or(AllocError::NoChannels)?;

        let dreq = match self.claim_line(&config) {
            Ok(dreq) => dreq,
            Err(err) => {
                self.channel(id).claimed.store(false, Ordering::Release);
                return Err(err);
            }
        };

        // seed the free list so prepares stay off the pool's slow path. A
        // dry pool here is survivable; prepares grow on demand.
        let mut seeded = Vec::with_capacity(self.cfg.prealloc_descriptors);
        for _ in 0..self.cfg.prealloc_descriptors {
            match self.pool.alloc() {
                Some((node, phys)) => seeded.push(Box::new(Descriptor::new(node, phys))),
                None => {
                    warn!(
                        channel = id,
                        wanted = self.cfg.prealloc_descriptors,
                        got = seeded.len(),
                        "coherent pool dry during channel pre-allocation"
                    );
                    break;
                }
            }
        }

        critical_section::with(|cs| {
            let mut inner = self.channel(id).inner.borrow_ref_mut(cs);
            inner.configure(config.kind, config.initiator, config.holdoff);
            inner.dreq = dreq;
            inner.desc_count = seeded.len();
            for desc in seeded {
                inner.free.push(desc);
            }
        });
        debug!(channel = id, kind = ?config.kind, dreq, "allocated channel");
        Ok(ChannelHandle::new(self, id))
    }

    /// Claims the lowest free channel.
    fn claim_channel(&self) -> Option<u8> {
        for (id, channel) in self.channels.iter().enumerate() {
            if channel
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(id as u8);
            }
        }
        None
    }

    /// Claims the request line `config` asks for, if its kind needs one.
    fn claim_line(&self, config: &ChannelConfig) -> Result<Option<u8>, AllocError> {
        if config.kind == ChannelKind::FreeRunning {
            return Ok(None);
        }
        let select = config.select.ok_or(AllocError::NeedsLine)?;
        let router = self
            .cfg
            .xbar
            .and_then(|xbar| self.routers.and_then(|registry| registry.lookup(xbar)));
        critical_section::with(|cs| self.dreq.borrow_ref_mut(cs).claim(select, router))
            .map(Some)
            .map_err(AllocError::Dreq)
    }

    /// Records and programs the pacing parameters of a claimed line.
    pub(crate) fn configure_dreq(&self, line: u8, setup: DreqSetup) -> Result<(), DreqError> {
        critical_section::with(|cs| {
            let mut table = self.dreq.borrow_ref_mut(cs);
            table.configure(line, setup);
            table.program(line, self.bus, &self.cfg.layout)
        })
    }

    pub(crate) fn release_dreq(&self, line: u8) {
        critical_section::with(|cs| self.dreq.borrow_ref_mut(cs).release(line));
    }

    /// Services the engine's interrupt.
    ///
    /// Reads and acknowledges the summary register, advances every flagged
    /// channel's state machine under its lock, then delivers the collected
    /// completion callbacks with no lock held.
    pub fn handle_interrupt(&self) {
        let status = self.bus.read(self.cfg.layout.int_status);
        if status == 0 {
            return;
        }
        self.bus.write(self.cfg.layout.int_clr, status);
        trace!(status = ?format_args!("{status:#b}"), "FDMA interrupt");

        let mut finished = Vec::new();
        for id in 0..Self::CHANNEL_COUNT {
            let done = status & irq::done(id) != 0;
            let err = status & irq::err(id) != 0;
            if !done && !err {
                continue;
            }
            critical_section::with(|cs| {
                let mut inner = self.channel(id).inner.borrow_ref_mut(cs);
                self.channel_event(id, &mut inner, done, err, &mut finished);
            });
        }

        for Finished {
            mut callback,
            completion,
            restore,
        } in finished
        {
            callback(completion);
            // cyclic transfers reuse their callback every period; hand it
            // back unless the chain is gone or was replaced meanwhile.
            let Some(id) = restore else {
                continue;
            };
            critical_section::with(|cs| {
                let mut inner = self.channel(id).inner.borrow_ref_mut(cs);
                if let Some(head) = inner.active.front_mut() {
                    if !head.has_callback() {
                        head.set_callback(callback);
                    }
                }
            });
        }
    }

    /// Advances one channel's state machine for a completion and/or error
    /// event.
    fn channel_event(
        &self,
        id: u8,
        inner: &mut ChannelInner,
        done: bool,
        err: bool,
        finished: &mut Vec<Finished>,
    ) {
        let status = StatusWord::from_bits(self.bus.read(self.cfg.layout.chan_status(id)));
        let hw_state = status.get(StatusWord::STATE);

        if err {
            let code = status.get(StatusWord::ERROR);
            if inner.is_parked && code == HwErrorCode::MissedIrq {
                // the parking loop never raises completions, which the
                // firmware's watchdog misreads as a lost interrupt.
                trace!(channel = id, "ignored missed-irq report from a parked channel");
                inner.drain_retired();
                return;
            }
            warn!(channel = id, ?code, ?hw_state, "channel error");
            inner.faulted = true;
            inner.is_cyclic = false;
            if inner.is_parked {
                inner.is_parked = false;
                if let Some(parked) = inner.parked.take() {
                    inner.free.put(parked);
                }
            }
            if let Some(mut desc) = inner.active.pop_front() {
                if let Some(callback) = desc.take_callback() {
                    finished.push(Finished {
                        callback,
                        completion: Completion::Error(code),
                        restore: None,
                    });
                }
                inner.free.put(desc);
            }
            if hw_state == HwState::Paused {
                // already stopped on the faulting node; reset immediately.
                self.bus
                    .write(self.cfg.layout.mbox_set, mbox::cmd(id, mbox::FLUSH));
                inner.state = ChannelState::Idle;
            } else {
                self.bus
                    .write(self.cfg.layout.mbox_set, mbox::cmd(id, mbox::PAUSE));
                inner.state = ChannelState::Error;
            }
            return;
        }

        inner.drain_retired();

        // fault recovery needs no active chain; the faulting descriptor was
        // already retired when the error was reported.
        if inner.state == ChannelState::Error {
            match hw_state {
                HwState::Paused | HwState::Idle => {
                    self.bus
                        .write(self.cfg.layout.mbox_set, mbox::cmd(id, mbox::FLUSH));
                    inner.state = ChannelState::Idle;
                    trace!(channel = id, "faulted channel reset");
                }
                // the pause has not taken hold yet; a later event will.
                HwState::Running | HwState::Start => {}
            }
            return;
        }

        if inner.active.is_empty() {
            if inner.state == ChannelState::Idle && hw_state == HwState::Paused {
                // the client tore the channel down before this pause
                // acknowledgement arrived.
                self.bus
                    .write(self.cfg.layout.mbox_set, mbox::cmd(id, mbox::FLUSH));
                trace!(channel = id, "flushed a late pause acknowledgement");
            }
            return;
        }

        if inner.is_cyclic
            && hw_state == HwState::Running
            && matches!(inner.state, ChannelState::Running | ChannelState::Idle)
        {
            // one period of the ring finished; the chain stays active. An
            // `Idle` state here is the first period after the hardware was
            // switched off its parking node.
            if inner.state == ChannelState::Idle {
                trace!(channel = id, "cyclic chain took over from the parking node");
            }
            inner.state = ChannelState::Running;
            if let Some(head) = inner.active.front_mut() {
                if let Some(callback) = head.take_callback() {
                    finished.push(Finished {
                        callback,
                        completion: Completion::Done,
                        restore: Some(id),
                    });
                }
            }
            return;
        }

        match (inner.state, hw_state) {
            (ChannelState::Running | ChannelState::Stopping, HwState::Idle) => {
                // the whole chain retired; even a stopping channel ran to
                // the end before the pause could take hold.
                let auto_start = inner.state == ChannelState::Running;
                if let Some(mut desc) = inner.active.pop_front() {
                    if let Some(cookie) = desc.cookie() {
                        inner.last_completed = cookie;
                        trace!(channel = id, cookie = cookie.value(), "chain completed");
                    }
                    if let Some(callback) = desc.take_callback() {
                        finished.push(Finished {
                            callback,
                            completion: Completion::Done,
                            restore: None,
                        });
                    }
                    inner.free.put(desc);
                }
                inner.is_cyclic = false;
                inner.state = ChannelState::Idle;
                if auto_start {
                    try_start(self, id, inner);
                }
            }
            (ChannelState::Running, HwState::Paused) => {
                // a client pause request or an in-chain pause node.
                inner.state = ChannelState::Paused;
                trace!(channel = id, "channel paused");
            }
            (ChannelState::Stopping, HwState::Paused) => {
                inner.abort_active();
                self.bus
                    .write(self.cfg.layout.mbox_set, mbox::cmd(id, mbox::FLUSH));
                inner.state = ChannelState::Idle;
                inner.is_cyclic = false;
                trace!(channel = id, "channel stopped");
            }
            (ChannelState::Stopping, HwState::Running | HwState::Start) => {
                // a node completed before the pause took hold; drop the
                // event, the acknowledgement is still on its way.
            }
            (ChannelState::Paused, HwState::Paused) => {
                // duplicate acknowledgement.
            }
            (state, hw) => panic!(
                "channel {id}: completion event in driver state {state:?} \
                 with hardware state {hw:?}"
            ),
        }
    }
}

impl Drop for Fdma<'_> {
    fn drop(&mut self) {
        if self.fw.phase() == FwPhase::Loaded {
            self.bus.write(self.cfg.layout.enable, 0);
        }
        for channel in &self.channels {
            let descs = critical_section::with(|cs| {
                let mut inner = channel.inner.borrow_ref_mut(cs);
                let mut descs: Vec<Box<Descriptor>> = inner.free.drain().collect();
                descs.extend(inner.queued.drain(..));
                descs.extend(inner.active.drain(..));
                if let Some(parked) = inner.parked.take() {
                    descs.push(parked);
                }
                if let Some(retired) = inner.retired.take() {
                    descs.push(retired);
                }
                descs
            });
            for desc in descs {
                desc.release(self.pool);
            }
        }
    }
}
