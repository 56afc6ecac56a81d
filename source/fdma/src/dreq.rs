//! Transfer request line (DREQ) allocation and crossbar routing.
//!
//! Paced transfers are throttled by one of the engine's 32 request lines. A
//! peripheral is either wired to a line directly or reaches one through a
//! crossbar, in which case the platform's [`DreqRouter`] makes the
//! connection. Lines are claimed from a device-wide table and programmed
//! through the per-line control registers.
// Unusual groupings are used in binary literals in this file in order to
// separate the bits by which field they represent, rather than by their byte.
#![allow(clippy::unusual_byte_groupings)]

use core::{cell::RefCell, fmt};

use critical_section::Mutex;
use mycelium_bitfield::{bitfield, enum_from_bits};
use tracing::trace;

use crate::{
    channel::{BusWidth, Direction},
    hw::{RegLayout, RegisterBus},
};

/// Number of request lines per engine instance.
pub const NUM_LINES: u8 = 32;

/// How a peripheral's transfer request reaches the engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineSelect {
    /// Route the request through the crossbar onto any free line.
    Routed {
        /// Crossbar input carrying the peripheral's request signal.
        peripheral: u32,
    },
    /// Claim the line the peripheral is wired to directly.
    Direct {
        /// The wired request line.
        line: u8,
    },
}

/// Pacing parameters of one request line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DreqSetup {
    /// Bus initiator the paced accesses are issued on.
    pub initiator: u8,
    /// Bytes per load/store operation.
    pub buswidth: BusWidth,
    /// Operations issued per request.
    pub maxburst: u32,
    /// Transfer direction the line paces.
    pub direction: Direction,
    /// Cycles to hold off between bursts.
    pub holdoff: u8,
    /// Advance the device address between operations.
    pub increment: bool,
}

impl DreqSetup {
    /// Packs this setup into a control word.
    fn control(&self) -> Result<ReqControl, DreqError> {
        if self.maxburst == 0 || self.maxburst > 0b11111 {
            return Err(DreqError::InvalidBurst(self.maxburst));
        }
        if self.holdoff > 0b1111 {
            return Err(DreqError::InvalidHoldoff(self.holdoff));
        }
        if self.initiator > 0b11 {
            return Err(DreqError::InvalidInitiator(self.initiator));
        }
        let opcode = match self.buswidth {
            BusWidth::One => ReqOpcode::LdSt1,
            BusWidth::Two => ReqOpcode::LdSt2,
            BusWidth::Four => ReqOpcode::LdSt4,
            BusWidth::Eight => ReqOpcode::LdSt8,
            BusWidth::Sixteen => ReqOpcode::LdSt16,
        };
        Ok(ReqControl::new()
            .with(ReqControl::OPCODE, opcode)
            .with(ReqControl::NUM_OPS, self.maxburst)
            .with(
                ReqControl::WRITE_NOT_READ,
                matches!(self.direction, Direction::MemToDev),
            )
            .with(ReqControl::INCREMENT, self.increment)
            .with(ReqControl::HOLDOFF, u32::from(self.holdoff))
            .with(ReqControl::INITIATOR, u32::from(self.initiator)))
    }
}

enum_from_bits! {
    /// Load/store width of one paced operation.
    #[derive(Debug, Eq, PartialEq)]
    #[cfg_attr(test, derive(proptest_derive::Arbitrary))]
    pub enum ReqOpcode<u8> {
        LdSt1 = 0b000,
        LdSt2 = 0b001,
        LdSt4 = 0b010,
        LdSt8 = 0b011,
        LdSt16 = 0b100,
    }
}

bitfield! {
    /// A request-line control word.
    pub struct ReqControl<u32> {
        /// Width of each load/store operation.
        pub const OPCODE: ReqOpcode;
        /// Operations issued per request.
        pub const NUM_OPS = 5;
        /// Paced accesses write toward the device rather than read from it.
        pub const WRITE_NOT_READ: bool;
        /// Advance the device address between operations.
        pub const INCREMENT: bool;
        /// Cycles to hold off between bursts.
        pub const HOLDOFF = 4;
        const _RESERVED = 16;
        /// Bus initiator the accesses are issued on.
        pub const INITIATOR = 2;
    }
}

/// The device-wide request line table.
///
/// Guarded by the owning device's critical section; a line is owned by at
/// most one channel at a time.
pub(crate) struct DreqTable {
    used: u32,
    slots: [Option<DreqSetup>; NUM_LINES as usize],
}

impl DreqTable {
    pub(crate) const fn new() -> Self {
        Self {
            used: 0,
            slots: [None; NUM_LINES as usize],
        }
    }

    /// Claims a line per `select`.
    ///
    /// The line carries no pacing parameters until [`configure`] records
    /// them; programming an unconfigured line fails.
    ///
    /// [`configure`]: Self::configure
    pub(crate) fn claim(
        &mut self,
        select: LineSelect,
        router: Option<&dyn DreqRouter>,
    ) -> Result<u8, DreqError> {
        let line = match select {
            LineSelect::Direct { line } => {
                if line >= NUM_LINES || self.used & (1 << line) != 0 {
                    return Err(DreqError::LineUnavailable(line));
                }
                line
            }
            LineSelect::Routed { peripheral } => {
                let line = (!self.used).trailing_zeros();
                if line >= u32::from(NUM_LINES) {
                    return Err(DreqError::Exhausted);
                }
                let line = line as u8;
                let router = router.ok_or(DreqError::NoRouter)?;
                router.route(peripheral, line).map_err(DreqError::Routing)?;
                line
            }
        };
        self.used |= 1 << line;
        trace!(line, "claimed DREQ line");
        Ok(line)
    }

    /// Records the pacing parameters of a claimed line.
    pub(crate) fn configure(&mut self, line: u8, setup: DreqSetup) {
        debug_assert!(
            self.used & (1 << line) != 0,
            "configured an unclaimed request line ({line})"
        );
        self.slots[line as usize] = Some(setup);
    }

    /// Returns `line` to the free pool.
    pub(crate) fn release(&mut self, line: u8) {
        debug_assert!(
            self.used & (1 << line) != 0,
            "released an unclaimed request line ({line})"
        );
        self.used &= !(1 << line);
        self.slots[line as usize] = None;
        trace!(line, "released DREQ line");
    }

    /// Programs `line`'s control register from the recorded setup.
    ///
    /// The word is recomputed on every call, so reprogramming after a
    /// reconfiguration is just another call.
    pub(crate) fn program(
        &self,
        line: u8,
        bus: &dyn RegisterBus,
        layout: &RegLayout,
    ) -> Result<(), DreqError> {
        let setup = self.slots[line as usize]
            .as_ref()
            .ok_or(DreqError::LineUnavailable(line))?;
        let control = setup.control()?;
        bus.write(layout.req_ctrl(line), control.bits());
        trace!(line, control = %control, "programmed DREQ line");
        Ok(())
    }
}

/// Connects crossbar inputs to engine request lines.
///
/// Implemented by the platform's crossbar driver and found through a
/// [`RouterRegistry`].
pub trait DreqRouter: Sync {
    /// Connects crossbar input `peripheral` to request line `line`.
    fn route(&self, peripheral: u32, line: u8) -> Result<(), RoutingFailed>;
}

/// The crossbar could not make the requested connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RoutingFailed;

impl fmt::Display for RoutingFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the crossbar refused the connection")
    }
}

/// A registration table of crossbar routers, looked up by crossbar id.
///
/// The platform registers its crossbar drivers here once at startup and
/// passes the registry to every engine instance that sits behind one.
pub struct RouterRegistry {
    routers: Mutex<RefCell<heapless::Vec<Registration, { RouterRegistry::CAPACITY }>>>,
}

struct Registration {
    xbar: u8,
    router: &'static dyn DreqRouter,
}

impl RouterRegistry {
    /// Maximum number of crossbars one registry tracks.
    pub const CAPACITY: usize = 4;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            routers: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    /// Registers `router` as the crossbar with id `xbar`.
    pub fn register(
        &self,
        xbar: u8,
        router: &'static dyn DreqRouter,
    ) -> Result<(), RegistrationError> {
        critical_section::with(|cs| {
            let mut routers = self.routers.borrow_ref_mut(cs);
            if routers.iter().any(|r| r.xbar == xbar) {
                return Err(RegistrationError::Duplicate(xbar));
            }
            routers
                .push(Registration { xbar, router })
                .map_err(|_| RegistrationError::Full)
        })
    }

    /// Finds the router registered for crossbar `xbar`.
    pub(crate) fn lookup(&self, xbar: u8) -> Option<&'static dyn DreqRouter> {
        critical_section::with(|cs| {
            self.routers
                .borrow_ref(cs)
                .iter()
                .find(|r| r.xbar == xbar)
                .map(|r| r.router)
        })
    }
}

impl Default for RouterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors returned by [`RouterRegistry::register`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistrationError {
    /// The registry's capacity is exhausted.
    Full,
    /// A router is already registered for this crossbar id.
    Duplicate(u8),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(
                f,
                "the registry only has room for {} routers",
                RouterRegistry::CAPACITY
            ),
            Self::Duplicate(xbar) => {
                write!(f, "a router is already registered for crossbar {xbar}")
            }
        }
    }
}

/// Errors returned by request line operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DreqError {
    /// All 32 request lines are claimed.
    Exhausted,
    /// The requested line does not exist or is already claimed.
    LineUnavailable(u8),
    /// This engine has no crossbar, or none is registered for its id.
    NoRouter,
    /// The crossbar refused the connection.
    Routing(RoutingFailed),
    /// The burst length does not fit the control word.
    InvalidBurst(u32),
    /// The hold-off does not fit the control word.
    InvalidHoldoff(u8),
    /// The initiator id does not fit the control word.
    InvalidInitiator(u8),
}

impl fmt::Display for DreqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "all {NUM_LINES} request lines are claimed"),
            Self::LineUnavailable(line) => {
                write!(f, "request line {line} does not exist or is already claimed")
            }
            Self::NoRouter => f.write_str("no router is registered for this crossbar"),
            Self::Routing(err) => fmt::Display::fmt(err, f),
            Self::InvalidBurst(burst) => {
                write!(f, "burst length {burst} does not fit the control word")
            }
            Self::InvalidHoldoff(holdoff) => {
                write!(f, "hold-off {holdoff} does not fit the control word")
            }
            Self::InvalidInitiator(initiator) => {
                write!(f, "initiator {initiator} does not fit the control word")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use proptest::{prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn req_control_is_valid() {
        ReqControl::assert_valid();
    }

    proptest! {
        #[test]
        fn pack_req_control(
            opcode: ReqOpcode,
            num_ops in 0u32..0b11111,
            write: bool,
            increment: bool,
            holdoff in 0u32..0b1111,
            initiator in 0u32..0b11,
        ) {
            let control = ReqControl::new()
                .with(ReqControl::OPCODE, opcode)
                .with(ReqControl::NUM_OPS, num_ops)
                .with(ReqControl::WRITE_NOT_READ, write)
                .with(ReqControl::INCREMENT, increment)
                .with(ReqControl::HOLDOFF, holdoff)
                .with(ReqControl::INITIATOR, initiator);

            let mut manual = opcode as u32;
            manual |= num_ops << 3;
            manual |= (write as u32) << 8;
            manual |= (increment as u32) << 9;
            manual |= holdoff << 10;
            manual |= initiator << 30;

            prop_assert_eq!(
                manual,
                control.bits(),
                "\n{:032b} (expected), vs:\n{}",
                manual,
                control
            );
        }
    }

    struct RecordingRouter {
        routes: StdMutex<Vec<(u32, u8)>>,
    }

    impl RecordingRouter {
        const fn new() -> Self {
            Self {
                routes: StdMutex::new(Vec::new()),
            }
        }
    }

    impl DreqRouter for RecordingRouter {
        fn route(&self, peripheral: u32, line: u8) -> Result<(), RoutingFailed> {
            self.routes.lock().unwrap().push((peripheral, line));
            Ok(())
        }
    }

    fn paced_setup() -> DreqSetup {
        DreqSetup {
            initiator: 0,
            buswidth: BusWidth::Four,
            maxburst: 4,
            direction: Direction::DevToMem,
            holdoff: 0,
            increment: false,
        }
    }

    #[test]
    fn direct_claims_exhaust_at_32() {
        let router = RecordingRouter::new();
        let mut table = DreqTable::new();

        for line in 0..NUM_LINES {
            let got = table
                .claim(LineSelect::Direct { line }, None)
                .expect("every line starts out free");
            assert_eq!(got, line);
        }

        assert_eq!(
            table.claim(LineSelect::Direct { line: 5 }, None),
            Err(DreqError::LineUnavailable(5)),
        );
        assert_eq!(
            table.claim(LineSelect::Routed { peripheral: 9 }, Some(&router)),
            Err(DreqError::Exhausted),
        );
        assert!(
            router.routes.lock().unwrap().is_empty(),
            "the crossbar is not consulted when no line is free"
        );

        table.release(7);
        let got = table
            .claim(LineSelect::Routed { peripheral: 9 }, Some(&router))
            .expect("the released line is claimable again");
        assert_eq!(got, 7);
        assert_eq!(*router.routes.lock().unwrap(), vec![(9, 7)]);
    }

    #[test]
    fn routed_claim_requires_router() {
        let mut table = DreqTable::new();
        assert_eq!(
            table.claim(LineSelect::Routed { peripheral: 0 }, None),
            Err(DreqError::NoRouter),
        );
    }

    #[test]
    fn unconfigured_line_cannot_be_programmed() {
        struct NoBus;
        impl RegisterBus for NoBus {
            fn read(&self, _: u32) -> u32 {
                panic!("no register reads expected")
            }
            fn write(&self, offset: u32, _: u32) {
                panic!("wrote {offset:#x} through an unconfigured line")
            }
        }

        let mut table = DreqTable::new();
        let line = table
            .claim(LineSelect::Direct { line: 3 }, None)
            .expect("line 3 is free");
        assert_eq!(
            table.program(line, &NoBus, &crate::test_util::test_layout()),
            Err(DreqError::LineUnavailable(3)),
        );
        table.configure(line, paced_setup());
    }

    #[test]
    fn reprogramming_repeats_the_same_word() {
        struct RecordingBus {
            writes: StdMutex<Vec<(u32, u32)>>,
        }
        impl RegisterBus for RecordingBus {
            fn read(&self, _: u32) -> u32 {
                panic!("no register reads expected")
            }
            fn write(&self, offset: u32, value: u32) {
                self.writes.lock().unwrap().push((offset, value));
            }
        }

        let bus = RecordingBus {
            writes: StdMutex::new(Vec::new()),
        };
        let layout = crate::test_util::test_layout();
        let mut table = DreqTable::new();
        let line = table
            .claim(LineSelect::Direct { line: 6 }, None)
            .expect("line 6 is free");
        table.configure(line, paced_setup());

        table.program(line, &bus, &layout).expect("first program");
        table.program(line, &bus, &layout).expect("second program");

        let writes = bus.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], writes[1]);
        assert_eq!(writes[0].0, layout.req_ctrl(line));
    }

    #[test]
    fn registry_rejects_duplicates_and_fills_up() {
        struct NullRouter;
        impl DreqRouter for NullRouter {
            fn route(&self, _: u32, _: u8) -> Result<(), RoutingFailed> {
                Ok(())
            }
        }
        static ROUTER: NullRouter = NullRouter;

        let registry = RouterRegistry::new();
        registry.register(0, &ROUTER).expect("the registry is empty");
        assert_eq!(
            registry.register(0, &ROUTER),
            Err(RegistrationError::Duplicate(0)),
        );
        for xbar in 1..RouterRegistry::CAPACITY as u8 {
            registry
                .register(xbar, &ROUTER)
                .expect("the registry has room");
        }
        assert_eq!(
            registry.register(9, &ROUTER),
            Err(RegistrationError::Full),
        );
        assert!(registry.lookup(2).is_some());
        assert!(registry.lookup(9).is_none());
    }

    #[test]
    fn burst_must_fit() {
        let mut setup = paced_setup();
        setup.maxburst = 32;
        assert!(matches!(setup.control(), Err(DreqError::InvalidBurst(32))));
        setup.maxburst = 0;
        assert!(matches!(setup.control(), Err(DreqError::InvalidBurst(0))));
    }
}
