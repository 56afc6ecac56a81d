//! Firmware load and engine bring-up.
//!
//! The engine is a microcoded core that does nothing until its firmware has
//! been copied into the instruction and data memories and the core released
//! from reset. The first channel allocation triggers the load; every later
//! caller just observes the phase. The load happens exactly once per device
//! lifetime, successful or not.

use core::{cell::Cell, fmt};

use alloc::vec::Vec;
use critical_section::Mutex;
use maitake_sync::WaitQueue;
use tracing::{info, warn};

use crate::hw::{FwSource, RegLayout, RegisterBus};

/// Machine id the image header must carry for the engine's SLIM core.
pub const SLIM_MACHINE_ID: u16 = 0x534c;

/// Header flags word of a plain executable image.
pub const SLIM_IMAGE_FLAGS: u32 = 0x1;

/// Reads of the revision register allowed before bring-up is declared dead.
const BOOT_POLL_BUDGET: usize = 1000;

/// A parsed firmware image, as supplied by the platform's [`FwSource`].
#[derive(Clone, Debug)]
pub struct FwImage {
    /// Machine id from the image header.
    pub machine: u16,
    /// Flags word from the image header.
    pub flags: u32,
    /// Whether the image was linked as executable.
    pub executable: bool,
    /// Program segments, in header order.
    pub segments: Vec<FwSegment>,
}

/// One program segment of a [`FwImage`].
#[derive(Clone, Debug)]
pub struct FwSegment {
    /// Whether the segment is marked for loading.
    pub loadable: bool,
    /// Bus address the segment is linked at.
    pub addr: u32,
    /// Segment payload, in engine words.
    pub data: Vec<u32>,
}

impl FwSegment {
    fn len_bytes(&self) -> u32 {
        (self.data.len() as u32) * 4
    }
}

/// Load state of the engine firmware.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FwPhase {
    /// No load has been attempted.
    Init,
    /// A load is in flight.
    Loading,
    /// The engine is running the firmware.
    Loaded,
    /// A load failed; the engine is unusable.
    Error,
}

/// The engine firmware phase plus the queue of tasks waiting on it.
pub(crate) struct FwState {
    phase: Mutex<Cell<FwPhase>>,
    /// Closed once `phase` reaches a terminal state.
    progress: WaitQueue,
}

enum Gate {
    /// This caller performs the load.
    Load,
    Ready,
    Failed,
    Wait,
}

impl FwState {
    pub(crate) const fn new() -> Self {
        Self {
            phase: Mutex::new(Cell::new(FwPhase::Init)),
            progress: WaitQueue::new(),
        }
    }

    pub(crate) fn phase(&self) -> FwPhase {
        critical_section::with(|cs| self.phase.borrow(cs).get())
    }

    fn gate(&self) -> Gate {
        critical_section::with(|cs| {
            let phase = self.phase.borrow(cs);
            match phase.get() {
                FwPhase::Init => {
                    phase.set(FwPhase::Loading);
                    Gate::Load
                }
                FwPhase::Loading => Gate::Wait,
                FwPhase::Loaded => Gate::Ready,
                FwPhase::Error => Gate::Failed,
            }
        })
    }

    fn finish(&self, phase: FwPhase) {
        critical_section::with(|cs| self.phase.borrow(cs).set(phase));
        // closing rather than waking means a waiter that registers after
        // this point still returns immediately.
        self.progress.close();
    }

    /// Drives the firmware to `Loaded`, loading it on the first call.
    ///
    /// Exactly one caller performs the load; everyone else waits for its
    /// outcome. Once the phase has reached `Loaded` or `Error` it never
    /// changes again.
    pub(crate) async fn ensure_loaded(
        &self,
        bus: &dyn RegisterBus,
        layout: &RegLayout,
        source: &dyn FwSource,
    ) -> Result<(), NotReady> {
        loop {
            match self.gate() {
                Gate::Ready => return Ok(()),
                Gate::Failed => return Err(NotReady),
                Gate::Load => {
                    let phase = match load(bus, layout, source) {
                        Ok(revision) => {
                            info!(revision, "FDMA firmware loaded");
                            FwPhase::Loaded
                        }
                        Err(error) => {
                            warn!(%error, "FDMA firmware load failed");
                            FwPhase::Error
                        }
                    };
                    self.finish(phase);
                    // loop around; the next gate check reports the outcome.
                }
                // a closed-queue error means the load settled while this
                // waiter was registering; the next gate check sees it.
                Gate::Wait => {
                    let _ = self.progress.wait().await;
                }
            }
        }
    }
}

/// Validates the image, copies its segments into the engine memories, and
/// brings the core up.
///
/// Returns the firmware revision the engine reports.
fn load(
    bus: &dyn RegisterBus,
    layout: &RegLayout,
    source: &dyn FwSource,
) -> Result<u32, LoadError> {
    let image = source.firmware().map_err(LoadError::Source)?;
    validate(&image, layout).map_err(LoadError::Image)?;

    for segment in image.segments.iter().filter(|s| s.loadable) {
        for (i, &word) in segment.data.iter().enumerate() {
            bus.write(segment.addr + (i as u32) * 4, word);
        }
    }

    // ungate the clock, sync the bus bridge, and release the core.
    bus.write(layout.clk_gate, 1);
    bus.write(layout.sync, 1);
    bus.write(layout.enable, 1);

    // the core publishes its firmware revision once it is executing.
    for _ in 0..BOOT_POLL_BUDGET {
        let revision = bus.read(layout.revision);
        if revision != 0 {
            return Ok(revision);
        }
    }
    Err(LoadError::BootTimeout)
}

fn validate(image: &FwImage, layout: &RegLayout) -> Result<(), BadImage> {
    if !image.executable {
        return Err(BadImage::NotExecutable);
    }
    if image.machine != SLIM_MACHINE_ID {
        return Err(BadImage::WrongMachine(image.machine));
    }
    if image.flags != SLIM_IMAGE_FLAGS {
        return Err(BadImage::WrongFlags(image.flags));
    }
    let mut loadable = 0;
    for segment in image.segments.iter().filter(|s| s.loadable) {
        let len = segment.len_bytes();
        if !layout.dmem.contains(segment.addr, len) && !layout.imem.contains(segment.addr, len) {
            return Err(BadImage::SegmentOutOfWindow {
                addr: segment.addr,
                len,
            });
        }
        loadable += 1;
    }
    if loadable != 2 {
        return Err(BadImage::SegmentCount(loadable));
    }
    Ok(())
}

/// The firmware is not loaded and cannot become loaded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotReady;

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the engine firmware is not loaded")
    }
}

/// Errors a [`FwSource`] reports when it cannot supply an image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FwError {
    /// No firmware container is available on this platform.
    NotFound,
    /// The container exists but does not parse.
    Malformed,
}

impl fmt::Display for FwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no firmware container is available"),
            Self::Malformed => f.write_str("the firmware container does not parse"),
        }
    }
}

/// Reasons an image fails validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BadImage {
    /// The image is not marked executable.
    NotExecutable,
    /// The image targets a different machine.
    WrongMachine(u16),
    /// The header flags are not those of a plain executable.
    WrongFlags(u32),
    /// The image does not carry exactly two loadable segments.
    SegmentCount(usize),
    /// A loadable segment lies outside both engine memories.
    SegmentOutOfWindow {
        /// Bus address of the offending segment.
        addr: u32,
        /// Length of the offending segment in bytes.
        len: u32,
    },
}

impl fmt::Display for BadImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotExecutable => f.write_str("the image is not executable"),
            Self::WrongMachine(machine) => write!(
                f,
                "the image targets machine {machine:#x}, not {SLIM_MACHINE_ID:#x}"
            ),
            Self::WrongFlags(flags) => write!(
                f,
                "the image header flags are {flags:#x}, not {SLIM_IMAGE_FLAGS:#x}"
            ),
            Self::SegmentCount(count) => {
                write!(f, "the image carries {count} loadable segments, not 2")
            }
            Self::SegmentOutOfWindow { addr, len } => write!(
                f,
                "segment [{addr:#x}, {:#x}) lies outside both engine memories",
                addr.wrapping_add(*len)
            ),
        }
    }
}

/// Why a load attempt failed.
#[derive(Clone, Debug, Eq, PartialEq)]
enum LoadError {
    /// The platform could not supply an image.
    Source(FwError),
    /// The image failed validation.
    Image(BadImage),
    /// The engine never published a firmware revision.
    BootTimeout,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(err) => fmt::Display::fmt(err, f),
            Self::Image(err) => fmt::Display::fmt(err, f),
            Self::BootTimeout => f.write_str("the engine never published a firmware revision"),
        }
    }
}
