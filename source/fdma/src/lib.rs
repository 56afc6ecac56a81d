//! # Driver core for the STMicroelectronics FDMA
//!
//! The FDMA is the flexible DMA controller of the STi SoC family: a small
//! microcoded core (the SLIM) that executes chains of linked-list units out
//! of DMA-coherent memory, sixteen channels at a time, paced by up to 32
//! peripheral request lines. The core runs firmware, so nothing moves until
//! the image has been loaded into the engine's instruction and data memories
//! and the core released from reset; the driver performs that load on the
//! first channel allocation.
//!
//! ## Platform seams
//!
//! The driver never touches hardware directly. A platform hands [`Fdma::new`]
//! three trait objects and a configuration:
//!
//! * [`hw::RegisterBus`] reads and writes the instance's registers,
//! * [`hw::LluPool`] allocates DMA-coherent, 32-byte aligned node memory,
//! * [`hw::FwSource`] supplies the parsed firmware image,
//! * [`hw::FdmaConfig`] describes the register layout, the optional request
//!   crossbar, and the per-channel descriptor pre-allocation.
//!
//! The same driver body then serves any SoC revision whose register offsets
//! fit the layout table.
//!
//! ## Using a channel
//!
//! [`Fdma::alloc_channel`] claims a channel and returns a [`ChannelHandle`].
//! Paced channels take a device FIFO description via
//! [`configure_slave`](channel::ChannelHandle::configure_slave); every
//! channel then builds transfers with the `prep_*` constructors, attaches an
//! optional completion callback, and queues them with
//! [`submit`](channel::Transfer::submit). The platform's interrupt handler
//! must forward the engine's interrupt to [`Fdma::handle_interrupt`], which
//! advances the channel state machines and delivers completions.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod channel;
pub mod desc;
pub mod device;
pub mod dreq;
pub mod fw;
pub mod hw;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::{
    channel::ChannelHandle,
    device::{AllocError, ChannelConfig, Fdma},
};
