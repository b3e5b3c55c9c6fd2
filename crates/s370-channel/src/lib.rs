//! IBM System/370 channel subsystem.
//!
//! The channel is the mainframe's I/O coprocessor: the CPU issues SIO/TIO/
//! HIO/TCH against a 12-bit device address, and the channel fetches Channel
//! Command Words from main storage, drives the device through the I/O
//! program, and reports completion in a Channel Status Word.
//!
//! # Fixed storage locations
//!
//! | Address | Contents |
//! |---------|----------|
//! | `$40`   | CSW word 1: key + address past the last CCW fetched |
//! | `$44`   | CSW word 2: 16-bit status, 16-bit residual count |
//! | `$48`   | CAW: key + address of the first CCW |
//!
//! # Status halfword
//!
//! Byte 0 carries device status (attention, busy, channel end, device end,
//! unit check...), byte 1 carries channel status (PCI, incorrect length,
//! program check, protection check...). CPU code reads the CSW by bit
//! position, so the layout here is bit-exact.
//!
//! A channel is one of selector / multiplexer / block multiplexer; each
//! present channel owns a 256-slot device table and 1, up to 256, or 32
//! subchannels respectively. The subchannel holds the live state of one
//! I/O program: CCW pointer, data address, count, flags, the word buffer
//! the byte pump works through, and the accumulated status.

mod ccw;
mod channel;
mod device;
mod events;
mod scan;
mod transfer;

#[cfg(feature = "test-utils")]
pub mod testdev;

pub use channel::{ChannelKind, ChannelSet, MAX_CHANNELS};
pub use device::{Device, IoContext, TermSink};
pub use events::EventQueue;

/// CSW location in storage.
pub const CSW_ADDR: u32 = 0x40;
/// CAW location in storage.
pub const CAW_ADDR: u32 = 0x48;

// Device status byte, as returned from device entry points. Shifted into
// byte 0 of the status halfword.
pub const DEV_ATTN: u8 = 0x80;
pub const DEV_SMS: u8 = 0x40;
pub const DEV_CTL_END: u8 = 0x20;
pub const DEV_BUSY: u8 = 0x10;
pub const DEV_CHAN_END: u8 = 0x08;
pub const DEV_DEV_END: u8 = 0x04;
pub const DEV_UNIT_CHECK: u8 = 0x02;
pub const DEV_UNIT_EXCEPTION: u8 = 0x01;

// Channel status halfword bits.
pub const STATUS_ATTN: u16 = 0x8000;
pub const STATUS_SMS: u16 = 0x4000;
pub const STATUS_CTL_END: u16 = 0x2000;
pub const STATUS_BUSY: u16 = 0x1000;
pub const STATUS_CHAN_END: u16 = 0x0800;
pub const STATUS_DEV_END: u16 = 0x0400;
pub const STATUS_UNIT_CHECK: u16 = 0x0200;
pub const STATUS_UNIT_EXCEPTION: u16 = 0x0100;
pub const STATUS_PCI: u16 = 0x0080;
pub const STATUS_LENGTH: u16 = 0x0040;
pub const STATUS_PROG_CHK: u16 = 0x0020;
pub const STATUS_PROT_CHK: u16 = 0x0010;
pub const STATUS_CHAN_DATA_CHK: u16 = 0x0008;
pub const STATUS_CHAN_CTL_CHK: u16 = 0x0004;
pub const STATUS_INTERFACE_CHK: u16 = 0x0002;
pub const STATUS_CHAINING_CHK: u16 = 0x0001;

/// Status bits that represent an error the CPU must see.
pub const ERROR_STATUS: u16 = STATUS_ATTN
    | STATUS_PCI
    | STATUS_UNIT_EXCEPTION
    | STATUS_UNIT_CHECK
    | STATUS_PROT_CHK
    | STATUS_CHAN_DATA_CHK
    | STATUS_CHAN_CTL_CHK
    | STATUS_INTERFACE_CHK
    | STATUS_CHAINING_CHK;

// CCW command low nibble.
pub const CMD_WRITE: u8 = 0x1;
pub const CMD_READ: u8 = 0x2;
pub const CMD_CTL: u8 = 0x3;
pub const CMD_SENSE: u8 = 0x4;
pub const CMD_TIC: u8 = 0x8;
pub const CMD_READ_BWD: u8 = 0xC;

// CCW flag byte (high byte of CCW word 1).
pub const FLAG_CD: u16 = 0x80;
pub const FLAG_CC: u16 = 0x40;
pub const FLAG_SLI: u16 = 0x20;
pub const FLAG_SKIP: u16 = 0x10;
pub const FLAG_PCI: u16 = 0x08;
pub const FLAG_IDA: u16 = 0x04;

/// Byte-pump position sentinel: the word buffer needs a refill. This is
/// exactly the lane index one past byte 3, so the forward increment lands
/// on it naturally.
pub const BUF_EMPTY: u8 = 0x04;
/// Byte-pump position sentinel: the transfer is over, no more data moves.
pub const BUF_END: u8 = 0x10;
