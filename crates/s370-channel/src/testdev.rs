//! Reference test device.
//!
//! A minimal peripheral that exercises every channel path: it transfers
//! through a 256-byte buffer, one byte per 10-cycle callback, and offers a
//! handful of special commands for the ending-status corners.
//!
//! | Command | Behavior |
//! |---------|----------|
//! | `$x1`   | write: pull bytes from the channel into the buffer |
//! | `$x2`   | read: push buffer bytes to the channel |
//! | `$xC`   | read backward: same bytes, channel stores descending |
//! | `$03`   | no-op, immediate channel end + device end |
//! | `$0B`   | pull one byte, channel end, device end 10 cycles later |
//! | `$13`   | immediate channel end, device end arrives via attention |
//! | `$04`   | sense: push the sense byte |
//!
//! Anything else sets command reject in sense and ends with unit check.

use crate::device::{Device, IoContext};
use crate::{DEV_BUSY, DEV_CHAN_END, DEV_DEV_END, DEV_SMS, DEV_UNIT_CHECK};

/// Sense: command reject.
pub const SENSE_CMD_REJECT: u8 = 0x80;

/// Cycles between transfer callbacks.
const TICK: u32 = 10;

/// Callback argument: move the next byte.
const ARG_DATA: i32 = 0;
/// Callback argument: present the delayed device end.
const ARG_DEV_END: i32 = 1;

/// Test device: transfers through an internal buffer with configurable
/// length, optionally presenting status modifier with its ending status.
pub struct TestDevice {
    addr: u16,
    pub buffer: [u8; 256],
    /// Bytes the device will transfer before presenting ending status.
    pub max: usize,
    pub sense: u8,
    /// Present status modifier along with channel end + device end.
    pub sms_at_end: bool,
    /// Truncate the current operation at the next callback.
    pub halt: bool,
    cmd: u8,
    pos: usize,
}

impl TestDevice {
    #[must_use]
    pub fn new(addr: u16, max: usize) -> Self {
        Self {
            addr,
            buffer: [0; 256],
            max,
            sense: 0,
            sms_at_end: false,
            halt: false,
            cmd: 0,
            pos: 0,
        }
    }

    /// Preload the transfer buffer.
    pub fn fill(&mut self, data: &[u8]) {
        self.buffer[..data.len()].copy_from_slice(data);
    }

    fn ending_status(&self) -> u8 {
        let mut status = DEV_CHAN_END | DEV_DEV_END;
        if self.sms_at_end {
            status |= DEV_SMS;
        }
        status
    }
}

impl Device for TestDevice {
    fn start_io(&mut self, _ctx: &mut IoContext<'_>) -> u8 {
        0
    }

    fn start_cmd(&mut self, ctx: &mut IoContext<'_>, cmd: u8) -> u8 {
        if self.cmd != 0 {
            return DEV_BUSY;
        }
        self.pos = 0;
        match cmd {
            0x03 => return DEV_CHAN_END | DEV_DEV_END,
            0x13 => {
                // Channel end now, device end 10 cycles from now
                ctx.schedule(self.addr, TICK, ARG_DEV_END);
                return DEV_CHAN_END;
            }
            0x0B | 0x04 => {
                self.cmd = cmd;
                ctx.schedule(self.addr, TICK, ARG_DATA);
                return 0;
            }
            _ => {}
        }
        match cmd & 0x0f {
            0x1 | 0x2 | 0xC => {
                self.cmd = cmd;
                ctx.schedule(self.addr, TICK, ARG_DATA);
                0
            }
            _ => {
                self.sense = SENSE_CMD_REJECT;
                DEV_CHAN_END | DEV_DEV_END | DEV_UNIT_CHECK
            }
        }
    }

    fn halt_io(&mut self, _ctx: &mut IoContext<'_>) -> u8 {
        if self.cmd != 0 {
            self.halt = true;
            return 1;
        }
        0
    }

    fn init_dev(&mut self) -> u8 {
        self.cmd = 0;
        self.pos = 0;
        self.sense = 0;
        self.halt = false;
        0
    }

    fn event(&mut self, ctx: &mut IoContext<'_>, arg: i32) {
        if arg == ARG_DEV_END {
            self.cmd = 0;
            ctx.set_dev_attn(self.addr, DEV_DEV_END);
            return;
        }
        if self.halt {
            self.halt = false;
            self.cmd = 0;
            ctx.chan_end(self.addr, DEV_CHAN_END | DEV_DEV_END);
            return;
        }
        match self.cmd {
            0x0B => {
                // One byte, then split ending status
                let (byte, _end) = ctx.chan_read_byte(self.addr);
                self.buffer[0] = byte;
                self.cmd = 0;
                ctx.chan_end(self.addr, DEV_CHAN_END);
                ctx.schedule(self.addr, TICK, ARG_DEV_END);
                return;
            }
            0x04 => {
                let _ = ctx.chan_write_byte(self.addr, self.sense);
                self.cmd = 0;
                ctx.chan_end(self.addr, DEV_CHAN_END | DEV_DEV_END);
                return;
            }
            _ => {}
        }
        match self.cmd & 0x0f {
            0x1 => {
                let (byte, end) = ctx.chan_read_byte(self.addr);
                if end {
                    self.cmd = 0;
                    ctx.chan_end(self.addr, self.ending_status());
                    return;
                }
                self.buffer[self.pos & 0xff] = byte;
                self.pos += 1;
                if self.pos > self.max {
                    self.cmd = 0;
                    ctx.chan_end(self.addr, self.ending_status());
                } else {
                    ctx.schedule(self.addr, TICK, ARG_DATA);
                }
            }
            0x2 | 0xC => {
                if self.pos >= self.max {
                    self.cmd = 0;
                    ctx.chan_end(self.addr, self.ending_status());
                    return;
                }
                let end = ctx.chan_write_byte(self.addr, self.buffer[self.pos & 0xff]);
                self.pos += 1;
                if end {
                    self.cmd = 0;
                    ctx.chan_end(self.addr, DEV_CHAN_END | DEV_DEV_END);
                } else if self.pos >= self.max {
                    self.cmd = 0;
                    ctx.chan_end(self.addr, self.ending_status());
                } else {
                    ctx.schedule(self.addr, TICK, ARG_DATA);
                }
            }
            _ => {}
        }
    }

    fn debug(&self) -> String {
        format!(
            "testdev {:03X} cmd={:02X} pos={} max={} sense={:02X}",
            self.addr, self.cmd, self.pos, self.max, self.sense
        )
    }
}
