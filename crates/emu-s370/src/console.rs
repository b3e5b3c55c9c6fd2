//! Operator console device.
//!
//! A line-mode printer-keyboard in the 1052 mould, wired to a terminal
//! front end through the connect/receive hooks. Output commands type
//! storage bytes out to the connected sink; input typed at the front end
//! collects in a line buffer and raises attention, and a read command
//! then feeds the line to the channel.
//!
//! | Command | Behavior |
//! |---------|----------|
//! | `$01`   | write: type bytes from storage to the front end |
//! | `$02`   | read: feed the buffered input line to the channel |
//! | `$03`   | no-op |
//! | `$04`   | sense |
//!
//! With nothing connected, writes are accepted and discarded, the way a
//! console with the motor off still takes orders.

use s370_channel::{
    DEV_ATTN, DEV_CHAN_END, DEV_DEV_END, DEV_UNIT_CHECK, Device, IoContext, TermSink,
};

/// Sense: command reject.
const SENSE_CMD_REJECT: u8 = 0x80;
/// Sense: intervention required (no input line buffered).
const SENSE_INTERVENTION: u8 = 0x40;

/// Cycles per typed character.
const CHAR_TICK: u32 = 100;

/// Operator console.
pub struct Console {
    addr: u16,
    sink: Option<TermSink>,
    /// Input collected from the front end, drained by read commands.
    input: Vec<u8>,
    /// Output gathered during a write command, flushed at channel end.
    output: Vec<u8>,
    sense: u8,
    cmd: u8,
    pos: usize,
}

impl Console {
    #[must_use]
    pub fn new(addr: u16) -> Self {
        Self {
            addr,
            sink: None,
            input: Vec::new(),
            output: Vec::new(),
            sense: 0,
            cmd: 0,
            pos: 0,
        }
    }

    fn finish(&mut self, ctx: &mut IoContext<'_>, flags: u8) {
        if !self.output.is_empty() {
            if let Some(sink) = &self.sink {
                let _ = sink.send(std::mem::take(&mut self.output));
            } else {
                self.output.clear();
            }
        }
        self.cmd = 0;
        ctx.chan_end(self.addr, flags);
    }
}

impl Device for Console {
    fn start_io(&mut self, _ctx: &mut IoContext<'_>) -> u8 {
        0
    }

    fn start_cmd(&mut self, ctx: &mut IoContext<'_>, cmd: u8) -> u8 {
        if self.cmd != 0 {
            return s370_channel::DEV_BUSY;
        }
        match cmd {
            0x03 => DEV_CHAN_END | DEV_DEV_END,
            0x01 | 0x02 => {
                if cmd == 0x02 && self.input.is_empty() {
                    // Nothing typed yet: ask the operator first
                    self.sense = SENSE_INTERVENTION;
                    return DEV_CHAN_END | DEV_DEV_END | DEV_UNIT_CHECK;
                }
                self.cmd = cmd;
                self.pos = 0;
                ctx.schedule(self.addr, CHAR_TICK, 0);
                0
            }
            0x04 => {
                self.cmd = cmd;
                ctx.schedule(self.addr, CHAR_TICK, 0);
                0
            }
            _ => {
                self.sense = SENSE_CMD_REJECT;
                DEV_CHAN_END | DEV_DEV_END | DEV_UNIT_CHECK
            }
        }
    }

    fn halt_io(&mut self, ctx: &mut IoContext<'_>) -> u8 {
        if self.cmd != 0 {
            ctx.cancel(self.addr, 0);
            self.finish(ctx, DEV_CHAN_END | DEV_DEV_END);
            return 1;
        }
        0
    }

    fn init_dev(&mut self) -> u8 {
        self.cmd = 0;
        self.pos = 0;
        self.sense = 0;
        self.input.clear();
        self.output.clear();
        0
    }

    fn event(&mut self, ctx: &mut IoContext<'_>, _arg: i32) {
        match self.cmd {
            0x01 => {
                let (byte, end) = ctx.chan_read_byte(self.addr);
                if end {
                    self.finish(ctx, DEV_CHAN_END | DEV_DEV_END);
                } else {
                    self.output.push(byte);
                    ctx.schedule(self.addr, CHAR_TICK, 0);
                }
            }
            0x02 => {
                if self.pos >= self.input.len() {
                    self.input.clear();
                    self.finish(ctx, DEV_CHAN_END | DEV_DEV_END);
                    return;
                }
                let byte = self.input[self.pos];
                self.pos += 1;
                if ctx.chan_write_byte(self.addr, byte) || byte == b'\n' {
                    self.input.drain(..self.pos);
                    self.pos = 0;
                    self.finish(ctx, DEV_CHAN_END | DEV_DEV_END);
                } else {
                    ctx.schedule(self.addr, CHAR_TICK, 0);
                }
            }
            0x04 => {
                let _ = ctx.chan_write_byte(self.addr, self.sense);
                self.finish(ctx, DEV_CHAN_END | DEV_DEV_END);
            }
            _ => {}
        }
    }

    fn connect(&mut self, _ctx: &mut IoContext<'_>, out: TermSink) {
        self.sink = Some(out);
    }

    fn disconnect(&mut self, _ctx: &mut IoContext<'_>) {
        self.sink = None;
    }

    fn receive(&mut self, ctx: &mut IoContext<'_>, data: &[u8]) {
        self.input.extend_from_slice(data);
        if self.cmd == 0 {
            // Tell the program the operator typed something
            ctx.set_dev_attn(self.addr, DEV_ATTN);
        }
    }

    fn shutdown(&mut self) {
        self.sink = None;
    }

    fn debug(&self) -> String {
        format!(
            "console {:03X} cmd={:02X} input={} connected={}",
            self.addr,
            self.cmd,
            self.input.len(),
            self.sink.is_some()
        )
    }
}
