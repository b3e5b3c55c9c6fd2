//! CPU seam.
//!
//! The machine drives whatever sits behind this trait one instruction at
//! a time; the implementation reaches storage and the I/O instructions
//! through the context it is handed. Cycle costs feed the event queue, so
//! device timing is measured in the same virtual cycles.

use s370_channel::IoContext;

/// A CPU the driver loop can run.
pub trait Cpu: Send {
    /// Execute one instruction. Returns the cycle cost and whether the
    /// CPU wants to keep running (false on a halt-like wait state).
    fn step(&mut self, io: &mut IoContext<'_>) -> (u32, bool);

    /// Advance the time-of-day clock one tick.
    fn tick_tod(&mut self);

    /// Channel mask for the interrupt scan.
    fn channel_mask(&self) -> u16;

    /// Willing to take an I/O interrupt right now?
    fn irq_enabled(&self) -> bool;

    /// The scan presented an interrupt for `dev`; the CSW is stored.
    fn io_interrupt(&mut self, io: &mut IoContext<'_>, dev: u16);

    /// An IPL finished: the new PSW is at location 0.
    fn ipl_complete(&mut self, io: &mut IoContext<'_>);

    /// Reset to the power-on state.
    fn reset(&mut self);
}

/// Placeholder CPU: burns one cycle per step and takes every interrupt.
/// Lets the machine run headless while the instruction set lives
/// elsewhere.
pub struct IdleCpu {
    /// Device number of the most recent I/O interrupt.
    pub last_interrupt: Option<u16>,
    /// PSW loaded by the last IPL, straight from location 0.
    pub psw: (u32, u32),
}

impl IdleCpu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_interrupt: None,
            psw: (0, 0),
        }
    }
}

impl Default for IdleCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for IdleCpu {
    fn step(&mut self, _io: &mut IoContext<'_>) -> (u32, bool) {
        (1, true)
    }

    fn tick_tod(&mut self) {}

    fn channel_mask(&self) -> u16 {
        0xffff
    }

    fn irq_enabled(&self) -> bool {
        true
    }

    fn io_interrupt(&mut self, _io: &mut IoContext<'_>, dev: u16) {
        self.last_interrupt = Some(dev);
    }

    fn ipl_complete(&mut self, io: &mut IoContext<'_>) {
        let (w0, _) = io.mem.get_word(0);
        let (w1, _) = io.mem.get_word(4);
        self.psw = (w0, w1);
    }

    fn reset(&mut self) {
        self.last_interrupt = None;
        self.psw = (0, 0);
    }
}
