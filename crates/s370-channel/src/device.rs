//! Device contract and the engine context handle.
//!
//! Every peripheral implements [`Device`]. The channel engine calls the
//! five synchronous entry points; the device drives its side of a transfer
//! by scheduling callbacks and calling back into the engine through the
//! [`IoContext`] it is handed: pulling or pushing bytes, and reporting
//! channel end / device end / errors.
//!
//! `IoContext` is a borrow bundle over the three owned pieces of the I/O
//! subsystem: the channel set, main storage, and the event queue. The
//! driver constructs one per entry; devices never hold it across calls.
//! While the engine is calling into a device, that device is out of its
//! table slot, so the context can be handed to it without aliasing.

use std::path::Path;

use crate::channel::ChannelSet;
use crate::events::EventQueue;
use s370_storage::Storage;

/// Output sink for terminal-style devices: delivered characters go back
/// to whatever front end is connected.
pub type TermSink = std::sync::mpsc::Sender<Vec<u8>>;

/// Capability set every emulated peripheral implements.
pub trait Device: Send {
    /// Device selection: 0 to accept, or a status byte.
    fn start_io(&mut self, ctx: &mut IoContext<'_>) -> u8;

    /// Start a command. Returns busy if the device cannot accept, 0 when
    /// completion will arrive asynchronously, or immediate ending status.
    fn start_cmd(&mut self, ctx: &mut IoContext<'_>, cmd: u8) -> u8;

    /// Halt whatever is in progress. Returns the condition code for HIO.
    fn halt_io(&mut self, ctx: &mut IoContext<'_>) -> u8;

    /// Power-on reset. Non-zero status becomes pending device status.
    fn init_dev(&mut self) -> u8;

    /// Scheduled callback, dispatched when a timer the device set expires.
    fn event(&mut self, ctx: &mut IoContext<'_>, arg: i32);

    /// Orderly shutdown when the simulation exits.
    fn shutdown(&mut self) {}

    /// One-line state summary for the control server.
    fn debug(&self) -> String {
        String::new()
    }

    /// A front end connected to this device.
    fn connect(&mut self, _ctx: &mut IoContext<'_>, _out: TermSink) {}

    /// The front end went away.
    fn disconnect(&mut self, _ctx: &mut IoContext<'_>) {}

    /// Characters arrived from the front end.
    fn receive(&mut self, _ctx: &mut IoContext<'_>, _data: &[u8]) {}

    /// Attach backing media.
    fn attach(&mut self, _path: &Path) -> Result<(), String> {
        Err("device does not support attach".into())
    }

    /// Detach backing media.
    fn detach(&mut self) -> Result<(), String> {
        Err("device does not support detach".into())
    }
}

/// Borrowed view of the I/O subsystem for one engine entry.
pub struct IoContext<'a> {
    pub chans: &'a mut ChannelSet,
    pub mem: &'a mut Storage,
    pub events: &'a mut EventQueue,
}

impl<'a> IoContext<'a> {
    pub fn new(
        chans: &'a mut ChannelSet,
        mem: &'a mut Storage,
        events: &'a mut EventQueue,
    ) -> Self {
        Self { chans, mem, events }
    }

    /// Schedule a device callback `cycles` in the future. A zero delay
    /// dispatches the callback right now and leaves the queue untouched.
    pub fn schedule(&mut self, dev: u16, cycles: u32, arg: i32) {
        if cycles == 0 {
            self.dispatch_event(dev, arg);
        } else {
            self.events.schedule(dev, cycles, arg);
        }
    }

    /// Cancel the first queued callback matching `(dev, arg)`.
    pub fn cancel(&mut self, dev: u16, arg: i32) {
        self.events.cancel(dev, arg);
    }

    /// Advance virtual time, firing due callbacks in delta order. This is
    /// a driver entry point; device callbacks must not re-enter it.
    pub fn advance(&mut self, cycles: u32) {
        self.events.begin_advance(cycles);
        while let Some((dev, arg)) = self.events.pop_due() {
            self.dispatch_event(dev, arg);
        }
    }

    fn dispatch_event(&mut self, dev: u16, arg: i32) {
        // An event for a device that has been unplugged just drops
        if let Some(mut d) = self.chans.take_device(dev) {
            d.event(self, arg);
            self.chans.restore_device(dev, d);
        }
    }

    /// Call into a device with the context available for upcalls. Returns
    /// `None` when no device is reachable at `dev`.
    pub(crate) fn with_device<R>(
        &mut self,
        dev: u16,
        f: impl FnOnce(&mut Self, &mut dyn Device) -> R,
    ) -> Option<R> {
        let mut d = self.chans.take_device(dev)?;
        let r = f(self, &mut *d);
        self.chans.restore_device(dev, d);
        Some(r)
    }

    /// Forward connect to a device.
    pub fn device_connect(&mut self, dev: u16, out: TermSink) {
        self.with_device(dev, |ctx, d| d.connect(ctx, out));
    }

    /// Forward disconnect to a device.
    pub fn device_disconnect(&mut self, dev: u16) {
        self.with_device(dev, |ctx, d| d.disconnect(ctx));
    }

    /// Forward received characters to a device.
    pub fn device_receive(&mut self, dev: u16, data: &[u8]) {
        self.with_device(dev, |ctx, d| d.receive(ctx, data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelKind;

    /// Counts callbacks, and optionally reschedules itself once.
    struct Ticker {
        addr: u16,
        fired: u32,
        chain_once: bool,
    }

    impl Device for Ticker {
        fn start_io(&mut self, _ctx: &mut IoContext<'_>) -> u8 {
            0
        }
        fn start_cmd(&mut self, _ctx: &mut IoContext<'_>, _cmd: u8) -> u8 {
            0
        }
        fn halt_io(&mut self, _ctx: &mut IoContext<'_>) -> u8 {
            0
        }
        fn init_dev(&mut self) -> u8 {
            0
        }
        fn event(&mut self, ctx: &mut IoContext<'_>, arg: i32) {
            self.fired += 1;
            if self.chain_once {
                self.chain_once = false;
                ctx.schedule(self.addr, 5, arg);
            }
        }
        fn debug(&self) -> String {
            format!("fired={}", self.fired)
        }
    }

    fn rig() -> (ChannelSet, Storage, EventQueue) {
        let mut chans = ChannelSet::new();
        chans
            .add_channel(0, ChannelKind::Multiplexer, 256)
            .expect("channel");
        chans
            .add_device(
                0x00F,
                Box::new(Ticker {
                    addr: 0x00F,
                    fired: 0,
                    chain_once: false,
                }),
            )
            .expect("device");
        (chans, Storage::new(64), EventQueue::new())
    }

    #[test]
    fn zero_delay_dispatches_immediately() {
        let (mut chans, mut mem, mut events) = rig();
        let mut io = IoContext::new(&mut chans, &mut mem, &mut events);
        io.schedule(0x00F, 0, 0);
        assert!(!io.events.any_event());
        assert_eq!(io.chans.device_debug(0x00F).as_deref(), Some("fired=1"));
    }

    #[test]
    fn advance_fires_due_callbacks() {
        let (mut chans, mut mem, mut events) = rig();
        let mut io = IoContext::new(&mut chans, &mut mem, &mut events);
        io.schedule(0x00F, 10, 0);
        io.advance(9);
        assert_eq!(io.chans.device_debug(0x00F).as_deref(), Some("fired=0"));
        io.advance(1);
        assert_eq!(io.chans.device_debug(0x00F).as_deref(), Some("fired=1"));
    }

    #[test]
    fn callback_can_reschedule_itself() {
        let (mut chans, mut mem, mut events) = rig();
        // Swap in a self-chaining ticker
        chans.take_device(0x00F);
        chans.restore_device(
            0x00F,
            Box::new(Ticker {
                addr: 0x00F,
                fired: 0,
                chain_once: true,
            }),
        );
        let mut io = IoContext::new(&mut chans, &mut mem, &mut events);
        io.schedule(0x00F, 10, 0);
        io.advance(10);
        // First firing rescheduled 5 ahead; it must not fire in the same
        // advance
        assert_eq!(io.chans.device_debug(0x00F).as_deref(), Some("fired=1"));
        io.advance(5);
        assert_eq!(io.chans.device_debug(0x00F).as_deref(), Some("fired=2"));
    }

    #[test]
    fn event_for_missing_device_is_dropped() {
        let mut chans = ChannelSet::new();
        chans
            .add_channel(0, ChannelKind::Multiplexer, 256)
            .expect("channel");
        let mut mem = Storage::new(64);
        let mut events = EventQueue::new();
        let mut io = IoContext::new(&mut chans, &mut mem, &mut events);
        io.events.schedule(0x0FF, 1, 0);
        io.advance(1);
        assert!(!io.events.any_event());
    }
}
