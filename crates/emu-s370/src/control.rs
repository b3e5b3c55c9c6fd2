//! Control messages from the outside world.
//!
//! External producers (the telnet front end, the wall-clock ticker, an
//! operator console) enqueue these on the machine's inbound channel.
//! The driver loop applies at most one per pass and never blocks the
//! producers.

use s370_channel::TermSink;

/// One inbound control message.
pub enum ControlMessage {
    /// A terminal front end connected to a device; delivered characters
    /// go back through `conn`.
    TelConnect { dev: u16, conn: TermSink },
    /// The front end went away.
    TelDisconnect { dev: u16 },
    /// Characters typed at the front end.
    TelReceive { dev: u16, data: Vec<u8> },
    /// Advance the CPU's time-of-day clock.
    TimeClock,
    /// Boot from a device.
    IplDevice { dev: u16 },
    /// Start instruction execution.
    Start,
    /// Stop instruction execution (devices keep running on their timers).
    Stop,
}
