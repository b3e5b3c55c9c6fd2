//! IBM System/370 machine assembly.
//!
//! Composes main storage, the channel subsystem, and a CPU behind the
//! [`Cpu`] seam into a runnable machine with a cooperative driver loop.
//! The loop interleaves CPU instruction steps, virtual-time device
//! callbacks, and control messages from the outside world (terminal
//! front ends, the wall-clock ticker, an operator).
//!
//! Instruction execution itself lives on the other side of the `Cpu`
//! trait; [`IdleCpu`] is a placeholder that lets the machine run headless.

pub mod config;
pub mod console;
pub mod control;
pub mod cpu;
pub mod mcp;
pub mod system;

pub use config::{ChannelConfig, SystemConfig, parse_config};
pub use console::Console;
pub use control::ControlMessage;
pub use cpu::{Cpu, IdleCpu};
pub use system::{System, SystemHandle};
