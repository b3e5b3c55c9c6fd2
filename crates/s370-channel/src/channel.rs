//! Channel units, subchannels, and the CPU instruction entry points.
//!
//! Up to 16 channels, addressed by bits 8-11 of the device number. A
//! subchannel holds the state of one running I/O program; how devices map
//! onto subchannels depends on the channel type:
//!
//! - selector: a single subchannel shared by every device
//! - block multiplexer: 32 subchannels, `(dev >> 3) & $1F`, when block-mux
//!   mode is on; a single subchannel otherwise
//! - multiplexer: N subchannels; devices below N map directly, devices
//!   $80-$FF fold onto `(dev >> 4) & 7`, the rest are unaddressable
//!
//! The instruction entry points return the condition code the CPU loads:
//! 0 = accepted, 1 = CSW stored, 2 = busy, 3 = not operational.

use crate::device::{Device, IoContext};
use crate::{
    BUF_EMPTY, CAW_ADDR, CSW_ADDR, DEV_ATTN, DEV_BUSY, DEV_CHAN_END, DEV_DEV_END, DEV_UNIT_CHECK,
    DEV_UNIT_EXCEPTION, ERROR_STATUS, FLAG_CC, FLAG_CD, STATUS_PCI,
};
use s370_storage::AMASK;

/// Number of channel slots.
pub const MAX_CHANNELS: usize = 16;

const UNITS_PER_CHANNEL: usize = 256;

/// Channel type, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// One device runs at a time, burst mode.
    Selector,
    /// Many concurrent slow devices, one subchannel each.
    Multiplexer,
    /// Burst devices with 32 shared subchannels.
    BlockMultiplexer,
}

/// Device table slot. A device is taken out of its slot while the engine
/// is calling into it, so upcalls can borrow the rest of the system.
pub(crate) enum DeviceSlot {
    Empty,
    Ready(Box<dyn Device>),
    InUse,
}

/// Live state of one I/O program.
pub(crate) struct Subchannel {
    /// CCW pointer: advanced past each CCW as it is fetched.
    pub(crate) caw: u32,
    /// Protection key from the CAW, in its high-nibble position.
    pub(crate) ccw_key: u8,
    /// Data address of the current CCW.
    pub(crate) ccw_addr: u32,
    /// Live indirect data address when the CCW has IDA set.
    pub(crate) ccw_iaddr: u32,
    /// Residual count.
    pub(crate) ccw_count: u16,
    /// Command byte; 0 when no command is executing.
    pub(crate) ccw_cmd: u8,
    /// Flag byte of the current CCW.
    pub(crate) ccw_flags: u16,
    /// Word buffer the byte pump works through.
    pub(crate) buffer: u32,
    /// Accumulated status halfword.
    pub(crate) status: u16,
    /// Buffer holds bytes not yet written back.
    pub(crate) dirty: bool,
    /// Byte lane within the buffer, or `BUF_EMPTY` / `BUF_END`.
    pub(crate) chan_byte: u8,
    /// Device this subchannel is currently serving.
    pub(crate) dev_addr: Option<u16>,
    /// Command chain parked while the device reported busy.
    pub(crate) chain_held: bool,
}

impl Subchannel {
    fn new() -> Self {
        Self {
            caw: 0,
            ccw_key: 0,
            ccw_addr: 0,
            ccw_iaddr: 0,
            ccw_count: 0,
            ccw_cmd: 0,
            ccw_flags: 0,
            buffer: 0,
            status: 0,
            dirty: false,
            chan_byte: BUF_EMPTY,
            dev_addr: None,
            chain_held: false,
        }
    }

    /// Clear program state ahead of starting a new I/O program.
    pub(crate) fn reset_program(&mut self) {
        self.ccw_cmd = 0;
        self.ccw_flags = 0;
        self.ccw_count = 0;
        self.status = 0;
        self.dirty = false;
        self.chan_byte = BUF_EMPTY;
        self.chain_held = false;
    }

    /// Release the subchannel after its ending status has been presented.
    pub(crate) fn release(&mut self) {
        self.reset_program();
        self.dev_addr = None;
    }

    /// Is an I/O program running or chaining here?
    pub(crate) fn active(&self) -> bool {
        self.ccw_cmd != 0 || self.ccw_flags & (FLAG_CD | FLAG_CC) != 0
    }
}

/// One channel: device table, per-device pending status, subchannels.
pub(crate) struct Channel {
    pub(crate) kind: Option<ChannelKind>,
    pub(crate) devices: Vec<DeviceSlot>,
    pub(crate) dev_status: [u8; UNITS_PER_CHANNEL],
    pub(crate) subchans: Vec<Subchannel>,
    pub(crate) irq_pending: bool,
}

impl Channel {
    fn absent() -> Self {
        Self {
            kind: None,
            devices: Vec::new(),
            dev_status: [0; UNITS_PER_CHANNEL],
            subchans: Vec::new(),
            irq_pending: false,
        }
    }

    fn configure(&mut self, kind: ChannelKind, subchannels: usize) {
        let count = match kind {
            ChannelKind::Selector => 1,
            ChannelKind::BlockMultiplexer => 32,
            ChannelKind::Multiplexer => subchannels.clamp(1, 256),
        };
        self.kind = Some(kind);
        self.devices = (0..UNITS_PER_CHANNEL).map(|_| DeviceSlot::Empty).collect();
        self.dev_status = [0; UNITS_PER_CHANNEL];
        self.subchans = (0..count).map(|_| Subchannel::new()).collect();
        self.irq_pending = false;
    }
}

/// The channel subsystem: every channel, plus the engine-wide flags.
pub struct ChannelSet {
    channels: [Channel; MAX_CHANNELS],
    /// Some subchannel somewhere may have status to present.
    irq_pending: bool,
    /// Device an IPL is loading from, while one is in progress.
    loading: Option<u16>,
    /// Block-multiplex mode (CPU control register bit).
    bmux_enabled: bool,
}

impl ChannelSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: std::array::from_fn(|_| Channel::absent()),
            irq_pending: false,
            loading: None,
            bmux_enabled: false,
        }
    }

    /// Configure channel `index`. `subchannels` only matters for a
    /// multiplexer; selectors get 1 and block multiplexers 32.
    pub fn add_channel(
        &mut self,
        index: usize,
        kind: ChannelKind,
        subchannels: usize,
    ) -> Result<(), String> {
        if index >= MAX_CHANNELS {
            return Err(format!("channel {index} out of range"));
        }
        if self.channels[index].kind.is_some() {
            return Err(format!("channel {index} already configured"));
        }
        self.channels[index].configure(kind, subchannels);
        Ok(())
    }

    /// Register a device at the full device number `dev`.
    pub fn add_device(&mut self, dev: u16, device: Box<dyn Device>) -> Result<(), String> {
        let (ci, unit) = split_dev(dev);
        let ch = &mut self.channels[ci];
        if ch.kind.is_none() {
            return Err(format!("no channel {ci} for device {dev:03X}"));
        }
        match ch.devices[unit] {
            DeviceSlot::Empty => {
                ch.devices[unit] = DeviceSlot::Ready(device);
                Ok(())
            }
            _ => Err(format!("device {dev:03X} already present")),
        }
    }

    /// Is a device registered at `dev`?
    #[must_use]
    pub fn device_present(&self, dev: u16) -> bool {
        let (ci, unit) = split_dev(dev);
        let ch = &self.channels[ci];
        ch.kind.is_some() && !matches!(ch.devices[unit], DeviceSlot::Empty)
    }

    /// State summary from a device's debug hook.
    #[must_use]
    pub fn device_debug(&self, dev: u16) -> Option<String> {
        let (ci, unit) = split_dev(dev);
        match &self.channels[ci].devices[unit] {
            DeviceSlot::Ready(d) => Some(d.debug()),
            _ => None,
        }
    }

    /// Run every device's power-on hook. Non-zero status becomes pending
    /// device status, presented on the next interrupt scan.
    pub fn init_devices(&mut self) {
        for ci in 0..MAX_CHANNELS {
            for unit in 0..self.channels[ci].devices.len() {
                let status = match self.channels[ci].devices.get_mut(unit) {
                    Some(DeviceSlot::Ready(d)) => d.init_dev(),
                    _ => 0,
                };
                if status != 0 {
                    self.channels[ci].dev_status[unit] |= status;
                    self.flag_irq(ci);
                }
            }
        }
    }

    /// Shut every device down. Pending events are abandoned, not cancelled.
    pub fn shutdown_devices(&mut self) {
        for ch in &mut self.channels {
            for slot in &mut ch.devices {
                if let DeviceSlot::Ready(d) = slot {
                    d.shutdown();
                }
            }
        }
    }

    /// Reset every channel: subchannels cleared, pending status dropped.
    /// Registered devices stay registered.
    pub fn reset(&mut self) {
        for ch in &mut self.channels {
            for sc in &mut ch.subchans {
                *sc = Subchannel::new();
            }
            ch.dev_status = [0; UNITS_PER_CHANNEL];
            ch.irq_pending = false;
        }
        self.irq_pending = false;
        self.loading = None;
    }

    /// Switch block-multiplex mode (control-register bit 0 on a real
    /// machine). Affects subchannel mapping and TCH on BMUX channels.
    pub fn set_block_mux_mode(&mut self, enabled: bool) {
        self.bmux_enabled = enabled;
    }

    #[must_use]
    pub fn block_mux_mode(&self) -> bool {
        self.bmux_enabled
    }

    /// Device an IPL is currently loading from.
    #[must_use]
    pub fn loading(&self) -> Option<u16> {
        self.loading
    }

    /// IPL finished: stop funnelling interrupts through the loader and
    /// let its subchannel go.
    pub fn finish_load(&mut self) {
        if let Some(dev) = self.loading.take() {
            if let Some((ci, si)) = self.find_subchannel(dev) {
                self.channels[ci].subchans[si].release();
            }
        }
    }

    pub(crate) fn clear_loading(&mut self) {
        self.loading = None;
    }

    pub(crate) fn set_loading(&mut self, dev: u16) {
        self.loading = Some(dev);
    }

    /// Could a scan deliver anything right now?
    #[must_use]
    pub fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    pub(crate) fn set_irq_pending(&mut self) {
        self.irq_pending = true;
    }

    pub(crate) fn clear_irq_pending(&mut self) {
        self.irq_pending = false;
    }

    /// Raise the channel and engine interrupt-pending flags.
    pub(crate) fn flag_irq(&mut self, ci: usize) {
        self.channels[ci].irq_pending = true;
        self.irq_pending = true;
    }

    pub(crate) fn chan(&self, ci: usize) -> &Channel {
        &self.channels[ci]
    }

    pub(crate) fn chan_mut(&mut self, ci: usize) -> &mut Channel {
        &mut self.channels[ci]
    }

    pub(crate) fn sub(&self, ci: usize, si: usize) -> &Subchannel {
        &self.channels[ci].subchans[si]
    }

    pub(crate) fn sub_mut(&mut self, ci: usize, si: usize) -> &mut Subchannel {
        &mut self.channels[ci].subchans[si]
    }

    /// Map a device number to its (channel, subchannel) indices.
    pub(crate) fn find_subchannel(&self, dev: u16) -> Option<(usize, usize)> {
        let (ci, unit) = split_dev(dev);
        let ch = &self.channels[ci];
        let si = match ch.kind? {
            ChannelKind::Selector => 0,
            ChannelKind::BlockMultiplexer => {
                if self.bmux_enabled {
                    (unit >> 3) & 0x1f
                } else {
                    0
                }
            }
            ChannelKind::Multiplexer => {
                if unit < ch.subchans.len() {
                    unit
                } else if unit < 128 {
                    return None;
                } else {
                    (unit >> 4) & 0x7
                }
            }
        };
        Some((ci, si))
    }

    /// Take a device out of its table slot for a call into it.
    pub(crate) fn take_device(&mut self, dev: u16) -> Option<Box<dyn Device>> {
        let (ci, unit) = split_dev(dev);
        let slot = self.channels[ci].devices.get_mut(unit)?;
        match std::mem::replace(slot, DeviceSlot::InUse) {
            DeviceSlot::Ready(d) => Some(d),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Put a device back after `take_device`.
    pub(crate) fn restore_device(&mut self, dev: u16, device: Box<dyn Device>) {
        let (ci, unit) = split_dev(dev);
        self.channels[ci].devices[unit] = DeviceSlot::Ready(device);
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a device number into channel index and unit.
pub(crate) fn split_dev(dev: u16) -> (usize, usize) {
    (((dev >> 8) & 0xf) as usize, (dev & 0xff) as usize)
}

impl IoContext<'_> {
    /// Start I/O: the SIO instruction.
    pub fn start_io(&mut self, dev: u16) -> u8 {
        let Some((ci, si)) = self.chans.find_subchannel(dev) else {
            return 3;
        };
        if !self.chans.device_present(dev) {
            return 3;
        }
        let unit = (dev & 0xff) as usize;

        {
            let sc = self.chans.sub(ci, si);
            // Ending status for this device still waiting to be seen
            if sc.dev_addr == Some(dev) && sc.status != 0 {
                self.store_csw(ci, si);
                return 1;
            }
            // Subchannel is running someone's program
            if sc.active() || sc.status != 0 {
                return 2;
            }
        }

        // Pending per-device status: a bare idle notice is consumed, any
        // other status is surfaced as a stored CSW
        let pending = self.chans.chan(ci).dev_status[unit];
        if pending != 0 {
            self.chans.chan_mut(ci).dev_status[unit] = 0;
            if pending != DEV_DEV_END && pending != (DEV_DEV_END | DEV_CHAN_END) {
                self.mem.put_word(CSW_ADDR, 0);
                self.mem.put_word(CSW_ADDR + 4, u32::from(pending) << 24);
                return 1;
            }
        }

        let status = self.with_device(dev, |ctx, d| d.start_io(ctx)).unwrap_or(0);
        if status & DEV_BUSY != 0 {
            return 2;
        }
        if status != 0 {
            self.mem
                .put_word_mask(CSW_ADDR + 4, u32::from(status) << 24, 0xffff_0000);
            return 1;
        }

        // Latch the channel address word and drive the program
        let (caw, _) = self.mem.get_word(CAW_ADDR);
        {
            let sc = self.chans.sub_mut(ci, si);
            sc.reset_program();
            sc.dev_addr = Some(dev);
            sc.ccw_key = ((caw >> 24) & 0xf0) as u8;
            sc.caw = caw & AMASK;
        }

        if self.load_ccw(ci, si, false) {
            // Program could not start; the check status is in the CSW
            self.store_csw(ci, si);
            return 1;
        }

        let (status, flags) = {
            let sc = self.chans.sub(ci, si);
            (sc.status, sc.ccw_flags)
        };
        if status & crate::STATUS_CHAN_END != 0 {
            if flags & FLAG_CC != 0 {
                // Immediate completion with the chain still to run: the
                // scan loop will pick the chain up from here
                self.mem
                    .put_word_mask(CSW_ADDR + 4, u32::from(status) << 16, 0xffff_0000);
                return 1;
            }
            self.store_csw(ci, si);
            return 1;
        }
        0
    }

    /// Test I/O: the TIO instruction.
    pub fn test_io(&mut self, dev: u16) -> u8 {
        let Some((ci, si)) = self.chans.find_subchannel(dev) else {
            return 3;
        };
        if !self.chans.device_present(dev) {
            return 3;
        }
        let unit = (dev & 0xff) as usize;

        {
            let sc = self.chans.sub(ci, si);
            // Error status waiting for this device
            if sc.dev_addr == Some(dev) && sc.status & ERROR_STATUS != 0 {
                self.store_csw(ci, si);
                return 1;
            }
        }
        {
            let sc = self.chans.sub(ci, si);
            // Program still running for this device
            if sc.dev_addr == Some(dev) && sc.active() {
                return 2;
            }
        }

        // Pending per-device status to deliver
        let pending = self.chans.chan(ci).dev_status[unit];
        if pending != 0 {
            self.chans.chan_mut(ci).dev_status[unit] = 0;
            self.mem.put_word(CSW_ADDR, 0);
            self.mem.put_word(CSW_ADDR + 4, u32::from(pending) << 24);
            return 1;
        }

        {
            let sc = self.chans.sub(ci, si);
            // Subchannel tied up by another device
            if sc.dev_addr.is_some_and(|d| d != dev) && (sc.active() || sc.status != 0) {
                return 2;
            }
        }

        // Probe the device itself
        let status = self.with_device(dev, |ctx, d| d.start_io(ctx)).unwrap_or(0);
        if status & (DEV_ATTN | DEV_UNIT_CHECK | DEV_UNIT_EXCEPTION) != 0 {
            self.mem
                .put_word_mask(CSW_ADDR + 4, u32::from(status) << 24, 0xff00_0000);
            return 1;
        }
        if status & DEV_BUSY != 0 {
            return 2;
        }
        0
    }

    /// Halt I/O: the HIO instruction. Cooperative: the device is asked,
    /// and any transfer in flight is cut off at the channel.
    pub fn halt_io(&mut self, dev: u16) -> u8 {
        let Some((ci, si)) = self.chans.find_subchannel(dev) else {
            return 3;
        };
        if !self.chans.device_present(dev) {
            return 3;
        }

        {
            let sc = self.chans.sub(ci, si);
            if sc.dev_addr == Some(dev) && sc.status & ERROR_STATUS != 0 {
                return 1;
            }
        }

        let active = {
            let sc = self.chans.sub(ci, si);
            sc.dev_addr == Some(dev) && sc.active()
        };
        let cc = self.with_device(dev, |ctx, d| d.halt_io(ctx)).unwrap_or(3) & 3;
        if active {
            if cc == 1 {
                let status = self.chans.sub(ci, si).status;
                self.mem
                    .put_word_mask(CSW_ADDR + 4, u32::from(status) << 16, 0xffff_0000);
            }
            // Stop any further data flow; the device winds down on its own
            let sc = self.chans.sub_mut(ci, si);
            sc.chan_byte = BUF_EMPTY;
            sc.ccw_flags &= !(FLAG_CD | FLAG_CC);
        }
        cc
    }

    /// Test channel: the TCH instruction. Operand addresses the channel
    /// only; the unit bits are ignored.
    pub fn test_chan(&mut self, dev: u16) -> u8 {
        let ci = ((dev >> 8) & 0xf) as usize;
        let Some(kind) = self.chans.chan(ci).kind else {
            return 3;
        };
        match kind {
            ChannelKind::Multiplexer => return 0,
            ChannelKind::BlockMultiplexer if self.chans.block_mux_mode() => return 0,
            _ => {}
        }
        // Selector (or a block multiplexer running as one): look at the
        // single subchannel
        let sc = self.chans.sub(ci, 0);
        if sc.active() {
            return 2;
        }
        if sc.status != 0 {
            return 1;
        }
        0
    }

    /// Store the CSW for a subchannel at `$40`/`$44`. A PCI-only store
    /// keeps the program alive and clears just the PCI bit; any ending
    /// status releases the subchannel.
    pub(crate) fn store_csw(&mut self, ci: usize, si: usize) {
        let (w0, w1, pci_only) = {
            let sc = self.chans.sub(ci, si);
            (
                (u32::from(sc.ccw_key) << 24) | (sc.caw & AMASK),
                (u32::from(sc.status) << 16) | u32::from(sc.ccw_count),
                sc.status == STATUS_PCI,
            )
        };
        self.mem.put_word(CSW_ADDR, w0);
        self.mem.put_word(CSW_ADDR + 4, w1);
        let sc = self.chans.sub_mut(ci, si);
        if pci_only {
            sc.status &= !STATUS_PCI;
        } else {
            sc.release();
        }
    }
}
