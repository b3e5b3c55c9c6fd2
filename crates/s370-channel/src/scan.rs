//! Interrupt scan and initial program load.
//!
//! The CPU calls `chan_scan` whenever it is willing to take an I/O
//! interrupt. The scan walks channels in priority order looking for a
//! subchannel with status to present. Along the way it is also the engine
//! that keeps chained programs moving: a command chain waiting on device
//! end, or a chain parked behind a busy device, is restarted from here
//! rather than surfaced to the CPU.

use crate::channel::MAX_CHANNELS;
use crate::device::IoContext;
use crate::{
    BUF_EMPTY, CMD_READ, CSW_ADDR, DEV_BUSY, DEV_UNIT_CHECK, DEV_UNIT_EXCEPTION, ERROR_STATUS,
    FLAG_CC, FLAG_SLI, STATUS_CHAN_END, STATUS_DEV_END, STATUS_PROG_CHK, STATUS_SMS,
};

impl IoContext<'_> {
    /// Find the next device with an interrupt to present, under the
    /// channel mask. Returns its device number, with the CSW already
    /// stored; `None` when nothing is ready.
    pub fn chan_scan(&mut self, mask: u16, irq_enabled: bool) -> Option<u16> {
        if !self.chans.irq_pending() {
            return None;
        }
        self.chans.clear_irq_pending();

        let mut pend: Option<(usize, usize)> = None;
        'outer: for ci in 0..MAX_CHANNELS {
            if self.chans.chan(ci).kind.is_none() {
                continue;
            }
            self.chans.chan_mut(ci).irq_pending = false;
            let imask = 0x8000u16 >> ci;
            let selectable = mask & imask != 0 && irq_enabled;

            for si in 0..self.chans.chan(ci).subchans.len() {
                let (dev_addr, status, flags, held) = {
                    let sc = self.chans.sub(ci, si);
                    (sc.dev_addr, sc.status, sc.ccw_flags, sc.chain_held)
                };
                if dev_addr.is_none() {
                    continue;
                }
                // Status the CPU must see: PCI or a check condition
                if selectable && status & (ERROR_STATUS | STATUS_PROG_CHK) != 0 {
                    pend = Some((ci, si));
                    break 'outer;
                }
                // A chain parked behind a busy device resumes on device end
                if held && status & STATUS_DEV_END != 0 {
                    self.chans.sub_mut(ci, si).status &= STATUS_SMS;
                    let _ = self.load_ccw(ci, si, true);
                    continue;
                }
                if status & STATUS_CHAN_END != 0 {
                    if flags & FLAG_CC != 0 {
                        // Command chaining advances on device end; channel
                        // end alone keeps the chain waiting
                        if status & STATUS_DEV_END != 0 {
                            self.chans.sub_mut(ci, si).status &= STATUS_SMS;
                            let _ = self.load_ccw(ci, si, true);
                        }
                    } else if irq_enabled || self.chans.loading().is_some() {
                        pend = Some((ci, si));
                        break 'outer;
                    }
                }
            }
        }

        if let Some((ci, si)) = pend {
            let Some(dev) = self.chans.sub(ci, si).dev_addr else {
                return None;
            };
            if let Some(loader) = self.chans.loading() {
                // Only the loading device may surface during IPL, and its
                // status is consumed by the IPL flow rather than a CSW
                if dev != loader {
                    return None;
                }
                self.chans.set_irq_pending();
                return Some(dev);
            }
            self.chans.set_irq_pending();
            self.store_csw(ci, si);
            return Some(dev);
        }

        // Nothing from the subchannels: deliver a pending device status
        if irq_enabled {
            for ci in 0..MAX_CHANNELS {
                if self.chans.chan(ci).kind.is_none() {
                    continue;
                }
                for unit in 0..self.chans.chan(ci).dev_status.len() {
                    let status = self.chans.chan(ci).dev_status[unit];
                    if status == 0 {
                        continue;
                    }
                    self.chans.chan_mut(ci).dev_status[unit] = 0;
                    self.chans.set_irq_pending();
                    self.mem.put_word(CSW_ADDR, 0);
                    self.mem.put_word(CSW_ADDR + 4, u32::from(status) << 24);
                    return Some(((ci as u16) << 8) | unit as u16);
                }
            }
        }
        None
    }

    /// Initial program load. Resets the subsystem, then runs a synthetic
    /// 24-byte read into location 0 with command chaining and SLI, as if
    /// fetched from location 0, so the bootstrap's own CCWs at 8 and 16
    /// take over, and the new PSW lands at location 0.
    pub fn ipl(&mut self, dev: u16) -> Result<(), String> {
        self.chans.reset();
        self.events.clear();

        let Some((ci, si)) = self.chans.find_subchannel(dev) else {
            return Err(format!("IPL device {dev:03X} not operational"));
        };
        if !self.chans.device_present(dev) {
            return Err(format!("IPL device {dev:03X} not operational"));
        }

        let status = self.with_device(dev, |ctx, d| d.start_io(ctx)).unwrap_or(0);
        if status != 0 {
            return Err(format!("IPL device {dev:03X} not ready"));
        }

        {
            let sc = self.chans.sub_mut(ci, si);
            sc.reset_program();
            sc.dev_addr = Some(dev);
            sc.ccw_key = 0;
            sc.caw = 0x8;
            sc.ccw_cmd = CMD_READ;
            sc.ccw_addr = 0;
            sc.ccw_count = 24;
            sc.ccw_flags = FLAG_CC | FLAG_SLI;
            sc.chan_byte = BUF_EMPTY;
        }
        self.chans.set_loading(dev);

        let status = self
            .with_device(dev, |ctx, d| d.start_cmd(ctx, CMD_READ))
            .unwrap_or(0);
        self.chans.sub_mut(ci, si).status |= u16::from(status) << 8;
        if status & (DEV_BUSY | DEV_UNIT_CHECK | DEV_UNIT_EXCEPTION) != 0 {
            self.chans.clear_loading();
            self.chans.sub_mut(ci, si).release();
            return Err(format!("IPL device {dev:03X} rejected the load"));
        }
        Ok(())
    }
}
