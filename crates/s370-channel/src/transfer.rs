//! The byte pump: data transfer between storage and a device.
//!
//! Transfers move one byte per call through a word buffer in the
//! subchannel. `chan_byte` is the lane index within the buffered word;
//! `BUF_EMPTY` (which is just the lane index past byte 3) means the buffer
//! needs a refill, `BUF_END` means the transfer is over. After a refill
//! the lane picks up at `addr & 3`, so the byte stream stays continuous
//! across word boundaries.
//!
//! Output commands (odd command byte) pull bytes from storage with
//! `chan_read_byte`; input commands push with `chan_write_byte`, which
//! additionally handles skip, read backward, and indirect data addressing.
//! Writes go through a read-modify-write of the covering word, flushed
//! when the transfer crosses out of it.

use crate::device::IoContext;
use crate::{
    BUF_EMPTY, BUF_END, CMD_READ_BWD, DEV_ATTN, DEV_DEV_END, DEV_UNIT_CHECK, DEV_UNIT_EXCEPTION,
    FLAG_CD, FLAG_IDA, FLAG_SKIP, FLAG_SLI, STATUS_CHAN_END, STATUS_LENGTH, STATUS_PCI,
    STATUS_PROG_CHK, STATUS_PROT_CHK,
};
use s370_storage::AMASK;

impl IoContext<'_> {
    /// Pull the next byte of an output command out of storage. The abort
    /// flag tells the device to stop transferring and present its ending
    /// status.
    pub fn chan_read_byte(&mut self, dev: u16) -> (u8, bool) {
        let Some((ci, si)) = self.chans.find_subchannel(dev) else {
            return (0, true);
        };
        {
            let sc = self.chans.sub(ci, si);
            if sc.dev_addr != Some(dev) {
                return (0, true);
            }
            if sc.ccw_cmd & 1 == 0 {
                return (0, true);
            }
            if sc.status & !STATUS_PCI != 0 {
                return (0, true);
            }
            if sc.chan_byte == BUF_END {
                return (0, true);
            }
        }

        if self.chans.sub(ci, si).ccw_count == 0 {
            if self.chans.sub(ci, si).ccw_flags & FLAG_CD == 0 {
                // Program ran out of data for the device
                self.chans.sub_mut(ci, si).chan_byte = BUF_END;
                return (0, true);
            }
            if self.load_ccw(ci, si, true) {
                return (0, true);
            }
        }

        if self.chans.sub(ci, si).chan_byte == BUF_EMPTY && self.refill_read(ci, si) {
            return (0, true);
        }

        let byte = {
            let sc = self.chans.sub_mut(ci, si);
            let lane = sc.chan_byte & 3;
            sc.ccw_count -= 1;
            ((sc.buffer >> (8 * (3 - u32::from(lane)))) & 0xff) as u8
        };
        let _ = self.step_position(ci, si, false);

        // Chain to the next CCW as soon as the count runs out, so any
        // chaining error surfaces before the device asks again
        let sc = self.chans.sub(ci, si);
        if sc.ccw_count == 0 && sc.ccw_flags & FLAG_CD != 0 {
            let _ = self.load_ccw(ci, si, true);
        }
        (byte, false)
    }

    /// Push the next byte of an input command into storage. Returns the
    /// abort flag.
    pub fn chan_write_byte(&mut self, dev: u16, data: u8) -> bool {
        let Some((ci, si)) = self.chans.find_subchannel(dev) else {
            return true;
        };
        {
            let sc = self.chans.sub(ci, si);
            if sc.dev_addr != Some(dev) {
                return true;
            }
            if sc.ccw_cmd == 0 || sc.ccw_cmd & 1 != 0 {
                return true;
            }
            if sc.status & !STATUS_PCI != 0 {
                return true;
            }
            if sc.chan_byte == BUF_END {
                return true;
            }
        }

        if self.chans.sub(ci, si).ccw_count == 0 {
            if self.chans.sub(ci, si).ccw_flags & FLAG_CD == 0 {
                // Long block: the device supplied more than the program
                // asked for
                let sc = self.chans.sub_mut(ci, si);
                sc.chan_byte = BUF_END;
                if sc.ccw_flags & FLAG_SLI == 0 {
                    sc.status |= STATUS_LENGTH;
                }
                return true;
            }
            self.flush_buffer(ci, si);
            if self.load_ccw(ci, si, true) {
                return true;
            }
        }

        let (backward, skip) = {
            let sc = self.chans.sub(ci, si);
            (
                sc.ccw_cmd & 0x0f == CMD_READ_BWD,
                sc.ccw_flags & FLAG_SKIP != 0,
            )
        };

        if skip {
            // Count down and move the position; storage is not touched
            let sc = self.chans.sub_mut(ci, si);
            if sc.chan_byte == BUF_EMPTY {
                let addr = if sc.ccw_flags & FLAG_IDA != 0 {
                    sc.ccw_iaddr
                } else {
                    sc.ccw_addr
                };
                sc.chan_byte = (addr & 3) as u8;
            }
            sc.ccw_count -= 1;
            let _ = self.step_position(ci, si, backward);
        } else {
            if self.chans.sub(ci, si).chan_byte == BUF_EMPTY && self.refill_write(ci, si) {
                return true;
            }
            {
                let sc = self.chans.sub_mut(ci, si);
                let lane = sc.chan_byte & 3;
                let shift = 8 * (3 - u32::from(lane));
                sc.buffer = (sc.buffer & !(0xff << shift)) | (u32::from(data) << shift);
                sc.dirty = true;
                sc.ccw_count -= 1;
            }
            let _ = self.step_position(ci, si, backward);
        }

        let sc = self.chans.sub(ci, si);
        if sc.ccw_count == 0 && sc.ccw_flags & FLAG_CD != 0 {
            self.flush_buffer(ci, si);
            let _ = self.load_ccw(ci, si, true);
        }
        false
    }

    /// The device is done transferring: fold its ending status into the
    /// subchannel and let the scan loop take it from here.
    pub fn chan_end(&mut self, dev: u16, flags: u8) {
        let Some((ci, si)) = self.chans.find_subchannel(dev) else {
            return;
        };
        if self.chans.sub(ci, si).dev_addr != Some(dev) {
            return;
        }
        self.flush_buffer(ci, si);

        let sc = self.chans.sub_mut(ci, si);
        sc.status |= STATUS_CHAN_END;
        sc.status |= u16::from(flags) << 8;
        sc.ccw_cmd = 0;
        sc.chan_byte = BUF_END;

        // A short transfer is an error unless the program said otherwise
        if sc.ccw_count != 0 && sc.ccw_flags & FLAG_SLI == 0 {
            sc.status |= STATUS_LENGTH;
            sc.ccw_flags = 0;
        }
        if flags & (DEV_ATTN | DEV_UNIT_CHECK | DEV_UNIT_EXCEPTION) != 0 {
            sc.ccw_flags = 0;
        }
        if flags & DEV_DEV_END != 0 {
            sc.ccw_flags &= !(FLAG_CD | FLAG_SLI);
        }

        self.chans.flag_irq(ci);
    }

    /// Status arriving outside a transfer (a late device end, attention
    /// from an idle device). Lands in the subchannel when it still belongs
    /// to the device, otherwise in the per-device pending byte.
    pub fn set_dev_attn(&mut self, dev: u16, flags: u8) {
        let Some((ci, si)) = self.chans.find_subchannel(dev) else {
            return;
        };
        let sc = self.chans.sub_mut(ci, si);
        if sc.dev_addr == Some(dev) && sc.chain_held && flags & DEV_DEV_END != 0 {
            // The held chain resumes on this device end
            sc.status |= u16::from(flags) << 8;
        } else if sc.dev_addr == Some(dev) && (sc.status & STATUS_CHAN_END != 0 || sc.ccw_cmd != 0)
        {
            sc.status |= u16::from(flags) << 8;
            sc.ccw_cmd = 0;
        } else {
            self.chans.chan_mut(ci).dev_status[(dev & 0xff) as usize] |= flags;
        }
        self.chans.flag_irq(ci);
    }

    /// Fill the buffer to read out of storage (fetch access).
    fn refill_read(&mut self, ci: usize, si: usize) -> bool {
        let (addr, key) = {
            let sc = self.chans.sub(ci, si);
            (sc.transfer_addr(), sc.ccw_key)
        };
        if !self.mem.check_addr(addr) {
            let sc = self.chans.sub_mut(ci, si);
            sc.status |= STATUS_PROG_CHK;
            sc.chan_byte = BUF_END;
            return true;
        }
        if self.check_protect(key, addr, true) {
            let sc = self.chans.sub_mut(ci, si);
            sc.status |= STATUS_PROT_CHK;
            sc.chan_byte = BUF_END;
            return true;
        }
        let (word, _) = self.mem.get_word(addr);
        let sc = self.chans.sub_mut(ci, si);
        sc.buffer = word;
        sc.chan_byte = (addr & 3) as u8;
        sc.dirty = false;
        false
    }

    /// Fill the buffer to write into storage (store access): the covering
    /// word is read so untouched lanes survive the flush.
    fn refill_write(&mut self, ci: usize, si: usize) -> bool {
        let (addr, key) = {
            let sc = self.chans.sub(ci, si);
            (sc.transfer_addr(), sc.ccw_key)
        };
        if !self.mem.check_addr(addr) {
            let sc = self.chans.sub_mut(ci, si);
            sc.status |= STATUS_PROG_CHK;
            sc.chan_byte = BUF_END;
            return true;
        }
        if self.check_protect(key, addr, false) {
            let sc = self.chans.sub_mut(ci, si);
            sc.status |= STATUS_PROT_CHK;
            sc.chan_byte = BUF_END;
            return true;
        }
        let (word, _) = self.mem.get_word(addr);
        let sc = self.chans.sub_mut(ci, si);
        sc.buffer = word;
        sc.chan_byte = (addr & 3) as u8;
        sc.dirty = false;
        false
    }

    /// Write the buffered word back, if any byte of it changed. Must run
    /// before the position pointers move past the word.
    pub(crate) fn flush_buffer(&mut self, ci: usize, si: usize) {
        let (dirty, base, buffer) = {
            let sc = self.chans.sub(ci, si);
            (sc.dirty, sc.transfer_addr() & !3, sc.buffer)
        };
        if !dirty {
            return;
        }
        self.mem.put_word(base, buffer);
        self.chans.sub_mut(ci, si).dirty = false;
    }

    /// Move past the byte just transferred: bump the lane, and on a word
    /// crossing flush and advance the data address, forward, backward,
    /// or along the scatter list for IDA.
    fn step_position(&mut self, ci: usize, si: usize, backward: bool) -> bool {
        let (lane, ida) = {
            let sc = self.chans.sub(ci, si);
            (sc.chan_byte & 3, sc.ccw_flags & FLAG_IDA != 0)
        };
        let crossing = if backward { lane == 0 } else { lane == 3 };

        if !crossing {
            let sc = self.chans.sub_mut(ci, si);
            sc.chan_byte = if backward { lane - 1 } else { lane + 1 };
            if ida {
                sc.ccw_iaddr = step_addr(sc.ccw_iaddr, backward);
            }
            return false;
        }

        self.flush_buffer(ci, si);
        if ida {
            let wrapped = {
                let sc = self.chans.sub_mut(ci, si);
                sc.ccw_iaddr = step_addr(sc.ccw_iaddr, backward);
                sc.chan_byte = BUF_EMPTY;
                let low = sc.ccw_iaddr & 0x7ff;
                if backward { low == 0x7ff } else { low == 0 }
            };
            if wrapped {
                // Crossed a 2-KiB boundary: next scatter-list entry
                let addr = {
                    let sc = self.chans.sub_mut(ci, si);
                    sc.ccw_addr += 4;
                    sc.ccw_addr
                };
                let Some(entry) = self.read_full_word(ci, si, addr) else {
                    self.chans.sub_mut(ci, si).chan_byte = BUF_END;
                    return true;
                };
                self.chans.sub_mut(ci, si).ccw_iaddr = entry & AMASK;
            }
        } else {
            let sc = self.chans.sub_mut(ci, si);
            if backward {
                sc.ccw_addr = sc.ccw_addr.wrapping_sub(1 + (sc.ccw_addr & 3)) & AMASK;
            } else {
                sc.ccw_addr = (sc.ccw_addr + (4 - (sc.ccw_addr & 3))) & AMASK;
            }
            sc.chan_byte = BUF_EMPTY;
        }
        false
    }
}

fn step_addr(addr: u32, backward: bool) -> u32 {
    if backward {
        addr.wrapping_sub(1) & AMASK
    } else {
        (addr + 1) & AMASK
    }
}

impl crate::channel::Subchannel {
    /// Address the next byte moves through: the scatter address under IDA,
    /// the CCW data address otherwise.
    pub(crate) fn transfer_addr(&self) -> u32 {
        if self.ccw_flags & FLAG_IDA != 0 {
            self.ccw_iaddr
        } else {
            self.ccw_addr
        }
    }
}
