//! CCW fetch and command launch.
//!
//! A CCW is two words on a doubleword boundary:
//!
//! ```text
//! word 0: CCCCCCCC AAAAAAAA AAAAAAAA AAAAAAAA   command, data address
//! word 1: FFFFFF00 00000000 NNNNNNNN NNNNNNNN   flags, count
//! ```
//!
//! `load_ccw` walks the program: it skips a CCW when the device presented
//! status modifier, follows one TIC (a second TIC in a row, or a TIC as
//! the first CCW, is a program check), latches address/count/flags, and,
//! unless this fetch continues a data chain, starts the new command on
//! the device. All storage traffic goes through the protected word
//! accessors, which turn bad addresses into program check and key
//! mismatches into protection check.

use crate::device::IoContext;
use crate::{
    BUF_EMPTY, BUF_END, CMD_TIC, DEV_ATTN, DEV_BUSY, DEV_CHAN_END, DEV_UNIT_CHECK,
    DEV_UNIT_EXCEPTION, ERROR_STATUS, FLAG_CC, FLAG_CD, FLAG_IDA, FLAG_PCI, FLAG_SLI,
    STATUS_BUSY, STATUS_PCI, STATUS_PROG_CHK, STATUS_PROT_CHK, STATUS_SMS,
};
use s370_storage::AMASK;

impl IoContext<'_> {
    /// Does the subchannel key forbid this access? Key 0 passes anything;
    /// fetch access is gated on the fetch-protect bit of the storage key.
    pub(crate) fn check_protect(&self, key: u8, addr: u32, fetch: bool) -> bool {
        if key == 0 {
            return false;
        }
        let k = self.mem.get_key(addr);
        if fetch && k & 0x08 == 0 {
            return false;
        }
        (k & 0xf0) != (key & 0xf0)
    }

    /// Fetch a word for the channel. On failure the check status is set
    /// and `None` comes back.
    pub(crate) fn read_full_word(&mut self, ci: usize, si: usize, addr: u32) -> Option<u32> {
        let key = self.chans.sub(ci, si).ccw_key;
        if !self.mem.check_addr(addr) {
            self.chans.sub_mut(ci, si).status |= STATUS_PROG_CHK;
            return None;
        }
        if self.check_protect(key, addr, true) {
            self.chans.sub_mut(ci, si).status |= STATUS_PROT_CHK;
            return None;
        }
        let (word, _) = self.mem.get_word(addr);
        Some(word)
    }

    /// Fetch and start the next CCW. `tic_ok` permits one transfer in
    /// channel. Returns true when the program cannot continue; the check
    /// status has been deposited in the subchannel.
    pub(crate) fn load_ccw(&mut self, ci: usize, si: usize, tic_ok: bool) -> bool {
        let mut tic_ok = tic_ok;
        let mut launch;

        let resume = {
            let sc = self.chans.sub(ci, si);
            sc.chain_held && sc.ccw_flags & FLAG_CD == 0
        };
        if resume {
            // Restart the command remembered when the device was busy
            self.chans.sub_mut(ci, si).chain_held = false;
            launch = true;
        } else {
            loop {
                {
                    let sc = self.chans.sub_mut(ci, si);
                    // CCWs live on doubleword boundaries
                    if sc.caw & 0x7 != 0 {
                        sc.status |= STATUS_PROG_CHK;
                        return true;
                    }
                    if sc.status & ERROR_STATUS != 0 {
                        return true;
                    }
                    if sc.status & STATUS_SMS != 0 {
                        // Status modifier: skip the next CCW of the chain
                        sc.caw += 8;
                        sc.status &= !STATUS_SMS;
                    }
                }

                let caw = self.chans.sub(ci, si).caw;
                let Some(word0) = self.read_full_word(ci, si, caw) else {
                    return true;
                };
                self.chans.sub_mut(ci, si).caw += 4;

                let cmd = (word0 >> 24) as u8;
                if cmd & 0x0f == CMD_TIC {
                    let sc = self.chans.sub_mut(ci, si);
                    sc.caw += 4;
                    if tic_ok {
                        sc.caw = word0 & AMASK;
                        tic_ok = false;
                        continue;
                    }
                    // TIC first, or TIC chained to TIC
                    sc.status |= STATUS_PROG_CHK;
                    self.chans.flag_irq(ci);
                    return true;
                }

                let caw = self.chans.sub(ci, si).caw;
                let Some(word1) = self.read_full_word(ci, si, caw) else {
                    return true;
                };

                let (data_chain, zero_count) = {
                    let sc = self.chans.sub_mut(ci, si);
                    sc.caw += 4;
                    let chaining = sc.ccw_flags & FLAG_CD != 0;
                    if !chaining {
                        // Data chaining keeps the running command
                        sc.ccw_cmd = cmd;
                    }
                    let mut flags = u16::from((word1 >> 24) as u8) & 0xfc;
                    if sc.ccw_flags & (FLAG_CD | FLAG_SLI) == (FLAG_CD | FLAG_SLI) {
                        // SLI persists across a data chain
                        flags |= FLAG_SLI;
                    }
                    sc.ccw_addr = word0 & AMASK;
                    sc.ccw_count = (word1 & 0xffff) as u16;
                    sc.ccw_flags = flags;
                    sc.chan_byte = BUF_EMPTY;
                    sc.dirty = false;
                    if sc.ccw_count == 0 {
                        sc.status |= STATUS_PROG_CHK;
                    }
                    (chaining, sc.ccw_count == 0)
                };
                if zero_count {
                    return true;
                }
                launch = !data_chain;

                // First scatter entry of an indirect data chain
                if self.chans.sub(ci, si).ccw_flags & FLAG_IDA != 0 {
                    let addr = self.chans.sub(ci, si).ccw_addr;
                    let Some(entry) = self.read_full_word(ci, si, addr) else {
                        return true;
                    };
                    self.chans.sub_mut(ci, si).ccw_iaddr = entry & AMASK;
                }
                break;
            }
        }

        if launch {
            let (cmd, dev) = {
                let sc = self.chans.sub(ci, si);
                (sc.ccw_cmd, sc.dev_addr)
            };
            let Some(dev) = dev else {
                return true;
            };
            if cmd & 0x0f == 0 || !self.chans.device_present(dev) {
                self.chans.sub_mut(ci, si).status |= STATUS_PROG_CHK;
                self.chans.flag_irq(ci);
                return true;
            }

            let status = self
                .with_device(dev, |ctx, d| d.start_cmd(ctx, cmd))
                .unwrap_or(0);
            self.chans.sub_mut(ci, si).status |= u16::from(status) << 8;

            if status & DEV_BUSY != 0 {
                // Park the chain; the scan loop retries when the device
                // reports device end
                let sc = self.chans.sub_mut(ci, si);
                sc.status &= !STATUS_BUSY;
                sc.chan_byte = BUF_END;
                if sc.ccw_flags & FLAG_CC != 0 {
                    sc.chain_held = true;
                }
                return false;
            }

            if status & (DEV_ATTN | DEV_UNIT_CHECK | DEV_UNIT_EXCEPTION) != 0 {
                let sc = self.chans.sub_mut(ci, si);
                sc.ccw_cmd = 0;
                sc.ccw_flags = 0;
                self.chans.flag_irq(ci);
                return true;
            }

            if status & DEV_CHAN_END != 0 {
                // Immediate completion: nothing will transfer
                let sc = self.chans.sub_mut(ci, si);
                sc.ccw_flags |= FLAG_SLI;
                sc.ccw_cmd = 0;
                self.chans.flag_irq(ci);
            }
        }

        if self.chans.sub(ci, si).ccw_flags & FLAG_PCI != 0 {
            self.chans.sub_mut(ci, si).status |= STATUS_PCI;
            self.chans.flag_irq(ci);
        }
        false
    }
}
