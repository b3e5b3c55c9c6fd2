//! End-to-end channel program tests.
//!
//! Each test runs a real CCW program against the reference test device:
//! 64 KiB of storage, a multiplexer on channel 0, and the device at $00F
//! with its buffer preloaded with $F0.. and a configurable transfer
//! length. Programs are driven the way the CPU drives them: SIO, then
//! advancing virtual time until the interrupt scan presents the device.

use s370_channel::testdev::TestDevice;
use s370_channel::{
    CAW_ADDR, CSW_ADDR, ChannelKind, ChannelSet, DEV_BUSY, DEV_CHAN_END, DEV_DEV_END, Device,
    EventQueue, IoContext,
};
use s370_storage::Storage;

const DEV: u16 = 0x00F;

struct Rig {
    chans: ChannelSet,
    mem: Storage,
    events: EventQueue,
}

impl Rig {
    /// Standard rig: the test device transfers `max` bytes, buffer filled
    /// with $F0 upward.
    fn new(max: usize) -> Self {
        let mut dev = TestDevice::new(DEV, max);
        let data: Vec<u8> = (0..=255u8).map(|i| 0xF0u8.wrapping_add(i)).collect();
        dev.fill(&data);
        Self::with_device(Box::new(dev))
    }

    fn with_device(dev: Box<dyn Device>) -> Self {
        let mut chans = ChannelSet::new();
        chans
            .add_channel(0, ChannelKind::Multiplexer, 256)
            .expect("channel");
        chans.add_device(DEV, dev).expect("device");
        Self {
            chans,
            mem: Storage::new(64),
            events: EventQueue::new(),
        }
    }

    fn io(&mut self) -> IoContext<'_> {
        IoContext::new(&mut self.chans, &mut self.mem, &mut self.events)
    }

    /// Deposit a CCW: command, data address, flag byte, count.
    fn put_ccw(&mut self, at: u32, cmd: u8, addr: u32, flags: u8, count: u16) {
        self.mem
            .put_word(at, (u32::from(cmd) << 24) | (addr & 0x00ff_ffff));
        self.mem
            .put_word(at + 4, (u32::from(flags) << 24) | u32::from(count));
    }

    fn start(&mut self, caw: u32) -> u8 {
        self.mem.put_word(CAW_ADDR, caw);
        self.io().start_io(DEV)
    }

    /// Advance until the scan presents a device, or give up.
    fn run_until_scan(&mut self, mask: u16, irq_enabled: bool) -> Option<u16> {
        for _ in 0..10_000 {
            let mut io = self.io();
            if let Some(d) = io.chan_scan(mask, irq_enabled) {
                return Some(d);
            }
            io.advance(1);
        }
        None
    }

    fn csw(&mut self) -> (u32, u32) {
        (
            self.mem.get_word(CSW_ADDR).0,
            self.mem.get_word(CSW_ADDR + 4).0,
        )
    }
}

#[test]
fn simple_read() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x02, 0x600, 0x00, 0x10);
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw(), (0x0000_0508, 0x0c00_0000));
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x600 + i).0, 0xF0 + i as u8);
    }
}

#[test]
fn read_with_data_chain() {
    let mut rig = Rig::new(0x20);
    rig.put_ccw(0x500, 0x02, 0x600, 0x80, 0x10); // CD
    rig.put_ccw(0x508, 0x01, 0x700, 0x00, 0x10); // command byte ignored
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw(), (0x0000_0510, 0x0c00_0000));
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x600 + i).0, 0xF0 + i as u8);
        assert_eq!(rig.mem.get_byte(0x700 + i).0, i as u8);
    }
}

#[test]
fn long_block_sets_incorrect_length() {
    // The device wants to hand over 32 bytes; the program takes 16
    let mut rig = Rig::new(0x20);
    rig.put_ccw(0x500, 0x02, 0x600, 0x00, 0x10);
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c40_0000);
}

#[test]
fn long_block_with_sli_is_clean() {
    let mut rig = Rig::new(0x20);
    rig.put_ccw(0x500, 0x02, 0x600, 0x20, 0x10); // SLI
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c00_0000);
}

#[test]
fn short_block_reports_residual_count() {
    // Program wants 32, device supplies 16
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x02, 0x600, 0x00, 0x20);
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c40_0010);
}

#[test]
fn short_block_with_sli_keeps_residual_but_no_error() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x02, 0x600, 0x20, 0x20);
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c00_0010);
}

#[test]
fn tic_to_tic_is_program_check() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x01, 0x600, 0x40, 0x10); // WRITE, CC
    rig.put_ccw(0x508, 0x08, 0x518, 0x00, 0); // TIC to $518
    rig.put_ccw(0x510, 0x04, 0x701, 0x00, 1); // sense, never reached
    rig.put_ccw(0x518, 0x08, 0x510, 0x00, 0); // TIC to TIC
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0020_0000);
    assert_eq!(rig.mem.get_byte(0x700).0, 0);
    assert_eq!(rig.mem.get_byte(0x701).0, 0);
}

#[test]
fn tic_as_first_ccw_is_program_check() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x08, 0x510, 0x00, 0);
    assert_eq!(rig.start(0x500), 1);
    assert_eq!(rig.csw().1, 0x0020_0000);
}

#[test]
fn tic_redirects_a_command_chain() {
    let mut rig = Rig::new(8);
    rig.put_ccw(0x500, 0x02, 0x600, 0x40, 8); // READ, CC
    rig.put_ccw(0x508, 0x08, 0x540, 0x00, 0); // TIC to $540
    rig.put_ccw(0x540, 0x02, 0x700, 0x00, 8); // READ
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    // Last CAW points past the CCW the TIC landed on
    assert_eq!(rig.csw(), (0x0000_0548, 0x0c00_0000));
    for i in 0..8u32 {
        assert_eq!(rig.mem.get_byte(0x700 + i).0, 0xF0 + i as u8);
    }
}

#[test]
fn command_chain_stores_no_interim_csw() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x02, 0x600, 0x40, 0x10); // CC
    rig.put_ccw(0x508, 0x02, 0x700, 0x00, 0x10);
    assert_eq!(rig.start(0x500), 0);

    // The CSW words must stay untouched until the final interrupt
    let mut presented = None;
    for _ in 0..10_000 {
        let mut io = rig.io();
        if let Some(d) = io.chan_scan(0x8000, true) {
            presented = Some(d);
            break;
        }
        io.advance(1);
        assert_eq!(rig.csw(), (0, 0));
    }
    assert_eq!(presented, Some(DEV));
    assert_eq!(rig.csw(), (0x0000_0510, 0x0c00_0000));
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x600 + i).0, 0xF0 + i as u8);
        assert_eq!(rig.mem.get_byte(0x700 + i).0, 0xF0 + i as u8);
    }
}

#[test]
fn pci_interrupts_without_ending_the_program() {
    let mut rig = Rig::new(0x20);
    rig.put_ccw(0x500, 0x02, 0x600, 0x80, 0x10); // CD
    rig.put_ccw(0x508, 0x02, 0x700, 0x08, 0x10); // PCI
    assert_eq!(rig.start(0x500), 0);

    // First interrupt: PCI, with the program still running
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0080_0010);

    // Second interrupt: the real ending status
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c00_0000);
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x700 + i).0, i as u8);
    }
}

#[test]
fn store_protection_aborts_the_transfer() {
    let mut rig = Rig::new(0x10);
    rig.mem.put_key(0x4000, 0x30);
    rig.put_ccw(0x500, 0x02, 0x4000, 0x00, 0x10);
    // CAW key 2
    assert_eq!(rig.start(0x2000_0500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    // Channel end + device end + incorrect length + protection check
    assert_eq!(rig.csw().1, 0x0c50_0010);
    assert_eq!(rig.mem.get_word(0x4000).0, 0);
}

#[test]
fn matching_key_passes_protection() {
    let mut rig = Rig::new(0x10);
    rig.mem.put_key(0x4000, 0x20);
    rig.put_ccw(0x500, 0x02, 0x4000, 0x00, 0x10);
    assert_eq!(rig.start(0x2000_0500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c00_0000);
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x4000 + i).0, 0xF0 + i as u8);
    }
}

#[test]
fn read_backward_stores_descending() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x0C, 0x60F, 0x00, 0x10);
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c00_0000);
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x60F - i).0, 0xF0 + i as u8);
    }
}

#[test]
fn skip_counts_without_storing() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x02, 0x600, 0x10, 0x10); // SKIP
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c00_0000);
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x600 + i).0, 0);
    }
}

#[test]
fn indirect_data_addressing_follows_the_list() {
    let mut rig = Rig::new(0x10);
    // Scatter list at $520: 4 bytes to the end of the first 2 KiB block,
    // the rest at $1000
    rig.mem.put_word(0x520, 0x0000_07FC);
    rig.mem.put_word(0x524, 0x0000_1000);
    rig.put_ccw(0x500, 0x02, 0x520, 0x04, 0x10); // IDA
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c00_0000);
    for i in 0..4u32 {
        assert_eq!(rig.mem.get_byte(0x7FC + i).0, 0xF0 + i as u8);
    }
    for i in 4..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x1000 + i - 4).0, 0xF0 + i as u8);
    }
}

#[test]
fn sense_delivers_the_sense_byte() {
    let mut rig = Rig::new(0x10);
    // An unsupported command first, to set command reject
    rig.put_ccw(0x500, 0x27, 0x600, 0x00, 1);
    assert_eq!(rig.start(0x500), 1);
    assert_eq!(rig.csw().1 & 0xffff_0000, 0x0e00_0000); // CE+DE+unit check

    rig.put_ccw(0x500, 0x04, 0x701, 0x00, 1);
    assert_eq!(rig.start(0x500), 0);
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0c00_0000);
    assert_eq!(rig.mem.get_byte(0x701).0, 0x80);
}

#[test]
fn nop_completes_immediately() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x03, 0x000, 0x00, 1);
    assert_eq!(rig.start(0x500), 1);
    assert_eq!(rig.csw(), (0x0000_0508, 0x0c00_0001));
}

#[test]
fn split_channel_and_device_end() {
    // $0B pulls one byte, presents channel end, and device end trails by
    // ten cycles. Two separate interrupts.
    let mut rig = Rig::new(0x10);
    rig.mem.put_byte(0x600, 0xA5);
    rig.put_ccw(0x500, 0x0B, 0x600, 0x00, 1);
    assert_eq!(rig.start(0x500), 0);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw().1, 0x0800_0000);

    // The late device end lands as pending device status
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw(), (0, 0x0400_0000));
}

#[test]
fn delayed_device_end_chains_to_the_next_command() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x13, 0x000, 0x40, 1); // CC
    rig.put_ccw(0x508, 0x02, 0x600, 0x00, 0x10);
    let cc = rig.start(0x500);
    // Immediate channel end with the chain still to run
    assert_eq!(cc, 1);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw(), (0x0000_0510, 0x0c00_0000));
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x600 + i).0, 0xF0 + i as u8);
    }
}

#[test]
fn zero_count_is_program_check() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x02, 0x600, 0x00, 0);
    assert_eq!(rig.start(0x500), 1);
    assert_eq!(rig.csw().1 & 0x0020_0000, 0x0020_0000);
}

#[test]
fn unaligned_caw_is_program_check() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x504, 0x02, 0x600, 0x00, 0x10);
    assert_eq!(rig.start(0x504), 1);
    assert_eq!(rig.csw().1 & 0x0020_0000, 0x0020_0000);
}

#[test]
fn halt_io_truncates_a_running_read() {
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x02, 0x600, 0x00, 0x10);
    assert_eq!(rig.start(0x500), 0);
    rig.io().advance(35); // three bytes in

    assert_eq!(rig.io().halt_io(DEV), 1);
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    // Truncated: incorrect length with the residual showing
    let w1 = rig.csw().1;
    assert_eq!(w1 & 0xffff_0000, 0x0c40_0000);
    assert!(w1 & 0xffff != 0);
}

#[test]
fn write_round_trips_through_the_device() {
    // Read 16 bytes to an unaligned address, write them back from there,
    // then read again elsewhere: the byte stream must survive intact.
    let mut rig = Rig::new(0x10);
    rig.put_ccw(0x500, 0x02, 0x601, 0x00, 0x10);
    assert_eq!(rig.start(0x500), 0);
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));

    rig.put_ccw(0x500, 0x01, 0x601, 0x00, 0x10);
    assert_eq!(rig.start(0x500), 0);
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));

    rig.put_ccw(0x500, 0x02, 0x701, 0x00, 0x10);
    assert_eq!(rig.start(0x500), 0);
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    for i in 0..0x10u32 {
        assert_eq!(rig.mem.get_byte(0x701 + i).0, 0xF0 + i as u8);
    }
}

#[test]
fn busy_device_parks_the_chain_until_device_end() {
    /// Accepts NOP immediately; the first READ is refused busy, with the
    /// device freeing up 20 cycles later.
    struct BusyOnce {
        addr: u16,
        refused: bool,
    }
    impl Device for BusyOnce {
        fn start_io(&mut self, _ctx: &mut IoContext<'_>) -> u8 {
            0
        }
        fn start_cmd(&mut self, ctx: &mut IoContext<'_>, cmd: u8) -> u8 {
            match cmd {
                0x03 => DEV_CHAN_END | DEV_DEV_END,
                _ if !self.refused => {
                    self.refused = true;
                    ctx.schedule(self.addr, 20, 0);
                    DEV_BUSY
                }
                _ => DEV_CHAN_END | DEV_DEV_END,
            }
        }
        fn halt_io(&mut self, _ctx: &mut IoContext<'_>) -> u8 {
            0
        }
        fn init_dev(&mut self) -> u8 {
            0
        }
        fn event(&mut self, ctx: &mut IoContext<'_>, _arg: i32) {
            ctx.set_dev_attn(self.addr, DEV_DEV_END);
        }
    }

    let mut rig = Rig::with_device(Box::new(BusyOnce {
        addr: DEV,
        refused: false,
    }));
    rig.put_ccw(0x500, 0x03, 0x000, 0x40, 1); // NOP, CC
    rig.put_ccw(0x508, 0x02, 0x600, 0x60, 0x10); // READ, CC + SLI
    rig.put_ccw(0x510, 0x03, 0x000, 0x00, 1); // NOP
    assert_eq!(rig.start(0x500), 1);

    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    let (w0, w1) = rig.csw();
    assert_eq!(w0, 0x0000_0518);
    assert_eq!(w1 & 0xffff_0000, 0x0c00_0000);
}

#[test]
fn ipl_reads_the_boot_record_and_funnels_the_loader() {
    let mut dev = TestDevice::new(DEV, 24);
    // Boot record: 8 bytes of PSW, then a NOP CCW at 8 that ends the
    // chained program cleanly
    let mut record = [0u8; 24];
    record[0] = 0x12;
    record[8] = 0x03;
    record[15] = 0x01;
    dev.fill(&record);
    let mut rig = Rig::with_device(Box::new(dev));

    rig.io().ipl(DEV).expect("ipl");
    assert_eq!(rig.chans.loading(), Some(DEV));

    // Interrupts are off during the load; only the loader may surface
    assert_eq!(rig.run_until_scan(0xffff, false), Some(DEV));
    for (i, b) in record.iter().enumerate() {
        assert_eq!(rig.mem.get_byte(i as u32).0, *b);
    }
    // No CSW during an IPL
    assert_eq!(rig.csw(), (0, 0));

    rig.chans.finish_load();
    assert_eq!(rig.chans.loading(), None);
}

#[test]
fn pending_attention_is_swept_by_the_scan() {
    let mut rig = Rig::new(0x10);
    {
        let mut io = rig.io();
        io.set_dev_attn(DEV, 0x80);
    }
    assert_eq!(rig.run_until_scan(0x8000, true), Some(DEV));
    assert_eq!(rig.csw(), (0, 0x8000_0000));
}
