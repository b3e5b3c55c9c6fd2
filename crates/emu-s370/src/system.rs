//! The simulation driver.
//!
//! Single-threaded and cooperative: each pass runs one CPU instruction
//! (when running), advances the event queue by its cycle cost, offers any
//! pending interrupt to the CPU, and applies at most one inbound control
//! message. With the CPU stopped, time still moves one cycle per pass so
//! timer-driven devices make progress. There are no locks anywhere;
//! device callbacks run synchronously inside the loop.
//!
//! External producers talk to the loop through [`SystemHandle`], which
//! never blocks on the machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use s370_channel::{ChannelSet, Device, EventQueue, IoContext};
use s370_storage::Storage;

use crate::config::SystemConfig;
use crate::control::ControlMessage;
use crate::cpu::Cpu;

/// The assembled machine.
pub struct System<C: Cpu> {
    pub mem: Storage,
    pub chans: ChannelSet,
    pub events: EventQueue,
    pub cpu: C,
    running: bool,
    rx: Receiver<ControlMessage>,
    shutdown: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

/// Cloneable handle for enqueueing control messages and shutting the
/// machine down from outside.
#[derive(Clone)]
pub struct SystemHandle {
    tx: Sender<ControlMessage>,
    shutdown: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl<C: Cpu> System<C> {
    /// Build a machine from a configuration. Devices are registered
    /// afterwards with [`System::add_device`].
    pub fn new(config: &SystemConfig, cpu: C) -> Result<(Self, SystemHandle), String> {
        let mut chans = ChannelSet::new();
        for ch in &config.channels {
            chans.add_channel(ch.index, ch.kind, ch.subchannels)?;
        }
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let system = Self {
            mem: Storage::new(config.memory_k),
            chans,
            events: EventQueue::new(),
            cpu,
            running: false,
            rx,
            shutdown: Arc::clone(&shutdown),
            stopped: Arc::clone(&stopped),
        };
        let handle = SystemHandle {
            tx,
            shutdown,
            stopped,
        };
        Ok((system, handle))
    }

    /// Register a device at `dev`.
    pub fn add_device(&mut self, dev: u16, device: Box<dyn Device>) -> Result<(), String> {
        self.chans.add_device(dev, device)
    }

    /// Borrowed engine context over this machine's parts.
    pub fn io(&mut self) -> IoContext<'_> {
        IoContext::new(&mut self.chans, &mut self.mem, &mut self.events)
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.running
    }

    /// Run until shut down. Devices are initialised on entry and shut
    /// down on exit; pending events are simply abandoned.
    pub fn run(&mut self) {
        self.chans.init_devices();
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.chans.shutdown_devices();
                break;
            }
            self.cycle();
        }
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// One pass of the driver loop.
    pub fn cycle(&mut self) {
        if self.running {
            let mut io = IoContext::new(&mut self.chans, &mut self.mem, &mut self.events);
            let (cycles, keep_going) = self.cpu.step(&mut io);
            io.advance(cycles);
            if !keep_going {
                self.running = false;
            }
            self.offer_interrupt();
            self.poll_message(false);
        } else if self.events.any_event() {
            let mut io = IoContext::new(&mut self.chans, &mut self.mem, &mut self.events);
            io.advance(1);
            self.offer_interrupt();
            self.poll_message(false);
        } else {
            // Fully idle: the message receive is the only wait point
            self.poll_message(true);
        }
    }

    /// Let the CPU take a pending interrupt, and drive an IPL to
    /// completion while one is loading.
    fn offer_interrupt(&mut self) {
        if self.chans.loading().is_some() {
            let mut io = IoContext::new(&mut self.chans, &mut self.mem, &mut self.events);
            if let Some(dev) = io.chan_scan(0xffff, false) {
                if Some(dev) == self.chans.loading() {
                    self.chans.finish_load();
                    let mut io =
                        IoContext::new(&mut self.chans, &mut self.mem, &mut self.events);
                    self.cpu.ipl_complete(&mut io);
                    self.running = true;
                }
            }
            return;
        }
        let mask = self.cpu.channel_mask();
        let enabled = self.cpu.irq_enabled();
        let mut io = IoContext::new(&mut self.chans, &mut self.mem, &mut self.events);
        if let Some(dev) = io.chan_scan(mask, enabled) {
            self.cpu.io_interrupt(&mut io, dev);
        }
    }

    fn poll_message(&mut self, idle: bool) {
        let message = if idle {
            self.rx.recv_timeout(Duration::from_millis(20)).ok()
        } else {
            match self.rx.try_recv() {
                Ok(m) => Some(m),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            }
        };
        if let Some(message) = message {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::TelConnect { dev, conn } => self.io().device_connect(dev, conn),
            ControlMessage::TelDisconnect { dev } => self.io().device_disconnect(dev),
            ControlMessage::TelReceive { dev, data } => self.io().device_receive(dev, &data),
            ControlMessage::TimeClock => self.cpu.tick_tod(),
            ControlMessage::IplDevice { dev } => {
                if let Err(e) = self.io().ipl(dev) {
                    eprintln!("IPL failed: {e}");
                }
            }
            ControlMessage::Start => self.running = true,
            ControlMessage::Stop => self.running = false,
        }
    }
}

impl SystemHandle {
    /// Enqueue a control message. Returns false once the machine is gone.
    pub fn send(&self, message: ControlMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Ask the loop to exit and wait up to one second for it.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(1);
        while !self.stopped.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                eprintln!("warning: simulation loop did not stop within 1s");
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
