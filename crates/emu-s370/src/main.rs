//! System/370 machine binary.
//!
//! Runs the machine headless for a bounded number of driver passes, or as
//! a JSON-RPC control server on stdin/stdout.

use std::path::PathBuf;
use std::process;

use emu_s370::mcp::McpServer;
use emu_s370::{Console, ControlMessage, IdleCpu, System, SystemConfig, parse_config};

struct CliArgs {
    config_path: Option<PathBuf>,
    mcp: bool,
    ipl_dev: Option<u16>,
    cycles: u64,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        mcp: false,
        ipl_dev: None,
        cycles: 100_000,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                cli.config_path = args.get(i).map(PathBuf::from);
            }
            "--mcp" => {
                cli.mcp = true;
            }
            "--ipl" => {
                i += 1;
                cli.ipl_dev = args
                    .get(i)
                    .and_then(|s| u16::from_str_radix(s.trim_start_matches("0x"), 16).ok());
                if cli.ipl_dev.is_none() {
                    eprintln!("--ipl needs a hex device number");
                    process::exit(2);
                }
            }
            "--cycles" => {
                i += 1;
                cli.cycles = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--cycles needs a number");
                    process::exit(2);
                });
            }
            "--help" | "-h" => {
                println!(
                    "usage: emu-s370 [--config FILE] [--mcp] [--ipl DEV] [--cycles N]\n\n\
                     --config FILE  machine configuration (MEMORY/CHANNEL statements)\n\
                     --mcp          serve JSON-RPC on stdin/stdout\n\
                     --ipl DEV      boot from the given device (hex)\n\
                     --cycles N     driver passes to run headless (default 100000)"
                );
                process::exit(0);
            }
            other => {
                eprintln!("unknown argument {other}");
                process::exit(2);
            }
        }
        i += 1;
    }
    cli
}

fn load_config(cli: &CliArgs) -> SystemConfig {
    let Some(path) = &cli.config_path else {
        return SystemConfig::default();
    };
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("cannot read {}: {e}", path.display());
        process::exit(1);
    });
    parse_config(&text).unwrap_or_else(|e| {
        eprintln!("bad configuration: {e}");
        process::exit(1);
    })
}

fn main() {
    let cli = parse_args();
    let config = load_config(&cli);
    let (mut system, handle) = System::new(&config, IdleCpu::new()).unwrap_or_else(|e| {
        eprintln!("cannot build machine: {e}");
        process::exit(1);
    });

    // Operator console on the first configured channel
    let console_dev = config.channels.first().map(|ch| ((ch.index as u16) << 8) | 0x1F);
    if let Some(dev) = console_dev {
        if let Err(e) = system.add_device(dev, Box::new(Console::new(dev))) {
            eprintln!("cannot attach console: {e}");
        }
    }

    if cli.mcp {
        McpServer::new(system).run();
        return;
    }

    println!(
        "emu-s370: {} KiB storage, {} channel(s){}",
        config.memory_k,
        config.channels.len(),
        console_dev.map_or_else(String::new, |d| format!(", console at {d:03X}")),
    );
    if let Some(dev) = cli.ipl_dev {
        handle.send(ControlMessage::IplDevice { dev });
    }
    for _ in 0..cli.cycles {
        system.cycle();
    }
    let (csw1, _) = system.mem.get_word(0x40);
    let (csw2, _) = system.mem.get_word(0x44);
    println!("CSW {csw1:08X} {csw2:08X}");
}
