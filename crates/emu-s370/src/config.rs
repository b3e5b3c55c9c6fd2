//! Machine configuration.
//!
//! Text statements, one per line, `#` starts a comment:
//!
//! ```text
//! MEMORY 1024K
//! CHANNEL 0 MPX
//! CHANNEL 1 SEL
//! CHANNEL 2 BMUX
//! CHANNEL 3 MUX SUB=64
//! ```
//!
//! `MPX`/`MUX` are the same thing spelled two ways and default to 256
//! subchannels; `SEL` has one; `BMUX` always gets 32. `SUB` caps at 256
//! and only means something on a multiplexer.

use s370_channel::ChannelKind;

/// One configured channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub index: usize,
    pub kind: ChannelKind,
    pub subchannels: usize,
}

/// Parsed machine configuration.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Storage size in KiB.
    pub memory_k: u32,
    pub channels: Vec<ChannelConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            memory_k: 1024,
            channels: vec![ChannelConfig {
                index: 0,
                kind: ChannelKind::Multiplexer,
                subchannels: 256,
            }],
        }
    }
}

/// Parse a configuration text.
pub fn parse_config(text: &str) -> Result<SystemConfig, String> {
    let mut config = SystemConfig {
        memory_k: 1024,
        channels: Vec::new(),
    };

    for (num, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(keyword) = tokens.next() else {
            continue;
        };
        match keyword.to_ascii_uppercase().as_str() {
            "MEMORY" => {
                let arg = tokens
                    .next()
                    .ok_or_else(|| format!("line {}: MEMORY needs a size", num + 1))?;
                config.memory_k = parse_memory(arg)
                    .ok_or_else(|| format!("line {}: bad memory size {arg}", num + 1))?;
            }
            "CHANNEL" => {
                let channel = parse_channel(&mut tokens)
                    .map_err(|e| format!("line {}: {e}", num + 1))?;
                if config.channels.iter().any(|c| c.index == channel.index) {
                    return Err(format!(
                        "line {}: channel {} defined twice",
                        num + 1,
                        channel.index
                    ));
                }
                config.channels.push(channel);
            }
            other => return Err(format!("line {}: unknown statement {other}", num + 1)),
        }
        if let Some(extra) = tokens.next() {
            return Err(format!("line {}: unexpected {extra}", num + 1));
        }
    }
    Ok(config)
}

/// Size with a K or M suffix, in KiB.
fn parse_memory(arg: &str) -> Option<u32> {
    let upper = arg.to_ascii_uppercase();
    if let Some(k) = upper.strip_suffix('K') {
        return k.parse().ok();
    }
    if let Some(m) = upper.strip_suffix('M') {
        return m.parse::<u32>().ok().map(|v| v * 1024);
    }
    upper.parse().ok()
}

fn parse_channel<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<ChannelConfig, String> {
    let index: usize = tokens
        .next()
        .ok_or("CHANNEL needs a number")?
        .parse()
        .map_err(|_| "bad channel number".to_string())?;
    if index >= s370_channel::MAX_CHANNELS {
        return Err(format!("channel {index} out of range"));
    }

    let kind_token = tokens.next().ok_or("CHANNEL needs a type")?;
    let kind = match kind_token.to_ascii_uppercase().as_str() {
        "MPX" | "MUX" => ChannelKind::Multiplexer,
        "SEL" => ChannelKind::Selector,
        "BMUX" => ChannelKind::BlockMultiplexer,
        other => return Err(format!("unknown channel type {other}")),
    };

    let mut subchannels = match kind {
        ChannelKind::Multiplexer => 256,
        ChannelKind::Selector => 1,
        ChannelKind::BlockMultiplexer => 32,
    };
    if let Some(opt) = tokens.next() {
        let upper = opt.to_ascii_uppercase();
        let Some(count) = upper.strip_prefix("SUB=") else {
            return Err(format!("unknown channel option {opt}"));
        };
        let count: usize = count.parse().map_err(|_| "bad SUB count".to_string())?;
        if count == 0 || count > 256 {
            return Err(format!("SUB={count} out of range"));
        }
        // SUB only matters on a multiplexer; BMUX stays at 32, SEL at 1
        if kind == ChannelKind::Multiplexer {
            subchannels = count;
        }
    }

    Ok(ChannelConfig {
        index,
        kind,
        subchannels,
    })
}
