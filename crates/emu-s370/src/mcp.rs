//! JSON-RPC control server.
//!
//! Exposes the machine over stdin/stdout as JSON-RPC 2.0, one request per
//! line. Scripts and agents can deposit storage, issue the I/O
//! instructions, advance virtual time, and watch the interrupt scan.
//! Enough to drive and observe channel programs without a front end.

use std::io::{self, BufRead, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::cpu::IdleCpu;
use crate::system::System;

#[derive(Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: JsonValue,
    id: JsonValue,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: JsonValue,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: JsonValue, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError { code, message }),
            id,
        }
    }
}

/// Control server wrapping a headless machine.
pub struct McpServer {
    system: System<IdleCpu>,
}

impl McpServer {
    #[must_use]
    pub fn new(system: System<IdleCpu>) -> Self {
        Self { system }
    }

    /// Read requests from stdin, write responses to stdout, until EOF.
    pub fn run(&mut self) {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<RpcRequest>(&line) {
                Ok(request) => self.dispatch(request),
                Err(e) => RpcResponse::error(JsonValue::Null, -32700, format!("parse error: {e}")),
            };
            if let Ok(text) = serde_json::to_string(&response) {
                let _ = writeln!(stdout, "{text}");
                let _ = stdout.flush();
            }
        }
    }

    fn dispatch(&mut self, request: RpcRequest) -> RpcResponse {
        let params = &request.params;
        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "name": "emu-s370",
                "version": env!("CARGO_PKG_VERSION"),
            })),
            "examine" => param_u32(params, "addr").map(|addr| {
                let (word, fault) = self.system.mem.get_word(addr);
                json!({ "word": word, "fault": fault })
            }),
            "deposit" => param_u32(params, "addr").and_then(|addr| {
                let value = param_u32(params, "value")?;
                let fault = self.system.mem.put_word(addr, value);
                Ok(json!({ "fault": fault }))
            }),
            "sio" => param_dev(params).map(|dev| json!(self.system.io().start_io(dev))),
            "tio" => param_dev(params).map(|dev| json!(self.system.io().test_io(dev))),
            "hio" => param_dev(params).map(|dev| json!(self.system.io().halt_io(dev))),
            "tch" => param_dev(params).map(|dev| json!(self.system.io().test_chan(dev))),
            "advance" => param_u32(params, "cycles").map(|cycles| {
                self.system.io().advance(cycles);
                json!(null)
            }),
            "scan" => {
                let mask = param_u32(params, "mask").unwrap_or(0xffff) as u16;
                Ok(json!(self.system.io().chan_scan(mask, true)))
            }
            "ipl" => param_dev(params).and_then(|dev| {
                self.system.io().ipl(dev)?;
                Ok(json!(null))
            }),
            "debug" => param_dev(params).map(|dev| json!(self.system.chans.device_debug(dev))),
            other => Err(format!("unknown method {other}")),
        };
        match result {
            Ok(value) => RpcResponse::success(request.id, value),
            Err(message) => RpcResponse::error(request.id, -32602, message),
        }
    }
}

fn param_u32(params: &JsonValue, name: &str) -> Result<u32, String> {
    params
        .get(name)
        .and_then(JsonValue::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| format!("missing or bad {name}"))
}

fn param_dev(params: &JsonValue) -> Result<u16, String> {
    param_u32(params, "dev").and_then(|v| u16::try_from(v).map_err(|_| "bad dev".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::cpu::IdleCpu;

    fn server() -> McpServer {
        let (system, _handle) =
            System::new(&SystemConfig::default(), IdleCpu::new()).expect("system");
        McpServer::new(system)
    }

    fn call(server: &mut McpServer, method: &str, params: JsonValue) -> RpcResponse {
        server.dispatch(RpcRequest {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: json!(1),
        })
    }

    #[test]
    fn deposit_then_examine() {
        let mut server = server();
        let r = call(&mut server, "deposit", json!({"addr": 0x600, "value": 0xDEADu32}));
        assert!(r.error.is_none());
        let r = call(&mut server, "examine", json!({"addr": 0x600}));
        assert_eq!(r.result, Some(json!({"word": 0xDEADu32, "fault": false})));
    }

    #[test]
    fn sio_to_nowhere_is_cc3() {
        let mut server = server();
        let r = call(&mut server, "sio", json!({"dev": 0x50F}));
        assert_eq!(r.result, Some(json!(3)));
    }

    #[test]
    fn unknown_method_errors() {
        let mut server = server();
        let r = call(&mut server, "frobnicate", json!({}));
        assert!(r.error.is_some());
    }
}
