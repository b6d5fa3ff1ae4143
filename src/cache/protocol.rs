//! Line-oriented cache wire grammar.
//!
//! ```text
//! <timestamp>[+<ttl>]@<prefix><device>/<param><op>[<value>]\n
//! ```
//!
//! `op` is `=` for UPDATE (followed by the JSON-serialized value) and `!` for
//! EXPIRE (no value). Numbers are written in Rust's shortest round-trip float
//! notation and values in compact JSON. Lines in any other spelling are
//! rejected, so `encode(decode(line)) == line` holds for every accepted line.

use serde_json::Value;

use crate::error::{DaqError, DaqResult};

pub const OP_UPDATE: char = '=';
pub const OP_EXPIRE: char = '!';
pub const TTL_MARKER: char = '+';
pub const KEY_MARKER: char = '@';

#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    Update { value: Value },
    Expire,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheMessage {
    pub timestamp: f64,
    pub ttl: Option<f64>,
    pub device: String,
    pub param: String,
    pub op: CacheOp,
}

impl CacheMessage {
    pub fn update(
        timestamp: f64,
        ttl: Option<f64>,
        device: impl Into<String>,
        param: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            timestamp,
            ttl,
            device: device.into(),
            param: param.into(),
            op: CacheOp::Update { value },
        }
    }

    pub fn expire(timestamp: f64, device: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            timestamp,
            ttl: None,
            device: device.into(),
            param: param.into(),
            op: CacheOp::Expire,
        }
    }
}

/// Encoder/decoder bound to one key prefix.
#[derive(Debug, Clone)]
pub struct CacheCodec {
    prefix: String,
}

impl CacheCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn encode(&self, msg: &CacheMessage) -> DaqResult<String> {
        let mut line = format_float(msg.timestamp);
        if let (Some(ttl), CacheOp::Update { .. }) = (msg.ttl, &msg.op) {
            line.push(TTL_MARKER);
            line.push_str(&format_float(ttl));
        }
        line.push(KEY_MARKER);
        line.push_str(&self.prefix);
        line.push_str(&msg.device);
        line.push('/');
        line.push_str(&msg.param);
        match &msg.op {
            CacheOp::Update { value } => {
                line.push(OP_UPDATE);
                line.push_str(&serde_json::to_string(value)?);
            }
            CacheOp::Expire => line.push(OP_EXPIRE),
        }
        line.push('\n');
        Ok(line)
    }

    pub fn decode(&self, line: &str) -> DaqResult<CacheMessage> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let malformed = |why: &str| DaqError::Communication(format!("malformed cache line {line:?}: {why}"));

        let (head, rest) = line
            .split_once(KEY_MARKER)
            .ok_or_else(|| malformed("missing '@'"))?;
        let (ts, ttl) = match head.split_once(TTL_MARKER) {
            Some((ts, ttl)) => (ts, Some(parse_float(ttl).ok_or_else(|| malformed("bad ttl"))?)),
            None => (head, None),
        };
        let timestamp = parse_float(ts).ok_or_else(|| malformed("bad timestamp"))?;

        let key = rest
            .strip_prefix(self.prefix.as_str())
            .ok_or_else(|| malformed("wrong key prefix"))?;
        let op_at = key
            .find([OP_UPDATE, OP_EXPIRE])
            .ok_or_else(|| malformed("missing operation"))?;
        let (path, op_and_value) = key.split_at(op_at);
        let (device, param) = path
            .split_once('/')
            .ok_or_else(|| malformed("key is not device/param"))?;
        if device.is_empty() || param.is_empty() {
            return Err(malformed("empty device or parameter name"));
        }

        let op = if let Some(raw) = op_and_value.strip_prefix(OP_UPDATE) {
            let value: Value = serde_json::from_str(raw).map_err(|e| malformed(&e.to_string()))?;
            if serde_json::to_string(&value)? != raw {
                return Err(malformed("non-canonical value"));
            }
            CacheOp::Update { value }
        } else if op_and_value.len() == 1 {
            CacheOp::Expire
        } else {
            return Err(malformed("expire carries a value"));
        };
        if ttl.is_some() && op == CacheOp::Expire {
            return Err(malformed("expire carries a ttl"));
        }

        Ok(CacheMessage {
            timestamp,
            ttl,
            device: device.to_string(),
            param: param.to_string(),
            op,
        })
    }
}

fn format_float(f: f64) -> String {
    format!("{f:?}")
}

/// Finite float in exactly the spelling [`format_float`] produces.
fn parse_float(s: &str) -> Option<f64> {
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && format_float(*f) == s)
}
