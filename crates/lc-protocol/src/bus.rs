//! Frame-bus registry protocol.
//!
//! Newline-delimited JSON over TCP, one request/response pair per line.
//! The bus process owns the slot registry; casts and external producers
//! are clients.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BusRequest {
    /// Allocate a slot sized for `width x height` RGB frames.
    Create { name: String, width: u32, height: u32 },
    /// Resolve an existing slot for attachment.
    Attach { name: String },
    /// Release a slot and unlink its backing file.
    Delete { name: String },
    /// Names of all live slots.
    List,
    /// Dimensions of one slot.
    Info { name: String },
    /// Liveness probe.
    Status,
    /// Ask the bus process to exit.
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BusResponse {
    Ok,
    Error { message: String },
    Slot {
        name: String,
        width: u32,
        height: u32,
        path: String,
    },
    Slots { names: Vec<String> },
    Running { slots: usize },
}

impl BusResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Write one message as a JSON line.
pub fn write_message<T: Serialize>(w: &mut impl Write, msg: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()
}

/// Read one JSON-line message; `Ok(None)` on a cleanly closed peer.
pub fn read_message<T: for<'de> Deserialize<'de>>(
    r: &mut impl BufRead,
) -> std::io::Result<Option<T>> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let msg = serde_json::from_str(line.trim_end())?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn request_json_shape() {
        let req = BusRequest::Create {
            name: "feed1".into(),
            width: 32,
            height: 32,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"op":"create","name":"feed1","width":32,"height":32}"#
        );
    }

    #[test]
    fn message_roundtrip_over_buffer() {
        let mut wire = Vec::new();
        write_message(&mut wire, &BusRequest::List).unwrap();
        write_message(
            &mut wire,
            &BusResponse::Slots {
                names: vec!["a".into(), "b".into()],
            },
        )
        .unwrap();

        let mut reader = BufReader::new(wire.as_slice());
        let req: BusRequest = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(req, BusRequest::List);
        let resp: BusResponse = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(
            resp,
            BusResponse::Slots {
                names: vec!["a".into(), "b".into()]
            }
        );
        let eof: Option<BusRequest> = read_message(&mut reader).unwrap();
        assert!(eof.is_none());
    }
}
