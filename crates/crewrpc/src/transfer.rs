//! Transferable-buffer detection.
//!
//! Before a message crosses a transport boundary, its arguments are
//! scanned for binary buffers so the transport can move them by
//! ownership instead of serializing them. The scan is bounded: the top
//! level of `args`, plus one level into a map or a short list. Checking
//! deeper would cost more than the copies it saves, so anything nested
//! further must be transferred explicitly by the caller. Omission never
//! changes correctness, only throughput.

use bytes::Bytes;

use crate::envelope::Envelope;
use crate::value::Value;

/// Argument lists longer than this are not scanned item by item.
pub const ARG_SCAN_MAX: usize = 10;

/// Collects the transfer list for an outgoing envelope.
pub fn transferables(envelope: &Envelope) -> Vec<Bytes> {
    let mut found = Vec::new();
    if let Some(args) = &envelope.args {
        scan(args, &mut found);
    }
    found
}

fn scan(value: &Value, out: &mut Vec<Bytes>) {
    match value {
        Value::Bin(bytes) => out.push(bytes.clone()),
        Value::Map(map) => {
            for entry in map.values() {
                if let Value::Bin(bytes) = entry {
                    out.push(bytes.clone());
                }
            }
        }
        Value::List(items) if items.len() <= ARG_SCAN_MAX => {
            for item in items {
                if let Value::Bin(bytes) = item {
                    out.push(bytes.clone());
                }
            }
        }
        _ => {}
    }
}
