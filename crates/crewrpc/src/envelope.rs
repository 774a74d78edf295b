//! The message envelope and correlation protocol.
//!
//! Every message between execution units is one `Envelope`. The presence
//! of a `callback_id` on an outgoing request means exactly one reply
//! envelope echoing that id comes back; a reply has a `callback_id` and
//! no `route`. Streamed results reuse the reply shape with the source
//! route standing in as the correlation id (`CallbackId::Route`), so one
//! "request" can have an ongoing stream of replies sharing one id.

use serde::Deserialize;
use serde::Serialize;

use crate::value::Value;

/// Token linking a request to its eventual reply (or replies).
///
/// `Seq` correlates a one-shot request; `Route` tags every value of a
/// subscription stream with the producing route's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallbackId {
    Seq(u64),
    Route(String),
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Operation to invoke on the receiving side; absent on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Sub-operation on the target named by `route`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(
        default,
        rename = "callbackId",
        skip_serializing_if = "Option::is_none"
    )]
    pub callback_id: Option<CallbackId>,
}

impl Envelope {
    /// A one-way message: no correlation id, no reply expected.
    pub fn post(route: impl Into<String>, args: Value) -> Self {
        Envelope {
            route: Some(route.into()),
            args: Some(args),
            method: None,
            callback_id: None,
        }
    }

    /// An operation message naming a sub-operation on the target.
    pub fn operation(
        route: impl Into<String>,
        args: Value,
        method: Option<String>,
    ) -> Self {
        Envelope {
            route: Some(route.into()),
            args: Some(args),
            method,
            callback_id: None,
        }
    }

    /// A reply (or streamed result) echoing the correlation id.
    pub fn reply(args: Value, callback_id: CallbackId) -> Self {
        Envelope {
            route: None,
            args: Some(args),
            method: None,
            callback_id: Some(callback_id),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.route.is_none() && self.callback_id.is_some()
    }

    /// Lowers the envelope into a `Value` so a whole message can ride
    /// inside another envelope's argument list (the `runRequest` shape).
    pub fn to_value(&self) -> Value {
        let mut entries: Vec<(String, Value)> = Vec::new();
        if let Some(route) = &self.route {
            entries.push(("route".into(), Value::Str(route.clone())));
        }
        if let Some(args) = &self.args {
            entries.push(("args".into(), args.clone()));
        }
        if let Some(method) = &self.method {
            entries.push(("method".into(), Value::Str(method.clone())));
        }
        if let Some(cb) = &self.callback_id {
            let cb = match cb {
                CallbackId::Seq(n) => Value::Int(*n as i64),
                CallbackId::Route(r) => Value::Str(r.clone()),
            };
            entries.push(("callbackId".into(), cb));
        }
        Value::Map(entries.into_iter().collect())
    }

    /// Reads an envelope back out of a `Value` map.
    ///
    /// Returns `None` when the value is not a map; missing fields stay
    /// `None` on the envelope.
    pub fn from_value(value: &Value) -> Option<Envelope> {
        let map = value.as_map()?;
        let callback_id = map.get("callbackId").and_then(|cb| match cb {
            Value::Int(n) if *n >= 0 => Some(CallbackId::Seq(*n as u64)),
            Value::Str(s) => Some(CallbackId::Route(s.clone())),
            _ => None,
        });
        Some(Envelope {
            route: map
                .get("route")
                .and_then(Value::as_str)
                .map(str::to_string),
            args: map.get("args").cloned(),
            method: map
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_string),
            callback_id,
        })
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Value {
        envelope.to_value()
    }
}
