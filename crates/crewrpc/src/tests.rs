//! Tests for the wire layer.

use bytes::Bytes;

use crate::envelope::CallbackId;
use crate::envelope::Envelope;
use crate::transfer;
use crate::transfer::ARG_SCAN_MAX;
use crate::value::Value;

#[test]
fn test_envelope_value_round_trip() {
    let envelope = Envelope {
        route: Some("echo".into()),
        args: Some(Value::List(vec![Value::Int(42)])),
        method: Some("get".into()),
        callback_id: Some(CallbackId::Seq(7)),
    };

    let lowered = envelope.to_value();
    let restored = Envelope::from_value(&lowered).expect("map expected");

    assert_eq!(restored, envelope);
}

#[test]
fn test_reply_envelope_has_no_route() {
    let reply = Envelope::reply(Value::Int(1), CallbackId::Seq(3));
    assert!(reply.is_reply());
    assert!(reply.route.is_none());

    let restored = Envelope::from_value(&reply.to_value()).unwrap();
    assert_eq!(restored.callback_id, Some(CallbackId::Seq(3)));
}

#[test]
fn test_route_callback_id_survives_lowering() {
    let streamed = Envelope::reply(Value::Int(5), CallbackId::Route("tick".into()));
    let restored = Envelope::from_value(&streamed.to_value()).unwrap();
    assert_eq!(restored.callback_id, Some(CallbackId::Route("tick".into())));
}

#[test]
fn test_from_value_rejects_non_map() {
    assert!(Envelope::from_value(&Value::Int(1)).is_none());
    assert!(Envelope::from_value(&Value::Null).is_none());
}

#[test]
fn test_envelope_json_shape() {
    let envelope = Envelope {
        route: Some("runRequest".into()),
        args: Some(Value::List(vec![Value::Str("x".into())])),
        method: None,
        callback_id: Some(CallbackId::Seq(12)),
    };

    let json = serde_json::to_string(&envelope).unwrap();
    assert!(json.contains("\"callbackId\":12"));
    assert!(!json.contains("method"));

    let back: Envelope = serde_json::from_str(&json).unwrap();
    assert_eq!(back, envelope);
}

#[test]
fn test_callback_id_json_is_untagged() {
    let seq: CallbackId = serde_json::from_str("9").unwrap();
    assert_eq!(seq, CallbackId::Seq(9));

    let route: CallbackId = serde_json::from_str("\"tick\"").unwrap();
    assert_eq!(route, CallbackId::Route("tick".into()));
}

#[test]
fn test_transfer_detects_top_level_buffer() {
    let envelope = Envelope::post("blob", Value::Bin(Bytes::from_static(b"abc")));
    let found = transfer::transferables(&envelope);
    assert_eq!(found, vec![Bytes::from_static(b"abc")]);
}

#[test]
fn test_transfer_detects_map_fields_and_short_lists() {
    let map = Value::map([
        ("frame", Value::Bin(Bytes::from_static(b"xyz"))),
        ("label", Value::Str("left".into())),
    ]);
    assert_eq!(transfer::transferables(&Envelope::post("r", map)).len(), 1);

    let list = Value::List(vec![
        Value::Int(1),
        Value::Bin(Bytes::from_static(b"a")),
        Value::Bin(Bytes::from_static(b"b")),
    ]);
    assert_eq!(transfer::transferables(&Envelope::post("r", list)).len(), 2);
}

#[test]
fn test_transfer_scan_is_bounded() {
    // Long lists are skipped entirely.
    let mut items = vec![Value::Int(0); ARG_SCAN_MAX];
    items.push(Value::Bin(Bytes::from_static(b"late")));
    let long = Envelope::post("r", Value::List(items));
    assert!(transfer::transferables(&long).is_empty());

    // Buffers nested below one level are not found.
    let nested = Envelope::post(
        "r",
        Value::map([(
            "inner",
            Value::List(vec![Value::Bin(Bytes::from_static(b"deep"))]),
        )]),
    );
    assert!(transfer::transferables(&nested).is_empty());
}

#[test]
fn test_transfer_ignores_missing_args() {
    let envelope = Envelope {
        route: Some("ping".into()),
        args: None,
        method: None,
        callback_id: None,
    };
    assert!(transfer::transferables(&envelope).is_empty());
}

#[test]
fn test_value_accessors() {
    let value = Value::map([("n", Value::Int(3)), ("ok", Value::Bool(true))]);
    assert_eq!(value.get("n").and_then(Value::as_i64), Some(3));
    assert_eq!(value.get("ok").and_then(Value::as_bool), Some(true));
    assert!(value.get("missing").is_none());
    assert_eq!(Value::Int(-1).as_u64(), None);
}
