//! Black-box coverage of the JSON-RPC envelope contract (§3): what actually
//! gets put on the wire, not just what parses off it.

use serde_json::json;
use xiaozhi_proxy_core::jsonrpc::{
    error_envelope, success_envelope, JsonRpcCall, JsonRpcResponse, RequestId, METHOD_NOT_FOUND,
};

#[test]
fn success_envelope_carries_numeric_id_as_a_number_not_a_string() {
    let env = success_envelope(RequestId::Number(7), json!({"ok": true}));
    assert_eq!(env["id"], json!(7));
    assert_eq!(env["jsonrpc"], json!("2.0"));
    assert_eq!(env["result"]["ok"], json!(true));
    assert!(env.get("error").is_none());
}

#[test]
fn error_envelope_carries_string_id_as_a_string() {
    let env = error_envelope(RequestId::String("req-9".into()), METHOD_NOT_FOUND, "nope");
    assert_eq!(env["id"], json!("req-9"));
    assert_eq!(env["error"]["code"], json!(METHOD_NOT_FOUND));
    assert_eq!(env["error"]["message"], json!("nope"));
    assert!(env.get("result").is_none());
}

#[test]
fn outbound_notification_serializes_without_an_id_field() {
    let call = JsonRpcCall::notification("tools/list", json!({}));
    let value = serde_json::to_value(&call).unwrap();
    assert!(value.get("id").is_none());
    assert_eq!(value["method"], json!("tools/list"));
}

#[test]
fn outbound_call_round_trips_its_id_through_a_downstream_response() {
    let call = JsonRpcCall::new(RequestId::Number(3), "tools/call", json!({"name": "x"}));
    let wire = serde_json::to_string(&call).unwrap();
    // Simulate a downstream service echoing the id back in its response.
    let response_wire = format!(
        r#"{{"jsonrpc":"2.0","id":3,"result":{{"done":true}}}}"#
    );
    let response: JsonRpcResponse = serde_json::from_str(&response_wire).unwrap();
    assert_eq!(response.id, Some(RequestId::Number(3)));
    assert!(wire.contains("\"id\":3"));
}

#[test]
fn downstream_error_response_deserializes_into_typed_error_object() {
    let response: JsonRpcResponse = serde_json::from_str(
        r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
    )
    .unwrap();
    let error = response.error.expect("error present");
    assert_eq!(error.code, -32601);
    assert_eq!(error.message, "no such method");
    assert!(response.result.is_none());
}
