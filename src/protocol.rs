//! Wire envelopes for the signaling channel. Relayed payloads stay dynamic
//! JSON trees; the server only stamps its own fields on top.

use serde_json::{json, Map, Value};

use crate::metrics::Metrics;
use crate::rooms::RoomKey;

pub const ERR_RATE_LIMITED: &str = "rate_limited";
pub const ERR_INVALID_JSON: &str = "invalid_json";

/// Sent exactly once after admission.
pub fn welcome(peer_id: &str, key: &RoomKey, now_iso: &str) -> String {
    json!({
        "type": "welcome",
        "peerId": peer_id,
        "namespace": key.namespace,
        "room": key.room,
        "now": now_iso,
    })
    .to_string()
}

pub fn heartbeat_ack(now_iso: &str) -> String {
    json!({ "type": "heartbeat-ack", "now": now_iso }).to_string()
}

pub fn error_envelope(code: &str) -> String {
    json!({ "type": "error", "code": code }).to_string()
}

/// Shallow-merge the client payload with the server stamp. Client-supplied
/// values for the stamped fields are overwritten, everything else passes
/// through untouched.
pub fn stamp_relay(
    mut payload: Map<String, Value>,
    source_peer_id: &str,
    key: &RoomKey,
    received_at_iso: &str,
) -> String {
    payload.insert("sourcePeerId".into(), json!(source_peer_id));
    payload.insert("namespace".into(), json!(key.namespace));
    payload.insert("room".into(), json!(key.room));
    payload.insert("receivedAt".into(), json!(received_at_iso));
    Value::Object(payload).to_string()
}

/// Fold one telemetry report into the accumulators. Telemetry is never
/// relayed.
pub fn record_telemetry(metrics: &Metrics, report: &Map<String, Value>) {
    let ice_state = report
        .get("iceState")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    metrics.ice_state_total.with_label_values(&[ice_state]).inc();

    if let Some(reason) = report.get("failureReason").and_then(Value::as_str) {
        metrics.failure_reason_total.with_label_values(&[reason]).inc();
    }

    if report.get("relayUsed").map(is_truthy).unwrap_or(false) {
        metrics.relay_usage_total.inc();
    }

    let region = report.get("region").and_then(Value::as_str);
    let carrier = report.get("carrier").and_then(Value::as_str);
    if region.is_some() || carrier.is_some() {
        metrics
            .region_carrier_total
            .with_label_values(&[region.unwrap_or("unknown"), carrier.unwrap_or("unknown")])
            .inc();
    }
}

/// JavaScript-style truthiness for client-supplied flags.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
        Value::Null => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RoomKey {
        RoomKey::new(Some("n".into()), Some("r".into()))
    }

    #[test]
    fn welcome_shape() {
        let text = welcome("p1", &key(), "2024-05-01T12:00:00.000Z");
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["peerId"], "p1");
        assert_eq!(value["namespace"], "n");
        assert_eq!(value["room"], "r");
        assert_eq!(value["now"], "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn stamp_overwrites_client_fields_and_keeps_the_rest() {
        let payload: Map<String, Value> = serde_json::from_str(
            r#"{"type":"offer","sdp":"v=0","sourcePeerId":"forged","room":"elsewhere"}"#,
        )
        .unwrap();
        let text = stamp_relay(payload, "A", &key(), "2024-05-01T12:00:00.000Z");
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");
        assert_eq!(value["sourcePeerId"], "A");
        assert_eq!(value["namespace"], "n");
        assert_eq!(value["room"], "r");
        assert_eq!(value["receivedAt"], "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn telemetry_updates_the_right_families() {
        let metrics = Metrics::new();
        let report: Map<String, Value> = serde_json::from_str(
            r#"{"type":"telemetry","iceState":"connected","relayUsed":true,"region":"eu"}"#,
        )
        .unwrap();
        record_telemetry(&metrics, &report);

        let text = metrics.render();
        assert!(text.contains("bs_ice_state_total{ice_state=\"connected\"} 1"));
        assert!(text.contains("bs_relay_usage_total 1"));
        assert!(text.contains("region=\"eu\""));
        assert!(text.contains("carrier=\"unknown\""));
        // No failure reason reported, so the family has no samples.
        assert!(!text.contains("bs_failure_reason_total{"));
    }

    #[test]
    fn telemetry_without_region_or_carrier_skips_that_family() {
        let metrics = Metrics::new();
        let report: Map<String, Value> =
            serde_json::from_str(r#"{"type":"telemetry","iceState":"failed","failureReason":"timeout"}"#)
                .unwrap();
        record_telemetry(&metrics, &report);
        let text = metrics.render();
        assert!(text.contains("bs_failure_reason_total{reason=\"timeout\"} 1"));
        assert!(!text.contains("bs_region_carrier_total{"));
    }

    #[test]
    fn truthiness_follows_client_conventions() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("yes")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(null)));
    }
}
