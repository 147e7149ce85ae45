fn main() {
    println!("Run `cargo test -p wire-compat` to check the protocol types against the fixtures.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use fleetsync_protocol::{
        DeviceStatus, DeviceStatusPayload, EntityId, ErrorPayload, EventPayload, FrameType,
        IdentifyRequest, InboundFrame, InfoPayload, OutboundFrame, PositionPayload,
        SubscriptionRequest,
    };

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Compares numbers as f64 so `270` and `270.0` are equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Decodes a fixture, re-encodes it, and compares the JSON values.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  ours: {reserialized}"
        );
        parsed
    }

    fn decode_frame(name: &str) -> InboundFrame {
        InboundFrame::decode(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to decode frame {name}: {e}"))
    }

    // --- Payloads ---

    #[test]
    fn fixture_position() {
        let p: PositionPayload = roundtrip_test("position.json");
        assert_eq!(p.device_id, EntityId::Num(42));
        assert_eq!(p.course, Some(270.0));
        assert!(p.validate().is_ok());
        assert_eq!(p.attributes["odometer"], 182331);
    }

    #[test]
    fn fixture_device_status() {
        let s: DeviceStatusPayload = roundtrip_test("device_status.json");
        assert_eq!(s.device_id, EntityId::Text("truck-7".into()));
        assert_eq!(s.status, DeviceStatus::Online);
    }

    #[test]
    fn fixture_event() {
        let e: EventPayload = roundtrip_test("event.json");
        assert_eq!(e.event_type, "geofenceEnter");
        assert_eq!(e.position_id, Some(EntityId::Num(88120)));
    }

    #[test]
    fn fixture_error_and_info() {
        let err: ErrorPayload = roundtrip_test("error.json");
        assert_eq!(err.code, Some(401));
        assert!(fleetsync_protocol::constants::is_auth_error_code(401));
        let info: InfoPayload = roundtrip_test("info.json");
        assert!(info.message.starts_with("maintenance"));
    }

    #[test]
    fn fixture_identify() {
        let req: IdentifyRequest = roundtrip_test("identify.json");
        assert_eq!(req.user_id, "u-1");
    }

    // --- Frames ---

    #[test]
    fn fixture_subscribe_frame() {
        let frame: OutboundFrame = roundtrip_test("subscribe_frame.json");
        assert_eq!(frame.frame_type, "subscribe");

        let req: SubscriptionRequest =
            serde_json::from_value(frame.data.clone().unwrap_or_default()).unwrap();
        let rebuilt = OutboundFrame::subscribe(&req).unwrap();
        assert_eq!(rebuilt, frame);
    }

    #[test]
    fn fixture_position_batch_frame() {
        let frame = decode_frame("frame_position_batch.json");
        assert_eq!(frame.frame_type, FrameType::Position);
        assert_eq!(frame.sequence, Some(17));
        assert_eq!(
            frame.timestamp,
            Some("2024-05-01T10:00:06Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap())
        );

        let batch: Vec<PositionPayload> = frame.parse_batch().unwrap();
        let order: Vec<_> = batch
            .iter()
            .map(|p| (p.device_id.to_string(), p.fix_time.timestamp()))
            .collect();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0].0, "1");
        assert_eq!(order[1].0, "2");
        assert!(order[2].1 > order[0].1);
    }

    #[test]
    fn fixture_single_status_frame_is_a_batch_of_one() {
        let frame = decode_frame("frame_device_status.json");
        assert_eq!(frame.frame_type, FrameType::DeviceStatus);
        let batch: Vec<DeviceStatusPayload> = frame.parse_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, DeviceStatus::Unknown);
    }

    #[test]
    fn fixture_heartbeat_frame() {
        let frame = decode_frame("frame_heartbeat.json");
        assert_eq!(frame.frame_type, FrameType::Heartbeat);
        assert!(frame.data.is_none());
        assert_eq!(
            serde_json::to_value(OutboundFrame::heartbeat()).unwrap(),
            serde_json::json!({"type": "heartbeat"})
        );
    }

    #[test]
    fn fixture_unknown_frame_type_still_decodes() {
        let frame = decode_frame("frame_unknown.json");
        assert_eq!(frame.frame_type, FrameType::Unknown);
        assert!(frame.data.is_some());
    }
}
