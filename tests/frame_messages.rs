//! Detector payloads as they arrive over MQTT, through parsing and the
//! detection adapter.

use hygiene_kernel::detect::Rejection;
use hygiene_kernel::transport::{
    ControlAction, ControlMessage, FrameMessage, InboundTopic, Topics, VideoStatusPayload,
};
use hygiene_kernel::{DetectionAdapter, ObjectClass, VideoStatus};

/// One frame as published by the detection service.
const DETECTOR_FRAME: &str = r#"{
    "video_id": "line-1",
    "frame_number": 90,
    "fps": 30.0,
    "filename": "line-1.mp4",
    "total_frames": 1800,
    "width": 1280,
    "height": 720,
    "detections": [
        {"class_name": "hand", "class_id": 0, "confidence": 0.92, "bbox": [210, 180, 260, 240]},
        {"class_name": "Scooper", "class_id": 3, "confidence": 0.81, "bbox": [205, 170, 270, 250]},
        {"class_name": "pizza", "class_id": 2, "confidence": 0.97, "bbox": [500, 400, 900, 700]},
        {"class_name": "person", "class_id": 1, "confidence": 0.99, "bbox": [0, 0, 640, 720]},
        {"class_name": "hand", "class_id": 0, "confidence": 0.31, "bbox": [700, 100, 740, 150]},
        {"class_name": "hand", "class_id": 0, "confidence": 0.88, "bbox": [300, 300, 280, 350]}
    ]
}"#;

#[test]
fn detector_frame_is_normalized() {
    let message = FrameMessage::parse(DETECTOR_FRAME.as_bytes(), Some("line-1")).expect("parse");
    let info = message.video_info();
    assert_eq!(info.filename.as_deref(), Some("line-1.mp4"));
    assert_eq!(info.total_frames, Some(1800));
    assert_eq!((info.width, info.height), (Some(1280), Some(720)));

    let adapter = DetectionAdapter::new(0.5, 25.0);
    let adapted = adapter.normalize_frame(&message.into_raw());
    let frame = adapted.frame;

    // fps from the payload wins over the adapter default.
    assert!((frame.timestamp - 3.0).abs() < 1e-9);
    assert_eq!(frame.count(ObjectClass::Hand), 1);
    assert_eq!(frame.count(ObjectClass::Scooper), 1);
    assert_eq!(frame.count(ObjectClass::Pizza), 1);
    assert!(frame
        .detections
        .iter()
        .all(|d| d.frame_number == 90 && d.timestamp == frame.timestamp));

    assert_eq!(adapted.rejected.len(), 3);
    assert!(adapted
        .rejected
        .contains(&Rejection::UnknownClass("person".to_string())));
    assert!(adapted
        .rejected
        .iter()
        .any(|r| matches!(r, Rejection::BelowFloor { .. })));
    assert!(adapted
        .rejected
        .iter()
        .any(|r| matches!(r, Rejection::MalformedBox(_))));
}

#[test]
fn producer_timestamp_is_kept() {
    let payload = br#"{"frame_number": 12, "timestamp": 100.5, "detections": []}"#;
    let message = FrameMessage::parse(payload, Some("line-2")).expect("parse");
    assert_eq!(message.video_id, "line-2");
    let adapted = DetectionAdapter::new(0.5, 30.0).normalize_frame(&message.into_raw());
    assert_eq!(adapted.frame.timestamp, 100.5);
    assert!(adapted.frame.detections.is_empty());
}

#[test]
fn malformed_payloads_are_errors() {
    for payload in [
        &b"not json"[..],
        br#"{"detections": []}"#,
        br#"{"frame_number": -1}"#,
        br#"{"frame_number": 1, "detections": {"class_name": "hand"}}"#,
        br#"{"video_id": "../etc", "frame_number": 1}"#,
    ] {
        assert!(
            FrameMessage::parse(payload, None).is_err(),
            "accepted {}",
            String::from_utf8_lossy(payload)
        );
    }
}

#[test]
fn one_misshapen_detection_does_not_sink_its_frame() {
    let payload = br#"{
        "frame_number": 40,
        "detections": [
            {"class_name": "hand", "confidence": 0.9, "bbox": [210, 180, 260, 240]},
            {"class_name": "pizza", "confidence": 0.9, "bbox": [1, 2, 3]},
            {"class_name": "pizza", "confidence": 0.9, "bbox": null},
            {"confidence": 0.95, "bbox": [500, 400, 900, 700]},
            {"class_name": "scooper", "confidence": "high", "bbox": [205, 170, 270, 250]}
        ]
    }"#;
    let message = FrameMessage::parse(payload, Some("line-1")).expect("frame survives");
    assert_eq!(message.detections.len(), 5);

    let adapted = DetectionAdapter::new(0.5, 30.0).normalize_frame(&message.into_raw());
    assert_eq!(adapted.frame.count(ObjectClass::Hand), 1);
    assert_eq!(adapted.frame.detections.len(), 1);
    assert_eq!(adapted.rejected.len(), 4);
    assert!(adapted
        .rejected
        .iter()
        .all(|r| matches!(r, Rejection::Malformed(_))));
}

#[test]
fn inbound_topics_route_by_kind() {
    let topics = Topics::new("kitchen");
    match topics.classify("kitchen/detections/line-1") {
        Some(InboundTopic::Detections(video_id)) => {
            let message =
                FrameMessage::parse(br#"{"frame_number": 1}"#, Some(video_id)).expect("parse");
            assert_eq!(message.video_id, "line-1");
        }
        other => panic!("unexpected route {:?}", other),
    }
    match topics.classify("kitchen/control/line-1") {
        Some(InboundTopic::Control(video_id)) => {
            assert_eq!(video_id, "line-1");
            let control = ControlMessage::parse(br#"{"action": "complete"}"#).expect("control");
            assert_eq!(control.action, ControlAction::Complete);
        }
        other => panic!("unexpected route {:?}", other),
    }
    assert_eq!(topics.classify("kitchen/progress/line-1"), None);
    assert_eq!(topics.violations("line-1"), "kitchen/violations/line-1");
    assert_eq!(topics.progress("line-1"), "kitchen/progress/line-1");
}

#[test]
fn status_payload_uses_lowercase_status() {
    let payload = VideoStatusPayload {
        video_id: "line-1".to_string(),
        status: VideoStatus::Cancelled,
        violations: 2,
    };
    let json = serde_json::to_value(&payload).expect("serialize");
    assert_eq!(json["status"], "cancelled");
    assert_eq!(json["violations"], 2);
}
