//! Integration tests for dubbo-client.
//!
//! These tests verify the protocol layers together: message encoding,
//! frame reassembly and message decoding.

use dubbo_client::codec::{MsgPackSerialization, Serialization};
use dubbo_client::protocol::{
    build_frame, decode_frame, encode_request, encode_response, flags, FrameBuffer, Invocation,
    Message, Request, RequestData, Response, ResyncPolicy, Status, HEADER_SIZE,
};
use serde_json::json;

fn greet(id: i64) -> Request {
    let invocation = Invocation::new("greet", "Ljava/lang/String;", vec![json!(format!("user-{}", id))])
        .with_attachment("path", "com.example.Greeter")
        .with_attachment("version", "1.0.0");
    Request::invocation(id, true, invocation)
}

/// Test full request encode, fragmented reassembly and decode.
#[test]
fn test_request_through_fragmented_stream() {
    let codec = MsgPackSerialization;
    let bytes = encode_request(&greet(7), &codec).unwrap();

    let mut buffer = FrameBuffer::new();
    let mut frames = Vec::new();
    // Feed one byte at a time
    for byte in &bytes {
        frames.extend(buffer.push(std::slice::from_ref(byte)).unwrap());
    }

    assert_eq!(frames.len(), 1);
    assert!(buffer.is_empty());
    let frame = &frames[0];
    assert_eq!(frame.request_id(), 7);
    assert!(frame.is_request());
    assert!(frame.header.is_two_way());

    match decode_frame(frame, &codec).unwrap() {
        Message::Request(request) => assert_eq!(request, greet(7)),
        other => panic!("expected request, got {:?}", other),
    }
}

/// Test several responses arriving in one read.
#[test]
fn test_multiple_responses_in_one_chunk() {
    let codec = MsgPackSerialization;
    let mut all_bytes = Vec::new();
    for id in 1..=5 {
        let response = Response::ok(id, json!({ "id": id, "greeting": format!("hi {}", id) }));
        all_bytes.extend(encode_response(&response, &codec).unwrap());
    }

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&all_bytes).unwrap();
    assert_eq!(frames.len(), 5);

    for (i, frame) in frames.iter().enumerate() {
        let id = (i + 1) as i64;
        match decode_frame(frame, &codec).unwrap() {
            Message::Response(response) => {
                assert_eq!(response.id, id);
                assert_eq!(
                    response.into_result().unwrap(),
                    json!({ "id": id, "greeting": format!("hi {}", id) })
                );
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}

/// Test that garbage between frames is skipped when scanning for magic.
#[test]
fn test_resync_between_frames() {
    let codec = MsgPackSerialization;
    let mut stream = encode_response(&Response::ok(1, json!("first")), &codec).unwrap();
    stream.extend_from_slice(b"\x00\x01garbage\xda");
    stream.extend(encode_response(&Response::ok(2, json!("second")), &codec).unwrap());

    let mut buffer = FrameBuffer::with_config(1024 * 1024, ResyncPolicy::ScanForMagic);
    let frames = buffer.push(&stream).unwrap();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].request_id(), 1);
    assert_eq!(frames[1].request_id(), 2);
    assert_eq!(buffer.discarded(), 10);
}

/// Test error and exception responses surface as the right failures.
#[test]
fn test_failure_responses() {
    let codec = MsgPackSerialization;
    let mut buffer = FrameBuffer::new();

    let bytes = encode_response(
        &Response::error(3, Status::ServiceNotFound, "no such service"),
        &codec,
    )
    .unwrap();
    let frames = buffer.push(&bytes).unwrap();
    assert_eq!(frames[0].status(), Status::ServiceNotFound);
    let Message::Response(response) = decode_frame(&frames[0], &codec).unwrap() else {
        panic!("expected response");
    };
    let err = response.into_result().unwrap_err();
    assert!(err.to_string().contains("no such service"));

    let exception = json!({ "$class": "java.lang.IllegalStateException", "message": "boom" });
    let bytes = encode_response(&Response::exception(4, exception.clone()), &codec).unwrap();
    let frames = buffer.push(&bytes).unwrap();
    let Message::Response(response) = decode_frame(&frames[0], &codec).unwrap() else {
        panic!("expected response");
    };
    match response.into_result() {
        Err(dubbo_client::RpcError::RemoteException(value)) => assert_eq!(value, exception),
        other => panic!("expected remote exception, got {:?}", other),
    }
}

/// Test heartbeat request and reply frames.
#[test]
fn test_heartbeat_exchange() {
    let codec = MsgPackSerialization;
    let probe = encode_request(&Request::heartbeat(11), &codec).unwrap();
    let reply = encode_response(&Response::heartbeat(11), &codec).unwrap();

    let mut buffer = FrameBuffer::new();
    let mut stream = probe;
    stream.extend(reply);
    let frames = buffer.push(&stream).unwrap();
    assert_eq!(frames.len(), 2);

    assert!(flags::has_flag(frames[0].header.flags, flags::EVENT));
    match decode_frame(&frames[0], &codec).unwrap() {
        Message::Request(request) => {
            assert!(request.is_heartbeat());
            assert_eq!(request.data, RequestData::Event(serde_json::Value::Null));
        }
        other => panic!("expected request, got {:?}", other),
    }
    match decode_frame(&frames[1], &codec).unwrap() {
        Message::Response(response) => assert!(response.is_heartbeat()),
        other => panic!("expected response, got {:?}", other),
    }
}

/// Test that an oversized length field is rejected before buffering the payload.
#[test]
fn test_oversized_frame_rejected() {
    let codec = MsgPackSerialization;
    let mut payload = Vec::new();
    codec.write_value(&json!("x".repeat(256)), &mut payload).unwrap();
    let bytes = build_frame(flags::compose(codec.content_type_id(), false, false, false), 20, 1, &payload).unwrap();
    assert_eq!(bytes.len(), HEADER_SIZE + payload.len());

    let mut buffer = FrameBuffer::with_config(64, ResyncPolicy::default());
    assert!(buffer.push(&bytes).is_err());
}
