use ocpp_mesh_core::{
    Call, CallError, CallResult, ErrorCode, Frame, MessageId, NetworkPath, NetworkingNodeId,
    RoutingHeader, SourceRouting,
};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn node_id() -> impl Strategy<Value = NetworkingNodeId> {
    "[A-Z]{2}[0-9]{1,3}".prop_map(|s| s.parse().unwrap())
}

fn object() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ];
    prop::collection::btree_map("[a-z][a-zA-Z]{0,7}", leaf, 0..4)
        .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>()))
}

fn destination() -> impl Strategy<Value = SourceRouting> {
    prop_oneof![
        node_id().prop_map(SourceRouting::Node),
        Just(SourceRouting::Broadcast),
        prop::collection::vec(node_id(), 0..4).prop_map(SourceRouting::Forced),
    ]
}

fn routing() -> impl Strategy<Value = Option<RoutingHeader>> {
    let path = prop::collection::btree_set("[A-Z]{2}[0-9]{1,3}", 0..5).prop_map(|hops| {
        NetworkPath::from_hops(hops.into_iter().map(|h| h.parse().unwrap()).collect()).unwrap()
    });
    prop::option::of((destination(), path).prop_map(|(dest, path)| RoutingHeader::new(dest, path)))
}

fn message_id() -> impl Strategy<Value = MessageId> {
    any::<String>().prop_map(MessageId::new)
}

fn error_code() -> impl Strategy<Value = ErrorCode> {
    prop_oneof![
        Just(ErrorCode::NotFound),
        Just(ErrorCode::FormatViolation),
        Just(ErrorCode::SecurityError),
        Just(ErrorCode::GenericError),
        any::<String>().prop_map(|s| ErrorCode::from(s.as_str())),
    ]
}

fn frame() -> impl Strategy<Value = Frame> {
    let call = (message_id(), any::<String>(), object(), routing()).prop_map(
        |(id, action, payload, routing)| {
            let mut call = Call::with_id(id, action, payload);
            call.routing = routing;
            Frame::Call(call)
        },
    );
    let result = (message_id(), object(), routing()).prop_map(|(id, payload, routing)| {
        let mut result = CallResult::new(id, payload);
        result.routing = routing;
        Frame::CallResult(result)
    });
    let error = (message_id(), error_code(), any::<String>(), object(), routing()).prop_map(
        |(id, code, description, details, routing)| {
            let mut error = CallError::new(id, code, description).with_details(details);
            error.routing = routing;
            Frame::CallError(error)
        },
    );
    prop_oneof![call, result, error]
}

proptest! {
    #[test]
    fn test_serialized_frames_parse_back(frame in frame()) {
        let parsed = Frame::parse(&frame.to_bytes()).unwrap();
        prop_assert_eq!(parsed, frame);
    }

    #[test]
    fn test_routing_header_only_changes_arity(frame in frame()) {
        let plain = frame.clone().with_routing(None);
        let plain_len = serde_json::from_slice::<Vec<Value>>(&plain.to_bytes()).unwrap().len();
        let full_len = serde_json::from_slice::<Vec<Value>>(&frame.to_bytes()).unwrap().len();
        let extra = if frame.routing().is_some() { 2 } else { 0 };
        prop_assert_eq!(full_len, plain_len + extra);
    }

    #[test]
    fn test_unknown_codes_survive_round_trip(code in any::<String>()) {
        let parsed = ErrorCode::from(code.as_str());
        prop_assert_eq!(parsed.as_str(), code.as_str());
        prop_assert_eq!(ErrorCode::from(parsed.as_str()), parsed);
    }

    #[test]
    fn test_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = Frame::parse(&bytes);
    }
}
