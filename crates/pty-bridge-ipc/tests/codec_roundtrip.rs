use proptest::prelude::*;
use pty_bridge_ipc::frame::{FrameReader, encode};
use pty_bridge_ipc::{Message, Notification, Request, Response, RpcError};
use serde_json::{Value, json};

fn arb_params() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![
        Just(None),
        any::<i64>().prop_map(|n| Some(json!({ "n": n }))),
        ".{0,64}".prop_map(|s| Some(json!({ "text": s }))),
        (1u16..500, 1u16..500).prop_map(|(rows, cols)| Some(json!({ "rows": rows, "cols": cols }))),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    let id = "[a-zA-Z0-9-]{1,36}";
    let method = "[a-z][a-z-]{0,24}";
    prop_oneof![
        (id, method, arb_params()).prop_map(|(id, method, params)| {
            Message::from(Request::new(id, method, params))
        }),
        (method, arb_params())
            .prop_map(|(method, params)| Message::from(Notification::new(method, params))),
        (id, arb_params()).prop_map(|(id, result)| {
            Message::from(Response::success(id, result.unwrap_or(Value::Null)))
        }),
        (id, -32700i32..-32000, ".{0,32}").prop_map(|(id, code, text)| {
            Message::from(Response::error(id, RpcError::new(code, text)))
        }),
    ]
}

proptest! {
    #[test]
    fn encoded_messages_decode_to_the_same_message(messages in prop::collection::vec(arb_message(), 1..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let mut stream = Vec::new();
        for message in &messages {
            stream.extend(encode(message).unwrap());
        }

        let decoded = runtime.block_on(async {
            let mut reader = FrameReader::new(&stream[..]);
            let mut out = Vec::new();
            while let Some(frame) = reader.next_frame().await.unwrap() {
                out.push(Message::from_slice(&frame).unwrap());
            }
            out
        });
        prop_assert_eq!(decoded, messages);
    }
}
