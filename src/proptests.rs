//! Property-Based Tests
//!
//! Invariants checked over random inputs:
//!
//! - **Event streams**: decoding keeps the `data:` payloads in order, ignores
//!   the `[DONE]` sentinel and passes non-stream bodies through untouched
//! - **Classification**: any object with an `id` and a `result` is a response
//!   for that id
//! - **Correlation**: replies delivered in any order reach the call that made
//!   the matching request
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib proptests
//! ```

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use crate::context::CallContext;
use crate::protocol::InboundMessage;
use crate::transport::stdio::peer::pair;
use crate::transport::{decode_event_stream, Transport};

// Payload text with no line breaks and no surrounding whitespace
fn arb_payload() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9{}\":,]{1,24}".prop_filter("sentinel", |s| s != "[DONE]")
}

// A line that is not an event-stream data field
fn arb_plain_line() -> impl Strategy<Value = String> {
    "[a-ce-z{][a-z0-9 :,}]{0,30}"
}

// Number of concurrent calls plus the order the peer answers them in
fn arb_reply_order() -> impl Strategy<Value = Vec<usize>> {
    (1usize..12).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Data payloads are concatenated in order
    #[test]
    fn prop_event_stream_concatenates_payloads(payloads in prop::collection::vec(arb_payload(), 1..8)) {
        let body: String = payloads
            .iter()
            .map(|payload| format!("event: message\ndata: {}\n\n", payload))
            .collect();

        prop_assert_eq!(decode_event_stream(&body), payloads.concat());
    }

    /// `[DONE]` lines never contribute to the decoded body
    #[test]
    fn prop_event_stream_ignores_sentinel(
        payloads in prop::collection::vec(arb_payload(), 1..8),
        sentinel_at in prop::collection::vec(any::<bool>(), 8),
    ) {
        let mut body = String::new();
        for (i, payload) in payloads.iter().enumerate() {
            if sentinel_at[i] {
                body.push_str("data: [DONE]\n");
            }
            body.push_str("data:");
            body.push_str(payload);
            body.push_str("\r\n");
        }

        prop_assert_eq!(decode_event_stream(&body), payloads.concat());
    }

    /// Bodies without any data field come back unchanged
    #[test]
    fn prop_event_stream_passthrough(lines in prop::collection::vec(arb_plain_line(), 0..6)) {
        let body = lines.join("\n");
        prop_assert_eq!(decode_event_stream(&body), body);
    }

    /// An object with an id and a result is always a response for that id
    #[test]
    fn prop_classify_response(id in any::<u64>(), key in "[a-z]{1,8}", value in any::<i64>()) {
        let mut message = Map::new();
        message.insert("jsonrpc".to_string(), json!("2.0"));
        message.insert("id".to_string(), json!(id));
        message.insert("result".to_string(), json!({ key.clone(): value }));

        match InboundMessage::classify(message) {
            InboundMessage::Response { id: got, outcome } => {
                prop_assert_eq!(got, json!(id));
                let result = outcome.map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(&result[key.as_str()], &json!(value));
            }
            other => prop_assert!(false, "expected a response, got {:?}", other),
        }
    }

    /// Each concurrent call receives the reply to its own request
    #[test]
    fn prop_replies_reach_their_callers(order in arb_reply_order()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async move {
            let n = order.len();
            let (transport, mut peer) = pair();
            let transport = Arc::new(transport);
            let ctx = CallContext::background();

            let calls = futures::future::join_all((0..n).map(|i| {
                let transport = transport.clone();
                let ctx = ctx.clone();
                async move { transport.call_value(&ctx, &format!("method/{}", i), None).await }
            }));

            let server = async {
                let mut requests = Vec::with_capacity(n);
                for _ in 0..n {
                    requests.push(peer.recv().await);
                }
                for &index in &order {
                    let request: &Value = &requests[index];
                    peer.reply(&request["id"], json!({ "echo": request["method"] }))
                        .await;
                }
            };

            let (results, ()) = tokio::join!(calls, server);

            for (i, result) in results.into_iter().enumerate() {
                let result = result.unwrap();
                assert_eq!(result["echo"], json!(format!("method/{}", i)));
            }
            assert_eq!(transport.pending_count(), 0);
        });
    }
}
