//! End-to-end tests of the connection supervisor over the mock transport


use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use test_utils::*;
use tokio::time::Duration;
use xianyu_core::{routes, ChatMessage, LiveError, LiveResult, TokenError};
use xianyu_runtime::{ReplyGenerator, SupervisorState};

#[tokio::test(start_paused = true)]
async fn test_registers_then_syncs_on_connect() {
    let (harness, _deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    let sent = harness.transport.sent();
    assert_eq!(sent[0].lwp.as_deref(), Some(routes::REGISTER));
    assert_eq!(sent[0].header("token"), Some("token-1"));
    assert_eq!(sent[0].header("did"), Some("DEVICE-TEST"));
    assert_eq!(sent[1].lwp.as_deref(), Some(routes::SYNC_ACK));
    assert_eq!(harness.tokens.fetches(), 1);

    let status = harness.handle.status().await;
    assert!(status.session.connected);
    assert!(status.heartbeat.is_healthy);
    assert!(status.token.is_valid);

    assert!(harness.shutdown().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ack_is_consumed() {
    let (harness, _deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    harness
        .transport
        .inject(r#"{"headers":{"mid":"m1"},"code":200}"#);
    harness
        .transport
        .inject(r#"{"headers":{"mid":"m2","sid":"s9","app-key":"k"},"code":500}"#);
    wait_until(|| !harness.transport.acks().is_empty(), "ack").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let acks = harness.transport.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].mid(), Some("m2"));
    assert_eq!(acks[0].header("sid"), Some("s9"));
    assert_eq!(acks[0].header("app-key"), Some("k"));
    assert_eq!(acks[0].status_code(), Some(200));

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_numeric_mid_frames_are_acked_and_consumed() {
    let (harness, _deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    harness
        .transport
        .inject(r#"{"headers":{"mid":7},"code":200.0}"#);
    harness
        .transport
        .inject(r#"{"headers":{"mid":42,"sid":"s1"},"code":500}"#);
    wait_until(|| !harness.transport.acks().is_empty(), "ack").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let acks = harness.transport.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].headers.get("mid"), Some(&json!(42)));
    assert_eq!(acks[0].header("sid"), Some("s1"));

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let (harness, _deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    harness.transport.inject("not json at all");
    harness.transport.inject("[1,2,3]");
    harness
        .transport
        .inject(r#"{"headers":{"mid":"after"}}"#);
    wait_until(|| !harness.transport.acks().is_empty(), "ack").await;

    assert_eq!(harness.transport.opens(), 1);
    assert_eq!(harness.state(), SupervisorState::Listening);
    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_token_rotation_reconnects_without_backoff() {
    let mut config = test_config();
    config.token.refresh_interval_secs = 10;
    config.token.check_interval_secs = 1;
    let (harness, _deliveries) = Harness::start(config);

    harness.wait_for_opens(2).await;
    let opens = harness.transport.open_times();
    let gap = opens[1] - opens[0];
    assert!(gap >= Duration::from_secs(10), "{gap:?}");
    assert!(gap < Duration::from_secs(11), "{gap:?}");

    harness.wait_for_state(SupervisorState::Listening).await;
    let registrations = harness.transport.sent_on(routes::REGISTER);
    assert_eq!(registrations.len(), 2);
    assert_eq!(registrations[1].header("token"), Some("token-2"));
    assert_eq!(harness.tokens.fetches(), 2);

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transport_close_waits_for_backoff() {
    let (harness, _deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    harness.transport.close_current();
    harness.wait_for_opens(2).await;

    let opens = harness.transport.open_times();
    let gap = opens[1] - opens[0];
    assert!(gap >= Duration::from_secs(5), "{gap:?}");
    assert!(gap < Duration::from_secs(6), "{gap:?}");
    assert_eq!(harness.transport.closes(), 1);

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_request_reconnects_immediately() {
    let (harness, _deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    harness.handle.request_restart();
    harness.wait_for_opens(2).await;

    let opens = harness.transport.open_times();
    assert!(opens[1] - opens[0] < Duration::from_secs(1));
    harness.wait_for_state(SupervisorState::Listening).await;
    assert!(!harness.handle.status().await.session.restart_requested);

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stale_connection_reconnects_after_backoff() {
    let mut config = test_config();
    config.heartbeat.interval_secs = 2;
    config.heartbeat.timeout_secs = 1;
    let (harness, _deliveries) = Harness::start(config);

    harness.wait_for_opens(2).await;
    let opens = harness.transport.open_times();
    let gap = opens[1] - opens[0];
    // stale after more than 3s of silence, then 5s of backoff
    assert!(gap >= Duration::from_secs(8), "{gap:?}");
    assert!(gap < Duration::from_secs(10), "{gap:?}");
    assert!(!harness.transport.sent_on(routes::HEARTBEAT).is_empty());

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_acked_heartbeats_keep_connection_alive() {
    let mut config = test_config();
    config.heartbeat.interval_secs = 2;
    config.heartbeat.timeout_secs = 1;
    let (harness, _deliveries) = Harness::start(config);
    harness.wait_for_state(SupervisorState::Listening).await;

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        harness
            .transport
            .inject(r#"{"headers":{"mid":"hb"},"code":200}"#);
    }
    assert_eq!(harness.transport.opens(), 1);
    assert!(harness.transport.sent_on(routes::HEARTBEAT).len() >= 9);

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_retries_after_backoff() {
    let tokens = ScriptedTokenSource::new();
    let (sink, _deliveries) = RecordingSink::new();
    let harness = Harness::start_with(test_config(), tokens, |builder| {
        builder.with_batch_sink(sink)
    });
    // the first attempt may already be in flight; fail the retry instead
    harness.wait_for_state(SupervisorState::Listening).await;
    harness.transport.fail_next_opens(1);
    harness.transport.close_current();

    harness.wait_for_opens(3).await;
    let opens = harness.transport.open_times();
    assert!(opens[2] - opens[1] >= Duration::from_secs(5));
    harness.wait_for_state(SupervisorState::Listening).await;

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_token_failure_retries_after_backoff() {
    let tokens = ScriptedTokenSource::scripted(vec![Err(TokenError::transient("timeout"))]);
    let (sink, _deliveries) = RecordingSink::new();
    let harness = Harness::start_with(test_config(), tokens, |builder| {
        builder.with_batch_sink(sink)
    });

    harness.wait_for_opens(2).await;
    let opens = harness.transport.open_times();
    assert!(opens[1] - opens[0] >= Duration::from_secs(5));
    harness.wait_for_state(SupervisorState::Listening).await;
    assert_eq!(harness.tokens.fetches(), 2);

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_end_the_session() {
    let tokens = ScriptedTokenSource::scripted(vec![Err(TokenError::fatal("session expired"))]);
    let (sink, _deliveries) = RecordingSink::new();
    let harness = Harness::start_with(test_config(), tokens, |builder| {
        builder.with_batch_sink(sink)
    });

    let result = tokio::time::timeout(Duration::from_secs(60), harness.task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(LiveError::FatalCredential { .. })));
    assert_eq!(harness.transport.opens(), 1);
    assert_eq!(harness.transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_buyer_messages_are_batched_and_acked() {
    let (harness, mut deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    for (i, text) in ["在吗", "还在卖吗", "能便宜点吗"].iter().enumerate() {
        harness
            .transport
            .inject(chat_frame(&format!("m{i}"), "c1", "buyer-1", text));
    }

    let (conversation, messages) = deliveries.recv().await.unwrap();
    assert_eq!(conversation, "c1");
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["在吗", "还在卖吗", "能便宜点吗"]);
    assert_eq!(harness.transport.acks().len(), 3);

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_open_batches() {
    let (harness, mut deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    harness
        .transport
        .inject(chat_frame("m1", "c7", "buyer-2", "hello"));
    wait_until(|| !harness.transport.acks().is_empty(), "ack").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.handle.status().await.batcher.open_batches, 1);

    let handle = harness.handle.clone();
    let transport = harness.transport.clone();
    harness.shutdown().await.unwrap();

    let (conversation, messages) = deliveries.try_recv().unwrap();
    assert_eq!(conversation, "c7");
    assert_eq!(messages.len(), 1);
    assert_eq!(transport.closes(), 1);

    let status = handle.status().await;
    assert_eq!(status.session.state, SupervisorState::Idle);
    assert!(!status.session.connected);
    assert_eq!(status.batcher.open_batches, 0);
}

/// Replies with the number of messages in the batch
struct CountingGenerator;

#[async_trait]
impl ReplyGenerator for CountingGenerator {
    async fn generate(
        &self,
        _conversation_id: &str,
        messages: &[ChatMessage],
    ) -> LiveResult<Option<String>> {
        Ok(Some(format!("got {}", messages.len())))
    }
}

#[tokio::test(start_paused = true)]
async fn test_seller_keyword_suppresses_replies() {
    let harness = Harness::start_with(test_config(), ScriptedTokenSource::new(), |builder| {
        builder.with_reply_generator(Arc::new(CountingGenerator))
    });
    harness.wait_for_state(SupervisorState::Listening).await;

    harness
        .transport
        .inject(chat_frame("m1", "c-manual", ACCOUNT_ID, "。"));
    wait_until(
        || harness.transport.acks().len() == 1,
        "ack of the toggle message",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(harness.handle.manual_mode().is_manual("c-manual"));

    harness
        .transport
        .inject(chat_frame("m2", "c-manual", "buyer-3", "hi"));
    harness
        .transport
        .inject(chat_frame("m3", "c-auto", "buyer-4", "hi"));

    wait_until(
        || !harness.transport.sent_on(routes::SEND_MESSAGE).is_empty(),
        "reply",
    )
    .await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let replies = harness.transport.sent_on(routes::SEND_MESSAGE);
    assert_eq!(replies.len(), 1);
    let body = replies[0].body.clone().unwrap();
    assert_eq!(body[0]["cid"], json!("c-auto@goofish"));
    assert_eq!(body[1]["actualReceivers"][0], json!("buyer-4@goofish"));

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_status_serializes() {
    let (harness, _deliveries) = Harness::start(test_config());
    harness.wait_for_state(SupervisorState::Listening).await;

    let json = harness.handle.status().await.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["session"]["state"], "Listening");
    assert_eq!(value["session"]["account_id"], ACCOUNT_ID);
    assert_eq!(value["batcher"]["max_batch_size"], 3);
    assert_eq!(value["heartbeat"]["interval_secs"], 15);

    harness.shutdown().await.unwrap();
}
