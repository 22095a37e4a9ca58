//! End-to-end pipeline tests with scripted AI backend and transport.
//!
//! Run with: cargo test --test relay_pipeline

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tgrelay::relay::ai::{AiBackend, AiError, AiReply, AiRequest};
use tgrelay::relay::controller::{
    RelayConfig, RelayController, RelayOutcome, APOLOGY_ANSWER, TIMEOUT_ANSWER,
};
use tgrelay::relay::delivery::{
    DeliveryConfig, SendOptions, Transport, TransportError, TransportErrorKind, FAILURE_NOTICE,
};
use tgrelay::relay::message::InboundMessage;
use tgrelay::relay::rate_limit::RateLimiter;
use tgrelay::relay::session::SessionStore;

// -----------------------------------------------------------------------------
// Test doubles
// -----------------------------------------------------------------------------

#[derive(Default)]
struct MockAi {
    script: Mutex<VecDeque<Result<AiReply, AiError>>>,
    /// Simulated backend latency.
    delay: Option<Duration>,
    requests: Mutex<Vec<AiRequest>>,
}

impl MockAi {
    fn scripted(outcomes: Vec<Result<AiReply, AiError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn slow(outcomes: Vec<Result<AiReply, AiError>>, delay: Duration) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            delay: Some(delay),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

fn reply(answer: &str, token: &str) -> AiReply {
    AiReply {
        answer: answer.to_string(),
        conversation_token: token.to_string(),
    }
}

impl AiBackend for MockAi {
    fn chat(&self, request: AiRequest) -> impl Future<Output = Result<AiReply, AiError>> + Send {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        let delay = self.delay;
        async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            next.unwrap_or_else(|| Ok(reply("unscripted", "")))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SentText {
    chat_id: i64,
    text: String,
    rich: bool,
    reply_to: Option<i64>,
    business_connection_id: Option<String>,
}

#[derive(Default)]
struct MockTransport {
    texts: Mutex<Vec<SentText>>,
    text_failures: Mutex<VecDeque<TransportErrorKind>>,
    typing_count: Mutex<usize>,
}

impl MockTransport {
    fn fail_text_with(&self, kinds: &[TransportErrorKind]) {
        self.text_failures
            .lock()
            .unwrap()
            .extend(kinds.iter().copied());
    }

    fn texts(&self) -> Vec<SentText> {
        self.texts.lock().unwrap().clone()
    }

    fn typing_count(&self) -> usize {
        *self.typing_count.lock().unwrap()
    }
}

impl Transport for MockTransport {
    fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        opts: &SendOptions,
    ) -> impl Future<Output = Result<i64, TransportError>> + Send {
        self.texts.lock().unwrap().push(SentText {
            chat_id,
            text: text.to_string(),
            rich: opts.rich_markup,
            reply_to: opts.reply_to,
            business_connection_id: opts.business_connection_id.clone(),
        });
        let result = match self.text_failures.lock().unwrap().pop_front() {
            Some(kind) => Err(TransportError::new(kind, "scripted failure")),
            None => Ok(1),
        };
        std::future::ready(result)
    }

    fn send_photo(
        &self,
        _chat_id: i64,
        _url: &str,
        _caption: Option<&str>,
        _opts: &SendOptions,
    ) -> impl Future<Output = Result<i64, TransportError>> + Send {
        std::future::ready(Ok(2))
    }

    fn send_media_group(
        &self,
        _chat_id: i64,
        _urls: &[String],
        _opts: &SendOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        std::future::ready(Ok(()))
    }

    fn send_typing(
        &self,
        _chat_id: i64,
        _business_connection_id: Option<&str>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        *self.typing_count.lock().unwrap() += 1;
        std::future::ready(Ok(()))
    }
}

// -----------------------------------------------------------------------------
// Harness
// -----------------------------------------------------------------------------

struct Harness {
    ai: Arc<MockAi>,
    transport: Arc<MockTransport>,
    sessions: Arc<SessionStore>,
    controller: RelayController<MockAi, MockTransport>,
}

fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        ai_timeout: Duration::from_millis(200),
        backoff_base: Duration::from_millis(1),
        typing_interval: Duration::from_millis(10),
        ..RelayConfig::default()
    }
}

fn harness(ai: MockAi, relay_config: RelayConfig, rate_ceiling: usize) -> Harness {
    let ai = Arc::new(ai);
    let transport = Arc::new(MockTransport::default());
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(3600), 100));
    let rate_limiter = Arc::new(RateLimiter::new(rate_ceiling, Duration::from_secs(60)));
    let controller = RelayController::new(
        relay_config,
        rate_limiter,
        Arc::clone(&sessions),
        Arc::clone(&ai),
        Arc::clone(&transport),
        DeliveryConfig {
            inter_send_delay: Duration::from_millis(0),
            ..DeliveryConfig::default()
        },
    );
    Harness {
        ai,
        transport,
        sessions,
        controller,
    }
}

fn private_message(user_id: i64, message_id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: user_id,
        message_id,
        user_id,
        username: "Alice".to_string(),
        text: text.to_string(),
        is_private: true,
        business_connection_id: None,
    }
}

// -----------------------------------------------------------------------------
// Scenarios
// -----------------------------------------------------------------------------

#[tokio::test]
async fn fresh_session_happy_path() {
    let h = harness(
        MockAi::scripted(vec![Ok(reply("hi!", "abc"))]),
        fast_relay_config(),
        20,
    );

    let outcome = h.controller.handle(private_message(7, 42, "hello")).await;
    assert_eq!(outcome, RelayOutcome::Delivered);

    // The backend saw a fresh conversation and the capped query.
    let requests = h.ai.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].query, "hello");
    assert_eq!(requests[0].user, "tg-7");
    assert_eq!(requests[0].conversation_token, "");
    drop(requests);

    // One rich-markup text, replying to the inbound message.
    let texts = h.transport.texts();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].text, "hi!");
    assert!(texts[0].rich);
    assert_eq!(texts[0].reply_to, Some(42));

    // The new continuation token was recorded.
    let session = h.sessions.get_or_create(7).unwrap();
    assert_eq!(session.conversation_token, "abc");
}

#[tokio::test]
async fn continuation_token_reused_on_second_message() {
    let h = harness(
        MockAi::scripted(vec![Ok(reply("hi!", "abc")), Ok(reply("again!", "abc"))]),
        fast_relay_config(),
        20,
    );

    h.controller.handle(private_message(7, 42, "hello")).await;
    h.controller.handle(private_message(7, 43, "more")).await;

    let requests = h.ai.requests.lock().unwrap();
    assert_eq!(requests[1].conversation_token, "abc");
}

#[tokio::test]
async fn timeout_synthesizes_answer_and_keeps_token() {
    let h = harness(
        MockAi::slow(vec![Ok(reply("late", "new-token"))], Duration::from_secs(5)),
        RelayConfig {
            ai_timeout: Duration::from_millis(50),
            ..fast_relay_config()
        },
        20,
    );

    // The user already has a conversation going.
    h.sessions.get_or_create(7).unwrap();
    h.sessions.update(7, "tok-1");

    let outcome = h.controller.handle(private_message(7, 42, "hello")).await;
    assert_eq!(outcome, RelayOutcome::Delivered);

    let texts = h.transport.texts();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].text, TIMEOUT_ANSWER);

    // The synthesized answer carries no token; the old one survives.
    let session = h.sessions.get_or_create(7).unwrap();
    assert_eq!(session.conversation_token, "tok-1");
}

#[tokio::test]
async fn transient_backend_error_is_retried() {
    let h = harness(
        MockAi::scripted(vec![
            Err(AiError::Api {
                status: 503,
                body: "overloaded".to_string(),
            }),
            Ok(reply("hi!", "abc")),
        ]),
        fast_relay_config(),
        20,
    );

    let outcome = h.controller.handle(private_message(7, 42, "hello")).await;
    assert_eq!(outcome, RelayOutcome::Delivered);
    assert_eq!(h.ai.request_count(), 2);
    assert_eq!(h.transport.texts()[0].text, "hi!");
}

#[tokio::test]
async fn non_transient_backend_error_synthesizes_apology() {
    let h = harness(
        MockAi::scripted(vec![Err(AiError::Api {
            status: 400,
            body: "bad request".to_string(),
        })]),
        fast_relay_config(),
        20,
    );

    let outcome = h.controller.handle(private_message(7, 42, "hello")).await;
    assert_eq!(outcome, RelayOutcome::Delivered);
    assert_eq!(h.ai.request_count(), 1);
    assert_eq!(h.transport.texts()[0].text, APOLOGY_ANSWER);

    // No token was invented for the failed conversation.
    let session = h.sessions.get_or_create(7).unwrap();
    assert_eq!(session.conversation_token, "");
}

#[tokio::test]
async fn rejected_markup_is_retried_exactly_once_plain() {
    let h = harness(
        MockAi::scripted(vec![Ok(reply("*hi!*", "abc"))]),
        fast_relay_config(),
        20,
    );
    h.transport.fail_text_with(&[TransportErrorKind::Markup]);

    let outcome = h.controller.handle(private_message(7, 42, "hello")).await;
    assert_eq!(outcome, RelayOutcome::Delivered);

    let texts = h.transport.texts();
    assert_eq!(texts.len(), 2);
    assert!(texts[0].rich);
    assert!(!texts[1].rich);
    assert_eq!(texts[1].text, "*hi!*");
}

#[tokio::test]
async fn exhausted_delivery_sends_failure_notice() {
    let h = harness(
        MockAi::scripted(vec![Ok(reply("hi!", "abc"))]),
        fast_relay_config(),
        20,
    );
    // The real send fails unrecoverably; the notice send fails too and
    // must be swallowed.
    h.transport.fail_text_with(&[TransportErrorKind::Other, TransportErrorKind::Other]);

    let outcome = h.controller.handle(private_message(7, 42, "hello")).await;
    assert_eq!(outcome, RelayOutcome::Failed);

    let texts = h.transport.texts();
    assert_eq!(texts.len(), 2);
    assert_eq!(texts[1].text, FAILURE_NOTICE);
    assert!(!texts[1].rich);
    assert!(texts[1].reply_to.is_none());
}

#[tokio::test]
async fn rate_limited_user_is_dropped_silently() {
    let h = harness(
        MockAi::scripted(vec![Ok(reply("hi!", "abc")), Ok(reply("again", "abc"))]),
        fast_relay_config(),
        1,
    );

    assert_eq!(
        h.controller.handle(private_message(7, 42, "hello")).await,
        RelayOutcome::Delivered
    );
    assert_eq!(
        h.controller.handle(private_message(7, 43, "hello again")).await,
        RelayOutcome::Ignored
    );

    assert_eq!(h.ai.request_count(), 1);
    assert_eq!(h.transport.texts().len(), 1);
}

#[tokio::test]
async fn group_chat_without_business_connection_is_ignored() {
    let h = harness(MockAi::default(), fast_relay_config(), 20);

    let mut msg = private_message(7, 42, "hello");
    msg.is_private = false;
    msg.chat_id = -100;

    assert_eq!(h.controller.handle(msg).await, RelayOutcome::Ignored);
    assert_eq!(h.ai.request_count(), 0);
    assert!(h.transport.texts().is_empty());
}

#[tokio::test]
async fn authorized_business_connection_is_answered() {
    let h = harness(
        MockAi::scripted(vec![Ok(reply("hi!", "abc"))]),
        RelayConfig {
            allowed_business_connections: vec!["biz-1".to_string()],
            ..fast_relay_config()
        },
        20,
    );

    let mut msg = private_message(7, 42, "hello");
    msg.is_private = false;
    msg.business_connection_id = Some("biz-1".to_string());

    assert_eq!(h.controller.handle(msg).await, RelayOutcome::Delivered);
    let texts = h.transport.texts();
    assert_eq!(texts[0].business_connection_id.as_deref(), Some("biz-1"));
}

#[tokio::test]
async fn business_message_in_private_chat_still_requires_authorization() {
    let h = harness(MockAi::default(), fast_relay_config(), 20);

    // Business chats have the private chat kind; the connection id must
    // still be allow-listed before the bot answers on its behalf.
    let mut msg = private_message(7, 42, "hello");
    msg.business_connection_id = Some("biz-9".to_string());

    assert_eq!(h.controller.handle(msg).await, RelayOutcome::Ignored);
    assert_eq!(h.ai.request_count(), 0);
    assert!(h.transport.texts().is_empty());
}

#[tokio::test]
async fn unknown_business_connection_is_ignored() {
    let h = harness(MockAi::default(), fast_relay_config(), 20);

    let mut msg = private_message(7, 42, "hello");
    msg.is_private = false;
    msg.business_connection_id = Some("biz-9".to_string());

    assert_eq!(h.controller.handle(msg).await, RelayOutcome::Ignored);
    assert_eq!(h.ai.request_count(), 0);
}

#[tokio::test]
async fn duplicate_inbound_delivery_is_dropped_while_in_flight() {
    let h = harness(
        MockAi::slow(
            vec![Ok(reply("hi!", "abc")), Ok(reply("dup", "abc"))],
            Duration::from_millis(100),
        ),
        fast_relay_config(),
        20,
    );
    let controller = Arc::new(h.controller);

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.handle(private_message(7, 42, "hello")).await })
    };
    // Give the first handle time to take the guard.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = controller.handle(private_message(7, 42, "hello")).await;

    assert_eq!(second, RelayOutcome::Ignored);
    assert_eq!(first.await.unwrap(), RelayOutcome::Delivered);
    assert_eq!(h.ai.request_count(), 1);
}

#[tokio::test]
async fn typing_indicator_runs_during_ai_call_and_stops_after() {
    let h = harness(
        MockAi::slow(vec![Ok(reply("hi!", "abc"))], Duration::from_millis(80)),
        fast_relay_config(),
        20,
    );

    h.controller.handle(private_message(7, 42, "hello")).await;
    let after_handle = h.transport.typing_count();
    assert!(after_handle >= 2, "typing re-sent during the AI call");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        h.transport.typing_count(),
        after_handle,
        "typing task cancelled on exit"
    );
}

#[tokio::test]
async fn empty_text_message_is_dropped() {
    let h = harness(MockAi::default(), fast_relay_config(), 20);
    assert_eq!(
        h.controller.handle(private_message(7, 42, "   ")).await,
        RelayOutcome::Ignored
    );
    assert_eq!(h.ai.request_count(), 0);
}
