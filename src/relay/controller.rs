//! Relay controller - drives one inbound message through the pipeline.
//!
//! Admission check → session lookup → AI call → response processing →
//! delivery → session update. Nothing propagates out of `handle`; the
//! caller always gets a terminal outcome so the platform never retries
//! an update because of our own failures.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::relay::ai::{AiBackend, AiReply, AiRequest};
use crate::relay::delivery::{DeliveryClient, DeliveryConfig, Transport};
use crate::relay::message::InboundMessage;
use crate::relay::processor;
use crate::relay::rate_limit::RateLimiter;
use crate::relay::session::SessionStore;

/// Synthesized answer when the backend exceeds its deadline.
pub const TIMEOUT_ANSWER: &str =
    "⌛ The response took too long. Please try again in a moment.";

/// Synthesized answer when the backend keeps failing.
pub const APOLOGY_ANSWER: &str =
    "😔 Sorry, I couldn't come up with an answer right now. Please try again later.";

const TRUNCATION_MARKER: &str = "… [truncated]";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Query length cap toward the AI backend, in characters.
    pub max_query_chars: usize,
    /// Hard deadline for one AI call.
    pub ai_timeout: Duration,
    /// Total attempts against the backend (first try included).
    pub ai_attempts: u32,
    /// Backoff base; attempt n waits base * 2^(n-1).
    pub backoff_base: Duration,
    /// How often the "composing" indicator is re-sent.
    pub typing_interval: Duration,
    /// Business connections the bot answers on, besides private chats.
    pub allowed_business_connections: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_query_chars: 4000,
            ai_timeout: Duration::from_secs(90),
            ai_attempts: 2,
            backoff_base: Duration::from_millis(500),
            typing_interval: Duration::from_secs(5),
            allowed_business_connections: Vec::new(),
        }
    }
}

/// Terminal state of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Dropped silently: invalid, ineligible, rate-limited or duplicate.
    Ignored,
    Delivered,
    /// Delivery exhausted; fallback notice attempted.
    Failed,
}

/// Removes its key from the in-flight set when dropped, so the guard is
/// released on every exit path.
struct InFlightGuard<'a> {
    map: &'a Mutex<HashSet<(i64, i64)>>,
    key: (i64, i64),
}

impl<'a> InFlightGuard<'a> {
    fn acquire(map: &'a Mutex<HashSet<(i64, i64)>>, key: (i64, i64)) -> Option<Self> {
        let mut set = map.lock().expect("in-flight set lock poisoned");
        if set.insert(key) {
            Some(Self { map, key })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .lock()
            .expect("in-flight set lock poisoned")
            .remove(&self.key);
    }
}

/// Aborts the typing-indicator task when dropped.
struct TypingGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct RelayController<A: AiBackend, T: Transport> {
    config: RelayConfig,
    rate_limiter: Arc<RateLimiter>,
    sessions: Arc<SessionStore>,
    ai: Arc<A>,
    transport: Arc<T>,
    delivery: DeliveryClient<T>,
    in_flight: Mutex<HashSet<(i64, i64)>>,
}

impl<A: AiBackend, T: Transport> RelayController<A, T> {
    pub fn new(
        config: RelayConfig,
        rate_limiter: Arc<RateLimiter>,
        sessions: Arc<SessionStore>,
        ai: Arc<A>,
        transport: Arc<T>,
        delivery_config: DeliveryConfig,
    ) -> Self {
        let delivery = DeliveryClient::new(Arc::clone(&transport), delivery_config);
        Self {
            config,
            rate_limiter,
            sessions,
            ai,
            transport,
            delivery,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run one inbound message to a terminal state.
    pub async fn handle(&self, msg: InboundMessage) -> RelayOutcome {
        if !msg.is_valid() {
            debug!("Dropping invalid envelope (chat {})", msg.chat_id);
            return RelayOutcome::Ignored;
        }
        if !self.is_eligible(&msg) {
            debug!("Dropping message from ineligible chat {}", msg.chat_id);
            return RelayOutcome::Ignored;
        }
        if !self.rate_limiter.is_allowed(msg.user_id) {
            info!("Rate limited user {} ({})", msg.username, msg.user_id);
            return RelayOutcome::Ignored;
        }

        // A redelivered update for the same message is dropped while the
        // first one is still in flight.
        let Some(_in_flight) = InFlightGuard::acquire(
            &self.in_flight,
            (msg.user_id, msg.message_id),
        ) else {
            debug!(
                "Message {} from user {} already in flight, dropping duplicate",
                msg.message_id, msg.user_id
            );
            return RelayOutcome::Ignored;
        };

        let session = match self.sessions.get_or_create(msg.user_id) {
            Ok(session) => session,
            Err(e) => {
                warn!("Session lookup failed: {e}");
                return RelayOutcome::Ignored;
            }
        };

        info!(
            "💬 Relaying message {} from {} ({})",
            msg.message_id, msg.username, msg.user_id
        );

        let reply = {
            let _typing = self.start_typing(msg.chat_id, msg.business_connection_id.clone());
            let request = AiRequest {
                query: cap_query(&msg.text, self.config.max_query_chars),
                user: format!("tg-{}", msg.user_id),
                conversation_token: session.conversation_token,
            };
            self.call_backend(request).await
            // Typing guard drops here, on success and failure alike.
        };

        let processed = processor::process(&reply.answer);
        // Empty tokens (synthesized answers) never clear a known one.
        self.sessions.update(msg.user_id, &reply.conversation_token);

        match self
            .delivery
            .deliver(
                msg.chat_id,
                &processed,
                Some(msg.message_id),
                msg.business_connection_id.as_deref(),
            )
            .await
        {
            Ok(()) => RelayOutcome::Delivered,
            Err(e) => {
                error!("Delivery to chat {} failed: {e}", msg.chat_id);
                self.delivery
                    .send_failure_notice(msg.chat_id, msg.business_connection_id.as_deref())
                    .await;
                RelayOutcome::Failed
            }
        }
    }

    fn is_eligible(&self, msg: &InboundMessage) -> bool {
        // Business messages arrive through private chats too, so the
        // connection id is checked first: replying on behalf of a
        // business account needs an allow-list entry, always.
        match msg.business_connection_id.as_deref() {
            Some(id) => self
                .config
                .allowed_business_connections
                .iter()
                .any(|allowed| allowed == id),
            None => msg.is_private,
        }
    }

    fn start_typing(&self, chat_id: i64, business_connection_id: Option<String>) -> TypingGuard {
        let transport = Arc::clone(&self.transport);
        let every = self.config.typing_interval;
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = transport
                    .send_typing(chat_id, business_connection_id.as_deref())
                    .await
                {
                    debug!("Typing indicator for chat {chat_id} failed: {e}");
                }
                tokio::time::sleep(every).await;
            }
        });
        TypingGuard { handle }
    }

    /// Call the backend with timeout and bounded retries. Always yields
    /// an answer; synthesized ones carry no continuation token.
    async fn call_backend(&self, request: AiRequest) -> AiReply {
        for attempt in 1..=self.config.ai_attempts {
            let call = self.ai.chat(request.clone());
            match tokio::time::timeout(self.config.ai_timeout, call).await {
                Err(_) => {
                    warn!(
                        "AI call timed out after {:?} (attempt {attempt})",
                        self.config.ai_timeout
                    );
                    return AiReply {
                        answer: TIMEOUT_ANSWER.to_string(),
                        conversation_token: String::new(),
                    };
                }
                Ok(Ok(reply)) => return reply,
                Ok(Err(e)) if e.is_transient() && attempt < self.config.ai_attempts => {
                    let delay = self.config.backoff_base * 2u32.pow(attempt - 1);
                    warn!("AI call failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(e)) => {
                    error!("AI call failed for good: {e}");
                    break;
                }
            }
        }
        AiReply {
            answer: APOLOGY_ANSWER.to_string(),
            conversation_token: String::new(),
        }
    }
}

/// Cap the query at `max_chars`, marking the cut.
fn cap_query(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    let keep = max_chars.saturating_sub(marker_len);
    let truncated: String = text.chars().take(keep).collect();
    format!("{truncated}{TRUNCATION_MARKER}")
}
