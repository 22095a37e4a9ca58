//! Outbound delivery to the chat platform with fallback branching.
//!
//! Content is sent through a [`Transport`] so the production Telegram
//! client and test doubles share the same policy code. Recovery from
//! send errors is a single error-class → adjustment table applied at
//! most once per class.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::relay::processor::{ProcessedResponse, COMPLETION_ACK};

/// Shown to the user when every delivery branch failed.
pub const FAILURE_NOTICE: &str =
    "😔 Sorry, something went wrong while sending the reply. Please try again.";

/// What the platform told us went wrong with a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The platform rejected the rich markup in the payload.
    Markup,
    /// The message being replied to no longer exists.
    StaleReference,
    Other,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Per-send options threaded through every outbound call.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub reply_to: Option<i64>,
    pub business_connection_id: Option<String>,
    pub rich_markup: bool,
}

/// Chat platform seam. Production wraps teloxide; tests record calls.
pub trait Transport: Send + Sync + 'static {
    fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        opts: &SendOptions,
    ) -> impl Future<Output = Result<i64, TransportError>> + Send;

    fn send_photo(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        opts: &SendOptions,
    ) -> impl Future<Output = Result<i64, TransportError>> + Send;

    fn send_media_group(
        &self,
        chat_id: i64,
        urls: &[String],
        opts: &SendOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_typing(
        &self,
        chat_id: i64,
        business_connection_id: Option<&str>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// All delivery branches exhausted.
#[derive(Debug)]
pub struct DeliveryError {
    pub message: String,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery failed: {}", self.message)
    }
}

impl std::error::Error for DeliveryError {}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Platform caption limit in characters.
    pub caption_limit: usize,
    /// Maximum images per grouped-media call.
    pub batch_limit: usize,
    /// Pause between consecutive outbound calls.
    pub inter_send_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            caption_limit: 1024,
            batch_limit: 10,
            inter_send_delay: Duration::from_millis(300),
        }
    }
}

/// Recovery policy: one adjustment per error class, at most once each
/// (the guard conditions stop a second application).
fn recover(opts: &mut SendOptions, err: &TransportError) -> bool {
    match err.kind {
        TransportErrorKind::Markup if opts.rich_markup => {
            opts.rich_markup = false;
            true
        }
        TransportErrorKind::StaleReference if opts.reply_to.is_some() => {
            opts.reply_to = None;
            true
        }
        _ => false,
    }
}

/// Sends processed responses, falling back per the recovery policy.
pub struct DeliveryClient<T: Transport> {
    transport: Arc<T>,
    config: DeliveryConfig,
}

impl<T: Transport> DeliveryClient<T> {
    pub fn new(transport: Arc<T>, config: DeliveryConfig) -> Self {
        Self { transport, config }
    }

    /// Deliver one processed response to a chat.
    pub async fn deliver(
        &self,
        chat_id: i64,
        processed: &ProcessedResponse,
        reply_to: Option<i64>,
        business_connection_id: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let opts = SendOptions {
            reply_to,
            business_connection_id: business_connection_id.map(str::to_string),
            rich_markup: processed.use_rich_markup,
        };

        if processed.has_images && !processed.image_urls.is_empty() {
            self.deliver_images(chat_id, processed, &opts).await
        } else if !processed.clean_text.is_empty() {
            self.send_text_with_fallbacks(chat_id, &processed.clean_text, &opts)
                .await?;
            Ok(())
        } else {
            let plain = SendOptions {
                rich_markup: false,
                ..opts
            };
            self.send_text_with_fallbacks(chat_id, COMPLETION_ACK, &plain)
                .await?;
            Ok(())
        }
    }

    /// Best-effort failure notice: plain text, no reply reference,
    /// errors swallowed. Must never propagate anything.
    pub async fn send_failure_notice(&self, chat_id: i64, business_connection_id: Option<&str>) {
        let opts = SendOptions {
            reply_to: None,
            business_connection_id: business_connection_id.map(str::to_string),
            rich_markup: false,
        };
        if let Err(e) = self.transport.send_text(chat_id, FAILURE_NOTICE, &opts).await {
            warn!("Failure notice could not be sent to chat {chat_id}: {e}");
        }
    }

    async fn deliver_images(
        &self,
        chat_id: i64,
        processed: &ProcessedResponse,
        opts: &SendOptions,
    ) -> Result<(), DeliveryError> {
        let first = &processed.image_urls[0];

        let (caption, follow_up) = split_caption(&processed.clean_text, self.config.caption_limit);

        self.send_photo_with_fallbacks(chat_id, first, caption.as_deref(), opts)
            .await?;

        if let Some(full_text) = follow_up {
            tokio::time::sleep(self.config.inter_send_delay).await;
            let plain = SendOptions {
                reply_to: None,
                business_connection_id: opts.business_connection_id.clone(),
                rich_markup: false,
            };
            if let Err(e) = self
                .send_text_with_fallbacks(chat_id, &full_text, &plain)
                .await
            {
                warn!("Follow-up text after image failed for chat {chat_id}: {e}");
            }
        }

        let rest: Vec<String> = processed
            .image_urls
            .iter()
            .skip(1)
            .take(self.config.batch_limit)
            .cloned()
            .collect();

        if rest.is_empty() {
            return Ok(());
        }

        tokio::time::sleep(self.config.inter_send_delay).await;
        let group_opts = SendOptions {
            reply_to: None,
            business_connection_id: opts.business_connection_id.clone(),
            rich_markup: false,
        };

        // Secondary images are best-effort: log, don't abort.
        if rest.len() == 1 {
            // A media group needs at least two items.
            if let Err(e) = self
                .send_photo_with_fallbacks(chat_id, &rest[0], None, &group_opts)
                .await
            {
                warn!("Secondary image failed for chat {chat_id}: {e}");
            }
        } else if let Err(e) = self
            .transport
            .send_media_group(chat_id, &rest, &group_opts)
            .await
        {
            warn!("Media group failed for chat {chat_id}: {e}");
        }

        Ok(())
    }

    async fn send_text_with_fallbacks(
        &self,
        chat_id: i64,
        text: &str,
        opts: &SendOptions,
    ) -> Result<i64, TransportError> {
        let mut opts = opts.clone();
        loop {
            match self.transport.send_text(chat_id, text, &opts).await {
                Ok(message_id) => return Ok(message_id),
                Err(err) => {
                    if !recover(&mut opts, &err) {
                        return Err(err);
                    }
                    warn!("Text send to chat {chat_id} failed ({err}), retrying adjusted");
                }
            }
        }
    }

    async fn send_photo_with_fallbacks(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        opts: &SendOptions,
    ) -> Result<i64, TransportError> {
        let mut opts = opts.clone();
        loop {
            match self.transport.send_photo(chat_id, url, caption, &opts).await {
                Ok(message_id) => return Ok(message_id),
                Err(err) => {
                    if !recover(&mut opts, &err) {
                        return Err(err);
                    }
                    warn!("Photo send to chat {chat_id} failed ({err}), retrying adjusted");
                }
            }
        }
    }
}

/// Caption within the limit, plus the full text as follow-up when it
/// does not fit.
fn split_caption(text: &str, limit: usize) -> (Option<String>, Option<String>) {
    if text.is_empty() {
        return (None, None);
    }
    if text.chars().count() <= limit {
        return (Some(text.to_string()), None);
    }
    let truncated: String = text.chars().take(limit.saturating_sub(1)).collect();
    (Some(format!("{truncated}…")), Some(text.to_string()))
}
