//! Telegram transport using teloxide.

use std::future::Future;
use teloxide::prelude::*;
use teloxide::types::{
    BusinessConnectionId, ChatAction, ChatKind, InputFile, InputMedia, InputMediaPhoto,
    MessageId, ParseMode, ReplyParameters,
};

use crate::relay::delivery::{SendOptions, Transport, TransportError, TransportErrorKind};
use crate::relay::message::InboundMessage;

/// Reduce a Telegram message to the pipeline envelope.
///
/// `None` when the message has no sender or carries neither text nor a
/// caption. Business messages keep their connection id so eligibility
/// and outbound sends stay on the right channel.
pub fn inbound_from_message(msg: &Message) -> Option<InboundMessage> {
    let user = msg.from.as_ref()?;
    let username = user
        .username
        .as_deref()
        .unwrap_or(user.first_name.as_str())
        .to_string();
    let text = msg.text().or_else(|| msg.caption())?.to_string();

    Some(InboundMessage {
        chat_id: msg.chat.id.0,
        message_id: msg.id.0 as i64,
        user_id: user.id.0 as i64,
        username,
        text,
        is_private: matches!(msg.chat.kind, ChatKind::Private(_)),
        business_connection_id: match &msg.kind {
            teloxide::types::MessageKind::Common(common) => common
                .business_connection_id
                .as_ref()
                .map(|id| id.0.clone()),
            _ => None,
        },
    })
}

/// Map a Telegram API error description onto our error classes.
///
/// The API reports malformed markup as "can't parse entities" and a
/// vanished reply target as "message to be replied not found" (wording
/// varies across server versions, so match loosely).
fn classify_send_error(description: &str) -> TransportErrorKind {
    let lowered = description.to_lowercase().replace('_', " ");
    if lowered.contains("parse entities") {
        TransportErrorKind::Markup
    } else if lowered.contains("not found") && lowered.contains("repl") {
        TransportErrorKind::StaleReference
    } else {
        TransportErrorKind::Other
    }
}

fn to_transport_error(err: teloxide::RequestError) -> TransportError {
    let description = err.to_string();
    TransportError::new(classify_send_error(&description), description)
}

/// Production [`Transport`] over the Telegram Bot API.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl Transport for TelegramTransport {
    fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        opts: &SendOptions,
    ) -> impl Future<Output = Result<i64, TransportError>> + Send {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if opts.rich_markup {
            request = request.parse_mode(ParseMode::Markdown);
        }
        if let Some(msg_id) = opts.reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
        }
        if let Some(conn) = &opts.business_connection_id {
            request = request.business_connection_id(BusinessConnectionId(conn.clone()));
        }

        async move {
            request
                .await
                .map(|msg| msg.id.0 as i64)
                .map_err(to_transport_error)
        }
    }

    fn send_photo(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        opts: &SendOptions,
    ) -> impl Future<Output = Result<i64, TransportError>> + Send {
        let prepared = url
            .parse()
            .map_err(|e| {
                TransportError::new(
                    TransportErrorKind::Other,
                    format!("invalid image url '{url}': {e}"),
                )
            })
            .map(|parsed| {
                let mut request = self.bot.send_photo(ChatId(chat_id), InputFile::url(parsed));
                if let Some(text) = caption {
                    request = request.caption(text);
                    if opts.rich_markup {
                        request = request.parse_mode(ParseMode::Markdown);
                    }
                }
                if let Some(msg_id) = opts.reply_to {
                    request =
                        request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
                }
                if let Some(conn) = &opts.business_connection_id {
                    request = request.business_connection_id(BusinessConnectionId(conn.clone()));
                }
                request
            });

        async move {
            prepared?
                .await
                .map(|msg| msg.id.0 as i64)
                .map_err(to_transport_error)
        }
    }

    fn send_media_group(
        &self,
        chat_id: i64,
        urls: &[String],
        opts: &SendOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let media: Result<Vec<InputMedia>, TransportError> = urls
            .iter()
            .map(|url| {
                url.parse()
                    .map(|parsed| InputMedia::Photo(InputMediaPhoto::new(InputFile::url(parsed))))
                    .map_err(|e| {
                        TransportError::new(
                            TransportErrorKind::Other,
                            format!("invalid image url '{url}': {e}"),
                        )
                    })
            })
            .collect();

        let prepared = media.map(|media| {
            let mut request = self.bot.send_media_group(ChatId(chat_id), media);
            if let Some(msg_id) = opts.reply_to {
                request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
            }
            if let Some(conn) = &opts.business_connection_id {
                request = request.business_connection_id(BusinessConnectionId(conn.clone()));
            }
            request
        });

        async move {
            prepared?.await.map(|_| ()).map_err(to_transport_error)
        }
    }

    fn send_typing(
        &self,
        chat_id: i64,
        business_connection_id: Option<&str>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let mut request = self.bot.send_chat_action(ChatId(chat_id), ChatAction::Typing);
        if let Some(conn) = business_connection_id {
            request = request.business_connection_id(BusinessConnectionId(conn.to_string()));
        }

        async move { request.await.map(|_| ()).map_err(to_transport_error) }
    }
}
