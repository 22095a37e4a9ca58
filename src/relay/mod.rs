//! Relay module - forwards Telegram messages to the AI backend and
//! delivers the formatted reply.

pub mod ai;
pub mod controller;
pub mod delivery;
pub mod message;
pub mod processor;
pub mod rate_limit;
pub mod session;
pub mod telegram;

pub use ai::{AiBackend, AiClient, AiReply, AiRequest};
pub use controller::{RelayConfig, RelayController, RelayOutcome};
pub use delivery::{DeliveryClient, DeliveryConfig, SendOptions, Transport};
pub use message::InboundMessage;
pub use processor::{process, validate_markup, ProcessedResponse};
pub use rate_limit::RateLimiter;
pub use session::{SessionStore, UserSession};
pub use telegram::TelegramTransport;
