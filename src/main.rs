use std::sync::Arc;

use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::prelude::*;

use tgrelay::config::Config;
use tgrelay::relay::session::SweeperHandle;
use tgrelay::relay::telegram::inbound_from_message;
use tgrelay::relay::{
    AiClient, RateLimiter, RelayController, SessionStore, TelegramTransport,
};

struct AppState {
    controller: RelayController<AiClient, TelegramTransport>,
    /// Keep the background sweepers alive for the process lifetime.
    _session_sweeper: SweeperHandle,
    _rate_sweeper: SweeperHandle,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tgrelay.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("tgrelay.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting tgrelay...");
    info!("Loaded config from {config_path}");
    info!(
        "Rate limit: {} requests / {:?}, session TTL {:?}, max sessions {}",
        config.rate_limit_requests,
        config.rate_limit_window,
        config.session_ttl,
        config.max_sessions
    );

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_requests,
        config.rate_limit_window,
    ));
    let rate_sweeper = rate_limiter.spawn_sweeper(config.session_sweep_interval);
    let sessions = Arc::new(SessionStore::new(config.session_ttl, config.max_sessions));
    let session_sweeper = sessions.spawn_sweeper(config.session_sweep_interval);

    let ai = Arc::new(AiClient::new(
        config.ai_endpoint.clone(),
        config.ai_api_key.clone(),
    ));
    let transport = Arc::new(TelegramTransport::new(bot.clone()));

    let controller = RelayController::new(
        config.relay_config(),
        rate_limiter,
        sessions,
        ai,
        transport,
        config.delivery_config(),
    );

    let state = Arc::new(AppState {
        controller,
        _session_sweeper: session_sweeper,
        _rate_sweeper: rate_sweeper,
    });

    // Business messages arrive as their own update kind and need their
    // own branch; the pipeline treats both the same.
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_new_message))
        .branch(Update::filter_business_message().endpoint(handle_new_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_new_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(envelope) = inbound_from_message(&msg) else {
        return Ok(());
    };

    // Every terminal outcome maps to Ok so Telegram never redelivers the
    // update on our account.
    let outcome = state.controller.handle(envelope).await;
    tracing::debug!("Message {} handled: {outcome:?}", msg.id);
    Ok(())
}
