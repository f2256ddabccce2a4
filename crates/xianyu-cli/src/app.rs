//! Application wiring for the `xianyu-live` binary

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use xianyu_runtime::{
    ChatMessage, ConnectionSupervisor, LiveConfig, LiveResult, ReplyGenerator, RuntimeBuilder,
    RuntimeHandle, StaticTokenSource,
};
use xianyu_ws::{WsTransport, WsTransportConfig};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Logging
// ----------------------------------------------------------------------------

/// Filter directive used when `RUST_LOG` is not set
pub fn default_directive(level: &str, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        level.trim().to_ascii_lowercase()
    }
}

/// Setup logging; `RUST_LOG` takes precedence over configuration and flags
pub fn setup_logging(level: &str, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level, verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

// ----------------------------------------------------------------------------
// Reply Generation
// ----------------------------------------------------------------------------

/// Logs each batch and never replies. Replace with a real generator when
/// embedding the runtime.
pub struct LoggingReplyGenerator;

#[async_trait]
impl ReplyGenerator for LoggingReplyGenerator {
    async fn generate(
        &self,
        conversation_id: &str,
        messages: &[ChatMessage],
    ) -> LiveResult<Option<String>> {
        for message in messages {
            info!(
                conversation = %conversation_id,
                sender = %message.sender_name,
                item = %message.item_id,
                "{}",
                message.content
            );
        }
        Ok(None)
    }
}

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

pub struct LiveApp {
    config: LiveConfig,
}

impl LiveApp {
    pub fn new(config: LiveConfig) -> Self {
        Self { config }
    }

    /// Wire the WebSocket transport, configured token and logging generator
    pub fn build(&self) -> Result<(ConnectionSupervisor, RuntimeHandle)> {
        let transport = WsTransport::new(WsTransportConfig::from(&self.config.websocket));
        let tokens = StaticTokenSource::new(self.config.token.access_token.clone());

        Ok(RuntimeBuilder::new(self.config.clone())
            .with_transport(Arc::new(transport))
            .with_token_source(Arc::new(tokens))
            .with_reply_generator(Arc::new(LoggingReplyGenerator))
            .build()?)
    }

    /// Run the supervisor until it stops or Ctrl-C asks it to
    pub async fn run(self) -> Result<()> {
        if self.config.token.access_token.is_none() {
            warn!("No token.access_token configured; registration will be rejected");
        }

        let (mut supervisor, handle) = self.build()?;
        let mut task = tokio::spawn(async move { supervisor.run().await });

        let joined = tokio::select! {
            joined = &mut task => joined,
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        info!("Interrupt received, draining batches and disconnecting");
                        handle.shutdown();
                    }
                    Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
                }
                task.await
            }
        };

        match handle.status().await.to_json() {
            Ok(status) => debug!("Final status:\n{}", status),
            Err(e) => warn!("Failed to render final status: {}", e),
        }

        let result = joined.map_err(|e| CliError::Task(e.to_string()))?;
        result?;
        info!("Live session stopped");
        Ok(())
    }
}
