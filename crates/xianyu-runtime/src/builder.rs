//! Runtime Builder API
//!
//! Wires the session components from one configuration value and the
//! external collaborators, and returns the supervisor together with a handle
//! for status, restart and shutdown.

use std::sync::Arc;

use tracing::info;
use xianyu_core::{
    ChatMessage, EnvelopeCodec, LiveConfig, LiveError, LiveResult, NoDecryptor, OutboundSender,
    SessionIdentity, SyncPackageCodec, Transport,
};

use crate::batcher::{BatchSink, ConversationBatcher};
use crate::heartbeat::{HeartbeatHandle, HeartbeatMonitor};
use crate::ingress::FrameIngress;
use crate::manual::ManualModeRegistry;
use crate::pipeline::{ReplyGenerator, ReplyPipeline};
use crate::session::Session;
use crate::status::SystemStatus;
use crate::supervisor::ConnectionSupervisor;
use crate::token::{TokenHandle, TokenManager, TokenSource};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for the live session runtime
pub struct RuntimeBuilder {
    config: LiveConfig,
    transport: Option<Arc<dyn Transport>>,
    token_source: Option<Arc<dyn TokenSource>>,
    codec: Option<Arc<dyn EnvelopeCodec>>,
    generator: Option<Arc<dyn ReplyGenerator>>,
    sink: Option<Arc<dyn BatchSink<ChatMessage>>>,
    device_id: Option<String>,
}

impl RuntimeBuilder {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            config,
            transport: None,
            token_source: None,
            codec: None,
            generator: None,
            sink: None,
            device_id: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Envelope codec; defaults to the sync-package codec without a decryptor
    pub fn with_codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Reply generator for the default reply pipeline
    pub fn with_reply_generator(mut self, generator: Arc<dyn ReplyGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Replace the reply pipeline with a custom batch sink
    pub fn with_batch_sink(mut self, sink: Arc<dyn BatchSink<ChatMessage>>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Fixed device id instead of a generated one
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Build the supervisor and its handle
    pub fn build(self) -> LiveResult<(ConnectionSupervisor, RuntimeHandle)> {
        self.config.validate()?;
        let config = self.config;

        let transport = self
            .transport
            .ok_or_else(|| LiveError::config_error("no transport configured"))?;
        let token_source = self
            .token_source
            .ok_or_else(|| LiveError::config_error("no token source configured"))?;
        let codec: Arc<dyn EnvelopeCodec> = match self.codec {
            Some(codec) => codec,
            None => Arc::new(SyncPackageCodec::new(Arc::new(NoDecryptor))),
        };

        let account_id = config.account_id()?;
        let mut identity = SessionIdentity::for_account(account_id.clone());
        if let Some(device_id) = self.device_id {
            identity.device_id = device_id;
        }
        info!(account = %identity.account_id, device = %identity.device_id, "Building live session runtime");

        let outbound = OutboundSender::new();
        let session = Arc::new(Session::new(identity.clone(), outbound.clone()));
        let manual = Arc::new(ManualModeRegistry::new(&config.manual_mode));

        let sink: Arc<dyn BatchSink<ChatMessage>> = match (self.sink, self.generator) {
            (Some(sink), _) => sink,
            (None, Some(generator)) => Arc::new(ReplyPipeline::new(
                generator,
                manual.clone(),
                outbound.clone(),
            )),
            (None, None) => {
                return Err(LiveError::config_error(
                    "either a reply generator or a batch sink is required",
                ))
            }
        };

        let batcher = ConversationBatcher::new(&config.batching, sink);
        let heartbeat = HeartbeatMonitor::new(&config.heartbeat, outbound);
        let tokens = TokenManager::new(&config.token, identity.device_id.clone(), token_source);
        let ingress = FrameIngress::new(
            account_id,
            codec,
            batcher.clone(),
            manual.clone(),
            config.manual_mode.toggle_keywords.clone(),
            config.message.expire_time_ms,
        );

        let handle = RuntimeHandle {
            session: session.clone(),
            heartbeat: heartbeat.handle(),
            tokens: tokens.handle(),
            batcher: batcher.clone(),
            manual,
        };
        let supervisor = ConnectionSupervisor::new(
            config, transport, session, heartbeat, tokens, batcher, ingress,
        );
        Ok((supervisor, handle))
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Control and status handle of a running supervisor
#[derive(Clone)]
pub struct RuntimeHandle {
    session: Arc<Session>,
    heartbeat: HeartbeatHandle,
    tokens: TokenHandle,
    batcher: ConversationBatcher<ChatMessage>,
    manual: Arc<ManualModeRegistry>,
}

impl RuntimeHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn manual_mode(&self) -> &Arc<ManualModeRegistry> {
        &self.manual
    }

    /// Drop the current connection and reconnect without backoff
    pub fn request_restart(&self) {
        self.session.request_restart();
    }

    /// Leave the state loop after draining the batcher
    pub fn shutdown(&self) {
        self.session.request_shutdown();
    }

    pub async fn status(&self) -> SystemStatus {
        SystemStatus {
            session: self.session.status().await,
            heartbeat: self.heartbeat.status(),
            token: self.tokens.status(),
            batcher: self.batcher.status().await,
            manual_mode: self.manual.status(),
        }
    }
}
