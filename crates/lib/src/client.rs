//! Wires the session, gateway, realtime channel and document coordinator together.

use std::sync::Arc;

use crate::auth::{AuthSession, LogNavigator, Navigator};
use crate::chat::ChatSession;
use crate::config::{resolve_api_url, resolve_token_path, resolve_ws_url, Config};
use crate::documents::DocumentOperationCoordinator;
use crate::gateway::RequestGateway;
use crate::realtime::{RagMode, RealtimeChannel, ServerEvent};
use crate::retry::RetryPolicy;
use crate::session::SessionContext;
use crate::token::TokenStore;

/// Where [`Client::dispatch`] delivered an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// The document list cache was dropped.
    pub invalidated: bool,
    /// The chat session folded it into its log.
    pub chat: bool,
}

pub struct Client {
    config: Config,
    ctx: SessionContext,
    channel: Arc<RealtimeChannel>,
    auth: AuthSession,
    documents: DocumentOperationCoordinator,
}

impl Client {
    /// Client with the token persisted at the configured path and a logging navigator.
    pub fn new(config: Config) -> Self {
        let tokens = TokenStore::load(resolve_token_path(&config));
        Self::with_parts(config, tokens, Arc::new(LogNavigator))
    }

    pub fn with_parts(config: Config, tokens: TokenStore, navigator: Arc<dyn Navigator>) -> Self {
        let ctx = SessionContext::new(tokens);
        let gateway = RequestGateway::new(resolve_api_url(&config), ctx.clone());
        let channel = RealtimeChannel::new(
            resolve_ws_url(&config),
            ctx.clone(),
            config.realtime.clone(),
        );
        let auth = AuthSession::new(ctx.clone(), gateway.clone(), navigator)
            .with_channel(Arc::clone(&channel));
        let documents = DocumentOperationCoordinator::new(ctx.clone(), gateway, &config)
            .with_events(channel.clone());
        Self {
            config,
            ctx,
            channel,
            auth,
            documents,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub fn channel(&self) -> &Arc<RealtimeChannel> {
        &self.channel
    }

    pub fn documents(&self) -> &DocumentOperationCoordinator {
        &self.documents
    }

    /// Retry policy for read-only calls, from config.
    pub fn read_policy(&self) -> RetryPolicy {
        self.config.retry.policy()
    }

    /// New conversation about `document_id` on the shared channel.
    pub fn chat(&self, document_id: impl Into<String>, rag_mode: RagMode) -> ChatSession {
        ChatSession::new(self.channel.clone(), document_id, rag_mode)
    }

    /// Route an inbound event to the document cache and `chat`, if given.
    pub fn dispatch(&self, event: &ServerEvent, chat: Option<&mut ChatSession>) -> Dispatch {
        let dispatch = Dispatch {
            invalidated: self.documents.observe(event),
            chat: chat.map(|c| c.apply(event)).unwrap_or(false),
        };
        if !dispatch.invalidated && !dispatch.chat {
            log::trace!("{} event left for the caller", event.kind());
        }
        dispatch
    }
}
