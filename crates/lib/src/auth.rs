//! Login, logout and session restore.
//!
//! `AuthSession` is the only writer of the token and session status (apart
//! from the gateway's 401 path). At most one login/restore runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ClientError;
use crate::gateway::{Auth, RequestGateway};
use crate::models::{LoginResponse, UserProfile};
use crate::realtime::RealtimeChannel;
use crate::session::SessionContext;
use crate::token::Token;

const LOGIN_PATH: &str = "/api/auth/login";
const ME_PATH: &str = "/api/auth/me";

/// Where the front end should go after an auth transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Public,
    Protected,
}

pub trait Navigator: Send + Sync {
    fn navigate(&self, route: Route);
}

/// Navigator that only logs. Used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, route: Route) {
        log::debug!("navigate -> {:?}", route);
    }
}

/// Clears the in-flight flag when the attempt ends, however it ends.
struct AttemptGuard<'a>(&'a AtomicBool);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct AuthSession {
    ctx: SessionContext,
    gateway: RequestGateway,
    channel: Option<Arc<RealtimeChannel>>,
    navigator: Arc<dyn Navigator>,
    in_flight: AtomicBool,
}

impl AuthSession {
    pub fn new(ctx: SessionContext, gateway: RequestGateway, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            ctx,
            gateway,
            channel: None,
            navigator,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Open this channel whenever the session becomes authenticated; close it on logout.
    pub fn with_channel(mut self, channel: Arc<RealtimeChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn is_authenticated(&self) -> bool {
        self.ctx.is_authenticated()
    }

    /// True while a login or restore is in flight.
    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn begin_attempt(&self) -> Result<AttemptGuard<'_>, ClientError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| AttemptGuard(&self.in_flight))
            .map_err(|_| ClientError::AlreadyInProgress)
    }

    /// Exchange credentials for a token, then load the profile.
    ///
    /// A rejected login (401/403) is `InvalidCredentials` and leaves the
    /// session as it was. A failed profile fetch rolls back to logged out.
    /// A logout while this is in flight wins: the login returns `Cancelled`
    /// without storing its token or opening the channel.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile, ClientError> {
        let _attempt = self.begin_attempt()?;
        let epoch = self.ctx.snapshot().token_version;
        let fields = [("username", username), ("password", password)];
        let res: LoginResponse = match self
            .gateway
            .post_form(LOGIN_PATH, &fields, Auth::Anonymous)
            .await
        {
            Ok(r) => r,
            Err(ClientError::Api { status: 401 | 403, .. }) => {
                log::info!("login rejected for {}", username);
                return Err(ClientError::InvalidCredentials);
            }
            Err(e) => return Err(e),
        };

        // a new token means a fresh connection
        if let Some(channel) = &self.channel {
            channel.close().await;
        }
        let Some(epoch) = self
            .ctx
            .begin_authenticating_from(epoch, Token::new(res.access_token))
        else {
            log::info!("login for {} cancelled by logout", username);
            return Err(ClientError::Cancelled);
        };
        match self.gateway.get::<UserProfile>(ME_PATH).await {
            Ok(user) => {
                if !self.authenticated(epoch, user.clone()) {
                    log::info!("login for {} cancelled by logout", username);
                    return Err(ClientError::Cancelled);
                }
                log::info!("logged in as {}", user.display_name());
                Ok(user)
            }
            Err(e) => {
                log::warn!("profile fetch after login failed: {}", e);
                self.ctx.reset();
                Err(e)
            }
        }
    }

    /// Drop the session and close the realtime channel. Always succeeds.
    ///
    /// Any login or restore still in flight will not commit.
    pub async fn logout(&self) {
        self.ctx.reset();
        if let Some(channel) = &self.channel {
            channel.close().await;
        }
        self.navigator.navigate(Route::Public);
    }

    /// Resume a persisted token. Any failure silently leaves the session logged out.
    pub async fn restore(&self) -> Option<UserProfile> {
        let Ok(_attempt) = self.begin_attempt() else {
            log::debug!("restore skipped: authentication already in progress");
            return None;
        };
        if self.ctx.is_authenticated() {
            return self.ctx.user();
        }
        if !self.ctx.tokens().is_present() {
            return None;
        }
        let epoch = self.ctx.snapshot().token_version;
        self.ctx.mark_authenticating();
        match self.gateway.get::<UserProfile>(ME_PATH).await {
            Ok(user) => {
                if !self.authenticated(epoch, user.clone()) {
                    log::debug!("restore cancelled by logout");
                    return None;
                }
                log::info!("restored session for {}", user.display_name());
                Some(user)
            }
            Err(e) => {
                log::debug!("stored token not usable: {}", e);
                self.ctx.reset();
                None
            }
        }
    }

    /// Re-fetch the profile of an authenticated session.
    pub async fn refresh_profile(&self) -> Result<UserProfile, ClientError> {
        if !self.ctx.is_authenticated() {
            return Err(ClientError::Unauthorized);
        }
        let user: UserProfile = self.gateway.get(ME_PATH).await?;
        self.ctx.update_user(user.clone());
        Ok(user)
    }

    /// Commit an attempt started at `epoch`. False when a logout or 401 got there first.
    fn authenticated(&self, epoch: u64, user: UserProfile) -> bool {
        if !self.ctx.set_authenticated_if(epoch, user) {
            return false;
        }
        if let Some(channel) = &self.channel {
            match channel.open() {
                Ok(()) | Err(ClientError::AlreadyConnected) => {}
                Err(e) => log::warn!("could not open realtime channel: {}", e),
            }
        }
        if self.ctx.snapshot().token_version != epoch {
            return false;
        }
        self.navigator.navigate(Route::Protected);
        true
    }
}
