//! Access token holder.
//!
//! [`TokenStore`] is the only place the bearer token lives. It mirrors the
//! token to a file (the well-known local key) so a later process can restore
//! the session. Writers are crate-private; see [`crate::session::SessionContext`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Opaque bearer token. Expiry is learned only from a 401, never decoded.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Current access token plus optional file persistence.
pub struct TokenStore {
    current: Mutex<Option<Token>>,
    path: Option<PathBuf>,
}

impl TokenStore {
    /// In-memory store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            current: Mutex::new(None),
            path: None,
        }
    }

    /// Store backed by `path`; loads the persisted token if the file exists and is non-empty.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let current = std::fs::read_to_string(&path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(Token);
        if current.is_some() {
            log::debug!("loaded persisted token from {}", path.display());
        }
        Self {
            current: Mutex::new(current),
            path: Some(path),
        }
    }

    pub fn get(&self) -> Option<Token> {
        self.lock().clone()
    }

    pub fn is_present(&self) -> bool {
        self.lock().is_some()
    }

    pub(crate) fn replace(&self, token: Token) {
        if let Some(path) = &self.path {
            if let Err(e) = persist(path, token.as_str()) {
                log::warn!("failed to persist token to {}: {}", path.display(), e);
            }
        }
        *self.lock() = Some(token);
    }

    /// Clear the token. Returns true if one was present.
    pub(crate) fn clear(&self) -> bool {
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("failed to remove token file {}: {}", path.display(), e),
            }
        }
        self.lock().take().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Token>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn persist(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, token)
}
