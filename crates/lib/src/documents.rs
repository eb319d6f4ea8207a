//! Document list cache, uploads, deletes and one-shot queries.
//!
//! The list is a read-through cache keyed by the signed-in user. Successful
//! uploads and deletes bump a generation counter and drop the cache; queries
//! never do. Subscribers to [`DocumentOperationCoordinator::invalidations`]
//! refresh on the bump.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{Config, QueryRoute};
use crate::error::ClientError;
use crate::gateway::{RequestGateway, UploadFile};
use crate::models::{Document, DocumentListBody, DocumentType, QueryAnswer, QueryMethod};
use crate::realtime::{ClientEvent, EventSink, ServerEvent};
use crate::retry::RetryPolicy;
use crate::session::SessionContext;

const DOCUMENTS_PATH: &str = "/api/documents";
const UPLOAD_PATH: &str = "/api/documents/upload";

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Pending,
    Success(Document),
    Error(ClientError),
}

/// Progress of one file upload. Terminal once `outcome` is not `Pending`.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    pub file_id: Uuid,
    pub file_name: String,
    pub document_type: DocumentType,
    /// 0..=100
    pub progress: u8,
    pub outcome: UploadOutcome,
}

impl UploadTask {
    fn new(file: &UploadFile, document_type: DocumentType) -> Self {
        Self {
            file_id: file.id,
            file_name: file.file_name.clone(),
            document_type,
            progress: 0,
            outcome: UploadOutcome::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.outcome, UploadOutcome::Pending)
    }

    pub fn into_result(self) -> Result<Document, ClientError> {
        match self.outcome {
            UploadOutcome::Success(doc) => Ok(doc),
            UploadOutcome::Error(e) => Err(e),
            UploadOutcome::Pending => Err(ClientError::AlreadyInProgress),
        }
    }
}

struct CachedList {
    user_id: String,
    documents: Arc<Vec<Document>>,
}

/// Releases a file's single-flight slot.
struct UploadClaim<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for UploadClaim<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

pub struct DocumentOperationCoordinator {
    ctx: SessionContext,
    gateway: RequestGateway,
    events: Option<Arc<dyn EventSink>>,
    query_route: QueryRoute,
    max_file_size: u64,
    cache: Mutex<Option<CachedList>>,
    generation: watch::Sender<u64>,
    uploading: Mutex<HashSet<Uuid>>,
}

impl DocumentOperationCoordinator {
    pub fn new(ctx: SessionContext, gateway: RequestGateway, config: &Config) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            ctx,
            gateway,
            events: None,
            query_route: config.api.query_route,
            max_file_size: config.uploads.max_file_size,
            cache: Mutex::new(None),
            generation,
            uploading: Mutex::new(HashSet::new()),
        }
    }

    /// Announce successful uploads on this sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Cache generation; bumped on every invalidation.
    pub fn invalidations(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Cached list for the current user, if any.
    pub fn cached(&self) -> Option<Arc<Vec<Document>>> {
        let user_id = self.ctx.user()?.id;
        lock(&self.cache)
            .as_ref()
            .filter(|c| c.user_id == user_id)
            .map(|c| Arc::clone(&c.documents))
    }

    pub fn invalidate(&self) {
        *lock(&self.cache) = None;
        self.generation.send_modify(|g| *g += 1);
    }

    /// Documents of the signed-in user, from cache when fresh.
    pub async fn list(&self, policy: &RetryPolicy) -> Result<Arc<Vec<Document>>, ClientError> {
        if let Some(docs) = self.cached() {
            return Ok(docs);
        }
        let started_at = self.generation();
        let body: DocumentListBody = policy
            .run(|| self.gateway.get(DOCUMENTS_PATH))
            .await?;
        let documents = Arc::new(body.into_documents());
        // don't cache a list that an upload/delete raced past
        if let Some(user) = self.ctx.user() {
            if self.generation() == started_at {
                *lock(&self.cache) = Some(CachedList {
                    user_id: user.id,
                    documents: Arc::clone(&documents),
                });
            }
        }
        Ok(documents)
    }

    pub async fn get(&self, id: &str, policy: &RetryPolicy) -> Result<Document, ClientError> {
        let path = format!("{}/{}", DOCUMENTS_PATH, id);
        policy.run(|| self.gateway.get(&path)).await
    }

    /// Upload one file. Never retried; the returned task is terminal.
    ///
    /// `on_progress` sees the task at 0 (submitted), 50 (in flight) and on
    /// completion. `document_type` defaults to detection from the file.
    pub async fn upload<F>(
        &self,
        file: &UploadFile,
        document_type: Option<DocumentType>,
        mut on_progress: F,
    ) -> UploadTask
    where
        F: FnMut(&UploadTask),
    {
        let document_type = document_type.unwrap_or_else(|| file.detect_type());
        let mut task = UploadTask::new(file, document_type);
        on_progress(&task);

        let Some(_claim) = self.claim(file.id) else {
            task.outcome = UploadOutcome::Error(ClientError::AlreadyInProgress);
            on_progress(&task);
            return task;
        };

        if file.size() > self.max_file_size {
            log::warn!(
                "{} is {} bytes, over the {} byte limit",
                file.file_name,
                file.size(),
                self.max_file_size
            );
            task.outcome = UploadOutcome::Error(ClientError::PayloadTooLarge {
                size: file.size(),
                limit: Some(self.max_file_size),
            });
            on_progress(&task);
            return task;
        }

        task.progress = 50;
        on_progress(&task);

        match self
            .gateway
            .upload::<Document>(UPLOAD_PATH, file, document_type)
            .await
        {
            Ok(doc) => {
                log::info!("uploaded {} as document {}", file.file_name, doc.id);
                task.progress = 100;
                task.outcome = UploadOutcome::Success(doc.clone());
                self.invalidate();
                self.announce(&doc);
            }
            Err(e) => {
                log::warn!("upload of {} failed: {}", file.file_name, e);
                task.outcome = UploadOutcome::Error(e);
            }
        }
        on_progress(&task);
        task
    }

    /// Delete a document. Non-admins may only delete documents they own.
    pub async fn delete(&self, id: &str) -> Result<(), ClientError> {
        self.check_delete_permission(id)?;
        self.gateway
            .delete(&format!("{}/{}", DOCUMENTS_PATH, id))
            .await?;
        self.invalidate();
        Ok(())
    }

    /// One-shot question against a document. Does not touch the cache.
    pub async fn query(
        &self,
        document_id: &str,
        text: &str,
        method: QueryMethod,
        policy: &RetryPolicy,
    ) -> Result<QueryAnswer, ClientError> {
        let (path, body) = match self.query_route {
            QueryRoute::Documents => (
                format!("{}/{}/query", DOCUMENTS_PATH, document_id),
                json!({ "query": text, "method": method }),
            ),
            QueryRoute::Ai => (
                format!("/api/ai/query/{}", document_id),
                json!({ "question": text, "method": method }),
            ),
        };
        policy.run(|| self.gateway.post_json(&path, &body)).await
    }

    /// Invalidate on server-side document changes. Returns true if the event was relevant.
    pub fn observe(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::DocumentUpload { .. } | ServerEvent::ProcessingUpdate { .. } => {
                self.invalidate();
                true
            }
            _ => false,
        }
    }

    fn check_delete_permission(&self, id: &str) -> Result<(), ClientError> {
        let Some(user) = self.ctx.user() else {
            return Ok(());
        };
        if user.is_admin() {
            return Ok(());
        }
        let owner = self.cached().and_then(|docs| {
            docs.iter()
                .find(|d| d.id == id)
                .and_then(|d| d.owner_id.clone())
        });
        match owner {
            Some(owner) if owner != user.id => Err(ClientError::Forbidden(format!(
                "document {} belongs to another user",
                id
            ))),
            _ => Ok(()),
        }
    }

    fn claim(&self, id: Uuid) -> Option<UploadClaim<'_>> {
        if lock(&self.uploading).insert(id) {
            Some(UploadClaim {
                set: &self.uploading,
                id,
            })
        } else {
            None
        }
    }

    fn announce(&self, doc: &Document) {
        if let Some(events) = &self.events {
            let sent = events.send(ClientEvent::DocumentUpload {
                document_id: doc.id.clone(),
            });
            if !sent {
                log::debug!("document_upload for {} not announced (channel closed)", doc.id);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentStatus, UserProfile, UserRole};
    use crate::token::{Token, TokenStore};

    fn user(id: &str, role: UserRole) -> UserProfile {
        UserProfile {
            id: id.into(),
            username: None,
            email: format!("{}@example.com", id),
            full_name: None,
            role,
        }
    }

    fn doc(id: &str, owner: &str) -> Document {
        Document {
            id: id.into(),
            title: format!("{}.pdf", id),
            content_type: "pdf".into(),
            status: DocumentStatus::Completed,
            created_at: None,
            owner_id: Some(owner.into()),
            metadata: None,
        }
    }

    fn coordinator(max_file_size: u64) -> DocumentOperationCoordinator {
        let ctx = SessionContext::new(TokenStore::in_memory());
        let gateway = RequestGateway::new("http://127.0.0.1:9", ctx.clone());
        let mut config = Config::default();
        config.uploads.max_file_size = max_file_size;
        DocumentOperationCoordinator::new(ctx, gateway, &config)
    }

    fn sign_in(c: &DocumentOperationCoordinator, profile: UserProfile) {
        c.ctx.begin_authenticating(Token::new("t"));
        c.ctx.set_authenticated(profile);
    }

    #[tokio::test]
    async fn oversized_file_fails_locally_without_invalidating() {
        let c = coordinator(50);
        let file = UploadFile::new("big.pdf", None, vec![0; 60]);
        let mut seen = Vec::new();
        let task = c
            .upload(&file, None, |t| seen.push((t.progress, t.is_terminal())))
            .await;
        assert_eq!(
            task.outcome,
            UploadOutcome::Error(ClientError::PayloadTooLarge {
                size: 60,
                limit: Some(50)
            })
        );
        assert_eq!(seen, vec![(0, false), (0, true)]);
        assert_eq!(c.generation(), 0);
    }

    #[tokio::test]
    async fn same_file_cannot_upload_twice_at_once() {
        let c = coordinator(1024);
        let file = UploadFile::new("a.txt", None, vec![1]);
        let _held = c.claim(file.id).unwrap();
        let task = c.upload(&file, None, |_| {}).await;
        assert_eq!(task.into_result(), Err(ClientError::AlreadyInProgress));
    }

    #[test]
    fn claim_is_released_on_drop() {
        let c = coordinator(1024);
        let id = Uuid::new_v4();
        drop(c.claim(id).unwrap());
        assert!(c.claim(id).is_some());
    }

    #[test]
    fn delete_guard_checks_owner_unless_admin() {
        let c = coordinator(1024);
        sign_in(&c, user("u1", UserRole::Standard));
        *lock(&c.cache) = Some(CachedList {
            user_id: "u1".into(),
            documents: Arc::new(vec![doc("mine", "u1"), doc("theirs", "u2")]),
        });
        assert!(c.check_delete_permission("mine").is_ok());
        assert!(matches!(
            c.check_delete_permission("theirs"),
            Err(ClientError::Forbidden(_))
        ));
        // not in cache: backend decides
        assert!(c.check_delete_permission("unknown").is_ok());

        c.ctx.update_user(user("u1", UserRole::Admin));
        assert!(c.check_delete_permission("theirs").is_ok());
    }

    #[test]
    fn cache_is_keyed_by_user() {
        let c = coordinator(1024);
        sign_in(&c, user("u1", UserRole::Standard));
        *lock(&c.cache) = Some(CachedList {
            user_id: "u1".into(),
            documents: Arc::new(vec![doc("a", "u1")]),
        });
        assert!(c.cached().is_some());
        c.ctx.update_user(user("u2", UserRole::Standard));
        assert!(c.cached().is_none());
    }

    #[test]
    fn processing_events_invalidate_but_chat_does_not() {
        let c = coordinator(1024);
        let mut rx = c.invalidations();
        assert!(c.observe(&ServerEvent::ProcessingUpdate {
            document_id: Some("1".into()),
            status: Some("completed".into()),
            progress: Some(100.0),
            message: None,
        }));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        assert!(!c.observe(&ServerEvent::ChatPartial {
            content: "x".into(),
            document_id: None,
        }));
        assert_eq!(c.generation(), 1);
    }
}
