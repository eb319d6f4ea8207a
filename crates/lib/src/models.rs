//! REST wire types consumed from the backend.
//!
//! Ids arrive as integers (documents) or UUID strings (users) and are kept as
//! strings. Timestamps without an offset are read as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// `POST /api/auth/login` response.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    /// Any non-admin role (`"user"`, `"standard"`, ...).
    #[serde(other)]
    Standard,
}

/// Canonical user profile (`GET /api/auth/me`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: UserRole,
}

fn default_role() -> UserRole {
    UserRole::Standard
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Best human-facing name: username, then full name, then email.
    pub fn display_name(&self) -> &str {
        self.username
            .as_deref()
            .or(self.full_name.as_deref())
            .unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content_type: String,
    pub status: DocumentStatus,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "user_id",
        deserialize_with = "optional_id_string"
    )]
    pub owner_id: Option<String>,
    #[serde(default, alias = "doc_metadata")]
    pub metadata: Option<serde_json::Value>,
}

/// `GET /api/documents` body: `{ data, total }` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum DocumentListBody {
    Wrapped { data: Vec<Document> },
    Bare(Vec<Document>),
}

impl DocumentListBody {
    pub(crate) fn into_documents(self) -> Vec<Document> {
        match self {
            DocumentListBody::Wrapped { data } => data,
            DocumentListBody::Bare(docs) => docs,
        }
    }
}

/// Upload classification tag sent as `document_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Txt,
    Csv,
    Docx,
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Txt => "txt",
            DocumentType::Csv => "csv",
            DocumentType::Docx => "docx",
            DocumentType::Unknown => "unknown",
        }
    }

    /// Classify by MIME type first, then file extension. Undetected content is `Unknown`.
    pub fn detect(content_type: Option<&str>, file_name: &str) -> Self {
        if let Some(ct) = content_type {
            let ct = ct.to_ascii_lowercase();
            if ct.contains("pdf") {
                return DocumentType::Pdf;
            }
            if ct.contains("text/plain") {
                return DocumentType::Txt;
            }
            if ct.contains("csv") {
                return DocumentType::Csv;
            }
            if ct.contains("wordprocessingml") {
                return DocumentType::Docx;
            }
        }
        let ext = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("pdf") => DocumentType::Pdf,
            Some("txt") | Some("md") => DocumentType::Txt,
            Some("csv") => DocumentType::Csv,
            Some("docx") => DocumentType::Docx,
            _ => DocumentType::Unknown,
        }
    }

    /// MIME type sent with the multipart file part.
    pub fn mime(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "application/pdf",
            DocumentType::Txt => "text/plain",
            DocumentType::Csv => "text/csv",
            DocumentType::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            DocumentType::Unknown => "application/octet-stream",
        }
    }
}

impl std::str::FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(DocumentType::Pdf),
            "txt" | "text" => Ok(DocumentType::Txt),
            "csv" => Ok(DocumentType::Csv),
            "docx" => Ok(DocumentType::Docx),
            "unknown" => Ok(DocumentType::Unknown),
            other => Err(format!("unknown document type: {}", other)),
        }
    }
}

/// One-shot query method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMethod {
    #[default]
    Rag,
    Graph,
}

impl std::str::FromStr for QueryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rag" | "traditional" => Ok(QueryMethod::Rag),
            "graph" => Ok(QueryMethod::Graph),
            other => Err(format!("unknown query method: {}", other)),
        }
    }
}

/// Answer from either query route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    #[serde(alias = "result")]
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
    #[serde(default)]
    pub context_chunks: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Int(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Str(s) => s,
            RawId::Int(n) => n.to_string(),
        }
    }
}

fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    RawId::deserialize(d).map(String::from)
}

pub(crate) fn optional_id_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(String::from))
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let Some(raw) = Option::<String>::deserialize(d)? else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|n| Some(n.and_utc()))
        .map_err(serde::de::Error::custom)
}
