//! Source adapter contracts and the validated intake boundary for directory payloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use roster_core::RawDirectoryEntry;
use roster_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "roster-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("unexpected payload shape: {0}")]
    Payload(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Supplier of raw directory entries. A listing failure is fatal to the run.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn list_entries(&self) -> Result<Vec<RawDirectoryEntry>, AdapterError>;
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

fn first_text(value: &JsonValue, paths: &[&[&str]]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| json_str(value, path).and_then(text_or_none))
}

/// Maps one loosely-typed directory object onto the fixed entry shape.
///
/// Returns `None` for anything that is not a JSON object.
pub fn entry_from_json(value: &JsonValue) -> Option<RawDirectoryEntry> {
    if !value.is_object() {
        return None;
    }
    Some(RawDirectoryEntry {
        name: first_text(value, &[&["name"], &["displayName"], &["display_name"], &["real_name"]]),
        email: first_text(value, &[&["email"], &["mail"]]),
        title: first_text(value, &[&["title"], &["jobTitle"]]),
        image_ref: first_text(
            value,
            &[&["imageRef"], &["image_ref"], &["image"], &["avatar"], &["picture"]],
        ),
    })
}

/// Accepts either a bare array of entries or an object wrapping one under
/// `members`, `entries` or `users`.
pub fn parse_directory_document(document: &JsonValue) -> Result<Vec<RawDirectoryEntry>, AdapterError> {
    let items = match document {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => ["members", "entries", "users"]
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
            .ok_or_else(|| {
                AdapterError::Payload("expected an array under members, entries or users".into())
            })?,
        _ => {
            return Err(AdapterError::Payload(
                "directory document must be an array or object".into(),
            ))
        }
    };

    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match entry_from_json(item) {
            Some(entry) => entries.push(entry),
            None => warn!(index, "skipping non-object directory item"),
        }
    }
    Ok(entries)
}

/// Directory exported to a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for JsonFileSource {
    fn source_id(&self) -> &'static str {
        "json-file"
    }

    async fn list_entries(&self) -> Result<Vec<RawDirectoryEntry>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let document: JsonValue = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        parse_directory_document(&document)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsersPage {
    pub entries: Vec<RawDirectoryEntry>,
    pub next_cursor: Option<String>,
}

/// Parses one `users.list` page of a chat workspace, dropping deleted and bot accounts.
pub fn parse_users_page(page: &JsonValue) -> Result<UsersPage, AdapterError> {
    if page.get("ok").and_then(JsonValue::as_bool) != Some(true) {
        let error = json_str(page, &["error"]).unwrap_or("unknown_error");
        return Err(AdapterError::Message(format!("users.list failed: {error}")));
    }
    let members = page
        .get("members")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Payload("users.list response without members".into()))?;

    let mut entries = Vec::with_capacity(members.len());
    for member in members {
        let flag = |key: &str| member.get(key).and_then(JsonValue::as_bool).unwrap_or(false);
        if flag("deleted") || flag("is_bot") || json_str(member, &["id"]) == Some("USLACKBOT") {
            continue;
        }
        entries.push(RawDirectoryEntry {
            name: first_text(
                member,
                &[&["profile", "real_name"], &["real_name"], &["profile", "display_name"]],
            ),
            email: first_text(member, &[&["profile", "email"]]),
            title: first_text(member, &[&["profile", "title"]]),
            image_ref: first_text(
                member,
                &[
                    &["profile", "image_original"],
                    &["profile", "image_512"],
                    &["profile", "image_192"],
                    &["profile", "image_72"],
                ],
            ),
        });
    }

    let next_cursor = json_str(page, &["response_metadata", "next_cursor"]).and_then(text_or_none);
    Ok(UsersPage {
        entries,
        next_cursor,
    })
}

const MAX_USER_PAGES: usize = 500;

/// Team-chat workspace member directory, read through the paginated `users.list` API.
#[derive(Debug, Clone)]
pub struct ChatWorkspaceSource {
    api_base: String,
    token: String,
    page_size: u32,
    http: Arc<HttpFetcher>,
}

impl ChatWorkspaceSource {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            api_base: api_base.into(),
            token: token.into(),
            page_size: 200,
            http,
        }
    }

    fn page_url(&self, cursor: Option<&str>) -> Result<Url, AdapterError> {
        let base = format!("{}/users.list", self.api_base.trim_end_matches('/'));
        let limit = self.page_size.to_string();
        let mut params = vec![("limit", limit.as_str())];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor));
        }
        Url::parse_with_params(&base, &params)
            .map_err(|e| AdapterError::Message(format!("invalid workspace api url {base}: {e}")))
    }
}

#[async_trait]
impl SourceAdapter for ChatWorkspaceSource {
    fn source_id(&self) -> &'static str {
        "chat-workspace"
    }

    async fn list_entries(&self) -> Result<Vec<RawDirectoryEntry>, AdapterError> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;

        for page_no in 0..MAX_USER_PAGES {
            let url = self.page_url(cursor.as_deref())?;
            let body = self
                .http
                .fetch_json_authorized(url.as_str(), &self.token)
                .await?;
            let page = parse_users_page(&body)?;
            debug!(page_no, members = page.entries.len(), "fetched users.list page");
            entries.extend(page.entries);

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => return Ok(entries),
            }
        }

        Err(AdapterError::Message(format!(
            "users.list pagination exceeded {MAX_USER_PAGES} pages"
        )))
    }
}
