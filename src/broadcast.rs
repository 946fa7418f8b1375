//! Broadcast feed client.
//!
//! Operator broadcasts live in a versioned gist-style document plus its
//! comment feed. The [`BroadcastFeed`] trait hides the host specifics from
//! the digest poller: it hands back the raw descriptor content (for payload
//! parsing and content-hash dedup) and pre-filtered comment entries.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::client::UpstreamError;

const API_VERSION: &str = "2022-11-28";

/// Raw descriptor document: the payload text plus the host's own revision
/// timestamp, used for the fallback dedup key.
#[derive(Debug, Clone)]
pub struct DescriptorFetch {
    pub content: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommentEntry {
    pub id: Option<i64>,
    pub author_id: Option<i64>,
    /// Whether the feed host attributes the comment to the document owner.
    pub owner: bool,
    pub body: Option<String>,
}

#[async_trait]
pub trait BroadcastFeed: Send + Sync {
    async fn fetch_descriptor(&self) -> Result<Option<DescriptorFetch>, UpstreamError>;

    async fn fetch_comments(&self) -> Result<Vec<CommentEntry>, UpstreamError>;
}

// ─────────────────────────────────────────────────────────
// Gist-backed implementation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GistDoc {
    // BTreeMap keeps file selection deterministic
    #[serde(default)]
    files: BTreeMap<String, GistFile>,
    #[serde(rename = "updated_at", default)]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GistFile {
    #[serde(default)]
    language: Option<String>,
    #[serde(rename = "raw_url", default)]
    raw_url: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GistUser {
    #[serde(default)]
    id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GistComment {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    user: Option<GistUser>,
    #[serde(rename = "author_association", default)]
    author_association: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

pub struct GistFeed {
    http: reqwest::Client,
    api_base: String,
    doc_id: String,
    preferred_file: String,
}

impl GistFeed {
    pub fn new(doc_id: &str, preferred_file: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sellwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_base: "https://api.github.com".to_string(),
            doc_id: doc_id.to_string(),
            preferred_file: preferred_file.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, UpstreamError> {
        let url = format!("{}{}", self.api_base, path);
        let resp = self
            .http
            .get(&url)
            .header("X-GitHub-Api-Version", API_VERSION)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status(resp.status()));
        }
        Ok(resp.json::<T>().await?)
    }

    /// Pick the descriptor file: the preferred name, else the first
    /// JSON-looking file, else whatever comes first.
    fn pick_file<'a>(&self, files: &'a BTreeMap<String, GistFile>) -> Option<&'a GistFile> {
        if let Some(file) = files.get(&self.preferred_file) {
            return Some(file);
        }
        files
            .iter()
            .find(|(name, file)| {
                file.language
                    .as_deref()
                    .is_some_and(|l| l.eq_ignore_ascii_case("json"))
                    || name.to_lowercase().ends_with(".json")
            })
            .map(|(_, file)| file)
            .or_else(|| files.values().next())
    }
}

#[async_trait]
impl BroadcastFeed for GistFeed {
    async fn fetch_descriptor(&self) -> Result<Option<DescriptorFetch>, UpstreamError> {
        let doc: GistDoc = self.get_json(&format!("/gists/{}", self.doc_id)).await?;
        let Some(file) = self.pick_file(&doc.files) else {
            return Ok(None);
        };

        // Prefer the raw URL; inline content may be truncated by the host.
        let mut content: Option<String> = None;
        if let Some(raw_url) = file.raw_url.as_deref().filter(|u| !u.trim().is_empty()) {
            if let Ok(resp) = self.http.get(raw_url).send().await {
                if resp.status().is_success() {
                    content = resp.text().await.ok();
                }
            }
        }
        let content = content
            .filter(|c| !c.trim().is_empty())
            .or_else(|| {
                file.content
                    .clone()
                    .filter(|c| !c.trim().is_empty())
            });
        Ok(content.map(|content| DescriptorFetch {
            content,
            updated_at: doc.updated_at.clone(),
        }))
    }

    async fn fetch_comments(&self) -> Result<Vec<CommentEntry>, UpstreamError> {
        let comments: Vec<GistComment> = self
            .get_json(&format!("/gists/{}/comments", self.doc_id))
            .await?;
        Ok(comments
            .into_iter()
            .map(|c| CommentEntry {
                id: c.id,
                author_id: c.user.and_then(|u| u.id),
                owner: c
                    .author_association
                    .as_deref()
                    .is_some_and(|a| a.trim().eq_ignore_ascii_case("owner")),
                body: c.body,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> GistFeed {
        GistFeed::new("doc", "broadcast.json", Duration::from_secs(5)).unwrap()
    }

    fn file(language: Option<&str>, content: &str) -> GistFile {
        GistFile {
            language: language.map(str::to_string),
            raw_url: None,
            content: Some(content.to_string()),
        }
    }

    #[test]
    fn preferred_file_wins() {
        let mut files = BTreeMap::new();
        files.insert("a.txt".to_string(), file(None, "a"));
        files.insert("broadcast.json".to_string(), file(Some("JSON"), "b"));
        let picked = feed().pick_file(&files).unwrap();
        assert_eq!(picked.content.as_deref(), Some("b"));
    }

    #[test]
    fn falls_back_to_json_looking_file() {
        let mut files = BTreeMap::new();
        files.insert("notes.txt".to_string(), file(None, "a"));
        files.insert("payload.JSON".to_string(), file(None, "b"));
        let picked = feed().pick_file(&files).unwrap();
        assert_eq!(picked.content.as_deref(), Some("b"));
    }

    #[test]
    fn any_file_beats_none() {
        let mut files = BTreeMap::new();
        files.insert("notes.txt".to_string(), file(None, "a"));
        assert!(feed().pick_file(&files).is_some());
        assert!(feed().pick_file(&BTreeMap::new()).is_none());
    }
}
