//! GitHub Gist transport for the shared document.
//!
//! The document is the `bookmarks.json` file of one gist. A missing gist or
//! a gist without that file reads as "no document yet". Creating the
//! document adds the file to the configured gist.
//!
//! A gist id is required unless gist creation was explicitly allowed. Then a
//! replica without an id, or whose gist is gone, creates a new gist and adopts
//! its id for the rest of the process.

use async_trait::async_trait;
use bookmark_sync_core::remote::{RemoteError, RemoteStore, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Name of the gist file holding the document.
pub const DOCUMENT_FILE: &str = "bookmarks.json";

const DESCRIPTION: &str = "Bookmark sync document";
const ACCEPT: &str = "application/vnd.github.v3+json";
const USER_AGENT: &str = concat!("bookmark-sync/", env!("CARGO_PKG_VERSION"));
const TIMEOUT: Duration = Duration::from_secs(30);

/// One file of a gist.
///
/// Files over 1 MB come back `truncated` with partial `content`; the full
/// text is at `raw_url`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GistFile {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_url: Option<String>,
}

/// The subset of the gist resource this crate reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gist {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, GistFile>,
}

/// Body of a create or update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GistWrite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,
    pub files: BTreeMap<String, GistFile>,
}

impl GistWrite {
    fn document(content: &str, public: Option<bool>) -> Self {
        let mut files = BTreeMap::new();
        files.insert(
            DOCUMENT_FILE.to_string(),
            GistFile {
                content: Some(content.to_string()),
                ..GistFile::default()
            },
        );
        Self {
            description: Some(DESCRIPTION.to_string()),
            public,
            files,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

fn network(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

async fn error_for(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    RemoteError::Http { status, message }
}

pub struct GistStore {
    client: Client,
    api_url: String,
    token: Option<String>,
    gist_id: RwLock<Option<String>>,
    create_allowed: bool,
}

impl GistStore {
    pub fn new(api_url: &str, token: Option<String>, gist_id: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(TIMEOUT)
            .build()
            .map_err(network)?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            gist_id: RwLock::new(gist_id),
            create_allowed: false,
        })
    }

    /// Allow creating a new gist when none is configured or it is gone.
    pub fn with_gist_creation(mut self, allowed: bool) -> Self {
        self.create_allowed = allowed;
        self
    }

    /// The gist in use, including one adopted after a create.
    pub fn gist_id(&self) -> Option<String> {
        self.gist_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_gist_id(&self, id: String) {
        *self.gist_id.write().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.api_url, path))
            .header(reqwest::header::ACCEPT, ACCEPT);
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {}", token));
        }
        request
    }

    async fn parse_gist(response: Response) -> Result<Gist> {
        response
            .json::<Gist>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn file_content(&self, file: GistFile) -> Result<Option<String>> {
        match file.raw_url {
            Some(raw_url) if file.truncated => {
                debug!("Document truncated in gist response, fetching {}", raw_url);
                let mut request = self.client.get(&raw_url);
                if let Some(token) = &self.token {
                    request =
                        request.header(reqwest::header::AUTHORIZATION, format!("token {}", token));
                }
                let response = request.send().await.map_err(network)?;
                if !response.status().is_success() {
                    return Err(error_for(response).await);
                }
                response.text().await.map(Some).map_err(network)
            }
            _ => Ok(file.content),
        }
    }

    async fn patch(&self, id: &str, content: &str) -> Result<Response> {
        self.request(Method::PATCH, &format!("/gists/{}", id))
            .json(&GistWrite::document(content, None))
            .send()
            .await
            .map_err(network)
    }

    async fn post(&self, content: &str) -> Result<()> {
        let response = self
            .request(Method::POST, "/gists")
            .json(&GistWrite::document(content, Some(false)))
            .send()
            .await
            .map_err(network)?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        let gist = Self::parse_gist(response).await?;
        info!("Created gist {}", gist.id);
        self.set_gist_id(gist.id);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for GistStore {
    fn check_configured(&self) -> Result<()> {
        match &self.token {
            Some(token) if !token.is_empty() => {}
            _ => return Err(RemoteError::NotConfigured("no GitHub token set".into())),
        }
        if self.gist_id().is_none() && !self.create_allowed {
            return Err(RemoteError::NotConfigured(
                "no gist id set (pass --create-gist to create one)".into(),
            ));
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<String>> {
        let Some(id) = self.gist_id() else {
            debug!("No gist configured yet");
            return Ok(None);
        };
        let response = self
            .request(Method::GET, &format!("/gists/{}", id))
            .send()
            .await
            .map_err(network)?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Gist {} not found", id);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let mut gist = Self::parse_gist(response).await?;
        match gist.files.remove(DOCUMENT_FILE) {
            Some(file) => self.file_content(file).await,
            None => Ok(None),
        }
    }

    async fn create(&self, content: &str) -> Result<()> {
        if let Some(id) = self.gist_id() {
            let response = self.patch(&id, content).await?;
            if response.status().is_success() {
                return Ok(());
            }
            if response.status() != StatusCode::NOT_FOUND || !self.create_allowed {
                return Err(error_for(response).await);
            }
            info!("Gist {} no longer exists, creating a new one", id);
        } else if !self.create_allowed {
            return Err(RemoteError::NotConfigured("no gist id set".into()));
        }
        self.post(content).await
    }

    async fn update(&self, content: &str) -> Result<()> {
        let id = self
            .gist_id()
            .ok_or_else(|| RemoteError::NotConfigured("no gist id".into()))?;
        let response = self.patch(&id, content).await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        Ok(())
    }
}
