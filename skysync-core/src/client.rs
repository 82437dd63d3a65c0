use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::metadata::{
    FileMetadata, FolderMetadata, ListFolderPage, LongpollResult, Metadata, WriteMode,
};
use crate::remote::RemoteClient;

const DEFAULT_BASE_URL: &str = "https://api.skysync.example";
const API_ARG_HEADER: &str = "Api-Arg";
const API_RESULT_HEADER: &str = "Api-Result";
const LONGPOLL_GRACE: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {summary}")]
    Api {
        status: StatusCode,
        summary: String,
        retry_after: Option<u64>,
    },
    #[error("api response missing {0} header")]
    MissingResult(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Conflict,
    QuotaExceeded,
    Permanent,
}

impl RemoteError {
    pub fn api(status: StatusCode, summary: impl Into<String>) -> Self {
        RemoteError::Api {
            status,
            summary: summary.into(),
            retry_after: None,
        }
    }

    pub fn classification(&self) -> ApiErrorClass {
        match self {
            RemoteError::Api {
                status, summary, ..
            } => classify_api_status(*status, summary),
            RemoteError::Request(_) => ApiErrorClass::Transient,
            RemoteError::Url(_) | RemoteError::Json(_) | RemoteError::MissingResult(_) => {
                ApiErrorClass::Permanent
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RemoteError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode, summary: &str) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::INSUFFICIENT_STORAGE {
        ApiErrorClass::QuotaExceeded
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::CONFLICT {
        // Endpoint errors are reported as 409 with a path-style summary.
        if summary.contains("not_found") {
            ApiErrorClass::NotFound
        } else if summary.contains("insufficient_space") {
            ApiErrorClass::QuotaExceeded
        } else if summary.contains("conflict") {
            ApiErrorClass::Conflict
        } else {
            ApiErrorClass::Permanent
        }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Clone)]
pub struct HttpRemoteClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpRemoteClient {
    pub fn new(token: impl Into<String>) -> Result<Self, RemoteError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn rpc<A, T>(&self, path: &str, arg: &A) -> Result<T, RemoteError>
    where
        A: Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .header("Authorization", self.auth_header_value())
            .json(arg)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let summary = serde_json::from_str::<ErrorBody>(&body)
            .map(|parsed| parsed.error_summary)
            .unwrap_or(body);
        Err(RemoteError::Api {
            status,
            summary,
            retry_after,
        })
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<ListFolderPage, RemoteError> {
        let path = api_path(path);
        self.rpc(
            "/2/files/list_folder",
            &json!({ "path": path, "recursive": recursive }),
        )
        .await
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderPage, RemoteError> {
        self.rpc("/2/files/list_folder/continue", &json!({ "cursor": cursor }))
            .await
    }

    async fn wait_for_changes(
        &self,
        cursor: &str,
        timeout: Duration,
    ) -> Result<LongpollResult, RemoteError> {
        let response = self
            .http
            .post(self.endpoint("/2/files/list_folder/longpoll")?)
            .timeout(timeout + LONGPOLL_GRACE)
            .json(&json!({ "cursor": cursor, "timeout": timeout.as_secs().max(30) }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<Metadata>, RemoteError> {
        match self
            .rpc::<_, Metadata>("/2/files/get_metadata", &json!({ "path": api_path(path) }))
            .await
        {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) if err.classification() == ApiErrorClass::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn download(&self, path: &str) -> Result<(FileMetadata, Vec<u8>), RemoteError> {
        let response = self
            .http
            .post(self.endpoint("/2/files/download")?)
            .header("Authorization", self.auth_header_value())
            .header(API_ARG_HEADER, header_safe_json(&json!({ "path": path }))?)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let metadata = response
            .headers()
            .get(API_RESULT_HEADER)
            .ok_or(RemoteError::MissingResult(API_RESULT_HEADER))?
            .as_bytes()
            .to_vec();
        let metadata: FileMetadata = serde_json::from_slice(&metadata)?;
        let content = response.bytes().await?.to_vec();
        Ok((metadata, content))
    }

    async fn upload(
        &self,
        path: &str,
        content: Vec<u8>,
        mode: WriteMode,
        autorename: bool,
    ) -> Result<FileMetadata, RemoteError> {
        let arg = UploadArg {
            path,
            mode: WireWriteMode::from(&mode),
            autorename,
        };
        let response = self
            .http
            .post(self.endpoint("/2/files/upload")?)
            .header("Authorization", self.auth_header_value())
            .header(API_ARG_HEADER, header_safe_json(&arg)?)
            .header("Content-Type", "application/octet-stream")
            .body(content)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata, RemoteError> {
        let result: MetadataResult<FolderMetadata> = self
            .rpc(
                "/2/files/create_folder_v2",
                &json!({ "path": path, "autorename": false }),
            )
            .await?;
        Ok(result.metadata)
    }

    async fn delete(&self, path: &str, parent_rev: Option<&str>) -> Result<Metadata, RemoteError> {
        let result: MetadataResult<Metadata> = self
            .rpc(
                "/2/files/delete_v2",
                &json!({ "path": path, "parent_rev": parent_rev }),
            )
            .await?;
        Ok(result.metadata)
    }

    async fn move_item(
        &self,
        from: &str,
        to: &str,
        autorename: bool,
    ) -> Result<Metadata, RemoteError> {
        let result: MetadataResult<Metadata> = self
            .rpc(
                "/2/files/move_v2",
                &json!({ "from_path": from, "to_path": to, "autorename": autorename }),
            )
            .await?;
        Ok(result.metadata)
    }

    async fn account_display_name(&self) -> Result<String, RemoteError> {
        let account: Account = self
            .rpc("/2/users/get_current_account", &serde_json::Value::Null)
            .await?;
        Ok(account.name.display_name)
    }
}

/// The root folder is addressed by the empty string.
fn api_path(path: &str) -> &str {
    if path == "/" { "" } else { path }
}

/// Serializes `value` for use in an HTTP header, escaping every non-ASCII
/// character as a JSON `\uXXXX` sequence.
fn header_safe_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RemoteError> {
    let raw = serde_json::to_string(value)?;
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    Ok(out)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error_summary: String,
}

#[derive(Debug, Deserialize)]
struct MetadataResult<T> {
    metadata: T,
}

#[derive(Debug, Deserialize)]
struct Account {
    name: AccountName,
}

#[derive(Debug, Deserialize)]
struct AccountName {
    display_name: String,
}

#[derive(Debug, Serialize)]
struct UploadArg<'a> {
    path: &'a str,
    mode: WireWriteMode,
    autorename: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum WireWriteMode {
    Add,
    Overwrite,
    Update { update: String },
}

impl From<&WriteMode> for WireWriteMode {
    fn from(mode: &WriteMode) -> Self {
        match mode {
            WriteMode::Add => WireWriteMode::Add,
            WriteMode::Overwrite => WireWriteMode::Overwrite,
            WriteMode::Update(rev) => WireWriteMode::Update {
                update: rev.clone(),
            },
        }
    }
}
