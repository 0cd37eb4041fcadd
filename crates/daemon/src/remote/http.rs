// HTTP client for the cloud store.
//
//   GET    {base}/projects/{project}/files            → {"files":[{fileId,path,hash}]}
//   GET    {base}/projects/{project}/files/{fileId}   → {path,content,hash}
//   PUT    {base}/projects/{project}/files/{fileId}   {path,content} → {hash}
//   DELETE {base}/projects/{project}/files/{fileId}
//
// 401/403 are auth failures, 404 means absent, 5xx/429 and network errors are
// transient.

use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trisync_common::hash::ContentHash;
use trisync_common::types::{FileId, ProjectId};
use url::Url;

use super::{RemoteEntry, RemoteFile, RemoteKey, RemoteStore};
use crate::error::RemoteError;

#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    files: Vec<ListedFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedFile {
    file_id: FileId,
    path: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    content: String,
    hash: String,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    hash: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let url = Url::parse(base_url)
            .with_context(|| format!("invalid remote store url `{base_url}`"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("remote store url must be http(s), got `{}`", url.scheme());
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build remote store http client")?;

        Ok(Self { client, base: base_url.trim_end_matches('/').to_string(), token })
    }

    fn files_url(&self, project_id: &ProjectId) -> String {
        format!("{}/projects/{}/files", self.base, project_id)
    }

    fn file_url(&self, key: &RemoteKey) -> String {
        format!("{}/{}", self.files_url(&key.project_id), key.file_id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        self.authorize(request).send().await.map_err(request_error)
    }
}

fn request_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else if error.is_decode() {
        RemoteError::Protocol(error.to_string())
    } else {
        RemoteError::Transient(error.to_string())
    }
}

async fn status_error(response: Response) -> RemoteError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() { status.to_string() } else { format!("{status}: {body}") };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            RemoteError::Transient(detail)
        }
        s if s.is_server_error() => RemoteError::Transient(detail),
        _ => RemoteError::Protocol(detail),
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn list(&self, project_id: &ProjectId) -> Result<Vec<RemoteEntry>, RemoteError> {
        let response = self.send(self.client.get(self.files_url(project_id))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: ListResponse = response.json().await.map_err(request_error)?;
        Ok(body
            .files
            .into_iter()
            .map(|f| RemoteEntry { file_id: f.file_id, path: f.path, hash: f.hash })
            .collect())
    }

    async fn get(&self, key: &RemoteKey) -> Result<Option<RemoteFile>, RemoteError> {
        let response = self.send(self.client.get(self.file_url(key))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: FileResponse = response.json().await.map_err(request_error)?;
        Ok(Some(RemoteFile { content: body.content, hash: body.hash }))
    }

    async fn put(&self, key: &RemoteKey, content: &str) -> Result<ContentHash, RemoteError> {
        let request =
            self.client.put(self.file_url(key)).json(&PutRequest { path: &key.path, content });
        let response = self.send(request).await?;
        if !response.status().is_success() {
            let error = status_error(response).await;
            warn!(path = %key.path, error = %error, "remote put failed");
            return Err(error);
        }

        let body: PutResponse = response.json().await.map_err(request_error)?;
        debug!(path = %key.path, hash = %body.hash, "pushed file to remote store");
        Ok(body.hash)
    }

    async fn delete(&self, key: &RemoteKey) -> Result<(), RemoteError> {
        let response = self.send(self.client.delete(self.file_url(key))).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error(response).await)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use trisync_common::hash::content_hash;

    use super::*;

    type Files = Arc<Mutex<HashMap<String, (String, String)>>>;

    const TOKEN: &str = "remote-test-token";

    fn authorized(headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {TOKEN}");
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(expected.as_str())
    }

    async fn list_files(
        State(files): State<Files>,
        headers: HeaderMap,
        Path(_project): Path<String>,
    ) -> Result<Json<Value>, AxumStatus> {
        if !authorized(&headers) {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        let files = files.lock().unwrap();
        let listed: Vec<Value> = files
            .iter()
            .map(|(id, (path, content))| {
                json!({"fileId": id, "path": path, "hash": content_hash(content)})
            })
            .collect();
        Ok(Json(json!({ "files": listed })))
    }

    async fn get_file(
        State(files): State<Files>,
        Path((_project, id)): Path<(String, String)>,
    ) -> Result<Json<Value>, AxumStatus> {
        let files = files.lock().unwrap();
        let (path, content) = files.get(&id).ok_or(AxumStatus::NOT_FOUND)?;
        Ok(Json(json!({"path": path, "content": content, "hash": content_hash(content)})))
    }

    async fn put_file(
        State(files): State<Files>,
        Path((_project, id)): Path<(String, String)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let path = body["path"].as_str().unwrap_or_default().to_string();
        let content = body["content"].as_str().unwrap_or_default().to_string();
        let hash = content_hash(&content);
        files.lock().unwrap().insert(id, (path, content));
        Json(json!({ "hash": hash }))
    }

    async fn delete_file(
        State(files): State<Files>,
        Path((_project, id)): Path<(String, String)>,
    ) -> AxumStatus {
        match files.lock().unwrap().remove(&id) {
            Some(_) => AxumStatus::NO_CONTENT,
            None => AxumStatus::NOT_FOUND,
        }
    }

    async fn serve() -> String {
        let files: Files = Arc::default();
        let app = Router::new()
            .route("/projects/{project}/files", get(list_files))
            .route(
                "/projects/{project}/files/{id}",
                get(get_file).put(put_file).delete(delete_file),
            )
            .route("/broken/projects/{project}/files", get(|| async { AxumStatus::BAD_GATEWAY }))
            .with_state(files);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn key(path: &str) -> RemoteKey {
        RemoteKey::for_path(&ProjectId::parse("demo").unwrap(), path)
    }

    fn store(base: &str, token: Option<&str>) -> HttpRemoteStore {
        HttpRemoteStore::new(base, token.map(str::to_string), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn round_trips_through_http() {
        let base = serve().await;
        let store = store(&base, Some(TOKEN));

        let hash = store.put(&key("src/a.rs"), "fn a() {}").await.unwrap();
        assert_eq!(hash, content_hash("fn a() {}"));

        let file = store.get(&key("src/a.rs")).await.unwrap().unwrap();
        assert_eq!(file.content, "fn a() {}");

        let listed = store.list(&key("src/a.rs").project_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_id, key("src/a.rs").file_id);

        store.delete(&key("src/a.rs")).await.unwrap();
        store.delete(&key("src/a.rs")).await.unwrap();
        assert!(store.get(&key("src/a.rs")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_token_is_an_auth_error() {
        let base = serve().await;
        let store = store(&base, Some("wrong"));
        let err = store.list(&key("a").project_id).await.unwrap_err();
        assert!(matches!(err, RemoteError::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let base = serve().await;
        let store = store(&format!("{base}/broken"), Some(TOKEN));
        let err = store.list(&key("a").project_id).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_store_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = store(&format!("http://{addr}"), None);
        let err = store.get(&key("a")).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_) | RemoteError::Timeout), "got {err:?}");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpRemoteStore::new("ftp://x", None, Duration::from_secs(1)).is_err());
        assert!(HttpRemoteStore::new("not a url", None, Duration::from_secs(1)).is_err());
    }
}
