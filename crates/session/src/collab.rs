// Persistence and comment collaborators.
//
// The session only ever needs four calls: fetch/save a document snapshot and
// list/create comments. `HttpCollaborator` speaks them over JSON HTTP with
// bearer auth:
//
//   GET  {base}/documents/{id}            -> DocumentSnapshot (404 = none)
//   PUT  {base}/documents/{id}            <- DocumentContent
//   GET  {base}/documents/{id}/comments   -> [CommentRecord]
//   POST {base}/documents/{id}/comments   <- NewComment -> CreatedComment

use std::future::Future;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tandem_common::types::{CommentRecord, CreatedComment, DocumentContent, DocumentSnapshot, NewComment};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("invalid collaborator URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("collaborator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("collaborator returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

pub trait SnapshotStore {
    fn fetch(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<Option<DocumentSnapshot>, CollabError>> + Send;

    fn save(
        &self,
        document_id: &str,
        content: &DocumentContent,
    ) -> impl Future<Output = Result<(), CollabError>> + Send;
}

pub trait CommentStore {
    fn list(&self, document_id: &str) -> impl Future<Output = Result<Vec<CommentRecord>, CollabError>> + Send;

    fn create(
        &self,
        document_id: &str,
        comment: &NewComment,
    ) -> impl Future<Output = Result<CreatedComment, CollabError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpCollaborator {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpCollaborator {
    /// `timeout` bounds each request end to end, connect included.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, CollabError> {
        let mut base_url = Url::parse(base_url)?;
        // Keep the last path segment when joining relative paths.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder().connect_timeout(timeout).timeout(timeout).build()?;
        Ok(Self { client, base_url, token })
    }

    fn document_url(&self, document_id: &str, comments: bool) -> Result<Url, CollabError> {
        let mut url = self.base_url.join("documents/")?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
            segments.pop_if_empty().push(document_id);
            if comments {
                segments.push("comments");
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, CollabError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CollabError::Status { status, body })
}

impl SnapshotStore for HttpCollaborator {
    async fn fetch(&self, document_id: &str) -> Result<Option<DocumentSnapshot>, CollabError> {
        let url = self.document_url(document_id, false)?;
        let response = self.authorize(self.client.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn save(&self, document_id: &str, content: &DocumentContent) -> Result<(), CollabError> {
        let url = self.document_url(document_id, false)?;
        let response = self.authorize(self.client.put(url)).json(content).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

impl CommentStore for HttpCollaborator {
    async fn list(&self, document_id: &str) -> Result<Vec<CommentRecord>, CollabError> {
        let url = self.document_url(document_id, true)?;
        let response = self.authorize(self.client.get(url)).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn create(&self, document_id: &str, comment: &NewComment) -> Result<CreatedComment, CollabError> {
        let url = self.document_url(document_id, true)?;
        let response = self.authorize(self.client.post(url)).json(comment).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::get,
        Json, Router,
    };
    use chrono::Utc;
    use tokio::net::TcpListener;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Backend {
        documents: Mutex<HashMap<String, DocumentContent>>,
        comments: Mutex<Vec<CommentRecord>>,
        seen_auth: Mutex<Vec<String>>,
    }

    fn record_auth(backend: &Backend, headers: &HeaderMap) {
        if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            backend.seen_auth.lock().unwrap().push(value.to_string());
        }
    }

    async fn spawn_backend() -> (SocketAddr, Arc<Backend>) {
        let backend = Arc::new(Backend::default());
        let app = Router::new()
            .route(
                "/api/documents/{id}",
                get(
                    |State(backend): State<Arc<Backend>>, Path(id): Path<String>, headers: HeaderMap| async move {
                        record_auth(&backend, &headers);
                        match backend.documents.lock().unwrap().get(&id).cloned() {
                            Some(content) => Ok(Json(DocumentSnapshot { document_id: id, content, updated_at: None })),
                            None => Err(AxumStatus::NOT_FOUND),
                        }
                    },
                )
                .put(
                    |State(backend): State<Arc<Backend>>,
                     Path(id): Path<String>,
                     Json(content): Json<DocumentContent>| async move {
                        backend.documents.lock().unwrap().insert(id, content);
                        AxumStatus::NO_CONTENT
                    },
                ),
            )
            .route(
                "/api/documents/{id}/comments",
                get(|State(backend): State<Arc<Backend>>| async move {
                    Json(backend.comments.lock().unwrap().clone())
                })
                .post(
                    |State(backend): State<Arc<Backend>>, Json(comment): Json<NewComment>| async move {
                        if comment.start >= comment.end {
                            return Err((AxumStatus::UNPROCESSABLE_ENTITY, "empty range"));
                        }
                        let mut comments = backend.comments.lock().unwrap();
                        let id = format!("c{}", comments.len() + 1);
                        comments.push(CommentRecord {
                            id: id.clone(),
                            start: comment.start,
                            end: comment.end,
                            created_at: Utc::now(),
                        });
                        Ok(Json(CreatedComment { id }))
                    },
                ),
            )
            .with_state(Arc::clone(&backend));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test backend should run");
        });
        (addr, backend)
    }

    #[tokio::test]
    async fn snapshot_roundtrip_and_missing_document() {
        let (addr, backend) = spawn_backend().await;
        let collab = HttpCollaborator::new(&format!("http://{addr}/api"), Some("jwt-1".into()), WAIT)
            .expect("collaborator should build");

        assert_eq!(collab.fetch("doc-1").await.expect("fetch"), None);

        collab.save("doc-1", &DocumentContent::new("T", "<p>B</p>")).await.expect("save");
        let snapshot = collab.fetch("doc-1").await.expect("fetch").expect("snapshot exists");
        assert_eq!(snapshot.document_id, "doc-1");
        assert_eq!(snapshot.content, DocumentContent::new("T", "<p>B</p>"));
        assert!(backend.seen_auth.lock().unwrap().iter().all(|value| value == "Bearer jwt-1"));
    }

    #[tokio::test]
    async fn comments_are_created_and_listed() {
        let (addr, _backend) = spawn_backend().await;
        let collab = HttpCollaborator::new(&format!("http://{addr}/api/"), None, WAIT).expect("collaborator");

        let created = collab
            .create("doc-1", &NewComment { start: 10, end: 25, text: "look".into() })
            .await
            .expect("create");
        assert_eq!(created.id, "c1");

        let listed = collab.list("doc-1").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!((listed[0].start, listed[0].end), (10, 25));
    }

    #[tokio::test]
    async fn error_statuses_surface_with_body() {
        let (addr, _backend) = spawn_backend().await;
        let collab = HttpCollaborator::new(&format!("http://{addr}/api"), None, WAIT).expect("collaborator");

        let error = collab
            .create("doc-1", &NewComment { start: 5, end: 5, text: "x".into() })
            .await
            .expect_err("empty range should be refused");
        match error {
            CollabError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(body, "empty range");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_backend_times_out() {
        let app = Router::new().route(
            "/api/documents/{id}",
            get(|| async {
                std::future::pending::<()>().await;
                AxumStatus::OK
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test backend should run");
        });

        let collab = HttpCollaborator::new(&format!("http://{addr}/api"), None, Duration::from_millis(200))
            .expect("collaborator");
        let error = tokio::time::timeout(WAIT, collab.fetch("doc-1"))
            .await
            .expect("request should give up on its own")
            .expect_err("stalled request should fail");
        match error {
            CollabError::Http(error) => assert!(error.is_timeout(), "{error:?}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn document_urls_escape_ids() {
        let collab = HttpCollaborator::new("https://api.example.com/v1", None, WAIT).expect("collaborator");
        let url = collab.document_url("a b/c", true).expect("url");
        assert_eq!(url.as_str(), "https://api.example.com/v1/documents/a%20b%2Fc/comments");
    }
}
