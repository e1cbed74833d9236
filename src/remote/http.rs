use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use super::{ChangeStream, RemoteError, RemoteStore};
use crate::models::{Document, DocumentBody, Item};
use crate::protocol::{EventStreamDecoder, LastChangeResponse, SetCompletedRequest};

/// Client for the `todosync-server` HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
    // The event stream stays open indefinitely, so it gets a client
    // without an overall request timeout.
    stream_client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            stream_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(map_send_error)?;
        decode(check(response, path).await?).await
    }
}

fn map_send_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_decode() {
        RemoteError::Decode(e.to_string())
    } else {
        RemoteError::Unreachable(e.to_string())
    }
}

async fn check(response: Response, what: &str) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(what.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(RemoteError::Rejected {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn list_items(&self) -> Result<Vec<Item>, RemoteError> {
        self.get_json("/api/items").await
    }

    async fn create_item(&self, item: &Item) -> Result<Item, RemoteError> {
        let response = self
            .client
            .post(self.url("/api/items"))
            .json(item)
            .send()
            .await
            .map_err(map_send_error)?;
        decode(check(response, &item.id).await?).await
    }

    async fn set_completed(&self, id: &str, completed: bool) -> Result<Item, RemoteError> {
        let response = self
            .client
            .put(self.url(&format!("/api/items/{}/completed", id)))
            .json(&SetCompletedRequest { completed })
            .send()
            .await
            .map_err(map_send_error)?;
        decode(check(response, id).await?).await
    }

    async fn delete_item(&self, id: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.url(&format!("/api/items/{}", id)))
            .send()
            .await
            .map_err(map_send_error)?;
        match check(response, id).await {
            Ok(_) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_documents(&self) -> Result<Vec<Document>, RemoteError> {
        self.get_json("/api/documents").await
    }

    async fn create_document(&self, document: &Document) -> Result<Document, RemoteError> {
        let response = self
            .client
            .post(self.url("/api/documents"))
            .json(document)
            .send()
            .await
            .map_err(map_send_error)?;
        decode(check(response, &document.id).await?).await
    }

    async fn list_document_bodies(&self) -> Result<Vec<DocumentBody>, RemoteError> {
        self.get_json("/api/document-bodies").await
    }

    async fn create_document_body(&self, body: &DocumentBody) -> Result<DocumentBody, RemoteError> {
        let response = self
            .client
            .post(self.url("/api/document-bodies"))
            .json(body)
            .send()
            .await
            .map_err(map_send_error)?;
        decode(check(response, &body.id).await?).await
    }

    async fn last_change(&self) -> Result<i64, RemoteError> {
        let response: LastChangeResponse = self.get_json("/api/changes/last").await?;
        Ok(response.timestamp)
    }

    async fn subscribe(&self) -> Result<ChangeStream, RemoteError> {
        let response = self
            .stream_client
            .get(self.url("/api/events"))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(map_send_error)?;
        let response = check(response, "/api/events").await?;

        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, EventStreamDecoder::new(), VecDeque::new());
        let frames = futures::stream::unfold(state, |(mut bytes, mut decoder, mut queue)| async move {
            loop {
                if let Some(frame) = queue.pop_front() {
                    return Some((Ok(frame), (bytes, decoder, queue)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => queue.extend(decoder.push(&chunk)),
                    Some(Err(e)) => return Some((Err(map_send_error(e)), (bytes, decoder, queue))),
                    None => return None,
                }
            }
        });

        Ok(Box::pin(frames))
    }
}
