//! HTTP client for the relay contract.
//!
//! Every call is bounded by the request timeout and retried with a fixed
//! backoff while the failure is transient. 4xx responses are final.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};

use super::{MESSAGE_ID_HEADER, MessageRelay, RelayMessage};
use crate::config::{NetworkMode, Settings};
use crate::error::{KeysignError, KeysignResult};
use crate::signature::SignaturePackage;

#[derive(Clone)]
pub struct HttpRelay {
    client: Client,
    base_url: String,
    mode: NetworkMode,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl HttpRelay {
    pub fn new(base_url: &str, settings: &Settings) -> KeysignResult<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| KeysignError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            mode: NetworkMode::Relay,
            retry_attempts: settings.retry_attempts().max(1),
            retry_backoff: settings.retry_backoff(),
        })
    }

    /// Client for a mediator on the local network, possibly started by
    /// another device.
    pub fn local(base_url: &str, settings: &Settings) -> KeysignResult<Self> {
        let mut relay = Self::new(base_url, settings)?;
        relay.mode = NetworkMode::Local;
        Ok(relay)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> KeysignResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KeysignResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.retry_attempts => {
                    tracing::error!(operation, attempts = attempt, error = %e, "Relay call failed");
                    return Err(KeysignError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(operation, attempt, error = %e, "Relay call failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    fn with_message_id(request: RequestBuilder, message_id: Option<&str>) -> RequestBuilder {
        match message_id {
            Some(id) => request.header(MESSAGE_ID_HEADER, id),
            None => request,
        }
    }
}

/// Map a non-success status onto [`KeysignError::RelayRejected`].
async fn check(response: Response) -> KeysignResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(KeysignError::RelayRejected {
        status: status.as_u16(),
        body,
    })
}

/// `None` on 404, the decoded body otherwise.
async fn optional_json<T: serde::de::DeserializeOwned>(
    response: Response,
) -> KeysignResult<Option<T>> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let response = check(response).await?;
    Ok(Some(response.json().await?))
}

#[async_trait]
impl MessageRelay for HttpRelay {
    fn mode(&self) -> NetworkMode {
        self.mode
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    #[tracing::instrument(skip(self, parties), fields(parties = parties.len()))]
    async fn start_session(&self, session_id: &str, parties: &[String]) -> KeysignResult<()> {
        self.with_retry("start_session", || async move {
            let response = self
                .client
                .post(self.url(session_id))
                .json(parties)
                .send()
                .await?;
            check(response).await.map(|_| ())
        })
        .await
    }

    async fn get_participants(&self, session_id: &str) -> KeysignResult<Vec<String>> {
        self.with_retry("get_participants", || async move {
            let response = self.client.get(self.url(session_id)).send().await?;
            Ok(optional_json(response).await?.unwrap_or_default())
        })
        .await
    }

    async fn end_session(&self, session_id: &str) -> KeysignResult<()> {
        self.with_retry("end_session", || async move {
            let response = self.client.delete(self.url(session_id)).send().await?;
            check(response).await.map(|_| ())
        })
        .await
    }

    #[tracing::instrument(skip(self, committee), fields(committee = committee.len()))]
    async fn start_with_committee(
        &self,
        session_id: &str,
        committee: &[String],
    ) -> KeysignResult<()> {
        self.with_retry("start_with_committee", || async move {
            let response = self
                .client
                .post(self.url(&format!("start/{session_id}")))
                .json(committee)
                .send()
                .await?;
            check(response).await.map(|_| ())
        })
        .await
    }

    async fn check_committee(&self, session_id: &str) -> KeysignResult<Option<Vec<String>>> {
        self.with_retry("check_committee", || async move {
            let response = self
                .client
                .get(self.url(&format!("start/{session_id}")))
                .send()
                .await?;
            optional_json(response).await
        })
        .await
    }

    async fn send(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        message: &RelayMessage,
    ) -> KeysignResult<()> {
        self.with_retry("send", || async move {
            let request = self
                .client
                .post(self.url(&format!("message/{session_id}")))
                .json(message);
            let response = Self::with_message_id(request, message_id).send().await?;
            check(response).await.map(|_| ())
        })
        .await
    }

    async fn receive(
        &self,
        session_id: &str,
        party: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<Vec<RelayMessage>> {
        self.with_retry("receive", || async move {
            let request = self
                .client
                .get(self.url(&format!("message/{session_id}/{party}")));
            let response = Self::with_message_id(request, message_id).send().await?;
            Ok(optional_json(response).await?.unwrap_or_default())
        })
        .await
    }

    async fn acknowledge(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<()> {
        self.with_retry("acknowledge", || async move {
            let request = self
                .client
                .delete(self.url(&format!("message/{session_id}/{party}/{hash}")));
            let response = Self::with_message_id(request, message_id).send().await?;
            check(response).await.map(|_| ())
        })
        .await
    }

    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> KeysignResult<()> {
        self.with_retry("upload_setup_message", || async move {
            let request = self
                .client
                .post(self.url(&format!("setup-message/{session_id}")))
                .body(payload.to_string());
            let response = Self::with_message_id(request, message_id).send().await?;
            check(response).await.map(|_| ())
        })
        .await
    }

    async fn get_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<Option<String>> {
        self.with_retry("get_setup_message", || async move {
            let request = self
                .client
                .get(self.url(&format!("setup-message/{session_id}")));
            let response = Self::with_message_id(request, message_id).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            Ok(Some(check(response).await?.text().await?))
        })
        .await
    }

    async fn mark_complete(&self, session_id: &str, party: &str) -> KeysignResult<()> {
        self.with_retry("mark_complete", || async move {
            let response = self
                .client
                .post(self.url(&format!("complete/{session_id}")))
                .json(&[party])
                .send()
                .await?;
            check(response).await.map(|_| ())
        })
        .await
    }

    async fn completed_parties(&self, session_id: &str) -> KeysignResult<Vec<String>> {
        self.with_retry("completed_parties", || async move {
            let response = self
                .client
                .get(self.url(&format!("complete/{session_id}")))
                .send()
                .await?;
            Ok(optional_json(response).await?.unwrap_or_default())
        })
        .await
    }

    async fn publish_signature(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &SignaturePackage,
    ) -> KeysignResult<()> {
        self.with_retry("publish_signature", || async move {
            let response = self
                .client
                .post(self.url(&format!("complete/{session_id}/keysign")))
                .header(MESSAGE_ID_HEADER, message_id)
                .json(signature)
                .send()
                .await?;
            check(response).await.map(|_| ())
        })
        .await
    }

    async fn fetch_signature(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> KeysignResult<Option<SignaturePackage>> {
        self.with_retry("fetch_signature", || async move {
            let response = self
                .client
                .get(self.url(&format!("complete/{session_id}/keysign")))
                .header(MESSAGE_ID_HEADER, message_id)
                .send()
                .await?;
            optional_json(response).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_relay() -> HttpRelay {
        // Port 9 (discard) is closed on loopback in test environments.
        HttpRelay::new("http://127.0.0.1:9/router/", &Settings::for_tests()).unwrap()
    }

    #[test]
    fn test_url_joining() {
        let relay = unreachable_relay();
        assert_eq!(relay.base_url(), "http://127.0.0.1:9/router");
        assert_eq!(
            relay.url("start/abc"),
            "http://127.0.0.1:9/router/start/abc"
        );
    }

    #[tokio::test]
    async fn test_unreachable_relay_exhausts_retries() {
        let relay = unreachable_relay();
        let err = relay.get_participants("session").await.unwrap_err();
        match err {
            KeysignError::RetriesExhausted {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "get_participants");
                assert_eq!(attempts, Settings::for_tests().retry_attempts());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let relay = unreachable_relay();
        let mut calls = 0;
        let result: KeysignResult<()> = relay
            .with_retry("op", || {
                calls += 1;
                async {
                    Err(KeysignError::RelayRejected {
                        status: 400,
                        body: "bad".to_string(),
                    })
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(KeysignError::RelayRejected { status: 400, .. })
        ));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_recover() {
        let relay = unreachable_relay();
        let mut calls = 0;
        let result = relay
            .with_retry("op", || {
                calls += 1;
                let current = calls;
                async move {
                    if current < 2 {
                        Err(KeysignError::RelayRejected {
                            status: 503,
                            body: String::new(),
                        })
                    } else {
                        Ok(current)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }
}
