//! OpenCode HTTP client.

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;

use super::error::{OpenCodeError, OpenCodeResult};
use super::types::{HealthInfo, MessageReply, RemoteSession, parse_session_list};

/// Client for one OpenCode server.
///
/// Every call takes an explicit timeout; there is no client-wide default.
#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    client: Client,
    /// Base URL, without trailing slash (e.g. "http://127.0.0.1:4096").
    base_url: String,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Reuse an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /global/health`.
    pub async fn health(&self, timeout: Duration) -> OpenCodeResult<HealthInfo> {
        let url = self.url("/global/health");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| OpenCodeError::from_reqwest(&url, e))?;
        self.handle_response(&url, response).await
    }

    /// `GET /session`.
    pub async fn list_sessions(&self, timeout: Duration) -> OpenCodeResult<Vec<RemoteSession>> {
        let url = self.url("/session");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| OpenCodeError::from_reqwest(&url, e))?;
        let body: Value = self.handle_response(&url, response).await?;
        parse_session_list(body).map_err(|e| OpenCodeError::Parse(e.to_string()))
    }

    /// `POST /session`. Returns the new session id.
    pub async fn create_session(&self, title: &str, timeout: Duration) -> OpenCodeResult<String> {
        let url = self.url("/session");
        let response = self
            .client
            .post(&url)
            .json(&json!({ "title": title }))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| OpenCodeError::from_reqwest(&url, e))?;
        let body: Value = self.handle_response(&url, response).await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| OpenCodeError::Parse(format!("session response has no id: {body}")))
    }

    /// `POST /session/{id}/message`, waiting for the assistant to finish.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        timeout: Duration,
    ) -> OpenCodeResult<MessageReply> {
        let url = self.url(&format!("/session/{session_id}/message"));
        let response = self
            .client
            .post(&url)
            .json(&text_parts(text))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| OpenCodeError::from_reqwest(&url, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(OpenCodeError::SessionNotFound(session_id.to_string()));
        }
        self.handle_response(&url, response).await
    }

    /// `POST /session/{id}/prompt_async`. The server answers 204 and runs the prompt in the background.
    pub async fn prompt_async(
        &self,
        session_id: &str,
        text: &str,
        timeout: Duration,
    ) -> OpenCodeResult<()> {
        let url = self.url(&format!("/session/{session_id}/prompt_async"));
        let response = self
            .client
            .post(&url)
            .json(&text_parts(text))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| OpenCodeError::from_reqwest(&url, e))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(OpenCodeError::SessionNotFound(session_id.to_string())),
            status => Err(OpenCodeError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// `POST /session/{id}/abort`.
    pub async fn abort(&self, session_id: &str, timeout: Duration) -> OpenCodeResult<()> {
        let url = self.url(&format!("/session/{session_id}/abort"));
        self.post_empty(&url, timeout).await
    }

    /// `POST /instance/dispose`.
    pub async fn dispose(&self, timeout: Duration) -> OpenCodeResult<()> {
        let url = self.url("/instance/dispose");
        self.post_empty(&url, timeout).await
    }

    async fn post_empty(&self, url: &str, timeout: Duration) -> OpenCodeResult<()> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| OpenCodeError::from_reqwest(url, e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(OpenCodeError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    /// Handle response and parse JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        response: reqwest::Response,
    ) -> OpenCodeResult<T> {
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| OpenCodeError::Parse(format!("{url}: {e}")))
        } else {
            Err(OpenCodeError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

fn text_parts(text: &str) -> Value {
    json!({ "parts": [{ "type": "text", "text": text }] })
}


#[cfg(test)]
mod tests {
    use super::test_server::{FakeState, spawn};
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fake() -> Arc<Mutex<FakeState>> {
        Arc::new(Mutex::new(FakeState {
            healthy: true,
            sessions: vec![json!({"id": "ses_abc", "directory": "/p"})],
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_health_and_list() {
        let state = fake();
        let client = OpenCodeClient::new(spawn(state).await);
        let health = client.health(Duration::from_secs(2)).await.unwrap();
        assert!(health.healthy);
        let sessions = client.list_sessions(Duration::from_secs(2)).await.unwrap();
        assert_eq!(sessions[0].id, "ses_abc");
    }

    #[tokio::test]
    async fn test_message_on_missing_session_is_not_found() {
        let state = fake();
        state.lock().unwrap().missing.push("ses_gone".into());
        let client = OpenCodeClient::new(spawn(state).await);
        let err = client
            .send_message("ses_gone", "hi", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, OpenCodeError::SessionNotFound(id) if id == "ses_gone"));
    }

    #[tokio::test]
    async fn test_prompt_async_records_prompt() {
        let state = fake();
        let client = OpenCodeClient::new(spawn(state.clone()).await);
        client
            .prompt_async("ses_abc", "ping", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            state.lock().unwrap().prompts,
            vec![("ses_abc".to_string(), "ping".to_string())]
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = OpenCodeClient::new(format!("http://127.0.0.1:{port}"));
        let err = client.list_sessions(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.is_unreachable());
    }
}
