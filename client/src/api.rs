//! REST client for the conversation repository and profile directory

use async_trait::async_trait;
use parley_shared::{
    AccountId, ConversationRepository, MessageEnvelope, ProfileDirectory, StoreError,
    StoreResult, Thread,
};
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;

/// Repository backed by the server's REST surface
pub struct HttpApi {
    client: reqwest::Client,
    config: ClientConfig,
    me: AccountId,
    token: String,
}

impl HttpApi {
    /// `token` is sent as the bearer credential on every request and must
    /// have been issued for `me`
    pub fn new(config: ClientConfig, me: AccountId, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            me,
            token: token.into(),
        }
    }

    /// Endpoint URL with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> StoreResult<Url> {
        let mut url = Url::parse(&self.config.server_url)
            .map_err(|e| StoreError::Backend(format!("invalid server URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Backend("server URL cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn get(&self, segments: &[&str]) -> StoreResult<reqwest::RequestBuilder> {
        Ok(self.client.get(self.endpoint(segments)?).bearer_auth(&self.token))
    }

    fn post(&self, segments: &[&str]) -> StoreResult<reqwest::RequestBuilder> {
        Ok(self.client.post(self.endpoint(segments)?).bearer_auth(&self.token))
    }

    fn put(&self, segments: &[&str]) -> StoreResult<reqwest::RequestBuilder> {
        Ok(self.client.put(self.endpoint(segments)?).bearer_auth(&self.token))
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Map a non-success status onto the repository error taxonomy
async fn check(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body["error"].as_str().unwrap_or("request failed").to_string();
    debug!("Request failed with {}: {}", status, message);
    Err(match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => StoreError::Invalid(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized,
        _ => StoreError::Backend(format!("{}: {}", status, message)),
    })
}

async fn parse<T: DeserializeOwned>(response: Response) -> StoreResult<T> {
    check(response).await?.json().await.map_err(transport)
}

#[async_trait]
impl ConversationRepository for HttpApi {
    async fn find_or_create_thread(&self, a: &AccountId, b: &AccountId) -> StoreResult<Thread> {
        // The server takes the caller from the credential
        let peer = if a == &self.me { b } else { a };
        let response = self
            .post(&["threads"])?
            .json(&json!({ "peer_id": peer }))
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Option<Thread>> {
        let response = self
            .get(&["threads", &thread_id.to_string()])?
            .send()
            .await
            .map_err(transport)?;
        match parse(response).await {
            Ok(thread) => Ok(Some(thread)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_threads_for_account(&self, _account: &AccountId) -> StoreResult<Vec<Thread>> {
        let response = self.get(&["threads"])?.send().await.map_err(transport)?;
        parse(response).await
    }

    async fn append_message(&self, message: MessageEnvelope) -> StoreResult<MessageEnvelope> {
        let response = self
            .post(&["threads", &message.thread_id.to_string(), "messages"])?
            .json(&json!({
                "id": message.id,
                "receiver_id": message.receiver_id,
                "content": message.content,
            }))
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn list_messages(&self, thread_id: Uuid) -> StoreResult<Vec<MessageEnvelope>> {
        let response = self
            .get(&["threads", &thread_id.to_string(), "messages"])?
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }
}

#[async_trait]
impl ProfileDirectory for HttpApi {
    async fn publish_public_key(&self, _account: &AccountId, public_key: &str) -> StoreResult<()> {
        let response = self
            .put(&["accounts", "me", "public-key"])?
            .json(&json!({ "public_key": public_key }))
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }

    async fn fetch_public_key(&self, account: &AccountId) -> StoreResult<Option<String>> {
        let response = self
            .get(&["accounts", account.as_str(), "public-key"])?
            .send()
            .await
            .map_err(transport)?;
        match parse::<serde_json::Value>(response).await {
            Ok(body) => Ok(body["public_key"].as_str().map(str::to_string)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(server_url: &str) -> HttpApi {
        let config = ClientConfig {
            server_url: server_url.into(),
            ..ClientConfig::default()
        };
        HttpApi::new(config, AccountId::new("alice").unwrap(), "alice")
    }

    #[test]
    fn test_account_ids_are_encoded_as_one_segment() {
        let api = api("http://127.0.0.1:8080");
        for (account, expected) in [
            ("ops#alice", "/accounts/ops%23alice/public-key"),
            ("ops/alice", "/accounts/ops%2Falice/public-key"),
            ("a?b", "/accounts/a%3Fb/public-key"),
        ] {
            let url = api.endpoint(&["accounts", account, "public-key"]).unwrap();
            assert_eq!(url.path(), expected);
            assert_eq!(url.query(), None);
            assert_eq!(url.fragment(), None);
        }
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let api = api("http://example.com/parley/");
        let url = api.endpoint(&["threads"]).unwrap();
        assert_eq!(url.as_str(), "http://example.com/parley/threads");
    }
}
