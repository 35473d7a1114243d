//! Consul lock over the session and KV HTTP API.
//!
//! Holding the lock means the KV key is bound to our session. The session is
//! created with `Behavior = delete`, so when Consul expires it the key goes
//! with it and another replica can acquire.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{DistributedLock, LockError, LockIdentity};
use crate::config::ConsulLockConfig;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'static str,
    lock_delay: &'static str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Session", default)]
    session: Option<String>,
}

pub struct ConsulLock {
    client: Client,
    base_url: String,
    key_prefix: String,
    /// Session the key is (or will be) bound to. Held across requests so
    /// concurrent calls never create duplicate sessions.
    session: Mutex<Option<String>>,
}

impl ConsulLock {
    pub fn new(
        base_url: &str,
        key_prefix: &str,
        request_timeout: Duration,
    ) -> Result<Self, LockError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LockError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key_prefix: key_prefix.trim_matches('/').to_string(),
            session: Mutex::new(None),
        })
    }

    pub fn from_config(config: &ConsulLockConfig) -> Result<Self, LockError> {
        let endpoint = config
            .consul_cluster_config
            .as_deref()
            .ok_or_else(|| LockError::Config("lock.consul_cluster_config is not set".into()))?;
        Self::new(
            endpoint,
            &config.key_prefix,
            config.request_timeout,
        )
    }

    /// KV key holding the lock `name`.
    fn key(&self, name: &str) -> String {
        if self.key_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.key_prefix, name)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn create_session(
        &self,
        name: &str,
        owner: LockIdentity,
        ttl: Duration,
    ) -> Result<String, LockError> {
        let session_name = format!("{name}-{owner}");
        let body = SessionRequest {
            name: &session_name,
            ttl: format!("{}s", ttl.as_secs()),
            behavior: "delete",
            lock_delay: "0s",
        };

        let response = self
            .client
            .put(self.url("/v1/session/create"))
            .json(&body)
            .send()
            .await?;
        let created: SessionCreated = error_for_status(response).await?.json().await?;

        tracing::debug!(session = %created.id, lock = %name, "Created Consul session");
        Ok(created.id)
    }

    /// Whether the KV key is currently bound to `session`.
    async fn key_bound_to(&self, name: &str, session: &str) -> Result<bool, LockError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/kv/{}", self.key(name))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let entries: Vec<KvEntry> = error_for_status(response).await?.json().await?;
        Ok(entries
            .first()
            .and_then(|entry| entry.session.as_deref())
            .is_some_and(|bound| bound == session))
    }
}

#[async_trait]
impl DistributedLock for ConsulLock {
    fn backend(&self) -> &'static str {
        "consul"
    }

    async fn acquire(
        &self,
        name: &str,
        owner: LockIdentity,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut session = self.session.lock().await;
        let id = match session.as_ref() {
            Some(id) => id.clone(),
            None => {
                let id = self.create_session(name, owner, ttl).await?;
                *session = Some(id.clone());
                id
            }
        };

        let response = self
            .client
            .put(self.url(&format!("/v1/kv/{}", self.key(name))))
            .query(&[("acquire", id.as_str())])
            .body(owner.to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<bool>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        if body.to_ascii_lowercase().contains("invalid session") {
            tracing::warn!(session = %id, lock = %name, "Consul session is no longer valid, discarding it");
            *session = None;
            return Ok(false);
        }
        Err(status_error(status, body))
    }

    async fn renew(
        &self,
        name: &str,
        _owner: LockIdentity,
        _ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut session = self.session.lock().await;
        let Some(id) = session.clone() else {
            return Ok(false);
        };

        let response = self
            .client
            .put(self.url(&format!("/v1/session/renew/{id}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::warn!(session = %id, lock = %name, "Consul session expired");
            *session = None;
            return Ok(false);
        }
        error_for_status(response).await?;

        self.key_bound_to(name, &id).await
    }

    async fn release(&self, name: &str, _owner: LockIdentity) -> Result<(), LockError> {
        let Some(id) = self.session.lock().await.take() else {
            return Ok(());
        };

        let released = self
            .client
            .put(self.url(&format!("/v1/kv/{}", self.key(name))))
            .query(&[("release", id.as_str())])
            .send()
            .await;
        match released {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(session = %id, status = %response.status(), "Failed to release Consul lock key");
            }
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "Failed to release Consul lock key");
            }
        }

        let destroyed = self
            .client
            .put(self.url(&format!("/v1/session/destroy/{id}")))
            .send()
            .await;
        match destroyed {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(session = %id, status = %response.status(), "Failed to destroy Consul session");
            }
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "Failed to destroy Consul session");
            }
        }

        Ok(())
    }
}

async fn error_for_status(response: Response) -> Result<Response, LockError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body))
}

fn status_error(status: StatusCode, body: String) -> LockError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error() {
        LockError::Unavailable(message)
    } else {
        LockError::Protocol(message)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, body_string, method, path, query_param},
    };

    use super::*;

    const KEY_PATH: &str = "/v1/kv/v1/locks/pruner";
    const TTL: Duration = Duration::from_secs(15);

    fn lock_for(server: &MockServer) -> ConsulLock {
        ConsulLock::new(&server.uri(), "v1/locks", Duration::from_secs(2)).unwrap()
    }

    async fn mount_session(server: &MockServer, id: &str, expected_calls: u64) {
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .and(body_partial_json(json!({
                "TTL": "15s",
                "Behavior": "delete",
                "LockDelay": "0s",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": id })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    async fn mount_acquire(server: &MockServer, id: &str, held: bool) {
        Mock::given(method("PUT"))
            .and(path(KEY_PATH))
            .and(query_param("acquire", id))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(held)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_acquire_reuses_session() {
        let server = MockServer::start().await;
        mount_session(&server, "sess-1", 1).await;
        mount_acquire(&server, "sess-1", true).await;
        let lock = lock_for(&server);
        let owner = LockIdentity::generate();

        assert!(lock.acquire("pruner", owner, TTL).await.unwrap());
        assert!(lock.acquire("pruner", owner, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_stores_owner_as_value() {
        let server = MockServer::start().await;
        let owner = LockIdentity::generate();
        mount_session(&server, "sess-1", 1).await;
        Mock::given(method("PUT"))
            .and(path(KEY_PATH))
            .and(query_param("acquire", "sess-1"))
            .and(body_string(owner.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&server)
            .await;

        assert!(lock_for(&server).acquire("pruner", owner, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_held_elsewhere_is_not_error() {
        let server = MockServer::start().await;
        mount_session(&server, "sess-1", 1).await;
        mount_acquire(&server, "sess-1", false).await;

        let held = lock_for(&server)
            .acquire("pruner", LockIdentity::generate(), TTL)
            .await
            .unwrap();
        assert!(!held);
    }

    #[tokio::test]
    async fn test_invalid_session_is_discarded() {
        let server = MockServer::start().await;
        mount_session(&server, "sess-1", 2).await;
        Mock::given(method("PUT"))
            .and(path(KEY_PATH))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("invalid session \"sess-1\""),
            )
            .mount(&server)
            .await;
        let lock = lock_for(&server);
        let owner = LockIdentity::generate();

        assert!(!lock.acquire("pruner", owner, TTL).await.unwrap());
        // A fresh session is created on the next attempt
        assert!(!lock.acquire("pruner", owner, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .respond_with(ResponseTemplate::new(503).set_body_string("No cluster leader"))
            .mount(&server)
            .await;

        let err = lock_for(&server)
            .acquire("pruner", LockIdentity::generate(), TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable(ref m) if m.contains("503")), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_consul_is_unavailable() {
        let lock = ConsulLock::new("http://127.0.0.1:1", "v1/locks", Duration::from_secs(1))
            .unwrap();

        let err = lock
            .acquire("pruner", LockIdentity::generate(), TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable(_)), "{err}");
    }

    #[tokio::test]
    async fn test_renew_confirms_key_binding() {
        let server = MockServer::start().await;
        mount_session(&server, "sess-1", 1).await;
        mount_acquire(&server, "sess-1", true).await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/renew/sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "ID": "sess-1" }])))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "Key": "v1/locks/pruner", "Session": "sess-1", "Value": "" }
            ])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "Key": "v1/locks/pruner", "Session": "sess-other" }
            ])))
            .mount(&server)
            .await;
        let lock = lock_for(&server);
        let owner = LockIdentity::generate();

        assert!(lock.acquire("pruner", owner, TTL).await.unwrap());
        assert!(lock.renew("pruner", owner, TTL).await.unwrap());
        assert!(!lock.renew("pruner", owner, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_expired_session_is_not_held() {
        let server = MockServer::start().await;
        mount_session(&server, "sess-1", 1).await;
        mount_acquire(&server, "sess-1", true).await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/renew/sess-1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Session id 'sess-1' not found"))
            .expect(1)
            .mount(&server)
            .await;
        let lock = lock_for(&server);
        let owner = LockIdentity::generate();

        assert!(lock.acquire("pruner", owner, TTL).await.unwrap());
        assert!(!lock.renew("pruner", owner, TTL).await.unwrap());
        // Session forgotten: no further renew requests are made
        assert!(!lock.renew("pruner", owner, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_without_session_is_not_held() {
        let server = MockServer::start().await;
        let held = lock_for(&server)
            .renew("pruner", LockIdentity::generate(), TTL)
            .await
            .unwrap();
        assert!(!held);
    }

    #[tokio::test]
    async fn test_release_unbinds_and_destroys_once() {
        let server = MockServer::start().await;
        mount_session(&server, "sess-1", 1).await;
        mount_acquire(&server, "sess-1", true).await;
        Mock::given(method("PUT"))
            .and(path(KEY_PATH))
            .and(query_param("release", "sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/destroy/sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&server)
            .await;
        let lock = lock_for(&server);
        let owner = LockIdentity::generate();

        lock.acquire("pruner", owner, TTL).await.unwrap();
        lock.release("pruner", owner).await.unwrap();
        lock.release("pruner", owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_failures_are_swallowed() {
        let server = MockServer::start().await;
        mount_session(&server, "sess-1", 1).await;
        mount_acquire(&server, "sess-1", true).await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/destroy/sess-1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let lock = lock_for(&server);
        let owner = LockIdentity::generate();

        lock.acquire("pruner", owner, TTL).await.unwrap();
        assert!(lock.release("pruner", owner).await.is_ok());
    }

    #[test]
    fn test_key_without_prefix() {
        let lock = ConsulLock::new("http://consul:8500/", "/", Duration::from_secs(1)).unwrap();
        assert_eq!(lock.key("reaper"), "reaper");
        assert_eq!(lock.url("/v1/status/leader"), "http://consul:8500/v1/status/leader");
    }
}
