//! The ureq-backed metaverse client.
//!
//! All calls are blocking HTTP driven through `spawn_blocking`, with a
//! fixed per-request deadline. Status-carrying errors let the heartbeat
//! engines distinguish 401/404 from transient failures.

use std::sync::Arc;
use torii_api::*;

/// Environment variable overriding the metaverse access token.
pub const ACCESS_TOKEN_ENV: &str = "DOMAIN_SERVER_ACCESS_TOKEN";

const REQUEST_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(10);

#[derive(Debug)]
struct Inner {
    base_url: String,
    access_token: Option<String>,
}

/// The ureq-backed metaverse client.
#[derive(Debug)]
pub struct UreqMetaverse {
    inner: Arc<Inner>,
}

impl UreqMetaverse {
    /// Construct a client for the metaverse at `base_url`.
    ///
    /// The access token comes from the settings store
    /// (`metaverse.access_token`), overridden by the
    /// `DOMAIN_SERVER_ACCESS_TOKEN` environment variable.
    pub fn create(
        base_url: impl Into<String>,
        settings: &SettingsStore,
    ) -> DynMetaverseClient {
        let access_token = std::env::var(ACCESS_TOKEN_ENV).ok().or_else(
            || {
                settings
                    .get("metaverse.access_token")
                    .and_then(|v| v.as_str().map(str::to_string))
            },
        );
        let out: DynMetaverseClient = Arc::new(Self {
            inner: Arc::new(Inner {
                base_url: base_url
                    .into()
                    .trim_end_matches('/')
                    .to_string(),
                access_token,
            }),
        });
        out
    }

}

impl Inner {
    fn agent() -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into()
    }

    fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(u16, bytes::Bytes), MetaverseError> {
        let url = format!("{}{path}", self.base_url);
        let agent = Self::agent();
        let auth = self
            .access_token
            .as_ref()
            .map(|token| format!("Bearer {token}"));

        let result = match method {
            "GET" | "DELETE" => {
                let mut req = if method == "GET" {
                    agent.get(&url)
                } else {
                    agent.delete(&url)
                };
                if let Some(auth) = auth.as_ref() {
                    req = req.header("Authorization", auth);
                }
                req.call()
            }
            "PUT" | "POST" => {
                let mut req = if method == "PUT" {
                    agent.put(&url)
                } else {
                    agent.post(&url)
                };
                if let Some(auth) = auth.as_ref() {
                    req = req.header("Authorization", auth);
                }
                match body {
                    Some(body) => req.send_json(body),
                    None => req.send_empty(),
                }
            }
            other => {
                return Err(MetaverseError::Unreachable {
                    msg: format!("unsupported method {other}"),
                })
            }
        };

        match result {
            Ok(mut resp) => {
                let status = resp.status().as_u16();
                let body = resp
                    .body_mut()
                    .read_to_vec()
                    .unwrap_or_default();
                Ok((status, body.into()))
            }
            Err(ureq::Error::StatusCode(status)) => {
                Err(MetaverseError::Http {
                    status,
                    msg: format!("http {status}"),
                })
            }
            Err(err) => Err(MetaverseError::Unreachable {
                msg: err.to_string(),
            }),
        }
    }

    /// Run a blocking request off the async runtime.
    async fn run(
        self: Arc<Self>,
        method: &'static str,
        path: String,
        body: Option<serde_json::Value>,
    ) -> Result<(u16, bytes::Bytes), MetaverseError> {
        tokio::task::spawn_blocking(move || {
            self.request(method, &path, body)
        })
        .await
        .map_err(|e| MetaverseError::Unreachable { msg: e.to_string() })?
    }
}

impl MetaverseClient for UreqMetaverse {
    fn domain_heartbeat(
        &self,
        domain_id: DomainId,
        body: serde_json::Value,
    ) -> BoxFut<'_, Result<(), MetaverseError>> {
        let this = self.inner.clone();
        Box::pin(async move {
            this.run(
                "PUT",
                format!("/api/v1/domains/{domain_id}"),
                Some(body),
            )
            .await
            .map(|_| ())
        })
    }

    fn update_ice_address(
        &self,
        domain_id: DomainId,
        address: String,
    ) -> BoxFut<'_, Result<(), MetaverseError>> {
        let this = self.inner.clone();
        Box::pin(async move {
            this.run(
                "PUT",
                format!("/api/v1/domains/{domain_id}/ice_server_address"),
                Some(serde_json::json!({
                    "domain": { "ice_server_address": address }
                })),
            )
            .await
            .map(|_| ())
        })
    }

    fn request_temporary_name(
        &self,
    ) -> BoxFut<'_, Result<TemporaryDomain, MetaverseError>> {
        let this = self.inner.clone();
        Box::pin(async move {
            let (_, body) = this
                .run("POST", "/api/v1/domains/temporary".into(), None)
                .await?;

            #[derive(serde::Deserialize)]
            struct Data {
                domain: TemporaryDomain,
            }
            #[derive(serde::Deserialize)]
            struct Envelope {
                data: Data,
            }

            let envelope: Envelope = serde_json::from_slice(&body)
                .map_err(|e| MetaverseError::Unreachable {
                    msg: format!("bad temporary domain response: {e}"),
                })?;
            Ok(envelope.data.domain)
        })
    }

    fn upload_public_key(
        &self,
        domain_id: DomainId,
        public_key: bytes::Bytes,
    ) -> BoxFut<'_, Result<(), MetaverseError>> {
        use base64::prelude::*;
        let this = self.inner.clone();
        Box::pin(async move {
            this.run(
                "PUT",
                format!("/api/v1/domains/{domain_id}/public_key"),
                Some(serde_json::json!({
                    "public_key": BASE64_STANDARD.encode(&public_key),
                })),
            )
            .await
            .map(|_| ())
        })
    }

    fn user_public_key(
        &self,
        username: String,
    ) -> BoxFut<'_, Result<Option<bytes::Bytes>, MetaverseError>> {
        use base64::prelude::*;
        let this = self.inner.clone();
        Box::pin(async move {
            let result = this
                .run(
                    "GET",
                    format!("/api/v1/users/{username}/public_key"),
                    None,
                )
                .await;

            let body = match result {
                Ok((_, body)) => body,
                Err(err) if err.status() == Some(404) => {
                    return Ok(None)
                }
                Err(err) => return Err(err),
            };

            #[derive(serde::Deserialize)]
            struct Data {
                public_key: String,
            }
            #[derive(serde::Deserialize)]
            struct Envelope {
                data: Data,
            }

            let envelope: Envelope = serde_json::from_slice(&body)
                .map_err(|e| MetaverseError::Unreachable {
                    msg: format!("bad public key response: {e}"),
                })?;
            let key = BASE64_STANDARD
                .decode(envelope.data.public_key)
                .map_err(|e| MetaverseError::Unreachable {
                    msg: format!("bad public key encoding: {e}"),
                })?;
            Ok(Some(key.into()))
        })
    }

    fn user_groups(
        &self,
        username: String,
    ) -> BoxFut<'_, Result<UserGroups, MetaverseError>> {
        let this = self.inner.clone();
        Box::pin(async move {
            let (_, body) = this
                .run(
                    "GET",
                    format!("/api/v1/users/{username}/groups"),
                    None,
                )
                .await?;

            #[derive(serde::Deserialize)]
            struct Membership {
                name: String,
                #[serde(default)]
                rank: u8,
            }
            #[derive(serde::Deserialize)]
            struct Data {
                #[serde(default)]
                groups: Vec<Membership>,
                #[serde(default)]
                is_friend: bool,
            }
            #[derive(serde::Deserialize)]
            struct Envelope {
                data: Data,
            }

            let envelope: Envelope = serde_json::from_slice(&body)
                .map_err(|e| MetaverseError::Unreachable {
                    msg: format!("bad groups response: {e}"),
                })?;
            Ok(UserGroups {
                groups: envelope
                    .data
                    .groups
                    .into_iter()
                    .map(|m| (m.name, m.rank))
                    .collect(),
                is_friend: envelope.data.is_friend,
            })
        })
    }

    fn proxy(
        &self,
        method: String,
        path: String,
        body: Option<serde_json::Value>,
    ) -> BoxFut<'_, Result<(u16, bytes::Bytes), MetaverseError>> {
        let this = self.inner.clone();
        Box::pin(async move {
            let method: &'static str = match method.as_str() {
                "GET" => "GET",
                "PUT" => "PUT",
                "POST" => "POST",
                "DELETE" => "DELETE",
                _ => {
                    return Err(MetaverseError::Unreachable {
                        msg: format!("unsupported method {method}"),
                    })
                }
            };
            this.run(method, path, body).await
        })
    }
}
