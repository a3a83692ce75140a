// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity provider seam.
//!
//! Token validation and the client-credentials exchange used by plugin
//! registration both live behind [`IdentityProvider`]. The server wires an
//! OIDC-backed implementation; [`StaticIdentity`] serves tests and local
//! development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            username: None,
            roles: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// A token issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Validate a bearer token and resolve its principal.
    ///
    /// Fails with [`Error::Unauthorized`] for any token that cannot be
    /// verified.
    async fn validate_token(&self, token: &str) -> Result<Principal>;

    /// Exchange client credentials for an access token.
    ///
    /// Fails with [`Error::Unauthorized`] when the provider rejects the
    /// credentials.
    async fn client_credentials(&self, client_id: &str, client_secret: &str)
    -> Result<AccessToken>;
}

/// In-memory provider with a fixed token table and client list.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    tokens: RwLock<HashMap<String, Principal>>,
    clients: RwLock<HashMap<String, String>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as the given principal.
    pub fn with_token(self, token: impl Into<String>, principal: Principal) -> Self {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), principal);
        }
        self
    }

    /// Accept a client-credentials pair.
    pub fn with_client(self, client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(client_id.into(), secret.into());
        }
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn validate_token(&self, token: &str) -> Result<Principal> {
        let tokens = self
            .tokens
            .read()
            .map_err(|_| Error::internal("identity table poisoned"))?;
        tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Error::Unauthorized("invalid token".to_string()))
    }

    async fn client_credentials(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<AccessToken> {
        let known = {
            let clients = self
                .clients
                .read()
                .map_err(|_| Error::internal("identity table poisoned"))?;
            clients.get(client_id).is_some_and(|s| s == client_secret)
        };
        if !known {
            return Err(Error::Unauthorized(format!(
                "client '{}' rejected",
                client_id
            )));
        }

        let token = format!("client-{}-{}", client_id, uuid::Uuid::new_v4());
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(
                token.clone(),
                Principal::new(client_id).with_roles(["plugin"]),
            );
        }
        Ok(AccessToken {
            access_token: token,
            token_type: default_token_type(),
            expires_in: 3600,
            refresh_token: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_identity_tokens() {
        let identity = StaticIdentity::new()
            .with_token("t-1", Principal::new("alice").with_roles(["canopy"]));

        let principal = identity.validate_token("t-1").await.unwrap();
        assert_eq!(principal.subject, "alice");
        assert!(principal.has_role("canopy"));
        assert!(!principal.has_role("admin"));

        let err = identity.validate_token("nope").await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_static_identity_client_credentials() {
        let identity = StaticIdentity::new().with_client("plugin-a", "s3cret");

        let token = identity
            .client_credentials("plugin-a", "s3cret")
            .await
            .unwrap();
        assert_eq!(token.token_type, "Bearer");

        // Issued tokens validate afterwards.
        let principal = identity.validate_token(&token.access_token).await.unwrap();
        assert_eq!(principal.subject, "plugin-a");

        let err = identity
            .client_credentials("plugin-a", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }
}
