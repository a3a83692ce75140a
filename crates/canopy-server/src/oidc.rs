// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OpenID Connect identity provider.
//!
//! Bearer tokens are RS256 JWTs verified offline against the realm public
//! key. Plugin credentials are exchanged at the realm token endpoint with
//! the client-credentials grant.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use canopy_core::Error;
use canopy_core::identity::{AccessToken, IdentityProvider, Principal};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::OidcConfig;

/// Claims canopy reads from an access token.
#[derive(Debug, Clone, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

pub struct OidcIdentity {
    key: DecodingKey,
    validation: Validation,
    token_url: String,
    http: reqwest::Client,
}

impl OidcIdentity {
    pub fn new(config: &OidcConfig) -> Result<Self, Error> {
        let pem = public_key_pem(&config.public_key_b64)?;
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| Error::internal(format!("invalid OIDC public key: {}", e)))?;

        let issuer = config.issuer.trim_end_matches('/');
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.validate_aud = false;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            key,
            validation,
            token_url: format!("{}/protocol/openid-connect/token", issuer),
            http,
        })
    }
}

/// Wrap the base64 DER public key in a PEM envelope.
fn public_key_pem(der_b64: &str) -> Result<String, Error> {
    let der = STANDARD
        .decode(der_b64.trim())
        .map_err(|e| Error::internal(format!("OIDC public key is not base64: {}", e)))?;
    let body = STANDARD.encode(der);

    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    Ok(pem)
}

#[async_trait]
impl IdentityProvider for OidcIdentity {
    async fn validate_token(&self, token: &str) -> canopy_core::Result<Principal> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "JWT validation failed");
            Error::Unauthorized("invalid token".to_string())
        })?;

        let claims = data.claims;
        let mut principal = Principal::new(claims.sub)
            .with_roles(claims.realm_access.unwrap_or_default().roles);
        principal.username = claims.preferred_username;
        Ok(principal)
    }

    async fn client_credentials(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> canopy_core::Result<AccessToken> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| Error::internal(format!("identity provider unreachable: {}", e)))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            debug!(client_id, %status, "Client credentials rejected");
            return Err(Error::Unauthorized(format!(
                "client '{}' was rejected by the identity provider",
                client_id
            )));
        }
        if !status.is_success() {
            warn!(client_id, %status, "Token endpoint failed");
            return Err(Error::internal(format!(
                "identity provider returned {}",
                status
            )));
        }

        response
            .json::<AccessToken>()
            .await
            .map_err(|e| Error::internal(format!("invalid token response: {}", e)))
    }
}
