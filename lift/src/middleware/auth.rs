//! JWT authentication middleware
//!
//! Verifies a bearer token against a configured secret or PEM-encoded key,
//! then populates the context identity (user id, tenant id, roles, full
//! claim set). Verification failure short-circuits with `UNAUTHORIZED`.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};

use crate::context::{Context, Identity};
use crate::error::{LiftError, Result};
use crate::middleware::{Middleware, Next};

/// Configuration for [`JwtAuth`]
#[derive(Clone)]
pub struct AuthConfig {
    /// Verification algorithm
    pub algorithm: Algorithm,
    /// Expected issuer, when validated
    pub issuer: Option<String>,
    /// Expected audience, when validated
    pub audience: Option<String>,
    /// Claim carrying the user identifier
    pub user_claim: String,
    /// Claim carrying the tenant identifier
    pub tenant_claim: String,
    /// Claim carrying the role list
    pub roles_claim: String,
    /// Query parameter checked when no authorization header is present
    /// (WebSocket `$connect` events carry tokens in the query string)
    pub token_query_parameter: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::HS256,
            issuer: None,
            audience: None,
            user_claim: "sub".to_string(),
            tenant_claim: "tenant_id".to_string(),
            roles_claim: "roles".to_string(),
            token_query_parameter: None,
        }
    }
}

impl AuthConfig {
    /// Default configuration (HS256, standard claim names)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the verification algorithm
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Require a specific issuer
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Require a specific audience
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Use custom claim names for user, tenant, and roles
    pub fn with_claims(
        mut self,
        user: impl Into<String>,
        tenant: impl Into<String>,
        roles: impl Into<String>,
    ) -> Self {
        self.user_claim = user.into();
        self.tenant_claim = tenant.into();
        self.roles_claim = roles.into();
        self
    }

    /// Also accept the token from a query parameter
    pub fn with_token_query_parameter(mut self, name: impl Into<String>) -> Self {
        self.token_query_parameter = Some(name.into());
        self
    }
}

/// JWT authentication middleware
pub struct JwtAuth {
    key: DecodingKey,
    validation: Validation,
    config: AuthConfig,
}

impl JwtAuth {
    /// Verify tokens against a shared secret
    pub fn from_secret(secret: &[u8], config: AuthConfig) -> Self {
        Self::build(DecodingKey::from_secret(secret), config)
    }

    /// Verify tokens against a PEM-encoded RSA public key
    pub fn from_rsa_pem(pem: &[u8], config: AuthConfig) -> Result<Self> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| LiftError::internal(format!("invalid RSA public key: {e}")))?;
        Ok(Self::build(key, config))
    }

    fn build(key: DecodingKey, config: AuthConfig) -> Self {
        let mut validation = Validation::new(config.algorithm);
        if let Some(iss) = &config.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = &config.audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }
        Self {
            key,
            validation,
            config,
        }
    }

    fn extract_token<'a>(&self, ctx: &'a Context) -> Option<&'a str> {
        if let Some(header) = ctx.header("authorization") {
            return header.strip_prefix("Bearer ").or(Some(header)).map(str::trim);
        }
        if let Some(param) = &self.config.token_query_parameter {
            return ctx.query(param);
        }
        None
    }

    fn identity_from_claims(&self, claims: &Map<String, Value>) -> Identity {
        let string_claim = |name: &str| {
            claims
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let roles = claims
            .get(&self.config.roles_claim)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Identity {
            tenant_id: string_claim(&self.config.tenant_claim),
            user_id: string_claim(&self.config.user_claim),
            roles,
            claims: Some(claims.clone()),
        }
    }
}

#[async_trait]
impl Middleware for JwtAuth {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let token = self
            .extract_token(&ctx)
            .ok_or_else(|| LiftError::unauthorized("missing bearer token"))?;

        let data = decode::<Map<String, Value>>(token, &self.key, &self.validation)
            .map_err(|e| LiftError::unauthorized(format!("invalid token: {e}")))?;

        ctx.set_identity(self.identity_from_claims(&data.claims));
        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "auth"
    }
}
