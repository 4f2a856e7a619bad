use crate::util::encode_path_segment;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum DirectoryError {
    Unavailable,
    Missing,
    Invalid,
}

impl Display for DirectoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "directory unavailable"),
            Self::Missing => write!(f, "unknown identity"),
            Self::Invalid => write!(f, "invalid directory payload"),
        }
    }
}

impl Error for DirectoryError {}

/// Public profile fields served by the hosting application's user store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectoryProfile {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
}

/// Looks up public profiles by identity.
#[async_trait]
pub trait UserDirectory {
    async fn lookup(&self, user_id: &str) -> Result<DirectoryProfile, DirectoryError>;
}

/// Resolves a bearer token to the calling identity.
#[async_trait]
pub trait IdentityResolver {
    async fn resolve(&self, token: &str) -> Result<String, DirectoryError>;
}

/// Directory client backed by the hosting application's internal HTTP API.
pub struct HttpDirectory {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(endpoint: String, token: Option<String>) -> Self {
        HttpDirectory {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl UserDirectory for HttpDirectory {
    async fn lookup(&self, user_id: &str) -> Result<DirectoryProfile, DirectoryError> {
        let url = format!("{}/users/{}", self.endpoint, encode_path_segment(user_id));
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|_| DirectoryError::Unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::Missing);
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Unavailable);
        }
        response
            .json::<DirectoryProfile>()
            .await
            .map_err(|_| DirectoryError::Invalid)
    }
}

#[derive(Deserialize)]
struct SessionPayload {
    user_id: String,
}

#[async_trait]
impl IdentityResolver for HttpDirectory {
    async fn resolve(&self, token: &str) -> Result<String, DirectoryError> {
        let url = format!("{}/session", self.endpoint);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|_| DirectoryError::Unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::UNAUTHORIZED
        {
            return Err(DirectoryError::Missing);
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Unavailable);
        }
        let payload = response
            .json::<SessionPayload>()
            .await
            .map_err(|_| DirectoryError::Invalid)?;
        Ok(payload.user_id)
    }
}

/// Fixed in-memory directory for tests and single-tenant deployments.
#[derive(Default)]
pub struct StaticDirectory {
    profiles: HashMap<String, DirectoryProfile>,
    tokens: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: DirectoryProfile) -> Self {
        self.profiles.insert(profile.user_id.clone(), profile);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn lookup(&self, user_id: &str) -> Result<DirectoryProfile, DirectoryError> {
        self.profiles
            .get(user_id)
            .cloned()
            .ok_or(DirectoryError::Missing)
    }
}

#[async_trait]
impl IdentityResolver for StaticDirectory {
    async fn resolve(&self, token: &str) -> Result<String, DirectoryError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(DirectoryError::Missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_serves_known_entries() {
        let directory = StaticDirectory::new()
            .with_profile(DirectoryProfile {
                user_id: "u1".to_string(),
                display_name: "Alice".to_string(),
                avatar_url: None,
                email: Some("alice@example.org".to_string()),
            })
            .with_token("tok-1", "u1");

        let profile = directory.lookup("u1").await.unwrap();
        assert_eq!(profile.display_name, "Alice");
        assert_eq!(directory.resolve("tok-1").await.unwrap(), "u1");
        assert!(matches!(
            directory.lookup("u2").await,
            Err(DirectoryError::Missing)
        ));
        assert!(matches!(
            directory.resolve("tok-2").await,
            Err(DirectoryError::Missing)
        ));
    }
}
