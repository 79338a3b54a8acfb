use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use movie_game_core::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid bearer token")]
    Invalid,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Uuid, AuthError>;
}

pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::Missing)
}

#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    tokens: HashMap<String, Uuid>,
}

impl StaticTokens {
    pub fn parse(pairs: &str) -> Self {
        let tokens = pairs
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(token, uid)| (token.trim().to_string(), uid.trim().to_string()))
            .filter(|(token, uid)| !token.is_empty() && !uid.is_empty())
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, token: &str) -> Result<Uuid, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::Invalid)
    }
}
