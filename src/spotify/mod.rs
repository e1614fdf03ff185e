//! Spotify Web API client: wire models, token acquisition and the batched
//! catalog lookups used by reconciliation.

pub mod client;
pub mod models;
pub mod token;

pub use client::{
    CatalogApi, CatalogTransport, HttpCatalogTransport, SpotifyClient, TransportResponse,
};
pub use token::{
    Grant, HttpTokenFetcher, JsonFileTokenStore, StoredToken, TokenFetcher, TokenProvider,
    TokenStore,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// No usable token could be obtained, or the API rejected ours. Fatal
    /// for the whole reconciliation run.
    #[error("Authentication failed: {0}")]
    Authentication(String),
    /// Network-level failure, retried per batch up to the attempt ceiling.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for CatalogError {
    fn from(e: reqwest::Error) -> Self {
        CatalogError::Transport(e.to_string())
    }
}
