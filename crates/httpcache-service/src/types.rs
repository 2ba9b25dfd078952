//! Types shared between the coordinator, its backends and the transactions driving it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The priority a request is issued with.
///
/// Backends may use this to order their own work, the coordinator only passes it along.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Idle,
    Lowest,
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

/// What a transaction is currently waiting for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Idle,
    /// Waiting for the backend, or for another transaction to finish with the entry.
    WaitingForCache,
    /// Waiting for the network to send the request.
    SendingRequest,
    /// Waiting for the network to respond.
    WaitingForResponse,
    /// Reading the response body.
    ReadingResponse,
}

/// The stored response headers of a cache entry.
///
/// This is what a headers-validation transaction compares against, and what gets rewritten
/// when a writer is cancelled and the entry is marked as truncated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// The HTTP status code.
    pub status: u16,
    /// The time the response was received from the network.
    pub response_time: DateTime<Utc>,
    /// The `ETag` header, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// The `Last-Modified` header, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// The `Content-Length` header, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// Whether the stored body is incomplete.
    #[serde(default)]
    pub truncated: bool,
}

impl ResponseInfo {
    pub fn new(status: u16, response_time: DateTime<Utc>) -> Self {
        Self {
            status,
            response_time,
            etag: None,
            last_modified: None,
            content_length: None,
            truncated: false,
        }
    }

    /// Whether a partially stored body can be completed later with a range request.
    pub fn has_strong_validator(&self) -> bool {
        let strong_etag = self
            .etag
            .as_deref()
            .is_some_and(|etag| !etag.is_empty() && !etag.starts_with("W/"));
        strong_etag || self.last_modified.is_some()
    }
}

/// The parts of an HTTP request the coordinator cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// The request method, e.g. `GET`.
    pub method: String,
    /// The backend key of the entry this request maps to.
    pub key: String,
    /// Only use what is already in the cache, never go to the network.
    pub only_from_cache: bool,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            key: key.into(),
            only_from_cache: false,
        }
    }

    /// A `GET` request for the given key.
    pub fn get(key: impl Into<String>) -> Self {
        Self::new("GET", key)
    }
}
