//! In-Memory Adapters
//!
//! Process-local implementations of the domain ports. The ledger backs
//! single-node deployments without Redis; the stub fetcher lets tests drive
//! the download path without network access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::domain::ports::{AccessLedger, FetchRequest, FetchedBody, Fetcher};
use crate::error::{Error, Result};

// =============================================================================
// InMemoryLedger
// =============================================================================

/// Access ledger held in a concurrent map. Not shared across nodes and lost
/// on restart.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: DashMap<String, DateTime<Utc>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record directly, bypassing the clock.
    pub fn insert(&self, key: impl Into<String>, at: DateTime<Utc>) {
        self.entries.insert(key.into(), at);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AccessLedger for InMemoryLedger {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.entries.get(key).map(|at| *at))
    }

    async fn set(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.entries.insert(key.to_string(), at);
        Ok(())
    }
}

// =============================================================================
// StubFetcher
// =============================================================================

/// Canned upstream answer.
#[derive(Debug, Clone)]
struct CannedResponse {
    status: u16,
    chunks: Vec<Bytes>,
    /// Fail the body after the last chunk instead of ending it
    truncated: bool,
}

/// Canned fetcher that records every request it receives.
#[derive(Debug)]
pub struct StubFetcher {
    response: Option<CannedResponse>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<FetchRequest>>,
}

impl StubFetcher {
    /// Answer every request with `status` and `body`.
    pub fn with_body(status: u16, body: impl Into<Bytes>) -> Self {
        Self::with_chunks(status, vec![body.into()])
    }

    /// Answer every request with `status` and a body delivered as `chunks`.
    pub fn with_chunks(status: u16, chunks: Vec<Bytes>) -> Self {
        Self::new(Some(CannedResponse {
            status,
            chunks,
            truncated: false,
        }))
    }

    /// Answer `200`, send `first_chunk`, then fail the body.
    pub fn with_truncated_body(first_chunk: impl Into<Bytes>) -> Self {
        Self::new(Some(CannedResponse {
            status: 200,
            chunks: vec![first_chunk.into()],
            truncated: true,
        }))
    }

    /// Fail every request as if the upstream timed out.
    pub fn failing() -> Self {
        Self::new(None)
    }

    fn new(response: Option<CannedResponse>) -> Self {
        Self {
            response,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Hold every answer back for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of fetches started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedBody> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let host = request.host().to_string();
        let Some(response) = &self.response else {
            return Err(Error::FetchTimeout { host });
        };

        // A truncated body ends in a transport error.
        let failure = response
            .truncated
            .then(|| Err(Error::FetchTimeout { host }));
        let chunks = response.chunks.clone().into_iter().map(Ok).chain(failure);
        let body = stream::iter(chunks).boxed();
        Ok(FetchedBody::new(response.status, body))
    }
}
