//! `MockFetcher`/`MockFactory`: a scriptable `SegmentFetcher` +
//! `ConnectionFactory` pair for tests, shared by this crate's own unit
//! tests and by `tests/properties.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::FetchError;
use crate::plan::{SegmentHeader, SegmentId};
use crate::pool::{ConnectionFactory, FetchedSegment, SegmentFetcher};

/// Per-segment failure injection: fail the first `count` attempts with
/// `error`, then succeed.
#[derive(Clone)]
pub struct FailureSpec {
    pub count: u32,
    pub error: FetchError,
}

#[derive(Default, Clone)]
pub struct MockScript {
    pub bodies: HashMap<String, Bytes>,
    pub delays: HashMap<String, Duration>,
    pub failures: HashMap<String, FailureSpec>,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.bodies.insert(id.into(), body.into());
        self
    }

    pub fn with_delay(mut self, id: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(id.into(), delay);
        self
    }

    pub fn with_failures(mut self, id: impl Into<String>, count: u32, error: FetchError) -> Self {
        self.failures.insert(id.into(), FailureSpec { count, error });
        self
    }
}

pub struct MockFactory {
    script: MockScript,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    connects: Arc<AtomicU32>,
}

impl MockFactory {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            attempts: Arc::new(Mutex::new(HashMap::new())),
            connects: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, FetchError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            script: self.script.clone(),
            attempts: self.attempts.clone(),
        })
    }
}

pub struct MockConnection {
    script: MockScript,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

#[async_trait]
impl SegmentFetcher for MockConnection {
    async fn fetch_header(&mut self, id: &SegmentId) -> Result<SegmentHeader, FetchError> {
        let size = self
            .script
            .bodies
            .get(id.as_str())
            .map(|b| b.len() as i64)
            .unwrap_or(0);
        Ok(SegmentHeader {
            part_offset: 0,
            part_size: size,
            date: None,
        })
    }

    async fn fetch_segment(
        &mut self,
        id: &SegmentId,
        _group: Option<&str>,
    ) -> Result<FetchedSegment, FetchError> {
        let key = id.as_str().to_string();

        if let Some(delay) = self.script.delays.get(&key) {
            tokio::time::sleep(*delay).await;
        }

        if let Some(spec) = self.script.failures.get(&key) {
            let mut attempts = self.attempts.lock().unwrap();
            let seen = attempts.entry(key.clone()).or_insert(0);
            if *seen < spec.count {
                *seen += 1;
                return Err(spec.error.clone());
            }
        }

        let data = self
            .script
            .bodies
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Bytes::from(key.clone().into_bytes()));

        Ok(FetchedSegment { data, header: None })
    }

    async fn is_healthy(&mut self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_after_scripted_failures() {
        let script = MockScript::new().with_failures(
            "a",
            2,
            FetchError::ArticleNotFound {
                message_id: "a".into(),
            },
        );
        let factory = MockFactory::new(script);
        let mut conn = factory.connect().await.unwrap();
        let id = SegmentId::new("a");
        assert!(conn.fetch_segment(&id, None).await.is_err());
        assert!(conn.fetch_segment(&id, None).await.is_err());
        assert!(conn.fetch_segment(&id, None).await.is_ok());
    }
}
