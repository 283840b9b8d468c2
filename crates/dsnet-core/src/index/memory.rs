//! In-memory entity index
//!
//! Holds a set of named entities. A cleartext query is split on whitespace
//! and the entities it names are returned as a sorted JSON array of strings.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{IndexError, LocalIndex};
use crate::query::{PayloadKind, QueryPayload};

/// Entity set searched by exact term match
#[derive(Debug)]
pub struct MemoryIndex {
    entities: RwLock<BTreeSet<String>>,
    available: AtomicBool,
}

impl MemoryIndex {
    pub fn new<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entities: RwLock::new(entities.into_iter().map(Into::into).collect()),
            available: AtomicBool::new(true),
        }
    }

    /// Load one entity per non-blank line
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read entities file: {:?}", path))?;

        Ok(Self::new(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        ))
    }

    pub async fn insert(&self, entity: impl Into<String>) {
        self.entities.write().await.insert(entity.into());
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    /// Simulate the backend going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalIndex for MemoryIndex {
    async fn execute(&self, payload: &QueryPayload) -> Result<Vec<u8>, IndexError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("memory index offline".into()));
        }
        if payload.kind != PayloadKind::Cleartext {
            return Err(IndexError::Unsupported(payload.kind));
        }

        let text = String::from_utf8_lossy(&payload.bytes);
        let terms: BTreeSet<&str> = text.split_whitespace().collect();

        let entities = self.entities.read().await;
        let matches: Vec<&str> = terms
            .into_iter()
            .filter(|term| entities.contains(*term))
            .collect();

        serde_json::to_vec(&matches).map_err(|e| IndexError::Unavailable(e.to_string()))
    }
}
