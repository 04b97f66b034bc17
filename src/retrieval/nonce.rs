use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{RetrievalError, StoreError};
use crate::store::OptionStore;
use crate::TARGET_RETRIEVAL;

pub const OPTION_CHUNK_NONCE: &str = "chunk_nonce";

/// One-time token authorizing a request to run the next retrieval chunk.
#[derive(Clone)]
pub struct ChunkToken {
    options: Arc<dyn OptionStore>,
    rng: SystemRandom,
}

impl ChunkToken {
    pub fn new(options: Arc<dyn OptionStore>) -> Self {
        Self {
            options,
            rng: SystemRandom::new(),
        }
    }

    /// Creates and persists a fresh token, replacing any outstanding one.
    pub async fn issue(&self) -> Result<String, RetrievalError> {
        let mut seed = [0u8; 32];
        self.rng.fill(&mut seed).map_err(|_| RetrievalError::Random)?;
        let token = hex_digest(&seed);

        self.options
            .update_option(OPTION_CHUNK_NONCE, &Value::String(token.clone()))
            .await?;
        debug!(target: TARGET_RETRIEVAL, "Issued chunk token");
        Ok(token)
    }

    /// Checks `presented` against the outstanding token. The token is spent either way.
    pub async fn consume(&self, presented: &str) -> Result<bool, StoreError> {
        let expected = self.options.get_option(OPTION_CHUNK_NONCE).await?;
        self.options.delete_option(OPTION_CHUNK_NONCE).await?;

        let valid = match expected.as_ref().and_then(Value::as_str) {
            Some(expected) if !expected.is_empty() => constant_time_eq(expected, presented),
            _ => false,
        };
        if !valid {
            warn!(target: TARGET_RETRIEVAL, "Rejected chunk token");
        }
        Ok(valid)
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}
