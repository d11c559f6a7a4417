//! Injected collaborator services
//!
//! The engine triggers these but owns none of their logic: encryption state
//! lives with the encryption collaborator, share upkeep with the share
//! collaborator. Defaults are no-ops so the engine runs without either.

use async_trait::async_trait;
use quill_store::Item;

use crate::errors::Result;

/// Encryption collaborator. Enabling encryption prompts the user for the
/// password out-of-band; the engine must not assume the call leaves items
/// readable.
#[async_trait]
pub trait EncryptionService: Send + Sync {
    async fn enable_encryption(&self, master_key: &Item) -> Result<()>;
    async fn load_master_keys_from_settings(&self) -> Result<()>;
}

/// Share collaborator; `maintenance` runs after a full sync.
#[async_trait]
pub trait ShareService: Send + Sync {
    async fn maintenance(&self) -> Result<()>;
}

pub struct NoopEncryptionService;

#[async_trait]
impl EncryptionService for NoopEncryptionService {
    async fn enable_encryption(&self, _master_key: &Item) -> Result<()> {
        Ok(())
    }

    async fn load_master_keys_from_settings(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoopShareService;

#[async_trait]
impl ShareService for NoopShareService {
    async fn maintenance(&self) -> Result<()> {
        Ok(())
    }
}
