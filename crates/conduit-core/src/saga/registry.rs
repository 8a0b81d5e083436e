use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::SagaError;
use crate::saga::definition::SagaDefinition;
use crate::saga::store::SagaStore;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefineStatus {
    Registered,
    /// An identical definition was already registered.
    Unchanged,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DefineReceipt {
    pub id: String,
    pub step_count: usize,
    pub compensation_step_count: usize,
    pub status: DefineStatus,
}

/// Saga definitions, persisted through the store and cached in memory.
///
/// The cache is write-through and never authoritative: a miss falls back to
/// storage and fills the cache from it.
pub struct SagaRegistry {
    store: SagaStore,
    cache: RwLock<HashMap<String, Arc<SagaDefinition>>>,
}

impl SagaRegistry {
    pub fn new(store: SagaStore) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and persist `def`. Re-registering identical content is a
    /// no-op; different content under an existing id is a conflict.
    pub async fn define(&self, def: SagaDefinition) -> Result<DefineReceipt, SagaError> {
        def.validate()?;
        let step_count = def.steps.len();
        let compensation_step_count = def.compensation_step_count();
        let receipt = |status| DefineReceipt {
            id: def.id.clone(),
            step_count,
            compensation_step_count,
            status,
        };

        let mut cache = self.cache.write().await;
        let existing = match cache.get(&def.id) {
            Some(existing) => Some(existing.clone()),
            None => self.store.get_definition(&def.id)?.map(Arc::new),
        };
        if let Some(existing) = existing {
            if *existing != def {
                return Err(SagaError::DefinitionConflict(def.id.clone()));
            }
            debug!(saga = %def.id, "saga definition unchanged");
            let receipt = receipt(DefineStatus::Unchanged);
            cache.insert(def.id.clone(), existing);
            return Ok(receipt);
        }

        self.store.put_definition(&def)?;
        let receipt = receipt(DefineStatus::Registered);
        info!(
            saga = %def.id,
            steps = step_count,
            compensations = compensation_step_count,
            "saga definition registered"
        );
        cache.insert(def.id.clone(), Arc::new(def));
        Ok(receipt)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<SagaDefinition>, SagaError> {
        if let Some(def) = self.cache.read().await.get(id) {
            return Ok(def.clone());
        }
        let def = self
            .store
            .get_definition(id)?
            .map(Arc::new)
            .ok_or_else(|| SagaError::DefinitionNotFound(id.to_string()))?;
        self.cache
            .write()
            .await
            .insert(id.to_string(), def.clone());
        Ok(def)
    }

    /// Drop the cached copy of `id`; the next `get` reads storage.
    pub async fn invalidate(&self, id: &str) {
        self.cache.write().await.remove(id);
    }
}
