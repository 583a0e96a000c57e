//! Strategy and intent persistence

use crate::models::{Intent, IntentState, Strategy};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("document {0} already exists")]
    Duplicate(Uuid),

    #[error("intent {0} not found")]
    IntentNotFound(Uuid),

    #[error("intent {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: IntentState,
        to: IntentState,
    },

    #[error("storage backend: {0}")]
    Backend(String),
}

/// Strategy query; empty fields do not filter
#[derive(Debug, Clone, Default)]
pub struct StrategyFilter {
    pub creator_ids: Vec<Uuid>,
    pub ids: Vec<Uuid>,
}

impl StrategyFilter {
    pub fn for_creator(creator_id: Uuid) -> Self {
        Self {
            creator_ids: vec![creator_id],
            ..Default::default()
        }
    }
}

/// Intent query; empty fields do not filter
#[derive(Debug, Clone, Default)]
pub struct IntentFilter {
    /// Creator of the owning strategy
    pub creator_ids: Vec<Uuid>,
    pub strategy_ids: Vec<Uuid>,
    pub states: Vec<IntentState>,
}

impl IntentFilter {
    pub fn for_creator(creator_id: Uuid) -> Self {
        Self {
            creator_ids: vec![creator_id],
            ..Default::default()
        }
    }
}

/// Durable store for strategies and their intents
#[async_trait]
pub trait Repository: Send + Sync {
    /// Store a strategy with all of its intents, or nothing at all
    async fn insert_strategy_and_intents(
        &self,
        strategy: &Strategy,
        intents: &[Intent],
    ) -> Result<(), RepositoryError>;

    /// Move every listed intent to `state`, or none of them
    async fn batch_update_intent_state(
        &self,
        intent_ids: &[Uuid],
        state: IntentState,
    ) -> Result<(), RepositoryError>;

    async fn query_strategies(
        &self,
        filter: &StrategyFilter,
    ) -> Result<Vec<Strategy>, RepositoryError>;

    async fn query_intents(&self, filter: &IntentFilter) -> Result<Vec<Intent>, RepositoryError>;
}

#[derive(Debug, Default)]
struct Documents {
    /// Insertion order
    strategies: Vec<Strategy>,
    intents: Vec<Intent>,
    /// intent id -> position in `intents`
    intent_index: HashMap<Uuid, usize>,
    /// strategy id -> creator id
    creators: HashMap<Uuid, Uuid>,
}

/// In-process repository. Every write happens under one lock, which makes
/// the multi-document insert and the batch update atomic.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    docs: RwLock<Documents>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_strategy_and_intents(
        &self,
        strategy: &Strategy,
        intents: &[Intent],
    ) -> Result<(), RepositoryError> {
        let mut docs = self.docs.write().await;

        if docs.creators.contains_key(&strategy.id) {
            return Err(RepositoryError::Duplicate(strategy.id));
        }
        let mut seen = HashSet::with_capacity(intents.len());
        for intent in intents {
            if docs.intent_index.contains_key(&intent.id) || !seen.insert(intent.id) {
                return Err(RepositoryError::Duplicate(intent.id));
            }
        }

        docs.creators.insert(strategy.id, strategy.creator_id);
        docs.strategies.push(strategy.clone());
        for intent in intents {
            let position = docs.intents.len();
            docs.intent_index.insert(intent.id, position);
            docs.intents.push(intent.clone());
        }
        Ok(())
    }

    async fn batch_update_intent_state(
        &self,
        intent_ids: &[Uuid],
        state: IntentState,
    ) -> Result<(), RepositoryError> {
        let mut docs = self.docs.write().await;

        let mut positions = Vec::with_capacity(intent_ids.len());
        for id in intent_ids {
            let position = *docs
                .intent_index
                .get(id)
                .ok_or(RepositoryError::IntentNotFound(*id))?;
            let current = docs.intents[position].state;
            if !current.can_transition_to(state) {
                return Err(RepositoryError::InvalidTransition {
                    id: *id,
                    from: current,
                    to: state,
                });
            }
            positions.push(position);
        }

        for position in positions {
            docs.intents[position].state = state;
        }
        Ok(())
    }

    async fn query_strategies(
        &self,
        filter: &StrategyFilter,
    ) -> Result<Vec<Strategy>, RepositoryError> {
        let docs = self.docs.read().await;
        Ok(docs
            .strategies
            .iter()
            .filter(|s| filter.creator_ids.is_empty() || filter.creator_ids.contains(&s.creator_id))
            .filter(|s| filter.ids.is_empty() || filter.ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn query_intents(&self, filter: &IntentFilter) -> Result<Vec<Intent>, RepositoryError> {
        let docs = self.docs.read().await;
        Ok(docs
            .intents
            .iter()
            .filter(|i| {
                filter.creator_ids.is_empty()
                    || docs
                        .creators
                        .get(&i.strategy_id)
                        .map_or(false, |creator| filter.creator_ids.contains(creator))
            })
            .filter(|i| filter.strategy_ids.is_empty() || filter.strategy_ids.contains(&i.strategy_id))
            .filter(|i| filter.states.is_empty() || filter.states.contains(&i.state))
            .cloned()
            .collect())
    }
}
