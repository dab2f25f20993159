//! Routing store: `DomainGroup` CRUD with monotonic ids and cascading
//! deletion (spec §3 "DomainGroup", §6 group CRUD).
//!
//! Grounded in `wirewarden-api::db::vpn`'s CRUD-over-a-guarded-map shape;
//! persistence target is the kv_store (SPEC_FULL.md §4.9) rather than a
//! dedicated table since a `Vec<DomainGroup>` is the unit of change.

use std::sync::Arc;

use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock;

use splitvpn_types::{Categorized, DomainGroup, ErrorCategory, UpsertGroupRequest};

use crate::compiler::{self, CompilerError};
use crate::db::{self, DbError};

const GROUPS_KEY: &str = "groups";

#[derive(Debug, Error)]
pub enum RoutingStoreError {
    #[error(transparent)]
    Compiler(#[from] CompilerError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("group not found: {0}")]
    NotFound(i64),
    #[error("group name already in use: {0}")]
    NameConflict(String),
}

impl Categorized for RoutingStoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            RoutingStoreError::Compiler(e) => e.category(),
            RoutingStoreError::Db(e) => e.category(),
            RoutingStoreError::NotFound(_) => ErrorCategory::NotFound,
            RoutingStoreError::NameConflict(_) => ErrorCategory::Conflict,
        }
    }
}

struct State {
    groups: Vec<DomainGroup>,
    next_id: i64,
}

/// Owns the live `[DomainGroup]` list, persisted to the kv_store on every
/// mutation (spec §3 "DomainGroup ... Lifecycle: created/updated/deleted
/// via the routing store; deletion cascades to its rules and their set
/// pairs").
pub struct RoutingStore {
    pool: SqlitePool,
    state: RwLock<State>,
}

impl RoutingStore {
    pub async fn load(pool: SqlitePool) -> Result<Self, RoutingStoreError> {
        let groups: Vec<DomainGroup> = db::kv_get(&pool, GROUPS_KEY).await?.unwrap_or_default();
        let next_id = groups.iter().map(|g| g.id).max().unwrap_or(0) + 1;
        Ok(Self {
            pool,
            state: RwLock::new(State { groups, next_id }),
        })
    }

    pub async fn list(&self) -> Vec<DomainGroup> {
        self.state.read().await.groups.clone()
    }

    pub async fn get(&self, id: i64) -> Result<DomainGroup, RoutingStoreError> {
        self.state
            .read()
            .await
            .groups
            .iter()
            .find(|g| g.id == id)
            .cloned()
            .ok_or(RoutingStoreError::NotFound(id))
    }

    #[tracing::instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create(&self, req: UpsertGroupRequest) -> Result<DomainGroup, RoutingStoreError> {
        let mut guard = self.state.write().await;
        if guard.groups.iter().any(|g| g.name == req.name) {
            return Err(RoutingStoreError::NameConflict(req.name));
        }
        let mut group = DomainGroup {
            id: guard.next_id,
            name: req.name,
            egress_vpn: req.egress_vpn,
            rules: req.rules,
        };
        compiler::normalize_group(&mut group)?;
        guard.next_id += 1;
        guard.groups.push(group.clone());
        self.persist(&guard.groups).await?;
        Ok(group)
    }

    #[tracing::instrument(skip(self, req))]
    pub async fn update(
        &self,
        id: i64,
        req: UpsertGroupRequest,
    ) -> Result<DomainGroup, RoutingStoreError> {
        let mut guard = self.state.write().await;
        if guard.groups.iter().any(|g| g.id != id && g.name == req.name) {
            return Err(RoutingStoreError::NameConflict(req.name));
        }
        let index = guard
            .groups
            .iter()
            .position(|g| g.id == id)
            .ok_or(RoutingStoreError::NotFound(id))?;

        let mut group = DomainGroup {
            id,
            name: req.name,
            egress_vpn: req.egress_vpn,
            rules: req.rules,
        };
        compiler::normalize_group(&mut group)?;
        guard.groups[index] = group.clone();
        self.persist(&guard.groups).await?;
        Ok(group)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), RoutingStoreError> {
        let mut guard = self.state.write().await;
        let before = guard.groups.len();
        guard.groups.retain(|g| g.id != id);
        if guard.groups.len() == before {
            return Err(RoutingStoreError::NotFound(id));
        }
        self.persist(&guard.groups).await
    }

    /// Replace the entire group list in one shot (spec §4.6 import step
    /// "Clear routing state (`ReplaceState(nil, nil)`)" followed by
    /// recreation from the snapshot).
    pub async fn replace_all(&self, groups: Vec<DomainGroup>) -> Result<(), RoutingStoreError> {
        let mut guard = self.state.write().await;
        guard.next_id = groups.iter().map(|g| g.id).max().unwrap_or(0) + 1;
        guard.groups = groups;
        self.persist(&guard.groups).await
    }

    async fn persist(&self, groups: &[DomainGroup]) -> Result<(), RoutingStoreError> {
        db::kv_put(&self.pool, GROUPS_KEY, &groups).await?;
        Ok(())
    }
}

pub type SharedRoutingStore = Arc<RoutingStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str) -> UpsertGroupRequest {
        UpsertGroupRequest {
            name: name.to_string(),
            egress_vpn: "sgp".to_string(),
            rules: vec![splitvpn_types::RoutingRule {
                exact_domains: vec!["example.com".to_string()],
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn create_assigns_monotonic_ids_and_rejects_name_conflict() {
        let pool = crate::db::test_pool().await;
        let store = RoutingStore::load(pool).await.unwrap();

        let g1 = store.create(req("Streaming")).await.unwrap();
        let g2 = store.create(req("Gaming")).await.unwrap();
        assert_eq!(g1.id, 1);
        assert_eq!(g2.id, 2);

        let err = store.create(req("Streaming")).await.unwrap_err();
        assert!(matches!(err, RoutingStoreError::NameConflict(_)));
    }

    #[tokio::test]
    async fn delete_removes_group_and_is_idempotent_failure() {
        let pool = crate::db::test_pool().await;
        let store = RoutingStore::load(pool).await.unwrap();
        let g1 = store.create(req("Streaming")).await.unwrap();

        store.delete(g1.id).await.unwrap();
        assert!(store.list().await.is_empty());
        assert!(matches!(
            store.delete(g1.id).await.unwrap_err(),
            RoutingStoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn replace_all_reloads_next_id_from_max() {
        let pool = crate::db::test_pool().await;
        let store = RoutingStore::load(pool).await.unwrap();
        store
            .replace_all(vec![DomainGroup {
                id: 7,
                name: "Imported".to_string(),
                egress_vpn: "sgp".to_string(),
                rules: vec![],
            }])
            .await
            .unwrap();

        let created = store.create(req("New")).await.unwrap();
        assert_eq!(created.id, 8);
    }
}
