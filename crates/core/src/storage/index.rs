use super::{
    apply_fields, transition, NodeExecutionStore, StageExecutionField, StageExecutionStore,
    UpdateAck,
};
use crate::types::{NodeExecution, Scope, StageExecutionEntity, Status};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const NODE_EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("node_executions");
const NODE_CHILDREN_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("node_children");
const STAGE_EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("stage_executions");
const STAGE_STATUS_INDEX_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("stage_status_index");

const ROOT_PARENT: &str = "__root__";

fn children_key(plan_execution_id: &str, parent_id: Option<&str>) -> String {
    format!("{}/{}", plan_execution_id, parent_id.unwrap_or(ROOT_PARENT))
}

fn stage_key(account: &str, org: &str, project: &str, stage_execution_id: &str) -> String {
    format!("{}/{}/{}/{}", account, org, project, stage_execution_id)
}

fn stage_status_key(account: &str, stage_execution_id: &str, org: &str, project: &str) -> String {
    format!("{}/{}/{}/{}", account, stage_execution_id, org, project)
}

/// Execution store backed by redb
#[derive(Clone)]
pub struct RedbExecutionStore {
    db: Arc<Database>,
}

impl RedbExecutionStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _node_executions = write_txn
                .open_table(NODE_EXECUTIONS_TABLE)
                .context("Failed to open node executions table")?;
            let _node_children = write_txn
                .open_table(NODE_CHILDREN_TABLE)
                .context("Failed to open node children table")?;
            let _stage_executions = write_txn
                .open_table(STAGE_EXECUTIONS_TABLE)
                .context("Failed to open stage executions table")?;
            let _stage_status_index = write_txn
                .open_table(STAGE_STATUS_INDEX_TABLE)
                .context("Failed to open stage status index")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert or replace a node execution, registering it under its parent on first save
    pub fn save_node_execution(&self, node_execution: &NodeExecution) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(NODE_EXECUTIONS_TABLE)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(node_execution)
                .context("Failed to serialize node execution")?;
            let previous = table
                .insert(node_execution.uuid.as_str(), value.as_slice())
                .context("Failed to insert node execution")?;
            let is_new = previous.is_none();
            drop(previous);

            if is_new {
                let mut children = write_txn
                    .open_table(NODE_CHILDREN_TABLE)
                    .context("Failed to open children table")?;
                let key = children_key(
                    node_execution.plan_execution_id(),
                    node_execution.parent_id.as_deref(),
                );
                let mut ids: Vec<String> = match children.get(key.as_str())? {
                    Some(guard) => serde_json::from_slice(guard.value())
                        .context("Failed to deserialize children index")?,
                    None => Vec::new(),
                };
                ids.push(node_execution.uuid.clone());
                let value = serde_json::to_vec(&ids).context("Failed to serialize children index")?;
                children
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to update children index")?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    /// Get a node execution by ID
    pub fn get_node_execution(&self, node_execution_id: &str) -> Result<Option<NodeExecution>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(NODE_EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let value = table
            .get(node_execution_id)
            .context("Failed to get node execution")?;

        match value {
            Some(guard) => {
                let ne: NodeExecution = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize node execution")?;
                Ok(Some(ne))
            }
            None => Ok(None),
        }
    }

    pub fn children_of(
        &self,
        plan_execution_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<NodeExecution>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let children = read_txn
            .open_table(NODE_CHILDREN_TABLE)
            .context("Failed to open children table")?;
        let table = read_txn
            .open_table(NODE_EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let key = children_key(plan_execution_id, parent_id);
        let ids: Vec<String> = match children.get(key.as_str())? {
            Some(guard) => serde_json::from_slice(guard.value())
                .context("Failed to deserialize children index")?,
            None => return Ok(Vec::new()),
        };

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(guard) = table.get(id.as_str())? {
                let ne: NodeExecution = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize node execution")?;
                if !ne.old_retry {
                    result.push(ne);
                }
            }
        }
        Ok(result)
    }

    /// List node executions of a plan execution (full scan)
    pub fn list_node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(NODE_EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let mut result = Vec::new();
        for item in table.iter().context("Failed to iterate node executions")? {
            let (_key, value) = item.context("Failed to read item")?;
            let ne: NodeExecution = serde_json::from_slice(value.value())
                .context("Failed to deserialize node execution")?;
            if ne.plan_execution_id() == plan_execution_id {
                result.push(ne);
            }
        }

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    pub fn transition_node_execution(
        &self,
        node_execution_id: &str,
        to: Status,
        allowed_from: &[Status],
    ) -> Result<Option<NodeExecution>> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let updated = {
            let mut table = write_txn
                .open_table(NODE_EXECUTIONS_TABLE)
                .context("Failed to open table")?;

            let current: Option<NodeExecution> = match table.get(node_execution_id)? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value())
                        .context("Failed to deserialize node execution")?,
                ),
                None => None,
            };

            match current {
                Some(mut ne) if allowed_from.contains(&ne.status) => {
                    transition(&mut ne, to);
                    let value = serde_json::to_vec(&ne)
                        .context("Failed to serialize node execution")?;
                    table
                        .insert(node_execution_id, value.as_slice())
                        .context("Failed to update node execution")?;
                    Some(ne)
                }
                _ => None,
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(updated)
    }

    /// Re-point children and successors of a retried node at its new attempt
    pub fn relink_retried_node(
        &self,
        plan_execution_id: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<usize> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let relinked = {
            let mut table = write_txn
                .open_table(NODE_EXECUTIONS_TABLE)
                .context("Failed to open table")?;

            let mut changed = Vec::new();
            for item in table.iter().context("Failed to iterate node executions")? {
                let (_key, value) = item.context("Failed to read item")?;
                let mut ne: NodeExecution = serde_json::from_slice(value.value())
                    .context("Failed to deserialize node execution")?;
                if ne.plan_execution_id() != plan_execution_id {
                    continue;
                }
                let mut touched = false;
                if ne.parent_id.as_deref() == Some(old_id) {
                    ne.parent_id = Some(new_id.to_string());
                    touched = true;
                }
                if ne.previous_id.as_deref() == Some(old_id) {
                    ne.previous_id = Some(new_id.to_string());
                    touched = true;
                }
                if touched {
                    changed.push(ne);
                }
            }
            for ne in &changed {
                let value = serde_json::to_vec(ne).context("Failed to serialize node execution")?;
                table
                    .insert(ne.uuid.as_str(), value.as_slice())
                    .context("Failed to update node execution")?;
            }

            let mut children = write_txn
                .open_table(NODE_CHILDREN_TABLE)
                .context("Failed to open children table")?;
            let old_key = children_key(plan_execution_id, Some(old_id));
            let moved: Vec<String> = match children.remove(old_key.as_str())? {
                Some(guard) => serde_json::from_slice(guard.value())
                    .context("Failed to deserialize children index")?,
                None => Vec::new(),
            };
            if !moved.is_empty() {
                let new_key = children_key(plan_execution_id, Some(new_id));
                let mut ids: Vec<String> = match children.get(new_key.as_str())? {
                    Some(guard) => serde_json::from_slice(guard.value())
                        .context("Failed to deserialize children index")?,
                    None => Vec::new(),
                };
                ids.extend(moved);
                let value = serde_json::to_vec(&ids).context("Failed to serialize children index")?;
                children
                    .insert(new_key.as_str(), value.as_slice())
                    .context("Failed to update children index")?;
            }

            changed.len()
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(relinked)
    }

    /// Insert a stage execution unless its key already exists
    pub fn insert_stage_execution(&self, entity: &StageExecutionEntity) -> Result<bool> {
        let key = stage_key(
            &entity.account_identifier,
            &entity.org_identifier,
            &entity.project_identifier,
            &entity.stage_execution_id,
        );
        let status_key = stage_status_key(
            &entity.account_identifier,
            &entity.stage_execution_id,
            &entity.org_identifier,
            &entity.project_identifier,
        );

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(STAGE_EXECUTIONS_TABLE)
                .context("Failed to open table")?;
            if table.get(key.as_str())?.is_some() {
                return Ok(false);
            }

            let value = serde_json::to_vec(entity).context("Failed to serialize stage execution")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert stage execution")?;

            let mut index = write_txn
                .open_table(STAGE_STATUS_INDEX_TABLE)
                .context("Failed to open stage status index")?;
            index
                .insert(status_key.as_str(), key.as_str())
                .context("Failed to insert stage status index")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(true)
    }

    pub fn get_stage_execution(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
    ) -> Result<Option<StageExecutionEntity>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(STAGE_EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let key = stage_key(
            &scope.account_identifier,
            &scope.org_identifier,
            &scope.project_identifier,
            stage_execution_id,
        );
        match table.get(key.as_str()).context("Failed to get stage execution")? {
            Some(guard) => {
                let entity: StageExecutionEntity = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize stage execution")?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Apply field updates to the document stored under `key`
    fn update_stage_by_key(&self, key: &str, fields: &[StageExecutionField]) -> Result<UpdateAck> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let ack = {
            let mut table = write_txn
                .open_table(STAGE_EXECUTIONS_TABLE)
                .context("Failed to open table")?;

            let current: Option<StageExecutionEntity> = match table.get(key)? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value())
                        .context("Failed to deserialize stage execution")?,
                ),
                None => None,
            };

            match current {
                Some(mut entity) => {
                    let modified = apply_fields(&mut entity, fields);
                    if modified {
                        let value = serde_json::to_vec(&entity)
                            .context("Failed to serialize stage execution")?;
                        table
                            .insert(key, value.as_slice())
                            .context("Failed to update stage execution")?;
                    }
                    UpdateAck {
                        matched: 1,
                        modified: u64::from(modified),
                    }
                }
                None => UpdateAck::default(),
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(ack)
    }

    pub fn update_stage_execution(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
        fields: &[StageExecutionField],
    ) -> Result<UpdateAck> {
        let key = stage_key(
            &scope.account_identifier,
            &scope.org_identifier,
            &scope.project_identifier,
            stage_execution_id,
        );
        self.update_stage_by_key(&key, fields)
    }

    pub fn set_stage_status(
        &self,
        account_id: &str,
        stage_execution_id: &str,
        org_id: &str,
        project_id: &str,
        status: Status,
    ) -> Result<UpdateAck> {
        let status_key = stage_status_key(account_id, stage_execution_id, org_id, project_id);
        let primary_key = {
            let read_txn = self.db.begin_read().context("Failed to begin read")?;
            let index = read_txn
                .open_table(STAGE_STATUS_INDEX_TABLE)
                .context("Failed to open stage status index")?;
            let guard = index
                .get(status_key.as_str())
                .context("Failed to read stage status index")?;
            guard.map(|g| g.value().to_string())
        };

        match primary_key {
            Some(key) => self.update_stage_by_key(&key, &[StageExecutionField::Status(status)]),
            None => Ok(UpdateAck::default()),
        }
    }
}

#[async_trait::async_trait]
impl NodeExecutionStore for RedbExecutionStore {
    async fn save(&self, node_execution: &NodeExecution) -> Result<()> {
        self.save_node_execution(node_execution)
    }

    async fn get(&self, node_execution_id: &str) -> Result<Option<NodeExecution>> {
        self.get_node_execution(node_execution_id)
    }

    async fn fetch_children(
        &self,
        plan_execution_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<NodeExecution>> {
        self.children_of(plan_execution_id, parent_id)
    }

    async fn list_by_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.list_node_executions(plan_execution_id)
    }

    async fn update_status(
        &self,
        node_execution_id: &str,
        to: Status,
        allowed_from: &[Status],
    ) -> Result<Option<NodeExecution>> {
        self.transition_node_execution(node_execution_id, to, allowed_from)
    }

    async fn update_relationships_for_retry(
        &self,
        plan_execution_id: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<usize> {
        self.relink_retried_node(plan_execution_id, old_id, new_id)
    }
}

#[async_trait::async_trait]
impl StageExecutionStore for RedbExecutionStore {
    async fn insert(&self, entity: &StageExecutionEntity) -> Result<bool> {
        self.insert_stage_execution(entity)
    }

    async fn find(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
    ) -> Result<Option<StageExecutionEntity>> {
        self.get_stage_execution(scope, stage_execution_id)
    }

    async fn update_fields(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
        fields: &[StageExecutionField],
    ) -> Result<UpdateAck> {
        self.update_stage_execution(scope, stage_execution_id, fields)
    }

    async fn update_stage_status(
        &self,
        account_id: &str,
        stage_execution_id: &str,
        org_id: &str,
        project_id: &str,
        status: Status,
    ) -> Result<UpdateAck> {
        self.set_stage_status(account_id, stage_execution_id, org_id, project_id, status)
    }
}
