pub mod index;
pub mod memory;

pub use index::RedbExecutionStore;
pub use memory::InMemoryExecutionStore;

use crate::types::{
    FailureInfo, NodeExecution, Scope, StageExecutionEntity, StageStatus, Status, Tag,
};
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Persistence for node executions
#[async_trait::async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Insert or replace a node execution
    async fn save(&self, node_execution: &NodeExecution) -> Result<()>;

    /// Get a node execution by ID
    async fn get(&self, node_execution_id: &str) -> Result<Option<NodeExecution>>;

    /// Direct children of `parent_id` (`None` for root nodes) in creation order,
    /// excluding old retries
    async fn fetch_children(
        &self,
        plan_execution_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<NodeExecution>>;

    /// All node executions of a plan execution
    async fn list_by_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>>;

    /// Move to `to` only if the current status is in `allowed_from`.
    /// Returns the updated record, or `None` when the transition did not apply.
    async fn update_status(
        &self,
        node_execution_id: &str,
        to: Status,
        allowed_from: &[Status],
    ) -> Result<Option<NodeExecution>>;

    /// Point children and successors of `old_id` at `new_id`.
    /// Returns how many node executions were relinked.
    async fn update_relationships_for_retry(
        &self,
        plan_execution_id: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<usize>;

    /// Flag a node execution as superseded by a retry
    async fn mark_retried(&self, node_execution_id: &str) -> Result<bool> {
        let Some(mut ne) = self.get(node_execution_id).await? else {
            return Ok(false);
        };
        ne.old_retry = true;
        self.save(&ne).await?;
        Ok(true)
    }

    /// Replace `node_execution_id` with a new attempt stored under `new_uuid`
    async fn retry_node_execution(
        &self,
        node_execution_id: &str,
        new_uuid: &str,
    ) -> Result<Option<NodeExecution>> {
        let Some(previous) = self.get(node_execution_id).await? else {
            return Ok(None);
        };
        let retry = previous.new_retry(new_uuid);

        self.mark_retried(&previous.uuid).await?;
        self.save(&retry).await?;
        self.update_relationships_for_retry(
            previous.plan_execution_id(),
            &previous.uuid,
            &retry.uuid,
        )
        .await?;

        tracing::info!(
            "Node execution {} retried as {} (attempt {})",
            previous.uuid,
            retry.uuid,
            retry.retry_ids.len() + 1
        );
        Ok(Some(retry))
    }

    /// Ask the given leaves to stop. Returns how many moved to Discontinuing.
    async fn mark_leaves_discontinuing(&self, leaf_ids: &[String]) -> Result<usize> {
        let allowed = Status::predecessors(Status::Discontinuing);
        let mut updated = 0;
        for id in leaf_ids {
            if self
                .update_status(id, Status::Discontinuing, &allowed)
                .await?
                .is_some()
            {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Latest non-retried execution of a plan node
    async fn find_by_plan_node(
        &self,
        plan_execution_id: &str,
        plan_node_uuid: &str,
    ) -> Result<Option<NodeExecution>> {
        let mut matches: Vec<NodeExecution> = self
            .list_by_plan(plan_execution_id)
            .await?
            .into_iter()
            .filter(|ne| ne.node.uuid == plan_node_uuid && !ne.old_retry)
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches.pop())
    }

    /// Whole subtree below `parent_id`, breadth-first, excluding old retries
    async fn find_all_children(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
        include_parent: bool,
    ) -> Result<Vec<NodeExecution>> {
        let mut result = Vec::new();
        if include_parent {
            if let Some(parent) = self.get(parent_id).await? {
                result.push(parent);
            }
        }

        let mut queue = VecDeque::from([parent_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for child in self.fetch_children(plan_execution_id, Some(&current)).await? {
                queue.push_back(child.uuid.clone());
                result.push(child);
            }
        }

        Ok(result)
    }

    /// Mark every non-terminal node of a plan execution as errored.
    /// Returns how many nodes changed.
    async fn error_out_active_nodes(&self, plan_execution_id: &str) -> Result<usize> {
        let active = [
            Status::NotStarted,
            Status::Running,
            Status::AsyncWaiting,
            Status::Discontinuing,
        ];
        let mut updated = 0;
        for ne in self.list_by_plan(plan_execution_id).await? {
            if ne.status.is_terminal() {
                continue;
            }
            if self
                .update_status(&ne.uuid, Status::Errored, &active)
                .await?
                .is_some()
            {
                updated += 1;
            }
        }
        Ok(updated)
    }
}

/// A single field-level change to a stage execution document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum StageExecutionField {
    SummaryEntry { key: String, value: serde_json::Value },
    Status(Status),
    StageStatus(StageStatus),
    EndTs(i64),
    FailureInfo(FailureInfo),
    Tags(Vec<Tag>),
    StageName(String),
    StageIdentifier(String),
}

impl StageExecutionField {
    /// Apply this change to an entity, returning whether anything changed
    pub fn apply(&self, entity: &mut StageExecutionEntity) -> bool {
        match self {
            StageExecutionField::SummaryEntry { key, value } => {
                let previous = entity
                    .stage_execution_summary
                    .insert(key.clone(), value.clone());
                previous.as_ref() != Some(value)
            }
            StageExecutionField::Status(status) => replace(&mut entity.status, *status),
            StageExecutionField::StageStatus(status) => {
                replace(&mut entity.stage_status, *status)
            }
            StageExecutionField::EndTs(ts) => replace(&mut entity.end_ts, Some(*ts)),
            StageExecutionField::FailureInfo(info) => {
                replace(&mut entity.failure_info, Some(info.clone()))
            }
            StageExecutionField::Tags(tags) => replace(&mut entity.tags, tags.clone()),
            StageExecutionField::StageName(name) => {
                replace(&mut entity.stage_name, Some(name.clone()))
            }
            StageExecutionField::StageIdentifier(identifier) => {
                replace(&mut entity.stage_identifier, Some(identifier.clone()))
            }
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Apply field changes and bump the modification timestamp when needed.
/// Shared by store implementations.
pub(crate) fn apply_fields(
    entity: &mut StageExecutionEntity,
    fields: &[StageExecutionField],
) -> bool {
    let mut modified = false;
    for field in fields {
        modified |= field.apply(entity);
    }
    if modified {
        entity.last_modified_at = Utc::now();
    }
    modified
}

/// Write acknowledgement, mirroring matched/modified document counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateAck {
    pub matched: u64,
    pub modified: u64,
}

impl UpdateAck {
    pub fn acknowledged(&self) -> bool {
        self.matched > 0
    }
}

/// Persistence for stage execution entities
#[async_trait::async_trait]
pub trait StageExecutionStore: Send + Sync {
    /// Insert a new entity. Returns false if the key already exists.
    async fn insert(&self, entity: &StageExecutionEntity) -> Result<bool>;

    async fn find(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
    ) -> Result<Option<StageExecutionEntity>>;

    /// Field-level update of the entity identified by scope and id
    async fn update_fields(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
        fields: &[StageExecutionField],
    ) -> Result<UpdateAck>;

    /// Status-only update through the secondary
    /// `(account, stage_execution_id, org, project)` lookup
    async fn update_stage_status(
        &self,
        account_id: &str,
        stage_execution_id: &str,
        org_id: &str,
        project_id: &str,
        status: Status,
    ) -> Result<UpdateAck>;
}

/// Apply a status transition to a node execution record in place
pub(crate) fn transition(ne: &mut NodeExecution, to: Status) {
    let now = Utc::now().timestamp_millis();
    if to == Status::Running && ne.start_ts.is_none() {
        ne.start_ts = Some(now);
    }
    if to.is_terminal() {
        ne.end_ts = Some(now);
    }
    ne.status = to;
}
