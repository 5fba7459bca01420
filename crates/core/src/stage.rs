// Stage execution summaries

use crate::error::{EngineError, EngineResult};
use crate::storage::{StageExecutionField, StageExecutionStore};
use crate::types::{
    generate_uuid, Ambiance, FailureInfo, Scope, StageExecutionEntity, StageStatus, Status, Tag,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Initial data for a new stage entity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCreateParams {
    pub stage_identifier: Option<String>,
    pub stage_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub summary: Map<String, Value>,
}

/// Partial update; `None` and empty fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageExecutionUpdate {
    #[serde(default)]
    pub summary: Map<String, Value>,
    pub status: Option<Status>,
    pub stage_status: Option<StageStatus>,
    pub end_ts: Option<i64>,
    pub failure_info: Option<FailureInfo>,
    pub tags: Option<Vec<Tag>>,
    pub stage_name: Option<String>,
    pub stage_identifier: Option<String>,
}

impl StageExecutionUpdate {
    /// Update mirroring a node status change
    pub fn from_status(status: Status, failure_info: Option<FailureInfo>) -> Self {
        Self {
            status: Some(status),
            stage_status: Some(status.stage_status()),
            end_ts: status
                .is_terminal()
                .then(|| Utc::now().timestamp_millis()),
            failure_info,
            ..Default::default()
        }
    }

    /// Field changes relative to `current`
    fn diff(&self, current: &StageExecutionEntity) -> Vec<StageExecutionField> {
        let mut fields = Vec::new();
        for (key, value) in &self.summary {
            if current.stage_execution_summary.get(key) != Some(value) {
                fields.push(StageExecutionField::SummaryEntry {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        if let Some(status) = self.status.filter(|s| *s != current.status) {
            fields.push(StageExecutionField::Status(status));
        }
        if let Some(stage_status) = self.stage_status.filter(|s| *s != current.stage_status) {
            fields.push(StageExecutionField::StageStatus(stage_status));
        }
        if let Some(end_ts) = self.end_ts.filter(|ts| current.end_ts != Some(*ts)) {
            fields.push(StageExecutionField::EndTs(end_ts));
        }
        if let Some(info) = &self.failure_info {
            if current.failure_info.as_ref() != Some(info) {
                fields.push(StageExecutionField::FailureInfo(info.clone()));
            }
        }
        if let Some(tags) = &self.tags {
            if current.tags != *tags {
                fields.push(StageExecutionField::Tags(tags.clone()));
            }
        }
        if let Some(name) = &self.stage_name {
            if current.stage_name.as_ref() != Some(name) {
                fields.push(StageExecutionField::StageName(name.clone()));
            }
        }
        if let Some(identifier) = &self.stage_identifier {
            if current.stage_identifier.as_ref() != Some(identifier) {
                fields.push(StageExecutionField::StageIdentifier(identifier.clone()));
            }
        }
        fields
    }
}

/// Stage execution id for the ambiance: the explicit one, else the current runtime id
pub fn stage_execution_id(ambiance: &Ambiance) -> EngineResult<String> {
    ambiance
        .stage_execution_id
        .clone()
        .or_else(|| ambiance.current_runtime_id().map(str::to_string))
        .ok_or_else(|| EngineError::Usage("ambiance has no stage execution id".to_string()))
}

pub struct StageExecutionInfoService {
    store: Arc<dyn StageExecutionStore>,
}

impl StageExecutionInfoService {
    pub fn new(store: Arc<dyn StageExecutionStore>) -> Self {
        Self { store }
    }

    fn new_entity(ambiance: &Ambiance, stage_execution_id: String) -> StageExecutionEntity {
        let scope = ambiance.scope();
        let now = Utc::now();
        StageExecutionEntity {
            uuid: generate_uuid(),
            account_identifier: scope.account_identifier,
            org_identifier: scope.org_identifier,
            project_identifier: scope.project_identifier,
            stage_execution_id,
            plan_execution_id: ambiance.plan_execution_id.clone(),
            stage_identifier: ambiance.step_identifier().map(str::to_string),
            stage_name: None,
            status: Status::Running,
            stage_status: StageStatus::InProgress,
            stage_execution_summary: Map::new(),
            failure_info: None,
            tags: Vec::new(),
            start_ts: Some(
                ambiance
                    .current_level_start_ts()
                    .unwrap_or_else(|_| now.timestamp_millis()),
            ),
            end_ts: None,
            created_at: now,
            last_modified_at: now,
        }
    }

    /// Insert the entity for a starting stage. Never overwrites an existing one.
    pub async fn create(
        &self,
        ambiance: &Ambiance,
        params: StageCreateParams,
    ) -> EngineResult<StageExecutionEntity> {
        let stage_execution_id = stage_execution_id(ambiance)?;
        let mut entity = Self::new_entity(ambiance, stage_execution_id.clone());
        if params.stage_identifier.is_some() {
            entity.stage_identifier = params.stage_identifier;
        }
        entity.stage_name = params.stage_name;
        entity.tags = params.tags;
        entity.stage_execution_summary = params.summary;

        if !self.store.insert(&entity).await? {
            return Err(EngineError::DuplicateKey(format!(
                "stage execution {} already exists",
                stage_execution_id
            )));
        }
        tracing::info!(
            "Created stage execution {} for plan execution {}",
            stage_execution_id,
            entity.plan_execution_id
        );
        Ok(entity)
    }

    /// Apply `update` to the stage entity, creating it first if it is missing
    pub async fn update(
        &self,
        ambiance: &Ambiance,
        update: StageExecutionUpdate,
    ) -> EngineResult<Option<StageExecutionEntity>> {
        let stage_execution_id = stage_execution_id(ambiance)?;
        let scope = ambiance.scope();

        let current = match self.store.find(&scope, &stage_execution_id).await? {
            Some(current) => current,
            None => {
                let mut entity = Self::new_entity(ambiance, stage_execution_id.clone());
                for field in update.diff(&entity) {
                    field.apply(&mut entity);
                }
                if self.store.insert(&entity).await? {
                    tracing::warn!(
                        "Stage execution {} did not exist, created it from an update",
                        stage_execution_id
                    );
                    return Ok(Some(entity));
                }
                // Created concurrently; apply the update to the winner
                self.store
                    .find(&scope, &stage_execution_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::UnacknowledgedWrite(format!(
                            "stage execution {} vanished during update",
                            stage_execution_id
                        ))
                    })?
            }
        };

        let fields = update.diff(&current);
        if fields.is_empty() {
            tracing::debug!("No changes for stage execution {}", stage_execution_id);
            return Ok(Some(current));
        }

        let ack = self
            .store
            .update_fields(&scope, &stage_execution_id, &fields)
            .await?;
        if !ack.acknowledged() {
            return Err(EngineError::UnacknowledgedWrite(format!(
                "update of stage execution {}",
                stage_execution_id
            )));
        }
        self.find(&scope, &stage_execution_id).await
    }

    /// Technical status only, through the secondary status lookup
    pub async fn update_status(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
        status: Status,
    ) -> EngineResult<()> {
        let ack = self
            .store
            .update_stage_status(
                &scope.account_identifier,
                stage_execution_id,
                &scope.org_identifier,
                &scope.project_identifier,
                status,
            )
            .await?;
        if !ack.acknowledged() {
            return Err(EngineError::UnacknowledgedWrite(format!(
                "status update of stage execution {} to {}",
                stage_execution_id, status
            )));
        }
        Ok(())
    }

    pub async fn find(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
    ) -> EngineResult<Option<StageExecutionEntity>> {
        Ok(self.store.find(scope, stage_execution_id).await?)
    }
}
