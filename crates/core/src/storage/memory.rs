use super::{
    apply_fields, transition, NodeExecutionStore, StageExecutionField, StageExecutionStore,
    UpdateAck,
};
use crate::types::{NodeExecution, Scope, StageExecutionEntity, Status};
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

type ChildrenKey = (String, Option<String>);

/// In-memory execution store for tests and embedded use
#[derive(Default)]
pub struct InMemoryExecutionStore {
    node_executions: RwLock<HashMap<String, NodeExecution>>,
    children: RwLock<HashMap<ChildrenKey, Vec<String>>>,
    stage_executions: RwLock<HashMap<String, StageExecutionEntity>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn stage_key(account: &str, org: &str, project: &str, stage_execution_id: &str) -> String {
    format!("{}/{}/{}/{}", account, org, project, stage_execution_id)
}

#[async_trait::async_trait]
impl NodeExecutionStore for InMemoryExecutionStore {
    async fn save(&self, node_execution: &NodeExecution) -> Result<()> {
        let previous = self
            .node_executions
            .write()
            .await
            .insert(node_execution.uuid.clone(), node_execution.clone());

        if previous.is_none() {
            let key = (
                node_execution.plan_execution_id().to_string(),
                node_execution.parent_id.clone(),
            );
            self.children
                .write()
                .await
                .entry(key)
                .or_default()
                .push(node_execution.uuid.clone());
        }
        Ok(())
    }

    async fn get(&self, node_execution_id: &str) -> Result<Option<NodeExecution>> {
        Ok(self.node_executions.read().await.get(node_execution_id).cloned())
    }

    async fn fetch_children(
        &self,
        plan_execution_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<NodeExecution>> {
        let key = (plan_execution_id.to_string(), parent_id.map(str::to_string));
        let ids = self.children.read().await.get(&key).cloned().unwrap_or_default();
        let node_executions = self.node_executions.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| node_executions.get(id))
            .filter(|ne| !ne.old_retry)
            .cloned()
            .collect())
    }

    async fn list_by_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let mut all: Vec<NodeExecution> = self
            .node_executions
            .read()
            .await
            .values()
            .filter(|ne| ne.plan_execution_id() == plan_execution_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn update_status(
        &self,
        node_execution_id: &str,
        to: Status,
        allowed_from: &[Status],
    ) -> Result<Option<NodeExecution>> {
        let mut node_executions = self.node_executions.write().await;
        let Some(ne) = node_executions.get_mut(node_execution_id) else {
            return Ok(None);
        };
        if !allowed_from.contains(&ne.status) {
            return Ok(None);
        }
        transition(ne, to);
        Ok(Some(ne.clone()))
    }

    async fn update_relationships_for_retry(
        &self,
        plan_execution_id: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<usize> {
        let mut relinked = 0;
        {
            let mut node_executions = self.node_executions.write().await;
            for ne in node_executions
                .values_mut()
                .filter(|ne| ne.plan_execution_id() == plan_execution_id)
            {
                let mut touched = false;
                if ne.parent_id.as_deref() == Some(old_id) {
                    ne.parent_id = Some(new_id.to_string());
                    touched = true;
                }
                if ne.previous_id.as_deref() == Some(old_id) {
                    ne.previous_id = Some(new_id.to_string());
                    touched = true;
                }
                relinked += usize::from(touched);
            }
        }

        let mut children = self.children.write().await;
        let old_key = (plan_execution_id.to_string(), Some(old_id.to_string()));
        if let Some(moved) = children.remove(&old_key) {
            children
                .entry((plan_execution_id.to_string(), Some(new_id.to_string())))
                .or_default()
                .extend(moved);
        }
        Ok(relinked)
    }
}

#[async_trait::async_trait]
impl StageExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, entity: &StageExecutionEntity) -> Result<bool> {
        let key = stage_key(
            &entity.account_identifier,
            &entity.org_identifier,
            &entity.project_identifier,
            &entity.stage_execution_id,
        );
        let mut stages = self.stage_executions.write().await;
        if stages.contains_key(&key) {
            return Ok(false);
        }
        stages.insert(key, entity.clone());
        Ok(true)
    }

    async fn find(
        &self,
        scope: &Scope,
        stage_execution_id: &str,
    ) -> Result<Option<StageExecutionEntity>> {
        let key = stage_key(
            &scope.account_identifier,
            &scope.org_identifier,
            &scope.project_identifier,
            stage_execution_id,
        );
        Ok(self.stage_executions.read().await.get(&key).cloned())
    }

    async fn update_fields(
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
        let mut stages = self.stage_executions.write().await;
        let Some(entity) = stages.get_mut(&key) else {
            return Ok(UpdateAck::default());
        };
        let modified = apply_fields(entity, fields);
        Ok(UpdateAck {
            matched: 1,
            modified: u64::from(modified),
        })
    }

    async fn update_stage_status(
        &self,
        account_id: &str,
        stage_execution_id: &str,
        org_id: &str,
        project_id: &str,
        status: Status,
    ) -> Result<UpdateAck> {
        let scope = Scope::new(account_id, org_id, project_id);
        self.update_fields(&scope, stage_execution_id, &[StageExecutionField::Status(status)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ambiance, PlanNode, StepCategory, StepType};

    fn node_execution(id: &str, parent: Option<&str>) -> NodeExecution {
        let ambiance = Ambiance {
            plan_execution_id: "plan-exec".to_string(),
            ..Default::default()
        };
        let node = PlanNode {
            uuid: format!("{}-node", id),
            identifier: id.to_string(),
            name: id.to_string(),
            fqn: String::new(),
            group: None,
            step_type: StepType::new("SHELL", StepCategory::Step),
            step_parameters: serde_json::Value::Null,
            facilitator_obtainments: vec![],
            adviser_obtainments: vec![],
        };
        NodeExecution::new(id, ambiance, node, parent.map(str::to_string))
    }

    #[tokio::test]
    async fn test_children_in_creation_order() {
        let store = InMemoryExecutionStore::new();
        store.save(&node_execution("root", None)).await.unwrap();
        store.save(&node_execution("b", Some("root"))).await.unwrap();
        store.save(&node_execution("a", Some("root"))).await.unwrap();

        let mut retried = node_execution("c", Some("root"));
        retried.old_retry = true;
        store.save(&retried).await.unwrap();

        let children = store.fetch_children("plan-exec", Some("root")).await.unwrap();
        let ids: Vec<_> = children.iter().map(|c| c.uuid.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let roots = store.fetch_children("plan-exec", None).await.unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[tokio::test]
    async fn test_find_all_children_recursive() {
        let store = InMemoryExecutionStore::new();
        store.save(&node_execution("root", None)).await.unwrap();
        store.save(&node_execution("stage", Some("root"))).await.unwrap();
        store.save(&node_execution("step1", Some("stage"))).await.unwrap();
        store.save(&node_execution("step2", Some("stage"))).await.unwrap();

        let all = store.find_all_children("plan-exec", "root", true).await.unwrap();
        let ids: Vec<_> = all.iter().map(|c| c.uuid.as_str()).collect();
        assert_eq!(ids, vec!["root", "stage", "step1", "step2"]);

        let without_parent = store.find_all_children("plan-exec", "root", false).await.unwrap();
        assert_eq!(without_parent.len(), 3);
    }

    #[tokio::test]
    async fn test_update_status_compare_and_set() {
        let store = InMemoryExecutionStore::new();
        store.save(&node_execution("n1", None)).await.unwrap();

        let updated = store
            .update_status("n1", Status::Running, &[Status::NotStarted])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, Status::Running);
        assert!(updated.start_ts.is_some());

        let skipped = store
            .update_status("n1", Status::Succeeded, &[Status::AsyncWaiting])
            .await
            .unwrap();
        assert!(skipped.is_none());
    }

    #[tokio::test]
    async fn test_retry_advances_attempts() {
        let store = InMemoryExecutionStore::new();
        store.save(&node_execution("root", None)).await.unwrap();
        store.save(&node_execution("step", Some("root"))).await.unwrap();
        let mut next = node_execution("next", Some("root"));
        next.previous_id = Some("step".to_string());
        store.save(&next).await.unwrap();

        let first = store
            .retry_node_execution("step", "step-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.retry_ids, vec!["step".to_string()]);
        assert_eq!(first.status, Status::NotStarted);

        let second = store
            .retry_node_execution("step-2", "step-3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.retry_ids, vec!["step".to_string(), "step-2".to_string()]);

        assert!(store.get("step").await.unwrap().unwrap().old_retry);
        assert!(store.get("step-2").await.unwrap().unwrap().old_retry);
        let ids: Vec<_> = store
            .fetch_children("plan-exec", Some("root"))
            .await
            .unwrap()
            .into_iter()
            .map(|ne| ne.uuid)
            .collect();
        assert_eq!(ids, vec!["next".to_string(), "step-3".to_string()]);
        assert_eq!(
            store.get("next").await.unwrap().unwrap().previous_id.as_deref(),
            Some("step-3")
        );
        assert!(store.retry_node_execution("missing", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_moves_children_to_new_attempt() {
        let store = InMemoryExecutionStore::new();
        store.save(&node_execution("stage", None)).await.unwrap();
        store.save(&node_execution("step", Some("stage"))).await.unwrap();

        let relinked = store
            .update_relationships_for_retry("plan-exec", "stage", "stage-2")
            .await
            .unwrap();
        assert_eq!(relinked, 1);

        assert!(store
            .fetch_children("plan-exec", Some("stage"))
            .await
            .unwrap()
            .is_empty());
        let moved = store.fetch_children("plan-exec", Some("stage-2")).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].parent_id.as_deref(), Some("stage-2"));
    }

    #[tokio::test]
    async fn test_mark_retried() {
        let store = InMemoryExecutionStore::new();
        store.save(&node_execution("n1", None)).await.unwrap();

        assert!(store.mark_retried("n1").await.unwrap());
        assert!(!store.mark_retried("missing").await.unwrap());
        assert!(store.fetch_children("plan-exec", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_leaves_discontinuing() {
        let store = InMemoryExecutionStore::new();
        let mut running = node_execution("running", None);
        running.status = Status::Running;
        store.save(&running).await.unwrap();
        let mut waiting = node_execution("waiting", None);
        waiting.status = Status::AsyncWaiting;
        store.save(&waiting).await.unwrap();
        let mut done = node_execution("done", None);
        done.status = Status::Succeeded;
        store.save(&done).await.unwrap();

        let ids = vec![
            "running".to_string(),
            "waiting".to_string(),
            "done".to_string(),
            "missing".to_string(),
        ];
        assert_eq!(store.mark_leaves_discontinuing(&ids).await.unwrap(), 2);
        assert_eq!(
            store.get("waiting").await.unwrap().unwrap().status,
            Status::Discontinuing
        );
        assert_eq!(store.get("done").await.unwrap().unwrap().status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_error_out_active_nodes() {
        let store = InMemoryExecutionStore::new();
        let mut done = node_execution("done", None);
        done.status = Status::Succeeded;
        store.save(&done).await.unwrap();
        let mut running = node_execution("running", None);
        running.status = Status::Running;
        store.save(&running).await.unwrap();

        assert_eq!(store.error_out_active_nodes("plan-exec").await.unwrap(), 1);
        let errored = store.get("running").await.unwrap().unwrap();
        assert_eq!(errored.status, Status::Errored);
        assert!(errored.end_ts.is_some());
        assert_eq!(store.get("done").await.unwrap().unwrap().status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_find_by_plan_node_skips_old_retries() {
        let store = InMemoryExecutionStore::new();
        let mut first = node_execution("attempt1", None);
        first.node.uuid = "shared".to_string();
        first.old_retry = true;
        store.save(&first).await.unwrap();
        let mut second = node_execution("attempt2", None);
        second.node.uuid = "shared".to_string();
        store.save(&second).await.unwrap();

        let found = store.find_by_plan_node("plan-exec", "shared").await.unwrap().unwrap();
        assert_eq!(found.uuid, "attempt2");
    }
}
