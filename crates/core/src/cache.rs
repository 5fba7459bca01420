// Memoizing reader over the node execution store, scoped to one evaluation

use crate::error::EngineResult;
use crate::storage::NodeExecutionStore;
use crate::types::NodeExecution;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Key of the children table. `Root` stands for "no parent", which is
/// different from a key that was never looked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParentKey {
    Root,
    Node(String),
}

impl ParentKey {
    pub fn from_parent_id(parent_id: Option<&str>) -> Self {
        match parent_id {
            Some(id) => ParentKey::Node(id.to_string()),
            None => ParentKey::Root,
        }
    }

    fn as_parent_id(&self) -> Option<&str> {
        match self {
            ParentKey::Root => None,
            ParentKey::Node(id) => Some(id),
        }
    }
}

/// Per-evaluation index of node executions.
///
/// Every id and parent key is read from the store at most once for the
/// lifetime of the cache; entries never change after they are fetched.
/// Lookups hold the table lock across the store read, so concurrent callers
/// asking for the same key wait for the first read instead of repeating it.
pub struct NodeExecutionsCache {
    store: Arc<dyn NodeExecutionStore>,
    plan_execution_id: String,
    map: Mutex<HashMap<String, Option<Arc<NodeExecution>>>>,
    children: Mutex<HashMap<ParentKey, Vec<String>>>,
}

impl NodeExecutionsCache {
    pub fn new(store: Arc<dyn NodeExecutionStore>, plan_execution_id: impl Into<String>) -> Self {
        Self {
            store,
            plan_execution_id: plan_execution_id.into(),
            map: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.plan_execution_id
    }

    /// Node execution by id; a missing record is memoized too
    pub async fn fetch(&self, node_execution_id: &str) -> EngineResult<Option<Arc<NodeExecution>>> {
        let mut map = self.map.lock().await;
        if let Some(entry) = map.get(node_execution_id) {
            return Ok(entry.clone());
        }

        tracing::debug!("Node execution cache miss: {}", node_execution_id);
        let fetched = self.store.get(node_execution_id).await?.map(Arc::new);
        map.insert(node_execution_id.to_string(), fetched.clone());
        Ok(fetched)
    }

    /// Ordered children of `parent_id` (`None` for roots)
    pub async fn fetch_children(
        &self,
        parent_id: Option<&str>,
    ) -> EngineResult<Vec<Arc<NodeExecution>>> {
        let key = ParentKey::from_parent_id(parent_id);
        let mut children = self.children.lock().await;

        if let Some(ids) = children.get(&key) {
            let map = self.map.lock().await;
            return Ok(ids
                .iter()
                .filter_map(|id| map.get(id).cloned().flatten())
                .collect());
        }

        tracing::debug!("Node children cache miss: {:?}", key);
        let fetched = self
            .store
            .fetch_children(&self.plan_execution_id, key.as_parent_id())
            .await?;

        let mut map = self.map.lock().await;
        let mut ids = Vec::with_capacity(fetched.len());
        let mut result = Vec::with_capacity(fetched.len());
        for ne in fetched {
            ids.push(ne.uuid.clone());
            let entry = map
                .entry(ne.uuid.clone())
                .or_insert_with(|| Some(Arc::new(ne)))
                .clone();
            result.extend(entry);
        }
        children.insert(key, ids);
        Ok(result)
    }

    /// Full subtree below `parent_id`. Goes straight to the store.
    pub async fn find_all_children(
        &self,
        parent_id: &str,
        include_parent: bool,
    ) -> EngineResult<Vec<NodeExecution>> {
        Ok(self
            .store
            .find_all_children(&self.plan_execution_id, parent_id, include_parent)
            .await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::InMemoryExecutionStore;
    use crate::types::{Ambiance, PlanNode, Status, StepCategory, StepType};
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store wrapper counting reads
    pub(crate) struct CountingStore {
        pub inner: InMemoryExecutionStore,
        pub gets: AtomicUsize,
        pub children_reads: AtomicUsize,
    }

    impl CountingStore {
        pub fn new() -> Self {
            Self {
                inner: InMemoryExecutionStore::new(),
                gets: AtomicUsize::new(0),
                children_reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl NodeExecutionStore for CountingStore {
        async fn save(&self, node_execution: &NodeExecution) -> Result<()> {
            self.inner.save(node_execution).await
        }

        async fn get(&self, node_execution_id: &str) -> Result<Option<NodeExecution>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(node_execution_id).await
        }

        async fn fetch_children(
            &self,
            plan_execution_id: &str,
            parent_id: Option<&str>,
        ) -> Result<Vec<NodeExecution>> {
            self.children_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_children(plan_execution_id, parent_id).await
        }

        async fn list_by_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
            self.inner.list_by_plan(plan_execution_id).await
        }

        async fn update_status(
            &self,
            node_execution_id: &str,
            to: Status,
            allowed_from: &[Status],
        ) -> Result<Option<NodeExecution>> {
            self.inner.update_status(node_execution_id, to, allowed_from).await
        }

        async fn update_relationships_for_retry(
            &self,
            plan_execution_id: &str,
            old_id: &str,
            new_id: &str,
        ) -> Result<usize> {
            self.inner
                .update_relationships_for_retry(plan_execution_id, old_id, new_id)
                .await
        }
    }

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
    async fn test_fetch_reads_store_once() {
        let store = Arc::new(CountingStore::new());
        store.save(&node_execution("n1", None)).await.unwrap();
        let cache = NodeExecutionsCache::new(store.clone(), "plan-exec");

        let first = cache.fetch("n1").await.unwrap().unwrap();
        let second = cache.fetch("n1").await.unwrap().unwrap();
        assert_eq!(first.uuid, second.uuid);
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_node_is_memoized() {
        let store = Arc::new(CountingStore::new());
        let cache = NodeExecutionsCache::new(store.clone(), "plan-exec");

        assert!(cache.fetch("ghost").await.unwrap().is_none());
        assert!(cache.fetch("ghost").await.unwrap().is_none());
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_children_populate_node_table() {
        let store = Arc::new(CountingStore::new());
        store.save(&node_execution("root", None)).await.unwrap();
        store.save(&node_execution("a", Some("root"))).await.unwrap();
        store.save(&node_execution("b", Some("root"))).await.unwrap();
        let cache = NodeExecutionsCache::new(store.clone(), "plan-exec");

        let children = cache.fetch_children(Some("root")).await.unwrap();
        assert_eq!(children.len(), 2);
        let again = cache.fetch_children(Some("root")).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(store.children_reads.load(Ordering::SeqCst), 1);

        cache.fetch("a").await.unwrap().unwrap();
        assert_eq!(store.gets.load(Ordering::SeqCst), 0);

        let roots = cache.fetch_children(None).await.unwrap();
        assert_eq!(roots[0].uuid, "root");
        cache.fetch_children(None).await.unwrap();
        assert_eq!(store.children_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_read() {
        let store = Arc::new(CountingStore::new());
        store.save(&node_execution("n1", None)).await.unwrap();
        let cache = Arc::new(NodeExecutionsCache::new(store.clone(), "plan-exec"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.fetch("n1").await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_find_all_children_bypasses_cache() {
        let store = Arc::new(CountingStore::new());
        store.save(&node_execution("root", None)).await.unwrap();
        store.save(&node_execution("a", Some("root"))).await.unwrap();
        let cache = NodeExecutionsCache::new(store.clone(), "plan-exec");

        cache.find_all_children("root", false).await.unwrap();
        cache.find_all_children("root", false).await.unwrap();
        // Each call walks "root" and "a"
        assert_eq!(store.children_reads.load(Ordering::SeqCst), 4);
    }
}
