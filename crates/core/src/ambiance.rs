// Accessors and cloning helpers over the execution context

use crate::error::{EngineError, EngineResult};
use crate::types::{Ambiance, Level, Scope, StepCategory, StepType};

pub const ACCOUNT_ID_KEY: &str = "accountId";
pub const ORG_IDENTIFIER_KEY: &str = "orgIdentifier";
pub const PROJECT_IDENTIFIER_KEY: &str = "projectIdentifier";

impl Ambiance {
    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get(ACCOUNT_ID_KEY).map(String::as_str)
    }

    pub fn org_identifier(&self) -> Option<&str> {
        self.setup_abstractions
            .get(ORG_IDENTIFIER_KEY)
            .map(String::as_str)
    }

    pub fn project_identifier(&self) -> Option<&str> {
        self.setup_abstractions
            .get(PROJECT_IDENTIFIER_KEY)
            .map(String::as_str)
    }

    /// Scope built from setup abstractions; missing entries become empty strings
    pub fn scope(&self) -> Scope {
        Scope::new(
            self.account_id().unwrap_or_default(),
            self.org_identifier().unwrap_or_default(),
            self.project_identifier().unwrap_or_default(),
        )
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Node execution id of the current level
    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|l| &l.step_type)
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    /// Runtime id of the level above the current one
    pub fn parent_runtime_id(&self) -> Option<&str> {
        let depth = self.levels.len();
        if depth < 2 {
            return None;
        }
        self.levels.get(depth - 2).map(|l| l.runtime_id.as_str())
    }

    /// Innermost stage level
    pub fn stage_level(&self) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Stage)
    }

    pub fn is_retry(&self) -> bool {
        self.current_level().is_some_and(|l| l.retry_index > 0)
    }

    pub fn current_level_start_ts(&self) -> EngineResult<i64> {
        self.current_level()
            .map(|l| l.start_ts)
            .ok_or_else(|| EngineError::Usage("Ambiance has no levels".to_string()))
    }

    /// Copy with `level` pushed as the new current level
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut cloned = self.clone();
        cloned.levels.push(level);
        cloned
    }

    /// Copy with the current level popped
    pub fn clone_for_finish(&self) -> Self {
        let depth = self.levels.len().saturating_sub(1);
        self.clone_to_depth(depth)
    }

    /// Copy keeping only the first `depth` levels
    pub fn clone_to_depth(&self, depth: usize) -> Self {
        let mut cloned = self.clone();
        cloned.levels.truncate(depth);
        cloned
    }
}
