// Policy gate run before a pipeline starts

use crate::error::{EngineError, EngineResult};
use crate::types::{generate_uuid, GovernanceMetadata, PolicySetMetadata};
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Feature flag gating governance per account
pub const GOVERNANCE_FEATURE_FLAG: &str = "OPA_PIPELINE_GOVERNANCE";

/// Action evaluated when a pipeline run starts
pub const ON_RUN_ACTION: &str = "onrun";

/// What the gate is asked to check
#[derive(Debug, Clone)]
pub struct GovernanceRequest {
    /// Fully expanded pipeline document, as JSON text
    pub expanded_json: String,
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub action: String,
    pub plan_execution_id: String,
}

/// Payload sent to the policy engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluationRequest {
    pub document: Value,
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub action: String,
    pub plan_execution_id: String,
}

/// Policy engine verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluationResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub status: String,
    pub deny: bool,
    #[serde(default)]
    pub details: Vec<PolicySetMetadata>,
}

/// Remote policy engine
#[async_trait::async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, request: &PolicyEvaluationRequest) -> Result<PolicyEvaluationResponse>;
}

#[async_trait::async_trait]
pub trait FeatureFlagService: Send + Sync {
    async fn is_enabled(&self, account_id: &str, flag: &str) -> bool;
}

/// Flags enabled for a fixed set of accounts, or for everyone
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureFlags {
    flags: HashSet<String>,
    /// Empty means every account
    accounts: HashSet<String>,
}

impl StaticFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn for_accounts<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accounts = accounts.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait::async_trait]
impl FeatureFlagService for StaticFeatureFlags {
    async fn is_enabled(&self, account_id: &str, flag: &str) -> bool {
        self.flags.contains(flag)
            && (self.accounts.is_empty() || self.accounts.contains(account_id))
    }
}

pub struct GovernanceGate {
    evaluator: Arc<dyn PolicyEvaluator>,
    flags: Arc<dyn FeatureFlagService>,
}

impl GovernanceGate {
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>, flags: Arc<dyn FeatureFlagService>) -> Self {
        Self { evaluator, flags }
    }

    /// Check a pipeline document against the account's policies.
    ///
    /// Disabled governance and empty documents pass without a remote call.
    /// A document that cannot be turned into an evaluation context is denied.
    /// Failures talking to the policy engine are returned as errors.
    pub async fn evaluate(&self, request: &GovernanceRequest) -> EngineResult<GovernanceMetadata> {
        if !self
            .flags
            .is_enabled(&request.account_id, GOVERNANCE_FEATURE_FLAG)
            .await
        {
            tracing::debug!(
                "Governance disabled for account {}, skipping policy evaluation",
                request.account_id
            );
            return Ok(verdict(request, false, "pass", None, vec![]));
        }

        if request.expanded_json.trim().is_empty() {
            return Ok(verdict(request, false, "pass", None, vec![]));
        }

        let document = match build_context(&request.expanded_json) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(
                    "Could not build policy context for plan execution {}: {}",
                    request.plan_execution_id,
                    e
                );
                return Ok(verdict(
                    request,
                    true,
                    "error",
                    Some(format!("Error creating policy evaluation context: {}", e)),
                    vec![],
                ));
            }
        };

        let evaluation_request = PolicyEvaluationRequest {
            document,
            account_id: request.account_id.clone(),
            org_id: request.org_id.clone(),
            project_id: request.project_id.clone(),
            action: request.action.clone(),
            plan_execution_id: request.plan_execution_id.clone(),
        };

        let response = self
            .evaluator
            .evaluate(&evaluation_request)
            .await
            .map_err(|e| EngineError::PolicyEvaluation(format!("{:#}", e)))?;

        tracing::info!(
            "Policy evaluation for plan execution {}: status={}, deny={}",
            request.plan_execution_id,
            response.status,
            response.deny
        );

        let message = response.deny.then(|| deny_message(&response.details));
        let mut metadata = verdict(
            request,
            response.deny,
            &response.status,
            message,
            response.details,
        );
        if let Some(id) = response.id {
            metadata.id = id;
        }
        Ok(metadata)
    }
}

fn build_context(expanded_json: &str) -> std::result::Result<Value, serde_json::Error> {
    let pipeline: Value = serde_json::from_str(expanded_json)?;
    Ok(json!({ "pipeline": pipeline }))
}

fn deny_message(details: &[PolicySetMetadata]) -> String {
    let messages: Vec<String> = details
        .iter()
        .filter(|set| set.deny)
        .flat_map(|set| {
            set.policy_metadata
                .iter()
                .flat_map(|policy| policy.deny_messages.iter().cloned())
        })
        .collect();
    if messages.is_empty() {
        "Pipeline execution denied by policy".to_string()
    } else {
        messages.join("; ")
    }
}

fn verdict(
    request: &GovernanceRequest,
    deny: bool,
    status: &str,
    message: Option<String>,
    details: Vec<PolicySetMetadata>,
) -> GovernanceMetadata {
    GovernanceMetadata {
        id: generate_uuid(),
        deny,
        status: status.to_string(),
        message,
        details,
        account_id: request.account_id.clone(),
        org_id: request.org_id.clone(),
        project_id: request.project_id.clone(),
        action: request.action.clone(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PolicyMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEvaluator {
        calls: AtomicUsize,
        response: Option<PolicyEvaluationResponse>,
    }

    #[async_trait::async_trait]
    impl PolicyEvaluator for CountingEvaluator {
        async fn evaluate(
            &self,
            request: &PolicyEvaluationRequest,
        ) -> Result<PolicyEvaluationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.document.get("pipeline").is_some());
            self.response
                .clone()
                .ok_or_else(|| anyhow::anyhow!("policy engine unreachable"))
        }
    }

    fn gate(
        response: Option<PolicyEvaluationResponse>,
    ) -> (GovernanceGate, Arc<CountingEvaluator>) {
        let evaluator = Arc::new(CountingEvaluator {
            calls: AtomicUsize::new(0),
            response,
        });
        let flags = StaticFeatureFlags::new()
            .enable(GOVERNANCE_FEATURE_FLAG)
            .for_accounts(["acc"]);
        (GovernanceGate::new(evaluator.clone(), Arc::new(flags)), evaluator)
    }

    fn request(expanded_json: &str) -> GovernanceRequest {
        GovernanceRequest {
            expanded_json: expanded_json.to_string(),
            account_id: "acc".to_string(),
            org_id: "org".to_string(),
            project_id: "proj".to_string(),
            action: ON_RUN_ACTION.to_string(),
            plan_execution_id: "plan-exec-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_document_allows_without_call() {
        let (gate, evaluator) = gate(None);
        let metadata = gate.evaluate(&request("  ")).await.unwrap();
        assert!(!metadata.deny);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_account_allows_without_call() {
        let (gate, evaluator) = gate(None);
        let mut req = request("{\"stages\": []}");
        req.account_id = "other".to_string();
        assert!(!gate.evaluate(&req).await.unwrap().deny);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_context_error_denies() {
        let (gate, evaluator) = gate(None);
        let metadata = gate.evaluate(&request("{not json")).await.unwrap();
        assert!(metadata.deny);
        assert_eq!(metadata.status, "error");
        assert!(metadata
            .message
            .unwrap()
            .starts_with("Error creating policy evaluation context"));
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_is_loud() {
        let (gate, _) = gate(None);
        assert!(matches!(
            gate.evaluate(&request("{\"stages\": []}")).await,
            Err(EngineError::PolicyEvaluation(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_verdict_mapped() {
        let response = PolicyEvaluationResponse {
            id: Some("eval-7".to_string()),
            status: "error".to_string(),
            deny: true,
            details: vec![PolicySetMetadata {
                identifier: "prod".to_string(),
                name: "Production".to_string(),
                status: "error".to_string(),
                deny: true,
                policy_metadata: vec![PolicyMetadata {
                    identifier: "approval".to_string(),
                    name: "Require approval".to_string(),
                    status: "error".to_string(),
                    deny_messages: vec!["approval stage missing".to_string()],
                    severity: None,
                }],
            }],
        };
        let (gate, evaluator) = gate(Some(response));
        let metadata = gate.evaluate(&request("{\"stages\": []}")).await.unwrap();
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
        assert!(metadata.deny);
        assert_eq!(metadata.id, "eval-7");
        assert_eq!(metadata.message.as_deref(), Some("approval stage missing"));
        assert_eq!(metadata.details.len(), 1);
        assert_eq!(metadata.action, ON_RUN_ACTION);
    }
}
