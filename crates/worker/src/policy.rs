// HTTP client for the remote policy engine

use anyhow::{Context, Result};
use stagehand_core::governance::{
    PolicyEvaluationRequest, PolicyEvaluationResponse, PolicyEvaluator,
};
use std::time::Duration;

pub struct HttpPolicyEvaluator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPolicyEvaluator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build policy engine client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait::async_trait]
impl PolicyEvaluator for HttpPolicyEvaluator {
    async fn evaluate(
        &self,
        request: &PolicyEvaluationRequest,
    ) -> Result<PolicyEvaluationResponse> {
        tracing::debug!(
            "Evaluating {} policies for plan execution {}",
            request.action,
            request.plan_execution_id
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach policy engine at {}", self.endpoint))?
            .error_for_status()
            .context("Policy engine rejected the request")?;

        response
            .json::<PolicyEvaluationResponse>()
            .await
            .context("Failed to decode policy engine response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unreachable_engine_is_an_error() {
        // Port 9 (discard) on loopback refuses connections
        let evaluator =
            HttpPolicyEvaluator::new("http://127.0.0.1:9/v1/evaluate", Duration::from_millis(500))
                .unwrap();
        let request = PolicyEvaluationRequest {
            document: json!({"pipeline": {"identifier": "p1"}}),
            account_id: "acc".to_string(),
            org_id: "org".to_string(),
            project_id: "proj".to_string(),
            action: "onrun".to_string(),
            plan_execution_id: "plan-exec-1".to_string(),
        };

        let err = evaluator.evaluate(&request).await.unwrap_err();
        assert!(err.to_string().contains("127.0.0.1:9"));
    }
}
