// Fixtures shared by unit tests

use crate::ambiance::{ACCOUNT_ID_KEY, ORG_IDENTIFIER_KEY, PROJECT_IDENTIFIER_KEY};
use crate::storage::{InMemoryExecutionStore, NodeExecutionStore};
use crate::types::{
    Ambiance, Level, NodeExecution, PlanNode, StepCategory, StepType,
};
use serde_json::{json, Value};

pub(crate) const PLAN_EXECUTION_ID: &str = "plan-exec-1";

pub(crate) fn base_ambiance() -> Ambiance {
    let mut ambiance = Ambiance {
        plan_id: "plan-1".to_string(),
        plan_execution_id: PLAN_EXECUTION_ID.to_string(),
        ..Default::default()
    };
    ambiance
        .setup_abstractions
        .insert(ACCOUNT_ID_KEY.to_string(), "acc".to_string());
    ambiance
        .setup_abstractions
        .insert(ORG_IDENTIFIER_KEY.to_string(), "org".to_string());
    ambiance
        .setup_abstractions
        .insert(PROJECT_IDENTIFIER_KEY.to_string(), "proj".to_string());
    ambiance
}

pub(crate) fn plan_node(
    identifier: &str,
    fqn: &str,
    group: Option<&str>,
    step_type: &str,
    category: StepCategory,
) -> PlanNode {
    PlanNode {
        uuid: format!("{}-setup", identifier),
        identifier: identifier.to_string(),
        name: identifier.to_uppercase(),
        fqn: fqn.to_string(),
        group: group.map(str::to_string),
        step_type: StepType::new(step_type, category),
        step_parameters: Value::Null,
        facilitator_obtainments: vec![],
        adviser_obtainments: vec![],
    }
}

/// Node execution whose ambiance extends the parent's by one level
pub(crate) fn child_execution(
    uuid: &str,
    node: PlanNode,
    parent: Option<&NodeExecution>,
) -> NodeExecution {
    let level = Level {
        runtime_id: uuid.to_string(),
        setup_id: node.uuid.clone(),
        identifier: node.identifier.clone(),
        group: node.group.clone(),
        step_type: node.step_type.clone(),
        start_ts: 1_700_000_000_000,
        retry_index: 0,
    };
    let ambiance = match parent {
        Some(parent) => parent.ambiance.clone_for_child(level),
        None => base_ambiance().clone_for_child(level),
    };
    NodeExecution::new(uuid, ambiance, node, parent.map(|p| p.uuid.clone()))
}

/// pipeline -> stage1 -> step1, persisted in `store`
pub(crate) struct ThreeLevelGraph {
    pub pipeline: NodeExecution,
    pub stage: NodeExecution,
    pub step: NodeExecution,
}

pub(crate) async fn three_level_graph(store: &InMemoryExecutionStore) -> ThreeLevelGraph {
    let mut pipeline = child_execution(
        "pipeline-exec",
        plan_node("pipeline", "pipeline", Some("PIPELINE"), "PIPELINE", StepCategory::Pipeline),
        None,
    );
    pipeline.outcomes.insert("x".to_string(), json!("from-pipeline"));
    pipeline
        .sweeping_outputs
        .insert("release".to_string(), json!({"version": "2.4.1"}));

    let stage = child_execution(
        "stage-exec",
        plan_node(
            "stage1",
            "pipeline.stages.stage1",
            Some("STAGE"),
            "DEPLOYMENT",
            StepCategory::Stage,
        ),
        Some(&pipeline),
    );

    let mut step = child_execution(
        "step-exec",
        plan_node(
            "step1",
            "pipeline.stages.stage1.spec.execution.steps.step1",
            None,
            "SHELL",
            StepCategory::Step,
        ),
        Some(&stage),
    );
    step.outcomes
        .insert("x".to_string(), json!("from-step"));
    step.outcomes
        .insert("build".to_string(), json!({"tag": "v12", "artifacts": ["a.tar", "b.tar"]}));

    for ne in [&pipeline, &stage, &step] {
        store.save(ne).await.unwrap();
    }
    ThreeLevelGraph {
        pipeline,
        stage,
        step,
    }
}
