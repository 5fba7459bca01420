// Expression evaluation over the execution graph of one plan execution

pub mod field;
pub mod functors;
pub mod parser;

use crate::cache::NodeExecutionsCache;
use crate::error::{EngineError, EngineResult};
use crate::storage::NodeExecutionStore;
use crate::types::Ambiance;
use field::FieldProcessorRegistry;
use functors::{
    value_as_str, AncestorFunctor, ChildFunctor, ExpressionFunctor, JsonFunctor, MethodFunctor,
    OutcomeFunctor, PublishedData, QualifiedFunctor, RegexFunctor, XmlFunctor,
};
use parser::{parse_expression, split_template, Expr, TemplatePart};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

pub use field::ORCHESTRATION_FIELD_TYPE_KEY;
pub use parser::contains_expression;

/// Prefixes that cannot be used as group aliases
const RESERVED_PREFIXES: &[&str] = &["outcome", "output", "child", "ancestor", "qualified"];

type BoxedEval<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

/// Default group aliases: `stage.*` and `pipeline.*`
pub fn default_group_aliases() -> HashMap<String, String> {
    HashMap::from([
        ("stage".to_string(), "STAGE".to_string()),
        ("pipeline".to_string(), "PIPELINE".to_string()),
    ])
}

struct FunctorTable {
    prefixes: HashMap<String, Arc<dyn ExpressionFunctor>>,
    methods: HashMap<&'static str, Arc<dyn MethodFunctor>>,
}

/// Evaluates `<+ ... >` expressions for one ambiance.
///
/// Owns its [`NodeExecutionsCache`], so every node is read at most once per
/// evaluator. Group aliases must be added before the first evaluation.
pub struct AmbianceExpressionEvaluator {
    ambiance: Ambiance,
    cache: Arc<NodeExecutionsCache>,
    group_aliases: HashMap<String, String>,
    field_processors: Arc<FieldProcessorRegistry>,
    functors: OnceLock<FunctorTable>,
}

impl AmbianceExpressionEvaluator {
    pub fn new(
        store: Arc<dyn NodeExecutionStore>,
        ambiance: Ambiance,
        field_processors: Arc<FieldProcessorRegistry>,
    ) -> Self {
        let cache = Arc::new(NodeExecutionsCache::new(
            store,
            ambiance.plan_execution_id.clone(),
        ));
        Self {
            ambiance,
            cache,
            group_aliases: HashMap::new(),
            field_processors,
            functors: OnceLock::new(),
        }
    }

    pub fn ambiance(&self) -> &Ambiance {
        &self.ambiance
    }

    pub fn cache(&self) -> &Arc<NodeExecutionsCache> {
        &self.cache
    }

    /// Make `alias.*` resolve against the nearest ancestor-or-self in `group`
    pub fn add_group_alias(
        &mut self,
        alias: impl Into<String>,
        group: impl Into<String>,
    ) -> EngineResult<()> {
        let alias = alias.into();
        let group = group.into();
        if self.functors.get().is_some() {
            return Err(EngineError::Usage(format!(
                "group alias '{}' added after the evaluator was initialized",
                alias
            )));
        }
        if RESERVED_PREFIXES.contains(&alias.as_str()) {
            return Err(EngineError::Usage(format!(
                "'{}' is a reserved expression prefix",
                alias
            )));
        }
        match self.group_aliases.get(&alias) {
            Some(existing) if *existing != group => Err(EngineError::Usage(format!(
                "group alias '{}' already maps to '{}'",
                alias, existing
            ))),
            _ => {
                self.group_aliases.insert(alias, group);
                Ok(())
            }
        }
    }

    fn functors(&self) -> &FunctorTable {
        self.functors.get_or_init(|| {
            tracing::debug!(
                "Initializing expression functors for plan execution {}",
                self.ambiance.plan_execution_id
            );
            let mut prefixes: HashMap<String, Arc<dyn ExpressionFunctor>> = HashMap::new();
            prefixes.insert(
                "outcome".to_string(),
                Arc::new(OutcomeFunctor {
                    ambiance: self.ambiance.clone(),
                    cache: self.cache.clone(),
                    kind: PublishedData::Outcome,
                }),
            );
            prefixes.insert(
                "output".to_string(),
                Arc::new(OutcomeFunctor {
                    ambiance: self.ambiance.clone(),
                    cache: self.cache.clone(),
                    kind: PublishedData::Output,
                }),
            );
            prefixes.insert(
                "child".to_string(),
                Arc::new(ChildFunctor {
                    ambiance: self.ambiance.clone(),
                    cache: self.cache.clone(),
                }),
            );
            prefixes.insert(
                "ancestor".to_string(),
                Arc::new(AncestorFunctor {
                    ambiance: self.ambiance.clone(),
                    cache: self.cache.clone(),
                    group: None,
                    include_self: false,
                }),
            );
            prefixes.insert(
                "qualified".to_string(),
                Arc::new(QualifiedFunctor {
                    cache: self.cache.clone(),
                }),
            );
            for (alias, group) in &self.group_aliases {
                prefixes.insert(
                    alias.clone(),
                    Arc::new(AncestorFunctor {
                        ambiance: self.ambiance.clone(),
                        cache: self.cache.clone(),
                        group: Some(group.clone()),
                        include_self: true,
                    }),
                );
            }

            let mut methods: HashMap<&'static str, Arc<dyn MethodFunctor>> = HashMap::new();
            methods.insert("regex", Arc::new(RegexFunctor));
            methods.insert("json", Arc::new(JsonFunctor));
            methods.insert("xml", Arc::new(XmlFunctor));

            FunctorTable { prefixes, methods }
        })
    }

    fn eval<'a>(&'a self, expr: &'a Expr) -> BoxedEval<'a, Option<Value>> {
        Box::pin(async move {
            match expr {
                Expr::Literal(value) => Ok(Some(value.clone())),
                Expr::Reference(path) => {
                    let Some(prefix) = path.first().and_then(|s| s.as_field()) else {
                        return Ok(None);
                    };
                    match self.functors().prefixes.get(prefix) {
                        Some(functor) => functor.resolve(&path[1..]).await,
                        None => Ok(None),
                    }
                }
                Expr::Call {
                    namespace,
                    method,
                    args,
                } => {
                    let functor = self
                        .functors()
                        .methods
                        .get(namespace.as_str())
                        .cloned()
                        .ok_or_else(|| EngineError::InvalidExpression {
                            expression: format!("{}.{}", namespace, method),
                            message: format!("unknown functor '{}'", namespace),
                        })?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        match self.eval(arg).await? {
                            Some(value) => values.push(value),
                            None => return Ok(None),
                        }
                    }
                    functor.call(method, &values).map(Some)
                }
            }
        })
    }

    async fn eval_body(&self, body: &str) -> EngineResult<Option<Value>> {
        let expr = parse_expression(body)?;
        self.eval(&expr).await
    }

    /// Substitute every token; a string that is a single token keeps the
    /// token's type. Unresolved tokens are kept verbatim unless `strict`.
    async fn render_text(&self, text: &str, strict: bool) -> EngineResult<Value> {
        let parts = split_template(text)?;
        if let [TemplatePart::Expression { raw, body }] = parts.as_slice() {
            return match self.eval_body(body).await? {
                Some(value) => Ok(value),
                None if strict => Err(EngineError::UnresolvedExpression(raw.to_string())),
                None => {
                    tracing::debug!("Unresolved expression left as is: {}", raw);
                    Ok(Value::String(text.to_string()))
                }
            };
        }

        let mut out = String::with_capacity(text.len());
        for part in parts {
            match part {
                TemplatePart::Text(t) => out.push_str(t),
                TemplatePart::Expression { raw, body } => match self.eval_body(body).await? {
                    Some(value) => out.push_str(&value_as_str(&value)),
                    None if strict => {
                        return Err(EngineError::UnresolvedExpression(raw.to_string()))
                    }
                    None => {
                        tracing::debug!("Unresolved expression left as is: {}", raw);
                        out.push_str(raw);
                    }
                },
            }
        }
        Ok(Value::String(out))
    }

    /// Evaluate an expression, either a template containing `<+ ... >` tokens
    /// or a bare expression body. Anything unresolved is an error.
    pub async fn evaluate_expression(&self, expression: &str) -> EngineResult<Value> {
        if contains_expression(expression) {
            return self.render_text(expression, true).await;
        }
        self.eval_body(expression)
            .await?
            .ok_or_else(|| EngineError::UnresolvedExpression(expression.to_string()))
    }

    /// Render a template to a string, leaving unresolved tokens in place
    pub async fn render_expression(&self, text: &str) -> EngineResult<String> {
        if !contains_expression(text) {
            return Ok(text.to_string());
        }
        Ok(value_as_str(&self.render_text(text, false).await?))
    }

    fn render_value<'a>(&'a self, value: &'a Value) -> BoxedEval<'a, Value> {
        Box::pin(async move {
            match value {
                Value::String(text) if contains_expression(text) => {
                    self.render_text(text, false).await
                }
                Value::Array(items) => {
                    let mut rendered = Vec::with_capacity(items.len());
                    for item in items {
                        rendered.push(self.render_value(item).await?);
                    }
                    Ok(Value::Array(rendered))
                }
                Value::Object(map) => {
                    let mut rendered = Map::with_capacity(map.len());
                    for (key, item) in map {
                        rendered.insert(key.clone(), self.render_value(item).await?);
                    }
                    Ok(Value::Object(rendered))
                }
                other => Ok(other.clone()),
            }
        })
    }

    /// Resolve every expression inside `value`, then replace orchestration
    /// field placeholders. The input is never modified.
    pub async fn resolve(&self, value: &Value) -> EngineResult<Value> {
        let rendered = self.render_value(value).await?;
        self.field_processors.resolve_fields(&rendered)
    }
}

/// Builds one evaluator per ambiance with shared configuration
#[derive(Clone)]
pub struct ExpressionEvaluatorProvider {
    store: Arc<dyn NodeExecutionStore>,
    field_processors: Arc<FieldProcessorRegistry>,
    group_aliases: HashMap<String, String>,
}

impl ExpressionEvaluatorProvider {
    pub fn new(store: Arc<dyn NodeExecutionStore>) -> Self {
        Self {
            store,
            field_processors: Arc::new(FieldProcessorRegistry::with_defaults()),
            group_aliases: default_group_aliases(),
        }
    }

    pub fn with_field_processors(mut self, registry: FieldProcessorRegistry) -> Self {
        self.field_processors = Arc::new(registry);
        self
    }

    pub fn with_group_alias(mut self, alias: impl Into<String>, group: impl Into<String>) -> Self {
        self.group_aliases.insert(alias.into(), group.into());
        self
    }

    pub fn evaluator(&self, ambiance: Ambiance) -> EngineResult<AmbianceExpressionEvaluator> {
        let mut evaluator = AmbianceExpressionEvaluator::new(
            self.store.clone(),
            ambiance,
            self.field_processors.clone(),
        );
        for (alias, group) in &self.group_aliases {
            evaluator.add_group_alias(alias.clone(), group.clone())?;
        }
        Ok(evaluator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::field::{OrchestrationFieldProcessor, ProcessorResult};
    use crate::storage::InMemoryExecutionStore;
    use crate::test_support::three_level_graph;
    use serde_json::json;

    async fn evaluator_at_step() -> AmbianceExpressionEvaluator {
        let store = Arc::new(InMemoryExecutionStore::new());
        let graph = three_level_graph(&store).await;
        ExpressionEvaluatorProvider::new(store)
            .evaluator(graph.step.ambiance.clone())
            .unwrap()
    }

    #[tokio::test]
    async fn test_ancestor_skips_self_and_empty_parent() {
        let evaluator = evaluator_at_step().await;
        let value = evaluator
            .evaluate_expression("<+ancestor.outcome.x>")
            .await
            .unwrap();
        assert_eq!(value, json!("from-pipeline"));
    }

    #[tokio::test]
    async fn test_outcome_prefers_nearest_level() {
        let evaluator = evaluator_at_step().await;
        assert_eq!(
            evaluator.evaluate_expression("outcome.x").await.unwrap(),
            json!("from-step")
        );
        assert_eq!(
            evaluator
                .evaluate_expression("<+outcome.build.artifacts[1]>")
                .await
                .unwrap(),
            json!("b.tar")
        );
        assert_eq!(
            evaluator
                .evaluate_expression("<+output.release.version>")
                .await
                .unwrap(),
            json!("2.4.1")
        );
    }

    #[tokio::test]
    async fn test_group_alias_and_qualified() {
        let evaluator = evaluator_at_step().await;
        assert_eq!(
            evaluator.evaluate_expression("<+stage.identifier>").await.unwrap(),
            json!("stage1")
        );
        assert_eq!(
            evaluator.evaluate_expression("<+pipeline.name>").await.unwrap(),
            json!("PIPELINE")
        );
        assert_eq!(
            evaluator
                .evaluate_expression(
                    "<+qualified.pipeline.stages.stage1.spec.execution.steps.step1.outcome.build.tag>"
                )
                .await
                .unwrap(),
            json!("v12")
        );
        assert_eq!(
            evaluator
                .evaluate_expression("<+qualified.pipeline.stages.stage1.identifier>")
                .await
                .unwrap(),
            json!("stage1")
        );
    }

    /// Replaces a `literal` field with its `text`, upper-cased
    struct UpperLiteralProcessor;

    impl OrchestrationFieldProcessor for UpperLiteralProcessor {
        fn field_type(&self) -> &str {
            "literal"
        }

        fn process(&self, field: &Map<String, Value>) -> ProcessorResult {
            match field.get("text").and_then(Value::as_str) {
                Some(text) => ProcessorResult::success(json!(text.to_uppercase())),
                None => ProcessorResult::error("literal field without text"),
            }
        }
    }

    #[tokio::test]
    async fn test_provider_configuration_reaches_evaluators() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let graph = three_level_graph(&store).await;
        let mut processors = FieldProcessorRegistry::new();
        processors.register(Arc::new(UpperLiteralProcessor));
        let provider = ExpressionEvaluatorProvider::new(store)
            .with_group_alias("deploy", "STAGE")
            .with_field_processors(processors);
        let evaluator = provider.evaluator(graph.step.ambiance.clone()).unwrap();

        let input = json!({
            "target": "<+deploy.identifier>",
            "label": {"__orchestrationFieldType": "literal", "text": "<+outcome.build.tag>"}
        });
        assert_eq!(
            evaluator.resolve(&input).await.unwrap(),
            json!({"target": "stage1", "label": "V12"})
        );

        // Defaults were replaced, so parameter fields no longer resolve
        let parameter = json!({"__orchestrationFieldType": "parameterField", "value": 1});
        assert!(evaluator.resolve(&parameter).await.is_err());
    }

    #[tokio::test]
    async fn test_provider_rejects_reserved_alias() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let graph = three_level_graph(&store).await;
        let provider =
            ExpressionEvaluatorProvider::new(store).with_group_alias("outcome", "STAGE");
        assert!(matches!(
            provider.evaluator(graph.step.ambiance.clone()),
            Err(EngineError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn test_child_lookup_from_pipeline() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let graph = three_level_graph(&store).await;
        let evaluator = ExpressionEvaluatorProvider::new(store)
            .evaluator(graph.pipeline.ambiance.clone())
            .unwrap();
        assert_eq!(
            evaluator
                .evaluate_expression("<+child.step1.outcome.build.tag>")
                .await
                .unwrap(),
            json!("v12")
        );
    }

    #[tokio::test]
    async fn test_render_keeps_unresolved_tokens() {
        let evaluator = evaluator_at_step().await;
        let rendered = evaluator
            .render_expression("tag=<+outcome.build.tag> env=<+outcome.missing>")
            .await
            .unwrap();
        assert_eq!(rendered, "tag=v12 env=<+outcome.missing>");

        let err = evaluator
            .evaluate_expression("env=<+outcome.missing>")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedExpression(_)));
    }

    #[tokio::test]
    async fn test_resolve_typed_values_and_fields() {
        let evaluator = evaluator_at_step().await;
        let input = json!({
            "artifacts": "<+outcome.build.artifacts>",
            "image": "registry/app:<+outcome.build.tag>",
            "major": "<+regex.extract('\\\\d+', outcome.build.tag)>",
            "env": {
                "__orchestrationFieldType": "parameterField",
                "value": "<+stage.identifier>",
                "inputSetValidator": {"validatorType": "allowedValues", "parameters": "stage1,stage2"}
            }
        });
        let resolved = evaluator.resolve(&input).await.unwrap();
        assert_eq!(
            resolved,
            json!({
                "artifacts": ["a.tar", "b.tar"],
                "image": "registry/app:v12",
                "major": "12",
                "env": "stage1"
            })
        );
    }

    #[tokio::test]
    async fn test_resolve_aborts_on_field_error() {
        let evaluator = evaluator_at_step().await;
        let input = json!({
            "env": {
                "__orchestrationFieldType": "parameterField",
                "value": "<+stage.identifier>",
                "inputSetValidator": {"validatorType": "allowedValues", "parameters": "prod"}
            }
        });
        assert!(matches!(
            evaluator.resolve(&input).await,
            Err(EngineError::CriticalExpressionEvaluation(_))
        ));
    }

    #[tokio::test]
    async fn test_alias_after_initialization_is_rejected() {
        let mut evaluator = evaluator_at_step().await;
        evaluator.add_group_alias("stepGroup", "STEP_GROUP").unwrap();
        assert!(evaluator.add_group_alias("outcome", "X").is_err());
        assert!(evaluator.add_group_alias("stage", "OTHER").is_err());

        evaluator.evaluate_expression("<+stage.name>").await.unwrap();
        assert!(matches!(
            evaluator.add_group_alias("infra", "INFRA"),
            Err(EngineError::Usage(_))
        ));
    }
}
