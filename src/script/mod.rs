//! Script execution seam: filters, transformers, and lifecycle scripts.
//!
//! User scripts run behind the [`ScriptExecutor`] trait with a named-binding
//! scope. The engine never interprets script source itself; an embedded
//! language engine is an external collaborator. [`InProcessScriptExecutor`]
//! dispatches script sources to registered Rust handlers and doubles as the
//! deterministic executor for tests and embedders.
//!
//! Map-write semantics around filters: `global_map` writes always stick;
//! channel/connector/response map writes are rolled back when the filter
//! rejects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::globals::GlobalMaps;
use crate::message::{
    ChannelId, DataType, DataTypeError, DestinationSet, MessageId, MessageMap, MetaDataId, Status,
};

/// Error raised by a user script.
#[derive(Debug, Clone, Error)]
#[error("script error in {script_name}: {message}")]
pub struct ScriptError {
    /// Which script failed.
    pub script_name: String,
    /// The failure the executor reported.
    pub message: String,
}

impl ScriptError {
    /// Creates a script error.
    #[must_use]
    pub fn new(script_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while running a filter/transformer pair.
#[derive(Debug, Error)]
pub enum FilterTransformerError {
    /// A rule or step threw.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// Serialization to the wire form failed.
    #[error(transparent)]
    DataType(#[from] DataTypeError),
}

/// Named bindings visible to a script invocation.
///
/// The map handles alias the owning connector message's maps, so script
/// writes are visible to the pipeline; rollback on filter rejection is the
/// pipeline's job. Process-wide maps are reached through
/// [`ScriptScope::globals`].
#[derive(Debug, Clone)]
pub struct ScriptScope {
    /// Current message payload.
    pub msg: String,
    /// Response payload (response-transformer scope only).
    pub response: Option<String>,
    /// Response status (response-transformer scope only).
    pub response_status: Option<Status>,
    /// Response status message (response-transformer scope only).
    pub response_status_message: Option<String>,
    /// The message's source map (immutable by convention).
    pub source_map: MessageMap,
    /// The chain-scoped channel map.
    pub channel_map: MessageMap,
    /// The connector-scoped map.
    pub connector_map: MessageMap,
    /// The chain-scoped response map.
    pub response_map: MessageMap,
    /// Fan-out control; present in source-scope invocations.
    pub destination_set: Option<DestinationSet>,
    /// Owning channel id.
    pub channel_id: ChannelId,
    /// Owning channel name.
    pub channel_name: String,
    /// Message being processed.
    pub message_id: MessageId,
    /// Connector the script runs for.
    pub meta_data_id: MetaDataId,
    /// Connector display name.
    pub connector_name: String,
}

impl ScriptScope {
    /// Process-wide maps (`global_map`, `global_channel_map`,
    /// `configuration_map`).
    #[must_use]
    pub fn globals(&self) -> &'static GlobalMaps {
        GlobalMaps::instance()
    }
}

/// Sandboxed script evaluation seam.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Evaluates `script` against `scope`, returning the script's value.
    /// `Value::Null` means "no result" (for preprocessors: unchanged).
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError`] when the script throws; the pipeline
    /// classifies it per its stage.
    async fn execute(&self, script: &str, scope: &mut ScriptScope)
    -> Result<Value, ScriptError>;
}

/// Boolean combinator joining a filter rule to the running result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Conjunction with the running result.
    And,
    /// Disjunction with the running result.
    Or,
}

/// One boolean rule in a filter.
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Display name used in error reporting.
    pub name: String,
    /// Combinator joining this rule to the rules before it. Ignored on the
    /// first rule.
    pub operator: FilterOperator,
    /// The rule's script source.
    pub script: String,
}

/// An ordered sequence of boolean rules, evaluated left to right with
/// conventional short-circuiting and no operator precedence.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// The rules in declared order.
    pub rules: Vec<FilterRule>,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl Filter {
    /// A filter with a single accepting rule list.
    #[must_use]
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Evaluates the rules; an empty filter accepts.
    ///
    /// # Errors
    ///
    /// Propagates the first rule script failure.
    pub async fn evaluate(
        &self,
        executor: &dyn ScriptExecutor,
        scope: &mut ScriptScope,
    ) -> Result<bool, ScriptError> {
        let mut accepted = true;
        for (index, rule) in self.rules.iter().enumerate() {
            if index > 0 {
                // Short-circuit: AND skips when already false, OR when
                // already true.
                match rule.operator {
                    FilterOperator::And if !accepted => continue,
                    FilterOperator::Or if accepted => continue,
                    _ => {}
                }
            }
            let value = executor.execute(&rule.script, scope).await?;
            accepted = truthy(&value);
        }
        Ok(accepted)
    }
}

/// One mutation step in a transformer.
#[derive(Debug, Clone)]
pub struct TransformerStep {
    /// Display name used in error reporting.
    pub name: String,
    /// The step's script source.
    pub script: String,
}

/// An ordered sequence of steps plus an optional output template.
///
/// Steps read and mutate `msg` and the maps; the output template, when
/// present, produces the serialized wire form. Without a template the data
/// type adapter serializes `msg`.
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    /// The steps in declared order.
    pub steps: Vec<TransformerStep>,
    /// Optional serializer script; its string value becomes ENCODED.
    pub output_template: Option<String>,
}

impl Transformer {
    /// A transformer that passes the message through unchanged.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }
}

/// Outcome of a filter/transformer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterTransformerOutcome {
    /// The filter rejected; channel-scope map writes were rolled back.
    Rejected,
    /// The filter accepted and the transformer completed.
    Accepted {
        /// The message after the steps ran.
        transformed: String,
        /// The serialized wire form the next connector reads as RAW.
        encoded: String,
    },
}

/// Runs filter then transformer for one connector.
///
/// On rejection the channel/connector/response maps are restored to their
/// pre-filter snapshots; `global_map` writes made by rules persist either
/// way.
///
/// # Errors
///
/// Returns the first rule/step failure or a serialization failure; the
/// caller records it as processing-error content.
pub async fn run_filter_transformer(
    executor: &dyn ScriptExecutor,
    filter: &Filter,
    transformer: &Transformer,
    data_type: &dyn DataType,
    scope: &mut ScriptScope,
) -> Result<FilterTransformerOutcome, FilterTransformerError> {
    let channel_snapshot = scope.channel_map.snapshot();
    let connector_snapshot = scope.connector_map.snapshot();
    let response_snapshot = scope.response_map.snapshot();

    let accepted = filter.evaluate(executor, scope).await?;
    if !accepted {
        scope.channel_map.restore(channel_snapshot);
        scope.connector_map.restore(connector_snapshot);
        scope.response_map.restore(response_snapshot);
        return Ok(FilterTransformerOutcome::Rejected);
    }

    for step in &transformer.steps {
        executor.execute(&step.script, scope).await?;
    }

    let encoded = match &transformer.output_template {
        Some(template) => {
            let value = executor.execute(template, scope).await?;
            match value {
                Value::String(text) => text,
                Value::Null => scope.msg.clone(),
                other => other.to_string(),
            }
        }
        None => data_type.from_xml(&scope.msg)?,
    };

    Ok(FilterTransformerOutcome::Accepted {
        transformed: scope.msg.clone(),
        encoded,
    })
}

/// Runs a response transformer over `scope.response`.
///
/// # Errors
///
/// Propagates the first step failure; the caller records it as
/// response-error content.
pub async fn run_response_transformer(
    executor: &dyn ScriptExecutor,
    transformer: &Transformer,
    scope: &mut ScriptScope,
) -> Result<String, FilterTransformerError> {
    for step in &transformer.steps {
        executor.execute(&step.script, scope).await?;
    }
    if let Some(template) = &transformer.output_template {
        let value = executor.execute(template, scope).await?;
        if let Value::String(text) = value {
            return Ok(text);
        }
    }
    Ok(scope.response.clone().unwrap_or_default())
}

/// Handler signature for [`InProcessScriptExecutor`].
pub type ScriptHandler =
    Arc<dyn Fn(&mut ScriptScope) -> Result<Value, ScriptError> + Send + Sync>;

/// Deterministic executor dispatching script sources to registered Rust
/// handlers.
///
/// The "script source" acts as the handler key, so channel configurations
/// stay declarative while the behavior lives in process. This is the
/// executor core tests substitute for an embedded language engine.
#[derive(Default, Clone)]
pub struct InProcessScriptExecutor {
    handlers: HashMap<String, ScriptHandler>,
}

impl InProcessScriptExecutor {
    /// Creates an executor with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a script-source key.
    #[must_use]
    pub fn with_handler(
        mut self,
        script: impl Into<String>,
        handler: impl Fn(&mut ScriptScope) -> Result<Value, ScriptError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(script.into(), Arc::new(handler));
        self
    }
}

#[async_trait]
impl ScriptExecutor for InProcessScriptExecutor {
    async fn execute(
        &self,
        script: &str,
        scope: &mut ScriptScope,
    ) -> Result<Value, ScriptError> {
        match self.handlers.get(script) {
            Some(handler) => handler(scope),
            None => Err(ScriptError::new(
                script,
                "no handler registered for script",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PassthroughDataType;
    use serde_json::json;

    fn scope() -> ScriptScope {
        ScriptScope {
            msg: String::new(),
            response: None,
            response_status: None,
            response_status_message: None,
            source_map: MessageMap::new(),
            channel_map: MessageMap::new(),
            connector_map: MessageMap::new(),
            response_map: MessageMap::new(),
            destination_set: None,
            channel_id: ChannelId::try_new("11111111-2222-3333-4444-555555555555".to_string())
                .unwrap(),
            channel_name: "Test Channel".to_string(),
            message_id: MessageId::new(1),
            meta_data_id: MetaDataId::source(),
            connector_name: "Source".to_string(),
        }
    }

    fn rule(name: &str, operator: FilterOperator, script: &str) -> FilterRule {
        FilterRule {
            name: name.to_string(),
            operator,
            script: script.to_string(),
        }
    }

    #[tokio::test]
    async fn test_should_accept_when_filter_has_no_rules() {
        let executor = InProcessScriptExecutor::new();
        let mut scope = scope();
        let accepted = Filter::accept_all()
            .evaluate(&executor, &mut scope)
            .await
            .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn test_should_short_circuit_when_and_rule_already_failed() {
        let executor = InProcessScriptExecutor::new()
            .with_handler("first", |_| Ok(json!(false)))
            .with_handler("second", |_| {
                Err(ScriptError::new("second", "must not be evaluated"))
            });
        let filter = Filter {
            rules: vec![
                rule("first", FilterOperator::And, "first"),
                rule("second", FilterOperator::And, "second"),
            ],
        };
        let mut scope = scope();
        let accepted = filter.evaluate(&executor, &mut scope).await.unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_should_accept_when_or_rule_recovers_rejection() {
        let executor = InProcessScriptExecutor::new()
            .with_handler("no", |_| Ok(json!(false)))
            .with_handler("yes", |_| Ok(json!(true)));
        let filter = Filter {
            rules: vec![
                rule("no", FilterOperator::And, "no"),
                rule("yes", FilterOperator::Or, "yes"),
            ],
        };
        let mut scope = scope();
        assert!(filter.evaluate(&executor, &mut scope).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_roll_back_channel_map_writes_when_filter_rejects() {
        let executor = InProcessScriptExecutor::new().with_handler("reject", |scope| {
            scope.channel_map.set("leak", json!("x"));
            scope.globals().set_global("sticky", json!("kept"));
            Ok(json!(false))
        });
        let filter = Filter {
            rules: vec![rule("reject", FilterOperator::And, "reject")],
        };
        let mut scope = scope();
        let outcome = run_filter_transformer(
            &executor,
            &filter,
            &Transformer::passthrough(),
            &PassthroughDataType,
            &mut scope,
        )
        .await
        .unwrap();

        assert_eq!(outcome, FilterTransformerOutcome::Rejected);
        assert_eq!(scope.channel_map.get("leak"), None);
        // Global writes survive rejection.
        assert_eq!(
            GlobalMaps::instance().get_global("sticky"),
            Some(json!("kept"))
        );
        GlobalMaps::instance().reset();
    }

    #[tokio::test]
    async fn test_should_produce_encoded_output_when_transformer_accepts() {
        let executor = InProcessScriptExecutor::new().with_handler("uppercase", |scope| {
            scope.msg = scope.msg.to_uppercase();
            Ok(Value::Null)
        });
        let transformer = Transformer {
            steps: vec![TransformerStep {
                name: "uppercase".to_string(),
                script: "uppercase".to_string(),
            }],
            output_template: None,
        };
        let mut scope = scope();
        scope.msg = "<msg>test</msg>".to_string();

        let outcome = run_filter_transformer(
            &executor,
            &Filter::accept_all(),
            &transformer,
            &PassthroughDataType,
            &mut scope,
        )
        .await
        .unwrap();

        match outcome {
            FilterTransformerOutcome::Accepted {
                transformed,
                encoded,
            } => {
                assert_eq!(transformed, "<MSG>TEST</MSG>");
                assert_eq!(encoded, "<MSG>TEST</MSG>");
            }
            FilterTransformerOutcome::Rejected => panic!("expected acceptance"),
        }
    }

    #[tokio::test]
    async fn test_should_prefer_template_output_when_template_is_configured() {
        let executor = InProcessScriptExecutor::new()
            .with_handler("template", |_| Ok(json!("templated output")));
        let transformer = Transformer {
            steps: vec![],
            output_template: Some("template".to_string()),
        };
        let mut scope = scope();
        scope.msg = "anything".to_string();

        let outcome = run_filter_transformer(
            &executor,
            &Filter::accept_all(),
            &transformer,
            &PassthroughDataType,
            &mut scope,
        )
        .await
        .unwrap();

        assert!(matches!(
            outcome,
            FilterTransformerOutcome::Accepted { encoded, .. } if encoded == "templated output"
        ));
    }
}
