// Prefix functors resolving references against the execution graph, and
// helper functors for post-processing values

use super::parser::PathSegment;
use crate::cache::NodeExecutionsCache;
use crate::error::{EngineError, EngineResult};
use crate::types::{Ambiance, NodeExecution};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Resolves the remainder of a reference after its prefix segment
#[async_trait::async_trait]
pub trait ExpressionFunctor: Send + Sync {
    async fn resolve(&self, path: &[PathSegment]) -> EngineResult<Option<Value>>;
}

/// Stateless `namespace.method(args)` helper
pub trait MethodFunctor: Send + Sync {
    fn call(&self, method: &str, args: &[Value]) -> EngineResult<Value>;
}

/// Data of a node execution visible to expressions
pub fn node_data(ne: &NodeExecution) -> Value {
    json!({
        "uuid": ne.uuid,
        "identifier": ne.node.identifier,
        "name": ne.node.name,
        "fqn": ne.node.fqn,
        "type": ne.node.step_type.step_type,
        "status": ne.status.to_string(),
        "startTs": ne.start_ts,
        "endTs": ne.end_ts,
        "stepParameters": ne.node.step_parameters,
        "outcome": ne.outcomes,
        "output": ne.sweeping_outputs,
    })
}

/// Walk `path` inside `value`
pub fn resolve_path(value: &Value, path: &[PathSegment]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match (segment, current) {
            (PathSegment::Field(name), Value::Object(map)) => map.get(name)?,
            (PathSegment::Field(name), Value::Array(items)) => {
                items.get(name.parse::<usize>().ok()?)?
            }
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Render a value for string interpolation
pub fn value_as_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Which map of published data an [`OutcomeFunctor`] reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishedData {
    Outcome,
    Output,
}

/// `outcome.*` / `output.*`: data published by the current node or, failing
/// that, the nearest level above it
pub struct OutcomeFunctor {
    pub ambiance: Ambiance,
    pub cache: Arc<NodeExecutionsCache>,
    pub kind: PublishedData,
}

#[async_trait::async_trait]
impl ExpressionFunctor for OutcomeFunctor {
    async fn resolve(&self, path: &[PathSegment]) -> EngineResult<Option<Value>> {
        let Some(name) = path.first().and_then(PathSegment::as_field) else {
            return Ok(None);
        };

        for level in self.ambiance.levels.iter().rev() {
            let Some(ne) = self.cache.fetch(&level.runtime_id).await? else {
                continue;
            };
            let published = match self.kind {
                PublishedData::Outcome => &ne.outcomes,
                PublishedData::Output => &ne.sweeping_outputs,
            };
            if let Some(value) = published.get(name) {
                return Ok(resolve_path(value, &path[1..]));
            }
        }
        Ok(None)
    }
}

/// `ancestor.*` and group aliases: walk up the parent chain.
///
/// Without a group the first ancestor that resolves the path wins. With a
/// group the walk stops at the nearest node tagged with it.
pub struct AncestorFunctor {
    pub ambiance: Ambiance,
    pub cache: Arc<NodeExecutionsCache>,
    pub group: Option<String>,
    pub include_self: bool,
}

#[async_trait::async_trait]
impl ExpressionFunctor for AncestorFunctor {
    async fn resolve(&self, path: &[PathSegment]) -> EngineResult<Option<Value>> {
        let Some(current_id) = self.ambiance.current_runtime_id() else {
            return Ok(None);
        };
        let Some(current) = self.cache.fetch(current_id).await? else {
            return Ok(None);
        };

        let mut next = if self.include_self {
            Some(current)
        } else {
            match current.parent_id.as_deref() {
                Some(parent_id) => self.cache.fetch(parent_id).await?,
                None => None,
            }
        };

        while let Some(ne) = next {
            match &self.group {
                Some(group) => {
                    if ne.node.group.as_deref() == Some(group.as_str()) {
                        return Ok(resolve_path(&node_data(&ne), path));
                    }
                }
                None => {
                    if let Some(value) = resolve_path(&node_data(&ne), path) {
                        return Ok(Some(value));
                    }
                }
            }
            next = match ne.parent_id.as_deref() {
                Some(parent_id) => self.cache.fetch(parent_id).await?,
                None => None,
            };
        }
        Ok(None)
    }
}

/// `child.<identifier>.*`: nearest descendant with the identifier, breadth-first
pub struct ChildFunctor {
    pub ambiance: Ambiance,
    pub cache: Arc<NodeExecutionsCache>,
}

#[async_trait::async_trait]
impl ExpressionFunctor for ChildFunctor {
    async fn resolve(&self, path: &[PathSegment]) -> EngineResult<Option<Value>> {
        let Some(identifier) = path.first().and_then(PathSegment::as_field) else {
            return Ok(None);
        };
        let Some(current_id) = self.ambiance.current_runtime_id() else {
            return Ok(None);
        };

        let mut queue = VecDeque::from([current_id.to_string()]);
        while let Some(parent_id) = queue.pop_front() {
            for child in self.cache.fetch_children(Some(&parent_id)).await? {
                if child.node.identifier == identifier {
                    return Ok(resolve_path(&node_data(&child), &path[1..]));
                }
                queue.push_back(child.uuid.clone());
            }
        }
        Ok(None)
    }
}

/// `qualified.<fqn>.*`: locate the node with the longest fully qualified name
/// that prefixes the path, starting from the plan roots
pub struct QualifiedFunctor {
    pub cache: Arc<NodeExecutionsCache>,
}

#[async_trait::async_trait]
impl ExpressionFunctor for QualifiedFunctor {
    async fn resolve(&self, path: &[PathSegment]) -> EngineResult<Option<Value>> {
        let names: Vec<&str> = path.iter().map_while(PathSegment::as_field).collect();
        if names.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(Arc<NodeExecution>, usize)> = None;
        let mut frontier = self.cache.fetch_children(None).await?;

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for ne in frontier {
                let matched = if ne.node.fqn.is_empty() {
                    // Structural nodes without a name are transparent
                    Some(0)
                } else {
                    fqn_prefix_len(&ne.node.fqn, &names)
                };
                let Some(matched) = matched else {
                    continue;
                };
                if matched > best.as_ref().map_or(0, |(_, len)| *len) {
                    best = Some((ne.clone(), matched));
                }
                next.extend(self.cache.fetch_children(Some(&ne.uuid)).await?);
            }
            frontier = next;
        }

        Ok(best.and_then(|(ne, matched)| resolve_path(&node_data(&ne), &path[matched..])))
    }
}

fn fqn_prefix_len(fqn: &str, names: &[&str]) -> Option<usize> {
    let parts: Vec<&str> = fqn.split('.').collect();
    if parts.len() > names.len() || parts.iter().zip(names).any(|(a, b)| a != b) {
        return None;
    }
    Some(parts.len())
}

fn arg<'a>(args: &'a [Value], index: usize, functor: &str) -> EngineResult<&'a Value> {
    args.get(index).ok_or_else(|| EngineError::InvalidExpression {
        expression: functor.to_string(),
        message: format!("missing argument {}", index + 1),
    })
}

fn compile(pattern: &str) -> EngineResult<Regex> {
    Regex::new(pattern).map_err(|e| EngineError::InvalidExpression {
        expression: pattern.to_string(),
        message: e.to_string(),
    })
}

/// `regex.match(pattern, input)`, `regex.extract(pattern, input)`,
/// `regex.replace(pattern, input, replacement)`
pub struct RegexFunctor;

impl MethodFunctor for RegexFunctor {
    fn call(&self, method: &str, args: &[Value]) -> EngineResult<Value> {
        let pattern = compile(&value_as_str(arg(args, 0, "regex")?))?;
        let input = value_as_str(arg(args, 1, "regex")?);
        match method {
            "match" => Ok(Value::Bool(pattern.is_match(&input))),
            "extract" => Ok(pattern
                .find(&input)
                .map(|m| Value::String(m.as_str().to_string()))
                .unwrap_or(Value::Null)),
            "replace" => {
                let replacement = value_as_str(arg(args, 2, "regex.replace")?);
                Ok(Value::String(
                    pattern.replace_all(&input, replacement.as_str()).into_owned(),
                ))
            }
            other => Err(EngineError::InvalidExpression {
                expression: format!("regex.{}", other),
                message: "unknown method".to_string(),
            }),
        }
    }
}

/// `json.object(text)`, `json.select(path, text)`
pub struct JsonFunctor;

impl JsonFunctor {
    fn parse(value: &Value) -> EngineResult<Value> {
        match value {
            Value::String(text) => Ok(serde_json::from_str(text)?),
            other => Ok(other.clone()),
        }
    }
}

impl MethodFunctor for JsonFunctor {
    fn call(&self, method: &str, args: &[Value]) -> EngineResult<Value> {
        match method {
            "object" => Self::parse(arg(args, 0, "json.object")?),
            "select" => {
                let path: Vec<PathSegment> = value_as_str(arg(args, 0, "json.select")?)
                    .split('.')
                    .filter(|s| !s.is_empty())
                    .map(|s| PathSegment::Field(s.to_string()))
                    .collect();
                let document = Self::parse(arg(args, 1, "json.select")?)?;
                Ok(resolve_path(&document, &path).unwrap_or(Value::Null))
            }
            other => Err(EngineError::InvalidExpression {
                expression: format!("json.{}", other),
                message: "unknown method".to_string(),
            }),
        }
    }
}

/// `xml.select("/root/child", text)`: text content of the first matching element
pub struct XmlFunctor;

impl XmlFunctor {
    fn select(path: &str, document: &str) -> EngineResult<Value> {
        let target: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut reader = Reader::from_str(document);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<String> = Vec::new();
        let mut text = String::new();
        let mut capturing = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                    if !capturing && stack.iter().map(String::as_str).eq(target.iter().copied()) {
                        capturing = true;
                    }
                }
                Ok(Event::Text(e)) if capturing => {
                    let unescaped = e.unescape().map_err(|err| EngineError::InvalidExpression {
                        expression: path.to_string(),
                        message: err.to_string(),
                    })?;
                    text.push_str(&unescaped);
                }
                Ok(Event::CData(e)) if capturing => {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
                Ok(Event::End(_)) => {
                    if capturing && stack.len() == target.len() {
                        return Ok(Value::String(text));
                    }
                    stack.pop();
                }
                Ok(Event::Eof) => return Ok(Value::Null),
                Ok(_) => {}
                Err(err) => {
                    return Err(EngineError::InvalidExpression {
                        expression: path.to_string(),
                        message: err.to_string(),
                    })
                }
            }
        }
    }
}

impl MethodFunctor for XmlFunctor {
    fn call(&self, method: &str, args: &[Value]) -> EngineResult<Value> {
        match method {
            "select" => {
                let path = value_as_str(arg(args, 0, "xml.select")?);
                let document = value_as_str(arg(args, 1, "xml.select")?);
                Self::select(&path, &document)
            }
            other => Err(EngineError::InvalidExpression {
                expression: format!("xml.{}", other),
                message: "unknown method".to_string(),
            }),
        }
    }
}
