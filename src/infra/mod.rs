//! Declarative infrastructure plans.
//!
//! Planners register named cloud resources into a [`ResourceGraph`]. A resource property may
//! reference another resource's output as `${name.property}`; such references and explicit
//! `depends_on` edges must point to resources registered earlier, so the graph is always acyclic
//! and in creation order. A reference can be piped through a filter, the only one being
//! `trim_prefix("...")`, applied once the output value is known:
//!
//! ```text
//! ${eks-oidc-provider.url | trim_prefix("https://")}
//! ```
//!
//! The serialized graph is handed to the provisioning engine.

use crate::config::ConfigurationError;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;

pub mod eks;
pub mod vpc;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum InfraError {
    #[error("Configuration error: {underlying_error}")]
    Configuration { underlying_error: ConfigurationError },
    #[error("Resource `{name}` is already registered")]
    DuplicateResource { name: Arc<str> },
    #[error("Resource `{name}` depends on unknown resource `{dependency}`")]
    UnknownDependency {
        name: Arc<str>,
        dependency: Arc<str>,
    },
    #[error("Resource `{name}` has an invalid reference `{expression}`")]
    InvalidReference {
        name: Arc<str>,
        expression: Arc<str>,
    },
    #[error("Cannot serialize resource graph: {raw_message}")]
    CannotSerialize { raw_message: Arc<str> },
}

impl From<ConfigurationError> for InfraError {
    fn from(underlying_error: ConfigurationError) -> Self {
        InfraError::Configuration { underlying_error }
    }
}

/// Handle on a registered resource.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResourceRef {
    name: String,
}

impl ResourceRef {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Reference to one of the resource outputs, resolved by the engine at apply time.
    pub fn output(&self, property: &str) -> String {
        format!("${{{}.{}}}", self.name, property)
    }

    /// Same as [`ResourceRef::output`], with `prefix` removed from the value once resolved.
    pub fn output_trim_prefix(&self, property: &str, prefix: &str) -> String {
        format!(
            "${{{}.{} | trim_prefix(\"{}\")}}",
            self.name, property, prefix
        )
    }

    pub fn id(&self) -> String {
        self.output("id")
    }

    pub fn arn(&self) -> String {
        self.output("arn")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub properties: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// property paths the engine must not reconcile once created
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignore_changes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResourceGraph {
    resources: Vec<Resource>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<String, Value>,
    #[serde(skip)]
    names: HashSet<String>,
}

#[derive(Debug, Eq, PartialEq)]
enum Filter<'a> {
    TrimPrefix(&'a str),
}

impl Filter<'_> {
    fn apply<'v>(&self, value: &'v str) -> &'v str {
        match self {
            Filter::TrimPrefix(prefix) => value.strip_prefix(*prefix).unwrap_or(value),
        }
    }
}

/// Body of a `${...}` expression.
#[derive(Debug, Eq, PartialEq)]
struct Reference<'a> {
    resource: &'a str,
    /// `resource.property`, the key resolved outputs are looked up by
    target: &'a str,
    filter: Option<Filter<'a>>,
}

impl<'a> Reference<'a> {
    /// `None` when the expression is not a reference, `Err` when its filter is unknown.
    fn parse(expression: &'a str) -> Result<Option<Reference<'a>>, ()> {
        let (target, filter) = match expression.split_once('|') {
            Some((target, filter)) => (target.trim(), Some(filter.trim())),
            None => (expression.trim(), None),
        };
        // the property may be a path like `identities[0].oidcs[0].issuer`
        let Some((resource, _)) = target.split_once('.') else {
            return Ok(None);
        };
        let filter = match filter {
            None => None,
            Some(filter) => Some(
                filter
                    .strip_prefix("trim_prefix(\"")
                    .and_then(|f| f.strip_suffix("\")"))
                    .map(Filter::TrimPrefix)
                    .ok_or(())?,
            ),
        };

        Ok(Some(Reference {
            resource,
            target,
            filter,
        }))
    }
}

/// Calls `f` with every `${...}` expression in `s`, along with its byte range.
fn for_each_expression<'a, E>(
    s: &'a str,
    mut f: impl FnMut(std::ops::Range<usize>, &'a str) -> Result<(), E>,
) -> Result<(), E> {
    let mut offset = 0;
    while let Some(start) = s[offset..].find("${") {
        let start = offset + start;
        let Some(end) = s[start..].find('}') else {
            break;
        };
        let end = start + end;
        f(start..end + 1, &s[start + 2..end])?;
        offset = end + 1;
    }
    Ok(())
}

fn scan_references(s: &str, references: &mut BTreeSet<String>) -> Result<(), Arc<str>> {
    for_each_expression(s, |_, expression| {
        match Reference::parse(expression) {
            Ok(Some(reference)) => {
                references.insert(reference.resource.to_string());
            }
            Ok(None) => {}
            Err(()) => return Err(Arc::from(expression)),
        }
        Ok(())
    })
}

fn collect_references(value: &Value, references: &mut BTreeSet<String>) -> Result<(), Arc<str>> {
    match value {
        Value::String(s) => scan_references(s, references),
        Value::Array(values) => values
            .iter()
            .try_for_each(|v| collect_references(v, references)),
        Value::Object(map) => map.iter().try_for_each(|(key, v)| {
            scan_references(key, references)?;
            collect_references(v, references)
        }),
        _ => Ok(()),
    }
}

/// Substitutes every reference found in `known`, leaving the others in place.
fn resolve_str(s: &str, known: &BTreeMap<String, String>) -> String {
    let mut resolved = String::with_capacity(s.len());
    let mut copied = 0;
    let _ = for_each_expression(s, |range, expression| {
        if let Ok(Some(reference)) = Reference::parse(expression) {
            if let Some(value) = known.get(reference.target) {
                let value = match &reference.filter {
                    Some(filter) => filter.apply(value),
                    None => value.as_str(),
                };
                resolved.push_str(&s[copied..range.start]);
                resolved.push_str(value);
                copied = range.end;
            }
        }
        Ok::<(), ()>(())
    });
    resolved.push_str(&s[copied..]);
    resolved
}

fn resolve_value(value: &mut Value, known: &BTreeMap<String, String>) {
    match value {
        Value::String(s) => *s = resolve_str(s, known),
        Value::Array(values) => values.iter_mut().for_each(|v| resolve_value(v, known)),
        Value::Object(map) => {
            *map = std::mem::take(map)
                .into_iter()
                .map(|(key, mut v)| {
                    resolve_value(&mut v, known);
                    (resolve_str(&key, known), v)
                })
                .collect();
        }
        _ => {}
    }
}

impl ResourceGraph {
    pub fn new() -> Self {
        ResourceGraph::default()
    }

    /// Adds a resource. Dependencies are the explicit `depends_on` plus every resource referenced
    /// from `properties`.
    pub fn register(
        &mut self,
        name: &str,
        type_: &str,
        properties: Value,
        depends_on: &[&ResourceRef],
    ) -> Result<ResourceRef, InfraError> {
        if self.names.contains(name) {
            return Err(InfraError::DuplicateResource {
                name: Arc::from(name),
            });
        }

        let mut dependencies: BTreeSet<String> =
            depends_on.iter().map(|r| r.name.to_string()).collect();
        collect_references(&properties, &mut dependencies).map_err(|expression| {
            InfraError::InvalidReference {
                name: Arc::from(name),
                expression,
            }
        })?;
        if let Some(unknown) = dependencies.iter().find(|d| !self.names.contains(*d)) {
            return Err(InfraError::UnknownDependency {
                name: Arc::from(name),
                dependency: Arc::from(unknown.as_str()),
            });
        }

        self.names.insert(name.to_string());
        self.resources.push(Resource {
            name: name.to_string(),
            type_: type_.to_string(),
            properties,
            depends_on: dependencies.into_iter().collect(),
            ignore_changes: Vec::new(),
        });

        Ok(ResourceRef {
            name: name.to_string(),
        })
    }

    pub fn ignore_changes(&mut self, resource: &ResourceRef, property_paths: &[&str]) {
        if let Some(r) = self.resources.iter_mut().find(|r| r.name == resource.name) {
            r.ignore_changes
                .extend(property_paths.iter().map(|p| p.to_string()));
        }
    }

    /// Publishes a stack output, typically a reference to a resource output.
    pub fn export(&mut self, name: &str, value: Value) {
        self.outputs.insert(name.to_string(), value);
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Substitutes outputs already known from a previous apply, keyed by `resource.property`.
    /// Dependency edges are kept so the engine still creates resources in order.
    pub fn resolve(&mut self, known: &BTreeMap<String, String>) {
        for resource in &mut self.resources {
            resolve_value(&mut resource.properties, known);
        }
        for value in self.outputs.values_mut() {
            resolve_value(value, known);
        }
    }

    pub fn to_yaml(&self) -> Result<String, InfraError> {
        serde_yaml::to_string(self).map_err(|e| InfraError::CannotSerialize {
            raw_message: Arc::from(e.to_string()),
        })
    }
}
