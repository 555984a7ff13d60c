//! Selector resolution and filter parsing.
//!
//! A client-supplied [`ResourceSelector`] is resolved exactly once, when its
//! watch is created: the version is defaulted from the registry and a
//! by-name request is folded into the field selector.

use crate::message::{ListOptions, ResourceSelector};
use crate::registry::Registry;
use crate::status::Status;
use std::collections::BTreeMap;
use std::fmt;

/// Field path of an object's name in field selectors.
pub const NAME_FIELD: &str = "metadata.name";
/// Field path of an object's namespace in field selectors.
pub const NAMESPACE_FIELD: &str = "metadata.namespace";

/// Fully qualified resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionResource {
    /// API group, empty for the core group.
    pub group: String,
    /// API version.
    pub version: String,
    /// Plural resource name.
    pub resource: String,
}

impl GroupVersionResource {
    /// Create a new `GroupVersionResource`.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}, Resource={}", self.version, self.resource)
        } else {
            write!(f, "{}/{}, Resource={}", self.group, self.version, self.resource)
        }
    }
}

/// A selector after version defaulting and name translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSelector {
    /// The resource type to watch.
    pub gvr: GroupVersionResource,
    /// Namespace to watch, empty for all namespaces.
    pub namespace: String,
    /// The single object watched, if any. Already merged into `options`.
    pub name: String,
    /// Options handed to the storage.
    pub options: ListOptions,
}

impl ResourceSelector {
    /// Resolve this selector against `registry`.
    ///
    /// Resolution is pure: resolving the same selector twice yields equal
    /// results.
    pub fn resolve(&self, registry: &Registry) -> Result<ResolvedSelector, Status> {
        if self.resource.is_empty() {
            return Err(Status::invalid_argument("selector must name a resource"));
        }

        let version = if self.version.is_empty() {
            match registry.preferred_version(&self.group) {
                Some(version) => version.to_string(),
                None => {
                    return Err(Status::not_found(format!(
                        "unsupported group/version: no preferred version for group {:?}",
                        self.group
                    )))
                }
            }
        } else {
            self.version.clone()
        };

        let mut options = self.options.clone().unwrap_or_default();

        if !self.name.is_empty() {
            if self.name.contains(|c| matches!(c, ',' | '=' | '!')) {
                return Err(Status::invalid_argument(format!(
                    "invalid object name {:?}",
                    self.name
                )));
            }

            let term = format!("{NAME_FIELD}={}", self.name);
            options.field_selector = and_selectors(&options.field_selector, &term);
        }

        Ok(ResolvedSelector {
            gvr: GroupVersionResource {
                group: self.group.clone(),
                version,
                resource: self.resource.clone(),
            },
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            options,
        })
    }
}

fn and_selectors(existing: &str, term: &str) -> String {
    if existing.trim().is_empty() {
        return term.to_string();
    }

    if existing.split(',').any(|t| t.trim() == term) {
        return existing.to_string();
    }

    format!("{existing},{term}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
}

/// A parsed, equality-based field selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<(String, Operator, String)>,
}

impl FieldSelector {
    /// Parse a selector such as `metadata.name=web-0,metadata.namespace!=kube-system`.
    ///
    /// An empty string selects everything.
    pub fn parse(selector: &str) -> Result<Self, Status> {
        let mut requirements = Vec::new();

        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (field, op, value) = split_term(term).ok_or_else(|| {
                Status::invalid_argument(format!("invalid field selector term {term:?}"))
            })?;
            requirements.push((field.to_string(), op, value.to_string()));
        }

        Ok(Self { requirements })
    }

    /// Returns true if the selector places no constraint.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Check the selector against an object's fields.
    ///
    /// Unknown fields never match an equality requirement.
    pub fn matches<'a>(&self, field: impl Fn(&str) -> Option<&'a str>) -> bool {
        self.requirements.iter().all(|(name, op, value)| {
            let actual = field(name);
            match op {
                Operator::Equals => actual == Some(value.as_str()),
                Operator::NotEquals => actual != Some(value.as_str()),
            }
        })
    }
}

fn split_term(term: &str) -> Option<(&str, Operator, &str)> {
    let (key, op, value) = if let Some((key, value)) = term.split_once("!=") {
        (key, Operator::NotEquals, value)
    } else if let Some((key, value)) = term.split_once("==") {
        (key, Operator::Equals, value)
    } else {
        let (key, value) = term.split_once('=')?;
        (key, Operator::Equals, value)
    };

    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    Some((key, op, value.trim()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelRequirement {
    Compare(String, Operator, String),
    Exists(String),
    NotExists(String),
}

/// A parsed, equality-based label selector.
///
/// Supports `key=value`, `key==value`, `key!=value`, `key` and `!key` terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    /// Parse a comma separated label selector. An empty string selects everything.
    pub fn parse(selector: &str) -> Result<Self, Status> {
        let mut requirements = Vec::new();

        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let requirement = if term.contains('=') {
                let (key, op, value) = split_term(term).ok_or_else(|| {
                    Status::invalid_argument(format!("invalid label selector term {term:?}"))
                })?;
                LabelRequirement::Compare(key.to_string(), op, value.to_string())
            } else if let Some(key) = term.strip_prefix('!') {
                LabelRequirement::NotExists(key.trim().to_string())
            } else {
                LabelRequirement::Exists(term.to_string())
            };

            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    /// Returns true if the selector places no constraint.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Check the selector against a label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|requirement| match requirement {
            LabelRequirement::Compare(key, Operator::Equals, value) => {
                labels.get(key) == Some(value)
            }
            LabelRequirement::Compare(key, Operator::NotEquals, value) => {
                labels.get(key) != Some(value)
            }
            LabelRequirement::Exists(key) => labels.contains_key(key),
            LabelRequirement::NotExists(key) => !labels.contains_key(key),
        })
    }
}
