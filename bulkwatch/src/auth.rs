//! Authorization contract and the per-watch recheck cache.
//!
//! Each watch memoizes its decision for a configurable interval. A revoked
//! grant stops a watch within at most one recheck interval.

use crate::error::BoxError;
use crate::selector::ResolvedSelector;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

/// Name reported for callers without an identity.
pub const ANONYMOUS_USER: &str = "system:anonymous";

/// The identity a connection acts as.
///
/// The gRPC service reads it from the request extensions, so an interceptor
/// that authenticates the caller can insert it there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserInfo {
    /// User name.
    pub name: String,
    /// Groups the user belongs to.
    pub groups: Vec<String>,
}

impl UserInfo {
    /// Create a user without groups.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
        }
    }

    /// The unauthenticated user.
    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_USER)
    }

    /// Add a group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// Everything an [`Authorizer`] needs to decide on a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    /// The caller.
    pub user: UserInfo,
    /// Always `watch` for this engine.
    pub verb: String,
    /// API group of the watched resource.
    pub group: String,
    /// API version of the watched resource.
    pub version: String,
    /// Plural resource name.
    pub resource: String,
    /// Namespace, empty for cluster-wide watches.
    pub namespace: String,
    /// Object name, empty unless a single object is watched.
    pub name: String,
}

impl Attributes {
    /// Attributes for `user` watching `selector`.
    pub fn watch(user: UserInfo, selector: &ResolvedSelector) -> Self {
        Self {
            user,
            verb: "watch".to_string(),
            group: selector.gvr.group.clone(),
            version: selector.gvr.version.clone(),
            resource: selector.gvr.resource.clone(),
            namespace: selector.namespace.clone(),
            name: selector.name.clone(),
        }
    }
}

/// The outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Free-form explanation, surfaced to the client on denial.
    pub reason: String,
}

impl Decision {
    /// An allow decision.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    /// A deny decision with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Decides whether a caller may watch a resource.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    /// Authorize `attributes`.
    ///
    /// An `Err` means no decision could be made; it is treated as a denial
    /// and its text is reported to the client.
    async fn authorize(&self, attributes: &Attributes) -> Result<Decision, BoxError>;
}

/// An [`Authorizer`] that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllow;

#[async_trait]
impl Authorizer for AlwaysAllow {
    async fn authorize(&self, _attributes: &Attributes) -> Result<Decision, BoxError> {
        Ok(Decision::allow())
    }
}

/// An authorizer failure, shareable so it can be memoized.
#[derive(Debug, Clone, Error)]
#[error("authorization check failed: {0}")]
pub struct AuthorizeError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl From<BoxError> for AuthorizeError {
    fn from(err: BoxError) -> Self {
        AuthorizeError(Arc::from(err))
    }
}

/// Memoizes one attribute set's authorization decision.
///
/// Any check within `recheck` of the previous authorizer call reuses its
/// outcome, errors included. A zero interval disables memoization.
pub struct PermissionCache {
    authorizer: Arc<dyn Authorizer>,
    attributes: Attributes,
    recheck: Duration,
    last: Option<(Instant, Result<Decision, AuthorizeError>)>,
}

impl PermissionCache {
    /// Create a cache that has not checked anything yet.
    pub fn new(authorizer: Arc<dyn Authorizer>, attributes: Attributes, recheck: Duration) -> Self {
        Self {
            authorizer,
            attributes,
            recheck,
            last: None,
        }
    }

    /// The fixed attributes this cache checks.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Return the memoized decision, or ask the authorizer if it is stale.
    pub async fn check(&mut self) -> Result<Decision, AuthorizeError> {
        let now = Instant::now();

        if let Some((checked_at, result)) = &self.last {
            if !self.recheck.is_zero() && now.duration_since(*checked_at) < self.recheck {
                return result.clone();
            }
        }

        trace!(resource = %self.attributes.resource, "rechecking watch permission");

        let result = self
            .authorizer
            .authorize(&self.attributes)
            .await
            .map_err(AuthorizeError::from);

        self.last = Some((now, result.clone()));
        result
    }
}

impl fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionCache")
            .field("attributes", &self.attributes)
            .field("recheck", &self.recheck)
            .field("last", &self.last.as_ref().map(|(_, result)| result))
            .finish()
    }
}
