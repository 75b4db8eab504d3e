//! Axum authorization layer.
//!
//! [`RequireAccessLayer`] reads the [`IdentityContext`] injected by the
//! host's authentication middleware, builds the request's
//! [`AuthorizationContext`] (reusing one built by an outer layer), and
//! rejects the request unless its [`Requirement`] is met. Handlers receive the
//! context through the [`Authz`] extractor.
//!
//! Denials and policy failures produce the same generic 403 body; details
//! are only logged.

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

use super::context::AuthorizationContext;
use super::identity::IdentityContext;
use super::models::{PermissionKey, ResourceFlag, ResourceType};
use super::store::PolicyStore;
use crate::config::EngineConfig;
use crate::error::{AuthzError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Requirement
// ═══════════════════════════════════════════════════════════════════════════════

/// What a route demands of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// Any resolved identity; the context is still attached.
    Authenticated,
    /// A coarse permission key.
    Permission(PermissionKey),
    /// One fine-grained flag on a resource type.
    Resource(ResourceType, ResourceFlag),
    /// A listing scope other than `NONE` on a resource type.
    ViewAny(ResourceType),
}

impl Requirement {
    pub fn is_met(&self, context: &AuthorizationContext) -> bool {
        if context.is_fail_closed() {
            return false;
        }
        match self {
            Self::Authenticated => true,
            Self::Permission(key) => context.can(key.as_str()),
            Self::Resource(resource_type, flag) => context.has_flag(resource_type.as_str(), *flag),
            Self::ViewAny(resource_type) => context.can_view_at_all(resource_type.as_str()),
        }
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authenticated => write!(f, "authenticated"),
            Self::Permission(key) => write!(f, "permission:{}", key),
            Self::Resource(resource_type, flag) => write!(f, "{}:{}", resource_type, flag),
            Self::ViewAny(resource_type) => write!(f, "{}:view_any", resource_type),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════════════════════════

/// Axum extractor for the request's [`AuthorizationContext`].
#[derive(Debug, Clone)]
pub struct Authz(pub Arc<AuthorizationContext>);

impl std::ops::Deref for Authz {
    type Target = AuthorizationContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Authz
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<AuthorizationContext>>()
            .cloned()
            .map(Authz)
            .ok_or_else(|| {
                let body = serde_json::json!({
                    "success": false,
                    "error": {
                        "code": "MISSING_AUTHZ_CONTEXT",
                        "message": "Authorization context not available. Ensure RequireAccessLayer is applied.",
                    }
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that wraps services with access enforcement.
///
/// # Example
///
/// ```rust,ignore
/// use warden_core::authz::{RequireAccessLayer, Requirement};
///
/// let app = Router::new()
///     .route("/jobs", get(list_jobs))
///     .layer(RequireAccessLayer::new(store.clone(), engine_config, Requirement::ViewAny(jobs)));
/// ```
#[derive(Clone)]
pub struct RequireAccessLayer {
    store: Arc<dyn PolicyStore>,
    config: Arc<EngineConfig>,
    requirement: Requirement,
}

impl RequireAccessLayer {
    pub fn new(store: Arc<dyn PolicyStore>, config: EngineConfig, requirement: Requirement) -> Self {
        Self {
            store,
            config: Arc::new(config),
            requirement,
        }
    }

    /// Require a coarse permission key, e.g. `"manage_themes"`.
    pub fn permission(store: Arc<dyn PolicyStore>, config: EngineConfig, key: &str) -> Result<Self> {
        let key = PermissionKey::parse(key)?;
        Ok(Self::new(store, config, Requirement::Permission(key)))
    }

    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }
}

impl<S> Layer<S> for RequireAccessLayer {
    type Service = RequireAccessService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequireAccessService {
            inner,
            store: self.store.clone(),
            config: self.config.clone(),
            requirement: self.requirement.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Service that enforces a [`Requirement`] per request.
#[derive(Clone)]
pub struct RequireAccessService<S> {
    inner: S,
    store: Arc<dyn PolicyStore>,
    config: Arc<EngineConfig>,
    requirement: Requirement,
}

impl<S> Service<Request<Body>> for RequireAccessService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let store = self.store.clone();
        let config = self.config.clone();
        let requirement = self.requirement.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // An outer layer may already have built the request's context.
            let existing = request.extensions().get::<Arc<AuthorizationContext>>().cloned();

            let context = match existing {
                Some(context) => context,
                None => {
                    // Identity comes from the session layer upstream.
                    let Some(identity) = request.extensions().get::<IdentityContext>().cloned() else {
                        return Ok(AuthzError::unauthorized("Authentication required").into_response());
                    };
                    let context = AuthorizationContext::establish_or_deny(store, &identity, &config).await;
                    // Inject for handlers and any inner layers.
                    let context = Arc::new(context);
                    request.extensions_mut().insert(context.clone());
                    context
                }
            };

            // Evaluate the requirement.
            if !requirement.is_met(&context) {
                warn!(
                    user_id = %context.subject().user_id,
                    requirement = %requirement,
                    fail_closed = context.is_fail_closed(),
                    "Access denied"
                );
                return Ok(forbidden_response());
            }

            inner.call(request).await
        })
    }
}

/// Generic 403 body. Never reveals which check failed.
fn forbidden_response() -> Response {
    let body = serde_json::json!({
        "success": false,
        "error": {
            "code": "FORBIDDEN",
            "message": "Access denied",
        }
    });
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
