//! HTTP enforcement tests for `RequireAccessLayer`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::get,
    Extension, Router,
};
use tower::ServiceExt;
use warden_core::authz::{
    Authz, IdentityContext, InMemoryPolicyStore, MatchedResourcePermissions, Permission,
    PermissionKey, PolicyAdmin, PolicyStore, RequireAccessLayer, Requirement, ResourceFlag,
    ResourcePermission, ResourceType, Role, RoleId, RoleKey, TenantId, UserId,
};
use warden_core::config::EngineConfig;
use warden_core::error::Result;

// ============================================================================
// Test Utilities
// ============================================================================

fn jobs() -> ResourceType {
    ResourceType::parse("jobs").unwrap()
}

async fn seeded_store() -> Arc<dyn PolicyStore> {
    let store = InMemoryPolicyStore::new();
    let editor = store
        .create_role(Role::new(RoleKey::parse("editor").unwrap(), "Editor").with_id(RoleId::new("editor")))
        .await
        .unwrap();
    let themes = store
        .create_permission(Permission::new(PermissionKey::parse("manage_themes").unwrap(), "Manage themes"))
        .await
        .unwrap();
    store.assign_permission(&editor.id, &themes.id).await.unwrap();
    store
        .upsert_resource_permission(
            ResourcePermission::new(jobs())
                .for_role(editor.id.clone())
                .grant(ResourceFlag::ViewOwn)
                .grant(ResourceFlag::Create),
        )
        .await
        .unwrap();
    Arc::new(store)
}

async fn list_jobs(Authz(ctx): Authz) -> String {
    ctx.resolve_scope("jobs").to_string()
}

fn app(store: Arc<dyn PolicyStore>, requirement: Requirement, identity: Option<IdentityContext>) -> Router {
    let router = Router::new()
        .route("/jobs", get(list_jobs))
        .layer(RequireAccessLayer::new(store, EngineConfig::default(), requirement));
    match identity {
        Some(identity) => router.layer(Extension(identity)),
        None => router,
    }
}

fn editor() -> IdentityContext {
    IdentityContext::new("u1")
        .in_tenant("5")
        .with_roles([RoleId::new("editor")])
}

async fn status_of(router: Router) -> StatusCode {
    router
        .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap()
        .status()
}

/// Store that counts how many snapshots were loaded through it.
struct CountingStore {
    inner: Arc<dyn PolicyStore>,
    snapshot_loads: AtomicUsize,
}

#[async_trait]
impl PolicyStore for CountingStore {
    async fn get_roles_for_user(&self, user_id: &UserId) -> Result<Vec<RoleId>> {
        self.inner.get_roles_for_user(user_id).await
    }

    async fn get_roles(&self, role_ids: &[RoleId]) -> Result<Vec<Role>> {
        self.inner.get_roles(role_ids).await
    }

    async fn get_role_permission_keys(&self, role_ids: &[RoleId]) -> Result<HashSet<PermissionKey>> {
        self.inner.get_role_permission_keys(role_ids).await
    }

    async fn get_resource_permissions(
        &self,
        resource_type: &ResourceType,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<MatchedResourcePermissions> {
        self.inner.get_resource_permissions(resource_type, role_ids, tenant_id).await
    }

    async fn get_subject_resource_permissions(
        &self,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<ResourcePermission>> {
        self.snapshot_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_subject_resource_permissions(role_ids, tenant_id).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let router = app(seeded_store().await, Requirement::Authenticated, None);
    assert_eq!(status_of(router).await, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_granted_requirements_pass() {
    let store = seeded_store().await;

    let router = app(store.clone(), Requirement::ViewAny(jobs()), Some(editor()));
    assert_eq!(status_of(router).await, StatusCode::OK);

    let router = app(
        store.clone(),
        Requirement::Resource(jobs(), ResourceFlag::Create),
        Some(editor()),
    );
    assert_eq!(status_of(router).await, StatusCode::OK);

    let layer = RequireAccessLayer::permission(store, EngineConfig::default(), "manage_themes").unwrap();
    let router = Router::new()
        .route("/jobs", get(list_jobs))
        .layer(layer)
        .layer(Extension(editor()));
    assert_eq!(status_of(router).await, StatusCode::OK);
}

#[tokio::test]
async fn test_denied_requirements_are_forbidden() {
    let store = seeded_store().await;

    let router = app(
        store.clone(),
        Requirement::Resource(jobs(), ResourceFlag::DeleteAll),
        Some(editor()),
    );
    assert_eq!(status_of(router).await, StatusCode::FORBIDDEN);

    let router = app(
        store,
        Requirement::ViewAny(ResourceType::parse("invoices").unwrap()),
        Some(editor()),
    );
    assert_eq!(status_of(router).await, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_super_admin_passes_everything() {
    let router = app(
        Arc::new(InMemoryPolicyStore::new()),
        Requirement::Resource(jobs(), ResourceFlag::DeleteAll),
        Some(IdentityContext::new("root").super_admin()),
    );
    assert_eq!(status_of(router).await, StatusCode::OK);
}

#[tokio::test]
async fn test_handler_sees_request_context() {
    let router = app(seeded_store().await, Requirement::Authenticated, Some(editor()));
    let response = router
        .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"OWN");
}

#[tokio::test]
async fn test_missing_layer_is_server_error() {
    let router = Router::new()
        .route("/jobs", get(list_jobs))
        .layer(Extension(editor()));
    assert_eq!(status_of(router).await, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_stacked_layers_share_one_snapshot() {
    let counting = Arc::new(CountingStore {
        inner: seeded_store().await,
        snapshot_loads: AtomicUsize::new(0),
    });
    let store: Arc<dyn PolicyStore> = counting.clone();
    let stacked = |inner: Requirement| {
        Router::new()
            .route("/jobs", get(list_jobs))
            .layer(RequireAccessLayer::new(store.clone(), EngineConfig::default(), inner))
            .layer(RequireAccessLayer::new(
                store.clone(),
                EngineConfig::default(),
                Requirement::ViewAny(jobs()),
            ))
            .layer(Extension(editor()))
    };

    let router = stacked(Requirement::Resource(jobs(), ResourceFlag::Create));
    assert_eq!(status_of(router).await, StatusCode::OK);
    assert_eq!(counting.snapshot_loads.load(Ordering::SeqCst), 1);

    // The outer layer passes, the inner one denies from the same snapshot.
    let router = stacked(Requirement::Resource(jobs(), ResourceFlag::DeleteAll));
    assert_eq!(status_of(router).await, StatusCode::FORBIDDEN);
    assert_eq!(counting.snapshot_loads.load(Ordering::SeqCst), 2);
}
