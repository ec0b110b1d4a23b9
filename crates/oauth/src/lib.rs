//! escalatesafe_oauth
//!
//! C7: per-tenant OAuth2 token lifecycle. Preemptive refresh (5-minute
//! window), classified refresh failures, per-tenant mutex-guarded
//! critical section so two concurrent requests needing a refresh for the
//! same tenant serialize rather than double-refresh and invalidate each
//! other's rotated refresh token.
//!
//! Grounded on `original_source/api/services/oauth_service.py`.

use async_trait::async_trait;
use escalatesafe_domain::{InstallState, OauthState, RunStore, Tenant, TenantId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;

const REFRESH_WINDOW_SECS: f64 = 300.0;

fn now_unix() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub scope: String,
}

/// Divergence from the original (`refresh_access_token` raises a single
/// `ValueError` for any `requests.RequestException`): the manager needs
/// to distinguish permanent authorization loss from a blip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailureClass {
    InvalidGrant,
    Transient,
    Other,
}

#[derive(Debug, Error)]
#[error("upstream oauth call failed: {message}")]
pub struct UpstreamError {
    pub class: UpstreamFailureClass,
    pub message: String,
}

impl UpstreamError {
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self { class: UpstreamFailureClass::InvalidGrant, message: message.into() }
    }
    pub fn transient(message: impl Into<String>) -> Self {
        Self { class: UpstreamFailureClass::Transient, message: message.into() }
    }
    pub fn other(message: impl Into<String>) -> Self {
        Self { class: UpstreamFailureClass::Other, message: message.into() }
    }
}

#[async_trait]
pub trait UpstreamOAuthClient: Send + Sync {
    async fn exchange_code(
        &self,
        subdomain: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, UpstreamError>;

    async fn refresh(&self, subdomain: &str, refresh_token: &str) -> Result<TokenResponse, UpstreamError>;
}

/// Taxonomy entries this crate can raise, per §7.
#[derive(Debug, Error)]
pub enum OauthError {
    #[error("OAUTH_NOT_CONFIGURED: no access token for tenant {0:?}")]
    NotConfigured(TenantId),
    #[error("OAUTH_REFRESH_FAILED: {0}")]
    RefreshFailed(String),
    #[error("OAUTH_REVOKED: tenant {0:?} was suspended after an invalid_grant response")]
    Revoked(TenantId),
    #[error(transparent)]
    Domain(#[from] escalatesafe_domain::DomainError),
}

pub struct TokenManager {
    store: Arc<dyn RunStore>,
    client: Arc<dyn UpstreamOAuthClient>,
    refresh_locks: Mutex<HashMap<TenantId, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn RunStore>, client: Arc<dyn UpstreamOAuthClient>) -> Self {
        Self { store, client, refresh_locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, tenant_id: &TenantId) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks.entry(tenant_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// `install(subdomain, app_guid) -> authorize_url`. Creates or updates
    /// a Tenant in `pending`. The authorize URL carries `state = tenant_id`.
    pub async fn install(
        &self,
        host: &str,
        subdomain: &str,
        client_id: &str,
        redirect_uri: &str,
        app_guid: Option<&str>,
    ) -> Result<(TenantId, String), OauthError> {
        let existing = self.store.get_tenant_by_subdomain(subdomain).await;
        let tenant = match existing {
            Some(mut t) => {
                t.install_state = InstallState::Pending;
                if let Some(guid) = app_guid {
                    t.install_ref = Some(guid.to_string());
                }
                t
            }
            None => {
                let mut t = Tenant::new(TenantId(uuid::Uuid::new_v4().to_string()), subdomain);
                t.install_ref = app_guid.map(|s| s.to_string());
                t
            }
        };
        let tenant = self.store.upsert_tenant(tenant).await?;

        let url = format!(
            "https://{subdomain}.{host}/oauth/authorizations/new?response_type=code&redirect_uri={redirect_uri}&client_id={client_id}&scope=read%20write&state={state}",
            state = tenant.id.0,
        );
        Ok((tenant.id, url))
    }

    /// `callback(code, state) -> void`. Exchanges `code` for tokens
    /// (grant `authorization_code`) and advances `install_state` to
    /// `active`.
    pub async fn callback(
        &self,
        tenant_id: &TenantId,
        code: &str,
        redirect_uri: &str,
    ) -> Result<(), OauthError> {
        let mut tenant = self.store.get_tenant(tenant_id).await?;
        let tokens = self
            .client
            .exchange_code(&tenant.subdomain, code, redirect_uri)
            .await
            .map_err(|e| OauthError::RefreshFailed(e.message))?;

        tenant.oauth = OauthState {
            access_token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token,
            expiry: Some(now_unix() + tokens.expires_in as f64),
            scopes: Some(tokens.scope),
        };
        tenant.install_state = InstallState::Active;
        self.store.upsert_tenant(tenant).await?;
        Ok(())
    }

    /// `valid_token(tenant) -> access_token`. Side effect: persists
    /// refreshed tokens.
    pub async fn valid_token(&self, tenant_id: &TenantId) -> Result<String, OauthError> {
        let tenant = self.store.get_tenant(tenant_id).await?;
        let Some(access_token) = tenant.oauth.access_token.clone() else {
            return Err(OauthError::NotConfigured(tenant_id.clone()));
        };

        let expiry = tenant.oauth.expiry.unwrap_or(0.0);
        if now_unix() + REFRESH_WINDOW_SECS < expiry {
            return Ok(access_token);
        }

        let lock = self.lock_for(tenant_id).await;
        let _guard = lock.lock().await;

        // Re-read after acquiring the critical section: another task may
        // have already refreshed while we waited.
        let tenant = self.store.get_tenant(tenant_id).await?;
        let expiry = tenant.oauth.expiry.unwrap_or(0.0);
        if now_unix() + REFRESH_WINDOW_SECS < expiry {
            return Ok(tenant.oauth.access_token.unwrap_or(access_token));
        }

        let Some(refresh_token) = tenant.oauth.refresh_token.clone() else {
            return Err(OauthError::NotConfigured(tenant_id.clone()));
        };

        match self.client.refresh(&tenant.subdomain, &refresh_token).await {
            Ok(tokens) => {
                let mut updated = tenant.clone();
                updated.oauth.access_token = Some(tokens.access_token.clone());
                updated.oauth.expiry = Some(now_unix() + tokens.expires_in as f64);
                if let Some(rotated) = tokens.refresh_token {
                    updated.oauth.refresh_token = Some(rotated);
                }
                self.store.upsert_tenant(updated).await?;
                Ok(tokens.access_token)
            }
            Err(e) if e.class == UpstreamFailureClass::InvalidGrant => {
                let mut updated = tenant.clone();
                updated.oauth = OauthState::default();
                updated.install_state = InstallState::Suspended;
                self.store.upsert_tenant(updated).await?;
                Err(OauthError::Revoked(tenant_id.clone()))
            }
            Err(e) if e.class == UpstreamFailureClass::Transient => {
                if now_unix() < expiry {
                    tracing::warn!(tenant_id = %tenant_id.0, "oauth refresh transient failure, serving token within absolute expiry");
                    Ok(access_token)
                } else {
                    Err(OauthError::RefreshFailed(e.message))
                }
            }
            Err(e) => Err(OauthError::RefreshFailed(e.message)),
        }
    }

    /// `revoke(tenant)` clears tokens and sets `install_state = suspended`.
    pub async fn revoke(&self, tenant_id: &TenantId) -> Result<(), OauthError> {
        let mut tenant = self.store.get_tenant(tenant_id).await?;
        tenant.oauth = OauthState::default();
        tenant.install_state = InstallState::Suspended;
        self.store.upsert_tenant(tenant).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escalatesafe_domain::InMemoryRunStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeUpstream {
        refresh_calls: AtomicU32,
        behavior: FakeBehavior,
    }

    #[derive(Clone, Copy)]
    enum FakeBehavior {
        Success,
        InvalidGrant,
        Transient,
    }

    #[async_trait]
    impl UpstreamOAuthClient for FakeUpstream {
        async fn exchange_code(&self, _: &str, _: &str, _: &str) -> Result<TokenResponse, UpstreamError> {
            Ok(TokenResponse {
                access_token: "initial-access".into(),
                refresh_token: Some("initial-refresh".into()),
                expires_in: 7200,
                scope: "read write".into(),
            })
        }

        async fn refresh(&self, _: &str, _: &str) -> Result<TokenResponse, UpstreamError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                FakeBehavior::Success => Ok(TokenResponse {
                    access_token: "refreshed-access".into(),
                    refresh_token: None,
                    expires_in: 7200,
                    scope: "read write".into(),
                }),
                FakeBehavior::InvalidGrant => Err(UpstreamError::invalid_grant("invalid_grant")),
                FakeBehavior::Transient => Err(UpstreamError::transient("network blip")),
            }
        }
    }

    async fn tenant_needing_refresh(store: &InMemoryRunStore, seconds_to_expiry: f64) -> TenantId {
        let mut tenant = Tenant::new(TenantId("t1".into()), "acme");
        tenant.oauth = OauthState {
            access_token: Some("old-access".into()),
            refresh_token: Some("old-refresh".into()),
            expiry: Some(now_unix() + seconds_to_expiry),
            scopes: Some("read write".into()),
        };
        store.upsert_tenant(tenant).await.unwrap();
        TenantId("t1".into())
    }

    #[tokio::test]
    async fn refreshes_when_within_5_minute_window() {
        let store = Arc::new(InMemoryRunStore::new());
        let tenant_id = tenant_needing_refresh(&store, 60.0).await;
        let upstream = Arc::new(FakeUpstream { refresh_calls: AtomicU32::new(0), behavior: FakeBehavior::Success });
        let manager = TokenManager::new(store.clone(), upstream.clone());

        let token = manager.valid_token(&tenant_id).await.unwrap();
        assert_eq!(token, "refreshed-access");
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn does_not_refresh_again_within_5_minutes_after_refresh() {
        let store = Arc::new(InMemoryRunStore::new());
        let tenant_id = tenant_needing_refresh(&store, 60.0).await;
        let upstream = Arc::new(FakeUpstream { refresh_calls: AtomicU32::new(0), behavior: FakeBehavior::Success });
        let manager = TokenManager::new(store.clone(), upstream.clone());

        manager.valid_token(&tenant_id).await.unwrap();
        let token = manager.valid_token(&tenant_id).await.unwrap();
        assert_eq!(token, "refreshed-access");
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_grant_suspends_tenant() {
        let store = Arc::new(InMemoryRunStore::new());
        let tenant_id = tenant_needing_refresh(&store, 60.0).await;
        let upstream = Arc::new(FakeUpstream { refresh_calls: AtomicU32::new(0), behavior: FakeBehavior::InvalidGrant });
        let manager = TokenManager::new(store.clone(), upstream);

        let err = manager.valid_token(&tenant_id).await.unwrap_err();
        assert!(matches!(err, OauthError::Revoked(_)));

        let tenant = store.get_tenant(&tenant_id).await.unwrap();
        assert_eq!(tenant.install_state, InstallState::Suspended);
        assert!(tenant.oauth.access_token.is_none());
    }

    #[tokio::test]
    async fn transient_failure_serves_old_token_within_absolute_expiry() {
        let store = Arc::new(InMemoryRunStore::new());
        let tenant_id = tenant_needing_refresh(&store, 60.0).await;
        let upstream = Arc::new(FakeUpstream { refresh_calls: AtomicU32::new(0), behavior: FakeBehavior::Transient });
        let manager = TokenManager::new(store.clone(), upstream);

        let token = manager.valid_token(&tenant_id).await.unwrap();
        assert_eq!(token, "old-access");
    }

    #[tokio::test]
    async fn not_configured_when_no_access_token() {
        let store = Arc::new(InMemoryRunStore::new());
        let tenant = Tenant::new(TenantId("bare".into()), "bare");
        store.upsert_tenant(tenant).await.unwrap();
        let upstream = Arc::new(FakeUpstream { refresh_calls: AtomicU32::new(0), behavior: FakeBehavior::Success });
        let manager = TokenManager::new(store, upstream);

        let err = manager.valid_token(&TenantId("bare".into())).await.unwrap_err();
        assert!(matches!(err, OauthError::NotConfigured(_)));
    }
}
