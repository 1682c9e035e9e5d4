//! Public facade for the federation core: composes credential providers,
//! CAPI discovery, workload-cluster auth modes, the client cache, and the
//! access-check preflight behind one long-lived object.
//!
//! Shaped like the teacher's `kaniop_operator::controller::Context` (one
//! state object holding caches, clients, and configuration, constructed
//! once and handed to every operation) but facade-shaped rather than
//! reconciler-shaped: callers invoke methods directly instead of the
//! object driving a reconcile loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fedcore_access::{AccessCheck, AccessCheckResult};
use fedcore_cache::{CacheConfig, CacheMetrics, CachedClient, ClientCache, NoopCacheMetrics};
use fedcore_connectivity::ConnectivityConfig;
use fedcore_credentials::{CredentialMode, CredentialProvider, resolve_credential_mode};
use fedcore_discovery::{ClusterListOptions, ClusterSummary};
use fedcore_error::{Error, ErrorKind, Result};
use fedcore_groupmap::GroupMapper;
use fedcore_identity::{UserInfo, validate_cluster_name, validate_user_info};
use fedcore_kubeconfig::{AuthMode, SsoPassthroughConfig, WorkloadClientBundle};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "test-util")]
pub mod telemetry;

/// Default bound for the optional post-build connectivity validation.
pub const DEFAULT_CONNECTIVITY_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration consumed once at [`Manager::new`].
pub struct ManagerOptions {
    pub cache_config: CacheConfig,
    pub cache_metrics: Arc<dyn CacheMetrics>,
    pub connectivity_config: ConnectivityConfig,
    /// `Some(timeout)` validates connectivity (bounded by `timeout`) after
    /// building every fresh workload client, before it is cached; `None`
    /// skips validation entirely. Disabled by default.
    pub connectivity_validation_timeout: Option<Duration>,
    pub workload_cluster_auth_mode: AuthMode,
    pub sso_passthrough_config: Option<SsoPassthroughConfig>,
    pub group_mapper: GroupMapper,
    /// Whether a privileged service identity, if the provider has one,
    /// should additionally be used for CAPI discovery (rather than only
    /// for kubeconfig-secret reads).
    pub enable_privileged_capi_discovery: bool,
    /// When true, a runtime privileged-access failure surfaces
    /// [`fedcore_error::Error::StrictPrivilegedAccessRequired`] instead of
    /// transparently falling back to the end user's own identity.
    pub strict_mode: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            cache_config: CacheConfig::default(),
            cache_metrics: Arc::new(NoopCacheMetrics),
            connectivity_config: ConnectivityConfig::default(),
            connectivity_validation_timeout: None,
            workload_cluster_auth_mode: AuthMode::Impersonation,
            sso_passthrough_config: None,
            group_mapper: GroupMapper::new(Default::default())
                .expect("an empty mapping table always validates"),
            enable_privileged_capi_discovery: false,
            strict_mode: false,
        }
    }
}

impl ManagerOptions {
    pub fn with_cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache_config = cache_config;
        self
    }

    pub fn with_cache_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.cache_metrics = metrics;
        self
    }

    pub fn with_connectivity_config(mut self, connectivity_config: ConnectivityConfig) -> Self {
        self.connectivity_config = connectivity_config;
        self
    }

    /// Enable post-build connectivity validation with the default 10s bound.
    pub fn with_connectivity_validation(mut self) -> Self {
        self.connectivity_validation_timeout = Some(DEFAULT_CONNECTIVITY_VALIDATION_TIMEOUT);
        self
    }

    pub fn with_connectivity_validation_timeout(mut self, timeout: Duration) -> Self {
        self.connectivity_validation_timeout = Some(timeout);
        self
    }

    pub fn with_sso_passthrough(mut self, config: SsoPassthroughConfig) -> Self {
        self.workload_cluster_auth_mode = AuthMode::SsoPassthrough;
        self.sso_passthrough_config = Some(config);
        self
    }

    pub fn with_group_mapper(mut self, group_mapper: GroupMapper) -> Self {
        self.group_mapper = group_mapper;
        self
    }

    pub fn with_privileged_capi_discovery(mut self, enabled: bool) -> Self {
        self.enable_privileged_capi_discovery = enabled;
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }
}

struct Inner {
    provider: Arc<dyn CredentialProvider>,
    credential_mode: CredentialMode,
    cache: ClientCache,
    cache_ttl: Duration,
    group_mapper: GroupMapper,
    connectivity_config: ConnectivityConfig,
    connectivity_validation_timeout: Option<Duration>,
    auth_mode: AuthMode,
    sso_passthrough_config: Option<SsoPassthroughConfig>,
    strict_mode: bool,
    closed: AtomicBool,
}

/// The public entry point the host gateway process imports. Cheap to
/// clone: internally an `Arc<Inner>`, like [`fedcore_cache::ClientCache`].
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Construct a Manager: validates `provider` is usable, resolves the
    /// [`CredentialMode`] once from its advertised capabilities, and
    /// eagerly initializes the client cache (which spawns its own
    /// background cleanup task). Emits one info log.
    pub fn new(provider: Arc<dyn CredentialProvider>, options: ManagerOptions) -> Result<Self> {
        if options.workload_cluster_auth_mode == AuthMode::SsoPassthrough
            && options.sso_passthrough_config.is_none()
        {
            return Err(Error::Internal(
                "SSO passthrough auth mode requires an SsoPassthroughConfig".to_string(),
            ));
        }

        let credential_mode =
            resolve_credential_mode(provider.as_ref(), options.enable_privileged_capi_discovery);
        let cache_ttl = options.cache_config.ttl;
        let cache = ClientCache::new(options.cache_config, options.cache_metrics);

        tracing::info!(
            credential_mode = ?credential_mode,
            auth_mode = ?options.workload_cluster_auth_mode,
            strict_mode = options.strict_mode,
            "federation core manager initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                credential_mode,
                cache,
                cache_ttl,
                group_mapper: options.group_mapper,
                connectivity_config: options.connectivity_config,
                connectivity_validation_timeout: options.connectivity_validation_timeout,
                auth_mode: options.workload_cluster_auth_mode,
                sso_passthrough_config: options.sso_passthrough_config,
                strict_mode: options.strict_mode,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::ManagerClosed)
        } else {
            Ok(())
        }
    }

    /// Idempotent. Closes the cache (joining its cleanup task) and flips
    /// the closed flag; every subsequent public method returns
    /// [`Error::ManagerClosed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cache.close().await;
    }

    async fn management_client(&self, user: &UserInfo) -> Result<kube::Client> {
        Ok(self.inner.provider.get_clients_for_user(user).await?.clientset)
    }

    /// The dynamic client CAPI discovery should use: privileged, if the
    /// resolved mode is [`CredentialMode::FullPrivileged`] and the runtime
    /// call succeeds; the user's own otherwise (transparently, unless
    /// `strict_mode`).
    async fn discovery_client(&self, user: &UserInfo) -> Result<kube::Client> {
        if self.inner.credential_mode == CredentialMode::FullPrivileged {
            if let Some(cap) = self.inner.provider.privileged_capi_discovery() {
                match cap.get_privileged_dynamic_client(user).await {
                    Ok(client) => return Ok(client),
                    Err(err) if self.inner.strict_mode => {
                        return Err(Error::StrictPrivilegedAccessRequired(err.to_string()));
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "privileged CAPI discovery unavailable, falling back to user identity");
                    }
                }
            }
        }
        self.management_client(user).await
    }

    /// The client kubeconfig-secret reads should use: privileged, if the
    /// resolved mode allows it and the runtime call succeeds; the user's
    /// own otherwise (transparently, unless `strict_mode`).
    async fn secret_access_client(&self, user: &UserInfo) -> Result<kube::Client> {
        if matches!(
            self.inner.credential_mode,
            CredentialMode::PrivilegedSecrets | CredentialMode::FullPrivileged
        ) {
            if let Some(cap) = self.inner.provider.privileged_secret_access() {
                match cap.get_privileged_client_for_secrets(user).await {
                    Ok(client) => return Ok(client),
                    Err(err) if self.inner.strict_mode => {
                        return Err(Error::StrictPrivilegedAccessRequired(err.to_string()));
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "privileged secret access unavailable, falling back to user identity");
                    }
                }
            }
        }
        self.management_client(user).await
    }

    /// Get (creating on miss, single-flighted) the per-user client bundle
    /// for `cluster_name`. An empty `cluster_name` is rejected here — the
    /// cache is keyed by cluster, and "local management cluster" access
    /// goes through [`Manager::check_access`] instead, which special-cases
    /// it per §4.I.
    #[tracing::instrument(skip(self, user), fields(user_hash = %fedcore_identity::anonymize_email(user.email())))]
    pub async fn get_client_for_cluster(
        &self,
        cluster_name: &str,
        user: &UserInfo,
    ) -> Result<Arc<CachedClient>> {
        self.ensure_open()?;
        validate_user_info(Some(user))?;
        validate_cluster_name(cluster_name)?;

        let manager = self.clone();
        let cluster_owned = cluster_name.to_string();
        let user_owned = user.clone();

        self.inner
            .cache
            .get_or_create(cluster_name, user.email(), move || async move {
                manager.build_client(&cluster_owned, &user_owned).await
            })
            .await
    }

    async fn build_client(&self, cluster_name: &str, user: &UserInfo) -> Result<CachedClient> {
        let discovery_client = self.discovery_client(user).await?;
        let cluster = fedcore_discovery::get_cluster_by_name(discovery_client, None, cluster_name)
            .await
            .inspect_err(|err| {
                if fedcore_error::is(err, ErrorKind::CapiCrdNotInstalled) {
                    tracing::warn!(
                        cluster = cluster_name,
                        hint = %err.user_facing(),
                        "cluster discovery failed: Cluster API CRD missing on management cluster"
                    );
                }
            })?;

        let bundle = match self.inner.auth_mode {
            AuthMode::Impersonation => {
                let secret_client = self.secret_access_client(user).await?;
                fedcore_kubeconfig::build_impersonated_client(
                    secret_client,
                    &cluster.namespace,
                    cluster_name,
                    user,
                    &self.inner.group_mapper,
                )
                .await?
            }
            AuthMode::SsoPassthrough => {
                self.build_sso_passthrough(&cluster, user).await?
            }
        };

        if let Some(timeout) = self.inner.connectivity_validation_timeout {
            self.validate_connectivity(cluster_name, &bundle, timeout).await?;
        }

        Ok(CachedClient::new(
            bundle.clientset,
            bundle.dynamic_client,
            bundle.rest_config,
            cluster_name,
            user.email(),
            self.inner.cache_ttl,
        ))
    }

    async fn build_sso_passthrough(
        &self,
        cluster: &ClusterSummary,
        user: &UserInfo,
    ) -> Result<WorkloadClientBundle> {
        let sso = self
            .inner
            .sso_passthrough_config
            .as_ref()
            .expect("validated at construction");
        let (host, port) = cluster.control_plane_endpoint.clone().ok_or_else(|| {
            Error::Internal(format!(
                "cluster {:?} has no controlPlaneEndpoint for SSO passthrough",
                cluster.name
            ))
        })?;
        // CA ConfigMaps are public data; always read under the user's own
        // identity regardless of credential mode.
        let ca_client = self.management_client(user).await?;
        fedcore_kubeconfig::build_sso_passthrough_client(
            ca_client,
            &cluster.namespace,
            &cluster.name,
            &host,
            port,
            sso,
            user,
        )
        .await
    }

    async fn validate_connectivity(
        &self,
        cluster_name: &str,
        bundle: &WorkloadClientBundle,
        timeout: Duration,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        let host = bundle
            .rest_config
            .cluster_url
            .host()
            .unwrap_or_default()
            .to_string();
        match tokio::time::timeout(
            timeout,
            fedcore_connectivity::check_connectivity_with_retry(
                cluster_name,
                bundle.rest_config.clone(),
                &self.inner.connectivity_config,
                &cancel,
            ),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(Error::ConnectionTimeout { host }),
        }
    }

    /// List every CAPI cluster visible under the discovery identity for
    /// `user`.
    #[tracing::instrument(skip(self, user), fields(user_hash = %fedcore_identity::anonymize_email(user.email())))]
    pub async fn discover_clusters(&self, user: &UserInfo) -> Result<Vec<ClusterSummary>> {
        self.ensure_open()?;
        validate_user_info(Some(user))?;
        let client = self.discovery_client(user).await?;
        fedcore_discovery::discover_clusters(client, None).await
    }

    #[tracing::instrument(skip(self, user), fields(user_hash = %fedcore_identity::anonymize_email(user.email())))]
    pub async fn get_cluster_by_name(&self, user: &UserInfo, name: &str) -> Result<ClusterSummary> {
        self.ensure_open()?;
        validate_user_info(Some(user))?;
        let client = self.discovery_client(user).await?;
        fedcore_discovery::get_cluster_by_name(client, None, name).await
    }

    #[tracing::instrument(skip(self, user), fields(user_hash = %fedcore_identity::anonymize_email(user.email())))]
    pub async fn resolve_cluster(&self, user: &UserInfo, pattern: &str) -> Result<ClusterSummary> {
        self.ensure_open()?;
        validate_user_info(Some(user))?;
        let client = self.discovery_client(user).await?;
        fedcore_discovery::resolve_cluster(client, None, pattern).await
    }

    #[tracing::instrument(skip(self, user, options), fields(user_hash = %fedcore_identity::anonymize_email(user.email())))]
    pub async fn list_clusters_with_options(
        &self,
        user: &UserInfo,
        options: &ClusterListOptions,
    ) -> Result<Vec<ClusterSummary>> {
        self.ensure_open()?;
        validate_user_info(Some(user))?;
        let client = self.discovery_client(user).await?;
        fedcore_discovery::list_clusters_with_options(client, options).await
    }

    /// Run an [`AccessCheck`] against `cluster_name` (the local management
    /// cluster when empty) as `user`. Acquires a workload client the same
    /// way [`Manager::get_client_for_cluster`] would, so a cached client is
    /// reused rather than rebuilt.
    #[tracing::instrument(skip(self, user, check), fields(user_hash = %fedcore_identity::anonymize_email(user.email())))]
    pub async fn check_access(
        &self,
        user: &UserInfo,
        cluster_name: &str,
        check: &AccessCheck,
    ) -> Result<AccessCheckResult> {
        self.ensure_open()?;
        validate_user_info(Some(user))?;

        let workload_client = if cluster_name.is_empty() {
            None
        } else {
            Some(self.get_client_for_cluster(cluster_name, user).await?.clientset.clone())
        };

        fedcore_access::check_access(
            self.inner.provider.as_ref(),
            user,
            cluster_name,
            workload_client,
            check,
        )
        .await
    }

    /// Thin wrapper over [`Manager::check_access`]: `Ok(())` when allowed,
    /// otherwise [`Error::AccessDenied`].
    pub async fn check_access_allowed(
        &self,
        user: &UserInfo,
        cluster_name: &str,
        check: &AccessCheck,
    ) -> Result<()> {
        let result = self.check_access(user, cluster_name, check).await?;
        if result.allowed {
            Ok(())
        } else {
            Err(Error::AccessDenied(result.reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedcore_credentials::{ManagementClients, StaticCredentialProvider};
    use std::collections::HashMap;

    fn user(email: &str) -> UserInfo {
        UserInfo::new(email, vec!["developers".to_string()], HashMap::new()).unwrap()
    }

    fn static_provider() -> Arc<dyn CredentialProvider> {
        let rest_config = kube::Config::new("https://127.0.0.1:6443".parse().unwrap());
        let client = kube::Client::try_from(rest_config.clone()).unwrap();
        Arc::new(StaticCredentialProvider::new(ManagementClients {
            clientset: client.clone(),
            dynamic_client: client,
            rest_config,
        }))
    }

    #[tokio::test]
    async fn manager_rejects_empty_cluster_name() {
        crate::telemetry::init_test_tracing("fedcore_manager=debug");
        let manager = Manager::new(static_provider(), ManagerOptions::default()).unwrap();
        let result = manager.get_client_for_cluster("", &user("a@x.com")).await;
        assert!(matches!(result, Err(Error::InvalidClusterName(..))));
    }

    #[tokio::test]
    async fn closed_manager_rejects_every_public_method() {
        let manager = Manager::new(static_provider(), ManagerOptions::default()).unwrap();
        manager.close().await;
        let result = manager.get_client_for_cluster("prod", &user("a@x.com")).await;
        assert!(matches!(result, Err(Error::ManagerClosed)));
        let result = manager.discover_clusters(&user("a@x.com")).await;
        assert!(matches!(result, Err(Error::ManagerClosed)));
    }

    #[tokio::test]
    async fn sso_passthrough_without_config_fails_construction() {
        let options = ManagerOptions {
            workload_cluster_auth_mode: AuthMode::SsoPassthrough,
            ..ManagerOptions::default()
        };
        assert!(Manager::new(static_provider(), options).is_err());
    }

    #[tokio::test]
    async fn credential_mode_is_user_for_a_static_provider() {
        let manager = Manager::new(static_provider(), ManagerOptions::default()).unwrap();
        assert_eq!(manager.inner.credential_mode, CredentialMode::User);
    }
}
