//! Credential-provider strategies that produce a management-cluster client
//! bundle for an authenticated user.
//!
//! The specification's "strategy polymorphism" is modeled as trait
//! composition rather than a single fat interface: [`CredentialProvider`]
//! is the capability every variant implements, and the two optional
//! capabilities (`PrivilegedSecretAccess`, `PrivilegedCapiDiscovery`) are
//! separate traits a variant can additionally expose through
//! [`CredentialProvider::privileged_secret_access`] /
//! [`CredentialProvider::privileged_capi_discovery`]. This mirrors the
//! teacher's `KanidmUser`-keyed client split in
//! `kaniop_operator::controller::Context::get_kanidm_client` (one identity
//! for one kind of access, another identity for another), generalized from
//! a two-identity enum to an open capability set.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use fedcore_error::{Error, Result};
use fedcore_identity::UserInfo;
use kube::config::{
    AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use secrecy::SecretString;
use tokio::sync::OnceCell;

/// Synthesize a single-context [`Kubeconfig`] carrying a bearer token and an
/// optional CA bundle, so credential providers can go through
/// `kube::Config::from_custom_kubeconfig` instead of poking at `Config`'s
/// private `auth_info` field directly — `Config` only exposes that field to
/// the `kube` crate itself, the kubeconfig file-format types are the public
/// seam for handing it credentials.
pub fn synthesize_token_kubeconfig(server: &str, ca_pem: Option<&[u8]>, token: SecretString) -> Kubeconfig {
    const NAME: &str = "federation-core";
    Kubeconfig {
        clusters: vec![NamedCluster {
            name: NAME.to_string(),
            cluster: Some(Cluster {
                server: Some(server.to_string()),
                certificate_authority_data: ca_pem
                    .map(|pem| base64::engine::general_purpose::STANDARD.encode(pem)),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: NAME.to_string(),
            auth_info: Some(AuthInfo {
                token: Some(token),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: NAME.to_string(),
            context: Some(Context {
                cluster: NAME.to_string(),
                user: NAME.to_string(),
                namespace: None,
                extensions: None,
            }),
        }],
        current_context: Some(NAME.to_string()),
        ..Default::default()
    }
}

/// The management-cluster client bundle a [`CredentialProvider`] hands
/// back: a typed clientset and dynamic client (both backed by the same
/// `kube::Client` connection, see `fedcore_cache::CachedClient`'s doc
/// comment) plus the REST config they were built from.
#[derive(Clone)]
pub struct ManagementClients {
    pub clientset: kube::Client,
    pub dynamic_client: kube::Client,
    pub rest_config: kube::Config,
}

/// Resolved once at Manager construction time (never re-discovered per
/// call), per the specification's design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// No privileged capability is available; every management-cluster
    /// read happens under the end user's own identity.
    User,
    /// A privileged service identity is available for kubeconfig *secret*
    /// reads, but not enabled for CAPI discovery.
    PrivilegedSecrets,
    /// A privileged service identity is available and enabled for both
    /// secret reads and CAPI discovery.
    FullPrivileged,
}

/// Extracts a bearer token for `user` from whatever ambient request state
/// the host process carries (an inbound `Authorization` header, a session
/// store, ...). The core never inspects the token's contents.
pub trait TokenExtractor: Send + Sync {
    fn extract_token(&self, user: &UserInfo) -> Option<String>;
}

impl<F> TokenExtractor for F
where
    F: Fn(&UserInfo) -> Option<String> + Send + Sync,
{
    fn extract_token(&self, user: &UserInfo) -> Option<String> {
        self(user)
    }
}

/// Resolve a bearer token for `user` via `extractor`, falling back to
/// `user.extra["oauth_token"]`. Shared by [`OAuthUserCredentialProvider`]
/// and the SSO-passthrough workload auth mode in `fedcore-kubeconfig`,
/// both of which need the identical fallback chain. The failure is
/// deliberately non-token-specific (it never says *which* source was
/// tried) so it is safe to surface close to the caller.
pub fn resolve_bearer_token(extractor: &dyn TokenExtractor, user: &UserInfo) -> Result<String> {
    extractor
        .extract_token(user)
        .or_else(|| user.fallback_oauth_token().map(str::to_string))
        .ok_or_else(|| Error::Internal("no authentication token available for user".to_string()))
}

/// Strategy interface producing per-user management-cluster clients.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_clients_for_user(&self, user: &UserInfo) -> Result<ManagementClients>;

    /// Privileged access to kubeconfig *secrets*, if this provider has it.
    fn privileged_secret_access(&self) -> Option<&dyn PrivilegedSecretAccess> {
        None
    }

    /// Privileged access to CAPI discovery, if this provider has it.
    fn privileged_capi_discovery(&self) -> Option<&dyn PrivilegedCapiDiscovery> {
        None
    }
}

/// Optional capability: read kubeconfig secrets under a service identity
/// rather than the calling user's. CA ConfigMaps are always read under the
/// user's identity (CAs are public data), so this capability is scoped to
/// secrets only.
#[async_trait]
pub trait PrivilegedSecretAccess: Send + Sync {
    async fn get_privileged_client_for_secrets(&self, user: &UserInfo) -> Result<kube::Client>;
    fn has_privileged_access(&self) -> bool;
}

/// Optional capability: list/get CAPI `Cluster` objects under a service
/// identity rather than the calling user's.
#[async_trait]
pub trait PrivilegedCapiDiscovery: Send + Sync {
    async fn get_privileged_dynamic_client(&self, user: &UserInfo) -> Result<kube::Client>;
    fn has_privileged_access(&self) -> bool;
}

/// Resolve the [`CredentialMode`] a Manager will use for the remainder of
/// its lifetime, from a provider's advertised capabilities and whether the
/// host has opted into privileged CAPI discovery.
pub fn resolve_credential_mode(
    provider: &dyn CredentialProvider,
    enable_privileged_capi_discovery: bool,
) -> CredentialMode {
    let has_secret_access = provider
        .privileged_secret_access()
        .is_some_and(|p| p.has_privileged_access());
    let has_capi_access = enable_privileged_capi_discovery
        && provider
            .privileged_capi_discovery()
            .is_some_and(|p| p.has_privileged_access());

    match (has_secret_access, has_capi_access) {
        (true, true) => CredentialMode::FullPrivileged,
        (true, false) => CredentialMode::PrivilegedSecrets,
        (false, _) => CredentialMode::User,
    }
}

/// Preconfigured-clients variant, for tests and simple single-cluster
/// deployments where every user gets the same management-cluster client.
#[derive(Clone)]
pub struct StaticCredentialProvider {
    clients: ManagementClients,
}

impl StaticCredentialProvider {
    pub fn new(clients: ManagementClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_clients_for_user(&self, _user: &UserInfo) -> Result<ManagementClients> {
        Ok(self.clients.clone())
    }
}

/// Builds a management-cluster client from the end user's own OIDC bearer
/// token, extracted by a caller-installed [`TokenExtractor`] with a
/// fallback to `user.extra["oauth_token"]`.
pub struct OAuthUserCredentialProvider {
    host: String,
    ca_data: Option<Vec<u8>>,
    token_extractor: Arc<dyn TokenExtractor>,
    qps: f32,
    burst: u32,
}

impl OAuthUserCredentialProvider {
    pub fn new(
        host: impl Into<String>,
        ca_data: Option<Vec<u8>>,
        token_extractor: Arc<dyn TokenExtractor>,
    ) -> Self {
        Self {
            host: host.into(),
            ca_data,
            token_extractor,
            qps: 50.0,
            burst: 100,
        }
    }

    /// The bearer token for `user`: the installed extractor first, falling
    /// back to `user.extra["oauth_token"]`.
    fn resolve_token(&self, user: &UserInfo) -> Result<String> {
        resolve_bearer_token(self.token_extractor.as_ref(), user)
    }

    async fn build_rest_config(&self, token: String) -> Result<kube::Config> {
        let kubeconfig =
            synthesize_token_kubeconfig(&self.host, self.ca_data.as_deref(), SecretString::from(token));
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Internal(format!("invalid management cluster host: {e}")))
    }
}

#[async_trait]
impl CredentialProvider for OAuthUserCredentialProvider {
    async fn get_clients_for_user(&self, user: &UserInfo) -> Result<ManagementClients> {
        let token = self.resolve_token(user)?;
        let rest_config = self.build_rest_config(token).await?;
        let clientset = kube::Client::try_from(rest_config.clone())
            .map_err(|e| Error::KubeError(e.to_string()))?;
        Ok(ManagementClients {
            clientset: clientset.clone(),
            dynamic_client: clientset,
            rest_config,
        })
    }
}

struct HybridInner {
    user_provider: OAuthUserCredentialProvider,
    privileged: OnceCell<Option<Arc<kube::Client>>>,
}

/// Composes [`OAuthUserCredentialProvider`] (used for the required
/// user-identity capability) with a lazily initialized in-cluster
/// service-account client for privileged reads.
///
/// The privileged client is memoized behind a [`tokio::sync::OnceCell`]:
/// the first caller to need it pays the in-cluster-config init cost, every
/// concurrent caller waits on the same initialization rather than racing
/// it, and a failed init caches `None` so `has_privileged_access` reports
/// `false` instead of retrying forever. This is the Rust-native analogue
/// of the teacher's read-then-maybe-write-then-retry shape in
/// `Context::get_kanidm_client`, expressed with a primitive built for
/// exactly this single-init race instead of a hand-rolled guard.
pub struct HybridCredentialProvider {
    inner: Arc<HybridInner>,
}

impl HybridCredentialProvider {
    pub fn new(user_provider: OAuthUserCredentialProvider) -> Self {
        Self {
            inner: Arc::new(HybridInner {
                user_provider,
                privileged: OnceCell::new(),
            }),
        }
    }

    async fn privileged_client(&self) -> Option<Arc<kube::Client>> {
        self.inner
            .privileged
            .get_or_init(|| async {
                match init_privileged_client().await {
                    Ok(client) => Some(Arc::new(client)),
                    Err(err) => {
                        tracing::warn!(error = %err, "privileged in-cluster client init failed");
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

async fn init_privileged_client() -> Result<kube::Client> {
    let config = kube::Config::from_cluster_env()
        .map_err(|e| Error::Internal(format!("in-cluster config unavailable: {e}")))?;
    kube::Client::try_from(config).map_err(|e| Error::KubeError(e.to_string()))
}

#[async_trait]
impl CredentialProvider for HybridCredentialProvider {
    async fn get_clients_for_user(&self, user: &UserInfo) -> Result<ManagementClients> {
        self.inner.user_provider.get_clients_for_user(user).await
    }

    fn privileged_secret_access(&self) -> Option<&dyn PrivilegedSecretAccess> {
        Some(self)
    }

    fn privileged_capi_discovery(&self) -> Option<&dyn PrivilegedCapiDiscovery> {
        Some(self)
    }
}

#[async_trait]
impl PrivilegedSecretAccess for HybridCredentialProvider {
    async fn get_privileged_client_for_secrets(&self, _user: &UserInfo) -> Result<kube::Client> {
        self.privileged_client()
            .await
            .map(|arc| (*arc).clone())
            .ok_or_else(|| Error::StrictPrivilegedAccessRequired(
                "privileged in-cluster client is unavailable".to_string(),
            ))
    }

    fn has_privileged_access(&self) -> bool {
        // `OnceCell::get` is a non-blocking peek: before first use this
        // correctly reports `false` rather than forcing initialization.
        matches!(self.inner.privileged.get(), Some(Some(_)))
    }
}

#[async_trait]
impl PrivilegedCapiDiscovery for HybridCredentialProvider {
    async fn get_privileged_dynamic_client(&self, user: &UserInfo) -> Result<kube::Client> {
        PrivilegedSecretAccess::get_privileged_client_for_secrets(self, user).await
    }

    fn has_privileged_access(&self) -> bool {
        PrivilegedSecretAccess::has_privileged_access(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn user(email: &str) -> UserInfo {
        UserInfo::new(email, vec!["developers".to_string()], HashMap::new()).unwrap()
    }

    #[tokio::test]
    async fn static_provider_always_returns_same_clients() {
        let rest_config = kube::Config::new("https://127.0.0.1:6443".parse().unwrap());
        let client = kube::Client::try_from(rest_config.clone()).unwrap();
        let provider = StaticCredentialProvider::new(ManagementClients {
            clientset: client.clone(),
            dynamic_client: client,
            rest_config,
        });
        assert!(provider.get_clients_for_user(&user("a@x.com")).await.is_ok());
        assert!(resolve_credential_mode(&provider, true) == CredentialMode::User);
    }

    #[tokio::test]
    async fn oauth_user_provider_falls_back_to_extra_token() {
        let mut extra = HashMap::new();
        extra.insert("oauth_token".to_string(), vec!["tok-abc".to_string()]);
        let user = UserInfo::new("u@x.com", vec![], extra).unwrap();

        let provider = OAuthUserCredentialProvider::new(
            "https://mgmt.example.com:6443",
            None,
            Arc::new(|_: &UserInfo| None),
        );
        let clients = provider.get_clients_for_user(&user).await.unwrap();
        assert_eq!(clients.rest_config.cluster_url, "https://mgmt.example.com:6443/");
    }

    #[tokio::test]
    async fn oauth_user_provider_fails_without_any_token() {
        let user = user("u@x.com");
        let provider = OAuthUserCredentialProvider::new(
            "https://mgmt.example.com:6443",
            None,
            Arc::new(|_: &UserInfo| None),
        );
        assert!(provider.get_clients_for_user(&user).await.is_err());
    }

    #[tokio::test]
    async fn hybrid_provider_reports_no_privileged_access_before_first_use() {
        let oauth = OAuthUserCredentialProvider::new(
            "https://mgmt.example.com:6443",
            None,
            Arc::new(|_: &UserInfo| Some("tok".to_string())),
        );
        let hybrid = HybridCredentialProvider::new(oauth);
        assert!(!hybrid.has_privileged_access());
        assert_eq!(resolve_credential_mode(&hybrid, true), CredentialMode::User);
    }
}
