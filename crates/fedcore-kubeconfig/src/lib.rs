//! Workload-cluster authentication: either impersonation through an admin
//! kubeconfig stored as a management-cluster Secret, or SSO bearer-token
//! passthrough against a CA bundle stored as a ConfigMap.
//!
//! Secret/ConfigMap reads follow the teacher's typed `Api::<T>::namespaced`
//! idiom (`KanidmClients::create_client`'s `Api::<Secret>::namespaced(...)
//! .get(...)`). `kube`'s kubeconfig-derived `AuthInfo` only carries
//! `impersonate`/`impersonate_groups` as inert fields the client never reads
//! (there is no `Impersonate-Extra-*` equivalent at all), so `Impersonate-*`
//! headers are injected by a small `tower::Layer` composed the same way the
//! teacher's `new_client_with_metrics` composes its `MetricsLayer` — on top
//! of `ConfigExt::base_uri_layer`/`auth_layer`, in front of a
//! `hyper_util` HTTPS connector.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use fedcore_credentials::TokenExtractor;
use fedcore_error::{Error, Result};
use fedcore_groupmap::GroupMapper;
use fedcore_identity::UserInfo;
use hyper_util::rt::TokioExecutor;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::client::ConfigExt;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tower::{BoxError, Layer, Service, ServiceBuilder};

/// Suffix appended to a cluster name to find its admin-kubeconfig Secret.
pub const CAPI_SECRET_SUFFIX: &str = "-kubeconfig";
/// Default suffix appended to a cluster name to find its public-CA ConfigMap.
pub const DEFAULT_CA_CONFIGMAP_SUFFIX: &str = "-ca-public";
/// Key inside the kubeconfig Secret's `data` map holding the kubeconfig YAML.
pub const KUBECONFIG_SECRET_KEY: &str = "value";
/// Key inside the CA ConfigMap's `data` map holding the PEM CA bundle.
pub const CA_CONFIGMAP_KEY: &str = "ca.crt";
/// Default workload-cluster API port when the CAPI object omits one.
pub const DEFAULT_API_PORT: u16 = 6443;

/// Which of the two supported workload-cluster auth modes a Manager uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Impersonation,
    SsoPassthrough,
}

/// Configuration specific to [`AuthMode::SsoPassthrough`].
#[derive(Clone)]
pub struct SsoPassthroughConfig {
    pub ca_configmap_suffix: String,
    pub token_extractor: Arc<dyn TokenExtractor>,
}

impl SsoPassthroughConfig {
    pub fn new(token_extractor: Arc<dyn TokenExtractor>) -> Self {
        Self {
            ca_configmap_suffix: DEFAULT_CA_CONFIGMAP_SUFFIX.to_string(),
            token_extractor,
        }
    }

    pub fn with_ca_configmap_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.ca_configmap_suffix = suffix.into();
        self
    }
}

/// The per-user workload-cluster client bundle produced by either auth mode.
#[derive(Clone)]
pub struct WorkloadClientBundle {
    pub clientset: kube::Client,
    pub dynamic_client: kube::Client,
    pub rest_config: kube::Config,
}

fn client_from_config(rest_config: kube::Config) -> Result<WorkloadClientBundle> {
    let client =
        kube::Client::try_from(rest_config.clone()).map_err(|e| Error::KubeError(e.to_string()))?;
    Ok(WorkloadClientBundle {
        clientset: client.clone(),
        dynamic_client: client,
        rest_config,
    })
}

/// Fetch and decode the kubeconfig Secret for `cluster_name` in `namespace`,
/// using `secret_client` (the identity chosen per §4.F: privileged if
/// available and not strict-rejected, otherwise the end user's).
async fn fetch_kubeconfig_secret(
    secret_client: kube::Client,
    namespace: &str,
    cluster_name: &str,
) -> Result<Kubeconfig> {
    let secret_name = format!("{cluster_name}{CAPI_SECRET_SUFFIX}");
    let api: Api<Secret> = Api::namespaced(secret_client, namespace);
    let secret = api
        .get(&secret_name)
        .await
        .map_err(|e| Error::KubeError(format!("failed to read kubeconfig secret: {e}")))?;

    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_SECRET_KEY))
        .map(|bytes| bytes.0.clone())
        .ok_or_else(|| {
            Error::Internal(format!(
                "kubeconfig secret {namespace}/{secret_name} has no {KUBECONFIG_SECRET_KEY:?} key"
            ))
        })?;

    Kubeconfig::from_yaml(&String::from_utf8_lossy(&raw))
        .map_err(|e| Error::Internal(format!("invalid kubeconfig in {namespace}/{secret_name}: {e}")))
}

/// Build an impersonated per-user REST config from the cluster's admin
/// kubeconfig: `Impersonate-User` is the user's email, `Impersonate-Group`
/// is the group-mapper's output, and any `user.extra` (other than the
/// fallback OAuth token) is forwarded as `Impersonate-Extra-*`.
pub async fn build_impersonated_client(
    secret_client: kube::Client,
    namespace: &str,
    cluster_name: &str,
    user: &UserInfo,
    group_mapper: &GroupMapper,
) -> Result<WorkloadClientBundle> {
    let kubeconfig = fetch_kubeconfig_secret(secret_client, namespace, cluster_name).await?;
    let rest_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::KubeError(format!("failed to build config from kubeconfig: {e}")))?;

    let mapped_groups = group_mapper.map_groups(user.groups(), user.email());
    let extra = impersonation_extra(user);
    let client = build_impersonated_service(&rest_config, user.email(), &mapped_groups, &extra)?;

    tracing::debug!(
        cluster = cluster_name,
        user_hash = %fedcore_identity::anonymize_email(user.email()),
        "built impersonated workload-cluster client"
    );
    Ok(WorkloadClientBundle {
        clientset: client.clone(),
        dynamic_client: client,
        rest_config,
    })
}

/// `user.extra` forwarded as `Impersonate-Extra-*`, excluding the fallback
/// OAuth token key (a bearer credential, not an identity attribute).
fn impersonation_extra(user: &UserInfo) -> BTreeMap<String, Vec<String>> {
    user.extra()
        .iter()
        .filter(|(key, _)| key.as_str() != fedcore_identity::EXTRA_OAUTH_TOKEN)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// `tower::Layer` injecting `Impersonate-User`/`Impersonate-Group`/
/// `Impersonate-Extra-*` headers onto every outgoing request. `kube`'s own
/// auth layer never reads `AuthInfo::impersonate`/`impersonate_groups` (they
/// exist only for round-tripping a kubeconfig file), so this is the only way
/// to actually impersonate through the admin credentials the kubeconfig
/// Secret carries.
#[derive(Clone)]
struct ImpersonationLayer {
    headers: Arc<Vec<(http::HeaderName, http::HeaderValue)>>,
}

impl ImpersonationLayer {
    fn new(user: &str, groups: &[String], extra: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let invalid = |e: http::header::InvalidHeaderValue| {
            Error::Internal(format!("invalid impersonation header value: {e}"))
        };
        let mut headers = vec![(
            http::HeaderName::from_static("impersonate-user"),
            http::HeaderValue::from_str(user).map_err(invalid)?,
        )];
        for group in groups {
            headers.push((
                http::HeaderName::from_static("impersonate-group"),
                http::HeaderValue::from_str(group).map_err(invalid)?,
            ));
        }
        for (key, values) in extra {
            let name = http::HeaderName::from_bytes(format!("impersonate-extra-{key}").as_bytes())
                .map_err(|e| Error::Internal(format!("invalid impersonation extra key {key:?}: {e}")))?;
            for value in values {
                headers.push((name.clone(), http::HeaderValue::from_str(value).map_err(invalid)?));
            }
        }
        Ok(Self {
            headers: Arc::new(headers),
        })
    }
}

impl<S> Layer<S> for ImpersonationLayer {
    type Service = ImpersonationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ImpersonationService {
            inner,
            headers: self.headers.clone(),
        }
    }
}

#[derive(Clone)]
struct ImpersonationService<S> {
    inner: S,
    headers: Arc<Vec<(http::HeaderName, http::HeaderValue)>>,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for ImpersonationService<S>
where
    S: Service<http::Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        for (name, value) in self.headers.iter() {
            req.headers_mut().append(name.clone(), value.clone());
        }
        self.inner.call(req)
    }
}

/// Builds a `kube::Client` for `config` with `ImpersonationLayer` wired in
/// front of the standard auth/base-uri layers, the same `ServiceBuilder`
/// shape as the teacher's `new_client_with_metrics`.
fn build_impersonated_service(
    config: &kube::Config,
    user: &str,
    groups: &[String],
    extra: &BTreeMap<String, Vec<String>>,
) -> Result<kube::Client> {
    let impersonation = ImpersonationLayer::new(user, groups, extra)?;
    let https = config
        .rustls_https_connector()
        .map_err(|e| Error::KubeError(e.to_string()))?;
    let auth_layer = config.auth_layer().map_err(|e| Error::KubeError(e.to_string()))?;
    let service = ServiceBuilder::new()
        .layer(impersonation)
        .layer(config.base_uri_layer())
        .option_layer(auth_layer)
        .map_err(BoxError::from)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));

    Ok(kube::Client::new(service, config.default_namespace.clone()))
}

/// Fetch and decode the public CA bundle for `cluster_name` in `namespace`.
async fn fetch_ca_bundle(
    ca_client: kube::Client,
    namespace: &str,
    cluster_name: &str,
    ca_configmap_suffix: &str,
) -> Result<Vec<u8>> {
    let configmap_name = format!("{cluster_name}{ca_configmap_suffix}");
    let api: Api<ConfigMap> = Api::namespaced(ca_client, namespace);
    let configmap = api
        .get(&configmap_name)
        .await
        .map_err(|e| Error::KubeError(format!("failed to read CA configmap: {e}")))?;

    let ca = configmap
        .data
        .as_ref()
        .and_then(|data| data.get(CA_CONFIGMAP_KEY))
        .filter(|pem| !pem.is_empty())
        .ok_or_else(|| {
            Error::Internal(format!(
                "CA configmap {namespace}/{configmap_name} has no non-empty {CA_CONFIGMAP_KEY:?} key"
            ))
        })?;

    Ok(ca.as_bytes().to_vec())
}

/// Build a per-user REST config that forwards the user's own OIDC bearer
/// token directly to the workload cluster's API server, with no
/// impersonation headers. The endpoint is derived from the CAPI cluster's
/// `spec.controlPlaneEndpoint` (`host`, and `port` defaulting to 6443).
pub async fn build_sso_passthrough_client(
    ca_client: kube::Client,
    namespace: &str,
    cluster_name: &str,
    control_plane_host: &str,
    control_plane_port: Option<u16>,
    sso: &SsoPassthroughConfig,
    user: &UserInfo,
) -> Result<WorkloadClientBundle> {
    let token = fedcore_credentials::resolve_bearer_token(sso.token_extractor.as_ref(), user)?;
    let ca = fetch_ca_bundle(ca_client, namespace, cluster_name, &sso.ca_configmap_suffix).await?;

    let port = control_plane_port.unwrap_or(DEFAULT_API_PORT);
    let server = format!("https://{control_plane_host}:{port}");
    let kubeconfig = fedcore_credentials::synthesize_token_kubeconfig(
        &server,
        Some(&ca),
        secrecy::SecretString::from(token),
    );
    let rest_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::Internal(format!("invalid control plane endpoint: {e}")))?;

    tracing::debug!(
        cluster = cluster_name,
        user_hash = %fedcore_identity::anonymize_email(user.email()),
        "built SSO passthrough workload-cluster client"
    );
    client_from_config(rest_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn impersonation_extra_excludes_fallback_oauth_token() {
        let mut extra = HashMap::new();
        extra.insert(
            fedcore_identity::EXTRA_OAUTH_TOKEN.to_string(),
            vec!["tok".to_string()],
        );
        extra.insert("department".to_string(), vec!["platform".to_string()]);
        let user = UserInfo::new("u@x.com", vec![], extra).unwrap();

        let forwarded = impersonation_extra(&user);
        assert!(!forwarded.contains_key(fedcore_identity::EXTRA_OAUTH_TOKEN));
        assert_eq!(forwarded.get("department"), Some(&vec!["platform".to_string()]));
    }

    #[test]
    fn secret_suffix_and_configmap_default_match_specification() {
        assert_eq!(CAPI_SECRET_SUFFIX, "-kubeconfig");
        assert_eq!(DEFAULT_CA_CONFIGMAP_SUFFIX, "-ca-public");
    }
}
