//! Self-subject-access-review preflight: builds and submits a
//! `SelfSubjectAccessReview` for a per-user clientset and surfaces
//! allow/deny/evaluation-error, the way the teacher's
//! `KubeOperations::kube_patch` wraps a single typed API call and
//! classifies the response rather than propagating a raw `kube::Error`.

use fedcore_credentials::CredentialProvider;
use fedcore_error::{Error, Result};
use fedcore_identity::UserInfo;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};

/// Verbs the specification recognizes for an [`AccessCheck`].
pub const ALLOWED_VERBS: &[&str] = &[
    "get",
    "list",
    "watch",
    "create",
    "update",
    "patch",
    "delete",
    "deletecollection",
    "impersonate",
    "*",
];

/// An RBAC question: "can the calling identity do `verb` on `resource`?"
#[derive(Debug, Clone)]
pub struct AccessCheck {
    pub verb: String,
    pub resource: String,
    pub api_group: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub subresource: Option<String>,
}

impl AccessCheck {
    pub fn new(verb: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            resource: resource.into(),
            api_group: None,
            namespace: None,
            name: None,
            subresource: None,
        }
    }

    pub fn with_api_group(mut self, group: impl Into<String>) -> Self {
        self.api_group = Some(group.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = Some(subresource.into());
        self
    }
}

/// Outcome of an [`AccessCheck`]. `allowed` and `denied` are never both
/// true; `evaluation_error` carries an API-server-reported evaluation
/// failure (not a transport error — those are returned as `Err`).
#[derive(Debug, Clone, Default)]
pub struct AccessCheckResult {
    pub allowed: bool,
    pub denied: bool,
    pub reason: String,
    pub evaluation_error: String,
}

/// `verb` must be non-empty and in [`ALLOWED_VERBS`]; `resource` must be
/// non-empty. No API call is made if this fails.
pub fn validate_access_check(check: &AccessCheck) -> Result<()> {
    if check.verb.is_empty() || !ALLOWED_VERBS.contains(&check.verb.as_str()) {
        return Err(Error::InvalidAccessCheck(format!(
            "verb {:?} is not one of {ALLOWED_VERBS:?}",
            check.verb
        )));
    }
    if check.resource.is_empty() {
        return Err(Error::InvalidAccessCheck(
            "resource must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Resolve the clientset an access check should run against: the
/// management cluster under the user's own identity when `cluster_name`
/// is empty, or the already-acquired workload-cluster client otherwise.
/// `workload_client` is `None` only when the caller never resolved one
/// (e.g. cluster lookup failed upstream).
pub async fn resolve_access_client(
    provider: &dyn CredentialProvider,
    user: &UserInfo,
    cluster_name: &str,
    workload_client: Option<kube::Client>,
) -> Result<kube::Client> {
    if cluster_name.is_empty() {
        Ok(provider.get_clients_for_user(user).await?.clientset)
    } else {
        workload_client.ok_or_else(|| Error::ClusterNotFound(cluster_name.to_string()))
    }
}

fn resource_attributes(check: &AccessCheck) -> ResourceAttributes {
    ResourceAttributes {
        verb: Some(check.verb.clone()),
        resource: Some(check.resource.clone()),
        group: check.api_group.clone(),
        namespace: check.namespace.clone(),
        name: check.name.clone(),
        subresource: check.subresource.clone(),
        ..Default::default()
    }
}

/// Validate, resolve the right clientset, submit the
/// `SelfSubjectAccessReview`, and map the response into an
/// [`AccessCheckResult`]. Transport failures are wrapped as
/// [`Error::AccessCheckFailed`]; an `evaluationError` reported by the API
/// server is surfaced in the result, not as an `Err`.
pub async fn check_access(
    provider: &dyn CredentialProvider,
    user: &UserInfo,
    cluster_name: &str,
    workload_client: Option<kube::Client>,
    check: &AccessCheck,
) -> Result<AccessCheckResult> {
    validate_access_check(check)?;
    let client = resolve_access_client(provider, user, cluster_name, workload_client).await?;

    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(resource_attributes(check)),
            ..Default::default()
        },
        ..Default::default()
    };

    let api: Api<SelfSubjectAccessReview> = Api::all(client);
    let result = api
        .create(&PostParams::default(), &review)
        .await
        .map_err(|e| Error::AccessCheckFailed {
            cluster: cluster_name.to_string(),
            reason: e.to_string(),
        })?;

    let status = result.status.unwrap_or_default();
    tracing::debug!(
        cluster = cluster_name,
        user_hash = %fedcore_identity::anonymize_email(user.email()),
        verb = %check.verb,
        resource = %check.resource,
        allowed = status.allowed,
        "access check evaluated"
    );
    Ok(AccessCheckResult {
        allowed: status.allowed,
        denied: status.denied.unwrap_or(false),
        reason: status.reason.unwrap_or_default(),
        evaluation_error: status.evaluation_error.unwrap_or_default(),
    })
}

/// Thin wrapper over [`check_access`]: `Ok(())` when `allowed`, otherwise
/// [`Error::AccessDenied`] carrying the API server's reason.
pub async fn check_access_allowed(
    provider: &dyn CredentialProvider,
    user: &UserInfo,
    cluster_name: &str,
    workload_client: Option<kube::Client>,
    check: &AccessCheck,
) -> Result<()> {
    let result = check_access(provider, user, cluster_name, workload_client, check).await?;
    if result.allowed {
        Ok(())
    } else {
        Err(Error::AccessDenied(result.reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_verb_outside_allowed_set() {
        let check = AccessCheck::new("destroy", "pods");
        assert!(matches!(
            validate_access_check(&check),
            Err(Error::InvalidAccessCheck(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_resource() {
        let check = AccessCheck::new("get", "");
        assert!(validate_access_check(&check).is_err());
    }

    #[test]
    fn validate_accepts_wildcard_verb() {
        let check = AccessCheck::new("*", "pods");
        assert!(validate_access_check(&check).is_ok());
    }

    #[test]
    fn validate_accepts_every_documented_verb() {
        for verb in ALLOWED_VERBS {
            assert!(validate_access_check(&AccessCheck::new(*verb, "pods")).is_ok());
        }
    }

    #[test]
    fn resource_attributes_carries_every_field() {
        let check = AccessCheck::new("delete", "pods")
            .with_api_group("apps")
            .with_namespace("production")
            .with_name("web-0")
            .with_subresource("status");
        let attrs = resource_attributes(&check);
        assert_eq!(attrs.verb.as_deref(), Some("delete"));
        assert_eq!(attrs.namespace.as_deref(), Some("production"));
        assert_eq!(attrs.subresource.as_deref(), Some("status"));
    }
}
