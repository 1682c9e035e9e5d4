//! CAPI (Cluster API) `Cluster` resource discovery, filtering, and name
//! resolution.
//!
//! `Cluster` objects are read through the dynamic client the way
//! `kaniop_operator::controller::Context::get_kanidm_client` reads the
//! owning `Kanidm` custom resource when it needs a field the typed
//! reconcile loop doesn't carry: `Api::<DynamicObject>::namespaced_with`
//! plus `ApiResource::from_gvk`. Every extractor below tolerates missing
//! or mistyped nested fields — `.get(...).and_then(...)` chains, never a
//! panic — because clusters created by older CAPI provider versions omit
//! fields this module would otherwise expect.

use std::collections::BTreeMap;

use fedcore_error::{Error, ErrorKind, Result};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::core::ObjectMeta;
use serde_json::Value;

/// The `cluster.x-k8s.io/v1beta2` `Cluster` GVK every operation in this
/// module targets.
pub fn cluster_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("cluster.x-k8s.io", "v1beta2", "Cluster")
}

pub fn cluster_api_resource() -> ApiResource {
    ApiResource::from_gvk(&cluster_gvk())
}

/// Build the dynamic `Api<DynamicObject>` for `Cluster` objects, namespaced
/// if `namespace` is given or cluster-wide (`all`) otherwise.
pub fn cluster_api(client: kube::Client, namespace: Option<&str>) -> Api<DynamicObject> {
    let resource = cluster_api_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &resource),
        None => Api::all_with(client, &resource),
    }
}

/// Infrastructure provider backing a cluster, derived from
/// `spec.infrastructureRef.kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Aws,
    Azure,
    Vsphere,
    Gcp,
    /// The lowercased infrastructure-ref kind, with a trailing `cluster`
    /// stripped, for providers this module doesn't special-case.
    Other(String),
    /// `spec.infrastructureRef` was absent.
    Unknown,
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Vsphere => "vsphere",
            Provider::Gcp => "gcp",
            Provider::Other(s) => s,
            Provider::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn derive_provider(infra_ref_kind: Option<&str>) -> Provider {
    let Some(kind) = infra_ref_kind else {
        return Provider::Unknown;
    };
    let lower = kind.to_ascii_lowercase();
    if lower.contains("aws") {
        Provider::Aws
    } else if lower.contains("azure") {
        Provider::Azure
    } else if lower.contains("vsphere") {
        Provider::Vsphere
    } else if lower.contains("gcp") || lower.contains("google") {
        Provider::Gcp
    } else {
        Provider::Other(lower.strip_suffix("cluster").unwrap_or(&lower).to_string())
    }
}

/// A discovered cluster, extracted from a CAPI `Cluster` object tolerant
/// of the version skew real fleets accumulate.
#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub name: String,
    pub namespace: String,
    pub provider: Provider,
    pub release: Option<String>,
    pub kubernetes_version: Option<String>,
    pub status: String,
    pub ready: bool,
    pub control_plane_ready: bool,
    pub infrastructure_ready: bool,
    pub node_count: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    /// Raw `status.conditions[].{type,status}` passthrough for callers that
    /// need more than the derived `ready`/`control_plane_ready`/
    /// `infrastructure_ready` booleans.
    pub conditions: Vec<(String, String)>,
    /// `spec.controlPlaneEndpoint.{host,port}`, needed by the SSO
    /// passthrough workload-auth mode to derive the API endpoint directly
    /// rather than from a kubeconfig secret.
    pub control_plane_endpoint: Option<(String, Option<u16>)>,
}

const RELEASE_LABEL: &str = "release.giantswarm.io/version";

/// Build a [`ClusterSummary`] from a raw CAPI `Cluster` [`DynamicObject`].
pub fn extract_cluster_summary(obj: &DynamicObject) -> ClusterSummary {
    let ObjectMeta {
        name,
        namespace,
        labels,
        annotations,
        creation_timestamp,
        ..
    } = obj.metadata.clone();

    let spec = obj.data.get("spec");
    let status = obj.data.get("status");

    let infra_kind = spec
        .and_then(|s| s.get("infrastructureRef"))
        .and_then(|r| r.get("kind"))
        .and_then(Value::as_str);
    let provider = derive_provider(infra_kind);

    let kubernetes_version = first_non_empty_str(&[
        spec.and_then(|s| s.get("topology")).and_then(|t| t.get("version")),
        status.and_then(|s| s.get("version")),
        spec.and_then(|s| s.get("controlPlaneRef")).and_then(|r| r.get("version")),
    ]);

    let phase = status
        .and_then(|s| s.get("phase"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();

    let conditions = extract_conditions(status);
    let control_plane_ready = status
        .and_then(|s| s.get("controlPlaneReady"))
        .and_then(Value::as_bool)
        .unwrap_or_else(|| condition_true(&conditions, "ControlPlaneAvailable"));
    let infrastructure_ready = status
        .and_then(|s| s.get("infrastructureReady"))
        .and_then(Value::as_bool)
        .unwrap_or_else(|| condition_true(&conditions, "InfrastructureReady"));

    let node_count = status
        .and_then(|s| s.get("workerNodes"))
        .and_then(Value::as_i64)
        .or_else(|| status.and_then(|s| s.get("readyReplicas")).and_then(Value::as_i64))
        .or_else(|| {
            status
                .and_then(|s| s.get("controlPlane"))
                .and_then(|c| c.get("readyReplicas"))
                .and_then(Value::as_i64)
        });

    let release = labels.get(RELEASE_LABEL).cloned();
    let ready = control_plane_ready && infrastructure_ready && phase == "Provisioned";
    let control_plane_endpoint = spec
        .and_then(|s| s.get("controlPlaneEndpoint"))
        .and_then(|e| e.get("host"))
        .and_then(Value::as_str)
        .map(|host| {
            let port = spec
                .and_then(|s| s.get("controlPlaneEndpoint"))
                .and_then(|e| e.get("port"))
                .and_then(Value::as_u64)
                .map(|p| p as u16);
            (host.to_string(), port)
        });

    ClusterSummary {
        name: name.unwrap_or_default(),
        namespace: namespace.unwrap_or_default(),
        provider,
        release,
        kubernetes_version,
        status: phase,
        ready,
        control_plane_ready,
        infrastructure_ready,
        node_count,
        labels: labels.into_iter().collect(),
        annotations: annotations.into_iter().collect(),
        created_at: creation_timestamp.map(|t| t.0.to_rfc3339()),
        conditions,
        control_plane_endpoint,
    }
}

fn first_non_empty_str(candidates: &[Option<&Value>]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|v| v.and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_conditions(status: Option<&Value>) -> Vec<(String, String)> {
    status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| {
            let ty = c.get("type").and_then(Value::as_str)?;
            let st = c.get("status").and_then(Value::as_str)?;
            Some((ty.to_string(), st.to_string()))
        })
        .collect()
}

fn condition_true(conditions: &[(String, String)], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|(ty, status)| ty == condition_type && status == "True")
}

/// Filter: fields compose with AND semantics; empty/`None` fields are
/// wildcards.
#[derive(Debug, Clone, Default)]
pub struct ClusterListOptions {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub provider: Option<String>,
    pub status: Option<String>,
    pub ready_only: bool,
}

/// List CAPI clusters via the dynamic client, wrapping `NotFound`/no-match
/// responses (the CRD isn't installed on this management cluster) into
/// [`Error::capi_crd_missing`].
pub async fn discover_clusters(
    client: kube::Client,
    namespace: Option<&str>,
) -> Result<Vec<ClusterSummary>> {
    list_raw(client, namespace, &ListParams::default())
        .await
        .map(|objs| objs.iter().map(extract_cluster_summary).collect())
}

async fn list_raw(
    client: kube::Client,
    namespace: Option<&str>,
    params: &ListParams,
) -> Result<Vec<DynamicObject>> {
    let api = cluster_api(client, namespace);
    match api.list(params).await {
        Ok(list) => {
            tracing::debug!(
                namespace = namespace.unwrap_or("<all>"),
                count = list.items.len(),
                "listed CAPI clusters"
            );
            Ok(list.items)
        }
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            Err(Error::capi_crd_missing(namespace.unwrap_or("").to_string()))
        }
        Err(e) => {
            let text = e.to_string();
            if text.contains("NoMatch") || text.contains("the server could not find") {
                Err(Error::capi_crd_missing(namespace.unwrap_or("").to_string()))
            } else {
                Err(Error::ClusterDiscovery {
                    cluster: namespace.unwrap_or("").to_string(),
                    reason: text,
                    source: None,
                })
            }
        }
    }
}

/// Get a single cluster by exact name. Attempts a server-side
/// `fieldSelector=metadata.name=<name>` list (cheaper than a cluster-wide
/// scan) and defensively filters client-side too, since some API server
/// test doubles ignore field selectors entirely.
pub async fn get_cluster_by_name(
    client: kube::Client,
    namespace: Option<&str>,
    name: &str,
) -> Result<ClusterSummary> {
    let params = ListParams::default().fields(&format!("metadata.name={name}"));
    let objs = list_raw(client, namespace, &params).await?;
    objs.iter()
        .map(extract_cluster_summary)
        .find(|c| c.name == name)
        .ok_or_else(|| Error::ClusterNotFound(name.to_string()))
}

/// Resolve `pattern` against the clusters visible to `client`/`namespace`.
/// An exact name match wins outright; otherwise a case-insensitive
/// substring match against every cluster name is used. Exactly one match
/// returns it; zero is [`Error::ClusterNotFound`]; more than one is
/// [`Error::AmbiguousCluster`] naming every candidate.
pub async fn resolve_cluster(
    client: kube::Client,
    namespace: Option<&str>,
    pattern: &str,
) -> Result<ClusterSummary> {
    let clusters = discover_clusters(client, namespace).await?;

    if let Some(exact) = clusters.iter().find(|c| c.name == pattern) {
        return Ok(exact.clone());
    }

    let lower_pattern = pattern.to_ascii_lowercase();
    let matches: Vec<&ClusterSummary> = clusters
        .iter()
        .filter(|c| c.name.to_ascii_lowercase().contains(&lower_pattern))
        .collect();

    match matches.len() {
        0 => Err(Error::ClusterNotFound(pattern.to_string())),
        1 => Ok(matches[0].clone()),
        _ => Err(Error::AmbiguousCluster {
            pattern: pattern.to_string(),
            candidates: matches.iter().map(|c| c.name.clone()).collect(),
        }),
    }
}

/// List clusters, applying `namespace`/`label_selector` server-side and
/// `provider`/`status`/`ready_only` client-side.
pub async fn list_clusters_with_options(
    client: kube::Client,
    options: &ClusterListOptions,
) -> Result<Vec<ClusterSummary>> {
    let mut params = ListParams::default();
    if let Some(selector) = &options.label_selector {
        params = params.labels(selector);
    }
    let objs = list_raw(client, options.namespace.as_deref(), &params).await?;
    let summaries = objs.iter().map(extract_cluster_summary);

    Ok(summaries
        .filter(|c| {
            options
                .provider
                .as_ref()
                .is_none_or(|p| c.provider.as_str().eq_ignore_ascii_case(p))
        })
        .filter(|c| options.status.as_ref().is_none_or(|s| &c.status == s))
        .filter(|c| !options.ready_only || c.ready)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic_cluster(name: &str, spec: Value, status: Value, labels: BTreeMap<String, String>) -> DynamicObject {
        let mut data = serde_json::Map::new();
        data.insert("spec".to_string(), spec);
        data.insert("status".to_string(), status);
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("org-test".to_string()),
                labels: labels.into_iter().collect(),
                ..Default::default()
            },
            data: Value::Object(data),
        }
    }

    #[test]
    fn ready_invariant_requires_provisioned_phase_and_both_booleans() {
        let obj = dynamic_cluster(
            "prod-cluster-01",
            json!({"infrastructureRef": {"kind": "AWSCluster"}}),
            json!({"phase": "Provisioned", "controlPlaneReady": true, "infrastructureReady": true}),
            BTreeMap::new(),
        );
        let summary = extract_cluster_summary(&obj);
        assert!(summary.ready);
        assert_eq!(summary.provider, Provider::Aws);
    }

    #[test]
    fn ready_is_false_when_phase_is_not_provisioned() {
        let obj = dynamic_cluster(
            "c",
            json!({}),
            json!({"phase": "Provisioning", "controlPlaneReady": true, "infrastructureReady": true}),
            BTreeMap::new(),
        );
        assert!(!extract_cluster_summary(&obj).ready);
    }

    #[test]
    fn readiness_accepts_condition_evidence_when_boolean_fields_absent() {
        let obj = dynamic_cluster(
            "c",
            json!({}),
            json!({
                "phase": "Provisioned",
                "conditions": [
                    {"type": "ControlPlaneAvailable", "status": "True"},
                    {"type": "InfrastructureReady", "status": "True"}
                ]
            }),
            BTreeMap::new(),
        );
        let summary = extract_cluster_summary(&obj);
        assert!(summary.ready);
        assert!(summary.control_plane_ready);
        assert!(summary.infrastructure_ready);
    }

    #[test]
    fn missing_infrastructure_ref_yields_unknown_provider() {
        let obj = dynamic_cluster("c", json!({}), json!({}), BTreeMap::new());
        assert_eq!(extract_cluster_summary(&obj).provider, Provider::Unknown);
        assert_eq!(extract_cluster_summary(&obj).status, "Unknown");
    }

    #[test]
    fn unrecognized_provider_strips_trailing_cluster_suffix() {
        let obj = dynamic_cluster(
            "c",
            json!({"infrastructureRef": {"kind": "DockerCluster"}}),
            json!({}),
            BTreeMap::new(),
        );
        assert_eq!(
            extract_cluster_summary(&obj).provider,
            Provider::Other("docker".to_string())
        );
    }

    #[test]
    fn kubernetes_version_prefers_topology_version() {
        let obj = dynamic_cluster(
            "c",
            json!({"topology": {"version": "v1.30.1"}}),
            json!({"version": "v1.29.0"}),
            BTreeMap::new(),
        );
        assert_eq!(
            extract_cluster_summary(&obj).kubernetes_version,
            Some("v1.30.1".to_string())
        );
    }

    #[test]
    fn release_label_is_read_from_metadata_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(RELEASE_LABEL.to_string(), "25.0.0".to_string());
        let obj = dynamic_cluster("c", json!({}), json!({}), labels);
        assert_eq!(extract_cluster_summary(&obj).release, Some("25.0.0".to_string()));
    }

    #[test]
    fn control_plane_endpoint_extracts_host_and_port() {
        let obj = dynamic_cluster(
            "c",
            json!({"controlPlaneEndpoint": {"host": "10.1.2.3", "port": 6443}}),
            json!({}),
            BTreeMap::new(),
        );
        assert_eq!(
            extract_cluster_summary(&obj).control_plane_endpoint,
            Some(("10.1.2.3".to_string(), Some(6443)))
        );
    }

    #[test]
    fn node_count_falls_back_through_the_documented_chain() {
        let obj = dynamic_cluster(
            "c",
            json!({}),
            json!({"controlPlane": {"readyReplicas": 3}}),
            BTreeMap::new(),
        );
        assert_eq!(extract_cluster_summary(&obj).node_count, Some(3));
    }

    /// Mirrors the `ClusterDiscovery { source: Some(CapiCrdNotInstalled) }`
    /// value `list_raw` constructs on a 404/`NoMatch` response: `is` must
    /// match both the wrapping kind and the wrapped sentinel, regardless of
    /// wrap depth.
    #[test]
    fn capi_crd_missing_is_matches_through_the_wrap() {
        let err = Error::capi_crd_missing("org-test");
        assert!(fedcore_error::is(&err, ErrorKind::CapiCrdNotInstalled));
        assert!(fedcore_error::is(&err, ErrorKind::ClusterDiscovery));
        assert!(!fedcore_error::is(&err, ErrorKind::ClusterNotFound));
    }
}
