//! Immutable OIDC-to-RBAC group translation table.
//!
//! Resolves the open question in the specification's design notes in favor
//! of the stricter of the two variants it names: info-level aggregated
//! logging, the full five-entry denylist, and JSON parsing split from
//! semantic validation.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fedcore_error::{Error, Result};

/// Upper bound on the number of source-to-target entries a mapper may hold.
pub const MAX_MAPPING_COUNT: usize = 100;

/// Target groups a mapping may never translate into, regardless of what the
/// configured table says — these grant cluster-admin-equivalent or
/// control-plane component identities.
pub const DENIED_TARGET_GROUPS: &[&str] = &[
    "system:masters",
    "system:nodes",
    "system:kube-controller-manager",
    "system:kube-scheduler",
    "system:kube-proxy",
];

/// Environment variable the host process may set with a JSON object of
/// `{source: target, ...}` group mappings.
pub const WC_GROUP_MAPPINGS_ENV: &str = "WC_GROUP_MAPPINGS";

/// An immutable, validated source-group -> target-group table. Cheap to
/// clone (the table is held behind an `Arc`); a mapper built from an empty
/// table is the disabled sentinel, for which [`map_groups`](GroupMapper::map_groups)
/// is the identity function.
#[derive(Debug, Clone)]
pub struct GroupMapper {
    mappings: Arc<HashMap<String, String>>,
}

impl GroupMapper {
    /// Validate, defensively copy, and wrap `mappings`. An empty table is
    /// accepted unconditionally and produces the disabled sentinel.
    pub fn new(mappings: HashMap<String, String>) -> Result<Self> {
        if mappings.is_empty() {
            return Ok(Self {
                mappings: Arc::new(HashMap::new()),
            });
        }
        validate_group_mappings(&mappings)?;
        for target in mappings.values() {
            if is_system_group(target) && !DENIED_TARGET_GROUPS.contains(&target.as_str()) {
                tracing::warn!(
                    target_group = %target,
                    "group mapping targets a system: group outside the denylist"
                );
            }
        }
        Ok(Self {
            mappings: Arc::new(mappings),
        })
    }

    /// Build a `GroupMapper` from the `WC_GROUP_MAPPINGS` environment
    /// variable. A missing or empty variable yields the disabled sentinel.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(WC_GROUP_MAPPINGS_ENV).unwrap_or_default();
        let mappings = parse_group_mappings_json(&raw)?;
        Self::new(mappings)
    }

    /// Whether this mapper was constructed from an empty table.
    pub fn is_disabled(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Translate `groups` into their RBAC-facing equivalents.
    ///
    /// Returns the input unchanged (zero allocation) when the mapper is
    /// disabled, or when none of `groups` has an entry in the table.
    /// Otherwise allocates a new vector of equal length, emitting the
    /// original group unchanged wherever no mapping exists. Logs one
    /// aggregated info record for the whole batch; the user's email is
    /// never logged in clear, only its anonymized hash.
    pub fn map_groups<'a>(&self, groups: &'a [String], user_email: &str) -> Cow<'a, [String]> {
        if self.mappings.is_empty() || !groups.iter().any(|g| self.mappings.contains_key(g)) {
            return Cow::Borrowed(groups);
        }

        let mut translations = Vec::new();
        let mapped: Vec<String> = groups
            .iter()
            .map(|group| match self.mappings.get(group) {
                Some(target) => {
                    translations.push(format!("{group}->{target}"));
                    target.clone()
                }
                None => group.clone(),
            })
            .collect();

        tracing::info!(
            mapped_count = translations.len(),
            total_groups = groups.len(),
            translations = %translations.join(", "),
            user_hash = %fedcore_identity::anonymize_email(user_email),
            "remapped OIDC groups to RBAC groups"
        );

        Cow::Owned(mapped)
    }
}

fn is_system_group(target: &str) -> bool {
    target.starts_with("system:")
}

/// Semantic validation, independent of how `mappings` was obtained (JSON,
/// a test fixture, programmatic construction). Rejects: more than
/// [`MAX_MAPPING_COUNT`] entries, an empty source or target, ASCII control
/// characters in either side, a denylisted target, or a duplicate target
/// shared by two different sources.
pub fn validate_group_mappings(mappings: &HashMap<String, String>) -> Result<()> {
    if mappings.len() > MAX_MAPPING_COUNT {
        return Err(Error::Internal(format!(
            "group mapping table has {} entries, exceeding the limit of {MAX_MAPPING_COUNT}",
            mappings.len()
        )));
    }

    let mut seen_targets = HashSet::with_capacity(mappings.len());
    for (source, target) in mappings {
        if source.is_empty() || target.is_empty() {
            return Err(Error::Internal(
                "group mapping source and target must both be non-empty".to_string(),
            ));
        }
        if has_control_char(source) || has_control_char(target) {
            return Err(Error::Internal(format!(
                "group mapping {source:?} -> {target:?} contains an ASCII control character"
            )));
        }
        if DENIED_TARGET_GROUPS.contains(&target.as_str()) {
            return Err(Error::Internal(format!(
                "group mapping target {target:?} is denylisted"
            )));
        }
        if !seen_targets.insert(target.as_str()) {
            return Err(Error::Internal(format!(
                "group mapping target {target:?} is used by more than one source group"
            )));
        }
    }
    Ok(())
}

fn has_control_char(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

/// Parse a `WC_GROUP_MAPPINGS`-shaped JSON object into a raw mapping table,
/// without running [`validate_group_mappings`]. An empty or blank string
/// parses to an empty table.
pub fn parse_group_mappings_json(json: &str) -> Result<HashMap<String, String>> {
    if json.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(json)
        .map_err(|e| Error::Internal(format!("invalid group mapping JSON: {e}")))
}

/// Serialize a raw mapping table back to the `WC_GROUP_MAPPINGS` JSON shape.
pub fn group_mappings_to_json(mappings: &HashMap<String, String>) -> Result<String> {
    serde_json::to_string(mappings)
        .map_err(|e| Error::Internal(format!("failed to serialize group mappings: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(s, t)| (s.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn empty_table_is_disabled_and_identity() {
        let mapper = GroupMapper::new(HashMap::new()).unwrap();
        assert!(mapper.is_disabled());
        let groups = vec!["developers".to_string(), "ops".to_string()];
        let mapped = mapper.map_groups(&groups, "u@x.com");
        assert!(matches!(mapped, Cow::Borrowed(_)));
        assert_eq!(mapped.as_ref(), groups.as_slice());
    }

    #[test]
    fn fast_path_when_no_group_matches() {
        let mapper = GroupMapper::new(table(&[("customer:GroupA", "00000000-aaaa")])).unwrap();
        let groups = vec!["developers".to_string()];
        let mapped = mapper.map_groups(&groups, "u@x.com");
        assert!(matches!(mapped, Cow::Borrowed(_)));
    }

    #[test]
    fn group_remap_scenario_from_spec() {
        let mapper = GroupMapper::new(table(&[("customer:GroupA", "00000000-aaaa")])).unwrap();
        let groups = vec!["customer:GroupA".to_string(), "developers".to_string()];
        let mapped = mapper.map_groups(&groups, "u@x.com");
        assert_eq!(
            mapped.as_ref(),
            &["00000000-aaaa".to_string(), "developers".to_string()]
        );
    }

    #[test]
    fn map_groups_preserves_length() {
        let mapper = GroupMapper::new(table(&[("a", "b")])).unwrap();
        let groups = vec!["a".to_string(), "c".to_string(), "d".to_string()];
        let mapped = mapper.map_groups(&groups, "u@x.com");
        assert_eq!(mapped.len(), groups.len());
    }

    #[test]
    fn validate_rejects_denylisted_target() {
        let err = GroupMapper::new(table(&[("src", "system:masters")])).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn validate_allows_non_denylisted_system_group_with_warning() {
        assert!(GroupMapper::new(table(&[("src", "system:custom-thing")])).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_target() {
        let err = GroupMapper::new(table(&[("a", "shared"), ("b", "shared")])).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn validate_rejects_empty_source_or_target() {
        assert!(GroupMapper::new(table(&[("", "target")])).is_err());
        assert!(GroupMapper::new(table(&[("source", "")])).is_err());
    }

    #[test]
    fn validate_rejects_control_characters() {
        assert!(GroupMapper::new(table(&[("a\u{0007}", "b")])).is_err());
    }

    #[test]
    fn validate_rejects_too_many_entries() {
        let mappings: HashMap<String, String> = (0..=MAX_MAPPING_COUNT)
            .map(|i| (format!("src{i}"), format!("tgt{i}")))
            .collect();
        assert!(GroupMapper::new(mappings).is_err());
    }

    #[test]
    fn json_round_trip_for_valid_mapping() {
        let m = table(&[("a", "b"), ("c", "d")]);
        let json = group_mappings_to_json(&m).unwrap();
        let parsed = parse_group_mappings_json(&json).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn json_parse_rejects_semantic_violations_post_parse() {
        let json = r#"{"a":"system:masters"}"#;
        let parsed = parse_group_mappings_json(json).unwrap();
        assert!(validate_group_mappings(&parsed).is_err());
    }

    #[test]
    fn from_env_with_unset_variable_is_disabled() {
        // SAFETY: test-only process-wide env mutation, not run concurrently
        // with other tests that read WC_GROUP_MAPPINGS.
        unsafe {
            std::env::remove_var(WC_GROUP_MAPPINGS_ENV);
        }
        let mapper = GroupMapper::from_env().unwrap();
        assert!(mapper.is_disabled());
    }
}
