//! Authenticated-user identity (`UserInfo`) and the validation helpers every
//! other crate in the workspace calls before trusting a cluster name or a
//! user record.

use std::collections::HashMap;
use std::sync::OnceLock;

use fedcore_error::{Error, Result};
use sha2::{Digest, Sha256};

/// Recognized `extra` key carrying a fallback bearer token when no
/// `TokenExtractor` is wired up by the host process.
pub const EXTRA_OAUTH_TOKEN: &str = "oauth_token";

const MAX_EMAIL_LEN: usize = 254;
const MAX_CLUSTER_NAME_LEN: usize = 63;

/// An authenticated principal. Immutable after construction: every field is
/// set once in [`UserInfo::new`] and validated there, so a `UserInfo` that
/// exists is always well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    email: String,
    groups: Vec<String>,
    extra: HashMap<String, Vec<String>>,
}

impl UserInfo {
    /// Build a new `UserInfo`, normalizing and validating the email.
    /// Groups are kept in order with duplicates preserved, matching the
    /// OIDC claim they were extracted from.
    pub fn new(
        email: impl Into<String>,
        groups: Vec<String>,
        extra: HashMap<String, Vec<String>>,
    ) -> Result<Self> {
        let email = normalize_email(&email.into());
        validate_email(&email)?;
        Ok(Self {
            email,
            groups,
            extra,
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn extra(&self) -> &HashMap<String, Vec<String>> {
        &self.extra
    }

    /// The fallback bearer token carried in `extra["oauth_token"]`, if any.
    pub fn fallback_oauth_token(&self) -> Option<&str> {
        self.extra
            .get(EXTRA_OAUTH_TOKEN)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Rejects a missing user record (modeled as `None`, since Rust has no
/// `nil` for a concrete, already-constructed `UserInfo`) or one with an
/// empty email, and re-validates the email shape defensively.
pub fn validate_user_info(user: Option<&UserInfo>) -> Result<()> {
    let user = user.ok_or(Error::UserInfoRequired)?;
    if user.email.is_empty() {
        return Err(Error::UserInfoRequired);
    }
    validate_email(&user.email)
}

/// A conservative RFC-5322 local+domain check: non-empty local part, a
/// domain with at least one dot, no whitespace, and a total length cap.
/// Intentionally stricter than the full RFC grammar — this is a gateway's
/// front door, not a mail server.
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() || email.len() > MAX_EMAIL_LEN {
        return Err(Error::InvalidEmail(email.to_string()));
    }
    if email.chars().any(char::is_whitespace) {
        return Err(Error::InvalidEmail(email.to_string()));
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(Error::InvalidEmail(email.to_string()));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(Error::InvalidEmail(email.to_string()));
    }
    if domain.contains('@') {
        return Err(Error::InvalidEmail(email.to_string()));
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(Error::InvalidEmail(email.to_string()));
    }
    Ok(())
}

/// A conservative DNS-1123-subset cluster name check: lowercase
/// alphanumerics and `-`, length 1-63, no `..`, no `/`, no leading or
/// trailing `-`. The `..`/`/` checks double as a path-traversal trap for
/// any caller that later interpolates the name into a resource path.
pub fn validate_cluster_name(name: &str) -> Result<()> {
    let fail = |reason: &str| Err(Error::InvalidClusterName(name.to_string(), reason.to_string()));

    if name.is_empty() || name.len() > MAX_CLUSTER_NAME_LEN {
        return fail("length must be between 1 and 63 characters");
    }
    if name.contains("..") {
        return fail("must not contain '..'");
    }
    if name.contains('/') {
        return fail("must not contain '/'");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return fail("must not start or end with '-'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return fail("must contain only lowercase alphanumerics and '-'");
    }
    Ok(())
}

static PROCESS_KEY: OnceLock<[u8; 32]> = OnceLock::new();

/// A key generated once per process so that [`anonymize_email`] is stable
/// within a run (repeat calls for the same email produce the same token,
/// which is all logging correlation needs) without persisting any
/// process-wide state across restarts.
fn process_key() -> &'static [u8; 32] {
    PROCESS_KEY.get_or_init(|| {
        let mut hasher = Sha256::new();
        hasher.update(std::process::id().to_be_bytes());
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        hasher.update(now.as_nanos().to_be_bytes());
        // Mix in a stack address as a cheap extra source of per-run entropy.
        let stack_marker = &hasher as *const _ as usize;
        hasher.update(stack_marker.to_be_bytes());
        hasher.finalize().into()
    })
}

/// A stable, non-reversible per-process token for an email, suitable for
/// log correlation. Never log `UserInfo::email()` directly — always log
/// this instead.
pub fn anonymize_email(email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(process_key());
    hasher.update(email.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_email_accepts_simple_address() {
        assert!(validate_email("user@example.com").is_ok());
    }

    #[test]
    fn validate_email_rejects_missing_at() {
        assert!(validate_email("userexample.com").is_err());
    }

    #[test]
    fn validate_email_rejects_missing_domain_dot() {
        assert!(validate_email("user@localhost").is_err());
    }

    #[test]
    fn validate_email_rejects_overlong() {
        let local = "a".repeat(250);
        assert!(validate_email(&format!("{local}@example.com")).is_err());
    }

    #[test]
    fn validate_user_info_rejects_none() {
        assert!(validate_user_info(None).is_err());
    }

    #[test]
    fn validate_user_info_accepts_constructed_user() {
        let user = UserInfo::new("User@Example.com", vec!["developers".to_string()], HashMap::new())
            .unwrap();
        assert_eq!(user.email(), "user@example.com");
        assert!(validate_user_info(Some(&user)).is_ok());
    }

    #[test]
    fn fallback_oauth_token_reads_extra() {
        let mut extra = HashMap::new();
        extra.insert(EXTRA_OAUTH_TOKEN.to_string(), vec!["tok-123".to_string()]);
        let user = UserInfo::new("u@x.com", vec![], extra).unwrap();
        assert_eq!(user.fallback_oauth_token(), Some("tok-123"));
    }

    #[test]
    fn validate_cluster_name_accepts_conservative_names() {
        assert!(validate_cluster_name("prod-cluster-01").is_ok());
    }

    #[test]
    fn validate_cluster_name_rejects_path_traversal() {
        assert!(validate_cluster_name("../etc").is_err());
        assert!(validate_cluster_name("a/b").is_err());
    }

    #[test]
    fn validate_cluster_name_rejects_leading_trailing_dash() {
        assert!(validate_cluster_name("-prod").is_err());
        assert!(validate_cluster_name("prod-").is_err());
    }

    #[test]
    fn validate_cluster_name_rejects_uppercase() {
        assert!(validate_cluster_name("Prod").is_err());
    }

    #[test]
    fn validate_cluster_name_rejects_too_long() {
        assert!(validate_cluster_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn anonymize_email_is_stable_within_process() {
        let a = anonymize_email("same@example.com");
        let b = anonymize_email("same@example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn anonymize_email_differs_across_inputs() {
        assert_ne!(
            anonymize_email("a@example.com"),
            anonymize_email("b@example.com")
        );
    }
}
