//! Scoped token generation used by two distinct consumers:
//!
//! - `forge_at_*` tokens scope a CLI invocation to a workflow + attempt
//!   pair (see [`guard`]), mirroring an agent-mode CLI session to the
//!   workflow it's allowed to report progress for.
//! - `forge_ri_*` runner instance ids are the opaque, unguessable leases
//!   handed to an external sandbox on enqueue; the callback's
//!   `X-Workflow-Runner-Token` header is checked against the stored
//!   `runner_instance_id` column by simple string equality, not by
//!   re-parsing claims out of the token (step ids are free-form strings,
//!   not fixed-width UUIDs, so there is nothing fixed-width to slice).
//!
//! Both are HMAC-SHA256 based.

pub mod guard;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify forge agent-mode CLI tokens.
const TOKEN_PREFIX: &str = "forge_at_";

/// Prefix used to identify runner instance ids / callback leases.
const RUNNER_INSTANCE_PREFIX: &str = "forge_ri_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("invalid workflow ID in token: {0}")]
    InvalidWorkflowId(String),

    #[error("invalid attempt number in token: {0}")]
    InvalidAttempt(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("missing token secret")]
    MissingSecret,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl TokenConfig {
    /// Create a new TokenConfig with the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Create a TokenConfig from the `FORGE_TOKEN_SECRET` environment variable.
    ///
    /// The value must be a hex-encoded string. Returns an error if the
    /// variable is missing or contains invalid hex.
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex =
            std::env::var("FORGE_TOKEN_SECRET").map_err(|_| TokenError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            TokenError::InvalidFormat(format!("FORGE_TOKEN_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated `forge_at_*` CLI token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// The workflow this CLI session is scoped to.
    pub workflow_id: Uuid,
    /// The attempt number this token is scoped to.
    pub attempt: u32,
}

/// Generate a scoped agent-mode CLI token for a workflow + attempt.
///
/// Format: `forge_at_<workflow_id>_<attempt>_<hmac_hex>`, where the
/// HMAC-SHA256 is computed over `<workflow_id>:<attempt>`.
pub fn generate_token(config: &TokenConfig, workflow_id: Uuid, attempt: u32) -> String {
    let message = format!("{workflow_id}:{attempt}");
    let mac = compute_hmac(&config.secret, message.as_bytes());
    let hmac_hex = hex::encode(mac);
    format!("{TOKEN_PREFIX}{workflow_id}_{attempt}_{hmac_hex}")
}

/// Validate a scoped agent-mode CLI token and extract its claims.
pub fn validate_token(config: &TokenConfig, token: &str) -> Result<TokenClaims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat("token must start with 'forge_at_'".to_string())
    })?;

    // A UUID is 36 chars (8-4-4-4-12); parse it, then `_<attempt>_<hmac_hex>`.
    let (workflow_id_str, after_workflow_id) = parse_uuid_prefix(rest)?;

    let workflow_id = Uuid::parse_str(workflow_id_str)
        .map_err(|e| TokenError::InvalidWorkflowId(e.to_string()))?;

    let after_underscore = after_workflow_id.strip_prefix('_').ok_or_else(|| {
        TokenError::InvalidFormat("expected underscore after workflow_id".to_string())
    })?;

    let (attempt_str, hmac_hex) = after_underscore.split_once('_').ok_or_else(|| {
        TokenError::InvalidFormat("expected underscore between attempt and hmac".to_string())
    })?;

    let attempt: u32 = attempt_str
        .parse()
        .map_err(|e: std::num::ParseIntError| TokenError::InvalidAttempt(e.to_string()))?;

    let provided_mac = hex::decode(hmac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    let message = format!("{workflow_id}:{attempt}");
    verify_hmac_constant_time(&config.secret, message.as_bytes(), &provided_mac)?;

    Ok(TokenClaims { workflow_id, attempt })
}

/// Generate an opaque runner instance id / callback lease token.
///
/// Unlike [`generate_token`] this is one-directional: the workflow runtime
/// never re-parses a workflow id or attempt back out of it. It stores the
/// returned string verbatim in `workflow_steps.runner_instance_id` and later
/// compares the callback's `X-Workflow-Runner-Token` header against that
/// stored value with a simple equality check. The HMAC only buys
/// unguessability (an external party can't forge a lease for a step it
/// hasn't been handed), not a decodable claim.
pub fn generate_runner_instance_id(
    config: &TokenConfig,
    workflow_id: Uuid,
    step_id: &str,
    attempt: u32,
) -> String {
    let message = format!("{workflow_id}:{step_id}:{attempt}");
    let mac = compute_hmac(&config.secret, message.as_bytes());
    format!("{RUNNER_INSTANCE_PREFIX}{}", hex::encode(mac))
}

/// Parse a UUID from the beginning of a string.
/// Returns (uuid_str, remainder).
fn parse_uuid_prefix(s: &str) -> Result<(&str, &str), TokenError> {
    if s.len() < 36 {
        return Err(TokenError::InvalidFormat(
            "token too short to contain a valid UUID".to_string(),
        ));
    }
    Ok(s.split_at(36))
}

/// Compute HMAC-SHA256 over the given message with the given key.
fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verify HMAC using constant-time comparison.
fn verify_hmac_constant_time(
    key: &[u8],
    message: &[u8],
    expected_mac: &[u8],
) -> Result<(), TokenError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.verify_slice(expected_mac)
        .map_err(|_| TokenError::HmacMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TokenConfig {
        TokenConfig::new(b"test-secret-key-for-forge".to_vec())
    }

    #[test]
    fn generate_token_has_correct_format() {
        let config = test_config();
        let workflow_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let attempt = 1;

        let token = generate_token(&config, workflow_id, attempt);

        assert!(token.starts_with("forge_at_"));
        assert!(token.contains(&workflow_id.to_string()));
        assert!(token.contains("_1_"));

        let rest = token.strip_prefix("forge_at_").unwrap();
        let parts_after_uuid = rest[36..].strip_prefix('_').unwrap();
        let (_attempt_str, hmac_hex) = parts_after_uuid.split_once('_').unwrap();
        assert_eq!(hmac_hex.len(), 64, "HMAC-SHA256 hex should be 64 chars");
    }

    #[test]
    fn generate_and_validate_roundtrip() {
        let config = test_config();
        let workflow_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let attempt = 3;

        let token = generate_token(&config, workflow_id, attempt);
        let claims = validate_token(&config, &token).unwrap();

        assert_eq!(claims.workflow_id, workflow_id);
        assert_eq!(claims.attempt, attempt);
    }

    #[test]
    fn validate_with_zero_attempt() {
        let config = test_config();
        let workflow_id = Uuid::new_v4();

        let token = generate_token(&config, workflow_id, 0);
        let claims = validate_token(&config, &token).unwrap();

        assert_eq!(claims.workflow_id, workflow_id);
        assert_eq!(claims.attempt, 0);
    }

    #[test]
    fn reject_tampered_hmac() {
        let config = test_config();
        let workflow_id = Uuid::new_v4();
        let token = generate_token(&config, workflow_id, 1);

        let mut tampered = token.clone();
        let last_char = tampered.pop().unwrap();
        let replacement = if last_char == 'a' { 'b' } else { 'a' };
        tampered.push(replacement);

        let result = validate_token(&config, &tampered);
        assert!(matches!(result.unwrap_err(), TokenError::HmacMismatch));
    }

    #[test]
    fn reject_tampered_workflow_id() {
        let config = test_config();
        let workflow_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let token = generate_token(&config, workflow_id, 1);

        let other_id = Uuid::parse_str("660e8400-e29b-41d4-a716-446655440000").unwrap();
        let tampered = token.replace(&workflow_id.to_string(), &other_id.to_string());

        assert!(validate_token(&config, &tampered).is_err());
    }

    #[test]
    fn reject_tampered_attempt() {
        let config = test_config();
        let workflow_id = Uuid::new_v4();
        let token = generate_token(&config, workflow_id, 1);

        let prefix_and_uuid = &token[..TOKEN_PREFIX.len() + 36];
        let after_uuid = &token[TOKEN_PREFIX.len() + 36..];
        let tampered_after = after_uuid.replacen("_1_", "_2_", 1);
        let tampered = format!("{prefix_and_uuid}{tampered_after}");

        assert!(validate_token(&config, &tampered).is_err());
    }

    #[test]
    fn reject_wrong_secret() {
        let config = test_config();
        let workflow_id = Uuid::new_v4();
        let token = generate_token(&config, workflow_id, 1);

        let wrong_config = TokenConfig::new(b"wrong-secret-key".to_vec());
        let result = validate_token(&wrong_config, &token);
        assert!(matches!(result.unwrap_err(), TokenError::HmacMismatch));
    }

    #[test]
    fn reject_empty_token() {
        let config = test_config();
        assert!(matches!(
            validate_token(&config, "").unwrap_err(),
            TokenError::InvalidFormat(_)
        ));
    }

    #[test]
    fn reject_wrong_prefix() {
        let config = test_config();
        assert!(matches!(
            validate_token(&config, "wrong_prefix_abc").unwrap_err(),
            TokenError::InvalidFormat(_)
        ));
    }

    #[test]
    fn reject_invalid_uuid() {
        let config = test_config();
        let result =
            validate_token(&config, "forge_at_not-a-valid-uuid-at-all-noooooo_1_abcdef");
        assert!(result.is_err());
    }

    #[test]
    fn reject_invalid_attempt_number() {
        let config = test_config();
        let workflow_id = Uuid::new_v4();
        let token = format!("forge_at_{workflow_id}_abc_deadbeef");
        assert!(matches!(
            validate_token(&config, &token).unwrap_err(),
            TokenError::InvalidAttempt(_)
        ));
    }

    #[test]
    fn different_workflows_produce_different_tokens() {
        let config = test_config();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();

        assert_ne!(
            generate_token(&config, id1, 1),
            generate_token(&config, id2, 1)
        );
    }

    #[test]
    fn same_inputs_produce_same_token() {
        let config = test_config();
        let workflow_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();

        assert_eq!(
            generate_token(&config, workflow_id, 1),
            generate_token(&config, workflow_id, 1),
        );
    }

    #[test]
    fn token_config_from_env_missing() {
        // SAFETY: test-only; env var manipulation is safe in single-threaded tests.
        unsafe { std::env::remove_var("FORGE_TOKEN_SECRET") };
        assert!(matches!(
            TokenConfig::from_env().unwrap_err(),
            TokenError::MissingSecret
        ));
    }

    // -- runner instance id / callback lease tests ---------------------------

    #[test]
    fn runner_instance_id_has_expected_prefix() {
        let config = test_config();
        let id = generate_runner_instance_id(&config, Uuid::new_v4(), "wf-1:task-a", 0);
        assert!(id.starts_with("forge_ri_"));
        assert_eq!(id.strip_prefix("forge_ri_").unwrap().len(), 64);
    }

    #[test]
    fn runner_instance_id_is_deterministic_per_attempt() {
        let config = test_config();
        let workflow_id = Uuid::new_v4();
        let a = generate_runner_instance_id(&config, workflow_id, "wf-1:task-a", 0);
        let b = generate_runner_instance_id(&config, workflow_id, "wf-1:task-a", 0);
        assert_eq!(a, b);
    }

    #[test]
    fn runner_instance_id_differs_across_attempts() {
        let config = test_config();
        let workflow_id = Uuid::new_v4();
        let first = generate_runner_instance_id(&config, workflow_id, "wf-1:task-a", 0);
        let second = generate_runner_instance_id(&config, workflow_id, "wf-1:task-a", 1);
        assert_ne!(first, second);
    }

    #[test]
    fn runner_instance_id_differs_across_steps() {
        let config = test_config();
        let workflow_id = Uuid::new_v4();
        let a = generate_runner_instance_id(&config, workflow_id, "wf-1:task-a", 0);
        let b = generate_runner_instance_id(&config, workflow_id, "wf-1:task-b", 0);
        assert_ne!(a, b);
    }

    #[test]
    fn runner_instance_id_differs_with_wrong_secret() {
        let workflow_id = Uuid::new_v4();
        let a = generate_runner_instance_id(&test_config(), workflow_id, "wf-1:task-a", 0);
        let other = TokenConfig::new(b"different-secret".to_vec());
        let b = generate_runner_instance_id(&other, workflow_id, "wf-1:task-a", 0);
        assert_ne!(a, b);
    }
}
