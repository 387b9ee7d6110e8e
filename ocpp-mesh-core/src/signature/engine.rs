//! Signing-key selection and inbound signature validation
//!
//! Signatures ride inside the payload object:
//!
//! ```json
//! {"type": "Hard", "signatures": [{"keyId": "csms-root", "algorithm": "ed25519", "value": "...", "timestamp": "..."}]}
//! ```
//!
//! The signed bytes are the payload without `signatures`, serialized with
//! sorted keys, followed by the signature timestamp (RFC 3339, milliseconds)
//! when present.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::Verifier;
use futures_util::future;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::keys::{KeyId, KeyProvider, SigningContext, SigningKey, ED25519};
use super::policy::{Direction, SignaturePolicy, SignaturePolicyEntry};
use crate::clock::Clock;

/// Payload member carrying signatures
pub const SIGNATURES_FIELD: &str = "signatures";

/// Signature errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature required but message is unsigned")]
    Unsigned,

    #[error("no signing key available for {action}")]
    NoSigningKey { action: String },

    #[error("unknown key {0}")]
    UnknownKey(KeyId),

    #[error("key {0} is not an authorized signer")]
    Unauthorized(KeyId),

    #[error("signature by {key_id} is invalid: {reason}")]
    Invalid { key_id: KeyId, reason: String },

    #[error("unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature by {key_id} is {skew_secs}s off local time")]
    ClockSkew { key_id: KeyId, skew_secs: i64 },

    #[error("malformed signature data: {0}")]
    Malformed(String),

    #[error("payload must be a JSON object to carry signatures")]
    PayloadNotObject,

    #[error("signing with {0} timed out")]
    SigningTimeout(KeyId),

    #[error("signing with {key_id} failed: {reason}")]
    SigningFailed { key_id: KeyId, reason: String },
}

/// One attached signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub key_id: KeyId,
    pub algorithm: String,
    /// Base64 signature bytes
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// What verification found, independent of policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Unsigned,
    /// Every signature verified
    Valid { key_ids: Vec<KeyId> },
    Invalid { reason: SignatureError },
}

/// Policy decision on an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(VerificationOutcome),
    Rejected(SignatureError),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }
}

/// Applies a [`SignaturePolicy`] using keys from a [`KeyProvider`]
pub struct SignaturePolicyEngine {
    policy: SignaturePolicy,
    keys: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
    signing_timeout: Duration,
}

impl SignaturePolicyEngine {
    pub fn new(
        policy: SignaturePolicy,
        keys: Arc<dyn KeyProvider>,
        clock: Arc<dyn Clock>,
        signing_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            keys,
            clock,
            signing_timeout,
        }
    }

    pub fn policy(&self) -> &SignaturePolicy {
        &self.policy
    }

    /// Keys to sign an `(action, direction)` message with
    ///
    /// Explicit keys win; otherwise the matching policy entry decides. No entry
    /// means the message goes out unsigned.
    pub fn signing_plan_for(
        &self,
        action: &str,
        direction: Direction,
        explicit: Option<&[SigningKey]>,
    ) -> Vec<SigningKey> {
        if let Some(keys) = explicit {
            return keys.to_vec();
        }
        let Some(entry) = self.policy.lookup(action, direction) else {
            return Vec::new();
        };
        if !entry.key_ids.is_empty() {
            return entry.key_ids.iter().cloned().map(SigningKey::ed25519).collect();
        }
        self.keys.keys_for(&SigningContext { action, direction })
    }

    /// Produce one signature per key over `payload_bytes`
    pub async fn sign(
        &self,
        payload_bytes: &[u8],
        keys: &[SigningKey],
    ) -> Result<Vec<Signature>, SignatureError> {
        let signing = keys.iter().map(|key| self.sign_one(payload_bytes, key));
        future::try_join_all(signing).await
    }

    async fn sign_one(&self, payload_bytes: &[u8], key: &SigningKey) -> Result<Signature, SignatureError> {
        let timestamp = self.clock.now();
        let message = signed_message(payload_bytes, Some(&timestamp));

        let signature = tokio::time::timeout(self.signing_timeout, self.keys.sign(key, &message))
            .await
            .map_err(|_| SignatureError::SigningTimeout(key.key_id.clone()))??;

        Ok(Signature {
            key_id: key.key_id.clone(),
            algorithm: key.algorithm.clone(),
            value: BASE64.encode(signature.to_bytes()),
            timestamp: Some(timestamp),
        })
    }

    /// Check `signatures` over `payload_bytes` against the inbound policy for `action`
    pub fn verify(&self, action: &str, payload_bytes: &[u8], signatures: &[Signature]) -> Verdict {
        let entry = self.policy.lookup(action, Direction::Inbound);
        let outcome = self.evaluate(payload_bytes, signatures);
        decide(entry, outcome)
    }

    /// Sign a payload in place per the policy, returning how many signatures were attached
    pub async fn sign_payload(
        &self,
        action: &str,
        direction: Direction,
        payload: &mut Value,
        explicit: Option<&[SigningKey]>,
    ) -> Result<usize, SignatureError> {
        let keys = self.signing_plan_for(action, direction, explicit);
        if keys.is_empty() {
            let required = self
                .policy
                .lookup(action, direction)
                .map(SignaturePolicyEntry::is_required)
                .unwrap_or(false);
            if required {
                return Err(SignatureError::NoSigningKey {
                    action: action.to_string(),
                });
            }
            return Ok(0);
        }

        let bytes = canonical_bytes(payload)?;
        let signatures = self.sign(&bytes, &keys).await?;
        let count = signatures.len();

        let Value::Object(map) = payload else {
            return Err(SignatureError::PayloadNotObject);
        };
        let encoded = serde_json::to_value(&signatures)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        map.insert(SIGNATURES_FIELD.to_string(), encoded);

        debug!("Signed {} ({:?}) with {} key(s)", action, direction, count);
        Ok(count)
    }

    /// Verify the signatures carried in an inbound payload
    pub fn verify_payload(&self, action: &str, payload: &Value) -> Verdict {
        let entry = self.policy.lookup(action, Direction::Inbound);
        let outcome = match (extract_signatures(payload), canonical_bytes(payload)) {
            (Ok(signatures), Ok(bytes)) => self.evaluate(&bytes, &signatures),
            (Err(reason), _) => VerificationOutcome::Invalid { reason },
            // A non-object payload carries no signatures
            (Ok(_), Err(_)) => VerificationOutcome::Unsigned,
        };
        decide(entry, outcome)
    }

    fn evaluate(&self, payload_bytes: &[u8], signatures: &[Signature]) -> VerificationOutcome {
        if signatures.is_empty() {
            return VerificationOutcome::Unsigned;
        }
        let mut key_ids = Vec::with_capacity(signatures.len());
        for signature in signatures {
            if let Err(reason) = self.check(payload_bytes, signature) {
                return VerificationOutcome::Invalid { reason };
            }
            key_ids.push(signature.key_id.clone());
        }
        VerificationOutcome::Valid { key_ids }
    }

    fn check(&self, payload_bytes: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        if signature.algorithm != ED25519 {
            return Err(SignatureError::UnsupportedAlgorithm(signature.algorithm.clone()));
        }

        let public = self
            .keys
            .public_key_for(&signature.key_id)
            .ok_or_else(|| SignatureError::UnknownKey(signature.key_id.clone()))?;

        let invalid = |reason: String| SignatureError::Invalid {
            key_id: signature.key_id.clone(),
            reason,
        };

        let bytes = BASE64
            .decode(signature.value.trim())
            .map_err(|e| invalid(format!("invalid base64: {}", e)))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| invalid(format!("signature must be 64 bytes, got {}", b.len())))?;

        let message = signed_message(payload_bytes, signature.timestamp.as_ref());
        public
            .verify(&message, &ed25519_dalek::Signature::from_bytes(&bytes))
            .map_err(|_| invalid("verification failed".to_string()))?;

        if let (Some(max_skew), Some(timestamp)) = (self.policy.max_clock_skew(), signature.timestamp) {
            let skew = (self.clock.now() - timestamp).num_seconds();
            if skew.unsigned_abs() > max_skew.as_secs() {
                return Err(SignatureError::ClockSkew {
                    key_id: signature.key_id.clone(),
                    skew_secs: skew,
                });
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for SignaturePolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignaturePolicyEngine")
            .field("policy", &self.policy)
            .field("signing_timeout", &self.signing_timeout)
            .finish()
    }
}

fn decide(entry: Option<&SignaturePolicyEntry>, outcome: VerificationOutcome) -> Verdict {
    let Some(entry) = entry.filter(|e| e.is_required()) else {
        return Verdict::Accepted(outcome);
    };

    match outcome {
        VerificationOutcome::Unsigned => Verdict::Rejected(SignatureError::Unsigned),
        VerificationOutcome::Invalid { reason } => Verdict::Rejected(reason),
        VerificationOutcome::Valid { key_ids } => {
            if entry.key_ids.is_empty() || key_ids.iter().any(|k| entry.key_ids.contains(k)) {
                Verdict::Accepted(VerificationOutcome::Valid { key_ids })
            } else {
                let signer = key_ids.into_iter().next().unwrap_or_else(|| KeyId::new(""));
                Verdict::Rejected(SignatureError::Unauthorized(signer))
            }
        }
    }
}

fn signed_message(payload_bytes: &[u8], timestamp: Option<&DateTime<Utc>>) -> Vec<u8> {
    let mut message = payload_bytes.to_vec();
    if let Some(timestamp) = timestamp {
        message.extend_from_slice(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true).as_bytes());
    }
    message
}

/// Bytes covered by signatures: the payload object minus `signatures`, keys sorted
pub fn canonical_bytes(payload: &Value) -> Result<Vec<u8>, SignatureError> {
    let Value::Object(map) = payload else {
        return Err(SignatureError::PayloadNotObject);
    };
    let mut unsigned = map.clone();
    unsigned.remove(SIGNATURES_FIELD);
    serde_json::to_vec(&Value::Object(unsigned)).map_err(|e| SignatureError::Malformed(e.to_string()))
}

/// Signatures attached to a payload; none when the member is absent
pub fn extract_signatures(payload: &Value) -> Result<Vec<Signature>, SignatureError> {
    match payload.get(SIGNATURES_FIELD) {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| SignatureError::Malformed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::signature::keys::InMemoryKeyStore;
    use chrono::TimeZone;
    use futures_util::future::BoxFuture;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 20, 12, 0, 0).unwrap()
    }

    fn engine(policy: SignaturePolicy, keys: Arc<InMemoryKeyStore>, clock: Arc<ManualClock>) -> SignaturePolicyEngine {
        SignaturePolicyEngine::new(policy, keys, clock, Duration::from_secs(5))
    }

    #[test]
    fn test_signing_plan_precedence() {
        let keys = Arc::new(InMemoryKeyStore::new());
        keys.generate("local");
        let policy = SignaturePolicy::new()
            .with_entry(SignaturePolicyEntry::required("Reset", Direction::Outbound).with_keys(["csms-root"]))
            .with_entry(SignaturePolicyEntry::optional("*", Direction::Outbound));
        let engine = engine(policy, keys, Arc::new(ManualClock::new(start())));

        let explicit = [SigningKey::ed25519("override")];
        assert_eq!(
            engine.signing_plan_for("Reset", Direction::Outbound, Some(&explicit)),
            explicit.to_vec()
        );
        assert_eq!(
            engine.signing_plan_for("Reset", Direction::Outbound, None),
            vec![SigningKey::ed25519("csms-root")]
        );
        assert_eq!(
            engine.signing_plan_for("Heartbeat", Direction::Outbound, None),
            vec![SigningKey::ed25519("local")]
        );
        assert!(engine.signing_plan_for("Reset", Direction::Inbound, None).is_empty());
    }

    #[tokio::test]
    async fn test_sign_then_verify_payload() {
        let keys = Arc::new(InMemoryKeyStore::new());
        keys.generate("a");
        keys.generate("b");
        let policy = SignaturePolicy::new()
            .with_entry(SignaturePolicyEntry::required("Reset", Direction::Inbound).with_keys(["b"]));
        let engine = engine(policy, keys, Arc::new(ManualClock::new(start())));

        let mut payload = json!({"type": "Hard"});
        let explicit = [SigningKey::ed25519("a"), SigningKey::ed25519("b")];
        let count = engine
            .sign_payload("Reset", Direction::Outbound, &mut payload, Some(&explicit))
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(payload["signatures"].as_array().map(Vec::len), Some(2));

        let verdict = engine.verify_payload("Reset", &payload);
        assert_eq!(
            verdict,
            Verdict::Accepted(VerificationOutcome::Valid {
                key_ids: vec![KeyId::from("a"), KeyId::from("b")]
            })
        );

        // Order of signatures does not matter
        let mut reordered = payload.clone();
        if let Some(list) = reordered["signatures"].as_array_mut() {
            list.reverse();
        }
        assert!(engine.verify_payload("Reset", &reordered).is_accepted());
    }

    #[tokio::test]
    async fn test_tampered_payload_rejected() {
        let keys = Arc::new(InMemoryKeyStore::new());
        keys.generate("a");
        let policy = SignaturePolicy::new().with_entry(SignaturePolicyEntry::required("Reset", Direction::Inbound));
        let engine = engine(policy, keys, Arc::new(ManualClock::new(start())));

        let mut payload = json!({"type": "Hard"});
        engine
            .sign_payload("Reset", Direction::Outbound, &mut payload, Some(&[SigningKey::ed25519("a")]))
            .await
            .unwrap();
        payload["type"] = json!("Soft");

        assert!(matches!(
            engine.verify_payload("Reset", &payload),
            Verdict::Rejected(SignatureError::Invalid { .. })
        ));
    }

    #[test]
    fn test_required_rejects_unsigned_optional_accepts() {
        let keys = Arc::new(InMemoryKeyStore::new());
        let policy = SignaturePolicy::new()
            .with_entry(SignaturePolicyEntry::required("Reset", Direction::Inbound))
            .with_entry(SignaturePolicyEntry::optional("*", Direction::Inbound));
        let engine = engine(policy, keys, Arc::new(ManualClock::new(start())));

        assert_eq!(
            engine.verify_payload("Reset", &json!({"type": "Hard"})),
            Verdict::Rejected(SignatureError::Unsigned)
        );
        assert_eq!(
            engine.verify_payload("Heartbeat", &json!({})),
            Verdict::Accepted(VerificationOutcome::Unsigned)
        );
    }

    #[tokio::test]
    async fn test_optional_reports_invalid_but_accepts() {
        let keys = Arc::new(InMemoryKeyStore::new());
        keys.generate("a");
        let engine = engine(SignaturePolicy::new(), keys, Arc::new(ManualClock::new(start())));

        let mut payload = json!({"vendorId": "ek"});
        engine
            .sign_payload("DataTransfer", Direction::Outbound, &mut payload, Some(&[SigningKey::ed25519("a")]))
            .await
            .unwrap();
        payload["vendorId"] = json!("other");

        assert!(matches!(
            engine.verify_payload("DataTransfer", &payload),
            Verdict::Accepted(VerificationOutcome::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_signer() {
        let keys = Arc::new(InMemoryKeyStore::new());
        keys.generate("intruder");
        keys.generate("csms-root");
        let policy = SignaturePolicy::new()
            .with_entry(SignaturePolicyEntry::required("Reset", Direction::Inbound).with_keys(["csms-root"]));
        let engine = engine(policy, keys, Arc::new(ManualClock::new(start())));

        let mut payload = json!({"type": "Hard"});
        engine
            .sign_payload("Reset", Direction::Outbound, &mut payload, Some(&[SigningKey::ed25519("intruder")]))
            .await
            .unwrap();

        assert_eq!(
            engine.verify_payload("Reset", &payload),
            Verdict::Rejected(SignatureError::Unauthorized(KeyId::from("intruder")))
        );
    }

    #[tokio::test]
    async fn test_sign_then_verify_raw_bytes() {
        let keys = Arc::new(InMemoryKeyStore::new());
        keys.generate("csms-root");
        keys.generate("intruder");
        let policy = SignaturePolicy::new()
            .with_entry(SignaturePolicyEntry::required("Reset", Direction::Inbound).with_keys(["csms-root"]))
            .with_entry(SignaturePolicyEntry::optional("Heartbeat", Direction::Inbound));
        let engine = engine(policy, keys, Arc::new(ManualClock::new(start())));

        let bytes = br#"{"type":"Hard"}"#;
        let trusted = engine.sign(bytes, &[SigningKey::ed25519("csms-root")]).await.unwrap();
        let untrusted = engine.sign(bytes, &[SigningKey::ed25519("intruder")]).await.unwrap();

        assert_eq!(
            engine.verify("Reset", bytes, &trusted),
            Verdict::Accepted(VerificationOutcome::Valid {
                key_ids: vec![KeyId::from("csms-root")]
            })
        );
        assert_eq!(
            engine.verify("Reset", bytes, &untrusted),
            Verdict::Rejected(SignatureError::Unauthorized(KeyId::from("intruder")))
        );
        assert_eq!(engine.verify("Reset", bytes, &[]), Verdict::Rejected(SignatureError::Unsigned));
        assert!(matches!(
            engine.verify("Reset", br#"{"type":"Soft"}"#, &trusted),
            Verdict::Rejected(SignatureError::Invalid { .. })
        ));

        // Optional entries accept any signer and report what they saw
        assert!(engine.verify("Heartbeat", bytes, &untrusted).is_accepted());
        assert!(matches!(
            engine.verify("Heartbeat", b"{}", &untrusted),
            Verdict::Accepted(VerificationOutcome::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_clock_skew() {
        let keys = Arc::new(InMemoryKeyStore::new());
        keys.generate("a");
        let clock = Arc::new(ManualClock::new(start()));
        let policy = SignaturePolicy::new()
            .with_entry(SignaturePolicyEntry::required("Reset", Direction::Inbound))
            .with_max_clock_skew(Duration::from_secs(60));
        let engine = engine(policy, keys, clock.clone());

        let mut payload = json!({"type": "Hard"});
        engine
            .sign_payload("Reset", Direction::Outbound, &mut payload, Some(&[SigningKey::ed25519("a")]))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(30));
        assert!(engine.verify_payload("Reset", &payload).is_accepted());

        clock.advance(chrono::Duration::seconds(60));
        assert!(matches!(
            engine.verify_payload("Reset", &payload),
            Verdict::Rejected(SignatureError::ClockSkew { skew_secs: 90, .. })
        ));
    }

    #[tokio::test]
    async fn test_required_outbound_without_keys() {
        let keys = Arc::new(InMemoryKeyStore::new());
        let policy = SignaturePolicy::new().with_entry(SignaturePolicyEntry::required("Reset", Direction::Outbound));
        let engine = engine(policy, keys, Arc::new(ManualClock::new(start())));

        let mut payload = json!({});
        assert_eq!(
            engine.sign_payload("Reset", Direction::Outbound, &mut payload, None).await,
            Err(SignatureError::NoSigningKey {
                action: "Reset".to_string()
            })
        );
    }

    struct StalledSigner;

    impl KeyProvider for StalledSigner {
        fn keys_for(&self, _context: &SigningContext<'_>) -> Vec<SigningKey> {
            vec![SigningKey::ed25519("remote")]
        }

        fn public_key_for(&self, _key_id: &KeyId) -> Option<ed25519_dalek::VerifyingKey> {
            None
        }

        fn sign<'a>(
            &'a self,
            _key: &'a SigningKey,
            _message: &'a [u8],
        ) -> BoxFuture<'a, Result<ed25519_dalek::Signature, SignatureError>> {
            Box::pin(future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_signing_timeout() {
        let policy = SignaturePolicy::new().with_entry(SignaturePolicyEntry::optional("*", Direction::Outbound));
        let engine = SignaturePolicyEngine::new(
            policy,
            Arc::new(StalledSigner),
            Arc::new(ManualClock::new(start())),
            Duration::from_secs(2),
        );

        let mut payload = json!({});
        assert_eq!(
            engine.sign_payload("Reset", Direction::Outbound, &mut payload, None).await,
            Err(SignatureError::SigningTimeout(KeyId::from("remote")))
        );
    }
}
