//! Message signatures
//!
//! - `keys`: key handles and the [`KeyProvider`] capability
//! - `policy`: per `(action, direction)` signing rules
//! - `engine`: key selection, signing and verification

pub mod engine;
pub mod keys;
pub mod policy;

pub use engine::{
    canonical_bytes, extract_signatures, Signature, SignatureError, SignaturePolicyEngine, Verdict,
    VerificationOutcome, SIGNATURES_FIELD,
};
pub use keys::{InMemoryKeyStore, KeyId, KeyProvider, SigningContext, SigningKey, ED25519};
pub use policy::{Direction, Requirement, SignaturePolicy, SignaturePolicyEntry, ANY_ACTION};
