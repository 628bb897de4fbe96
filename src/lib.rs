//! Key Access Service core for the ACP-240 rewrap protocol
//!
//! Holds (or brokers access to) data-encryption keys for encrypted objects
//! and releases them only after re-validating the access policy at request
//! time: proof-of-possession token verification, tamper-evident policy
//! bindings, multi-party key-split recombination, federated routing with
//! per-peer circuit breaking, and strictly fail-closed authorization.

pub mod audit;
pub mod binding;
pub mod cache;
pub mod config;
pub mod decision;
pub mod error;
pub mod federation;
pub mod kms;
pub mod metadata;
pub mod policy;
pub mod protocol;
pub mod ratelimit;
pub mod rewrap;
pub mod split;
pub mod token;

pub use audit::{AuditEvent, AuditLogger, AuditSink, AuditVerdict, MemorySink, TracingSink};
pub use cache::DecisionCache;
pub use config::KasConfig;
pub use decision::{DecisionClient, DecisionPoint, HttpDecisionPoint, Verdict};
pub use error::{ErrorKind, KasError};
pub use federation::{
    BreakerConfig, BreakerState, CircuitBreaker, FederationPeer, FederationRouter,
    HttpPeerTransport, PeerTransport, TrustLevel,
};
pub use kms::{ClientKey, ClientKeypair, KeyBackend, KeyType, RewrapSession, SoftwareKeyBackend};
pub use policy::{Classification, Policy};
pub use protocol::{
    KaoResult, KaoStatus, KeyAccessObject, PeerRewrapRequest, PeerRewrapResponse, PolicyBinding,
    RewrapEntry, RewrapRequest, RewrapResponse,
};
pub use rewrap::{RequestMeta, RewrapService};
pub use split::SplitMode;
pub use token::{Subject, TokenVerifier};
