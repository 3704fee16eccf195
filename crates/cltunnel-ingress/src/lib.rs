//! Transactional ingress configuration engine for cloudflared tunnels
//!
//! Applies structural changes to a cloudflared `config.yml`, validates the
//! result against the document schema and against cloudflared's own linter,
//! and keeps the file on disk consistent with the routes registered upstream.
//!
//! # Flow
//!
//! ```text
//! config.yml ──▶ document (snapshot + parse) ──▶ schema gate
//!                                                   │
//!          rules (add/remove + normalize) ◀─────────┘
//!                     │
//!                     ▼
//!          serialize ──▶ schema gate ──▶ persist ──▶ semantic gate (cloudflared)
//!                                                        │
//!                          register route (add only) ◀───┘
//!                                   │
//!                                   ▼
//!                         restart service ──▶ committed
//!
//! any failure after persist ──▶ restore snapshot (and re-apply service)
//! ```
//!
//! The external collaborators (`cloudflared`, launchd/systemd) are consumed
//! through the traits in [`external`]; concrete implementations live in the
//! CLI crate.

pub mod document;
pub mod error;
pub mod external;
pub mod input;
pub mod rules;
pub mod schema;
pub mod transaction;

pub use document::{IngressDocument, IngressRule, ServiceTarget, Snapshot};
pub use error::{DocumentError, IngressError, InputError, InputErrors, RuleSetError};
pub use external::{
    ExternalError, LogPaths, LogStream, RouteRegistrar, SemanticValidator, ServiceSupervisor,
};
pub use input::{validate_domain, validate_new_entry, validate_subdomain, NewEntry};
pub use rules::RuleSet;
pub use schema::{SchemaViolation, SchemaViolations};
pub use transaction::{
    FailureCause, Mutation, RollbackFailure, RollbackOutcome, TransactionCoordinator,
    TransactionError, TransactionReceipt, TransactionState,
};
