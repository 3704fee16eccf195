//! cl-tunnel command line support
//!
//! Everything the `cl-tunnel` binary needs around the ingress engine: where
//! files live, the CLI identity document, the `cloudflared` adapter and the
//! platform service supervisors.

pub mod cloudflared;
mod command;
pub mod descriptor;
pub mod identity;
pub mod listing;
pub mod paths;
pub mod service;

pub use cloudflared::Cloudflared;
pub use identity::{IdentityDocument, IdentityStore};
pub use paths::CliPaths;
pub use service::{detect, LaunchdSupervisor, Platform, SystemdSupervisor};
