//! Request Admission Control
//!
//! Every inbound request passes through one chain before reaching a handler:
//! bearer token verification, partition key resolution, account tier lookup
//! and a fixed-window admission check. The outcome is either a forward with
//! the verified claim or a rejection with a stable error code and rate-limit
//! metadata.

pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod service;
pub mod tier;
pub mod token;
pub mod utils;

// Re-export main types
pub use cache::{CounterStore, MemoryCounterStore};
pub use config::{EndpointClass, Settings};
pub use error::{AdmissionError, Result};
pub use service::{AdmissionChain, AdmissionRequest, AuthMode, ErrorCode, Outcome};
pub use tier::{Tier, TierLookup};
pub use token::{Claim, Role, TokenVerifier};
