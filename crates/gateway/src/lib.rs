//! Credential-injecting gateway
//!
//! The gateway is the only component that reads the real access token and
//! the only component that talks to the upstream backend. Each relay:
//! 1. resolves the access token from a [`session::SessionStore`]
//! 2. attaches it as `Authorization: Bearer ...` (or omits it when absent)
//! 3. forwards method, path, query, and body under the fixed upstream base
//! 4. returns the upstream status and JSON body, or a [`NormalizedError`]
//!
//! The gateway never interprets business success or failure; it only checks
//! that the upstream answered with JSON and that the call reached it at all.

pub mod auth;
pub mod error;
pub mod relay;
pub mod response;

pub use auth::{Endpoints, SignInPayload, SignInRequest, SignOutOutcome, TokenPair};
pub use error::{NormalizedError, codes};
pub use relay::{Gateway, RelayRequest, checked_path, is_hop_by_hop, join_upstream_url};
pub use response::{NormalizedResponse, RelayResponse, UpstreamBody, UpstreamResult};
