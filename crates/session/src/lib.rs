//! Session storage for the dashboard gateway
//!
//! A session is three fields: a short-lived access token, a long-lived
//! refresh token, and the numeric id of the signed-in user. The two tokens
//! are only ever written to channels that untrusted client code cannot read
//! (`HttpOnly` cookies, an owner-only file, or private process memory). The
//! user id is not a secret and is readable everywhere.
//!
//! Every store implements [`SessionStore`]:
//! - [`MemorySessionStore`] keeps the session in process memory
//! - [`FileSessionStore`] persists it to a `0600` JSON file
//! - [`CookieSessionStore`] is a per-request view over the inbound `Cookie`
//!   header that records `Set-Cookie` directives for the response

pub mod cookie;
pub mod error;
pub mod file;
pub mod model;
pub mod store;

pub use cookie::{
    ACCESS_COOKIE, CookiePolicy, CookieSessionStore, REFRESH_COOKIE, SUBJECT_COOKIE, SameSite,
};
pub use error::{Error, Result};
pub use file::FileSessionStore;
pub use model::Session;
pub use store::{MemorySessionStore, SessionStore, StoreFuture};
