//! Cookie-backed session view for the gateway service
//!
//! In the browser deployment the session lives in three cookies:
//! - `accessToken` and `refreshToken` are `HttpOnly`, so page scripts cannot
//!   read them; only the gateway sees them on inbound requests
//! - `userId` is a plain cookie so client code can address "the current user"
//!
//! A [`CookieSessionStore`] is built per inbound request from its `Cookie`
//! header. Reads come from that header; writes and clears update the view and
//! queue `Set-Cookie` values that the handler attaches to its response.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::Session;
use crate::store::{SessionStore, StoreFuture};

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";
pub const SUBJECT_COOKIE: &str = "userId";

/// `SameSite` attribute for session cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Attributes applied to every session cookie.
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    pub path: String,
    pub secure: bool,
    pub same_site: SameSite,
    pub access_max_age: Duration,
    pub refresh_max_age: Duration,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self {
            path: "/".into(),
            secure: true,
            same_site: SameSite::Lax,
            access_max_age: Duration::from_secs(15 * 60),
            refresh_max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl CookiePolicy {
    fn render(&self, name: &str, value: &str, max_age: Duration, http_only: bool) -> String {
        let mut cookie = format!(
            "{name}={value}; Path={}; Max-Age={}; SameSite={}",
            self.path,
            max_age.as_secs(),
            self.same_site.as_str()
        );
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` values establishing a session.
    ///
    /// Token values go into the header verbatim, so anything outside the
    /// cookie-octet set is refused rather than escaped.
    pub fn session_cookies(&self, session: &Session) -> Result<Vec<String>> {
        for (name, value) in [
            (ACCESS_COOKIE, session.access.expose()),
            (REFRESH_COOKIE, session.refresh.expose()),
        ] {
            if value.is_empty() || !value.bytes().all(is_cookie_octet) {
                return Err(Error::InvalidValue(format!(
                    "{name} contains characters not allowed in a cookie"
                )));
            }
        }
        Ok(vec![
            self.render(
                ACCESS_COOKIE,
                session.access.expose(),
                self.access_max_age,
                true,
            ),
            self.render(
                REFRESH_COOKIE,
                session.refresh.expose(),
                self.refresh_max_age,
                true,
            ),
            self.render(
                SUBJECT_COOKIE,
                &session.subject_id.to_string(),
                self.refresh_max_age,
                false,
            ),
        ])
    }

    /// `Set-Cookie` values expiring all three cookies.
    pub fn clearing_cookies(&self) -> Vec<String> {
        vec![
            self.render(ACCESS_COOKIE, "", Duration::ZERO, true),
            self.render(REFRESH_COOKIE, "", Duration::ZERO, true),
            self.render(SUBJECT_COOKIE, "", Duration::ZERO, false),
        ]
    }
}

/// RFC 6265 `cookie-octet`: visible ASCII minus `"`, `,`, `;` and `\`.
fn is_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}

/// Find a cookie value in a `Cookie` request header.
///
/// Empty values count as absent, since cleared cookies may linger with an
/// empty value until the browser drops them.
pub fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

#[derive(Default)]
struct CookieState {
    access: Option<Secret<String>>,
    refresh: Option<Secret<String>>,
    subject_id: Option<u64>,
    pending: Vec<String>,
}

/// Per-request session store over the inbound `Cookie` header.
///
/// Fields are read independently: the browser expires the access cookie
/// long before the refresh cookie, so a request may legitimately carry only
/// `refreshToken` and `userId`.
pub struct CookieSessionStore {
    policy: CookiePolicy,
    state: Mutex<CookieState>,
}

impl CookieSessionStore {
    pub fn from_cookie_header(header: Option<&str>, policy: CookiePolicy) -> Self {
        let header = header.unwrap_or_default();
        let state = CookieState {
            access: find_cookie(header, ACCESS_COOKIE).map(Secret::from),
            refresh: find_cookie(header, REFRESH_COOKIE).map(Secret::from),
            subject_id: find_cookie(header, SUBJECT_COOKIE).and_then(|v| v.parse().ok()),
            pending: Vec::new(),
        };
        Self {
            policy,
            state: Mutex::new(state),
        }
    }

    /// Drain the `Set-Cookie` values queued by writes and clears.
    pub async fn take_set_cookies(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().await.pending)
    }
}

impl SessionStore for CookieSessionStore {
    fn write(&self, session: Session) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let cookies = self.policy.session_cookies(&session)?;
            state.pending.extend(cookies);
            state.access = Some(session.access.clone());
            state.refresh = Some(session.refresh.clone());
            state.subject_id = Some(session.subject_id);
            Ok(())
        })
    }

    fn read_access_credential(&self) -> StoreFuture<'_, Option<Secret<String>>> {
        Box::pin(async move { self.state.lock().await.access.clone() })
    }

    fn read_refresh_credential(&self) -> StoreFuture<'_, Option<Secret<String>>> {
        Box::pin(async move { self.state.lock().await.refresh.clone() })
    }

    fn read_subject_id(&self) -> StoreFuture<'_, Option<u64>> {
        Box::pin(async move { self.state.lock().await.subject_id })
    }

    fn clear(&self) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let cookies = self.policy.clearing_cookies();
            state.pending.extend(cookies);
            state.access = None;
            state.refresh = None;
            state.subject_id = None;
            Ok(())
        })
    }
}
