//! Seam between the lifecycle manager and the gateway
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn Transport>`), so tests can script upstream behavior without a
//! network.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::Secret;
use gateway::{
    Gateway, NormalizedError, RelayRequest, SignInPayload, SignInRequest, SignOutOutcome,
    TokenPair, UpstreamResult,
};
use session::SessionStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything the lifecycle manager needs from the upstream side.
pub trait Transport: Send + Sync {
    /// Relay one call with the current access credential attached.
    fn send(&self, request: RelayRequest) -> BoxFuture<'_, UpstreamResult>;

    /// Recovery exchange: refresh credential in, new token pair out.
    fn recover<'a>(
        &'a self,
        refresh: &'a Secret<String>,
    ) -> BoxFuture<'a, Result<TokenPair, NormalizedError>>;

    fn sign_in<'a>(
        &'a self,
        credentials: &'a SignInRequest,
    ) -> BoxFuture<'a, Result<SignInPayload, NormalizedError>>;

    /// Best-effort upstream sign-out.
    fn sign_out<'a>(&'a self, access: Option<&'a Secret<String>>) -> BoxFuture<'a, SignOutOutcome>;
}

/// In-process transport: relays through a [`Gateway`] that resolves the
/// access credential from the shared session store.
pub struct GatewayTransport {
    gateway: Gateway,
    store: Arc<dyn SessionStore>,
}

impl GatewayTransport {
    pub fn new(gateway: Gateway, store: Arc<dyn SessionStore>) -> Self {
        Self { gateway, store }
    }
}

impl Transport for GatewayTransport {
    fn send(&self, request: RelayRequest) -> BoxFuture<'_, UpstreamResult> {
        Box::pin(async move { self.gateway.relay(self.store.as_ref(), request).await })
    }

    fn recover<'a>(
        &'a self,
        refresh: &'a Secret<String>,
    ) -> BoxFuture<'a, Result<TokenPair, NormalizedError>> {
        Box::pin(self.gateway.recover(refresh))
    }

    fn sign_in<'a>(
        &'a self,
        credentials: &'a SignInRequest,
    ) -> BoxFuture<'a, Result<SignInPayload, NormalizedError>> {
        Box::pin(self.gateway.sign_in(credentials))
    }

    fn sign_out<'a>(&'a self, access: Option<&'a Secret<String>>) -> BoxFuture<'a, SignOutOutcome> {
        Box::pin(self.gateway.sign_out(access))
    }
}
