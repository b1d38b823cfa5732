//! Token lifecycle manager and typed API wrapper
//!
//! Application code calls [`ApiClient`]; every call flows through the
//! [`LifecycleManager`], which relays it via a [`Transport`] and, on a 401,
//! performs one recovery exchange and replays the call once.
//!
//! Per-call flow:
//! 1. `Initial → Sent`: relay the call
//! 2. 2xx → done; other non-401 → done with a pass-through error
//! 3. 401 on the first attempt → `Expired → Recovering`; concurrent callers
//!    join the one recovery already in flight through [`RecoveryGate`]
//! 4. recovery succeeded → `Resent` with the new token; its outcome is final
//! 5. recovery failed → session cleared, [`SessionEvent::Expired`] broadcast,
//!    caller gets `RECOVERY_FAILED`

pub mod api;
pub mod error;
pub mod events;
pub mod gate;
pub mod lifecycle;
pub mod transport;

pub use api::{ApiClient, ApiResponse, RequestOptions};
pub use error::{ApiError, ApiResult};
pub use events::SessionEvent;
pub use gate::RecoveryGate;
pub use lifecycle::{CallAction, CallContext, CallEvent, CallState, LifecycleManager, handle_event};
pub use transport::{BoxFuture, GatewayTransport, Transport};
