pub mod guard;
pub mod media;
pub mod normalize;
pub mod request;
pub mod retry;
pub mod types;

pub use guard::{CallKind, ConcurrencyGuard};
pub use retry::{ReqwestTransport, RetryPolicy, Transport};
