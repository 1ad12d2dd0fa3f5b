//! Dialect translation and upstream dispatch.
//!
//! The relay rewrites Claude-style chat requests into the Gemini-style
//! internal RPC body, sends them with endpoint failover, and reframes the
//! upstream SSE stream back into the Claude wire format.

pub mod claude;
pub mod dispatch;
pub mod gemini;
pub mod signatures;
pub mod sse;
pub mod transform;

pub use dispatch::UpstreamDispatcher;
pub use signatures::SignatureStore;
pub use transform::{transform_request, TransformOutput};
