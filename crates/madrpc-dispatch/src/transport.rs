//! Transport seam.
//!
//! The wire protocol lives outside this crate. A [`Transport`] issues one
//! resource's call and later reports the outcome through
//! [`Reply::on_result`](crate::reply::Reply::on_result), from whatever thread
//! its I/O completes on.

use crate::reply::Reply;
use crate::resource::CallResource;
use madrpc_common::protocol::error::{MadrpcError, Result};
use std::sync::Arc;

/// A long-lived streaming call that resources can be bound to.
pub trait CallStream: Send + Sync {
    /// Identifier used in logs.
    fn stream_id(&self) -> u64;
}

/// Issues provider calls.
///
/// Implementations must not block on the network inside `issue`; the call is
/// started and the answer is delivered to `reply` asynchronously (or inline,
/// for in-memory transports).
pub trait Transport: Send + Sync {
    /// Starts the call described by `resource`.
    ///
    /// # Errors
    ///
    /// Returns an error if the call could not be started at all. The caller
    /// records that as a failed answer for the resource's slot.
    fn issue(&self, resource: &CallResource, reply: &Arc<Reply>) -> Result<()>;

    /// Binds `resource` to a streaming call.
    fn bind(&self, resource: &CallResource, stream: &Arc<dyn CallStream>) -> Result<()> {
        let _ = (resource, stream);
        Err(MadrpcError::Unsupported(
            "streaming bind is not supported by this transport".to_string(),
        ))
    }
}
