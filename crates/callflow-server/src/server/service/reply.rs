//! Business logic behind `HandleRequest`.
//!
//! The engine validates each request and then asks a [`ReplyHandler`] for the
//! reply. [`DispatchHandler`] is the stock handler; any
//! `Fn(&RequestMessage) -> Result<ReplyMessage>` closure works as well.

use callflow_core::{
    Error, Result,
    proto::{ReplyMessage, RequestMessage},
    types::REPLY_PREFIX,
};

/// Computes the reply for one request. Runs on a dispatch loop, so it must
/// not block.
pub trait ReplyHandler: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any error is reported to the client in place of a reply; other calls
    /// are unaffected.
    fn handle(&self, request: &RequestMessage) -> Result<ReplyMessage>;
}

impl<F> ReplyHandler for F
where
    F: Fn(&RequestMessage) -> Result<ReplyMessage> + Send + Sync + 'static,
{
    fn handle(&self, request: &RequestMessage) -> Result<ReplyMessage> {
        self(request)
    }
}

/// Prefixes the request string with `"Dispatched "`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchHandler;

impl ReplyHandler for DispatchHandler {
    fn handle(&self, request: &RequestMessage) -> Result<ReplyMessage> {
        Ok(ReplyMessage {
            reply_string: format!("{REPLY_PREFIX}{}", request.request_string),
        })
    }
}

/// Rejects empty requests and requests longer than `max_request_bytes`.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] describing the violated bound.
pub fn validate_request(request: &RequestMessage, max_request_bytes: usize) -> Result<()> {
    let len = request.request_string.len();

    if len == 0 {
        return Err(Error::InvalidRequest {
            reason: "request_string must not be empty".to_string(),
        });
    }

    if len > max_request_bytes {
        return Err(Error::InvalidRequest {
            reason: format!(
                "request_string is {len} bytes, exceeds maximum allowed ({max_request_bytes})"
            ),
        });
    }

    Ok(())
}
