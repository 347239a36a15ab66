//! Request/response exchange with external cancellation.

use sipflow_sip_core::{Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layer::TransactionLayer;

/// Send `req` as a new client transaction and wait for its final response.
///
/// Provisional responses are handed to `on_provisional`, skipping repeats
/// of the same status and reason. A 2xx is returned as is and any other
/// final response becomes [`Error::RequestFailed`]. Timeouts and transport
/// failures of the transaction are returned as reported by it.
///
/// Canceling `cancel` sends a CANCEL for the request (INVITE only) and keeps
/// waiting: the final response, usually a 487, still ends the exchange. If
/// the transaction ends without any final response the result is
/// [`Error::RequestTerminated`].
pub async fn request_with_cancellation<F>(
    layer: &TransactionLayer,
    req: Request,
    cancel: CancellationToken,
    mut on_provisional: F,
) -> Result<Response>
where
    F: FnMut(&Response),
{
    let tx = layer.request(req).await?;
    let terminated = || Error::Terminated { key: tx.key().clone() };
    let mut responses = tx.take_responses().ok_or_else(terminated)?;
    let mut errors = tx.take_errors().ok_or_else(terminated)?;

    let mut canceled = false;
    let mut last_provisional: Option<(u16, String)> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !canceled => {
                canceled = true;
                debug!(key = %tx.key(), "canceling {}", tx.origin().short());
                tx.cancel().await?;
            }
            res = responses.recv() => match res {
                Some(res) if res.is_provisional() => {
                    let seen = (res.status, res.reason.clone());
                    if last_provisional.as_ref() != Some(&seen) {
                        on_provisional(&res);
                        last_provisional = Some(seen);
                    }
                }
                Some(res) if res.is_success() => return Ok(res),
                Some(res) => {
                    return Err(Error::RequestFailed {
                        status: res.status,
                        reason: res.reason,
                    })
                }
                None => {
                    // Deletion closes both queues; an error may still be pending
                    return Err(errors.try_recv().unwrap_or(Error::RequestTerminated));
                }
            },
            Some(err) = errors.recv() => return Err(err),
        }
    }
}
