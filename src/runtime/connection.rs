//! Connection state machine.
//!
//! One accepted connection runs one request/response episode:
//!
//! ```text
//! Receiving -> Parsing -> Dispatching -> Sending -> SendingMore* -> Closing
//! ```
//!
//! Receiving fills the context's receive region until a line terminator
//! shows up, the peer closes, or the region is full. Dispatching runs on a
//! blocking worker thread. Sending copies at most one send region per write
//! and loops through `SendingMore` until the whole response is out.

use crate::dispatch::CommandOutput;
use crate::response::{error_page, frame_or_error};
use crate::router::{command_names, parse_request, Router};
use crate::runtime::context::{OperationContext, PendingResponse};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Current phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading the request into the receive region.
    Receiving,
    /// Decoding the request line.
    Parsing,
    /// Waiting on the dispatcher.
    Dispatching,
    /// First write of the response.
    Sending,
    /// Continuation writes for responses larger than one send region.
    SendingMore,
    /// Shutting the socket down.
    Closing,
}

/// Summary of a finished episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// A response was fully written.
    pub responded: bool,
    /// Number of write calls issued.
    pub sends: usize,
    /// Bytes accepted by the socket.
    pub bytes_sent: usize,
}

/// Drive one request/response episode on `stream`.
///
/// Socket errors never escape: they end the episode in `Closing`. The
/// caller still owns `ctx` afterwards and returns it to its pool.
pub async fn serve<S>(
    stream: &mut S,
    ctx: &mut OperationContext,
    router: &Arc<Router>,
    io_timeout: Duration,
) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outcome = Outcome::default();
    let mut state = ConnState::Receiving;
    let context = ctx.id();

    loop {
        trace!(context, ?state, "Connection state");
        state = match state {
            ConnState::Receiving => match receive(stream, ctx, io_timeout).await {
                Ok(true) => ConnState::Parsing,
                Ok(false) => {
                    trace!(context, "Peer closed before sending a request");
                    ConnState::Closing
                }
                Err(e) => {
                    debug!(context, error = %e, "Receive failed");
                    ConnState::Closing
                }
            },

            ConnState::Parsing => match parse_request(ctx.received_bytes()) {
                Ok(request) => {
                    ctx.request_line = request;
                    ConnState::Dispatching
                }
                Err(e) => {
                    debug!(context, error = %e, "Malformed request");
                    ConnState::Closing
                }
            },

            ConnState::Dispatching => {
                let output = dispatch(router, &ctx.request_line).await;
                let framed = frame_or_error(&command_names(&ctx.request_line), &output);
                debug!(
                    context,
                    request = %ctx.request_line,
                    status = output.status,
                    len = framed.len(),
                    "Request dispatched"
                );
                ctx.pending = Some(PendingResponse::new(framed));
                ctx.sent = 0;
                ConnState::Sending
            }

            ConnState::Sending | ConnState::SendingMore => {
                match send_chunk(stream, ctx, io_timeout).await {
                    Ok(n) => {
                        outcome.sends += 1;
                        outcome.bytes_sent += n;
                        match ctx.pending.as_ref() {
                            Some(pending) if !pending.is_done() => ConnState::SendingMore,
                            _ => {
                                outcome.responded = true;
                                ConnState::Closing
                            }
                        }
                    }
                    Err(e) => {
                        debug!(context, error = %e, sent = ctx.sent, "Send failed");
                        ConnState::Closing
                    }
                }
            }

            ConnState::Closing => {
                if let Err(e) = stream.shutdown().await {
                    trace!(context, error = %e, "Shutdown failed");
                }
                return outcome;
            }
        };
    }
}

/// Read until a full request line is buffered.
///
/// Returns `false` when the peer closed without sending anything.
async fn receive<S>(stream: &mut S, ctx: &mut OperationContext, io_timeout: Duration) -> io::Result<bool>
where
    S: AsyncRead + Unpin,
{
    loop {
        let filled = ctx.received;
        let buf = &mut ctx.slice_mut().receive_mut()[filled..];
        if buf.is_empty() {
            // Region full: parse what we have.
            return Ok(true);
        }

        let n = tokio::time::timeout(io_timeout, stream.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "receive timed out"))??;
        if n == 0 {
            return Ok(ctx.received > 0);
        }

        ctx.received += n;
        if ctx.received_bytes()[filled..].contains(&b'\n') {
            return Ok(true);
        }
    }
}

/// Copy the next chunk into the send region and write it once.
async fn send_chunk<S>(stream: &mut S, ctx: &mut OperationContext, io_timeout: Duration) -> io::Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let mut pending = ctx
        .pending
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no pending response"))?;

    let len = pending.fill(ctx.slice_mut().send_mut());
    let result = match tokio::time::timeout(io_timeout, stream.write(&ctx.slice().send()[..len])).await {
        Ok(Ok(0)) if len > 0 => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
    };

    if let Ok(written) = result {
        pending.advance(written);
        ctx.sent += written;
    }
    ctx.pending = Some(pending);
    result
}

/// Run the router on a blocking worker.
///
/// The router turns handler panics into error pages itself; a lost worker
/// still gets a 500 page.
async fn dispatch(router: &Arc<Router>, request: &str) -> CommandOutput {
    let router = Arc::clone(router);
    let request_owned = request.to_string();

    match tokio::task::spawn_blocking(move || router.route(&request_owned)).await {
        Ok(output) => output,
        Err(e) => {
            warn!(request, error = %e, "Dispatch worker failed");
            CommandOutput::status(
                500,
                error_page(&command_names(request), "", 500, "command handler panicked"),
            )
        }
    }
}
