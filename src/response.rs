//! Response framing.
//!
//! Every response is a status line, a fixed header block and the body. The
//! connection is always closed afterwards, so there is no keep-alive or
//! chunked encoding.

use crate::dispatch::{CommandOutput, ContentKind};
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Value of the `Server` header.
pub const SERVER_TOKEN: &str = concat!("remote-core/", env!("CARGO_PKG_VERSION"));

/// Framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid base64 image body: {0}")]
    InvalidImage(#[from] base64::DecodeError),
}

/// Build the wire bytes for `output`.
///
/// Image bodies are base64-decoded before `Content-Length` is computed.
pub fn frame(output: &CommandOutput) -> Result<Bytes, FrameError> {
    let decoded;
    let body: &[u8] = match output.kind {
        ContentKind::Image(_) => {
            decoded = base64::engine::general_purpose::STANDARD.decode(output.body.trim())?;
            &decoded
        }
        ContentKind::Html | ContentKind::Json => output.body.as_bytes(),
    };

    let header = format!(
        "HTTP/1.1 {} {}\r\nServer: {}\r\nContent-Type: {}\r\nAccept-Ranges: bytes\r\nContent-Length: {}\r\n\r\n",
        output.status,
        reason(output.status),
        SERVER_TOKEN,
        output.kind.mime(),
        body.len()
    );

    let mut response = BytesMut::with_capacity(header.len() + body.len());
    response.put_slice(header.as_bytes());
    response.put_slice(body);
    Ok(response.freeze())
}

/// Frame `output`, falling back to a 500 page when the body cannot be framed.
pub fn frame_or_error(command: &str, output: &CommandOutput) -> Bytes {
    match frame(output) {
        Ok(bytes) => bytes,
        Err(e) => {
            let page = CommandOutput::status(500, error_page(command, "", 500, &e.to_string()));
            // HTML bodies always frame.
            frame(&page).unwrap_or_default()
        }
    }
}

/// Human readable error page naming the command, its parameters and status.
pub fn error_page(command: &str, param: &str, status: u16, message: &str) -> String {
    format!(
        "<h1>Error {} {}</h1><pre>command: {}\nparams: {}\nmessage: {}</pre>",
        status,
        reason(status),
        html_escape::encode_text(command),
        html_escape::encode_text(param),
        html_escape::encode_text(message)
    )
}

/// Reason phrase for the status line.
pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
