//! Request parsing and command routing.
//!
//! Requests look like `GET /<command>[ <params>][/<command2>...] HTTP/x.x`.
//! The target is URL-decoded and split into `(command, param)` segments,
//! which are executed in order with their bodies concatenated.
//!
//! Two commands are handled here rather than by the dispatcher:
//! - `help`: lists every command with its syntax
//! - `format <template>`: re-renders the body produced so far

use crate::dispatch::{CommandOutput, ContentKind, DispatchError, Dispatcher, Templates};
use crate::response::error_page;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Request method marker.
const REQUEST_MARKER: &str = "GET ";

/// Start of the trailing protocol-version token.
const VERSION_MARKER: &str = " HTTP/";

pub const HELP_COMMAND: &str = "help";
pub const FORMAT_COMMAND: &str = "format";

/// Malformed request lines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request is not valid UTF-8")]
    InvalidUtf8,
    #[error("request does not start with GET")]
    MissingMarker,
    #[error("request has no HTTP version")]
    MissingVersion,
}

/// Extract the request target from raw request bytes.
///
/// Only the first line is looked at. The returned string starts after the
/// leading `/` and still ends with the ` HTTP/x.x` token.
pub fn parse_request(raw: &[u8]) -> Result<String, RequestError> {
    let text = std::str::from_utf8(raw).map_err(|_| RequestError::InvalidUtf8)?;
    let line = text.lines().next().unwrap_or("").trim_end_matches('\r');

    let target = line
        .strip_prefix(REQUEST_MARKER)
        .ok_or(RequestError::MissingMarker)?;
    if !target.contains(VERSION_MARKER) {
        return Err(RequestError::MissingVersion);
    }

    let target = target.trim_start();
    Ok(target.strip_prefix('/').unwrap_or(target).to_string())
}

/// One `(command, param)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub command: String,
    pub param: String,
}

/// Split a request target into command segments.
///
/// The version token is stripped, the rest is URL-decoded, only the text
/// after the last `?` is kept, and it is split on `/`. Each segment is split
/// on its first space into command and parameter.
pub fn split_commands(request: &str) -> Vec<Segment> {
    let target = match request.rfind(VERSION_MARKER) {
        Some(pos) => &request[..pos],
        None => request,
    };

    let decoded = urlencoding::decode(target)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| target.to_string());

    let query = match decoded.rfind('?') {
        Some(pos) => &decoded[pos + 1..],
        None => decoded.as_str(),
    };

    query
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once(' ') {
            Some((command, param)) => Segment {
                command: command.to_string(),
                param: param.trim().to_string(),
            },
            None => Segment {
                command: s.to_string(),
                param: String::new(),
            },
        })
        .collect()
}

/// Decoded command names of `request`, joined with `/`.
pub fn command_names(request: &str) -> String {
    split_commands(request)
        .into_iter()
        .map(|s| s.command)
        .collect::<Vec<_>>()
        .join("/")
}

/// Routes decoded requests to the dispatcher and the local commands.
pub struct Router {
    dispatcher: Arc<dyn Dispatcher>,
    templates: Arc<dyn Templates>,
}

impl Router {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, templates: Arc<dyn Templates>) -> Self {
        Self {
            dispatcher,
            templates,
        }
    }

    /// Execute every segment of `request` and merge the results.
    ///
    /// The first failing segment ends the chain; its error page is appended
    /// to what the earlier segments produced. Image output is binary and
    /// only allowed as the sole command of a request.
    pub fn route(&self, request: &str) -> CommandOutput {
        let mut segments = split_commands(request);
        if segments.is_empty() {
            segments.push(Segment {
                command: HELP_COMMAND.to_string(),
                param: String::new(),
            });
        }
        let chained = segments.len() > 1;

        let mut merged = CommandOutput::html(String::new());
        for segment in &segments {
            trace!(command = %segment.command, param = %segment.param, "Routing segment");

            let (status, message) = match self.run_segment(segment, &merged.body) {
                Ok(output) if output.is_success() => {
                    if chained && matches!(output.kind, ContentKind::Image(_)) {
                        (400, "image output cannot be chained with other commands".to_string())
                    } else {
                        merged.status = output.status;
                        if segment.command.eq_ignore_ascii_case(FORMAT_COMMAND) {
                            merged.body = output.body;
                        } else {
                            merged.body.push_str(&output.body);
                        }
                        merged.kind = output.kind;
                        continue;
                    }
                }
                Ok(output) => {
                    debug!(command = %segment.command, status = output.status, "Command failed");
                    (output.status, output.body)
                }
                Err(e) => {
                    debug!(command = %segment.command, error = %e, "Command raised an error");
                    let status = match e {
                        DispatchError::UnknownCommand(_) | DispatchError::UnknownTemplate(_) => 404,
                        DispatchError::InvalidParam(_) => 400,
                        DispatchError::Failed(_) => 500,
                    };
                    (status, e.to_string())
                }
            };

            merged.status = status;
            merged.kind = ContentKind::Html;
            merged
                .body
                .push_str(&error_page(&segment.command, &segment.param, status, &message));
            break;
        }

        merged
    }

    fn run_segment(&self, segment: &Segment, body: &str) -> Result<CommandOutput, DispatchError> {
        if segment.command.eq_ignore_ascii_case(HELP_COMMAND) {
            return Ok(CommandOutput::html(self.help()));
        }
        if segment.command.eq_ignore_ascii_case(FORMAT_COMMAND) {
            if segment.param.is_empty() {
                return Err(DispatchError::InvalidParam(
                    "format needs a template name".to_string(),
                ));
            }
            return self
                .templates
                .render(&segment.param, body)
                .map(CommandOutput::html);
        }

        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatcher.dispatch(&segment.command, &segment.param)
        }));
        dispatched.unwrap_or_else(|_| {
            warn!(command = %segment.command, "Command handler panicked");
            Err(DispatchError::Failed("command handler panicked".to_string()))
        })
    }

    /// HTML listing of the local and registered commands.
    pub fn help(&self) -> String {
        let mut page = String::from("<h1>Connection Commands</h1><pre>");
        page.push_str("help                  - list all commands\n");
        page.push_str("format &lt;template&gt;     - render the output so far through a template\n");
        page.push_str("cmd1/cmd2 ...         - chain commands, output is concatenated\n");
        page.push_str("</pre>");

        let mut groups: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for info in self.dispatcher.commands() {
            groups.entry(info.group.clone()).or_default().push(info);
        }

        for (group, commands) in groups {
            page.push_str(&format!("<h1>{}</h1><pre>", html_escape::encode_text(&group)));
            for info in commands {
                page.push_str(&format!(
                    "{:<21} - {}\n",
                    html_escape::encode_text(&info.name),
                    html_escape::encode_text(&info.syntax)
                ));
            }
            page.push_str("</pre>");
        }
        page
    }
}
