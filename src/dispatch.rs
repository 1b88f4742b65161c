//! Command collaborator contracts.
//!
//! The server core never interprets commands. It hands every
//! `(command, param)` pair to a [`Dispatcher`] and frames whatever comes back.
//! [`CommandTable`] is a ready-made dispatcher built from closures, and
//! [`TemplateSet`] backs the `format` command.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// How a command body is framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContentKind {
    /// `text/html;charset=utf-8`
    #[default]
    Html,
    /// `application/json`
    Json,
    /// `image/<subtype>`; the body is base64 text.
    Image(String),
}

impl ContentKind {
    pub fn mime(&self) -> String {
        match self {
            ContentKind::Html => "text/html;charset=utf-8".to_string(),
            ContentKind::Json => "application/json".to_string(),
            ContentKind::Image(subtype) => format!("image/{}", subtype),
        }
    }
}

/// Result of one dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: u16,
    pub kind: ContentKind,
    pub body: String,
}

impl CommandOutput {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            kind: ContentKind::Html,
            body: body.into(),
        }
    }

    pub fn json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            kind: ContentKind::Json,
            body: body.into(),
        }
    }

    /// An image given as base64 text.
    pub fn image(subtype: impl Into<String>, base64: impl Into<String>) -> Self {
        Self {
            status: 200,
            kind: ContentKind::Image(subtype.into()),
            body: base64.into(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            kind: ContentKind::Html,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures raised by command collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("{0}")]
    Failed(String),
}

/// Help metadata for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: String,
    pub syntax: String,
    pub group: String,
}

/// Executes commands on behalf of the router.
///
/// Calls run on a blocking worker thread, never on the accept loop.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, command: &str, param: &str) -> Result<CommandOutput, DispatchError>;

    /// Registered commands, for the help listing.
    fn commands(&self) -> Vec<CommandInfo>;
}

/// Renders a previously produced body through a named template.
pub trait Templates: Send + Sync + 'static {
    fn render(&self, template: &str, body: &str) -> Result<String, DispatchError>;
}

type Handler = Box<dyn Fn(&str) -> Result<CommandOutput, DispatchError> + Send + Sync>;

struct Entry {
    info: CommandInfo,
    handler: Handler,
}

/// Dispatcher backed by a name -> closure table.
#[derive(Default)]
pub struct CommandTable {
    entries: BTreeMap<String, Entry>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. A later registration with the same name wins.
    pub fn register<F>(&mut self, name: &str, group: &str, syntax: &str, handler: F) -> &mut Self
    where
        F: Fn(&str) -> Result<CommandOutput, DispatchError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_ascii_lowercase(),
            Entry {
                info: CommandInfo {
                    name: name.to_ascii_lowercase(),
                    syntax: syntax.to_string(),
                    group: group.to_string(),
                },
                handler: Box::new(handler),
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Dispatcher for CommandTable {
    fn dispatch(&self, command: &str, param: &str) -> Result<CommandOutput, DispatchError> {
        match self.entries.get(&command.to_ascii_lowercase()) {
            Some(entry) => (entry.handler)(param),
            None => Err(DispatchError::UnknownCommand(command.to_string())),
        }
    }

    fn commands(&self) -> Vec<CommandInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }
}

/// Named templates with a `{body}` placeholder.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, String>,
}

impl TemplateSet {
    pub fn new(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Templates for TemplateSet {
    fn render(&self, template: &str, body: &str) -> Result<String, DispatchError> {
        self.templates
            .get(template)
            .map(|t| t.replace("{body}", body))
            .ok_or_else(|| DispatchError::UnknownTemplate(template.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_table_dispatch() {
        let mut table = CommandTable::new();
        table
            .register("Echo", "Testing", "echo <text>", |p| Ok(CommandOutput::html(p)))
            .register("fail", "Testing", "fail", |_| {
                Err(DispatchError::Failed("boom".to_string()))
            });

        assert_eq!(table.len(), 2);
        assert_eq!(table.dispatch("echo", "hi").unwrap().body, "hi");
        assert_eq!(table.dispatch("ECHO", "hi").unwrap().body, "hi");
        assert_eq!(
            table.dispatch("fail", ""),
            Err(DispatchError::Failed("boom".to_string()))
        );

        assert_eq!(
            table.dispatch("nope", ""),
            Err(DispatchError::UnknownCommand("nope".to_string()))
        );

        let names: Vec<_> = table.commands().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["echo", "fail"]);
    }

    #[test]
    fn test_template_set() {
        let mut map = HashMap::new();
        map.insert("page".to_string(), "<html>{body}</html>".to_string());
        let templates = TemplateSet::new(map);

        assert_eq!(templates.render("page", "x").unwrap(), "<html>x</html>");
        assert_eq!(
            templates.render("missing", "x"),
            Err(DispatchError::UnknownTemplate("missing".to_string()))
        );
    }

    #[test]
    fn test_content_kind_mime() {
        assert_eq!(ContentKind::Html.mime(), "text/html;charset=utf-8");
        assert_eq!(ContentKind::Json.mime(), "application/json");
        assert_eq!(ContentKind::Image("png".into()).mime(), "image/png");
    }
}
