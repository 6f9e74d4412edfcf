use std::error::Error as StdError;
use std::path::Path;

use tera::{Context, Tera};
use tokio::fs::read_to_string;
use tracing::debug;
use vcfkit_config::{DeploymentConfig, MachineSpec};

use crate::{RenderError, RenderedConfig, variables::template_variables};

/// A parsed kickstart template.
#[derive(Debug)]
pub struct Template {
    tera: Tera,
    name: String,
}

impl Template {
    pub async fn load(path: &Path) -> Result<Self, RenderError> {
        let source = match read_to_string(path).await {
            Ok(source) => source,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::TemplateNotFound(path.to_owned()));
            }
            Err(source) => {
                return Err(RenderError::TemplateRead {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "template".to_owned());
        Self::from_source(&name, &source)
    }

    pub fn from_source(name: &str, source: &str) -> Result<Self, RenderError> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_template(name, &trim_blocks(source))
            .map_err(|source| RenderError::TemplateParse {
                name: name.to_owned(),
                message: error_chain(&source),
            })?;
        Ok(Self {
            tera,
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render the template for one host. Both preview and write go through
    /// here.
    pub fn render(
        &self,
        config: &DeploymentConfig,
        host: &MachineSpec,
    ) -> Result<RenderedConfig, RenderError> {
        let mut context = Context::new();
        for (key, value) in template_variables(config, host) {
            context.insert(key, &value);
        }

        let text = self
            .tera
            .render(&self.name, &context)
            .map_err(|err| match missing_variable(&err) {
                Some(placeholder) => RenderError::MissingValue {
                    placeholder,
                    host: host.number,
                },
                None => RenderError::Render {
                    host: host.number,
                    message: error_chain(&err),
                },
            })?;

        debug!(host = %host.number, bytes = text.len(), "rendered kickstart");

        Ok(RenderedConfig {
            number: host.number,
            hostname: host.hostname.clone(),
            file_name: host.number.kickstart_file_name(),
            text,
        })
    }
}

/// Kickstart templates are written for Jinja with `trim_blocks` and
/// `lstrip_blocks` on, which Tera lacks: drop the spaces and tabs between a
/// line start and a block or comment tag, and the first newline after one.
fn trim_blocks(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    let mut at_line_start = true;

    while let Some(start) = next_tag(rest) {
        let (before, tag) = rest.split_at(start);
        let line_start = match before.rfind('\n') {
            Some(newline) => Some(newline + 1),
            None => at_line_start.then_some(0),
        };
        match line_start {
            Some(line_start) if before[line_start..].bytes().all(|b| b == b' ' || b == b'\t') => {
                out.push_str(&before[..line_start]);
            }
            _ => out.push_str(before),
        }

        let close = if tag.starts_with("{%") { "%}" } else { "#}" };
        let Some(end) = tag[2..].find(close).map(|end| end + 2 + close.len()) else {
            // Unterminated; leave it for the parser to report.
            out.push_str(tag);
            return out;
        };
        out.push_str(&tag[..end]);

        let after = &tag[end..];
        rest = after
            .strip_prefix("\r\n")
            .or_else(|| after.strip_prefix('\n'))
            .unwrap_or(after);
        at_line_start = rest.len() != after.len();
    }

    out.push_str(rest);
    out
}

fn next_tag(source: &str) -> Option<usize> {
    match (source.find("{%"), source.find("{#")) {
        (Some(block), Some(comment)) => Some(block.min(comment)),
        (block, comment) => block.or(comment),
    }
}

/// Find the variable name in Tera's "Variable `name` not found in context"
/// error, anywhere in the source chain.
fn missing_variable(err: &tera::Error) -> Option<String> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = current {
        let message = err.to_string();
        if let Some(rest) = message.strip_prefix("Variable `") {
            if let Some((name, tail)) = rest.split_once('`') {
                if tail.starts_with(" not found") {
                    return Some(name.to_owned());
                }
            }
        }
        current = err.source();
    }
    None
}

fn error_chain(err: &tera::Error) -> String {
    let mut messages = vec![err.to_string()];
    let mut current = err.source();
    while let Some(err) = current {
        messages.push(err.to_string());
        current = err.source();
    }
    messages.join(": ")
}
