use std::fmt::{self, Display, Formatter};

use displaydoc::Display as DocDisplay;
use thiserror::Error;

/// A single edit to a `key=value` boot configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEdit {
    /// Replace the value of every `key=` line. The key must be present.
    Set { key: String, value: String },
    /// Replace the value of every `key=` line, appending one if none exists.
    Upsert { key: String, value: String },
    /// Remove leading `/` from every whitespace-separated word of the value.
    StripLeadingSlashes { key: String },
}

impl LineEdit {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        LineEdit::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn upsert(key: impl Into<String>, value: impl Into<String>) -> Self {
        LineEdit::Upsert {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn strip_leading_slashes(key: impl Into<String>) -> Self {
        LineEdit::StripLeadingSlashes { key: key.into() }
    }

    fn key(&self) -> &str {
        match self {
            LineEdit::Set { key, .. }
            | LineEdit::Upsert { key, .. }
            | LineEdit::StripLeadingSlashes { key } => key,
        }
    }
}

impl Display for LineEdit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LineEdit::Set { key, value } => write!(f, "{key}={value}"),
            LineEdit::Upsert { key, value } => write!(f, "{key}={value} (upsert)"),
            LineEdit::StripLeadingSlashes { key } => write!(f, "{key}=<strip leading />"),
        }
    }
}

#[derive(Debug, Error, DocDisplay, PartialEq, Eq)]
pub enum PatchError {
    /// boot config has no `{key}=` line
    MissingKey { key: String },
}

/// Apply edits to boot configuration text.
///
/// Lines are matched on the text before the first `=`. Lines no edit touches
/// are passed through byte for byte, including their terminator.
pub fn patch_boot_config(content: &str, edits: &[LineEdit]) -> Result<String, PatchError> {
    let mut lines: Vec<String> = content.split_inclusive('\n').map(str::to_owned).collect();

    for edit in edits {
        let mut matched = false;
        for line in lines.iter_mut() {
            let (body, terminator) = split_terminator(line);
            let Some((key, value)) = body.split_once('=') else {
                continue;
            };
            if key != edit.key() {
                continue;
            }
            matched = true;
            let value = match edit {
                LineEdit::Set { value, .. } | LineEdit::Upsert { value, .. } => value.clone(),
                LineEdit::StripLeadingSlashes { .. } => strip_leading_slashes(value),
            };
            *line = format!("{key}={value}{terminator}");
        }

        if matched {
            continue;
        }
        match edit {
            LineEdit::Upsert { key, value } => {
                let terminator = lines
                    .first()
                    .map(|line| split_terminator(line).1)
                    .filter(|terminator| !terminator.is_empty())
                    .unwrap_or("\n")
                    .to_owned();
                if let Some(last) = lines.last_mut() {
                    if !last.ends_with('\n') {
                        last.push_str(&terminator);
                    }
                }
                lines.push(format!("{key}={value}{terminator}"));
            }
            LineEdit::Set { key, .. } => return Err(PatchError::MissingKey { key: key.clone() }),
            // Nothing to strip.
            LineEdit::StripLeadingSlashes { .. } => {}
        }
    }

    Ok(lines.concat())
}

fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// `/b.b00 --- /jumpstrt.gz` → `b.b00 --- jumpstrt.gz`
fn strip_leading_slashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut word_start = true;
    for c in value.chars() {
        if c == '/' && word_start {
            continue;
        }
        word_start = c == ' ';
        out.push(c);
    }
    out
}
