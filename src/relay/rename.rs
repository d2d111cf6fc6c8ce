use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::relay::select::split_ext;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

const PLACEHOLDERS: &[&str] = &[
    "timestamp",
    "message_id",
    "filename",
    "base",
    "ext",
    "author_id",
    "channel_id",
];

#[derive(Debug, Error, PartialEq)]
pub enum RenderError {
    #[error("unknown placeholder {{{0}}}; expected one of {list}", list = PLACEHOLDERS.join(", "))]
    UnknownPlaceholder(String),
    #[error("unmatched '{brace}' at byte {pos}")]
    UnmatchedBrace { brace: char, pos: usize },
}

/// Source of "now" for the timestamp placeholder
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything about a message that can appear in a target name
#[derive(Debug, Clone)]
pub struct RenameInputs<'a> {
    pub message_id: u64,
    pub author_id: u64,
    pub channel_id: u64,
    pub filename: &'a str,
}

/// Render `template` with `{name}` placeholders; `{{` and `}}` are literal braces.
/// If the result has no extension, the original attachment's extension is appended.
pub fn target_name(
    template: &str,
    inputs: &RenameInputs<'_>,
    now: DateTime<Utc>,
) -> Result<String, RenderError> {
    let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
    let (base, ext) = split_ext(inputs.filename);

    let mut out = String::with_capacity(template.len() + inputs.filename.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|&(_, n)| n) == Some('{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, n) in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(RenderError::UnmatchedBrace { brace: '{', pos });
                }
                match name.as_str() {
                    "timestamp" => out.push_str(&timestamp),
                    "message_id" => out.push_str(&inputs.message_id.to_string()),
                    "filename" => out.push_str(inputs.filename),
                    "base" => out.push_str(base),
                    "ext" => out.push_str(ext),
                    "author_id" => out.push_str(&inputs.author_id.to_string()),
                    "channel_id" => out.push_str(&inputs.channel_id.to_string()),
                    _ => return Err(RenderError::UnknownPlaceholder(name)),
                }
            }
            '}' if chars.peek().map(|&(_, n)| n) == Some('}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(RenderError::UnmatchedBrace { brace: '}', pos }),
            _ => out.push(c),
        }
    }

    if split_ext(&out).1.is_empty() {
        out.push_str(ext);
    }
    Ok(out)
}

/// Check a template once at startup so rendering cannot fail later.
pub fn validate_template(template: &str) -> Result<(), RenderError> {
    let probe = RenameInputs {
        message_id: 1,
        author_id: 1,
        channel_id: 1,
        filename: "probe.png",
    };
    target_name(template, &probe, DateTime::<Utc>::default()).map(|_| ())
}
