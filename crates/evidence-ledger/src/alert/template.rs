//! `{{token}}` templates for notification subjects and bodies.
//!
//! `{{name}}` is required: rendering fails if nothing binds it.
//! `{{name?}}` is optional and renders as an empty string when unbound.

use std::fmt;

use crate::error::TemplateError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Token { name: String, optional: bool },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;
            let raw = after[..end].trim();
            let (name, optional) = match raw.strip_suffix('?') {
                Some(n) => (n.trim(), true),
                None => (raw, false),
            };
            if name.is_empty() {
                return Err(TemplateError::EmptyToken(offset + start));
            }
            segments.push(Segment::Token {
                name: name.to_string(),
                optional,
            });
            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Names of the required tokens, in order of appearance.
    pub fn required_tokens(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Token {
                    name,
                    optional: false,
                } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn render<F>(&self, resolve: F) -> Result<String, TemplateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Token { name, optional } => match resolve(name) {
                    Some(v) => out.push_str(&v),
                    None if *optional => {}
                    None => return Err(TemplateError::MissingBinding(name.clone())),
                },
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
