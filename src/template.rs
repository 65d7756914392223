//! Path templates: literal text with `{name}`, `{name:N}` (first N characters)
//! and `{name:FORMAT}` (strftime, timestamps only) placeholders.
//!
//! Custom variables are rendered in definition order; a variable may use
//! standard fields and variables defined before it, never later ones.
//! A `//` in a rendered path is left as-is for downstream consumers.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::SecondsFormat;
use indexmap::IndexMap;

use crate::error::{CIFetchError, Result};
use crate::models::{FieldValue, PathFields, TIMESTAMP_FIELDS};

#[derive(Debug, Clone, PartialEq)]
pub enum FormatSpec {
    Truncate(usize),
    Strftime(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub name: String,
    pub spec: Option<FormatSpec>,
}

impl Placeholder {
    fn parse(template: &str, body: &str) -> Result<Self> {
        let (name, spec) = match body.split_once(':') {
            Some((name, spec)) => (name, Some(spec)),
            None => (body, None),
        };

        let mut chars = name.chars();
        let valid_name = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(CIFetchError::template(
                template,
                format!("invalid placeholder name {name:?}"),
            ));
        }

        let spec = match spec {
            None | Some("") => None,
            Some(spec) if spec.bytes().all(|b| b.is_ascii_digit()) => {
                let n = spec.parse().map_err(|_| {
                    CIFetchError::template(template, format!("invalid length {spec:?}"))
                })?;
                Some(FormatSpec::Truncate(n))
            }
            Some(spec) => {
                if StrftimeItems::new(spec).any(|item| matches!(item, Item::Error)) {
                    return Err(CIFetchError::template(
                        template,
                        format!("invalid timestamp format {spec:?} for {{{name}}}"),
                    ));
                }
                Some(FormatSpec::Strftime(spec.to_string()))
            }
        };

        Ok(Self {
            name: name.to_string(),
            spec,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(Placeholder),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(CIFetchError::template(source, "single '}' encountered"));
                }
                '{' => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => {
                                return Err(CIFetchError::template(
                                    source,
                                    "nested '{' inside placeholder",
                                ));
                            }
                            Some(ch) => body.push(ch),
                            None => {
                                return Err(CIFetchError::template(source, "unclosed '{'"));
                            }
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(Placeholder::parse(source, &body)?));
                }
                _ => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Field(placeholder) => Some(placeholder),
            Segment::Literal(_) => None,
        })
    }
}

/// Renders templates against event fields plus the configured custom variables
#[derive(Debug, Clone)]
pub struct PathRenderer {
    vars: Vec<(String, Template)>,
    // standard fields each variable needs, transitively
    deps: Vec<BTreeSet<String>>,
}

impl PathRenderer {
    /// Parse and check custom variables. `known_fields` is every standard
    /// field name any event can provide.
    pub fn new(vars: &IndexMap<String, String>, known_fields: &[&str]) -> Result<Self> {
        let mut parsed: Vec<(String, Template)> = Vec::with_capacity(vars.len());
        let mut deps: Vec<BTreeSet<String>> = Vec::with_capacity(vars.len());

        for (name, source) in vars {
            let template = Template::parse(source)?;
            let mut needed = BTreeSet::new();

            for placeholder in template.placeholders() {
                if let Some(idx) = parsed.iter().position(|(n, _)| *n == placeholder.name) {
                    check_text_spec(&template, placeholder)?;
                    needed.extend(deps[idx].iter().cloned());
                } else if known_fields.contains(&placeholder.name.as_str()) {
                    check_field_spec(&template, placeholder)?;
                    needed.insert(placeholder.name.clone());
                } else {
                    return Err(CIFetchError::template(
                        source,
                        format!(
                            "variable {name:?} uses unknown placeholder {{{}}} \
                             (variables may only use ones defined before them)",
                            placeholder.name
                        ),
                    ));
                }
            }

            parsed.push((name.clone(), template));
            deps.push(needed);
        }

        Ok(Self { vars: parsed, deps })
    }

    /// Check that every placeholder in `template` resolves for events that
    /// provide the `available` fields.
    pub fn validate(&self, template: &Template, available: &[&str]) -> Result<()> {
        for placeholder in template.placeholders() {
            if let Some(idx) = self.var_index(&placeholder.name, self.vars.len()) {
                check_text_spec(template, placeholder)?;
                if let Some(missing) = self.deps[idx]
                    .iter()
                    .find(|field| !available.contains(&field.as_str()))
                {
                    return Err(CIFetchError::template(
                        template.as_str(),
                        format!(
                            "variable {:?} uses {{{missing}}}, which is not available here",
                            placeholder.name
                        ),
                    ));
                }
            } else if available.contains(&placeholder.name.as_str()) {
                check_field_spec(template, placeholder)?;
            } else {
                return Err(unknown_placeholder(template, &placeholder.name));
            }
        }
        Ok(())
    }

    pub fn render(&self, template: &Template, fields: &PathFields) -> Result<String> {
        let mut expanded = HashMap::new();
        self.render_with(template, fields, self.vars.len(), &mut expanded)
    }

    fn render_with(
        &self,
        template: &Template,
        fields: &PathFields,
        visible_vars: usize,
        expanded: &mut HashMap<usize, String>,
    ) -> Result<String> {
        let mut out = String::new();

        for segment in &template.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(placeholder) => {
                    let value =
                        self.resolve(template, placeholder, fields, visible_vars, expanded)?;
                    out.push_str(&value);
                }
            }
        }

        Ok(out)
    }

    fn resolve(
        &self,
        template: &Template,
        placeholder: &Placeholder,
        fields: &PathFields,
        visible_vars: usize,
        expanded: &mut HashMap<usize, String>,
    ) -> Result<String> {
        // Custom variables shadow standard fields
        if let Some(idx) = self.var_index(&placeholder.name, visible_vars) {
            let text = match expanded.get(&idx) {
                Some(text) => text.clone(),
                None => {
                    let text = self.render_with(&self.vars[idx].1, fields, idx, expanded)?;
                    expanded.insert(idx, text.clone());
                    text
                }
            };
            return format_value(template, &FieldValue::Text(text), placeholder.spec.as_ref());
        }

        match fields.get(placeholder.name.as_str()) {
            Some(value) => format_value(template, value, placeholder.spec.as_ref()),
            None => Err(unknown_placeholder(template, &placeholder.name)),
        }
    }

    fn var_index(&self, name: &str, visible_vars: usize) -> Option<usize> {
        self.vars[..visible_vars].iter().position(|(n, _)| n == name)
    }
}

fn unknown_placeholder(template: &Template, name: &str) -> CIFetchError {
    CIFetchError::template(template.as_str(), format!("unknown placeholder {{{name}}}"))
}

fn check_text_spec(template: &Template, placeholder: &Placeholder) -> Result<()> {
    match placeholder.spec {
        Some(FormatSpec::Strftime(_)) => Err(CIFetchError::template(
            template.as_str(),
            format!(
                "{{{}}} is not a timestamp and only accepts a length",
                placeholder.name
            ),
        )),
        _ => Ok(()),
    }
}

fn check_field_spec(template: &Template, placeholder: &Placeholder) -> Result<()> {
    if TIMESTAMP_FIELDS.contains(&placeholder.name.as_str()) {
        Ok(())
    } else {
        check_text_spec(template, placeholder)
    }
}

fn format_value(template: &Template, value: &FieldValue, spec: Option<&FormatSpec>) -> Result<String> {
    let truncate = |text: String| match spec {
        Some(FormatSpec::Truncate(n)) => text.chars().take(*n).collect(),
        _ => text,
    };

    match (value, spec) {
        (FieldValue::Timestamp(at), Some(FormatSpec::Strftime(format))) => {
            Ok(at.format(format).to_string())
        }
        (FieldValue::LocalTimestamp(at), Some(FormatSpec::Strftime(format))) => {
            Ok(at.format(format).to_string())
        }
        (FieldValue::Text(_), Some(FormatSpec::Strftime(_))) => Err(CIFetchError::template(
            template.as_str(),
            "timestamp format applied to a text value",
        )),
        (FieldValue::Timestamp(at), _) => Ok(truncate(at.to_rfc3339_opts(SecondsFormat::Secs, true))),
        (FieldValue::LocalTimestamp(at), _) => {
            Ok(truncate(at.to_rfc3339_opts(SecondsFormat::Secs, false)))
        }
        (FieldValue::Text(text), _) => Ok(truncate(text.clone())),
    }
}

/// Make human-entered text safe as a single path component: whitespace runs
/// become one space and characters illegal in portable filenames (plus `%`)
/// are percent-encoded.
pub fn sanitize_pathname(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;

    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
            continue;
        }
        in_space = false;

        if matches!(c, '\0' | '\\' | '/' | '<' | '>' | ':' | '|' | '"' | '?' | '*' | '%') {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "%{b:02x}");
            }
        } else {
            out.push(c);
        }
    }

    // "." and ".." would name the current or parent directory
    if !out.is_empty() && out.chars().all(|c| c == '.') {
        return out.replace('.', "%2e");
    }

    out
}
