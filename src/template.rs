//! Incident text templates
//!
//! Templates use `{field}` placeholders and `{{` / `}}` for literal braces. Each of the
//! three templates has a fixed field set and is validated against it when loaded, so a
//! typo in the configuration fails at startup instead of in the middle of a cycle.

use crate::config::TemplatesConfig;
use crate::errors::{BridgeError, Result};
use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;

pub const DEFAULT_ACKNOWLEDGEMENT: &str = "{message}\n\n###### {ack_time} by {author}\n\n______\n";
pub const DEFAULT_INVESTIGATING: &str =
    "{component} check **failed** - {time}\n\n```{trigger_name}\n{trigger_description}```";
pub const DEFAULT_RESOLVING: &str = "__Resolved__ - {time}\n\n______\n";

const TIME_FORMAT: &str = "%b %d, %H:%M";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateKind {
    Acknowledgement,
    Investigating,
    Resolving,
}

impl TemplateKind {
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            TemplateKind::Acknowledgement => &["message", "ack_time", "author"],
            TemplateKind::Investigating => &[
                "group",
                "component",
                "time",
                "trigger_name",
                "trigger_description",
            ],
            TemplateKind::Resolving => &["time"],
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateKind::Acknowledgement => write!(f, "acknowledgement"),
            TemplateKind::Investigating => write!(f, "investigating"),
            TemplateKind::Resolving => write!(f, "resolving"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Field(&'static str),
}

/// A parsed template, known to reference only fields of its kind
#[derive(Clone, Debug)]
pub struct Template {
    kind: TemplateKind,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(kind: TemplateKind, source: &str) -> Result<Self> {
        let error = |reason: String| BridgeError::TemplateField {
            template: kind.to_string(),
            reason,
        };

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
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(error(format!("unclosed placeholder `{{{}`", name)));
                            }
                            Some(ch) => name.push(ch),
                        }
                    }
                    let name = name.trim();
                    let field = kind
                        .fields()
                        .iter()
                        .find(|known| **known == name)
                        .ok_or_else(|| {
                            error(format!(
                                "unknown field `{}` (allowed: {})",
                                name,
                                kind.fields().join(", ")
                            ))
                        })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(*field));
                }
                '}' => return Err(error("unmatched `}`".to_string())),
                _ => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { kind, segments })
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Substitute fields; a field absent from `fields` renders as an empty string
    pub fn render(&self, fields: &[(&str, &str)]) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    if let Some((_, value)) = fields.iter().find(|(key, _)| key == name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

/// Time zone used for every time field in rendered text
#[derive(Clone, Debug, PartialEq)]
pub enum TimeZoneSetting {
    Local,
    Named(Tz),
}

impl TimeZoneSetting {
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => Ok(TimeZoneSetting::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(TimeZoneSetting::Named)
                .map_err(|_| BridgeError::Config(format!("unknown time zone `{}`", name))),
        }
    }

    pub fn format(&self, time: DateTime<Utc>) -> String {
        match self {
            TimeZoneSetting::Local => time.with_timezone(&Local).format(TIME_FORMAT).to_string(),
            TimeZoneSetting::Named(tz) => time.with_timezone(tz).format(TIME_FORMAT).to_string(),
        }
    }
}

/// The three incident templates plus the time zone they render in
#[derive(Clone, Debug)]
pub struct Templates {
    acknowledgement: Template,
    investigating: Template,
    resolving: Template,
    time_zone: TimeZoneSetting,
}

impl Templates {
    pub fn new(config: &TemplatesConfig, time_zone: TimeZoneSetting) -> Result<Self> {
        Ok(Self {
            acknowledgement: Template::parse(TemplateKind::Acknowledgement, &config.acknowledgement)?,
            investigating: Template::parse(TemplateKind::Investigating, &config.investigating)?,
            resolving: Template::parse(TemplateKind::Resolving, &config.resolving)?,
            time_zone,
        })
    }

    pub fn time_zone(&self) -> &TimeZoneSetting {
        &self.time_zone
    }

    pub fn investigating(
        &self,
        group: &str,
        component: &str,
        time: DateTime<Utc>,
        trigger_name: &str,
        trigger_description: &str,
    ) -> String {
        let time = self.time_zone.format(time);
        self.investigating.render(&[
            ("group", group),
            ("component", component),
            ("time", &time),
            ("trigger_name", trigger_name),
            ("trigger_description", trigger_description),
        ])
    }

    pub fn acknowledgement(&self, message: &str, ack_time: DateTime<Utc>, author: &str) -> String {
        let ack_time = self.time_zone.format(ack_time);
        self.acknowledgement.render(&[
            ("message", message),
            ("ack_time", &ack_time),
            ("author", author),
        ])
    }

    pub fn resolving(&self, time: DateTime<Utc>) -> String {
        let time = self.time_zone.format(time);
        self.resolving.render(&[("time", &time)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> TimeZoneSetting {
        TimeZoneSetting::parse(Some("UTC")).unwrap()
    }

    #[test]
    fn test_render_substitutes_fields_and_escapes() {
        let template = Template::parse(TemplateKind::Resolving, "{{done}} at {time}!").unwrap();
        assert_eq!(template.render(&[("time", "12:00")]), "{done} at 12:00!");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = Template::parse(TemplateKind::Resolving, "resolved by {author}").unwrap_err();
        match err {
            BridgeError::TemplateField { template, reason } => {
                assert_eq!(template, "resolving");
                assert!(reason.contains("author"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_braces_are_rejected() {
        assert!(Template::parse(TemplateKind::Investigating, "{component").is_err());
        assert!(Template::parse(TemplateKind::Investigating, "oops }").is_err());
        assert!(Template::parse(TemplateKind::Investigating, "{comp{onent}").is_err());
    }

    #[test]
    fn test_empty_template() {
        let template = Template::parse(TemplateKind::Investigating, "").unwrap();
        assert!(template.is_empty());
        assert_eq!(template.render(&[("group", "x")]), "");
    }

    #[test]
    fn test_default_templates() {
        let templates = Templates::new(&TemplatesConfig::default(), utc()).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 0).unwrap();

        let text = templates.investigating("Storage", "DB", at, "disk full", "/var is 99% full");
        assert!(text.starts_with("DB check **failed** - Mar 01, 09:05"));
        assert!(text.contains("disk full\n/var is 99% full"));

        let ack = templates.acknowledgement("on it", at, "Alice");
        assert!(ack.lines().any(|line| line.ends_with("by Alice")));
        assert!(ack.starts_with("on it"));

        assert_eq!(templates.resolving(at), "__Resolved__ - Mar 01, 09:05\n\n______\n");
    }

    #[test]
    fn test_named_time_zone() {
        let tz = TimeZoneSetting::parse(Some("Europe/Moscow")).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 0).unwrap();
        assert_eq!(tz.format(at), "Mar 01, 12:05");

        assert_eq!(TimeZoneSetting::parse(Some("  ")).unwrap(), TimeZoneSetting::Local);
        assert!(TimeZoneSetting::parse(Some("Mars/Olympus")).is_err());
    }
}
