// Lorekeep Runtime — Prompt Template Rendering
//
// Substitutes the fixed placeholder set into an automation's prompt
// template. An unknown placeholder is a render error — the run fails as
// template_render_error instead of silently sending "{{typo}}" to the LLM.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::types::BusEventKind;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub struct TemplateContext<'a> {
    pub domain_name: &'a str,
    pub event_type: Option<BusEventKind>,
    pub event_data: Option<&'a Value>,
    pub now: DateTime<Utc>,
}

pub fn render_prompt(template: &str, ctx: &TemplateContext<'_>) -> EngineResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(EngineError::Validation("unterminated placeholder".into()));
        };
        let name = after[..end].trim();
        match name {
            "domain_name" => out.push_str(ctx.domain_name),
            "event_type" => {
                out.push_str(ctx.event_type.map(|e| e.as_str()).unwrap_or(""));
            }
            "event_data" => match ctx.event_data {
                Some(data) => out.push_str(&data.to_string()),
                None => out.push_str("null"),
            },
            "current_date" => out.push_str(&ctx.now.format("%Y-%m-%d").to_string()),
            other => {
                return Err(EngineError::Validation(format!("unknown placeholder '{other}'")));
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx(data: Option<&Value>) -> TemplateContext<'_> {
        TemplateContext {
            domain_name: "Research",
            event_type: Some(BusEventKind::IntakeCreated),
            event_data: data,
            now: Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn substitutes_all_placeholders() {
        let data = json!({"title": "paper"});
        let rendered = render_prompt(
            "In {{domain_name}} on {{current_date}}: {{event_type}} with {{event_data}}",
            &ctx(Some(&data)),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "In Research on 2025-06-15: intake_created with {\"title\":\"paper\"}"
        );
    }

    #[test]
    fn missing_event_data_renders_null() {
        let rendered = render_prompt("data: {{event_data}}", &ctx(None)).unwrap();
        assert_eq!(rendered, "data: null");
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = render_prompt("{{nope}}", &ctx(None)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        assert!(render_prompt("{{domain_name", &ctx(None)).is_err());
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render_prompt("no vars here", &ctx(None)).unwrap(), "no vars here");
    }
}
