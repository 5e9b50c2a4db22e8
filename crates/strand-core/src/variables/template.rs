use std::sync::OnceLock;

use regex::Regex;

use super::selector::Selector;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{#([a-zA-Z0-9_]{1,50}(?:\.[a-zA-Z_][a-zA-Z0-9_]{0,29}){1,10})#\}\}")
            .unwrap()
    })
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    /// A `{{#node.var#}}` reference; `raw` is the placeholder as written.
    Variable { selector: Selector, raw: String },
}

/// Split text into literal runs and variable references.
pub fn parse(text: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in placeholder().captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Ok(selector) = Selector::parse_dotted(inner.as_str()) else {
            continue;
        };
        if whole.start() > last {
            parts.push(TemplatePart::Text(text[last..whole.start()].to_string()));
        }
        parts.push(TemplatePart::Variable {
            selector,
            raw: whole.as_str().to_string(),
        });
        last = whole.end();
    }
    if last < text.len() {
        parts.push(TemplatePart::Text(text[last..].to_string()));
    }
    parts
}

/// Every selector referenced by a template, in order of appearance.
pub fn selectors(text: &str) -> Vec<Selector> {
    let mut out: Vec<Selector> = Vec::new();
    for part in parse(text) {
        if let TemplatePart::Variable { selector, .. } = part {
            if !out.contains(&selector) {
                out.push(selector);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_text() {
        let parts = parse("Hi {{#start.name#}}, you asked: {{#sys.query#}}!");
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], TemplatePart::Text("Hi ".into()));
        match &parts[1] {
            TemplatePart::Variable { selector, raw } => {
                assert_eq!(selector, &Selector::new("start", &["name"]));
                assert_eq!(raw, "{{#start.name#}}");
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert_eq!(parts[4], TemplatePart::Text("!".into()));
    }

    #[test]
    fn test_malformed_placeholders_are_text() {
        let parts = parse("{{#novar#}} and {{ plain }}");
        assert_eq!(parts, vec![TemplatePart::Text("{{#novar#}} and {{ plain }}".into())]);
    }

    #[test]
    fn test_selectors_deduplicated() {
        let sels = selectors("{{#a.x#}} {{#b.y.z#}} {{#a.x#}}");
        assert_eq!(
            sels,
            vec![Selector::new("a", &["x"]), Selector::new("b", &["y", "z"])]
        );
    }
}
