use std::collections::BTreeMap;

use dashmap::DashMap;
use scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{mentions, Tuning, Vocabulary};
use crate::error::Result;
use crate::fields::FieldDescriptor;

/// Caller-supplied key/value data the form is filled from.
pub type InputData = BTreeMap<String, String>;

const SYSTEM_PROMPT: &str = "You are an expert in HTML form structure, fluent in English and Japanese. \
    You map form fields to data precisely and double-check every choice.";

const VOID_ELEMENTS: &[&str] = &["input", "br", "img", "hr", "meta", "link", "wbr", "source"];

/// One mapped field: the dictionary key for free-text fields, a candidate for enumerable ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field: String,
    pub value: String,
}

/// A resolved write: the field and the literal value to put into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAssignment {
    pub field: FieldDescriptor,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    pub system: String,
    pub prompt: String,
}

impl MappingRequest {
    /// SHA-256 over form identity, prompt and system prompt.
    pub fn cache_key(&self, form_identity: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [form_identity, &self.prompt, &self.system] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// In-process mapping cache shared by every session of a batch.
#[derive(Debug, Default)]
pub struct MappingCache {
    entries: DashMap<String, Vec<FieldMapping>>,
}

impl MappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<FieldMapping>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: String, mappings: Vec<FieldMapping>) {
        self.entries.insert(key, mappings);
    }
}

// ── Markup sanitizer ────────────────────────────────────────────────

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn kept_attribute(tag: &str, input_type: &str, attr: &str) -> bool {
    match tag {
        "input" => {
            matches!(attr, "name" | "placeholder")
                || attr == "value" && matches!(input_type, "radio" | "checkbox")
        }
        "textarea" | "select" => matches!(attr, "name" | "placeholder"),
        "option" => attr == "value",
        _ => false,
    }
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_controls(el: ElementRef<'_>) -> bool {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .any(|d| matches!(d.value().name(), "input" | "textarea" | "select"))
}

struct Sanitizer<'v> {
    drop_options: bool,
    vocabulary: &'v Vocabulary,
}

impl Sanitizer<'_> {
    fn write_children(&self, parent: ElementRef<'_>, out: &mut String) {
        for child in parent.children() {
            match child.value() {
                Node::Text(text) => {
                    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !collapsed.is_empty() {
                        out.push_str(&escape(&collapsed, false));
                    }
                }
                Node::Element(_) => {
                    if let Some(el) = ElementRef::wrap(child) {
                        self.write_element(el, out);
                    }
                }
                _ => {}
            }
        }
    }

    fn write_element(&self, element: ElementRef<'_>, out: &mut String) {
        let el = element.value();
        let tag = el.name();
        if matches!(tag, "script" | "style" | "noscript") {
            return;
        }
        if tag == "option" && self.drop_options {
            return;
        }
        if matches!(tag, "p" | "li") {
            let text = text_of(element);
            let empty = text.is_empty() && !has_controls(element);
            if empty || mentions(&text, &self.vocabulary.privacy_notice) {
                return;
            }
        }

        let input_type = el.attr("type").unwrap_or_default().to_lowercase();
        out.push('<');
        out.push_str(tag);
        for name in ["name", "placeholder", "value"] {
            match el.attr(name) {
                Some(value) if kept_attribute(tag, &input_type, name) => {
                    out.push_str(&format!(" {name}=\"{}\"", escape(value, true)));
                }
                _ => {}
            }
        }
        out.push('>');
        if VOID_ELEMENTS.contains(&tag) {
            return;
        }
        self.write_children(element, out);
        out.push_str(&format!("</{tag}>"));
    }
}

/// Reduce form markup to the structure the mapping prompt needs.
pub fn sanitize_markup(fragment: &str, tuning: &Tuning, vocabulary: &Vocabulary) -> String {
    let doc = Html::parse_fragment(fragment);
    let options = doc
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "option")
        .count();
    let sanitizer = Sanitizer {
        drop_options: options > tuning.max_prompt_options,
        vocabulary,
    };
    let mut out = String::new();
    // The fragment root is a synthetic <html>; serialize its children only.
    sanitizer.write_children(doc.root_element(), &mut out);
    out
}

// ── Request ─────────────────────────────────────────────────────────

fn preview(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        value.to_string()
    } else {
        value.chars().take(limit).collect()
    }
}

/// Build the mapping instruction for a schema, its markup and the input dictionary.
pub fn build_request(
    fields: &[FieldDescriptor],
    fragment: &str,
    input: &InputData,
    tuning: &Tuning,
    vocabulary: &Vocabulary,
) -> Result<MappingRequest> {
    let field_list: Vec<serde_json::Value> = fields
        .iter()
        .map(|field| {
            let mut value = serde_json::to_value(field)?;
            if let Some(object) = value.as_object_mut() {
                object.insert("id".into(), field.identifier().into());
            }
            Ok(value)
        })
        .collect::<Result<_>>()?;

    let dictionary: BTreeMap<&str, String> = input
        .iter()
        .map(|(key, value)| (key.as_str(), preview(value, tuning.preview_chars)))
        .collect();

    let prompt = format!(
        "Map the fields of a web contact form onto the data dictionary below.\n\n\
         Fields (JSON):\n{fields}\n\n\
         Form markup:\n{markup}\n\n\
         Data dictionary (long values are shortened):\n{dictionary}\n\n\
         Rules:\n\
         1. Return exactly one entry per field, using the field's \"id\" as \"field\".\n\
         2. For free-text fields (text, email, tel, url, number, date, textarea), \"value\" must be \
            the KEY of the dictionary entry that belongs in the field, or \"\" when none fits.\n\
         3. For radio, checkbox and select fields, \"value\" must be one of that field's own \
            \"candidates\". If unsure, choose a candidate meaning \"other\", otherwise the last candidate.\n\n\
         Reply with JSON only, in this shape:\n\
         {{\"mappings\": [{{\"field\": \"<id>\", \"value\": \"<key or candidate>\"}}]}}",
        fields = serde_json::to_string(&field_list)?,
        markup = sanitize_markup(fragment, tuning, vocabulary),
        dictionary = serde_json::to_string_pretty(&dictionary)?,
    );

    Ok(MappingRequest {
        system: SYSTEM_PROMPT.to_string(),
        prompt,
    })
}

// ── Reply ───────────────────────────────────────────────────────────

/// Remove `//` comments that sit outside JSON string literals.
pub fn strip_comments(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut chars = json.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[derive(Deserialize)]
struct Reply {
    mappings: Vec<FieldMapping>,
}

/// Parse a completion reply. `None` means the reply is unusable.
///
/// Flat objects only count when their keys name fields of `fields`.
pub fn parse_reply(reply: &str, fields: &[FieldDescriptor]) -> Option<Vec<FieldMapping>> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    let cleaned = strip_comments(&reply[start..=end]);

    if let Ok(parsed) = serde_json::from_str::<Reply>(&cleaned) {
        return Some(parsed.mappings);
    }
    // Flat `{"field": "value"}` objects are accepted as well
    let flat = match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&cleaned) {
        Ok(flat) => flat,
        Err(e) => {
            tracing::warn!("unparsable mapping reply: {e}");
            return None;
        }
    };
    let known: Vec<String> = fields.iter().map(FieldDescriptor::identifier).collect();
    let mappings: Vec<FieldMapping> = flat
        .into_iter()
        .filter(|(field, _)| known.contains(field))
        .filter_map(|(field, value)| value.as_str().map(|v| FieldMapping { field, value: v.to_string() }))
        .collect();
    if mappings.is_empty() {
        tracing::warn!("mapping reply names no field of the form");
        return None;
    }
    Some(mappings)
}

// ── Resolution ──────────────────────────────────────────────────────

fn fallback_candidate<'a>(candidates: &'a [String], vocabulary: &Vocabulary) -> Option<&'a String> {
    candidates
        .iter()
        .find(|c| mentions(c, &vocabulary.other_option))
        .or_else(|| candidates.last())
}

/// Enforce the mapping contract: one entry per field, enumerable values drawn
/// from the field's own candidates, free-text values pointing at dictionary keys.
pub fn normalize(
    fields: &[FieldDescriptor],
    mappings: &[FieldMapping],
    input: &InputData,
    vocabulary: &Vocabulary,
) -> Vec<FieldMapping> {
    fields
        .iter()
        .filter_map(|field| {
            let id = field.identifier();
            let mapped = mappings
                .iter()
                .find(|m| m.field == id)
                .map(|m| m.value.trim().to_string());

            let value = if field.is_enumerable() {
                let candidates = field.candidates();
                match mapped {
                    Some(v) if candidates.contains(&v) => v,
                    other => {
                        let fallback = fallback_candidate(candidates, vocabulary)?.clone();
                        tracing::debug!(field = %id, mapped = ?other, %fallback, "enumerable mapping replaced");
                        fallback
                    }
                }
            } else {
                match mapped {
                    Some(key) if input.contains_key(&key) => key,
                    Some(key) if !key.is_empty() => {
                        tracing::debug!(field = %id, %key, "mapped key is not in the input data");
                        return None;
                    }
                    _ => return None,
                }
            };
            Some(FieldMapping { field: id, value })
        })
        .collect()
}

/// Turn normalized mappings into literal writes. Text fields take the full dictionary value.
pub fn assignments(
    fields: &[FieldDescriptor],
    mappings: &[FieldMapping],
    input: &InputData,
) -> Vec<FieldAssignment> {
    mappings
        .iter()
        .filter_map(|mapping| {
            let field = fields.iter().find(|f| f.identifier() == mapping.field)?;
            let value = if field.is_enumerable() {
                mapping.value.clone()
            } else {
                input.get(&mapping.value)?.clone()
            };
            Some(FieldAssignment {
                field: field.clone(),
                value,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::ChoiceKind;

    fn text(name: &str) -> FieldDescriptor {
        FieldDescriptor::Text {
            name: name.into(),
            tag: "input".into(),
            subtype: Some("text".into()),
            placeholder: None,
            label: None,
        }
    }

    fn radio(name: &str, candidates: &[&str]) -> FieldDescriptor {
        FieldDescriptor::Choice {
            name: name.into(),
            kind: ChoiceKind::Radio,
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
            label: None,
        }
    }

    fn mapping(field: &str, value: &str) -> FieldMapping {
        FieldMapping {
            field: field.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_sanitizer_keeps_structure_only() {
        let html = r#"
            <!-- tracking -->
            <div class="row" id="x"><label style="color:red">Name</label>
                <input type="text" name="name" placeholder="Taro" class="big" required>
                <script>alert(1)</script><style>.a{}</style>
                <input type="radio" name="r" value="a" id="ra">
                <select name="s" id="sel"><option value="1" selected>One</option></select>
            </div>
            <p>個人情報の取り扱いについて</p>
            <p></p>"#;
        let out = sanitize_markup(html, &Tuning::default(), &Vocabulary::default());
        assert_eq!(
            out,
            r#"<div><label>Name</label><input name="name" placeholder="Taro"><input name="r" value="a"><select name="s"><option value="1">One</option></select></div>"#
        );
    }

    #[test]
    fn test_sanitizer_prunes_long_option_lists() {
        let options: String = (0..6).map(|i| format!("<option value=\"{i}\">{i}</option>")).collect();
        let html = format!("<select name=\"pref\">{options}</select>");
        let tuning = Tuning {
            max_prompt_options: 5,
            ..Tuning::default()
        };
        let out = sanitize_markup(&html, &tuning, &Vocabulary::default());
        assert_eq!(out, r#"<select name="pref"></select>"#);
    }

    #[test]
    fn test_strip_comments_respects_strings() {
        let raw = "{\n \"url\": \"https://example.com\", // the site\n \"a\": \"b\" // note\n}";
        let cleaned = strip_comments(raw);
        let parsed: serde_json::Value = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(parsed["url"], "https://example.com");
        assert_eq!(parsed["a"], "b");
    }

    #[test]
    fn test_parse_reply_finds_json_in_prose() {
        let reply = "Sure! Here it is:\n```json\n{\"mappings\": [\n  {\"field\": \"company\", \"value\": \"company\"} // text\n]}\n```";
        assert_eq!(parse_reply(reply, &[text("company")]), Some(vec![mapping("company", "company")]));
    }

    #[test]
    fn test_parse_reply_accepts_flat_object() {
        let fields = [text("email"), text("n")];
        let parsed = parse_reply(r#"{"email": "email", "n": 3, "notes": "x"}"#, &fields).unwrap();
        assert_eq!(parsed, vec![mapping("email", "email")]);
    }

    #[test]
    fn test_parse_reply_rejects_flat_object_without_known_fields() {
        let fields = [text("company"), radio("plan", &["basic", "pro"])];
        assert_eq!(parse_reply(r#"{"error": "cannot map this form"}"#, &fields), None);
    }

    #[test]
    fn test_parse_reply_rejects_garbage() {
        assert_eq!(parse_reply("no json here", &[text("company")]), None);
        assert_eq!(parse_reply("{ not: json, }", &[text("company")]), None);
    }

    #[test]
    fn test_normalize_enforces_candidates() {
        let fields = vec![
            radio("how", &["email", "phone"]),
            radio("topic", &["sales", "その他", "press"]),
            text("company"),
            text("fax"),
        ];
        let input: InputData = [("company".to_string(), "Acme".to_string())].into();
        let replies = vec![
            mapping("how", "carrier pigeon"),
            mapping("topic", "nonsense"),
            mapping("company", "company"),
            mapping("fax", "fax_number"),
        ];
        let normalized = normalize(&fields, &replies, &input, &Vocabulary::default());
        assert_eq!(
            normalized,
            vec![
                mapping("how", "phone"),
                mapping("topic", "その他"),
                mapping("company", "company"),
            ]
        );
    }

    #[test]
    fn test_missing_enumerable_still_selected() {
        let fields = vec![radio("contact_method", &["email", "phone"])];
        let normalized = normalize(&fields, &[], &InputData::new(), &Vocabulary::default());
        assert_eq!(normalized, vec![mapping("contact_method", "phone")]);
    }

    #[test]
    fn test_assignments_use_full_values() {
        let fields = vec![text("message")];
        let long = "x".repeat(200);
        let input: InputData = [("body".to_string(), long.clone())].into();
        let writes = assignments(&fields, &[mapping("message", "body")], &input);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, long);
    }

    #[test]
    fn test_prompt_previews_long_values_and_keys_are_stable() {
        let fields = vec![text("message")];
        let input: InputData = [("body".to_string(), "y".repeat(100))].into();
        let request = build_request(&fields, "<input name=\"message\">", &input, &Tuning::default(), &Vocabulary::default()).unwrap();
        assert!(request.prompt.contains(&"y".repeat(40)));
        assert!(!request.prompt.contains(&"y".repeat(41)));
        assert!(request.prompt.contains("\"id\":\"message\""));
        let a = request.cache_key("example.com__contact");
        let b = request.cache_key("example.com__contact");
        let c = request.cache_key("example.com__other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
