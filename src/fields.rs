use std::collections::HashMap;

use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};

use crate::config::{mentions, Vocabulary};
use crate::driver::{css_string, Target};

/// Input types that never carry user data.
const NON_FIELD_INPUTS: &[&str] = &["hidden", "submit", "button", "reset", "image", "file"];

/// Attributes that pin a control down in a document-wide selector.
const ANCHOR_ATTRS: &[&str] = &["id", "type", "name", "value", "placeholder", "href", "alt", "src"];

/// Where locators built from a fragment resolve on the live page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor<'a> {
    /// The fragment is the inner markup of the `n`th form of its context.
    Form(usize),
    /// No form element survived in the DOM. Locators are document-wide and
    /// skip the matches found in `leading`, the markup ahead of the fragment.
    Document { leading: &'a str },
}

impl Anchor<'_> {
    fn scope(&self) -> Option<usize> {
        match self {
            Self::Form(index) => Some(*index),
            Self::Document { .. } => None,
        }
    }

    /// Locator for `el`, which sits at `index` among its same-tag elements in the fragment.
    fn target(&self, doc: &Html, el: ElementRef<'_>, index: usize) -> Target {
        let tag = el.value().name();
        let Self::Document { leading } = self else {
            return Target::nth(self.scope(), tag, index);
        };
        let selector = attribute_selector(el);
        let Ok(parsed) = Selector::parse(&selector) else {
            return Target::nth(None, tag, index);
        };
        let within = doc
            .select(&parsed)
            .position(|m| m.id() == el.id())
            .unwrap_or_default();
        let before = Html::parse_fragment(leading).select(&parsed).count();
        Target::nth(None, selector, before + within)
    }
}

fn attribute_selector(el: ElementRef<'_>) -> String {
    let mut selector = el.value().name().to_string();
    for attr in ANCHOR_ATTRS {
        if let Some(value) = el.value().attr(attr).filter(|v| !v.is_empty()) {
            selector.push_str(&format!("[{attr}={}]", css_string(value)));
        }
    }
    selector
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceKind {
    Radio,
    Checkbox,
    Select,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldDescriptor {
    Text {
        name: String,
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Choice {
        name: String,
        kind: ChoiceKind,
        candidates: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// A field without a usable name, addressed by its position among same-tag elements.
    Positional {
        tag: String,
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        candidates: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        /// Document-wide locator, set when the form has no element to scope by.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locator: Option<Target>,
    },
}

impl FieldDescriptor {
    /// The key this field is known by in a mapping: its name, or `tag[index]`.
    pub fn identifier(&self) -> String {
        match self {
            Self::Text { name, .. } | Self::Choice { name, .. } => name.clone(),
            Self::Positional { tag, index, .. } => format!("{tag}[{index}]"),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Text { tag, .. } | Self::Positional { tag, .. } => tag,
            Self::Choice { kind: ChoiceKind::Select, .. } => "select",
            Self::Choice { .. } => "input",
        }
    }

    pub fn subtype(&self) -> Option<&str> {
        match self {
            Self::Text { subtype, .. } | Self::Positional { subtype, .. } => subtype.as_deref(),
            Self::Choice { kind: ChoiceKind::Radio, .. } => Some("radio"),
            Self::Choice { kind: ChoiceKind::Checkbox, .. } => Some("checkbox"),
            Self::Choice { kind: ChoiceKind::Select, .. } => None,
        }
    }

    /// Values an enumerable field may be mapped to. Empty for free-text fields.
    pub fn candidates(&self) -> &[String] {
        match self {
            Self::Text { .. } => &[],
            Self::Choice { candidates, .. } | Self::Positional { candidates, .. } => candidates,
        }
    }

    pub fn is_enumerable(&self) -> bool {
        self.tag() == "select" || matches!(self.subtype(), Some("radio" | "checkbox"))
    }
}

/// Which cascade stage matched the submit control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStage {
    SubmitType,
    LinkText,
    ButtonText,
    NestedText,
    ImageAlt,
    BtnClass,
    DivOnclick,
    LastButton,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDescriptor {
    pub tag_kind: String,
    /// What identified the control, e.g. `type=submit` or `text=送信`.
    pub discriminator: String,
    pub target: Target,
    pub stage: SubmitStage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub fields: Vec<FieldDescriptor>,
    pub submit: Option<SubmitDescriptor>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Document-order element list with each element's index among same-tag elements.
struct Indexed<'a> {
    doc: &'a Html,
    elements: Vec<(ElementRef<'a>, usize)>,
}

impl<'a> Indexed<'a> {
    fn new(doc: &'a Html) -> Self {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let elements = doc
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .map(|el| {
                let counter = seen.entry(el.value().name()).or_default();
                let index = *counter;
                *counter += 1;
                (el, index)
            })
            .collect();
        Self { doc, elements }
    }

    fn iter(&self) -> impl Iterator<Item = &(ElementRef<'a>, usize)> {
        self.elements.iter()
    }
}

fn collapse(text: impl Iterator<Item = impl AsRef<str>>) -> String {
    let joined: String = text.map(|t| t.as_ref().to_string()).collect::<Vec<_>>().join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible text of an element, excluding the contents of nested controls.
fn own_text(el: ElementRef<'_>) -> String {
    let texts = el.descendants().filter_map(|node| {
        let Node::Text(text) = node.value() else {
            return None;
        };
        let inside_control = node
            .ancestors()
            .take_while(|a| a.id() != el.id())
            .filter_map(ElementRef::wrap)
            .any(|a| {
                matches!(
                    a.value().name(),
                    "select" | "option" | "textarea" | "script" | "style"
                )
            });
        (!inside_control).then(|| text.to_string())
    });
    collapse(texts)
}

/// Text nodes that are direct children of the element.
fn direct_text(el: ElementRef<'_>) -> String {
    collapse(el.children().filter_map(|node| match node.value() {
        Node::Text(text) => Some(text.to_string()),
        _ => None,
    }))
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

fn label_for(el: ElementRef<'_>, by_id: &HashMap<String, String>) -> Option<String> {
    if let Some(label) = el.value().id().and_then(|id| by_id.get(id)) {
        return Some(label.clone());
    }

    let ancestors: Vec<ElementRef<'_>> = el.ancestors().filter_map(ElementRef::wrap).collect();
    if let Some(label) = ancestors.iter().find(|a| a.value().name() == "label") {
        if let Some(text) = non_empty(own_text(*label)) {
            return Some(text);
        }
    }

    for ancestor in &ancestors {
        match ancestor.value().name() {
            "tr" => {
                let header = ancestor
                    .children()
                    .filter_map(ElementRef::wrap)
                    .find(|c| c.value().name() == "th");
                if let Some(text) = header.map(own_text).and_then(non_empty) {
                    return Some(text);
                }
            }
            "dd" => {
                let term = ancestor
                    .prev_siblings()
                    .filter_map(ElementRef::wrap)
                    .find(|s| s.value().name() == "dt");
                if let Some(text) = term.map(own_text).and_then(non_empty) {
                    return Some(text);
                }
            }
            _ => {}
        }
    }
    None
}

/// One observed form control before merging.
struct RawField {
    tag: String,
    name: Option<String>,
    subtype: Option<String>,
    index: usize,
    placeholder: Option<String>,
    label: Option<String>,
    value: String,
    options: Vec<String>,
    locator: Option<Target>,
}

impl RawField {
    fn checkable(&self) -> Option<ChoiceKind> {
        match self.subtype.as_deref() {
            Some("radio") => Some(ChoiceKind::Radio),
            Some("checkbox") => Some(ChoiceKind::Checkbox),
            _ => None,
        }
    }

    fn into_positional(self) -> FieldDescriptor {
        let candidates = if self.checkable().is_some() {
            vec![self.value]
        } else {
            self.options
        };
        FieldDescriptor::Positional {
            tag: self.tag,
            index: self.index,
            subtype: self.subtype,
            candidates,
            placeholder: self.placeholder,
            label: self.label,
            locator: self.locator,
        }
    }
}

fn select_options(el: ElementRef<'_>, vocabulary: &Vocabulary) -> Vec<String> {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .filter(|o| o.value().name() == "option")
        .filter_map(|o| {
            let text = collapse(o.text());
            let value = o.value().attr("value").map(str::to_string).unwrap_or_else(|| text.clone());
            if value.trim().is_empty() || mentions(&text, &vocabulary.select_placeholder) {
                None
            } else {
                Some(value)
            }
        })
        .collect()
}

fn collect_raw(indexed: &Indexed<'_>, anchor: Anchor<'_>, vocabulary: &Vocabulary) -> Vec<RawField> {
    let by_id: HashMap<String, String> = indexed
        .iter()
        .filter(|(el, _)| el.value().name() == "label")
        .filter_map(|(el, _)| {
            let target = el.value().attr("for")?;
            non_empty(own_text(*el)).map(|text| (target.to_string(), text))
        })
        .collect();

    indexed
        .iter()
        .filter_map(|(el, index)| {
            let tag = el.value().name();
            let attr = |name: &str| el.value().attr(name).map(str::to_string);
            let subtype = match tag {
                "input" => {
                    let kind = attr("type").unwrap_or_else(|| "text".into()).to_lowercase();
                    if NON_FIELD_INPUTS.contains(&kind.as_str()) {
                        return None;
                    }
                    Some(kind)
                }
                "textarea" | "select" => None,
                _ => return None,
            };
            let value = match subtype.as_deref() {
                Some("radio" | "checkbox") => attr("value").unwrap_or_else(|| "on".into()),
                _ => attr("value").unwrap_or_default(),
            };
            Some(RawField {
                tag: tag.to_string(),
                name: attr("name").filter(|n| !n.is_empty()),
                subtype,
                index: *index,
                placeholder: attr("placeholder").filter(|p| !p.is_empty()),
                label: label_for(*el, &by_id),
                value,
                options: if tag == "select" { select_options(*el, vocabulary) } else { Vec::new() },
                locator: matches!(anchor, Anchor::Document { .. })
                    .then(|| anchor.target(indexed.doc, *el, *index)),
            })
        })
        .collect()
}

/// Merge checkable siblings and demote names that would not be unique.
fn build_descriptors(raw: Vec<RawField>) -> Vec<FieldDescriptor> {
    // A claimant is one non-checkable element, or one (name, kind) checkable group.
    let mut claims: HashMap<String, Vec<Option<ChoiceKind>>> = HashMap::new();
    for field in &raw {
        let Some(name) = &field.name else { continue };
        let entry = claims.entry(name.clone()).or_default();
        match field.checkable() {
            Some(kind) if entry.contains(&Some(kind)) => {}
            kind => entry.push(kind),
        }
    }

    let mut descriptors: Vec<FieldDescriptor> = Vec::new();
    for field in raw {
        let Some(name) = field.name.clone() else {
            descriptors.push(field.into_positional());
            continue;
        };
        let claimants = &claims[&name];
        match field.checkable() {
            Some(kind) => {
                // The first checkable group of a name keeps it; later groups and
                // groups sharing the name with a plain field go positional.
                let owns_name = claimants.len() == 1
                    || claimants.iter().all(|c| c.is_some()) && claimants.first() == Some(&Some(kind));
                if !owns_name {
                    descriptors.push(field.into_positional());
                    continue;
                }
                let existing = descriptors.iter_mut().find_map(|d| match d {
                    FieldDescriptor::Choice { name: n, kind: k, candidates, .. }
                        if *n == name && *k == kind =>
                    {
                        Some(candidates)
                    }
                    _ => None,
                });
                match existing {
                    Some(candidates) => candidates.push(field.value),
                    None => descriptors.push(FieldDescriptor::Choice {
                        name,
                        kind,
                        candidates: vec![field.value],
                        label: field.label,
                    }),
                }
            }
            None if claimants.len() > 1 => descriptors.push(field.into_positional()),
            None if field.tag == "select" => descriptors.push(FieldDescriptor::Choice {
                name,
                kind: ChoiceKind::Select,
                candidates: field.options,
                label: field.label,
            }),
            None => descriptors.push(FieldDescriptor::Text {
                name,
                tag: field.tag,
                subtype: field.subtype,
                placeholder: field.placeholder,
                label: field.label,
            }),
        }
    }
    descriptors
}

fn matches_submit(text: &str, vocabulary: &Vocabulary) -> bool {
    !text.trim().is_empty() && mentions(text, &vocabulary.submit)
}

fn type_of(el: ElementRef<'_>) -> String {
    el.value().attr("type").unwrap_or_default().to_lowercase()
}

fn is_button_typed(el: ElementRef<'_>) -> bool {
    match el.value().name() {
        "input" => type_of(el) == "button",
        "button" => matches!(type_of(el).as_str(), "" | "button"),
        _ => false,
    }
}

/// Run the submit-locator cascade over a fragment.
fn locate_submit(
    indexed: &Indexed<'_>,
    anchor: Anchor<'_>,
    vocabulary: &Vocabulary,
) -> Option<SubmitDescriptor> {
    let describe = |el: ElementRef<'_>, index: usize, discriminator: String, stage: SubmitStage| {
        SubmitDescriptor {
            target: anchor.target(indexed.doc, el, index),
            tag_kind: el.value().name().to_string(),
            discriminator,
            stage,
        }
    };
    let last_where = |pred: &dyn Fn(ElementRef<'_>) -> Option<String>, stage: SubmitStage| {
        indexed
            .iter()
            .filter_map(|(el, index)| pred(*el).map(|d| (*el, *index, d)))
            .last()
            .map(|(el, index, d)| describe(el, index, d, stage))
    };

    // 1. explicit submit type, first in document order
    let explicit = indexed.iter().find(|(el, _)| {
        matches!(el.value().name(), "input" | "button") && type_of(*el) == "submit"
    });
    if let Some((el, index)) = explicit {
        return Some(describe(*el, *index, "type=submit".into(), SubmitStage::SubmitType));
    }

    let stages: [(SubmitStage, &dyn Fn(ElementRef<'_>) -> Option<String>); 6] = [
        (SubmitStage::LinkText, &|el| {
            let text = own_text(el);
            (el.value().name() == "a" && matches_submit(&text, vocabulary))
                .then(|| format!("text={text}"))
        }),
        (SubmitStage::ButtonText, &|el| {
            if !is_button_typed(el) {
                return None;
            }
            let value = el.value().attr("value").unwrap_or_default().to_string();
            let text = if value.is_empty() { direct_text(el) } else { value };
            matches_submit(&text, vocabulary).then(|| format!("text={text}"))
        }),
        (SubmitStage::NestedText, &|el| {
            if el.value().name() != "button" || type_of(el) == "reset" {
                return None;
            }
            el.descendants()
                .skip(1)
                .filter_map(ElementRef::wrap)
                .map(own_text)
                .find(|text| matches_submit(text, vocabulary))
                .map(|text| format!("text={text}"))
        }),
        (SubmitStage::ImageAlt, &|el| {
            let image = match el.value().name() {
                "input" => type_of(el) == "image",
                "img" => true,
                _ => false,
            };
            if !image {
                return None;
            }
            ["alt", "src", "name"].iter().find_map(|attr| {
                let value = el.value().attr(attr)?;
                mentions(value, &vocabulary.submit_image).then(|| format!("{attr}={value}"))
            })
        }),
        (SubmitStage::BtnClass, &|el| {
            let styled = el.value().attr("class").map_or(false, |class| {
                class.split_whitespace().any(|token| token.to_lowercase().contains("btn"))
            });
            if !styled || !matches_submit(&own_text(el), vocabulary) {
                return None;
            }
            el.value().attr("class").map(|class| format!("class={class}"))
        }),
        (SubmitStage::DivOnclick, &|el| {
            let onclick = el.value().attr("onclick")?;
            (el.value().name() == "div" && mentions(onclick, &vocabulary.submit_onclick))
                .then(|| format!("onclick={onclick}"))
        }),
    ];

    for (stage, pred) in stages.iter() {
        if let Some(found) = last_where(*pred, *stage) {
            return Some(found);
        }
    }

    last_where(
        &|el| {
            let generic = match el.value().name() {
                "button" => type_of(el) != "reset",
                "input" => type_of(el) == "button",
                _ => false,
            };
            generic.then(|| format!("type={}", type_of(el)))
        },
        SubmitStage::LastButton,
    )
}

/// Extract field descriptors and the submit control from a form fragment.
///
/// `scope` is the form's index in its context and is carried into every locator.
pub fn extract(fragment: &str, scope: Option<usize>, vocabulary: &Vocabulary) -> Extraction {
    let anchor = match scope {
        Some(index) => Anchor::Form(index),
        None => Anchor::Document { leading: "" },
    };
    extract_anchored(fragment, anchor, vocabulary)
}

pub fn extract_anchored(fragment: &str, anchor: Anchor<'_>, vocabulary: &Vocabulary) -> Extraction {
    if fragment.trim().is_empty() {
        return Extraction::default();
    }
    let doc = Html::parse_fragment(fragment);
    let indexed = Indexed::new(&doc);
    let fields = build_descriptors(collect_raw(&indexed, anchor, vocabulary));
    let submit = locate_submit(&indexed, anchor, vocabulary);
    tracing::debug!(fields = fields.len(), submit = ?submit.as_ref().map(|s| s.stage), "form extracted");
    Extraction { fields, submit }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        Vocabulary::default()
    }

    #[test]
    fn test_radio_siblings_merge_into_one_choice() {
        let html = r#"
            <input type="radio" name="plan" value="a">
            <input type="radio" name="plan" value="b">
            <input type="radio" name="plan" value="c">
            <input type="radio" name="plan" value="d">"#;
        let extraction = extract(html, Some(0), &vocab());
        assert_eq!(extraction.fields.len(), 1);
        match &extraction.fields[0] {
            FieldDescriptor::Choice { name, kind, candidates, .. } => {
                assert_eq!(name, "plan");
                assert_eq!(*kind, ChoiceKind::Radio);
                assert_eq!(candidates, &["a", "b", "c", "d"]);
            }
            other => panic!("unexpected descriptor {other:?}"),
        }
    }

    #[test]
    fn test_hidden_and_button_inputs_are_not_fields() {
        let html = r#"
            <input type="hidden" name="token" value="x">
            <input type="submit" value="送信">
            <input type="reset">
            <input type="file" name="attachment">
            <input name="company">"#;
        let extraction = extract(html, None, &vocab());
        let ids: Vec<String> = extraction.fields.iter().map(|f| f.identifier()).collect();
        assert_eq!(ids, ["company"]);
        assert_eq!(extraction.fields[0].subtype(), Some("text"));
    }

    #[test]
    fn test_select_drops_empty_and_placeholder_options() {
        let html = r#"
            <select name="topic">
                <option value="">--</option>
                <option value="x">選択してください</option>
                <option value="sales">Sales</option>
                <option>Support</option>
            </select>"#;
        let extraction = extract(html, None, &vocab());
        assert_eq!(extraction.fields[0].candidates(), ["sales", "Support"]);
    }

    #[test]
    fn test_unnamed_and_duplicate_names_become_positional() {
        let html = r#"
            <input name="tel[]"><input name="tel[]">
            <textarea></textarea>"#;
        let extraction = extract(html, Some(2), &vocab());
        let ids: Vec<String> = extraction.fields.iter().map(|f| f.identifier()).collect();
        assert_eq!(ids, ["input[0]", "input[1]", "textarea[0]"]);
    }

    #[test]
    fn test_identifiers_are_unique() {
        let html = r#"
            <input type="radio" name="x" value="1">
            <input type="checkbox" name="x" value="2">
            <input name="x">"#;
        let extraction = extract(html, None, &vocab());
        let mut ids: Vec<String> = extraction.fields.iter().map(|f| f.identifier()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn test_labels_from_for_enclosing_and_row_header() {
        let html = r#"
            <label for="c">Company</label><input id="c" name="company">
            <label>Email <input name="email"></label>
            <table><tr><th>Message</th><td><textarea name="message"></textarea></td></tr></table>
            <dl><dt>Phone</dt><dd><input name="tel"></dd></dl>"#;
        let extraction = extract(html, None, &vocab());
        let labels: Vec<Option<String>> = extraction
            .fields
            .iter()
            .map(|f| match f {
                FieldDescriptor::Text { label, .. } => label.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(
            labels,
            [
                Some("Company".to_string()),
                Some("Email".to_string()),
                Some("Message".to_string()),
                Some("Phone".to_string())
            ]
        );
    }

    #[test]
    fn test_submit_cascade_prefers_explicit_type() {
        let html = r#"
            <a href="/send">送信する</a>
            <input name="a">
            <button type="submit">Go</button>"#;
        let submit = extract(html, Some(1), &vocab()).submit.unwrap();
        assert_eq!(submit.stage, SubmitStage::SubmitType);
        assert_eq!(submit.target, Target::nth(Some(1), "button", 0));
    }

    #[test]
    fn test_keyword_stage_takes_last_match() {
        let html = r#"
            <input name="a">
            <a href="/confirm">確認</a>
            <a href="/privacy">Privacy</a>
            <a href="/send">送信</a>"#;
        let submit = extract(html, Some(0), &vocab()).submit.unwrap();
        assert_eq!(submit.stage, SubmitStage::LinkText);
        assert_eq!(submit.target, Target::nth(Some(0), "a", 2));
    }

    #[test]
    fn test_nested_text_and_image_stages() {
        let nested = r#"<input name="a"><button type="button"><span>送信</span></button>"#;
        let submit = extract(nested, None, &vocab()).submit.unwrap();
        assert_eq!(submit.stage, SubmitStage::NestedText);

        let image = r#"<input name="a"><input type="image" src="btn.png" alt="送信する">"#;
        let submit = extract(image, None, &vocab()).submit.unwrap();
        assert_eq!(submit.stage, SubmitStage::ImageAlt);
        assert_eq!(submit.discriminator, "alt=送信する");
    }

    #[test]
    fn test_div_onclick_and_last_button_stages() {
        let div = r#"<input name="a"><div onclick="document.f.submit()">OK</div>"#;
        let submit = extract(div, None, &vocab()).submit.unwrap();
        assert_eq!(submit.stage, SubmitStage::DivOnclick);

        let generic = r#"<input name="a"><button>A</button><button type="button">B</button>"#;
        let submit = extract(generic, None, &vocab()).submit.unwrap();
        assert_eq!(submit.stage, SubmitStage::LastButton);
        assert_eq!(submit.target, Target::nth(None, r#"button[type="button"]"#, 0));
    }

    #[test]
    fn test_formless_locators_skip_leading_controls() {
        let leading = r#"<header><button type="button">Menu</button><input name="q"></header><div><"#;
        let fragment = r#"<input name="company"><input placeholder="Phone"><input placeholder="Phone">
            <button type="button">送信</button>"#;
        let extraction = extract_anchored(fragment, Anchor::Document { leading }, &vocab());

        let submit = extraction.submit.unwrap();
        assert_eq!(submit.stage, SubmitStage::ButtonText);
        assert_eq!(submit.target, Target::nth(None, r#"button[type="button"]"#, 1));

        let locators: Vec<Option<Target>> = extraction
            .fields
            .iter()
            .filter_map(|f| match f {
                FieldDescriptor::Positional { locator, .. } => Some(locator.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            locators,
            [
                Some(Target::nth(None, r#"input[placeholder="Phone"]"#, 0)),
                Some(Target::nth(None, r#"input[placeholder="Phone"]"#, 1)),
            ]
        );
    }

    #[test]
    fn test_empty_fragment_is_empty_extraction() {
        assert!(extract("   ", None, &vocab()).is_empty());
        assert!(extract("<p>no controls</p>", None, &vocab()).is_empty());
    }
}
