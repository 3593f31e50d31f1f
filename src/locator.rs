use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};

use crate::config::{mentions, PilotConfig, Vocabulary};
use crate::driver::{ElementMarkup, FormPage, FrameContext};
use crate::fields::Anchor;
use crate::error::Result;

const FORM_TOKEN: &str = "form";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    MainDocument,
    Frame,
    RawMarkup,
}

/// The form chosen for one INPUT attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSnapshot {
    /// Inner markup of the form, or the raw-text slice for [`DiscoveryMethod::RawMarkup`].
    pub html: String,
    pub origin: FrameContext,
    pub method: DiscoveryMethod,
    /// Position among the `form` elements of `origin`; lookups are scoped by it.
    pub form_index: Option<usize>,
    /// Raw markup ahead of the slice, for [`DiscoveryMethod::RawMarkup`] only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leading: Option<String>,
}

impl FormSnapshot {
    /// How locators extracted from this snapshot resolve on the page.
    pub fn anchor(&self) -> Anchor<'_> {
        match self.form_index {
            Some(index) => Anchor::Form(index),
            None => Anchor::Document {
                leading: self.leading.as_deref().unwrap_or_default(),
            },
        }
    }
}

/// Whether a fragment is a site-search form rather than a contact form.
pub fn is_search_form(fragment: &str, vocabulary: &Vocabulary) -> bool {
    let doc = Html::parse_fragment(fragment);
    doc.root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "input")
        .any(|el| {
            let attr = |name: &str| el.value().attr(name).unwrap_or_default();
            attr("type").eq_ignore_ascii_case("search")
                || attr("name") == "q"
                || mentions(attr("placeholder"), &vocabulary.search)
        })
}

fn count_inputs(fragment: &str) -> usize {
    let doc = Html::parse_fragment(fragment);
    doc.root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "input")
        .count()
}

/// Index of the longest non-search candidate. Ties keep the earliest.
pub fn select_candidate(candidates: &[ElementMarkup], vocabulary: &Vocabulary) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if is_search_form(&candidate.outer_html, vocabulary) {
            continue;
        }
        let len = candidate.inner_html.len();
        if best.map_or(true, |(_, best_len)| len > best_len) {
            best = Some((index, len));
        }
    }
    best.map(|(index, _)| index)
}

/// Slice from the first to the end of the last `form` token of a raw document,
/// accepted when it holds more than one input and is not a search form.
pub fn raw_form_fragment(raw: &str, vocabulary: &Vocabulary) -> Option<String> {
    raw_form_span(raw, vocabulary).map(|span| raw[span].to_string())
}

fn raw_form_span(raw: &str, vocabulary: &Vocabulary) -> Option<std::ops::Range<usize>> {
    let start = raw.find(FORM_TOKEN)?;
    let end = raw.rfind(FORM_TOKEN)? + FORM_TOKEN.len();
    let fragment = &raw[start..end];
    (count_inputs(fragment) > 1 && !is_search_form(fragment, vocabulary)).then_some(start..end)
}

/// Find the most likely contact form. `Ok(None)` means no form on the page.
pub async fn locate_form<P: FormPage + ?Sized>(
    page: &P,
    config: &PilotConfig,
) -> Result<Option<FormSnapshot>> {
    let vocabulary = &config.vocabulary;

    let main = page
        .elements_markup(&FrameContext::Main, FORM_TOKEN, std::time::Duration::ZERO)
        .await?;
    if let Some(index) = select_candidate(&main, vocabulary) {
        tracing::debug!(form_index = index, candidates = main.len(), "form found in main document");
        return Ok(Some(FormSnapshot {
            html: main[index].inner_html.clone(),
            origin: FrameContext::Main,
            method: DiscoveryMethod::MainDocument,
            form_index: Some(index),
            leading: None,
        }));
    }

    let frame_wait = std::time::Duration::from_millis(config.timeouts.frame_form_ms);
    let mut best: Option<FormSnapshot> = None;
    for frame in page.child_frames().await? {
        let candidates = match page.elements_markup(&frame, FORM_TOKEN, frame_wait).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!(?frame, "no form readable in frame: {e}");
                continue;
            }
        };
        let Some(index) = select_candidate(&candidates, vocabulary) else {
            continue;
        };
        let html = &candidates[index].inner_html;
        if best.as_ref().map_or(true, |b| html.len() > b.html.len()) {
            best = Some(FormSnapshot {
                html: html.clone(),
                origin: frame.clone(),
                method: DiscoveryMethod::Frame,
                form_index: Some(index),
                leading: None,
            });
        }
    }
    if let Some(snapshot) = best {
        tracing::debug!(origin = ?snapshot.origin, "form found in frame");
        return Ok(Some(snapshot));
    }

    tracing::info!("no form in the DOM, trying the raw response body");
    let Some(raw) = page.raw_document().await? else {
        return Ok(None);
    };
    Ok(raw_form_span(&raw, vocabulary).map(|span| FormSnapshot {
        leading: Some(raw[..span.start].to_string()),
        html: raw[span].to_string(),
        origin: FrameContext::Main,
        method: DiscoveryMethod::RawMarkup,
        form_index: None,
    }))
}
