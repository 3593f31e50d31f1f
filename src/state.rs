use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};

use crate::config::{mentions, Limits, PilotConfig};
use crate::driver::{FormPage, FrameContext, Target};
use crate::error::Result;
use crate::llm::{Completion, CompletionRequest};
use crate::mapping::strip_comments;
use crate::result::{ConfirmResult, InputResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Input,
    Confirm,
    Complete,
    Error,
    Done,
    /// Classification was inconclusive; must resolve before continuing.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PhaseStarted(Phase),
    Classified(Phase),
    Audited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    pub input_trial_count: u32,
    pub error_trial_count: u32,
    pub total_trial_count: u32,
    /// URL at the start of the last phase action.
    pub last_phase_url: Option<String>,
    pub last_input_result: InputResult,
    pub last_confirm_result: ConfirmResult,
    /// The last INPUT or CONFIRM action that ran.
    pub last_action: Option<Phase>,
    /// Whether any classification reached COMPLETE.
    pub completed: bool,
    pub halted: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Input,
            input_trial_count: 0,
            error_trial_count: 0,
            total_trial_count: 0,
            last_phase_url: None,
            last_input_result: InputResult::None,
            last_confirm_result: ConfirmResult::None,
            last_action: None,
            completed: false,
            halted: false,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Result code of the action that ran last is terminal.
    pub fn last_result_terminal(&self) -> bool {
        match self.last_action {
            Some(Phase::Input) => self.last_input_result.is_terminal(),
            Some(Phase::Confirm) => self.last_confirm_result.is_terminal(),
            _ => false,
        }
    }
}

/// Advance the session by one event.
pub fn transition(state: &SessionState, event: Event, limits: &Limits) -> SessionState {
    let mut next = state.clone();
    next.total_trial_count += 1;

    match event {
        Event::PhaseStarted(Phase::Input) => {
            next.input_trial_count += 1;
            next.last_action = Some(Phase::Input);
            next.last_input_result = InputResult::None;
            if next.input_trial_count > limits.max_input_trials {
                next.phase = Phase::Error;
                next.halted = true;
            } else {
                next.phase = Phase::Input;
            }
        }
        Event::PhaseStarted(Phase::Confirm) => {
            next.last_action = Some(Phase::Confirm);
            next.last_confirm_result = ConfirmResult::None;
            next.phase = Phase::Confirm;
        }
        Event::PhaseStarted(_) => {}
        Event::Classified(phase) => {
            let stalled = match (state.last_action, phase) {
                (Some(Phase::Input), Phase::Input) => true,
                (Some(Phase::Confirm), Phase::Confirm | Phase::Input) => true,
                _ => false,
            };
            next.phase = if stalled { Phase::Error } else { phase };
            if next.phase == Phase::Complete {
                next.completed = true;
            }
        }
        Event::Audited => match state.phase {
            Phase::Complete => next.phase = Phase::Done,
            Phase::Error => {
                let retry = !state.halted
                    && !state.last_input_result.is_fatal()
                    && state.error_trial_count < limits.max_error_retries;
                if retry {
                    next.error_trial_count += 1;
                    next.phase = Phase::Input;
                } else {
                    next.phase = Phase::Done;
                    next.halted = true;
                }
            }
            _ => {}
        },
    }

    // COMPLETE always settles on the next audit, so the ceiling leaves it alone
    if next.total_trial_count >= limits.max_total_trials
        && !matches!(next.phase, Phase::Done | Phase::Error | Phase::Complete)
    {
        next.phase = Phase::Error;
        next.halted = true;
    }
    next
}

// ── Content density ─────────────────────────────────────────────────

fn skipped(el: ElementRef<'_>) -> bool {
    let boilerplate = matches!(
        el.value().name(),
        "header" | "footer" | "nav" | "aside" | "script" | "style" | "noscript" | "template"
    );
    boilerplate || el.value().classes().any(|c| c == "sidebar")
}

fn visible_text(el: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    collect_text(el, &mut parts);
    parts.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(el: ElementRef<'_>, out: &mut Vec<String>) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push(text.to_string()),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    if !skipped(child) {
                        collect_text(child, out);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Text of the content-densest subtree of a page, boilerplate removed.
///
/// Starting at `body`, descend into the child holding the most text while it
/// holds at least `dense_share` of its parent's.
pub fn densest_text(html: &str, dense_share: f64, limit: usize) -> String {
    let doc = Html::parse_document(html);
    let root = Selector::parse("body")
        .ok()
        .and_then(|body| doc.select(&body).next())
        .unwrap_or_else(|| doc.root_element());

    let mut current = root;
    let mut current_len = visible_text(current).chars().count();
    loop {
        let best = current
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| !skipped(*c))
            .map(|c| (c, visible_text(c).chars().count()))
            .max_by_key(|(_, len)| *len);
        match best {
            Some((child, len)) if current_len > 0 && len as f64 >= dense_share * current_len as f64 => {
                current = child;
                current_len = len;
            }
            _ => break,
        }
    }
    visible_text(current).chars().take(limit).collect()
}

// ── Classifier ──────────────────────────────────────────────────────

const CLASSIFY_SYSTEM: &str = "You analyse web pages reached after submitting a contact form.";

#[derive(Deserialize)]
struct ClassifyReply {
    state: String,
    #[serde(default)]
    confident: bool,
}

/// Map a classification reply onto a phase. Anything inconclusive is UNKNOWN.
pub fn parse_classification(reply: &str) -> Phase {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Phase::Unknown;
    };
    if end < start {
        return Phase::Unknown;
    }
    let Ok(parsed) = serde_json::from_str::<ClassifyReply>(&strip_comments(&reply[start..=end])) else {
        return Phase::Unknown;
    };
    if !parsed.confident {
        return Phase::Unknown;
    }
    match parsed.state.trim().to_lowercase().as_str() {
        "complete" => Phase::Complete,
        "confirm" => Phase::Confirm,
        "error" => Phase::Error,
        _ => Phase::Unknown,
    }
}

/// Path and query of a URL; keyword rules never look at the host.
fn url_tail(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => format!("{}?{}", parsed.path(), parsed.query().unwrap_or_default()),
        Err(_) => raw.to_string(),
    }
}

pub struct StateClassifier<'a> {
    completion: &'a dyn Completion,
    config: &'a PilotConfig,
}

impl<'a> StateClassifier<'a> {
    pub fn new(completion: &'a dyn Completion, config: &'a PilotConfig) -> Self {
        Self { completion, config }
    }

    /// Decide the next phase from the page and the last result codes.
    pub async fn classify<P: FormPage + ?Sized>(
        &self,
        page: &P,
        state: &SessionState,
        ctx: &FrameContext,
    ) -> Result<Phase> {
        let vocabulary = &self.config.vocabulary;

        if state.last_result_terminal() {
            tracing::debug!(input = ?state.last_input_result, confirm = ?state.last_confirm_result, "terminal result code");
            return Ok(Phase::Error);
        }

        let mut contexts = vec![FrameContext::Main];
        if *ctx != FrameContext::Main {
            contexts.push(ctx.clone());
        }

        for context in &contexts {
            if page.has_invalid_field(context).await.unwrap_or(false) {
                tracing::debug!("a field reports an invalid state");
                return Ok(Phase::Error);
            }
        }

        for context in &contexts {
            for marker in &vocabulary.success_markers {
                if page.count(context, &Target::css(None, marker.clone())).await.unwrap_or(0) > 0 {
                    tracing::debug!(%marker, "success marker present");
                    return Ok(Phase::Complete);
                }
            }
        }

        let url = page.current_url().await?;
        if state.last_phase_url.as_deref() != Some(url.as_str()) {
            let tail = url_tail(&url);
            if mentions(&tail, &vocabulary.url_confirm) {
                return Ok(Phase::Confirm);
            }
            if mentions(&tail, &vocabulary.url_complete) {
                return Ok(Phase::Complete);
            }
        }

        let buttons = page.buttons(ctx).await.unwrap_or_default();
        let advance = buttons.iter().any(|b| {
            b.submit_capable
                && !b.disabled
                && mentions(&b.text, &vocabulary.button_advance)
                && !mentions(&b.text, &vocabulary.button_send)
        });
        if advance {
            tracing::debug!("page still offers a next-step button");
            return Ok(Phase::Error);
        }

        Ok(self.ask(page, &url).await)
    }

    async fn ask<P: FormPage + ?Sized>(&self, page: &P, url: &str) -> Phase {
        let tuning = &self.config.tuning;
        let html = match page.html().await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!("page content unavailable for classification: {e}");
                return Phase::Unknown;
            }
        };
        let text = densest_text(&html, tuning.dense_share, tuning.classify_chars);
        let prompt = format!(
            "A contact form was just submitted and led to the page below.\n\
             URL: {url}\n\
             Page text:\n{text}\n\n\
             Classify the page as one of:\n\
             - \"complete\": the message was accepted (thank-you or sent notice)\n\
             - \"confirm\": the page asks to review the input before sending\n\
             - \"error\": validation errors are shown or the form is still waiting for input\n\n\
             Reply with JSON only: {{\"state\": \"complete\" | \"confirm\" | \"error\", \"confident\": true | false}}"
        );
        let request = CompletionRequest::new(&tuning.classify_model, prompt).with_system(CLASSIFY_SYSTEM);
        match self.completion.complete(&request).await {
            Ok(reply) => {
                let phase = parse_classification(&reply);
                tracing::debug!(?phase, "page classified by completion");
                phase
            }
            Err(e) => {
                tracing::warn!("classification request failed: {e}");
                Phase::Unknown
            }
        }
    }
}
