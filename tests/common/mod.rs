#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use tokio::sync::oneshot;

use formpilot::config::{PilotConfig, Timeouts, Tuning};
use formpilot::driver::{
    ButtonProbe, CheckboxProbe, ElementMarkup, FormPage, FrameContext, OutcomeFlags, PageSignals,
    Target, BUTTON_SELECTOR, CHECKBOX_SELECTOR,
};
use formpilot::llm::{Completion, CompletionRequest};
use formpilot::mapping::{InputData, MappingCache};
use formpilot::store::{LocalImageStore, MemoryStore};
use formpilot::{Error, PageOpener, Result, RunContext, SessionServices};

/// An element resolved from the fake DOM, detached from the parsed tree.
#[derive(Debug, Clone)]
struct Resolved {
    ordinal: usize,
    tag: String,
    attrs: HashMap<String, String>,
    text: String,
}

impl Resolved {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    fn kind(&self) -> &str {
        self.attr("type").unwrap_or_default()
    }

    fn is_submit(&self) -> bool {
        match self.tag.as_str() {
            "input" => matches!(self.kind(), "submit" | "image"),
            "button" => matches!(self.kind(), "" | "submit"),
            _ => false,
        }
    }
}

#[derive(Default)]
struct FakeState {
    url: String,
    submitted: bool,
    values: HashMap<usize, String>,
    checked: HashSet<usize>,
    writes: Vec<(Target, String)>,
    clicks: Vec<Target>,
    submit_clicks: usize,
    navigated: Option<oneshot::Sender<String>>,
    dialog: Option<oneshot::Sender<String>>,
}

/// In-memory page: the DOM is static markup, field state lives beside it.
pub struct FakePage {
    dom: String,
    raw: Option<String>,
    after_submit_url: Option<String>,
    after_submit_html: Option<String>,
    invalid: bool,
    unreachable: Option<String>,
    mutation: Option<OutcomeFlags>,
    dialog_message: Option<String>,
    frames: Vec<Option<String>>,
    rejects_clicks: bool,
    state: Mutex<FakeState>,
}

impl FakePage {
    pub fn new(dom: impl Into<String>) -> Self {
        Self {
            dom: dom.into(),
            raw: None,
            after_submit_url: None,
            after_submit_html: None,
            invalid: false,
            unreachable: None,
            mutation: None,
            dialog_message: None,
            frames: Vec::new(),
            rejects_clicks: false,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn navigates_to(mut self, url: impl Into<String>) -> Self {
        self.after_submit_url = Some(url.into());
        self
    }

    pub fn shows_after_submit(mut self, html: impl Into<String>) -> Self {
        self.after_submit_html = Some(html.into());
        self
    }

    pub fn with_invalid_field(mut self) -> Self {
        self.invalid = true;
        self
    }

    /// Navigation to `url` fails the way a dead host does.
    pub fn unreachable(mut self, url: impl Into<String>) -> Self {
        self.unreachable = Some(url.into());
        self
    }

    /// After submit the outcome watch reports a validation message.
    pub fn fails_validation(mut self) -> Self {
        self.mutation = Some(OutcomeFlags { success: false, failure: true });
        self
    }

    /// After submit the outcome watch reports a thank-you message.
    pub fn confirms_in_place(mut self) -> Self {
        self.mutation = Some(OutcomeFlags { success: true, failure: false });
        self
    }

    /// Submitting raises a native dialog with `message`.
    pub fn opens_dialog(mut self, message: impl Into<String>) -> Self {
        self.dialog_message = Some(message.into());
        self
    }

    /// Adds a child frame whose document is `html`.
    pub fn with_frame(mut self, html: impl Into<String>) -> Self {
        self.frames.push(Some(html.into()));
        self
    }

    /// Adds a child frame whose context cannot be evaluated.
    pub fn with_unreadable_frame(mut self) -> Self {
        self.frames.push(None);
        self
    }

    pub fn rejects_clicks(mut self) -> Self {
        self.rejects_clicks = true;
        self
    }

    pub fn at(self, url: &str) -> Self {
        self.state.lock().unwrap().url = url.to_string();
        self
    }

    pub fn writes(&self) -> Vec<(Target, String)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clicks(&self) -> Vec<Target> {
        self.state.lock().unwrap().clicks.clone()
    }

    pub fn submit_clicks(&self) -> usize {
        self.state.lock().unwrap().submit_clicks
    }

    /// Current value of the first element matching a whole-document selector.
    pub fn value_of(&self, selector: &str) -> Option<String> {
        let target = Target::css(None, selector);
        let el = self.resolve(&target).ok()?.into_iter().next()?;
        let state = self.state.lock().unwrap();
        Some(current_value(&state, &el))
    }

    /// Values of the checked members of a whole-document selector.
    pub fn checked_of(&self, selector: &str) -> Vec<String> {
        let target = Target::css(None, selector);
        let members = self.resolve(&target).unwrap_or_default();
        let state = self.state.lock().unwrap();
        members
            .iter()
            .filter(|el| state.checked.contains(&el.ordinal))
            .map(|el| el.attr("value").unwrap_or("on").to_string())
            .collect()
    }

    fn markup(&self) -> String {
        let state = self.state.lock().unwrap();
        match (&self.after_submit_html, state.submitted) {
            (Some(html), true) => html.clone(),
            _ => self.dom.clone(),
        }
    }

    fn resolve(&self, target: &Target) -> Result<Vec<Resolved>> {
        let doc = Html::parse_document(&self.markup());
        let selector = Selector::parse(&target.selector)
            .map_err(|e| Error::JsError(format!("bad selector {}: {e:?}", target.selector)))?;
        let ordinals: HashMap<_, usize> = doc
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .enumerate()
            .map(|(i, el)| (el.id(), i))
            .collect();

        let matches: Vec<ElementRef<'_>> = match target.scope {
            None => doc.select(&selector).collect(),
            Some(scope) => {
                let forms = Selector::parse("form").map_err(|e| Error::JsError(format!("{e:?}")))?;
                match doc.select(&forms).nth(scope) {
                    Some(form) => form.select(&selector).collect(),
                    None => doc.select(&selector).collect(),
                }
            }
        };
        let picked: Vec<ElementRef<'_>> = match target.nth {
            Some(n) => matches.into_iter().nth(n).into_iter().collect(),
            None => matches,
        };
        Ok(picked
            .into_iter()
            .map(|el| Resolved {
                ordinal: ordinals.get(&el.id()).copied().unwrap_or_default(),
                tag: el.value().name().to_string(),
                attrs: el
                    .value()
                    .attrs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                text: el.text().collect::<Vec<_>>().join(" ").trim().to_string(),
            })
            .collect())
    }

    fn press(&self, target: &Target) -> Result<()> {
        if self.rejects_clicks {
            return Err(Error::JsError(format!("{target} is covered by another element")));
        }
        let el = self
            .resolve(target)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ElementNotFound(target.to_string()))?;
        let family = match (el.tag.as_str(), el.kind(), el.attr("name")) {
            ("input", "radio", Some(name)) => {
                let selector = format!("input[type=\"radio\"][name=\"{name}\"]");
                self.resolve(&Target::css(None, selector))?
            }
            _ => Vec::new(),
        };

        let mut state = self.state.lock().unwrap();
        state.clicks.push(target.clone());
        match (el.tag.as_str(), el.kind()) {
            ("input", "radio") => {
                for member in &family {
                    state.checked.remove(&member.ordinal);
                }
                state.checked.insert(el.ordinal);
            }
            ("input", "checkbox") => {
                if !state.checked.remove(&el.ordinal) {
                    state.checked.insert(el.ordinal);
                }
            }
            _ if el.is_submit() => {
                state.submit_clicks += 1;
                state.submitted = true;
                if let Some(message) = &self.dialog_message {
                    if let Some(tx) = state.dialog.take() {
                        let _ = tx.send(message.clone());
                    }
                }
                if let Some(url) = &self.after_submit_url {
                    state.url = url.clone();
                    if let Some(tx) = state.navigated.take() {
                        let _ = tx.send(url.clone());
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn write(&self, target: &Target, value: &str) -> Result<()> {
        let el = self
            .resolve(target)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ElementNotFound(target.to_string()))?;
        let mut state = self.state.lock().unwrap();
        state.values.insert(el.ordinal, value.to_string());
        state.writes.push((target.clone(), value.to_string()));
        Ok(())
    }
}

fn current_value(state: &FakeState, el: &Resolved) -> String {
    state
        .values
        .get(&el.ordinal)
        .cloned()
        .unwrap_or_else(|| el.attr("value").unwrap_or_default().to_string())
}

#[async_trait]
impl FormPage for FakePage {
    async fn goto(&self, url: &str) -> Result<()> {
        if self.unreachable.as_deref() == Some(url) {
            return Err(Error::NavigationError(format!("net::ERR_NAME_NOT_RESOLVED at {url}")));
        }
        let mut state = self.state.lock().unwrap();
        state.url = url.to_string();
        state.submitted = false;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn html(&self) -> Result<String> {
        Ok(self.markup())
    }

    async fn raw_document(&self) -> Result<Option<String>> {
        Ok(self.raw.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(vec![0x89, 0x50, 0x4E, 0x47])
    }

    async fn child_frames(&self) -> Result<Vec<FrameContext>> {
        Ok((0..self.frames.len())
            .map(|i| FrameContext::Frame(format!("frame-{i}")))
            .collect())
    }

    async fn elements_markup(&self, ctx: &FrameContext, tag: &str, _wait: Duration) -> Result<Vec<ElementMarkup>> {
        let markup = match ctx {
            FrameContext::Main => self.markup(),
            FrameContext::Frame(id) => id
                .strip_prefix("frame-")
                .and_then(|i| i.parse::<usize>().ok())
                .and_then(|i| self.frames.get(i).cloned().flatten())
                .ok_or_else(|| Error::JsError(format!("no execution context for {id}")))?,
        };
        let doc = Html::parse_document(&markup);
        let selector = Selector::parse(tag).map_err(|e| Error::JsError(format!("{e:?}")))?;
        Ok(doc
            .select(&selector)
            .map(|el| ElementMarkup {
                outer_html: el.html(),
                inner_html: el.inner_html(),
            })
            .collect())
    }

    async fn count(&self, _ctx: &FrameContext, target: &Target) -> Result<usize> {
        Ok(self.resolve(target)?.len())
    }

    async fn wait_for(&self, _ctx: &FrameContext, target: &Target, _timeout: Duration) -> Result<bool> {
        Ok(!self.resolve(target)?.is_empty())
    }

    async fn read_value(&self, _ctx: &FrameContext, target: &Target) -> Result<Option<String>> {
        let Some(el) = self.resolve(target)?.into_iter().next() else {
            return Ok(None);
        };
        let state = self.state.lock().unwrap();
        Ok(Some(current_value(&state, &el)))
    }

    async fn checked_values(&self, _ctx: &FrameContext, target: &Target) -> Result<Vec<String>> {
        let members = self.resolve(target)?;
        let state = self.state.lock().unwrap();
        Ok(members
            .iter()
            .filter(|el| state.checked.contains(&el.ordinal))
            .map(|el| el.attr("value").unwrap_or("on").to_string())
            .collect())
    }

    async fn type_into(&self, _ctx: &FrameContext, target: &Target, text: &str) -> Result<()> {
        self.write(target, text)
    }

    async fn assign_value(&self, _ctx: &FrameContext, target: &Target, value: &str) -> Result<()> {
        self.write(target, value)
    }

    async fn select_value(&self, _ctx: &FrameContext, target: &Target, value: &str) -> Result<()> {
        self.write(target, value)
    }

    async fn click(&self, _ctx: &FrameContext, target: &Target) -> Result<()> {
        self.press(target)
    }

    async fn script_click(&self, _ctx: &FrameContext, target: &Target) -> Result<()> {
        self.press(target)
    }

    async fn uncheck_all(&self, _ctx: &FrameContext, target: &Target) -> Result<usize> {
        let members = self.resolve(target)?;
        let mut state = self.state.lock().unwrap();
        Ok(members.iter().filter(|el| state.checked.remove(&el.ordinal)).count())
    }

    async fn buttons(&self, _ctx: &FrameContext) -> Result<Vec<ButtonProbe>> {
        let all = self.resolve(&Target::css(None, BUTTON_SELECTOR))?;
        Ok(all
            .iter()
            .enumerate()
            .map(|(index, el)| ButtonProbe {
                index,
                text: if el.tag == "input" {
                    el.attr("value").unwrap_or_default().to_string()
                } else {
                    el.text.clone()
                },
                submit_capable: el.is_submit(),
                has_onclick: el.attr("onclick").is_some(),
                disabled: el.attr("disabled").is_some(),
            })
            .collect())
    }

    async fn checkboxes(&self, _ctx: &FrameContext) -> Result<Vec<CheckboxProbe>> {
        let all = self.resolve(&Target::css(None, CHECKBOX_SELECTOR))?;
        let state = self.state.lock().unwrap();
        Ok(all
            .iter()
            .enumerate()
            .map(|(index, el)| CheckboxProbe {
                index,
                label: el.attr("data-label").unwrap_or_default().to_string(),
                checked: state.checked.contains(&el.ordinal),
            })
            .collect())
    }

    async fn has_invalid_field(&self, _ctx: &FrameContext) -> Result<bool> {
        Ok(self.invalid)
    }

    async fn install_outcome_watch(
        &self,
        _ctx: &FrameContext,
        _scope: Option<usize>,
        _success_terms: &[String],
        _failure_terms: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn outcome_flags(&self, _ctx: &FrameContext) -> Result<OutcomeFlags> {
        let submitted = self.state.lock().unwrap().submitted;
        Ok(match (self.mutation, submitted) {
            (Some(flags), true) => flags,
            _ => OutcomeFlags::default(),
        })
    }

    async fn arm_signals(&self) -> Result<PageSignals> {
        let (nav_tx, nav_rx) = oneshot::channel();
        let (dialog_tx, dialog_rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.navigated = Some(nav_tx);
        state.dialog = Some(dialog_tx);
        Ok(PageSignals::new(nav_rx, dialog_rx, Vec::new()))
    }
}

/// Opens a fresh [`FakePage`] per session from a builder.
pub struct FakeOpener<F> {
    build: F,
    opened: AtomicUsize,
}

impl<F: Fn() -> FakePage + Send + Sync> FakeOpener<F> {
    pub fn new(build: F) -> Self {
        Self {
            build,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F: Fn() -> FakePage + Send + Sync> PageOpener for FakeOpener<F> {
    type Page = FakePage;

    async fn open(&self) -> Result<FakePage> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok((self.build)())
    }

    async fn release(&self, _page: FakePage) {}
}

/// Completion double answering from a queue and recording every request.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Completion for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::CompletionError("script exhausted".into()))
    }
}

/// Config with every wait shortened for in-memory pages.
pub fn fast_config() -> PilotConfig {
    PilotConfig {
        timeouts: Timeouts {
            settle_ms: 0,
            frame_form_ms: 0,
            selector_ms: 10,
            submit_race_ms: 300,
            confirm_button_ms: 10,
            confirm_settle_ms: 0,
            reclassify_ms: 0,
        },
        tuning: Tuning {
            field_delay_ms: (0, 0),
            ..Tuning::default()
        },
        ..PilotConfig::default()
    }
}

pub fn input(pairs: &[(&str, &str)]) -> InputData {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub struct Harness {
    pub services: SessionServices,
    pub completion: Arc<ScriptedCompletion>,
    pub store: Arc<MemoryStore>,
    pub dir: tempfile::TempDir,
}

pub fn harness(config: PilotConfig, data: InputData, replies: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let completion = Arc::new(ScriptedCompletion::new(replies.iter().copied()));
    let store = Arc::new(MemoryStore::new());
    let services = SessionServices {
        config: Arc::new(config),
        completion: completion.clone(),
        store: store.clone(),
        images: Arc::new(LocalImageStore::new(dir.path().join("archive"))),
        cache: Arc::new(MappingCache::new()),
        input: Arc::new(data),
        run: RunContext::new(dir.path().join("screenshots")),
    };
    Harness {
        services,
        completion,
        store,
        dir,
    }
}
