use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::Result;

/// Where a form, and every element looked up inside it, lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FrameContext {
    Main,
    Frame(String),
}

/// Element lookup resolved inside the browser at call time.
///
/// `scope` is the index of the owning `form` among the context's forms; `None`
/// searches the whole document. `nth` picks one match by document order,
/// otherwise every match of `selector` is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub scope: Option<usize>,
    pub selector: String,
    pub nth: Option<usize>,
}

impl Target {
    pub fn css(scope: Option<usize>, selector: impl Into<String>) -> Self {
        Self {
            scope,
            selector: selector.into(),
            nth: None,
        }
    }

    pub fn nth(scope: Option<usize>, selector: impl Into<String>, index: usize) -> Self {
        Self {
            scope,
            selector: selector.into(),
            nth: Some(index),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(scope) = self.scope {
            write!(f, "form#{scope} ")?;
        }
        write!(f, "{}", self.selector)?;
        if let Some(nth) = self.nth {
            write!(f, "[{nth}]")?;
        }
        Ok(())
    }
}

/// Escape a value for use inside a double-quoted CSS attribute selector.
pub fn css_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\a "),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Raw markup of one candidate element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMarkup {
    pub outer_html: String,
    pub inner_html: String,
}

/// A visible, clickable control as seen by the classifier and the confirm phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonProbe {
    /// Index among `button, input[type=submit], input[type=button], input[type=image]`.
    pub index: usize,
    pub text: String,
    pub submit_capable: bool,
    pub has_onclick: bool,
    pub disabled: bool,
}

/// Selector list matched by [`ButtonProbe::index`].
pub const BUTTON_SELECTOR: &str =
    "button, input[type=\"submit\"], input[type=\"button\"], input[type=\"image\"]";

/// A visible checkbox and the text that labels it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckboxProbe {
    /// Index among `input[type=checkbox]`.
    pub index: usize,
    pub label: String,
    pub checked: bool,
}

pub const CHECKBOX_SELECTOR: &str = "input[type=\"checkbox\"]";

/// Page-level flags set by the mutation observer installed before submit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeFlags {
    pub success: bool,
    pub failure: bool,
}

/// One-shot browser signals armed before the submit click.
///
/// A receiver whose sender was dropped never fires.
pub struct PageSignals {
    pub navigated: oneshot::Receiver<String>,
    pub dialog: oneshot::Receiver<String>,
    guards: Vec<tokio::task::AbortHandle>,
}

impl PageSignals {
    pub fn new(
        navigated: oneshot::Receiver<String>,
        dialog: oneshot::Receiver<String>,
        guards: Vec<tokio::task::AbortHandle>,
    ) -> Self {
        Self {
            navigated,
            dialog,
            guards,
        }
    }
}

impl Drop for PageSignals {
    fn drop(&mut self) {
        for guard in &self.guards {
            guard.abort();
        }
    }
}

/// Browser operations the form components need.
///
/// "Not there" is `Ok(None)`, `Ok(false)` or an empty collection. `Err` is reserved for driver failures.
#[async_trait]
pub trait FormPage: Send + Sync {
    // ── Navigation ──────────────────────────────────────────────────

    async fn goto(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// Full serialized DOM of the main document.
    async fn html(&self) -> Result<String>;

    /// Re-fetch the raw response body of the current document, bypassing the DOM.
    async fn raw_document(&self) -> Result<Option<String>>;

    /// Full-page PNG, falling back to the viewport when the page is too tall.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    // ── Discovery ───────────────────────────────────────────────────

    /// Child frames of the page, main document excluded.
    async fn child_frames(&self) -> Result<Vec<FrameContext>>;

    /// Every element with `tag` in the context, in document order. Waits up to
    /// `wait` for at least one to appear.
    async fn elements_markup(
        &self,
        ctx: &FrameContext,
        tag: &str,
        wait: Duration,
    ) -> Result<Vec<ElementMarkup>>;

    async fn count(&self, ctx: &FrameContext, target: &Target) -> Result<usize>;

    /// Polls until `target` matches or `timeout` elapses.
    async fn wait_for(&self, ctx: &FrameContext, target: &Target, timeout: Duration) -> Result<bool>;

    // ── Field state ─────────────────────────────────────────────────

    /// `value` of the first matched element.
    async fn read_value(&self, ctx: &FrameContext, target: &Target) -> Result<Option<String>>;

    /// Values of the checked members of a checkable family.
    async fn checked_values(&self, ctx: &FrameContext, target: &Target) -> Result<Vec<String>>;

    // ── Actions ─────────────────────────────────────────────────────

    /// Focus, clear, and type into the first matched element with simulated key input.
    async fn type_into(&self, ctx: &FrameContext, target: &Target, text: &str) -> Result<()>;

    /// Set `value` directly and dispatch `input`/`change`.
    async fn assign_value(&self, ctx: &FrameContext, target: &Target, value: &str) -> Result<()>;

    async fn select_value(&self, ctx: &FrameContext, target: &Target, value: &str) -> Result<()>;

    async fn click(&self, ctx: &FrameContext, target: &Target) -> Result<()>;

    /// Click the element through `HTMLElement.click()` instead of a pointer event.
    async fn script_click(&self, ctx: &FrameContext, target: &Target) -> Result<()>;

    /// Uncheck every checked member of a checkable family. Returns how many changed.
    async fn uncheck_all(&self, ctx: &FrameContext, target: &Target) -> Result<usize>;

    // ── Classification probes ───────────────────────────────────────

    /// Visible buttons in document order.
    async fn buttons(&self, ctx: &FrameContext) -> Result<Vec<ButtonProbe>>;

    /// Visible checkboxes with their label text.
    async fn checkboxes(&self, ctx: &FrameContext) -> Result<Vec<CheckboxProbe>>;

    /// Whether any visible input, textarea or select reports `:invalid`.
    async fn has_invalid_field(&self, ctx: &FrameContext) -> Result<bool>;

    // ── Submission instrumentation ──────────────────────────────────

    /// Install the mutation observer over the scoped form and capture its baseline text.
    async fn install_outcome_watch(
        &self,
        ctx: &FrameContext,
        scope: Option<usize>,
        success_terms: &[String],
        failure_terms: &[String],
    ) -> Result<()>;

    async fn outcome_flags(&self, ctx: &FrameContext) -> Result<OutcomeFlags>;

    /// Arm main-frame navigation and native dialog signals. Dialogs are dismissed.
    async fn arm_signals(&self) -> Result<PageSignals>;
}
