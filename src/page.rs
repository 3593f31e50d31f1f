use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventFrameNavigated, EventJavascriptDialogOpening, FrameId,
    HandleJavaScriptDialogParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page as CrPage;
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::driver::{
    ButtonProbe, CheckboxProbe, ElementMarkup, FormPage, FrameContext, OutcomeFlags, PageSignals,
    Target, BUTTON_SELECTOR, CHECKBOX_SELECTOR,
};
use crate::element::Element;
use crate::error::{Error, Result};

/// Resolves a [`Target`] to a list of elements inside the evaluated context.
const RESOLVE_JS: &str = r#"
const __fpResolve = (scope, selector, nth) => {
    const forms = document.querySelectorAll('form');
    const root = scope === null ? document : (forms[scope] || document);
    const all = Array.from(root.querySelectorAll(selector));
    if (nth === null) return all;
    return all[nth] ? [all[nth]] : [];
};
const __fpVisible = (el) => {
    const style = window.getComputedStyle(el);
    if (style.display === 'none' || style.visibility === 'hidden') return false;
    return el.getClientRects().length > 0;
};
"#;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static MARK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Wrapper around a chromiumoxide Page implementing [`FormPage`].
pub struct Page {
    inner: CrPage,
    default_timeout: Duration,
}

impl Page {
    pub(crate) fn new(inner: CrPage, default_timeout: Duration) -> Self {
        Self { inner, default_timeout }
    }

    /// Returns a reference to the underlying chromiumoxide Page.
    pub fn inner(&self) -> &CrPage {
        &self.inner
    }

    /// Close the tab and release its resources.
    pub async fn close(self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }

    /// Fail requests for the given CDP resource types or URL fragments; continue everything else.
    pub async fn block_resources(&self, kinds: &[String], url_fragments: &[String]) -> Result<()> {
        if kinds.is_empty() && url_fragments.is_empty() {
            return Ok(());
        }

        // Subscribe before enabling the Fetch domain so no paused request is missed
        let mut paused = self
            .inner
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| Error::LaunchError(format!("Failed to listen for paused requests: {e}")))?;

        self.inner
            .execute(EnableParams::builder().build())
            .await
            .map_err(|e| Error::LaunchError(format!("Failed to enable request interception: {e}")))?;

        let kinds: HashSet<String> = kinds.iter().map(|k| k.to_lowercase()).collect();
        let url_fragments: Arc<[String]> = url_fragments.into();
        let page = self.inner.clone();

        tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let kind = event.resource_type.as_ref().to_lowercase();
                let blocked = kinds.contains(&kind)
                    || url_fragments.iter().any(|f| event.request.url.contains(f.as_str()));
                let outcome = if blocked {
                    page.execute(FailRequestParams::new(
                        event.request_id.clone(),
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(|_| ())
                } else {
                    page.execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                };
                if let Err(e) = outcome {
                    tracing::debug!(url = %event.request.url, "request interception reply failed: {e}");
                }
            }
        });

        Ok(())
    }

    async fn context_id(
        &self,
        ctx: &FrameContext,
    ) -> Result<Option<chromiumoxide::cdp::js_protocol::runtime::ExecutionContextId>> {
        match ctx {
            FrameContext::Main => Ok(self.inner.execution_context().await?),
            FrameContext::Frame(id) => {
                let context = self
                    .inner
                    .frame_execution_context(FrameId::new(id.clone()))
                    .await?;
                context
                    .map(Some)
                    .ok_or_else(|| Error::ElementNotFound(format!("frame {id} has no execution context")))
            }
        }
    }

    /// Evaluate `body` (statements ending in `return`) inside the given context.
    async fn eval<T: DeserializeOwned>(&self, ctx: &FrameContext, body: &str) -> Result<T> {
        let expression = format!("(async () => {{ {RESOLVE_JS} {body} }})()");
        let mut builder = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true);
        if let Some(context_id) = self.context_id(ctx).await? {
            builder = builder.context_id(context_id);
        }
        let params = builder.build().map_err(Error::JsError)?;
        let result = self
            .inner
            .evaluate_expression(params)
            .await
            .map_err(|e| Error::JsError(e.to_string()))?;
        result
            .into_value::<T>()
            .map_err(|e| Error::JsError(e.to_string()))
    }

    /// Tag the first match of `target` with a unique attribute and return a selector for it.
    async fn mark(&self, ctx: &FrameContext, target: &Target) -> Result<Option<String>> {
        let token = format!("fp{}", MARK_SEQ.fetch_add(1, Ordering::Relaxed));
        let body = format!(
            "const [el] = __fpResolve({}); if (!el) return false; \
             el.setAttribute('data-formpilot', {}); return true;",
            resolve_args(target)?,
            js(&token)?,
        );
        let found: bool = self.eval(ctx, &body).await?;
        Ok(found.then(|| format!("[data-formpilot=\"{token}\"]")))
    }

    async fn find_element(&self, selector: &str) -> Result<Element> {
        let el = self
            .inner
            .find_element(selector)
            .await
            .map_err(|e| Error::ElementNotFound(e.to_string()))?;
        Ok(Element::new(el))
    }

    async fn screenshot_with(&self, full_page: bool) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();
        self.inner
            .screenshot(params)
            .await
            .map_err(|e| Error::ScreenshotError(e.to_string()))
    }
}

fn js<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn resolve_args(target: &Target) -> Result<String> {
    Ok(format!(
        "{}, {}, {}",
        js(&target.scope)?,
        js(&target.selector)?,
        js(&target.nth)?
    ))
}

#[async_trait]
impl FormPage for Page {
    // ── Navigation ──────────────────────────────────────────────────

    async fn goto(&self, url: &str) -> Result<()> {
        tokio::time::timeout(self.default_timeout, self.inner.goto(url))
            .await
            .map_err(|_| Error::Timeout(format!("navigation to {url}")))?
            .map_err(|e| Error::NavigationError(e.to_string()))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.inner
            .url()
            .await
            .map_err(|e| Error::NavigationError(e.to_string()))?
            .ok_or_else(|| Error::NavigationError("No URL found".into()))
    }

    async fn html(&self) -> Result<String> {
        self.inner
            .content()
            .await
            .map_err(|e| Error::JsError(e.to_string()))
    }

    async fn raw_document(&self) -> Result<Option<String>> {
        let body = "try { \
                const res = await fetch(location.href, { credentials: 'include' }); \
                return await res.text(); \
            } catch (e) { return null; }";
        self.eval(&FrameContext::Main, body).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        match self.screenshot_with(true).await {
            Ok(png) => Ok(png),
            Err(e) => {
                tracing::warn!("full page screenshot failed, using viewport: {e}");
                self.screenshot_with(false).await
            }
        }
    }

    // ── Discovery ───────────────────────────────────────────────────

    async fn child_frames(&self) -> Result<Vec<FrameContext>> {
        let main = self.inner.mainframe().await?;
        let frames = self.inner.frames().await?;
        Ok(frames
            .into_iter()
            .filter(|id| Some(id) != main.as_ref())
            .map(|id| FrameContext::Frame(id.inner().clone()))
            .collect())
    }

    async fn elements_markup(
        &self,
        ctx: &FrameContext,
        tag: &str,
        wait: Duration,
    ) -> Result<Vec<ElementMarkup>> {
        let target = Target::css(None, tag);
        if !wait.is_zero() && !self.wait_for(ctx, &target, wait).await? {
            return Ok(Vec::new());
        }
        let body = format!(
            "return Array.from(document.getElementsByTagName({})).map(el => ({{ \
                outer_html: el.outerHTML, inner_html: el.innerHTML }}));",
            js(tag)?
        );
        self.eval(ctx, &body).await
    }

    async fn count(&self, ctx: &FrameContext, target: &Target) -> Result<usize> {
        let body = format!("return __fpResolve({}).length;", resolve_args(target)?);
        self.eval(ctx, &body).await
    }

    async fn wait_for(&self, ctx: &FrameContext, target: &Target, timeout: Duration) -> Result<bool> {
        let start = std::time::Instant::now();
        loop {
            // The context may be mid-navigation; treat evaluation errors as "not yet"
            if let Ok(n) = self.count(ctx, target).await {
                if n > 0 {
                    return Ok(true);
                }
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    // ── Field state ─────────────────────────────────────────────────

    async fn read_value(&self, ctx: &FrameContext, target: &Target) -> Result<Option<String>> {
        let body = format!(
            "const [el] = __fpResolve({}); return el ? String(el.value ?? '') : null;",
            resolve_args(target)?
        );
        self.eval(ctx, &body).await
    }

    async fn checked_values(&self, ctx: &FrameContext, target: &Target) -> Result<Vec<String>> {
        let body = format!(
            "return __fpResolve({}).filter(el => el.checked).map(el => String(el.value ?? ''));",
            resolve_args(target)?
        );
        self.eval(ctx, &body).await
    }

    // ── Actions ─────────────────────────────────────────────────────

    async fn type_into(&self, ctx: &FrameContext, target: &Target, text: &str) -> Result<()> {
        match ctx {
            FrameContext::Main => {
                let selector = self
                    .mark(ctx, target)
                    .await?
                    .ok_or_else(|| Error::ElementNotFound(target.to_string()))?;
                let el = self.find_element(&selector).await?;
                el.focus().await?;
                self.eval::<bool>(
                    ctx,
                    &format!(
                        "const el = document.querySelector({}); if (el) el.value = ''; return true;",
                        js(&selector)?
                    ),
                )
                .await?;
                el.click().await?;
                el.type_text(text).await
            }
            FrameContext::Frame(_) => {
                let body = format!(
                    "const [el] = __fpResolve({}); if (!el) return false; \
                     el.focus(); el.value = ''; return true;",
                    resolve_args(target)?
                );
                let focused: bool = self.eval(ctx, &body).await?;
                if !focused {
                    return Err(Error::ElementNotFound(target.to_string()));
                }
                self.inner.execute(InsertTextParams::new(text)).await?;
                Ok(())
            }
        }
    }

    async fn assign_value(&self, ctx: &FrameContext, target: &Target, value: &str) -> Result<()> {
        let body = format!(
            "const [el] = __fpResolve({}); if (!el) return false; \
             el.value = {}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true;",
            resolve_args(target)?,
            js(value)?
        );
        let done: bool = self.eval(ctx, &body).await?;
        done.then_some(())
            .ok_or_else(|| Error::ElementNotFound(target.to_string()))
    }

    async fn select_value(&self, ctx: &FrameContext, target: &Target, value: &str) -> Result<()> {
        let body = format!(
            "const [el] = __fpResolve({}); if (!el) return false; \
             const opt = Array.from(el.options || []).find(o => o.value === {value}); \
             if (!opt) return false; \
             el.value = opt.value; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true;",
            resolve_args(target)?,
            value = js(value)?
        );
        let done: bool = self.eval(ctx, &body).await?;
        done.then_some(())
            .ok_or_else(|| Error::ElementNotFound(format!("{target} option {value:?}")))
    }

    async fn click(&self, ctx: &FrameContext, target: &Target) -> Result<()> {
        match ctx {
            FrameContext::Main => {
                let selector = self
                    .mark(ctx, target)
                    .await?
                    .ok_or_else(|| Error::ElementNotFound(target.to_string()))?;
                let el = self.find_element(&selector).await?;
                el.click().await
            }
            FrameContext::Frame(_) => self.script_click(ctx, target).await,
        }
    }

    async fn script_click(&self, ctx: &FrameContext, target: &Target) -> Result<()> {
        let body = format!(
            "const [el] = __fpResolve({}); if (!el) return false; el.click(); return true;",
            resolve_args(target)?
        );
        let done: bool = self.eval(ctx, &body).await?;
        done.then_some(())
            .ok_or_else(|| Error::ElementNotFound(target.to_string()))
    }

    async fn uncheck_all(&self, ctx: &FrameContext, target: &Target) -> Result<usize> {
        let body = format!(
            "const checked = __fpResolve({}).filter(el => el.checked); \
             checked.forEach(el => el.click()); return checked.length;",
            resolve_args(target)?
        );
        self.eval(ctx, &body).await
    }

    // ── Classification probes ───────────────────────────────────────

    async fn buttons(&self, ctx: &FrameContext) -> Result<Vec<ButtonProbe>> {
        let body = format!(
            "return Array.from(document.querySelectorAll({})).map((el, index) => ({{ \
                index, \
                text: ((el.innerText || el.textContent || '') + ' ' + (el.value || el.alt || '')).trim(), \
                submit_capable: el.type === 'submit' || el.type === 'image' || !!el.form, \
                has_onclick: el.hasAttribute('onclick'), \
                disabled: !!el.disabled, \
                visible: __fpVisible(el) }})).filter(b => b.visible);",
            js(BUTTON_SELECTOR)?
        );
        self.eval(ctx, &body).await
    }

    async fn checkboxes(&self, ctx: &FrameContext) -> Result<Vec<CheckboxProbe>> {
        let body = format!(
            "return Array.from(document.querySelectorAll({})).map((el, index) => {{ \
                const label = (el.labels && el.labels[0]) || el.closest('label') || el.parentElement; \
                return {{ index, label: label ? (label.innerText || '').trim() : '', \
                    checked: !!el.checked, visible: __fpVisible(el) || (!!label && __fpVisible(label)) }}; \
             }}).filter(c => c.visible);",
            js(CHECKBOX_SELECTOR)?
        );
        self.eval(ctx, &body).await
    }

    async fn has_invalid_field(&self, ctx: &FrameContext) -> Result<bool> {
        let body = "return Array.from(document.querySelectorAll('input, textarea, select')) \
            .some(el => el.type !== 'hidden' && __fpVisible(el) && el.matches(':invalid'));";
        self.eval(ctx, body).await
    }

    // ── Submission instrumentation ──────────────────────────────────

    async fn install_outcome_watch(
        &self,
        ctx: &FrameContext,
        scope: Option<usize>,
        success_terms: &[String],
        failure_terms: &[String],
    ) -> Result<()> {
        let body = format!(
            "const scope = {scope}; const success = {success}; const failure = {failure}; \
             const forms = document.querySelectorAll('form'); \
             const root = (scope === null ? null : forms[scope]) || document.querySelector('form') || document.body; \
             const bodyText = () => (document.body ? document.body.innerText : '').toLowerCase(); \
             const occurrences = (text, term) => {{ \
                 const w = term.toLowerCase(); if (!w) return 0; \
                 let n = 0, i = 0; \
                 while ((i = text.indexOf(w, i)) !== -1) {{ n++; i += w.length; }} \
                 return n; }}; \
             const baseline = bodyText(); \
             const appeared = (text, terms) => terms.some(t => occurrences(text, t) > occurrences(baseline, t)); \
             window.__formpilot = {{ success: false, failure: false }}; \
             const observer = new MutationObserver(() => {{ \
                 const text = bodyText(); \
                 if (appeared(text, failure)) window.__formpilot.failure = true; \
                 if (appeared(text, success)) window.__formpilot.success = true; }}); \
             observer.observe(root, {{ childList: true, characterData: true, subtree: true, attributes: true }}); \
             return true;",
            scope = js(&scope)?,
            success = js(success_terms)?,
            failure = js(failure_terms)?,
        );
        self.eval::<bool>(ctx, &body).await?;
        Ok(())
    }

    async fn outcome_flags(&self, ctx: &FrameContext) -> Result<OutcomeFlags> {
        let body = "const f = window.__formpilot || {}; \
            return { success: !!f.success, failure: !!f.failure };";
        self.eval(ctx, body).await
    }

    async fn arm_signals(&self) -> Result<PageSignals> {
        let mut navigations = self.inner.event_listener::<EventFrameNavigated>().await?;
        let mut dialogs = self
            .inner
            .event_listener::<EventJavascriptDialogOpening>()
            .await?;

        let (nav_tx, nav_rx) = oneshot::channel();
        let nav_task = tokio::spawn(async move {
            while let Some(event) = navigations.next().await {
                if event.frame.parent_id.is_none() {
                    let _ = nav_tx.send(event.frame.url.clone());
                    break;
                }
            }
        });

        let (dialog_tx, dialog_rx) = oneshot::channel();
        let page = self.inner.clone();
        let dialog_task = tokio::spawn(async move {
            let mut first = Some(dialog_tx);
            while let Some(event) = dialogs.next().await {
                tracing::info!(message = %event.message, "dismissing native dialog");
                if let Err(e) = page.execute(HandleJavaScriptDialogParams::new(false)).await {
                    tracing::debug!("dialog dismissal failed: {e}");
                }
                if let Some(tx) = first.take() {
                    let _ = tx.send(event.message.clone());
                }
            }
        });

        Ok(PageSignals::new(
            nav_rx,
            dialog_rx,
            vec![nav_task.abort_handle(), dialog_task.abort_handle()],
        ))
    }
}
