use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{mentions, PilotConfig};
use crate::driver::{css_string, FormPage, FrameContext, Target, BUTTON_SELECTOR, CHECKBOX_SELECTOR};
use crate::error::Result;
use crate::fields::FieldDescriptor;
use crate::mapping::FieldAssignment;

/// The value a checkable input reports when it has no `value` attribute.
const GENERIC_CHECK_VALUE: &str = "on";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillReport {
    /// Fields a value was written to.
    pub written: Vec<String>,
    /// Fields already at their target value.
    pub skipped: Vec<String>,
    /// Fields that could not be found or written.
    pub unresolved: Vec<String>,
}

impl FillReport {
    /// Every attempted field failed.
    pub fn failed(&self) -> bool {
        !self.unresolved.is_empty() && self.written.is_empty() && self.skipped.is_empty()
    }
}

enum Applied {
    Written,
    Skipped,
}

fn named(tag: &str, name: &str) -> String {
    format!("{tag}[name={}]", css_string(name))
}

/// Pause length drawn from the configured inclusive range.
fn field_delay((min, max): (u64, u64)) -> Duration {
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

pub struct FormFiller<'a, P: FormPage + ?Sized> {
    page: &'a P,
    ctx: &'a FrameContext,
    scope: Option<usize>,
    config: &'a PilotConfig,
}

impl<'a, P: FormPage + ?Sized> FormFiller<'a, P> {
    pub fn new(page: &'a P, ctx: &'a FrameContext, scope: Option<usize>, config: &'a PilotConfig) -> Self {
        Self { page, ctx, scope, config }
    }

    /// Write every assignment. Failures are logged and recorded, never returned.
    pub async fn fill(&self, assignments: &[FieldAssignment]) -> FillReport {
        let mut report = FillReport::default();
        for assignment in assignments {
            let id = assignment.field.identifier();
            match self.apply(&assignment.field, &assignment.value).await {
                Ok(Some(Applied::Written)) => {
                    tracing::debug!(field = %id, "field written");
                    report.written.push(id);
                    let pause = field_delay(self.config.tuning.field_delay_ms);
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }
                Ok(Some(Applied::Skipped)) => report.skipped.push(id),
                Ok(None) => {
                    tracing::warn!(field = %id, "field not found on the page");
                    report.unresolved.push(id);
                }
                Err(e) => {
                    tracing::warn!(field = %id, "field write failed: {e}");
                    report.unresolved.push(id);
                }
            }
        }
        report
    }

    fn element(&self, field: &FieldDescriptor) -> Target {
        match field {
            FieldDescriptor::Text { name, tag, .. } => Target::css(self.scope, named(tag, name)),
            FieldDescriptor::Choice { name, .. } => Target::css(self.scope, named(field.tag(), name)),
            FieldDescriptor::Positional { locator: Some(locator), .. } => locator.clone(),
            FieldDescriptor::Positional { tag, index, .. } => Target::nth(self.scope, tag.clone(), *index),
        }
    }

    async fn present(&self, target: &Target) -> Result<bool> {
        self.page
            .wait_for(self.ctx, target, self.config.timeouts.selector())
            .await
    }

    async fn apply(&self, field: &FieldDescriptor, value: &str) -> Result<Option<Applied>> {
        let target = self.element(field);
        if !self.present(&target).await? {
            return Ok(None);
        }
        match (field.tag(), field.subtype()) {
            ("select", _) => self.select(&target, value).await.map(Some),
            (_, Some("radio")) => self.radio(field, &target, value).await,
            (_, Some("checkbox")) => self.checkbox(field, &target, value).await,
            _ => self.text(&target, value).await.map(Some),
        }
    }

    async fn text(&self, target: &Target, value: &str) -> Result<Applied> {
        if self.page.read_value(self.ctx, target).await?.as_deref() == Some(value) {
            return Ok(Applied::Skipped);
        }
        if let Err(e) = self.page.type_into(self.ctx, target, value).await {
            tracing::debug!(%target, "typing failed, assigning value directly: {e}");
            self.page.assign_value(self.ctx, target, value).await?;
        }
        Ok(Applied::Written)
    }

    async fn select(&self, target: &Target, value: &str) -> Result<Applied> {
        if self.page.read_value(self.ctx, target).await?.as_deref() == Some(value) {
            return Ok(Applied::Skipped);
        }
        self.page.select_value(self.ctx, target, value).await?;
        Ok(Applied::Written)
    }

    /// The single member of a family to click for `value`.
    fn member(&self, field: &FieldDescriptor, family: &Target, value: &str) -> Target {
        let only_generic = field.candidates().iter().all(|c| c == GENERIC_CHECK_VALUE);
        match field {
            FieldDescriptor::Positional { .. } => family.clone(),
            _ if only_generic => Target::nth(self.scope, family.selector.clone(), 0),
            _ => Target::nth(
                self.scope,
                format!("{}[value={}]", family.selector, css_string(value)),
                0,
            ),
        }
    }

    async fn radio(&self, field: &FieldDescriptor, family: &Target, value: &str) -> Result<Option<Applied>> {
        if value.is_empty() {
            return Ok(Some(Applied::Skipped));
        }
        let checked = self.page.checked_values(self.ctx, family).await?;
        let already = match field {
            FieldDescriptor::Positional { .. } => !checked.is_empty(),
            _ => checked.iter().any(|v| v == value),
        };
        if already {
            return Ok(Some(Applied::Skipped));
        }
        let member = self.member(field, family, value);
        if self.page.count(self.ctx, &member).await? == 0 {
            return Ok(None);
        }
        self.page.click(self.ctx, &member).await?;
        Ok(Some(Applied::Written))
    }

    async fn checkbox(&self, field: &FieldDescriptor, family: &Target, value: &str) -> Result<Option<Applied>> {
        let checked = self.page.checked_values(self.ctx, family).await?;
        let already = match field {
            FieldDescriptor::Positional { .. } => !checked.is_empty(),
            _ => checked.len() == 1 && checked[0] == value,
        };
        if already {
            return Ok(Some(Applied::Skipped));
        }
        let member = self.member(field, family, value);
        if self.page.count(self.ctx, &member).await? == 0 {
            return Ok(None);
        }
        if !matches!(field, FieldDescriptor::Positional { .. }) {
            self.page.uncheck_all(self.ctx, family).await?;
        }
        self.page.click(self.ctx, &member).await?;
        Ok(Some(Applied::Written))
    }
}

/// Tick visible consent checkboxes and press agreement controls. Returns how many were clicked.
pub async fn accept_consent<P: FormPage + ?Sized>(
    page: &P,
    ctx: &FrameContext,
    config: &PilotConfig,
) -> Result<usize> {
    let vocabulary = &config.vocabulary;
    let mut clicked = 0;

    for checkbox in page.checkboxes(ctx).await? {
        if checkbox.checked || !mentions(&checkbox.label, &vocabulary.consent) {
            continue;
        }
        page.click(ctx, &Target::nth(None, CHECKBOX_SELECTOR, checkbox.index))
            .await?;
        clicked += 1;
    }

    for button in page.buttons(ctx).await? {
        // An agreement control that also sends would submit an empty form
        if button.disabled
            || !mentions(&button.text, &vocabulary.consent)
            || mentions(&button.text, &vocabulary.button_send)
        {
            continue;
        }
        page.click(ctx, &Target::nth(None, BUTTON_SELECTOR, button.index))
            .await?;
        clicked += 1;
    }

    if clicked > 0 {
        tracing::info!(clicked, "consent controls accepted");
    }
    Ok(clicked)
}
