use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::config::{mentions, PilotConfig};
use crate::context::RunContext;
use crate::driver::{FormPage, FrameContext, Target, BUTTON_SELECTOR};
use crate::error::Result;
use crate::fields::{extract_anchored, FieldDescriptor};
use crate::filler::{accept_consent, FillReport, FormFiller};
use crate::llm::{Completion, CompletionRequest};
use crate::locator::locate_form;
use crate::mapping::{assignments, build_request, normalize, parse_reply, FieldMapping, InputData, MappingCache};
use crate::result::{result_marker, ConfirmResult, InputResult, Verdict};
use crate::state::{transition, Event, Phase, SessionState, StateClassifier};
use crate::store::{form_identity, FormRecord, FormStore, ImageStore, SubmissionRecord};
use crate::submit::SubmissionMonitor;

const CF7_WIDGET: &str = "div.wpcf7";
const CF7_SUBMIT: &str = "input.wpcf7-form-control.wpcf7-submit";
const CONFIRM_SUBMIT: &str = "input[type=\"submit\"], button[type=\"submit\"]";

/// Collaborators shared by every session of a batch.
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<PilotConfig>,
    pub completion: Arc<dyn Completion>,
    pub store: Arc<dyn FormStore>,
    pub images: Arc<dyn ImageStore>,
    pub cache: Arc<MappingCache>,
    pub input: Arc<InputData>,
    pub run: RunContext,
}

/// Run one session to termination and return its audit record.
///
/// Phase failures end up as result codes inside the record. An `Err` means
/// the browser itself gave out; the caller records that as `SessionFailed`.
pub async fn run_session<P: FormPage + ?Sized>(
    page: &P,
    url: &str,
    services: &SessionServices,
) -> Result<SubmissionRecord> {
    let mut session = Session::new(page, url, services);
    session.run().await?;
    Ok(session.record())
}

struct Session<'a, P: FormPage + ?Sized> {
    page: &'a P,
    url: &'a str,
    identity: String,
    services: &'a SessionServices,
    state: SessionState,
    ctx: FrameContext,
    input_result: InputResult,
    confirm_seen: bool,
    audited_phase: Phase,
    fields: Vec<FieldDescriptor>,
    mapping: Vec<FieldMapping>,
    fill: Option<FillReport>,
    image: Option<String>,
    started_at: DateTime<Local>,
}

impl<'a, P: FormPage + ?Sized> Session<'a, P> {
    fn new(page: &'a P, url: &'a str, services: &'a SessionServices) -> Self {
        Self {
            page,
            url,
            identity: form_identity(url),
            services,
            state: SessionState::new(),
            ctx: FrameContext::Main,
            input_result: InputResult::None,
            confirm_seen: false,
            audited_phase: Phase::Error,
            fields: Vec::new(),
            mapping: Vec::new(),
            fill: None,
            image: None,
            started_at: Local::now(),
        }
    }

    fn config(&self) -> &'a PilotConfig {
        &self.services.config
    }

    async fn navigate(&self) -> Result<()> {
        self.page.goto(self.url).await?;
        tokio::time::sleep(self.config().timeouts.settle()).await;
        Ok(())
    }

    fn advance(&mut self, event: Event) {
        let before = self.state.phase;
        self.state = transition(&self.state, event, &self.config().limits);
        tracing::debug!(?event, from = ?before, to = ?self.state.phase, total = self.state.total_trial_count, "transition");
    }

    async fn classify(&mut self) -> Result<()> {
        let services = self.services;
        let classifier = StateClassifier::new(&*services.completion, &services.config);
        let phase = classifier.classify(self.page, &self.state, &self.ctx).await?;
        tracing::info!(?phase, "page classified");
        self.advance(Event::Classified(phase));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.navigate().await?;

        loop {
            match self.state.phase {
                Phase::Input => {
                    if self.state.input_trial_count > 0 {
                        self.navigate().await?;
                    }
                    self.state.last_phase_url = Some(self.page.current_url().await?);
                    self.advance(Event::PhaseStarted(Phase::Input));
                    if self.state.phase != Phase::Input {
                        tracing::warn!(trials = self.state.input_trial_count, "input trials exhausted");
                        continue;
                    }
                    let result = self.input_phase().await?;
                    tracing::info!(phase = "input", ?result, trial = self.state.input_trial_count, "phase finished");
                    self.input_result = result;
                    self.state.last_input_result = result;
                    self.classify().await?;
                }
                Phase::Confirm => {
                    self.confirm_seen = true;
                    self.state.last_phase_url = Some(self.page.current_url().await?);
                    self.advance(Event::PhaseStarted(Phase::Confirm));
                    let result = self.confirm_phase().await?;
                    tracing::info!(phase = "confirm", ?result, "phase finished");
                    self.state.last_confirm_result = result;
                    self.classify().await?;
                }
                Phase::Unknown => {
                    tokio::time::sleep(Duration::from_millis(self.config().timeouts.reclassify_ms)).await;
                    self.classify().await?;
                }
                Phase::Complete | Phase::Error => {
                    self.audited_phase = self.state.phase;
                    let stage = match self.state.phase {
                        Phase::Complete => "complete".to_string(),
                        _ => format!("error{}", self.state.error_trial_count),
                    };
                    self.capture(&stage).await;
                    self.advance(Event::Audited);
                }
                Phase::Done => break,
            }
        }
        Ok(())
    }

    // ── Phases ──────────────────────────────────────────────────────

    async fn input_phase(&mut self) -> Result<InputResult> {
        let page = self.page;
        let config = self.config();
        let vocabulary = &config.vocabulary;

        if let Err(e) = accept_consent(page, &FrameContext::Main, config).await {
            tracing::debug!("consent controls not handled: {e}");
        }

        let Some(snapshot) = locate_form(page, config).await? else {
            tracing::warn!("no contact form on the page");
            return Ok(InputResult::FormNotFound);
        };
        tracing::info!(method = ?snapshot.method, form_index = ?snapshot.form_index, "form located");
        self.ctx = snapshot.origin.clone();

        if self.challenge_present().await {
            tracing::warn!("challenge widget present");
            return Ok(InputResult::ChallengeDetected);
        }

        let extraction = extract_anchored(&snapshot.html, snapshot.anchor(), vocabulary);
        if extraction.is_empty() {
            return Ok(InputResult::FieldExtractionFailed);
        }
        self.fields = extraction.fields.clone();

        let Some(mapping) = self.resolve_mapping(&extraction.fields, &snapshot.html).await? else {
            return Ok(InputResult::MappingError);
        };
        self.mapping = mapping;

        let writes = assignments(&extraction.fields, &self.mapping, &self.services.input);
        let report = FormFiller::new(page, &self.ctx, snapshot.form_index, config)
            .fill(&writes)
            .await;
        tracing::info!(
            written = report.written.len(),
            skipped = report.skipped.len(),
            unresolved = report.unresolved.len(),
            "form filled"
        );
        let failed = report.failed();
        self.fill = Some(report);
        if failed {
            return Ok(InputResult::FillFormError);
        }

        SubmissionMonitor::new(page, &self.ctx, snapshot.form_index, config)
            .submit(extraction.submit.as_ref())
            .await
    }

    async fn challenge_present(&self) -> bool {
        let mut contexts = vec![FrameContext::Main];
        if self.ctx != FrameContext::Main {
            contexts.push(self.ctx.clone());
        }
        for ctx in &contexts {
            for marker in &self.config().vocabulary.challenge_markers {
                let target = Target::css(None, marker.clone());
                if self.page.count(ctx, &target).await.unwrap_or(0) > 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Stored mapping for an unchanged schema, else the cache, else a completion.
    async fn resolve_mapping(
        &mut self,
        fields: &[FieldDescriptor],
        fragment: &str,
    ) -> Result<Option<Vec<FieldMapping>>> {
        let services = self.services;
        let config = self.config();
        let input = &*services.input;

        match services.store.load_form(&self.identity).await {
            Ok(Some(record)) if record.same_schema(fields) => {
                tracing::info!(identity = %self.identity, "reusing stored mapping");
                let mapping = normalize(fields, &record.mapping, input, &config.vocabulary);
                return Ok(Some(mapping));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("stored form unavailable: {e}"),
        }

        let request = build_request(fields, fragment, input, &config.tuning, &config.vocabulary)?;
        let key = request.cache_key(&self.identity);
        let raw = match services.cache.get(&key) {
            Some(hit) => {
                tracing::debug!("mapping cache hit");
                hit
            }
            None => {
                let completion = CompletionRequest::new(&config.tuning.mapping_model, &request.prompt)
                    .with_system(&request.system);
                let reply = match services.completion.complete(&completion).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::warn!("mapping request failed: {e}");
                        return Ok(None);
                    }
                };
                let Some(parsed) = parse_reply(&reply, fields) else {
                    tracing::warn!("mapping reply is not usable JSON");
                    return Ok(None);
                };
                services.cache.insert(key, parsed.clone());
                parsed
            }
        };

        let mapping = normalize(fields, &raw, input, &config.vocabulary);
        if mapping.is_empty() {
            tracing::warn!("no field could be mapped");
            return Ok(None);
        }

        let record = FormRecord {
            identity: self.identity.clone(),
            url: self.url.to_string(),
            fields: fields.to_vec(),
            mapping: mapping.clone(),
            prompt: request.prompt,
            updated_at: Local::now(),
        };
        if let Err(e) = services.store.save_form(&record).await {
            tracing::warn!("form record not saved: {e}");
        }
        Ok(Some(mapping))
    }

    async fn confirm_phase(&self) -> Result<ConfirmResult> {
        let page = self.page;
        let config = self.config();
        if config.tuning.dry_run {
            return Ok(ConfirmResult::NotSubmittedForDebug);
        }

        let result = if page.count(&FrameContext::Main, &Target::css(None, CF7_WIDGET)).await.unwrap_or(0) > 0 {
            self.confirm_cf7().await?
        } else {
            let mut result = self.confirm_in(&self.ctx).await?;
            if result == ConfirmResult::ConfirmButtonNotFound && self.ctx != FrameContext::Main {
                result = self.confirm_in(&FrameContext::Main).await?;
            }
            result
        };

        if result == ConfirmResult::Success {
            tokio::time::sleep(Duration::from_millis(config.timeouts.confirm_settle_ms)).await;
        }
        Ok(result)
    }

    async fn confirm_cf7(&self) -> Result<ConfirmResult> {
        let target = Target::nth(None, CF7_SUBMIT, 0);
        if self.page.count(&FrameContext::Main, &target).await? == 0 {
            return Ok(ConfirmResult::ConfirmButtonNotFound);
        }
        Ok(match self.page.click(&FrameContext::Main, &target).await {
            Ok(()) => ConfirmResult::Success,
            Err(e) => {
                tracing::warn!("confirm click failed: {e}");
                ConfirmResult::Error
            }
        })
    }

    async fn confirm_in(&self, ctx: &FrameContext) -> Result<ConfirmResult> {
        let page = self.page;
        let config = self.config();
        let wait = Duration::from_millis(config.timeouts.confirm_button_ms);
        if !page.wait_for(ctx, &Target::css(None, CONFIRM_SUBMIT), wait).await.unwrap_or(false) {
            tracing::debug!(?ctx, "no submit-capable control on the confirm page");
        }

        let buttons = page.buttons(ctx).await.unwrap_or_default();
        let Some(send) = buttons
            .iter()
            .find(|b| !b.disabled && mentions(&b.text, &config.vocabulary.button_send))
        else {
            return Ok(ConfirmResult::ConfirmButtonNotFound);
        };

        let target = Target::nth(None, BUTTON_SELECTOR, send.index);
        let clicked = if send.has_onclick {
            page.script_click(ctx, &target).await
        } else {
            page.click(ctx, &target).await
        };
        Ok(match clicked {
            Ok(()) => {
                tracing::info!(text = %send.text, "confirm button clicked");
                ConfirmResult::Success
            }
            Err(e) => {
                tracing::warn!("confirm click failed: {e}");
                ConfirmResult::Error
            }
        })
    }

    // ── Audit ───────────────────────────────────────────────────────

    /// Full-page screenshot archived through the image store. Failures only log.
    async fn capture(&mut self, stage: &str) {
        let run = &self.services.run;
        let domain = url::Url::parse(self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.identity.clone());
        let path = run.screenshot_path(&domain, stage);

        let saved = async {
            let bytes = self.page.screenshot().await?;
            tokio::fs::create_dir_all(run.screenshot_dir()).await?;
            tokio::fs::write(&path, bytes).await?;
            self.services.images.store(&path).await
        };
        match saved.await {
            Ok(reference) => {
                tracing::debug!(%reference, "screenshot archived");
                self.image = Some(reference);
            }
            Err(e) => tracing::warn!(path = %path.display(), "screenshot not archived: {e}"),
        }
    }

    fn record(self) -> SubmissionRecord {
        let verdict = if self.state.completed {
            Verdict::Success
        } else {
            Verdict::Error
        };
        SubmissionRecord {
            url: self.url.to_string(),
            identity: self.identity,
            verdict,
            marker: result_marker(self.input_result, verdict).to_string(),
            final_phase: self.audited_phase,
            input_result: self.input_result,
            confirm_result: self.state.last_confirm_result,
            confirm_seen: self.confirm_seen,
            input_trials: self.state.input_trial_count,
            error_trials: self.state.error_trial_count,
            total_trials: self.state.total_trial_count,
            halted: self.state.halted,
            fields: self.fields,
            mapping: self.mapping,
            fill: self.fill,
            image: self.image,
            failure: None,
            started_at: self.started_at,
            finished_at: Local::now(),
        }
    }
}

/// Audit record for a session whose guard caught an infrastructure error.
pub fn failed_record(url: &str, error: &crate::error::Error, started_at: DateTime<Local>) -> SubmissionRecord {
    SubmissionRecord {
        url: url.to_string(),
        identity: form_identity(url),
        verdict: Verdict::Error,
        marker: result_marker(InputResult::SessionFailed, Verdict::Error).to_string(),
        final_phase: Phase::Error,
        input_result: InputResult::SessionFailed,
        confirm_result: ConfirmResult::None,
        confirm_seen: false,
        input_trials: 0,
        error_trials: 0,
        total_trials: 0,
        halted: true,
        fields: Vec::new(),
        mapping: Vec::new(),
        fill: None,
        image: None,
        failure: Some(error.to_string()),
        started_at,
        finished_at: Local::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_failed_record_marks_session_failed() {
        let err = Error::NavigationError("net::ERR_NAME_NOT_RESOLVED".into());
        let record = failed_record("https://gone.test/contact/", &err, Local::now());
        assert_eq!(record.identity, "gone.test__contact");
        assert_eq!(record.input_result, InputResult::SessionFailed);
        assert_eq!(record.marker, "×");
        assert!(record.failure.unwrap().contains("ERR_NAME_NOT_RESOLVED"));
    }
}
