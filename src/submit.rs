use std::time::Duration;

use crate::config::PilotConfig;
use crate::driver::{FormPage, FrameContext};
use crate::error::Result;
use crate::fields::{SubmitDescriptor, SubmitStage};
use crate::result::InputResult;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Which signal settled the race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    MutationFailure,
    MutationSuccess,
    Dialog(String),
    Navigated(String),
    TimedOut,
}

impl SubmitOutcome {
    pub fn input_result(&self) -> InputResult {
        match self {
            Self::MutationFailure | Self::Dialog(_) => InputResult::InvalidInputFormat,
            Self::MutationSuccess | Self::Navigated(_) | Self::TimedOut => InputResult::Complete,
        }
    }
}

/// Clicks the submit control and decides how the page reacted.
pub struct SubmissionMonitor<'a, P: FormPage + ?Sized> {
    page: &'a P,
    ctx: &'a FrameContext,
    scope: Option<usize>,
    config: &'a PilotConfig,
}

impl<'a, P: FormPage + ?Sized> SubmissionMonitor<'a, P> {
    pub fn new(page: &'a P, ctx: &'a FrameContext, scope: Option<usize>, config: &'a PilotConfig) -> Self {
        Self { page, ctx, scope, config }
    }

    pub async fn submit(&self, submit: Option<&SubmitDescriptor>) -> Result<InputResult> {
        let Some(submit) = submit else {
            tracing::warn!("no submit control in the form");
            return Ok(InputResult::SubmitControlNotFound);
        };
        let found = self
            .page
            .wait_for(self.ctx, &submit.target, self.config.timeouts.selector())
            .await?;
        if !found {
            tracing::warn!(target = %submit.target, "submit control never appeared");
            return Ok(InputResult::SubmitControlNotFound);
        }
        if self.config.tuning.dry_run {
            tracing::info!(target = %submit.target, "dry run, not submitting");
            return Ok(InputResult::NotSubmittedForDebug);
        }

        let vocabulary = &self.config.vocabulary;
        if let Err(e) = self
            .page
            .install_outcome_watch(
                self.ctx,
                self.scope,
                &vocabulary.mutation_success,
                &vocabulary.mutation_failure,
            )
            .await
        {
            tracing::warn!("mutation watch unavailable: {e}");
        }
        let mut signals = self.page.arm_signals().await?;

        let clicked = match submit.stage {
            SubmitStage::DivOnclick => self.page.script_click(self.ctx, &submit.target).await,
            _ => self.page.click(self.ctx, &submit.target).await,
        };
        if let Err(e) = clicked {
            tracing::warn!(target = %submit.target, "submit click failed: {e}");
            return Ok(InputResult::SubmitClickFailed);
        }

        let deadline = tokio::time::sleep(self.config.timeouts.submit_race());
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let mut navigation_open = true;
        let mut dialog_open = true;

        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => break SubmitOutcome::TimedOut,
                url = &mut signals.navigated, if navigation_open => match url {
                    Ok(url) => break SubmitOutcome::Navigated(url),
                    Err(_) => navigation_open = false,
                },
                message = &mut signals.dialog, if dialog_open => match message {
                    Ok(message) => break SubmitOutcome::Dialog(message),
                    Err(_) => dialog_open = false,
                },
                _ = poll.tick() => {
                    // The context disappears while navigating; the navigation signal covers that
                    if let Ok(flags) = self.page.outcome_flags(self.ctx).await {
                        if flags.failure {
                            break SubmitOutcome::MutationFailure;
                        }
                        if flags.success {
                            break SubmitOutcome::MutationSuccess;
                        }
                    }
                }
            }
        };

        let result = outcome.input_result();
        tracing::info!(?outcome, ?result, "submission settled");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(SubmitOutcome::MutationFailure.input_result(), InputResult::InvalidInputFormat);
        assert_eq!(SubmitOutcome::Dialog("x".into()).input_result(), InputResult::InvalidInputFormat);
        assert_eq!(SubmitOutcome::TimedOut.input_result(), InputResult::Complete);
        assert_eq!(SubmitOutcome::Navigated("u".into()).input_result(), InputResult::Complete);
        assert_eq!(SubmitOutcome::MutationSuccess.input_result(), InputResult::Complete);
    }
}
