use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::browser::PilotBrowser;
use crate::error::{Error, Result};

/// Resource types dropped by request interception unless overridden.
const DEFAULT_BLOCKED_RESOURCES: &[&str] = &["Image", "Font", "Stylesheet", "Media"];

/// URL fragments of analytics beacons dropped by request interception.
const DEFAULT_BLOCKED_URLS: &[&str] = &[
    "www.google-analytics.com",
    "www.googletagmanager.com",
    "connect.facebook.net",
];

pub struct BrowserConfig {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub chrome_path: Option<String>,
    /// Default timeout for operations like `wait_for` (default: 10s).
    pub default_timeout: Duration,
    /// CDP resource types (e.g. "Image") failed before they are fetched.
    pub blocked_resources: Vec<String>,
    /// Requests whose URL contains any of these fragments are failed.
    pub blocked_urls: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1280,
            viewport_height: 1024,
            chrome_path: None,
            default_timeout: Duration::from_secs(10),
            blocked_resources: DEFAULT_BLOCKED_RESOURCES.iter().map(|s| s.to_string()).collect(),
            blocked_urls: DEFAULT_BLOCKED_URLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub struct BrowserBuilder {
    config: BrowserConfig,
}

impl BrowserBuilder {
    pub fn new() -> Self {
        Self {
            config: BrowserConfig::default(),
        }
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    pub fn viewport(mut self, width: u32, height: u32) -> Self {
        self.config.viewport_width = width;
        self.config.viewport_height = height;
        self
    }

    pub fn chrome_path(mut self, path: impl Into<String>) -> Self {
        self.config.chrome_path = Some(path.into());
        self
    }

    /// Set the default timeout for operations like `wait_for`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Replace the list of blocked CDP resource types. An empty list disables interception.
    pub fn blocked_resources<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.blocked_resources = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn block_url(mut self, fragment: impl Into<String>) -> Self {
        self.config.blocked_urls.push(fragment.into());
        self
    }

    pub fn build_config(self) -> BrowserConfig {
        self.config
    }

    pub async fn build(self) -> Result<PilotBrowser> {
        PilotBrowser::launch(self.build_config()).await
    }
}

impl Default for BrowserBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Session-level configuration: waits, budgets, tuning knobs and vocabulary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub timeouts: Timeouts,
    pub limits: Limits,
    pub tuning: Tuning,
    pub vocabulary: Vocabulary,
}

impl PilotConfig {
    /// Load a YAML config file. Missing sections keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tuning.concurrency == 0 {
            return Err(Error::ConfigError("tuning.concurrency must be at least 1".into()));
        }
        if self.tuning.field_delay_ms.0 > self.tuning.field_delay_ms.1 {
            return Err(Error::ConfigError(
                "tuning.field_delay_ms must be an ascending (min, max) pair".into(),
            ));
        }
        if self.limits.max_total_trials == 0 {
            return Err(Error::ConfigError("limits.max_total_trials must be at least 1".into()));
        }
        Ok(())
    }
}

/// Call-site timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Settle delay after navigation before the page is inspected.
    pub settle_ms: u64,
    /// Waiting for a form inside a frame; expiry means "no form there".
    pub frame_form_ms: u64,
    /// Waiting for a field or submit control to appear.
    pub selector_ms: u64,
    /// The submission race; expiry is treated as success.
    pub submit_race_ms: u64,
    /// Waiting for the confirm page's submit button.
    pub confirm_button_ms: u64,
    /// Settle delay after the confirm click.
    pub confirm_settle_ms: u64,
    /// Delay before re-classifying an inconclusive page.
    pub reclassify_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            settle_ms: 1_500,
            frame_form_ms: 10_000,
            selector_ms: 5_000,
            submit_race_ms: 10_000,
            confirm_button_ms: 20_000,
            confirm_settle_ms: 10_000,
            reclassify_ms: 2_000,
        }
    }
}

impl Timeouts {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn selector(&self) -> Duration {
        Duration::from_millis(self.selector_ms)
    }

    pub fn submit_race(&self) -> Duration {
        Duration::from_millis(self.submit_race_ms)
    }
}

/// Retry budgets of the session state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_input_trials: u32,
    pub max_error_retries: u32,
    /// Ceiling on state-machine events per session, independent of the other budgets.
    pub max_total_trials: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_input_trials: 2,
            max_error_retries: 2,
            max_total_trials: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Sessions run concurrently per group.
    pub concurrency: usize,
    /// Randomized pause after each field write, as an inclusive (min, max) range.
    pub field_delay_ms: (u64, u64),
    /// Free-text dictionary values are cut to this many characters in the prompt.
    pub preview_chars: usize,
    /// Option lists longer than this are dropped from the prompt markup.
    pub max_prompt_options: usize,
    /// Page text sent to the classifier is cut to this many characters.
    pub classify_chars: usize,
    /// A child holding at least this share of its parent's text is descended into.
    pub dense_share: f64,
    /// Stop before clicking any submit control.
    pub dry_run: bool,
    pub mapping_model: String,
    pub classify_model: String,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            concurrency: 5,
            field_delay_ms: (1_000, 2_000),
            preview_chars: 40,
            max_prompt_options: 500,
            classify_chars: 4_000,
            dense_share: 0.6,
            dry_run: false,
            mapping_model: "gpt-4o".to_string(),
            classify_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Keyword lists behind every heuristic. Matching is case-insensitive substring search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    /// Placeholder text marking a site-search form.
    pub search: Vec<String>,
    /// Send/confirm/next intent in submit control text.
    pub submit: Vec<String>,
    /// Send intent in image alt/src/name attributes.
    pub submit_image: Vec<String>,
    /// onclick text of div-based submit controls.
    pub submit_onclick: Vec<String>,
    /// Placeholder option text of selects.
    pub select_placeholder: Vec<String>,
    /// The "other" option preferred for ambiguous enumerable mappings.
    pub other_option: Vec<String>,
    /// Privacy-notice paragraphs dropped from the prompt markup.
    pub privacy_notice: Vec<String>,
    /// Text appearing after a successful submission.
    pub mutation_success: Vec<String>,
    /// Validation text appearing after a rejected submission.
    pub mutation_failure: Vec<String>,
    pub url_confirm: Vec<String>,
    pub url_complete: Vec<String>,
    /// Button text meaning "go to the next step".
    pub button_advance: Vec<String>,
    /// Button text meaning "send now".
    pub button_send: Vec<String>,
    /// Consent checkbox labels and agreement buttons.
    pub consent: Vec<String>,
    /// CSS selectors of third-party success markers.
    pub success_markers: Vec<String>,
    /// CSS selectors of challenge widgets.
    pub challenge_markers: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            search: words(&["検索", "search"]),
            submit: words(&["送", "確", "申", "次", "進", "send", "submit", "confirm", "next"]),
            submit_image: words(&["送信", "確認", "申込", "次へ", "進む", "send", "submit", "confirm"]),
            submit_onclick: words(&["submit", "confirm", "send"]),
            select_placeholder: words(&["選択", "please select", "please choose", "select one", "choose one"]),
            other_option: words(&["その他", "other"]),
            privacy_notice: words(&["個人情報", "プライバシー", "改訂", "privacy", "personal information"]),
            mutation_success: words(&[
                "有難う",
                "有り難う",
                "有りがとう",
                "ありがとう",
                "送信完了",
                "送信しました",
                "完了しました",
                "thank you",
                "thanks",
            ]),
            mutation_failure: words(&[
                "エラー",
                "必須",
                "未入力",
                "入力されて",
                "入力して",
                "できません",
                "誤り",
                "異な",
                "不正",
                "不備",
                "もう一度",
                "問題",
                "漏れ",
                "もれ",
                "error",
                "required",
                "invalid",
            ]),
            url_confirm: words(&["confirm", "check", "kakunin", "review"]),
            url_complete: words(&["complete", "thanks", "thank", "done", "finish", "kanryo", "success"]),
            button_advance: words(&["確認", "次へ", "進む", "confirm", "next", "review"]),
            button_send: words(&["送信", "送る", "send", "submit"]),
            consent: words(&["同意", "agree", "accept"]),
            success_markers: words(&[
                ".wpcf7-mail-sent-ok",
                ".wpcf7 form.sent",
                ".hs-form__thankyou-message",
                ".submitted-message",
            ]),
            challenge_markers: words(&[
                "div.g-recaptcha",
                "iframe[src*=\"recaptcha/api2/anchor\"]",
                ".h-captcha",
                ".cf-turnstile",
            ]),
        }
    }
}

/// Case-insensitive substring match against any term of a vocabulary list.
pub fn mentions(text: &str, terms: &[String]) -> bool {
    let lowered = text.to_lowercase();
    terms
        .iter()
        .filter(|t| !t.is_empty())
        .any(|t| lowered.contains(&t.to_lowercase()))
}
