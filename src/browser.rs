use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CrBrowser, BrowserConfig as CrBrowserConfig};
use chromiumoxide::handler::viewport::Viewport;
use futures::StreamExt;

use crate::config::{BrowserBuilder, BrowserConfig};
use crate::error::{Error, Result};
use crate::page::Page;

/// Chrome flags that improve performance without affecting functionality.
const PERF_ARGS: &[&str] = &[
    "disable-gpu",
    "disable-extensions",
    "metrics-recording-only",
    "mute-audio",
    "no-default-browser-check",
    "disable-client-side-phishing-detection",
    "disable-prompt-on-repost",
    "disable-dev-shm-usage",
];

/// Hands out fresh tabs to sessions. The batch runner only needs this much of a browser.
#[async_trait]
pub trait PageOpener: Send + Sync {
    type Page: crate::driver::FormPage + 'static;

    async fn open(&self) -> Result<Self::Page>;

    async fn release(&self, page: Self::Page);
}

/// The single browser process shared by every session of a run.
pub struct PilotBrowser {
    browser: CrBrowser,
    blocked_resources: Vec<String>,
    blocked_urls: Vec<String>,
    default_timeout: Duration,
    _handler_task: tokio::task::JoinHandle<()>,
}

impl PilotBrowser {
    /// Create a new BrowserBuilder for configuring and launching a browser.
    pub fn builder() -> BrowserBuilder {
        BrowserBuilder::new()
    }

    /// Launch a browser instance with the given configuration.
    pub async fn launch(config: BrowserConfig) -> Result<Self> {
        let mut builder = CrBrowserConfig::builder();

        if config.headless {
            builder = builder.new_headless_mode().no_sandbox();
        } else {
            builder = builder.with_head().no_sandbox();
        }

        // chromiumoxide adds the `--` prefix itself
        for arg in PERF_ARGS {
            builder = builder.arg(*arg);
        }

        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        }

        builder = builder.viewport(Viewport {
            width: config.viewport_width,
            height: config.viewport_height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: false,
            has_touch: false,
        });

        let cr_config = builder
            .build()
            .map_err(|e| Error::LaunchError(e.to_string()))?;

        let (browser, mut handler) = CrBrowser::launch(cr_config)
            .await
            .map_err(|e| Error::LaunchError(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("cdp handler: {e}");
                }
            }
        });

        tracing::info!(headless = config.headless, "browser launched");

        Ok(Self {
            browser,
            blocked_resources: config.blocked_resources,
            blocked_urls: config.blocked_urls,
            default_timeout: config.default_timeout,
            _handler_task: handler_task,
        })
    }

    /// Open a blank tab with request blocking installed before any navigation.
    pub async fn new_page(&self) -> Result<Page> {
        let cr_page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::NavigationError(e.to_string()))?;

        let page = Page::new(cr_page, self.default_timeout);
        page.block_resources(&self.blocked_resources, &self.blocked_urls)
            .await?;
        Ok(page)
    }

    /// Close the browser process.
    pub async fn close(mut self) -> Result<()> {
        self.browser.close().await?;
        let _ = self.browser.wait().await;
        Ok(())
    }
}

#[async_trait]
impl PageOpener for PilotBrowser {
    type Page = Page;

    async fn open(&self) -> Result<Page> {
        self.new_page().await
    }

    async fn release(&self, page: Page) {
        if let Err(e) = page.close().await {
            tracing::debug!("closing tab failed: {e}");
        }
    }
}
