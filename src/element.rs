use chromiumoxide::element::Element as CrElement;

use crate::error::Result;

/// A resolved main-document element, driven through real pointer and key input.
pub(crate) struct Element {
    inner: CrElement,
}

impl Element {
    pub(crate) fn new(inner: CrElement) -> Self {
        Self { inner }
    }

    /// Click this element (scrolls into view first).
    pub async fn click(&self) -> Result<()> {
        self.inner.click().await?;
        Ok(())
    }

    /// Type text one key event at a time.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.inner.type_str(text).await?;
        Ok(())
    }

    pub async fn focus(&self) -> Result<()> {
        self.inner.focus().await?;
        Ok(())
    }
}
