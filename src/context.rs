use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Batch-wide values fixed when the run starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    started_at: DateTime<Local>,
    screenshot_dir: PathBuf,
}

impl RunContext {
    pub fn new(screenshot_dir: impl Into<PathBuf>) -> Self {
        Self::at(Local::now(), screenshot_dir)
    }

    pub fn at(started_at: DateTime<Local>, screenshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            started_at,
            screenshot_dir: screenshot_dir.into(),
        }
    }

    pub fn screenshot_dir(&self) -> &Path {
        &self.screenshot_dir
    }

    /// `YYYYMMDDhhmmss`, used in file names.
    pub fn compact_stamp(&self) -> String {
        self.started_at.format("%Y%m%d%H%M%S").to_string()
    }

    /// `YYYY/MM/DD hh:mm:ss`, written into result rows.
    pub fn display_stamp(&self) -> String {
        self.started_at.format("%Y/%m/%d %H:%M:%S").to_string()
    }

    /// `{dir}/{domain}_{stamp}_{stage}.png`
    pub fn screenshot_path(&self, domain: &str, stage: &str) -> PathBuf {
        let domain: String = domain
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.screenshot_dir
            .join(format!("{domain}_{}_{stage}.png", self.compact_stamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stamps_and_screenshot_path() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let ctx = RunContext::at(at, "/tmp/shots");
        assert_eq!(ctx.compact_stamp(), "20240305070809");
        assert_eq!(ctx.display_stamp(), "2024/03/05 07:08:09");
        assert_eq!(
            ctx.screenshot_path("example.com:8080", "input"),
            PathBuf::from("/tmp/shots/example.com_8080_20240305070809_input.png")
        );
    }
}
