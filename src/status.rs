//! User-visible status texts.

use std::time::Duration;

use crate::progress::{format_duration, progress_bar};

pub const IMAGE_REQUEST: &str = "🩻 Please send the image file to process.";
pub const PROCESS_START: &str = "🛎 Starting render...";
pub const PROCESSING: &str = "🔨 Working";
pub const DOWNLOADING: &str = "⬇ Downloading...";
pub const UPLOADING: &str = "☁ Uploading...";
pub const ERROR: &str = "❌ Error";
pub const CANCELED: &str = "⭕ Canceled";

pub fn queue_position(position: usize) -> String {
    format!("👨‍👦‍👦 Request queued at position #{}", position)
}

pub fn process_start(summary: &str) -> String {
    format!("{}\n{}", PROCESS_START, summary)
}

pub fn working(percent: u8, bar_len: usize, eta: Duration, elapsed: Duration, summary: &str) -> String {
    format!(
        "{} {} ETA: {} ⏱ {}\n{}",
        PROCESSING,
        progress_bar(percent, bar_len),
        format_duration(eta),
        format_duration(elapsed),
        summary
    )
}

pub fn uploading(summary: &str) -> String {
    format!("{}\n{}", UPLOADING, summary)
}

pub fn error(message: &str) -> String {
    format!("{}: {}", ERROR, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_position_text() {
        assert_eq!(queue_position(1), "👨‍👦‍👦 Request queued at position #1");
    }

    #[test]
    fn test_working_text() {
        let text = working(50, 4, Duration::from_secs(12), Duration::from_secs(65), "summary");
        assert_eq!(text, "🔨 Working ▰▰▱▱ 50% ETA: 12s ⏱ 1m5s\nsummary");
    }

    #[test]
    fn test_error_text() {
        assert_eq!(error("got no image data"), "❌ Error: got no image data");
    }
}
