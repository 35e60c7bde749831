use std::time::Duration;

use crate::types::Progress;

/// Render a fixed-width progress bar followed by the percentage.
pub fn progress_bar(percent: u8, len: usize) -> String {
    let percent = percent.min(100);
    let filled = (percent as usize * len / 100).min(len);

    let mut bar = String::with_capacity(len * 3 + 5);
    for _ in 0..filled {
        bar.push('▰');
    }
    for _ in filled..len {
        bar.push('▱');
    }
    bar.push_str(&format!(" {}%", percent));
    bar
}

/// Format a duration rounded to whole seconds, e.g. `45s`, `1m5s`, `2h0m3s`.
pub fn format_duration(d: Duration) -> String {
    let secs = (d.as_millis() + 500) / 1000;
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Running progress estimate for the in-flight job.
///
/// Backends report noisy values: between the txt2img pass and a hires pass
/// the percentage drops back, and some report values above 100. The tracker
/// clamps the percentage to 0..=100 and only ever moves it forward. The ETA
/// always follows the latest poll.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    percent: u8,
    eta: Duration,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one poll result. Returns `true` if the percentage advanced.
    pub fn observe(&mut self, progress: Progress) -> bool {
        self.eta = progress.eta;
        let clamped = progress.percent.clamp(0, 100) as u8;
        if clamped <= self.percent {
            return false;
        }
        self.percent = clamped;
        true
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn eta(&self) -> Duration {
        self.eta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(percent: i32, eta_secs: u64) -> Progress {
        Progress {
            percent,
            eta: Duration::from_secs(eta_secs),
        }
    }

    #[test]
    fn test_progress_bar_bounds() {
        assert_eq!(progress_bar(0, 4), "▱▱▱▱ 0%");
        assert_eq!(progress_bar(100, 4), "▰▰▰▰ 100%");
        assert_eq!(progress_bar(255, 4), "▰▰▰▰ 100%");
    }

    #[test]
    fn test_progress_bar_default_length() {
        let bar = progress_bar(50, 16);
        assert_eq!(bar.chars().filter(|c| *c == '▰').count(), 8);
        assert_eq!(bar.chars().filter(|c| *c == '▱').count(), 8);
        assert!(bar.ends_with(" 50%"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(1_600)), "2s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_duration(Duration::from_secs(7_203)), "2h0m3s");
    }

    #[test]
    fn test_tracker_is_monotonic() {
        let mut tracker = ProgressTracker::new();
        assert!(tracker.observe(poll(30, 20)));
        assert!(!tracker.observe(poll(10, 5)));
        assert_eq!(tracker.percent(), 30);

        assert!(tracker.observe(poll(60, 8)));
        assert_eq!(tracker.eta(), Duration::from_secs(8));
    }

    #[test]
    fn test_tracker_eta_follows_latest_poll() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(poll(80, 4));
        // hires pass restarts the percentage but reports a fresh ETA
        assert!(!tracker.observe(poll(5, 40)));
        assert_eq!(tracker.percent(), 80);
        assert_eq!(tracker.eta(), Duration::from_secs(40));
    }

    #[test]
    fn test_tracker_clamps() {
        let mut tracker = ProgressTracker::new();
        assert!(!tracker.observe(poll(-5, 1)));
        assert_eq!(tracker.percent(), 0);

        assert!(tracker.observe(poll(140, 0)));
        assert_eq!(tracker.percent(), 100);
        assert!(!tracker.observe(poll(150, 0)));
    }
}
