//! Turning renderer output and output-folder contents into a progress
//! fraction.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Output prefixes the renderer prints for its own debugging. They carry no
/// progress and would drown the job log, so they are dropped.
pub const NOISE_PREFIXES: &[&str] = &[
    "DEBUG",
    "[debug]",
    "LM_",
    "lm_debug",
    "Qt:",
    "qt.",
    "QFont",
    "libpng warning",
    "GLib",
    "Gtk-",
    "Fontconfig",
    "ALSA lib",
    "ScriptDebug",
    "Lua debug",
];

/// Printed once per finished composition (layer comp or the whole scene).
pub const COMPOSITION_DONE: &str = "Done!";

/// Ceiling for estimated progress: only a successful exit reaches 1.0.
pub const MAX_ESTIMATE: f32 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `Frame 12 (12/240)`.
    FrameProgress { current: u32, total: u32 },
    /// The renderer finished one composition and may start another.
    CompositionDone,
    Noise,
    Diagnostic,
}

/// Sorts renderer output lines. The noise table is data so new prefixes can
/// come from config instead of code.
#[derive(Debug, Clone, Default)]
pub struct LineClassifier {
    extra_noise: Vec<String>,
}

impl LineClassifier {
    pub fn new(extra_noise: Vec<String>) -> Self {
        Self { extra_noise }
    }

    pub fn classify(&self, line: &str) -> LineKind {
        let line = line.trim();
        if line.is_empty() {
            return LineKind::Noise;
        }
        if line == COMPOSITION_DONE {
            return LineKind::CompositionDone;
        }
        if let Some((current, total)) = parse_frame_line(line) {
            return LineKind::FrameProgress { current, total };
        }
        let noisy = NOISE_PREFIXES.iter().any(|p| line.starts_with(p))
            || self.extra_noise.iter().any(|p| line.starts_with(p.as_str()));
        if noisy {
            LineKind::Noise
        } else {
            LineKind::Diagnostic
        }
    }
}

/// Parse `Frame <n> (<current>/<total>)`.
fn parse_frame_line(line: &str) -> Option<(u32, u32)> {
    let rest = line.strip_prefix("Frame ")?;
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let (current, total) = rest[open + 1..close].split_once('/')?;
    let current = current.trim().parse().ok()?;
    let total: u32 = total.trim().parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((current, total))
}

/// Count rendered frames: files with `extension` in `folder` and in its
/// immediate subfolders (layer comps may get a folder each).
pub fn count_frame_files(folder: &Path, extension: &str) -> usize {
    let matches = |path: &Path| {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(extension))
            .unwrap_or(false)
    };
    let Ok(entries) = std::fs::read_dir(folder) else {
        return 0;
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Ok(inner) = std::fs::read_dir(&path) {
                count += inner
                    .flatten()
                    .filter(|e| e.path().is_file() && matches(&e.path()))
                    .count();
            }
        } else if matches(&path) {
            count += 1;
        }
    }
    count
}

#[derive(Debug, Clone)]
pub enum ProgressMode {
    /// Frame sequence with a known range: progress is files written over
    /// frames expected.
    FrameFiles {
        folder: PathBuf,
        extension: String,
        expected: u32,
        /// Files already there when the current composition started.
        baseline: usize,
    },
    /// Video: elapsed time over an estimate that frame lines refine.
    TimeEstimate {
        initial: Duration,
        estimate: Duration,
    },
    /// Frame sequence with an unknown range: trust the frame lines.
    FrameLines,
}

/// Progress state for one render attempt. Time is passed in so the
/// arithmetic is testable without a clock.
#[derive(Debug)]
pub struct ProgressTracker {
    mode: ProgressMode,
    started: Instant,
    composition_started: Instant,
    last_signal: Option<Instant>,
    compositions_done: u32,
    progress: f32,
    /// Files written over the whole attempt, for the output check.
    written_total: usize,
    first_baseline: usize,
}

impl ProgressTracker {
    pub fn new(mode: ProgressMode, now: Instant) -> Self {
        let first_baseline = match &mode {
            ProgressMode::FrameFiles { baseline, .. } => *baseline,
            _ => 0,
        };
        Self {
            mode,
            started: now,
            composition_started: now,
            last_signal: None,
            compositions_done: 0,
            progress: 0.0,
            written_total: 0,
            first_baseline,
        }
    }

    pub fn mode(&self) -> &ProgressMode {
        &self.mode
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn compositions_done(&self) -> u32 {
        self.compositions_done
    }

    pub fn written_total(&self) -> usize {
        self.written_total
    }

    /// When the renderer last showed signs of life, or the start time.
    pub fn last_activity(&self) -> Instant {
        self.last_signal.unwrap_or(self.started)
    }

    pub fn has_signal(&self) -> bool {
        self.last_signal.is_some()
    }

    pub fn observe_frame(&mut self, current: u32, total: u32, now: Instant) {
        self.last_signal = Some(now);
        match &mut self.mode {
            ProgressMode::FrameLines => {
                self.progress = (current as f32 / total as f32).min(MAX_ESTIMATE);
            }
            ProgressMode::TimeEstimate { estimate, .. } => {
                if current > 0 {
                    let elapsed = now.saturating_duration_since(self.composition_started);
                    *estimate = elapsed.mul_f64(total as f64 / current as f64);
                }
                self.progress = self.time_fraction(now);
            }
            // Files on disk are the authority for sequences.
            ProgressMode::FrameFiles { .. } => {}
        }
    }

    /// The renderer moved on to another composition: start from zero.
    pub fn composition_done(&mut self, now: Instant) {
        self.last_signal = Some(now);
        self.composition_started = now;
        self.compositions_done += 1;
        self.progress = 0.0;
        match &mut self.mode {
            ProgressMode::FrameFiles {
                folder,
                extension,
                baseline,
                ..
            } => *baseline = count_frame_files(folder, extension),
            ProgressMode::TimeEstimate { initial, estimate } => *estimate = *initial,
            ProgressMode::FrameLines => {}
        }
    }

    /// Feed the current number of frame files in the output folder.
    pub fn observe_files(&mut self, count: usize, now: Instant) {
        if let ProgressMode::FrameFiles {
            expected, baseline, ..
        } = &self.mode
        {
            let written = count.saturating_sub(*baseline);
            let total = count.saturating_sub(self.first_baseline);
            if total > self.written_total {
                self.written_total = total;
                self.last_signal = Some(now);
            }
            self.progress = (written as f32 / (*expected).max(1) as f32).min(MAX_ESTIMATE);
        }
    }

    /// Periodic update. Only the time estimate moves without new input.
    pub fn tick(&mut self, now: Instant) -> f32 {
        if matches!(self.mode, ProgressMode::TimeEstimate { .. }) {
            self.progress = self.time_fraction(now);
        }
        self.progress
    }

    pub fn finish(&mut self) -> f32 {
        self.progress = 1.0;
        self.progress
    }

    fn time_fraction(&self, now: Instant) -> f32 {
        let ProgressMode::TimeEstimate { estimate, .. } = &self.mode else {
            return self.progress;
        };
        if estimate.is_zero() {
            return MAX_ESTIMATE;
        }
        let elapsed = now.saturating_duration_since(self.composition_started);
        ((elapsed.as_secs_f64() / estimate.as_secs_f64()) as f32).min(MAX_ESTIMATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_lines() {
        let c = LineClassifier::new(vec!["WARN-ME".to_string()]);
        assert_eq!(
            c.classify("Frame 12 (12/240)"),
            LineKind::FrameProgress {
                current: 12,
                total: 240
            }
        );
        assert_eq!(c.classify("  Done!  "), LineKind::CompositionDone);
        assert_eq!(c.classify("DEBUG: loading font"), LineKind::Noise);
        assert_eq!(c.classify("WARN-ME something"), LineKind::Noise);
        assert_eq!(c.classify(""), LineKind::Noise);
        assert_eq!(c.classify("Could not open file"), LineKind::Diagnostic);
        assert_eq!(c.classify("Frame rate is 24"), LineKind::Diagnostic);
        assert_eq!(c.classify("Frame 1 (1/0)"), LineKind::Diagnostic);
    }

    #[test]
    fn frame_lines_mode_caps_below_one() {
        let now = Instant::now();
        let mut t = ProgressTracker::new(ProgressMode::FrameLines, now);
        t.observe_frame(5, 10, now);
        assert!((t.progress() - 0.5).abs() < 1e-6);
        t.observe_frame(10, 10, now);
        assert_eq!(t.progress(), MAX_ESTIMATE);
        assert_eq!(t.finish(), 1.0);
    }

    #[test]
    fn time_estimate_refined_by_frames() {
        let start = Instant::now();
        let mut t = ProgressTracker::new(
            ProgressMode::TimeEstimate {
                initial: Duration::from_secs(100),
                estimate: Duration::from_secs(100),
            },
            start,
        );
        let p = t.tick(start + Duration::from_secs(10));
        assert!((p - 0.1).abs() < 1e-3);

        // 10 of 40 frames in 10s: the estimate becomes 40s.
        t.observe_frame(10, 40, start + Duration::from_secs(10));
        let p = t.tick(start + Duration::from_secs(20));
        assert!((p - 0.5).abs() < 1e-3);

        let p = t.tick(start + Duration::from_secs(500));
        assert_eq!(p, MAX_ESTIMATE);
    }

    #[test]
    fn composition_done_resets() {
        let start = Instant::now();
        let mut t = ProgressTracker::new(ProgressMode::FrameLines, start);
        t.observe_frame(8, 10, start);
        t.composition_done(start + Duration::from_secs(1));
        assert_eq!(t.progress(), 0.0);
        assert_eq!(t.compositions_done(), 1);
        assert!(t.has_signal());
    }

    #[test]
    fn frame_files_count_from_baseline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old_0001.png"), b"x").unwrap();
        let start = Instant::now();
        let mut t = ProgressTracker::new(
            ProgressMode::FrameFiles {
                folder: dir.path().to_path_buf(),
                extension: "png".to_string(),
                expected: 4,
                baseline: count_frame_files(dir.path(), "png"),
            },
            start,
        );
        assert!(!t.has_signal());

        std::fs::write(dir.path().join("shot_0001.png"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("comp")).unwrap();
        std::fs::write(dir.path().join("comp").join("shot_0002.PNG"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let count = count_frame_files(dir.path(), "png");
        assert_eq!(count, 3);

        t.observe_files(count, start + Duration::from_millis(500));
        assert!((t.progress() - 0.5).abs() < 1e-6);
        assert_eq!(t.written_total(), 2);
        assert!(t.has_signal());
    }

    #[test]
    fn missing_folder_counts_zero() {
        assert_eq!(count_frame_files(Path::new("/definitely/not/here"), "png"), 0);
    }
}
