use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::RendererConfig;
use crate::error::{FarmError, Result};
use crate::render::render_args;
use crate::scheduler::job::format_elapsed;
use crate::worker::heartbeat::StatusHeartbeat;
use crate::worker::progress::{
    count_frame_files, LineClassifier, LineKind, ProgressMode, ProgressTracker,
};
use crate::worker::{RenderEvent, RenderRequest, RenderSummary, Renderer};

/// Diagnostic lines kept for the failure message.
const DIAGNOSTIC_TAIL: usize = 20;

/// How long to keep reading output after the renderer exits, for
/// grandchildren that still hold the pipes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the external renderer as a child process and supervises it.
///
/// One supervisor can run many attempts concurrently; each call to
/// [`Renderer::render`] owns its own child process.
#[derive(Debug, Clone)]
pub struct RenderSupervisor {
    config: RendererConfig,
    log_dir: Option<PathBuf>,
    classifier: LineClassifier,
}

impl RenderSupervisor {
    pub fn new(config: RendererConfig) -> Self {
        let classifier = LineClassifier::new(config.extra_noise_prefixes.clone());
        let log_dir = config.log_dir.clone();
        Self {
            config,
            log_dir,
            classifier,
        }
    }

    /// Directory for per-job logs of verbose renders.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Full argument list after the executable.
    pub fn command_args(&self, request: &RenderRequest, log_path: Option<&Path>) -> Vec<String> {
        let mut args = self.config.prefix_args.clone();
        args.extend(render_args(&request.project, &request.settings, log_path));
        args
    }

    fn log_path_for(&self, request: &RenderRequest) -> Option<PathBuf> {
        if let Some(explicit) = &request.settings.log_file {
            return Some(explicit.clone());
        }
        if !request.settings.verbose {
            return None;
        }
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("render_{}.log", request.job_id)))
    }

    fn progress_mode(&self, request: &RenderRequest) -> ProgressMode {
        let settings = &request.settings;
        if settings.format.is_frame_sequence() {
            match settings.expected_frames() {
                Some(expected) => {
                    let folder = settings.output_folder(&request.project);
                    let extension = settings.format.extension().to_string();
                    let baseline = count_frame_files(&folder, &extension);
                    ProgressMode::FrameFiles {
                        folder,
                        extension,
                        expected,
                        baseline,
                    }
                }
                None => ProgressMode::FrameLines,
            }
        } else {
            let estimate = Duration::from_secs(self.config.video_estimate_secs);
            ProgressMode::TimeEstimate {
                initial: estimate,
                estimate,
            }
        }
    }

    async fn prepare(&self, request: &RenderRequest, log_path: Option<&Path>) -> Result<()> {
        if request.settings.copy_images {
            let project = request.project.clone();
            match tokio::task::spawn_blocking(move || copy_images_to_root(&project)).await {
                Ok(Ok(copied)) if copied > 0 => {
                    tracing::info!(job_id = %request.job_id, copied, "Copied Images/ to project root");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(job_id = %request.job_id, error = %e, "Failed to copy Images/")
                }
                Err(e) => tracing::warn!(job_id = %request.job_id, error = %e, "Image copy task failed"),
            }
        }
        if request.settings.output_dir.is_some() {
            tokio::fs::create_dir_all(request.settings.output_folder(&request.project)).await?;
        }
        if let Some(parent) = log_path.and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    fn spawn(&self, request: &RenderRequest, log_path: Option<&Path>) -> Result<Child> {
        let args = self.command_args(request, log_path);
        tracing::debug!(
            job_id = %request.job_id,
            executable = %self.config.executable.display(),
            args = ?args,
            "Launching renderer"
        );
        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FarmError::RendererCrashed {
                    exit_code: None,
                    detail: format!(
                        "renderer executable not found: {}",
                        self.config.executable.display()
                    ),
                }
            } else {
                FarmError::Io(e)
            }
        })
    }

    /// Whether a successful exit left the expected output behind.
    fn check_output(&self, request: &RenderRequest, tracker: &ProgressTracker) -> Result<()> {
        let settings = &request.settings;
        match tracker.mode() {
            ProgressMode::FrameFiles {
                folder, expected, ..
            } => {
                if tracker.written_total() == 0 {
                    return Err(FarmError::OutputMissing(format!(
                        "no frames written to {} (expected {})",
                        folder.display(),
                        expected
                    )));
                }
            }
            ProgressMode::TimeEstimate { .. } => {
                // Suffix options and layer comps change the file name.
                let renamed = settings.layer_comp.is_some()
                    || settings.add_format_suffix == Some(true)
                    || settings.add_layer_comp_suffix == Some(true);
                if let Some(output) = settings.resolve_output(&request.project) {
                    if !renamed && !output.is_file() {
                        return Err(FarmError::OutputMissing(output.display().to_string()));
                    }
                }
            }
            ProgressMode::FrameLines => {}
        }
        Ok(())
    }
}

impl RenderSupervisor {
    /// Feed progress lines appended to the render log since the last call.
    async fn follow_log(
        &self,
        tail: &mut LogTail,
        tracker: &mut ProgressTracker,
        dones: &mut DoneCounts,
        request: &RenderRequest,
    ) {
        let lines = match tail.read_new().await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(job_id = %request.job_id, error = %e, "Render log not readable yet");
                return;
            }
        };
        let now = Instant::now();
        for line in lines {
            match self.classifier.classify(&line) {
                LineKind::FrameProgress { current, total } => {
                    tracker.observe_frame(current, total, now)
                }
                LineKind::CompositionDone => {
                    if dones.from_log() {
                        tracker.composition_done(now);
                    }
                }
                LineKind::Noise | LineKind::Diagnostic => {}
            }
        }
    }
}

#[async_trait]
impl Renderer for RenderSupervisor {
    async fn render(
        &self,
        request: RenderRequest,
        events: mpsc::UnboundedSender<RenderEvent>,
        cancel: CancellationToken,
    ) -> Result<RenderSummary> {
        let log_path = self.log_path_for(&request);
        self.prepare(&request, log_path.as_deref()).await?;

        let started = Instant::now();
        let mut child = self.spawn(&request, log_path.as_deref())?;
        tracing::info!(job_id = %request.job_id, pid = ?child.id(), "Render started");

        let _ = events.send(RenderEvent::Output(format!(
            "Starting render: {}",
            request.project.display()
        )));
        if let Some(path) = &log_path {
            let _ = events.send(RenderEvent::LogFile(path.clone()));
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FarmError::Io(std::io::Error::other("renderer stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FarmError::Io(std::io::Error::other("renderer stderr not captured")))?;
        let mut stdout = LinesStream::new(BufReader::new(stdout).lines());
        let mut stderr = LinesStream::new(BufReader::new(stderr).lines());
        let mut stdout_open = true;
        let mut stderr_open = true;

        let mut tracker = ProgressTracker::new(self.progress_mode(&request), started);
        let mut heartbeat = StatusHeartbeat::new(self.config.stale_after());
        let mut stdout_tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL);
        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL);
        let mut last_sent = -1.0f32;

        // The renderer may write progress only to its `-log` file.
        let mut log_tail = log_path.clone().map(LogTail::new);
        let mut dones = DoneCounts::default();

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut exit: Option<ExitStatus> = None;
        let mut drain_deadline: Option<Instant> = None;

        loop {
            if exit.is_some() && !stdout_open && !stderr_open {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled(), if exit.is_none() => {
                    tracing::info!(job_id = %request.job_id, "Cancelling render");
                    terminate_tree(&mut child, self.config.kill_grace()).await;
                    let _ = events.send(RenderEvent::Status(format!(
                        "Render cancelled ({})",
                        format_elapsed(started.elapsed().as_secs())
                    )));
                    return Err(FarmError::RendererCancelled);
                }
                line = stdout.next(), if stdout_open => match line {
                    Some(Ok(line)) => {
                        let now = Instant::now();
                        match self.classifier.classify(&line) {
                            LineKind::FrameProgress { current, total } => {
                                tracker.observe_frame(current, total, now);
                                let _ = events.send(RenderEvent::Output(line));
                            }
                            LineKind::CompositionDone => {
                                if dones.from_output() {
                                    tracker.composition_done(now);
                                }
                                let _ = events.send(RenderEvent::Output(line));
                            }
                            LineKind::Noise => {}
                            LineKind::Diagnostic => {
                                push_tail(&mut stdout_tail, &line);
                                let _ = events.send(RenderEvent::Output(line));
                            }
                        }
                        send_progress(&events, tracker.progress(), &mut last_sent);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(job_id = %request.job_id, error = %e, "Renderer stdout read failed");
                        stdout_open = false;
                    }
                    None => stdout_open = false,
                },
                line = stderr.next(), if stderr_open => match line {
                    Some(Ok(line)) => {
                        if self.classifier.classify(&line) == LineKind::Diagnostic {
                            push_tail(&mut stderr_tail, &line);
                            let _ = events.send(RenderEvent::Output(line));
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(job_id = %request.job_id, error = %e, "Renderer stderr read failed");
                        stderr_open = false;
                    }
                    None => stderr_open = false,
                },
                status = child.wait(), if exit.is_none() => {
                    exit = Some(status?);
                    drain_deadline = Some(Instant::now() + DRAIN_TIMEOUT);
                }
                _ = poll.tick() => {
                    if let Some(tail) = log_tail.as_mut() {
                        self.follow_log(tail, &mut tracker, &mut dones, &request).await;
                    }
                    let now = Instant::now();
                    if let Some(deadline) = drain_deadline {
                        if now >= deadline {
                            tracing::debug!(job_id = %request.job_id, "Output still open after exit, stop reading");
                            break;
                        }
                        continue;
                    }
                    if let ProgressMode::FrameFiles { folder, extension, .. } = tracker.mode() {
                        let folder = folder.clone();
                        let extension = extension.clone();
                        let count = tokio::task::spawn_blocking(move || count_frame_files(&folder, &extension))
                            .await
                            .unwrap_or(0);
                        tracker.observe_files(count, now);
                    }
                    send_progress(&events, tracker.tick(now), &mut last_sent);

                    if let Some(message) =
                        heartbeat.poll(now, started, tracker.last_activity(), tracker.has_signal())
                    {
                        let _ = events.send(RenderEvent::Status(message));
                    }

                    if let Some(limit) = self.config.watchdog_timeout() {
                        if now.saturating_duration_since(tracker.last_activity()) >= limit {
                            tracing::warn!(job_id = %request.job_id, limit = ?limit, "Renderer stalled, killing it");
                            terminate_tree(&mut child, self.config.kill_grace()).await;
                            return Err(FarmError::RendererTimedOut(limit));
                        }
                    }
                }
            }
        }

        if let Some(tail) = log_tail.as_mut() {
            self.follow_log(tail, &mut tracker, &mut dones, &request).await;
        }

        let elapsed = started.elapsed();
        let Some(status) = exit else {
            return Err(FarmError::RendererCrashed {
                exit_code: None,
                detail: "renderer exit status unknown".to_string(),
            });
        };
        tracing::info!(
            job_id = %request.job_id,
            exit_code = ?status.code(),
            elapsed = %format_elapsed(elapsed.as_secs()),
            "Renderer exited"
        );

        if !status.success() {
            let tail = if stderr_tail.is_empty() {
                &stdout_tail
            } else {
                &stderr_tail
            };
            let detail = if tail.is_empty() {
                format!("Exit code: {}", describe_exit(&status))
            } else {
                tail.iter().cloned().collect::<Vec<_>>().join("\n")
            };
            return Err(FarmError::RendererCrashed {
                exit_code: status.code(),
                detail,
            });
        }

        if let ProgressMode::FrameFiles { folder, extension, .. } = tracker.mode() {
            let count = count_frame_files(folder, extension);
            tracker.observe_files(count, Instant::now());
        }
        self.check_output(&request, &tracker)?;

        let _ = events.send(RenderEvent::Progress(tracker.finish()));
        let _ = events.send(RenderEvent::Status(format!(
            "Render completed successfully ({})",
            format_elapsed(elapsed.as_secs())
        )));
        Ok(RenderSummary {
            elapsed,
            log_path,
            compositions: tracker.compositions_done(),
        })
    }
}

/// Follows a file another process appends to, from the last offset read.
#[derive(Debug)]
struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl LogTail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: String::new(),
        }
    }

    /// Complete lines appended since the last call. A line still being
    /// written is held back until its newline arrives. A missing file
    /// reads as empty.
    async fn read_new(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        if len < self.offset {
            // Truncated or replaced: start over.
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }
        file.seek(std::io::SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        let read = file.take(len - self.offset).read_to_end(&mut buf).await?;
        self.offset += read as u64;
        self.partial.push_str(&String::from_utf8_lossy(&buf));

        let Some(last_newline) = self.partial.rfind('\n') else {
            return Ok(Vec::new());
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        Ok(complete
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect())
    }
}

/// `Done!` lines seen on stdout and in the log. A renderer that writes to
/// both must not finish each composition twice.
#[derive(Debug, Default)]
struct DoneCounts {
    output: u32,
    log: u32,
}

impl DoneCounts {
    /// Whether this stdout `Done!` is one the log has not reported yet.
    fn from_output(&mut self) -> bool {
        self.output += 1;
        self.output > self.log
    }

    fn from_log(&mut self) -> bool {
        self.log += 1;
        self.log > self.output
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: &str) {
    if tail.len() == DIAGNOSTIC_TAIL {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

/// Progress events are coalesced to changes of at least 0.1%.
fn send_progress(events: &mpsc::UnboundedSender<RenderEvent>, progress: f32, last_sent: &mut f32) {
    if (progress - *last_sent).abs() >= 0.001 {
        *last_sent = progress;
        let _ = events.send(RenderEvent::Progress(progress));
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return code.to_string();
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {}", signal);
        }
    }
    "unknown".to_string()
}

/// Stop the renderer and everything it started: ask politely, wait out the
/// grace period, then kill.
async fn terminate_tree(child: &mut Child, grace: Duration) {
    let pid = child.id();
    signal_group(pid, false);
    let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
    // Sweep helpers that ignored the polite signal.
    signal_group(pid, true);
    if !exited {
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "Failed to kill renderer");
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, force: bool) {
    let Some(pid) = pid else { return };
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    // The child leads its own process group, so a negative pid reaches
    // every process it spawned.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _force: bool) {}

/// Copy files from `Images/` next to the project into the project folder,
/// keeping anything already there.
fn copy_images_to_root(project: &Path) -> std::io::Result<usize> {
    let Some(project_dir) = project.parent() else {
        return Ok(0);
    };
    let images = project_dir.join("Images");
    if !images.is_dir() {
        return Ok(0);
    }
    let mut copied = 0;
    for entry in std::fs::read_dir(&images)? {
        let entry = entry?;
        let src = entry.path();
        if !src.is_file() {
            continue;
        }
        let dest = project_dir.join(entry.file_name());
        if !dest.exists() {
            std::fs::copy(&src, &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{OutputFormat, RenderSettings};
    use crate::scheduler::job::JobId;

    fn request(settings: RenderSettings) -> RenderRequest {
        RenderRequest {
            job_id: JobId::new(),
            project: PathBuf::from("/projects/shot.moho"),
            settings,
        }
    }

    #[tokio::test]
    async fn log_tail_returns_only_new_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.log");
        let mut tail = LogTail::new(path.clone());
        assert!(tail.read_new().await.unwrap().is_empty());

        std::fs::write(&path, "Frame 1 (1/4)\r\nFrame 2 (2").unwrap();
        assert_eq!(tail.read_new().await.unwrap(), vec!["Frame 1 (1/4)"]);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"/4)\nDone!\n").unwrap();
        assert_eq!(tail.read_new().await.unwrap(), vec!["Frame 2 (2/4)", "Done!"]);
        assert!(tail.read_new().await.unwrap().is_empty());

        std::fs::write(&path, "Frame 1 (1/2)\n").unwrap();
        assert_eq!(tail.read_new().await.unwrap(), vec!["Frame 1 (1/2)"]);
    }

    #[test]
    fn done_lines_on_both_streams_count_once() {
        let mut dones = DoneCounts::default();
        assert!(dones.from_output());
        assert!(!dones.from_log());
        assert!(dones.from_log());
        assert!(!dones.from_output());
    }

    #[test]
    fn prefix_args_come_first() {
        let sup = RenderSupervisor::new(RendererConfig::new("/bin/sh").with_prefix_arg("fake.sh"));
        let args = sup.command_args(&request(RenderSettings::default()), None);
        assert_eq!(args[0], "fake.sh");
        assert_eq!(args[1], "-r");
    }

    #[test]
    fn verbose_jobs_get_a_log_in_the_log_dir() {
        let sup = RenderSupervisor::new(RendererConfig::new("moho")).with_log_dir("/tmp/logs");
        let req = request(RenderSettings::default());
        assert_eq!(
            sup.log_path_for(&req),
            Some(PathBuf::from(format!("/tmp/logs/render_{}.log", req.job_id)))
        );

        let quiet = request(RenderSettings {
            verbose: false,
            ..Default::default()
        });
        assert_eq!(sup.log_path_for(&quiet), None);

        let explicit = request(RenderSettings {
            log_file: Some(PathBuf::from("/var/log/r.log")),
            ..Default::default()
        });
        assert_eq!(
            sup.log_path_for(&explicit),
            Some(PathBuf::from("/var/log/r.log"))
        );
    }

    #[test]
    fn progress_mode_follows_format() {
        let sup = RenderSupervisor::new(RendererConfig::new("moho"));
        assert!(matches!(
            sup.progress_mode(&request(RenderSettings::default())),
            ProgressMode::TimeEstimate { .. }
        ));
        assert!(matches!(
            sup.progress_mode(&request(RenderSettings::for_format(OutputFormat::Png))),
            ProgressMode::FrameLines
        ));
        let ranged = RenderSettings {
            start_frame: Some(1),
            end_frame: Some(24),
            ..RenderSettings::for_format(OutputFormat::Png)
        };
        assert!(matches!(
            sup.progress_mode(&request(ranged)),
            ProgressMode::FrameFiles { expected: 24, .. }
        ));
    }

    #[test]
    fn copy_images_keeps_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("shot.moho");
        std::fs::write(&project, b"p").unwrap();
        std::fs::create_dir(dir.path().join("Images")).unwrap();
        std::fs::write(dir.path().join("Images").join("a.png"), b"new").unwrap();
        std::fs::write(dir.path().join("Images").join("b.png"), b"new").unwrap();
        std::fs::write(dir.path().join("b.png"), b"old").unwrap();

        assert_eq!(copy_images_to_root(&project).unwrap(), 1);
        assert_eq!(std::fs::read(dir.path().join("a.png")).unwrap(), b"new");
        assert_eq!(std::fs::read(dir.path().join("b.png")).unwrap(), b"old");
    }

    #[test]
    fn tail_is_bounded() {
        let mut tail = VecDeque::new();
        for i in 0..30 {
            push_tail(&mut tail, &format!("line {}", i));
        }
        assert_eq!(tail.len(), DIAGNOSTIC_TAIL);
        assert_eq!(tail.front().map(String::as_str), Some("line 10"));
    }
}
