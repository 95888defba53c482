use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use crate::color::{Color, Palette};
use crate::engine::{ContainerEngine, EngineError, LogStream, LogStreamOptions};
use crate::options::{remove_subsecond, split_log_line, ResumeToken, TailOptions};
use crate::output::Sink;
use crate::render::{LogRecord, Renderer};
use crate::target::Target;

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("reading log stream: {0}")]
    Stream(#[from] std::io::Error),
}

/// Follows one container's log stream: demultiplexes the engine framing,
/// runs every line through the filter pipeline, and renders survivors
/// through the output template. Tracks how many lines it printed at the
/// last seen second so an interrupted stream can be resumed without
/// duplicates.
pub struct Tail {
    engine: Arc<dyn ContainerEngine>,
    target: Target,
    options: Arc<TailOptions>,
    renderer: Arc<Renderer>,
    namespace_color: Color,
    container_color: Color,
    banner_start: Color,
    banner_stop: Color,
    out: Sink,
    err_out: Sink,
    /// Local teardown, separate from the root token so closing one tail
    /// leaves its siblings running.
    cancel: CancellationToken,
    resume: Option<ResumeToken>,
    last_timestamp: Option<String>,
    lines_at_last_timestamp: i64,
    stopped: bool,
}

impl Tail {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        target: Target,
        palette: &Palette,
        options: Arc<TailOptions>,
        renderer: Arc<Renderer>,
        out: Sink,
        err_out: Sink,
    ) -> Self {
        let (namespace_color, container_color) =
            palette.for_target(&target.name, &target.compose_project);
        Self {
            engine,
            target,
            options,
            renderer,
            namespace_color,
            container_color,
            banner_start: palette.banner_start(),
            banner_stop: palette.banner_stop(),
            out,
            err_out,
            cancel: CancellationToken::new(),
            resume: None,
            last_timestamp: None,
            lines_at_last_timestamp: 0,
            stopped: false,
        }
    }

    /// Opens the log stream at the target's effective since-time and
    /// consumes it until EOF, error, or cancellation.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), TailError> {
        let since = self.effective_since();
        let tail = self.options.tail_lines.to_string();
        self.resume = self.target.resume.take();
        self.run(cancel, since, tail).await
    }

    /// Re-opens the stream at a previously captured position, requesting the
    /// full backlog from that second and skipping what was already printed.
    pub async fn resume(
        &mut self,
        cancel: &CancellationToken,
        token: ResumeToken,
    ) -> Result<(), TailError> {
        let since = DateTime::parse_from_rfc3339(&token.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| self.effective_since());
        self.resume = Some(token);
        self.run(cancel, since, "-1".to_string()).await
    }

    /// Prints the stop banner and tears the stream down. Idempotent.
    pub fn close(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.print_stopping();
        self.cancel.cancel();
    }

    /// The position to hand to a retry, or None when nothing was consumed.
    pub fn resume_request(&self) -> Option<ResumeToken> {
        self.last_timestamp.as_ref().map(|timestamp| ResumeToken {
            timestamp: timestamp.clone(),
            lines_to_skip: self.lines_at_last_timestamp,
        })
    }

    async fn run(
        &mut self,
        cancel: &CancellationToken,
        since: DateTime<Utc>,
        tail: String,
    ) -> Result<(), TailError> {
        self.print_starting();
        let options = LogStreamOptions {
            stdout: true,
            stderr: true,
            follow: self.options.follow,
            timestamps: true,
            since: Some(since),
            tail,
        };
        let stream = match self.engine.container_logs(&self.target.id, &options).await {
            Ok(stream) => stream,
            Err(e) if e.is_terminal() => {
                debug!("container {} is gone: {e}", self.target.id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.consume_stream(cancel, stream).await
    }

    async fn consume_stream(
        &mut self,
        cancel: &CancellationToken,
        stream: LogStream,
    ) -> Result<(), TailError> {
        let mut reader = tokio::io::BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.cancel.cancelled() => return Ok(()),
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => {
                        if buf.last() == Some(&b'\n') {
                            buf.pop();
                        }
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                        self.consume_line(&buf);
                    }
                    Err(e) if is_terminal_io(&e) => return Ok(()),
                    Err(e) => return Err(TailError::Stream(e)),
                },
            }
        }
    }

    fn consume_line(&mut self, raw: &[u8]) {
        let payload = if self.target.tty {
            raw
        } else {
            // Engine multiplexing header; anything shorter is a fragment.
            if raw.len() < 8 {
                return;
            }
            &raw[8..]
        };
        let line = String::from_utf8_lossy(payload);

        let Some((timestamp, content)) = split_log_line(&line) else {
            self.print(&format!("[missing timestamp] {line}"));
            return;
        };

        let second = remove_subsecond(timestamp);
        let skip = match self.resume.as_mut() {
            Some(token) => token.should_skip(&second),
            None => false,
        };
        // Skipped lines still count: the outgoing resume position must
        // cover every line delivered at this second, printed or not.
        self.update_last_timestamp(&second);
        if skip {
            return;
        }
        if self.resume.as_ref().is_some_and(|t| t.exhausted()) {
            self.resume = None;
        }

        if self.options.is_exclude(content) || !self.options.is_include(content) {
            return;
        }

        let mut message = self.options.highlight(content);
        if self.options.timestamps {
            match self.options.reformat_timestamp(timestamp) {
                Ok(reformatted) => message = format!("{reformatted} {message}"),
                Err(e) => {
                    self.print(&format!("[{e}] {line}"));
                    return;
                }
            }
        }
        self.print(&message);
    }

    fn update_last_timestamp(&mut self, second: &str) {
        if self.last_timestamp.as_deref() == Some(second) {
            self.lines_at_last_timestamp += 1;
        } else {
            self.last_timestamp = Some(second.to_string());
            self.lines_at_last_timestamp = 1;
        }
    }

    /// Never request logs the caller did not ask for, and on first contact
    /// never request logs older than the container itself. A restart of an
    /// already-seen container goes back to the caller's cutoff so the gap
    /// between the runs is covered. A first contact whose previous run ended
    /// inside the window starts at that boundary instead.
    fn effective_since(&self) -> DateTime<Utc> {
        let options_since = self.options.since;
        if self.target.seen_previously {
            return options_since;
        }
        if let Some(finished) = self.target.finished_at {
            if finished < self.target.started_at && finished > options_since {
                return finished;
            }
        }
        self.target.started_at.max(options_since)
    }

    fn print(&self, message: &str) {
        let record = LogRecord {
            message: message.to_string(),
            container: self.target.name.clone(),
            service: self.target.service.clone(),
            namespace: self.target.compose_project.clone(),
            number: self.target.container_number.clone(),
        };
        match self
            .renderer
            .render(&record, &self.namespace_color, &self.container_color)
        {
            Ok(rendered) => self.out.write_str(&rendered),
            Err(e) => self
                .err_out
                .write_line(&format!("expanding template failed: {e}")),
        }
    }

    fn print_starting(&self) {
        if self.options.only_log_lines {
            return;
        }
        let sign = self.banner_start.paint("+");
        self.err_out.write_line(&self.banner_line(&sign));
    }

    fn print_stopping(&self) {
        if self.options.only_log_lines {
            return;
        }
        let sign = self.banner_stop.paint("-");
        self.err_out.write_line(&self.banner_line(&sign));
    }

    fn banner_line(&self, sign: &str) -> String {
        if self.target.compose_project.is_empty() {
            format!("{sign} {}", self.container_color.paint(&self.target.name))
        } else {
            format!(
                "{sign} {} › {}",
                self.namespace_color.paint(&self.target.compose_project),
                self.container_color.paint(&self.target.service)
            )
        }
    }
}

fn is_terminal_io(err: &std::io::Error) -> bool {
    err.get_ref()
        .and_then(|e| e.downcast_ref::<EngineError>())
        .map(EngineError::is_terminal)
        .unwrap_or(false)
}
