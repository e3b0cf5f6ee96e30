//! Progress reporting contract between the fetcher and the host.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Receives download progress. Invoked synchronously on the fetching task, so
/// a slow hook slows the download down; it must not block indefinitely.
pub trait ProgressHook: Send + Sync {
    fn on_progress(&self, bytes_downloaded: u64, bytes_expected: u64);
}

impl<F> ProgressHook for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_progress(&self, bytes_downloaded: u64, bytes_expected: u64) {
        self(bytes_downloaded, bytes_expected)
    }
}

/// Hook that ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressHook for NoProgress {
    fn on_progress(&self, _bytes_downloaded: u64, _bytes_expected: u64) {}
}

/// A single progress sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_downloaded: u64,
    pub bytes_expected: u64,
}

/// Forwards progress to a channel consumed by the host's rendering loop.
#[derive(Debug, Clone)]
pub struct ChannelProgress(pub mpsc::UnboundedSender<ProgressEvent>);

impl ProgressHook for ChannelProgress {
    fn on_progress(&self, bytes_downloaded: u64, bytes_expected: u64) {
        // a closed receiver only means nobody is rendering any more
        let _ = self.0.send(ProgressEvent {
            bytes_downloaded,
            bytes_expected,
        });
    }
}

/// Rate-limits calls into a [`ProgressHook`]. Completion is delivered once,
/// by [`ThrottledProgress::finish`], after every target has been verified.
pub(crate) struct ThrottledProgress<'a> {
    hook: &'a dyn ProgressHook,
    min_interval: Duration,
    expected: u64,
    last_emit: Instant,
    last_sent: Option<u64>,
    finished: bool,
}

impl<'a> ThrottledProgress<'a> {
    pub(crate) fn new(hook: &'a dyn ProgressHook, min_interval: Duration, expected: u64) -> Self {
        Self {
            hook,
            min_interval,
            expected,
            last_emit: Instant::now(),
            last_sent: None,
            finished: false,
        }
    }

    /// Interim sample. May go backwards when a target is downloaded again.
    pub(crate) fn report(&mut self, downloaded: u64) {
        if self.finished || self.last_emit.elapsed() < self.min_interval {
            return;
        }
        self.emit(downloaded.min(self.expected));
    }

    /// Final sample; later reports are ignored.
    pub(crate) fn finish(&mut self, downloaded: u64) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(downloaded.min(self.expected));
    }

    fn emit(&mut self, downloaded: u64) {
        if self.last_sent == Some(downloaded) {
            return;
        }
        self.hook.on_progress(downloaded, self.expected);
        self.last_emit = Instant::now();
        self.last_sent = Some(downloaded);
    }
}
