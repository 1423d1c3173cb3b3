//! Response streaming
//!
//! Answers leave the pipeline as an ordered sequence of `ResponseChunk`s.
//! Chunking is a pure function of the text and the window size; the terminal
//! flag is set on exactly the last chunk, which is why one chunk is always
//! held back until its successor (or the end) is known.

use crate::error::{ErrorKind, ErrorReport, OrchestrationError};
use crate::models::{Answer, ResponseChunk};
use crate::Result;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a producer pushes towards a `ResponseStream`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Fragment(String),
    Done,
    Failed(ErrorReport),
}

/// Split `text` into windows of at most `size` chars. Empty text yields nothing.
pub fn split_windows(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let mut windows = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == size {
            windows.push(std::mem::take(&mut current));
            count = 0;
        }
    }

    if !current.is_empty() {
        windows.push(current);
    }

    windows
}

/// Collects one handler turn's output and forwards it to the consumer, if any.
pub struct FragmentSink {
    tx: Option<mpsc::Sender<StreamItem>>,
    cancel: CancellationToken,
    text: Mutex<String>,
}

impl FragmentSink {
    pub fn new(tx: Option<mpsc::Sender<StreamItem>>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            text: Mutex::new(String::new()),
        }
    }

    /// A sink that only accumulates.
    pub fn detached() -> Self {
        Self::new(None, CancellationToken::new())
    }

    /// Append a fragment. Waits while the consumer is behind.
    pub async fn emit(&self, fragment: impl Into<String>) -> Result<()> {
        let fragment = fragment.into();
        if fragment.is_empty() {
            return Ok(());
        }

        if self.cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        if let Ok(mut text) = self.text.lock() {
            text.push_str(&fragment);
        }

        if let Some(tx) = &self.tx {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(OrchestrationError::Cancelled),
                sent = tx.send(StreamItem::Fragment(fragment)) => {
                    sent.map_err(|_| OrchestrationError::Cancelled)?;
                }
            }
        }

        Ok(())
    }

    pub fn has_emitted(&self) -> bool {
        self.text.lock().map(|t| !t.is_empty()).unwrap_or(false)
    }

    pub fn is_live(&self) -> bool {
        self.tx.is_some()
    }

    pub fn into_text(self) -> String {
        self.text.into_inner().unwrap_or_default()
    }
}

enum Source {
    Ready(VecDeque<StreamItem>),
    Channel(mpsc::Receiver<StreamItem>),
}

impl Source {
    fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamItem>> {
        match self {
            Source::Ready(items) => Poll::Ready(items.pop_front()),
            Source::Channel(rx) => rx.poll_recv(cx),
        }
    }
}

/// Ordered, cancellable chunk sequence for one answer.
///
/// Dropping the stream cancels it, which tells the producer to stop.
pub struct ResponseStream {
    source: Source,
    chunk_chars: usize,
    windows: VecDeque<String>,
    pending: Option<ResponseChunk>,
    trailer: Option<ResponseChunk>,
    next_index: usize,
    finished: bool,
    cancel: CancellationToken,
}

impl ResponseStream {
    pub(crate) fn from_channel(
        rx: mpsc::Receiver<StreamItem>,
        chunk_chars: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_source(Source::Channel(rx), chunk_chars, cancel)
    }

    fn with_source(source: Source, chunk_chars: usize, cancel: CancellationToken) -> Self {
        Self {
            source,
            chunk_chars: chunk_chars.max(1),
            windows: VecDeque::new(),
            pending: None,
            trailer: None,
            next_index: 0,
            finished: false,
            cancel,
        }
    }

    /// Stop producing chunks and signal the producer upstream.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.finished = true;
        self.windows.clear();
        self.pending = None;
        self.trailer = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled together with this stream.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn make_chunk(&mut self, text: String) -> ResponseChunk {
        let chunk = ResponseChunk {
            index: self.next_index,
            text,
            terminal: false,
            error: None,
        };
        self.next_index += 1;
        chunk
    }

    fn error_chunk(&mut self, report: ErrorReport) -> ResponseChunk {
        let mut chunk = self.make_chunk(report.message.clone());
        chunk.terminal = true;
        chunk.error = Some(report);
        chunk
    }

    fn finish(&mut self) -> Option<ResponseChunk> {
        self.finished = true;
        match self.pending.take() {
            Some(mut last) => {
                last.terminal = true;
                Some(last)
            }
            // Empty answers still end with one terminal chunk.
            None if self.next_index == 0 => {
                let mut only = self.make_chunk(String::new());
                only.terminal = true;
                Some(only)
            }
            None => None,
        }
    }

    fn fail(&mut self, report: ErrorReport) -> Option<ResponseChunk> {
        let error = self.error_chunk(report);
        match self.pending.take() {
            Some(flushed) => {
                self.trailer = Some(error);
                Some(flushed)
            }
            None => {
                self.finished = true;
                Some(error)
            }
        }
    }
}

impl Stream for ResponseStream {
    type Item = ResponseChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ResponseChunk>> {
        let this = self.get_mut();

        if let Some(trailer) = this.trailer.take() {
            this.finished = true;
            return Poll::Ready(Some(trailer));
        }

        if this.finished || this.cancel.is_cancelled() {
            this.finished = true;
            return Poll::Ready(None);
        }

        loop {
            if let Some(window) = this.windows.pop_front() {
                let chunk = this.make_chunk(window);
                match this.pending.replace(chunk) {
                    Some(ready) => return Poll::Ready(Some(ready)),
                    None => continue,
                }
            }

            match this.source.poll_item(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(StreamItem::Fragment(text))) => {
                    let chunk_chars = this.chunk_chars;
                    this.windows.extend(split_windows(&text, chunk_chars));
                }
                Poll::Ready(Some(StreamItem::Done)) => return Poll::Ready(this.finish()),
                Poll::Ready(Some(StreamItem::Failed(report))) => {
                    return Poll::Ready(this.fail(report))
                }
                Poll::Ready(None) => {
                    // A ready queue simply ends; a channel closing without Done
                    // means the producer went away.
                    let report = match this.source {
                        Source::Ready(_) => return Poll::Ready(this.finish()),
                        Source::Channel(_) => ErrorReport::new(ErrorKind::Internal),
                    };
                    return Poll::Ready(this.fail(report));
                }
            }
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns completed answers into chunk streams with a fixed window size.
#[derive(Debug, Clone, Copy)]
pub struct ResponseStreamer {
    chunk_chars: usize,
}

impl ResponseStreamer {
    pub fn new(chunk_chars: usize) -> Self {
        Self {
            chunk_chars: chunk_chars.max(1),
        }
    }

    pub fn chunk_chars(&self) -> usize {
        self.chunk_chars
    }

    /// Lazy chunk stream over a completed answer. Calling again restarts it.
    pub fn stream(&self, answer: &Answer) -> ResponseStream {
        self.stream_text(&answer.text)
    }

    pub fn stream_text(&self, text: &str) -> ResponseStream {
        let items = VecDeque::from(vec![
            StreamItem::Fragment(text.to_string()),
            StreamItem::Done,
        ]);
        ResponseStream::with_source(Source::Ready(items), self.chunk_chars, CancellationToken::new())
    }

    /// A single terminal chunk carrying `report`.
    pub fn stream_error(&self, report: ErrorReport) -> ResponseStream {
        let items = VecDeque::from(vec![StreamItem::Failed(report)]);
        ResponseStream::with_source(Source::Ready(items), self.chunk_chars, CancellationToken::new())
    }

    /// Chunk stream fed by a live producer through a bounded channel of
    /// `buffer` fragments. The producer should stop once `cancel` fires.
    pub fn channel(
        &self,
        buffer: usize,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<StreamItem>, ResponseStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, ResponseStream::from_channel(rx, self.chunk_chars, cancel))
    }
}
