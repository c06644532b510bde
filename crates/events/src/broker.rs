//! Broker between the build worker and the stream consumer, using an
//! unbounded tokio mpsc channel

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::types::BuildMessage;

type DisconnectHook = Box<dyn FnOnce() + Send + Sync>;

/// Create a connected producer/consumer pair for one build session
pub fn channel() -> (OutputSender, BuildStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let line_count = Arc::new(AtomicUsize::new(0));
    (
        OutputSender {
            tx,
            line_count: Arc::clone(&line_count),
        },
        BuildStream {
            rx,
            finished: false,
            on_disconnect: None,
        },
    )
}

/// Producer half, owned by the worker task.
///
/// The terminal message can only be sent through [`OutputSender::finish`],
/// which consumes the sender, so a session never sends two.
pub struct OutputSender {
    tx: mpsc::UnboundedSender<BuildMessage>,
    /// Number of lines pushed (for monitoring)
    line_count: Arc<AtomicUsize>,
}

impl OutputSender {
    /// Push one streamed line.
    ///
    /// Lines sent after the consumer went away are dropped.
    pub fn line(&self, text: impl Into<String>) {
        self.line_count.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(BuildMessage::output(text)).is_err() {
            tracing::trace!("Build stream consumer gone, dropping line");
        }
    }

    /// Push the terminal message and close the producer side
    pub fn finish(self, success: bool) {
        if self.tx.send(BuildMessage::completed(success)).is_err() {
            tracing::debug!(success, "Build stream consumer gone before completion");
        }
    }

    /// Get the total number of lines pushed
    pub fn line_count(&self) -> usize {
        self.line_count.load(Ordering::Relaxed)
    }

    /// Whether the consumer has dropped its end of the stream
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for OutputSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSender")
            .field("line_count", &self.line_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consumer half of a build stream.
///
/// Yields every queued message and ends right after the terminal one. If the
/// producer disappears without finishing, a failed terminal message is
/// synthesized once the queue is drained. Dropping the stream before the
/// terminal message runs the disconnect hook.
pub struct BuildStream {
    rx: mpsc::UnboundedReceiver<BuildMessage>,
    finished: bool,
    on_disconnect: Option<DisconnectHook>,
}

impl BuildStream {
    /// Register a cleanup action for an early disconnect
    pub fn on_disconnect(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(hook));
        self
    }

    /// Whether the terminal message has been yielded
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Receive the next message, or `None` after the terminal one
    pub async fn recv(&mut self) -> Option<BuildMessage> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Drain the stream to completion
    pub async fn collect_all(mut self) -> Vec<BuildMessage> {
        let mut messages = Vec::new();
        while let Some(msg) = self.recv().await {
            messages.push(msg);
        }
        messages
    }
}

impl Stream for BuildStream {
    type Item = BuildMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(msg)) => {
                if msg.is_terminal() {
                    this.finished = true;
                    this.rx.close();
                }
                Poll::Ready(Some(msg))
            }
            // Producer gone and queue empty, without a terminal message
            Poll::Ready(None) => {
                tracing::warn!("Build worker ended without a terminal message");
                this.finished = true;
                Poll::Ready(Some(BuildMessage::completed(false)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for BuildStream {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(hook) = self.on_disconnect.take() {
                tracing::debug!("Build stream dropped before completion");
                hook();
            }
        }
    }
}

impl fmt::Debug for BuildStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildStream")
            .field("finished", &self.finished)
            .finish()
    }
}
