use crate::readahead::PrefetchRequest;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use prometheus_client::metrics::counter::Counter;
use tracing::warn;

/// Message types that can be sent to the `Mailbox`
pub enum Message {
    /// Drain a readahead window.
    Prefetch(PrefetchRequest),

    /// Respond once every request received before this one was drained.
    Flush { responder: oneshot::Sender<()> },
}

/// Ingress mailbox for [`Actor`](super::Actor).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    dropped: Counter,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>, dropped: Counter) -> Self {
        Self { sender, dropped }
    }

    /// Hand `request` to the worker without waiting.
    ///
    /// If the worker's backlog is full (or the worker stopped), the request is handed back so the
    /// caller can settle the reads it carries.
    pub fn prefetch(&mut self, request: PrefetchRequest) -> Result<(), PrefetchRequest> {
        match self.sender.try_send(Message::Prefetch(request)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.dropped.inc();
                warn!(full = err.is_full(), "dropping prefetch request");
                match err.into_inner() {
                    Message::Prefetch(request) => Err(request),
                    Message::Flush { .. } => unreachable!(),
                }
            }
        }
    }

    /// Wait until every request sent before this call was drained.
    pub async fn flush(&mut self) {
        let (responder, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::Flush { responder })
            .await
            .is_err()
        {
            return;
        }
        let _ = receiver.await;
    }
}
