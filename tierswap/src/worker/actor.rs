use super::{metrics, step, Config, Mailbox, Message, Step};
use crate::{
    dispatch::Transport,
    fetch::{ChargeMode, Coordinator, Fetch, Polled},
    page::Page,
    readahead::PrefetchRequest,
    AllocFlags, OwnerCharge,
};
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, trace, warn};

/// Background task that drains [PrefetchRequest]s.
pub struct Actor<E: Clock + Spawner + Metrics, T: Transport> {
    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    context: E,
    coordinator: Coordinator<E, T>,
    charger: Arc<dyn OwnerCharge>,

    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    cfg: Config,

    ////////////////////////////////////////
    // Messaging
    ////////////////////////////////////////
    /// The mailbox for receiving messages.
    mailbox_receiver: mpsc::Receiver<Message>,

    /// Requests waiting for their next pass.
    queue: VecDeque<PrefetchRequest>,

    /// Callers waiting for the queue to empty.
    flushers: Vec<oneshot::Sender<()>>,

    ////////////////////////////////////////
    // Metrics
    ////////////////////////////////////////
    metrics: metrics::Metrics,
}

impl<E: Clock + Spawner + Metrics, T: Transport> Actor<E, T> {
    /// Creates a new actor with the given context and configuration.
    /// Returns the actor and a mailbox for sending messages to the actor.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.batch` or `cfg.peek_interval` is 0.
    pub fn new(
        context: E,
        cfg: Config,
        coordinator: Coordinator<E, T>,
        charger: Arc<dyn OwnerCharge>,
    ) -> (Self, Mailbox) {
        assert!(cfg.batch > 0, "batch must be positive");
        assert!(cfg.peek_interval > 0, "peek_interval must be positive");
        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let metrics = metrics::Metrics::init(context.clone());
        let mailbox = Mailbox::new(mailbox_sender, metrics.dropped.clone());

        let result = Self {
            context,
            coordinator,
            charger,
            cfg,
            mailbox_receiver,
            queue: VecDeque::new(),
            flushers: Vec::new(),
            metrics,
        };

        (result, mailbox)
    }

    /// Starts the actor.
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    /// Inner run loop called by `start`.
    async fn run(mut self) {
        let mut closed = false;
        loop {
            // Collect new messages, only waiting if there is nothing else to do
            loop {
                let msg = if self.queue.is_empty() {
                    if closed {
                        debug!("mailbox closed, shutting down");
                        return;
                    }
                    match self.mailbox_receiver.next().await {
                        Some(msg) => msg,
                        None => {
                            debug!("mailbox closed, shutting down");
                            return;
                        }
                    }
                } else {
                    match self.mailbox_receiver.try_next() {
                        Ok(Some(msg)) => msg,
                        Ok(None) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                };
                self.handle(msg);
            }

            // Run one pass over the oldest request
            if let Some(request) = self.queue.pop_front() {
                self.pass(request).await;
            }
            if self.queue.is_empty() {
                for flusher in self.flushers.drain(..) {
                    let _ = flusher.send(());
                }
            }
        }
    }

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Prefetch(request) => {
                trace!(entries = request.nr_entries(), "mailbox: prefetch");
                self.metrics.requests.inc();
                self.queue.push_back(request);
            }
            Message::Flush { responder } => {
                trace!("mailbox: flush");
                if self.queue.is_empty() {
                    let _ = responder.send(());
                } else {
                    self.flushers.push(responder);
                }
            }
        }
    }

    /// Commit every read in `inflight` that has completed, returning those still pending.
    fn reap(&self, inflight: Vec<Fetch>, pages: &mut Vec<Page>) -> Vec<Fetch> {
        let mut pending = Vec::with_capacity(inflight.len());
        for fetch in inflight {
            let slot = fetch.slot();
            match self.coordinator.poll(fetch) {
                Ok(Polled::Inserted(handle)) => {
                    self.metrics.prefetched.inc();
                    pages.push(handle.page().clone());
                }
                Ok(Polled::Pending(fetch)) => pending.push(fetch),
                Err(err) => {
                    self.metrics.skipped.inc();
                    debug!(%slot, ?err, "prefetch read failed");
                }
            }
        }
        pending
    }

    async fn pass(&mut self, mut request: PrefetchRequest) {
        self.metrics.passes.inc();
        let mut pages = Vec::new();

        // Reads issued on the fault path may already be done
        let inherited = std::mem::take(&mut request.inflight);
        request.inflight = self.reap(inherited, &mut pages);

        let mut issued = 0;
        for _ in 0..self.cfg.batch {
            let Some(outcome) =
                step(&self.coordinator, &mut request, self.cfg.lock, self.cfg.charge).await
            else {
                break;
            };
            match outcome {
                Step::Issued => issued += 1,
                Step::Skipped => {
                    self.metrics.skipped.inc();
                    continue;
                }
            }
            if issued % self.cfg.peek_interval == 0
                && self.coordinator.dispatcher().peek(request.channel) > 0
            {
                let inflight = std::mem::take(&mut request.inflight);
                request.inflight = self.reap(inflight, &mut pages);
            }
        }

        // Wait for everything this pass issued
        for fetch in std::mem::take(&mut request.inflight) {
            let slot = fetch.slot();
            match self.coordinator.complete(fetch).await {
                Ok(handle) => {
                    self.metrics.prefetched.inc();
                    pages.push(handle.page().clone());
                }
                Err(err) => {
                    self.metrics.skipped.inc();
                    debug!(%slot, ?err, "prefetch read failed");
                }
            }
        }

        // Charging once per pass saves a round trip per page, but a failure cannot be attributed
        // to any single page: the whole batch stays cached and uncharged, and the reads are not
        // unwound.
        if self.cfg.charge == ChargeMode::Batched && !pages.is_empty() {
            if let Err(err) = self
                .charger
                .charge_batch(&pages, request.owner, AllocFlags::ATOMIC)
            {
                self.metrics.charge_failures.inc();
                warn!(?err, pages = pages.len(), "batch charge failed");
            }
        }

        if !request.exhausted() {
            self.queue.push_back(request);
        }
    }
}
