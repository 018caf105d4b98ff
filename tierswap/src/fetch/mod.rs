//! Turn a cache miss into exactly one in-flight fetch.
//!
//! Before a slot is read, the [Coordinator] places a reservation on it. Only the caller that wins
//! the reservation allocates a page, issues the read and (once the read completes) inserts the
//! entry into the [SlotCache]. The reservation is released only after the entry is inserted, so a
//! caller that wins a reservation after a previous fetch finished always finds that fetch's entry
//! on its re-check and never inserts twice.
//!
//! A caller that loses the reservation race either retries (see [LockMode::Blocking]) until the
//! winner's entry appears, or gives up immediately ([LockMode::Try]).
//!
//! # Retry Bound
//!
//! A blocking caller yields to the runtime `retry_yields` times after losing a race and sleeps for
//! `retry_backoff` on every loss after that. A loser therefore never spins without suspending, and
//! its progress is bounded by the winner's fetch latency plus at most one backoff period.
//!
//! A blocking prefetch gives up with [Claim::Busy] after `prefetch_retries` lost races. Prefetches
//! are claimed by callers that already hold reservations of their own (the faulting task holds its
//! demand read, the worker holds the reads of its current pass), so two of them may each wait on a
//! slot the other reserved. Only demand claims retry without limit.
//!
//! # Speculative Issue
//!
//! With [Request::speculative] set, the read is submitted as soon as the page is allocated, before
//! the reservation is attempted, overlapping the transport round trip with the race check. If the
//! race is lost, the read is drained to completion before the page is discarded.

use crate::{
    cache::{Flags, PageHandle, SlotCache},
    dispatch::{Channel, CompletionHandle, Dispatcher, Progress, Transport},
    page::{AllocHint, Page, PageAllocator},
    AllocFlags, Error, Owner, OwnerCharge, Slot, UsageOracle,
};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics};
use std::{sync::Arc, time::Duration};
use tracing::debug;

mod metrics;
mod reservation;
pub use reservation::Reservation;
use reservation::Reservations;

/// How a caller reacts to losing the reservation race.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    /// Retry (with yields and backoff) until the slot is cached, unused, or reserved. Prefetches
    /// give up with [Claim::Busy] after `prefetch_retries` lost races.
    #[default]
    Blocking,
    /// Return [Claim::Busy] on the first lost race.
    Try,
}

/// When fetched pages are charged against their owner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChargeMode {
    /// Charge each page before its read is issued.
    #[default]
    Immediate,
    /// Skip the per-page charge. The caller charges a whole batch once it is drained.
    Batched,
}

/// Configuration for the [Coordinator].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// The number of lost races a blocking caller answers with a yield before it starts to sleep.
    pub retry_yields: usize,

    /// How long a blocking caller sleeps after each lost race beyond `retry_yields`.
    pub retry_backoff: Duration,

    /// The number of lost races a blocking prefetch tolerates before it gives up.
    pub prefetch_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_yields: 16,
            retry_backoff: Duration::from_micros(50),
            prefetch_retries: 32,
        }
    }
}

/// How to fetch a single slot.
#[derive(Clone, Copy, Debug)]
pub struct Request {
    /// The channel the read is issued (and polled) on.
    pub channel: Channel,

    /// Reaction to a lost reservation race.
    pub lock: LockMode,

    /// When the page is charged.
    pub charge: ChargeMode,

    /// Submit the read before attempting the reservation.
    pub speculative: bool,

    /// The owner the page is charged against.
    pub owner: Owner,

    /// The virtual address the page will back.
    pub address: u64,

    /// Allocation flags.
    pub alloc: AllocFlags,

    /// Flags recorded on the cache entry.
    pub flags: Flags,
}

impl Request {
    /// A request for the page a fault is waiting on.
    pub fn demand(channel: Channel, owner: Owner, address: u64) -> Self {
        Self {
            channel,
            lock: LockMode::Blocking,
            charge: ChargeMode::Immediate,
            speculative: false,
            owner,
            address,
            alloc: AllocFlags::USER,
            flags: Flags::default(),
        }
    }

    /// A request for a page brought in by readahead.
    pub fn prefetch(channel: Channel, owner: Owner, address: u64) -> Self {
        Self {
            flags: Flags::PREFETCHED,
            ..Self::demand(channel, owner, address)
        }
    }
}

/// A read that has been issued under a reservation but not yet committed to the cache.
#[must_use = "a fetch must be completed to release its reservation"]
pub struct Fetch {
    slot: Slot,
    page: Page,
    flags: Flags,
    completion: CompletionHandle,
    reservation: Reservation,
}

impl Fetch {
    /// The slot being fetched.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// The page the slot is read into.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// The channel the read completes on.
    pub fn channel(&self) -> Channel {
        self.completion.channel()
    }
}

impl std::fmt::Debug for Fetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetch")
            .field("slot", &self.slot)
            .field("completion", &self.completion)
            .finish()
    }
}

/// The outcome of [Coordinator::claim].
#[derive(Debug)]
pub enum Claim {
    /// The slot was already cached. No read was issued.
    Cached(PageHandle),
    /// The caller won the reservation and its read is in flight.
    Issued(Fetch),
    /// The slot holds no live data. No read was issued.
    Absent,
    /// Another caller is fetching the slot ([LockMode::Try] only).
    Busy,
}

/// The outcome of [Coordinator::resolve].
#[derive(Debug)]
pub enum Resolution {
    /// The slot was already cached.
    Cached(PageHandle),
    /// The slot was fetched by this call.
    Fetched(PageHandle),
    /// The slot holds no live data.
    Absent,
    /// Another caller is fetching the slot ([LockMode::Try] only).
    Busy,
}

impl Resolution {
    /// The resolved page, if any.
    pub fn handle(self) -> Option<PageHandle> {
        match self {
            Self::Cached(handle) | Self::Fetched(handle) => Some(handle),
            Self::Absent | Self::Busy => None,
        }
    }
}

/// The outcome of a non-blocking [Coordinator::poll].
#[derive(Debug)]
pub enum Polled {
    /// The read completed and the entry was inserted.
    Inserted(PageHandle),
    /// The read is still in flight.
    Pending(Fetch),
}

/// Coordinates fetches so that at most one read is ever in flight per slot.
pub struct Coordinator<E: Clock, T: Transport> {
    context: E,
    cfg: Config,
    cache: SlotCache,
    dispatcher: Dispatcher<T>,
    reservations: Reservations,
    allocator: Arc<dyn PageAllocator>,
    oracle: Arc<dyn UsageOracle>,
    charger: Arc<dyn OwnerCharge>,
    metrics: Arc<metrics::Metrics>,
}

impl<E: Clock, T: Transport> Clone for Coordinator<E, T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            cfg: self.cfg,
            cache: self.cache.clone(),
            dispatcher: self.dispatcher.clone(),
            reservations: self.reservations.clone(),
            allocator: self.allocator.clone(),
            oracle: self.oracle.clone(),
            charger: self.charger.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<E: Clock + RuntimeMetrics, T: Transport> Coordinator<E, T> {
    /// Create a new coordinator.
    pub fn new(
        context: E,
        cfg: Config,
        cache: SlotCache,
        dispatcher: Dispatcher<T>,
        allocator: Arc<dyn PageAllocator>,
        oracle: Arc<dyn UsageOracle>,
        charger: Arc<dyn OwnerCharge>,
    ) -> Self {
        let metrics = Arc::new(metrics::Metrics::init(context.clone()));
        Self {
            context,
            cfg,
            cache,
            dispatcher,
            reservations: Reservations::new(),
            allocator,
            oracle,
            charger,
            metrics,
        }
    }
}

impl<E: Clock, T: Transport> Coordinator<E, T> {
    /// The cache entries are inserted into.
    pub fn cache(&self) -> &SlotCache {
        &self.cache
    }

    /// The dispatcher reads are issued through.
    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    /// Returns `true` if a fetch of `slot` is in flight.
    pub fn is_reserved(&self, slot: Slot) -> bool {
        self.reservations.is_reserved(slot)
    }

    /// The number of fetches in flight.
    pub fn reserved(&self) -> usize {
        self.reservations.len()
    }

    /// Returns `true` if a caller that lost its `attempt`th race must give up.
    fn exhausted(&self, request: &Request, attempt: usize) -> bool {
        request.lock == LockMode::Try
            || (request.flags.prefetch && attempt > self.cfg.prefetch_retries)
    }

    /// Suspend after the `attempt`th lost race.
    async fn backoff(&self, attempt: usize) {
        if attempt <= self.cfg.retry_yields {
            commonware_runtime::reschedule().await;
        } else {
            self.context.sleep(self.cfg.retry_backoff).await;
        }
    }

    fn allocate(&self, request: &Request) -> Result<Page, Error> {
        self.allocator
            .allocate(AllocHint {
                address: request.address,
                owner: request.owner,
                flags: request.alloc,
            })
            .map_err(|_| Error::AllocationFailed)
    }

    fn record_issue(&self, request: &Request) {
        if request.flags.prefetch {
            self.metrics.prefetch_fetches.inc();
        } else {
            self.metrics.demand_fetches.inc();
        }
    }

    /// Drain a read whose result will never be used.
    async fn discard(&self, completion: CompletionHandle) {
        let slot = completion.slot();
        if let Err(err) = self.dispatcher.drain_blocking(completion).await {
            debug!(%slot, ?err, "discarded read failed");
        }
    }

    /// Find `slot` in the cache or reserve it and issue its read.
    ///
    /// A returned [Fetch] holds the slot's reservation until it is passed to
    /// [Coordinator::complete] or [Coordinator::poll].
    pub async fn claim(&self, slot: Slot, request: &Request) -> Result<Claim, Error> {
        if request.speculative {
            return self.claim_speculative(slot, request).await;
        }
        let mut attempt = 0;
        let reservation = loop {
            if let Some(handle) = self.cache.lookup(slot) {
                return Ok(Claim::Cached(handle));
            }
            if self.oracle.is_unused(slot) {
                return Ok(Claim::Absent);
            }
            match self.reservations.try_reserve(slot) {
                Some(reservation) => break reservation,
                None => {
                    self.metrics.races_lost.inc();
                    attempt += 1;
                    if self.exhausted(request, attempt) {
                        return Ok(Claim::Busy);
                    }
                    self.backoff(attempt).await;
                }
            }
        };

        // An entry inserted between the lookup and the reservation is only visible now
        if let Some(handle) = self.cache.lookup(slot) {
            return Ok(Claim::Cached(handle));
        }

        let page = match self.allocate(request) {
            Ok(page) => page,
            Err(err) => {
                self.metrics.rollbacks.inc();
                debug!(%slot, "allocation failed");
                return Err(err);
            }
        };
        let completion = match self.dispatcher.issue(&page, slot, request.channel) {
            Ok(completion) => completion,
            Err(err) => {
                self.metrics.rollbacks.inc();
                debug!(%slot, ?err, "issue failed");
                return Err(Error::TransportFailed(slot));
            }
        };

        // Charge only once the read is accepted: a charge cannot be taken back
        if request.charge == ChargeMode::Immediate
            && self
                .charger
                .charge(&page, request.owner, request.alloc)
                .is_err()
        {
            self.metrics.rollbacks.inc();
            debug!(%slot, owner = request.owner.0, "charge failed");
            self.discard(completion).await;
            return Err(Error::ChargeFailed(slot));
        }
        self.record_issue(request);
        Ok(Claim::Issued(Fetch {
            slot,
            page,
            flags: request.flags,
            completion,
            reservation,
        }))
    }

    async fn claim_speculative(&self, slot: Slot, request: &Request) -> Result<Claim, Error> {
        // Nothing to speculate on if the slot is already cached
        if let Some(handle) = self.cache.lookup(slot) {
            return Ok(Claim::Cached(handle));
        }

        let page = match self.allocate(request) {
            Ok(page) => page,
            Err(err) => {
                self.metrics.rollbacks.inc();
                debug!(%slot, "allocation failed");
                return Err(err);
            }
        };
        let completion = match self.dispatcher.issue(&page, slot, request.channel) {
            Ok(completion) => completion,
            Err(err) => {
                self.metrics.rollbacks.inc();
                debug!(%slot, ?err, "issue failed");
                return Err(Error::TransportFailed(slot));
            }
        };

        let mut attempt = 0;
        let lost = loop {
            if let Some(handle) = self.cache.lookup(slot) {
                break Claim::Cached(handle);
            }
            if self.oracle.is_unused(slot) {
                break Claim::Absent;
            }
            match self.reservations.try_reserve(slot) {
                Some(reservation) => {
                    if let Some(handle) = self.cache.lookup(slot) {
                        drop(reservation);
                        break Claim::Cached(handle);
                    }
                    if request.charge == ChargeMode::Immediate
                        && self
                            .charger
                            .charge(&page, request.owner, request.alloc)
                            .is_err()
                    {
                        self.metrics.rollbacks.inc();
                        debug!(%slot, owner = request.owner.0, "charge failed");
                        self.discard(completion).await;
                        return Err(Error::ChargeFailed(slot));
                    }
                    self.record_issue(request);
                    return Ok(Claim::Issued(Fetch {
                        slot,
                        page,
                        flags: request.flags,
                        completion,
                        reservation,
                    }));
                }
                None => {
                    self.metrics.races_lost.inc();
                    attempt += 1;
                    if self.exhausted(request, attempt) {
                        break Claim::Busy;
                    }
                    self.backoff(attempt).await;
                }
            }
        };

        // The read we issued early is still in flight and must be observed before the page goes
        self.metrics.speculation_wasted.inc();
        debug!(%slot, "speculative read lost");
        self.discard(completion).await;
        drop(page);
        Ok(lost)
    }

    /// Wait for the read behind `fetch` and insert its entry.
    pub async fn complete(&self, fetch: Fetch) -> Result<PageHandle, Error> {
        let Fetch {
            slot,
            page,
            flags,
            completion,
            reservation,
        } = fetch;
        if let Err(err) = self.dispatcher.drain_blocking(completion).await {
            self.metrics.rollbacks.inc();
            debug!(%slot, ?err, "read failed");
            drop(reservation);
            return Err(Error::TransportFailed(slot));
        }
        self.commit(slot, page, flags, reservation)
    }

    /// Check the read behind `fetch` without waiting, inserting its entry if it completed.
    pub fn poll(&self, fetch: Fetch) -> Result<Polled, Error> {
        let Fetch {
            slot,
            page,
            flags,
            completion,
            reservation,
        } = fetch;
        match self.dispatcher.poll(completion) {
            Ok(Progress::Done) => self.commit(slot, page, flags, reservation).map(Polled::Inserted),
            Ok(Progress::Pending(completion)) => Ok(Polled::Pending(Fetch {
                slot,
                page,
                flags,
                completion,
                reservation,
            })),
            Err(err) => {
                self.metrics.rollbacks.inc();
                debug!(%slot, ?err, "read failed");
                drop(reservation);
                Err(Error::TransportFailed(slot))
            }
        }
    }

    fn commit(
        &self,
        slot: Slot,
        page: Page,
        flags: Flags,
        reservation: Reservation,
    ) -> Result<PageHandle, Error> {
        // Insert while still holding the reservation
        let result = self.cache.insert(slot, page, flags);
        drop(reservation);
        result.map_err(|err| {
            self.metrics.rollbacks.inc();
            Error::from(err)
        })
    }

    /// Return the page backing `slot`, fetching it if it is not cached.
    pub async fn resolve(&self, slot: Slot, request: &Request) -> Result<Resolution, Error> {
        match self.claim(slot, request).await? {
            Claim::Cached(handle) => Ok(Resolution::Cached(handle)),
            Claim::Issued(fetch) => self.complete(fetch).await.map(Resolution::Fetched),
            Claim::Absent => Ok(Resolution::Absent),
            Claim::Busy => Ok(Resolution::Busy),
        }
    }
}
