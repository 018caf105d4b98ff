use crate::{
    cache::{PageHandle, SlotCache},
    dispatch::{Channel, Dispatcher, Queue, Transport},
    fetch::{self, ChargeMode, Claim, Coordinator, LockMode, Request, Resolution},
    page::PageAllocator,
    readahead::{self, AccessDomain, Plan, PrefetchRequest, Readahead, Region, Strategy},
    worker::{self, step, Actor, Mailbox},
    AllocFlags, Error, Owner, OwnerCharge, Slot, UsageOracle,
};
use commonware_runtime::{Clock, Metrics, Spawner};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, trace, warn};

/// How much of a readahead window the faulting task drains before waiting for its own read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Handoff {
    /// Issue every read of the window, then hand the in-flight reads to the worker.
    Inline,
    /// Issue reads until the demand read completes, then hand the rest to the worker.
    #[default]
    Overlap,
    /// Hand the whole window to the worker.
    Background,
}

/// Configuration for the [Engine].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// The size of a page in bytes (a power of two).
    pub page_size: u64,

    /// The number of consecutive slots covered by one independently locked cache segment.
    pub segment_pages: u64,

    /// The maximum number of live cache entries.
    pub max_entries: Option<usize>,

    /// Log2 of the largest readahead window.
    pub page_cluster: u32,

    /// Use this window instead of the computed one.
    pub fixed_window: Option<u32>,

    /// The kind of locality readahead follows.
    pub strategy: Strategy,

    /// Hits credited to a sequential domain before its window is computed.
    pub sequential_boost: u32,

    /// The largest window of a sequential domain.
    pub sequential_max_window: u32,

    /// Windows never cross an aligned span of this many pages.
    pub clamp_pages: u64,

    /// Always place the window after the fault.
    pub always_ascend: bool,

    /// Submit the demand read before its slot is reserved.
    pub speculative: bool,

    /// How much of a window the faulting task drains itself.
    pub handoff: Handoff,

    /// Reaction of a prefetch to a slot that is already being fetched.
    pub prefetch_lock: LockMode,

    /// When prefetched pages are charged against their owner.
    pub charge: ChargeMode,

    /// The number of prefetch reads issued between peeks at the completion channel.
    pub peek_interval: usize,

    /// The maximum number of window entries the worker visits per pass.
    pub worker_batch: usize,

    /// The maximum number of windows waiting for the worker.
    pub mailbox_size: usize,

    /// The number of lost reservation races answered with a yield before sleeping.
    pub retry_yields: usize,

    /// How long to sleep after each lost race beyond `retry_yields`.
    pub retry_backoff: Duration,

    /// The number of lost races a blocking prefetch tolerates before skipping its entry.
    pub prefetch_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        let readahead = readahead::Config::default();
        let worker = worker::Config::default();
        let fetch = fetch::Config::default();
        Self {
            page_size: readahead.page_size,
            segment_pages: 1 << 14,
            max_entries: None,
            page_cluster: readahead.page_cluster,
            fixed_window: readahead.fixed_window,
            strategy: readahead.strategy,
            sequential_boost: readahead.sequential_boost,
            sequential_max_window: readahead.sequential_max_window,
            clamp_pages: readahead.clamp_pages,
            always_ascend: readahead.always_ascend,
            speculative: false,
            handoff: Handoff::default(),
            prefetch_lock: worker.lock,
            charge: worker.charge,
            peek_interval: worker.peek_interval,
            worker_batch: worker.batch,
            mailbox_size: worker.mailbox_size,
            retry_yields: fetch.retry_yields,
            retry_backoff: fetch.retry_backoff,
            prefetch_retries: fetch.prefetch_retries,
        }
    }
}

impl Config {
    fn readahead(&self) -> readahead::Config {
        readahead::Config {
            page_size: self.page_size,
            page_cluster: self.page_cluster,
            fixed_window: self.fixed_window,
            strategy: self.strategy,
            sequential_boost: self.sequential_boost,
            sequential_max_window: self.sequential_max_window,
            clamp_pages: self.clamp_pages,
            always_ascend: self.always_ascend,
        }
    }

    fn worker(&self) -> worker::Config {
        worker::Config {
            mailbox_size: self.mailbox_size,
            batch: self.worker_batch,
            peek_interval: self.peek_interval,
            lock: self.prefetch_lock,
            charge: self.charge,
        }
    }

    fn fetch(&self) -> fetch::Config {
        fetch::Config {
            retry_yields: self.retry_yields,
            retry_backoff: self.retry_backoff,
            prefetch_retries: self.prefetch_retries,
        }
    }
}

/// The capabilities the host provides.
pub struct Host<T: Transport> {
    /// Reads pages from the backing tier.
    pub transport: Arc<T>,

    /// Allocates the pages slots are read into.
    pub allocator: Arc<dyn PageAllocator>,

    /// Reports slots that hold no live data.
    pub oracle: Arc<dyn UsageOracle>,

    /// Charges fetched pages against their owner.
    pub charger: Arc<dyn OwnerCharge>,
}

/// A fault on an evicted page.
#[derive(Clone, Debug)]
pub struct Fault {
    /// The slot the page was evicted to.
    pub slot: Slot,

    /// The faulting address.
    pub address: u64,

    /// The region holding `address`.
    pub region: Arc<Region>,

    /// The declared access-pattern context of the fault, if any.
    pub domain: Option<Arc<AccessDomain>>,

    /// The execution unit the fault is handled on.
    pub unit: u16,
}

impl Fault {
    /// A fault at `address` in `region` on unit 0, outside of any access domain.
    pub fn new(slot: Slot, address: u64, region: Arc<Region>) -> Self {
        Self {
            slot,
            address,
            region,
            domain: None,
            unit: 0,
        }
    }

    /// Attach an access domain.
    pub fn with_domain(mut self, domain: Arc<AccessDomain>) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Handle the fault on `unit`.
    pub fn on_unit(mut self, unit: u16) -> Self {
        self.unit = unit;
        self
    }
}

/// Resolves faults on evicted pages, reading ahead around them.
///
/// Cloning is cheap and every clone shares the same cache, reservations and worker.
pub struct Engine<E: Clock + Spawner + Metrics, T: Transport> {
    cfg: Config,
    coordinator: Coordinator<E, T>,
    readahead: Readahead,
    charger: Arc<dyn OwnerCharge>,
    mailbox: Arc<Mutex<Mailbox>>,
}

impl<E: Clock + Spawner + Metrics, T: Transport> Clone for Engine<E, T> {
    fn clone(&self) -> Self {
        Self {
            cfg: self.cfg,
            coordinator: self.coordinator.clone(),
            readahead: self.readahead.clone(),
            charger: self.charger.clone(),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<E: Clock + Spawner + Metrics, T: Transport> Engine<E, T> {
    /// Create a new engine and start its prefetch worker.
    ///
    /// # Panics
    ///
    /// Panics if `cfg` is invalid.
    pub fn new(context: E, cfg: Config, host: Host<T>) -> Self {
        let cache = SlotCache::new(context.with_label("cache"), cfg.segment_pages, cfg.max_entries);
        let dispatcher = Dispatcher::new(context.with_label("dispatch"), host.transport);
        let coordinator = Coordinator::new(
            context.with_label("fetch"),
            cfg.fetch(),
            cache,
            dispatcher,
            host.allocator,
            host.oracle,
            host.charger.clone(),
        );
        let readahead = Readahead::new(context.with_label("readahead"), cfg.readahead());
        let (actor, mailbox) = Actor::new(
            context.with_label("worker"),
            cfg.worker(),
            coordinator.clone(),
            host.charger.clone(),
        );
        actor.start();

        Self {
            cfg,
            coordinator,
            readahead,
            charger: host.charger,
            mailbox: Arc::new(Mutex::new(mailbox)),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The cache resolved pages are kept in.
    pub fn cache(&self) -> &SlotCache {
        self.coordinator.cache()
    }

    /// The dispatcher reads are issued through.
    pub fn dispatcher(&self) -> &Dispatcher<T> {
        self.coordinator.dispatcher()
    }

    /// The coordinator fetches are claimed through.
    pub fn coordinator(&self) -> &Coordinator<E, T> {
        &self.coordinator
    }

    /// The readahead policy.
    pub fn readahead(&self) -> &Readahead {
        &self.readahead
    }

    /// Attach a backing device with `capacity` slots.
    pub fn open_address_space(&self, device: u32, capacity: u64) -> Result<(), Error> {
        self.cache().open(device, capacity).map_err(Error::from)
    }

    /// Detach a backing device.
    ///
    /// Fails with [Error::InvariantViolation] (and keeps the device attached) if any of its pages
    /// is still cached.
    pub fn close_address_space(&self, device: u32) -> Result<(), Error> {
        self.cache().close(device).map_err(Error::from)
    }

    /// Return the page backing `slot`, reading it if it is not cached. No readahead is performed.
    pub async fn resolve(&self, slot: Slot) -> Result<Resolution, Error> {
        let channel = self.dispatcher().channel_for(0, Queue::Demand);
        let request = Request {
            speculative: self.cfg.speculative,
            ..Request::demand(channel, Owner::default(), 0)
        };
        self.coordinator.resolve(slot, &request).await
    }

    /// Look up the page for `fault`, crediting readahead hits to its region and domain.
    pub fn lookup(&self, fault: &Fault) -> Option<PageHandle> {
        let handle = self.cache().lookup(fault.slot)?;
        self.readahead.touch(
            &handle,
            Some(&fault.region),
            fault.domain.as_deref(),
            fault.address,
        );
        Some(handle)
    }

    /// Resolve `fault`, checking the cache first.
    pub async fn fault(&self, fault: &Fault) -> Result<Resolution, Error> {
        if let Some(handle) = self.lookup(fault) {
            return Ok(Resolution::Cached(handle));
        }
        self.trigger_readahead(fault).await
    }

    /// Read the page for `fault` and the readahead window around it.
    ///
    /// The demand read is issued before any read of the window. Only a failure of the demand read
    /// is returned: prefetches that fail are skipped.
    pub async fn trigger_readahead(&self, fault: &Fault) -> Result<Resolution, Error> {
        let owner = fault.region.owner();
        let channel = self.dispatcher().channel_for(fault.unit, Queue::Demand);
        let demand = Request {
            speculative: self.cfg.speculative,
            ..Request::demand(channel, owner, fault.address)
        };
        let fetch = match self.coordinator.claim(fault.slot, &demand).await? {
            Claim::Issued(fetch) => fetch,
            Claim::Cached(handle) => return Ok(Resolution::Cached(handle)),
            Claim::Absent => return Ok(Resolution::Absent),
            Claim::Busy => return Ok(Resolution::Busy),
        };

        let returned = match self.plan(fault) {
            Some(plan) => {
                let channel = self.dispatcher().channel_for(fault.unit, Queue::Prefetch);
                let mut request =
                    PrefetchRequest::new(plan, owner, fault.address, channel, AllocFlags::USER);
                self.drain_inline(&mut request, fetch.channel()).await;
                self.handoff(request)
            }
            None => None,
        };

        let result = self.coordinator.complete(fetch).await;
        if let Some(request) = returned {
            self.settle(request).await;
        }
        result.map(Resolution::Fetched)
    }

    /// Wait until every window handed to the worker so far was drained.
    pub async fn flush(&self) {
        let mut mailbox = self.mailbox.lock().unwrap().clone();
        mailbox.flush().await;
    }

    fn plan(&self, fault: &Fault) -> Option<Plan> {
        match self.readahead.strategy() {
            Strategy::Virtual => {
                self.readahead
                    .plan(&fault.region, fault.domain.as_deref(), fault.address)
            }
            Strategy::Cluster => {
                let capacity = self.cache().capacity(fault.slot.device)?;
                self.readahead
                    .plan_cluster(fault.slot, capacity, fault.address)
            }
        }
    }

    /// Issue window reads on the fault path, as far as the handoff mode allows.
    async fn drain_inline(&self, request: &mut PrefetchRequest, demand: Channel) {
        let mut issued = 0;
        loop {
            match self.cfg.handoff {
                Handoff::Background => break,
                Handoff::Overlap if self.dispatcher().peek(demand) > 0 => break,
                _ => {}
            }
            let lock = self.cfg.prefetch_lock;
            match step(&self.coordinator, request, lock, self.cfg.charge).await {
                Some(worker::Step::Issued) => issued += 1,
                Some(worker::Step::Skipped) => {}
                None => break,
            }
        }
        trace!(issued, remaining = request.nr_entries() - request.progress, "drained inline");
    }

    /// Move `request` to the worker, returning it if the worker cannot take it.
    fn handoff(&self, request: PrefetchRequest) -> Option<PrefetchRequest> {
        if request.exhausted() && request.inflight.is_empty() {
            return None;
        }
        self.mailbox.lock().unwrap().prefetch(request).err()
    }

    /// Commit the reads of a request the worker refused. The rest of its window is dropped.
    async fn settle(&self, request: PrefetchRequest) {
        debug!(
            inflight = request.inflight.len(),
            remaining = request.nr_entries() - request.progress,
            "settling prefetch request inline"
        );
        let mut pages = Vec::new();
        for fetch in request.inflight {
            let slot = fetch.slot();
            match self.coordinator.complete(fetch).await {
                Ok(handle) => pages.push(handle.page().clone()),
                Err(err) => debug!(%slot, ?err, "prefetch read failed"),
            }
        }

        // Same trade-off as a worker pass: a failed batch stays cached and uncharged
        if self.cfg.charge == ChargeMode::Batched && !pages.is_empty() {
            if let Err(err) = self
                .charger
                .charge_batch(&pages, request.owner, AllocFlags::ATOMIC)
            {
                warn!(?err, pages = pages.len(), "batch charge failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache,
        mocks::{FailingAllocator, MockTransport, RecordingCharge, SetOracle, StaticPageTable},
        readahead::{Pattern, Pte},
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    const PAGE: u64 = 4096;
    const PAGE_SIZE: usize = 16;

    struct Setup {
        transport: Arc<MockTransport>,
        allocator: Arc<FailingAllocator>,
        oracle: Arc<SetOracle>,
        charger: Arc<RecordingCharge>,
        engine: Engine<deterministic::Context, MockTransport>,
    }

    fn setup(context: &deterministic::Context, latency: u64, cfg: Config) -> Setup {
        let transport = Arc::new(MockTransport::new(PAGE_SIZE, latency));
        let allocator = Arc::new(FailingAllocator::new(PAGE_SIZE));
        let oracle = Arc::new(SetOracle::default());
        let charger = Arc::new(RecordingCharge::default());
        let engine = Engine::new(
            context.clone(),
            cfg,
            Host {
                transport: transport.clone(),
                allocator: allocator.clone(),
                oracle: oracle.clone(),
                charger: charger.clone(),
            },
        );
        engine.open_address_space(0, 4096).unwrap();
        Setup {
            transport,
            allocator,
            oracle,
            charger,
            engine,
        }
    }

    /// A region over `[start_vpn, end_vpn)` whose page `n` was evicted to slot `n` of device 0.
    fn mapped(start_vpn: u64, end_vpn: u64) -> Arc<Region> {
        let table = Arc::new(StaticPageTable::default());
        for vpn in start_vpn..end_vpn {
            table.set(vpn, Pte::Swapped(Slot::new(0, vpn)));
        }
        Arc::new(Region::new(
            start_vpn * PAGE,
            end_vpn * PAGE,
            Owner(1),
            table,
        ))
    }

    fn at(region: &Arc<Region>, vpn: u64) -> Fault {
        Fault::new(Slot::new(0, vpn), vpn * PAGE, region.clone())
    }

    #[test_traced]
    fn test_sequential_scan() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup {
                transport, engine, ..
            } = setup(&context, 2, Config::default());
            let region = mapped(0, 1024);

            for vpn in 100..165 {
                let slot = Slot::new(0, vpn);
                let handle = engine.fault(&at(&region, vpn)).await.unwrap().handle().unwrap();
                assert_eq!(handle.slot(), slot);
                assert_eq!(
                    handle.bytes().as_ref(),
                    MockTransport::contents(slot, PAGE_SIZE).as_slice()
                );
                engine.flush().await;
            }

            // Misses at 100 (centred window), then at the first page past each ascending window
            assert!(context.encode().contains("fetch_demand_fetches_total 9"));
            for vpn in 97..169 {
                assert_eq!(transport.submitted(Slot::new(0, vpn)), 1, "vpn {vpn}");
            }
            assert_eq!(transport.total_submitted(), 72);
            assert_eq!(transport.outstanding(), 0);
            assert_eq!(engine.coordinator().reserved(), 0);
        });
    }

    #[test_traced]
    fn test_concurrent_faults_fetch_once() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup {
                transport, engine, ..
            } = setup(&context, 6, Config::default());
            let region = mapped(0, 1024);
            let slot = Slot::new(0, 500);

            let mut handles = Vec::new();
            for unit in 0..8 {
                let engine = engine.clone();
                let fault = at(&region, 500).on_unit(unit);
                handles.push(context.with_label("faulter").spawn(move |_| async move {
                    engine.fault(&fault).await.unwrap().handle().unwrap()
                }));
            }
            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.unwrap());
            }
            engine.flush().await;

            assert!(results.iter().all(|handle| handle.same(&results[0])));
            assert_eq!(transport.submitted(slot), 1);
            for vpn in 490..510 {
                assert!(transport.submitted(Slot::new(0, vpn)) <= 1, "vpn {vpn}");
            }
            let inserts = engine.cache().len();
            assert!(context
                .encode()
                .contains(&format!("cache_inserts_total {inserts}")));
            assert_eq!(transport.outstanding(), 0);
        });
    }

    #[test_traced]
    fn test_cached_slot_never_submitted() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup {
                transport, engine, ..
            } = setup(&context, 1, Config::default());
            let region = mapped(0, 64);
            let slot = Slot::new(0, 10);

            let fetched = match engine.resolve(slot).await.unwrap() {
                Resolution::Fetched(handle) => handle,
                other => panic!("unexpected resolution: {other:?}"),
            };
            for _ in 0..3 {
                let cached = engine.fault(&at(&region, 10)).await.unwrap();
                assert!(matches!(&cached, Resolution::Cached(handle) if handle.same(&fetched)));
                assert!(matches!(
                    engine.trigger_readahead(&at(&region, 10)).await.unwrap(),
                    Resolution::Cached(_)
                ));
            }
            assert_eq!(transport.submitted(slot), 1);
            assert_eq!(transport.total_submitted(), 1);
        });
    }

    #[test_traced]
    fn test_random_domain_never_reads_ahead() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup {
                transport, engine, ..
            } = setup(&context, 1, Config::default());
            let region = mapped(0, 1024);
            let domain = Arc::new(AccessDomain::new(Pattern::Random));

            for vpn in [10, 11, 12, 400, 401, 900] {
                let fault = at(&region, vpn).with_domain(domain.clone());
                engine.fault(&fault).await.unwrap();
            }
            engine.flush().await;
            assert_eq!(transport.total_submitted(), 6);
            assert_eq!(engine.cache().len(), 6);
        });
    }

    #[test_traced]
    fn test_sequential_domain_reads_further() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup {
                transport, engine, ..
            } = setup(&context, 1, Config::default());
            let region = mapped(0, 1024);
            let domain = Arc::new(AccessDomain::new(Pattern::Sequential));

            // Fresh state: 4 credited hits plus the boost rounds up to 16
            let fault = at(&region, 200).with_domain(domain.clone());
            engine.fault(&fault).await.unwrap();
            engine.flush().await;
            assert_eq!(domain.state().load().window, 16);
            assert_eq!(transport.total_submitted(), 16);
        });
    }

    #[test_traced]
    fn test_teardown_with_live_entries() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup { engine, .. } = setup(&context, 1, Config::default());
            let region = mapped(0, 64);
            let domain = Arc::new(AccessDomain::new(Pattern::Random));
            let slot = Slot::new(0, 30);

            engine
                .fault(&at(&region, 30).with_domain(domain))
                .await
                .unwrap();
            engine.flush().await;
            assert_eq!(
                engine.close_address_space(0),
                Err(Error::InvariantViolation(cache::Error::LiveEntries(0, 1)))
            );
            assert_eq!(engine.cache().devices(), vec![0]);

            engine.cache().remove(slot).unwrap();
            engine.close_address_space(0).unwrap();
            assert!(engine.cache().devices().is_empty());
            assert_eq!(
                engine.close_address_space(0),
                Err(Error::Cache(cache::Error::UnknownDevice(0)))
            );
            engine.open_address_space(0, 64).unwrap();
        });
    }

    #[test_traced]
    fn test_inline_handoff_issues_window_first() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                handoff: Handoff::Inline,
                ..Config::default()
            };
            let Setup {
                transport, engine, ..
            } = setup(&context, 10, cfg);
            let region = mapped(0, 1024);

            // Every read of the window was submitted by the fault itself
            engine.fault(&at(&region, 100)).await.unwrap();
            assert_eq!(transport.total_submitted(), 8);

            engine.flush().await;
            assert_eq!(engine.cache().len(), 8);
            assert_eq!(transport.outstanding(), 0);
            assert_eq!(engine.coordinator().reserved(), 0);
        });
    }

    #[test_traced]
    fn test_background_handoff() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                handoff: Handoff::Background,
                ..Config::default()
            };
            let Setup {
                transport, engine, ..
            } = setup(&context, 3, cfg);
            let region = mapped(0, 1024);

            engine.fault(&at(&region, 100)).await.unwrap();
            engine.flush().await;
            assert_eq!(engine.cache().len(), 8);
            assert!(context.encode().contains("worker_prefetched_total 7"));
            assert_eq!(transport.outstanding(), 0);
        });
    }

    #[test_traced]
    fn test_cluster_strategy() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                strategy: Strategy::Cluster,
                ..Config::default()
            };
            let Setup {
                transport, engine, ..
            } = setup(&context, 2, cfg);

            // The region's page table is ignored: neighbors come from the backing store
            let region = mapped(0, 1);
            let fault = Fault::new(Slot::new(0, 13), 0x7000, region.clone());
            engine.fault(&fault).await.unwrap();
            engine.flush().await;
            for offset in 8..16 {
                assert!(engine.cache().contains(Slot::new(0, offset)), "offset {offset}");
            }
            assert_eq!(engine.cache().len(), 8);

            // Slot 0 is never read
            let fault = Fault::new(Slot::new(0, 3), 0x7000, region);
            engine.fault(&fault).await.unwrap();
            engine.flush().await;
            assert_eq!(transport.submitted(Slot::new(0, 0)), 0);
            assert_eq!(transport.outstanding(), 0);
        });
    }

    #[test_traced]
    fn test_speculative_concurrent_faults() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                speculative: true,
                ..Config::default()
            };
            let Setup {
                transport, engine, ..
            } = setup(&context, 4, cfg);
            let region = mapped(0, 1024);
            let slot = Slot::new(0, 321);

            let mut handles = Vec::new();
            for _ in 0..4 {
                let engine = engine.clone();
                let fault = at(&region, 321);
                handles.push(context.with_label("faulter").spawn(move |_| async move {
                    engine.fault(&fault).await.unwrap().handle().unwrap()
                }));
            }
            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.unwrap());
            }
            engine.flush().await;

            // Lost speculative reads were drained, never inserted
            assert!(results.iter().all(|handle| handle.same(&results[0])));
            assert!(engine.cache().contains(slot));
            assert_eq!(transport.outstanding(), 0);
            assert_eq!(engine.coordinator().reserved(), 0);
        });
    }

    #[test_traced]
    fn test_demand_failures_propagate() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup {
                transport,
                allocator,
                engine,
                ..
            } = setup(&context, 2, Config::default());
            let region = mapped(0, 1024);

            allocator.set_failing(true);
            assert_eq!(
                engine.fault(&at(&region, 100)).await.unwrap_err(),
                Error::AllocationFailed
            );
            assert_eq!(transport.total_submitted(), 0);
            allocator.set_failing(false);

            // The window is still drained when the demand read fails
            let slot = Slot::new(0, 300);
            transport.break_read(slot);
            assert_eq!(
                engine.fault(&at(&region, 300)).await.unwrap_err(),
                Error::TransportFailed(slot)
            );
            engine.flush().await;
            assert!(!engine.cache().contains(slot));
            assert!(engine.cache().contains(Slot::new(0, 301)));
            assert_eq!(transport.outstanding(), 0);
            assert_eq!(engine.coordinator().reserved(), 0);
        });
    }

    #[test_traced]
    fn test_prefetch_failures_are_local() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup {
                transport,
                oracle,
                engine,
                ..
            } = setup(&context, 2, Config::default());
            let region = mapped(0, 1024);
            transport.break_read(Slot::new(0, 101));
            transport.reject(Slot::new(0, 102));
            oracle.mark_unused(Slot::new(0, 103));

            // Window [97, 105) around the fault
            let handle = engine
                .fault(&at(&region, 100))
                .await
                .unwrap()
                .handle()
                .unwrap();
            assert_eq!(handle.slot(), Slot::new(0, 100));
            engine.flush().await;

            for (offset, cached) in [
                (97, true),
                (98, true),
                (99, true),
                (101, false),
                (102, false),
                (103, false),
                (104, true),
            ] {
                assert_eq!(engine.cache().contains(Slot::new(0, offset)), cached, "offset {offset}");
            }
            assert_eq!(transport.submitted(Slot::new(0, 103)), 0);
            assert_eq!(transport.outstanding(), 0);
        });
    }

    #[test_traced]
    fn test_unused_demand_slot_is_absent() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let Setup {
                transport,
                oracle,
                engine,
                ..
            } = setup(&context, 1, Config::default());
            let region = mapped(0, 64);
            oracle.mark_unused(Slot::new(0, 5));
            assert!(matches!(
                engine.fault(&at(&region, 5)).await.unwrap(),
                Resolution::Absent
            ));
            assert_eq!(transport.total_submitted(), 0);
        });
    }

    #[test_traced]
    fn test_batched_charge() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                charge: ChargeMode::Batched,
                ..Config::default()
            };
            let Setup {
                charger, engine, ..
            } = setup(&context, 2, cfg);
            let region = mapped(0, 1024);

            // The demand page is charged on its own, the window once as a batch
            engine.fault(&at(&region, 100)).await.unwrap();
            engine.flush().await;
            assert_eq!(charger.batches(), vec![(Owner(1), 7, AllocFlags::ATOMIC)]);
            assert_eq!(charger.charged(), 8);
        });
    }

    #[test_traced]
    fn test_refused_request_settled_inline() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                handoff: Handoff::Inline,
                mailbox_size: 0,
                ..Config::default()
            };
            let Setup {
                transport, engine, ..
            } = setup(&context, 0, cfg);
            let first = mapped(0, 1024);
            let second = mapped(2048, 3072);

            // Nothing yields, so the worker never empties the mailbox between the faults
            engine.fault(&at(&first, 100)).await.unwrap();
            engine.fault(&at(&second, 2100)).await.unwrap();
            assert!(context.encode().contains("worker_dropped_total 1"));
            for vpn in 2097..2105 {
                assert!(engine.cache().contains(Slot::new(0, vpn)), "vpn {vpn}");
            }

            engine.flush().await;
            assert_eq!(engine.cache().len(), 16);
            assert_eq!(transport.outstanding(), 0);
        });
    }

    #[test_traced]
    fn test_blocking_overlapping_windows() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                handoff: Handoff::Inline,
                prefetch_lock: LockMode::Blocking,
                ..Config::default()
            };
            let Setup {
                transport, engine, ..
            } = setup(&context, 2, cfg);

            // A third reader holds a slot both windows cover
            let held = Slot::new(0, 99);
            let demand = Request::demand(Channel::demand(0), Owner(1), 0);
            let fetch = match engine.coordinator().claim(held, &demand).await.unwrap() {
                Claim::Issued(fetch) => fetch,
                other => panic!("unexpected claim: {other:?}"),
            };

            // Each fault's window covers the other's demand slot
            let first = mapped(0, 1024);
            let second = mapped(0, 1024);
            let mut faults = Vec::new();
            for fault in [at(&first, 100), at(&second, 102)] {
                let engine = engine.clone();
                faults.push(context.with_label("faulter").spawn(move |_| async move {
                    engine.fault(&fault).await.unwrap().handle().unwrap()
                }));
            }
            let holder = context.with_label("holder").spawn({
                let engine = engine.clone();
                move |context| async move {
                    context.sleep(Duration::from_millis(1)).await;
                    engine.coordinator().complete(fetch).await.unwrap()
                }
            });

            for (fault, vpn) in faults.into_iter().zip([100, 102]) {
                assert_eq!(fault.await.unwrap().slot(), Slot::new(0, vpn));
            }
            holder.await.unwrap();
            engine.flush().await;

            for vpn in 97..107 {
                assert!(engine.cache().contains(Slot::new(0, vpn)), "vpn {vpn}");
                assert_eq!(transport.submitted(Slot::new(0, vpn)), 1, "vpn {vpn}");
            }
            assert_eq!(transport.outstanding(), 0);
            assert_eq!(engine.coordinator().reserved(), 0);
        });
    }

    #[test_traced]
    fn test_per_unit_channels() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let transport = Arc::new(MockTransport::new(PAGE_SIZE, 1).with_units(2));
            let engine = Engine::new(
                context.clone(),
                Config::default(),
                Host {
                    transport: transport.clone(),
                    allocator: Arc::new(FailingAllocator::new(PAGE_SIZE)),
                    oracle: Arc::new(SetOracle::default()),
                    charger: Arc::new(RecordingCharge::default()),
                },
            );
            engine.open_address_space(0, 1024).unwrap();
            assert_eq!(
                engine.dispatcher().channel_for(3, Queue::Demand),
                Channel::demand(1)
            );
            assert_eq!(
                engine.dispatcher().channel_for(2, Queue::Prefetch),
                Channel::prefetch(0)
            );

            let region = mapped(0, 1024);
            engine.fault(&at(&region, 40).on_unit(3)).await.unwrap();
            engine.flush().await;
            assert_eq!(engine.cache().len(), 8);
            assert_eq!(transport.outstanding(), 0);
        });
    }
}
