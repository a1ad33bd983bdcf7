use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tinyvec::ArrayVec;

use crate::buffer::Packet;
use crate::config::Config;
use crate::iface::{FunIface, GetPktFn};
use crate::ident::Identifier;
use crate::registry::{Handler, Registry};
use crate::state::{State, StateId, Step};
use crate::table::{Armed, Entry, Shard, StateTable, Timers};
use crate::Error;

/// Max number of start ids and of end ids.
pub const MAX_START_END_IDS: usize = 16;

/// Decides whether a packet with no live connection opens one.
///
/// Returns the initial context, `None` to decline.
pub type AcceptFn<K, P, C> = dyn Fn(&K, &P) -> Result<Option<C>, Error> + Send + Sync;

type ConnId<I, P> = <I as Identifier<P>>::ConnectionId;

struct StartState<K, P, C> {
    id: StateId,
    accept: Box<AcceptFn<K, P, C>>,
}

/// What happened to one input packet, or one fired timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The connection moved to `state` and is still live.
    Processed { state: StateId },
    /// The connection reached an end state and was removed.
    Finished,
    /// The packet never reached a handler.
    Dropped(Error),
    /// The handler could not run, or failed.
    ///
    /// On handler failure the connection is removed. On
    /// [`Error::UnregisteredState`] it is kept as is.
    Failed(Error),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Processed { .. } | Outcome::Finished)
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Dropped(e) | Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Result of [`StateMachine::run_pkt_batch`].
#[derive(Debug)]
pub struct BatchOutput<P> {
    /// Packets to transmit, grouped in input packet order.
    pub send: Vec<P>,
    /// One entry per input packet, same order.
    pub outcomes: Vec<Outcome>,
}

impl<P> BatchOutput<P> {
    fn empty() -> Self {
        BatchOutput {
            send: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// Outcomes that carry an error.
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.outcomes.iter().filter_map(Outcome::error)
    }
}

/// Counters since the machine was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub processed: u64,
    pub finished: u64,
    pub not_identified: u64,
    pub no_matching_state: u64,
    pub pool_exhausted: u64,
    pub unregistered: u64,
    pub handler_errors: u64,
    pub timeouts_fired: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    finished: AtomicU64,
    not_identified: AtomicU64,
    no_matching_state: AtomicU64,
    pool_exhausted: AtomicU64,
    unregistered: AtomicU64,
    handler_errors: AtomicU64,
    timeouts_fired: AtomicU64,
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn snapshot(&self) -> Stats {
        let r = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Stats {
            processed: r(&self.processed),
            finished: r(&self.finished),
            not_identified: r(&self.not_identified),
            no_matching_state: r(&self.no_matching_state),
            pool_exhausted: r(&self.pool_exhausted),
            unregistered: r(&self.unregistered),
            handler_errors: r(&self.handler_errors),
            timeouts_fired: r(&self.timeouts_fired),
        }
    }
}

/// Collects handlers, start and end states before a [`StateMachine`] exists.
pub struct Builder<I, P, C>
where
    I: Identifier<P>,
    P: Packet,
{
    identifier: I,
    config: Config,
    registry: Registry<ConnId<I, P>, P, C>,
    starts: Vec<StartState<ConnId<I, P>, P, C>>,
    ends: ArrayVec<[StateId; MAX_START_END_IDS]>,
    get_pkt: Option<Box<GetPktFn<P>>>,
}

impl<I, P, C> Builder<I, P, C>
where
    I: Identifier<P>,
    P: Packet,
{
    /// Start with an empty registry and the default [`Config`].
    pub fn new(identifier: I) -> Self {
        Builder {
            identifier,
            config: Config::default(),
            registry: Registry::new(),
            starts: Vec::new(),
            ends: ArrayVec::new(),
            get_pkt: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register the handler for state `id`.
    ///
    /// A second registration for the same id fails with
    /// [`Error::DuplicateState`] and leaves the first in place.
    pub fn register_function<F>(&mut self, id: StateId, f: F) -> Result<&mut Self, Error>
    where
        F: Fn(&mut State<C>, P, &mut FunIface<'_, ConnId<I, P>, P, C>) -> Result<Step<P>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(id, f)
    }

    /// Like [`Builder::register_function`] for any [`Handler`].
    pub fn register_handler<H>(&mut self, id: StateId, handler: H) -> Result<&mut Self, Error>
    where
        H: Handler<ConnId<I, P>, P, C> + 'static,
    {
        self.registry.register(id, Box::new(handler))?;
        Ok(self)
    }

    /// Mark `id` as a state new connections start in.
    ///
    /// `accept` is asked, for a packet of an unknown connection, whether to
    /// open it in `id`. Start states are tried in registration order and the
    /// first to accept wins.
    pub fn register_start_state_id<F>(&mut self, id: StateId, accept: F) -> Result<&mut Self, Error>
    where
        F: Fn(&ConnId<I, P>, &P) -> Result<Option<C>, Error> + Send + Sync + 'static,
    {
        if self.starts.iter().any(|s| s.id == id) {
            return Err(Error::DuplicateState(id));
        }
        if self.starts.len() >= MAX_START_END_IDS {
            return Err(Error::TooManyStates(MAX_START_END_IDS));
        }
        self.starts.push(StartState {
            id,
            accept: Box::new(accept),
        });
        Ok(self)
    }

    /// Mark `id` as terminal. Reaching it removes the connection.
    pub fn register_end_state_id(&mut self, id: StateId) -> Result<&mut Self, Error> {
        if self.ends.contains(&id) {
            return Ok(self);
        }
        if self.ends.try_push(id).is_some() {
            return Err(Error::TooManyStates(MAX_START_END_IDS));
        }
        Ok(self)
    }

    /// Register the source of extra blank buffers for
    /// [`FunIface::get_pkt`].
    pub fn register_get_pkt_cb<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Result<P, Error> + Send + Sync + 'static,
    {
        self.get_pkt = Some(Box::new(f));
        self
    }

    /// Validate and freeze the registrations.
    pub fn build(self) -> Result<StateMachine<I, P, C>, Error> {
        if self.ends.is_empty() {
            return Err(Error::NoEndState);
        }
        if let Some(s) = self.starts.iter().find(|s| !self.registry.contains(s.id)) {
            return Err(Error::UnregisteredState(s.id));
        }
        if let Some(id) = self.ends.iter().find(|id| self.registry.contains(**id)) {
            return Err(Error::EndStateHasHandler(*id));
        }

        debug!(
            "State machine built: {} handlers, {} start, {} end, {} shards, {} workers",
            self.registry.len(),
            self.starts.len(),
            self.ends.len(),
            self.config.shards(),
            self.config.workers()
        );

        Ok(StateMachine {
            table: StateTable::new(self.config.shards(), self.config.shard_capacity()),
            timers: Mutex::new(Timers::new(self.config.max_timeouts())),
            identifier: self.identifier,
            config: self.config,
            registry: self.registry,
            starts: self.starts,
            ends: self.ends,
            get_pkt: self.get_pkt,
            stats: Counters::default(),
        })
    }
}

impl<I, P, C> fmt::Debug for Builder<I, P, C>
where
    I: Identifier<P>,
    P: Packet,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("registry", &self.registry)
            .field("starts", &self.starts.iter().map(|s| s.id).collect::<Vec<_>>())
            .field("ends", &self.ends)
            .finish()
    }
}

/// Packet driven connection state machine.
///
/// Routes every packet to the handler of its connection's current state,
/// creating connections through start states and removing them on end
/// states. Safe to share between threads.
pub struct StateMachine<I, P, C>
where
    I: Identifier<P>,
    P: Packet,
{
    config: Config,
    identifier: I,
    registry: Registry<ConnId<I, P>, P, C>,
    starts: Vec<StartState<ConnId<I, P>, P, C>>,
    ends: ArrayVec<[StateId; MAX_START_END_IDS]>,
    get_pkt: Option<Box<GetPktFn<P>>>,
    table: StateTable<ConnId<I, P>, P, C>,
    timers: Mutex<Timers<ConnId<I, P>>>,
    stats: Counters,
}

struct Job<K, P> {
    index: usize,
    id: K,
    pkt: P,
}

impl<I, P, C> StateMachine<I, P, C>
where
    I: Identifier<P>,
    P: Packet,
    C: Send,
{
    pub fn builder(identifier: I) -> Builder<I, P, C> {
        Builder::new(identifier)
    }

    /// Process a batch of packets.
    ///
    /// Every packet is consumed. Packets not forwarded to `send` are
    /// dropped, which frees them. Per packet errors are reported in
    /// `outcomes` and never stop the rest of the batch.
    pub fn run_pkt_batch(&self, pkts: Vec<P>) -> BatchOutput<P> {
        let n = pkts.len();
        let mut outcomes: Vec<Option<Outcome>> = (0..n).map(|_| None).collect();
        let mut jobs = Vec::with_capacity(n);

        for (index, pkt) in pkts.into_iter().enumerate() {
            match self.identifier.identify(&pkt) {
                Ok(id) => jobs.push(Job { index, id, pkt }),
                Err(e) => {
                    bump(&self.stats.not_identified);
                    outcomes[index] = Some(Outcome::Dropped(e));
                }
            }
        }

        let workers = self.config.workers().min(jobs.len());
        let results = if workers <= 1 {
            self.run_jobs(jobs)
        } else {
            self.run_jobs_parallel(jobs, workers)
        };

        let mut sends: Vec<Vec<P>> = (0..n).map(|_| Vec::new()).collect();
        for (index, outcome, sent) in results {
            outcomes[index] = Some(outcome);
            sends[index] = sent;
        }

        BatchOutput {
            send: sends.into_iter().flatten().collect(),
            outcomes: outcomes
                .into_iter()
                .map(|o| o.unwrap_or(Outcome::Dropped(Error::PacketNotIdentified)))
                .collect(),
        }
    }

    fn run_jobs(&self, jobs: Vec<Job<ConnId<I, P>, P>>) -> Vec<(usize, Outcome, Vec<P>)> {
        jobs.into_iter()
            .map(|job| {
                let mut sent = Vec::new();
                let outcome = self.run_pkt(job.id, job.pkt, &mut sent);
                (job.index, outcome, sent)
            })
            .collect()
    }

    // Jobs are dealt to workers by shard, keeping batch order within a
    // worker. All packets of one connection end up on the same worker.
    fn run_jobs_parallel(
        &self,
        jobs: Vec<Job<ConnId<I, P>, P>>,
        workers: usize,
    ) -> Vec<(usize, Outcome, Vec<P>)> {
        let mut lanes: Vec<Vec<Job<ConnId<I, P>, P>>> = (0..workers).map(|_| Vec::new()).collect();
        for job in jobs {
            let lane = self.table.shard_of(&job.id) % workers;
            lanes[lane].push(job);
        }

        std::thread::scope(|s| {
            let handles: Vec<_> = lanes
                .into_iter()
                .filter(|lane| !lane.is_empty())
                .map(|lane| s.spawn(move || self.run_jobs(lane)))
                .collect();

            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    fn run_pkt(&self, id: ConnId<I, P>, pkt: P, out: &mut Vec<P>) -> Outcome {
        let mut shard = self.table.lock(&id);

        let entry = match shard.remove(&id) {
            Some(mut entry) => {
                if let Some(armed) = entry.timer.take() {
                    trace!("Cancel timeout {} for {:?}", armed.seq, id);
                    self.lock_timers().cancel(armed.seq);
                }
                entry
            }
            None => match self.accept(&id, &pkt) {
                Ok(Some(state)) => {
                    trace!("New connection {:?} in state {}", id, state.id);
                    Entry::new(state)
                }
                Ok(None) => {
                    bump(&self.stats.no_matching_state);
                    debug!("No start state for {:?}", id);
                    return Outcome::Dropped(Error::NoMatchingState);
                }
                Err(e) => {
                    if matches!(e, Error::PoolExhausted { .. }) {
                        bump(&self.stats.pool_exhausted);
                    }
                    debug!("Start state refused {:?}: {}", id, e);
                    return Outcome::Dropped(e);
                }
            },
        };

        let state_id = entry.state.id;
        let Some(handler) = self.registry.get(state_id) else {
            bump(&self.stats.unregistered);
            warn!("No function for state {} of {:?}", state_id, id);
            shard.insert(id, entry);
            return Outcome::Failed(Error::UnregisteredState(state_id));
        };

        self.drive(&mut shard, id, entry, out, |state, iface| {
            handler.handle(state, pkt, iface)
        })
    }

    fn accept(&self, id: &ConnId<I, P>, pkt: &P) -> Result<Option<State<C>>, Error> {
        for start in &self.starts {
            if let Some(ctx) = (start.accept)(id, pkt)? {
                return Ok(Some(State::new(start.id, ctx)));
            }
        }
        Ok(None)
    }

    /// Run `call` for a connection taken out of `shard` and settle the
    /// result. The shard lock is held throughout.
    fn drive<F>(
        &self,
        shard: &mut Shard<ConnId<I, P>, P, C>,
        id: ConnId<I, P>,
        mut entry: Entry<ConnId<I, P>, P, C>,
        out: &mut Vec<P>,
        call: F,
    ) -> Outcome
    where
        F: FnOnce(&mut State<C>, &mut FunIface<'_, ConnId<I, P>, P, C>) -> Result<Step<P>, Error>,
    {
        let mut iface = FunIface::new(&id, self.get_pkt.as_deref());
        let result = call(&mut entry.state, &mut iface);
        let (sent, timeout) = iface.into_parts();

        let step = match result {
            Ok(step) => step,
            Err(e) => {
                bump(&self.stats.handler_errors);
                debug!("Connection {:?} failed in state {}: {}", id, entry.state.id, e);
                return Outcome::Failed(e);
            }
        };

        out.extend(step.reply);
        out.extend(sent);

        if self.ends.contains(&step.next) {
            bump(&self.stats.finished);
            trace!("Connection {:?} {} -> {} (end)", id, entry.state.id, step.next);
            return Outcome::Finished;
        }

        bump(&self.stats.processed);
        trace!("Connection {:?} {} -> {}", id, entry.state.id, step.next);
        entry.state.id = step.next;

        if let Some((at, fun)) = timeout {
            match self.lock_timers().arm(id.clone(), at) {
                Some(seq) => entry.timer = Some(Armed { seq, fun }),
                None => warn!("Too many timeouts, ignoring one for {:?}", id),
            }
        }

        shard.insert(id, entry);
        Outcome::Processed { state: step.next }
    }

    /// Open a connection from this side.
    ///
    /// Runs the handler of `state.id` with `pkt`, typically a blank buffer
    /// the handler writes the first message into. The connection is kept
    /// unless the handler moved it to an end state.
    pub fn add_state(
        &self,
        id: ConnId<I, P>,
        state: State<C>,
        pkt: P,
    ) -> Result<BatchOutput<P>, Error> {
        let mut shard = self.table.lock(&id);
        if shard.contains_key(&id) {
            return Err(Error::ConnectionExists);
        }

        let handler = self
            .registry
            .get(state.id)
            .ok_or(Error::UnregisteredState(state.id))?;

        trace!("Add connection {:?} in state {}", id, state.id);

        let mut out = BatchOutput::empty();
        let outcome = self.drive(&mut shard, id, Entry::new(state), &mut out.send, |state, iface| {
            handler.handle(state, pkt, iface)
        });

        if let Outcome::Failed(e) = outcome {
            return Err(e);
        }
        out.outcomes.push(outcome);
        Ok(out)
    }

    /// Fire the timeouts due at `now`.
    ///
    /// One outcome per fired timeout, earliest deadline first.
    pub fn handle_timeout(&self, now: Instant) -> BatchOutput<P> {
        let due = self.lock_timers().expired(now);
        let mut out = BatchOutput::empty();

        for deadline in due {
            let mut shard = self.table.lock(&deadline.id);
            let Some(mut entry) = shard.remove(&deadline.id) else {
                continue;
            };

            let fun = match entry.timer.take() {
                Some(armed) if armed.seq == deadline.seq => armed.fun,
                other => {
                    entry.timer = other;
                    shard.insert(deadline.id, entry);
                    continue;
                }
            };

            bump(&self.stats.timeouts_fired);
            trace!("Timeout for {:?} in state {}", deadline.id, entry.state.id);

            let outcome = self.drive(&mut shard, deadline.id, entry, &mut out.send, fun);
            out.outcomes.push(outcome);
        }

        out
    }

    /// Evict a connection. No-op if it does not exist.
    pub fn remove_state(&self, id: &ConnId<I, P>) {
        let removed = self.table.lock(id).remove(id);
        if let Some(entry) = removed {
            trace!("Remove connection {:?} in state {}", id, entry.state.id);
            if let Some(armed) = entry.timer {
                self.lock_timers().cancel(armed.seq);
            }
        }
    }

    pub fn contains(&self, id: &ConnId<I, P>) -> bool {
        self.table.lock(id).contains_key(id)
    }

    /// The state a live connection is in.
    pub fn current_state(&self, id: &ConnId<I, P>) -> Option<StateId> {
        self.table.lock(id).get(id).map(|e| e.state.id)
    }

    /// Run `f` on a live connection's context.
    pub fn with_ctx<R>(&self, id: &ConnId<I, P>, f: impl FnOnce(&C) -> R) -> Option<R> {
        self.table.lock(id).get(id).map(|e| f(&e.state.ctx))
    }

    /// Number of live connections.
    pub fn state_table_len(&self) -> usize {
        self.table.len()
    }

    /// Number of armed timeouts.
    pub fn armed_timeouts(&self) -> usize {
        self.lock_timers().armed()
    }

    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, Timers<ConnId<I, P>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<I, P, C> fmt::Debug for StateMachine<I, P, C>
where
    I: Identifier<P>,
    P: Packet,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("ends", &self.ends)
            .field("table", &self.table)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
