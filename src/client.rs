use log::debug;
use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use std::{fmt, ops::ControlFlow};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::arp::{ArpClient, ArpLinkResolver, LinkSink};
use crate::channel::{ChannelTransport, IcmpChannel, Receiver};
use crate::constants::DEFAULT_SETTLE_DELAY;
use crate::error::{Error, Result};
use crate::probe::{ProbeResult, SessionStats};
use crate::resolve::{resolve, Target};
use crate::session::{Session, State};
use crate::timer::TokioScheduler;

type PingSession = Session<ChannelTransport, TokioScheduler, Option<ArpLinkResolver>>;

/// Builds a [`Pinger`] on top of a shared [`IcmpChannel`].
#[derive(Debug, Clone)]
pub struct PingerBuilder {
    channel: Arc<IcmpChannel>,
    arp: Option<Arc<ArpClient>>,
    settle_delay: Duration,
    identifier: Option<u16>,
}

impl PingerBuilder {
    pub fn new(channel: Arc<IcmpChannel>) -> Self {
        Self {
            channel,
            arp: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
            identifier: None,
        }
    }

    /// Uses a fixed echo identifier instead of a random one.
    ///
    /// Pingers sharing a channel must not share an identifier.
    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Fills [`ProbeResult::link_address`] for on-link responders.
    pub fn with_arp_client(mut self, client: Arc<ArpClient>) -> Self {
        self.arp = Some(client);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Builds the pinger with an identifier drawn from the thread-local generator.
    ///
    /// # Errors
    /// Returns an error when called outside of a tokio runtime.
    pub fn build(self) -> Result<Pinger> {
        self.build_with_rng(&mut rand::thread_rng())
    }

    /// Same as [`PingerBuilder::build`], drawing the identifier from `rng`.
    ///
    /// # Errors
    /// Returns an error when called outside of a tokio runtime.
    pub fn build_with_rng<R: Rng>(self, rng: &mut R) -> Result<Pinger> {
        let runtime = Handle::try_current().map_err(|err| Error::Opaque(err.into()))?;
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let Self {
            channel,
            arp,
            settle_delay,
            identifier,
        } = self;

        let session = Arc::new_cyclic(|weak: &Weak<Mutex<PingSession>>| {
            let inbound = weak.clone();
            let receiver: Receiver = Arc::new(move |source, bytes| match inbound.upgrade() {
                Some(session) => session.lock().handle_packet(source, bytes),
                None => false,
            });
            let links = arp.map(|client| {
                let sink = weak.clone();
                let deliver: LinkSink = Arc::new(move |addr, mac| {
                    if let Some(session) = sink.upgrade() {
                        session.lock().link_resolved(addr, mac);
                    }
                });
                ArpLinkResolver::new(client, runtime.clone(), deliver)
            });
            let mut session = Session::new(
                ChannelTransport::new(channel, receiver),
                TokioScheduler::new(runtime.clone(), fired_tx),
                links,
                rng,
            )
            .with_settle_delay(settle_delay);
            if let Some(identifier) = identifier {
                session = session.with_identifier(identifier);
            }
            Mutex::new(session)
        });

        let (state, _) = watch::channel(State::Idle);
        let state = Arc::new(state);
        let mut driver = BackgroundTaskSpawner::new();
        {
            let session = Arc::downgrade(&session);
            let state = Arc::clone(&state);
            driver.spawn_on(&runtime, async move {
                while let Some(timer) = fired_rx.recv().await {
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    let mut session = session.lock();
                    session.on_timer(timer);
                    state.send_replace(session.state());
                }
            });
        }

        Ok(Pinger {
            session,
            state,
            generation: AtomicU64::new(0),
            _driver: driver,
        })
    }
}

/// An async handle on one ping session.
///
/// Replies are matched on the channel's listener thread and timers fire on the
/// runtime; both go through the same lock, so callbacks never overlap. Callbacks
/// run with that lock held and must not call back into the `Pinger`: return
/// [`ControlFlow::Break`] from [`Pinger::on_probe`] to stop early instead.
///
/// # Example
/// ```no_run
/// use async_ping::{IcmpChannel, PingerBuilder};
/// use std::ops::ControlFlow;
/// use std::time::Duration;
///
/// tokio_test::block_on(async {
///     let pinger = PingerBuilder::new(IcmpChannel::open().unwrap()).build().unwrap();
///     pinger.on_probe(|probe, _| {
///         println!("seq={} answered={}", probe.sequence, probe.answered);
///         ControlFlow::Continue(())
///     });
///     pinger.begin("127.0.0.1", 4, Duration::from_secs(1)).await.unwrap();
///     let stats = pinger.finished().await;
///     println!("{}/{} replies", stats.total_received, stats.total_sent);
/// })
/// ```
pub struct Pinger {
    session: Arc<Mutex<PingSession>>,
    state: Arc<watch::Sender<State>>,
    generation: AtomicU64,
    _driver: BackgroundTaskSpawner,
}

impl Pinger {
    /// Starts `count` probes against `target`, resolving host names first.
    ///
    /// Returns once the first probe has been sent; use [`Pinger::finished`] to
    /// wait for the run to end.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `count` is zero or a run is already
    /// in progress, [`Error::ResolutionFailure`] if the host name does not
    /// resolve, and [`Error::Cancelled`] if [`Pinger::cancel`] was called while
    /// it was resolving.
    pub async fn begin(
        &self,
        target: impl Into<Target>,
        count: u16,
        timeout: Duration,
    ) -> Result<()> {
        let host = match target.into() {
            Target::Addr(addr) => {
                let mut session = self.session.lock();
                let started = session.begin(addr, count, timeout);
                self.publish(&session);
                return started;
            }
            Target::Host(host) => host,
        };
        let generation = {
            let mut session = self.session.lock();
            session.await_target(count, timeout)?;
            self.publish(&session);
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let resolved = resolve(&host).await;
        let mut session = self.session.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("resolution of {} superseded", host);
            return Err(Error::Cancelled);
        }
        let started = resolved.and_then(|addr| session.target_resolved(addr));
        if started.is_err() {
            session.target_unresolved();
        }
        self.publish(&session);
        started
    }

    /// Sends no further probe; the outstanding one is still reported.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut session = self.session.lock();
        session.cancel();
        self.publish(&session);
    }

    /// Replaces the per-probe callback.
    pub fn on_probe<F>(&self, callback: F)
    where
        F: FnMut(&ProbeResult, &SessionStats) -> ControlFlow<()> + Send + 'static,
    {
        self.session.lock().on_probe(callback);
    }

    /// Replaces the completion callback.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnMut(&ProbeResult, &SessionStats) + Send + 'static,
    {
        self.session.lock().on_complete(callback);
    }

    /// Waits until the current run is over and returns its statistics.
    ///
    /// Returns immediately if nothing is running.
    pub async fn finished(&self) -> SessionStats {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| !running(*state)).await;
        *self.session.lock().stats()
    }

    /// Tears the session down without reporting.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut session = self.session.lock();
        session.stop();
        self.publish(&session);
    }

    /// Returns a finished session to idle.
    pub fn reset(&self) {
        let mut session = self.session.lock();
        session.reset();
        self.publish(&session);
    }

    pub fn identifier(&self) -> u16 {
        self.session.lock().identifier()
    }

    pub fn state(&self) -> State {
        self.session.lock().state()
    }

    pub fn probe(&self) -> ProbeResult {
        *self.session.lock().probe()
    }

    pub fn stats(&self) -> SessionStats {
        *self.session.lock().stats()
    }

    fn publish(&self, session: &PingSession) {
        self.state.send_replace(session.state());
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Pinger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session.lock();
        f.debug_struct("Pinger")
            .field("identifier", &session.identifier())
            .field("state", &session.state())
            .field("stats", session.stats())
            .finish()
    }
}

fn running(state: State) -> bool {
    state == State::AwaitingTarget || state.is_in_flight()
}

/// Runs one future in the background until it completes or the spawner is dropped.
#[derive(Debug)]
pub(crate) struct BackgroundTaskSpawner {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTaskSpawner {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: None,
        }
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_on(&Handle::current(), task);
    }

    pub(crate) fn spawn_on<F>(&mut self, runtime: &Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = runtime.spawn(async move {
            tokio::select! {
                _ = task => {},
                _ = token.cancelled() => {}
            }
        });
        self.handle = Some(handle);
    }
}

impl Drop for BackgroundTaskSpawner {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use test_case::test_case;

    #[test_case(State::Idle, false)]
    #[test_case(State::AwaitingTarget, true)]
    #[test_case(State::ProbeInFlight, true)]
    #[test_case(State::ReplySettling, true)]
    #[test_case(State::Done, false)]
    fn test_running(state: State, expected: bool) {
        assert_eq!(running(state), expected);
    }

    #[tokio::test]
    async fn test_spawner_cancels_on_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut spawner = BackgroundTaskSpawner::new();
        spawner.spawn(async move {
            std::future::pending::<()>().await;
            drop(tx);
        });
        drop(spawner);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_spawner_runs_to_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut spawner = BackgroundTaskSpawner::new();
        spawner.spawn(async move {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    #[ignore = "needs CAP_NET_RAW"]
    async fn test_ping_loopback() {
        let channel = IcmpChannel::open().unwrap();
        let pinger = PingerBuilder::new(Arc::clone(&channel))
            .build_with_rng(&mut StdRng::seed_from_u64(7))
            .unwrap();
        let reports = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reports);
        pinger.on_probe(move |probe, _| {
            assert!(probe.answered);
            assert_eq!(probe.target, Ipv4Addr::LOCALHOST);
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        pinger
            .begin("localhost", 3, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(channel.receivers(), 1);
        let stats = pinger.finished().await;

        assert_eq!(reports.load(Ordering::SeqCst), 3);
        assert_eq!(stats.total_sent, 3);
        assert_eq!(stats.total_received, 3);
        assert_eq!(pinger.state(), State::Done);
        assert_eq!(channel.receivers(), 0);
    }
}
