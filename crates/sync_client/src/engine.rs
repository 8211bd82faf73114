//! Sync engine: the public entry point.
//!
//! The host constructs one engine per process and shares it. The engine owns
//! the channel transport, the pipeline task with its sweep timer, the entity
//! cache and the REST collaborator.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::credentials::TokenStore;
use crate::error::{ConnectError, Result};
use crate::pipeline::{SessionCursor, SessionNotice, SyncPipeline};
use crate::reconciler::EntityCache;
use crate::registry::{Listener, ListenerId, ListenerRegistry};
use crate::rest::{EntitySource, MemberFilter};
use crate::transport::{ChannelTransport, ConnectResult, ConnectionState, TransportEvent};
use common::{Bet, Event, Member};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

const NOTICE_CAPACITY: usize = 64;

pub struct SyncEngine {
    transport: ChannelTransport,
    registry: Arc<ListenerRegistry>,
    cache: Arc<EntityCache>,
    source: Arc<dyn EntitySource>,
    notices: broadcast::Sender<SessionNotice>,
    cursor: Arc<SessionCursor>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    pipeline_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build the engine and spawn its pipeline task. Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: SyncConfig,
        tokens: Arc<dyn TokenStore>,
        source: Arc<dyn EntitySource>,
    ) -> Result<Self> {
        Self::start_with_clock(config, tokens, source, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        config: SyncConfig,
        tokens: Arc<dyn TokenStore>,
        source: Arc<dyn EntitySource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ListenerRegistry::new(&config.registry));
        let cache = Arc::new(EntityCache::new(clock));
        let cursor = Arc::new(SessionCursor::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let (transport, events_rx) =
            ChannelTransport::new(config.transport.clone(), tokens, registry.clone());

        let pipeline = SyncPipeline::new(
            &config,
            registry.clone(),
            cache.clone(),
            Arc::new(transport.clone()),
            notices.clone(),
            cursor.clone(),
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_pipeline(
            pipeline,
            events_rx,
            shutdown_rx,
            config.recovery.sweep_interval,
        ));

        info!(url = %config.transport.url, "Sync engine started");

        Ok(Self {
            transport,
            registry,
            cache,
            source,
            notices,
            cursor,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            pipeline_task: Mutex::new(Some(task)),
        })
    }

    /// Connect and authenticate the channel. See [`ChannelTransport::connect`].
    ///
    /// Fails with [`ConnectError::Closed`] after [`cleanup`](Self::cleanup).
    pub async fn connect(&self) -> ConnectResult {
        if self.is_stopped() {
            return Err(ConnectError::Closed);
        }
        self.transport.connect().await
    }

    fn is_stopped(&self) -> bool {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Register `listener` for `event_type`, or `"*"` for every type.
    pub fn subscribe(&self, event_type: &str, listener: Listener) -> ListenerId {
        let id = listener.id();
        self.transport.subscribe(event_type, listener);
        id
    }

    /// Register a closure and return its id for [`unsubscribe`](Self::unsubscribe).
    pub fn on(
        &self,
        event_type: &str,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.subscribe(event_type, Listener::new(callback))
    }

    pub fn unsubscribe(&self, event_type: &str, id: ListenerId) -> bool {
        self.transport.unsubscribe(event_type, id)
    }

    pub fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.transport.emit(event, payload)
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Cached member, if hydrated.
    pub fn member(&self, id: &str) -> Result<Option<Member>> {
        self.cache.get_typed(id)
    }

    /// Cached bet, if hydrated.
    pub fn bet(&self, id: &str) -> Result<Option<Bet>> {
        self.cache.get_typed(id)
    }

    /// Fetch a member over REST and install it as baseline state.
    pub async fn hydrate_member(&self, id: &str) -> Result<Member> {
        let as_of = self.cursor.position();
        let member = self.source.fetch_member(id).await?;
        self.cache.hydrate(&member, as_of)?;
        Ok(member)
    }

    /// Fetch every member matching `filter` and install them. Returns the
    /// number hydrated.
    pub async fn hydrate_members(&self, filter: &MemberFilter) -> Result<usize> {
        let as_of = self.cursor.position();
        let members = self.source.list_members(filter).await?;
        for member in &members {
            self.cache.hydrate(member, as_of)?;
        }
        debug!(count = members.len(), "Hydrated members");
        Ok(members.len())
    }

    pub async fn hydrate_bet(&self, id: &str) -> Result<Bet> {
        let as_of = self.cursor.position();
        let bet = self.source.fetch_bet(id).await?;
        self.cache.hydrate(&bet, as_of)?;
        Ok(bet)
    }

    /// Close the channel and stop the pipeline task. Safe to call more than
    /// once.
    pub async fn cleanup(&self) {
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(shutdown_tx) = shutdown_tx else {
            return;
        };

        self.transport.disconnect();
        let _ = shutdown_tx.send(()).await;

        let task = self
            .pipeline_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Sync engine stopped");
    }
}

async fn run_pipeline(
    mut pipeline: SyncPipeline,
    mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown_rx: mpsc::Receiver<()>,
    sweep_interval: Duration,
) {
    let mut sweep = interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.reset(); // Don't fire immediately

    loop {
        tokio::select! {
            biased;

            event = events_rx.recv() => {
                match event {
                    Some(event) => {
                        let new_session = matches!(
                            event,
                            TransportEvent::Authenticated(_) | TransportEvent::Reconnected(_)
                        );
                        pipeline.handle(event, Instant::now());
                        if new_session {
                            sweep.reset();
                        }
                    }
                    None => {
                        debug!("Transport event channel closed");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Sync pipeline shutting down");
                break;
            }

            _ = sweep.tick() => {
                pipeline.sweep(Instant::now());
            }
        }
    }
}
