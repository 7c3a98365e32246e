//! Wiring of a reducer from [`ReducerConfig`].
//!
//! In-memory backends by default; Postgres (store) and Redis (sink) when the
//! configuration asks for them.
//!
//! The trigger queue is always the in-memory scheduler, even with the Postgres
//! store, so pending deadline and dismissal triggers do not survive a restart.
//! [`ReducerServices::sweep`] covers for that: expired groups are dismissed by
//! the reaper, and OPEN Time-Window groups past their deadline are completed
//! by [`Reducer::repair`]. Hosts using a durable store must sweep periodically.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use docreduce_core::SystemClock;
use docreduce_events::{CompositeEvent, EventBus, InMemoryBusError, InMemoryEventBus, Subscription};

use crate::config::{ConfigError, ReducerConfig};
use crate::reducer::{GroupReaper, ReduceError, Reducer, SweepReport};
use crate::scheduler::{InMemoryScheduler, TriggerDispatcher, TriggerResult};
use crate::store::{AggregationStore, InMemoryAggregationStore, PostgresAggregationStore, StoreError};

#[cfg(feature = "redis")]
use crate::event_bus::{RedisPubSubSink, RedisSinkError};

pub type SharedStore = Arc<dyn AggregationStore>;

pub type ServiceReducer = Reducer<SharedStore, Arc<InMemoryScheduler>, CompositeSink, SystemClock>;

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Sink(#[from] RedisSinkError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    InMemory(#[from] InMemoryBusError),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] RedisSinkError),
}

/// Composite sink selected by configuration.
#[derive(Debug, Clone)]
pub enum CompositeSink {
    InMemory(Arc<InMemoryEventBus<CompositeEvent>>),
    #[cfg(feature = "redis")]
    Redis(RedisPubSubSink),
}

impl EventBus<CompositeEvent> for CompositeSink {
    type Error = SinkError;

    fn publish(&self, message: CompositeEvent) -> Result<(), Self::Error> {
        match self {
            CompositeSink::InMemory(bus) => bus.publish(message).map_err(SinkError::from),
            #[cfg(feature = "redis")]
            CompositeSink::Redis(sink) => sink.publish(message).map_err(SinkError::from),
        }
    }

    fn subscribe(&self) -> Subscription<CompositeEvent> {
        match self {
            CompositeSink::InMemory(bus) => bus.subscribe(),
            #[cfg(feature = "redis")]
            CompositeSink::Redis(sink) => sink.subscribe(),
        }
    }
}

/// A configured reducer with its scheduler queue and reaper.
pub struct ReducerServices {
    pub reducer: Arc<ServiceReducer>,
    pub scheduler: Arc<InMemoryScheduler>,
    pub reaper: GroupReaper<SharedStore, SystemClock>,
    config: ReducerConfig,
}

impl ReducerServices {
    /// In-memory store and sink, whatever the backend settings say.
    pub fn in_memory(config: &ReducerConfig) -> Result<Self, ServicesError> {
        let store: SharedStore = Arc::new(InMemoryAggregationStore::new());
        let sink = CompositeSink::InMemory(Arc::new(InMemoryEventBus::new()));
        Self::assemble(config, store, sink)
    }

    /// Backends as configured (`USE_PERSISTENT_STORES`, `REDIS_URL`).
    pub async fn build(config: &ReducerConfig) -> Result<Self, ServicesError> {
        let store: SharedStore = match config.backend.database_url.as_deref() {
            Some(url) if config.backend.use_persistent_stores => {
                info!("using postgres aggregation store");
                Arc::new(PostgresAggregationStore::connect(url).await?)
            }
            _ => Arc::new(InMemoryAggregationStore::new()),
        };

        let sink = Self::build_sink(config)?;
        Self::assemble(config, store, sink)
    }

    #[cfg(feature = "redis")]
    fn build_sink(config: &ReducerConfig) -> Result<CompositeSink, ServicesError> {
        match config.backend.redis_url.as_deref() {
            Some(url) => {
                info!(channel = %config.backend.redis_channel, "using redis composite sink");
                Ok(CompositeSink::Redis(RedisPubSubSink::new(
                    url,
                    config.backend.redis_channel.clone(),
                )?))
            }
            None => Ok(CompositeSink::InMemory(Arc::new(InMemoryEventBus::new()))),
        }
    }

    #[cfg(not(feature = "redis"))]
    fn build_sink(config: &ReducerConfig) -> Result<CompositeSink, ServicesError> {
        if config.backend.redis_url.is_some() {
            tracing::warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory sink");
        }
        Ok(CompositeSink::InMemory(Arc::new(InMemoryEventBus::new())))
    }

    fn assemble(
        config: &ReducerConfig,
        store: SharedStore,
        sink: CompositeSink,
    ) -> Result<Self, ServicesError> {
        let strategy = config.strategy.build().map_err(ConfigError::from)?;
        let scheduler = InMemoryScheduler::arc();

        let reducer = Arc::new(Reducer::new(
            store.clone(),
            scheduler.clone(),
            sink,
            SystemClock,
            strategy,
        ));
        let reaper = GroupReaper::new(store, SystemClock)
            .with_retention(config.reaper.retention())
            .with_batch_size(config.reaper.batch_size);

        Ok(Self {
            reducer,
            scheduler,
            reaper,
            config: config.clone(),
        })
    }

    /// Dispatcher that feeds due triggers to the reducer, using the configured
    /// retry policy.
    pub fn dispatcher(&self) -> TriggerDispatcher<Arc<InMemoryScheduler>, SystemClock> {
        let reducer = self.reducer.clone();
        TriggerDispatcher::new(self.scheduler.clone(), SystemClock, move |trigger| {
            TriggerResult::from(reducer.on_trigger(trigger))
        })
        .with_retry_policy(self.config.retry.clone())
    }

    /// One reaper sweep followed by the reducer's repairs.
    pub fn sweep(&self) -> Result<SweepReport, ReduceError> {
        let mut report = self.reaper.sweep()?;
        self.reducer.repair(&mut report)?;
        Ok(report)
    }

    pub fn config(&self) -> &ReducerConfig {
        &self.config
    }
}
