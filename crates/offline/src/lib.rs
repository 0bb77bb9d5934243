//! Offline support for the landing page: cache-policy dispatch, named cache
//! stores and the background-sync outbox.

pub mod dispatcher;
pub mod fetch;
pub mod storage;
pub mod strategy;
pub mod sync;
pub mod worker;

pub use dispatcher::{
    offline_response, ControlMessage, ControlReply, DispatchError, Dispatched, Dispatcher,
    DispatcherConfig, LifecycleState, ResponseSource, CACHE_VERSION, OFFLINE_PAGE,
    PRECACHE_MANIFEST, RUNTIME_STORE,
};
pub use fetch::{FetchError, FetchRequest, FetchResponse, Fetcher, HttpFetcher, RequestMode};
pub use storage::{CacheStorage, MemoryCacheStorage};
pub use strategy::{classify, strategy_for, AssetClass, Strategy};
pub use sync::{Outbox, QueueKind, SyncReport, SYNC_ANALYTICS_TAG, SYNC_FORMS_TAG};
pub use worker::{spawn, WorkerError, WorkerHandle};
