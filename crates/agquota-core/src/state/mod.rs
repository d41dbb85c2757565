//! Durable state for cache-first startup.

mod store;

pub use store::{
    default_path, CacheDetails, PersistedState, PredictionRecord, StateStore, STATE_DIR_ENV,
};
