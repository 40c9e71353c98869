pub mod cache;
pub mod config;
pub mod model;
pub mod selection;
pub mod store;

pub use cache::{CacheName, CachePolicy, KvCache};
pub use config::AppConfig;
pub use model::*;
pub use selection::{count_for, same_selection, Selection};
pub use store::{DurableStore, StoreSnapshot};
