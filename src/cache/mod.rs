//! 渐进式、可续传的远端文件缓存
//!
//! 每个 (manager, uri) 对应一个缓存条目，状态机：
//!
//! ```text
//! Pending ──download──▶ Progress ──pause──▶ Pause
//!    ▲                    │  ▲                │
//!    │                    │  └────resume──────┘
//!  retry                  ├──▶ Complete
//!    │                    │
//! Failed ◀────────────────┘
//! ```

pub mod controller;
pub mod entry;
pub mod error;
pub mod fetcher;
pub mod handle;
pub mod manager;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{ControllerSettings, DownloadController};
pub use entry::{compute_progress, CacheEntry, CacheKey, CacheStatus, EntrySnapshot};
pub use error::{CacheError, ErrorKind, FailureInfo};
pub use fetcher::{
    parse_content_range, ByteStream, ContentRange, FetchRequest, FetchResponse, FetcherSettings,
    HttpFetcher, RemoteFetcher,
};
pub use handle::{CacheHandle, SubscribeOptions, Subscription};
pub use manager::{FileCacheManager, ManagerSettings, SNAPSHOT_CHANNEL_CAPACITY};
pub use store::{CacheSlot, CacheStore};
