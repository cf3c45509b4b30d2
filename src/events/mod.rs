//! 事件模块
//!
//! - [`SubscriberSet`]：按缓存键维护的观察者集合
//! - [`ProgressThrottler`]：清单写盘节流

pub mod hub;
pub mod throttle;

pub use hub::{SnapshotCallback, SubscriberSet};
pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
