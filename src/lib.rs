#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod array;
mod blueprint;
pub mod builtin;
mod config;
mod core;
mod engine;
mod entity;
mod error;
mod event;
mod key;
#[cfg(feature = "logging")]
mod logging;
mod persist;
mod source;
mod watcher;

pub use crate::array::{Array, Value};
pub use crate::blueprint::{Blueprint, DataTypeDef};
pub use crate::config::Settings;
pub use crate::core::{ArcStr, Hash32};
pub use crate::engine::*;
pub use crate::entity::{Axis, DataEntity};
pub use crate::error::*;
pub use crate::event::{Event, EventBus, EventKind, SubscriptionId, WidgetId};
pub use crate::key::CacheKey;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::source::{
    Dataset, FnModel, GhostModel, MemoryDataset, Model, Prediction, SubDataset,
};
pub use crate::watcher::{DataWatcher, Selection, WatchedData, WatcherId, WatcherMut};
