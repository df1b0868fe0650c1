//! Notifications between the engine and its consumers.
//!
//! Everything the UI layer learns about the cache goes through [`Event`].
//! The set of variants is closed, so a consumer matching on it is checked
//! by the compiler against every notification the engine can emit.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display};

use crate::core::ArcStr;
use crate::engine::{Progress, TaskId};
use crate::key::CacheKey;

/// Identity of a consumer widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetId(pub(crate) u64);

impl Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "widget#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A cache entry was written.
    DataUpdated(CacheKey),
    DatasetLoaded(ArcStr),
    DatasetDeleted(ArcStr),
    ModelLoaded(ArcStr),
    ModelDeleted(ArcStr),
    /// A dataset was activated or deactivated.
    DatasetStateChanged(ArcStr),
    SubdatasetIndicesChanged(ArcStr),
    TaskCreated(TaskId),
    TaskDone(TaskId),
    TaskProgress { id: TaskId, progress: Progress },
    /// Request to cancel a task.
    TaskCancel(TaskId),
    GenerationQueueChanged,
    /// A key reached a terminal failure and won't be retried on its own.
    GenerationFailed(CacheKey),
    WidgetRefresh(WidgetId),
}

/// Payload-free discriminant of [`Event`], used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataUpdated,
    DatasetLoaded,
    DatasetDeleted,
    ModelLoaded,
    ModelDeleted,
    DatasetStateChanged,
    SubdatasetIndicesChanged,
    TaskCreated,
    TaskDone,
    TaskProgress,
    TaskCancel,
    GenerationQueueChanged,
    GenerationFailed,
    WidgetRefresh,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DataUpdated(_) => EventKind::DataUpdated,
            Event::DatasetLoaded(_) => EventKind::DatasetLoaded,
            Event::DatasetDeleted(_) => EventKind::DatasetDeleted,
            Event::ModelLoaded(_) => EventKind::ModelLoaded,
            Event::ModelDeleted(_) => EventKind::ModelDeleted,
            Event::DatasetStateChanged(_) => EventKind::DatasetStateChanged,
            Event::SubdatasetIndicesChanged(_) => EventKind::SubdatasetIndicesChanged,
            Event::TaskCreated(_) => EventKind::TaskCreated,
            Event::TaskDone(_) => EventKind::TaskDone,
            Event::TaskProgress { .. } => EventKind::TaskProgress,
            Event::TaskCancel(_) => EventKind::TaskCancel,
            Event::GenerationQueueChanged => EventKind::GenerationQueueChanged,
            Event::GenerationFailed(_) => EventKind::GenerationFailed,
            Event::WidgetRefresh(_) => EventKind::WidgetRefresh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn FnMut(&Event)>;

/// Mediator between the engine and external consumers.
///
/// Pushed events wait in a FIFO until the owning environment drains them on
/// its next tick; events pushed while a drained batch is being dispatched
/// are held for the tick after.
#[derive(Default)]
pub struct EventBus {
    pending: VecDeque<Event>,
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, Subscriber)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.pending.push_back(event);
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: FnMut(&Event) + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut found = false;
        for list in self.subscribers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            found |= list.len() != before;
        }
        found
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Pending events, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Event> {
        self.pending.iter()
    }

    /// Takes every pending event.
    pub fn drain(&mut self) -> Vec<Event> {
        self.pending.drain(..).collect()
    }

    /// Hands `event` to its subscribers in subscription order.
    pub(crate) fn notify(&mut self, event: &Event) {
        if let Some(list) = self.subscribers.get_mut(&event.kind()) {
            for (_, callback) in list.iter_mut() {
                callback(event);
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("pending", &self.pending)
            .field("subscribers", &self.subscribers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
