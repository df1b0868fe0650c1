mod cache;
mod datatype;
mod diagnostics;
mod scheduler;
mod task;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use crate::engine::cache::{Catalog, DatasetEntry};
pub use crate::engine::datatype::{
    DataType, Dependencies, ProduceContext, Producer, Production, Registry,
};
pub(crate) use crate::engine::datatype::write_mermaid;
pub use crate::engine::diagnostics::{Diagnostics, TypeSummary};
pub use crate::engine::scheduler::{GenerateOptions, GenerationQueue};
pub use crate::engine::task::{
    CancelToken, Completion, DEFAULT_HISTORY_LIMIT, ExecutionStatus, Outcome, Progress,
    TaskExecution, TaskHandle, TaskId, TaskManager, TaskRecord, TaskSpec,
};

use crate::builtin::{ENERGY, FORCES};
use crate::config::Settings;
use crate::core::ArcStr;
use crate::entity::DataEntity;
use crate::error::{DataError, EnvironmentError};
use crate::event::{Event, EventBus, EventKind, SubscriptionId, WidgetId};
use crate::key::CacheKey;
use crate::source::{Dataset, Model, SubDataset};
use crate::watcher::{DataWatcher, WatcherId, WatcherMut};

/// A production task in flight.
#[derive(Debug)]
struct Generation {
    key: CacheKey,
    is_component: bool,
}

/// The cache façade and scheduler.
///
/// Everything here runs on the thread that owns the environment. Work moves
/// forward only when [`tick`](Self::tick) is called, either directly by an
/// embedding event loop or through [`run_until_idle`](Self::run_until_idle).
pub struct Environment {
    settings: Settings,
    catalog: Catalog,
    bus: EventBus,
    tasks: TaskManager<Production>,
    queue: GenerationQueue,
    /// Keys with a production task in flight.
    queued_tasks: HashSet<CacheKey>,
    generations: HashMap<TaskId, Generation>,
    watchers: BTreeMap<WatcherId, DataWatcher>,
    next_widget: u64,
    next_watcher: u64,
    next_color: usize,
}

impl Environment {
    pub(crate) fn new(settings: Settings, registry: Registry) -> Self {
        Self {
            settings,
            catalog: Catalog::new(registry),
            bus: EventBus::new(),
            tasks: TaskManager::new(),
            queue: GenerationQueue::new(),
            queued_tasks: HashSet::new(),
            generations: HashMap::new(),
            watchers: BTreeMap::new(),
            next_widget: 0,
            next_watcher: 0,
            next_color: 0,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Registry {
        self.catalog.registry()
    }

    pub fn tasks(&self) -> &TaskManager<Production> {
        &self.tasks
    }

    pub fn generation_queue(&self) -> &GenerationQueue {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Pushes an event to be dispatched on the next tick. Consumers use this
    /// to request cancellation with [`Event::TaskCancel`].
    pub fn push_event(&mut self, event: Event) {
        self.bus.push(event);
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: FnMut(&Event) + 'static,
    {
        self.bus.subscribe(kind, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    // ******************************
    // *           Cache            *
    // ******************************

    pub fn get_data(
        &self,
        data_type: &str,
        model: Option<&str>,
        dataset: Option<&str>,
    ) -> Option<Arc<DataEntity>> {
        let key = self.cache_key(data_type, model, dataset)?;
        self.catalog.resolve(&key)
    }

    pub fn get_data_by_key(&self, key: &CacheKey) -> Option<Arc<DataEntity>> {
        self.catalog.resolve(key)
    }

    pub fn has_data(&self, data_type: &str, model: Option<&str>, dataset: Option<&str>) -> bool {
        self.get_data(data_type, model, dataset).is_some()
    }

    pub fn has_cache_key(&self, key: &CacheKey) -> bool {
        self.catalog.contains(key)
    }

    /// Key of a registered data type, `None` if the type is unknown or a
    /// needed model or dataset is missing.
    pub fn cache_key(
        &self,
        data_type: &str,
        model: Option<&str>,
        dataset: Option<&str>,
    ) -> Option<CacheKey> {
        let Some(data_type) = self.registry().get(data_type) else {
            tracing::error!(data_type, "unknown data type");
            return None;
        };
        data_type.cache_key(model, dataset)
    }

    /// Writes an entry, replacing whatever was stored under `key`.
    pub fn set_data(&mut self, key: CacheKey, entity: DataEntity) {
        if self.catalog.insert(key.clone(), Arc::new(entity)).is_some() {
            tracing::debug!(key = %key, "overwriting cache entry");
        }
        self.queue.clear_failure(&key);
        self.bus.push(Event::DataUpdated(key));
    }

    /// Drops every stored entry whose key matches, returning the keys.
    pub fn remove_data<F>(&mut self, remove: F) -> Vec<CacheKey>
    where
        F: FnMut(&CacheKey) -> bool,
    {
        self.catalog.remove_where(remove)
    }

    // ******************************
    // *     Datasets and models    *
    // ******************************

    /// Loads a dataset, returning its fingerprint. Loading a dataset that is
    /// already loaded does nothing.
    pub fn add_dataset(&mut self, dataset: Arc<dyn Dataset>) -> ArcStr {
        let fingerprint = dataset.fingerprint();
        if self.catalog.dataset(fingerprint).is_some() {
            tracing::debug!(dataset = fingerprint, "dataset is already loaded");
            return fingerprint.into();
        }

        let color = self.next_color;
        self.next_color += 1;

        let fingerprint = self.catalog.insert_dataset(dataset, color);
        tracing::info!(dataset = %fingerprint, "dataset loaded");
        self.bus.push(Event::DatasetLoaded(fingerprint.clone()));
        fingerprint
    }

    /// Unloads a dataset together with its sub-datasets and every cache
    /// entry keyed to any of them.
    pub fn remove_dataset(&mut self, fingerprint: &str) -> bool {
        let removed = self.catalog.descendants(fingerprint);
        if removed.is_empty() {
            return false;
        }

        let references = |key: &CacheKey| {
            key.dataset()
                .is_some_and(|d| removed.iter().any(|r| &**r == d))
        };
        self.forget(references);

        // children first
        for dataset in removed.iter().rev() {
            self.catalog.remove_dataset(dataset);
            tracing::info!(dataset = %dataset, "dataset removed");
            self.bus.push(Event::DatasetDeleted(dataset.clone()));
        }

        true
    }

    pub fn set_dataset_active(&mut self, fingerprint: &str, active: bool) -> Result<(), EnvironmentError> {
        let changed = self
            .catalog
            .set_active(fingerprint, active)
            .ok_or_else(|| EnvironmentError::UnknownDataset(fingerprint.into()))?;

        if changed {
            self.bus.push(Event::DatasetStateChanged(fingerprint.into()));
        }
        Ok(())
    }

    /// Loads a model, replacing a placeholder with the same fingerprint.
    pub fn add_model(&mut self, model: Arc<dyn Model>) -> ArcStr {
        let ghost = model.is_ghost();
        let (fingerprint, previous) = self.catalog.insert_model(model);

        if let Some(previous) = previous
            && !previous.is_ghost()
        {
            tracing::debug!(model = %fingerprint, "model is already loaded");
            if ghost {
                // never shadow a real model with a placeholder
                self.catalog.insert_model(previous);
            }
            return fingerprint;
        }

        // a real model may succeed where its placeholder failed
        let model = fingerprint.clone();
        self.queue
            .clear_failures_where(|key| key.model() == Some(&*model));

        tracing::info!(model = %fingerprint, ghost, "model loaded");
        self.bus.push(Event::ModelLoaded(fingerprint.clone()));
        fingerprint
    }

    /// Unloads a model and every cache entry keyed to it.
    pub fn remove_model(&mut self, fingerprint: &str) -> bool {
        if self.catalog.remove_model(fingerprint).is_none() {
            return false;
        }

        self.forget(|key| key.model() == Some(fingerprint));

        tracing::info!(model = fingerprint, "model removed");
        self.bus.push(Event::ModelDeleted(fingerprint.into()));
        true
    }

    /// Drops entries, queued keys, failures and tasks matching `matches`.
    fn forget<F>(&mut self, matches: F)
    where
        F: Fn(&CacheKey) -> bool,
    {
        let removed = self.catalog.remove_where(&matches);
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "cache entries removed");
        }

        self.queue.clear_failures_where(&matches);
        if self.queue.remove_where(&matches) {
            self.bus.push(Event::GenerationQueueChanged);
        }

        let stale: Vec<TaskId> = self
            .generations
            .iter()
            .filter(|(_, generation)| matches(&generation.key))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.cancel_task(&id);
        }
    }

    /// Creates or updates the sub-dataset identified by
    /// `(parent, model, sub_name)`.
    ///
    /// Declaring an existing sub-dataset again replaces its indices in place
    /// and reactivates it. Its fingerprint doesn't change, so cache entries
    /// keyed to it survive.
    pub fn declare_sub_dataset(
        &mut self,
        parent: &str,
        model: Option<&str>,
        indices: Vec<usize>,
        sub_name: &str,
        atom_filter: bool,
    ) -> Result<ArcStr, EnvironmentError> {
        let parent_dataset = self
            .catalog
            .dataset(parent)
            .ok_or_else(|| EnvironmentError::UnknownDataset(parent.into()))?;
        if let Some(model) = model
            && self.catalog.model(model).is_none()
        {
            return Err(EnvironmentError::UnknownModel(model.into()));
        }

        let fingerprint: ArcStr = SubDataset::fingerprint_for(parent, model, sub_name).into();
        let existing = self.catalog.dataset(&fingerprint);

        if let Some(existing) = &existing {
            let Some(subset) = existing.as_subset() else {
                return Err(EnvironmentError::UnknownDataset(fingerprint));
            };
            if subset.is_atom_filtered() != atom_filter {
                return Err(EnvironmentError::FilterMismatch(fingerprint));
            }
        }

        let len = if atom_filter {
            parent_dataset.n_atoms()
        } else {
            parent_dataset.len()
        };
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(DataError::IndexOutOfBounds {
                axis: usize::from(atom_filter),
                index,
                len,
            }
            .into());
        }

        if let Some(subset) = existing.as_ref().and_then(|d| d.as_subset()) {
            if subset.set_indices(indices) {
                tracing::debug!(dataset = %fingerprint, "sub-dataset indices changed");
                self.bus
                    .push(Event::SubdatasetIndicesChanged(fingerprint.clone()));
            }
            self.set_dataset_active(&fingerprint, true)?;
            return Ok(fingerprint);
        }

        let subset = SubDataset::new(
            parent_dataset,
            model.map(Into::into),
            sub_name,
            indices,
            atom_filter,
        );
        Ok(self.add_dataset(Arc::new(subset)))
    }

    // ******************************
    // *         Generation         *
    // ******************************

    /// Requests one key. Does nothing if the key is cached or a task for it
    /// is already in flight; otherwise starts a production task for it.
    ///
    /// Results a sub-dataset reads through its parent are requested for the
    /// parent, so both share one task.
    ///
    /// Forces for a model that predicts energies and forces together are
    /// requested as energies, which publish forces too.
    pub fn task_generate_data(
        &mut self,
        data_type: &str,
        model: Option<&str>,
        dataset: Option<&str>,
        options: GenerateOptions,
    ) -> Option<TaskId> {
        let data_type = match model {
            Some(fp)
                if data_type == FORCES
                    && self.catalog.model(fp).is_some_and(|m| m.single_predict()) =>
            {
                tracing::debug!(model = fp, "requesting energy instead of forces");
                ENERGY
            }
            _ => data_type,
        };

        let Some(data_type) = self.registry().get(data_type).cloned() else {
            tracing::error!(data_type, "unknown data type");
            return None;
        };
        // sub-dataset requests served by a parent produce the parent's key
        let key = data_type.production_key(&self.catalog, model, dataset)?;
        if key.dataset() != dataset.filter(|_| data_type.is_dataset_dependent()) {
            tracing::debug!(key = %key, "requesting the parent dataset's entry");
        }

        if self.catalog.contains(&key) {
            tracing::trace!(key = %key, "already cached");
            return None;
        }
        if self.queued_tasks.contains(&key) {
            tracing::debug!(key = %key, "already being generated");
            return None;
        }

        let catalog = self.catalog.clone();
        let batch_size = self.settings.batch_size();
        let task_key = key.clone();

        let spec = TaskSpec::new(move |handle: &TaskHandle| {
            data_type.generate(
                &catalog,
                task_key.model(),
                task_key.dataset(),
                handle,
                batch_size,
            )
        })
        .name(format!("Generating {key}"))
        .key(TaskId::from(&key))
        .threaded(options.threaded)
        .visual(options.visual)
        .component_parent(options.component_parent.clone());

        let id = self.tasks.new_task(spec, &mut self.bus)?;
        tracing::debug!(key = %key, component = options.is_component, "generation scheduled");

        self.queued_tasks.insert(key.clone());
        self.generations.insert(
            id.clone(),
            Generation {
                key,
                is_component: options.is_component,
            },
        );

        Some(id)
    }

    /// Queues a key for resolution on the next tick. Failed keys stay failed.
    pub fn enqueue_generation(&mut self, key: CacheKey) -> bool {
        let queued = self.queue.insert(key);
        if queued {
            self.bus.push(Event::GenerationQueueChanged);
        }
        queued
    }

    /// Queues a key, clearing a previous failure first.
    pub fn request_generation(&mut self, key: CacheKey) -> bool {
        let queued = self.queue.request(key);
        if queued {
            self.bus.push(Event::GenerationQueueChanged);
        }
        queued
    }

    fn fail(&mut self, key: CacheKey, reason: impl Into<ArcStr>) {
        let reason = reason.into();
        tracing::error!(key = %key, "generation failed: {reason}");
        self.queue.fail(key.clone(), reason);
        self.bus.push(Event::GenerationFailed(key));
    }

    pub fn failure(&self, key: &CacheKey) -> Option<&str> {
        self.queue.failure(key)
    }

    /// One pass over a snapshot of the generation queue.
    ///
    /// Each key either gets scheduled, or gets its closest generatable
    /// prerequisites scheduled and stays queued. A key several levels away
    /// from its inputs therefore advances one level per tick, and every
    /// level is a separate task that can be cancelled on its own.
    pub fn handle_generation_queue(&mut self) {
        let snapshot = self.queue.snapshot();
        if snapshot.is_empty() {
            return;
        }

        let options = GenerateOptions::new(&self.settings);
        let mut scheduled = HashSet::new();
        let mut changed = false;

        for key in snapshot {
            if !self.queue.contains(&key) {
                continue;
            }

            if self.catalog.contains(&key) {
                changed |= self.queue.remove(&key);
                continue;
            }

            let Some(data_type) = self.registry().get(key.data_type()).cloned() else {
                self.fail(key, "unknown data type");
                continue;
            };

            let (model, dataset) = (key.model(), key.dataset());

            if data_type.check_dependencies(&self.catalog, model, dataset).can_generate {
                self.task_generate_data(data_type.key(), model, dataset, options.clone());
                changed |= self.queue.remove(&key);
                continue;
            }

            let components = match data_type.generatable_component(&self.catalog, model, dataset) {
                Ok(components) => components,
                Err(err) => {
                    self.fail(key, err.to_string());
                    continue;
                }
            };

            if components.is_empty() {
                self.fail(key, "no prerequisite can be generated");
                continue;
            }

            // a placeholder model can't predict, the result stays unavailable
            let ghost = model
                .and_then(|fp| self.catalog.model(fp))
                .is_some_and(|m| m.is_ghost());
            if ghost
                && components
                    .iter()
                    .any(|c| matches!(c.data_type(), ENERGY | FORCES))
            {
                self.task_generate_data(
                    data_type.key(),
                    model,
                    dataset,
                    options.clone().component_of(None),
                );
                changed |= self.queue.remove(&key);
                continue;
            }

            if let Some(failed) = components.iter().find(|c| self.queue.is_failed(c)) {
                let reason = format!("prerequisite {failed} failed");
                self.fail(key, reason);
                continue;
            }

            for component in components {
                if !scheduled.insert(component.clone()) {
                    continue;
                }
                self.task_generate_data(
                    component.data_type(),
                    component.model(),
                    component.dataset(),
                    options.clone().component_of(Some(key.clone())),
                );
            }
        }

        if changed {
            self.bus.push(Event::GenerationQueueChanged);
        }
    }

    fn finish_generation(&mut self, record: TaskRecord, outcome: Outcome<Production>) {
        let Some(Generation { key, is_component }) = self.generations.remove(&record.id) else {
            return;
        };
        self.queued_tasks.remove(&key);

        let failure = match outcome {
            Outcome::Finished(production) if production.produced => {
                for (key, entity) in production.outputs {
                    self.set_data(key, entity);
                }
                if !self.catalog.contains(&key) {
                    tracing::warn!(key = %key, "production finished without publishing its key");
                }
                return;
            }
            Outcome::Finished(_) if !is_component => {
                tracing::debug!(key = %key, "production declined, queueing");
                self.enqueue_generation(key);
                return;
            }
            Outcome::Finished(_) => String::from("prerequisite could not be produced"),
            Outcome::Failed(err) => format!("{err:#}"),
        };

        self.fail(key.clone(), failure);

        if let Some(parent) = record.component_parent
            && self.queue.contains(&parent)
        {
            self.fail(parent, format!("prerequisite {key} failed"));
        }
    }

    /// Advances the task manager and writes finished productions.
    pub fn process_tasks(&mut self) {
        for Completion { record, outcome } in self.tasks.poll(&mut self.bus) {
            self.finish_generation(record, outcome);
        }
    }

    /// Cancels a task. A cancelled prerequisite takes the key that
    /// discovered it out of the generation queue.
    pub fn cancel_task(&mut self, id: &TaskId) -> bool {
        let Some(record) = self.tasks.cancel_task(id, &mut self.bus) else {
            return false;
        };

        if let Some(generation) = self.generations.remove(id) {
            self.queued_tasks.remove(&generation.key);
        }

        if let Some(parent) = &record.component_parent
            && self.queue.remove(parent)
        {
            tracing::debug!(key = %parent, "dropped with its cancelled prerequisite");
            self.bus.push(Event::GenerationQueueChanged);
        }

        true
    }

    pub fn set_task_progress(
        &mut self,
        id: &TaskId,
        prog_max: usize,
        prog: usize,
        message: Option<&str>,
        percent: bool,
    ) {
        self.tasks
            .set_task_progress(id, prog_max, prog, message, percent, &mut self.bus);
    }

    pub fn is_task_running(&self, id: &TaskId) -> bool {
        self.tasks.is_task_running(id)
    }

    // ******************************
    // *         Event loop         *
    // ******************************

    /// Hands every pending event to the environment itself, then to the
    /// watchers, then to external subscribers. Events pushed meanwhile wait
    /// for the next dispatch.
    pub fn dispatch_events(&mut self) {
        let events = self.bus.drain();

        for event in &events {
            if let Event::TaskCancel(id) = event
                && !self.cancel_task(id)
            {
                tracing::trace!(task = %id, "cancel request for a task that isn't running");
            }
        }

        for event in &events {
            for watcher in self.watchers.values_mut() {
                watcher.on_event(event, &self.catalog, &self.queue, &mut self.bus);
            }
        }

        for event in &events {
            self.bus.notify(event);
        }
    }

    pub fn tick(&mut self) {
        self.dispatch_events();
        self.handle_generation_queue();
        self.process_tasks();
    }

    /// Nothing pending anywhere.
    pub fn is_idle(&self) -> bool {
        self.bus.is_empty() && self.tasks.is_idle() && self.queue.is_empty()
    }

    /// Ticks until idle. Returns `false` if `timeout` ran out first.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();

        loop {
            self.tick();
            if self.is_idle() {
                return true;
            }
            if start.elapsed() >= timeout {
                tracing::warn!(
                    tasks = self.tasks.len(),
                    queued = self.queue.len(),
                    "not idle after {timeout:?}"
                );
                return false;
            }
            std::thread::sleep(self.settings.tick_interval());
        }
    }

    /// Cancels every task and drops the generation queue.
    pub fn quit(&mut self) {
        let cancelled = self.tasks.quit(&mut self.bus);
        tracing::info!(count = cancelled.len(), "tasks cancelled on quit");

        self.generations.clear();
        self.queued_tasks.clear();
        self.queue.clear();
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(self.tasks.history())
    }

    /// Forgets past executions, e.g. before profiling a new batch of work.
    pub fn clear_history(&mut self) {
        self.tasks.clear_history();
    }

    // ******************************
    // *          Watchers          *
    // ******************************

    pub fn new_widget(&mut self) -> WidgetId {
        self.next_widget += 1;
        WidgetId(self.next_widget)
    }

    pub fn add_watcher(&mut self, owner: impl Into<String>) -> WatcherId {
        self.next_watcher += 1;
        let id = WatcherId(self.next_watcher);
        self.watchers.insert(id, DataWatcher::new(id, owner));
        id
    }

    pub fn remove_watcher(&mut self, id: WatcherId) -> bool {
        self.watchers.remove(&id).is_some()
    }

    pub fn watcher(&self, id: WatcherId) -> Option<&DataWatcher> {
        self.watchers.get(&id)
    }

    pub fn watcher_mut(&mut self, id: WatcherId) -> Option<WatcherMut<'_>> {
        let watcher = self.watchers.get_mut(&id)?;
        Some(WatcherMut {
            watcher,
            catalog: &self.catalog,
            queue: &mut self.queue,
            bus: &mut self.bus,
        })
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("catalog", &self.catalog)
            .field("tasks", &self.tasks.len())
            .field("queue", &self.queue.len())
            .field("watchers", &self.watchers.len())
            .finish()
    }
}
