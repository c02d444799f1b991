use crate::config::{DiagnosticsCallback, ErrorSink, ResourceManagerConfig};
use crate::diagnostics::{DiagnosticEvent, DiagnosticEventType};
use crate::error::{TroveError, TroveResult};
use crate::handle::{GenericHandle, OperationHandle};
use crate::instance::{Instance, InstanceId, InstanceOperation, InstanceProvider, InstantiationParameters};
use crate::operation::{AsyncOperation, OperationContext, OperationStatus, ProgressCallback};
use crate::operations::{ChainOperation, CompletedOperation, GroupOperation, ProviderOperation};
use crate::provider::ResourceProvider;
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use trove_base::hashing::HashMap;
use trove_base::{ErasedObject, OperationId, ResourceLocation, ResultType};

pub(crate) type CompletedCallback = Box<dyn FnOnce(&GenericHandle) + Send>;
pub(crate) type DestroyedCallback = Box<dyn FnOnce(&GenericHandle) + Send>;

// Key of the dedup cache. Location entries include the requested type, dependency groups are keyed by
// the hash of the dependency list they were created for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum CacheKey {
    Location(u64),
    DependencyGroup(u64),
}

//
// Events which drive operations forward. They are produced by state changes and drained by
// pump_events() before any public entry point returns.
//
#[derive(Debug)]
enum ManagerEvent {
    // Sent when every dependency of an operation reached a terminal state
    DependenciesComplete(OperationId),
    // Sent when an operation reached a terminal state, notifies callbacks and dependents
    Completed(OperationId),
}

/// Called once per `ResourceManager::update`
pub trait UpdateReceiver: Send + Sync {
    fn update(
        &self,
        manager: &ResourceManager,
        delta_time: f32,
    );
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpdateReceiverId(u64);

struct OperationSlot {
    debug_name: String,
    result_type: ResultType,
    status: OperationStatus,
    result: Option<ErasedObject>,
    error: Option<TroveError>,

    // Number of handles that own a reference. Reaching zero destroys the operation.
    reference_count: u32,

    // Operations this operation acquired when it started. They are released when this is destroyed.
    dependencies: Vec<OperationId>,

    // Number of dependencies that have not reached a terminal state yet
    waiting_on: usize,

    // Operations that are waiting on this operation to complete before they can execute
    blocked: Vec<OperationId>,

    completed_callbacks: Vec<CompletedCallback>,
    destroyed_callbacks: Vec<DestroyedCallback>,

    // None while execute/update/destroy is running on it
    behavior: Option<Box<dyn AsyncOperation>>,
    progress: Option<ProgressCallback>,
    cache_key: Option<CacheKey>,
    executed: bool,

    // Set when the reference count reached zero. Nothing can acquire or release the operation after this.
    destroying: bool,
}

struct OperationEntry {
    version: u32,
    slot: Option<OperationSlot>,
}

struct TrackedInstance {
    operation: OperationId,
    scene: Option<String>,
}

struct ResourceManagerInner {
    // Arena of operations. Freed entries are reused with a bumped version.
    operations: Vec<OperationEntry>,
    free_operations: Vec<u32>,
    operation_count: usize,

    // Lookup only, entries don't own a reference
    cache: HashMap<CacheKey, OperationId>,

    // Callbacks registered on already complete operations, each holding a reference until it runs
    deferred_callbacks: Vec<(OperationId, CompletedCallback)>,

    updating_operations: Vec<OperationId>,
    update_receivers: Vec<(UpdateReceiverId, Arc<dyn UpdateReceiver>)>,
    next_update_receiver_id: u64,

    // Instance operations that can be released by instance
    tracked_instances: HashMap<InstanceId, TrackedInstance>,

    providers: Vec<Arc<dyn ResourceProvider>>,
    frame: u64,
}

impl ResourceManagerInner {
    fn slot(
        &self,
        id: OperationId,
    ) -> Option<&OperationSlot> {
        let entry = self.operations.get(id.index() as usize)?;
        if entry.version != id.version() {
            return None;
        }

        entry.slot.as_ref()
    }

    fn slot_mut(
        &mut self,
        id: OperationId,
    ) -> Option<&mut OperationSlot> {
        let entry = self.operations.get_mut(id.index() as usize)?;
        if entry.version != id.version() {
            return None;
        }

        entry.slot.as_mut()
    }

    fn allocate(
        &mut self,
        slot: OperationSlot,
    ) -> OperationId {
        self.operation_count += 1;
        if let Some(index) = self.free_operations.pop() {
            let entry = &mut self.operations[index as usize];
            entry.slot = Some(slot);
            OperationId::new(index, entry.version)
        } else {
            let index = self.operations.len() as u32;
            self.operations.push(OperationEntry {
                version: 1,
                slot: Some(slot),
            });
            OperationId::new(index, 1)
        }
    }

    fn free(
        &mut self,
        id: OperationId,
    ) -> Option<OperationSlot> {
        let entry = self.operations.get_mut(id.index() as usize)?;
        if entry.version != id.version() {
            return None;
        }

        let slot = entry.slot.take()?;
        // Version 0 is reserved for the null id
        entry.version = entry.version.wrapping_add(1).max(1);
        self.free_operations.push(id.index());
        self.operation_count -= 1;
        Some(slot)
    }
}

pub(crate) struct ManagerShared {
    inner: Mutex<ResourceManagerInner>,

    events_tx: Sender<ManagerEvent>,
    events_rx: Receiver<ManagerEvent>,

    diagnostics_tx: Sender<DiagnosticEvent>,
    diagnostics_rx: Receiver<DiagnosticEvent>,

    error_sink: Option<ErrorSink>,
    diagnostics: Option<DiagnosticsCallback>,
    log_failures: bool,
}

impl ManagerShared {
    fn lock(&self) -> MutexGuard<ResourceManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_event(
        &self,
        event: ManagerEvent,
    ) {
        // The receiver lives next to the sender, this can't be disconnected while we exist
        if let Err(e) = self.events_tx.send(event) {
            log::error!("Dropped manager event {:?}", e.into_inner());
        }
    }

    // Queues a diagnostic event, they are delivered outside the lock by flush_diagnostics()
    fn post_diagnostic(
        &self,
        inner: &ResourceManagerInner,
        event_type: DiagnosticEventType,
        id: OperationId,
        value: i64,
    ) {
        if self.diagnostics.is_none() {
            return;
        }

        let (display_name, dependencies) = match inner.slot(id) {
            Some(slot) => (slot.debug_name.clone(), slot.dependencies.clone()),
            None => (String::default(), Vec::default()),
        };

        let _ = self.diagnostics_tx.send(DiagnosticEvent {
            event_type,
            operation: id,
            display_name,
            dependencies,
            frame: inner.frame,
            value,
        });
    }
}

/// Starts, deduplicates and tears down operations.
///
/// All state lives behind one mutex. The lock is never held while operations, providers or callbacks
/// run, so any of them may call back into the manager. The manager expects to be driven from a single
/// thread that also calls `update` once per tick; work that finishes on other threads should be handed
/// back through a channel that a provider drains in its `update`.
#[derive(Clone)]
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (diagnostics_tx, diagnostics_rx) = crossbeam_channel::unbounded();

        let inner = ResourceManagerInner {
            operations: Vec::default(),
            free_operations: Vec::default(),
            operation_count: 0,
            cache: Default::default(),
            deferred_callbacks: Vec::default(),
            updating_operations: Vec::default(),
            update_receivers: Vec::default(),
            // start at 1 so a zeroed id is never handed out
            next_update_receiver_id: 1,
            tracked_instances: Default::default(),
            providers: config.providers,
            frame: 0,
        };

        ResourceManager {
            shared: Arc::new(ManagerShared {
                inner: Mutex::new(inner),
                events_tx,
                events_rx,
                diagnostics_tx,
                diagnostics_rx,
                error_sink: config.error_sink,
                diagnostics: config.diagnostics,
                log_failures: config.log_failures,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<ManagerShared>) -> Self {
        ResourceManager { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<ManagerShared> {
        Arc::downgrade(&self.shared)
    }

    fn handle(
        &self,
        id: OperationId,
    ) -> GenericHandle {
        GenericHandle::new(self.downgrade(), id)
    }

    //
    // Providers
    //
    pub fn add_resource_provider(
        &self,
        provider: Arc<dyn ResourceProvider>,
    ) {
        self.shared.lock().providers.push(provider);
    }

    pub fn resource_providers(&self) -> Vec<Arc<dyn ResourceProvider>> {
        self.shared.lock().providers.clone()
    }

    /// First registered provider whose id matches the location and that can produce `result_type`
    pub fn get_resource_provider(
        &self,
        result_type: &ResultType,
        location: &ResourceLocation,
    ) -> Option<Arc<dyn ResourceProvider>> {
        self.resource_providers().into_iter().find(|provider| {
            provider.provider_id() == location.provider_id()
                && provider.can_provide(result_type, location)
        })
    }

    //
    // Requests
    //
    pub fn provide_resource<T: Any + Send + Sync>(
        &self,
        location: &Arc<ResourceLocation>,
    ) -> OperationHandle<T> {
        self.provide_resource_of(location, ResultType::single::<T>())
            .typed()
    }

    /// Loads every sub-object of a location as a list
    pub fn provide_resource_list<T: Any + Send + Sync>(
        &self,
        location: &Arc<ResourceLocation>,
    ) -> OperationHandle<Vec<Arc<T>>> {
        self.provide_resource_of(location, ResultType::list::<T>())
            .typed()
    }

    /// Loads every sub-object of a location as a boxed slice
    pub fn provide_resource_array<T: Any + Send + Sync>(
        &self,
        location: &Arc<ResourceLocation>,
    ) -> OperationHandle<Box<[Arc<T>]>> {
        self.provide_resource_of(location, ResultType::array::<T>())
            .typed()
    }

    /// Loads a location as whatever type its provider produces by default
    pub fn provide_resource_untyped(
        &self,
        location: &Arc<ResourceLocation>,
    ) -> GenericHandle {
        let provider = self
            .resource_providers()
            .into_iter()
            .find(|provider| provider.provider_id() == location.provider_id());

        match provider {
            Some(provider) => self.provide_resource_of(location, provider.default_type(location)),
            None => self.create_completed_operation_erased(
                ResultType::single::<()>(),
                None,
                Some(TroveError::UnknownProvider {
                    provider_id: location.provider_id().to_string(),
                    location: location.to_string(),
                }),
            ),
        }
    }

    /// Returns the operation loading `location` as `result_type`. While an operation for the same
    /// location and type is alive, the same operation is returned with its reference count raised.
    pub fn provide_resource_of(
        &self,
        location: &Arc<ResourceLocation>,
        result_type: ResultType,
    ) -> GenericHandle {
        let cache_key = CacheKey::Location(location.hash(&result_type));
        if let Some(handle) = self.acquire_cached(cache_key) {
            log::trace!("provide_resource {} reused {:?}", location, handle.id());
            return handle;
        }

        let provider = match self.get_resource_provider(&result_type, location) {
            Some(provider) => provider,
            None => {
                return self.create_completed_operation_erased(
                    result_type,
                    None,
                    Some(TroveError::UnknownProvider {
                        provider_id: location.provider_id().to_string(),
                        location: location.to_string(),
                    }),
                );
            }
        };

        let dependency = if location.has_dependencies() {
            Some(self.provide_dependency_group(location))
        } else {
            None
        };

        let operation = ProviderOperation::new(provider, location.clone(), result_type);
        let dependencies = match &dependency {
            Some(dependency) => std::slice::from_ref(dependency),
            None => &[],
        };
        let handle = self.start_operation_internal(
            Box::new(operation),
            result_type,
            dependencies,
            Some(cache_key),
        );

        // The provider operation holds its own reference to the group now
        if let Some(dependency) = dependency {
            if let Err(e) = dependency.release() {
                log::error!("Failed to release dependency group of {}: {}", location, e);
            }
        }

        handle
    }

    /// Loads every location and completes once all of them are done, whether they succeeded or not.
    /// The result lists the member operations in the same order as `locations`.
    pub fn provide_resource_group(
        &self,
        locations: &[Arc<ResourceLocation>],
    ) -> OperationHandle<Vec<GenericHandle>> {
        let members: Vec<GenericHandle> = locations
            .iter()
            .map(|location| self.provide_resource_untyped(location))
            .collect();

        let handle = self.start_group(&members, None);
        self.release_all(members);
        handle.typed()
    }

    // Group for a location's dependencies, shared by every location with the same dependency list
    fn provide_dependency_group(
        &self,
        location: &ResourceLocation,
    ) -> GenericHandle {
        let cache_key = CacheKey::DependencyGroup(location.dependency_hash());
        if let Some(handle) = self.acquire_cached(cache_key) {
            return handle;
        }

        let members: Vec<GenericHandle> = location
            .dependencies()
            .iter()
            .map(|dependency| self.provide_resource_untyped(dependency))
            .collect();

        let handle = self.start_group(&members, Some(cache_key));
        self.release_all(members);
        handle
    }

    fn start_group(
        &self,
        members: &[GenericHandle],
        cache_key: Option<CacheKey>,
    ) -> GenericHandle {
        let handle = self.start_operation_internal(
            Box::new(GroupOperation::default()),
            ResultType::single::<Vec<GenericHandle>>(),
            members,
            cache_key,
        );

        let progress_members = members.to_vec();
        self.set_progress_callback(
            handle.id(),
            Arc::new(move || {
                if progress_members.is_empty() {
                    return 1.0;
                }

                let total: f32 = progress_members
                    .iter()
                    .map(|x| x.percent_complete().unwrap_or(1.0))
                    .sum();
                total / progress_members.len() as f32
            }),
        );

        handle
    }

    fn release_all(
        &self,
        handles: Vec<GenericHandle>,
    ) {
        for handle in handles {
            let id = handle.id();
            if let Err(e) = handle.release() {
                log::error!("Failed to release {:?}: {}", id, e);
            }
        }
    }

    /// Starts a custom operation. It executes once `dependency` (if any) reached a terminal state.
    pub fn start_operation<T, O>(
        &self,
        operation: O,
        dependency: Option<&GenericHandle>,
    ) -> OperationHandle<T>
    where
        T: Any + Send + Sync,
        O: AsyncOperation + 'static,
    {
        let dependencies = match dependency {
            Some(dependency) => std::slice::from_ref(dependency),
            None => &[],
        };
        self.start_operation_with_dependencies(operation, dependencies)
    }

    pub fn start_operation_with_dependencies<T, O>(
        &self,
        operation: O,
        dependencies: &[GenericHandle],
    ) -> OperationHandle<T>
    where
        T: Any + Send + Sync,
        O: AsyncOperation + 'static,
    {
        self.start_operation_internal(
            Box::new(operation),
            ResultType::single::<T>(),
            dependencies,
            None,
        )
        .typed()
    }

    /// An operation that is already complete. It fails if `error` is given.
    pub fn create_completed_operation<T: Any + Send + Sync>(
        &self,
        result: Option<T>,
        error: Option<TroveError>,
    ) -> OperationHandle<T> {
        self.create_completed_operation_erased(
            ResultType::single::<T>(),
            result.map(|x| Arc::new(x) as ErasedObject),
            error,
        )
        .typed()
    }

    fn create_completed_operation_erased(
        &self,
        result_type: ResultType,
        result: Option<ErasedObject>,
        error: Option<TroveError>,
    ) -> GenericHandle {
        self.start_operation_internal(
            Box::new(CompletedOperation::new(result, error)),
            result_type,
            &[],
            None,
        )
    }

    /// Groups existing operations. The group acquires every member and completes once all of them did.
    pub fn create_group_operation(
        &self,
        handles: &[GenericHandle],
    ) -> OperationHandle<Vec<GenericHandle>> {
        self.start_group(handles, None).typed()
    }

    /// Once `dependency` completes, `callback` is given it and returns the operation whose result
    /// becomes the result of the chain. Fails without calling `callback` if `dependency` failed.
    pub fn create_chain_operation<TOut, TDep, F>(
        &self,
        dependency: &OperationHandle<TDep>,
        callback: F,
    ) -> OperationHandle<TOut>
    where
        TOut: Any + Send + Sync,
        TDep: Any + Send + Sync,
        F: FnOnce(&OperationHandle<TDep>) -> OperationHandle<TOut> + Send + 'static,
    {
        let operation = ChainOperation::<TDep, TOut>::new(callback);
        let progress = operation.progress_callback(dependency.untyped());
        let handle = self.start_operation_internal(
            Box::new(operation),
            ResultType::single::<TOut>(),
            &[dependency.untyped()],
            None,
        );
        self.set_progress_callback(handle.id(), progress);
        handle.typed()
    }

    /// Loads the prefab at `location` and instantiates it through `provider` once loaded. The instance
    /// can be released with `release_instance`, which also releases the returned handle.
    pub fn provide_instance(
        &self,
        provider: Arc<dyn InstanceProvider>,
        location: &Arc<ResourceLocation>,
        parameters: InstantiationParameters,
    ) -> OperationHandle<Instance> {
        let prefab = self.provide_resource_untyped(location);
        let handle = self.start_operation_internal(
            Box::new(InstanceOperation::new(provider, parameters)),
            ResultType::single::<Instance>(),
            &[prefab.clone()],
            None,
        );
        self.release_all(vec![prefab]);
        handle.typed()
    }

    /// Releases the operation that created `instance`. Returns false (and logs a warning) if the
    /// instance is not tracked, for example because it was already released.
    pub fn release_instance(
        &self,
        instance: &Instance,
    ) -> bool {
        let tracked = self.shared.lock().tracked_instances.remove(&instance.id());
        match tracked {
            Some(tracked) => {
                if let Err(e) = self.release_operation(tracked.operation) {
                    log::error!("Failed to release instance {:?}: {}", instance.id(), e);
                }
                true
            }
            None => {
                log::warn!("Releasing unknown instance {:?}", instance.id());
                false
            }
        }
    }

    /// Releases every tracked instance that was created into `scene`. Returns how many were released.
    pub fn cleanup_scene_instances(
        &self,
        scene: &str,
    ) -> usize {
        let operations: Vec<OperationId> = {
            let mut inner = self.shared.lock();
            let instance_ids: Vec<InstanceId> = inner
                .tracked_instances
                .iter()
                .filter(|(_, tracked)| tracked.scene.as_deref() == Some(scene))
                .map(|(instance_id, _)| *instance_id)
                .collect();

            instance_ids
                .iter()
                .filter_map(|x| inner.tracked_instances.remove(x))
                .map(|x| x.operation)
                .collect()
        };

        for operation in &operations {
            if let Err(e) = self.release_operation(*operation) {
                log::error!("Failed to release instance operation {:?}: {}", operation, e);
            }
        }

        operations.len()
    }

    pub(crate) fn track_instance(
        &self,
        instance_id: InstanceId,
        operation: OperationId,
        scene: Option<String>,
    ) {
        self.shared
            .lock()
            .tracked_instances
            .insert(instance_id, TrackedInstance { operation, scene });
    }

    //
    // Update
    //

    /// Advances providers, update receivers and operations that poll, then runs completion callbacks
    /// that were registered on already complete operations.
    #[profiling::function]
    pub fn update(
        &self,
        delta_time: f32,
    ) {
        let (providers, receivers) = {
            let mut inner = self.shared.lock();
            inner.frame += 1;
            let receivers: Vec<_> = inner
                .update_receivers
                .iter()
                .map(|(_, receiver)| receiver.clone())
                .collect();
            (inner.providers.clone(), receivers)
        };

        for provider in &providers {
            provider.update(self, delta_time);
        }

        // Receivers removed while this loop runs still get this tick
        for receiver in &receivers {
            receiver.update(self, delta_time);
        }

        self.update_operations(delta_time);
        self.execute_deferred_callbacks();
        self.pump_events();
    }

    pub fn add_update_receiver(
        &self,
        receiver: Arc<dyn UpdateReceiver>,
    ) -> UpdateReceiverId {
        let mut inner = self.shared.lock();
        let id = UpdateReceiverId(inner.next_update_receiver_id);
        inner.next_update_receiver_id += 1;
        inner.update_receivers.push((id, receiver));
        id
    }

    pub fn remove_update_receiver(
        &self,
        id: UpdateReceiverId,
    ) -> bool {
        let mut inner = self.shared.lock();
        let count = inner.update_receivers.len();
        inner.update_receivers.retain(|(x, _)| *x != id);
        inner.update_receivers.len() != count
    }

    fn update_operations(
        &self,
        delta_time: f32,
    ) {
        let updating = self.shared.lock().updating_operations.clone();
        for id in updating {
            let checked_out = {
                let mut inner = self.shared.lock();
                match inner.slot_mut(id) {
                    Some(slot) if !slot.destroying && !slot.status.is_done() => slot
                        .behavior
                        .take()
                        .map(|behavior| (behavior, slot.dependencies.clone())),
                    _ => None,
                }
            };

            if let Some((mut behavior, dependencies)) = checked_out {
                let context = OperationContext::new(self, id, &dependencies);
                behavior.update(&context, delta_time);
                self.return_behavior(id, behavior);
            }

            if self.shared.diagnostics.is_some() {
                if let Ok(percent) = self.operation_percent_complete(id) {
                    let inner = self.shared.lock();
                    self.shared.post_diagnostic(
                        &inner,
                        DiagnosticEventType::PercentComplete,
                        id,
                        (percent * 100.0) as i64,
                    );
                }
            }
        }
    }

    fn execute_deferred_callbacks(&self) {
        // Callbacks registered while these run are deferred to the next update
        let deferred = std::mem::take(&mut self.shared.lock().deferred_callbacks);
        for (id, callback) in deferred {
            callback(&self.handle(id));
            if let Err(e) = self.release_operation(id) {
                log::error!("Failed to release {:?} after deferred callback: {}", id, e);
            }
        }
    }

    //
    // Leak checks
    //

    /// Number of entries in the dedup cache
    pub fn operation_cache_count(&self) -> usize {
        self.shared.lock().cache.len()
    }

    /// Number of operations that have not been destroyed
    pub fn operation_count(&self) -> usize {
        self.shared.lock().operation_count
    }

    /// Number of times update() was called
    pub fn frame(&self) -> u64 {
        self.shared.lock().frame
    }

    //
    // Operation lifecycle
    //
    fn acquire_cached(
        &self,
        cache_key: CacheKey,
    ) -> Option<GenericHandle> {
        let id = {
            let mut inner = self.shared.lock();
            let id = *inner.cache.get(&cache_key)?;
            let slot = inner.slot_mut(id)?;
            if slot.destroying {
                return None;
            }

            slot.reference_count += 1;
            let reference_count = slot.reference_count;
            self.shared.post_diagnostic(
                &inner,
                DiagnosticEventType::ReferenceCount,
                id,
                reference_count as i64,
            );
            id
        };

        self.flush_diagnostics();
        Some(self.handle(id))
    }

    fn start_operation_internal(
        &self,
        behavior: Box<dyn AsyncOperation>,
        result_type: ResultType,
        dependencies: &[GenericHandle],
        cache_key: Option<CacheKey>,
    ) -> GenericHandle {
        let debug_name = behavior.debug_name();
        let id = {
            let mut inner = self.shared.lock();

            // Acquire dependencies first. Anything already gone is skipped so we never wait on an
            // operation that can't complete.
            let mut acquired = Vec::with_capacity(dependencies.len());
            for dependency in dependencies {
                match inner.slot_mut(dependency.id()) {
                    Some(slot) if !slot.destroying => {
                        slot.reference_count += 1;
                        acquired.push(dependency.id());
                    }
                    _ => log::warn!(
                        "Starting {} with invalid dependency {:?}",
                        debug_name,
                        dependency.id()
                    ),
                }
            }

            let id = inner.allocate(OperationSlot {
                debug_name: debug_name.clone(),
                result_type,
                status: OperationStatus::InProgress,
                result: None,
                error: None,
                reference_count: 1,
                dependencies: acquired.clone(),
                waiting_on: 0,
                blocked: Vec::default(),
                completed_callbacks: Vec::default(),
                destroyed_callbacks: Vec::default(),
                behavior: Some(behavior),
                progress: None,
                cache_key,
                executed: false,
                destroying: false,
            });

            let mut waiting_on = 0;
            for dependency in &acquired {
                if let Some(slot) = inner.slot_mut(*dependency) {
                    if !slot.status.is_done() {
                        slot.blocked.push(id);
                        waiting_on += 1;
                    }
                }
            }

            if let Some(slot) = inner.slot_mut(id) {
                slot.waiting_on = waiting_on;
            }

            if let Some(cache_key) = cache_key {
                inner.cache.insert(cache_key, id);
            }

            self.shared
                .post_diagnostic(&inner, DiagnosticEventType::Create, id, 0);

            if waiting_on == 0 {
                self.shared
                    .send_event(ManagerEvent::DependenciesComplete(id));
            }

            id
        };

        log::debug!("start operation {:?} {}", id, debug_name);
        self.pump_events();
        self.handle(id)
    }

    // Process all queued events. Safe to call re-entrantly, a nested call just drains what is queued.
    #[profiling::function]
    fn pump_events(&self) {
        while let Ok(event) = self.shared.events_rx.try_recv() {
            log::trace!("handle event {:?}", event);
            match event {
                ManagerEvent::DependenciesComplete(id) => self.handle_dependencies_complete(id),
                ManagerEvent::Completed(id) => self.handle_completed(id),
            }
        }

        self.flush_diagnostics();
    }

    fn flush_diagnostics(&self) {
        if let Some(diagnostics) = &self.shared.diagnostics {
            while let Ok(event) = self.shared.diagnostics_rx.try_recv() {
                (diagnostics)(&event);
            }
        }
    }

    fn handle_dependencies_complete(
        &self,
        id: OperationId,
    ) {
        let checked_out = {
            let mut inner = self.shared.lock();
            match inner.slot_mut(id) {
                Some(slot) if !slot.executed && !slot.destroying && !slot.status.is_done() => {
                    slot.executed = true;
                    slot.behavior
                        .take()
                        .map(|behavior| (behavior, slot.dependencies.clone()))
                }
                _ => None,
            }
        };

        if let Some((mut behavior, dependencies)) = checked_out {
            log::debug!("execute {:?} {}", id, behavior.debug_name());
            let context = OperationContext::new(self, id, &dependencies);
            behavior.execute(&context);
            self.return_behavior(id, behavior);
        }
    }

    // Puts a behavior back after execute/update, or finishes destroying the operation if its last
    // reference was released while the behavior was out
    fn return_behavior(
        &self,
        id: OperationId,
        behavior: Box<dyn AsyncOperation>,
    ) {
        let wants_updates = behavior.receives_updates();
        let destroy = {
            let mut inner = self.shared.lock();
            let (destroying, done) = match inner.slot(id) {
                Some(slot) => (slot.destroying, slot.status.is_done()),
                None => return,
            };

            if destroying {
                Some(behavior)
            } else {
                if let Some(slot) = inner.slot_mut(id) {
                    slot.behavior = Some(behavior);
                }

                if wants_updates && !done && !inner.updating_operations.contains(&id) {
                    inner.updating_operations.push(id);
                }
                None
            }
        };

        if let Some(behavior) = destroy {
            self.finish_destroy(id, Some(behavior));
        }
    }

    fn handle_completed(
        &self,
        id: OperationId,
    ) {
        let (callbacks, blocked, failure) = {
            let mut inner = self.shared.lock();
            inner.updating_operations.retain(|x| *x != id);
            let slot = match inner.slot_mut(id) {
                Some(slot) if !slot.destroying => slot,
                _ => return,
            };

            let failure = if slot.status == OperationStatus::Failed {
                slot.error.clone()
            } else {
                None
            };

            // Held until every callback ran, a callback may release the last handle
            if !slot.completed_callbacks.is_empty() {
                slot.reference_count += 1;
            }

            (
                std::mem::take(&mut slot.completed_callbacks),
                std::mem::take(&mut slot.blocked),
                failure,
            )
        };

        let handle = self.handle(id);
        if let Some(error) = failure {
            self.report_failure(&handle, &error);
        }

        if !blocked.is_empty() {
            let mut inner = self.shared.lock();
            for dependent in blocked {
                if let Some(slot) = inner.slot_mut(dependent) {
                    slot.waiting_on = slot.waiting_on.saturating_sub(1);
                    if slot.waiting_on == 0 {
                        self.shared
                            .send_event(ManagerEvent::DependenciesComplete(dependent));
                    }
                }
            }
        }

        if !callbacks.is_empty() {
            for callback in callbacks {
                callback(&handle);
            }

            if let Err(e) = self.release_operation(id) {
                log::error!("Failed to release {:?} after completed callbacks: {}", id, e);
            }
        }
    }

    fn report_failure(
        &self,
        handle: &GenericHandle,
        error: &TroveError,
    ) {
        if let Some(error_sink) = &self.shared.error_sink {
            (error_sink)(handle, error);
        }

        if self.shared.log_failures {
            let debug_name = handle.debug_name().unwrap_or_default();
            log::error!("{:?} {} failed: {}", handle.id(), debug_name, error);
        }
    }

    pub(crate) fn complete_operation(
        &self,
        id: OperationId,
        result: Option<ErasedObject>,
        success: bool,
        error: Option<TroveError>,
    ) -> TroveResult<()> {
        {
            let mut inner = self.shared.lock();
            let slot = match inner.slot_mut(id) {
                Some(slot) if !slot.destroying => slot,
                _ => return Err(TroveError::InvalidHandle),
            };

            if slot.status.is_done() {
                return Err(TroveError::AlreadyCompleted);
            }

            let (result, success, error) = match result {
                Some(result) if !slot.result_type.matches(&result) => (
                    None,
                    false,
                    Some(TroveError::TypeMismatch {
                        expected: slot.result_type.element_name(),
                        context: format!("Operation {}", slot.debug_name),
                    }),
                ),
                result => (result, success, error),
            };

            let error = if success {
                error
            } else {
                Some(error.unwrap_or_else(|| TroveError::StringError(format!(
                    "Unknown error in operation {}",
                    slot.debug_name
                ))))
            };

            slot.status = if success {
                OperationStatus::Succeeded
            } else {
                OperationStatus::Failed
            };
            slot.result = result;
            slot.error = error;

            let event_type = if success {
                DiagnosticEventType::Complete
            } else {
                DiagnosticEventType::Fail
            };
            self.shared.post_diagnostic(&inner, event_type, id, 0);
            self.shared.send_event(ManagerEvent::Completed(id));
        }

        log::debug!("complete operation {:?} success: {}", id, success);
        self.pump_events();
        Ok(())
    }

    pub(crate) fn acquire_operation(
        &self,
        id: OperationId,
    ) -> TroveResult<()> {
        {
            let mut inner = self.shared.lock();
            let slot = match inner.slot_mut(id) {
                Some(slot) => slot,
                None => {
                    log::error!("Acquire called on invalid operation {:?}", id);
                    return Err(TroveError::InvalidHandle);
                }
            };

            if slot.destroying {
                log::error!("Acquire called on {:?} while it is being destroyed", id);
                return Err(TroveError::ReferenceChangeDuringDestroy);
            }

            slot.reference_count += 1;
            let reference_count = slot.reference_count;
            self.shared.post_diagnostic(
                &inner,
                DiagnosticEventType::ReferenceCount,
                id,
                reference_count as i64,
            );
        }

        self.flush_diagnostics();
        Ok(())
    }

    pub(crate) fn release_operation(
        &self,
        id: OperationId,
    ) -> TroveResult<()> {
        let destroy = {
            let mut inner = self.shared.lock();
            let slot = match inner.slot_mut(id) {
                Some(slot) => slot,
                None => {
                    log::error!("Release called on invalid operation {:?}", id);
                    return Err(TroveError::InvalidHandle);
                }
            };

            if slot.destroying {
                log::error!("Release called on {:?} while it is being destroyed", id);
                return Err(TroveError::ReferenceChangeDuringDestroy);
            }

            slot.reference_count -= 1;
            let reference_count = slot.reference_count;
            // The behavior is only missing while execute or update runs on it. In that case the
            // destroy is finished by return_behavior().
            let behavior_checked_out = slot.behavior.is_none();
            let cache_key = if reference_count == 0 {
                slot.destroying = true;
                slot.cache_key.take()
            } else {
                None
            };

            self.shared.post_diagnostic(
                &inner,
                DiagnosticEventType::ReferenceCount,
                id,
                reference_count as i64,
            );

            if reference_count == 0 {
                if let Some(cache_key) = cache_key {
                    if inner.cache.get(&cache_key) == Some(&id) {
                        inner.cache.remove(&cache_key);
                    }
                }

                inner.updating_operations.retain(|x| *x != id);
                !behavior_checked_out
            } else {
                false
            }
        };

        if destroy {
            self.finish_destroy(id, None);
        }

        self.flush_diagnostics();
        Ok(())
    }

    fn finish_destroy(
        &self,
        id: OperationId,
        checked_out: Option<Box<dyn AsyncOperation>>,
    ) {
        let (behavior, destroyed_callbacks, dependencies) = {
            let mut inner = self.shared.lock();
            match inner.slot_mut(id) {
                Some(slot) => (
                    checked_out.or_else(|| slot.behavior.take()),
                    std::mem::take(&mut slot.destroyed_callbacks),
                    slot.dependencies.clone(),
                ),
                None => return,
            }
        };

        log::debug!("destroy operation {:?}", id);

        let handle = self.handle(id);
        for callback in destroyed_callbacks {
            callback(&handle);
        }

        if let Some(mut behavior) = behavior {
            let context = OperationContext::new(self, id, &dependencies);
            behavior.destroy(&context);
        }

        // Dependencies outlive everything that depends on them
        for dependency in dependencies {
            if let Err(e) = self.release_operation(dependency) {
                log::error!(
                    "Failed to release dependency {:?} of {:?}: {}",
                    dependency,
                    id,
                    e
                );
            }
        }

        let freed = {
            let mut inner = self.shared.lock();
            self.shared
                .post_diagnostic(&inner, DiagnosticEventType::Destroy, id, 0);
            inner.tracked_instances.retain(|_, x| x.operation != id);
            inner.free(id)
        };

        // Dropped outside the lock, callbacks and results may own arbitrary data
        drop(freed);
    }

    pub(crate) fn register_completed_callback(
        &self,
        id: OperationId,
        callback: CompletedCallback,
    ) -> TroveResult<()> {
        {
            let mut inner = self.shared.lock();
            let slot = match inner.slot_mut(id) {
                Some(slot) => slot,
                None => return Err(TroveError::InvalidHandle),
            };

            if slot.destroying {
                return Err(TroveError::ReferenceChangeDuringDestroy);
            }

            if slot.status.is_done() {
                // Held until the callback ran on the next update
                slot.reference_count += 1;
                let reference_count = slot.reference_count;
                inner.deferred_callbacks.push((id, callback));
                self.shared.post_diagnostic(
                    &inner,
                    DiagnosticEventType::ReferenceCount,
                    id,
                    reference_count as i64,
                );
            } else {
                slot.completed_callbacks.push(callback);
            }
        }

        self.flush_diagnostics();
        Ok(())
    }

    pub(crate) fn register_destroyed_callback(
        &self,
        id: OperationId,
        callback: DestroyedCallback,
    ) -> TroveResult<()> {
        let mut inner = self.shared.lock();
        match inner.slot_mut(id) {
            Some(slot) if !slot.destroying => {
                slot.destroyed_callbacks.push(callback);
                Ok(())
            }
            Some(_) => Err(TroveError::ReferenceChangeDuringDestroy),
            None => Err(TroveError::InvalidHandle),
        }
    }

    pub(crate) fn set_progress_callback(
        &self,
        id: OperationId,
        callback: ProgressCallback,
    ) {
        if let Some(slot) = self.shared.lock().slot_mut(id) {
            slot.progress = Some(callback);
        }
    }

    //
    // Queries used by handles
    //
    pub(crate) fn is_operation_alive(
        &self,
        id: OperationId,
    ) -> bool {
        self.shared
            .lock()
            .slot(id)
            .map(|slot| !slot.destroying)
            .unwrap_or(false)
    }

    fn read_slot<R>(
        &self,
        id: OperationId,
        f: impl FnOnce(&OperationSlot) -> R,
    ) -> TroveResult<R> {
        self.shared
            .lock()
            .slot(id)
            .map(f)
            .ok_or(TroveError::InvalidHandle)
    }

    pub(crate) fn operation_status(
        &self,
        id: OperationId,
    ) -> TroveResult<OperationStatus> {
        self.read_slot(id, |slot| slot.status)
    }

    pub(crate) fn operation_result(
        &self,
        id: OperationId,
    ) -> TroveResult<Option<ErasedObject>> {
        self.read_slot(id, |slot| slot.result.clone())
    }

    pub(crate) fn operation_error(
        &self,
        id: OperationId,
    ) -> TroveResult<Option<TroveError>> {
        self.read_slot(id, |slot| slot.error.clone())
    }

    pub(crate) fn operation_reference_count(
        &self,
        id: OperationId,
    ) -> TroveResult<u32> {
        self.read_slot(id, |slot| slot.reference_count)
    }

    pub(crate) fn operation_debug_name(
        &self,
        id: OperationId,
    ) -> TroveResult<String> {
        self.read_slot(id, |slot| slot.debug_name.clone())
    }

    pub(crate) fn operation_percent_complete(
        &self,
        id: OperationId,
    ) -> TroveResult<f32> {
        let (done, progress) = self.read_slot(id, |slot| {
            (slot.status.is_done(), slot.progress.clone())
        })?;

        if done {
            return Ok(1.0);
        }

        // Called outside the lock, progress callbacks usually query other operations
        Ok(progress
            .map(|progress| progress().clamp(0.0, 1.0))
            .unwrap_or(0.0))
    }
}
