use hearth_core::{
    BackendCapabilities, BackendModel, LoadedModel, ModelStatus, Result, RuntimeError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One registered model: its record, its backend handle, and the primitives
/// that serialize work against it.
///
/// All field mutation goes through the slot's own lock so requests on
/// different models never contend.
pub struct ModelSlot {
    record: Mutex<LoadedModel>,
    handle: OnceLock<Arc<dyn BackendModel>>,
    /// One permit for backends that serve a single request at a time.
    gate: Option<Arc<Semaphore>>,
    /// Parent of every request token issued against this model.
    shutdown: CancellationToken,
    active: watch::Sender<u32>,
}

impl ModelSlot {
    pub fn new(record: LoadedModel) -> Self {
        let gate = (!record.capabilities.supports_concurrent_requests)
            .then(|| Arc::new(Semaphore::new(1)));
        let (active, _) = watch::channel(0);
        Self {
            record: Mutex::new(record),
            handle: OnceLock::new(),
            gate,
            shutdown: CancellationToken::new(),
            active,
        }
    }

    pub fn snapshot(&self) -> LoadedModel {
        lock(&self.record).clone()
    }

    pub fn instance_id(&self) -> String {
        lock(&self.record).id.clone()
    }

    pub fn status(&self) -> ModelStatus {
        lock(&self.record).status
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        lock(&self.record).capabilities
    }

    /// Runs `f` inside this model's exclusive section.
    pub fn update<R>(&self, f: impl FnOnce(&mut LoadedModel) -> R) -> R {
        f(&mut lock(&self.record))
    }

    pub fn set_handle(&self, handle: Arc<dyn BackendModel>) {
        let _ = self.handle.set(handle);
    }

    pub fn handle(&self) -> Option<Arc<dyn BackendModel>> {
        self.handle.get().cloned()
    }

    /// Admits a request if the model is serviceable, bumping the active count.
    /// Serialized backends report `Busy` while any request is active.
    pub fn begin_request(&self) -> Result<(Arc<dyn BackendModel>, CancellationToken)> {
        let mut record = lock(&self.record);
        if !record.status.accepts_requests() {
            return Err(RuntimeError::ModelUnavailable {
                model_id: record.model_id.clone(),
                status: record.status,
            });
        }
        let handle = self.handle().ok_or_else(|| RuntimeError::ModelUnavailable {
            model_id: record.model_id.clone(),
            status: record.status,
        })?;

        record.active_requests += 1;
        record.metrics.record_admitted();
        record.last_used_at = chrono::Utc::now();
        if !record.capabilities.supports_concurrent_requests {
            record.transition(ModelStatus::Busy);
        }
        self.active.send_replace(record.active_requests);
        Ok((handle, self.shutdown.child_token()))
    }

    /// Releases one request. `f` folds the request's outcome into the record
    /// within the same exclusive section.
    pub fn end_request(&self, f: impl FnOnce(&mut LoadedModel)) {
        let mut record = lock(&self.record);
        record.active_requests = record.active_requests.saturating_sub(1);
        record.last_used_at = chrono::Utc::now();
        f(&mut record);
        if record.active_requests == 0 && record.status == ModelStatus::Busy {
            record.transition(ModelStatus::Ready);
        }
        self.active.send_replace(record.active_requests);
    }

    /// Waits for the model's single permit when its backend serializes requests.
    pub async fn acquire_gate(&self) -> Option<OwnedSemaphorePermit> {
        match &self.gate {
            Some(gate) => Arc::clone(gate).acquire_owned().await.ok(),
            None => None,
        }
    }

    /// Marks the model `Unloading`, refuses new requests, and cancels the running ones.
    /// Returns false if the model was already unloading.
    pub fn begin_unload(&self) -> bool {
        let first = self.update(|record| {
            if record.status == ModelStatus::Unloading {
                false
            } else {
                record.status = ModelStatus::Unloading;
                true
            }
        });
        self.shutdown.cancel();
        if let Some(gate) = &self.gate {
            gate.close();
        }
        first
    }

    pub fn is_unloading(&self) -> bool {
        self.status() == ModelStatus::Unloading
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|active| *active == 0).await;
    }
}

/// Set of registered models plus the active-model pointer.
///
/// Membership changes go through the registry's write lock; per-model fields
/// go through each slot's own lock.
#[derive(Default)]
pub struct ModelRegistry {
    slots: RwLock<HashMap<String, Arc<ModelSlot>>>,
    active: Mutex<Option<String>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, model_id: &str) -> Option<Arc<ModelSlot>> {
        self.slots.read().await.get(model_id).cloned()
    }

    pub async fn insert(&self, model_id: &str, slot: Arc<ModelSlot>) -> Option<Arc<ModelSlot>> {
        self.slots.write().await.insert(model_id.to_string(), slot)
    }

    /// Removes the entry only if it is still the given instance.
    pub async fn remove_instance(&self, model_id: &str, instance_id: &str) -> bool {
        let mut slots = self.slots.write().await;
        let matches = slots
            .get(model_id)
            .is_some_and(|slot| slot.instance_id() == instance_id);
        if matches {
            slots.remove(model_id);
        }
        matches
    }

    pub async fn slots(&self) -> Vec<Arc<ModelSlot>> {
        self.slots.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.slots.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Models currently serving or able to serve.
    pub async fn loaded_count(&self) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.status().accepts_requests())
            .count()
    }

    pub fn active(&self) -> Option<String> {
        lock(&self.active).clone()
    }

    /// Swaps the active pointer, returning the previous value.
    pub fn set_active(&self, model_id: Option<String>) -> Option<String> {
        std::mem::replace(&mut *lock(&self.active), model_id)
    }

    /// Clears the active pointer if it names `model_id`.
    pub fn clear_active_if(&self, model_id: &str) -> bool {
        let mut active = lock(&self.active);
        if active.as_deref() == Some(model_id) {
            *active = None;
            true
        } else {
            false
        }
    }
}
