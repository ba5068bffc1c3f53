/*!
In-process provider adapter.

Images live in a map guarded by a mutex. Failures can be queued per instance
or per image so callers can rehearse throttling, timeouts and out-of-band
deletions without a cloud account.
*/

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{Provider, ProviderError, ProviderResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemoryImage {
    instance_id: String,
    name: String,
}

#[derive(Debug, Default)]
struct MemoryProviderState {
    images: BTreeMap<String, MemoryImage>,
    next_id: u64,
    create_failures: HashMap<String, VecDeque<ProviderError>>,
    lost_create_responses: HashMap<String, usize>,
    delete_failures: HashMap<String, VecDeque<ProviderError>>,
    list_failures: VecDeque<ProviderError>,
    create_calls: Vec<String>,
    delete_calls: Vec<String>,
}

/// Provider that keeps images in memory
///
/// Image ids are assigned sequentially as `ami-1`, `ami-2`, ..., skipping
/// ids already taken by inserted images.
///
/// # Example
/// ```rust
/// use snapkeep_core::provider::{MemoryProvider, ProviderError};
///
/// let provider = MemoryProvider::new();
/// provider.fail_create("i-2", ProviderError::transient("request timed out"));
/// assert_eq!(provider.image_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryProviderState>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryProviderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an image that was created outside the engine
    pub fn insert_image(&self, image_id: &str, instance_id: &str, name: &str) {
        self.state().images.insert(
            image_id.to_string(),
            MemoryImage {
                instance_id: instance_id.to_string(),
                name: name.to_string(),
            },
        );
    }

    /// Drop an image behind the engine's back
    pub fn remove_image(&self, image_id: &str) -> bool {
        self.state().images.remove(image_id).is_some()
    }

    /// Queue an error for the next `create_image` call on `instance_id`
    pub fn fail_create(&self, instance_id: &str, error: ProviderError) {
        self.state()
            .create_failures
            .entry(instance_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Make the next create on `instance_id` succeed at the provider while
    /// the caller sees a transient error, as when a response is lost in transit
    pub fn lose_create_response(&self, instance_id: &str) {
        *self
            .state()
            .lost_create_responses
            .entry(instance_id.to_string())
            .or_default() += 1;
    }

    /// Queue an error for the next `delete_image` call on `image_id`
    pub fn fail_delete(&self, image_id: &str, error: ProviderError) {
        self.state()
            .delete_failures
            .entry(image_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Queue an error for the next `list_images` call
    pub fn fail_list(&self, error: ProviderError) {
        self.state().list_failures.push_back(error);
    }

    /// Ids of all images currently held
    pub fn image_ids(&self) -> BTreeSet<String> {
        self.state().images.keys().cloned().collect()
    }

    pub fn image_count(&self) -> usize {
        self.state().images.len()
    }

    /// Instance the image was taken from, if the image exists
    pub fn image_instance(&self, image_id: &str) -> Option<String> {
        self.state()
            .images
            .get(image_id)
            .map(|image| image.instance_id.clone())
    }

    /// Instance ids passed to `create_image`, in call order
    pub fn create_calls(&self) -> Vec<String> {
        self.state().create_calls.clone()
    }

    /// Image ids passed to `delete_image`, in call order
    pub fn delete_calls(&self) -> Vec<String> {
        self.state().delete_calls.clone()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create_image(&self, instance_id: &str, name: &str) -> ProviderResult<String> {
        let mut state = self.state();
        state.create_calls.push(instance_id.to_string());

        if let Some(error) = state
            .create_failures
            .get_mut(instance_id)
            .and_then(VecDeque::pop_front)
        {
            debug!(instance_id, error = %error, "Injected create_image failure");
            return Err(error);
        }

        if state.images.values().any(|image| image.name == name) {
            return Err(ProviderError::permanent(format!(
                "image name '{name}' is already in use"
            )));
        }

        let image_id = loop {
            state.next_id += 1;
            let candidate = format!("ami-{}", state.next_id);
            if !state.images.contains_key(&candidate) {
                break candidate;
            }
        };
        state.images.insert(
            image_id.clone(),
            MemoryImage {
                instance_id: instance_id.to_string(),
                name: name.to_string(),
            },
        );

        if let Some(remaining) = state.lost_create_responses.get_mut(instance_id) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(instance_id, image_id = %image_id, "Dropping create_image response");
                return Err(ProviderError::transient("create_image response lost"));
            }
        }

        Ok(image_id)
    }

    async fn delete_image(&self, image_id: &str) -> ProviderResult<()> {
        let mut state = self.state();
        state.delete_calls.push(image_id.to_string());

        if let Some(error) = state
            .delete_failures
            .get_mut(image_id)
            .and_then(VecDeque::pop_front)
        {
            debug!(image_id, error = %error, "Injected delete_image failure");
            return Err(error);
        }

        match state.images.remove(image_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(format!(
                "image '{image_id}' does not exist"
            ))),
        }
    }

    async fn list_images(&self) -> ProviderResult<BTreeSet<String>> {
        let mut state = self.state();
        if let Some(error) = state.list_failures.pop_front() {
            return Err(error);
        }
        Ok(state.images.keys().cloned().collect())
    }

    async fn find_image_by_name(&self, name: &str) -> ProviderResult<Option<String>> {
        Ok(self
            .state()
            .images
            .iter()
            .find(|(_, image)| image.name == name)
            .map(|(id, _)| id.clone()))
    }
}
