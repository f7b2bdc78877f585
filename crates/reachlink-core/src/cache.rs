// ── Update cache ──
//
// Latest parsed supplement per device identity, plus the most recent one
// overall for facades bound to a single identity. Readers never block the
// dispatch path.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use reachlink_api::DeviceKey;

pub(crate) struct UpdateCache<T> {
    by_device: DashMap<DeviceKey, Arc<T>>,
    latest: ArcSwapOption<T>,
}

impl<T> Default for UpdateCache<T> {
    fn default() -> Self {
        Self {
            by_device: DashMap::new(),
            latest: ArcSwapOption::empty(),
        }
    }
}

impl<T> UpdateCache<T> {
    pub(crate) fn update(&self, key: DeviceKey, value: Arc<T>) {
        self.latest.store(Some(Arc::clone(&value)));
        self.by_device.insert(key, value);
    }

    pub(crate) fn get(&self, key: &DeviceKey) -> Option<Arc<T>> {
        self.by_device.get(key).map(|v| Arc::clone(v.value()))
    }

    pub(crate) fn latest(&self) -> Option<Arc<T>> {
        self.latest.load_full()
    }

    pub(crate) fn clear(&self) {
        self.by_device.clear();
        self.latest.store(None);
    }
}
