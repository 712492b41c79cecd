//! Ephemeral notifications with an explicit subscribe/unsubscribe lifecycle.

use log::debug;
use std::collections::BTreeMap;
use std::sync::{ Arc, Mutex, MutexGuard };
use std::time::Duration;

pub const DEFAULT_DURATION: Duration = Duration::from_millis(3000);
pub const REMOVE_AFTER_HIDE: Duration = Duration::from_millis(300);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Variant {
    #[default]
    Default,
    Destructive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toast {
    pub id: ToastId,
    pub title: String,
    pub description: Option<String>,
    pub variant: Variant,
    pub visible: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ToastId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&[Toast]) + Send + Sync>;

#[derive(Default)]
struct Inner {
    toasts: Vec<Toast>,
    listeners: BTreeMap<SubscriptionId, Listener>,
    next_toast: u64,
    next_subscription: u64,
}

/// Cloneable handle; all clones share one toast list and listener table.
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Arc<Mutex<Inner>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `listener`; it immediately receives the current toasts.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
        where F: Fn(&[Toast]) + Send + Sync + 'static
    {
        let listener: Listener = Arc::new(listener);
        let (id, snapshot) = {
            let mut inner = self.lock();
            let id = SubscriptionId(inner.next_subscription);
            inner.next_subscription += 1;
            inner.listeners.insert(id, listener.clone());
            (id, inner.toasts.clone())
        };
        listener(&snapshot);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().listeners.remove(&id).is_some()
    }

    pub fn toasts(&self) -> Vec<Toast> {
        self.lock().toasts.clone()
    }

    /// Shows a toast for [`DEFAULT_DURATION`]. Must be called inside a
    /// tokio runtime.
    pub fn notify(
        &self,
        title: impl Into<String>,
        description: Option<String>,
        variant: Variant
    ) -> ToastId {
        self.notify_for(title, description, variant, DEFAULT_DURATION)
    }

    fn add(&self, title: String, description: Option<String>, variant: Variant) -> ToastId {
        let id = {
            let mut inner = self.lock();
            let id = ToastId(inner.next_toast);
            inner.next_toast += 1;
            inner.toasts.push(Toast {
                id,
                title,
                description,
                variant,
                visible: true,
            });
            id
        };
        self.publish();
        id
    }

    /// Shows a toast, hides it after `duration` and removes it
    /// [`REMOVE_AFTER_HIDE`] later. Must be called inside a tokio runtime.
    pub fn notify_for(
        &self,
        title: impl Into<String>,
        description: Option<String>,
        variant: Variant,
        duration: Duration
    ) -> ToastId {
        let id = self.add(title.into(), description, variant);
        let notifier = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            notifier.dismiss(id);
            tokio::time::sleep(REMOVE_AFTER_HIDE).await;
            notifier.remove(id);
        });
        id
    }

    /// Marks a toast hidden. Unknown ids are ignored.
    pub fn dismiss(&self, id: ToastId) {
        let changed = {
            let mut inner = self.lock();
            match inner.toasts.iter_mut().find(|t| t.id == id) {
                Some(toast) if toast.visible => {
                    toast.visible = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.publish();
        }
    }

    pub fn remove(&self, id: ToastId) {
        let changed = {
            let mut inner = self.lock();
            let before = inner.toasts.len();
            inner.toasts.retain(|t| t.id != id);
            inner.toasts.len() != before
        };
        if changed {
            self.publish();
        }
    }

    fn publish(&self) {
        // Listeners run outside the lock so they may call back into the notifier.
        let (listeners, snapshot): (Vec<Listener>, Vec<Toast>) = {
            let inner = self.lock();
            (inner.listeners.values().cloned().collect(), inner.toasts.clone())
        };
        debug!("Publishing {} toasts to {} listeners", snapshot.len(), listeners.len());
        for listener in listeners {
            listener(&snapshot);
        }
    }
}
