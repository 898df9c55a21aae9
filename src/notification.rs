//! Listeners notified on decisions, conversions and configuration updates.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};

use crate::{
    datafile::{Experiment, Variation},
    event::{EventRecord, EventTags},
    Attributes,
};

/// Identifies a registered listener. Returned by the `add_*_listener` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    /// A user was exposed to an experiment variation and an impression was sent.
    Activate,
    /// A conversion event was sent.
    Track,
    /// A new datafile was published.
    ConfigUpdate,
}

#[derive(Debug)]
pub struct ActivateNotification<'a> {
    pub experiment: &'a Experiment,
    pub user_id: &'a str,
    pub attributes: &'a Attributes,
    pub variation: &'a Variation,
    /// Impression handed to the event pipeline.
    pub event: &'a EventRecord,
}

#[derive(Debug)]
pub struct TrackNotification<'a> {
    pub event_key: &'a str,
    pub user_id: &'a str,
    pub attributes: &'a Attributes,
    pub tags: &'a EventTags,
    /// Conversion handed to the event pipeline.
    pub event: &'a EventRecord,
}

#[derive(Debug)]
pub struct ConfigUpdateNotification<'a> {
    pub revision: &'a str,
    /// Revision of the replaced datafile, if any.
    pub previous_revision: Option<&'a str>,
}

pub trait ActivateListener {
    fn on_activate(&self, notification: &ActivateNotification<'_>);
}

pub trait TrackListener {
    fn on_track(&self, notification: &TrackNotification<'_>);
}

pub trait ConfigUpdateListener {
    fn on_config_update(&self, notification: &ConfigUpdateNotification<'_>);
}

impl<T: Fn(&ActivateNotification<'_>)> ActivateListener for T {
    fn on_activate(&self, notification: &ActivateNotification<'_>) {
        self(notification);
    }
}

impl<T: Fn(&TrackNotification<'_>)> TrackListener for T {
    fn on_track(&self, notification: &TrackNotification<'_>) {
        self(notification);
    }
}

impl<T: Fn(&ConfigUpdateNotification<'_>)> ConfigUpdateListener for T {
    fn on_config_update(&self, notification: &ConfigUpdateNotification<'_>) {
        self(notification);
    }
}

#[derive(Clone)]
enum Listener {
    Activate(Arc<dyn ActivateListener + Send + Sync>),
    Track(Arc<dyn TrackListener + Send + Sync>),
    ConfigUpdate(Arc<dyn ConfigUpdateListener + Send + Sync>),
}

impl Listener {
    fn notification_type(&self) -> NotificationType {
        match self {
            Listener::Activate(_) => NotificationType::Activate,
            Listener::Track(_) => NotificationType::Track,
            Listener::ConfigUpdate(_) => NotificationType::ConfigUpdate,
        }
    }
}

/// Registry of notification listeners.
///
/// Listeners are called synchronously on the thread that triggered the notification, in the order
/// they were added. A panicking listener is logged and does not affect the other listeners or the
/// caller.
#[derive(Default)]
pub struct NotificationCenter {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(NotificationId, Listener)>>,
}

impl NotificationCenter {
    pub fn new() -> NotificationCenter {
        NotificationCenter::default()
    }

    pub fn add_activate_listener(
        &self,
        listener: impl ActivateListener + Send + Sync + 'static,
    ) -> NotificationId {
        self.add(Listener::Activate(Arc::new(listener)))
    }

    pub fn add_track_listener(
        &self,
        listener: impl TrackListener + Send + Sync + 'static,
    ) -> NotificationId {
        self.add(Listener::Track(Arc::new(listener)))
    }

    pub fn add_config_update_listener(
        &self,
        listener: impl ConfigUpdateListener + Send + Sync + 'static,
    ) -> NotificationId {
        self.add(Listener::ConfigUpdate(Arc::new(listener)))
    }

    /// Remove the listener with `id`. Returns `false` if there was no such listener.
    pub fn remove_listener(&self, id: NotificationId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Remove all listeners of the given type.
    pub fn clear_listeners(&self, notification_type: NotificationType) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, listener)| listener.notification_type() != notification_type);
    }

    pub fn clear_all_listeners(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn notify_activate(&self, notification: &ActivateNotification<'_>) {
        for listener in self.snapshot(NotificationType::Activate) {
            if let Listener::Activate(listener) = listener {
                guarded(NotificationType::Activate, || listener.on_activate(notification));
            }
        }
    }

    pub(crate) fn notify_track(&self, notification: &TrackNotification<'_>) {
        for listener in self.snapshot(NotificationType::Track) {
            if let Listener::Track(listener) = listener {
                guarded(NotificationType::Track, || listener.on_track(notification));
            }
        }
    }

    pub(crate) fn notify_config_update(&self, notification: &ConfigUpdateNotification<'_>) {
        for listener in self.snapshot(NotificationType::ConfigUpdate) {
            if let Listener::ConfigUpdate(listener) = listener {
                guarded(NotificationType::ConfigUpdate, || {
                    listener.on_config_update(notification)
                });
            }
        }
    }

    fn add(&self, listener: Listener) -> NotificationId {
        let id = NotificationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Listeners are cloned out so that a listener may add or remove listeners without
    /// deadlocking.
    fn snapshot(&self, notification_type: NotificationType) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, listener)| listener.notification_type() == notification_type)
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

fn guarded(notification_type: NotificationType, f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        log::error!(target: "splitkit",
                    notification_type:debug = notification_type;
                    "notification listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn config_update(center: &NotificationCenter, revision: &str) {
        center.notify_config_update(&ConfigUpdateNotification {
            revision,
            previous_revision: None,
        });
    }

    #[test]
    fn listeners_are_called_in_order() {
        let center = NotificationCenter::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let calls = calls.clone();
            center.add_config_update_listener(move |n: &ConfigUpdateNotification<'_>| {
                calls.lock().unwrap().push(format!("{name}:{}", n.revision));
            });
        }

        config_update(&center, "7");

        assert_eq!(*calls.lock().unwrap(), ["first:7", "second:7"]);
    }

    #[test]
    fn remove_and_clear() {
        let center = NotificationCenter::new();
        let count = Arc::new(Mutex::new(0));
        let add = |center: &NotificationCenter| {
            let count = count.clone();
            center.add_config_update_listener(move |_: &ConfigUpdateNotification<'_>| {
                *count.lock().unwrap() += 1;
            })
        };

        let first = add(&center);
        add(&center);
        assert!(center.remove_listener(first));
        assert!(!center.remove_listener(first));
        config_update(&center, "1");
        assert_eq!(*count.lock().unwrap(), 1);

        center.clear_listeners(NotificationType::Track);
        config_update(&center, "2");
        assert_eq!(*count.lock().unwrap(), 2);

        center.clear_listeners(NotificationType::ConfigUpdate);
        config_update(&center, "3");
        assert_eq!(*count.lock().unwrap(), 2);

        add(&center);
        center.clear_all_listeners();
        config_update(&center, "4");
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let center = NotificationCenter::new();
        let called = Arc::new(Mutex::new(false));
        center.add_config_update_listener(|_: &ConfigUpdateNotification<'_>| panic!("boom"));
        {
            let called = called.clone();
            center.add_config_update_listener(move |_: &ConfigUpdateNotification<'_>| {
                *called.lock().unwrap() = true;
            });
        }

        config_update(&center, "1");

        assert!(*called.lock().unwrap());
    }
}
