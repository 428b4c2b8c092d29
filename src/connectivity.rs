use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::LinkQuality;

/// Transition observed by the [`ConnectivityMonitor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
    LinkQualityChanged(LinkQuality),
}

type Listener = Arc<dyn Fn(&ConnectivityEvent) + Send + Sync>;

struct MonitorState {
    online: bool,
    link_quality: LinkQuality,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

/// Tracks host-reported connectivity and notifies subscribers on change.
///
/// The host (or a test) feeds signals in through [`set_online`] and
/// [`set_link_quality`]; listeners fire only on actual transitions.
///
/// [`set_online`]: ConnectivityMonitor::set_online
/// [`set_link_quality`]: ConnectivityMonitor::set_link_quality
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<Mutex<MonitorState>>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ConnectivityMonitor")
            .field("online", &state.online)
            .field("link_quality", &state.link_quality)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                online,
                link_quality: LinkQuality::Unknown,
                listeners: Vec::new(),
                next_listener_id: 0,
            })),
        }
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn link_quality(&self) -> LinkQuality {
        self.lock().link_quality
    }

    /// Records the host's online state.
    pub fn set_online(&self, online: bool) {
        {
            let mut state = self.lock();
            if state.online == online {
                return;
            }
            state.online = online;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(online, "network connectivity changed");

        self.emit(if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        });
    }

    /// Records the host's link-quality hint.
    pub fn set_link_quality(&self, quality: LinkQuality) {
        {
            let mut state = self.lock();
            if state.link_quality == quality {
                return;
            }
            state.link_quality = quality;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(?quality, "link quality changed");

        self.emit(ConnectivityEvent::LinkQualityChanged(quality));
    }

    /// Registers `handler` for every subsequent transition.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped or [`Subscription::unsubscribe`] is called.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectivityEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.listeners.push((id, Arc::new(handler)));
        Subscription {
            state: Arc::downgrade(&self.state),
            id,
        }
    }

    fn emit(&self, event: ConnectivityEvent) {
        // Listeners run outside the lock so they may query the monitor.
        let listeners: Vec<Listener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for a registered connectivity listener.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    state: Weak<Mutex<MonitorState>>,
    id: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
