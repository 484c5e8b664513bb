use crate::client::ProjectData;

/// Receives the freshly resolved project data after every mutating engine call.
///
/// Implemented for closures:
/// ```
/// # use abby::{ProjectConfig, StoragePorts};
/// let mut abby = ProjectConfig::new("project-id").to_engine(StoragePorts::noop());
/// let subscription = abby.subscribe(|data: &abby::ProjectData| {
///     println!("{:?}", data.flags);
/// });
/// abby.unsubscribe(subscription);
/// ```
pub trait Listener {
    /// Called synchronously with the resolved state.
    fn on_change(&self, data: &ProjectData);
}

impl<T: Fn(&ProjectData)> Listener for T {
    fn on_change(&self, data: &ProjectData) {
        self(data);
    }
}

/// Opaque handle returned by [`Abby::subscribe`](crate::Abby::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(pub(crate) u64);

/// Registered listeners, in subscription order.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: Vec<(Subscription, Box<dyn Listener + Send + Sync>)>,
}

impl Listeners {
    pub fn add(&mut self, listener: Box<dyn Listener + Send + Sync>) -> Subscription {
        let subscription = Subscription(self.next_id);
        self.next_id += 1;
        self.entries.push((subscription, listener));
        subscription
    }

    /// Returns `false` if the subscription was already removed.
    pub fn remove(&mut self, subscription: Subscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(s, _)| *s != subscription);
        self.entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notify(&self, data: &ProjectData) {
        for (_, listener) in &self.entries {
            listener.on_change(data);
        }
    }
}
