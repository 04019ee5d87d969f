//! services/progress_publisher.rs
//! Publicación fire-and-forget de eventos de progreso (broadcast de tokio).

use tokio::sync::broadcast;

use crate::models::progress_model::DispatchEvent;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct ProgressPublisher {
    sender: broadcast::Sender<DispatchEvent>,
}

impl ProgressPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Nunca bloquea: sin suscriptores el evento se descarta y los
    /// suscriptores lentos pierden los más viejos (`Lagged`).
    pub fn publish(&self, event: DispatchEvent) {
        if let Err(err) = self.sender.send(event) {
            log::trace!(
                "(publish) sin suscriptores, evento {} descartado",
                err.0.name()
            );
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
