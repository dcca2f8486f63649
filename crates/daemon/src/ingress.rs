//! Event ingress: disc notifications feeding the scheduler.
//!
//! Transports (udev rules, pollers, a webhook) are outside this crate; they
//! deliver through [`Ingress`], which tolerates at-least-once delivery: a
//! repeated ready event for a device with an active job is dropped at the
//! store's duplicate check.

use tokio::sync::mpsc;

/// A notification about an optical drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscEvent {
    /// A disc became readable in the given device.
    DeviceReady(String),
    /// The device disappeared or the disc was pulled.
    DeviceRemoved(String),
}

/// Sending side of the ingress channel, handed to event transports.
#[derive(Clone)]
pub struct Ingress {
    tx: mpsc::Sender<DiscEvent>,
}

impl Ingress {
    pub fn new(tx: mpsc::Sender<DiscEvent>) -> Self {
        Self { tx }
    }

    /// Report a readable disc. Returns false if the scheduler is gone.
    pub async fn device_ready(&self, device: &str) -> bool {
        self.tx
            .send(DiscEvent::DeviceReady(device.to_string()))
            .await
            .is_ok()
    }

    /// Report a removed device. Returns false if the scheduler is gone.
    pub async fn device_removed(&self, device: &str) -> bool {
        self.tx
            .send(DiscEvent::DeviceRemoved(device.to_string()))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let ingress = Ingress::new(tx);

        assert!(ingress.device_ready("/dev/sr0").await);
        assert!(ingress.device_removed("/dev/sr0").await);

        assert_eq!(
            rx.recv().await,
            Some(DiscEvent::DeviceReady("/dev/sr0".to_string()))
        );
        assert_eq!(
            rx.recv().await,
            Some(DiscEvent::DeviceRemoved("/dev/sr0".to_string()))
        );
    }

    #[tokio::test]
    async fn test_send_after_scheduler_gone() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let ingress = Ingress::new(tx);
        assert!(!ingress.device_ready("/dev/sr0").await);
    }
}
