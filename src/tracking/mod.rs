//! Turns IMU samples from tracker boards into virtual-camera poses.

pub mod camera;
pub mod history;
pub mod imu;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::error::TrackingError;
use crate::net::connection::{ConnectionId, Message};
use crate::net::delivery::Delivery;

pub use camera::{CameraBinding, CameraRig, Pose, TrackingSettings};
pub use history::MessageHistory;
pub use imu::{parse_message, ImuSample, InboundMessage, TestMessage};

/// What a status panel shows about the board connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub peer_ip: Option<IpAddr>,
    pub status: String,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            peer_ip: None,
            status: "Not connected".to_string(),
        }
    }
}

/// Application state fed from the delivery queue.
#[derive(Debug, Default)]
pub struct Tracker {
    pub settings: TrackingSettings,
    pub rig: CameraRig,
    pub history: MessageHistory,
    pub status: ConnectionStatus,
    clients: HashMap<ConnectionId, SocketAddr>,
}

impl Tracker {
    pub fn new(settings: TrackingSettings, rig: CameraRig) -> Self {
        Self {
            settings,
            rig,
            ..Self::default()
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Applies one event. Returns the cameras moved by it, if any.
    pub fn handle(&mut self, delivery: Delivery) -> Vec<String> {
        match delivery {
            Delivery::Connected { id, peer } => {
                self.clients.insert(id, peer);
                self.status = ConnectionStatus {
                    connected: true,
                    peer_ip: Some(peer.ip()),
                    status: format!("Connected to {}", peer.ip()),
                };
                Vec::new()
            }
            Delivery::Message {
                id,
                message: Message::Text(text),
            } => match self.process_text(&text) {
                Ok(moved) => moved,
                Err(e) => {
                    log::warn!("{} {}: {:.100}", id, e, text);
                    Vec::new()
                }
            },
            Delivery::Message {
                id,
                message: Message::Binary(payload),
            } => {
                log::debug!("{} ignoring {} byte binary message", id, payload.len());
                Vec::new()
            }
            Delivery::Disconnected { id } => {
                self.clients.remove(&id);
                if self.clients.is_empty() {
                    self.status = ConnectionStatus {
                        status: "Disconnected".to_string(),
                        ..ConnectionStatus::default()
                    };
                }
                Vec::new()
            }
        }
    }

    /// Records a text message and applies it if it is an IMU sample.
    pub fn process_text(&mut self, text: &str) -> Result<Vec<String>, TrackingError> {
        self.history.push(text);
        match parse_message(text)? {
            InboundMessage::Imu(sample) => Ok(self.rig.apply(&self.settings, &sample)),
            InboundMessage::Other { kind } => {
                log::debug!("ignoring message of type {:?}", kind);
                Ok(Vec::new())
            }
        }
    }

    pub fn server_stopped(&mut self) {
        self.clients.clear();
        self.status = ConnectionStatus {
            status: "Server stopped".to_string(),
            ..ConnectionStatus::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Tracker {
        let mut rig = CameraRig::new();
        rig.add_camera("Camera");
        let settings = TrackingSettings {
            target_camera: Some("Camera".into()),
            ..TrackingSettings::default()
        };
        Tracker::new(settings, rig)
    }

    fn text(id: u64, body: &str) -> Delivery {
        Delivery::Message {
            id: ConnectionId(id),
            message: Message::Text(body.to_string()),
        }
    }

    #[test]
    fn status_follows_clients() {
        let mut tracker = tracker();
        let peer: SocketAddr = "192.168.4.20:50000".parse().unwrap();
        tracker.handle(Delivery::Connected { id: ConnectionId(2), peer });
        tracker.handle(Delivery::Connected { id: ConnectionId(3), peer });
        assert!(tracker.status.connected);
        assert_eq!(tracker.status.status, "Connected to 192.168.4.20");

        tracker.handle(Delivery::Disconnected { id: ConnectionId(2) });
        assert!(tracker.status.connected);
        tracker.handle(Delivery::Disconnected { id: ConnectionId(3) });
        assert!(!tracker.status.connected);
        assert_eq!(tracker.status.peer_ip, None);
        assert_eq!(tracker.status.status, "Disconnected");

        tracker.server_stopped();
        assert_eq!(tracker.status.status, "Server stopped");
    }

    #[test]
    fn imu_message_moves_camera_and_is_logged() {
        let mut tracker = tracker();
        let moved = tracker.handle(text(
            2,
            r#"{"type":"IMU","rot_x":0,"rot_y":0,"rot_z":90,"loc_x":1,"loc_y":1,"loc_z":1}"#,
        ));
        assert_eq!(moved, vec!["Camera".to_string()]);
        let pose = tracker.rig.pose("Camera").unwrap();
        assert!((pose.rotation[2] - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert_eq!(tracker.history.len(), 1);
    }

    #[test]
    fn bad_json_still_recorded() {
        let mut tracker = tracker();
        assert!(tracker.handle(text(2, "{oops")).is_empty());
        assert_eq!(tracker.history.last_message(), Some("{oops"));
        assert!(matches!(
            tracker.process_text("nope"),
            Err(TrackingError::InvalidJson(_))
        ));
    }
}
