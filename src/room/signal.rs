#![forbid(unsafe_code)]

// Signaling relay - targeted or room-wide forwarding of opaque WebRTC
// negotiation payloads. Pure relay: no offer/answer state machine lives
// here; sequencing correctness belongs to the two peers.

use super::RoomRegistry;
use crate::signaling::protocol::ServerMessage;
use tracing::debug;

impl RoomRegistry {
    /// Forwards a signaling frame within a room.
    ///
    /// With a recipient name the frame goes to every connection currently
    /// bound to that name; a stale name reaches nobody and the frame is
    /// dropped silently. Without a recipient it goes to every member except
    /// the sender's connection.
    pub async fn relay_signal(
        &self,
        room_id: &str,
        sender_conn: &str,
        to: Option<&str>,
        message: &ServerMessage,
    ) {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("Signal for unknown room {}, dropping", room_id);
            self.metrics.inc_events_dropped();
            return;
        };
        let room = room_lock.read().await;
        match to {
            Some(name) => {
                let delivered = room.send_to_name(name, message);
                if delivered == 0 {
                    debug!("No connection named {} in room {}, signal dropped", name, room_id);
                } else {
                    self.metrics.inc_signals_relayed();
                }
            }
            None => {
                room.broadcast_except(sender_conn, message);
                self.metrics.inc_signals_relayed();
            }
        }
    }
}
