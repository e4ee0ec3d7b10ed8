//! Presence: who is in a document room and which page they are on.
//!
//! ```text
//! local page switch / caret move
//!       │
//!       ▼
//! PresenceRoster::local_focus()  ──►  AwarenessMessage::Focus
//!       │                                   │  (relay broadcast)
//!       ▼                                   ▼
//! PeerIdentity (name + stable colour)   remote PresenceRoster::handle_message()
//! ```
//!
//! Colours are derived from the user id so every replica renders the same
//! user in the same colour without coordination.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use quire_core::model::{PageId, UserId};

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Display identity of a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub user_id: UserId,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
}

impl PeerIdentity {
    pub fn new(user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: PeerColor::from_uuid(user_id).to_hex(),
        }
    }

    /// Identity used for server-side writes (seeding, template expansion).
    pub fn system() -> Self {
        Self::new(Uuid::nil(), "Quire")
    }
}

/// RGB colour in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl PeerColor {
    /// Stable colour from a user id: hue from the id, fixed saturation and
    /// lightness so every colour is readable on a light background.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.45);
        Self { r, g, b }
    }

    pub fn to_hex(&self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Caret position inside a page: top-level block index and character
/// offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caret {
    pub block: u32,
    pub offset: u32,
}

/// Presence messages carried in `SyncMessage` awareness payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Join(PeerIdentity),
    Leave { user_id: UserId },
    /// Page the user is looking at, and the caret if they are typing.
    Focus {
        user_id: UserId,
        page_id: Option<PageId>,
        caret: Option<Caret>,
    },
}

impl AwarenessMessage {
    pub fn user_id(&self) -> UserId {
        match self {
            AwarenessMessage::Join(identity) => identity.user_id,
            AwarenessMessage::Leave { user_id } | AwarenessMessage::Focus { user_id, .. } => {
                *user_id
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(msg, _)| msg)
            .map_err(|e| e.to_string())
    }
}

// ───────────────────────────────────────────────────────────────────
// Roster
// ───────────────────────────────────────────────────────────────────

/// Last known state of a remote collaborator.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub identity: PeerIdentity,
    pub page_id: Option<PageId>,
    pub caret: Option<Caret>,
    last_seen: Instant,
}

impl RemotePeer {
    fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            page_id: None,
            caret: None,
            last_seen: Instant::now(),
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Remote collaborators of one document room, as seen by the local user.
pub struct PresenceRoster {
    local: PeerIdentity,
    peers: HashMap<UserId, RemotePeer>,
    idle_timeout: Duration,
}

impl PresenceRoster {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join(self.local.clone())
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave { user_id: self.local.user_id }
    }

    pub fn local_focus(&self, page_id: Option<PageId>, caret: Option<Caret>) -> AwarenessMessage {
        AwarenessMessage::Focus {
            user_id: self.local.user_id,
            page_id,
            caret,
        }
    }

    /// Apply a remote presence message. Our own messages are ignored.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) {
        if msg.user_id() == self.local.user_id {
            return;
        }

        match msg {
            AwarenessMessage::Join(identity) => {
                self.peers
                    .insert(identity.user_id, RemotePeer::new(identity.clone()));
            }
            AwarenessMessage::Leave { user_id } => {
                self.peers.remove(user_id);
            }
            AwarenessMessage::Focus { user_id, page_id, caret } => {
                // A focus from an unknown peer means they joined before us.
                let peer = self.peers.entry(*user_id).or_insert_with(|| {
                    let short = &user_id.simple().to_string()[..8];
                    RemotePeer::new(PeerIdentity::new(*user_id, format!("Peer-{short}")))
                });
                peer.page_id = *page_id;
                peer.caret = *caret;
                peer.last_seen = Instant::now();
            }
        }
    }

    pub fn peer(&self, user_id: &UserId) -> Option<&RemotePeer> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote peers currently on the given page.
    pub fn peers_on_page(&self, page_id: PageId) -> Vec<&RemotePeer> {
        self.peers
            .values()
            .filter(|p| p.page_id == Some(page_id))
            .collect()
    }

    /// Drop peers that have been silent longer than the idle timeout.
    pub fn cleanup_idle(&mut self) -> Vec<UserId> {
        let timeout = self.idle_timeout;
        let idle: Vec<UserId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            self.peers.remove(id);
        }
        idle
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_stable_per_user() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = PeerIdentity::new(id, "Ada");
        let b = PeerIdentity::new(id, "Ada (laptop)");
        assert_eq!(a.color, b.color);
        assert_eq!(a.color.len(), 7);
        assert!(a.color.starts_with('#'));
    }

    #[test]
    fn test_hex_encoding() {
        let white = PeerColor { r: 1.0, g: 1.0, b: 1.0 };
        assert_eq!(white.to_hex(), "#ffffff");
        let clamped = PeerColor { r: 2.0, g: -1.0, b: 0.0 };
        assert_eq!(clamped.to_hex(), "#ff0000");
    }

    #[test]
    fn test_awareness_roundtrip() {
        let msg = AwarenessMessage::Focus {
            user_id: Uuid::new_v4(),
            page_id: Some(Uuid::new_v4()),
            caret: Some(Caret { block: 2, offset: 5 }),
        };
        let decoded = AwarenessMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(AwarenessMessage::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_roster_join_focus_leave() {
        let local = PeerIdentity::new(Uuid::new_v4(), "Local");
        let mut roster = PresenceRoster::new(local.clone());
        let remote = PeerIdentity::new(Uuid::new_v4(), "Remote");
        let page = Uuid::new_v4();

        roster.handle_message(&AwarenessMessage::Join(remote.clone()));
        roster.handle_message(&AwarenessMessage::Focus {
            user_id: remote.user_id,
            page_id: Some(page),
            caret: None,
        });
        assert_eq!(roster.peer_count(), 1);
        assert_eq!(roster.peers_on_page(page).len(), 1);
        assert_eq!(roster.peer(&remote.user_id).unwrap().identity.name, "Remote");

        roster.handle_message(&AwarenessMessage::Leave { user_id: remote.user_id });
        assert_eq!(roster.peer_count(), 0);
    }

    #[test]
    fn test_roster_ignores_self_and_adopts_unknown() {
        let local = PeerIdentity::new(Uuid::new_v4(), "Local");
        let mut roster = PresenceRoster::new(local.clone());
        roster.handle_message(&roster.local_focus(None, None));
        assert_eq!(roster.peer_count(), 0);

        let stranger = Uuid::new_v4();
        roster.handle_message(&AwarenessMessage::Focus {
            user_id: stranger,
            page_id: None,
            caret: None,
        });
        assert!(roster.peer(&stranger).unwrap().identity.name.starts_with("Peer-"));
    }

    #[test]
    fn test_cleanup_idle() {
        let mut roster = PresenceRoster::new(PeerIdentity::new(Uuid::new_v4(), "Local"));
        roster.set_idle_timeout(Duration::ZERO);
        roster.handle_message(&AwarenessMessage::Join(PeerIdentity::new(Uuid::new_v4(), "R")));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(roster.cleanup_idle().len(), 1);
        assert_eq!(roster.peer_count(), 0);
    }
}
