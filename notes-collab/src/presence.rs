//! Cursor and selection presence for connected sessions.
//!
//! Each live session on a note owns one [`PresenceEntry`]. Entries are
//! created on join, updated on every `presence` message and removed when
//! the session leaves. Colors are derived from the user id so the same
//! user keeps the same color across sessions and restarts.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Color
// ───────────────────────────────────────────────────────────────────

/// 8-bit RGB color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a UUID.
    ///
    /// Hue comes from the UUID bits; saturation and lightness are fixed so
    /// every cursor stays vivid on a light background.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
        Self {
            r: to_channel(r),
            g: to_channel(g),
            b: to_channel(b),
        }
    }

    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `#rrggbb` form used on the wire.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self::rgb(0x42, 0x85, 0xf4)
    }
}

impl fmt::Display for CursorColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// HSL to RGB conversion helper.
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
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
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
// Entries
// ───────────────────────────────────────────────────────────────────

/// Cursor and selection as reported by a client, in character offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceCursor {
    pub cursor_pos: usize,
    pub selection_start: usize,
    pub selection_end: usize,
}

impl PresenceCursor {
    pub fn at(cursor_pos: usize) -> Self {
        Self {
            cursor_pos,
            selection_start: cursor_pos,
            selection_end: cursor_pos,
        }
    }

    pub fn has_selection(&self) -> bool {
        self.selection_start != self.selection_end
    }
}

/// Presence row for one connected session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub note_id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    /// `#rrggbb`, fixed for the lifetime of the session.
    pub color: String,
    pub cursor_pos: usize,
    pub selection_start: usize,
    pub selection_end: usize,
}

impl PresenceEntry {
    /// Fresh entry for a joining session, cursor at the start of the note.
    pub fn new(note_id: Uuid, session_id: Uuid, user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            note_id,
            session_id,
            user_id,
            username: username.into(),
            color: CursorColor::from_uuid(user_id).to_hex(),
            cursor_pos: 0,
            selection_start: 0,
            selection_end: 0,
        }
    }

    pub fn cursor(&self) -> PresenceCursor {
        PresenceCursor {
            cursor_pos: self.cursor_pos,
            selection_start: self.selection_start,
            selection_end: self.selection_end,
        }
    }

    /// Move the cursor. The color is never touched.
    pub fn set_cursor(&mut self, cursor: PresenceCursor) {
        self.cursor_pos = cursor.cursor_pos;
        self.selection_start = cursor.selection_start;
        self.selection_end = cursor.selection_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_stable_for_same_user() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
    }

    #[test]
    fn test_color_hex_format() {
        assert_eq!(CursorColor::rgb(0, 255, 16).to_hex(), "#00ff10");

        let hex = CursorColor::from_uuid(Uuid::new_v4()).to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
        assert!(hex[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_primary_hues() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 1e-5 && g.abs() < 1e-5 && b.abs() < 1e-5);

        let (r, g, b) = hsl_to_rgb(1.0 / 3.0, 1.0, 0.5);
        assert!(r.abs() < 1e-5 && (g - 1.0).abs() < 1e-5 && b.abs() < 1e-5);
    }

    #[test]
    fn test_hsl_achromatic() {
        assert_eq!(hsl_to_rgb(0.4, 0.0, 0.25), (0.25, 0.25, 0.25));
    }

    #[test]
    fn test_entry_new_defaults() {
        let user = Uuid::new_v4();
        let entry = PresenceEntry::new(Uuid::new_v4(), Uuid::new_v4(), user, "alice");
        assert_eq!(entry.username, "alice");
        assert_eq!(entry.color, CursorColor::from_uuid(user).to_hex());
        assert_eq!(entry.cursor(), PresenceCursor::default());
    }

    #[test]
    fn test_set_cursor_keeps_color() {
        let mut entry = PresenceEntry::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "bob");
        let color = entry.color.clone();

        entry.set_cursor(PresenceCursor {
            cursor_pos: 12,
            selection_start: 4,
            selection_end: 12,
        });

        assert_eq!(entry.cursor_pos, 12);
        assert!(entry.cursor().has_selection());
        assert_eq!(entry.color, color);
    }

    #[test]
    fn test_cursor_at_has_no_selection() {
        let cursor = PresenceCursor::at(7);
        assert_eq!(cursor.selection_start, 7);
        assert!(!cursor.has_selection());
    }
}
