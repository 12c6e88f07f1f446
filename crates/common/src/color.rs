// Deterministic per-user color assignment.
//
// Colors are cosmetic. Two users may share a color; the same user always
// gets the same color, across reconnects and across clients.

use sha2::{Digest, Sha256};

use crate::types::UserId;

/// Fixed display palette (hex, lowercase).
pub const PALETTE: [&str; 12] = [
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#be5046",
    "#7f8cf5", "#f472b6", "#2dd4bf", "#a3e635",
];

/// Map a user id to a palette color.
///
/// Uses the first eight bytes of a SHA-256 digest so the mapping is stable
/// across processes, platforms and releases (unlike `DefaultHasher`).
pub fn color_for_user(user_id: &UserId) -> &'static str {
    PALETTE[palette_index(user_id.as_str())]
}

fn palette_index(value: &str) -> usize {
    let digest = Sha256::digest(value.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % PALETTE.len() as u64) as usize
}

/// Returns true for `#rgb` and `#rrggbb` hex colors.
pub fn is_valid_color(value: &str) -> bool {
    let Some(hex) = value.strip_prefix('#') else {
        return false;
    };
    matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalize a client-supplied color, falling back when it is not a hex color.
pub fn sanitize_color(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(color) if is_valid_color(color) => color.to_ascii_lowercase(),
        _ => fallback.to_owned(),
    }
}
