//! Instruction id generation.

use rand::Rng;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of generated instruction ids.
pub const ID_LEN: usize = 10;

/// Random base-36 id of [`ID_LEN`] characters.
///
/// Used wherever a protocol line omits an explicit `{id}`. Explicit ids are
/// reused verbatim so a later instruction can replace an earlier element.
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}
