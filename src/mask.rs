/// Generate a random frame mask. A fresh key is drawn from the thread RNG for
/// every client frame.
#[inline]
pub(crate) fn generate_mask() -> [u8; 4] {
    rand::random()
}

/// XOR `buf` against `mask`, starting `offset` bytes into the key, and return
/// the offset to continue from. The returned offset lets a single frame's
/// payload be masked or unmasked across several reads without losing the key
/// alignment.
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: u8) -> u8 {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(offset as usize + i) & 3];
    }
    ((offset as usize + buf.len()) & 3) as u8
}
