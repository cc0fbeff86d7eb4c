/// XORs `buf` with the repeating 4-byte masking key, word by word.
///
/// Masking is its own inverse: applying the same key twice restores the input.
#[inline]
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(word);
        word.copy_from_slice(&(u32::from_ne_bytes(bytes) ^ key).to_ne_bytes());
    }

    // the tail starts on a multiple of 4, so the key restarts at its first byte
    for (byte, key) in words.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}
