/// XORs `payload` in place with the repeating 4-byte `mask_key`.
///
/// Applying the same key twice restores the original bytes.
pub fn mask(payload: &mut [u8], mask_key: [u8; 4]) {
    let mut chunks = payload.chunks_exact_mut(4);
    for chunk in &mut chunks {
        for (b, k) in chunk.iter_mut().zip(mask_key) {
            *b ^= k;
        }
    }
    for (b, k) in chunks.into_remainder().iter_mut().zip(mask_key) {
        *b ^= k;
    }
}
