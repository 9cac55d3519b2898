use rand::RngCore;

/// Random 32-hex-char identifier, used for realtime event ids and test
/// fixtures.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
