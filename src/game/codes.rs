use rand::Rng;

/// Letters a join code is drawn from
pub const CODE_ALPHABET: &[u8] = b"ABCD";

/// Attempts at finding a code no live game holds
pub const MAX_CODE_ATTEMPTS: usize = 32;

pub fn generate_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Join codes are typed by hand, so compare case-insensitively
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
