//! Human-facing random codes: table short codes and ticket tokens.
//!
//! Both draw from an alphabet without visually ambiguous characters
//! (no 0/O, 1/I/L) so they can be read aloud or typed from a printout.

use rand::Rng;

pub const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub const SHORT_CODE_LEN: usize = 4;
/// 16 symbols from a 31-symbol alphabet is ~79 bits of entropy.
pub const TOKEN_LEN: usize = 16;
pub const TOKEN_PREFIX: &str = "TKT-";

pub fn random_code<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn short_code() -> String {
    random_code(&mut rand::rng(), SHORT_CODE_LEN)
}

pub fn ticket_token() -> String {
    format!("{TOKEN_PREFIX}{}", random_code(&mut rand::rng(), TOKEN_LEN))
}

/// Normalise user-typed input: trim and upper-case.
pub fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn codes_use_unambiguous_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let code = random_code(&mut rng, 32);
            assert!(code.bytes().all(|b| ALPHABET.contains(&b)), "{code}");
            assert!(!code.contains(['0', 'O', '1', 'I', 'L']));
        }
    }

    #[test]
    fn token_shape() {
        let token = ticket_token();
        assert!(token.starts_with(TOKEN_PREFIX));
        assert_eq!(token.len(), TOKEN_PREFIX.len() + TOKEN_LEN);
        assert_eq!(short_code().len(), SHORT_CODE_LEN);
        assert_ne!(ticket_token(), ticket_token());
    }
}
