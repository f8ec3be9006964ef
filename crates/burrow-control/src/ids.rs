//! Identifier and token generation

use rand::Rng;

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of a tunnel id: 13 chars over a 36-symbol alphabet (~67 bits)
const TUNNEL_ID_LEN: usize = 13;

/// Length of an attach token: 43 chars over a 64-symbol alphabet (~256 bits)
const ATTACH_TOKEN_LEN: usize = 43;

fn random_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

/// Generate a short URL-safe tunnel id
pub fn tunnel_id() -> String {
    random_string(ID_CHARSET, TUNNEL_ID_LEN)
}

/// Generate a URL-safe attach token
pub fn attach_token() -> String {
    random_string(TOKEN_CHARSET, ATTACH_TOKEN_LEN)
}
