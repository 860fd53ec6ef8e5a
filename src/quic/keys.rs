//! client_initial key schedule (RFC 9001 §5.2, RFC 9369 §3.3).
//!
//! Everything derives from the Destination Connection ID alone, which is
//! what lets an on-path observer (us) open the Initial without any state.

use hkdf::Hkdf;
use sha2::Sha256;

use super::{VERSION_V1, VERSION_V2};

const SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];
const SALT_V2: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d,
    0xcb, 0xf9, 0xbd, 0x2e, 0xd9,
];

/// AEAD key, IV and header-protection key for the client Initial direction.
pub struct InitialKeys {
    pub key: [u8; 16],
    pub iv: [u8; 12],
    pub hp: [u8; 16],
}

/// HKDF-Expand-Label per TLS 1.3 (RFC 8446 §7.1): the info block is
/// `uint16 length || opaque("tls13 " + label) || opaque("")`.
pub fn hkdf_expand_label(prk: &Hkdf<Sha256>, label: &str, out: &mut [u8]) {
    let mut info = Vec::with_capacity(4 + 6 + label.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label.as_bytes());
    info.push(0); // empty context
    prk.expand(&info, out)
        .expect("output length fits HKDF-SHA256 bounds");
}

/// HKDF-Extract(initial_salt, dcid), exposed for the key-schedule tests.
pub fn initial_secret(dcid: &[u8], version: u32) -> Option<[u8; 32]> {
    let salt: &[u8] = match version {
        VERSION_V1 => &SALT_V1,
        VERSION_V2 => &SALT_V2,
        _ => return None,
    };
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), dcid);
    let mut out = [0u8; 32];
    out.copy_from_slice(&prk);
    Some(out)
}

/// Derive key/iv/hp for the client Initial of the given version.
pub fn client_initial_keys(dcid: &[u8], version: u32) -> Option<InitialKeys> {
    let label_prefix = match version {
        VERSION_V1 => "quic",
        VERSION_V2 => "quicv2",
        _ => return None,
    };
    let secret = initial_secret(dcid, version)?;
    let hk = Hkdf::<Sha256>::from_prk(&secret).ok()?;

    let mut client = [0u8; 32];
    hkdf_expand_label(&hk, "client in", &mut client);
    let hk = Hkdf::<Sha256>::from_prk(&client).ok()?;

    let mut keys = InitialKeys {
        key: [0; 16],
        iv: [0; 12],
        hp: [0; 16],
    };
    hkdf_expand_label(&hk, &format!("{label_prefix} key"), &mut keys.key);
    hkdf_expand_label(&hk, &format!("{label_prefix} iv"), &mut keys.iv);
    hkdf_expand_label(&hk, &format!("{label_prefix} hp"), &mut keys.hp);
    Some(keys)
}
