//! Header-protection removal and AEAD open for client Initials
//! (RFC 9001 §5.3–§5.4).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};

use super::keys::client_initial_keys;
use super::parse_initial;

const SAMPLE_LEN: usize = 16;
const AEAD_TAG_LEN: usize = 16;

/// AES-ECB of the 16-byte ciphertext sample under the hp key; the result is
/// the XOR mask for the first byte's low bits and the packet number.
fn hp_mask(hp: &[u8; 16], sample: &[u8]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(hp));
    let mut block = GenericArray::clone_from_slice(sample);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Decrypt a client Initial addressed with `dcid`. Returns the plaintext
/// QUIC payload (frames), or `None` for anything that does not parse,
/// including AEAD tag failures — such datagrams pass through unmangled.
///
/// The input is never mutated; header-protection removal happens on a
/// scratch copy of the header.
pub fn decrypt_initial(dcid: &[u8], datagram: &[u8]) -> Option<Vec<u8>> {
    let hdr = parse_initial(datagram)?;
    let keys = client_initial_keys(dcid, hdr.version)?;

    let sample_off = hdr.pn_offset + 4;
    let sample = datagram.get(sample_off..sample_off + SAMPLE_LEN)?;
    let mask = hp_mask(&keys.hp, sample);

    let first = datagram[0] ^ (mask[0] & 0x0f);
    let pn_len = usize::from(first & 0x03) + 1;
    if hdr.length < pn_len + AEAD_TAG_LEN || datagram.len() < hdr.pn_offset + hdr.length {
        return None;
    }

    let mut pn_bytes = [0u8; 4];
    for i in 0..pn_len {
        pn_bytes[i] = datagram[hdr.pn_offset + i] ^ mask[1 + i];
    }
    let mut pn = 0u64;
    for b in &pn_bytes[..pn_len] {
        pn = pn << 8 | u64::from(*b);
    }

    // AAD is the header through the packet number, with protection removed.
    let mut aad = Vec::with_capacity(hdr.pn_offset + pn_len);
    aad.push(first);
    aad.extend_from_slice(&datagram[1..hdr.pn_offset]);
    aad.extend_from_slice(&pn_bytes[..pn_len]);

    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&keys.iv);
    for i in 0..8 {
        nonce[4 + i] ^= (pn >> (56 - 8 * i)) as u8;
    }

    let ciphertext = &datagram[hdr.pn_offset + pn_len..hdr.pn_offset + hdr.length];
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&keys.key));
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .ok()
}

/// Test-only inverse of [`decrypt_initial`]: builds a sealed v1/v2 Initial
/// from plaintext frames so round-trip tests don't need captures.
#[cfg(test)]
pub fn seal_initial(version: u32, dcid: &[u8], pn: u32, frames: &[u8]) -> Vec<u8> {
    let pn_len = 4usize;
    let mut header = vec![0xc0 | if version == super::VERSION_V2 { 0x10 } else { 0x00 } | 3];
    header.extend_from_slice(&version.to_be_bytes());
    header.push(dcid.len() as u8);
    header.extend_from_slice(dcid);
    header.push(0); // scid len
    header.push(0); // token len
    let length = pn_len + frames.len() + AEAD_TAG_LEN;
    assert!(length < 0x4000);
    header.extend_from_slice(&(0x4000u16 | length as u16).to_be_bytes());
    let pn_offset = header.len();
    header.extend_from_slice(&pn.to_be_bytes());

    let keys = client_initial_keys(dcid, version).unwrap();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&keys.iv);
    for i in 0..8 {
        nonce[4 + i] ^= (u64::from(pn) >> (56 - 8 * i)) as u8;
    }
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&keys.key));
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: frames,
                aad: &header,
            },
        )
        .unwrap();

    let mut out = header;
    out.extend_from_slice(&sealed);

    let sample_off = pn_offset + 4;
    let sample: [u8; SAMPLE_LEN] = out[sample_off..sample_off + SAMPLE_LEN].try_into().unwrap();
    let mask = hp_mask(&keys.hp, &sample);
    out[0] ^= mask[0] & 0x0f;
    for i in 0..pn_len {
        out[pn_offset + i] ^= mask[1 + i];
    }
    out
}
