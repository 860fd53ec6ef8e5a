//! TLS ClientHello walking: find the `server_name` extension and return the
//! first `host_name` entry.
//!
//! Two entry points exist because QUIC carries the handshake without a TLS
//! record layer: [`extract_sni`] expects a record (content type 22),
//! [`extract_sni_from_handshake`] starts directly at the handshake header.
//! Both return an owned copy of the host bytes so callers may drop the
//! reassembly buffer the slice came from.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlsError {
    /// Not a (complete) ClientHello, or no SNI extension in it. Partial
    /// reassembly prefixes land here too; the caller just waits for more.
    #[error("not a client hello")]
    NotHello,
}

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0;

/// SNI from a byte slice starting at a TLS record.
pub fn extract_sni(record: &[u8]) -> Result<Vec<u8>, TlsError> {
    if record.len() < 5 || record[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(TlsError::NotHello);
    }
    let rec_len = usize::from(u16::from_be_bytes([record[3], record[4]]));
    if record.len() < 5 + rec_len {
        return Err(TlsError::NotHello);
    }
    extract_sni_from_handshake(&record[5..5 + rec_len])
}

/// SNI from a byte slice starting directly at the handshake header, as
/// reassembled from QUIC CRYPTO frames.
pub fn extract_sni_from_handshake(hs: &[u8]) -> Result<Vec<u8>, TlsError> {
    if hs.len() < 4 || hs[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(TlsError::NotHello);
    }
    let body_len = usize::from(hs[1]) << 16 | usize::from(hs[2]) << 8 | usize::from(hs[3]);
    if hs.len() < 4 + body_len {
        return Err(TlsError::NotHello);
    }
    let body = &hs[4..4 + body_len];

    // legacy_version(2) + random(32)
    let mut pos = 34usize;
    if body.len() < pos + 1 {
        return Err(TlsError::NotHello);
    }
    pos += 1 + usize::from(body[pos]); // session_id
    if body.len() < pos + 2 {
        return Err(TlsError::NotHello);
    }
    let suites = usize::from(u16::from_be_bytes([body[pos], body[pos + 1]]));
    pos += 2 + suites;
    if body.len() < pos + 1 {
        return Err(TlsError::NotHello);
    }
    pos += 1 + usize::from(body[pos]); // compression_methods
    if body.len() < pos + 2 {
        return Err(TlsError::NotHello);
    }
    let ext_len = usize::from(u16::from_be_bytes([body[pos], body[pos + 1]]));
    pos += 2;
    let ext_end = pos + ext_len;
    if body.len() < ext_end {
        return Err(TlsError::NotHello);
    }

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let len = usize::from(u16::from_be_bytes([body[pos + 2], body[pos + 3]]));
        pos += 4;
        if pos + len > ext_end {
            return Err(TlsError::NotHello);
        }
        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(&body[pos..pos + len]);
        }
        pos += len;
    }
    Err(TlsError::NotHello)
}

/// Walk the server_name_list and return the first `host_name` entry.
fn parse_server_name(ext: &[u8]) -> Result<Vec<u8>, TlsError> {
    if ext.len() < 2 {
        return Err(TlsError::NotHello);
    }
    let list_len = usize::from(u16::from_be_bytes([ext[0], ext[1]]));
    if ext.len() < 2 + list_len {
        return Err(TlsError::NotHello);
    }
    let mut pos = 2usize;
    let end = 2 + list_len;
    while pos + 3 <= end {
        let name_type = ext[pos];
        let name_len = usize::from(u16::from_be_bytes([ext[pos + 1], ext[pos + 2]]));
        pos += 3;
        if pos + name_len > end {
            return Err(TlsError::NotHello);
        }
        if name_type == NAME_TYPE_HOST {
            return Ok(ext[pos..pos + name_len].to_vec());
        }
        pos += name_len;
    }
    Err(TlsError::NotHello)
}

/// First index in `data` that looks like the start of a ClientHello record:
/// `16 03 ?? ?? ?? 01`. Used for the blind split before reassembly finishes.
pub fn find_hello_start(data: &[u8]) -> Option<usize> {
    data.windows(6)
        .position(|w| w[0] == CONTENT_TYPE_HANDSHAKE && w[1] == 0x03 && w[5] == HANDSHAKE_CLIENT_HELLO)
}
