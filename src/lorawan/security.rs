//! AES-128/CMAC primitives backing frame integrity and OTAA activation.
//!
//! All functions are pure: MIC computation and verification, session-key
//! derivation, LoRaWAN payload encryption (CTR construction over A-blocks)
//! and join-accept encryption. The join accept is encrypted with an AES
//! *decrypt* operation so constrained devices recover it with the single
//! encrypt primitive they already carry.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use cmac::{Cmac, Mac};

use super::JoinAccept;

/// Uplink direction byte used in MIC and encryption blocks.
pub const DIR_UPLINK: u8 = 0;
/// Downlink direction byte used in MIC and encryption blocks.
pub const DIR_DOWNLINK: u8 = 1;

fn cipher(key: &[u8; 16]) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key))
}

/// AES-128 ECB over `data`, zero-padded to a block boundary.
pub fn aes_encrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = cipher(key);
    let mut out = Vec::with_capacity(data.len().div_ceil(16) * 16);
    for chunk in data.chunks(16) {
        let mut block = [0u8; 16];
        block[..chunk.len()].copy_from_slice(chunk);
        let ga = GenericArray::from_mut_slice(&mut block);
        cipher.encrypt_block(ga);
        out.extend_from_slice(&block);
    }
    out
}

/// AES-128 ECB decryption over `data`, zero-padded to a block boundary.
pub fn aes_decrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = cipher(key);
    let mut out = Vec::with_capacity(data.len().div_ceil(16) * 16);
    for chunk in data.chunks(16) {
        let mut block = [0u8; 16];
        block[..chunk.len()].copy_from_slice(chunk);
        let ga = GenericArray::from_mut_slice(&mut block);
        cipher.decrypt_block(ga);
        out.extend_from_slice(&block);
    }
    out
}

fn cmac_tag(key: &[u8; 16], data: &[u8]) -> [u8; 4] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).expect("AES-128 key is 16 bytes");
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    [tag[0], tag[1], tag[2], tag[3]]
}

/// MIC over a join or rejoin request/accept (plain CMAC, truncated).
pub fn compute_join_mic(key: &[u8; 16], data: &[u8]) -> [u8; 4] {
    cmac_tag(key, data)
}

/// MIC over a data frame: CMAC of the B0 block followed by the payload.
pub fn compute_mic(
    nwk_skey: &[u8; 16],
    dev_addr: u32,
    fcnt: u32,
    direction: u8,
    payload: &[u8],
) -> [u8; 4] {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.push(0x49);
    buf.extend_from_slice(&[0, 0, 0, 0]);
    buf.push(direction);
    buf.extend_from_slice(&dev_addr.to_le_bytes());
    buf.extend_from_slice(&fcnt.to_le_bytes());
    buf.push(0);
    buf.push(payload.len() as u8);
    buf.extend_from_slice(payload);
    cmac_tag(nwk_skey, &buf)
}

/// Encrypt (or decrypt, the construction is symmetric) a frame payload with
/// the LoRaWAN A-block keystream.
pub fn encrypt_payload(
    app_skey: &[u8; 16],
    dev_addr: u32,
    fcnt: u32,
    direction: u8,
    payload: &[u8],
) -> Vec<u8> {
    let cipher = cipher(app_skey);
    let mut out = Vec::with_capacity(payload.len());
    for (i, chunk) in payload.chunks(16).enumerate() {
        let mut block = [0u8; 16];
        block[0] = 0x01;
        block[5] = direction;
        block[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        block[10..14].copy_from_slice(&fcnt.to_le_bytes());
        block[15] = (i + 1) as u8;
        let ga = GenericArray::from_mut_slice(&mut block);
        cipher.encrypt_block(ga);
        for (j, byte) in chunk.iter().enumerate() {
            out.push(byte ^ block[j]);
        }
    }
    out
}

/// Derive (NwkSKey, AppSKey) from the AppKey and the join handshake nonces.
pub fn derive_session_keys(
    app_key: &[u8; 16],
    dev_nonce: u16,
    app_nonce: u32,
    net_id: u32,
) -> ([u8; 16], [u8; 16]) {
    let mut block = [0u8; 16];
    block[1..4].copy_from_slice(&app_nonce.to_le_bytes()[..3]);
    block[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
    block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());

    block[0] = 0x01;
    let nwk = aes_encrypt(app_key, &block);
    block[0] = 0x02;
    let app = aes_encrypt(app_key, &block);

    let mut nwk_skey = [0u8; 16];
    let mut app_skey = [0u8; 16];
    nwk_skey.copy_from_slice(&nwk[..16]);
    app_skey.copy_from_slice(&app[..16]);
    (nwk_skey, app_skey)
}

/// Fill in the MIC and over-the-air encrypted form of a join accept.
///
/// Returns `(encrypted, mic)`. The device decrypts with `aes_encrypt` and
/// reads back `to_bytes() || mic` from the first 14 bytes.
pub fn encrypt_join_accept(app_key: &[u8; 16], accept: &JoinAccept) -> (Vec<u8>, [u8; 4]) {
    let clear = accept.to_bytes();
    let mic = compute_join_mic(app_key, &clear);
    let mut body = clear;
    body.extend_from_slice(&mic);
    (aes_decrypt(app_key, &body), mic)
}

/// Check the MIC of an uplink data frame payload.
pub fn validate_mic(
    nwk_skey: &[u8; 16],
    dev_addr: u32,
    fcnt: u32,
    direction: u8,
    payload: &[u8],
    mic: &[u8; 4],
) -> bool {
    compute_mic(nwk_skey, dev_addr, fcnt, direction, payload) == *mic
}
