//! RMCP+ session crypto: RAKP-HMAC key derivation, integrity HMACs and the
//! AES-CBC-128 confidentiality envelope.
//!
//! Key material, per IPMI 2.0 §13.31:
//!
//! ```text
//! kg  = password right-padded with NULs to 20 bytes
//! SIK = HMAC_kg(Rm || Rc || role || ulen || username)
//! K1  = HMAC_SIK(0x01 × 20)     — integrity key
//! K2  = HMAC_SIK(0x02 × 20)     — confidentiality key (AES uses K2[..16])
//! ```

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;

use crate::ipmi::SolError;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// RAKP authentication algorithm identifiers from the open-session exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlg {
    /// RAKP-none (no authentication).
    None,
    /// RAKP-HMAC-SHA1 (the default this client offers).
    HmacSha1,
    /// RAKP-HMAC-MD5 — recognised but not implemented.
    HmacMd5,
    /// RAKP-HMAC-SHA256.
    HmacSha256,
}

impl AuthAlg {
    /// Decode the wire identifier.
    pub fn from_wire(id: u8) -> Result<Self, SolError> {
        match id {
            0x00 => Ok(AuthAlg::None),
            0x01 => Ok(AuthAlg::HmacSha1),
            0x02 => Ok(AuthAlg::HmacMd5),
            0x03 => Ok(AuthAlg::HmacSha256),
            other => Err(SolError::UnsupportedAlgorithm(other)),
        }
    }

    /// HMAC under this algorithm. MD5 is recognised in negotiation but a
    /// session using it cannot be keyed.
    pub fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, SolError> {
        match self {
            AuthAlg::None => Ok(Vec::new()),
            AuthAlg::HmacSha1 => Ok(hmac_sha1(key, data).to_vec()),
            AuthAlg::HmacSha256 => Ok(hmac_sha256(key, data).to_vec()),
            AuthAlg::HmacMd5 => Err(SolError::UnsupportedAlgorithm(0x02)),
        }
    }
}

/// HMAC-SHA1 of `data` under `key`.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Password right-padded with NULs to the 20-byte `kg` key.
pub fn pad_password(password: &str) -> [u8; 20] {
    let mut kg = [0u8; 20];
    let bytes = password.as_bytes();
    let n = bytes.len().min(20);
    kg[..n].copy_from_slice(&bytes[..n]);
    kg
}

/// Derive the session integrity key from the RAKP exchange inputs.
pub fn derive_sik(kg: &[u8], rm: &[u8; 16], rc: &[u8; 16], role: u8, username: &str) -> [u8; 20] {
    let mut seed = Vec::with_capacity(34 + username.len());
    seed.extend_from_slice(rm);
    seed.extend_from_slice(rc);
    seed.push(role);
    seed.push(username.len() as u8);
    seed.extend_from_slice(username.as_bytes());
    hmac_sha1(kg, &seed)
}

/// Derive K1 (`which = 0x01`) or K2 (`which = 0x02`) from the SIK.
pub fn derive_k(sik: &[u8], which: u8) -> [u8; 20] {
    hmac_sha1(sik, &[which; 20])
}

/// RAKP3 authentication code: `HMAC_kg(Rc || console_session_id || role ||
/// ulen || username)`.
pub fn rakp3_auth_code(
    kg: &[u8],
    rc: &[u8; 16],
    console_session_id: u32,
    role: u8,
    username: &str,
) -> [u8; 20] {
    let mut seed = Vec::with_capacity(22 + username.len());
    seed.extend_from_slice(rc);
    seed.extend_from_slice(&console_session_id.to_le_bytes());
    seed.push(role);
    seed.push(username.len() as u8);
    seed.extend_from_slice(username.as_bytes());
    hmac_sha1(kg, &seed)
}

// ============================================================================
// AES-CBC-128 confidentiality
// ============================================================================

const AES_BLOCK: usize = 16;

/// Encrypt a payload for the confidentiality envelope: a random 16-byte IV
/// followed by the AES-CBC-128 ciphertext of `plaintext || 0x01..0x0P || P`.
pub fn encrypt_aes_cbc(k2: &[u8], plaintext: &[u8]) -> Vec<u8> {
    // Pad bytes count: the pad-length byte itself is part of the block.
    let pad = (AES_BLOCK - (plaintext.len() + 1) % AES_BLOCK) % AES_BLOCK;
    let mut block_data = Vec::with_capacity(plaintext.len() + pad + 1);
    block_data.extend_from_slice(plaintext);
    for i in 1..=pad {
        block_data.push(i as u8);
    }
    block_data.push(pad as u8);

    let mut iv = [0u8; AES_BLOCK];
    rand::rng().fill_bytes(&mut iv);

    let mut cipher = Aes128CbcEnc::new_from_slices(&k2[..AES_BLOCK], &iv)
        .expect("AES-128 key and IV lengths are fixed");
    for chunk in block_data.chunks_exact_mut(AES_BLOCK) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }

    let mut out = Vec::with_capacity(AES_BLOCK + block_data.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&block_data);
    out
}

/// Decrypt a confidentiality envelope and strip the pad, validating that
/// the pad bytes count up 0x01..0x0P before the trailing length byte.
pub fn decrypt_aes_cbc(k2: &[u8], payload: &[u8]) -> Result<Vec<u8>, SolError> {
    if payload.len() < AES_BLOCK * 2 || (payload.len() - AES_BLOCK) % AES_BLOCK != 0 {
        return Err(SolError::BadPad);
    }
    let (iv, ciphertext) = payload.split_at(AES_BLOCK);
    let mut cipher = Aes128CbcDec::new_from_slices(&k2[..AES_BLOCK], iv)
        .expect("AES-128 key and IV lengths are fixed");
    let mut plain = ciphertext.to_vec();
    for chunk in plain.chunks_exact_mut(AES_BLOCK) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }

    let pad = *plain.last().ok_or(SolError::BadPad)? as usize;
    if pad + 1 > plain.len() || pad >= AES_BLOCK {
        return Err(SolError::BadPad);
    }
    let data_len = plain.len() - pad - 1;
    for (i, b) in plain[data_len..plain.len() - 1].iter().enumerate() {
        if *b != (i + 1) as u8 {
            return Err(SolError::BadPad);
        }
    }
    plain.truncate(data_len);
    Ok(plain)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
