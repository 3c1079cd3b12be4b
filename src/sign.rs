//! RSA-SHA1 signing and verification.
//!
//! Alpine indexes are signed with PKCS#1 v1.5 over a SHA1 digest of the
//! index archive bytes; the signature travels as the single entry of a
//! gzip'd tar member prepended to the index. That member is written
//! without the tar end-of-archive trailer so the concatenation decodes as
//! one continuous tar when read multistream.

use std::io::{self, Read, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Length of a SHA1 digest in bytes.
pub const SHA1_LEN: usize = 20;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("digest is not a SHA1 hash")]
    DigestNotSha1,

    #[error("no PEM block found")]
    NoPemBlock,

    #[error("key is encrypted but no passphrase was provided")]
    NoPassphrase,

    #[error("key is not an RSA key: {0}")]
    NotRsa(String),

    #[error("signature verification failed: {0}")]
    Verify(rsa::Error),

    #[error("signing failed: {0}")]
    Sign(rsa::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// SHA1 digest of a byte slice.
pub fn sha1_digest(data: &[u8]) -> [u8; SHA1_LEN] {
    Sha1::digest(data).into()
}

/// Verify a PKCS#1 v1.5 RSA-SHA1 signature against a PEM public key
/// (PKIX `PUBLIC KEY` or PKCS#1 `RSA PUBLIC KEY`).
pub fn verify_digest(digest: &[u8], signature: &[u8], pub_pem: &[u8]) -> Result<(), SignError> {
    if digest.len() != SHA1_LEN {
        return Err(SignError::DigestNotSha1);
    }
    let pem = std::str::from_utf8(pub_pem).map_err(|_| SignError::NoPemBlock)?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| SignError::NotRsa(e.to_string()))?;
    key.verify(Pkcs1v15Sign::new::<Sha1>(), digest, signature)
        .map_err(SignError::Verify)
}

/// Holds a parsed RSA private key plus the name under which its public half
/// is published (the `<name>` of `.SIGN.RSA.<name>.pub`).
pub struct KeySigner {
    key_name: String,
    key: RsaPrivateKey,
}

impl KeySigner {
    /// Parse a PEM private key (PKCS#1 or PKCS#8; encrypted PKCS#8 needs
    /// the passphrase).
    pub fn from_pem(
        key_name: impl Into<String>,
        pem: &[u8],
        passphrase: Option<&str>,
    ) -> Result<Self, SignError> {
        let text = std::str::from_utf8(pem).map_err(|_| SignError::NoPemBlock)?;
        let key = if text.contains("ENCRYPTED PRIVATE KEY") {
            let passphrase = passphrase.ok_or(SignError::NoPassphrase)?;
            RsaPrivateKey::from_pkcs8_encrypted_pem(text, passphrase)
                .map_err(|e| SignError::NotRsa(e.to_string()))?
        } else {
            RsaPrivateKey::from_pkcs1_pem(text)
                .or_else(|_| RsaPrivateKey::from_pkcs8_pem(text))
                .map_err(|e| SignError::NotRsa(e.to_string()))?
        };
        Ok(Self {
            key_name: key_name.into(),
            key,
        })
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Sign a 20-byte SHA1 digest, producing a PKCS#1 v1.5 signature.
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, SignError> {
        if digest.len() != SHA1_LEN {
            return Err(SignError::DigestNotSha1);
        }
        self.key
            .sign(Pkcs1v15Sign::new::<Sha1>(), digest)
            .map_err(SignError::Sign)
    }
}

/// Whether the first tar entries of an index archive already carry a
/// `.SIGN.RSA*` signature.
pub fn index_is_signed(index: &[u8]) -> Result<bool, SignError> {
    let decoder = flate2::bufread::MultiGzDecoder::new(index);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let entry = entry?;
        if entry
            .path()?
            .to_string_lossy()
            .starts_with(".SIGN.RSA")
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Sign an index archive: compute SHA1 over its bytes and prepend a
/// one-entry gzip'd tar holding the signature. Signing an already-signed
/// index is a no-op and returns the input unchanged.
pub fn sign_index(signer: &KeySigner, index: &[u8]) -> Result<Vec<u8>, SignError> {
    if index_is_signed(index)? {
        tracing::debug!(key = signer.key_name(), "index already signed, doing nothing");
        return Ok(index.to_vec());
    }

    tracing::debug!(key = signer.key_name(), "signing index");
    let digest = sha1_digest(index);
    let signature = signer.sign_digest(&digest)?;

    let entry_name = format!(".SIGN.RSA.{}.pub", signer.key_name());
    let mut out = gzip_tar_cut(&entry_name, &signature)?;
    out.extend_from_slice(index);
    Ok(out)
}

/// One-entry tar, gzip'd, without the end-of-archive trailer.
fn gzip_tar_cut(name: &str, content: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut header = tar::Header::new_ustar();
    header.set_path(name)?;
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(header.as_bytes())?;
    encoder.write_all(content)?;
    let padding = (512 - content.len() % 512) % 512;
    encoder.write_all(&vec![0u8; padding])?;
    Ok(encoder.finish()?)
}

/// Extract `(key name, signature bytes, signed payload)` from a signed
/// index: the first gzip member is measured precisely so the remainder of
/// the input is exactly what was signed.
pub fn split_signature(index: &[u8]) -> Result<Option<(String, Vec<u8>, usize)>, SignError> {
    let mut cursor = io::Cursor::new(index);
    let mut decoder = flate2::bufread::GzDecoder::new(&mut cursor);
    let mut first_member = Vec::new();
    if decoder.read_to_end(&mut first_member).is_err() {
        return Ok(None);
    }
    drop(decoder);
    let payload_start = cursor.position() as usize;

    let mut archive = tar::Archive::new(&first_member[..]);
    let Some(entry) = archive.entries()?.next() else {
        return Ok(None);
    };
    let mut entry = entry?;
    let name = entry.path()?.to_string_lossy().into_owned();
    let Some(key_name) = name
        .strip_prefix(".SIGN.RSA.")
        .filter(|rest| rest.ends_with(".rsa.pub"))
    else {
        return Ok(None);
    };
    let mut signature = Vec::new();
    entry.read_to_end(&mut signature)?;
    Ok(Some((key_name.to_string(), signature, payload_start)))
}
