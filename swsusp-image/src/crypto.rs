//! Image encryption.
//!
//! CFB over AES-128, applied page by page to the post-compression stream.
//! The key is either derived from a passphrase (with a random salt folded
//! into the initial vector so equal passphrases never produce equal
//! streams), or generated at random and wrapped with an RSA public key so
//! the image can be written without prompting for a secret.

use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::header::{RsaKeyBlob, CIPHER_BLOCK, KEY_DATA_SIZE, RSA_DATA_SIZE};
use crate::{Error, Result};

pub const KEY_SIZE: usize = 16;

type Enc = BufEncryptor<Aes128>;
type Dec = BufDecryptor<Aes128>;

/// Key material for one image, owned by the supervisor and lent to the
/// pipeline as a transform capability.
pub struct CryptoContext {
    key: [u8; KEY_SIZE],
    iv: [u8; CIPHER_BLOCK],
    salt: [u8; CIPHER_BLOCK],
    rsa: Option<RsaKeyBlob>,
}

impl CryptoContext {
    /// Passphrase mode: key and vector derived from the passphrase, salted.
    pub fn with_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        let mut ivec = [0u8; CIPHER_BLOCK];
        key.copy_from_slice(&digest[..KEY_SIZE]);
        ivec.copy_from_slice(&digest[KEY_SIZE..KEY_SIZE + CIPHER_BLOCK]);

        let mut salt = [0u8; CIPHER_BLOCK];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut iv = ivec;
        for (iv, salt) in iv.iter_mut().zip(salt.iter()) {
            *iv ^= salt;
        }

        CryptoContext {
            key,
            iv,
            salt,
            rsa: None,
        }
    }

    /// RSA mode: a random session key and vector, wrapped with the public
    /// key read from the key file (PEM, PKCS#8 or PKCS#1).
    pub fn with_rsa_key(public_pem: &str) -> Result<Self> {
        let public = RsaPublicKey::from_public_key_pem(public_pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_pem))
            .map_err(|err| Error::Crypto(format!("unreadable RSA public key: {err}")))?;

        let mut rng = rand::thread_rng();
        let mut session = [0u8; KEY_SIZE + CIPHER_BLOCK];
        rng.fill_bytes(&mut session);

        let wrapped_key = public
            .encrypt(&mut rng, Pkcs1v15Encrypt, &session)
            .map_err(|err| Error::Crypto(format!("session key wrap failed: {err}")))?;
        let public_der = public
            .to_pkcs1_der()
            .map_err(|err| Error::Crypto(format!("public key encoding failed: {err}")))?
            .into_vec();

        if public_der.len() > RSA_DATA_SIZE || wrapped_key.len() > KEY_DATA_SIZE {
            return Err(Error::Crypto("RSA key material too large for the header".into()));
        }

        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; CIPHER_BLOCK];
        key.copy_from_slice(&session[..KEY_SIZE]);
        iv.copy_from_slice(&session[KEY_SIZE..]);

        Ok(CryptoContext {
            key,
            iv,
            salt: [0u8; CIPHER_BLOCK],
            rsa: Some(RsaKeyBlob {
                public_der,
                wrapped_key,
            }),
        })
    }

    pub fn salt(&self) -> [u8; CIPHER_BLOCK] {
        self.salt
    }

    pub fn rsa_blob(&self) -> Option<&RsaKeyBlob> {
        self.rsa.as_ref()
    }

    pub fn encryptor(&self) -> Result<PageEncryptor> {
        let inner = Enc::new_from_slices(&self.key, &self.iv)
            .map_err(|err| Error::Crypto(format!("cipher setup: {err}")))?;
        Ok(PageEncryptor { inner })
    }

    pub fn decryptor(&self) -> Result<PageDecryptor> {
        let inner = Dec::new_from_slices(&self.key, &self.iv)
            .map_err(|err| Error::Crypto(format!("cipher setup: {err}")))?;
        Ok(PageDecryptor { inner })
    }
}

/// Stateful page encryptor; pages must be fed in stream order.
pub struct PageEncryptor {
    inner: Enc,
}

impl PageEncryptor {
    pub fn encrypt_page(&mut self, src: &[u8], dst: &mut [u8]) {
        dst[..src.len()].copy_from_slice(src);
        self.inner.encrypt(&mut dst[..src.len()]);
    }
}

/// Stateful page decryptor for the verify pass.
pub struct PageDecryptor {
    inner: Dec,
}

impl PageDecryptor {
    pub fn decrypt_page(&mut self, page: &mut [u8]) {
        self.inner.decrypt(page);
    }
}
