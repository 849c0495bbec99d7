//! OpenSSL `enc -aes-256-cbc -pbkdf2` compatible config encryption.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha2::Sha256;

use crate::error::{Code, Error, Result};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

const MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;

fn derive(pass: &str, salt: &[u8], iter: u32) -> ([u8; 32], [u8; 16]) {
    let mut derived = [0u8; 48];
    pbkdf2::pbkdf2_hmac::<Sha256>(pass.as_bytes(), salt, iter, &mut derived);

    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&derived[..32]);
    iv.copy_from_slice(&derived[32..]);
    (key, iv)
}

pub fn decrypt(body: &[u8], pass: &str, iter: u32) -> Result<Vec<u8>> {
    if iter == 0 {
        return Err(Error::new(
            "cf3e32e9-a6aa-42a2-81a5-35409cd877b4",
            Code::InvalidArgument,
            "Iteration count must be positive.",
        ));
    }

    if body.len() < MAGIC.len() + SALT_LEN || &body[..MAGIC.len()] != MAGIC {
        return Err(Error::new(
            "87d323b1-9cf1-4634-b315-d9f0b921150f",
            Code::InvalidArgument,
            "Config file is not encrypted.",
        ));
    }

    let salt = &body[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let (key, iv) = derive(pass, salt, iter);

    Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&body[MAGIC.len() + SALT_LEN..])
        .map_err(|e| {
            Error::new("9802393c-9dee-4a17-98fc-a7c70d79528a", Code::Unknown, "Failed to decrypt config file.").with_cause(e)
        })
}

pub fn encrypt(plain: &[u8], pass: &str, iter: u32) -> Result<Vec<u8>> {
    if iter == 0 {
        return Err(Error::new(
            "2cb5f94d-b796-4083-a65a-64c51371396a",
            Code::InvalidArgument,
            "Iteration count must be positive.",
        ));
    }

    let salt: [u8; SALT_LEN] = rand::random();
    let (key, iv) = derive(pass, &salt, iter);

    let mut out = Vec::with_capacity(MAGIC.len() + SALT_LEN + plain.len() + 16);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend(Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let body = encrypt(b"data_dir = \"/srv\"\n", "c2VjcmV0", 1000).unwrap();
        assert_eq!(&body[..8], b"Salted__");

        let plain = decrypt(&body, "c2VjcmV0", 1000).unwrap();
        assert_eq!(plain, b"data_dir = \"/srv\"\n");
    }

    #[test]
    fn test_wrong_password() {
        let body = encrypt(b"{\"server\": {}}", "right", 10).unwrap();
        // Wrong keys almost always break the padding; a lucky pass still yields garbage.
        match decrypt(&body, "wrong", 10) {
            Err(err) => assert_eq!(err.code(), Code::Unknown),
            Ok(plain) => assert_ne!(plain, b"{\"server\": {}}"),
        }
    }

    #[test]
    fn test_plain_body_rejected() {
        let err = decrypt(b"port = 8080", "pass", 10).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
