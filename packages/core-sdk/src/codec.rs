use aes_gcm::{
    aead::{
        consts::U16,
        rand_core::RngCore,
        AeadInPlace, KeyInit, OsRng,
    },
    aes::Aes256,
    AesGcm, Nonce, Tag,
};

use crate::error::{CodecError, ConfigError};

/** \brief 128 位随机 IV 的 AES-256-GCM，与既有存量密文格式一致。 */
type Cipher = AesGcm<Aes256, U16>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

/**
 * \brief 对称加解密器，密钥在进程启动时装载一次。
 * \details 密文令牌为 hex(nonce ∥ tag ∥ ciphertext)，自描述，解密无需额外元数据。
 */
#[derive(Clone)]
pub struct SecretCodec {
    cipher: Cipher,
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCodec(..)")
    }
}

impl SecretCodec {
    /**
     * \brief 由 hex 编码的 256 位密钥构造。
     */
    pub fn from_hex_key(hex_key: &str) -> Result<Self, ConfigError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| ConfigError::Invalid {
            key: "CODEPAL_ENCRYPTION_KEY",
            reason: e.to_string(),
        })?;
        Self::from_key_bytes(&bytes)
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() != KEY_LEN {
            return Err(ConfigError::Invalid {
                key: "CODEPAL_ENCRYPTION_KEY",
                reason: format!("expected {} bytes, got {}", KEY_LEN, bytes.len()),
            });
        }
        let cipher = Cipher::new_from_slice(bytes).map_err(|_| ConfigError::Invalid {
            key: "CODEPAL_ENCRYPTION_KEY",
            reason: "unusable key".to_string(),
        })?;
        Ok(Self { cipher })
    }

    /**
     * \brief 加密明文，每次调用生成新的随机 nonce。
     */
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CodecError::Encryption)?;

        let mut token = Vec::with_capacity(NONCE_LEN + TAG_LEN + buffer.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(tag.as_slice());
        token.extend_from_slice(&buffer);
        Ok(hex::encode(token))
    }

    /**
     * \brief 解密令牌；格式错误、篡改或密钥不匹配均返回 `CodecError::Decryption`。
     */
    pub fn decrypt(&self, token: &str) -> Result<String, CodecError> {
        let raw = hex::decode(token.trim()).map_err(|_| CodecError::Decryption("malformed token"))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CodecError::Decryption("token too short"));
        }
        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);

        let mut buffer = body.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(nonce),
                b"",
                &mut buffer,
                Tag::<U16>::from_slice(tag),
            )
            .map_err(|_| CodecError::Decryption("authentication failed"))?;

        String::from_utf8(buffer).map_err(|_| CodecError::Decryption("plaintext is not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn codec() -> SecretCodec {
        SecretCodec::from_hex_key(KEY).expect("valid key")
    }

    fn flip_nibble(token: &str, index: usize) -> String {
        let mut chars: Vec<char> = token.chars().collect();
        chars[index] = if chars[index] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    #[test]
    fn test_round_trip_preserves_plaintext() {
        let codec = codec();
        let long = "x".repeat(4096);
        for plain in ["sk-abc123", "", "ключ-🔑", long.as_str()] {
            let token = codec.encrypt(plain).expect("encrypt");
            assert_eq!(codec.decrypt(&token).expect("decrypt"), plain);
        }
    }

    #[test]
    fn test_encrypt_uses_fresh_nonce() {
        let codec = codec();
        let a = codec.encrypt("same secret").expect("encrypt a");
        let b = codec.encrypt("same secret").expect("encrypt b");
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN * 2], b[..NONCE_LEN * 2]);
        assert_eq!(codec.decrypt(&a).unwrap(), "same secret");
        assert_eq!(codec.decrypt(&b).unwrap(), "same secret");
    }

    #[test]
    fn test_token_layout_is_nonce_tag_body() {
        let token = codec().encrypt("abcd").expect("encrypt");
        assert_eq!(token.len(), (NONCE_LEN + TAG_LEN + 4) * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let codec = codec();
        let token = codec.encrypt("sk-live-key").expect("encrypt");
        let body_index = (NONCE_LEN + TAG_LEN) * 2 + 1;
        let tampered = flip_nibble(&token, body_index);
        assert!(matches!(
            codec.decrypt(&tampered),
            Err(CodecError::Decryption(_))
        ));
    }

    #[test]
    fn test_tampered_tag_is_rejected() {
        let codec = codec();
        let token = codec.encrypt("sk-live-key").expect("encrypt");
        let tampered = flip_nibble(&token, NONCE_LEN * 2 + 3);
        assert!(matches!(
            codec.decrypt(&tampered),
            Err(CodecError::Decryption(_))
        ));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let token = codec().encrypt("sk-live-key").expect("encrypt");
        let other = SecretCodec::from_key_bytes(&[7u8; KEY_LEN]).expect("other key");
        assert!(other.decrypt(&token).is_err());
    }

    #[test]
    fn test_malformed_tokens_are_rejected() {
        let codec = codec();
        assert!(codec.decrypt("not hex at all").is_err());
        assert!(codec.decrypt("abcd").is_err());
        assert!(codec.decrypt("").is_err());
    }

    #[test]
    fn test_key_length_is_enforced() {
        assert!(SecretCodec::from_hex_key("abcd").is_err());
        assert!(SecretCodec::from_hex_key("zz").is_err());
        assert!(SecretCodec::from_key_bytes(&[0u8; 16]).is_err());
    }
}
