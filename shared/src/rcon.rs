//! Remote console message model
//!
//! An rcon request arrives either in the clear (`rcon <password> <command>`)
//! or encrypted (`srcon <method> <payload>`). Encryption is AES-256 keyed by
//! the SHA-256 of the password with base64 transport ([`AesCipher`]). In
//! challenge mode the plaintext is `<challenge> <command>` so a captured
//! packet cannot be replayed.

use crate::address::NetAddress;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use thiserror::Error;

const AES_BLOCK_SIZE: usize = 16;

/// Security level of an rcon request, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Secure {
    Unencrypted = 0,
    EncryptedPlain = 1,
    EncryptedChallenge = 2,
    Invalid = 3,
}

impl Secure {
    /// Level configured through `rcon.server.secure` or advertised in `rconInfoResponse`
    pub fn from_level(level: i32) -> Self {
        match level {
            0 => Secure::Unencrypted,
            1 => Secure::EncryptedPlain,
            2 => Secure::EncryptedChallenge,
            _ => Secure::Invalid,
        }
    }

    pub fn level(self) -> i32 {
        self as i32
    }

    /// Method keyword used by `srcon`
    pub fn method(self) -> Option<&'static str> {
        match self {
            Secure::EncryptedPlain => Some("PLAIN"),
            Secure::EncryptedChallenge => Some("CHALLENGE"),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Invalid Base64 string")]
    InvalidBase64,
    #[error("Error during decryption")]
    Decryption,
}

/// Symmetric encryption of rcon payloads
pub trait RconCipher: Send + Sync {
    /// Encrypts `plaintext` and returns the base64 transport form
    fn encrypt(&self, password: &str, plaintext: &str) -> Result<String, CipherError>;
    /// Decodes and decrypts a base64 payload
    fn decrypt(&self, password: &str, payload: &str) -> Result<String, CipherError>;
}

/// AES-256 in ECB mode, keyed by the SHA-256 digest of the password
///
/// The plaintext is zero padded to a whole number of blocks and the
/// decrypted text ends at the first zero byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesCipher;

impl AesCipher {
    fn cipher(password: &str) -> Aes256 {
        Aes256::new(&Sha256::digest(password.as_bytes()))
    }
}

impl RconCipher for AesCipher {
    fn encrypt(&self, password: &str, plaintext: &str) -> Result<String, CipherError> {
        let mut data = plaintext.as_bytes().to_vec();
        let padding = data.len() % AES_BLOCK_SIZE;
        if padding != 0 {
            data.resize(data.len() + AES_BLOCK_SIZE - padding, 0);
        }

        let cipher = Self::cipher(password);
        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(BASE64.encode(data))
    }

    fn decrypt(&self, password: &str, payload: &str) -> Result<String, CipherError> {
        let mut data = BASE64
            .decode(payload)
            .map_err(|_| CipherError::InvalidBase64)?;
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(CipherError::Decryption);
        }

        let cipher = Self::cipher(password);
        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        if let Some(end) = data.iter().position(|&b| b == 0) {
            data.truncate(end);
        }
        String::from_utf8(data).map_err(|_| CipherError::Decryption)
    }
}

/// A decoded rcon request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconMessage {
    pub remote: NetAddress,
    pub secure: Secure,
    pub password: String,
    pub challenge: String,
    pub command: String,
}

impl RconMessage {
    pub fn new(remote: NetAddress, secure: Secure, password: &str, command: &str) -> Self {
        Self {
            remote,
            secure,
            password: password.to_string(),
            challenge: String::new(),
            command: command.to_string(),
        }
    }

    pub fn with_challenge(mut self, challenge: &str) -> Self {
        self.challenge = challenge.to_string();
        self
    }

    /// Checks that the fields required by the security level are present
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.secure == Secure::Invalid {
            return Err("Unknown secure protocol");
        }
        if self.command.is_empty() {
            return Err("Missing command");
        }
        if self.password.is_empty() {
            return Err("Missing password");
        }
        if self.secure == Secure::EncryptedChallenge && self.challenge.is_empty() {
            return Err("Missing challenge");
        }
        Ok(())
    }

    /// Encodes the request as a connectionless command line
    pub fn encode(&self, cipher: &dyn RconCipher) -> Result<String, CipherError> {
        match self.secure {
            Secure::EncryptedPlain => {
                let payload = cipher.encrypt(&self.password, &self.command)?;
                Ok(format!("srcon PLAIN {}", payload))
            }
            Secure::EncryptedChallenge => {
                let plaintext = format!("{} {}", self.challenge, self.command);
                let payload = cipher.encrypt(&self.password, &plaintext)?;
                Ok(format!("srcon CHALLENGE {}", payload))
            }
            _ => Ok(format!("rcon {} {}", self.password, self.command)),
        }
    }
}
