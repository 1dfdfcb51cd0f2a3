//! Device Key Pair Generation Module
//!
//! Every issuance request gets a brand new RSA-2048 key pair drawn from
//! OpenSSL's CSPRNG. Keys are never cached or reused; the pair lives only as long
//! as the request that created it.

use crate::error::KeyGenerationError;
use crate::pem_block::{self, RSA_PRIVATE_KEY_TAG};
use openssl::error::ErrorStack;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use secrecy::SecretString;

pub const RSA_KEY_BITS: u32 = 2048;

pub struct DeviceKeyPair {
    private_key: PKey<Private>,
}

impl DeviceKeyPair {
    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    /// PKCS#1 DER of the private key wrapped in an `RSA PRIVATE KEY` PEM block
    pub fn private_key_pem(&self) -> Result<SecretString, ErrorStack> {
        let der = self.private_key.rsa()?.private_key_to_der()?;
        Ok(SecretString::new(pem_block::encode(RSA_PRIVATE_KEY_TAG, der)))
    }
}

/// Generate a fresh RSA key pair for one device
pub fn generate_device_keypair() -> Result<DeviceKeyPair, KeyGenerationError> {
    let rsa = Rsa::generate(RSA_KEY_BITS)?;
    let private_key = PKey::from_rsa(rsa)?;
    Ok(DeviceKeyPair { private_key })
}
