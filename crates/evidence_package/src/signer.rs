// Ed25519 signing and verification of evidence manifests
//
// The signature covers the SHA-256 digest of the canonical manifest body,
// never the raw serialization.

use crate::manifest::{Manifest, SignatureBlock};
use crate::{PackageError, PackageResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use tracing::debug;

/// Algorithm identifier recorded in signature blocks
pub const ED25519: &str = "ed25519";

/// Outcome of checking a manifest signature against one public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureVerdict {
    Valid,
    Missing,
    Invalid(String),
}

impl SignatureVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Human-readable explanation of the verdict
    pub fn reason(&self) -> String {
        match self {
            Self::Valid => "signature valid".to_string(),
            Self::Missing => "no signature present".to_string(),
            Self::Invalid(reason) => reason.clone(),
        }
    }

    /// Convert to an error for callers that treat anything but a valid signature as fatal
    pub fn into_result(self) -> PackageResult<()> {
        match self {
            Self::Valid => Ok(()),
            Self::Missing => Err(PackageError::NoSignature),
            Self::Invalid(reason) => Err(PackageError::SignatureInvalid(reason)),
        }
    }
}

/// Signs manifests with one named key
pub struct PackageSigner {
    key: SigningKey,
    signer_name: String,
}

impl PackageSigner {
    pub fn new(key: SigningKey, signer_name: impl Into<String>) -> Self {
        Self {
            key,
            signer_name: signer_name.into(),
        }
    }

    pub fn signer_name(&self) -> &str {
        &self.signer_name
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Return a signed copy of `manifest`. Any existing signature is replaced.
    pub fn sign(&self, manifest: &Manifest) -> PackageResult<Manifest> {
        let target = manifest.signing_target()?;
        let signature = self.key.sign(target.as_bytes());

        let mut signed = manifest.unsigned();
        signed.signature = Some(SignatureBlock {
            signer: self.signer_name.clone(),
            algorithm: ED25519.to_string(),
            signature: BASE64.encode(signature.to_bytes()),
            signed_at: Utc::now(),
            public_key: Some(encode_public_key(&self.verifying_key())),
        });
        debug!(signer = %self.signer_name, target = %target, "signed manifest");
        Ok(signed)
    }
}

/// Sign `manifest` with `key`, recording `signer_name` as the signer identity
pub fn sign_manifest(
    manifest: &Manifest,
    key: &SigningKey,
    signer_name: &str,
) -> PackageResult<Manifest> {
    PackageSigner::new(key.clone(), signer_name).sign(manifest)
}

/// Name of the key that produced a signature; used to pick the verification key
pub fn get_signer_name(block: &SignatureBlock) -> &str {
    &block.signer
}

/// Verify the manifest signature against `public_key`.
///
/// Invalid or missing signatures are reported, never returned as errors.
pub fn verify_signature(manifest: &Manifest, public_key: &VerifyingKey) -> SignatureVerdict {
    let Some(block) = manifest.signature.as_ref() else {
        return SignatureVerdict::Missing;
    };

    if !block.algorithm.eq_ignore_ascii_case(ED25519) {
        return SignatureVerdict::Invalid(format!(
            "unsupported signature algorithm: {}",
            block.algorithm
        ));
    }

    let sig_bytes = match BASE64.decode(block.signature.trim()) {
        Ok(bytes) => bytes,
        Err(e) => return SignatureVerdict::Invalid(format!("signature is not valid base64: {e}")),
    };
    let signature = match Signature::from_slice(&sig_bytes) {
        Ok(sig) => sig,
        Err(_) => {
            return SignatureVerdict::Invalid(format!(
                "signature must be {} bytes, got {}",
                Signature::BYTE_SIZE,
                sig_bytes.len()
            ))
        }
    };

    let target = match manifest.signing_target() {
        Ok(target) => target,
        Err(e) => return SignatureVerdict::Invalid(format!("cannot recompute signing target: {e}")),
    };

    match public_key.verify_strict(target.as_bytes(), &signature) {
        Ok(()) => SignatureVerdict::Valid,
        Err(_) => SignatureVerdict::Invalid(format!(
            "signature by '{}' does not match manifest contents or public key",
            block.signer
        )),
    }
}

/// Verify against the public key embedded in the signature block.
///
/// A valid result only shows the archive is self-consistent; it says nothing
/// about who signed it.
pub fn verify_embedded(manifest: &Manifest) -> SignatureVerdict {
    let Some(block) = manifest.signature.as_ref() else {
        return SignatureVerdict::Missing;
    };
    let Some(encoded) = block.public_key.as_deref() else {
        return SignatureVerdict::Invalid("no embedded public key".to_string());
    };
    match decode_public_key(encoded) {
        Ok(key) => verify_signature(manifest, &key),
        Err(e) => SignatureVerdict::Invalid(e.to_string()),
    }
}

/// Base64 text form of a public key (44 characters)
pub fn encode_public_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.to_bytes())
}

pub fn decode_public_key(text: &str) -> PackageResult<VerifyingKey> {
    let bytes = BASE64
        .decode(text.trim())
        .map_err(|e| PackageError::InvalidInput(format!("public key is not valid base64: {e}")))?;
    let array: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        PackageError::InvalidInput(format!("public key must be 32 bytes, got {}", b.len()))
    })?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| PackageError::InvalidInput(format!("invalid ed25519 public key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::from_bytes(&rand::random::<[u8; 32]>())
    }

    fn manifest() -> Manifest {
        Manifest::builder("python demo.py").goal("prove it").build()
    }

    #[test]
    fn sign_then_verify() {
        let k = key();
        let signed = sign_manifest(&manifest(), &k, "default").expect("sign");
        let block = signed.signature.as_ref().expect("signature block");
        assert_eq!(get_signer_name(block), "default");
        assert_eq!(block.algorithm, ED25519);
        assert_eq!(verify_signature(&signed, &k.verifying_key()), SignatureVerdict::Valid);
    }

    #[test]
    fn signing_does_not_touch_input() {
        let original = manifest();
        let before = original.clone();
        let _ = sign_manifest(&original, &key(), "default").unwrap();
        assert_eq!(original, before);
        assert!(!original.is_signed());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signed = sign_manifest(&manifest(), &key(), "default").unwrap();
        let verdict = verify_signature(&signed, &key().verifying_key());
        assert!(matches!(verdict, SignatureVerdict::Invalid(_)));
    }

    #[test]
    fn altered_field_is_rejected() {
        let k = key();
        let mut signed = sign_manifest(&manifest(), &k, "default").unwrap();
        signed.goal = Some("something else".to_string());
        assert!(!verify_signature(&signed, &k.verifying_key()).is_valid());
    }

    #[test]
    fn unsigned_is_missing_not_invalid() {
        let verdict = verify_signature(&manifest(), &key().verifying_key());
        assert_eq!(verdict, SignatureVerdict::Missing);
        assert!(matches!(verdict.into_result(), Err(PackageError::NoSignature)));
    }

    #[test]
    fn truncated_signature_reports_length() {
        let k = key();
        let mut signed = sign_manifest(&manifest(), &k, "default").unwrap();
        let block = signed.signature.as_mut().unwrap();
        let bytes = BASE64.decode(&block.signature).unwrap();
        block.signature = BASE64.encode(&bytes[..40]);
        match verify_signature(&signed, &k.verifying_key()) {
            SignatureVerdict::Invalid(reason) => assert!(reason.contains("64 bytes")),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn resigning_replaces_signature() {
        let first = sign_manifest(&manifest(), &key(), "alice").unwrap();
        let k2 = key();
        let second = sign_manifest(&first, &k2, "bob").unwrap();
        assert_eq!(second.signature.as_ref().unwrap().signer, "bob");
        assert!(verify_signature(&second, &k2.verifying_key()).is_valid());
    }

    #[test]
    fn embedded_key_self_consistency() {
        let signed = sign_manifest(&manifest(), &key(), "default").unwrap();
        assert!(verify_embedded(&signed).is_valid());

        let mut tampered = signed.clone();
        tampered.cli_command = "rm -rf /".to_string();
        assert!(!verify_embedded(&tampered).is_valid());
    }

    #[test]
    fn public_key_text_roundtrip() {
        let vk = key().verifying_key();
        let text = encode_public_key(&vk);
        assert_eq!(text.len(), 44);
        assert_eq!(decode_public_key(&text).unwrap(), vk);
        assert!(decode_public_key("AAAA").is_err());
    }
}
