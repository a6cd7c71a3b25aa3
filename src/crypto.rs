use bincode::Options;
use pbft_rpc::{MsgSignature, Request, RequestInner};
use secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest as _, Sha256};

pub type Digest = [u8; 32];

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("cannot encode request body: {0}")]
    Encode(#[from] bincode::Error),
    #[error("cannot sign digest: {0}")]
    Sign(#[source] secp256k1::Error),
}

thread_local! {
    static SECP: Secp256k1<All> = Secp256k1::new();
}

/// SHA-256 over the canonical encoding of the request body.
pub fn digest(inner: &RequestInner) -> Result<Digest, SigningError> {
    let buf = bincode::options().serialize(inner)?;
    let mut digest = [0; 32];
    digest.copy_from_slice(&Sha256::digest(buf));
    Ok(digest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signer(SecretKey);

impl Signer {
    pub fn generate() -> Self {
        Self(SecretKey::new(&mut rand::thread_rng()))
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(Self(SecretKey::from_slice(bytes)?))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }

    /// Sign digest bytes. Anything that is not exactly a 32-byte digest is
    /// refused rather than hashed again.
    pub fn sign(&self, digest: &[u8]) -> Result<MsgSignature, SigningError> {
        let message = Message::from_digest_slice(digest).map_err(SigningError::Sign)?;
        let compact = SECP
            .with(|secp| secp.sign_ecdsa(&message, &self.0))
            .serialize_compact();
        let mut signature = MsgSignature {
            r: [0; 32],
            s: [0; 32],
        };
        signature.r.copy_from_slice(&compact[..32]);
        signature.s.copy_from_slice(&compact[32..]);
        Ok(signature)
    }

    pub fn verifier(&self) -> Verifier {
        Verifier(SECP.with(|secp| PublicKey::from_secret_key(secp, &self.0)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verifier(PublicKey);

impl Verifier {
    pub fn verify(&self, digest: &[u8], signature: &MsgSignature) -> crate::Result<()> {
        let message = Message::from_digest_slice(digest)?;
        let mut compact = [0; 64];
        compact[..32].copy_from_slice(&signature.r);
        compact[32..].copy_from_slice(&signature.s);
        let signature = ecdsa::Signature::from_compact(&compact)?;
        SECP.with(|secp| secp.verify_ecdsa(&message, &signature, &self.0))?;
        Ok(())
    }
}

/// Check that the carried digest matches the body and, if a verifier is given,
/// that the request is signed over that digest.
pub fn verify_request(request: &Request, verifier: Option<&Verifier>) -> crate::Result<()> {
    if digest(&request.inner)?[..] != request.digest[..] {
        crate::bail!("digest does not match request body")
    }
    let Some(verifier) = verifier else {
        return Ok(());
    };
    let Some(signature) = &request.signature else {
        crate::bail!("missing signature")
    };
    verifier.verify(&request.digest, signature)
}

#[cfg(test)]
mod tests {
    use pbft_rpc::TYPE_REQUEST;
    use proptest::prelude::*;

    use super::*;

    fn inner(id: i32, msg: &[u8], timestamp: i64) -> RequestInner {
        RequestInner {
            id,
            seq: 0,
            view: 0,
            kind: TYPE_REQUEST,
            msg: msg.to_vec(),
            timestamp,
        }
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(id: i32, msg: Vec<u8>, timestamp: i64) {
            let body = inner(id, &msg, timestamp);
            prop_assert_eq!(digest(&body).unwrap(), digest(&body.clone()).unwrap());
        }

        #[test]
        fn digest_tracks_every_field(id: i32, msg: Vec<u8>, timestamp: i64) {
            let base = digest(&inner(id, &msg, timestamp)).unwrap();
            prop_assert_ne!(base, digest(&inner(id.wrapping_add(1), &msg, timestamp)).unwrap());
            prop_assert_ne!(base, digest(&inner(id, &msg, timestamp.wrapping_add(1))).unwrap());
            let mut other = msg.clone();
            other.push(0);
            prop_assert_ne!(base, digest(&inner(id, &other, timestamp)).unwrap());
        }
    }

    #[test]
    fn signature_covers_digest() {
        let signer = Signer::generate();
        let body = inner(4, b"Request 0", 1);
        let digest = digest(&body).unwrap();
        let signature = signer.sign(&digest).unwrap();
        signer.verifier().verify(&digest, &signature).unwrap();

        let other = super::digest(&inner(4, b"Request 1", 1)).unwrap();
        assert!(signer.verifier().verify(&other, &signature).is_err());
        assert!(Signer::generate().verifier().verify(&digest, &signature).is_err());
    }

    #[test]
    fn signing_short_digest_fails_explicitly() {
        let signer = Signer::generate();
        assert!(matches!(signer.sign(&[0; 20]), Err(SigningError::Sign(_))));
    }

    #[test]
    fn request_verification() {
        let signer = Signer::generate();
        let body = inner(4, b"Request 0", 1);
        let digest = digest(&body).unwrap().to_vec();
        let mut request = Request {
            signature: Some(signer.sign(&digest).unwrap()),
            inner: body,
            digest,
        };
        verify_request(&request, Some(&signer.verifier())).unwrap();

        request.inner.msg = b"Request 9".to_vec();
        assert!(verify_request(&request, None).is_err());
    }

    #[test]
    fn secret_bytes_round_trip() {
        let signer = Signer::generate();
        assert_eq!(Signer::from_bytes(&signer.to_bytes()).unwrap(), signer);
        assert!(Signer::from_bytes(&[0; 32]).is_err());
    }
}
