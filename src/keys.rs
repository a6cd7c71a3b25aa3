//! Per-participant signing keys, regenerated for every run.
//!
//! Participant `i` keeps its secret key in `<dir>/sign<i>.pem`: the hex-encoded
//! 32-byte secp256k1 secret wrapped in a PEM-style envelope.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::crypto::Signer;

const BEGIN: &str = "-----BEGIN SECP256K1 PRIVATE KEY-----";
const END: &str = "-----END SECP256K1 PRIVATE KEY-----";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file {0} not found")]
    NotFound(PathBuf),
    #[error("key file {path} is unparsable: {reason}")]
    Unparsable { path: PathBuf, reason: String },
    #[error("key file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

pub fn key_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("sign{index}.pem"))
}

/// Write `n` fresh keys, replacing whatever is already there.
pub fn generate_keys(dir: &Path, n: usize) -> Result<(), KeyError> {
    fs::create_dir_all(dir).map_err(|source| KeyError::Io {
        path: dir.into(),
        source,
    })?;
    for index in 0..n {
        let path = key_path(dir, index);
        let encoded = format!("{BEGIN}\n{}\n{END}\n", hex::encode(Signer::generate().to_bytes()));
        fs::write(&path, encoded).map_err(|source| KeyError::Io { path, source })?
    }
    tracing::info!("generated {n} key pairs in {}", dir.display());
    Ok(())
}

pub fn load_key(dir: &Path, index: usize) -> Result<Signer, KeyError> {
    let path = key_path(dir, index);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(KeyError::NotFound(path)),
        Err(source) => return Err(KeyError::Io { path, source }),
    };
    let unparsable = |reason: String| KeyError::Unparsable {
        path: path.clone(),
        reason,
    };
    let body = text
        .trim()
        .strip_prefix(BEGIN)
        .and_then(|text| text.strip_suffix(END))
        .ok_or_else(|| unparsable("missing PEM envelope".into()))?;
    let bytes = hex::decode(body.trim()).map_err(|err| unparsable(err.to_string()))?;
    Signer::from_bytes(&bytes).map_err(|err| unparsable(err.to_string()))
}
