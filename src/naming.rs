//! Output naming: derive the identifier under which a document's outputs
//! are written.
//!
//! The stable policy keys the name to the input's content digest, so
//! resubmitting the same file lands on the same output subtree and the batch
//! driver can detect it is already done. The random policy produces a fresh
//! subtree on every run, for callers that want never-colliding outputs.

use crate::error::OcrError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// How a document's output subtree is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    /// `<stem>-<sha256(content)[..12]>` — identical input bytes always map
    /// to the same name. (default)
    #[default]
    Stable,
    /// `<stem>-<12 random alphanumerics>` — a new name per run.
    Random,
}

/// Derive the output name for `input` under the given policy.
///
/// The file stem is kept so outputs stay recognisable; the suffix carries
/// the distinguishing identifier.
pub fn derive_name(policy: NamingPolicy, input: &Path) -> Result<String, OcrError> {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());

    let suffix = match policy {
        NamingPolicy::Stable => {
            let bytes = std::fs::read(input).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => OcrError::FileNotFound {
                    path: input.to_path_buf(),
                },
                std::io::ErrorKind::PermissionDenied => OcrError::PermissionDenied {
                    path: input.to_path_buf(),
                },
                _ => OcrError::Internal(format!("reading {}: {e}", input.display())),
            })?;
            let digest = Sha256::digest(&bytes);
            hex_prefix(&digest, 12)
        }
        NamingPolicy::Random => rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect(),
    };

    Ok(format!("{stem}-{suffix}"))
}

fn hex_prefix(digest: &[u8], len: usize) -> String {
    let mut s = String::with_capacity(len);
    for byte in digest {
        s.push_str(&format!("{byte:02x}"));
        if s.len() >= len {
            break;
        }
    }
    s.truncate(len);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stable_name_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"%PDF-1.4 content")
            .unwrap();

        let a = derive_name(NamingPolicy::Stable, &path).unwrap();
        let b = derive_name(NamingPolicy::Stable, &path).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("report-"));
        assert_eq!(a.len(), "report-".len() + 12);
    }

    #[test]
    fn stable_name_tracks_content_not_path() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.pdf");
        let p2 = dir.path().join("b.pdf");
        std::fs::write(&p1, b"same bytes").unwrap();
        std::fs::write(&p2, b"same bytes").unwrap();

        let n1 = derive_name(NamingPolicy::Stable, &p1).unwrap();
        let n2 = derive_name(NamingPolicy::Stable, &p2).unwrap();
        // Same digest suffix, different stem.
        assert_eq!(
            n1.rsplit('-').next().unwrap(),
            n2.rsplit('-').next().unwrap()
        );
        assert_ne!(n1, n2);
    }

    #[test]
    fn random_names_differ() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"x").unwrap();

        let a = derive_name(NamingPolicy::Random, &path).unwrap();
        let b = derive_name(NamingPolicy::Random, &path).unwrap();
        assert_ne!(a, b, "random names should not collide across runs");
    }

    #[test]
    fn missing_file_maps_to_not_found() {
        let err = derive_name(NamingPolicy::Stable, Path::new("/no/such/file.pdf")).unwrap_err();
        assert!(matches!(err, OcrError::FileNotFound { .. }));
    }
}
