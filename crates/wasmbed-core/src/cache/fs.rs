use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;
use wasmbed_toolchain::{ArtifactMetadata, BuildArtifact, Digest};

use super::{ArtifactStore, CacheError, Result};

/// Filesystem-backed artifact store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex>/<remaining hex>.wasm` with the
/// metadata in a `.json` sidecar next to it. Both files are written
/// atomically; the sidecar is written last so a present sidecar implies a
/// complete payload.
pub struct FsArtifactStore {
    objects_dir: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn shard(&self, fingerprint: &Digest) -> (PathBuf, String) {
        let hex = fingerprint.to_hex();
        (self.objects_dir.join(&hex[..2]), hex[2..].to_string())
    }

    fn payload_path(&self, fingerprint: &Digest) -> PathBuf {
        let (dir, rest) = self.shard(fingerprint);
        dir.join(format!("{rest}.wasm"))
    }

    fn metadata_path(&self, fingerprint: &Digest) -> PathBuf {
        let (dir, rest) = self.shard(fingerprint);
        dir.join(format!("{rest}.json"))
    }
}

fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::Io(e)),
    }
}

impl ArtifactStore for FsArtifactStore {
    fn load(&self, fingerprint: &Digest) -> Result<Option<BuildArtifact>> {
        let meta_bytes = match fs::read(self.metadata_path(fingerprint)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };
        let metadata: ArtifactMetadata = serde_json::from_slice(&meta_bytes)?;

        let payload = fs::read(self.payload_path(fingerprint)).map_err(|e| CacheError::Corrupt {
            fingerprint: *fingerprint,
            reason: format!("payload unreadable: {e}"),
        })?;
        if payload.len() as u64 != metadata.size {
            return Err(CacheError::Corrupt {
                fingerprint: *fingerprint,
                reason: format!("expected {} bytes, found {}", metadata.size, payload.len()),
            });
        }

        Ok(Some(BuildArtifact::new(payload, metadata)))
    }

    fn save(&self, artifact: &BuildArtifact) -> Result<()> {
        let fingerprint = artifact.fingerprint();
        let (shard_dir, _) = self.shard(&fingerprint);
        fs::create_dir_all(&shard_dir)?;

        write_atomic(&shard_dir, &self.payload_path(&fingerprint), artifact.bytes())?;
        let metadata = serde_json::to_vec_pretty(artifact.metadata())?;
        write_atomic(&shard_dir, &self.metadata_path(&fingerprint), &metadata)?;
        debug!(fingerprint = %fingerprint.short(16), "Persisted artifact");
        Ok(())
    }

    fn remove(&self, fingerprint: &Digest) -> Result<()> {
        // Sidecar first: without it the payload is never loaded.
        remove_if_present(&self.metadata_path(fingerprint))?;
        remove_if_present(&self.payload_path(fingerprint))
    }

    fn list(&self) -> Result<Vec<ArtifactMetadata>> {
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.objects_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "json") {
                    let bytes = fs::read(&path)?;
                    match serde_json::from_slice::<ArtifactMetadata>(&bytes) {
                        Ok(meta) => out.push(meta),
                        Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable sidecar"),
                    }
                }
            }
        }
        Ok(out)
    }

    fn clear(&self) -> Result<usize> {
        let count = self.list()?.len();
        fs::remove_dir_all(&self.objects_dir)?;
        fs::create_dir_all(&self.objects_dir)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{artifact, artifact_at};

    fn make_store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn save_load_roundtrip() {
        let (_dir, store) = make_store();
        let a = artifact("add", b"one");
        store.save(&a).unwrap();
        let loaded = store.load(&a.fingerprint()).unwrap().expect("present");
        assert_eq!(loaded, a);
    }

    #[test]
    fn sharded_layout() {
        let (dir, store) = make_store();
        let a = artifact("add", b"one");
        store.save(&a).unwrap();

        let hex = a.fingerprint().to_hex();
        let shard = dir.path().join("objects").join(&hex[..2]);
        assert!(shard.join(format!("{}.wasm", &hex[2..])).exists());
        assert!(shard.join(format!("{}.json", &hex[2..])).exists());
    }

    #[test]
    fn save_is_idempotent() {
        let (dir, store) = make_store();
        let a = artifact("add", b"one");
        store.save(&a).unwrap();
        store.save(&a).unwrap();

        let hex = a.fingerprint().to_hex();
        let shard = dir.path().join("objects").join(&hex[..2]);
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 2);
    }

    #[test]
    fn load_missing_is_none() {
        let (_dir, store) = make_store();
        assert!(store.load(&Digest::compute(b"missing")).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let (_dir, store) = make_store();
        let a = artifact("add", b"one");
        store.save(&a).unwrap();
        std::fs::write(store.payload_path(&a.fingerprint()), b"\0as").unwrap();

        match store.load(&a.fingerprint()) {
            Err(CacheError::Corrupt { fingerprint, .. }) => assert_eq!(fingerprint, a.fingerprint()),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn list_remove_clear() {
        let (_dir, store) = make_store();
        let a = artifact_at("/w/a", b"a");
        let b = artifact_at("/w/b", b"b");
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);

        store.remove(&a.fingerprint()).unwrap();
        store.remove(&a.fingerprint()).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].fingerprint, b.fingerprint());

        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.list().unwrap().is_empty());
    }
}
