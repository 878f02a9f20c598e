//! # Content-Addressed Store
//!
//! Persists opaque blobs on the local filesystem keyed by a node id and a
//! storage key. The on-disk location is derived from a 128-bit hex digest
//! of the user key:
//!
//! ```text
//! <root>/<node_id>/<group0>/.../<group5>/<hashed_key>
//! ```
//!
//! where each group is five consecutive characters of the digest (the two
//! trailing characters are discarded). The per-node-id prefix segregates
//! replicas received from different origin nodes.
//!
//! Path derivation is pure: the same key yields the same path on every
//! node, so any observer that can compute the digest can predict the
//! layout.
//!
//! Writes land in a sibling temporary file and are renamed into place on
//! completion, so a crashed or aborted transfer never leaves a truncated
//! blob under the final path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::crypto::hash_key;

/// Number of digest characters per directory level.
const GROUP_LEN: usize = 5;

/// Chunk size for copying blob data to disk.
const WRITE_CHUNK: usize = 8192;

/// A derived storage location: a directory path plus a file basename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub dir: String,
    pub file: String,
}

impl PathKey {
    /// Split an already-hashed key into directory groups of
    /// [`GROUP_LEN`] characters; only complete groups become directories,
    /// the full digest becomes the file name.
    pub fn from_hashed(hashed: &str) -> Self {
        let chars: Vec<char> = hashed.chars().collect();
        let dir = chars
            .chunks_exact(GROUP_LEN)
            .map(|group| group.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            dir,
            file: hashed.to_string(),
        }
    }

    /// 1:1 mapping used by tests: the key is both directory and file.
    pub fn identity(key: &str) -> Self {
        Self {
            dir: key.to_string(),
            file: key.to_string(),
        }
    }

    /// The first directory component, the unit [`Store::delete`] prunes.
    pub fn first_dir(&self) -> &str {
        match self.dir.find('/') {
            Some(pos) => &self.dir[..pos],
            None => &self.dir,
        }
    }
}

/// Strategy for mapping keys onto filesystem paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathTransform {
    /// Hash the user key, then split the digest into directory groups.
    ContentAddressed,
    /// Use the key verbatim. Only meaningful in tests.
    Identity,
}

impl PathTransform {
    /// Full derivation from a user-supplied key.
    pub fn derive(&self, user_key: &str) -> PathKey {
        match self {
            PathTransform::ContentAddressed => PathKey::from_hashed(&hash_key(user_key)),
            PathTransform::Identity => PathKey::identity(user_key),
        }
    }

    /// Derivation from a key that is already in stored form (a digest for
    /// the content-addressed transform). Never hashes twice.
    pub fn resolve(&self, stored_key: &str) -> PathKey {
        match self {
            PathTransform::ContentAddressed => PathKey::from_hashed(stored_key),
            PathTransform::Identity => PathKey::identity(stored_key),
        }
    }
}

pub struct Store {
    root: PathBuf,
    transform: PathTransform,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, transform })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, node_id: &str, path_key: &PathKey) -> PathBuf {
        self.root.join(node_id).join(&path_key.dir).join(&path_key.file)
    }

    /// Write a blob under a key already in stored form. Returns the number
    /// of bytes written.
    pub fn write<R>(&self, node_id: &str, stored_key: &str, data: &mut R) -> io::Result<u64>
    where
        R: Read + ?Sized,
    {
        let path_key = self.transform.resolve(stored_key);
        self.write_blob(node_id, &path_key, data)
    }

    /// Apply the configured transform to a user key, then write.
    pub fn hash_and_write<R>(&self, node_id: &str, user_key: &str, data: &mut R) -> io::Result<u64>
    where
        R: Read + ?Sized,
    {
        let path_key = self.transform.derive(user_key);
        self.write_blob(node_id, &path_key, data)
    }

    fn write_blob<R>(&self, node_id: &str, path_key: &PathKey, data: &mut R) -> io::Result<u64>
    where
        R: Read + ?Sized,
    {
        let path = self.blob_path(node_id, path_key);
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "blob path has no parent"))?;
        fs::create_dir_all(parent)?;

        // Stage into a sibling temp file; the blob becomes visible under
        // its final name only once fully written.
        let staging = parent.join(format!("{}.partial", path_key.file));
        let written = match copy_chunked(data, &staging) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
        };
        fs::rename(&staging, &path)?;

        debug!(path = %path.display(), bytes = written, "blob written");
        Ok(written)
    }

    /// Open a blob addressed by user key. Returns its size and a reader.
    pub fn read(&self, node_id: &str, user_key: &str) -> io::Result<(u64, File)> {
        self.read_at(self.blob_path(node_id, &self.transform.derive(user_key)))
    }

    /// Open a blob addressed by a key in stored form.
    pub fn read_stored(&self, node_id: &str, stored_key: &str) -> io::Result<(u64, File)> {
        self.read_at(self.blob_path(node_id, &self.transform.resolve(stored_key)))
    }

    fn read_at(&self, path: PathBuf) -> io::Result<(u64, File)> {
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok((size, file))
    }

    pub fn has(&self, node_id: &str, user_key: &str) -> bool {
        self.blob_path(node_id, &self.transform.derive(user_key)).is_file()
    }

    pub fn has_stored(&self, node_id: &str, stored_key: &str) -> bool {
        self.blob_path(node_id, &self.transform.resolve(stored_key)).is_file()
    }

    /// Find any node-id prefix holding a blob with the given stored key.
    /// Used to serve fetches for replicas regardless of their origin.
    pub fn find_origin(&self, stored_key: &str) -> Option<String> {
        let path_key = self.transform.resolve(stored_key);
        let entries = fs::read_dir(&self.root).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let node_id = name.to_string_lossy();
            if self.blob_path(&node_id, &path_key).is_file() {
                return Some(node_id.into_owned());
            }
        }
        None
    }

    /// Remove the blob for a user key, pruning the whole subtree under the
    /// first derived directory component.
    pub fn delete(&self, node_id: &str, user_key: &str) -> bool {
        let path_key = self.transform.derive(user_key);
        let target = self.root.join(node_id).join(path_key.first_dir());
        match fs::remove_dir_all(&target) {
            Ok(()) => true,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %target.display(), error = %e, "delete failed");
                }
                false
            }
        }
    }

    /// Remove the entire storage root.
    pub fn clear(&self) -> bool {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => true,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(root = %self.root.display(), error = %e, "clear failed");
                }
                false
            }
        }
    }
}

fn copy_chunked<R>(data: &mut R, dest: &Path) -> io::Result<u64>
where
    R: Read + ?Sized,
{
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest)?;

    let mut buffer = [0u8; WRITE_CHUNK];
    let mut written: u64 = 0;
    loop {
        let n = data.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])?;
        written += n as u64;
    }
    file.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;
    use tempfile::tempdir;

    const NODE: &str = "node-a";

    fn cas_store(dir: &Path) -> Store {
        Store::new(dir.join("blobs"), PathTransform::ContentAddressed).expect("store init")
    }

    #[test]
    fn splits_digest_into_five_char_groups() {
        let key = PathKey::from_hashed("9e107d9d372bb6826bd81d3542a419d6");
        assert_eq!(key.dir, "9e107/d9d37/2bb68/26bd8/1d354/2a419");
        assert_eq!(key.file, "9e107d9d372bb6826bd81d3542a419d6");
        assert_eq!(key.first_dir(), "9e107");
    }

    #[test]
    fn identity_transform_maps_key_onto_itself() {
        let key = PathTransform::Identity.derive("plain.txt");
        assert_eq!(key.dir, "plain.txt");
        assert_eq!(key.file, "plain.txt");
        assert_eq!(key.first_dir(), "plain.txt");
    }

    #[test]
    fn derive_hashes_resolve_does_not() {
        let transform = PathTransform::ContentAddressed;
        let derived = transform.derive("a");
        let resolved = transform.resolve("0cc175b9c0f1b6a831c399e269772661");
        assert_eq!(derived, resolved);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());

        let written = store
            .hash_and_write(NODE, "greeting", &mut Cursor::new(b"hello, dfs"))
            .unwrap();
        assert_eq!(written, 10);
        assert!(store.has(NODE, "greeting"));

        let (size, mut file) = store.read(NODE, "greeting").unwrap();
        assert_eq!(size, 10);
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello, dfs");
    }

    #[test]
    fn write_by_stored_key_matches_user_key_lookup() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());

        let hashed = hash_key("report.pdf");
        store.write(NODE, &hashed, &mut Cursor::new(b"contents")).unwrap();

        assert!(store.has(NODE, "report.pdf"));
        assert!(store.has_stored(NODE, &hashed));
        let (size, _) = store.read_stored(NODE, &hashed).unwrap();
        assert_eq!(size, 8);
    }

    #[test]
    fn blob_lands_under_expected_path() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());
        store.hash_and_write(NODE, "a", &mut Cursor::new(b"hello, dfs")).unwrap();

        let expected = store
            .root()
            .join(NODE)
            .join("0cc17/5b9c0/f1b6a/831c3/99e26/97726")
            .join("0cc175b9c0f1b6a831c399e269772661");
        assert!(expected.is_file());
        assert_eq!(fs::metadata(&expected).unwrap().len(), 10);
    }

    #[test]
    fn no_staging_file_survives_a_write() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());
        store.hash_and_write(NODE, "doc", &mut Cursor::new(vec![1u8; 20_000])).unwrap();

        let mut pending = vec![store.root().to_path_buf()];
        while let Some(path) = pending.pop() {
            for entry in fs::read_dir(&path).unwrap().flatten() {
                let p = entry.path();
                if p.is_dir() {
                    pending.push(p);
                } else {
                    assert!(
                        !p.to_string_lossy().ends_with(".partial"),
                        "staging file left behind: {}",
                        p.display()
                    );
                }
            }
        }
    }

    #[test]
    fn overwrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());

        store.hash_and_write(NODE, "k", &mut Cursor::new(b"first")).unwrap();
        store.hash_and_write(NODE, "k", &mut Cursor::new(b"second!")).unwrap();

        let (size, mut file) = store.read(NODE, "k").unwrap();
        assert_eq!(size, 7);
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "second!");
    }

    #[test]
    fn node_id_prefixes_do_not_collide() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());

        store.hash_and_write("origin-1", "shared", &mut Cursor::new(b"from one")).unwrap();
        store.hash_and_write("origin-2", "shared", &mut Cursor::new(b"from two")).unwrap();

        let (_, mut a) = store.read("origin-1", "shared").unwrap();
        let (_, mut b) = store.read("origin-2", "shared").unwrap();
        let (mut one, mut two) = (String::new(), String::new());
        a.read_to_string(&mut one).unwrap();
        b.read_to_string(&mut two).unwrap();
        assert_eq!(one, "from one");
        assert_eq!(two, "from two");
    }

    #[test]
    fn find_origin_scans_replica_prefixes() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());
        let hashed = hash_key("replica");

        assert_eq!(store.find_origin(&hashed), None);
        store.write("remote-node", &hashed, &mut Cursor::new(b"payload")).unwrap();
        assert_eq!(store.find_origin(&hashed), Some("remote-node".to_string()));
    }

    #[test]
    fn delete_prunes_first_directory_component() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());
        store.hash_and_write(NODE, "victim", &mut Cursor::new(b"bytes")).unwrap();

        assert!(store.delete(NODE, "victim"));
        assert!(!store.has(NODE, "victim"));

        let first = PathTransform::ContentAddressed.derive("victim");
        assert!(!store.root().join(NODE).join(first.first_dir()).exists());
        assert!(!store.delete(NODE, "victim"), "second delete finds nothing");
    }

    #[test]
    fn clear_removes_storage_root() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());
        store.hash_and_write(NODE, "x", &mut Cursor::new(b"1")).unwrap();

        assert!(store.clear());
        assert!(!store.root().exists());
        assert!(!store.clear());
    }

    #[test]
    fn missing_blob_reports_not_found() {
        let dir = tempdir().unwrap();
        let store = cas_store(dir.path());
        assert!(!store.has(NODE, "ghost"));
        let err = store.read(NODE, "ghost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn thousand_key_corpus_is_collision_free() {
        let mut paths = HashSet::new();
        for i in 0..1000 {
            let key = format!("corpus-key-{}", i);
            let derived = PathTransform::ContentAddressed.derive(&key);
            assert!(paths.insert(format!("{}/{}", derived.dir, derived.file)));
        }
    }
}
