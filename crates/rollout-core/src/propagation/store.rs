//! Record stores hold the documents propagation targets live in.

use crate::error::{Result, RolloutError};
use crate::io;
use crate::propagation::target::StoreKind;
use crate::propagation::yaml_edit;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// A record as read: the parsed document plus the exact bytes it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub document: serde_json::Value,
    pub raw: Vec<u8>,
    pub checksum: String,
}

impl RecordSnapshot {
    pub fn new(document: serde_json::Value, raw: Vec<u8>) -> Self {
        let checksum = checksum(&raw);
        Self {
            document,
            raw,
            checksum,
        }
    }
}

/// SHA-256 hex of a byte slice.
pub fn checksum(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub trait RecordStore: Send + Sync {
    fn read<'a>(&'a self, record: &'a str) -> BoxFuture<'a, Result<RecordSnapshot>>;

    fn write<'a>(
        &'a self,
        record: &'a str,
        document: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<()>>;
}

// ---------------------------------------------------------------------------
// FileRecordStore
// ---------------------------------------------------------------------------

/// Records are YAML (or JSON, which is valid YAML) files relative to `root`.
///
/// A file with several `---` separated documents reads as an array of them,
/// so fields are addressed as `/<index>/...`. Writes edit the changed scalars
/// in place; other bytes of the file are kept.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, record: &str) -> Result<PathBuf> {
        let rel = Path::new(record);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if record.is_empty() || escapes {
            return Err(RolloutError::RecordStore(format!(
                "record path '{record}' must be relative to the project root"
            )));
        }
        Ok(self.root.join(rel))
    }

    fn read_raw(&self, record: &str) -> Result<(PathBuf, Vec<u8>)> {
        let path = self.path_of(record)?;
        match std::fs::read(&path) {
            Ok(raw) => Ok((path, raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RolloutError::RecordNotFound(record.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_sync(&self, record: &str) -> Result<RecordSnapshot> {
        let (_, raw) = self.read_raw(record)?;
        let document = join_documents(parse_documents(&raw)?);
        Ok(RecordSnapshot::new(document, raw))
    }

    fn write_sync(&self, record: &str, document: &Value) -> Result<()> {
        let (path, raw) = self.read_raw(record)?;
        let old = parse_documents(&raw)?;
        let new = match (old.len(), document) {
            (0 | 1, doc) => vec![doc.clone()],
            (n, Value::Array(docs)) if docs.len() == n => docs.clone(),
            (n, _) => {
                return Err(RolloutError::RecordStore(format!(
                    "{record} holds {n} documents; a write must supply all of them"
                )))
            }
        };

        let edited = std::str::from_utf8(&raw)
            .ok()
            .and_then(|text| yaml_edit::rewrite(text, &old, &new))
            .filter(|text| parse_documents(text.as_bytes()).is_ok_and(|docs| docs == new));
        let text = match edited {
            Some(text) => text,
            None => {
                warn!(record, "layout not editable in place; rewriting the whole file");
                render_documents(&new)?
            }
        };
        io::atomic_write(&path, text.as_bytes())
    }
}

fn parse_documents(raw: &[u8]) -> Result<Vec<Value>> {
    serde_yaml::Deserializer::from_slice(raw)
        .map(|doc| Value::deserialize(doc).map_err(RolloutError::from))
        .collect()
}

fn join_documents(mut docs: Vec<Value>) -> Value {
    match docs.len() {
        0 => Value::Null,
        1 => docs.remove(0),
        _ => Value::Array(docs),
    }
}

fn render_documents(docs: &[Value]) -> Result<String> {
    let rendered = docs
        .iter()
        .map(serde_yaml::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rendered.join("---\n"))
}

impl RecordStore for FileRecordStore {
    fn read<'a>(&'a self, record: &'a str) -> BoxFuture<'a, Result<RecordSnapshot>> {
        Box::pin(async move { self.read_sync(record) })
    }

    fn write<'a>(
        &'a self,
        record: &'a str,
        document: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write_sync(record, document) })
    }
}

// ---------------------------------------------------------------------------
// RecordStores
// ---------------------------------------------------------------------------

/// One store per [`StoreKind`]. The object store is absent when no cluster
/// connection was set up.
#[derive(Clone)]
pub struct RecordStores {
    pub file: Arc<dyn RecordStore>,
    pub object: Option<Arc<dyn RecordStore>>,
}

impl RecordStores {
    pub fn files_only(root: &Path) -> Self {
        Self {
            file: Arc::new(FileRecordStore::new(root)),
            object: None,
        }
    }

    pub fn get(&self, kind: StoreKind) -> Result<&dyn RecordStore> {
        match kind {
            StoreKind::File => Ok(self.file.as_ref()),
            StoreKind::Object => self.object.as_deref().ok_or_else(|| {
                RolloutError::RecordStore("no cluster connection for object records".into())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_store_reads_yaml_and_rewrites() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("apps")).unwrap();
        std::fs::write(
            dir.path().join("apps/kc.yaml"),
            "data:\n  KC_HOSTNAME: old.example   # pinned\n",
        )
        .unwrap();
        let store = FileRecordStore::new(dir.path());

        let snap = store.read("apps/kc.yaml").await.unwrap();
        assert_eq!(snap.document["data"]["KC_HOSTNAME"], "old.example");
        assert_eq!(snap.checksum, checksum(&snap.raw));
        assert_eq!(snap.checksum.len(), 64);

        let mut doc = snap.document.clone();
        doc["data"]["KC_HOSTNAME"] = "lb.example".into();
        store.write("apps/kc.yaml", &doc).await.unwrap();
        let again = store.read("apps/kc.yaml").await.unwrap();
        assert_eq!(again.document["data"]["KC_HOSTNAME"], "lb.example");
        assert_ne!(again.checksum, snap.checksum);
    }

    #[tokio::test]
    async fn write_keeps_unrelated_keys_order_and_comments() {
        let dir = TempDir::new().unwrap();
        let original = "\
apiVersion: v1
kind: ConfigMap
# owned by the identity team
metadata:
  name: kc
data:
  KC_HOSTNAME: old.example   # set at bootstrap
  ADMIN_USER: admin
";
        std::fs::write(dir.path().join("kc.yaml"), original).unwrap();
        let store = FileRecordStore::new(dir.path());

        let mut doc = store.read("kc.yaml").await.unwrap().document;
        doc["data"]["KC_HOSTNAME"] = "lb.example.com".into();
        store.write("kc.yaml", &doc).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("kc.yaml")).unwrap();
        assert_eq!(written, original.replace("old.example", "lb.example.com"));
    }

    #[tokio::test]
    async fn multi_document_files_read_as_an_array() {
        let dir = TempDir::new().unwrap();
        let original = "kind: Service\nmetadata:\n  name: kc\n---\nkind: ConfigMap\ndata:\n  HOST: old\n";
        std::fs::write(dir.path().join("kc.yaml"), original).unwrap();
        let store = FileRecordStore::new(dir.path());

        let mut doc = store.read("kc.yaml").await.unwrap().document;
        assert_eq!(doc[0]["kind"], "Service");
        assert_eq!(doc.pointer("/1/data/HOST").unwrap(), "old");

        doc[1]["data"]["HOST"] = "new".into();
        store.write("kc.yaml", &doc).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("kc.yaml")).unwrap();
        assert_eq!(written, original.replace("HOST: old", "HOST: new"));

        let err = store.write("kc.yaml", &doc[0]).await.unwrap_err();
        assert!(err.to_string().contains("holds 2 documents"), "{err}");
    }

    #[tokio::test]
    async fn flow_style_falls_back_to_whole_file_rewrite() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kc.yaml"), "zeta: 1\ndata: {HOST: old}\n").unwrap();
        let store = FileRecordStore::new(dir.path());

        let mut doc = store.read("kc.yaml").await.unwrap().document;
        doc["data"]["HOST"] = "new".into();
        store.write("kc.yaml", &doc).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("kc.yaml")).unwrap();
        assert_eq!(written, "zeta: 1\ndata:\n  HOST: new\n");
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::new(dir.path());
        let err = store.read("nope.yaml").await.unwrap_err();
        assert!(matches!(err, RolloutError::RecordNotFound(_)));
    }

    #[test]
    fn paths_cannot_escape_root() {
        let store = FileRecordStore::new("/repo");
        assert!(store.path_of("../etc/passwd").is_err());
        assert!(store.path_of("/etc/passwd").is_err());
        assert_eq!(
            store.path_of("apps/kc.yaml").unwrap(),
            PathBuf::from("/repo/apps/kc.yaml")
        );
    }

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn object_store_required_for_object_records() {
        let stores = RecordStores::files_only(Path::new("/repo"));
        assert!(stores.get(StoreKind::File).is_ok());
        assert!(stores.get(StoreKind::Object).is_err());
    }
}
