//! Collection registry and the write handlers behind the dispatcher.
//!
//! The registry mirrors collection metadata kept in the store under a meta
//! prefix. `load` rebuilds it from disk, which happens on every fresh boot
//! and after a snapshot install. The handlers here are the store-mutating
//! half of the HTTP layer: the apply loop hands them committed requests
//! through the dispatcher and waits for the response to be filled.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, ServerError};
use crate::http::ApiRequest;
use crate::store::Store;

const COLLECTION_META_PREFIX: &str = "@collections/";
const DOCUMENT_PREFIX: &str = "@documents/";
const API_KEY_PREFIX: &str = "@keys/";
const ALIAS_PREFIX: &str = "@aliases/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    #[serde(default)]
    pub num_memory_shards: u32,
}

pub fn doc_key(collection: &str, id: &str) -> String {
    format!("{}{}/{}", DOCUMENT_PREFIX, collection, id)
}

pub struct CollectionManager {
    store: Arc<Store>,
    collections: RwLock<HashMap<String, CollectionMeta>>,
}

impl CollectionManager {
    pub fn new(store: Arc<Store>) -> CollectionManager {
        CollectionManager {
            store,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory registry from the store. Called once per
    /// `init_db`, i.e. on fresh start and after snapshot install.
    pub fn load(&self) -> Result<usize> {
        let metas = self.store.scan_prefix(COLLECTION_META_PREFIX)?;
        let mut registry = self.collections.write();
        registry.clear();
        for (key, value) in metas {
            let meta: CollectionMeta = serde_json::from_slice(&value).map_err(|e| {
                ServerError::Collections(format!("bad collection meta at {}: {}", key, e))
            })?;
            registry.insert(meta.name.clone(), meta);
        }
        Ok(registry.len())
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    /// Execute a mutating request against the store, returning the HTTP
    /// status and response body. Dispatch mirrors the route table: only the
    /// mutation routes are known here, everything else is the HTTP layer's
    /// problem and gets a 404.
    pub fn execute(&self, req: &ApiRequest) -> (u16, String) {
        let segments: Vec<&str> = req.path.split('/').filter(|s| !s.is_empty()).collect();

        let outcome = match (req.method.as_str(), segments.as_slice()) {
            ("POST", ["collections"]) => self.create_collection(&req.body),
            ("DELETE", ["collections", name]) => self.drop_collection(name),
            ("POST", ["collections", name, "documents"]) => self.upsert_document(name, &req.body),
            ("POST", ["collections", name, "documents", "import"]) => {
                self.import_documents(name, &req.body)
            }
            ("DELETE", ["collections", name, "documents", id]) => self.delete_document(name, id),
            ("POST", ["keys"]) => self.upsert_meta_record(API_KEY_PREFIX, &req.body),
            ("DELETE", ["keys", id]) => self.delete_meta_record(API_KEY_PREFIX, id),
            ("PUT", ["aliases", name]) => self.upsert_alias(name, &req.body),
            ("DELETE", ["aliases", name]) => self.delete_meta_record(ALIAS_PREFIX, name),
            _ => {
                return (
                    404,
                    format!("{{\"message\": \"Not found: {} {}\"}}", req.method, req.path),
                )
            }
        };

        match outcome {
            Ok((status, body)) => (status, body),
            Err(e) => (500, format!("{{\"message\": \"{}\"}}", e)),
        }
    }

    fn create_collection(&self, body: &str) -> Result<(u16, String)> {
        let meta: CollectionMeta = match serde_json::from_str(body) {
            Ok(m) => m,
            Err(e) => return Ok((400, format!("{{\"message\": \"invalid schema: {}\"}}", e))),
        };
        if self.contains(&meta.name) {
            return Ok((
                409,
                format!("{{\"message\": \"Collection {} already exists\"}}", meta.name),
            ));
        }
        let key = format!("{}{}", COLLECTION_META_PREFIX, meta.name);
        let value = serde_json::to_vec(&meta)
            .map_err(|e| ServerError::Collections(e.to_string()))?;
        self.store.insert(&key, &value)?;
        self.collections.write().insert(meta.name.clone(), meta);
        Ok((201, body.to_string()))
    }

    fn drop_collection(&self, name: &str) -> Result<(u16, String)> {
        if !self.contains(name) {
            return Ok((404, format!("{{\"message\": \"No collection {}\"}}", name)));
        }
        for (key, _) in self.store.scan_prefix(&format!("{}{}/", DOCUMENT_PREFIX, name))? {
            self.store.remove(&key)?;
        }
        self.store.remove(&format!("{}{}", COLLECTION_META_PREFIX, name))?;
        self.collections.write().remove(name);
        Ok((200, format!("{{\"name\": \"{}\"}}", name)))
    }

    fn upsert_document(&self, collection: &str, body: &str) -> Result<(u16, String)> {
        if !self.contains(collection) {
            return Ok((404, format!("{{\"message\": \"No collection {}\"}}", collection)));
        }
        let doc: serde_json::Value = match serde_json::from_str(body) {
            Ok(d) => d,
            Err(e) => return Ok((400, format!("{{\"message\": \"invalid document: {}\"}}", e))),
        };
        let id = match doc.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                return Ok((400, "{\"message\": \"Document must carry an `id`\"}".to_string()))
            }
        };
        self.store.insert(&doc_key(collection, &id), body.as_bytes())?;
        Ok((201, body.to_string()))
    }

    /// Imports are newline-delimited documents; each line succeeds or fails
    /// independently and the outcome is reported per line.
    fn import_documents(&self, collection: &str, body: &str) -> Result<(u16, String)> {
        if !self.contains(collection) {
            return Ok((404, format!("{{\"message\": \"No collection {}\"}}", collection)));
        }
        let mut results = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            match self.upsert_document(collection, line)? {
                (201, _) => results.push("{\"success\": true}".to_string()),
                (_, message) => {
                    results.push(format!("{{\"success\": false, \"error\": {}}}", message))
                }
            }
        }
        Ok((200, results.join("\n")))
    }

    fn delete_document(&self, collection: &str, id: &str) -> Result<(u16, String)> {
        let key = doc_key(collection, id);
        match self.store.get(&key)? {
            Some(doc) => {
                self.store.remove(&key)?;
                Ok((200, String::from_utf8_lossy(&doc).into_owned()))
            }
            None => Ok((
                404,
                format!("{{\"message\": \"Could not find a document with id: {}\"}}", id),
            )),
        }
    }

    fn upsert_meta_record(&self, prefix: &str, body: &str) -> Result<(u16, String)> {
        let value: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => return Ok((400, format!("{{\"message\": \"invalid payload: {}\"}}", e))),
        };
        let id = match value.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return Ok((400, "{\"message\": \"Payload must carry an `id`\"}".to_string())),
        };
        self.store.insert(&format!("{}{}", prefix, id), body.as_bytes())?;
        Ok((201, body.to_string()))
    }

    fn upsert_alias(&self, name: &str, body: &str) -> Result<(u16, String)> {
        let value: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => return Ok((400, format!("{{\"message\": \"invalid alias: {}\"}}", e))),
        };
        if value.get("collection_name").and_then(|v| v.as_str()).is_none() {
            return Ok((
                400,
                "{\"message\": \"Alias must carry a `collection_name`\"}".to_string(),
            ));
        }
        self.store.insert(&format!("{}{}", ALIAS_PREFIX, name), body.as_bytes())?;
        Ok((200, body.to_string()))
    }

    fn delete_meta_record(&self, prefix: &str, id: &str) -> Result<(u16, String)> {
        let key = format!("{}{}", prefix, id);
        match self.store.get(&key)? {
            Some(record) => {
                self.store.remove(&key)?;
                Ok((200, String::from_utf8_lossy(&record).into_owned()))
            }
            None => Ok((404, format!("{{\"message\": \"Not found: {}\"}}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ApiRequest;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Store>, CollectionManager) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("state")).unwrap());
        let manager = CollectionManager::new(store.clone());
        (dir, store, manager)
    }

    #[test]
    fn test_create_collection_then_upsert_document() {
        let (_dir, store, manager) = setup();

        let create = ApiRequest::new("POST", "/collections", "{\"name\": \"products\"}");
        let (status, _) = manager.execute(&create);
        assert_eq!(status, 201);

        let upsert = ApiRequest::new(
            "POST",
            "/collections/products/documents",
            "{\"id\":\"1\",\"x\":1}",
        );
        let (status, _) = manager.execute(&upsert);
        assert_eq!(status, 201);

        let stored = store.get(&doc_key("products", "1")).unwrap().unwrap();
        assert_eq!(stored, b"{\"id\":\"1\",\"x\":1}".to_vec());
    }

    #[test]
    fn test_document_requires_known_collection_and_id() {
        let (_dir, _store, manager) = setup();

        let missing = ApiRequest::new("POST", "/collections/nope/documents", "{\"id\":\"1\"}");
        assert_eq!(manager.execute(&missing).0, 404);

        manager.execute(&ApiRequest::new("POST", "/collections", "{\"name\": \"c\"}"));
        let no_id = ApiRequest::new("POST", "/collections/c/documents", "{\"x\": 1}");
        assert_eq!(manager.execute(&no_id).0, 400);
    }

    #[test]
    fn test_load_rebuilds_registry_from_store() {
        let (_dir, store, manager) = setup();
        manager.execute(&ApiRequest::new("POST", "/collections", "{\"name\": \"a\"}"));
        manager.execute(&ApiRequest::new("POST", "/collections", "{\"name\": \"b\"}"));

        let fresh = CollectionManager::new(store);
        assert!(!fresh.contains("a"));
        assert_eq!(fresh.load().unwrap(), 2);
        assert_eq!(fresh.collection_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_drop_collection_removes_documents() {
        let (_dir, store, manager) = setup();
        manager.execute(&ApiRequest::new("POST", "/collections", "{\"name\": \"c\"}"));
        manager.execute(&ApiRequest::new(
            "POST",
            "/collections/c/documents",
            "{\"id\":\"1\"}",
        ));

        let (status, _) = manager.execute(&ApiRequest::new("DELETE", "/collections/c", ""));
        assert_eq!(status, 200);
        assert_eq!(store.get(&doc_key("c", "1")).unwrap(), None);
        assert!(!manager.contains("c"));
    }

    #[test]
    fn test_import_reports_per_line_outcome() {
        let (_dir, _store, manager) = setup();
        manager.execute(&ApiRequest::new("POST", "/collections", "{\"name\": \"c\"}"));

        let import = ApiRequest::new(
            "POST",
            "/collections/c/documents/import",
            "{\"id\":\"1\"}\n{\"broken\": true}\n{\"id\":\"2\"}",
        );
        let (status, body) = manager.execute(&import);
        assert_eq!(status, 200);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("true"));
        assert!(lines[1].contains("false"));
        assert!(lines[2].contains("true"));
    }

    #[test]
    fn test_same_log_produces_same_store_state() {
        let (_dir_a, store_a, manager_a) = setup();
        let (_dir_b, store_b, manager_b) = setup();

        let log = [
            ("POST", "/collections", "{\"name\": \"c\"}"),
            ("POST", "/collections/c/documents", "{\"id\":\"1\",\"x\":1}"),
            ("POST", "/collections/c/documents", "{\"id\":\"2\",\"x\":2}"),
            ("DELETE", "/collections/c/documents/1", ""),
            ("POST", "/keys", "{\"id\":\"k1\"}"),
        ];
        for (method, path, body) in &log {
            let req = ApiRequest::new(method, path, body);
            manager_a.execute(&req);
            let req = ApiRequest::new(method, path, body);
            manager_b.execute(&req);
        }

        assert_eq!(
            store_a.scan_prefix("@").unwrap(),
            store_b.scan_prefix("@").unwrap()
        );
    }

    #[test]
    fn test_unknown_route_is_not_found() {
        let (_dir, _store, manager) = setup();
        let req = ApiRequest::new("POST", "/operations/reboot", "");
        assert_eq!(manager.execute(&req).0, 404);
    }

    #[test]
    fn test_alias_and_key_records() {
        let (_dir, store, manager) = setup();

        let key = ApiRequest::new("POST", "/keys", "{\"id\":\"k1\",\"actions\":[\"*\"]}");
        assert_eq!(manager.execute(&key).0, 201);
        assert!(store.get("@keys/k1").unwrap().is_some());

        let alias = ApiRequest::new("PUT", "/aliases/latest", "{\"collection_name\":\"c\"}");
        assert_eq!(manager.execute(&alias).0, 200);
        assert!(store.get("@aliases/latest").unwrap().is_some());

        let del = ApiRequest::new("DELETE", "/keys/k1", "");
        assert_eq!(manager.execute(&del).0, 200);
        assert!(store.get("@keys/k1").unwrap().is_none());
    }
}
