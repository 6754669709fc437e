//! Namespaced key-value store shared across a run.
//!
//! Mutations are serialized behind one lock, so `increment`/`append`
//! read-modify-write cycles are at-most-once. The store optionally
//! persists to disk as JSON or CSV with typed values; both formats
//! round-trip primitives, arrays, and objects preserving value and type.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use serde_json::Value;
use visor_domain::config::MemoryFormat;
use visor_domain::error::{Error, Result};

pub const DEFAULT_NAMESPACE: &str = "default";

type Namespaces = HashMap<String, HashMap<String, Value>>;

pub struct MemoryStore {
    inner: Mutex<Namespaces>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Load a store from a snapshot file, inferring the format from the
    /// config. A missing file yields an empty store.
    pub fn open(path: &Path, format: MemoryFormat) -> Result<Self> {
        let store = Self::new();
        if path.exists() {
            match format {
                MemoryFormat::Json => store.load_json(path)?,
                MemoryFormat::Csv => store.load_csv(path)?,
            }
        }
        Ok(store)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.inner.lock().get(namespace)?.get(key).cloned()
    }

    pub fn has(&self, namespace: &str, key: &str) -> bool {
        self.inner
            .lock()
            .get(namespace)
            .map(|ns| ns.contains_key(key))
            .unwrap_or(false)
    }

    /// Keys in a namespace, sorted.
    pub fn list(&self, namespace: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .lock()
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// All namespaces with at least one key, sorted.
    pub fn list_namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .iter()
            .filter(|(_, ns)| !ns.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn get_all(&self, namespace: &str) -> HashMap<String, Value> {
        self.inner.lock().get(namespace).cloned().unwrap_or_default()
    }

    /// The whole store as one JSON object (`namespace → { key → value }`),
    /// exposed to predicates and templates as `memory`.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock();
        let mut out = serde_json::Map::new();
        for (ns, entries) in inner.iter() {
            let mut ns_map = serde_json::Map::new();
            for (k, v) in entries {
                ns_map.insert(k.clone(), v.clone());
            }
            out.insert(ns.clone(), Value::Object(ns_map));
        }
        Value::Object(out)
    }

    // ── Mutations (serialized per store) ──────────────────────────────

    pub fn set(&self, namespace: &str, key: &str, value: Value) {
        self.inner
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Append to an array value. A missing key becomes a one-element
    /// array; a scalar value becomes `[old, new]`.
    pub fn append(&self, namespace: &str, key: &str, value: Value) {
        let mut inner = self.inner.lock();
        let ns = inner.entry(namespace.to_string()).or_default();
        match ns.get_mut(key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let old = existing.take();
                *existing = Value::Array(vec![old, value]);
            }
            None => {
                ns.insert(key.to_string(), Value::Array(vec![value]));
            }
        }
    }

    /// Add `delta` to a numeric value (missing keys start at 0).
    /// Returns the new value.
    pub fn increment(&self, namespace: &str, key: &str, delta: f64) -> Result<f64> {
        let mut inner = self.inner.lock();
        let ns = inner.entry(namespace.to_string()).or_default();
        let current = match ns.get(key) {
            None => 0.0,
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(other) => {
                return Err(Error::Config(format!(
                    "memory key {namespace}/{key} is not numeric: {other}"
                )))
            }
        };
        let next = current + delta;
        let number = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
            Value::from(next as i64)
        } else {
            serde_json::Number::from_f64(next)
                .map(Value::Number)
                .ok_or_else(|| Error::Config(format!("increment produced non-finite value: {next}")))?
        };
        ns.insert(key.to_string(), number);
        Ok(next)
    }

    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        self.inner
            .lock()
            .get_mut(namespace)
            .map(|ns| ns.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self, namespace: &str) {
        if let Some(ns) = self.inner.lock().get_mut(namespace) {
            ns.clear();
        }
    }

    // ── Persistence ───────────────────────────────────────────────────

    pub fn persist(&self, path: &Path, format: MemoryFormat) -> Result<()> {
        match format {
            MemoryFormat::Json => self.save_json(path),
            MemoryFormat::Csv => self.save_csv(path),
        }
    }

    /// JSON snapshot: `{ namespace: { key: value } }`, written atomically
    /// via a temp file + rename.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&snapshot)?;
        atomic_write(path, json.as_bytes())
    }

    pub fn load_json(&self, path: &Path) -> Result<()> {
        let data = std::fs::read_to_string(path)?;
        let parsed: Namespaces = serde_json::from_str(&data)?;
        *self.inner.lock() = parsed;
        Ok(())
    }

    /// CSV snapshot: `namespace,key,type,value` rows. The `type` column
    /// (`string|number|bool|json`) preserves round-trip typing.
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let inner = self.inner.lock();
        let mut buf = Vec::new();
        {
            let mut writer = csv::Writer::from_writer(&mut buf);
            writer
                .write_record(["namespace", "key", "type", "value"])
                .map_err(|e| Error::Config(format!("CSV write failed: {e}")))?;

            let mut namespaces: Vec<&String> = inner.keys().collect();
            namespaces.sort();
            for ns in namespaces {
                let entries = &inner[ns];
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                for key in keys {
                    let (kind, encoded) = encode_csv_value(&entries[key])?;
                    writer
                        .write_record([ns.as_str(), key.as_str(), kind, &encoded])
                        .map_err(|e| Error::Config(format!("CSV write failed: {e}")))?;
                }
            }
            writer
                .flush()
                .map_err(|e| Error::Config(format!("CSV write failed: {e}")))?;
        }
        atomic_write(path, &buf)
    }

    pub fn load_csv(&self, path: &Path) -> Result<()> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| Error::Config(format!("CSV read failed: {e}")))?;
        let mut parsed: Namespaces = HashMap::new();
        for record in reader.records() {
            let record = record.map_err(|e| Error::Config(format!("CSV read failed: {e}")))?;
            let (Some(ns), Some(key), Some(kind), Some(raw)) =
                (record.get(0), record.get(1), record.get(2), record.get(3))
            else {
                return Err(Error::Config("CSV row missing columns".into()));
            };
            let value = decode_csv_value(kind, raw)?;
            parsed
                .entry(ns.to_string())
                .or_default()
                .insert(key.to_string(), value);
        }
        *self.inner.lock() = parsed;
        Ok(())
    }
}

fn encode_csv_value(value: &Value) -> Result<(&'static str, String)> {
    Ok(match value {
        Value::String(s) => ("string", s.clone()),
        Value::Number(n) => ("number", n.to_string()),
        Value::Bool(b) => ("bool", b.to_string()),
        other => ("json", serde_json::to_string(other)?),
    })
}

fn decode_csv_value(kind: &str, raw: &str) -> Result<Value> {
    Ok(match kind {
        "string" => Value::String(raw.to_string()),
        "number" => serde_json::from_str(raw)?,
        "bool" => Value::Bool(raw == "true"),
        "json" => serde_json::from_str(raw)?,
        other => return Err(Error::Config(format!("unknown CSV value type: {other}"))),
    })
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
