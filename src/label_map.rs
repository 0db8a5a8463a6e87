use crate::config::{LabelNaming, SourceScan};
use crate::record_reader::{extract_id, open_reader};
use crate::LabelError;
use rustc_hash::FxHashMap;
use std::path::Path;

/// Mapping from record id to the comma-joined labels of every source file
/// the id was found in, in scan order.
#[derive(Debug, Default, Clone)]
pub struct LabelMap {
    labels: FxHashMap<String, String>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `label` to the labels of `record_id`.
    pub fn insert(&mut self, record_id: &str, label: &str) {
        match self.labels.get_mut(record_id) {
            Some(existing) => {
                existing.push(',');
                existing.push_str(label);
            }
            None => {
                self.labels.insert(record_id.to_string(), label.to_string());
            }
        }
    }

    pub fn get(&self, record_id: &str) -> Option<&str> {
        self.labels.get(record_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Derive a source file's label from its base name.
///
/// With an extension configured it is stripped when present; without one
/// the last `.ext` is dropped. A configured prefix is stripped afterwards.
pub fn derive_label(path: &Path, naming: &LabelNaming) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let stem = match &naming.extension {
        Some(ext) => name.strip_suffix(ext.as_str()).unwrap_or(&name),
        None => match name.rfind('.') {
            Some(dot) if dot + 1 < name.len() => &name[..dot],
            _ => &name,
        },
    };

    match &naming.prefix {
        Some(prefix) => stem.strip_prefix(prefix.as_str()).unwrap_or(stem).to_string(),
        None => stem.to_string(),
    }
}

/// Scan `files` in order and accumulate their labels per record id.
pub fn build_label_map<P: AsRef<Path>>(files: &[P], scan: &SourceScan) -> Result<LabelMap, LabelError> {
    let mut map = LabelMap::new();
    for file in files {
        let file = file.as_ref();
        let label = derive_label(file, &scan.naming);
        let mut reader = open_reader(file, scan.read_method, scan.id_rule.marker)?;
        let mut records = 0usize;
        while let Some(record) = reader.next_record()? {
            map.insert(extract_id(&record, &scan.id_rule), &label);
            records += 1;
        }
        tracing::debug!(file = %file.display(), %label, records, "scanned source file");
    }
    Ok(map)
}
