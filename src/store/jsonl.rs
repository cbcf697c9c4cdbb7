//! JSON-lines sink: one serialized event per line on stdout or a file.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::StoreError;

use super::{AssetEvent, StateStore};

pub struct JsonLinesStore {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesStore {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Append to `path`, creating it if needed.
    pub fn file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(io::LineWriter::new(file))))
    }
}

impl StateStore for JsonLinesStore {
    fn push(&self, event: &AssetEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut out = self.out.lock().map_err(|_| StoreError::Closed)?;
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventKind;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_one_line_per_event() {
        let buffer = Shared::default();
        let store = JsonLinesStore::new(Box::new(buffer.clone()));

        store.push(&AssetEvent::now(1, EventKind::Alert { bitmap: 3 })).expect("push");
        store.push(&AssetEvent::now(2, EventKind::Alert { bitmap: 0 })).expect("push");

        let text = String::from_utf8(buffer.0.lock().expect("buffer lock").clone()).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["type"], "alert");
        assert_eq!(first["cm"], 1);
        assert_eq!(first["bitmap"], 3);
    }

    #[test]
    fn test_file_sink_appends() {
        let path = std::env::temp_dir().join(format!("rack-assetd-{}.jsonl", uuid::Uuid::new_v4()));
        {
            let store = JsonLinesStore::file(&path).expect("open");
            store.push(&AssetEvent::now(1, EventKind::Alert { bitmap: 1 })).expect("push");
        }
        {
            let store = JsonLinesStore::file(&path).expect("reopen");
            store.push(&AssetEvent::now(1, EventKind::Alert { bitmap: 2 })).expect("push");
        }

        let text = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(text.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
