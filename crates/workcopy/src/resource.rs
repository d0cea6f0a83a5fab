//! Working copies: buffered edits of a resource, committed or discarded as a unit.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lock;

/// Identity of an editable resource; one registration per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of a file; separators are normalized to `/`.
    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().replace('\\', "/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// An in-flight editable artifact.
///
/// Implementations buffer edits until `commit`; `discard` drops whatever was
/// not committed yet.
pub trait WorkingCopy: Send + Sync {
    fn resource(&self) -> &ResourceId;

    /// Has uncommitted edits.
    fn is_dirty(&self) -> bool;

    /// Persist pending edits. Committing a clean copy is a no-op.
    fn commit(&self) -> anyhow::Result<()>;

    fn discard(&self);
}

impl<S> WorkingCopy for Arc<S>
where
    S: WorkingCopy + ?Sized,
{
    fn resource(&self) -> &ResourceId {
        (**self).resource()
    }

    fn is_dirty(&self) -> bool {
        (**self).is_dirty()
    }

    fn commit(&self) -> anyhow::Result<()> {
        (**self).commit()
    }

    fn discard(&self) {
        (**self).discard()
    }
}

#[derive(Debug)]
struct Buffer {
    /// Last text known to be on disk; `None` if the file does not exist yet
    committed: Option<String>,
    text: String,
    dirty: bool,
}

/// Text file edited in memory and written on commit.
#[derive(Debug)]
pub struct BufferedFile {
    resource: ResourceId,
    path: PathBuf,
    buffer: Mutex<Buffer>,
}

impl BufferedFile {
    /// Load the file if it exists; a missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let committed = match fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        Ok(Self {
            resource: ResourceId::from_path(&path),
            buffer: Mutex::new(Buffer {
                text: committed.clone().unwrap_or_default(),
                committed,
                dirty: false,
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current (possibly uncommitted) text.
    pub fn contents(&self) -> String {
        lock(&self.buffer).text.clone()
    }

    /// Text as of the last commit or load.
    pub fn committed(&self) -> Option<String> {
        lock(&self.buffer).committed.clone()
    }

    pub fn set_contents(&self, text: impl Into<String>) {
        let mut buffer = lock(&self.buffer);
        buffer.text = text.into();
        buffer.dirty = buffer.committed.as_deref() != Some(buffer.text.as_str());
    }

    pub fn append(&self, text: &str) {
        let mut buffer = lock(&self.buffer);
        buffer.text.push_str(text);
        buffer.dirty = buffer.committed.as_deref() != Some(buffer.text.as_str());
    }
}

impl WorkingCopy for BufferedFile {
    fn resource(&self) -> &ResourceId {
        &self.resource
    }

    fn is_dirty(&self) -> bool {
        lock(&self.buffer).dirty
    }

    fn commit(&self) -> anyhow::Result<()> {
        let mut buffer = lock(&self.buffer);
        if !buffer.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.path, &buffer.text)
            .with_context(|| format!("writing {}", self.path.display()))?;
        buffer.committed = Some(buffer.text.clone());
        buffer.dirty = false;
        debug!(resource = %self.resource, bytes = buffer.text.len(), "working copy committed");
        Ok(())
    }

    fn discard(&self) {
        let mut buffer = lock(&self.buffer);
        buffer.text = buffer.committed.clone().unwrap_or_default();
        buffer.dirty = false;
    }
}
