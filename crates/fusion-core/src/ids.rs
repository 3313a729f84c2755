//! Identifiers shared across the asset graph and the task/resource layer.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// A path-like asset name, e.g. `"Databases/CA.kdatabase"`. Unique within
/// the asset root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetRef(String);

impl AssetRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds the verref for a specific version of this asset.
    pub fn version(&self, version: u32) -> VerRef {
        VerRef {
            asset: self.clone(),
            version,
        }
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AssetRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AssetRef {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// The canonical `<asset-name>?version=<n>` string, parsed or formatted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VerRef {
    asset: AssetRef,
    version: u32,
}

impl VerRef {
    pub fn new(asset: AssetRef, version: u32) -> Self {
        Self { asset, version }
    }

    pub fn asset(&self) -> &AssetRef {
        &self.asset
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Parses `"name?version=n"`. Returns `None` for anything else —
    /// callers should map that to a `ClientRequest`/`Protocol` error with
    /// their own context.
    pub fn parse(s: &str) -> Option<Self> {
        let (name, version_str) = s.split_once("?version=")?;
        if name.is_empty() {
            return None;
        }
        let version: u32 = version_str.parse().ok()?;
        Some(Self {
            asset: AssetRef::new(name),
            version,
        })
    }
}

impl fmt::Display for VerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?version={}", self.asset, self.version)
    }
}

/// A globally monotone 32-bit task identifier, handed out by a single
/// process-wide counter. Never reused within a process lifetime.
#[derive(Debug, Default)]
pub struct TaskIdGenerator(AtomicU32);

impl TaskIdGenerator {
    pub const fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed))
    }

    /// Restores the counter after a startup-recovery scan observes a
    /// higher watermark on disk, so freshly minted ids never collide with
    /// ones left over from a previous run.
    pub fn observe(&self, seen: TaskId) {
        self.0.fetch_max(seen.0 + 1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verref_round_trips() {
        let v = VerRef::new(AssetRef::new("Databases/CA.kdatabase"), 7);
        assert_eq!(v.to_string(), "Databases/CA.kdatabase?version=7");
        let parsed = VerRef::parse(&v.to_string()).unwrap();
        assert_eq!(parsed, v);
    }

    #[test]
    fn verref_parse_rejects_malformed() {
        assert!(VerRef::parse("no-version-here").is_none());
        assert!(VerRef::parse("?version=3").is_none());
        assert!(VerRef::parse("name?version=abc").is_none());
    }

    #[test]
    fn task_id_generator_is_monotone_and_never_zero() {
        let gen = TaskIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert!(b.0 > a.0);
        assert_ne!(a.0, 0);
    }

    #[test]
    fn task_id_generator_observes_watermark() {
        let gen = TaskIdGenerator::new();
        gen.observe(TaskId(100));
        let next = gen.next();
        assert_eq!(next.0, 101);
    }
}
