//! Execution scopes — addresses that isolate forEach iterations.
//!
//! A scope is `root` for top-level execution, or a path of
//! `<parent>#<index>` segments for fan-out children, e.g.
//! `root/fetch-items#2`. Run counters, history visibility, and routing
//! budgets are all keyed per scope.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    segments: Vec<ScopeSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeSegment {
    pub producer: String,
    pub index: usize,
}

impl Scope {
    /// The top-level scope.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Child scope for iteration `index` of `producer`'s fan-out.
    pub fn child(&self, producer: impl Into<String>, index: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push(ScopeSegment {
            producer: producer.into(),
            index,
        });
        Self { segments }
    }

    /// The enclosing scope, or `None` at root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    /// Nesting depth: 0 at root, 1 per fan-out level.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The innermost fan-out segment, if any.
    pub fn leaf(&self) -> Option<&ScopeSegment> {
        self.segments.last()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("root")?;
        for seg in &self.segments {
            write!(f, "/{}#{}", seg.producer, seg.index)?;
        }
        Ok(())
    }
}

impl Serialize for Scope {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split('/');
        if parts.next() != Some("root") {
            return Err(format!("scope must start with 'root': {s}"));
        }
        let mut segments = Vec::new();
        for part in parts {
            let (producer, index) = part
                .rsplit_once('#')
                .ok_or_else(|| format!("scope segment missing '#': {part}"))?;
            let index = index
                .parse()
                .map_err(|_| format!("scope segment index not a number: {part}"))?;
            segments.push(ScopeSegment {
                producer: producer.to_string(),
                index,
            });
        }
        Ok(Self { segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_displays() {
        assert_eq!(Scope::root().to_string(), "root");
        assert!(Scope::root().is_root());
    }

    #[test]
    fn child_path() {
        let s = Scope::root().child("items", 2).child("nested", 0);
        assert_eq!(s.to_string(), "root/items#2/nested#0");
        assert_eq!(s.depth(), 2);
        assert_eq!(s.leaf().unwrap().producer, "nested");
    }

    #[test]
    fn parent_walks_up() {
        let s = Scope::root().child("items", 1);
        assert_eq!(s.parent().unwrap(), Scope::root());
        assert!(Scope::root().parent().is_none());
    }

    #[test]
    fn parse_round_trip() {
        let s = Scope::root().child("fetch-items", 7);
        let parsed: Scope = s.to_string().parse().unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("items#1".parse::<Scope>().is_err());
        assert!("root/items".parse::<Scope>().is_err());
        assert!("root/items#x".parse::<Scope>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let s = Scope::root().child("p", 0);
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"root/p#0\"");
        let back: Scope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn scopes_are_distinct_per_index() {
        let a = Scope::root().child("p", 0);
        let b = Scope::root().child("p", 1);
        assert_ne!(a, b);
    }
}
