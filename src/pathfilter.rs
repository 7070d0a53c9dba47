//! Ordered include/ignore path classification.
//!
//! Rules are path prefixes inserted into a segment trie with per-node
//! IGNORE/INCLUDE bits. Classification walks the query path segment by
//! segment; the deepest node carrying a flag wins, and INCLUDE beats
//! IGNORE because include rules express more specific user intent.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Effective classification of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    None,
    Ignore,
    Include,
}

/// Flag a rule inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFlag {
    Ignore,
    Include,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    ignore: bool,
    include: bool,
    /// True if this node or any descendant carries an INCLUDE bit. Lets
    /// the tree walker avoid pruning a directory that shelters an
    /// included file.
    include_beneath: bool,
}

impl TrieNode {
    fn flagged(&self) -> bool {
        self.ignore || self.include
    }
}

/// Segment trie over include/ignore rules. Rebuilt from project config on
/// every sync; readers hold a shared snapshot.
#[derive(Default)]
pub struct PathTrie {
    root: TrieNode,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a trie from a project's rules, ignores first so later
    /// includes can override them.
    pub fn from_rules(ignored: &[String], included: &[String]) -> Result<Self> {
        let mut trie = Self::new();
        for rule in ignored {
            trie.insert(rule, RuleFlag::Ignore)?;
        }
        for rule in included {
            trie.insert(rule, RuleFlag::Include)?;
        }
        Ok(trie)
    }

    /// Register a rule. `"."` and empty segments are skipped; a segment
    /// containing a path separator is invalid.
    pub fn insert(&mut self, path: &str, flag: RuleFlag) -> Result<()> {
        let mut node = &mut self.root;
        for segment in segments(path)? {
            node.include_beneath |= flag == RuleFlag::Include;
            node = node.children.entry(segment.to_string()).or_default();
        }
        match flag {
            RuleFlag::Ignore => node.ignore = true,
            RuleFlag::Include => {
                // More specific user intent overwrites an earlier ignore
                // on the same node.
                node.include = true;
                node.ignore = false;
                node.include_beneath = true;
            }
        }
        Ok(())
    }

    /// Effective flag for a path: walk its segments, remembering the last
    /// flagged node seen; stop when a segment has no child.
    pub fn classify(&self, path: &str) -> PathClass {
        let mut node = &self.root;
        let mut answer = PathClass::None;
        for segment in match segments(path) {
            Ok(s) => s,
            Err(_) => return PathClass::None,
        } {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if node.flagged() {
                        answer = if node.include { PathClass::Include } else { PathClass::Ignore };
                    }
                }
                None => break,
            }
        }
        answer
    }

    /// Whether an INCLUDE rule lives at or below `path`. Used by the sync
    /// walker: a directory classified IGNORE may still need descending if
    /// an include rule points inside it.
    pub fn may_contain_includes(&self, path: &str) -> bool {
        let mut node = &self.root;
        for segment in match segments(path) {
            Ok(s) => s,
            Err(_) => return false,
        } {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.include || node.include_beneath
    }
}

/// Split a rule or query path into canonical segments.
fn segments(path: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment.contains('\\') {
            return Err(Error::Config(format!("invalid path segment: {segment}")));
        }
        out.push(segment);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_path_is_none() {
        let trie = PathTrie::new();
        assert_eq!(trie.classify("src/main.rs"), PathClass::None);
    }

    #[test]
    fn include_overrides_ignore_on_deeper_path() {
        let mut trie = PathTrie::new();
        trie.insert("a/b", RuleFlag::Ignore).unwrap();
        trie.insert("a/b/c", RuleFlag::Include).unwrap();
        assert_eq!(trie.classify("a/b"), PathClass::Ignore);
        assert_eq!(trie.classify("a/b/c"), PathClass::Include);
        assert_eq!(trie.classify("a/b/c/d"), PathClass::Include);
        assert_eq!(trie.classify("a/b/other"), PathClass::Ignore);
    }

    #[test]
    fn deepest_flag_wins() {
        let mut trie = PathTrie::new();
        trie.insert("vendor", RuleFlag::Ignore).unwrap();
        trie.insert("vendor/ours", RuleFlag::Include).unwrap();
        trie.insert("vendor/ours/generated", RuleFlag::Ignore).unwrap();
        assert_eq!(trie.classify("vendor/x.py"), PathClass::Ignore);
        assert_eq!(trie.classify("vendor/ours/x.py"), PathClass::Include);
        assert_eq!(trie.classify("vendor/ours/generated/x.py"), PathClass::Ignore);
    }

    #[test]
    fn include_on_same_node_overwrites_ignore() {
        let mut trie = PathTrie::new();
        trie.insert("build", RuleFlag::Ignore).unwrap();
        trie.insert("build", RuleFlag::Include).unwrap();
        assert_eq!(trie.classify("build/keep.py"), PathClass::Include);
    }

    #[test]
    fn dot_and_empty_segments_skipped() {
        let mut trie = PathTrie::new();
        trie.insert("./src//core", RuleFlag::Ignore).unwrap();
        assert_eq!(trie.classify("src/core/x.rs"), PathClass::Ignore);
    }

    #[test]
    fn backslash_segment_rejected() {
        let mut trie = PathTrie::new();
        assert!(trie.insert("a\\b", RuleFlag::Ignore).is_err());
    }

    #[test]
    fn include_probe_sees_nested_rules() {
        let trie = PathTrie::from_rules(
            &["build".to_string()],
            &["build/keep.py".to_string()],
        )
        .unwrap();
        assert!(trie.may_contain_includes("build"));
        assert!(trie.may_contain_includes("build/keep.py"));
        assert!(!trie.may_contain_includes("dist"));
    }
}
