//! Prefix tree over element-name paths.
//!
//! Built once per Run from the configured allow-list. The streaming scan keeps
//! the trie node of every open element on its stack, so recognising a target
//! costs one child lookup per element event regardless of how many targets
//! are configured.

use std::collections::HashMap;

use aeroschema_core::config::{Profile, ResolvedTarget};
use aeroschema_core::normalize::{join_path, local_name};

/// What the scan needs to know about a target when it is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub section_path: String,
    pub node_type: String,
    /// Extract even when nested inside another target.
    pub independent: bool,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, usize>,
    target: Option<TargetInfo>,
}

/// Arena-backed prefix tree of local-name paths.
#[derive(Debug)]
pub struct PathTrie {
    nodes: Vec<TrieNode>,
    targets: usize,
}

impl Default for PathTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTrie {
    const ROOT: usize = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            targets: 0,
        }
    }

    /// Build a trie from a profile's resolved targets.
    pub fn from_profile(profile: &Profile) -> Self {
        let mut trie = Self::new();
        for target in profile.resolved_targets() {
            trie.insert_target(&target);
        }
        trie
    }

    pub fn insert_target(&mut self, target: &ResolvedTarget) {
        self.insert(
            &target.segments,
            TargetInfo {
                section_path: target.section_path.clone(),
                node_type: target.node_type.clone(),
                independent: target.independent,
            },
        );
    }

    /// Insert a path, marking its last node as a target.
    ///
    /// Segments are reduced to local names. Re-inserting a path replaces its
    /// target info; an empty path is ignored.
    pub fn insert<S: AsRef<str>>(&mut self, segments: &[S], info: TargetInfo) {
        if segments.is_empty() {
            return;
        }
        let mut node = Self::ROOT;
        for seg in segments {
            let seg = local_name(seg.as_ref());
            let existing = self.nodes[node].children.get(seg).copied();
            node = match existing {
                Some(next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children.insert(seg.to_string(), next);
                    next
                }
            };
        }
        if self.nodes[node].target.is_none() {
            self.targets += 1;
        }
        self.nodes[node].target = Some(info);
    }

    /// Node for a document root element name.
    pub fn step_root(&self, name: &str) -> Option<usize> {
        self.step(Self::ROOT, name)
    }

    /// Child of `node` named `name`, if any configured path continues that way.
    pub fn step(&self, node: usize, name: &str) -> Option<usize> {
        self.nodes.get(node)?.children.get(name).copied()
    }

    /// Target info if `node` terminates a configured path.
    pub fn target(&self, node: usize) -> Option<&TargetInfo> {
        self.nodes.get(node)?.target.as_ref()
    }

    /// Walk a full path; `Some` iff the path terminates at a target.
    pub fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Option<&TargetInfo> {
        if path.is_empty() {
            return None;
        }
        let mut node = Self::ROOT;
        for seg in path {
            node = self.step(node, local_name(seg.as_ref()))?;
        }
        self.target(node)
    }

    /// Number of distinct target paths.
    pub fn len(&self) -> usize {
        self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.targets == 0
    }

    /// All target section paths, sorted.
    pub fn section_paths(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.targets);
        let mut stack: Vec<(usize, Vec<&str>)> = vec![(Self::ROOT, Vec::new())];
        while let Some((node, path)) = stack.pop() {
            if self.nodes[node].target.is_some() {
                out.push(join_path(&path));
            }
            for (name, &child) in &self.nodes[node].children {
                let mut next = path.clone();
                next.push(name.as_str());
                stack.push((child, next));
            }
        }
        out.sort();
        out
    }
}
