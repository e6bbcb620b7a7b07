//! Derived lookups over a finished trace document
//!
//! [`IndexBuilder::annotate`] fills in subtree sizes; [`IndexBuilder::build`]
//! produces a [`SearchIndex`]. Both run once, after the document is frozen.

use fnv::FnvHashMap;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::document::{CallNode, NodePath, TraceDocument, TraceEntry};

/// Function, file and location lookups, each list in document order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchIndex {
    functions: BTreeMap<String, Vec<NodePath>>,
    files: BTreeMap<String, Vec<NodePath>>,
    #[serde(skip)]
    locations: FnvHashMap<(String, u32), Vec<NodePath>>,
}

impl SearchIndex {
    /// Calls to `name` (plain or qualified)
    pub fn by_function(&self, name: &str) -> &[NodePath] {
        self.functions.get(name).map_or(&[], Vec::as_slice)
    }

    /// Every entry recorded in `file` (absolute or display path)
    pub fn by_file(&self, file: &str) -> &[NodePath] {
        self.files.get(file).map_or(&[], Vec::as_slice)
    }

    /// Calls starting at `file:line`
    pub fn by_location(&self, file: &str, line: u32) -> &[NodePath] {
        self.locations
            .get(&(file.to_string(), line))
            .map_or(&[], Vec::as_slice)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    fn add_call(&mut self, call: &CallNode, path: &NodePath) {
        push_unique(&mut self.functions, &call.function, path);
        push_unique(&mut self.functions, call.display_name(), path);
        push_unique(&mut self.files, &call.file, path);
        push_unique(&mut self.files, &call.display_file, path);

        for file in [&call.file, &call.display_file] {
            let paths = self.locations.entry((file.clone(), call.line)).or_default();
            if paths.last() != Some(path) {
                paths.push(path.clone());
            }
        }
    }
}

fn push_unique(map: &mut BTreeMap<String, Vec<NodePath>>, key: &str, path: &NodePath) {
    let paths = map.entry(key.to_string()).or_default();
    // Same node under an alias key it was already added to
    if paths.last() != Some(path) {
        paths.push(path.clone());
    }
}

/// Builds derived data for a frozen [`TraceDocument`]
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexBuilder;

impl IndexBuilder {
    /// Set `subtree_size` on every call node (post-order, inclusive)
    pub fn annotate(document: &mut TraceDocument) {
        fn visit(call: &mut CallNode) -> usize {
            let mut size = 1;
            for child in &mut call.children {
                size += match child {
                    TraceEntry::Call(node) => visit(node),
                    _ => 1,
                };
            }
            call.subtree_size = size;
            size
        }

        for call in &mut document.calls {
            visit(call);
        }
    }

    /// Single pre-order scan producing the lookup maps
    pub fn build(document: &TraceDocument) -> SearchIndex {
        fn visit(index: &mut SearchIndex, call: &CallNode, path: &mut NodePath) {
            index.add_call(call, path);
            for (i, child) in call.children.iter().enumerate() {
                path.push(i);
                match child {
                    TraceEntry::Call(node) => visit(index, node, path),
                    entry => {
                        push_unique(&mut index.files, entry.file(), path);
                        // Lines and exceptions of this frame share its display path
                        if entry.file() == call.file {
                            push_unique(&mut index.files, &call.display_file, path);
                        }
                    }
                }
                path.pop();
            }
        }

        let mut index = SearchIndex::default();
        let mut path = NodePath::new();
        for (i, call) in document.calls.iter().enumerate() {
            path.push(i);
            visit(&mut index, call, &mut path);
            path.pop();
        }
        index
    }
}
