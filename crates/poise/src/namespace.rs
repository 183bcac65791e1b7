//! Per-file namespaces.
//!
//! One namespace per compiled source file, keyed by the hash of the file's
//! canonical path. A namespace owns the functions and struct templates
//! declared in the file, its typed constants, and the list of namespaces it
//! imports. Every file compiles at most once; re-adding an already-known
//! path still records the new import edge.

use ahash::AHashMap;

use crate::{heap::Heap, value::Value};

#[derive(Debug)]
pub struct NamespaceConstant {
    pub value: Value,
    pub name: String,
    pub exported: bool,
}

#[derive(Debug, Default)]
struct NamespaceInfo {
    display_name: String,
    functions: Vec<Value>,
    structs: Vec<Value>,
    constants: Vec<NamespaceConstant>,
    imports: Vec<u64>,
}

/// Registry of every compiled namespace.
#[derive(Debug, Default)]
pub struct NamespaceManager {
    namespaces: AHashMap<u64, NamespaceInfo>,
}

impl NamespaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a namespace, recording the `parent -> namespace` import
    /// edge when a parent is given. Returns whether the namespace is new;
    /// the compiler only recurses into genuinely new files.
    pub fn add_namespace(&mut self, namespace_hash: u64, display_name: &str, parent: Option<u64>) -> bool {
        if let Some(parent_hash) = parent {
            let parent_info = self.namespaces.entry(parent_hash).or_default();
            if !parent_info.imports.contains(&namespace_hash) {
                parent_info.imports.push(namespace_hash);
            }
        }

        if self.namespaces.contains_key(&namespace_hash) {
            return false;
        }

        let info = self.namespaces.entry(namespace_hash).or_default();
        info.display_name = display_name.to_owned();
        true
    }

    #[must_use]
    pub fn display_name(&self, namespace_hash: u64) -> &str {
        self.namespaces
            .get(&namespace_hash)
            .map_or("<unknown>", |info| info.display_name.as_str())
    }

    /// Whether `imported` is reachable from `parent` through import edges.
    #[must_use]
    pub fn has_imported_namespace(&self, parent: u64, imported: u64) -> bool {
        let mut pending = vec![parent];
        let mut visited = Vec::new();

        while let Some(current) = pending.pop() {
            if visited.contains(&current) {
                continue;
            }
            visited.push(current);

            let Some(info) = self.namespaces.get(&current) else {
                continue;
            };
            if info.imports.contains(&imported) {
                return true;
            }
            pending.extend(&info.imports);
        }
        false
    }

    /// Adds a function value (takes ownership of the reference).
    pub fn add_function(&mut self, namespace_hash: u64, function: Value) {
        self.namespaces
            .entry(namespace_hash)
            .or_default()
            .functions
            .push(function);
    }

    /// Looks up a function by name hash, returning a fresh reference.
    #[must_use]
    pub fn get_function(&self, heap: &Heap, namespace_hash: u64, name_hash: u64) -> Option<Value> {
        let info = self.namespaces.get(&namespace_hash)?;
        info.functions
            .iter()
            .find(|value| {
                value
                    .ref_id()
                    .and_then(|id| heap.get(id).as_function())
                    .is_some_and(|function| function.name_hash() == name_hash)
            })
            .map(|value| value.clone_with_heap(heap))
    }

    /// Adds a struct template value (takes ownership of the reference).
    pub fn add_struct(&mut self, namespace_hash: u64, template: Value) {
        self.namespaces
            .entry(namespace_hash)
            .or_default()
            .structs
            .push(template);
    }

    /// Looks up a struct template by name hash, returning a fresh reference.
    #[must_use]
    pub fn get_struct(&self, heap: &Heap, namespace_hash: u64, name_hash: u64) -> Option<Value> {
        let info = self.namespaces.get(&namespace_hash)?;
        info.structs
            .iter()
            .find(|value| {
                value
                    .ref_id()
                    .and_then(|id| heap.get(id).as_struct())
                    .is_some_and(|strukt| strukt.name_hash() == name_hash)
            })
            .map(|value| value.clone_with_heap(heap))
    }

    pub fn add_constant(&mut self, namespace_hash: u64, value: Value, name: String, exported: bool) {
        self.namespaces
            .entry(namespace_hash)
            .or_default()
            .constants
            .push(NamespaceConstant { value, name, exported });
    }

    #[must_use]
    pub fn has_constant(&self, namespace_hash: u64, name: &str) -> bool {
        self.get_constant(namespace_hash, name).is_some()
    }

    #[must_use]
    pub fn get_constant(&self, namespace_hash: u64, name: &str) -> Option<&NamespaceConstant> {
        self.namespaces
            .get(&namespace_hash)?
            .constants
            .iter()
            .find(|constant| constant.name == name)
    }

    /// Whether a function with this name exists in the namespace (collision
    /// checks at declaration time).
    #[must_use]
    pub fn has_function_named(&self, heap: &Heap, namespace_hash: u64, name_hash: u64) -> bool {
        self.namespaces.get(&namespace_hash).is_some_and(|info| {
            info.functions.iter().any(|value| {
                value
                    .ref_id()
                    .and_then(|id| heap.get(id).as_function())
                    .is_some_and(|function| function.name_hash() == name_hash)
            })
        })
    }

    /// Whether a struct with this name exists in the namespace.
    #[must_use]
    pub fn has_struct_named(&self, heap: &Heap, namespace_hash: u64, name_hash: u64) -> bool {
        self.namespaces.get(&namespace_hash).is_some_and(|info| {
            info.structs.iter().any(|value| {
                value
                    .ref_id()
                    .and_then(|id| heap.get(id).as_struct())
                    .is_some_and(|strukt| strukt.name_hash() == name_hash)
            })
        })
    }

    /// Number of functions registered in a namespace.
    #[must_use]
    pub fn function_count(&self, namespace_hash: u64) -> usize {
        self.namespaces
            .get(&namespace_hash)
            .map_or(0, |info| info.functions.len())
    }

    /// Every registered function value across all namespaces.
    pub fn all_functions(&self) -> impl Iterator<Item = &Value> {
        self.namespaces.values().flat_map(|info| info.functions.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_adding_a_namespace_is_not_new_but_records_the_edge() {
        let mut manager = NamespaceManager::new();
        assert!(manager.add_namespace(1, "entry", None));
        assert!(manager.add_namespace(2, "module", Some(1)));
        // second parent importing the same file: not new, edge still added
        assert!(manager.add_namespace(3, "other", Some(1)));
        assert!(!manager.add_namespace(2, "module", Some(3)));

        assert!(manager.has_imported_namespace(1, 2));
        assert!(manager.has_imported_namespace(3, 2));
        assert!(!manager.has_imported_namespace(2, 1));
    }

    #[test]
    fn imports_are_transitive() {
        let mut manager = NamespaceManager::new();
        manager.add_namespace(1, "a", None);
        manager.add_namespace(2, "b", Some(1));
        manager.add_namespace(3, "c", Some(2));
        assert!(manager.has_imported_namespace(1, 3));
        assert!(!manager.has_imported_namespace(3, 1));
    }

    #[test]
    fn constants_respect_names_and_export_flags() {
        let mut manager = NamespaceManager::new();
        manager.add_namespace(1, "entry", None);
        manager.add_constant(1, Value::Int(3), "PI".into(), true);
        manager.add_constant(1, Value::Int(7), "HIDDEN".into(), false);

        assert!(manager.has_constant(1, "PI"));
        assert!(!manager.has_constant(1, "TAU"));
        assert!(manager.get_constant(1, "PI").unwrap().exported);
        assert!(!manager.get_constant(1, "HIDDEN").unwrap().exported);
    }
}
