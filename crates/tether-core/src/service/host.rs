//! Host-side registry of entities reachable by the peer.
//!
//! Entries are either exposed explicitly under a caller-chosen id or
//! registered implicitly while marshalling (callbacks, class instances,
//! deferreds) under a generated id. Explicit entries live as long as the
//! service.
//!
//! An implicit entry remembers every route it was sent over. A server
//! talking to several clients hands the same target to each of them under
//! one id, so the entry is released only once every route holding it has
//! reported its proxy as disposed.

use crate::channel::Channel;
use crate::deferred::Deferred;
use crate::descriptor::{ClassDescriptor, FunctionDescriptor, ObjectDescriptor};
use crate::object::{Class, Function, Object};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity of the channel a message travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RouteKey(usize);

impl RouteKey {
    pub(crate) fn of(route: &Arc<dyn Channel>) -> Self {
        RouteKey(Arc::as_ptr(route) as *const () as usize)
    }
}

/// A registered target together with its descriptor.
#[derive(Clone)]
pub(crate) enum HostEntry {
    Function {
        function: Function,
        descriptor: FunctionDescriptor,
    },
    Object {
        object: Object,
        descriptor: ObjectDescriptor,
    },
    Class {
        class: Class,
        descriptor: ClassDescriptor,
    },
    Promise {
        deferred: Deferred,
    },
}

impl HostEntry {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            HostEntry::Function { .. } => "function",
            HostEntry::Object { .. } => "object",
            HostEntry::Class { .. } => "class",
            HostEntry::Promise { .. } => "promise",
        }
    }

    /// Identity key of the target, for entries that can be looked up by value.
    fn addr(&self) -> Option<usize> {
        match self {
            HostEntry::Function { function, .. } => Some(function.addr()),
            HostEntry::Object { object, .. } => Some(object.addr()),
            HostEntry::Class { .. } | HostEntry::Promise { .. } => None,
        }
    }
}

struct Registered {
    entry: HostEntry,
    exposed: bool,
    /// Routes whose peer may still hold a proxy. Empty for exposed entries.
    holders: Vec<RouteKey>,
}

#[derive(Default)]
struct HostState {
    entries: HashMap<String, Registered>,
    by_addr: HashMap<usize, String>,
}

#[derive(Default)]
pub(crate) struct HostRegistry {
    state: Mutex<HostState>,
}

impl HostRegistry {
    /// Register `entry` under an explicit id, replacing any previous entry.
    pub(crate) fn expose(&self, id: &str, entry: HostEntry) {
        self.insert(id.to_string(), entry, true);
    }

    fn insert(&self, id: String, entry: HostEntry, exposed: bool) {
        let mut state = self.state.lock();
        if let Some(old) = state.entries.remove(&id) {
            if let Some(addr) = old.entry.addr() {
                state.by_addr.remove(&addr);
            }
        }
        if let Some(addr) = entry.addr() {
            state.by_addr.insert(addr, id.clone());
        }
        state.entries.insert(
            id,
            Registered {
                entry,
                exposed,
                holders: Vec::new(),
            },
        );
    }

    /// Id of an already registered target, or register it under a fresh id.
    ///
    /// Sending the same function or object twice yields the same id, so the
    /// peer sees the same proxy both times. `route` is recorded as a holder.
    pub(crate) fn register_implicit(
        &self,
        addr: usize,
        route: RouteKey,
        make_entry: impl FnOnce() -> HostEntry,
        make_id: impl FnOnce() -> String,
    ) -> String {
        let mut state = self.state.lock();
        if let Some(id) = state.by_addr.get(&addr).cloned() {
            if let Some(registered) = state.entries.get_mut(&id) {
                if !registered.exposed && !registered.holders.contains(&route) {
                    registered.holders.push(route);
                }
            }
            return id;
        }
        let id = make_id();
        state.by_addr.insert(addr, id.clone());
        state.entries.insert(
            id.clone(),
            Registered {
                entry: make_entry(),
                exposed: false,
                holders: vec![route],
            },
        );
        id
    }

    /// Register a deferred under a fresh id, held by `route` until settled.
    pub(crate) fn register_promise(&self, id: &str, deferred: Deferred, route: RouteKey) {
        let mut state = self.state.lock();
        state.entries.insert(
            id.to_string(),
            Registered {
                entry: HostEntry::Promise { deferred },
                exposed: false,
                holders: vec![route],
            },
        );
    }

    pub(crate) fn get(&self, id: &str) -> Option<HostEntry> {
        self.state.lock().entries.get(id).map(|r| r.entry.clone())
    }

    pub(crate) fn id_of(&self, addr: usize) -> Option<String> {
        self.state.lock().by_addr.get(&addr).cloned()
    }

    /// Drop `route`'s hold on an implicit entry after its peer disposed the
    /// proxy. Returns true once the last holder is gone and the entry is
    /// removed.
    ///
    /// Explicitly exposed entries are never released this way.
    pub(crate) fn release(&self, id: &str, route: RouteKey) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.entries.get_mut(id) {
                Some(r) if !r.exposed => {
                    r.holders.retain(|holder| *holder != route);
                    if !r.holders.is_empty() {
                        return false;
                    }
                }
                _ => return false,
            }
            let Some(removed) = state.entries.remove(id) else {
                return false;
            };
            if let Some(addr) = removed.entry.addr() {
                state.by_addr.remove(&addr);
            }
            removed
        };
        // The entry may hold a proxy whose drop notifies another peer.
        drop(removed);
        true
    }

    /// Explicitly exposed entries, sorted by id.
    pub(crate) fn exposed(&self) -> Vec<(String, HostEntry)> {
        let state = self.state.lock();
        let mut out: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, r)| r.exposed)
            .map(|(id, r)| (id.clone(), r.entry.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// The registered class with id `class_id`, if it is `class`.
    pub(crate) fn class_descriptor(&self, class: &Class) -> Option<ClassDescriptor> {
        match self.get(class.id()) {
            Some(HostEntry::Class {
                class: registered,
                descriptor,
            }) if registered.ptr_eq(class) => Some(descriptor),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn native() -> Function {
        Function::native("f", |_, _| Ok(Value::Null))
    }

    #[test]
    fn test_implicit_registration_reuses_id() {
        let registry = HostRegistry::default();
        let f = native();
        let entry = || HostEntry::Function {
            function: f.clone(),
            descriptor: FunctionDescriptor::default(),
        };

        let route = RouteKey(1);
        let a = registry.register_implicit(f.addr(), route, entry, || "f-1".to_string());
        let b = registry.register_implicit(f.addr(), route, entry, || "f-2".to_string());
        assert_eq!(a, "f-1");
        assert_eq!(b, "f-1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_only_affects_implicit_entries() {
        let registry = HostRegistry::default();
        let exposed = native();
        registry.expose(
            "api",
            HostEntry::Function {
                function: exposed.clone(),
                descriptor: FunctionDescriptor::default(),
            },
        );
        let cb = native();
        let route = RouteKey(1);
        let id = registry.register_implicit(
            cb.addr(),
            route,
            || HostEntry::Function {
                function: cb.clone(),
                descriptor: FunctionDescriptor::default(),
            },
            || "cb-1".to_string(),
        );

        assert!(!registry.release("api", route));
        assert!(registry.release(&id, route));
        assert!(!registry.release(&id, route));
        assert!(registry.id_of(cb.addr()).is_none());
        assert_eq!(registry.id_of(exposed.addr()).as_deref(), Some("api"));
        assert_eq!(registry.exposed().len(), 1);
    }

    #[test]
    fn test_entry_shared_by_two_routes_outlives_one_release() {
        let registry = HostRegistry::default();
        let cb = native();
        let entry = || HostEntry::Function {
            function: cb.clone(),
            descriptor: FunctionDescriptor::default(),
        };
        let (first, second) = (RouteKey(1), RouteKey(2));

        let id = registry.register_implicit(cb.addr(), first, entry, || "cb-1".to_string());
        let again = registry.register_implicit(cb.addr(), second, entry, || "cb-2".to_string());
        assert_eq!(id, again);

        assert!(!registry.release(&id, first));
        assert!(registry.get(&id).is_some());
        // A route that never held the entry cannot release it either.
        assert!(!registry.release(&id, RouteKey(3)));
        assert!(registry.release(&id, second));
        assert!(registry.get(&id).is_none());
        assert!(registry.id_of(cb.addr()).is_none());
    }

    #[test]
    fn test_class_descriptor_requires_same_class() {
        let registry = HostRegistry::default();
        let class = Class::builder("Counter").build();
        let other = Class::builder("Counter").build();
        registry.expose(
            "Counter",
            HostEntry::Class {
                class: class.clone(),
                descriptor: ClassDescriptor::new("Counter"),
            },
        );
        assert!(registry.class_descriptor(&class).is_some());
        assert!(registry.class_descriptor(&other).is_none());
    }
}
