//! Object path dispatch.
//!
//! Exact registrations live in a tree keyed by path segment. Fallback
//! registrations are kept separately and matched by longest segment prefix.
//! The table never owns a handler: it stores [`Weak`] handles, and a handle
//! whose handler has been dropped counts as unbound.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::error::DispatchError;

/// Something that answers method calls for an object path.
pub trait ObjectHandler<M>: Send + Sync {
    /// Handle `call` addressed to `path`. Returns the reply to send, if any.
    fn handle(&self, path: &str, call: &M) -> Option<M>;
}

impl<M, F> ObjectHandler<M> for F
where
    F: Fn(&str, &M) -> Option<M> + Send + Sync,
{
    fn handle(&self, path: &str, call: &M) -> Option<M> {
        self(path, call)
    }
}

/// Owning handle callers keep alive for as long as an object is exported.
pub type Handler<M> = Arc<dyn ObjectHandler<M>>;

type WeakHandler<M> = Weak<dyn ObjectHandler<M>>;

/// Split an object path into its segments. `/` has none.
pub fn path_segments(path: &str) -> Result<Vec<String>, DispatchError> {
    let invalid = || DispatchError::InvalidPath(path.to_string());

    let rest = path.strip_prefix('/').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    rest.split('/')
        .map(|segment| {
            let valid = !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_');
            if valid {
                Ok(segment.to_string())
            } else {
                Err(invalid())
            }
        })
        .collect()
}

struct PathNode<M> {
    handler: Option<WeakHandler<M>>,
    introspection: Option<String>,
    children: BTreeMap<String, PathNode<M>>,
}

impl<M> PathNode<M> {
    fn empty() -> Self {
        Self {
            handler: None,
            introspection: None,
            children: BTreeMap::new(),
        }
    }

    fn bound(&self) -> Option<Handler<M>> {
        self.handler.as_ref().and_then(Weak::upgrade)
    }
}

struct FallbackEntry<M> {
    segments: Vec<String>,
    handler: WeakHandler<M>,
}

/// Routes object paths to handlers.
pub struct DispatchTable<M> {
    root: PathNode<M>,
    fallbacks: Vec<FallbackEntry<M>>,
}

impl<M> Default for DispatchTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for DispatchTable<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("fallbacks", &self.fallbacks.len())
            .finish_non_exhaustive()
    }
}

impl<M> DispatchTable<M> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            root: PathNode::empty(),
            fallbacks: Vec::new(),
        }
    }

    fn find(&self, segments: &[String]) -> Option<&PathNode<M>> {
        segments
            .iter()
            .try_fold(&self.root, |node, segment| node.children.get(segment))
    }

    fn find_mut(&mut self, segments: &[String]) -> Option<&mut PathNode<M>> {
        segments
            .iter()
            .try_fold(&mut self.root, |node, segment| node.children.get_mut(segment))
    }

    /// Bind `handler` at exactly `path`, creating intermediate nodes.
    pub fn register(
        &mut self,
        path: &str,
        handler: &Handler<M>,
        introspection: impl Into<String>,
    ) -> Result<(), DispatchError>
    where
        M: 'static,
    {
        let segments = path_segments(path)?;
        let mut node = &mut self.root;
        for segment in segments {
            node = node.children.entry(segment).or_insert_with(PathNode::empty);
        }
        node.handler = Some(Arc::downgrade(handler));
        node.introspection = Some(introspection.into());
        debug!(path = %path, "Registered object");
        Ok(())
    }

    /// Clear the handler at `path`. The node stays so the tree below it remains
    /// reachable. Unknown paths are ignored.
    pub fn unregister(&mut self, path: &str) -> Result<(), DispatchError> {
        let segments = path_segments(path)?;
        match self.find_mut(&segments) {
            Some(node) => {
                node.handler = None;
                node.introspection = None;
                debug!(path = %path, "Unregistered object");
            }
            None => trace!(path = %path, "Unregister of unknown path ignored"),
        }
        Ok(())
    }

    /// Introspection listing for `path`: the node's own fragment followed by
    /// one `<node>` element per immediate child that has a live handler.
    pub fn introspect(&self, path: &str) -> Option<String> {
        let segments = path_segments(path).ok()?;
        let node = self.find(&segments)?;

        let mut xml = format!("<node name=\"{}\">\n", path);
        if let Some(fragment) = &node.introspection {
            xml.push_str(fragment);
        }
        for (name, child) in &node.children {
            if child.bound().is_some() {
                xml.push_str(&format!("<node name=\"{}\"/>\n", name));
            }
        }
        xml.push_str("</node>");
        Some(xml)
    }

    /// Whether `path` has a node in the exact tree (bound or not).
    pub fn contains(&self, path: &str) -> bool {
        path_segments(path)
            .ok()
            .is_some_and(|segments| self.find(&segments).is_some())
    }

    /// Handler bound at exactly `path`.
    pub fn exact(&self, path: &str) -> Option<Handler<M>> {
        let segments = path_segments(path).ok()?;
        self.find(&segments)?.bound()
    }

    /// Register a fallback handler for every path at or below `path`.
    ///
    /// Re-registering the same prefix replaces the handler but keeps its
    /// original position for tie-breaking.
    pub fn add_fallback(&mut self, path: &str, handler: &Handler<M>) -> Result<(), DispatchError>
    where
        M: 'static,
    {
        let segments = path_segments(path)?;
        let handler = Arc::downgrade(handler);
        match self.fallbacks.iter_mut().find(|e| e.segments == segments) {
            Some(entry) => entry.handler = handler,
            None => self.fallbacks.push(FallbackEntry { segments, handler }),
        }
        debug!(path = %path, "Registered fallback");
        Ok(())
    }

    /// Remove the fallback registered for exactly `path`.
    pub fn remove_fallback(&mut self, path: &str) -> Result<bool, DispatchError> {
        let segments = path_segments(path)?;
        let before = self.fallbacks.len();
        self.fallbacks.retain(|e| e.segments != segments);
        Ok(self.fallbacks.len() != before)
    }

    /// Longest-prefix fallback for `path`; ties go to the earliest registration.
    pub fn fallback(&self, path: &str) -> Option<Handler<M>> {
        let segments = path_segments(path).ok()?;
        let mut best: Option<(usize, Handler<M>)> = None;

        for entry in &self.fallbacks {
            if !segments.starts_with(&entry.segments) {
                continue;
            }
            let Some(handler) = entry.handler.upgrade() else {
                continue;
            };
            let len = entry.segments.len();
            if best.as_ref().map_or(true, |(best_len, _)| len > *best_len) {
                best = Some((len, handler));
            }
        }

        best.map(|(_, handler)| handler)
    }

    /// Exact handler if bound, otherwise the best fallback.
    pub fn lookup(&self, path: &str) -> Option<Handler<M>> {
        self.exact(path).or_else(|| self.fallback(path))
    }

    /// Drop nodes and fallbacks whose handlers no longer exist.
    pub fn prune(&mut self) -> usize {
        fn prune_node<M>(node: &mut PathNode<M>) -> usize {
            let mut removed = 0;
            if node.handler.is_some() && node.bound().is_none() {
                node.handler = None;
                node.introspection = None;
                removed += 1;
            }
            for child in node.children.values_mut() {
                removed += prune_node(child);
            }
            node.children
                .retain(|_, child| child.handler.is_some() || !child.children.is_empty());
            removed
        }

        let before = self.fallbacks.len();
        self.fallbacks.retain(|e| e.handler.strong_count() > 0);
        prune_node(&mut self.root) + (before - self.fallbacks.len())
    }
}
