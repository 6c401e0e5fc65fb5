//! Bidirectional key <-> dependency-token graph.
//!
//! `forward` maps a cache key to the tokens it is invalidated by, `reverse`
//! maps a token to the keys registered against it. Both maps live behind a
//! single lock so an edge is always present in both or in neither.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;

use futures_util::future::join_all;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Edges {
    forward: HashMap<String, HashSet<String>>,
    reverse: HashMap<String, HashSet<String>>,
}

impl Edges {
    fn insert(&mut self, key: &str, token: &str) -> bool {
        let added = self
            .forward
            .entry(key.to_string())
            .or_default()
            .insert(token.to_string());
        self.reverse
            .entry(token.to_string())
            .or_default()
            .insert(key.to_string());
        added
    }

    fn remove(&mut self, key: &str, token: &str) -> bool {
        let removed = remove_from(&mut self.forward, key, token);
        remove_from(&mut self.reverse, token, key);
        removed
    }
}

fn remove_from(map: &mut HashMap<String, HashSet<String>>, outer: &str, inner: &str) -> bool {
    let Some(set) = map.get_mut(outer) else {
        return false;
    };
    let removed = set.remove(inner);
    if set.is_empty() {
        map.remove(outer);
    }
    removed
}

/// Result of a cascading delete.
#[derive(Debug)]
pub struct CascadeOutcome<E> {
    /// Keys deleted successfully, in traversal order.
    pub deleted: Vec<String>,
    /// Keys whose delete failed; their edges are kept.
    pub failed: Vec<(String, E)>,
}

impl<E> CascadeOutcome<E> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: RwLock<Edges>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` as depending on `token`. Returns false if the edge existed.
    pub fn add_edge(&self, key: &str, token: &str) -> bool {
        self.edges.write().insert(key, token)
    }

    pub fn remove_edge(&self, key: &str, token: &str) -> bool {
        self.edges.write().remove(key, token)
    }

    /// Tokens `key` is invalidated by.
    pub fn dependencies_of(&self, key: &str) -> Vec<String> {
        sorted(self.edges.read().forward.get(key))
    }

    /// Keys registered against `token`.
    pub fn dependents_of(&self, token: &str) -> Vec<String> {
        sorted(self.edges.read().reverse.get(token))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.read().forward.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.read().forward.is_empty()
    }

    /// Breadth-first walk over reverse edges starting at `start`.
    ///
    /// Every reachable key is returned once, `start` itself excluded. The
    /// visited set makes the walk terminate on cyclic graphs.
    pub fn collect_cascade(&self, start: &str) -> Vec<String> {
        let edges = self.edges.read();
        let mut visited: HashSet<&str> = HashSet::from([start]);
        let mut queue: VecDeque<&str> = VecDeque::from([start]);
        let mut order = Vec::new();

        while let Some(token) = queue.pop_front() {
            let Some(dependents) = edges.reverse.get(token) else {
                continue;
            };
            let mut next: Vec<&str> = dependents.iter().map(String::as_str).collect();
            next.sort_unstable();
            for key in next {
                if visited.insert(key) {
                    order.push(key.to_string());
                    queue.push_back(key);
                }
            }
        }

        order
    }

    /// Keys that depend on at least one token.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.edges.read().forward.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop the edges from `key` to the tokens it depends on and return those
    /// tokens. Keys registered against `key` as a token keep their edges.
    pub fn remove_dependencies(&self, key: &str) -> Vec<String> {
        let mut edges = self.edges.write();
        let Some(tokens) = edges.forward.remove(key) else {
            return Vec::new();
        };
        for token in &tokens {
            remove_from(&mut edges.reverse, token, key);
        }
        let mut tokens: Vec<String> = tokens.into_iter().collect();
        tokens.sort();
        tokens
    }

    /// Drop every edge where `key` appears as either endpoint.
    pub fn remove_key(&self, key: &str) {
        let mut edges = self.edges.write();
        if let Some(tokens) = edges.forward.remove(key) {
            for token in tokens {
                remove_from(&mut edges.reverse, &token, key);
            }
        }
        if let Some(keys) = edges.reverse.remove(key) {
            for dependent in keys {
                remove_from(&mut edges.forward, &dependent, key);
            }
        }
    }

    /// Delete every key reachable from `start`, calling `delete_fn` once per
    /// distinct key. Deletes run concurrently; the lock is not held while
    /// they are awaited.
    pub async fn cascade_delete<F, Fut, E>(&self, start: &str, delete_fn: F) -> CascadeOutcome<E>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let keys = self.collect_cascade(start);
        let results = join_all(keys.into_iter().map(|key| {
            let pending = delete_fn(key.clone());
            async move { (key, pending.await) }
        }))
        .await;

        let mut outcome = CascadeOutcome {
            deleted: Vec::new(),
            failed: Vec::new(),
        };
        for (key, result) in results {
            match result {
                Ok(()) => outcome.deleted.push(key),
                Err(e) => outcome.failed.push((key, e)),
            }
        }

        self.remove_key(start);
        for key in &outcome.deleted {
            self.remove_key(key);
        }

        outcome
    }
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    let mut out: Vec<String> = set.map(|s| s.iter().cloned().collect()).unwrap_or_default();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Every forward edge has a reverse twin and vice versa.
    fn assert_consistent(graph: &DependencyGraph) {
        let edges = graph.edges.read();
        for (key, tokens) in &edges.forward {
            for token in tokens {
                assert!(
                    edges.reverse.get(token).is_some_and(|keys| keys.contains(key)),
                    "missing reverse edge {token} -> {key}"
                );
            }
        }
        for (token, keys) in &edges.reverse {
            for key in keys {
                assert!(
                    edges.forward.get(key).is_some_and(|tokens| tokens.contains(token)),
                    "missing forward edge {key} -> {token}"
                );
            }
        }
    }

    #[test]
    fn test_add_and_remove_edge() {
        let graph = DependencyGraph::new();
        assert!(graph.add_edge("conversation:42", "conversation:*"));
        assert!(!graph.add_edge("conversation:42", "conversation:*"));
        assert_eq!(graph.dependencies_of("conversation:42"), vec!["conversation:*"]);
        assert_eq!(graph.dependents_of("conversation:*"), vec!["conversation:42"]);
        assert_consistent(&graph);

        assert!(graph.remove_edge("conversation:42", "conversation:*"));
        assert!(!graph.remove_edge("conversation:42", "conversation:*"));
        assert!(graph.is_empty());
        assert!(graph.dependents_of("conversation:*").is_empty());
        assert_consistent(&graph);
    }

    #[test]
    fn test_collect_cascade_multi_level() {
        let graph = DependencyGraph::new();
        graph.add_edge("conversation:42", "conversation:*");
        graph.add_edge("conversation:42:messages", "conversation:42");
        graph.add_edge("conversation:42:summary", "conversation:42");

        assert_eq!(
            graph.collect_cascade("conversation:42"),
            vec!["conversation:42:messages", "conversation:42:summary"]
        );
        assert_eq!(
            graph.collect_cascade("conversation:*"),
            vec![
                "conversation:42",
                "conversation:42:messages",
                "conversation:42:summary"
            ]
        );
    }

    #[test]
    fn test_collect_cascade_terminates_on_cycle() {
        let graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", "a");

        let keys = graph.collect_cascade("a");
        assert_eq!(keys, vec!["c", "b"]);
    }

    #[test]
    fn test_remove_key_drops_both_directions() {
        let graph = DependencyGraph::new();
        graph.add_edge("k", "t1");
        graph.add_edge("k", "t2");
        graph.add_edge("child", "k");

        graph.remove_key("k");
        assert!(graph.dependencies_of("k").is_empty());
        assert!(graph.dependents_of("t1").is_empty());
        assert!(graph.dependents_of("k").is_empty());
        assert!(graph.dependencies_of("child").is_empty());
        assert!(graph.is_empty());
        assert_consistent(&graph);
    }

    #[test]
    fn test_remove_dependencies_keeps_dependents() {
        let graph = DependencyGraph::new();
        graph.add_edge("user:1", "users");
        graph.add_edge("user:1", "org:9");
        graph.add_edge("user:1:profile", "user:1");

        assert_eq!(graph.keys(), vec!["user:1", "user:1:profile"]);
        assert_eq!(graph.remove_dependencies("user:1"), vec!["org:9", "users"]);
        assert!(graph.dependencies_of("user:1").is_empty());
        assert!(graph.dependents_of("users").is_empty());
        // user:1 is still a token for its profile
        assert_eq!(graph.dependents_of("user:1"), vec!["user:1:profile"]);
        assert_eq!(graph.keys(), vec!["user:1:profile"]);
        assert!(graph.remove_dependencies("user:1").is_empty());
        assert_consistent(&graph);
    }

    #[tokio::test]
    async fn test_cascade_delete_calls_once_per_key() {
        let graph = DependencyGraph::new();
        graph.add_edge("x", "root");
        graph.add_edge("y", "root");
        graph.add_edge("y", "x");
        graph.add_edge("root", "y");

        let calls = Mutex::new(Vec::new());
        let outcome = graph
            .cascade_delete("root", |key| {
                calls.lock().unwrap().push(key);
                async { Ok::<(), String>(()) }
            })
            .await;

        let mut seen = calls.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["x", "y"]);
        assert!(outcome.is_complete());
        assert!(graph.is_empty());
        assert_consistent(&graph);
    }

    #[tokio::test]
    async fn test_cascade_delete_keeps_edges_of_failed_keys() {
        let graph = DependencyGraph::new();
        graph.add_edge("ok", "token");
        graph.add_edge("broken", "token");
        graph.add_edge("broken", "other");

        let outcome = graph
            .cascade_delete("token", |key| async move {
                if key == "broken" {
                    Err("store down".to_string())
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(outcome.deleted, vec!["ok"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "broken");
        assert_eq!(graph.dependencies_of("broken"), vec!["other"]);
        assert!(graph.dependencies_of("ok").is_empty());
        assert_consistent(&graph);
    }

    #[tokio::test]
    async fn test_cascade_delete_unknown_token_is_noop() {
        let graph = DependencyGraph::new();
        let outcome = graph
            .cascade_delete("nothing", |_| async { Ok::<(), String>(()) })
            .await;
        assert!(outcome.deleted.is_empty());
        assert!(outcome.is_complete());
    }
}
