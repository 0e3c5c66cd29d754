/// Subset matcher: pick the best ancestor fork server for a package set
use std::collections::HashSet;
use std::sync::Arc;

use crate::server::ForkServer;

/// Outcome of a match: the chosen ancestor, the packages it is missing, and
/// whether the request was satisfied outright.
pub struct Match {
    pub node: Arc<ForkServer>,
    pub delta: Vec<String>,
    pub hit: bool,
}

/// Choose the live server whose package set is the largest subset of
/// `request`. Ties break toward the most-hit server, then the most recently
/// created. Returns `None` only if no live server qualifies, which cannot
/// happen while the root (empty package set) is alive.
///
/// Package names in `request` must already be normalized to lowercase.
pub fn find_best<'a, I>(servers: I, request: &[String]) -> Option<Match>
where
    I: IntoIterator<Item = &'a Arc<ForkServer>>,
{
    let requested: HashSet<&str> = request.iter().map(String::as_str).collect();

    let mut best: Option<&Arc<ForkServer>> = None;
    for server in servers {
        if server.is_dead() {
            continue;
        }
        if !server
            .packages()
            .iter()
            .all(|pkg| requested.contains(pkg.as_str()))
        {
            continue;
        }

        best = match best {
            None => Some(server),
            Some(current) => {
                let candidate = (
                    server.packages().len(),
                    server.hits(),
                    server.id(),
                );
                let incumbent = (
                    current.packages().len(),
                    current.hits(),
                    current.id(),
                );
                if candidate > incumbent {
                    Some(server)
                } else {
                    Some(current)
                }
            }
        };
    }

    best.map(|node| {
        let delta: Vec<String> = request
            .iter()
            .filter(|pkg| !node.packages().contains(*pkg))
            .cloned()
            .collect();
        let hit = delta.is_empty();
        Match {
            node: Arc::clone(node),
            delta,
            hit,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn server(id: u64, packages: &[&str]) -> Arc<ForkServer> {
        let set: BTreeSet<String> = packages.iter().map(|s| s.to_string()).collect();
        Arc::new(ForkServer::new(id, if id == 0 { None } else { Some(0) }, set, 1))
    }

    fn req(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_largest_subset_wins() {
        let root = server(0, &[]);
        let a = server(1, &["a"]);
        let ab = server(2, &["a", "b"]);
        let servers = vec![root, a, ab];

        let m = find_best(&servers, &req(&["a", "b", "c"])).unwrap();
        assert_eq!(m.node.id(), 2);
        assert_eq!(m.delta, req(&["c"]));
        assert!(!m.hit);
    }

    #[test]
    fn test_exact_match_is_hit() {
        let root = server(0, &[]);
        let ab = server(1, &["a", "b"]);
        let servers = vec![root, ab];

        let m = find_best(&servers, &req(&["a", "b"])).unwrap();
        assert_eq!(m.node.id(), 1);
        assert!(m.hit);
        assert!(m.delta.is_empty());
    }

    #[test]
    fn test_superset_servers_are_skipped() {
        let root = server(0, &[]);
        let abc = server(1, &["a", "b", "c"]);
        let servers = vec![root, abc];

        // Only the root is a subset of {a}.
        let m = find_best(&servers, &req(&["a"])).unwrap();
        assert_eq!(m.node.id(), 0);
        assert_eq!(m.delta, req(&["a"]));
    }

    #[test]
    fn test_empty_request_hits_root() {
        let root = server(0, &[]);
        let a = server(1, &["a"]);
        let servers = vec![root, a];

        let m = find_best(&servers, &req(&[])).unwrap();
        assert_eq!(m.node.id(), 0);
        assert!(m.hit);
    }

    #[test]
    fn test_hits_break_size_ties() {
        let root = server(0, &[]);
        let a = server(1, &["a"]);
        let b = server(2, &["b"]);
        a.hit();
        a.hit();
        b.hit();
        let servers = vec![root, a, b];

        let m = find_best(&servers, &req(&["a", "b"])).unwrap();
        assert_eq!(m.node.id(), 1);
    }

    #[test]
    fn test_seq_breaks_remaining_ties() {
        let root = server(0, &[]);
        let a = server(1, &["a"]);
        let b = server(2, &["b"]);
        let servers = vec![root, a, b];

        // Same size, same hits: most recently created wins.
        let m = find_best(&servers, &req(&["a", "b"])).unwrap();
        assert_eq!(m.node.id(), 2);
    }

    #[test]
    fn test_dead_servers_are_ignored() {
        let root = server(0, &[]);
        let a = server(1, &["a"]);
        a.kill().unwrap();
        let servers = vec![root, a];

        let m = find_best(&servers, &req(&["a"])).unwrap();
        assert_eq!(m.node.id(), 0);
    }

    #[test]
    fn test_no_candidate_returns_none() {
        let a = server(1, &["a"]);
        let servers = vec![a];

        assert!(find_best(&servers, &req(&["b"])).is_none());
    }
}
