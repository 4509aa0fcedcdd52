use rand::Rng;

/// Round-robin host list for a single unit.
///
/// `index` always points at the host `getOne` will hand out *next*; it
/// advances modulo `hosts.len()` on every call, including retries that
/// happen to land on the same host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPool {
    hosts: Vec<String>,
    index: usize,
}

impl ServerPool {
    /// Builds a pool from a freshly fetched, non-empty host list. The start
    /// index is uniformly random, per spec, so that many client processes
    /// starting at once don't all hammer `hosts[0]`.
    pub fn new(hosts: Vec<String>) -> Option<Self> {
        if hosts.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..hosts.len());
        Some(Self { hosts, index })
    }

    #[cfg(test)]
    fn with_index(hosts: Vec<String>, index: usize) -> Self {
        Self { hosts, index }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Returns the next host and advances the round-robin index.
    pub fn next(&mut self) -> String {
        let host = self.hosts[self.index].clone();
        self.index = (self.index + 1) % self.hosts.len();
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_every_host_exactly_once() {
        let mut pool = ServerPool::with_index(
            vec!["h1".to_string(), "h2".to_string(), "h3".to_string()],
            0,
        );
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(pool.next());
        }
        assert_eq!(seen, vec!["h1", "h2", "h3"]);
        // Wraps around and repeats the same cycle.
        assert_eq!(pool.next(), "h1");
    }

    #[test]
    fn empty_host_list_yields_no_pool() {
        assert!(ServerPool::new(Vec::new()).is_none());
    }

    #[quickcheck_macros::quickcheck]
    fn round_robin_is_fair_over_n_calls(hosts: Vec<String>) -> quickcheck::TestResult {
        let hosts: Vec<String> = hosts.into_iter().filter(|h| !h.is_empty()).collect();
        if hosts.is_empty() {
            return quickcheck::TestResult::discard();
        }
        let n = hosts.len();
        let mut pool = ServerPool::with_index(hosts.clone(), 0);
        let mut seen = Vec::with_capacity(n);
        for _ in 0..n {
            seen.push(pool.next());
        }
        seen.sort();
        let mut expected = hosts;
        expected.sort();
        quickcheck::TestResult::from_bool(seen == expected)
    }
}
