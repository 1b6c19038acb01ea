use fixedbitset::FixedBitSet;
use std::fmt;

/// NUMA topology snapshot. Immutable after discovery.
///
/// When the platform cannot report NUMA (non-Linux targets, or a kernel
/// without the sysfs node tree), the topology degrades to a single node
/// owning every CPU. Degradation is not an error.
pub struct NumaTopology {
    num_nodes: usize,
    num_cpus: usize,
    cpu_to_node: Vec<u16>,
    node_cpus: Vec<FixedBitSet>,
}

impl NumaTopology {
    /// Discover the machine topology. Infallible: falls back to a
    /// single-node view when NUMA information is unavailable.
    #[must_use]
    pub fn discover() -> Self {
        #[cfg(all(target_os = "linux", not(any(loom, miri))))]
        {
            if let Some(topology) = Self::discover_sysfs() {
                return topology;
            }
            #[cfg(debug_assertions)]
            eprintln!("[numalloc] NUMA topology unavailable, using single-node fallback");
        }
        Self::single_node()
    }

    /// Single-node view: every CPU maps to node 0.
    fn single_node() -> Self {
        let num_cpus = configured_cpus();
        let mut cpus = FixedBitSet::with_capacity(num_cpus);
        cpus.insert_range(..);
        Self {
            num_nodes: 1,
            num_cpus,
            cpu_to_node: vec![0; num_cpus],
            node_cpus: vec![cpus],
        }
    }

    /// Read node and CPU membership from /sys/devices/system/node.
    /// Returns None when the node tree is absent or unreadable.
    #[cfg(all(target_os = "linux", not(any(loom, miri))))]
    fn discover_sysfs() -> Option<Self> {
        let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;
        let mut node_ids: Vec<usize> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix("node").and_then(|s| s.parse().ok())
            })
            .collect();
        if node_ids.is_empty() {
            return None;
        }
        node_ids.sort_unstable();

        // Node ids may be sparse; size the table by the highest id so
        // cpu_to_node entries stay directly indexable.
        let num_nodes = node_ids.last().copied()? + 1;
        let num_cpus = configured_cpus();
        let mut cpu_to_node = vec![0u16; num_cpus];
        let mut node_cpus = vec![FixedBitSet::with_capacity(num_cpus); num_nodes];

        for &node in &node_ids {
            let path = format!("/sys/devices/system/node/node{node}/cpulist");
            let Ok(list) = std::fs::read_to_string(&path) else {
                continue;
            };
            for cpu in parse_cpu_list(list.trim()) {
                if cpu < num_cpus {
                    cpu_to_node[cpu] = node as u16;
                    node_cpus[node].insert(cpu);
                }
            }
        }

        Some(Self {
            num_nodes,
            num_cpus,
            cpu_to_node,
            node_cpus,
        })
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Node owning `cpu`; clamps unknown CPU indices to node 0.
    #[must_use]
    pub fn node_of_cpu(&self, cpu: usize) -> usize {
        self.cpu_to_node.get(cpu).copied().unwrap_or(0) as usize
    }

    /// Home node of the currently executing CPU.
    #[must_use]
    pub fn current_node(&self) -> usize {
        self.node_of_cpu(current_cpu())
    }

    /// CPU membership set for `node`, if the node exists.
    #[must_use]
    pub fn cpus_of_node(&self, node: usize) -> Option<&FixedBitSet> {
        self.node_cpus.get(node)
    }
}

impl fmt::Display for NumaTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "NUMA topology: {} node(s), {} cpu(s)",
            self.num_nodes, self.num_cpus
        )?;
        for (node, cpus) in self.node_cpus.iter().enumerate() {
            write!(f, "  node {node}: cpus")?;
            for cpu in cpus.ones() {
                write!(f, " {cpu}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Number of configured CPUs. Uses _SC_NPROCESSORS_CONF (not ONLN) so that
/// every index sched_getcpu can report stays in range.
fn configured_cpus() -> usize {
    #[cfg(any(loom, miri))]
    {
        1
    }
    #[cfg(not(any(loom, miri)))]
    {
        // Safety: FFI call to sysconf.
        let raw = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        if raw > 0 { raw as usize } else { 1 }
    }
}

/// Index of the CPU the calling thread is running on right now.
/// Always 0 on platforms without a query.
fn current_cpu() -> usize {
    #[cfg(all(target_os = "linux", not(any(loom, miri))))]
    {
        // Safety: FFI call to sched_getcpu.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 { cpu as usize } else { 0 }
    }
    #[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
    {
        0
    }
}

/// Parse a sysfs cpulist string such as `0-3,8-11,16`.
/// Malformed fragments are skipped rather than failing the whole list.
fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                if lo <= hi {
                    cpus.extend(lo..=hi);
                }
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list_single() {
        assert_eq!(parse_cpu_list("0"), vec![0]);
        assert_eq!(parse_cpu_list("17"), vec![17]);
    }

    #[test]
    fn test_parse_cpu_list_range() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_cpu_list_mixed() {
        assert_eq!(parse_cpu_list("0-2,5,8-9"), vec![0, 1, 2, 5, 8, 9]);
    }

    #[test]
    fn test_parse_cpu_list_whitespace_and_empty() {
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
        assert_eq!(parse_cpu_list(" 1 , 3 "), vec![1, 3]);
    }

    #[test]
    fn test_parse_cpu_list_malformed_fragments_skipped() {
        assert_eq!(parse_cpu_list("x,2,3-a,4"), vec![2, 4]);
        // Inverted range contributes nothing.
        assert_eq!(parse_cpu_list("5-2"), Vec::<usize>::new());
    }

    #[test]
    fn test_discover_has_at_least_one_node() {
        let topology = NumaTopology::discover();
        assert!(topology.num_nodes() >= 1);
        assert!(topology.num_cpus() >= 1);
    }

    #[test]
    fn test_current_node_in_range() {
        let topology = NumaTopology::discover();
        assert!(topology.current_node() < topology.num_nodes());
    }

    #[test]
    fn test_node_of_cpu_clamps_unknown() {
        let topology = NumaTopology::discover();
        assert_eq!(topology.node_of_cpu(usize::MAX), 0);
    }

    #[test]
    fn test_single_node_fallback_covers_all_cpus() {
        let topology = NumaTopology::single_node();
        assert_eq!(topology.num_nodes(), 1);
        let cpus = topology.cpus_of_node(0).unwrap();
        assert_eq!(cpus.count_ones(..), topology.num_cpus());
        assert!(topology.cpus_of_node(1).is_none());
    }

    #[test]
    fn test_display_lists_every_node() {
        let topology = NumaTopology::discover();
        let report = topology.to_string();
        assert!(report.contains("NUMA topology"));
        for node in 0..topology.num_nodes() {
            assert!(report.contains(&format!("node {node}:")));
        }
    }
}
