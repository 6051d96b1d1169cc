//! Directed pointer graphs over record addresses, their cleaning and
//! isomorphism grouping, and GEXF serialization.
//!
//! Two graphs are built per run: the full graph (every pointer field, with
//! out-of-heap targets as virtual nodes tagged by mapping) and the heaps
//! graph (only edges whose target is a known record).
use petgraph::algo::is_isomorphic;
use petgraph::graph::{DiGraph, NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::io::Write;

/// A node in a pointer graph: a record address, or a virtual target outside
/// the tracked heaps.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub address: u64,
    /// Owning heap start for record nodes.
    pub heap: Option<u64>,
    /// Record size; zero for virtual nodes.
    pub weight: usize,
    /// Mapping name for out-of-heap virtual nodes.
    pub mapping: Option<String>,
}

impl GraphNode {
    /// The `heap` attribute emitted to GEXF: the owning heap for records,
    /// the mapping name for virtual nodes.
    pub fn heap_tag(&self) -> String {
        match (self.heap, &self.mapping) {
            (Some(heap), _) => format!("{:#x}", heap),
            (None, Some(mapping)) => mapping.clone(),
            (None, None) => String::from("?"),
        }
    }
}

/// One directed pointer graph keyed by address.
pub struct PointerGraph {
    graph: DiGraph<GraphNode, ()>,
    index: HashMap<u64, NodeIndex>,
}

impl PointerGraph {
    pub fn new() -> PointerGraph {
        PointerGraph {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add or update the node for `address`. Attributes are filled in the
    /// first time they are known.
    pub fn ensure_node(
        &mut self,
        address: u64,
        heap: Option<u64>,
        weight: usize,
        mapping: Option<String>,
    ) -> NodeIndex {
        match self.index.get(&address) {
            Some(&idx) => {
                let node = &mut self.graph[idx];
                if node.heap.is_none() {
                    node.heap = heap;
                }
                if node.weight == 0 {
                    node.weight = weight;
                }
                if node.mapping.is_none() {
                    node.mapping = mapping;
                }
                idx
            }
            None => {
                let idx = self.graph.add_node(GraphNode {
                    address,
                    heap,
                    weight,
                    mapping,
                });
                self.index.insert(address, idx);
                idx
            }
        }
    }

    pub fn add_edge(&mut self, from: u64, to: u64) {
        let a = self.ensure_node(from, None, 0, None);
        let b = self.ensure_node(to, None, 0, None);
        self.graph.update_edge(a, b, ());
    }

    pub fn contains(&self, address: u64) -> bool {
        self.index.contains_key(&address)
    }

    pub fn node(&self, address: u64) -> Option<&GraphNode> {
        self.index.get(&address).map(|&idx| &self.graph[idx])
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node addresses, ascending.
    pub fn addresses(&self) -> Vec<u64> {
        let mut addrs: Vec<u64> = self.index.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    /// Edges as `(source, target)` address pairs, ascending.
    pub fn edges(&self) -> Vec<(u64, u64)> {
        let mut edges: Vec<(u64, u64)> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    self.graph[e.source()].address,
                    self.graph[e.target()].address,
                )
            })
            .collect();
        edges.sort_unstable();
        edges
    }

    pub fn in_degree(&self, address: u64) -> usize {
        match self.index.get(&address) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .count(),
            None => 0,
        }
    }

    pub fn out_degree(&self, address: u64) -> usize {
        match self.index.get(&address) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .count(),
            None => 0,
        }
    }

    /// Successor addresses, ascending.
    pub fn successors(&self, address: u64) -> Vec<u64> {
        let mut out: Vec<u64> = match self.index.get(&address) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|n| self.graph[n].address)
                .collect(),
            None => Vec::new(),
        };
        out.sort_unstable();
        out
    }

    /// Connected components of the undirected projection, each sorted by
    /// address, ordered by (size, lowest address).
    pub fn components(&self) -> Vec<Vec<u64>> {
        let mut uf = UnionFind::<usize>::new(self.graph.node_count());
        for edge in self.graph.edge_references() {
            uf.union(edge.source().index(), edge.target().index());
        }
        let mut groups: HashMap<usize, Vec<u64>> = HashMap::new();
        for idx in self.graph.node_indices() {
            groups
                .entry(uf.find(idx.index()))
                .or_default()
                .push(self.graph[idx].address);
        }
        let mut comps: Vec<Vec<u64>> = groups.into_iter().map(|(_, v)| v).collect();
        for comp in &mut comps {
            comp.sort_unstable();
        }
        comps.sort_by_key(|c| (c.len(), c[0]));
        comps
    }

    /// Remove isolates and connected components of `max_size` nodes or
    /// fewer, keyed on the undirected projection.
    pub fn prune_small_components(&mut self, max_size: usize) {
        let keep: HashSet<u64> = self
            .components()
            .into_iter()
            .filter(|c| c.len() > max_size)
            .flatten()
            .collect();
        self.retain(|node| keep.contains(&node.address));
    }

    fn retain<F: Fn(&GraphNode) -> bool>(&mut self, keep: F) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        // rebuild in ascending address order so node ids are stable
        for addr in self.addresses() {
            let node = &self.graph[self.index[&addr]];
            if keep(node) {
                let idx = graph.add_node(node.clone());
                index.insert(addr, idx);
            }
        }
        for (from, to) in self.edges() {
            if let (Some(&a), Some(&b)) = (index.get(&from), index.get(&to)) {
                graph.update_edge(a, b, ());
            }
        }
        self.graph = graph;
        self.index = index;
    }

    /// Node set of the depth-limited out-neighborhood of `roots`.
    pub fn depth_subgraph(&self, roots: &[u64], depth: usize) -> Vec<u64> {
        let mut seen: HashSet<u64> = roots.iter().copied().collect();
        let mut frontier: Vec<u64> = roots.to_vec();
        for _ in 0..depth {
            let mut next = Vec::new();
            for addr in frontier {
                for succ in self.successors(addr) {
                    if seen.insert(succ) {
                        next.push(succ);
                    }
                }
            }
            frontier = next;
        }
        let mut nodes: Vec<u64> = seen.into_iter().collect();
        nodes.sort_unstable();
        nodes
    }

    /// The top-`k` nodes by in-degree, highest first, ties broken by
    /// ascending address.
    pub fn top_in_degree(&self, k: usize) -> Vec<u64> {
        let mut degrees: Vec<(usize, u64)> = self
            .addresses()
            .into_iter()
            .map(|addr| (self.in_degree(addr), addr))
            .collect();
        degrees.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        degrees.into_iter().take(k).map(|(_, addr)| addr).collect()
    }

    fn undirected_subgraph(&self, comp: &[u64]) -> UnGraph<(), ()> {
        let mut graph = UnGraph::default();
        let mut local: HashMap<u64, NodeIndex> = HashMap::new();
        for &addr in comp {
            local.insert(addr, graph.add_node(()));
        }
        for (from, to) in self.edges() {
            if let (Some(&a), Some(&b)) = (local.get(&from), local.get(&to)) {
                graph.update_edge(a, b, ());
            }
        }
        graph
    }

    /// Serialize as GEXF 1.2. Node attributes: `heap` (hex heap address, or
    /// the mapping name for virtual nodes) and `weight` (record size).
    pub fn write_gexf<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        writeln!(
            writer,
            r#"<gexf xmlns="http://www.gexf.net/1.2draft" version="1.2">"#
        )?;
        writeln!(writer, r#"  <graph defaultedgetype="directed">"#)?;
        writeln!(writer, r#"    <attributes class="node">"#)?;
        writeln!(
            writer,
            r#"      <attribute id="0" title="heap" type="string"/>"#
        )?;
        writeln!(
            writer,
            r#"      <attribute id="1" title="weight" type="integer"/>"#
        )?;
        writeln!(writer, r#"    </attributes>"#)?;

        writeln!(writer, r#"    <nodes>"#)?;
        for addr in self.addresses() {
            let node = self
                .node(addr)
                .expect("addresses() only yields known nodes");
            writeln!(
                writer,
                r#"      <node id="{0:#x}" label="{0:#x}">"#,
                addr
            )?;
            writeln!(writer, r#"        <attvalues>"#)?;
            writeln!(
                writer,
                r#"          <attvalue for="0" value="{}"/>"#,
                xml_escape(&node.heap_tag())
            )?;
            writeln!(
                writer,
                r#"          <attvalue for="1" value="{}"/>"#,
                node.weight
            )?;
            writeln!(writer, r#"        </attvalues>"#)?;
            writeln!(writer, r#"      </node>"#)?;
        }
        writeln!(writer, r#"    </nodes>"#)?;

        writeln!(writer, r#"    <edges>"#)?;
        for (i, (from, to)) in self.edges().into_iter().enumerate() {
            writeln!(
                writer,
                r#"      <edge id="{}" source="{:#x}" target="{:#x}"/>"#,
                i, from, to
            )?;
        }
        writeln!(writer, r#"    </edges>"#)?;
        writeln!(writer, r#"  </graph>"#)?;
        writeln!(writer, r#"</gexf>"#)
    }
}

impl Default for PointerGraph {
    fn default() -> Self {
        PointerGraph::new()
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Components found to be isomorphic, keyed by the lowest address in the
/// representative component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoClass {
    pub representative: u64,
    /// Lowest address of each member component, ascending.
    pub members: Vec<u64>,
}

/// Bucket components by node count and group them by isomorphism.
///
/// Pairwise checks chain with early exit: once two components match,
/// neither is compared again; transitive matches ride the chain.
pub fn isomorphism_classes(graph: &PointerGraph) -> Vec<IsoClass> {
    let comps = graph.components();
    let mut buckets: BTreeMap<usize, Vec<&[u64]>> = BTreeMap::new();
    for comp in &comps {
        buckets.entry(comp.len()).or_default().push(comp.as_slice());
    }

    let mut classes = Vec::new();
    for (_size, bucket) in buckets {
        if bucket.len() < 2 {
            continue;
        }
        let subgraphs: Vec<UnGraph<(), ()>> = bucket
            .iter()
            .map(|comp| graph.undirected_subgraph(comp))
            .collect();

        let mut uf = UnionFind::<usize>::new(bucket.len());
        for i in 0..bucket.len() {
            for j in (i + 1)..bucket.len() {
                if is_isomorphic(&subgraphs[i], &subgraphs[j]) {
                    uf.union(i, j);
                    // chain comparison picks up from j next round
                    break;
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        for (i, comp) in bucket.iter().enumerate() {
            groups.entry(uf.find(i)).or_default().push(comp[0]);
        }
        for (_root, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            members.sort_unstable();
            classes.push(IsoClass {
                representative: members[0],
                members,
            });
        }
    }
    classes.sort_by_key(|c| c.representative);
    classes
}

/// The two graphs built by the pointer-graph pass, plus their isomorphism
/// grouping.
pub struct PointerGraphs {
    pub full: PointerGraph,
    pub heaps: PointerGraph,
    pub iso_classes: Vec<IsoClass>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(graph: &mut PointerGraph, addrs: &[u64]) {
        for pair in addrs.windows(2) {
            graph.add_edge(pair[0], pair[1]);
        }
    }

    #[test]
    fn pruning_drops_isolates_and_small_components() {
        let mut graph = PointerGraph::new();
        graph.ensure_node(0x9000, Some(0x9000), 8, None);
        chain(&mut graph, &[0x1000, 0x1010, 0x1020]);
        chain(&mut graph, &[0x2000, 0x2010, 0x2020, 0x2030]);

        graph.prune_small_components(3);

        assert_eq!(vec![0x2000, 0x2010, 0x2020, 0x2030], graph.addresses());
    }

    #[test]
    fn components_are_deterministic() {
        let mut graph = PointerGraph::new();
        chain(&mut graph, &[0x2000, 0x2010]);
        chain(&mut graph, &[0x1000, 0x1010, 0x1020]);

        let comps = graph.components();
        assert_eq!(
            vec![vec![0x2000, 0x2010], vec![0x1000, 0x1010, 0x1020]],
            comps
        );
    }

    #[test]
    fn isomorphic_chains_group_together() {
        let mut graph = PointerGraph::new();
        // three 4-node chains and one 4-node star
        chain(&mut graph, &[0x1000, 0x1010, 0x1020, 0x1030]);
        chain(&mut graph, &[0x2000, 0x2010, 0x2020, 0x2030]);
        chain(&mut graph, &[0x3000, 0x3010, 0x3020, 0x3030]);
        graph.add_edge(0x4000, 0x4010);
        graph.add_edge(0x4000, 0x4020);
        graph.add_edge(0x4000, 0x4030);

        let classes = isomorphism_classes(&graph);
        assert_eq!(1, classes.len());
        assert_eq!(0x1000, classes[0].representative);
        assert_eq!(vec![0x1000, 0x2000, 0x3000], classes[0].members);
    }

    #[test]
    fn depth_subgraph_stops_at_depth() {
        let mut graph = PointerGraph::new();
        chain(&mut graph, &[0x1000, 0x1010, 0x1020, 0x1030, 0x1040]);

        assert_eq!(
            vec![0x1000, 0x1010, 0x1020],
            graph.depth_subgraph(&[0x1000], 2)
        );
    }

    #[test]
    fn gexf_carries_heap_and_weight_attributes() {
        let mut graph = PointerGraph::new();
        graph.ensure_node(0x1000, Some(0x1000), 16, None);
        graph.ensure_node(0x7000, None, 0, Some("libc.so".to_owned()));
        graph.add_edge(0x1000, 0x7000);

        let mut out = Vec::new();
        graph.write_gexf(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains(r#"<node id="0x1000" label="0x1000">"#));
        assert!(text.contains(r#"<attvalue for="0" value="0x1000"/>"#));
        assert!(text.contains(r#"<attvalue for="0" value="libc.so"/>"#));
        assert!(text.contains(r#"<edge id="0" source="0x1000" target="0x7000"/>"#));
    }
}
