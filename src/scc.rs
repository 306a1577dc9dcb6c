use crate::types::HashMap;
use core::hash::Hash;
use rustc_hash::FxBuildHasher;

#[derive(Copy, Clone)]
struct NodeMeta {
    index: usize,
    lowlink: usize,
    on_stack: bool,
    component: Option<usize>,
}

struct Frame<N> {
    node: N,
    next_edge: usize,
}

enum EdgeTarget {
    Unvisited,
    OnStack(usize),
    Completed,
}

/// Compute the closed strongly connected components of the graph spanned by
/// `nodes` and the successor function `succ`.
///
/// Every edge target should itself be a member of `nodes`; an edge to an
/// unknown node is treated as escaping and marks its component open.
/// Multi-edges and self-loops are tolerated. A singleton component is
/// reported only if it carries a self-loop; a node without edges is not a
/// cycle and is left to fallback resolution.
///
/// Components are returned in the order the traversal completes them (sinks
/// of the condensation first), each listing its members in visit order. The
/// whole computation is linear in the number of nodes plus edges; `succ` is
/// invoked exactly once per node.
pub fn closed_sccs<N, S, I>(nodes: &[N], mut succ: S) -> Vec<Vec<N>>
where
    N: Copy + Eq + Hash,
    S: FnMut(N) -> I,
    I: IntoIterator<Item = N>,
{
    let mut meta: HashMap<N, NodeMeta> =
        HashMap::with_capacity_and_hasher(nodes.len(), FxBuildHasher);
    let mut edges: HashMap<N, Vec<N>> =
        HashMap::with_capacity_and_hasher(nodes.len(), FxBuildHasher);
    let mut node_stack: Vec<N> = Vec::new();
    let mut call_stack: Vec<Frame<N>> = Vec::new();
    let mut components: Vec<Vec<N>> = Vec::new();
    let mut next_index = 0_usize;

    for &root in nodes {
        if meta.contains_key(&root) {
            continue;
        }
        push_node(
            root,
            &mut next_index,
            &mut succ,
            &mut meta,
            &mut edges,
            &mut node_stack,
            &mut call_stack,
        );

        while let Some(frame) = call_stack.last_mut() {
            let node = frame.node;
            let edge_idx = frame.next_edge;
            frame.next_edge += 1;

            let child = edges[&node].get(edge_idx).copied();
            let Some(child) = child else {
                // Adjacency exhausted: close this frame.
                call_stack.pop();
                let node_meta = meta[&node];
                if let Some(parent) = call_stack.last() {
                    let parent_meta = meta
                        .get_mut(&parent.node)
                        .expect("closed_sccs: parent node must be visited");
                    parent_meta.lowlink = parent_meta.lowlink.min(node_meta.lowlink);
                }
                if node_meta.lowlink == node_meta.index {
                    // `node` is the component root; pop its members.
                    let component_id = components.len();
                    let mut members = Vec::new();
                    loop {
                        let member = node_stack
                            .pop()
                            .expect("closed_sccs: node stack must hold the component");
                        let member_meta = meta
                            .get_mut(&member)
                            .expect("closed_sccs: stacked node must be visited");
                        member_meta.on_stack = false;
                        member_meta.component = Some(component_id);
                        members.push(member);
                        if member == node {
                            break;
                        }
                    }
                    members.reverse();
                    components.push(members);
                }
                continue;
            };

            let target = match meta.get(&child) {
                None => EdgeTarget::Unvisited,
                Some(m) if m.on_stack => EdgeTarget::OnStack(m.index),
                Some(_) => EdgeTarget::Completed,
            };
            match target {
                EdgeTarget::Unvisited => push_node(
                    child,
                    &mut next_index,
                    &mut succ,
                    &mut meta,
                    &mut edges,
                    &mut node_stack,
                    &mut call_stack,
                ),
                EdgeTarget::OnStack(child_index) => {
                    let node_meta = meta
                        .get_mut(&node)
                        .expect("closed_sccs: frame node must be visited");
                    node_meta.lowlink = node_meta.lowlink.min(child_index);
                }
                EdgeTarget::Completed => {}
            }
        }
    }

    // Closedness pass: a component is closed iff no member edge escapes it.
    let mut closed = vec![true; components.len()];
    let mut has_self_loop = vec![false; components.len()];
    for (&node, outgoing) in &edges {
        let component = meta[&node]
            .component
            .expect("closed_sccs: every visited node belongs to a component");
        for &target in outgoing {
            if target == node {
                has_self_loop[component] = true;
                continue;
            }
            match meta.get(&target).and_then(|m| m.component) {
                Some(target_component) if target_component == component => {}
                _ => closed[component] = false,
            }
        }
    }

    components
        .into_iter()
        .enumerate()
        .filter(|(id, members)| closed[*id] && (members.len() > 1 || has_self_loop[*id]))
        .map(|(_, members)| members)
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn push_node<N, S, I>(
    node: N,
    next_index: &mut usize,
    succ: &mut S,
    meta: &mut HashMap<N, NodeMeta>,
    edges: &mut HashMap<N, Vec<N>>,
    node_stack: &mut Vec<N>,
    call_stack: &mut Vec<Frame<N>>,
) where
    N: Copy + Eq + Hash,
    S: FnMut(N) -> I,
    I: IntoIterator<Item = N>,
{
    meta.insert(
        node,
        NodeMeta {
            index: *next_index,
            lowlink: *next_index,
            on_stack: true,
            component: None,
        },
    );
    *next_index += 1;
    node_stack.push(node);
    edges.insert(node, succ(node).into_iter().collect());
    call_stack.push(Frame { node, next_edge: 0 });
}
