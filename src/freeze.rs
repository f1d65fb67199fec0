//! The freeze pass: Tarjan SCC computation over a mutable definition pool.
//!
//! Freezing turns the single shared mutable pool into one immutable
//! `DefGroup` per strongly connected component. References between defs in
//! the same component become plain indices; references across components
//! become `Arc` clones of the target group. Because components form a DAG,
//! the `Arc` graph is acyclic and a frozen closure is released exactly when
//! the last external reference drops, even when the message graph itself is
//! cyclic.

use crate::{Error, ErrorKind, Result};

/// A node in the pool graph: either a message or an enum, by pool index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Node {
    Msg(u32),
    Enum(u32),
}

/// Output of the SCC pass: each node's component id, plus the components in
/// reverse topological order (every edge points from a later component to an
/// earlier one, so targets are always built first).
#[derive(Debug)]
pub(crate) struct SccResult {
    pub components: Vec<Vec<Node>>,
    pub msg_component: Vec<u32>,
    pub enum_component: Vec<u32>,
}

struct TarjanState<'a> {
    graph: &'a dyn Fn(Node) -> Vec<Node>,
    index: u32,
    node_index: Vec<Option<u32>>,
    node_lowlink: Vec<u32>,
    on_stack: Vec<bool>,
    stack: Vec<Node>,
    result: SccResult,
    max_depth: usize,
}

fn slot(n: Node, msg_count: usize) -> usize {
    match n {
        Node::Msg(i) => i as usize,
        Node::Enum(i) => msg_count + i as usize,
    }
}

/// Runs Tarjan's algorithm over all messages and enums of a pool.
///
/// `successors` enumerates the subdef edges of a node. `max_depth` bounds
/// the DFS depth; exceeding it fails with `NestingTooDeep`, mirroring the
/// recursion guard of the freeze operation.
pub(crate) fn find_sccs(
    msg_count: usize,
    enum_count: usize,
    successors: &dyn Fn(Node) -> Vec<Node>,
    max_depth: usize,
) -> Result<SccResult> {
    let total = msg_count + enum_count;
    let mut st = TarjanState {
        graph: successors,
        index: 0,
        node_index: vec![None; total],
        node_lowlink: vec![0; total],
        on_stack: vec![false; total],
        stack: Vec::new(),
        result: SccResult {
            components: Vec::new(),
            msg_component: vec![u32::MAX; msg_count],
            enum_component: vec![u32::MAX; enum_count],
        },
        max_depth,
    };

    for i in 0..msg_count {
        if st.node_index[i].is_none() {
            visit(&mut st, Node::Msg(i as u32), msg_count)?;
        }
    }
    for i in 0..enum_count {
        if st.node_index[msg_count + i].is_none() {
            visit(&mut st, Node::Enum(i as u32), msg_count)?;
        }
    }
    Ok(st.result)
}

/// One explicit-stack DFS frame: the node and how far through its successor
/// list we have advanced.
struct Frame {
    node: Node,
    succs: Vec<Node>,
    next_succ: usize,
}

fn visit(st: &mut TarjanState, root: Node, msg_count: usize) -> Result<()> {
    let mut frames = vec![open_frame(st, root, msg_count)];

    while let Some(frame) = frames.last_mut() {
        if frame.next_succ < frame.succs.len() {
            let succ = frame.succs[frame.next_succ];
            frame.next_succ += 1;
            let s = slot(succ, msg_count);
            match st.node_index[s] {
                None => {
                    if frames.len() >= st.max_depth {
                        return Err(Error::from_kind(ErrorKind::NestingTooDeep));
                    }
                    frames.push(open_frame(st, succ, msg_count));
                }
                Some(succ_index) => {
                    if st.on_stack[s] {
                        let me = slot(frames.last().unwrap().node, msg_count);
                        st.node_lowlink[me] = st.node_lowlink[me].min(succ_index);
                    }
                }
            }
        } else {
            let frame = frames.pop().unwrap();
            let me = slot(frame.node, msg_count);
            if st.node_lowlink[me] == st.node_index[me].unwrap() {
                // Root of a component; pop the component off the stack.
                let mut component = Vec::new();
                loop {
                    let n = st.stack.pop().unwrap();
                    let s = slot(n, msg_count);
                    st.on_stack[s] = false;
                    let comp_id = st.result.components.len() as u32;
                    match n {
                        Node::Msg(i) => st.result.msg_component[i as usize] = comp_id,
                        Node::Enum(i) => st.result.enum_component[i as usize] = comp_id,
                    }
                    component.push(n);
                    if n == frame.node {
                        break;
                    }
                }
                st.result.components.push(component);
            }
            if let Some(parent) = frames.last() {
                let p = slot(parent.node, msg_count);
                st.node_lowlink[p] = st.node_lowlink[p].min(st.node_lowlink[me]);
            }
        }
    }
    Ok(())
}

fn open_frame(st: &mut TarjanState, node: Node, msg_count: usize) -> Frame {
    let s = slot(node, msg_count);
    st.node_index[s] = Some(st.index);
    st.node_lowlink[s] = st.index;
    st.index += 1;
    st.stack.push(node);
    st.on_stack[s] = true;
    Frame {
        succs: (st.graph)(node),
        node,
        next_succ: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(msgs: usize, edges: &[(u32, u32)]) -> SccResult {
        let edges = edges.to_vec();
        let succ = move |n: Node| -> Vec<Node> {
            match n {
                Node::Msg(i) => edges
                    .iter()
                    .filter(|(a, _)| *a == i)
                    .map(|&(_, b)| Node::Msg(b))
                    .collect(),
                Node::Enum(_) => vec![],
            }
        };
        find_sccs(msgs, 0, &succ, 64).unwrap()
    }

    #[test]
    fn self_cycle_is_one_component() {
        let r = run(1, &[(0, 0)]);
        assert_eq!(r.components.len(), 1);
    }

    #[test]
    fn mutual_cycle_groups_together() {
        let r = run(3, &[(0, 1), (1, 0), (1, 2)]);
        assert_eq!(r.msg_component[0], r.msg_component[1]);
        assert_ne!(r.msg_component[0], r.msg_component[2]);
        // Reverse topological: the leaf component is built first.
        assert!(r.msg_component[2] < r.msg_component[0]);
    }

    #[test]
    fn depth_guard_fires() {
        // A long chain exceeds a small depth limit.
        let edges: Vec<(u32, u32)> = (0..10).map(|i| (i, i + 1)).collect();
        let succ = move |n: Node| -> Vec<Node> {
            match n {
                Node::Msg(i) => edges
                    .iter()
                    .filter(|(a, _)| *a == i)
                    .map(|&(_, b)| Node::Msg(b))
                    .collect(),
                Node::Enum(_) => vec![],
            }
        };
        let err = find_sccs(11, 0, &succ, 4).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NestingTooDeep);
    }
}
