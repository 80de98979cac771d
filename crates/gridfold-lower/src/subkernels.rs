//! Subkernel discovery: a BFS from the kernel entry that never walks through
//! a post-barrier block; reaching one starts a fresh walk instead. Each walk
//! yields one subkernel — the maximal barrier-free region reachable from its
//! entry. Walks may share interior blocks (a loop carrying a barrier puts the
//! pre-barrier half of its body into both neighbouring subkernels); the
//! `owner` map records the first-claiming subkernel and is only used as a
//! deterministic sort key.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use gridfold_ir::{NodeIndex, Procedure};

pub type SubkernelId = usize;

#[derive(Debug, Clone)]
pub struct Subkernel {
    /// Blocks of the region; `blocks[0]` is the entry.
    pub blocks: Vec<NodeIndex>,
}

impl Subkernel {
    pub fn entry(&self) -> NodeIndex {
        self.blocks[0]
    }

    pub fn contains(&self, block: NodeIndex) -> bool {
        self.blocks.contains(&block)
    }
}

#[derive(Debug, Clone)]
pub struct Subkernels {
    pub list: Vec<Subkernel>,
    pub entry_subkernel: SubkernelId,
    owner: HashMap<NodeIndex, SubkernelId>,
}

impl Subkernels {
    pub fn ids(&self) -> impl Iterator<Item = SubkernelId> {
        0..self.list.len()
    }

    /// The subkernel whose entry is `block`, if any.
    pub fn entered_at(&self, block: NodeIndex) -> Option<SubkernelId> {
        self.list.iter().position(|sub| sub.entry() == block)
    }

    /// First-claiming subkernel of a block; the deterministic sort key used
    /// by the preserved-data layout.
    pub fn owner_of(&self, block: NodeIndex) -> Option<SubkernelId> {
        self.owner.get(&block).copied()
    }
}

pub fn discover(kernel: &Procedure, post_barrier: &HashSet<NodeIndex>) -> Subkernels {
    let mut started: HashSet<NodeIndex> = HashSet::new();
    let mut pending: VecDeque<NodeIndex> = VecDeque::new();
    let mut list = Vec::new();

    pending.push_back(kernel.entry);
    while let Some(root) = pending.pop_front() {
        if !started.insert(root) {
            continue;
        }

        let mut blocks = vec![root];
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        queue.push_back(root);
        while let Some(block) = queue.pop_front() {
            for succ in kernel.successors(block) {
                if post_barrier.contains(&succ) {
                    // Crossed a barrier; that successor roots its own walk.
                    pending.push_back(succ);
                } else if !blocks.contains(&succ) {
                    blocks.push(succ);
                    queue.push_back(succ);
                }
            }
        }
        list.push(Subkernel { blocks });
    }

    let entry_subkernel = list
        .iter()
        .position(|sub| sub.entry() == kernel.entry)
        .expect("the entry walk produced a subkernel");

    let mut owner = HashMap::new();
    for (id, sub) in list.iter().enumerate() {
        for &block in &sub.blocks {
            owner.entry(block).or_insert(id);
        }
    }

    Subkernels {
        list,
        entry_subkernel,
        owner,
    }
}
