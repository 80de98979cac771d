use std::ops::Deref;

use petgraph::algo::dominators;
use gridfold_ir::{DefSite, NodeIndex, Procedure};

use super::UseSite;

/// Dominator tree of a procedure CFG from a chosen root.
pub struct DomTree {
    doms: dominators::Dominators<NodeIndex>,
    root: NodeIndex,
}

impl Deref for DomTree {
    type Target = dominators::Dominators<NodeIndex>;

    fn deref(&self) -> &Self::Target {
        &self.doms
    }
}

impl DomTree {
    pub fn build(proc: &Procedure, root: NodeIndex) -> Self {
        Self {
            doms: dominators::simple_fast(&proc.body, root),
            root,
        }
    }

    pub fn reachable(&self, block: NodeIndex) -> bool {
        block == self.root || self.doms.immediate_dominator(block).is_some()
    }

    /// Non-strict block dominance. Unreachable blocks are dominated by
    /// nothing and dominate nothing.
    pub fn block_dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        if !self.reachable(b) || !self.reachable(a) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.doms.immediate_dominator(cur) {
                Some(idom) => cur = idom,
                None => return false,
            }
        }
    }

    /// Whether the definition dominates the given use. φ incoming values are
    /// used at the end of their predecessor block; terminator operands after
    /// every instruction of their block; definitions in the same block
    /// compare by position, φ-nodes ranking before ordinary instructions.
    pub fn dominates_use(&self, def: DefSite, use_site: UseSite) -> bool {
        match use_site {
            UseSite::PhiIncoming { pred } => self.block_dominates(def.block, pred),
            UseSite::Terminator { block } => {
                def.block == block || self.block_dominates(def.block, block)
            }
            UseSite::Op { block, idx } => {
                if def.block == block {
                    def.pos.rank() < (1, idx)
                } else {
                    self.block_dominates(def.block, block)
                }
            }
        }
    }
}
