//! Lock-free Treiber stack of intrusive nodes.
//!
//! The head packs the node address together with the node's push count, so a node that is
//! popped and pushed again between another thread's load and CAS produces a different head word.
//! Nodes are never freed while a stack may still reference them, which is what makes reading
//! `next` of a node that was concurrently popped safe.
use modular_bitfield::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
struct TaggedNode {
    cnt: B19,
    addr: B45,
}

impl TaggedNode {
    fn pack(node: *mut LfNode, cnt: u64) -> u64 {
        let tagged = TaggedNode::new()
            .with_cnt((cnt & ((1 << 19) - 1)) as u32)
            .with_addr((node as u64) >> 3);
        u64::from_le_bytes(tagged.into_bytes())
    }

    fn unpack(val: u64) -> *mut LfNode {
        let tagged = TaggedNode::from_bytes(val.to_le_bytes());
        (tagged.addr() << 3) as *mut LfNode
    }
}

#[repr(C)]
pub struct LfNode {
    next: AtomicU64,
    pushcnt: AtomicU64,
}

impl LfNode {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            pushcnt: AtomicU64::new(0),
        }
    }
}

pub struct LfStack {
    head: AtomicU64,
}

impl LfStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    pub fn push(&self, node: *mut LfNode) {
        let node_ref = unsafe { &*node };
        let cnt = node_ref.pushcnt.fetch_add(1, Ordering::Relaxed) + 1;
        let new = TaggedNode::pack(node, cnt);
        if TaggedNode::unpack(new) != node {
            throw!("lfstack push: invalid packing of node {:p}", node);
        }
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            node_ref.next.store(old, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    pub fn pop(&self) -> Option<*mut LfNode> {
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            if old == 0 {
                return None;
            }
            let node = TaggedNode::unpack(old);
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            match self
                .head
                .compare_exchange_weak(old, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(node),
                Err(current) => old = current,
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn lifo_order() {
        let mut nodes = (0..3).map(|_| Box::new(LfNode::new())).collect::<Vec<_>>();
        let ptrs = nodes
            .iter_mut()
            .map(|n| &mut **n as *mut LfNode)
            .collect::<Vec<_>>();
        let stack = LfStack::new();
        assert!(stack.is_empty());
        for &p in &ptrs {
            stack.push(p);
        }
        assert_eq!(stack.pop(), Some(ptrs[2]));
        assert_eq!(stack.pop(), Some(ptrs[1]));
        stack.push(ptrs[2]);
        assert_eq!(stack.pop(), Some(ptrs[2]));
        assert_eq!(stack.pop(), Some(ptrs[0]));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn concurrent_push_pop_keeps_every_node() {
        const N: usize = 64;
        let nodes = (0..N)
            .map(|_| Box::into_raw(Box::new(LfNode::new())) as usize)
            .collect::<Vec<_>>();
        let stack = Arc::new(LfStack::new());
        for &n in &nodes {
            stack.push(n as *mut LfNode);
        }
        let handles = (0..4)
            .map(|_| {
                let stack = stack.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        if let Some(n) = stack.pop() {
                            stack.push(n);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = HashSet::new();
        while let Some(n) = stack.pop() {
            assert!(seen.insert(n as usize));
        }
        assert_eq!(seen.len(), N);
        for n in nodes {
            unsafe { drop(Box::from_raw(n as *mut LfNode)) };
        }
    }
}
