use crate::util::PTR_SIZE;
use bit_vec::BitVec;

/// Layout of a heap object: its size and which of its words hold pointers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    name: String,
    size: usize,
    ptrmask: BitVec,
}

impl TypeInfo {
    /// Type of `nwords` words where the words listed in `pointer_words` hold heap pointers.
    pub fn new(name: &str, nwords: usize, pointer_words: &[usize]) -> Self {
        let nwords = nwords.max(1);
        let mut ptrmask = BitVec::from_elem(nwords, false);
        for &w in pointer_words {
            assert!(w < nwords, "pointer word {} out of range for {}", w, name);
            ptrmask.set(w, true);
        }
        Self {
            name: name.to_string(),
            size: nwords * PTR_SIZE,
            ptrmask,
        }
    }

    /// Pointer free type of `size` bytes.
    pub fn scalar(name: &str, size: usize) -> Self {
        let nwords = ((size + PTR_SIZE - 1) / PTR_SIZE).max(1);
        Self::new(name, nwords, &[])
    }

    /// Type where every word is a pointer.
    pub fn pointers(name: &str, nwords: usize) -> Self {
        let words = (0..nwords).collect::<Vec<_>>();
        Self::new(name, nwords, &words)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn words(&self) -> usize {
        self.size / PTR_SIZE
    }

    pub fn has_pointers(&self) -> bool {
        self.ptrmask.any()
    }

    pub fn is_pointer(&self, word: usize) -> bool {
        self.ptrmask.get(word).unwrap_or(false)
    }

    pub(crate) fn ptrmask(&self) -> &BitVec {
        &self.ptrmask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        let node = TypeInfo::new("node", 3, &[0, 2]);
        assert_eq!(node.size(), 3 * PTR_SIZE);
        assert!(node.is_pointer(0));
        assert!(!node.is_pointer(1));
        assert!(node.has_pointers());
        assert!(!TypeInfo::scalar("bytes", 13).has_pointers());
        assert_eq!(TypeInfo::scalar("bytes", 13).words(), 2);
        assert_eq!(TypeInfo::pointers("slots", 4).ptrmask().iter().filter(|b| *b).count(), 4);
    }
}
