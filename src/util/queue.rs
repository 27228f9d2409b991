/// Doubly linked list over the indexes `0..n` of some external table.
///
/// Slots `n` and `n + 1` are the head and tail sentinels.
pub struct IndexLink {
    n: usize,
    next: Vec<Option<usize>>,
    prev: Vec<Option<usize>>,
    len: usize,
}

impl IndexLink {
    #[inline]
    pub const fn new() -> Self {
        IndexLink {
            n: 0,
            next: Vec::new(),
            prev: Vec::new(),
            len: 0,
        }
    }

    /// reset to an empty list over `n` indexes.
    pub fn init(&mut self, n: usize) {
        self.n = n;
        self.next.clear();
        self.next.resize(n + 2, None);
        self.prev.clear();
        self.prev.resize(n + 2, None);
        self.next[n] = Some(n + 1);
        self.prev[n + 1] = Some(n);
        self.len = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn first(&self) -> Option<usize> {
        self.next[self.n].filter(|&x| x != self.n + 1)
    }

    #[inline]
    pub fn contains(&self, elm: usize) -> bool {
        self.prev[elm].is_some()
    }

    fn insert_after(&mut self, listelm: usize, elm: usize) {
        debug_assert!(!self.contains(elm));
        let after = self.next[listelm];
        self.next[elm] = after;
        if let Some(x) = after {
            self.prev[x] = Some(elm);
        }
        self.next[listelm] = Some(elm);
        self.prev[elm] = Some(listelm);
        self.len += 1;
    }

    #[inline]
    pub fn insert_head(&mut self, elm: usize) {
        self.insert_after(self.n, elm);
    }

    /// unlink `elm`; does nothing if it is not on the list.
    pub fn remove(&mut self, elm: usize) {
        if !self.contains(elm) {
            return;
        }
        if let Some(x) = self.next[elm] {
            self.prev[x] = self.prev[elm];
        }
        if let Some(x) = self.prev[elm] {
            self.next[x] = self.next[elm];
        }
        self.next[elm] = None;
        self.prev[elm] = None;
        self.len -= 1;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Default for IndexLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::IndexLink;

    #[test]
    fn head_insertion_and_removal() {
        let mut l = IndexLink::new();
        l.init(8);
        assert!(l.is_empty());
        assert_eq!(l.first(), None);
        for i in (0..4).rev() {
            l.insert_head(i);
        }
        assert_eq!(l.first(), Some(0));
        assert_eq!(l.len(), 4);

        l.remove(0);
        l.remove(3);
        l.remove(3);
        assert_eq!(l.first(), Some(1));
        assert_eq!(l.len(), 2);
        assert!(!l.contains(3));
        l.remove(1);
        l.remove(2);
        assert!(l.is_empty());
        assert_eq!(l.first(), None);

        l.insert_head(3);
        l.insert_head(5);
        assert_eq!(l.first(), Some(5));
        l.remove(5);
        assert_eq!(l.first(), Some(3));
        assert_eq!(l.len(), 1);
    }
}
