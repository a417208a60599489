/// Allocator for small integer ids `1..=capacity`.
///
/// Always hands out the lowest free id, so a released id is the next one
/// reused.
#[derive(Debug, Clone)]
pub(crate) struct IdBitmap {
    words: Vec<u64>,
    capacity: u32,
    in_use: u32,
}

impl IdBitmap {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            words: vec![0; (capacity as usize).div_ceil(64)],
            capacity,
            in_use: 0,
        }
    }

    pub(crate) fn alloc(&mut self) -> Option<u32> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros();
            let id = w as u32 * 64 + bit + 1;
            if id > self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            return Some(id);
        }
        None
    }

    /// Returns false if `id` was not allocated.
    pub(crate) fn release(&mut self, id: u32) -> bool {
        if id == 0 || id > self.capacity {
            return false;
        }
        let idx = (id - 1) as usize;
        let (w, bit) = (idx / 64, idx % 64);
        let was_set = self.words[w] & (1 << bit) != 0;
        self.words[w] &= !(1 << bit);
        if was_set {
            self.in_use -= 1;
        }
        was_set
    }

    pub(crate) const fn in_use(&self) -> u32 {
        self.in_use
    }
}
