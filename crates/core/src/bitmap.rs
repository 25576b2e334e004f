use serde::{Deserialize, Serialize};

/// One bit per absolute field number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBitmap {
    words: Vec<u64>,
    len: usize,
}

impl FieldBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn all_set(len: usize) -> Self {
        let mut bitmap = Self::new(len);
        for field in 0..len {
            bitmap.set(field);
        }
        bitmap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, field: usize) -> bool {
        field < self.len && self.words[field / 64] & (1u64 << (field % 64)) != 0
    }

    /// Returns true when the bit was previously clear. Out-of-range fields are ignored.
    pub fn set(&mut self, field: usize) -> bool {
        if field >= self.len {
            return false;
        }
        let mask = 1u64 << (field % 64);
        let word = &mut self.words[field / 64];
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    pub fn clear(&mut self, field: usize) {
        if field < self.len {
            self.words[field / 64] &= !(1u64 << (field % 64));
        }
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|f| self.get(*f))
    }

    /// Fields from `candidates` whose bit equals `state`.
    pub fn select(&self, candidates: &[usize], state: bool) -> Vec<usize> {
        candidates
            .iter()
            .copied()
            .filter(|f| self.get(*f) == state)
            .collect()
    }

    pub fn union_with(&mut self, other: &FieldBitmap) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= *o;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent() {
        let mut bits = FieldBitmap::new(70);
        assert!(bits.set(65));
        assert!(!bits.set(65));
        assert_eq!(bits.count(), 1);
        assert!(bits.get(65));
        assert!(!bits.get(64));
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut bits = FieldBitmap::new(3);
        assert!(!bits.set(3));
        assert!(!bits.get(100));
        assert!(!bits.any());
    }

    #[test]
    fn select_and_union() {
        let mut loaded = FieldBitmap::new(5);
        loaded.set(1);
        loaded.set(3);
        assert_eq!(loaded.select(&[0, 1, 3, 4], false), vec![0, 4]);

        let mut other = FieldBitmap::new(5);
        other.set(4);
        loaded.union_with(&other);
        assert_eq!(loaded.iter_set().collect::<Vec<_>>(), vec![1, 3, 4]);

        loaded.clear_all();
        assert_eq!(loaded.count(), 0);
    }
}
