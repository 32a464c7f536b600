use crate::arena::PAGE_SIZE;
use crate::util::round_up;

/// Largest object served from a size class. Bigger objects get a dedicated span.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;
const PRECISE_CUTOFF: usize = 128;
const SIZE_STEP: usize = 16;
const SIZE_CLASS_PROGRESSION: f64 = 1.25;

fn generate_size_classes(dump_size_classes: bool, sz_class_progression: f64) -> Vec<usize> {
    let mut result = vec![];
    let add = |result: &mut Vec<usize>, size_class| {
        logln_if!(dump_size_classes, "Adding size class: {}", size_class);
        result.push(size_class);
    };

    add(&mut result, 8);
    let mut size = 16;
    while size < PRECISE_CUTOFF {
        add(&mut result, size);
        size += SIZE_STEP;
    }

    for i in 0.. {
        let approximate_size = PRECISE_CUTOFF as f64 * sz_class_progression.powi(i);
        logln_if!(
            dump_size_classes,
            "     Next size class as a double: {}",
            approximate_size
        );
        let approximate_size_in_bytes = approximate_size as usize;
        assert!(approximate_size_in_bytes >= PRECISE_CUTOFF);

        if approximate_size_in_bytes >= MAX_SMALL_SIZE {
            break;
        }
        let size_class = round_up(approximate_size_in_bytes, SIZE_STEP);
        let span_bytes = span_pages_for(size_class) * PAGE_SIZE;

        let cells_per_span = span_bytes / size_class;
        let possibly_better_size_class = (span_bytes / cells_per_span) & !(SIZE_STEP - 1);
        let original_wastage = span_bytes - cells_per_span * size_class;
        let new_wastage = (possibly_better_size_class - size_class) * cells_per_span;
        logln_if!(
            dump_size_classes,
            "    Original wastage: {}, new wastage: {}",
            original_wastage,
            new_wastage
        );

        let better_size_class = if new_wastage > original_wastage {
            size_class
        } else {
            possibly_better_size_class
        };
        logln_if!(
            dump_size_classes,
            "    Choosing size class: {}",
            better_size_class
        );
        if result.last().map_or(false, |&last| better_size_class <= last) {
            // when size class step is too small
            continue;
        }
        if better_size_class > MAX_SMALL_SIZE {
            break;
        }
        add(&mut result, better_size_class);
    }

    if result.last().copied() != Some(MAX_SMALL_SIZE) {
        add(&mut result, MAX_SMALL_SIZE);
    }
    result
}

/// Smallest page count whose tail waste for `size` objects stays within 1/8 of the span.
fn span_pages_for(size: usize) -> usize {
    let mut npages = round_up(size, PAGE_SIZE) / PAGE_SIZE;
    loop {
        let bytes = npages * PAGE_SIZE;
        if bytes % size <= bytes / 8 {
            return npages;
        }
        npages += 1;
    }
}

/// Size class tables. Class 0 is reserved for large objects.
pub struct SizeClasses {
    class_to_size: Vec<usize>,
    class_to_npages: Vec<usize>,
    size_to_class8: Vec<u8>,
}

impl SizeClasses {
    pub fn new(dump_size_classes: bool) -> Self {
        let classes = generate_size_classes(dump_size_classes, SIZE_CLASS_PROGRESSION);
        let mut class_to_size = vec![0];
        let mut class_to_npages = vec![0];
        for &size in classes.iter() {
            class_to_size.push(size);
            class_to_npages.push(span_pages_for(size));
        }
        assert!(class_to_size.len() <= u8::MAX as usize);

        let mut size_to_class8 = vec![0u8; MAX_SMALL_SIZE / 8 + 1];
        let mut class = 1;
        for (i, slot) in size_to_class8.iter_mut().enumerate() {
            let size = i * 8;
            while class_to_size[class] < size {
                class += 1;
            }
            *slot = class as u8;
        }
        Self {
            class_to_size,
            class_to_npages,
            size_to_class8,
        }
    }

    /// Number of classes including the large object class 0.
    #[inline]
    pub fn count(&self) -> usize {
        self.class_to_size.len()
    }

    #[inline]
    pub fn size_to_class(&self, size: usize) -> usize {
        debug_assert!(size <= MAX_SMALL_SIZE);
        self.size_to_class8[(size + 7) / 8] as usize
    }

    #[inline]
    pub fn class_size(&self, class: usize) -> usize {
        self.class_to_size[class]
    }

    #[inline]
    pub fn class_npages(&self, class: usize) -> usize {
        self.class_to_npages[class]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_increasing_and_word_aligned() {
        let classes = SizeClasses::new(false);
        for c in 2..classes.count() {
            assert!(classes.class_size(c) > classes.class_size(c - 1));
            assert_eq!(classes.class_size(c) % 8, 0);
        }
        assert_eq!(classes.class_size(classes.count() - 1), MAX_SMALL_SIZE);
    }

    #[test]
    fn lookup_fits_request() {
        let classes = SizeClasses::new(false);
        for size in (1..=MAX_SMALL_SIZE).step_by(7) {
            let c = classes.size_to_class(size);
            assert!(c > 0);
            assert!(classes.class_size(c) >= size);
            if c > 1 {
                assert!(classes.class_size(c - 1) < size);
            }
        }
    }

    #[test]
    fn spans_hold_at_least_one_object() {
        let classes = SizeClasses::new(false);
        for c in 1..classes.count() {
            let bytes = classes.class_npages(c) * PAGE_SIZE;
            assert!(bytes >= classes.class_size(c));
            assert!(bytes % classes.class_size(c) <= bytes / 8);
        }
    }
}
