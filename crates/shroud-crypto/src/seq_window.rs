//! Sequence window for replay protection.
//!
//! This implements a sliding window to detect and reject replayed records.
//! The window tracks the highest seen sequence number and maintains a
//! bitmap of recently seen records within the window.
//!
//! # Design
//!
//! - Window size: up to 1024 records (default 1024), held in sixteen words
//! - Records at or below `highest - window_size` are rejected
//! - Records already seen within the window are rejected
//! - New records update the bitmap
//!
//! # Thread Safety
//!
//! Not thread-safe. The record opener keeps it under the same lock as the
//! receiving chain it protects.

const WORDS: usize = 16;

/// Largest supported window.
pub const MAX_WINDOW_SIZE: u64 = (WORDS as u64) * 64;

/// Sliding window for replay protection.
#[derive(Debug, Clone)]
pub struct SequenceWindow {
    /// Highest sequence number seen
    highest: u64,
    /// Bit `i` (word `i / 64`, bit `i % 64`) marks `highest - i` as seen
    bitmap: [u64; WORDS],
    /// Window size (number of records to track)
    window_size: u64,
    /// Whether any record has been accepted yet
    started: bool,
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceWindow {
    /// Default window size: 1024 records
    pub const DEFAULT_WINDOW_SIZE: u64 = MAX_WINDOW_SIZE;

    /// Create a new sequence window with the default size.
    pub fn new() -> Self {
        Self::with_size(Self::DEFAULT_WINDOW_SIZE)
    }

    /// Create a new sequence window with a custom size, clamped to
    /// `1..=1024`.
    pub fn with_size(size: u64) -> Self {
        Self {
            highest: 0,
            bitmap: [0; WORDS],
            window_size: size.clamp(1, MAX_WINDOW_SIZE),
            started: false,
        }
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    fn is_set(&self, offset: u64) -> bool {
        let word = (offset / 64) as usize;
        let bit = offset % 64;
        self.bitmap[word] & (1u64 << bit) != 0
    }

    fn set(&mut self, offset: u64) {
        let word = (offset / 64) as usize;
        let bit = offset % 64;
        self.bitmap[word] |= 1u64 << bit;
    }

    /// Move every mark `shift` positions further from `highest`.
    fn slide(&mut self, shift: u64) {
        if shift >= MAX_WINDOW_SIZE {
            self.bitmap = [0; WORDS];
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;

        for i in (0..WORDS).rev() {
            let mut value = 0u64;
            if i >= word_shift {
                value = self.bitmap[i - word_shift] << bit_shift;
                if bit_shift > 0 && i > word_shift {
                    value |= self.bitmap[i - word_shift - 1] >> (64 - bit_shift);
                }
            }
            self.bitmap[i] = value;
        }
    }

    fn too_old(&self, seq: u64) -> bool {
        seq.saturating_add(self.window_size) <= self.highest
    }

    /// Check if a sequence number is valid (not replayed).
    ///
    /// Does NOT update internal state. Use `check_and_update` for that.
    pub fn check(&self, seq: u64) -> bool {
        if !self.started {
            return true;
        }

        if self.too_old(seq) {
            return false;
        }

        if seq > self.highest {
            return true;
        }

        !self.is_set(self.highest - seq)
    }

    /// Check and update: returns true if valid, false if replay.
    ///
    /// If valid, marks the sequence number as seen.
    pub fn check_and_update(&mut self, seq: u64) -> bool {
        if !self.started {
            self.started = true;
            self.highest = seq;
            self.bitmap = [0; WORDS];
            self.set(0);
            return true;
        }

        if self.too_old(seq) {
            return false;
        }

        if seq > self.highest {
            self.slide(seq - self.highest);
            self.set(0);
            self.highest = seq;
            return true;
        }

        let offset = self.highest - seq;
        if self.is_set(offset) {
            return false;
        }
        self.set(offset);
        true
    }

    /// Get the highest sequence number seen.
    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Reset the window to initial state.
    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = [0; WORDS];
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_records() {
        let mut window = SequenceWindow::new();

        for i in 0..=2000 {
            assert!(window.check_and_update(i), "record {} should be valid", i);
        }
    }

    #[test]
    fn test_sequence_zero_first() {
        let mut window = SequenceWindow::new();
        assert!(window.check_and_update(0));
        assert!(!window.check_and_update(0));
        assert!(window.check_and_update(1));
    }

    #[test]
    fn test_replay_detection() {
        let mut window = SequenceWindow::new();

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(2));
        assert!(window.check_and_update(3));

        assert!(!window.check_and_update(1));
        assert!(!window.check_and_update(2));
        assert!(!window.check_and_update(3));
    }

    #[test]
    fn test_out_of_order() {
        let mut window = SequenceWindow::new();

        assert!(window.check_and_update(500));
        assert!(window.check_and_update(3));
        assert!(window.check_and_update(130));
        assert!(window.check_and_update(64));
        assert!(window.check_and_update(63));

        for seq in [3, 63, 64, 130, 500] {
            assert!(!window.check_and_update(seq), "{} replayed", seq);
        }
    }

    #[test]
    fn test_old_record_rejected() {
        let mut window = SequenceWindow::new();

        for i in 1..2000 {
            assert!(window.check_and_update(i));
        }

        // highest = 1999; 975 is exactly window_size behind.
        assert!(!window.check(975));
        assert!(!window.check_and_update(1));
    }

    #[test]
    fn test_window_slides() {
        let mut window = SequenceWindow::with_size(10);

        for i in 1..=10 {
            assert!(window.check_and_update(i));
        }

        assert!(!window.check_and_update(1));
        assert!(window.check_and_update(11));
        assert!(!window.check_and_update(1));
    }

    #[test]
    fn test_slide_across_words() {
        let mut window = SequenceWindow::new();
        assert!(window.check_and_update(10));
        assert!(window.check_and_update(10 + 70));
        assert!(window.check_and_update(10 + 70 + 200));

        assert!(!window.check(10));
        assert!(!window.check(80));
        assert!(window.check(11));
        assert!(window.check(79));
    }

    #[test]
    fn test_large_jump() {
        let mut window = SequenceWindow::new();

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(100_000));

        assert!(!window.check_and_update(1));
        assert!(window.check_and_update(99_999));
    }

    #[test]
    fn test_check_without_update() {
        let mut window = SequenceWindow::new();

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(2));

        assert!(window.check(3));
        assert!(window.check(3));

        assert!(window.check_and_update(3));
        assert!(!window.check(3));
    }

    #[test]
    fn test_size_clamped() {
        assert_eq!(SequenceWindow::with_size(0).window_size(), 1);
        assert_eq!(SequenceWindow::with_size(5000).window_size(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn test_reset() {
        let mut window = SequenceWindow::new();
        assert!(window.check_and_update(42));
        window.reset();
        assert!(window.check_and_update(42));
    }
}
