use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u32 = 64;

/// Dense bit set over piece numbers. `set` and `is_set` are atomic word
/// operations and can run concurrently from any number of workers; growing
/// the backing storage takes the write lock and is exclusive with everything
/// else. The set never shrinks.
pub struct PieceBitmap {
    words: RwLock<Vec<AtomicU64>>,
}

impl PieceBitmap {
    pub fn new() -> Self {
        PieceBitmap {
            words: RwLock::new(Vec::new()),
        }
    }

    /// Marks a piece. Idempotent: setting an already set bit is a no-op.
    pub fn set(&self, piece_num: u32) {
        let word = (piece_num / WORD_BITS) as usize;
        let mask = 1u64 << (piece_num % WORD_BITS);
        {
            let words = self.words.read().expect("bitmap lock poisoned");
            if word < words.len() {
                words[word].fetch_or(mask, Ordering::SeqCst);
                return;
            }
        }
        let mut words = self.words.write().expect("bitmap lock poisoned");
        while words.len() <= word {
            words.push(AtomicU64::new(0));
        }
        words[word].fetch_or(mask, Ordering::SeqCst);
    }

    pub fn is_set(&self, piece_num: u32) -> bool {
        let word = (piece_num / WORD_BITS) as usize;
        let mask = 1u64 << (piece_num % WORD_BITS);
        let words = self.words.read().expect("bitmap lock poisoned");
        word < words.len() && words[word].load(Ordering::SeqCst) & mask != 0
    }

    /// Number of set bits, reported to the scheduler as the finished count.
    pub fn settled(&self) -> i32 {
        let words = self.words.read().expect("bitmap lock poisoned");
        words
            .iter()
            .map(|w| w.load(Ordering::SeqCst).count_ones() as i32)
            .sum()
    }

    /// Wire byte sequence, low piece numbers first within each byte. Only for
    /// debug output, never authoritative.
    pub fn as_bytes(&self) -> Vec<u8> {
        let words = self.words.read().expect("bitmap lock poisoned");
        let mut bytes = Vec::with_capacity(words.len() * 8);
        for w in words.iter() {
            bytes.extend_from_slice(&w.load(Ordering::SeqCst).to_le_bytes());
        }
        bytes
    }
}
