use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::{Address, Quantity, Word};
use crate::layout::{REGISTER_COUNT, SUNSPEC_BASE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("no register at address {0}")]
    IllegalAddress(Address),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Holding register image covering the whole SunSpec map, `SUNSPEC_BASE` onwards.
pub struct RegisterImage(Vec<Word>);

impl Default for RegisterImage {
    fn default() -> Self {
        Self(vec![0; usize::from(REGISTER_COUNT)])
    }
}

impl RegisterImage {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(addr: Address) -> Option<usize> {
        addr.checked_sub(SUNSPEC_BASE)
            .map(usize::from)
            .filter(|i| *i < usize::from(REGISTER_COUNT))
    }

    pub fn contains(addr: Address) -> bool {
        Self::index(addr).is_some()
    }

    /// Write consecutive registers with `words` values starting at `addr`.
    ///
    /// The map never grows; words falling outside of it are dropped.
    pub fn insert(&mut self, addr: Address, words: &[Word]) {
        for (i, value) in words.iter().enumerate() {
            let reg_addr = addr.wrapping_add(i as Address);
            debug_assert!(Self::contains(reg_addr), "register {reg_addr} outside the map");
            if let Some(idx) = Self::index(reg_addr) {
                self.0[idx] = *value;
            }
        }
    }

    pub fn get(&self, addr: Address) -> Option<Word> {
        Self::index(addr).map(|idx| self.0[idx])
    }

    /// Read `cnt` consecutive registers starting at `addr`.
    pub fn read(&self, addr: Address, cnt: Quantity) -> Result<Vec<Word>, RegisterError> {
        let mut response_values = Vec::with_capacity(cnt.into());
        for i in 0..cnt {
            let reg_addr = addr
                .checked_add(i)
                .ok_or(RegisterError::IllegalAddress(Address::MAX))?;
            let value = self
                .get(reg_addr)
                .ok_or(RegisterError::IllegalAddress(reg_addr))?;
            response_values.push(value);
        }

        Ok(response_values)
    }
}

/// The live register image shared by the poller (writer) and the Modbus
/// server (readers).
///
/// Every publish replaces the whole image, so a reader sees either the
/// previous cycle or the new one, never a mix.
#[derive(Debug, Clone, Default)]
pub struct RegisterTable(Arc<RwLock<Arc<RegisterImage>>>);

impl RegisterTable {
    pub fn new(image: RegisterImage) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(image))))
    }

    /// Replace the served image.
    pub fn publish(&self, image: RegisterImage) {
        let image = Arc::new(image);
        *self.0.write() = image;
    }

    /// Current image. Holding it does not block publishers.
    pub fn snapshot(&self) -> Arc<RegisterImage> {
        self.0.read().clone()
    }

    /// Read-only handle for the Modbus server.
    pub fn reader(&self) -> RegisterReader {
        RegisterReader(self.clone())
    }
}

/// Read-only view of a [`RegisterTable`].
#[derive(Debug, Clone)]
pub struct RegisterReader(RegisterTable);

impl RegisterReader {
    pub fn read(&self, addr: Address, cnt: Quantity) -> Result<Vec<Word>, RegisterError> {
        self.0.snapshot().read(addr, cnt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::END_MARKER_ADDR;

    #[test]
    fn test_insert_and_read() {
        let mut image = RegisterImage::new();
        image.insert(40070, &[213, 124]);
        assert_eq!(image.read(40069, 4).unwrap(), vec![0, 213, 124, 0]);
        assert_eq!(image.get(40001), Some(0));
    }

    #[test]
    fn test_read_outside_map() {
        let image = RegisterImage::new();
        assert_eq!(
            image.read(40000, 2),
            Err(RegisterError::IllegalAddress(40000))
        );
        assert_eq!(
            image.read(END_MARKER_ADDR, 3),
            Err(RegisterError::IllegalAddress(END_MARKER_ADDR + 2))
        );
        assert_eq!(
            image.read(Address::MAX, 2),
            Err(RegisterError::IllegalAddress(Address::MAX))
        );
        assert_eq!(image.read(SUNSPEC_BASE, REGISTER_COUNT).unwrap().len(), 197);
    }

    #[test]
    fn test_publish_replaces_image() {
        let table = RegisterTable::default();
        let reader = table.reader();
        let before = table.snapshot();

        let mut image = RegisterImage::new();
        image.insert(40072, &[1, 2]);
        table.publish(image);

        assert_eq!(before.read(40072, 2).unwrap(), vec![0, 0]);
        assert_eq!(reader.read(40072, 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_concurrent_reader_never_sees_mixed_cycles() {
        let table = RegisterTable::default();
        let reader = table.reader();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handle = {
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut reads = 0u64;
                loop {
                    let words = reader.read(SUNSPEC_BASE, REGISTER_COUNT).unwrap();
                    let first = words[0];
                    assert!(words.iter().all(|w| *w == first), "mixed image: {words:?}");
                    reads += 1;
                    if done.load(std::sync::atomic::Ordering::Acquire) {
                        break;
                    }
                }
                reads
            })
        };

        for cycle in 1..=2_000u16 {
            let mut image = RegisterImage::new();
            image.insert(SUNSPEC_BASE, &vec![cycle; usize::from(REGISTER_COUNT)]);
            table.publish(image);
        }
        done.store(true, std::sync::atomic::Ordering::Release);

        let reads = handle.join().unwrap();
        assert!(reads > 0);
    }
}
