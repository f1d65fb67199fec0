// Copyright (c) 2024 the wirebuf authors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Scoped allocation for runtime values.
//!
//! An [`Arena`] owns every message, array, map, and string created within a
//! parse/build scope. Message payloads are carved out of bump-allocated
//! blocks; variable-size values live in slabs and are referenced by 4-byte
//! handles. Nothing is freed individually: dropping the arena (or calling
//! [`Arena::uninit`]) runs the registered cleanups in insertion order and
//! releases every block and slab at once.

use std::cell::RefCell;

use crate::message::ValueStore;

/// All allocations are aligned to this many bytes.
const ALIGNMENT: usize = 16;

/// First owned block is this big; subsequent blocks double up to the cap.
const FIRST_BLOCK_SIZE: usize = 256;
const MAX_BLOCK_SIZE: usize = 16 * 1024;

/// A range of bytes owned by the arena's block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRange {
    block: u32,
    start: u32,
    pub len: u32,
}

struct Block {
    data: Box<[u8]>,
    used: usize,
}

#[derive(Default)]
struct Blocks {
    blocks: Vec<Block>,
    next_block_size: usize,
}

impl Blocks {
    fn alloc(&mut self, size: usize) -> RawRange {
        let aligned = size.div_ceil(ALIGNMENT) * ALIGNMENT;
        for (i, b) in self.blocks.iter_mut().enumerate() {
            if b.data.len() - b.used >= aligned {
                let start = b.used;
                b.used += aligned;
                return RawRange {
                    block: i as u32,
                    start: start as u32,
                    len: size as u32,
                };
            }
        }
        let block_size = self.next_block_size.max(aligned);
        self.next_block_size = (self.next_block_size * 2).min(MAX_BLOCK_SIZE);
        self.blocks.push(Block {
            data: vec![0u8; block_size].into_boxed_slice(),
            used: aligned,
        });
        RawRange {
            block: (self.blocks.len() - 1) as u32,
            start: 0,
            len: size as u32,
        }
    }
}

/// Scoped bump allocator with registered destructors.
pub struct Arena {
    blocks: RefCell<Blocks>,
    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
    pub(crate) values: RefCell<ValueStore>,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Self {
            blocks: RefCell::new(Blocks {
                blocks: Vec::new(),
                next_block_size: FIRST_BLOCK_SIZE,
            }),
            cleanups: RefCell::new(Vec::new()),
            values: RefCell::new(ValueStore::default()),
        }
    }

    /// Creates an arena whose first block is the given buffer, donated by
    /// the caller. Useful when the expected allocation volume is known.
    pub fn with_first_block(buf: Vec<u8>) -> Self {
        let arena = Self::new();
        if !buf.is_empty() {
            let mut blocks = arena.blocks.borrow_mut();
            blocks.blocks.push(Block {
                data: buf.into_boxed_slice(),
                used: 0,
            });
        }
        arena
    }

    /// Allocates `new_size` zeroed bytes. If `old` is given, the first
    /// `min(old.len, new_size)` bytes of the old range are preserved in the
    /// returned range. `new_size == 0` returns an empty range; individual
    /// allocations are never freed.
    pub fn alloc(&self, old: Option<RawRange>, new_size: usize) -> RawRange {
        if new_size == 0 {
            return RawRange {
                block: 0,
                start: 0,
                len: 0,
            };
        }
        if let Some(old) = old {
            if old.len as usize >= new_size {
                return RawRange {
                    len: new_size as u32,
                    ..old
                };
            }
        }
        let fresh = self.blocks.borrow_mut().alloc(new_size);
        if let Some(old) = old {
            if old.len > 0 {
                let copy = old.len.min(new_size as u32) as usize;
                let mut buf = vec![0u8; copy];
                self.read(old, 0, &mut buf);
                self.write(fresh, 0, &buf);
            }
        }
        fresh
    }

    /// Copies `src` into the range at byte offset `ofs`.
    pub fn write(&self, r: RawRange, ofs: usize, src: &[u8]) {
        assert!(ofs + src.len() <= r.len as usize);
        let mut blocks = self.blocks.borrow_mut();
        let b = &mut blocks.blocks[r.block as usize];
        let start = r.start as usize + ofs;
        b.data[start..start + src.len()].copy_from_slice(src);
    }

    /// Copies bytes at offset `ofs` of the range into `dst`.
    pub fn read(&self, r: RawRange, ofs: usize, dst: &mut [u8]) {
        assert!(ofs + dst.len() <= r.len as usize);
        let blocks = self.blocks.borrow();
        let b = &blocks.blocks[r.block as usize];
        let start = r.start as usize + ofs;
        dst.copy_from_slice(&b.data[start..start + dst.len()]);
    }

    /// Registers a destructor to run at arena teardown, after which every
    /// owned block is released. Cleanups run in insertion order.
    pub fn add_cleanup(&self, f: Box<dyn FnOnce()>) {
        self.cleanups.borrow_mut().push(f);
    }

    /// Runs all cleanups and frees all owned memory. Idempotent: a second
    /// call is a no-op.
    pub fn uninit(&self) {
        let cleanups: Vec<_> = self.cleanups.borrow_mut().drain(..).collect();
        for f in cleanups {
            f();
        }
        self.blocks.borrow_mut().blocks.clear();
        *self.values.borrow_mut() = ValueStore::default();
    }

    /// Total bytes currently owned by the block list (for tests/tuning).
    pub fn space_allocated(&self) -> usize {
        self.blocks.borrow().blocks.iter().map(|b| b.data.len()).sum()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.uninit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn alloc_preserves_prefix_on_grow() {
        let arena = Arena::new();
        let r = arena.alloc(None, 4);
        arena.write(r, 0, &[1, 2, 3, 4]);
        let r2 = arena.alloc(Some(r), 64);
        let mut buf = [0u8; 4];
        arena.read(r2, 0, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn alloc_zero_is_noop() {
        let arena = Arena::new();
        let r = arena.alloc(None, 0);
        assert_eq!(r.len, 0);
        assert_eq!(arena.space_allocated(), 0);
    }

    #[test]
    fn blocks_double_up_to_cap() {
        let arena = Arena::new();
        for _ in 0..64 {
            arena.alloc(None, 1024);
        }
        let blocks = arena.blocks.borrow();
        assert!(blocks.blocks.iter().all(|b| b.data.len() <= MAX_BLOCK_SIZE));
    }

    #[test]
    fn cleanups_run_in_insertion_order_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let arena = Arena::new();
        for i in 0..3 {
            let log = Rc::clone(&log);
            arena.add_cleanup(Box::new(move || log.borrow_mut().push(i)));
        }
        arena.uninit();
        arena.uninit();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn donated_first_block_is_used() {
        let arena = Arena::with_first_block(vec![0u8; 512]);
        arena.alloc(None, 100);
        assert_eq!(arena.space_allocated(), 512);
    }
}
