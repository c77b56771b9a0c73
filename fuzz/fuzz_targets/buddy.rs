#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use buddy_region::{Block, BuddyAllocator};
use libfuzzer_sys::fuzz_target;

const MAX_TOTAL_BITS: u8 = 20;

#[derive(Clone, Debug)]
struct Geometry {
    total_size: usize,
    min_block_size: usize,
}

impl Arbitrary<'_> for Geometry {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Geometry> {
        let log_total = 5 + u8::arbitrary(un)? % (MAX_TOTAL_BITS - 4);
        let log_min = 4 + u8::arbitrary(un)? % (log_total - 4);

        Ok(Geometry {
            total_size: 1 << log_total,
            min_block_size: 1 << log_min,
        })
    }
}

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Allocate { size: usize, align_shift: u8 },
    Free(usize),
    Reset,
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    geometry: Geometry,
    ops: Vec<BuddyOp>,
}

fn paint(bytes: &mut [u8], id: u64) {
    for (byte, value) in bytes.iter_mut().zip(id.to_le_bytes().into_iter().cycle()) {
        *byte = value;
    }
}

fn verify(bytes: &[u8], id: u64) -> bool {
    bytes
        .iter()
        .zip(id.to_le_bytes().into_iter().cycle())
        .all(|(&byte, value)| byte == value)
}

fuzz_target!(|args: Args| {
    let Args { geometry, ops } = args;

    let mut buddy =
        BuddyAllocator::try_with_min_block_size(geometry.total_size, geometry.min_block_size)
            .expect("fuzzer produced an invalid geometry");
    buddy.init().expect("backing allocation failed");

    let mut outstanding: Vec<(Block, u64)> = Vec::new();

    for (op_id, op) in ops.into_iter().enumerate() {
        let op_id = op_id as u64;

        match op {
            BuddyOp::Allocate { size, align_shift } => {
                let align = 1usize << (align_shift % 16);
                if let Ok(block) = buddy.allocate(size % (2 * geometry.total_size), align) {
                    assert_eq!(block.offset() % align, 0);
                    paint(buddy.bytes_mut(&block), op_id);
                    outstanding.push((block, op_id));
                }
            }

            BuddyOp::Free(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let (block, id) = outstanding.swap_remove(idx);
                assert!(verify(buddy.bytes(&block), id), "block was overwritten");
                buddy.free(block);
            }

            BuddyOp::Reset => {
                outstanding.clear();
                buddy.reset();
            }
        }

        let used: usize = outstanding.iter().map(|(b, _)| b.size()).sum();
        assert_eq!(buddy.usage().used(), used);
    }

    for (block, id) in outstanding {
        assert!(verify(buddy.bytes(&block), id), "block was overwritten");
        buddy.free(block);
    }

    assert_eq!(buddy.usage().used(), 0);
    assert!(buddy.allocate(geometry.total_size, 0).is_ok());
});
