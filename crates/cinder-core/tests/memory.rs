//! Address-space behaviour through the public engine API.

#![allow(clippy::pedantic, clippy::nursery)]

use bitflags as _;
use cinder_core::{Arch, Engine, Error, ErrorClass, HostBuffer, MemRegion, Mode, Permissions};
use proptest::prelude::*;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

const PAGE: u64 = 0x1000;

fn engine() -> Engine {
    Engine::open(Arch::Riscv, Mode::RISCV64).expect("riscv64 opens")
}

#[test]
fn write_then_read_returns_the_same_bytes() {
    let mut engine = engine();
    engine
        .mem_map_prot(0x1000, 0x1000, Permissions::READ | Permissions::WRITE)
        .expect("map");
    engine.mem_write(0x1000, &[1, 2, 3, 4]).expect("write");
    assert_eq!(engine.mem_read(0x1000, 4), Ok(vec![1, 2, 3, 4]));
}

#[test]
fn oversized_reads_fail_before_allocating() {
    let mut engine = engine();
    engine.mem_map(0x1000, 0x1000).expect("map");
    assert_eq!(engine.mem_read(0x1000, usize::MAX), Err(Error::ReadUnmapped));
    assert_eq!(engine.mem_read(0x1000, 0x1001), Err(Error::ReadUnmapped));
    assert_eq!(engine.mem_read(0x1fff, 2), Err(Error::ReadUnmapped));
    assert_eq!(engine.mem_read(0x1000, 0x1000).map(|bytes| bytes.len()), Ok(0x1000));
}

#[test]
fn write_to_read_only_page_is_a_protection_error() {
    let mut engine = engine();
    engine
        .mem_map_prot(0x1000, 0x1000, Permissions::READ | Permissions::WRITE)
        .expect("map");
    engine
        .mem_protect(0x1000, 0x1000, Permissions::READ)
        .expect("protect");
    assert_eq!(engine.mem_write(0x1000, &[9]), Err(Error::WriteProt));
    assert_eq!(engine.mem_read(0x1000, 1), Ok(vec![0]));
}

#[test]
fn remapping_after_unmap_yields_zeroed_memory() {
    let mut engine = engine();
    engine.mem_map(0x1000, 0x1000).expect("map");
    engine.mem_write(0x1000, &[0xAA; 4]).expect("write");
    engine.mem_unmap(0x1000, 0x1000).expect("unmap");

    let error = engine.mem_read(0x1000, 4).expect_err("unmapped");
    assert_eq!(error, Error::ReadUnmapped);
    assert_eq!(error.class(), ErrorClass::Unmapped);

    engine
        .mem_map_prot(0x1000, 0x1000, Permissions::READ | Permissions::WRITE)
        .expect("remap");
    assert_eq!(engine.mem_read(0x1000, 4), Ok(vec![0, 0, 0, 0]));
}

#[rstest]
#[case(0x1000, 0, Error::InvalidArgument)]
#[case(0x1001, 0x1000, Error::InvalidArgument)]
#[case(0x1000, 0x800, Error::InvalidArgument)]
#[case(0x2000, 0x1000, Error::MapExists)]
#[case(0x1000, 0x2000, Error::MapOverlap)]
#[case(0x2000, 0x2000, Error::MapOverlap)]
fn map_rejections(#[case] addr: u64, #[case] size: u64, #[case] expected: Error) {
    let mut engine = engine();
    engine.mem_map(0x2000, 0x1000).expect("map");
    assert_eq!(engine.mem_map(addr, size), Err(expected));
}

#[test]
fn protect_and_unmap_need_full_coverage() {
    let mut engine = engine();
    engine.mem_map(0x1000, 0x1000).expect("map");
    engine.mem_map(0x3000, 0x1000).expect("map");
    assert_eq!(
        engine.mem_protect(0x1000, 0x3000, Permissions::READ),
        Err(Error::NoMem)
    );
    assert_eq!(engine.mem_unmap(0x2000, 0x1000), Err(Error::NoMem));
    assert_eq!(engine.mem_regions().expect("open").len(), 2);
}

#[test]
fn regions_are_split_by_protect_and_listed_in_order() {
    let mut engine = engine();
    engine.mem_map(0x8000, 0x1000).expect("map");
    engine.mem_map(0x1000, 0x3000).expect("map");
    engine
        .mem_protect(0x2000, 0x1000, Permissions::READ)
        .expect("protect");
    assert_eq!(
        engine.mem_regions(),
        Ok(vec![
            MemRegion {
                begin: 0x1000,
                end: 0x1FFF,
                perms: Permissions::ALL
            },
            MemRegion {
                begin: 0x2000,
                end: 0x2FFF,
                perms: Permissions::READ
            },
            MemRegion {
                begin: 0x3000,
                end: 0x3FFF,
                perms: Permissions::ALL
            },
            MemRegion {
                begin: 0x8000,
                end: 0x8FFF,
                perms: Permissions::ALL
            },
        ])
    );
}

#[test]
fn accesses_may_span_adjacent_regions() {
    let mut engine = engine();
    engine.mem_map(0x1000, 0x1000).expect("map");
    engine.mem_map(0x2000, 0x1000).expect("map");
    engine.mem_write(0x1FFE, &[1, 2, 3, 4]).expect("spanning write");
    assert_eq!(engine.mem_read(0x1FFE, 4), Ok(vec![1, 2, 3, 4]));
}

#[test]
fn zero_length_accesses_succeed_anywhere() {
    let mut engine = engine();
    assert_eq!(engine.mem_read(0xDEAD_0000, 0), Ok(Vec::new()));
    assert_eq!(engine.mem_write(0xDEAD_0000, &[]), Ok(()));
}

#[test]
fn host_backed_memory_is_shared_with_the_host() {
    let mut engine = engine();
    let buffer = HostBuffer::new(0x2000);
    engine
        .mem_map_backed(0x4000, 0x2000, Permissions::ALL, buffer.clone())
        .expect("map");
    engine.mem_write(0x5000, &[7, 8]).expect("write");

    let mut seen = [0; 2];
    buffer.read_at(0x1000, &mut seen).expect("in range");
    assert_eq!(seen, [7, 8]);

    buffer.write_at(0, &[0x55]).expect("in range");
    assert_eq!(engine.mem_read(0x4000, 1), Ok(vec![0x55]));

    engine.mem_unmap(0x4000, 0x2000).expect("unmap");
    buffer.read_at(0x1000, &mut seen).expect("host keeps the buffer");
    assert_eq!(seen, [7, 8]);
}

#[test]
fn custom_page_size_sets_mapping_granularity() {
    let config = cinder_core::EngineConfig {
        page_size: 0x400,
        ..cinder_core::EngineConfig::default()
    };
    let mut engine = Engine::open_with_config(Arch::X86, Mode::MODE_32, config).expect("open");
    assert_eq!(engine.mem_map(0x400, 0x400), Ok(()));
    assert_eq!(
        engine.query(cinder_core::QueryType::PageSize),
        Ok(0x400)
    );
}

proptest! {
    #[test]
    fn read_after_write_identity(
        page in 0_u64..16,
        pages in 1_u64..4,
        offset in 0_u64..0x4000,
        bytes in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut engine = engine();
        let base = page * PAGE;
        let size = pages * PAGE;
        engine.mem_map(base, size).expect("map");

        let len = bytes.len() as u64;
        let addr = base + offset % size;
        let result = engine.mem_write(addr, &bytes);
        if len == 0 || addr + len <= base + size {
            prop_assert_eq!(result, Ok(()));
            prop_assert_eq!(engine.mem_read(addr, bytes.len()), Ok(bytes));
        } else {
            prop_assert_eq!(result, Err(Error::WriteUnmapped));
            prop_assert_eq!(engine.mem_read(addr, bytes.len()), Err(Error::ReadUnmapped));
        }
    }

    #[test]
    fn regions_never_overlap(ops in prop::collection::vec((0_u64..32, 1_u64..4, any::<bool>()), 1..24)) {
        let mut engine = engine();
        for (page, pages, map) in ops {
            let (addr, size) = (page * PAGE, pages * PAGE);
            if map {
                let _ = engine.mem_map(addr, size);
            } else {
                let _ = engine.mem_unmap(addr, size);
            }
        }
        let regions = engine.mem_regions().expect("open");
        for pair in regions.windows(2) {
            prop_assert!(pair[0].end < pair[1].begin);
        }
        for region in &regions {
            prop_assert!(region.begin <= region.end);
            prop_assert_eq!(region.size() % PAGE, 0);
        }
    }
}
