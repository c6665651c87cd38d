//! Hook registration and dispatch observed through guest execution.

#![allow(clippy::pedantic, clippy::nursery)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bitflags as _;
use cinder_core::{
    Arch, Engine, EngineState, Error, HookCallback, HookType, MemEventKind, Mode, Permissions,
    QueryType, RiscvReg,
};
use proptest as _;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

const BASE: u64 = 0x1000;
const DATA: u64 = 0x1_0000;

const ADDI_A0_A0_1: u32 = 0x0015_0513;
const ADDI_A0_ZERO_5: u32 = 0x0050_0513;
const ADDI_A1_ZERO_1: u32 = 0x0010_0593;
const ADDI_A1_ZERO_10: u32 = 0x00A0_0593;
const ADDI_A7_ZERO_93: u32 = 0x05D0_0893;
const LUI_T0_0X10: u32 = 0x0001_02B7;
const LW_A0_0_T0: u32 = 0x0002_A503;
const SW_A1_4_T0: u32 = 0x00B2_A223;
const LW_A2_4_T0: u32 = 0x0042_A603;
const ECALL: u32 = 0x0000_0073;

fn load(program: &[u32]) -> Engine {
    let mut engine = Engine::open(Arch::Riscv, Mode::RISCV32).expect("open");
    engine.mem_map(BASE, 0x1000).expect("map code");
    let bytes: Vec<u8> = program.iter().flat_map(|word| word.to_le_bytes()).collect();
    engine.mem_write(BASE, &bytes).expect("write code");
    engine
}

fn end_of(program: &[u32]) -> u64 {
    BASE + 4 * program.len() as u64
}

#[test]
fn bounded_code_hook_fires_once_per_instruction_inside_its_range() {
    let program = [ADDI_A0_A0_1; 5];
    let mut engine = load(&program);
    let calls = Rc::new(RefCell::new(Vec::new()));

    let sink = Rc::clone(&calls);
    engine
        .add_code_hook(Some(0x1004..=0x100B), move |_, event| {
            sink.borrow_mut().push(("ranged", event.address, event.size));
        })
        .expect("hook");
    let sink = Rc::clone(&calls);
    engine
        .add_code_hook(None, move |_, event| {
            sink.borrow_mut().push(("all", event.address, event.size));
        })
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(engine.reg_read(RiscvReg::A0), Ok(5));
    assert_eq!(
        *calls.borrow(),
        vec![
            ("all", 0x1000, 4),
            ("ranged", 0x1004, 4),
            ("all", 0x1004, 4),
            ("ranged", 0x1008, 4),
            ("all", 0x1008, 4),
            ("all", 0x100C, 4),
            ("all", 0x1010, 4),
        ]
    );
}

#[test]
fn deleted_hooks_stop_firing() {
    let program = [ADDI_A0_A0_1; 2];
    let mut engine = load(&program);
    let count = Rc::new(Cell::new(0));
    let sink = Rc::clone(&count);
    let handle = engine
        .add_code_hook(None, move |_, _| sink.set(sink.get() + 1))
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(count.get(), 2);

    engine.hook_del(handle).expect("registered");
    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(count.get(), 2);
    assert_eq!(engine.hook_del(handle), Err(Error::HookNotFound));
}

#[test]
fn fault_hook_that_maps_the_page_lets_the_load_complete() {
    let program = [LUI_T0_0X10, LW_A0_0_T0];
    let mut engine = load(&program);
    engine
        .add_fault_hook(HookType::MEM_UNMAPPED, None, |ctx, event| {
            assert_eq!(event.kind, MemEventKind::ReadUnmapped);
            let page = event.address & !0xFFF;
            ctx.mem_map(page, 0x1000, Permissions::READ | Permissions::WRITE)
                .and_then(|()| ctx.mem_write(event.address, &42_u32.to_le_bytes()))
                .is_ok()
        })
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("fault is handled");
    assert_eq!(engine.reg_read(RiscvReg::A0), Ok(42));
    assert_eq!(engine.mem_regions().expect("open").len(), 2);
}

#[test]
fn unhandled_fault_ends_the_run_with_the_access_error() {
    let program = [LUI_T0_0X10, LW_A0_0_T0];
    let mut engine = load(&program);
    let offered = Rc::new(Cell::new(0));
    let sink = Rc::clone(&offered);
    engine
        .add_fault_hook(HookType::MEM_READ_UNMAPPED, None, move |_, _| {
            sink.set(sink.get() + 1);
            false
        })
        .expect("hook");

    assert_eq!(
        engine.start(BASE, end_of(&program)),
        Err(Error::ReadUnmapped)
    );
    assert_eq!(offered.get(), 1);
    assert_eq!(engine.state(), EngineState::Faulted(Error::ReadUnmapped));
    assert_eq!(engine.reg_read(RiscvReg::Pc), Ok(BASE + 4));
}

#[test]
fn claiming_a_fault_without_fixing_it_still_fails() {
    let program = [LUI_T0_0X10, LW_A0_0_T0];
    let mut engine = load(&program);
    engine
        .add_fault_hook(HookType::MEM_INVALID, None, |_, _| true)
        .expect("hook");
    assert_eq!(
        engine.start(BASE, end_of(&program)),
        Err(Error::ReadUnmapped)
    );
}

#[test]
fn protection_faults_reach_protection_hooks() {
    let program = [ADDI_A1_ZERO_10, LUI_T0_0X10, SW_A1_4_T0];
    let mut engine = load(&program);
    engine
        .mem_map_prot(DATA, 0x1000, Permissions::READ)
        .expect("map data");
    let kinds = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&kinds);
    engine
        .add_fault_hook(HookType::MEM_PROT, None, move |ctx, event| {
            sink.borrow_mut().push((event.kind, event.value));
            ctx.mem_protect(DATA, 0x1000, Permissions::READ | Permissions::WRITE)
                .is_ok()
        })
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(*kinds.borrow(), vec![(MemEventKind::WriteProt, 10)]);
    assert_eq!(engine.mem_read(DATA + 4, 4), Ok(vec![10, 0, 0, 0]));
}

#[test]
fn memory_hooks_see_valid_accesses_with_values() {
    let program = [ADDI_A1_ZERO_10, LUI_T0_0X10, SW_A1_4_T0, LW_A2_4_T0];
    let mut engine = load(&program);
    engine.mem_map(DATA, 0x1000).expect("map data");
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    engine
        .add_mem_hook(
            HookType::MEM_VALID | HookType::MEM_READ_AFTER,
            Some(DATA..=DATA + 0xFFF),
            move |_, event| sink.borrow_mut().push(*event),
        )
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("run");
    let seen: Vec<_> = events
        .borrow()
        .iter()
        .map(|event| (event.kind, event.address, event.size, event.value))
        .collect();
    assert_eq!(
        seen,
        vec![
            (MemEventKind::Write, DATA + 4, 4, 10),
            (MemEventKind::Read, DATA + 4, 4, 0),
            (MemEventKind::ReadAfter, DATA + 4, 4, 10),
        ]
    );
    assert_eq!(engine.reg_read(RiscvReg::X12), Ok(10));
}

#[test]
fn interrupt_hook_runs_after_the_trapping_instruction() {
    let program = [ADDI_A7_ZERO_93, ECALL, ADDI_A0_ZERO_5];
    let mut engine = load(&program);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    engine
        .add_intr_hook(move |ctx, intno| {
            let a7 = ctx.reg_read(RiscvReg::A7).expect("valid register");
            sink.borrow_mut().push((intno, a7, ctx.pc()));
        })
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(*seen.borrow(), vec![(11, 93, BASE + 8)]);
    assert_eq!(engine.reg_read(RiscvReg::A0), Ok(5));
}

#[test]
fn interrupt_without_hook_is_an_exception() {
    let program = [ECALL];
    let mut engine = load(&program);
    assert_eq!(engine.start(BASE, end_of(&program)), Err(Error::Exception));
}

#[test]
fn invalid_instruction_hook_can_skip_the_word() {
    let program = [0, ADDI_A0_ZERO_5];
    let mut engine = load(&program);
    assert_eq!(engine.start(BASE, end_of(&program)), Err(Error::InsnInvalid));

    engine
        .add_insn_invalid_hook(|ctx| {
            let pc = ctx.pc();
            ctx.set_pc(pc + 4);
            true
        })
        .expect("hook");
    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(engine.reg_read(RiscvReg::A0), Ok(5));
}

#[test]
fn code_hook_moving_the_pc_skips_the_instruction() {
    let program = [ADDI_A0_ZERO_5, ADDI_A0_A0_1, ADDI_A1_ZERO_1];
    let mut engine = load(&program);
    engine
        .add_code_hook(Some(BASE..=BASE), |ctx, _| ctx.set_pc(BASE + 8))
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(engine.reg_read(RiscvReg::A0), Ok(0));
    assert_eq!(engine.reg_read(RiscvReg::A1), Ok(1));
}

#[test]
fn block_hooks_respect_their_range() {
    // jal zero, 8 ; addi a0, zero, 5 ; addi a0, a0, 1
    let program = [0x0080_006F, ADDI_A0_ZERO_5, ADDI_A0_A0_1];
    let mut engine = load(&program);
    let blocks = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&blocks);
    engine
        .add_block_hook(Some(BASE + 4..=BASE + 0xFFF), move |_, event| {
            sink.borrow_mut().push((event.address, event.size));
        })
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(*blocks.borrow(), vec![(BASE + 8, 4)]);
    assert_eq!(engine.reg_read(RiscvReg::A0), Ok(1));
}

#[test]
fn hook_context_exposes_memory_and_queries() {
    let program = [ADDI_A0_A0_1];
    let mut engine = load(&program);
    engine.mem_map(DATA, 0x1000).expect("map data");
    let seen = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&seen);
    engine
        .add_code_hook(None, move |ctx, _| {
            ctx.mem_write(DATA, b"hook").expect("mapped");
            let regions = ctx.mem_regions();
            *sink.borrow_mut() = Some((
                ctx.mem_read(DATA, 4).expect("mapped"),
                regions.len(),
                ctx.query(QueryType::Arch),
                ctx.query(QueryType::PageSize),
                ctx.mem_read(DATA, usize::MAX).err(),
            ));
        })
        .expect("hook");

    engine.start(BASE, end_of(&program)).expect("run");
    assert_eq!(
        *seen.borrow(),
        Some((
            b"hook".to_vec(),
            2,
            u64::from(Arch::Riscv.code()),
            0x1000,
            Some(Error::ReadUnmapped)
        ))
    );
}

#[rstest]
#[case(HookType::CODE | HookType::MEM_READ, HookCallback::code(|_, _| {}))]
#[case(HookType::MEM_READ, HookCallback::code(|_, _| {}))]
#[case(HookType::MEM_READ_UNMAPPED, HookCallback::mem(|_, _| {}))]
#[case(HookType::INTR | HookType::INSN_INVALID, HookCallback::interrupt(|_, _| {}))]
#[case(HookType::empty(), HookCallback::insn_invalid(|_| false))]
fn mismatched_hook_types_are_rejected(#[case] types: HookType, #[case] callback: HookCallback) {
    let mut engine = load(&[]);
    assert_eq!(
        engine.hook_add(types, callback, None, &[]).err(),
        Some(Error::HookTypeInvalid)
    );
}
