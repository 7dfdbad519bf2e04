//! End-to-end scenarios against the concrete pipeline stages, covering
//! the graph shapes the allocator and optimizer are expected to handle.

use pretty_assertions::assert_eq;

use jit_ir::{Context, ContextFlags, Opcode, RegAllocConfig, ScratchRegisters, Type, REF_UNUSED};

fn folding_context() -> Context {
    Context::new(ContextFlags::FUNCTION | ContextFlags::OPT_FOLDING, 64, 64)
}

/// Installs a `tracing` subscriber once per test binary so `cargo test --
/// --nocapture` surfaces each pass's debug spans; harmless (silently
/// ignored) if a subscriber is already set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// `int32 f(int32 x, int32 y) = x - y`. No constant folding applies
/// since both operands are parameters; this exercises plain construction
/// plus a full pipeline run through register allocation.
#[test]
fn subtract_builds_and_allocates() {
    init_tracing();
    let mut c = Context::new(ContextFlags::FUNCTION, 32, 32);
    let start = c.start();
    let x = c.param(Type::I32, start, "x", 0);
    let y = c.param(Type::I32, start, "y", 1);
    let entry = c.begin(start);
    let diff = c.emit(Opcode::Sub, Type::I32, x, y, REF_UNUSED);
    c.return_(entry, diff, start);

    c.build_cfg();
    c.build_dominators_tree();
    c.find_loops();
    c.gcm();
    c.schedule();
    c.assign_virtual_registers();
    c.compute_live_ranges();
    c.coalesce();
    c.reg_alloc(RegAllocConfig::default()).unwrap();

    let violations = jit_ir::verify(&c);
    assert!(violations.is_empty(), "{violations:?}");

    let diff_vreg = c.vregs.as_ref().unwrap()[diff as usize];
    assert_ne!(diff_vreg, 0, "the subtraction result must carry a vreg (it is used by RETURN)");
    let assignment = c.reg_assignment.as_ref().unwrap();
    assert!(assignment.result_reg(diff).is_some() || assignment.spill_slot.contains_key(&diff_vreg));
}

/// `int32 g() { int32 i = 0; while (i++ < 42); return i; }`, built
/// directly in sea-of-nodes form (a LOOP_BEGIN/LOOP_END pair, one PHI for
/// `i`, and a loop-exit branch) — checks loop discovery and the layout
/// pass keep the header and body contiguous.
#[test]
fn loop_structure_is_recognized() {
    let mut c = Context::new(ContextFlags::FUNCTION, 32, 32);
    let start = c.start();
    let zero = c.const_i32(0);
    let forty_two = c.const_i32(42);
    let entry = c.begin(start);
    let entry_end = c.emit(Opcode::End, Type::Void, entry, REF_UNUSED, REF_UNUSED);

    let loop_begin = c.loop_begin(entry_end);
    let i_phi = c.emit_n(Opcode::Phi, Type::I32, vec![loop_begin, zero, REF_UNUSED]);
    let one = c.const_i32(1);
    let i_next = c.emit(Opcode::Add, Type::I32, i_phi, one, REF_UNUSED);
    let cond = c.cmp(Opcode::Lt, i_phi, forty_two);
    let if_ref = c.if_(loop_begin, cond);
    let body = c.if_true(if_ref);
    let exit_branch = c.if_false(if_ref);
    let loop_end = c.loop_end(body, loop_begin);
    c.set_op(loop_begin, 1, loop_end);
    c.set_op(i_phi, 2, i_next);

    c.return_(exit_branch, i_phi, start);

    c.build_cfg();
    c.build_dominators_tree();
    c.find_loops();
    c.schedule_blocks();

    let cfg = c.cfg.as_ref().unwrap();
    let header_block = cfg.blocks.iter().position(|b| b.start == loop_begin).unwrap() as u32;
    assert!(cfg.blocks[header_block as usize].flags.contains(jit_ir::BlockFlags::LOOP_HEADER));

    let layout = c.block_layout.as_ref().unwrap();
    let body_block = cfg.blocks.iter().position(|b| b.start == body).map(|i| i as u32);
    if let Some(body_block) = body_block {
        let header_pos = layout.position_of(header_block).unwrap();
        let body_pos = layout.position_of(body_block).unwrap();
        assert!(body_pos > header_pos, "the loop body should lay out after its header");
    }

    let violations = jit_ir::verify(&c);
    assert!(violations.is_empty(), "{violations:?}");
}

/// `ADD(CONST 2, CONST 3)` folds to `CONST 5` at construction time;
/// no ADD instruction should ever reach the arena.
#[test]
fn constant_fold_add() {
    let mut c = folding_context();
    let two = c.const_i32(2);
    let three = c.const_i32(3);
    let sum = c.add(Type::I32, two, three);
    assert_eq!(sum, c.const_i32(5));
    assert!(c.arena.insn_refs().all(|r| c.arena.is_nop(r) || c.arena.get(r).op != Opcode::Add));
}

/// `IF(CONST true) { return 1 } else { return 2 }` — after SCCP the
/// false arm and its RETURN are unreachable and must be NOP'd, leaving
/// exactly one live RETURN whose value is `CONST 1`.
#[test]
fn sccp_removes_dead_branch() {
    let mut c = Context::new(ContextFlags::FUNCTION, 32, 32);
    let start = c.start();
    let entry = c.begin(start);
    let cond = c.const_bool(true);
    let if_ref = c.if_(entry, cond);
    let t = c.if_true(if_ref);
    let f = c.if_false(if_ref);
    let one = c.const_i32(1);
    let two = c.const_i32(2);
    let ret_t = c.return_(t, one, start);
    let ret_f = c.return_(f, two, ret_t);

    c.build_cfg();
    c.sccp();

    assert!(c.arena.is_nop(if_ref), "the IF itself is decided statically");
    assert!(c.arena.is_nop(f), "the false successor is unreachable");
    assert!(c.arena.is_nop(ret_f), "the dead RETURN must be NOP'd");
    assert!(!c.arena.is_nop(ret_t));
    assert_eq!(c.arena.get(ret_t).input(1), one);

    let live_returns: Vec<_> = c.arena.insn_refs().filter(|&r| !c.arena.is_nop(r) && c.arena.get(r).op == Opcode::Return).collect();
    assert_eq!(live_returns, vec![ret_t]);
}

/// A diamond merging a value via PHI where both inputs have disjoint
/// live ranges; after coalescing the three vregs collapse into one and
/// neither predecessor needs a DeSSA move.
#[test]
fn coalescing_unifies_diamond_phi() {
    let mut c = Context::new(ContextFlags::FUNCTION, 32, 32);
    let start = c.start();
    let x = c.param(Type::I32, start, "x", 0);
    let cond = c.param(Type::Bool, start, "c", 1);
    let entry = c.begin(start);
    let if_ref = c.if_(entry, cond);
    let t = c.if_true(if_ref);
    let f = c.if_false(if_ref);
    let one = c.const_i32(1);
    let a = c.emit(Opcode::Add, Type::I32, x, one, REF_UNUSED);
    let end_t = c.emit(Opcode::End, Type::Void, t, REF_UNUSED, REF_UNUSED);
    let b = c.emit(Opcode::Sub, Type::I32, x, one, REF_UNUSED);
    let end_f = c.emit(Opcode::End, Type::Void, f, REF_UNUSED, REF_UNUSED);
    let merge = c.merge(vec![end_t, end_f]);
    let phi = c.phi(Type::I32, merge, vec![a, b]);
    c.return_(merge, phi, start);

    c.build_cfg();
    c.build_dominators_tree();
    c.find_loops();
    c.gcm();
    c.schedule();
    c.assign_virtual_registers();
    c.compute_live_ranges();
    c.coalesce();

    let vregs = c.vregs.as_ref().unwrap();
    assert_eq!(vregs[a as usize], vregs[phi as usize]);
    assert_eq!(vregs[b as usize], vregs[phi as usize]);

    let cfg = c.cfg.as_ref().unwrap();
    let pred_a = cfg.blocks.iter().position(|blk| blk.end == end_t).unwrap();
    let pred_b = cfg.blocks.iter().position(|blk| blk.end == end_f).unwrap();
    assert!(!cfg.blocks[pred_a].flags.contains(jit_ir::BlockFlags::DESSA_MOVES));
    assert!(!cfg.blocks[pred_b].flags.contains(jit_ir::BlockFlags::DESSA_MOVES));
}

/// The escape-time kernel at the heart of a Mandelbrot renderer: iterate
/// `z = z*z + c` in `double` arithmetic, counting iterations until either
/// the iteration cap or the escape radius is hit, then return the count.
/// Built directly in sea-of-nodes form with a LOOP_BEGIN/LOOP_END pair, two
/// IFs (the iteration-cap check and the escape check), and four PHIs (the
/// real part, the imaginary part, the iteration count, and the merged
/// result at the loop's two exits) — the one scenario that exercises CFG
/// construction, loop discovery, GCM, scheduling, liveness, coalescing,
/// register allocation, and DeSSA together on a realistic function.
#[test]
fn mandelbrot_kernel_builds_and_allocates() {
    let mut c = Context::new(ContextFlags::FUNCTION, 64, 64);
    let start = c.start();
    let cr = c.param(Type::Double, start, "cr", 0);
    let ci = c.param(Type::Double, start, "ci", 1);
    let max_iter = c.const_i32(50);
    let four = c.const_double(4.0);
    let two = c.const_double(2.0);
    let zero_d = c.const_double(0.0);
    let zero_i = c.const_i32(0);
    let one_i = c.const_i32(1);

    let entry = c.begin(start);
    let entry_end = c.emit(Opcode::End, Type::Void, entry, REF_UNUSED, REF_UNUSED);

    let loop_begin = c.loop_begin(entry_end);
    let zr_phi = c.emit_n(Opcode::Phi, Type::Double, vec![loop_begin, zero_d, REF_UNUSED]);
    let zi_phi = c.emit_n(Opcode::Phi, Type::Double, vec![loop_begin, zero_d, REF_UNUSED]);
    let i_phi = c.emit_n(Opcode::Phi, Type::I32, vec![loop_begin, zero_i, REF_UNUSED]);

    // iteration-cap check
    let under_cap = c.cmp(Opcode::Lt, i_phi, max_iter);
    let cap_if = c.if_(loop_begin, under_cap);
    let cap_body = c.if_true(cap_if);
    let cap_exit = c.if_false(cap_if);

    // escape check: |z|^2 < 4
    let zr2 = c.mul(Type::Double, zr_phi, zr_phi);
    let zi2 = c.mul(Type::Double, zi_phi, zi_phi);
    let mag = c.add(Type::Double, zr2, zi2);
    let within_radius = c.cmp(Opcode::Lt, mag, four);
    let radius_if = c.if_(cap_body, within_radius);
    let loop_body = c.if_true(radius_if);
    let radius_exit = c.if_false(radius_if);

    // z = z*z + c
    let zrzi = c.mul(Type::Double, zr_phi, zi_phi);
    let two_zrzi = c.mul(Type::Double, two, zrzi);
    let new_zi = c.add(Type::Double, two_zrzi, ci);
    let diff = c.sub(Type::Double, zr2, zi2);
    let new_zr = c.add(Type::Double, diff, cr);
    let i_next = c.add(Type::I32, i_phi, one_i);

    let body_end = c.emit(Opcode::End, Type::Void, loop_body, REF_UNUSED, REF_UNUSED);
    let loop_end = c.loop_end(body_end, loop_begin);
    c.set_op(loop_begin, 1, loop_end);
    c.set_op(zr_phi, 2, new_zr);
    c.set_op(zi_phi, 2, new_zi);
    c.set_op(i_phi, 2, i_next);

    let cap_exit_end = c.emit(Opcode::End, Type::Void, cap_exit, REF_UNUSED, REF_UNUSED);
    let radius_exit_end = c.emit(Opcode::End, Type::Void, radius_exit, REF_UNUSED, REF_UNUSED);
    let merge = c.merge(vec![cap_exit_end, radius_exit_end]);
    let result = c.phi(Type::I32, merge, vec![i_phi, i_phi]);
    c.return_(merge, result, start);

    c.build_cfg();
    c.build_dominators_tree();
    c.find_loops();
    c.gcm();
    c.schedule();
    c.assign_virtual_registers();
    c.compute_live_ranges();
    c.coalesce();
    c.reg_alloc(RegAllocConfig::default()).unwrap();
    c.compute_dessa_moves(ScratchRegisters { gp: 7, fp: 7 });

    let violations = jit_ir::verify(&c);
    assert!(violations.is_empty(), "{violations:?}");

    let cfg = c.cfg.as_ref().unwrap();
    let header_block = cfg.blocks.iter().position(|b| b.start == loop_begin).unwrap();
    assert!(cfg.blocks[header_block].flags.contains(jit_ir::BlockFlags::LOOP_HEADER));

    let if_count = c.arena.insn_refs().filter(|&r| !c.arena.is_nop(r) && c.arena.get(r).op == Opcode::If).count();
    assert_eq!(if_count, 2, "the iteration-cap and escape-radius checks are both real IFs");

    let phi_count = c.arena.insn_refs().filter(|&r| !c.arena.is_nop(r) && c.arena.get(r).op == Opcode::Phi).count();
    assert_eq!(phi_count, 4, "zr, zi, i, and the merged exit result");
}

/// A diamond where the PHI input from one arm stays live past the merge
/// (it feeds a second use) cannot be coalesced with the PHI, so DeSSA
/// must insert the move that carries it across.
#[test]
fn dessa_moves_resolve_when_coalescing_fails() {
    let mut c = Context::new(ContextFlags::FUNCTION, 32, 32);
    let start = c.start();
    let x = c.param(Type::I32, start, "x", 0);
    let y = c.param(Type::I32, start, "y", 1);
    let cond = c.param(Type::Bool, start, "c", 2);
    let entry = c.begin(start);
    let if_ref = c.if_(entry, cond);
    let t = c.if_true(if_ref);
    let f = c.if_false(if_ref);
    let end_t = c.emit(Opcode::End, Type::Void, t, REF_UNUSED, REF_UNUSED);
    let end_f = c.emit(Opcode::End, Type::Void, f, REF_UNUSED, REF_UNUSED);
    let merge = c.merge(vec![end_t, end_f]);
    let phi = c.phi(Type::I32, merge, vec![x, y]);
    // x is read again after the merge, so its incoming value can't be
    // coalesced away into the PHI's vreg.
    let also_x = c.emit(Opcode::Add, Type::I32, x, phi, REF_UNUSED);
    c.return_(merge, also_x, start);

    c.build_cfg();
    c.build_dominators_tree();
    c.find_loops();
    c.gcm();
    c.schedule();
    c.assign_virtual_registers();
    c.compute_live_ranges();
    c.coalesce();
    c.reg_alloc(RegAllocConfig::default()).unwrap();
    c.compute_dessa_moves(ScratchRegisters { gp: 7, fp: 7 });

    let violations = jit_ir::verify(&c);
    assert!(violations.is_empty(), "{violations:?}");
    assert!(c.dessa_moves.as_ref().unwrap().per_block.values().any(|moves| !moves.is_empty()));
}
