//! Bytecode → C translation.
//!
//! The generated function never materializes the interpreter's operand
//! stack at runtime. A local `stack[stack_max]` array is declared and the
//! translator simulates the stack pointer at compile time, turning every
//! push and pop into a direct index. Each bytecode position becomes a
//! labeled block; branches become `goto`s; speculative fast paths bail
//! out through a shared `cancel` block that spills the scalar stack back
//! onto the real frame and returns `Qundef` so the interpreter resumes
//! at the current program counter.

mod send;

use crate::error::TranslateError;
use crate::insn::Opcode;
use crate::iseq::Iseq;

/// Per-translation state: the output buffer, the once-per-position
/// compilation bitmap, and the branch-entry bookkeeping.
struct Ctx<'a> {
    iseq: &'a Iseq,
    buf: String,
    compiled: Vec<bool>,
    /// Every position some `goto` or `case` jumps to.
    targets: Vec<usize>,
    /// Branch entries (position, entry stack depth) that must end up
    /// compiled even if the sequential walk never reaches them.
    pending: Vec<(usize, i64)>,
}

/// State local to one conditional branch. Copied, not shared, when a
/// branch forks: each side simulates its own stack pointer.
struct Branch {
    stack_size: i64,
    finish: bool,
}

impl Branch {
    fn push(&mut self) -> i64 {
        let idx = self.stack_size;
        self.stack_size += 1;
        idx
    }

    fn pop(&mut self) -> i64 {
        self.stack_size -= 1;
        self.stack_size
    }

    fn require(&self, depth: i64, pos: usize) -> Result<(), TranslateError> {
        if self.stack_size < depth {
            Err(TranslateError::StackUnderflow { pos })
        } else {
            Ok(())
        }
    }
}

impl<'a> Ctx<'a> {
    fn size(&self) -> usize {
        self.iseq.encoded.len()
    }

    /// Address of the encoded word at `pos`, as the interpreter's pc
    /// would hold it.
    fn pc_addr(&self, pos: usize) -> usize {
        self.iseq.encoded.as_ptr().wrapping_add(pos) as usize
    }

    /// Resolve a branch operand (a signed offset relative to the next
    /// instruction) into an absolute position.
    fn branch_target(&self, next: usize, offset: u64) -> Result<usize, TranslateError> {
        let target = next as i64 + offset as i64;
        if target < 0 || target as usize >= self.size() {
            return Err(TranslateError::BranchOutOfRange {
                target,
                size: self.size(),
            });
        }
        Ok(target as usize)
    }
}

/// Translate an iseq body into a self-contained C function definition.
///
/// The emitted function has the signature
/// `VALUE <funcname>(rb_execution_context_t *ec, rb_control_frame_t *cfp)`
/// and behaves exactly as interpreting the iseq on the same frame,
/// except that speculative paths may return `Qundef` to deoptimize.
pub fn translate(iseq: &Iseq, funcname: &str) -> Result<String, TranslateError> {
    let size = iseq.encoded.len();
    let mut ctx = Ctx {
        iseq,
        buf: String::new(),
        compiled: vec![false; size],
        targets: Vec::new(),
        pending: Vec::new(),
    };

    ctx.buf.push_str(&format!(
        "VALUE {}(rb_execution_context_t *ec, rb_control_frame_t *cfp) {{\n",
        funcname
    ));
    if iseq.stack_max > 0 {
        ctx.buf
            .push_str(&format!("  VALUE stack[{}];\n", iseq.stack_max));
    }

    // A method with optional arguments enters at a pc chosen by the
    // caller's arity; dispatch on it the way the interpreter's opt_pc
    // would.
    if iseq.param.has_opt() {
        ctx.buf
            .push_str("\n  switch (cfp->pc - cfp->iseq->body->iseq_encoded) {\n");
        for &entry in &iseq.param.opt_table {
            let entry = entry as usize;
            if entry >= size {
                return Err(TranslateError::BranchOutOfRange {
                    target: entry as i64,
                    size,
                });
            }
            ctx.buf
                .push_str(&format!("    case {}:\n      goto label_{};\n", entry, entry));
            ctx.targets.push(entry);
            ctx.pending.push((entry, 0));
        }
        ctx.buf.push_str("  }\n");
    }

    compile_insns(&mut ctx, 0, 0, true)?;

    // Branch entries the sequential walk never reached (case dispatch
    // arms, inline-cache hits past a sealed branch) get their own
    // sealed regions.
    while let Some((pos, depth)) = ctx.pending.pop() {
        if !ctx.compiled[pos] {
            compile_insns(&mut ctx, depth, pos, false)?;
        }
    }

    for &target in &ctx.targets {
        if !ctx.compiled[target] {
            return Err(TranslateError::UncompiledTarget { target });
        }
    }

    compile_cancel_handler(&mut ctx);
    ctx.buf.push_str("}\n");
    Ok(ctx.buf)
}

/// Compile one conditional branch starting at `pos`. `live` says whether
/// the preceding emitted text can fall through into `pos`; entries that
/// are only ever reached by `goto` pass `false`.
fn compile_insns(
    ctx: &mut Ctx<'_>,
    stack_size: i64,
    mut pos: usize,
    live: bool,
) -> Result<(), TranslateError> {
    let mut branch = Branch {
        stack_size,
        finish: false,
    };
    let mut live = live;

    while pos < ctx.size() && !branch.finish {
        if ctx.compiled[pos] {
            // Re-entering an already compiled region: only a jump is
            // needed, and only if the text above still flows here.
            if live {
                ctx.buf.push_str(&format!("  goto label_{};\n", pos));
                ctx.targets.push(pos);
            }
            return Ok(());
        }

        let word = ctx.iseq.encoded[pos];
        let op = Opcode::from_word(word).ok_or(TranslateError::BadOpcode { pos, word })?;
        ctx.compiled[pos] = true;

        ctx.buf
            .push_str(&format!("\nlabel_{}: /* {} */\n", pos, op.name()));
        let insn_pos = pos;
        let step = compile_insn(ctx, op, pos, &mut branch)?;
        pos = step.next_pos;
        live = step.live;

        if branch.stack_size < 0 {
            return Err(TranslateError::StackUnderflow { pos: insn_pos });
        }
        if branch.stack_size > ctx.iseq.stack_max as i64 {
            return Err(TranslateError::StackOverflow {
                pos: insn_pos,
                depth: branch.stack_size,
                max: ctx.iseq.stack_max,
            });
        }
    }
    Ok(())
}

/// Where compilation continues after one instruction, and whether the
/// emitted text can fall through to it.
struct Step {
    next_pos: usize,
    live: bool,
}

impl Step {
    fn seq(next_pos: usize) -> Self {
        Step {
            next_pos,
            live: true,
        }
    }

    fn sealed(next_pos: usize) -> Self {
        Step {
            next_pos,
            live: false,
        }
    }
}

fn put_getlocal(buf: &mut String, push_pos: i64, idx: u64, level: u64) {
    buf.push_str(&format!(
        "  stack[{}] = *(vm_get_ep(cfp->ep, 0x{:x}) - 0x{:x});\n",
        push_pos, level, idx
    ));
    buf.push_str("  RB_DEBUG_COUNTER_INC(lvar_get);\n");
    if level > 0 {
        buf.push_str("  RB_DEBUG_COUNTER_INC(lvar_get_dynamic);\n");
    }
}

fn put_setlocal(buf: &mut String, pop_pos: i64, idx: u64, level: u64) {
    buf.push_str(&format!(
        "  vm_env_write(vm_get_ep(cfp->ep, 0x{:x}), -(int)0x{:x}, stack[{}]);\n",
        level, idx, pop_pos
    ));
    buf.push_str("  RB_DEBUG_COUNTER_INC(lvar_set);\n");
    if level > 0 {
        buf.push_str("  RB_DEBUG_COUNTER_INC(lvar_set_dynamic);\n");
    }
}

/// Emit the optimized-call preamble/guard shared by the `opt_*`
/// instructions: bind `recv`/`obj`/`obj2`, evaluate the fast path, and
/// take the cancel exit when the helper reports the speculation failed.
fn put_opt_call(
    ctx: &mut Ctx<'_>,
    b: &mut Branch,
    pos: usize,
    argc: i64,
    expr: &str,
) -> Result<(), TranslateError> {
    b.require(argc, pos)?;
    let ss = b.stack_size;
    ctx.buf.push_str("  {\n");
    ctx.buf
        .push_str(&format!("    VALUE recv = stack[{}];\n", ss - argc));
    if argc >= 2 {
        ctx.buf
            .push_str(&format!("    VALUE obj = stack[{}];\n", ss - (argc - 1)));
    }
    if argc >= 3 {
        ctx.buf
            .push_str(&format!("    VALUE obj2 = stack[{}];\n", ss - (argc - 2)));
    }
    ctx.buf.push_str(&format!("    VALUE result = {};\n", expr));
    ctx.buf.push_str("    if (result == Qundef) {\n");
    ctx.buf
        .push_str(&format!("      cfp->sp = cfp->bp + {};\n", ss + 1));
    ctx.buf.push_str("      goto cancel;\n");
    ctx.buf.push_str("    }\n");
    ctx.buf
        .push_str(&format!("    stack[{}] = result;\n", ss - argc));
    ctx.buf.push_str("  }\n");
    b.stack_size += 1 - argc;
    Ok(())
}

fn ci_cc_addrs(ctx: &Ctx<'_>, pos: usize, ci_op: u64, cc_op: u64) -> Result<(usize, usize), TranslateError> {
    let ci = ctx
        .iseq
        .call_infos
        .get(ci_op as usize)
        .ok_or(TranslateError::BadOperand {
            pos,
            table: "call_infos",
        })?;
    let cc = ctx
        .iseq
        .call_caches
        .get(cc_op as usize)
        .ok_or(TranslateError::BadOperand {
            pos,
            table: "call_caches",
        })?;
    Ok((
        ci as *const _ as usize,
        cc as *const _ as usize,
    ))
}

/// Compile one instruction. May fork (conditional branches compile their
/// fall-through recursively with a copy of the branch state) and may
/// adjust the simulated stack.
fn compile_insn(
    ctx: &mut Ctx<'_>,
    op: Opcode,
    pos: usize,
    b: &mut Branch,
) -> Result<Step, TranslateError> {
    let size = ctx.size();
    if pos + op.len() > size {
        return Err(TranslateError::TruncatedInsn { pos, size });
    }
    let operands: Vec<u64> = ctx.iseq.encoded[pos + 1..pos + op.len()].to_vec();
    let next_pos = pos + op.len();

    // Keep the frame's pc coherent: the catch table and the cancel path
    // both resume interpretation at the current position.
    ctx.buf
        .push_str(&format!("  cfp->pc = (VALUE *)0x{:x};\n", ctx.pc_addr(pos)));

    match op {
        Opcode::Nop => {}

        Opcode::GetLocal => {
            let idx = b.push();
            put_getlocal(&mut ctx.buf, idx, operands[0], operands[1]);
        }
        Opcode::SetLocal => {
            b.require(1, pos)?;
            let idx = b.pop();
            put_setlocal(&mut ctx.buf, idx, operands[0], operands[1]);
        }
        Opcode::GetLocalWc0 => {
            let idx = b.push();
            put_getlocal(&mut ctx.buf, idx, operands[0], 0);
        }
        Opcode::GetLocalWc1 => {
            let idx = b.push();
            put_getlocal(&mut ctx.buf, idx, operands[0], 1);
        }
        Opcode::SetLocalWc0 => {
            b.require(1, pos)?;
            let idx = b.pop();
            put_setlocal(&mut ctx.buf, idx, operands[0], 0);
        }
        Opcode::SetLocalWc1 => {
            b.require(1, pos)?;
            let idx = b.pop();
            put_setlocal(&mut ctx.buf, idx, operands[0], 1);
        }

        Opcode::GetSpecial => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_getspecial(ec, VM_EP_LEP(cfp->ep), 0x{:x}, 0x{:x});\n",
                b.push(),
                operands[0],
                operands[1]
            ));
        }
        Opcode::SetSpecial => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  lep_svar_set(ec, VM_EP_LEP(cfp->ep), 0x{:x}, stack[{}]);\n",
                operands[0],
                b.pop()
            ));
        }
        Opcode::GetInstanceVariable => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_getinstancevariable(cfp->self, 0x{:x}, 0x{:x});\n",
                b.push(),
                operands[0],
                operands[1]
            ));
        }
        Opcode::SetInstanceVariable => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  vm_setinstancevariable(cfp->self, 0x{:x}, stack[{}], 0x{:x});\n",
                operands[0],
                b.pop(),
                operands[1]
            ));
        }
        Opcode::GetClassVariable => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = rb_cvar_get(vm_get_cvar_base(rb_vm_get_cref(cfp->ep), cfp), 0x{:x});\n",
                b.push(),
                operands[0]
            ));
        }
        Opcode::SetClassVariable => {
            b.require(1, pos)?;
            ctx.buf
                .push_str("  vm_ensure_not_refinement_module(cfp->self);\n");
            ctx.buf.push_str(&format!(
                "  rb_cvar_set(vm_get_cvar_base(rb_vm_get_cref(cfp->ep), cfp), 0x{:x}, stack[{}]);\n",
                operands[0],
                b.pop()
            ));
        }
        Opcode::GetConstant => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_get_ev_const(ec, stack[{}], 0x{:x}, 0);\n",
                b.stack_size - 1,
                b.stack_size - 1,
                operands[0]
            ));
        }
        Opcode::SetConstant => {
            b.require(2, pos)?;
            ctx.buf.push_str(&format!(
                "  vm_check_if_namespace(stack[{}]);\n",
                b.stack_size - 2
            ));
            ctx.buf
                .push_str("  vm_ensure_not_refinement_module(cfp->self);\n");
            ctx.buf.push_str(&format!(
                "  rb_const_set(stack[{}], 0x{:x}, stack[{}]);\n",
                b.stack_size - 2,
                operands[0],
                b.stack_size - 1
            ));
            b.stack_size -= 2;
        }
        Opcode::GetGlobal => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = GET_GLOBAL((VALUE)0x{:x});\n",
                b.push(),
                operands[0]
            ));
        }
        Opcode::SetGlobal => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  SET_GLOBAL((VALUE)0x{:x}, stack[{}]);\n",
                operands[0],
                b.pop()
            ));
        }

        Opcode::PutNil => {
            ctx.buf
                .push_str(&format!("  stack[{}] = Qnil;\n", b.push()));
        }
        Opcode::PutSelf => {
            ctx.buf
                .push_str(&format!("  stack[{}] = cfp->self;\n", b.push()));
        }
        Opcode::PutObject => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = (VALUE)0x{:x};\n",
                b.push(),
                operands[0]
            ));
        }
        Opcode::PutObjectFix0 => {
            ctx.buf
                .push_str(&format!("  stack[{}] = INT2FIX(0);\n", b.push()));
        }
        Opcode::PutObjectFix1 => {
            ctx.buf
                .push_str(&format!("  stack[{}] = INT2FIX(1);\n", b.push()));
        }
        Opcode::PutSpecialObject => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_get_special_object(cfp->ep, (enum vm_special_object_type)0x{:x});\n",
                b.push(),
                operands[0]
            ));
        }
        Opcode::PutIseq => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = (VALUE)0x{:x};\n",
                b.push(),
                operands[0]
            ));
        }
        Opcode::PutString => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = rb_str_resurrect(0x{:x});\n",
                b.push(),
                operands[0]
            ));
        }

        Opcode::ConcatStrings => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            let base = b.stack_size - n;
            ctx.buf.push_str(&format!(
                "  stack[{}] = rb_str_concat_literals(0x{:x}, stack + {});\n",
                base, operands[0], base
            ));
            b.stack_size += 1 - n;
        }
        Opcode::ToString => {
            b.require(2, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = rb_obj_as_string_result(stack[{}], stack[{}]);\n",
                b.stack_size - 2,
                b.stack_size - 1,
                b.stack_size - 2
            ));
            b.stack_size -= 1;
        }
        Opcode::FreezeString => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  vm_freezestring(stack[{}], 0x{:x});\n",
                b.stack_size - 1,
                operands[0]
            ));
        }
        Opcode::ToRegexp => {
            let cnt = operands[1] as i64;
            b.require(cnt, pos)?;
            let base = b.stack_size - cnt;
            ctx.buf.push_str("  {\n");
            ctx.buf
                .push_str("    VALUE rb_reg_new_ary(VALUE ary, int options);\n");
            ctx.buf
                .push_str("    VALUE rb_ary_tmp_new_from_values(VALUE, long, const VALUE *);\n");
            ctx.buf.push_str(&format!(
                "    const VALUE ary = rb_ary_tmp_new_from_values(0, 0x{:x}, stack + {});\n",
                operands[1], base
            ));
            ctx.buf.push_str(&format!(
                "    stack[{}] = rb_reg_new_ary(ary, (int)0x{:x});\n",
                base, operands[0]
            ));
            ctx.buf.push_str("    rb_ary_clear(ary);\n");
            ctx.buf.push_str("  }\n");
            b.stack_size += 1 - cnt;
        }
        Opcode::Intern => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = rb_str_intern(stack[{}]);\n",
                b.stack_size - 1,
                b.stack_size - 1
            ));
        }

        Opcode::NewArray => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            let base = b.stack_size - n;
            ctx.buf.push_str(&format!(
                "  stack[{}] = rb_ary_new4(0x{:x}, stack + {});\n",
                base, operands[0], base
            ));
            b.stack_size += 1 - n;
        }
        Opcode::DupArray => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = rb_ary_resurrect(0x{:x});\n",
                b.push(),
                operands[0]
            ));
        }
        Opcode::ExpandArray => {
            b.require(1, pos)?;
            let space = operands[0] as i64 + (operands[1] as i64 & 1);
            ctx.buf.push_str(&format!(
                "  vm_expandarray(cfp, stack[{}], 0x{:x}, (int)0x{:x});\n",
                b.pop(),
                operands[0],
                operands[1]
            ));
            for i in 0..space {
                ctx.buf.push_str("  cfp->sp--;\n");
                ctx.buf.push_str(&format!(
                    "  stack[{}] = *(cfp->sp);\n",
                    b.stack_size + space - 1 - i
                ));
            }
            b.stack_size += space;
        }
        Opcode::ConcatArray => {
            b.require(2, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_concat_array(stack[{}], stack[{}]);\n",
                b.stack_size - 2,
                b.stack_size - 2,
                b.stack_size - 1
            ));
            b.stack_size -= 1;
        }
        Opcode::SplatArray => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_splat_array(0x{:x}, stack[{}]);\n",
                b.stack_size - 1,
                operands[0],
                b.stack_size - 1
            ));
        }
        Opcode::NewHash => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            let base = b.stack_size - n;
            ctx.buf.push_str("  {\n");
            ctx.buf.push_str("    VALUE val;\n");
            ctx.buf.push_str(&format!(
                "    RUBY_DTRACE_CREATE_HOOK(HASH, 0x{:x});\n",
                operands[0]
            ));
            ctx.buf.push_str(&format!(
                "    val = rb_hash_new_with_size(0x{:x} / 2);\n",
                operands[0]
            ));
            if n > 0 {
                ctx.buf.push_str(&format!(
                    "    rb_hash_bulk_insert(0x{:x}, stack + {}, val);\n",
                    operands[0], base
                ));
            }
            ctx.buf.push_str(&format!("    stack[{}] = val;\n", base));
            ctx.buf.push_str("  }\n");
            b.stack_size += 1 - n;
        }
        Opcode::NewRange => {
            b.require(2, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = rb_range_new(stack[{}], stack[{}], (int)0x{:x});\n",
                b.stack_size - 2,
                b.stack_size - 2,
                b.stack_size - 1,
                operands[0]
            ));
            b.stack_size -= 1;
        }

        Opcode::Pop => {
            b.require(1, pos)?;
            b.stack_size -= 1;
        }
        Opcode::Dup => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = stack[{}];\n",
                b.stack_size,
                b.stack_size - 1
            ));
            b.stack_size += 1;
        }
        Opcode::DupN => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            ctx.buf.push_str(&format!(
                "  MEMCPY(stack + {}, stack + {}, VALUE, 0x{:x});\n",
                b.stack_size,
                b.stack_size - n,
                operands[0]
            ));
            b.stack_size += n;
        }
        Opcode::Swap => {
            b.require(2, pos)?;
            ctx.buf.push_str("  {\n");
            ctx.buf
                .push_str(&format!("    VALUE tmp = stack[{}];\n", b.stack_size - 1));
            ctx.buf.push_str(&format!(
                "    stack[{}] = stack[{}];\n",
                b.stack_size - 1,
                b.stack_size - 2
            ));
            ctx.buf
                .push_str(&format!("    stack[{}] = tmp;\n", b.stack_size - 2));
            ctx.buf.push_str("  }\n");
        }
        Opcode::Reverse => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            let base = b.stack_size - n;
            ctx.buf.push_str("  {\n");
            ctx.buf.push_str("    VALUE v0;\n");
            ctx.buf.push_str("    VALUE v1;\n");
            for i in 0..n / 2 {
                ctx.buf
                    .push_str(&format!("    v0 = stack[{}];\n", base + i));
                ctx.buf
                    .push_str(&format!("    v1 = stack[{}];\n", base + n - i - 1));
                ctx.buf
                    .push_str(&format!("    stack[{}] = v1;\n", base + i));
                ctx.buf
                    .push_str(&format!("    stack[{}] = v0;\n", base + n - i - 1));
            }
            ctx.buf.push_str("  }\n");
        }
        Opcode::Reput => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = stack[{}];\n",
                b.stack_size - 1,
                b.stack_size - 1
            ));
        }
        Opcode::TopN => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = stack[{}];\n",
                b.stack_size,
                b.stack_size - n
            ));
            b.stack_size += 1;
        }
        Opcode::SetN => {
            let n = operands[0] as i64;
            b.require(n + 1, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = stack[{}];\n",
                b.stack_size - 1 - n,
                b.stack_size - 1
            ));
        }
        Opcode::AdjustStack => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            b.stack_size -= n;
        }

        Opcode::Defined => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_defined(ec, cfp, 0x{:x}, 0x{:x}, 0x{:x}, stack[{}]);\n",
                b.stack_size - 1,
                operands[0],
                operands[1],
                operands[2],
                b.stack_size - 1
            ));
        }
        Opcode::CheckMatch => {
            b.require(2, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_check_match(ec, stack[{}], stack[{}], 0x{:x});\n",
                b.stack_size - 2,
                b.stack_size - 2,
                b.stack_size - 1,
                operands[0]
            ));
            b.stack_size -= 1;
        }
        Opcode::CheckKeyword => {
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_check_keyword(0x{:x}, 0x{:x}, cfp->ep);\n",
                b.push(),
                operands[0],
                operands[1]
            ));
        }

        Opcode::Trace => {
            ctx.buf.push_str(&format!(
                "  vm_dtrace((rb_event_flag_t)0x{:x}, ec);\n",
                operands[0]
            ));
            ctx.buf.push_str(&format!(
                "  EXEC_EVENT_HOOK(ec, (rb_event_flag_t)0x{:x}, cfp->self, 0, 0, 0, Qundef);\n",
                operands[0]
            ));
        }
        Opcode::Trace2 => {
            ctx.buf.push_str(&format!(
                "  vm_dtrace((rb_event_flag_t)0x{:x}, ec);\n",
                operands[0]
            ));
            ctx.buf.push_str(&format!(
                "  EXEC_EVENT_HOOK(ec, (rb_event_flag_t)0x{:x}, cfp->self, 0, 0, 0, 0x{:x});\n",
                operands[0], operands[1]
            ));
        }

        Opcode::DefineClass | Opcode::Once => {
            return Err(TranslateError::UnsupportedInsn(op.name()));
        }

        Opcode::Send => {
            send::compile_send(ctx, b, pos, &operands, true)?;
        }
        Opcode::OptSendWithoutBlock => {
            send::compile_send(ctx, b, pos, &operands, false)?;
        }
        Opcode::InvokeSuper => {
            send::compile_invokesuper(ctx, b, pos, &operands)?;
        }
        Opcode::InvokeBlock => {
            send::compile_invokeblock(ctx, b, pos, &operands)?;
        }

        Opcode::OptStrFreeze => {
            ctx.buf
                .push_str("  if (BASIC_OP_UNREDEFINED_P(BOP_FREEZE, STRING_REDEFINED_OP_FLAG)) {\n");
            ctx.buf.push_str(&format!(
                "    stack[{}] = 0x{:x};\n",
                b.stack_size, operands[0]
            ));
            ctx.buf.push_str("  } else {\n");
            ctx.buf.push_str(&format!(
                "    stack[{}] = rb_funcall(rb_str_resurrect(0x{:x}), idFreeze, 0);\n",
                b.stack_size, operands[0]
            ));
            ctx.buf.push_str("  }\n");
            b.stack_size += 1;
        }
        Opcode::OptStrUminus => {
            ctx.buf
                .push_str("  if (BASIC_OP_UNREDEFINED_P(BOP_UMINUS, STRING_REDEFINED_OP_FLAG)) {\n");
            ctx.buf.push_str(&format!(
                "    stack[{}] = 0x{:x};\n",
                b.stack_size, operands[0]
            ));
            ctx.buf.push_str("  } else {\n");
            ctx.buf.push_str(&format!(
                "    stack[{}] = rb_funcall(rb_str_resurrect(0x{:x}), idUMinus, 0);\n",
                b.stack_size, operands[0]
            ));
            ctx.buf.push_str("  }\n");
            b.stack_size += 1;
        }
        Opcode::OptNewArrayMax => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            let base = b.stack_size - n;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_opt_newarray_max(0x{:x}, stack + {});\n",
                base, operands[0], base
            ));
            b.stack_size += 1 - n;
        }
        Opcode::OptNewArrayMin => {
            let n = operands[0] as i64;
            b.require(n, pos)?;
            let base = b.stack_size - n;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_opt_newarray_min(0x{:x}, stack + {});\n",
                base, operands[0], base
            ));
            b.stack_size += 1 - n;
        }

        Opcode::Leave => {
            if b.stack_size != 1 {
                return Err(TranslateError::UnbalancedLeave {
                    pos,
                    depth: b.stack_size,
                });
            }
            ctx.buf.push_str("  RUBY_VM_CHECK_INTS(ec);\n");
            ctx.buf.push_str("  vm_pop_frame(ec, cfp, cfp->ep);\n");
            ctx.buf
                .push_str(&format!("  return stack[{}];\n", b.stack_size - 1));
            b.finish = true;
        }
        Opcode::Throw => {
            b.require(1, pos)?;
            ctx.buf.push_str("  RUBY_VM_CHECK_INTS(ec);\n");
            ctx.buf.push_str(&format!(
                "  THROW_EXCEPTION(vm_throw(ec, cfp, 0x{:x}, stack[{}]));\n",
                operands[0],
                b.pop()
            ));
            b.finish = true;
        }

        Opcode::Jump => {
            let target = ctx.branch_target(next_pos, operands[0])?;
            ctx.buf.push_str("  RUBY_VM_CHECK_INTS(ec);\n");
            return Ok(Step::seq(target));
        }
        Opcode::BranchIf => {
            b.require(1, pos)?;
            let target = ctx.branch_target(next_pos, operands[0])?;
            ctx.buf
                .push_str(&format!("  if (RTEST(stack[{}])) {{\n", b.pop()));
            ctx.buf.push_str("    RUBY_VM_CHECK_INTS(ec);\n");
            ctx.buf.push_str(&format!("    goto label_{};\n", target));
            ctx.buf.push_str("  }\n");
            ctx.targets.push(target);
            compile_insns(ctx, b.stack_size, next_pos, true)?;
            return Ok(Step::sealed(target));
        }
        Opcode::BranchUnless => {
            b.require(1, pos)?;
            let target = ctx.branch_target(next_pos, operands[0])?;
            ctx.buf
                .push_str(&format!("  if (!RTEST(stack[{}])) {{\n", b.pop()));
            ctx.buf.push_str("    RUBY_VM_CHECK_INTS(ec);\n");
            ctx.buf.push_str(&format!("    goto label_{};\n", target));
            ctx.buf.push_str("  }\n");
            ctx.targets.push(target);
            compile_insns(ctx, b.stack_size, next_pos, true)?;
            return Ok(Step::sealed(target));
        }
        Opcode::BranchNil => {
            b.require(1, pos)?;
            let target = ctx.branch_target(next_pos, operands[0])?;
            ctx.buf
                .push_str(&format!("  if (NIL_P(stack[{}])) {{\n", b.pop()));
            ctx.buf.push_str("    RUBY_VM_CHECK_INTS(ec);\n");
            ctx.buf.push_str(&format!("    goto label_{};\n", target));
            ctx.buf.push_str("  }\n");
            ctx.targets.push(target);
            compile_insns(ctx, b.stack_size, next_pos, true)?;
            return Ok(Step::sealed(target));
        }
        Opcode::BranchIfType => {
            b.require(1, pos)?;
            let target = ctx.branch_target(next_pos, operands[1])?;
            ctx.buf.push_str(&format!(
                "  if (TYPE(stack[{}]) == (int)0x{:x}) {{\n",
                b.pop(),
                operands[0]
            ));
            ctx.buf.push_str("    RUBY_VM_CHECK_INTS(ec);\n");
            ctx.buf.push_str(&format!("    goto label_{};\n", target));
            ctx.buf.push_str("  }\n");
            ctx.targets.push(target);
            ctx.pending.push((target, b.stack_size));
        }

        Opcode::GetInlineCache => {
            let target = ctx.branch_target(next_pos, operands[0])?;
            let ic = ctx
                .iseq
                .inline_caches
                .get(operands[1] as usize)
                .ok_or(TranslateError::BadOperand {
                    pos,
                    table: "inline_caches",
                })?;
            let ic_addr = ic as *const _ as usize;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_ic_hit_p(0x{:x}, cfp->ep);\n",
                b.stack_size, ic_addr
            ));
            ctx.buf
                .push_str(&format!("  if (stack[{}] != Qnil) {{\n", b.stack_size));
            ctx.buf.push_str(&format!("    goto label_{};\n", target));
            ctx.buf.push_str("  }\n");
            b.stack_size += 1;
            ctx.targets.push(target);
            ctx.pending.push((target, b.stack_size));
        }
        Opcode::SetInlineCache => {
            b.require(1, pos)?;
            let ic = ctx
                .iseq
                .inline_caches
                .get(operands[0] as usize)
                .ok_or(TranslateError::BadOperand {
                    pos,
                    table: "inline_caches",
                })?;
            let ic_addr = ic as *const _ as usize;
            ctx.buf.push_str(&format!(
                "  vm_ic_update(0x{:x}, stack[{}], cfp->ep);\n",
                ic_addr,
                b.stack_size - 1
            ));
        }

        Opcode::OptCaseDispatch => {
            b.require(1, pos)?;
            let table = ctx
                .iseq
                .case_tables
                .get(operands[0] as usize)
                .ok_or(TranslateError::BadOperand {
                    pos,
                    table: "case_tables",
                })?;
            let table_addr = table as *const _ as usize;
            let else_offset = operands[1];
            let base = next_pos;
            ctx.buf.push_str(&format!(
                "  switch (vm_case_dispatch(0x{:x}, 0x{:x}, stack[{}])) {{\n",
                table_addr,
                else_offset,
                b.pop()
            ));
            let offsets = table.offsets.clone();
            let mut last: Option<u32> = None;
            for offset in offsets {
                if last == Some(offset) {
                    continue;
                }
                last = Some(offset);
                let target = ctx.branch_target(base, offset as u64)?;
                ctx.buf.push_str(&format!(
                    "    case {}:\n      goto label_{};\n      break;\n",
                    offset, target
                ));
                ctx.targets.push(target);
                ctx.pending.push((target, b.stack_size));
            }
            let else_target = ctx.branch_target(base, else_offset)?;
            ctx.buf.push_str(&format!(
                "    case {}:\n      goto label_{};\n",
                else_offset, else_target
            ));
            ctx.buf.push_str("  }\n");
            ctx.targets.push(else_target);
            ctx.pending.push((else_target, b.stack_size));
        }

        Opcode::OptPlus => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_plus(recv, obj)")?;
        }
        Opcode::OptMinus => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_minus(recv, obj)")?;
        }
        Opcode::OptMult => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_mult(recv, obj)")?;
        }
        Opcode::OptDiv => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_div(recv, obj)")?;
        }
        Opcode::OptMod => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_mod(recv, obj)")?;
        }
        Opcode::OptEq => {
            let (ci, cc) = ci_cc_addrs(ctx, pos, operands[0], operands[1])?;
            let expr = format!("opt_eq_func(recv, obj, 0x{:x}, 0x{:x})", ci, cc);
            put_opt_call(ctx, b, pos, 2, &expr)?;
        }
        Opcode::OptNeq => {
            let (ci, cc) = ci_cc_addrs(ctx, pos, operands[0], operands[1])?;
            let (ci_eq, cc_eq) = ci_cc_addrs(ctx, pos, operands[2], operands[3])?;
            let expr = format!(
                "vm_opt_neq(0x{:x}, 0x{:x}, 0x{:x}, 0x{:x}, recv, obj)",
                ci, cc, ci_eq, cc_eq
            );
            put_opt_call(ctx, b, pos, 2, &expr)?;
        }
        Opcode::OptLt => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_lt(recv, obj)")?;
        }
        Opcode::OptLe => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_le(recv, obj)")?;
        }
        Opcode::OptGt => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_gt(recv, obj)")?;
        }
        Opcode::OptGe => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_ge(recv, obj)")?;
        }
        Opcode::OptLtlt => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_ltlt(recv, obj)")?;
        }
        Opcode::OptAref => {
            put_opt_call(ctx, b, pos, 2, "mjit_opt_aref(recv, obj)")?;
        }
        Opcode::OptAset => {
            put_opt_call(ctx, b, pos, 3, "vm_opt_aset(recv, obj, obj2)")?;
        }
        Opcode::OptAsetWith => {
            let expr = format!("vm_opt_aset_with(recv, 0x{:x}, obj)", operands[2]);
            put_opt_call(ctx, b, pos, 2, &expr)?;
        }
        Opcode::OptArefWith => {
            let expr = format!("vm_opt_aref_with(recv, 0x{:x})", operands[2]);
            put_opt_call(ctx, b, pos, 1, &expr)?;
        }
        Opcode::OptLength => {
            put_opt_call(ctx, b, pos, 1, "vm_opt_length(recv, BOP_LENGTH)")?;
        }
        Opcode::OptSize => {
            put_opt_call(ctx, b, pos, 1, "vm_opt_length(recv, BOP_SIZE)")?;
        }
        Opcode::OptEmptyP => {
            put_opt_call(ctx, b, pos, 1, "vm_opt_empty_p(recv)")?;
        }
        Opcode::OptSucc => {
            put_opt_call(ctx, b, pos, 1, "vm_opt_succ(recv)")?;
        }
        Opcode::OptNot => {
            let (ci, cc) = ci_cc_addrs(ctx, pos, operands[0], operands[1])?;
            let expr = format!("vm_opt_not(0x{:x}, 0x{:x}, recv)", ci, cc);
            put_opt_call(ctx, b, pos, 1, &expr)?;
        }
        Opcode::OptRegexpMatch1 => {
            b.require(1, pos)?;
            ctx.buf.push_str(&format!(
                "  stack[{}] = vm_opt_regexpmatch1((VALUE)0x{:x}, stack[{}]);\n",
                b.stack_size - 1,
                operands[0],
                b.stack_size - 1
            ));
        }
        Opcode::OptRegexpMatch2 => {
            put_opt_call(ctx, b, pos, 2, "vm_opt_regexpmatch2(recv, obj)")?;
        }
    }

    Ok(Step::seq(next_pos))
}

/// The shared deoptimization exit: spill the scalar stack back onto the
/// real frame and hand control back to the interpreter at `cfp->pc`.
fn compile_cancel_handler(ctx: &mut Ctx<'_>) {
    ctx.buf.push_str("\ncancel:\n");
    for i in 0..ctx.iseq.stack_max {
        ctx.buf.push_str(&format!(
            "  *((VALUE *)cfp->bp + {}) = stack[{}];\n",
            i + 1,
            i
        ));
    }
    ctx.buf.push_str("  return Qundef;\n");
}
