//! Call-site lowering: `send`, `opt_send_without_block`, `invokesuper`
//! and `invokeblock`.
//!
//! The interesting part is speculation. When the call cache resolved to
//! a C function or a simple bytecode method under the current global
//! method state, the generated code re-checks the cache at run time and
//! either calls the native method directly or pushes the callee frame
//! inline, skipping the interpreter's dispatch switch. A failed check
//! takes the cancel exit.

use super::{Branch, Ctx};
use crate::error::TranslateError;
use crate::iseq::{
    global_method_state, CallCache, CallInfo, Iseq, MethodKind, MethodVisibility, Value,
    CALL_ARGS_BLOCKARG, CALL_ARGS_SPLAT, CALL_KWARG, CALL_KW_SPLAT,
};
use std::sync::Arc;

fn call_site<'a>(
    ctx: &Ctx<'a>,
    pos: usize,
    ci_op: u64,
    cc_op: u64,
) -> Result<(&'a CallInfo, &'a CallCache), TranslateError> {
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
    Ok((ci, cc))
}

/// The callable-method-entry handle when the cache resolved to a C
/// function and is still current.
fn cfunc_me(cc: &CallCache) -> Option<Value> {
    if global_method_state() != cc.method_state {
        return None;
    }
    match &cc.method {
        Some(MethodKind::Cfunc { me }) => Some(*me),
        _ => None,
    }
}

/// The callee iseq when the cache resolved to a bytecode method and is
/// still current.
fn iseq_if_available(cc: &CallCache) -> Option<(&Arc<Iseq>, Value, MethodVisibility)> {
    if global_method_state() != cc.method_state {
        return None;
    }
    match &cc.method {
        Some(MethodKind::Iseq {
            iseq,
            me,
            visibility,
        }) => Some((iseq, *me, *visibility)),
        _ => None,
    }
}

/// Whether the callee frame can be pushed inline. Mirrors the
/// interpreter's fast-path condition: a simple callee, no splat or
/// keyword handling at the call site, and no protected visibility.
fn inlinable_iseq<'a>(ci: &CallInfo, cc: &'a CallCache) -> Option<(&'a Arc<Iseq>, Value)> {
    let (iseq, me, visibility) = iseq_if_available(cc)?;
    if iseq.param.simple
        && ci.flag & CALL_KW_SPLAT == 0
        && ci.flag & CALL_ARGS_SPLAT == 0
        && ci.flag & CALL_KWARG == 0
        && visibility != MethodVisibility::Protected
    {
        Some((iseq, me))
    } else {
        None
    }
}

/// Spill `argc` simulated slots starting at `base` onto the real operand
/// stack, where the callee expects its receiver and arguments.
fn put_args(buf: &mut String, argc: i64, base: i64) {
    for i in 0..argc {
        buf.push_str(&format!("    *(cfp->sp) = stack[{}];\n", base + i));
        buf.push_str("    cfp->sp++;\n");
    }
}

/// Emit the dispatch for a `calling` struct already set up in the
/// emitted scope, writing the result to `stack[result_pos]`.
fn put_call_method(
    ctx: &mut Ctx<'_>,
    ci: &CallInfo,
    cc: &CallCache,
    ci_addr: usize,
    cc_addr: usize,
    result_pos: i64,
) {
    if let Some(me) = cfunc_me(cc) {
        ctx.buf.push_str(&format!(
            "    stack[{}] = mjit_call_cfunc(ec, cfp, &calling, 0x{:x}, 0x{:x});\n",
            result_pos, ci_addr, me
        ));
        return;
    }

    ctx.buf.push_str("    {\n");
    ctx.buf.push_str("      VALUE v;\n");

    let callee_no_catch = iseq_if_available(cc)
        .map(|(iseq, _, _)| !iseq.has_catch_table)
        .unwrap_or(false);

    if let Some((callee, me)) = inlinable_iseq(ci, cc) {
        let param_size = callee.param.size;
        let local_size = callee.local_table_size.saturating_sub(param_size);
        ctx.buf
            .push_str("      VALUE *argv = cfp->sp - calling.argc;\n");
        ctx.buf.push_str("      cfp->sp = argv - 1;\n");
        ctx.buf.push_str(&format!(
            "      vm_push_frame(ec, 0x{:x}, VM_FRAME_MAGIC_METHOD | VM_ENV_FLAG_LOCAL, calling.recv, calling.block_handler, 0x{:x}, 0x{:x}, argv + {}, {}, {});\n",
            Arc::as_ptr(callee) as usize,
            me,
            callee.encoded.as_ptr() as usize,
            param_size,
            local_size,
            callee.stack_max
        ));
        ctx.buf.push_str("      v = Qundef;\n");
    } else {
        ctx.buf.push_str(&format!(
            "      v = (*((CALL_CACHE)0x{:x})->call)(ec, cfp, &calling, 0x{:x}, 0x{:x});\n",
            cc_addr, ci_addr, cc_addr
        ));
    }

    // Without a catch table in the callee there is no setjmp to honor,
    // so give the callee's own JIT code one chance before falling back
    // to the full vm_exec loop.
    if callee_no_catch {
        ctx.buf
            .push_str("      if (v == Qundef && (v = mjit_exec(ec)) == Qundef) {\n");
    } else {
        ctx.buf.push_str("      if (v == Qundef) {\n");
    }
    ctx.buf
        .push_str("        VM_ENV_FLAGS_SET(ec->cfp->ep, VM_FRAME_FLAG_FINISH);\n");
    ctx.buf
        .push_str(&format!("        stack[{}] = vm_exec(ec);\n", result_pos));
    ctx.buf.push_str("      } else {\n");
    ctx.buf
        .push_str(&format!("        stack[{}] = v;\n", result_pos));
    ctx.buf.push_str("      }\n");
    ctx.buf.push_str("    }\n");
}

/// Compile `send` (`with_block`) and `opt_send_without_block`.
pub(super) fn compile_send(
    ctx: &mut Ctx<'_>,
    b: &mut Branch,
    pos: usize,
    operands: &[u64],
    with_block: bool,
) -> Result<(), TranslateError> {
    let (ci, cc) = call_site(ctx, pos, operands[0], operands[1])?;
    let ci_addr = ci as *const _ as usize;
    let cc_addr = cc as *const _ as usize;

    let mut argc = ci.orig_argc as i64;
    if with_block && ci.flag & CALL_ARGS_BLOCKARG != 0 {
        argc += 1;
    }
    b.require(argc + 1, pos)?;

    let ss = b.stack_size;
    let recv_pos = ss - 1 - argc;

    // Guard: the emitted fast path is only sound while the cache that
    // shaped it is still valid.
    if cfunc_me(cc).is_some() || inlinable_iseq(ci, cc).is_some() {
        ctx.buf.push_str(&format!(
            "  if (UNLIKELY(mjit_check_invalid_cc(stack[{}], {}, {}))) {{\n",
            recv_pos, cc.method_state, cc.class_serial
        ));
    } else {
        ctx.buf.push_str(&format!(
            "  if (UNLIKELY(GET_GLOBAL_METHOD_STATE() != ((CALL_CACHE)0x{:x})->method_state)) {{\n",
            cc_addr
        ));
    }
    ctx.buf
        .push_str(&format!("    cfp->sp = cfp->bp + {};\n", ss + 1));
    ctx.buf.push_str("    goto cancel;\n");
    ctx.buf.push_str("  }\n");

    ctx.buf.push_str("  {\n");
    ctx.buf.push_str("    struct rb_calling_info calling;\n");
    put_args(&mut ctx.buf, argc + 1, recv_pos);
    if with_block {
        ctx.buf.push_str(&format!(
            "    vm_caller_setup_arg_block(ec, cfp, &calling, 0x{:x}, 0x{:x}, FALSE);\n",
            ci_addr, operands[2]
        ));
    } else {
        ctx.buf
            .push_str("    calling.block_handler = VM_BLOCK_HANDLER_NONE;\n");
    }
    ctx.buf
        .push_str(&format!("    calling.argc = {};\n", ci.orig_argc));
    ctx.buf
        .push_str(&format!("    calling.recv = stack[{}];\n", recv_pos));
    put_call_method(ctx, ci, cc, ci_addr, cc_addr, recv_pos);
    ctx.buf.push_str("  }\n");

    b.stack_size -= argc;
    Ok(())
}

/// Compile `invokesuper`: always the generic path, resolved through
/// `vm_search_super_method` at run time.
pub(super) fn compile_invokesuper(
    ctx: &mut Ctx<'_>,
    b: &mut Branch,
    pos: usize,
    operands: &[u64],
) -> Result<(), TranslateError> {
    let (ci, cc) = call_site(ctx, pos, operands[0], operands[1])?;
    let ci_addr = ci as *const _ as usize;
    let cc_addr = cc as *const _ as usize;

    let mut push_count = ci.orig_argc as i64;
    if ci.flag & CALL_ARGS_BLOCKARG != 0 {
        push_count += 1;
    }
    b.require(push_count + 1, pos)?;

    let ss = b.stack_size;
    let result_pos = ss - push_count - 1;

    ctx.buf.push_str("  {\n");
    ctx.buf.push_str("    struct rb_calling_info calling;\n");
    ctx.buf
        .push_str(&format!("    calling.argc = {};\n", ci.orig_argc));
    put_args(&mut ctx.buf, push_count + 1, result_pos);
    ctx.buf.push_str(&format!(
        "    vm_caller_setup_arg_block(ec, cfp, &calling, 0x{:x}, 0x{:x}, TRUE);\n",
        ci_addr, operands[2]
    ));
    ctx.buf.push_str("    calling.recv = cfp->self;\n");
    ctx.buf.push_str(&format!(
        "    vm_search_super_method(ec, cfp, &calling, 0x{:x}, 0x{:x});\n",
        ci_addr, cc_addr
    ));
    ctx.buf.push_str("    {\n");
    ctx.buf.push_str(&format!(
        "      VALUE v = (*((CALL_CACHE)0x{:x})->call)(ec, cfp, &calling, 0x{:x}, 0x{:x});\n",
        cc_addr, ci_addr, cc_addr
    ));
    ctx.buf
        .push_str("      if (v == Qundef && (v = mjit_exec(ec)) == Qundef) {\n");
    ctx.buf
        .push_str("        VM_ENV_FLAGS_SET(ec->cfp->ep, VM_FRAME_FLAG_FINISH);\n");
    ctx.buf
        .push_str(&format!("        stack[{}] = vm_exec(ec);\n", result_pos));
    ctx.buf.push_str("      } else {\n");
    ctx.buf
        .push_str(&format!("        stack[{}] = v;\n", result_pos));
    ctx.buf.push_str("      }\n");
    ctx.buf.push_str("    }\n");
    ctx.buf.push_str("  }\n");

    b.stack_size -= push_count;
    Ok(())
}

/// Compile `invokeblock`.
pub(super) fn compile_invokeblock(
    ctx: &mut Ctx<'_>,
    b: &mut Branch,
    pos: usize,
    operands: &[u64],
) -> Result<(), TranslateError> {
    let ci = ctx
        .iseq
        .call_infos
        .get(operands[0] as usize)
        .ok_or(TranslateError::BadOperand {
            pos,
            table: "call_infos",
        })?;
    let ci_addr = ci as *const _ as usize;
    let argc = ci.orig_argc as i64;
    b.require(argc, pos)?;

    let base = b.stack_size - argc;

    ctx.buf.push_str("  {\n");
    ctx.buf.push_str("    struct rb_calling_info calling;\n");
    ctx.buf.push_str(&format!("    calling.argc = {};\n", argc));
    ctx.buf
        .push_str("    calling.block_handler = VM_BLOCK_HANDLER_NONE;\n");
    ctx.buf.push_str("    calling.recv = cfp->self;\n");
    put_args(&mut ctx.buf, argc, base);
    ctx.buf.push_str(&format!(
        "    stack[{}] = vm_invoke_block(ec, cfp, &calling, 0x{:x});\n",
        base, ci_addr
    ));
    ctx.buf
        .push_str(&format!("    if (stack[{}] == Qundef) {{\n", base));
    ctx.buf
        .push_str("      VM_ENV_FLAGS_SET(ec->cfp->ep, VM_FRAME_FLAG_FINISH);\n");
    ctx.buf
        .push_str(&format!("      stack[{}] = vm_exec(ec);\n", base));
    ctx.buf.push_str("    }\n");
    ctx.buf.push_str("  }\n");

    b.stack_size += 1 - argc;
    Ok(())
}
