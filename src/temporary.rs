//! Temporary-slot elimination and the post-reduction `Transformer` pass (C6).
//!
//! Grounded on `cfa/temporary.py`'s `TemporaryEliminator` and `Transformer`.
//! The original computes reaching definitions over a fully generic,
//! reflective AST (`Path`, `FIELDS`, `class_name`-based dispatch) so that a
//! single algorithm works across every statement kind. Rust's AST here is a
//! closed enum, so the generic graph-of-`Define`/`Usage` objects collapses
//! to a direct, per-scope forward substitution: within one flat statement
//! list, a single-assignment temporary whose value has no intervening
//! side effects is spliced into its one use and the original assignment is
//! dropped. Unlike the original, inlining never reaches across into a
//! nested loop or branch body — only into the "head" fields (the
//! expressions a `For`/`If`/`While` evaluates before entering its body) of
//! the very next statement that touches the slot. This is a strictly more
//! conservative approximation of the original's full reaching-definitions
//! graph, recorded as a deliberate simplification in DESIGN.md.

use crate::ast::{Decision, Exp, LogicOp, Stmt, StmtKind, StmtList};
use crate::error::{Error, Result};

const MAX_INLINE_ITERATIONS: usize = 100_000;

/// Drives temporary elimination to a fixpoint, then folds generic-for
/// iterator calls. Mirrors `TemporaryEliminator.process` plus the
/// `iter_calls` loop in `collect_scopes`.
pub fn eliminate(statements: &mut StmtList, prototype_number: usize) -> Result<()> {
    fold_iterator_calls(statements);

    let mut iterations = 0usize;
    while inline_pass(statements) {
        iterations += 1;
        if iterations > MAX_INLINE_ITERATIONS {
            return Err(Error::InliningDivergence(iterations));
        }
    }
    let _ = prototype_number;
    Ok(())
}

/// Splits `repeat ... until A or B` back into its natural shape and
/// reshuffles `if`/`elseif` chains. Mirrors the `Transformer` visitor.
pub fn transform(statements: &mut StmtList) {
    transform_list(statements);
}

// ---------------------------------------------------------------------
// Iterator-call folding
// ---------------------------------------------------------------------

fn fold_iterator_calls(list: &mut StmtList) {
    let mut i = 1;
    while i < list.len() {
        if fold_pair(list, i) {
            continue;
        }
        i += 1;
    }
    for stmt in list.iter_mut() {
        recurse_fold(stmt);
    }
}

fn fold_pair(list: &mut StmtList, i: usize) -> bool {
    let matches = match (&list[i - 1].kind, &list[i].kind) {
        (StmtKind::Assign { targets, values }, StmtKind::IterCall { generator, state, control, iterator, .. }) => {
            iterator.is_none()
                && targets.len() == 3
                && values.len() == 1
                && matches!(values[0], Exp::FuncCall { .. })
                && &targets[0] == generator
                && &targets[1] == state
                && &targets[2] == control
        }
        _ => false,
    };
    if !matches {
        return false;
    }
    let removed = list.remove(i - 1);
    if let StmtKind::Assign { mut values, .. } = removed.kind {
        let call = values.remove(0);
        if let StmtKind::IterCall { iterator, .. } = &mut list[i - 1].kind {
            *iterator = Some(call);
        }
    }
    true
}

fn recurse_fold(stmt: &mut Stmt) {
    match &mut stmt.kind {
        StmtKind::If { condition, then_branch, else_branch, else_ifs } => {
            recurse_fold(condition);
            fold_iterator_calls(then_branch);
            if let Some(other) = else_branch {
                fold_iterator_calls(other);
            }
            for (cond, body) in else_ifs.iter_mut() {
                recurse_fold(cond);
                fold_iterator_calls(body);
            }
        }
        StmtKind::For { init, body } => {
            recurse_fold(init);
            fold_iterator_calls(body);
        }
        StmtKind::ForIn { call, body } => {
            recurse_fold(call);
            fold_iterator_calls(body);
        }
        StmtKind::While { condition, body } => {
            fold_iterator_calls(condition);
            fold_iterator_calls(body);
        }
        StmtKind::Repeat { condition, body } => {
            fold_iterator_calls(body);
            recurse_fold(condition);
        }
        StmtKind::BinCondition { left, right, .. } => {
            recurse_fold(left);
            fold_iterator_calls(right);
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------
// Inlining
// ---------------------------------------------------------------------

fn inline_pass(list: &mut StmtList) -> bool {
    if inline_within_list(list) {
        return true;
    }
    for stmt in list.iter_mut() {
        if inline_pass_stmt(stmt) {
            return true;
        }
    }
    false
}

fn inline_pass_stmt(stmt: &mut Stmt) -> bool {
    match &mut stmt.kind {
        StmtKind::If { condition, then_branch, else_branch, else_ifs } => {
            if inline_pass_stmt(condition) {
                return true;
            }
            if inline_pass(then_branch) {
                return true;
            }
            if let Some(other) = else_branch {
                if inline_pass(other) {
                    return true;
                }
            }
            for (cond, body) in else_ifs.iter_mut() {
                if inline_pass_stmt(cond) {
                    return true;
                }
                if inline_pass(body) {
                    return true;
                }
            }
            false
        }
        StmtKind::For { init, body } => inline_pass_stmt(init) || inline_pass(body),
        StmtKind::ForIn { call, body } => inline_pass_stmt(call) || inline_pass(body),
        StmtKind::While { condition, body } => inline_pass(condition) || inline_pass(body),
        StmtKind::Repeat { condition, body } => inline_pass(body) || inline_pass_stmt(condition),
        StmtKind::BinCondition { left, right, .. } => inline_pass_stmt(left) || inline_pass(right),
        _ => false,
    }
}

fn inline_within_list(list: &mut StmtList) -> bool {
    for i in 0..list.len() {
        let candidate = match &list[i].kind {
            StmtKind::Assign { targets, values } if targets.len() == 1 && values.len() == 1 => match &targets[0] {
                Exp::Slot(slot) if !matches!(values[0], Exp::Vararg) => Some((*slot, values[0].clone())),
                _ => None,
            },
            _ => None,
        };
        let Some((slot, value)) = candidate else { continue };

        let has_call = exp_contains_func_call(&value);
        if has_call && !safe_to_inline_func_call(list, i, slot) {
            continue;
        }

        let total_usages: usize = list[i + 1..].iter().map(|s| count_slot_usages_stmt(s, slot)).sum();
        if total_usages == 0 {
            continue;
        }
        let is_global_read = value.is_global_read();
        if total_usages > 1 && !is_global_read {
            continue;
        }

        let Some(j) = (i + 1..list.len()).find(|&j| stmt_references_slot(&list[j], slot)) else { continue };

        if !deps_safe(list, i, j, &value) {
            continue;
        }

        let replaced = substitute_head_fields(&mut list[j], slot, &value);
        if replaced == total_usages {
            list.remove(i);
            return true;
        }
    }
    false
}

fn safe_to_inline_func_call(list: &StmtList, i: usize, slot: i64) -> bool {
    for j in (i + 1)..list.len() {
        if stmt_references_slot(&list[j], slot) {
            return j == i + 1;
        }
    }
    false
}

fn deps_safe(list: &StmtList, i: usize, j: usize, value: &Exp) -> bool {
    let mut deps = Vec::new();
    collect_slot_deps(value, &mut deps);
    for k in (i + 1)..j {
        if deps.iter().any(|&d| stmt_defines_slot(&list[k], d)) {
            return false;
        }
    }
    true
}

fn collect_slot_deps(e: &Exp, out: &mut Vec<i64>) {
    match e {
        Exp::Slot(n) => out.push(*n),
        Exp::Un(_, inner) => collect_slot_deps(inner, out),
        Exp::BinArith(_, l, r) => {
            collect_slot_deps(l, out);
            collect_slot_deps(r, out);
        }
        Exp::TableConstructor { array, dictionary } => {
            for a in array {
                collect_slot_deps(a, out);
            }
            for (k, v) in dictionary {
                collect_slot_deps(k, out);
                collect_slot_deps(v, out);
            }
        }
        Exp::TableElement { table, key } => {
            collect_slot_deps(table, out);
            collect_slot_deps(key, out);
        }
        Exp::FuncCall { func, args, .. } => {
            collect_slot_deps(func, out);
            for a in args {
                collect_slot_deps(a, out);
            }
        }
        _ => {}
    }
}

fn stmt_defines_slot(stmt: &Stmt, slot: i64) -> bool {
    kind_defines_slot(&stmt.kind, slot)
}

fn kind_defines_slot(kind: &StmtKind, slot: i64) -> bool {
    match kind {
        StmtKind::Assign { targets, .. } => targets.iter().any(|t| matches!(t, Exp::Slot(n) if *n == slot)),
        StmtKind::ForInit { index, .. } => matches!(index, Exp::Slot(n) if *n == slot),
        StmtKind::IterCall { values, .. } => values.iter().any(|v| matches!(v, Exp::Slot(n) if *n == slot)),
        StmtKind::If { then_branch, else_branch, else_ifs, .. } => {
            then_branch.iter().any(|s| stmt_defines_slot(s, slot))
                || else_branch.as_ref().map_or(false, |b| b.iter().any(|s| stmt_defines_slot(s, slot)))
                || else_ifs.iter().any(|(_, b)| b.iter().any(|s| stmt_defines_slot(s, slot)))
        }
        StmtKind::For { body, .. } | StmtKind::ForIn { body, .. } | StmtKind::While { body, .. } | StmtKind::Repeat { body, .. } => {
            body.iter().any(|s| stmt_defines_slot(s, slot))
        }
        _ => false,
    }
}

fn substitute_head_fields(stmt: &mut Stmt, slot: i64, value: &Exp) -> usize {
    match &mut stmt.kind {
        StmtKind::Assign { values, .. } => values.iter_mut().map(|e| substitute_in_exp(e, slot, value)).sum(),
        StmtKind::Return { values } => values.iter_mut().map(|e| substitute_in_exp(e, slot, value)).sum(),
        StmtKind::Condition { decision } => substitute_in_decision(decision, slot, value),
        StmtKind::BinCondition { left, .. } => substitute_head_fields(left, slot, value),
        StmtKind::If { condition, .. } => substitute_head_fields(condition, slot, value),
        StmtKind::ForInit { index, start, stop, step } | StmtKind::ForLoop { index, start, stop, step } => {
            [index, start, stop, step].into_iter().map(|e| substitute_in_exp(e, slot, value)).sum()
        }
        StmtKind::IterCall { generator, state, control, values, .. } => {
            substitute_in_exp(generator, slot, value)
                + substitute_in_exp(state, slot, value)
                + substitute_in_exp(control, slot, value)
                + values.iter_mut().map(|e| substitute_in_exp(e, slot, value)).sum::<usize>()
        }
        StmtKind::IterLoop { index, control } => substitute_in_exp(index, slot, value) + substitute_in_exp(control, slot, value),
        StmtKind::For { init, .. } => substitute_head_fields(init, slot, value),
        StmtKind::ForIn { call, .. } => substitute_head_fields(call, slot, value),
        StmtKind::While { condition, .. } => condition.last_mut().map_or(0, |s| substitute_head_fields(s, slot, value)),
        StmtKind::Repeat { condition, .. } => substitute_head_fields(condition, slot, value),
        _ => 0,
    }
}

fn substitute_in_exp(e: &mut Exp, slot: i64, value: &Exp) -> usize {
    if let Exp::Slot(n) = e {
        if *n == slot {
            *e = value.clone();
            return 1;
        }
        return 0;
    }
    match e {
        Exp::Un(_, inner) => substitute_in_exp(inner, slot, value),
        Exp::BinArith(_, l, r) => substitute_in_exp(l, slot, value) + substitute_in_exp(r, slot, value),
        Exp::TableConstructor { array, dictionary } => {
            let mut n = 0;
            for a in array.iter_mut() {
                n += substitute_in_exp(a, slot, value);
            }
            for (k, v) in dictionary.iter_mut() {
                n += substitute_in_exp(k, slot, value);
                n += substitute_in_exp(v, slot, value);
            }
            n
        }
        Exp::TableElement { table, key } => substitute_in_exp(table, slot, value) + substitute_in_exp(key, slot, value),
        Exp::FuncCall { func, args, .. } => {
            let mut n = substitute_in_exp(func, slot, value);
            for a in args.iter_mut() {
                n += substitute_in_exp(a, slot, value);
            }
            n
        }
        _ => 0,
    }
}

fn substitute_in_decision(d: &mut Decision, slot: i64, value: &Exp) -> usize {
    match d {
        Decision::Test { value: v, .. } => substitute_in_exp(v, slot, value),
        Decision::Compare { left, right, .. } => substitute_in_exp(left, slot, value) + substitute_in_exp(right, slot, value),
    }
}

fn exp_contains_func_call(e: &Exp) -> bool {
    match e {
        Exp::FuncCall { .. } => true,
        Exp::Un(_, inner) => exp_contains_func_call(inner),
        Exp::BinArith(_, l, r) => exp_contains_func_call(l) || exp_contains_func_call(r),
        Exp::TableConstructor { array, dictionary } => {
            array.iter().any(exp_contains_func_call) || dictionary.iter().any(|(k, v)| exp_contains_func_call(k) || exp_contains_func_call(v))
        }
        Exp::TableElement { table, key } => exp_contains_func_call(table) || exp_contains_func_call(key),
        _ => false,
    }
}

fn stmt_references_slot(stmt: &Stmt, slot: i64) -> bool {
    count_slot_usages_stmt(stmt, slot) > 0
}

fn count_slot_usages_stmt(stmt: &Stmt, slot: i64) -> usize {
    count_in_kind(&stmt.kind, slot)
}

fn count_in_list(list: &StmtList, slot: i64) -> usize {
    list.iter().map(|s| count_slot_usages_stmt(s, slot)).sum()
}

fn count_in_kind(kind: &StmtKind, slot: i64) -> usize {
    match kind {
        StmtKind::Assign { targets, values } => count_exps(targets, slot) + count_exps(values, slot),
        StmtKind::Return { values } => count_exps(values, slot),
        StmtKind::Condition { decision } => count_in_decision(decision, slot),
        StmtKind::BinCondition { left, right, .. } => count_slot_usages_stmt(left, slot) + count_in_list(right, slot),
        StmtKind::If { condition, then_branch, else_branch, else_ifs } => {
            let mut n = count_slot_usages_stmt(condition, slot) + count_in_list(then_branch, slot);
            if let Some(other) = else_branch {
                n += count_in_list(other, slot);
            }
            for (cond, body) in else_ifs {
                n += count_slot_usages_stmt(cond, slot) + count_in_list(body, slot);
            }
            n
        }
        StmtKind::ForInit { index, start, stop, step } | StmtKind::ForLoop { index, start, stop, step } => {
            count_exp(index, slot) + count_exp(start, slot) + count_exp(stop, slot) + count_exp(step, slot)
        }
        StmtKind::IterCall { generator, state, control, values, iterator } => {
            let mut n = count_exp(generator, slot) + count_exp(state, slot) + count_exp(control, slot) + count_exps(values, slot);
            if let Some(it) = iterator {
                n += count_exp(it, slot);
            }
            n
        }
        StmtKind::IterLoop { index, control } => count_exp(index, slot) + count_exp(control, slot),
        StmtKind::For { init, body } => count_slot_usages_stmt(init, slot) + count_in_list(body, slot),
        StmtKind::ForIn { call, body } => count_slot_usages_stmt(call, slot) + count_in_list(body, slot),
        StmtKind::While { condition, body } => count_in_list(condition, slot) + count_in_list(body, slot),
        StmtKind::Repeat { condition, body } => count_in_list(body, slot) + count_slot_usages_stmt(condition, slot),
        StmtKind::Break | StmtKind::LoopBody | StmtKind::Nop => 0,
    }
}

fn count_exps(es: &[Exp], slot: i64) -> usize {
    es.iter().map(|e| count_exp(e, slot)).sum()
}

fn count_exp(e: &Exp, slot: i64) -> usize {
    match e {
        Exp::Slot(n) if *n == slot => 1,
        Exp::Un(_, inner) => count_exp(inner, slot),
        Exp::BinArith(_, l, r) => count_exp(l, slot) + count_exp(r, slot),
        Exp::TableConstructor { array, dictionary } => {
            count_exps(array, slot) + dictionary.iter().map(|(k, v)| count_exp(k, slot) + count_exp(v, slot)).sum::<usize>()
        }
        Exp::TableElement { table, key } => count_exp(table, slot) + count_exp(key, slot),
        Exp::FuncCall { func, args, .. } => count_exp(func, slot) + count_exps(args, slot),
        _ => 0,
    }
}

fn count_in_decision(d: &Decision, slot: i64) -> usize {
    match d {
        Decision::Test { value, .. } => count_exp(value, slot),
        Decision::Compare { left, right, .. } => count_exp(left, slot) + count_exp(right, slot),
    }
}

// ---------------------------------------------------------------------
// Transformer: repeat-or split and elseif reassembly
// ---------------------------------------------------------------------

fn transform_list(list: &mut StmtList) {
    process_if_list(list);
    for stmt in list.iter_mut() {
        transform_stmt(stmt);
    }
}

fn transform_stmt(stmt: &mut Stmt) {
    match &mut stmt.kind {
        StmtKind::If { condition, then_branch, else_branch, else_ifs } => {
            transform_stmt(condition);
            transform_list(then_branch);
            if let Some(other) = else_branch {
                transform_list(other);
            }
            for (cond, body) in else_ifs.iter_mut() {
                transform_stmt(cond);
                transform_list(body);
            }
        }
        StmtKind::For { init, body } => {
            transform_stmt(init);
            transform_list(body);
        }
        StmtKind::ForIn { call, body } => {
            transform_stmt(call);
            transform_list(body);
        }
        StmtKind::While { condition, body } => {
            transform_list(condition);
            transform_list(body);
        }
        StmtKind::Repeat { .. } => {
            enter_repeat(stmt);
            if let StmtKind::Repeat { condition, body } = &mut stmt.kind {
                transform_stmt(condition);
                transform_list(body);
            }
        }
        StmtKind::BinCondition { left, right, .. } => {
            transform_stmt(left);
            transform_list(right);
        }
        _ => {}
    }
}

/// Splits a `repeat ... until A or B` loop's merged condition back into
/// its natural two-part shape: an early `if A then break end` appended to
/// the body, followed by `B`'s own prefix statements, with `B` itself
/// becoming the loop's tested condition. Mirrors `Transformer.enter_repeat`.
fn enter_repeat(stmt: &mut Stmt) {
    if let StmtKind::Repeat { condition, body } = &mut stmt.kind {
        if !matches!(condition.kind, StmtKind::BinCondition { op: LogicOp::Or, .. }) {
            return;
        }
        let old = std::mem::replace(condition.as_mut(), Stmt::new(0, StmtKind::Nop));
        if let StmtKind::BinCondition { left, mut right, .. } = old.kind {
            let break_addr = left.addr;
            body.push(Stmt::new(
                left.addr,
                StmtKind::If { condition: left, then_branch: vec![Stmt::new(break_addr, StmtKind::Break)], else_branch: None, else_ifs: vec![] },
            ));
            let new_condition = right.pop().expect("BinCondition.right must end in a decision statement");
            body.extend(right);
            **condition = new_condition;
        }
    }
}

fn process_if_list(list: &mut StmtList) {
    let mut i = 0;
    while i < list.len() {
        if matches!(list[i].kind, StmtKind::If { .. }) {
            process_if_at(list, i);
        }
        i += 1;
    }
}

fn process_if_at(list: &mut StmtList, i: usize) {
    let mut extra = StmtList::new();
    if let StmtKind::If { condition, then_branch, else_branch, else_ifs } = &mut list[i].kind {
        process_if(condition, then_branch, else_branch, else_ifs, &mut extra);
    }
    list.extend(extra);
}

/// Mirrors `Transformer.process_if`: canonicalises branch order by address,
/// then hoists a break/return-terminated arm out of the `if`, and finally
/// reassembles a chain of single-statement `else { if ... }` arms into
/// `elseif`s.
fn process_if(
    condition: &mut Box<Stmt>,
    then_branch: &mut StmtList,
    else_branch: &mut Option<StmtList>,
    else_ifs: &mut Vec<(Stmt, StmtList)>,
    extra: &mut StmtList,
) {
    if let Some(other) = else_branch.as_ref() {
        if crate::ast::stmt_list_addr(other) < crate::ast::stmt_list_addr(then_branch) {
            condition.reverse_decision();
            std::mem::swap(then_branch, else_branch.as_mut().unwrap());
        }
    }

    if let Some(other) = else_branch.clone() {
        if then_branch.len() == 1 && matches!(then_branch[0].kind, StmtKind::Break | StmtKind::Return { .. }) {
            extra.extend(other);
            *else_branch = None;
        }
    }

    if let Some(other) = else_branch.clone() {
        if other.len() == 1 && matches!(other[0].kind, StmtKind::Break | StmtKind::Return { .. }) {
            condition.reverse_decision();
            extra.extend(then_branch.clone());
            *then_branch = other;
            *else_branch = None;
        }
    }

    if let Some(mut other) = else_branch.clone() {
        if other.len() == 1 {
            if let StmtKind::If { condition: c_cond, then_branch: c_then, else_branch: c_other, else_ifs: c_elifs } = &mut other[0].kind {
                process_if(c_cond, c_then, c_other, c_elifs, extra);
                else_ifs.push((c_cond.as_ref().clone(), c_then.clone()));
                *else_branch = c_other.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ArithOp, CmpOp};

    #[test]
    fn single_use_temporary_is_inlined() {
        let mut list = vec![
            Stmt::new(1, StmtKind::Assign { targets: vec![Exp::Slot(0)], values: vec![Exp::BinArith(ArithOp::Add, Box::new(Exp::Slot(1)), Box::new(Exp::Slot(2)))] }),
            Stmt::new(2, StmtKind::Return { values: vec![Exp::Slot(0)] }),
        ];
        eliminate(&mut list, 0).unwrap();
        assert_eq!(list.len(), 1);
        match &list[0].kind {
            StmtKind::Return { values } => {
                assert_eq!(values, &[Exp::BinArith(ArithOp::Add, Box::new(Exp::Slot(1)), Box::new(Exp::Slot(2)))]);
            }
            _ => panic!("expected Return"),
        }
    }

    #[test]
    fn multi_use_temporary_is_kept() {
        let mut list = vec![
            Stmt::new(1, StmtKind::Assign { targets: vec![Exp::Slot(0)], values: vec![Exp::Slot(1)] }),
            Stmt::new(2, StmtKind::Assign { targets: vec![Exp::Slot(2)], values: vec![Exp::Slot(0)] }),
            Stmt::new(3, StmtKind::Return { values: vec![Exp::Slot(0)] }),
        ];
        eliminate(&mut list, 0).unwrap();
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn iterator_call_folds_preceding_assign() {
        let call = Exp::FuncCall { func: Box::new(Exp::Slot(9)), args: vec![], is_variadic: false };
        let mut list = vec![
            Stmt::new(1, StmtKind::Assign { targets: vec![Exp::Slot(0), Exp::Slot(1), Exp::Slot(2)], values: vec![call.clone()] }),
            Stmt::new(
                2,
                StmtKind::IterCall { generator: Exp::Slot(0), state: Exp::Slot(1), control: Exp::Slot(2), values: vec![Exp::Slot(3)], iterator: None },
            ),
        ];
        fold_iterator_calls(&mut list);
        assert_eq!(list.len(), 1);
        match &list[0].kind {
            StmtKind::IterCall { iterator, .. } => assert_eq!(iterator.as_ref(), Some(&call)),
            _ => panic!("expected IterCall"),
        }
    }

    #[test]
    fn repeat_or_split_extracts_break() {
        let left = Stmt::new(1, StmtKind::Condition { decision: Decision::Compare { op: CmpOp::Eq, left: Exp::Slot(0), right: Exp::Literal(1) } });
        let right = vec![Stmt::new(2, StmtKind::Condition { decision: Decision::Compare { op: CmpOp::Eq, left: Exp::Slot(1), right: Exp::Literal(2) } })];
        let mut stmt = Stmt::new(
            0,
            StmtKind::Repeat {
                condition: Box::new(Stmt::new(1, StmtKind::BinCondition { op: LogicOp::Or, left: Box::new(left), right })),
                body: vec![],
            },
        );
        enter_repeat(&mut stmt);
        match &stmt.kind {
            StmtKind::Repeat { condition, body } => {
                assert!(matches!(condition.kind, StmtKind::Condition { .. }));
                assert_eq!(body.len(), 1);
                assert!(matches!(body[0].kind, StmtKind::If { .. }));
            }
            _ => panic!("expected Repeat"),
        }
    }
}
