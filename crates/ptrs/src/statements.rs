//! The statement engine: control flow, declarations, try/catch, for-in.
//!
//! Statements return a [`Flow`] token. A block aborts at the first child
//! that produces a non-normal token; loops absorb `Break`/`Continue` and
//! pass `Return` through; the call boundary absorbs `Return`. Once a token
//! is raised it stays raised until the loop or function boundary that owns
//! it, so exits never leak past their scope.

use std::rc::Rc;

use crate::{
    ast::{CatchClause, Ident, OverloadOp, Stmt, StmtLoc, SwitchCase},
    error::{ErrorKind, LoopUnwind, RunError, RunResult},
    run::{Flow, Interp, YieldCtx},
    structs::MemberTag,
    value::{Base, FuncKind, FuncRef, Var},
};

impl Interp {
    pub(crate) fn exec_stmts(&mut self, stmts: &[StmtLoc]) -> RunResult<Flow> {
        for stmt in stmts {
            self.check_signal(stmt.pos)?;
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    pub(crate) fn exec_stmt(&mut self, stmt: &StmtLoc) -> RunResult<Flow> {
        let pos = stmt.pos;
        match &stmt.stmt {
            Stmt::Block(body) => self.exec_stmts(body),
            Stmt::Expr(expr) => {
                self.last_value = self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::VarDef { ident, init } => {
                let value = match init {
                    Some(init) => self.eval(init)?,
                    None => Var::Undefined,
                };
                self.store_local(ident, value, pos)?;
                self.last_value = value;
                Ok(Flow::Normal)
            }
            Stmt::ArrayDef {
                ident,
                size,
                init,
                var_array,
            } => {
                let value = self.exec_array_def(size.as_ref(), init.as_deref(), *var_array, pos)?;
                self.store_local(ident, value, pos)?;
                self.last_value = value;
                Ok(Flow::Normal)
            }
            Stmt::FuncDef { id, ident } => {
                self.scopes.promote(self.cur_frame);
                let value = Var::Func(FuncRef {
                    kind: FuncKind::Script {
                        def: *id,
                        frame: self.cur_frame,
                    },
                    this: None,
                });
                self.store_local(ident, value, pos)?;
                self.last_value = value;
                Ok(Flow::Normal)
            }
            Stmt::StructDef { id, ident } => {
                let value = self.register_struct(*id, pos)?;
                self.store_local(ident, value, pos)?;
                self.last_value = value;
                Ok(Flow::Normal)
            }
            Stmt::If { cond, then, other } => {
                if self.eval(cond)?.to_bool() {
                    self.exec_stmt(then)
                } else if let Some(other) = other {
                    self.exec_stmt(other)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body } => {
                loop {
                    self.check_signal(pos)?;
                    if !self.eval(cond)?.to_bool() {
                        break;
                    }
                    match self.exec_stmt(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile { body, cond } => {
                loop {
                    self.check_signal(pos)?;
                    match self.exec_stmt(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                    if !self.eval(cond)?.to_bool() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.exec_stmt(init)?;
                loop {
                    self.check_signal(pos)?;
                    if !self.eval(cond)?.to_bool() {
                        break;
                    }
                    match self.exec_stmt(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                    self.eval(step)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::ForIn {
                vars,
                subject,
                body,
                frame_slots,
            } => self.exec_forin(vars, subject, body, *frame_slots, pos),
            Stmt::Switch {
                subject,
                cases,
                default,
            } => self.exec_switch(subject, cases, default.as_deref(), pos),
            Stmt::Try {
                body,
                catch,
                finally,
            } => self.exec_try(body, catch.as_ref(), finally.as_deref(), pos),
            Stmt::Throw(expr) => {
                let value = self.eval(expr)?;
                let message = self.to_display(&value);
                Err(self.raise(pos, ErrorKind::UserError, message))
            }
            Stmt::Return(value) => {
                let result = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Var::Undefined,
                };
                Ok(Flow::Return(result))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Delete(expr) => {
                self.exec_delete(expr, pos)?;
                Ok(Flow::Normal)
            }
            Stmt::Import { names, from } => {
                self.exec_import(names, from.as_ref(), pos)?;
                Ok(Flow::Normal)
            }
        }
    }

    pub(crate) fn store_local(&mut self, ident: &Ident, value: Var, pos: u32) -> RunResult<()> {
        let (seg, idx) = self
            .scopes
            .resolve(self.cur_frame, ident.sym)
            .map_err(|e| e.with_pos(self.pos_at(pos)))?;
        self.heap.cells_mut(seg)?[idx] = value;
        Ok(())
    }

    // -- array declarations -------------------------------------------------

    fn exec_array_def(
        &mut self,
        size: Option<&crate::ast::ExprLoc>,
        init: Option<&[crate::ast::ExprLoc]>,
        var_array: bool,
        pos: u32,
    ) -> RunResult<Var> {
        let declared = match size {
            Some(expr) => {
                let n = self.eval(expr)?.to_int();
                if n <= 0 {
                    return Err(self.raise(
                        pos,
                        ErrorKind::StackOverflow,
                        format!("trying to create an array of size {n}"),
                    ));
                }
                Some(usize::try_from(n).expect("array size"))
            }
            None => None,
        };
        let init_vals = match init {
            Some(items) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(self.eval(item)?);
                }
                Some(vals)
            }
            None => None,
        };
        let len = init_vals.as_ref().map_or(0, Vec::len);
        let total = match declared {
            Some(n) if n < len => {
                return Err(self.raise(
                    pos,
                    ErrorKind::OutOfRange,
                    format!("array size ({n}) is too small for its initializer ({len})"),
                ));
            }
            Some(n) => n,
            None if len == 0 => {
                return Err(self.raise(
                    pos,
                    ErrorKind::TypeError,
                    "array declaration needs a size or an initializer",
                ));
            }
            None => len,
        };

        if var_array {
            let seg = self
                .heap
                .alloc_cells(total, true)
                .map_err(|e| e.with_pos(self.pos_at(pos)))?;
            self.scopes.adopt(self.cur_frame, seg);
            if let Some(vals) = init_vals {
                let cells = self.heap.cells_mut(seg)?;
                cells[..vals.len()].copy_from_slice(&vals);
            }
            Ok(Var::Pointer(crate::value::PointerRef {
                base: Base::Seg(seg),
                off: 0,
                len: u32::try_from(total).expect("array size"),
            }))
        } else {
            let mut bytes = vec![0u8; total];
            if let Some(vals) = init_vals {
                for (i, v) in vals.iter().enumerate() {
                    bytes[i] = v.to_int() as u8;
                }
                // the last initializer byte fills the remainder
                if len > 0 {
                    let fill = bytes[len - 1];
                    bytes[len..].fill(fill);
                }
            }
            self.alloc_bytes_arena(bytes, pos)
        }
    }

    // -- switch -------------------------------------------------------------

    fn exec_switch(
        &mut self,
        subject: &crate::ast::ExprLoc,
        cases: &[SwitchCase],
        default: Option<&[StmtLoc]>,
        _pos: u32,
    ) -> RunResult<Flow> {
        let value = self.eval(subject)?.to_int();
        for case in cases {
            if (case.lo..=case.hi).contains(&value) {
                return self.exec_stmts(&case.body);
            }
        }
        match default {
            Some(body) => self.exec_stmts(body),
            None => Ok(Flow::Normal),
        }
    }

    // -- try / catch / finally ----------------------------------------------

    fn exec_try(
        &mut self,
        body: &StmtLoc,
        catch: Option<&CatchClause>,
        finally: Option<&StmtLoc>,
        pos: u32,
    ) -> RunResult<Flow> {
        let result = self.exec_stmt(body);
        let after_catch = match result {
            Ok(flow) => Ok(flow),
            // loop-control unwinds from a yielder are never catchable, but
            // the finally clause still runs on this exit path
            Err(RunError::Unwind(u)) => {
                if let Some(finally) = finally {
                    self.exec_stmt(finally)?;
                }
                return Err(RunError::Unwind(u));
            }
            Err(RunError::Exc(data)) => match catch {
                Some(clause) => self.exec_catch(clause, &data, pos),
                None => Err(RunError::Exc(data)),
            },
        };
        let Some(finally) = finally else {
            return after_catch;
        };
        let finally_flow = self.exec_stmt(finally)?;
        match (finally_flow, after_catch) {
            // an exit from the finally body wins over everything
            (Flow::Normal, other) => other,
            (flow, _) => Ok(flow),
        }
    }

    fn exec_catch(
        &mut self,
        clause: &CatchClause,
        exc: &crate::error::ExcData,
        pos: u32,
    ) -> RunResult<Flow> {
        let frame = self
            .scopes
            .enter(Some(self.cur_frame), usize::from(clause.frame_slots), &mut self.heap)
            .map_err(|e| e.with_pos(self.pos_at(pos)))?;
        let saved = self.cur_frame;
        self.cur_frame = frame;

        // bound in order: message, backtrace, file, line, column
        let mut bound: Vec<Var> = Vec::with_capacity(5);
        let result = (|| -> RunResult<Flow> {
            let message = exc.message.clone();
            bound.push(self.c_string_var(message, pos)?);
            if clause.params.len() > 1 {
                let trace = render_trace(exc);
                bound.push(self.c_string_var(trace, pos)?);
            }
            if clause.params.len() > 2 {
                let file = exc.pos.as_ref().map(|p| p.file.clone()).unwrap_or_default();
                bound.push(self.c_string_var(file, pos)?);
            }
            if clause.params.len() > 3 {
                bound.push(Var::Int(exc.pos.as_ref().map_or(0, |p| i64::from(p.line))));
            }
            if clause.params.len() > 4 {
                bound.push(Var::Int(exc.pos.as_ref().map_or(0, |p| i64::from(p.column))));
            }
            let cells = self.scopes.cells_of(frame);
            for (param, value) in clause.params.iter().zip(&bound) {
                self.heap.cells_mut(cells)?[usize::from(param.sym.slot)] = *value;
            }
            self.exec_stmt(&clause.body)
        })();

        self.cur_frame = saved;
        self.scopes.leave(frame, &mut self.heap);
        result
    }

    fn c_string_var(&mut self, s: String, pos: u32) -> RunResult<Var> {
        let mut bytes = s.into_bytes();
        bytes.push(0);
        self.alloc_bytes_arena(bytes, pos)
    }

    // -- import -------------------------------------------------------------

    fn exec_import(
        &mut self,
        names: &[(crate::intern::StringId, Ident)],
        from: Option<&crate::ast::ExprLoc>,
        pos: u32,
    ) -> RunResult<()> {
        let path = match from {
            Some(expr) => {
                let v = self.eval(expr)?;
                Some(self.to_display(&v))
            }
            None => None,
        };
        match path {
            Some(p) if p.ends_with(".ptrs") => self.import_script(&p, names, pos),
            other => self.import_native(other.as_deref(), names, pos),
        }
    }

    /// Resolves a path relative to the importing file and canonicalizes it.
    pub(crate) fn resolve_rel_path(&self, path: &str, pos: u32) -> RunResult<std::path::PathBuf> {
        let joined = if std::path::Path::new(path).is_absolute() {
            std::path::PathBuf::from(path)
        } else {
            let module = self.program.module(self.cur_module);
            let dir = std::path::Path::new(&module.file)
                .parent()
                .map_or_else(std::path::PathBuf::new, std::path::Path::to_path_buf);
            dir.join(path)
        };
        joined.canonicalize().map_err(|e| {
            self.raise(
                pos,
                ErrorKind::ImportError,
                format!("could not resolve path '{path}': {e}"),
            )
        })
    }

    fn import_script(
        &mut self,
        path: &str,
        names: &[(crate::intern::StringId, Ident)],
        pos: u32,
    ) -> RunResult<()> {
        let resolved = self.resolve_rel_path(path, pos)?;
        let mid = if let Some(&mid) = self.script_cache.get(&resolved) {
            mid
        } else {
            let source = std::fs::read_to_string(&resolved).map_err(|e| {
                self.raise(
                    pos,
                    ErrorKind::ImportError,
                    format!("could not read '{}': {e}", resolved.display()),
                )
            })?;
            let file = resolved.to_string_lossy().into_owned();
            let mid = self.load_module(source, file).map_err(|exc| {
                self.raise(pos, ErrorKind::ImportError, exc.message().to_owned())
            })?;
            self.run_module_inner(mid)?;
            self.script_cache.insert(resolved.clone(), mid);
            mid
        };

        let module = self.program.module(mid);
        let frame = self.module_frames[&mid.0];
        let src_cells = self.scopes.cells_of(frame);
        for (name, binding) in names {
            let Some(&slot) = module.symbols.get(name) else {
                return Err(self.raise(
                    pos,
                    ErrorKind::ImportError,
                    format!(
                        "script '{}' has no property '{}'",
                        resolved.display(),
                        self.program.interns.get(*name)
                    ),
                ));
            };
            let value = self.heap.cells(src_cells)?[usize::from(slot)];
            self.store_local(binding, value, pos)?;
        }
        Ok(())
    }

    // -- delete -------------------------------------------------------------

    fn exec_delete(&mut self, expr: &crate::ast::ExprLoc, pos: u32) -> RunResult<()> {
        let value = self.eval(expr)?;
        match value {
            Var::Struct(s) => {
                let Some(data) = s.data else {
                    return Err(self.raise(
                        pos,
                        ErrorKind::TypeError,
                        "cannot delete a struct type",
                    ));
                };
                if let Some(func) =
                    self.structs[s.ty.index()].find_overload(OverloadOp::Delete, true)
                {
                    self.call_overload(func, s, crate::call::Args::new(), pos)?;
                }
                self.heap.release(data);
                Ok(())
            }
            Var::Pointer(p) => match p.base {
                Base::Seg(seg) => {
                    self.heap.release(seg);
                    Ok(())
                }
                Base::Raw(_) => Err(self.raise(
                    pos,
                    ErrorKind::TypeError,
                    "cannot delete foreign memory",
                )),
            },
            Var::Native(n) => {
                if n.read_only {
                    return Err(self.raise(
                        pos,
                        ErrorKind::TypeError,
                        "cannot delete a read-only native pointer",
                    ));
                }
                match n.base {
                    Base::Seg(seg) => {
                        self.heap.release(seg);
                        Ok(())
                    }
                    Base::Raw(_) => Err(self.raise(
                        pos,
                        ErrorKind::TypeError,
                        "cannot delete foreign memory",
                    )),
                }
            }
            other => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!("cannot delete a value of type {}", other.type_of()),
            )),
        }
    }

    // -- for-in -------------------------------------------------------------

    fn exec_forin(
        &mut self,
        vars: &[Ident],
        subject: &crate::ast::ExprLoc,
        body: &StmtLoc,
        frame_slots: u16,
        pos: u32,
    ) -> RunResult<Flow> {
        let value = self.eval(subject)?;

        if let Var::Struct(s) = value
            && let Some(func) =
                self.structs[s.ty.index()].find_overload(OverloadOp::ForIn, s.data.is_some())
        {
            self.yields.push(YieldCtx {
                body: Rc::new(body.clone()),
                vars: vars.to_vec(),
                frame_slots,
                outer: self.cur_frame,
                module: self.cur_module,
            });
            let yid = u32::try_from(self.yields.len() - 1).expect("yield depth");
            let yielder = Var::Func(FuncRef {
                kind: FuncKind::Yielder(yid),
                this: None,
            });
            let result = self.call_overload(func, s, vec![yielder], pos);
            self.yields.pop();
            return match result {
                Ok(_) => Ok(Flow::Normal),
                Err(RunError::Unwind(LoopUnwind::Break)) => Ok(Flow::Normal),
                Err(RunError::Unwind(LoopUnwind::Return(v))) => Ok(Flow::Return(v)),
                Err(e) => Err(e),
            };
        }

        let frame = self
            .scopes
            .enter(Some(self.cur_frame), usize::from(frame_slots), &mut self.heap)
            .map_err(|e| e.with_pos(self.pos_at(pos)))?;
        let saved = self.cur_frame;
        self.cur_frame = frame;
        let result = self.forin_iterate(vars, value, body, frame, pos);
        self.cur_frame = saved;
        self.scopes.leave(frame, &mut self.heap);
        result
    }

    fn forin_iterate(
        &mut self,
        vars: &[Ident],
        value: Var,
        body: &StmtLoc,
        frame: crate::scope::FrameId,
        pos: u32,
    ) -> RunResult<Flow> {
        let cells = self.scopes.cells_of(frame);
        let bind = |interp: &mut Self, idx: usize, v: Var| -> RunResult<()> {
            if let Some(var) = vars.get(idx) {
                interp.heap.cells_mut(cells)?[usize::from(var.sym.slot)] = v;
            }
            Ok(())
        };

        match value {
            Var::Native(n) => {
                let len = self.native_iter_len(&n, pos)?;
                for i in 0..len {
                    bind(self, 0, Var::Int(i))?;
                    if vars.len() > 1 {
                        let byte = self.deref_native_at(&n, i, pos)?;
                        bind(self, 1, Var::Int(byte))?;
                    }
                    match self.exec_stmt(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            Var::Pointer(p) => {
                for i in 0..i64::from(p.len) {
                    bind(self, 0, Var::Int(i))?;
                    if vars.len() > 1 {
                        let elem = self.eval_index_value(&p, i, pos)?;
                        bind(self, 1, elem)?;
                    }
                    match self.exec_stmt(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            Var::Struct(s) => {
                let order = self.structs[s.ty.index()].order.clone();
                for table_idx in order {
                    let member = self.structs[s.ty.index()].table[usize::from(table_idx)]
                        .clone()
                        .expect("ordered member");
                    // silently skip what this file may not touch, and
                    // instance members when iterating the bare type
                    if member.private && self.structs[s.ty.index()].module != self.cur_module {
                        continue;
                    }
                    if !member.is_static && s.data.is_none() {
                        continue;
                    }
                    // a write-only property has no value to yield; skip it
                    // rather than fault the whole iteration
                    if vars.len() > 1 && member.kind.tag() == MemberTag::Setter {
                        continue;
                    }
                    let mut name = member.name.as_bytes().to_vec();
                    name.push(0);
                    let name_var = self.alloc_bytes_arena(name, pos)?;
                    bind(self, 0, name_var)?;
                    if vars.len() > 1 {
                        let member_value = self.member_get(s, &member, pos)?;
                        bind(self, 1, member_value)?;
                    }
                    match self.exec_stmt(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            other => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!("cannot iterate over a variable of type {}", other.type_of()),
            )),
        }
    }

    /// The iteration length of a native view; a size of 0 means "up to the
    /// terminating NUL".
    fn native_iter_len(&self, n: &crate::value::NativeRef, pos: u32) -> RunResult<i64> {
        if n.len != 0 {
            return Ok(i64::from(n.len));
        }
        let bytes = self.read_c_string(n, pos)?;
        Ok(i64::try_from(bytes.len()).expect("string length"))
    }

    fn deref_native_at(&self, n: &crate::value::NativeRef, i: i64, pos: u32) -> RunResult<i64> {
        match n.base {
            Base::Seg(seg) => {
                let bytes = self.heap.bytes(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?;
                let idx = usize::try_from(n.off as i64 + i).ok().filter(|&x| x < bytes.len());
                match idx {
                    Some(idx) => Ok(i64::from(bytes[idx])),
                    None => Err(self.raise(pos, ErrorKind::OutOfRange, "iteration out of range")),
                }
            }
            // SAFETY: foreign memory; iteration length was derived from the
            // view's recorded size or its NUL terminator
            Base::Raw(addr) => Ok(i64::from(unsafe {
                *(addr.wrapping_add_signed(n.off).wrapping_add_signed(i as isize) as *const u8)
            })),
        }
    }

    fn eval_index_value(
        &mut self,
        p: &crate::value::PointerRef,
        i: i64,
        pos: u32,
    ) -> RunResult<Var> {
        self.eval_index_ptr(*p, i, pos)
    }

    fn eval_index_ptr(&mut self, p: crate::value::PointerRef, i: i64, pos: u32) -> RunResult<Var> {
        match p.base {
            Base::Seg(seg) if !self.heap.is_bytes(seg) => {
                let cells = self.heap.cells(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?;
                let idx = usize::try_from(p.off as i64 + i).ok().filter(|&x| x < cells.len());
                match idx {
                    Some(idx) => Ok(cells[idx]),
                    None => Err(self.raise(pos, ErrorKind::OutOfRange, "iteration out of range")),
                }
            }
            Base::Seg(seg) => {
                let bytes = self.heap.bytes(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?;
                let idx = usize::try_from(p.off as i64 + i).ok().filter(|&x| x < bytes.len());
                match idx {
                    Some(idx) => Ok(Var::Int(i64::from(bytes[idx]))),
                    None => Err(self.raise(pos, ErrorKind::OutOfRange, "iteration out of range")),
                }
            }
            // SAFETY: a raw var pointer cannot be materialized safely; the
            // byte view is the defined reading
            Base::Raw(addr) => Ok(Var::Int(i64::from(unsafe {
                *(addr.wrapping_add_signed(p.off).wrapping_add_signed(i as isize) as *const u8)
            }))),
        }
    }
}

/// Renders an error's caller chain the way the uncaught report does.
fn render_trace(exc: &crate::error::ExcData) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for frame in &exc.trace {
        let _ = writeln!(
            out,
            "    at {} ({}:{}:{})",
            frame.callee, frame.file, frame.line, frame.column
        );
    }
    out
}
