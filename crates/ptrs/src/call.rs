//! The call engine: activation records, argument binding, returns.
//!
//! A script call creates a frame linked to the function's captured lexical
//! parent, binds parameters left to right (missing ones evaluate their
//! default expression lazily, in the callee's scope), binds `this` for
//! method-bound functions and `arguments` as a pointer over the argument
//! vector, then runs the body. The frame and its arena go away on return
//! unless a closure promoted them.

use smallvec::SmallVec;

use crate::{
    ast::{FuncId, OverloadOp},
    error::{ErrorKind, LoopUnwind, RunError, RunResult},
    run::{Flow, Interp},
    scope::MAX_CALL_DEPTH,
    value::{Base, FuncKind, PointerRef, StructRef, Var},
};

/// Evaluated call arguments; most calls fit inline.
pub(crate) type Args = SmallVec<[Var; 4]>;

impl Interp {
    /// Calls any callable value: script functions, native symbols, structs
    /// with a `()` overload.
    pub(crate) fn call_var(&mut self, callee: Var, args: Args, pos: u32) -> RunResult<Var> {
        self.call_var_with_this(callee, None, args, pos)
    }

    pub(crate) fn call_var_with_this(
        &mut self,
        callee: Var,
        bind_this: Option<StructRef>,
        args: Args,
        pos: u32,
    ) -> RunResult<Var> {
        match callee {
            Var::Func(f) => {
                let this = f.this.or(bind_this);
                match f.kind {
                    FuncKind::Script { def, frame } => {
                        self.call_script(def, frame, this, args, pos)
                    }
                    FuncKind::Yielder(id) => self.call_yielder(id, args, pos),
                }
            }
            Var::Native(n) => {
                let addr = match n.base {
                    Base::Raw(addr) => addr.wrapping_add_signed(n.off),
                    Base::Seg(_) => {
                        return Err(self.raise(
                            pos,
                            ErrorKind::TypeError,
                            "cannot call a script-owned byte array",
                        ));
                    }
                };
                self.call_native(addr, &args, pos)
            }
            Var::Struct(s) => {
                if let Some(func) =
                    self.structs[s.ty.index()].find_overload(OverloadOp::Call, s.data.is_some())
                {
                    self.call_overload(func, s, args, pos)
                } else {
                    Err(self.raise(
                        pos,
                        ErrorKind::TypeError,
                        format!("struct {} is not callable", self.structs[s.ty.index()].name),
                    ))
                }
            }
            other => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!("cannot call a value of type {}", other.type_of()),
            )),
        }
    }

    /// Invokes an operator overload with the struct bound as `this`. The
    /// overload body's lexical parent is the struct's declaring frame.
    pub(crate) fn call_overload(
        &mut self,
        func: FuncId,
        receiver: StructRef,
        args: impl Into<Args>,
        pos: u32,
    ) -> RunResult<Var> {
        let frame = self.structs[receiver.ty.index()].parent_frame;
        self.call_script(func, frame, Some(receiver), args.into(), pos)
    }

    pub(crate) fn call_script(
        &mut self,
        def_id: FuncId,
        captured: crate::scope::FrameId,
        this: Option<StructRef>,
        args: Args,
        pos: u32,
    ) -> RunResult<Var> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(self.raise(
                pos,
                ErrorKind::StackOverflow,
                "maximum call depth exceeded",
            ));
        }
        let def = self.program.func(def_id);

        let frame = self
            .scopes
            .enter(Some(captured), usize::from(def.frame_slots), &mut self.heap)
            .map_err(|e| e.with_pos(self.pos_at(pos)))?;
        self.scopes
            .set_caller(frame, self.cur_frame, def.name.clone(), pos);

        // the argument vector gets its own cell segment so `arguments`
        // stays addressable for the whole activation
        let arg_seg = match self.heap.alloc_cells(args.len(), true) {
            Ok(seg) => seg,
            Err(e) => {
                self.scopes.leave(frame, &mut self.heap);
                return Err(e.with_pos(self.pos_at(pos)));
            }
        };
        self.scopes.adopt(frame, arg_seg);
        if let Ok(cells) = self.heap.cells_mut(arg_seg) {
            cells.copy_from_slice(&args);
        }

        let saved_frame = self.cur_frame;
        let saved_module = self.cur_module;
        self.cur_frame = frame;
        self.cur_module = def.module;
        self.call_depth += 1;

        let result = self.run_activation(&def, frame, arg_seg, &args, this);

        self.call_depth -= 1;
        self.cur_frame = saved_frame;
        self.cur_module = saved_module;
        self.scopes.leave(frame, &mut self.heap);

        match result {
            Ok(Flow::Return(v)) => Ok(v),
            Ok(_) => Ok(Var::Undefined),
            Err(mut e) => {
                e.push_frame(self.trace_frame(&def.name, pos));
                Err(e)
            }
        }
    }

    fn run_activation(
        &mut self,
        def: &crate::ast::FuncDef,
        frame: crate::scope::FrameId,
        arg_seg: crate::heap::SegId,
        args: &[Var],
        this: Option<StructRef>,
    ) -> RunResult<Flow> {
        let cells = self.scopes.cells_of(frame);
        for (i, param) in def.params.iter().enumerate() {
            let value = if i < args.len() {
                args[i]
            } else if let Some(default) = &param.default {
                self.eval(default)?
            } else {
                Var::Undefined
            };
            self.heap.cells_mut(cells)?[usize::from(param.slot)] = value;
        }
        if let Some(this) = this {
            self.heap.cells_mut(cells)?[usize::from(def.this_slot)] = Var::Struct(this);
        }
        self.heap.cells_mut(cells)?[usize::from(def.args_slot)] = Var::Pointer(PointerRef {
            base: Base::Seg(arg_seg),
            off: 0,
            len: u32::try_from(args.len()).expect("argument count"),
        });
        self.exec_stmts(&def.body)
    }

    /// A yielder call: re-enter the for-in loop body with the yielded
    /// values bound. Returns the loop's control token as an Int; `break`
    /// and `return` unwind through the overload instead.
    fn call_yielder(&mut self, id: u32, args: Args, pos: u32) -> RunResult<Var> {
        let Some(ctx) = self.yields.get(id as usize) else {
            return Err(self.raise(
                pos,
                ErrorKind::TypeError,
                "yield target is no longer iterating",
            ));
        };
        let body = std::rc::Rc::clone(&ctx.body);
        let vars: Vec<crate::ast::Ident> = ctx.vars.clone();
        let frame_slots = ctx.frame_slots;
        let outer = ctx.outer;
        let module = ctx.module;

        let frame = self
            .scopes
            .enter(Some(outer), usize::from(frame_slots), &mut self.heap)
            .map_err(|e| e.with_pos(self.pos_at(pos)))?;
        self.scopes
            .set_caller(frame, self.cur_frame, "(for in loop)".to_owned(), pos);

        let saved_frame = self.cur_frame;
        let saved_module = self.cur_module;
        self.cur_frame = frame;
        self.cur_module = module;

        let cells = self.scopes.cells_of(frame);
        let mut result = Ok(Flow::Normal);
        for (i, var) in vars.iter().enumerate() {
            let value = args.get(i).copied().unwrap_or(Var::Undefined);
            match self.heap.cells_mut(cells) {
                Ok(slots) => slots[usize::from(var.sym.slot)] = value,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_ok() {
            result = self.exec_stmt(&body);
        }

        self.cur_frame = saved_frame;
        self.cur_module = saved_module;
        self.scopes.leave(frame, &mut self.heap);

        match result? {
            Flow::Normal | Flow::Continue => Ok(Var::Int(0)),
            Flow::Break => Err(RunError::Unwind(LoopUnwind::Break)),
            Flow::Return(v) => Err(RunError::Unwind(LoopUnwind::Return(v))),
        }
    }
}
