//! The FFI bridge: calls into C ABI code and callbacks out of it.
//!
//! Outbound calls build a libffi CIF per call site: Int maps to a signed
//! 64-bit slot, Float to a double, array views and struct instances to
//! pointers, and function values to their cached callback trampoline. The
//! return slot is a 64-bit integer.
//!
//! Inbound calls go through a libffi closure over a leaked callback record.
//! The interpreter is reachable from the C frame via a thread-local context
//! pointer installed around every outbound call; incoming arguments carry
//! no C type metadata and are reified as Int.

use std::{cell::Cell, ffi::c_void};

use libffi::middle::{Arg, Cif, Closure, CodePtr, Type};

use crate::{
    ast::{FuncId, Ident},
    call::Args,
    error::{ErrorKind, RunResult},
    intern::StringId,
    run::Interp,
    scope::FrameId,
    value::{Base, FuncKind, FuncRef, NativeRef, Var},
};

thread_local! {
    /// The interpreter a native callback re-enters; set for the duration of
    /// every outbound native call.
    static ACTIVE_INTERP: Cell<*mut Interp> = const { Cell::new(std::ptr::null_mut()) };
}

/// What a trampoline needs to re-enter the engine.
pub(crate) struct CallbackInfo {
    def: FuncId,
    frame: FrameId,
    argc: usize,
}

/// A heap-allocated C-callable thunk for one script function.
///
/// The closure keeps the generated code alive; the info record is leaked at
/// construction and reclaimed here so the C side can hold the code pointer
/// for as long as the function value exists.
pub(crate) struct Trampoline {
    #[expect(dead_code, reason = "owns the generated thunk the code pointer points into")]
    closure: Closure<'static>,
    code: usize,
    info: *mut CallbackInfo,
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trampoline({:#x})", self.code)
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        // SAFETY: `info` was leaked by `trampoline_for` and is owned by
        // exactly this trampoline; no call can be in flight during drop.
        drop(unsafe { Box::from_raw(self.info) });
    }
}

/// The C entry point of every trampoline: reify the arguments, call the
/// script function, write the result back as a 64-bit integer.
unsafe extern "C" fn callback_entry(
    _cif: &libffi::low::ffi_cif,
    result: &mut i64,
    args: *const *const c_void,
    info: &CallbackInfo,
) {
    let interp = ACTIVE_INTERP.with(Cell::get);
    if interp.is_null() {
        *result = 0;
        return;
    }
    // SAFETY: the pointer was installed by the interpreter right before the
    // outbound call this callback is re-entering from.
    let interp = unsafe { &mut *interp };

    let mut argv = Args::with_capacity(info.argc);
    for i in 0..info.argc {
        // SAFETY: libffi provides one argument slot per CIF parameter, and
        // the CIF declared `argc` 64-bit slots.
        let value = unsafe { *(*args.add(i)).cast::<i64>() };
        argv.push(Var::Int(value));
    }

    match interp.call_script(info.def, info.frame, None, argv, 0) {
        Ok(value) => *result = value.to_int(),
        Err(e) => {
            // surface the fault once the native call returns
            if interp.callback_fault.is_none() {
                interp.callback_fault = Some(e);
            }
            *result = 0;
        }
    }
}

/// One marshalled argument; owns the slot the `Arg` points at.
enum CVal {
    I64(i64),
    F64(f64),
    Ptr(*mut c_void),
}

impl Interp {
    pub(crate) fn call_native(&mut self, addr: usize, args: &[Var], pos: u32) -> RunResult<Var> {
        if addr == 0 {
            return Err(self.raise(
                pos,
                ErrorKind::NativeCallFailure,
                "cannot call a null native pointer",
            ));
        }

        let mut types = Vec::with_capacity(args.len());
        let mut cvals = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Var::Float(f) => {
                    types.push(Type::f64());
                    cvals.push(CVal::F64(*f));
                }
                Var::Int(n) => {
                    types.push(Type::i64());
                    cvals.push(CVal::I64(*n));
                }
                Var::Undefined => {
                    types.push(Type::i64());
                    cvals.push(CVal::I64(0));
                }
                Var::Func(f) => {
                    let code = self.trampoline_for(*f, pos)?;
                    types.push(Type::pointer());
                    cvals.push(CVal::Ptr(code as *mut c_void));
                }
                Var::Native(n) => {
                    types.push(Type::pointer());
                    cvals.push(CVal::Ptr(self.native_arg_ptr(n, pos)?));
                }
                Var::Pointer(p) => {
                    types.push(Type::pointer());
                    let ptr = match p.base {
                        Base::Seg(seg) if self.heap.is_bytes(seg) => self
                            .heap
                            .byte_ptr(seg, p.off)
                            .map_err(|e| e.with_pos(self.pos_at(pos)))?
                            .cast::<c_void>(),
                        Base::Seg(seg) => {
                            let base = self
                                .heap
                                .cell_ptr(seg)
                                .map_err(|e| e.with_pos(self.pos_at(pos)))?;
                            // SAFETY: the offset stays within the segment
                            // the view was created over.
                            unsafe { base.offset(p.off) }.cast::<c_void>()
                        }
                        Base::Raw(a) => a.wrapping_add_signed(p.off) as *mut c_void,
                    };
                    cvals.push(CVal::Ptr(ptr));
                }
                Var::Struct(s) => {
                    types.push(Type::pointer());
                    let data = match s.data {
                        Some(seg) => seg,
                        None => self.structs[s.ty.index()].static_data,
                    };
                    let ptr = self
                        .heap
                        .cell_ptr(data)
                        .map_err(|e| e.with_pos(self.pos_at(pos)))?;
                    cvals.push(CVal::Ptr(ptr.cast::<c_void>()));
                }
            }
        }

        let cif = Cif::new(types, Type::i64());
        let call_args: Vec<Arg> = cvals
            .iter()
            .map(|v| match v {
                CVal::I64(x) => Arg::new(x),
                CVal::F64(x) => Arg::new(x),
                CVal::Ptr(x) => Arg::new(x),
            })
            .collect();

        self.callback_fault = None;
        let prev = ACTIVE_INTERP.with(|c| c.replace(std::ptr::from_mut(self)));
        // SAFETY: the CIF matches the slots just marshalled; the callee is
        // whatever symbol the script resolved, called on its own assertion.
        let ret: i64 = unsafe { cif.call(CodePtr::from_ptr(addr as *const c_void), &call_args) };
        ACTIVE_INTERP.with(|c| c.set(prev));

        if let Some(fault) = self.callback_fault.take() {
            return Err(fault);
        }
        Ok(Var::Int(ret))
    }

    /// The cached callback thunk for a function value, allocated on first
    /// marshal and reused across calls.
    fn trampoline_for(&mut self, f: FuncRef, pos: u32) -> RunResult<usize> {
        let FuncKind::Script { def, frame } = f.kind else {
            return Err(self.raise(
                pos,
                ErrorKind::NativeCallFailure,
                "cannot pass a yield continuation to native code",
            ));
        };
        let key = (def.index_u32(), frame.index_u32());
        if let Some(t) = self.trampolines.get(&key) {
            return Ok(t.code);
        }

        let argc = self.program.func(def).params.len();
        let cif = Cif::new(std::iter::repeat_with(Type::i64).take(argc), Type::i64());
        let info: &'static CallbackInfo = Box::leak(Box::new(CallbackInfo { def, frame, argc }));
        let closure = Closure::new(cif, callback_entry, info);
        let code = *closure.code_ptr() as usize;
        // the captured frame must survive arbitrarily long native retention
        self.scopes.promote(frame);
        self.trampolines.insert(
            key,
            Trampoline {
                closure,
                code,
                info: std::ptr::from_ref(info).cast_mut(),
            },
        );
        Ok(code)
    }

    fn native_arg_ptr(&mut self, n: &NativeRef, pos: u32) -> RunResult<*mut c_void> {
        match n.base {
            Base::Seg(seg) => Ok(self
                .heap
                .byte_ptr(seg, n.off)
                .map_err(|e| e.with_pos(self.pos_at(pos)))?
                .cast::<c_void>()),
            Base::Raw(addr) => Ok(addr.wrapping_add_signed(n.off) as *mut c_void),
        }
    }

    /// `import sym, other from "lib.so";` - resolves dynamic symbols as
    /// read-only native values. With no `from`, the process image itself is
    /// searched.
    pub(crate) fn import_native(
        &mut self,
        path: Option<&str>,
        names: &[(StringId, Ident)],
        pos: u32,
    ) -> RunResult<()> {
        let library = match path {
            Some(p) => {
                let actual = if p.starts_with('.') || p.starts_with('/') {
                    self.resolve_rel_path(p, pos)?
                } else {
                    std::path::PathBuf::from(p)
                };
                // SAFETY: loading a shared library runs its initializers;
                // that is the entire point of a native import.
                unsafe { libloading::Library::new(&actual) }.map_err(|e| {
                    self.raise(pos, ErrorKind::ImportError, e.to_string())
                })?
            }
            None => self_library(self, pos)?,
        };

        let mut addrs = Vec::with_capacity(names.len());
        for (name, _) in names {
            let sym_name = self.program.interns.get(*name);
            // SAFETY: the symbol is used as an opaque address; any calls
            // through it marshal by the script's own declaration.
            let sym = unsafe { library.get::<unsafe extern "C" fn()>(sym_name.as_bytes()) }
                .map_err(|e| self.raise(pos, ErrorKind::ImportError, e.to_string()))?;
            addrs.push(*sym as usize);
        }
        self.libraries.push(library);

        for ((_, binding), addr) in names.iter().zip(addrs) {
            let value = Var::Native(NativeRef {
                base: Base::Raw(addr),
                off: 0,
                len: 0,
                read_only: true,
            });
            self.store_local(binding, value, pos)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn self_library(interp: &Interp, pos: u32) -> RunResult<libloading::Library> {
    let _ = (interp, pos);
    Ok(libloading::os::unix::Library::this().into())
}

#[cfg(not(unix))]
fn self_library(interp: &Interp, pos: u32) -> RunResult<libloading::Library> {
    Err(interp.raise(
        pos,
        ErrorKind::ImportError,
        "importing from the process image requires a unix host",
    ))
}
