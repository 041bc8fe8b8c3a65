//! The engine: interpreter context, module loading, and the public API.
//!
//! [`Engine`] is the embedder-facing entry point: feed it source text (or a
//! file path), get the final expression value or an [`Exception`]. The
//! internal [`Interp`] context threads everything the evaluation engines
//! need: the program tables, the heap, the scope store, registered struct
//! types, the import caches, and the FFI state.

use std::{
    path::{Path, PathBuf},
    rc::Rc,
    sync::atomic::{AtomicI32, Ordering},
};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    ast::{Module, ModuleId, StmtLoc},
    error::{locate, ErrorKind, Exception, RaisePos, RunError, RunResult, TraceFrame},
    ffi::Trampoline,
    heap::{Heap, DEFAULT_STACK_SIZE},
    parse::parse_module,
    prepare::prepare_module,
    scope::{FrameId, Scopes},
    structs::StructType,
    value::{format_float, Base, FuncKind, Var},
};

/// Signal number delivered asynchronously; polled at statement boundaries.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Records an asynchronous signal for the running engine to pick up.
///
/// Async-signal-safe; intended to be called from a POSIX signal handler.
/// Inside a `try` the signal surfaces as a catchable `Signal` error,
/// otherwise it terminates evaluation with exit code 3 semantics.
pub fn raise_signal(signo: i32) {
    PENDING_SIGNAL.store(signo, Ordering::Relaxed);
}

/// Statement-level control flow token.
///
/// `Break`/`Continue` are absorbed by the innermost loop, `Return` crosses
/// loops and is absorbed by the function call boundary.
#[derive(Debug)]
pub(crate) enum Flow {
    Normal,
    Continue,
    Break,
    Return(Var),
}

/// An active for-in loop driven by a struct's for-in overload.
///
/// The engine synthesizes a yielder callback from the loop body; each
/// yielder call re-enters the body with the yielded values bound.
#[derive(Debug)]
pub(crate) struct YieldCtx {
    pub body: Rc<StmtLoc>,
    pub vars: Vec<crate::ast::Ident>,
    pub frame_slots: u16,
    /// The frame the loop statement runs in; the body frame's lexical outer.
    pub outer: FrameId,
    pub module: ModuleId,
}

pub(crate) struct Interp {
    pub program: crate::ast::Program,
    pub heap: Heap,
    pub scopes: Scopes,
    pub structs: Vec<StructType>,
    pub cur_frame: FrameId,
    pub cur_module: ModuleId,
    pub call_depth: usize,
    /// Bounds and liveness assertions on indexing/slicing.
    pub safety: bool,
    /// Loaded shared libraries, kept open for the engine's lifetime.
    pub libraries: Vec<libloading::Library>,
    /// Script import cache: canonical path -> evaluated module.
    pub script_cache: IndexMap<PathBuf, ModuleId>,
    /// Frame each module's top level ran in, for symbol imports.
    pub module_frames: AHashMap<u32, FrameId>,
    /// Cached native-callback thunks, keyed by (function, captured frame).
    pub trampolines: AHashMap<(u32, u32), Trampoline>,
    /// Active yielder-driven loops, innermost last.
    pub yields: Vec<YieldCtx>,
    /// One read-only segment per string literal, keyed by literal identity.
    pub literal_segs: AHashMap<usize, crate::heap::SegId>,
    /// First fault raised inside a native callback; re-raised when the
    /// outbound native call returns.
    pub callback_fault: Option<RunError>,
    pub last_value: Var,
}

impl Interp {
    /// Builds a raise-position record for a byte offset in the current
    /// module; the one place AST offsets become line/column pairs.
    pub fn pos_at(&self, offset: u32) -> RaisePos {
        let module = self.program.module(self.cur_module);
        let (line, column, source_line) = locate(&module.source, offset);
        RaisePos {
            file: module.file.clone(),
            line,
            column,
            source_line,
        }
    }

    pub fn raise(&self, offset: u32, kind: ErrorKind, msg: impl Into<String>) -> RunError {
        RunError::new(kind, msg).with_pos(self.pos_at(offset))
    }

    /// Builds the trace entry for a call site in the current module.
    pub fn trace_frame(&self, callee: &str, offset: u32) -> TraceFrame {
        let module = self.program.module(self.cur_module);
        let (line, column, _) = locate(&module.source, offset);
        TraceFrame {
            callee: callee.to_owned(),
            file: module.file.clone(),
            line,
            column,
        }
    }

    /// Converts a pending signal into a catchable error, if one arrived.
    pub fn check_signal(&self, offset: u32) -> RunResult<()> {
        let signo = PENDING_SIGNAL.swap(0, Ordering::Relaxed);
        if signo == 0 {
            Ok(())
        } else {
            Err(self.raise(
                offset,
                ErrorKind::Signal,
                format!("received signal {signo}"),
            ))
        }
    }

    /// Renders a value the way `cast<native>` and string insertion do.
    pub fn to_display(&self, v: &Var) -> String {
        match v {
            Var::Undefined => "undefined".to_owned(),
            Var::Int(n) => n.to_string(),
            Var::Float(f) => format_float(*f),
            Var::Native(n) => match self.native_bytes(n) {
                Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                None => format!("native:{:#x}", v.to_int()),
            },
            Var::Pointer(_) => format!("pointer:{:#x}", v.to_int()),
            Var::Func(f) => match f.kind {
                FuncKind::Script { def, .. } => {
                    format!("function:{}", self.program.func(def).name)
                }
                FuncKind::Yielder(_) => "function:(yield)".to_owned(),
            },
            Var::Struct(s) => {
                let name = &self.structs[s.ty.index()].name;
                match s.data {
                    Some(_) => format!("{name}:{:#x}", v.to_int()),
                    None => name.clone(),
                }
            }
        }
    }

    /// The bytes a native view points at, up to its size or a NUL.
    pub(crate) fn native_bytes<'a>(&'a self, n: &crate::value::NativeRef) -> Option<&'a [u8]> {
        match n.base {
            Base::Seg(seg) => {
                let bytes = self.heap.bytes(seg).ok()?;
                let start = usize::try_from(n.off).ok()?;
                if start > bytes.len() {
                    return None;
                }
                let mut end = if n.len == 0 {
                    bytes.len()
                } else {
                    (start + n.len as usize).min(bytes.len())
                };
                if let Some(nul) = bytes[start..end].iter().position(|&b| b == 0) {
                    end = start + nul;
                }
                Some(&bytes[start..end])
            }
            Base::Raw(addr) => {
                let addr = addr.checked_add_signed(n.off)?;
                if addr == 0 {
                    return None;
                }
                let cap = if n.len == 0 { 4096 } else { n.len as usize };
                // SAFETY: foreign memory handed over by native code; reads
                // are capped and stop at the first NUL, the C-string
                // contract the value arrived under.
                unsafe {
                    let ptr = addr as *const u8;
                    let mut len = 0usize;
                    while len < cap && *ptr.add(len) != 0 {
                        len += 1;
                    }
                    Some(std::slice::from_raw_parts(ptr, len))
                }
            }
        }
    }
}

/// A result value handed back to the embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Int(i64),
    Float(f64),
    /// Strings and any other reference value, rendered.
    Str(String),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{}", format_float(*v)),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// The embedder-facing interpreter.
///
/// # Example
/// ```
/// use ptrs::{Engine, Value};
///
/// let mut engine = Engine::new();
/// let result = engine.eval("var x = 40; x + 2;", "example.ptrs").unwrap();
/// assert_eq!(result, Value::Int(42));
/// ```
pub struct Engine {
    interp: Interp,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        let stack_limit = std::env::var("PTRS_STACK_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_STACK_SIZE);
        Self::with_stack_limit(stack_limit)
    }

    #[must_use]
    pub fn with_stack_limit(stack_limit: usize) -> Self {
        Self {
            interp: Interp {
                program: crate::ast::Program::default(),
                heap: Heap::new(stack_limit),
                scopes: Scopes::new(),
                structs: Vec::new(),
                cur_frame: FrameId::default(),
                cur_module: ModuleId(0),
                call_depth: 0,
                safety: true,
                libraries: Vec::new(),
                script_cache: IndexMap::new(),
                module_frames: AHashMap::new(),
                trampolines: AHashMap::new(),
                yields: Vec::new(),
                literal_segs: AHashMap::new(),
                callback_fault: None,
                last_value: Var::Undefined,
            },
        }
    }

    /// Toggles runtime bounds and liveness assertions (on by default).
    pub fn set_safety(&mut self, on: bool) {
        self.interp.safety = on;
    }

    /// Parses and runs a source string, returning the value of the last
    /// top-level statement.
    pub fn eval(&mut self, source: &str, filename: &str) -> Result<Value, Exception> {
        let mid = self.interp.load_module(source.to_owned(), filename.to_owned())?;
        let var = self.interp.run_module(mid)?;
        Ok(self.interp.export_value(&var))
    }

    /// Loads and runs a script file.
    pub fn run_file(&mut self, path: &Path) -> Result<Value, Exception> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            Exception::parse_error(format!("could not read {}: {e}", path.display()), "", "", 0)
        })?;
        self.eval(&source, &path.to_string_lossy())
    }
}

impl Interp {
    /// Parses, prepares, and registers a module without running it.
    pub fn load_module(&mut self, source: String, file: String) -> Result<ModuleId, Exception> {
        let mid = ModuleId(u32::try_from(self.program.modules.len()).expect("module overflow"));
        let base_func = u32::try_from(self.program.funcs.len()).expect("function overflow");
        let base_struct = u32::try_from(self.program.structs.len()).expect("struct overflow");
        let mut ast = parse_module(
            source,
            file,
            mid,
            base_func,
            base_struct,
            &mut self.program.interns,
        )?;
        let (frame_slots, symbols) = prepare_module(&mut ast, &mut self.program.interns)?;
        for func in ast.funcs {
            self.program.funcs.push(Rc::new(func));
        }
        for decl in ast.structs {
            self.program.structs.push(Rc::new(decl));
        }
        self.program.modules.push(Rc::new(Module {
            file: ast.file,
            source: ast.source,
            body: ast.body,
            symbols,
            frame_slots,
        }));
        Ok(mid)
    }

    /// Runs a loaded module's top level in a fresh promoted frame.
    pub fn run_module(&mut self, mid: ModuleId) -> Result<Var, Exception> {
        self.run_module_inner(mid).map_err(|e| self.into_exception(e))
    }

    pub(crate) fn run_module_inner(&mut self, mid: ModuleId) -> RunResult<Var> {
        let module = self.program.module(mid);
        let frame = self
            .scopes
            .enter(None, usize::from(module.frame_slots), &mut self.heap)?;
        // module frames live for the engine's lifetime: their symbols stay
        // importable and closures over them stay valid
        self.scopes.promote(frame);
        self.module_frames.insert(mid.0, frame);

        let saved_frame = self.cur_frame;
        let saved_module = self.cur_module;
        self.cur_frame = frame;
        self.cur_module = mid;
        self.last_value = Var::Undefined;
        let result = self.exec_stmts(&module.body);
        let last = self.last_value;
        self.scopes.leave(frame, &mut self.heap);
        self.cur_frame = saved_frame;
        self.cur_module = saved_module;

        result.map(|_| last)
    }

    pub fn into_exception(&self, e: RunError) -> Exception {
        match e {
            RunError::Exc(data) => Exception::from_data(*data),
            // a loop unwind escaping to the top level means a yielder was
            // called outside its loop; report it as an engine fault
            RunError::Unwind(_) => Exception::from_data(crate::error::ExcData {
                kind: ErrorKind::TypeError,
                message: "loop control escaped its for-in overload".to_owned(),
                pos: None,
                trace: Vec::new(),
            }),
        }
    }

    pub fn export_value(&self, v: &Var) -> Value {
        match v {
            Var::Undefined => Value::Undefined,
            Var::Int(n) => Value::Int(*n),
            Var::Float(f) => Value::Float(*f),
            other => Value::Str(self.to_display(other)),
        }
    }
}
