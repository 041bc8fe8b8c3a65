use pretty_assertions::assert_eq;
use ptrs::{Engine, ErrorKind, Value};

fn eval(src: &str) -> Value {
    let mut engine = Engine::new();
    engine
        .eval(src, "test.ptrs")
        .unwrap_or_else(|e| panic!("script failed: {e}"))
}

fn eval_err(src: &str) -> ptrs::Exception {
    let mut engine = Engine::new();
    engine
        .eval(src, "test.ptrs")
        .expect_err("script should have failed")
}

#[test]
fn byte_arrays_fill_and_index() {
    assert_eq!(eval("var b[4] = [1, 2, 3, 4]; b[2];"), Value::Int(3));
    // the last initializer byte fills the declared remainder
    assert_eq!(eval("var b[5] = [1, 2]; b[4];"), Value::Int(2));
    assert_eq!(eval("var b[3]; b[1];"), Value::Int(0));
    assert_eq!(eval("var b[3] = [1, 2, 3]; sizeof b;"), Value::Int(3));
    assert_eq!(eval("var b[2]; b[0] = 300; b[0];"), Value::Int(44));
}

#[test]
fn var_arrays_hold_whole_vars() {
    assert_eq!(eval("var v{3} = [7, 8, 9]; v[1];"), Value::Int(8));
    assert_eq!(eval("var v{3} = [7, 8, 9]; sizeof v;"), Value::Int(3));
    assert_eq!(eval("var v{2}; typeof v[0];"), Value::Int(0));
    assert_eq!(eval("var v{2}; v[0] = 1.5; v[0] + 1;"), Value::Float(2.5));
}

#[test]
fn pointer_arithmetic_cancels() {
    assert_eq!(
        eval("var v{8}; var p = &v[0]; var q = p + 3; q - p;"),
        Value::Int(3)
    );
    assert_eq!(
        eval("var v{8}; var p = &v[0]; (p + 2) + 3 - (p + 5);"),
        Value::Int(0)
    );
}

/// The S1 shape: a byte buffer retagged as a pointer still reads its
/// elements, and the recorded size tracks the remaining elements.
#[test]
fn cast_pointer_over_bytes() {
    let src = "var buf[8] = [1, 2, 3, 4, 5, 6, 7, 8];
               var p = cast<pointer>(&buf[0]);
               var q = p + 3;";
    assert_eq!(eval(&format!("{src} *q;")), Value::Int(4));
    assert_eq!(eval(&format!("{src} sizeof p - sizeof q;")), Value::Int(3));
    assert_eq!(eval(&format!("{src} q - p;")), Value::Int(3));
}

#[test]
fn address_of_and_deref_write_through() {
    assert_eq!(eval("var x = 1; var p = &x; *p = 42; x;"), Value::Int(42));
    assert_eq!(eval("var x = 7; var p = &x; *p;"), Value::Int(7));
    assert_eq!(eval("var x = 1; var p = &x; sizeof p;"), Value::Int(1));
    // &*p is p
    assert_eq!(eval("var x = 3; var p = &x; var q = &*p; *q;"), Value::Int(3));
}

#[test]
fn pointer_comparison_by_address() {
    assert_eq!(eval("var v{4}; var p = &v[0]; p == p;"), Value::Int(1));
    assert_eq!(eval("var v{4}; var p = &v[0]; p < p + 1;"), Value::Int(1));
    assert_eq!(
        eval("var a{2}; var b{2}; &a[0] == &b[0];"),
        Value::Int(0)
    );
}

#[test]
fn slicing_produces_views() {
    let src = "var buf[5] = [1, 2, 3, 4, 5];";
    assert_eq!(eval(&format!("{src} sizeof buf[1:4];")), Value::Int(3));
    assert_eq!(eval(&format!("{src} var s = buf[1:4]; s[0];")), Value::Int(2));
    assert_eq!(eval(&format!("{src} var s = buf[2:]; s[2];")), Value::Int(5));
    assert_eq!(eval(&format!("{src} var s = buf[:2]; sizeof s;")), Value::Int(2));
    // writes through a slice land in the same storage
    assert_eq!(
        eval(&format!("{src} var s = buf[1:4]; s[0] = 99; buf[1];")),
        Value::Int(99)
    );
}

#[test]
fn out_of_range_is_caught() {
    assert_eq!(eval_err("var b[3]; b[5];").kind(), ErrorKind::OutOfRange);
    assert_eq!(eval_err("var b[3]; b[-1];").kind(), ErrorKind::OutOfRange);
    assert_eq!(eval_err("var b[3]; b[1:7];").kind(), ErrorKind::OutOfRange);
    assert_eq!(eval_err("var v{2}; v[2] = 1;").kind(), ErrorKind::OutOfRange);
}

/// An arena array escaping its scope must fault on access, not read freed
/// memory.
#[test]
fn use_after_scope_exit_faults() {
    let err = eval_err(
        "function leak() {
             var a{4};
             return a;
         }
         var p = leak();
         *p;",
    );
    assert_eq!(err.kind(), ErrorKind::TypeError);

    let err = eval_err(
        "function leak() {
             var b[4];
             return b;
         }
         var n = leak();
         n[0];",
    );
    assert_eq!(err.kind(), ErrorKind::TypeError);
}

#[test]
fn promoted_frames_keep_pointers_alive() {
    // the closure promotes the frame, so the pointer stays valid
    assert_eq!(
        eval(
            "function make() {
                 var x = 5;
                 var keep = function() { return x; };
                 return &x;
             }
             var p = make();
             *p;"
        ),
        Value::Int(5)
    );
}

#[test]
fn delete_frees_managed_memory() {
    let err = eval_err("var v{4}; delete v; *v;");
    assert_eq!(err.kind(), ErrorKind::TypeError);
    let err = eval_err("delete \"literal\";");
    assert_eq!(err.kind(), ErrorKind::TypeError);
    let err = eval_err("delete 5;");
    assert_eq!(err.kind(), ErrorKind::TypeError);
}

#[test]
fn read_only_strings_reject_writes() {
    let err = eval_err("var s = \"abc\"; s[0] = 88;");
    assert_eq!(err.kind(), ErrorKind::NotAnLValue);
}

#[test]
fn assignment_needs_an_lvalue() {
    assert_eq!(eval_err("5 = 6;").kind(), ErrorKind::NotAnLValue);
    assert_eq!(eval_err("&(1 + 2);").kind(), ErrorKind::NotAnLValue);
}

#[test]
fn array_literal_is_a_byte_array() {
    assert_eq!(eval("var a = [10, 20, 30]; a[1];"), Value::Int(20));
    assert_eq!(eval("sizeof [1, 2, 3, 4];"), Value::Int(4));
}

#[test]
fn for_in_over_arrays() {
    assert_eq!(
        eval(
            "var buf[3] = [5, 6, 7];
             var total = 0;
             for(i, b in buf) { total += i + b; }
             total;"
        ),
        Value::Int(21)
    );
    assert_eq!(
        eval(
            "var v{4} = [1, 2, 3, 4];
             var total = 0;
             for(i, x in v) { total += x; }
             total;"
        ),
        Value::Int(10)
    );
    // break propagates out of the iteration normally
    assert_eq!(
        eval(
            "var v{4} = [1, 2, 3, 4];
             var total = 0;
             for(i, x in v) {
                 if (x == 3) break;
                 total += x;
             }
             total;"
        ),
        Value::Int(3)
    );
}

#[test]
fn arena_limit_raises_stack_overflow() {
    let mut engine = Engine::with_stack_limit(1024);
    let err = engine
        .eval("var b[2048];", "test.ptrs")
        .expect_err("allocation should exceed the limit");
    assert_eq!(err.kind(), ErrorKind::StackOverflow);
}

#[test]
fn runaway_recursion_raises_stack_overflow() {
    let err = eval_err("function r() { r(); } r();");
    assert_eq!(err.kind(), ErrorKind::StackOverflow);
}
