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

/// The S3 shape: try, catch, finally run in order and the error message
/// reaches the catch parameter.
#[test]
fn try_catch_finally_ordering() {
    assert_eq!(
        eval(
            "var out = \"\";
             try {
                 out += \"A\";
                 throw \"oops\";
                 out += \"B\";
             } catch(m) {
                 out += \"C:\" + m;
             } finally {
                 out += \"D\";
             }
             out;"
        ),
        Value::Str("AC:oopsD".to_owned())
    );
}

#[test]
fn finally_runs_without_an_error_too() {
    assert_eq!(
        eval(
            "var out = \"\";
             try { out += \"A\"; } finally { out += \"B\"; }
             out;"
        ),
        Value::Str("AB".to_owned())
    );
}

#[test]
fn finally_runs_on_the_return_path() {
    assert_eq!(
        eval(
            "var cleaned = 0;
             function f() {
                 try {
                     return 5;
                 } finally {
                     cleaned = 1;
                 }
             }
             f() * 10 + cleaned;"
        ),
        Value::Int(51)
    );
}

#[test]
fn uncaught_error_rethrows_after_finally() {
    let mut engine = Engine::new();
    let err = engine
        .eval(
            "var out = 0;
             try { throw \"boom\"; } finally { out = 1; }",
            "test.ptrs",
        )
        .expect_err("error should escape a catchless try");
    assert_eq!(err.kind(), ErrorKind::UserError);
    assert_eq!(err.message(), "boom");
}

#[test]
fn catch_restores_normal_flow() {
    assert_eq!(
        eval(
            "var x = 0;
             try { throw \"e\"; } catch(m) { x = 1; }
             x = x + 1;
             x;"
        ),
        Value::Int(2)
    );
}

#[test]
fn nested_try_rethrow() {
    assert_eq!(
        eval(
            "var out = \"\";
             try {
                 try {
                     throw \"inner\";
                 } finally {
                     out += \"F\";
                 }
             } catch(m) {
                 out += m;
             }
             out;"
        ),
        Value::Str("Finner".to_owned())
    );
}

#[test]
fn catch_binds_position_parameters() {
    // line and column of the throw arrive in parameters four and five
    assert_eq!(
        eval("var l = 0;\ntry {\n throw \"x\";\n} catch(m, bt, file, line, col) {\n l = line;\n}\nl;"),
        Value::Int(3)
    );
}

#[test]
fn runtime_faults_are_catchable() {
    assert_eq!(
        eval(
            "var kind = \"\";
             try {
                 var b[2];
                 b[9];
             } catch(m) {
                 kind = \"caught\";
             }
             kind;"
        ),
        Value::Str("caught".to_owned())
    );
    // integer division by zero surfaces through the same channel
    assert_eq!(
        eval("var r = -1; try { r = 1 / 0; } catch(m) { r = 99; } r;"),
        Value::Int(99)
    );
}

#[test]
fn throw_stringifies_its_operand() {
    assert_eq!(eval_err("throw 42;").message(), "42");
    assert_eq!(eval_err("throw 1.5;").message(), "1.5");
    assert_eq!(eval_err("throw \"text\";").message(), "text");
}

#[test]
fn uncaught_errors_carry_position_and_trace() {
    let err = eval_err(
        "function inner() { throw \"deep\"; }
         function outer() { inner(); }
         outer();",
    );
    assert_eq!(err.kind(), ErrorKind::UserError);
    assert_eq!(err.message(), "deep");
    assert_eq!(err.line(), Some(1));
    let trace = err.backtrace();
    assert!(trace.contains("at inner"), "missing inner frame: {trace}");
    assert!(trace.contains("at outer"), "missing outer frame: {trace}");

    let rendered = err.to_string();
    assert!(rendered.contains("UserError"), "missing kind: {rendered}");
    assert!(rendered.contains("test.ptrs:1:"), "missing position: {rendered}");
    assert!(rendered.contains('^'), "missing caret: {rendered}");
}

#[test]
fn type_errors_name_both_sides() {
    let err = eval_err("var v{2}; v * v;");
    assert_eq!(err.kind(), ErrorKind::TypeError);
    assert!(
        err.message().contains("pointer"),
        "unexpected message: {}",
        err.message()
    );
}

#[test]
fn parse_errors_point_at_the_offender() {
    let mut engine = Engine::new();
    let err = engine
        .eval("var a = ;\n", "broken.ptrs")
        .expect_err("parse should fail");
    assert_eq!(err.line(), Some(1));
    assert!(err.to_string().contains("broken.ptrs"));
}

#[test]
fn unknown_identifiers_fail_at_prepare_time() {
    let mut engine = Engine::new();
    let err = engine
        .eval("nonexistent + 1;", "test.ptrs")
        .expect_err("resolution should fail");
    assert!(
        err.message().contains("nonexistent"),
        "unexpected message: {}",
        err.message()
    );
}

#[test]
fn errors_unwind_scopes_cleanly() {
    // after catching, execution continues with intact locals
    assert_eq!(
        eval(
            "function risky(n) {
                 if (n > 2) throw \"too big\";
                 return n * 2;
             }
             var total = 0;
             for(var i = 0; i < 6; i++) {
                 try {
                     total += risky(i);
                 } catch(m) {
                     total += 1;
                 }
             }
             total;"
        ),
        // 0 + 2 + 4 + 1 + 1 + 1
        Value::Int(9)
    );
}
