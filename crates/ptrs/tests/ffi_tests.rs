#![cfg(unix)]

use pretty_assertions::assert_eq;
use ptrs::{Engine, ErrorKind, Value};

fn eval(src: &str) -> Value {
    let mut engine = Engine::new();
    engine
        .eval(src, "test.ptrs")
        .unwrap_or_else(|e| panic!("script failed: {e}"))
}

#[test]
fn native_symbols_resolve_from_the_process_image() {
    assert_eq!(eval("import strlen; typeof strlen;"), Value::Int(3));
}

#[test]
fn calling_strlen_marshals_a_string() {
    assert_eq!(eval("import strlen; strlen(\"hello\");"), Value::Int(5));
    assert_eq!(eval("import strlen; strlen(\"\");"), Value::Int(0));
}

#[test]
fn int_arguments_marshal_as_64_bit() {
    // labs(3) takes and returns a long
    assert_eq!(eval("import labs; labs(-12345678901);"), Value::Int(12_345_678_901));
}

#[test]
fn missing_symbols_raise_import_errors() {
    let mut engine = Engine::new();
    let err = engine
        .eval("import definitely_not_a_real_symbol_qq;", "test.ptrs")
        .expect_err("resolution should fail");
    assert_eq!(err.kind(), ErrorKind::ImportError);
}

#[test]
fn missing_libraries_raise_import_errors() {
    let mut engine = Engine::new();
    let err = engine
        .eval("import something from \"libdoesnotexist-qq.so\";", "test.ptrs")
        .expect_err("open should fail");
    assert_eq!(err.kind(), ErrorKind::ImportError);
}

/// The S4 shape: qsort over an 8-byte array with a script comparator. The
/// comparator crosses the boundary as a real C function pointer and its
/// incoming arguments arrive as integer addresses.
#[test]
fn qsort_roundtrip_through_a_script_comparator() {
    assert_eq!(
        eval(
            "import qsort;
             var buf[8] = [6, 1, 8, 4, 7, 2, 5, 3];
             qsort(buf, 8, 1, function(a, b) {
                 return *cast<native>a - *cast<native>b;
             });
             var ok = 1;
             for(var i = 1; i < 8; i++) {
                 if (buf[i - 1] > buf[i]) ok = 0;
             }
             ok;"
        ),
        Value::Int(1)
    );
}

#[test]
fn qsort_result_is_fully_sorted() {
    assert_eq!(
        eval(
            "import qsort;
             var buf[5] = [9, 3, 7, 1, 5];
             qsort(buf, 5, 1, function(a, b) {
                 return *cast<native>a - *cast<native>b;
             });
             buf[0] * 10000 + buf[1] * 1000 + buf[2] * 100 + buf[3] * 10 + buf[4];"
        ),
        Value::Int(13_579)
    );
}

#[test]
fn callbacks_can_close_over_script_state() {
    // the comparator reverses the order through a captured flag
    assert_eq!(
        eval(
            "import qsort;
             function make_cmp(sign) {
                 return function(a, b) {
                     return (*cast<native>a - *cast<native>b) * sign;
                 };
             }
             var buf[4] = [2, 4, 1, 3];
             qsort(buf, 4, 1, make_cmp(-1));
             buf[0];"
        ),
        Value::Int(4)
    );
}

#[test]
fn memcpy_moves_managed_bytes() {
    assert_eq!(
        eval(
            "import memcpy;
             var src[4] = [1, 2, 3, 4];
             var dst[4];
             memcpy(dst, src, 4);
             dst[0] + dst[1] + dst[2] + dst[3];"
        ),
        Value::Int(10)
    );
}

#[test]
fn toupper_round_trips_a_byte() {
    assert_eq!(eval("import toupper; toupper('a');"), Value::Int(65));
}
