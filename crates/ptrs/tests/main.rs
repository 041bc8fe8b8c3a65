use pretty_assertions::assert_eq;
use ptrs::{Engine, Value};

fn eval(src: &str) -> Value {
    let mut engine = Engine::new();
    engine
        .eval(src, "test.ptrs")
        .unwrap_or_else(|e| panic!("script failed: {e}"))
}

#[test]
fn arithmetic_and_literals() {
    assert_eq!(eval("1 + 2 * 3;"), Value::Int(7));
    assert_eq!(eval("0x10;"), Value::Int(16));
    assert_eq!(eval("'A';"), Value::Int(65));
    assert_eq!(eval("7 % 3;"), Value::Int(1));
    assert_eq!(eval("1 << 4;"), Value::Int(16));
    assert_eq!(eval("-5;"), Value::Int(-5));
    assert_eq!(eval("~0;"), Value::Int(-1));
}

#[test]
fn float_promotion_and_casts() {
    assert_eq!(eval("1 / 2.0;"), Value::Float(0.5));
    assert_eq!(eval("1.5 + 1;"), Value::Float(2.5));
    assert_eq!(eval("cast<int>(2.9);"), Value::Int(2));
    assert_eq!(eval("cast<int>(-2.9);"), Value::Int(-2));
    assert_eq!(eval("cast<float>(3);"), Value::Float(3.0));
}

#[test]
fn int_float_round_trip_within_53_bits() {
    assert_eq!(
        eval("cast<int>(cast<float>(9007199254740991));"),
        Value::Int(9_007_199_254_740_991)
    );
    assert_eq!(
        eval("cast<int>(cast<float>(-9007199254740991));"),
        Value::Int(-9_007_199_254_740_991)
    );
}

#[test]
fn truthiness() {
    assert_eq!(eval("!0;"), Value::Int(1));
    assert_eq!(eval("!3;"), Value::Int(0));
    assert_eq!(eval("!0.5;"), Value::Int(0));
    assert_eq!(eval("0 || 7;"), Value::Int(7));
    assert_eq!(eval("3 && 5;"), Value::Int(5));
    assert_eq!(eval("0 && 5;"), Value::Int(0));
    assert_eq!(eval("1 ? 2 : 3;"), Value::Int(2));
}

#[test]
fn typeof_returns_the_type_tag() {
    assert_eq!(eval("typeof undefined;"), Value::Int(0));
    assert_eq!(eval("typeof 5;"), Value::Int(1));
    assert_eq!(eval("typeof 5.0;"), Value::Int(2));
    assert_eq!(eval("typeof \"hi\";"), Value::Int(3));
    assert_eq!(eval("var v{2}; typeof v;"), Value::Int(4));
    assert_eq!(eval("function f() {} typeof f;"), Value::Int(5));
}

#[test]
fn variables_and_compound_assignment() {
    assert_eq!(eval("var x = 10; x <<= 2; x;"), Value::Int(40));
    assert_eq!(eval("var x = 10; x += 5; x;"), Value::Int(15));
    assert_eq!(eval("var x = 5; ++x; x;"), Value::Int(6));
    assert_eq!(eval("var x = 5; x++;"), Value::Int(5));
    assert_eq!(eval("var x = 5; x++; x;"), Value::Int(6));
    assert_eq!(eval("var x = 5; --x;"), Value::Int(4));
}

#[test]
fn loops_and_exit_tokens() {
    assert_eq!(
        eval("var total = 0; for(var i = 0; i < 5; i++) { total += i; } total;"),
        Value::Int(10)
    );
    assert_eq!(eval("var i = 0; do { i++; } while(i < 3); i;"), Value::Int(3));
    assert_eq!(
        eval("var i = 0; while(1) { i++; if (i == 4) break; } i;"),
        Value::Int(4)
    );
    // continue skips the rest of the body, break leaves only its own loop
    assert_eq!(
        eval(
            "var total = 0;
             for(var i = 0; i < 5; i++) {
                 if (i == 2) continue;
                 total += i;
             }
             total;"
        ),
        Value::Int(8)
    );
    assert_eq!(
        eval(
            "var count = 0;
             for(var i = 0; i < 3; i++) {
                 while(1) { break; }
                 count++;
             }
             count;"
        ),
        Value::Int(3)
    );
}

#[test]
fn return_crosses_loops() {
    assert_eq!(
        eval(
            "function f() {
                 for(var i = 0; i < 10; i++) {
                     while(1) {
                         return 42;
                     }
                 }
                 return 0;
             }
             f();"
        ),
        Value::Int(42)
    );
}

#[test]
fn switch_with_ranges() {
    assert_eq!(
        eval(
            "function pick(n) {
                 switch(n) {
                     case 1: return 10;
                     case 2 .. 5: return 20;
                     default: return 30;
                 }
             }
             pick(1) + pick(3) + pick(9);"
        ),
        Value::Int(60)
    );
}

#[test]
fn functions_bind_arguments() {
    assert_eq!(
        eval("function add(a, b) { return a + b; } add(30, 12);"),
        Value::Int(42)
    );
    // missing parameters evaluate defaults lazily, in the callee's scope
    assert_eq!(
        eval("function add(a, b = a + 1) { return a + b; } add(5);"),
        Value::Int(11)
    );
    assert_eq!(
        eval("function f(a) { return typeof a; } f();"),
        Value::Int(0)
    );
    // `arguments` sees every value passed, named or not
    assert_eq!(
        eval("function f(a, b) { return sizeof arguments; } f(1, 2, 3);"),
        Value::Int(3)
    );
    assert_eq!(
        eval("function f(a) { return arguments[1]; } f(1, 99);"),
        Value::Int(99)
    );
}

#[test]
fn closures_capture_their_frame() {
    // the captured counter survives the declaring call and keeps state
    assert_eq!(
        eval(
            "function make() {
                 var x = 10;
                 return function() { return x++; };
             }
             var f = make();
             f();
             f();
             f();"
        ),
        Value::Int(12)
    );
}

#[test]
fn string_insertion_formats_by_runtime_type() {
    assert_eq!(
        eval("var x = 5; \"x is $x!\";"),
        Value::Str("x is 5!".to_owned())
    );
    assert_eq!(
        eval("var f = 0.5; \"f = $f\";"),
        Value::Str("f = 0.5".to_owned())
    );
    assert_eq!(
        eval("\"sum: ${1 + 2}\";"),
        Value::Str("sum: 3".to_owned())
    );
    assert_eq!(
        eval("var who = \"world\"; \"hello $who\";"),
        Value::Str("hello world".to_owned())
    );
}

#[test]
fn string_concatenation() {
    assert_eq!(
        eval("var s = \"foo\"; s = s + \"bar\"; s;"),
        Value::Str("foobar".to_owned())
    );
}

#[test]
fn undefined_propagates_as_zero() {
    assert_eq!(eval("var x; cast<int>(x);"), Value::Int(0));
    assert_eq!(eval("var x; x ? 1 : 2;"), Value::Int(2));
}

#[test]
fn last_statement_value_is_returned() {
    assert_eq!(eval("var x = 1; var y = 2; x + y;"), Value::Int(3));
    assert_eq!(eval("1; 2; 3;"), Value::Int(3));
}
