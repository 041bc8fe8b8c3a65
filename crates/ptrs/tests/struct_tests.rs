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
fn fields_and_methods() {
    assert_eq!(
        eval(
            "struct Point {
                 x;
                 y;
                 sum() { return this.x + this.y; }
             };
             var p = new Point();
             p.x = 3;
             p.y = 4;
             p.sum();"
        ),
        Value::Int(7)
    );
}

#[test]
fn field_initializers_run_in_declaration_order() {
    assert_eq!(
        eval(
            "struct Pair {
                 a = 1;
                 b = 2;
             };
             var p = new Pair();
             p.a * 10 + p.b;"
        ),
        Value::Int(12)
    );
}

#[test]
fn constructor_receives_arguments() {
    assert_eq!(
        eval(
            "struct Point {
                 x;
                 y;
                 constructor(x, y) {
                     this.x = x;
                     this.y = y;
                 }
             };
             var p = new Point(3, 9);
             p.x + p.y;"
        ),
        Value::Int(12)
    );
}

/// The S2 shape: a `+` overload builds a new instance.
#[test]
fn plus_overload_builds_a_vector() {
    assert_eq!(
        eval(
            "struct Vec {
                 x;
                 y;
                 operator + (o) {
                     var r = new Vec();
                     r.x = this.x + o.x;
                     r.y = this.y + o.y;
                     return r;
                 }
             };
             var a = new Vec(); a.x = 1; a.y = 2;
             var b = new Vec(); b.x = 10; b.y = 20;
             (a + b).x;"
        ),
        Value::Int(11)
    );
}

/// A defined overload preempts coercion even with an Int on the right.
#[test]
fn overload_preempts_default_coercion() {
    assert_eq!(
        eval(
            "struct W {
                 v;
                 operator + (o) { return 100 + o; }
             };
             var w = new W();
             w + 5;"
        ),
        Value::Int(105)
    );
}

#[test]
fn compound_assign_overload_is_its_own_tag() {
    assert_eq!(
        eval(
            "struct Acc {
                 total = 0;
                 operator += (o) {
                     this.total = this.total + o;
                     return this.total;
                 }
             };
             var a = new Acc();
             a += 4;
             a += 5;
             a.total;"
        ),
        Value::Int(9)
    );
}

#[test]
fn getters_and_setters_dispatch() {
    assert_eq!(
        eval(
            "struct G {
                 backing;
                 get v { return this.backing + 1; }
                 set v(x) { this.backing = x * 2; }
             };
             var g = new G();
             g.v = 5;
             g.v;"
        ),
        Value::Int(11)
    );
}

#[test]
fn static_members_live_on_the_type() {
    assert_eq!(
        eval(
            "struct Counter {
                 static count = 0;
                 bump() { Counter.count++; }
             };
             var a = new Counter();
             var b = new Counter();
             a.bump();
             b.bump();
             a.bump();
             Counter.count;"
        ),
        Value::Int(3)
    );
}

#[test]
fn typed_members_truncate() {
    assert_eq!(
        eval("struct T { v: i8; }; var t = new T(); t.v = 300; t.v;"),
        Value::Int(44)
    );
    assert_eq!(
        eval("struct T { v: u8; }; var t = new T(); t.v = -1; t.v;"),
        Value::Int(255)
    );
    assert_eq!(
        eval("struct T { v: u16; }; var t = new T(); t.v;"),
        Value::Int(0)
    );
}

#[test]
fn array_members_are_views() {
    assert_eq!(
        eval(
            "struct Buf {
                 data[4] = [1, 2, 3, 4];
             };
             var b = new Buf();
             b.data[2];"
        ),
        Value::Int(3)
    );
    assert_eq!(
        eval(
            "struct Buf { data[4]; };
             var b = new Buf();
             sizeof b.data;"
        ),
        Value::Int(4)
    );
    assert_eq!(
        eval(
            "struct Buf { vals{3} = [7, 8, 9]; };
             var b = new Buf();
             b.vals[1];"
        ),
        Value::Int(8)
    );
}

#[test]
fn many_members_resolve_through_the_hash_table() {
    assert_eq!(
        eval(
            "struct Wide {
                 alpha = 1;
                 beta = 2;
                 gamma = 3;
                 delta = 4;
                 epsilon = 5;
                 zeta = 6;
                 eta = 7;
                 theta = 8;
             };
             var w = new Wide();
             w.alpha + w.delta + w.theta;"
        ),
        Value::Int(13)
    );
    // a missing member reads as undefined, not an error
    assert_eq!(
        eval("struct S { a = 1; }; var s = new S(); typeof s.missing;"),
        Value::Int(0)
    );
    // but assigning one is an error
    assert_eq!(
        eval_err("struct S { a = 1; }; var s = new S(); s.missing = 2;").kind(),
        ErrorKind::TypeError
    );
}

#[test]
fn index_overload_and_stringified_keys() {
    assert_eq!(
        eval(
            "struct M {
                 hits = 0;
                 operator [] (k) {
                     this.hits = this.hits + 1;
                     return sizeof k;
                 }
             };
             var m = new M();
             m[\"four\"] + m.hits;"
        ),
        // "four" plus the NUL the key is handed over with
        Value::Int(6)
    );
    assert_eq!(
        eval("struct S { a = 7; }; var s = new S(); s[\"a\"];"),
        Value::Int(7)
    );
}

#[test]
fn call_overload_makes_instances_callable() {
    assert_eq!(
        eval(
            "struct Adder {
                 base;
                 operator () (v) { return this.base + v; }
             };
             var add = new Adder();
             add.base = 40;
             add(2);"
        ),
        Value::Int(42)
    );
}

#[test]
fn instanceof_checks_the_member_table() {
    let src = "struct A { x; }; struct B { x; }; var a = new A();";
    assert_eq!(eval(&format!("{src} a instanceof A;")), Value::Int(1));
    assert_eq!(eval(&format!("{src} var b = new B(); b instanceof A;")), Value::Int(0));
    // the type itself is not an instance
    assert_eq!(eval(&format!("{src} A instanceof A;")), Value::Int(0));
}

#[test]
fn for_in_iterates_accessible_members() {
    assert_eq!(
        eval(
            "struct P { a = 1; b = 2; };
             var p = new P();
             var total = 0;
             for(k, v in p) { total += v; }
             total;"
        ),
        Value::Int(3)
    );
    assert_eq!(
        eval(
            "struct P { a = 1; bee = 2; };
             var p = new P();
             var letters = 0;
             for(k in p) { letters += sizeof k - 1; }
             letters;"
        ),
        Value::Int(4)
    );
}

#[test]
fn for_in_skips_write_only_members() {
    assert_eq!(
        eval(
            "struct S {
                 a = 1;
                 set v(x) { this.a = x; }
                 b = 2;
             };
             var s = new S();
             var total = 0;
             for(k, v in s) { total += v; }
             total;"
        ),
        Value::Int(3)
    );
    // key-only iteration still yields the setter's name
    assert_eq!(
        eval(
            "struct S {
                 a = 1;
                 set v(x) { this.a = x; }
             };
             var s = new S();
             var count = 0;
             for(k in s) { count++; }
             count;"
        ),
        Value::Int(2)
    );
}

/// The S5 shape: a for-in overload drives the loop through a yielder.
#[test]
fn for_in_overload_yields_into_the_body() {
    assert_eq!(
        eval(
            "struct Range {
                 n;
                 operator for in (yielder) {
                     for(var i = 0; i < this.n; i++) {
                         yielder(i);
                     }
                 }
             };
             var r = new Range();
             r.n = 3;
             var sum = 0;
             for(i in r) { sum += i; }
             sum;"
        ),
        Value::Int(3)
    );
}

#[test]
fn for_in_overload_break_stops_the_overload() {
    assert_eq!(
        eval(
            "struct Range {
                 n;
                 operator for in (yielder) {
                     for(var i = 0; i < this.n; i++) {
                         yielder(i);
                     }
                 }
             };
             var r = new Range();
             r.n = 100;
             var sum = 0;
             for(i in r) {
                 if (i == 4) break;
                 sum += i;
             }
             sum;"
        ),
        Value::Int(6)
    );
}

#[test]
fn for_in_overload_return_exits_the_function() {
    assert_eq!(
        eval(
            "struct Range {
                 n;
                 operator for in (yielder) {
                     for(var i = 0; i < this.n; i++) {
                         yielder(i);
                     }
                 }
             };
             function find(r, wanted) {
                 for(i in r) {
                     if (i == wanted) return i * 10;
                 }
                 return -1;
             }
             var r = new Range();
             r.n = 8;
             find(r, 5);"
        ),
        Value::Int(50)
    );
}

/// A break leaving the loop body unwinds through the overload's `try`
/// without being caught, but its finally clause still runs.
#[test]
fn finally_runs_when_break_crosses_a_for_in_overload() {
    assert_eq!(
        eval(
            "struct Range {
                 n;
                 static cleanups = 0;
                 operator for in (yielder) {
                     for(var i = 0; i < this.n; i++) {
                         try {
                             yielder(i);
                         } finally {
                             Range.cleanups++;
                         }
                     }
                 }
             };
             var r = new Range();
             r.n = 10;
             var sum = 0;
             for(i in r) {
                 if (i == 2) break;
                 sum += i;
             }
             sum * 10 + Range.cleanups;"
        ),
        // two full yields plus the breaking one, each through the finally
        Value::Int(13)
    );
}

#[test]
fn finally_runs_when_return_crosses_a_for_in_overload() {
    assert_eq!(
        eval(
            "var cleanups = 0;
             struct Range {
                 n;
                 operator for in (yielder) {
                     for(var i = 0; i < this.n; i++) {
                         try { yielder(i); } finally { cleanups++; }
                     }
                 }
             };
             function first(r) {
                 for(i in r) { return i + 100; }
                 return -1;
             }
             var r = new Range();
             r.n = 5;
             first(r) * 10 + cleanups;"
        ),
        Value::Int(1001)
    );
}

#[test]
fn destructor_runs_on_delete() {
    assert_eq!(
        eval(
            "var dropped = 0;
             struct D {
                 v;
                 destructor() { dropped = dropped + 1; }
             };
             var d = new D();
             delete d;
             dropped;"
        ),
        Value::Int(1)
    );
}

#[test]
fn deleted_instances_fault_on_access() {
    let err = eval_err(
        "struct S { a = 1; };
         var s = new S();
         delete s;
         s.a;",
    );
    assert_eq!(err.kind(), ErrorKind::TypeError);
}

#[test]
fn non_static_access_through_the_type_is_an_error() {
    let err = eval_err("struct S { a = 1; }; S.a;");
    assert_eq!(err.kind(), ErrorKind::TypeError);
}

#[test]
fn inc_overload_sees_the_suffix_marker() {
    assert_eq!(
        eval(
            "struct C {
                 last;
                 operator ++ (suffixed) {
                     this.last = suffixed;
                     return 7;
                 }
             };
             var c = new C();
             var r = c++;
             r * 10 + c.last;"
        ),
        Value::Int(71)
    );
}
