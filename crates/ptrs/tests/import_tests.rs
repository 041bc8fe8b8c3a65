use std::{fs, path::PathBuf};

use pretty_assertions::assert_eq;
use ptrs::{Engine, ErrorKind, Value};

/// A scratch directory unique to one test, cleaned up on drop.
struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("ptrs-test-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).expect("create scratch dir");
        Self { dir }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.join(name);
        fs::write(&path, contents).expect("write scratch file");
        path
    }

    /// A file name inside the scratch dir, for use as the main module path.
    fn main_path(&self) -> String {
        self.dir.join("main.ptrs").to_string_lossy().into_owned()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn script_imports_pull_named_symbols() {
    let scratch = Scratch::new("named");
    scratch.write(
        "lib.ptrs",
        "var answer = 42;\nfunction double(x) { return x * 2; }\n",
    );

    let mut engine = Engine::new();
    let result = engine
        .eval(
            "import answer, double from \"lib.ptrs\";\ndouble(answer);",
            &scratch.main_path(),
        )
        .unwrap_or_else(|e| panic!("script failed: {e}"));
    assert_eq!(result, Value::Int(84));
}

/// Two imports of one canonical path observe the same evaluation: the
/// imported function keeps mutating the same module-level counter.
#[test]
fn imports_are_idempotent() {
    let scratch = Scratch::new("idempotent");
    scratch.write(
        "counter.ptrs",
        "var calls = 0;\nfunction bump() { calls++; return calls; }\n",
    );

    let mut engine = Engine::new();
    let result = engine
        .eval(
            "import bump from \"counter.ptrs\";
             bump();
             import bump from \"counter.ptrs\";
             bump();",
            &scratch.main_path(),
        )
        .unwrap_or_else(|e| panic!("script failed: {e}"));
    assert_eq!(result, Value::Int(2));
}

#[test]
fn missing_script_symbols_raise_import_errors() {
    let scratch = Scratch::new("missing-symbol");
    scratch.write("lib.ptrs", "var present = 1;\n");

    let mut engine = Engine::new();
    let err = engine
        .eval(
            "import absent from \"lib.ptrs\";",
            &scratch.main_path(),
        )
        .expect_err("symbol should be missing");
    assert_eq!(err.kind(), ErrorKind::ImportError);
}

#[test]
fn missing_script_files_raise_import_errors() {
    let scratch = Scratch::new("missing-file");
    let mut engine = Engine::new();
    let err = engine
        .eval(
            "import x from \"nope.ptrs\";",
            &scratch.main_path(),
        )
        .expect_err("file should be missing");
    assert_eq!(err.kind(), ErrorKind::ImportError);
}

#[test]
fn imported_structs_keep_their_file_privacy() {
    let scratch = Scratch::new("privacy");
    scratch.write(
        "lib.ptrs",
        "struct Box {\n    private secret = 7;\n    peek() { return this.secret; }\n};\nvar box = new Box();\n",
    );

    let mut engine = Engine::new();
    // the declaring file may touch the member through its own method
    let result = engine
        .eval(
            "import box from \"lib.ptrs\";\nbox.peek();",
            &scratch.main_path(),
        )
        .unwrap_or_else(|e| panic!("script failed: {e}"));
    assert_eq!(result, Value::Int(7));

    // direct access from the importing file is denied
    let err = engine
        .eval("import box from \"lib.ptrs\";\nbox.secret;", &scratch.main_path())
        .expect_err("protection should trip");
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}

#[test]
fn imported_closures_share_module_state() {
    let scratch = Scratch::new("shared-state");
    scratch.write(
        "store.ptrs",
        "var slot = 0;\nfunction put(v) { slot = v; }\nfunction get() { return slot; }\n",
    );

    let mut engine = Engine::new();
    let result = engine
        .eval(
            "import put, get from \"store.ptrs\";\nput(123);\nget();",
            &scratch.main_path(),
        )
        .unwrap_or_else(|e| panic!("script failed: {e}"));
    assert_eq!(result, Value::Int(123));
}
