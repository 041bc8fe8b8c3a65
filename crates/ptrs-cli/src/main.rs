use std::{env, path::Path, process::ExitCode};

use ptrs::Engine;

extern "C" fn on_signal(signo: libc::c_int) {
    ptrs::raise_signal(signo);
}

/// Route the usual fatal signals through the engine so scripts can catch
/// them; uncaught they terminate evaluation with exit code 3.
fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGQUIT, handler);
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: ptrs <script.ptrs>");
        return ExitCode::FAILURE;
    };

    install_signal_handlers();

    let mut engine = Engine::new();
    if args.iter().any(|a| a == "--unsafe") {
        engine.set_safety(false);
    }

    match engine.run_file(Path::new(file_path)) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(3)
        }
    }
}
