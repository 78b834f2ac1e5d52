use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Parser;
use log::{debug, info};
use skink_diag::{render, Diagnostics, Severity};

#[derive(Parser)]
#[command(
    name = "skink",
    about = "The Skink compiler: Scheme-flavored source to C",
    version
)]
struct Cli {
    /// Path to the .sk source file
    input: PathBuf,
    /// Output C file; omit to compile and run via the host C compiler
    output: Option<PathBuf>,
    /// Show verbose diagnostics
    #[arg(short = 'v', long)]
    verbose: bool,
    /// Show debug diagnostics (implies verbose)
    #[arg(short = 'd', long)]
    debug: bool,
}

const RUNTIME_HEADER: &str = include_str!("../../../runtime/skink_runtime.h");
const RUNTIME_IMPL: &str = include_str!("../../../runtime/skink_runtime.c");

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not failures.
            if e.use_stderr() {
                eprintln!("{}", e);
                std::process::exit(1);
            }
            print!("{}", e);
            std::process::exit(0);
        }
    };

    let level = if cli.debug {
        log::LevelFilter::Trace
    } else if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    std::process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let source = match std::fs::read_to_string(&cli.input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: could not read {}: {}", cli.input.display(), e);
            return 1;
        }
    };

    let mut diags = Diagnostics::new();
    let program = skink_parser::parse(&source, &mut diags);
    log::trace!("parsed tree:\n{}", skink_ast::render_program(&program));
    let res = skink_resolver::resolve(&program, &mut diags);
    let tyk = skink_typeck::infer(&program, &res, &mut diags);
    // Code generation only runs on an error-free tree.
    let emitted = if diags.has_errors() {
        None
    } else {
        skink_codegen::emit(&program, &res, &tyk, &mut diags)
    };

    report(&diags, cli, &source);

    let Some(c_source) = emitted else {
        return 1;
    };
    if diags.has_errors() {
        return 1;
    }

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, c_source) {
                eprintln!("error: could not write {}: {}", path.display(), e);
                return 1;
            }
            info!("wrote {}", path.display());
            0
        }
        None => compile_and_run(cli, &c_source),
    }
}

fn report(diags: &Diagnostics, cli: &Cli, source: &str) {
    let min = if cli.debug {
        Severity::Debug
    } else if cli.verbose {
        Severity::Verbose
    } else {
        Severity::Info
    };
    let file = cli.input.display().to_string();
    for diag in diags.iter() {
        if diag.severity >= min {
            eprintln!("{}", render(diag, &file, source));
        }
    }
}

/// Write the C next to the input, then build and run it with the host C
/// compiler against the bundled runtime.
fn compile_and_run(cli: &Cli, c_source: &str) -> i32 {
    let c_path = cli.input.with_extension("c");
    if let Err(e) = std::fs::write(&c_path, c_source) {
        eprintln!("error: could not write {}: {}", c_path.display(), e);
        return 1;
    }

    let build_dir = std::env::temp_dir().join(format!("skink-{}", std::process::id()));
    if let Err(e) = std::fs::create_dir_all(&build_dir) {
        eprintln!("error: could not create {}: {}", build_dir.display(), e);
        return 1;
    }
    let runtime_h = build_dir.join("skink_runtime.h");
    let runtime_c = build_dir.join("skink_runtime.c");
    if std::fs::write(&runtime_h, RUNTIME_HEADER).is_err()
        || std::fs::write(&runtime_c, RUNTIME_IMPL).is_err()
    {
        eprintln!("error: could not stage the runtime in {}", build_dir.display());
        return 1;
    }

    let exe = build_dir.join(exe_name(&cli.input));
    debug!("building {} -> {}", c_path.display(), exe.display());
    let status = Command::new("cc")
        .arg("-O2")
        .arg("-I")
        .arg(&build_dir)
        .arg(&c_path)
        .arg(&runtime_c)
        .arg("-lm")
        .arg("-o")
        .arg(&exe)
        .status();
    match status {
        Ok(s) if s.success() => {}
        Ok(_) => {
            eprintln!("error: the host C compiler failed");
            return 1;
        }
        Err(e) => {
            eprintln!("error: could not run cc: {}", e);
            return 1;
        }
    }

    info!("running {}", exe.display());
    match Command::new(&exe).status() {
        Ok(s) if s.success() => 0,
        Ok(_) => 1,
        Err(e) => {
            eprintln!("error: could not run {}: {}", exe.display(), e);
            1
        }
    }
}

fn exe_name(input: &Path) -> String {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("program");
    format!("{}.bin", stem)
}
