//! Command line front-end: compile a Scheme file and execute it.

use std::{env, fs, process::exit};

use getopts::Options;
use log::info;

use stackscheme::vm::Vm;

fn usage(bin: &str, opts: &Options) -> String {
    opts.usage(&format!("Usage: {bin} [-h|--help] [-d|--disassemble] <file>"))
}

fn run(path: &str, disassemble: bool) -> Result<(), Box<dyn std::error::Error>> {
    let source = fs::read_to_string(path)?;

    let program = stackscheme::compile_source(&source)?;
    info!(
        "compiled {path}: {} bytes of bytecode, {} constants",
        program.code.len(),
        program.constant_count()
    );

    if disassemble {
        print!("disassembly:\n{}program output:\n", program.disassemble()?);
    }

    let mut vm = Vm::new();
    vm.execute(&program)?;
    Ok(())
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let bin = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("d", "disassemble", "Print disassembly in addition to program output");
    opts.optflag("h", "help", "Display this message and quit");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {e}\n{}", usage(&bin, &opts));
            exit(1);
        }
    };

    if matches.opt_present("h") {
        print!("{}", usage(&bin, &opts));
        return;
    }

    let file_path = match matches.free.as_slice() {
        [path] => path.clone(),
        [] => {
            eprintln!("error: file path required\n{}", usage(&bin, &opts));
            exit(1);
        }
        _ => {
            eprintln!("error: too many args\n{}", usage(&bin, &opts));
            exit(1);
        }
    };

    if let Err(e) = run(&file_path, matches.opt_present("d")) {
        eprintln!("error: {e}");
        exit(1);
    }
}
