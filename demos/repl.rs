//! Interactive driver: each line is compiled and run in a fresh virtual
//! machine, printing the external representation of the final stack value.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use stackscheme::vm::Vm;

fn main() {
    println!("stackscheme - Scheme subset on a bytecode stack machine");
    println!("Enter expressions like: (+ 1 2)");
    println!("Each line runs in a fresh VM. Type :quit or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize line editor");

    loop {
        match rl.readline("stackscheme> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                match line {
                    ":quit" | ":exit" => {
                        println!("Goodbye!");
                        break;
                    }
                    ":help" => {
                        print_help();
                        continue;
                    }
                    _ => {}
                }

                match eval_line(line) {
                    Ok(Some(repr)) => println!("{repr}"),
                    Ok(None) => {}
                    Err(e) => println!("Error: {e}"),
                }
            }

            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

/// Compile and execute one line, returning the final stack value's external
/// representation (or nothing when the program leaves an empty stack).
fn eval_line(line: &str) -> Result<Option<String>, stackscheme::Error> {
    let program = stackscheme::compile_source(line)?;

    let mut vm = Vm::new();
    vm.execute(&program)?;

    if vm.stack_len() == 0 {
        Ok(None)
    } else {
        vm.stack_top_to_string(&program).map(Some)
    }
}

fn print_help() {
    println!("Commands:");
    println!("  :help  - Show this help message");
    println!("  :quit  - Exit (also :exit, Ctrl+C, Ctrl+D)");
    println!();
    println!("Special forms: if, lambda, set!, define, quote ('x)");
    println!("Procedures: + - * / = < <= > >= cons car cdr null? odd? eqv?");
    println!("            display newline call/cc");
    println!();
    println!("Examples:");
    println!("  (+ 1 2 3)");
    println!("  ((lambda (x) (* x x)) 5)");
    println!("  (define fact (lambda (n) (if (< n 2) 1 (* n (fact (- n 1)))))) (fact 10)");
}
