//! Stack virtual machine executing the compiled bytecode.
//!
//! The machine keeps a value stack and a call-frame stack. A call frame is
//! opened by `push_frame_index` before the callee and arguments are
//! evaluated on top of it; `call` then dispatches on the callee's type.
//! Builtins collapse their own frame; lambdas record the return position
//! and jump; continuations replace both stacks wholesale with their frozen
//! snapshot.
//!
//! The coarity state decides whether value-producing instructions push at
//! all, and `ret` uses the coarity saved at call time either to splice
//! exactly one return value over the finished frame or to discard the frame
//! entirely.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;
use smallvec::SmallVec;

use crate::Error;
use crate::builtins::cons_onto_stack;
use crate::bytecode::{Constant, JUMP_ARG_SIZE, Opcode, Program};
use crate::value::{CallFrame, Capture, Coarity, Continuation, Lambda, LambdaRef, Value};

/// The virtual machine. Create one per program execution.
#[derive(Debug)]
pub struct Vm {
    pub(crate) call_frames: Vec<CallFrame>,
    pub(crate) stack: Vec<Value>,
    pub(crate) coarity: Coarity,
    ip: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            call_frames: Vec::new(),
            stack: Vec::new(),
            // The bootstrap prologue must be able to push the root lambda
            coarity: Coarity::One,
            ip: 0,
        }
    }

    /// Execute a compiled program until `halt`. On success the program's
    /// final value (if any) is left on the value stack.
    pub fn execute(&mut self, program: &Program) -> Result<(), Error> {
        self.ip = 0;

        loop {
            let byte = *program
                .code
                .get(self.ip)
                .ok_or_else(|| Error::EvalError("instruction pointer ran off the end".to_owned()))?;
            let opcode = Opcode::from_byte(byte)
                .ok_or_else(|| Error::EvalError(format!("invalid opcode {byte} at {}", self.ip)))?;

            trace!("{:>4}: {}", self.ip, opcode.name());
            self.ip += 1;

            match opcode {
                Opcode::PushConstant => {
                    let index = self.read_byte(program)?;
                    if self.coarity == Coarity::One {
                        let value = self.materialize_constant(program, index)?;
                        self.stack.push(value);
                    }
                }
                Opcode::PushStackVar => {
                    let index = self.read_byte(program)?;
                    if self.coarity == Coarity::One {
                        let slot = self.stack_var_slot(index)?;
                        let value = self.stack[slot].dereferenced();
                        self.stack.push(value);
                    }
                }
                Opcode::PushSharedVar => {
                    let index = self.read_byte(program)?;
                    if self.coarity == Coarity::One {
                        let cell = self.shared_var_cell(index, "push")?;
                        let value = cell.borrow().clone();
                        self.stack.push(value);
                    }
                }
                Opcode::SetStackVar => {
                    let index = self.read_byte(program)?;
                    let slot = self.stack_var_slot(index)?;
                    let value = self
                        .stack
                        .pop()
                        .ok_or_else(|| Error::EvalError("stack empty for set".to_owned()))?
                        .dereferenced();
                    if slot >= self.stack.len() {
                        return Err(Error::EvalError("invalid stack index for set".to_owned()));
                    }
                    match &self.stack[slot] {
                        Value::Ref(cell) => *cell.borrow_mut() = value,
                        _ => self.stack[slot] = value,
                    }
                }
                Opcode::SetSharedVar => {
                    let index = self.read_byte(program)?;
                    let cell = self.shared_var_cell(index, "set")?;
                    let value = self
                        .stack
                        .pop()
                        .ok_or_else(|| Error::EvalError("stack empty for set".to_owned()))?
                        .dereferenced();
                    *cell.borrow_mut() = value;
                }
                Opcode::AddStackVar => {
                    let frame = self.executing_frame_mut()?;
                    frame.stack_var_count = frame.stack_var_count.checked_add(1).ok_or_else(|| {
                        Error::CapacityError("stack variable count overflow".to_owned())
                    })?;
                }
                Opcode::CaptureStackVar => {
                    let index = self.read_byte(program)?;
                    self.execute_capture_stack_var(index)?;
                }
                Opcode::CaptureSharedVar => {
                    let index = self.read_byte(program)?;
                    self.execute_capture_shared_var(index)?;
                }
                Opcode::Cons => {
                    if self.coarity == Coarity::One {
                        cons_onto_stack(&mut self.stack, 1)?;
                        self.stack.pop();
                    }
                }
                Opcode::PushFrameIndex => {
                    self.call_frames.push(CallFrame {
                        executing_lambda: None,
                        frame_index: self.stack.len(),
                        stack_var_count: 0,
                        return_ip: 0,
                        return_coarity: self.coarity,
                    });
                }
                Opcode::Call => self.execute_call(program)?,
                Opcode::ExpectArgc => {
                    let expected = self.read_byte(program)?;
                    let frame = self.call_frames.last().ok_or_else(|| {
                        Error::EvalError("call frame stack empty for expect_argc".to_owned())
                    })?;
                    if frame.stack_var_count != expected {
                        return Err(Error::arity_error(
                            expected as usize,
                            frame.stack_var_count as usize,
                        ));
                    }
                }
                Opcode::Ret => self.execute_ret()?,
                Opcode::JumpForward => {
                    let jump_size = Program::read_jump_size(&program.code, self.ip)?;
                    self.ip += jump_size as usize;
                }
                Opcode::JumpForwardIfNot => {
                    let test = self.stack.pop().ok_or_else(|| {
                        Error::EvalError("stack empty for conditional jump".to_owned())
                    })?;
                    if test.is_truthy() {
                        self.ip += JUMP_ARG_SIZE;
                    } else {
                        let jump_size = Program::read_jump_size(&program.code, self.ip)?;
                        self.ip += jump_size as usize;
                    }
                }
                Opcode::PushContinuation => {
                    let continuation = Continuation {
                        frozen_call_frames: self.call_frames.clone(),
                        frozen_stack: self.stack.clone(),
                        frozen_coarity: self.coarity,
                    };
                    self.stack.push(Value::Continuation(Rc::new(continuation)));
                }
                Opcode::SetCoarityAny => self.coarity = Coarity::Any,
                Opcode::SetCoarityOne => self.coarity = Coarity::One,
                Opcode::Halt => return Ok(()),
            }
        }
    }

    fn read_byte(&mut self, program: &Program) -> Result<u8, Error> {
        let byte = *program
            .code
            .get(self.ip)
            .ok_or_else(|| Error::EvalError("missing instruction argument".to_owned()))?;
        self.ip += 1;
        Ok(byte)
    }

    /// Turn a pool constant into a runtime value. Lambda constants become
    /// fresh closures with empty capture arrays; the `capture_*`
    /// instructions that follow the push attach the cells.
    fn materialize_constant(&self, program: &Program, index: u8) -> Result<Value, Error> {
        let value = match program.constant(index)? {
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(x) => Value::Float(*x),
            Constant::Bool(b) => Value::Bool(*b),
            Constant::EmptyList => Value::EmptyList,
            Constant::Symbol(id) => Value::Symbol(*id),
            Constant::Builtin(op) => Value::Builtin(op),
            Constant::Lambda { code_offset } | Constant::HandRolled { code_offset, .. } => {
                Value::Lambda(Rc::new(RefCell::new(Lambda {
                    captures: SmallVec::new(),
                    code_offset: *code_offset,
                })))
            }
        };
        Ok(value)
    }

    /// The innermost frame that is actually executing a lambda. Frames
    /// opened by `push_frame_index` whose call has not happened yet are
    /// skipped.
    fn executing_frame(&self) -> Result<&CallFrame, Error> {
        self.call_frames
            .iter()
            .rev()
            .find(|frame| frame.executing_lambda.is_some())
            .ok_or_else(|| Error::EvalError("no executing call frame".to_owned()))
    }

    fn executing_frame_mut(&mut self) -> Result<&mut CallFrame, Error> {
        self.call_frames
            .iter_mut()
            .rev()
            .find(|frame| frame.executing_lambda.is_some())
            .ok_or_else(|| Error::EvalError("no executing call frame".to_owned()))
    }

    fn executing_lambda(&self) -> Result<LambdaRef, Error> {
        let frame = self.executing_frame()?;
        frame
            .executing_lambda
            .clone()
            .ok_or_else(|| Error::EvalError("no executing lambda".to_owned()))
    }

    /// Absolute stack position of the executing frame's variable `index`.
    fn stack_var_slot(&self, index: u8) -> Result<usize, Error> {
        let slot = self.executing_frame()?.frame_index + 1 + index as usize;
        if slot >= self.stack.len() {
            return Err(Error::EvalError(format!(
                "stack variable {index} out of bounds"
            )));
        }
        Ok(slot)
    }

    /// Capture cell `index` of the executing lambda.
    fn shared_var_cell(&self, index: u8, action: &str) -> Result<crate::value::ValueCell, Error> {
        let lambda = self.executing_lambda()?;
        let lambda = lambda.borrow();
        let capture = lambda.captures.get(index as usize).ok_or_else(|| {
            Error::EvalError(format!(
                "lambda capture index {index} out of bounds for {action}"
            ))
        })?;
        capture.cell()
    }

    /// The lambda value on the stack top, which the `capture_*`
    /// instructions attach cells to. Read through a capture cell when the
    /// top slot has just been promoted (a lambda captured into its own
    /// binding sits behind its own cell).
    fn capture_target(&self) -> Result<LambdaRef, Error> {
        let top = self
            .stack
            .last()
            .ok_or_else(|| Error::EvalError("stack empty for capture".to_owned()))?;
        match top.dereferenced() {
            Value::Lambda(lambda) => Ok(lambda),
            other => Err(Error::TypeError(format!(
                "expected lambda on stack top for capture, found {}",
                other.type_name()
            ))),
        }
    }

    /// Promote the frame slot to a shared cell (if it is not one already)
    /// and append it to the captures of the lambda on the stack top.
    fn execute_capture_stack_var(&mut self, index: u8) -> Result<(), Error> {
        let slot = self.stack_var_slot(index)?;

        let cell = match &self.stack[slot] {
            Value::Ref(cell) => cell.clone(),
            other => {
                let cell = Rc::new(RefCell::new(other.clone()));
                self.stack[slot] = Value::Ref(cell.clone());
                cell
            }
        };

        let target = self.capture_target()?;

        // A closure capturing its own binding would own itself through the
        // capture array; store a back-reference instead.
        let is_self_capture =
            matches!(&*cell.borrow(), Value::Lambda(inner) if Rc::ptr_eq(inner, &target));

        let capture = if is_self_capture {
            Capture::SelfRef(Rc::downgrade(&cell))
        } else {
            Capture::Shared(cell)
        };
        target.borrow_mut().captures.push(capture);
        Ok(())
    }

    /// Propagate capture slot `index` of the executing lambda to the lambda
    /// on the stack top.
    fn execute_capture_shared_var(&mut self, index: u8) -> Result<(), Error> {
        let lambda = self.executing_lambda()?;
        let capture = lambda
            .borrow()
            .captures
            .get(index as usize)
            .cloned()
            .ok_or_else(|| {
                Error::EvalError(format!(
                    "parent lambda capture index {index} out of bounds for capture"
                ))
            })?;

        let target = self.capture_target()?;
        target.borrow_mut().captures.push(capture);
        Ok(())
    }

    fn execute_call(&mut self, program: &Program) -> Result<(), Error> {
        let frame_index = self
            .call_frames
            .last()
            .ok_or_else(|| {
                Error::EvalError("call frame stack empty for procedure call".to_owned())
            })?
            .frame_index;

        let argc = self
            .stack
            .len()
            .checked_sub(frame_index + 1)
            .ok_or_else(|| Error::EvalError("stack empty for procedure call".to_owned()))?;
        if argc > u8::MAX as usize {
            return Err(Error::CapacityError(
                "exceeded max number of args allowed".to_owned(),
            ));
        }

        match self.stack[frame_index].dereferenced() {
            Value::Builtin(op) => {
                (op.func)(self, program, argc as u8)?;
                self.call_frames.pop();
            }
            Value::Lambda(lambda) => {
                let code_offset = lambda.borrow().code_offset;
                let return_ip = self.ip;
                let return_coarity = self.coarity;

                let frame = self
                    .call_frames
                    .last_mut()
                    .ok_or_else(|| Error::EvalError("call frame vanished".to_owned()))?;
                frame.executing_lambda = Some(lambda);
                frame.stack_var_count = argc as u8;
                frame.return_ip = return_ip;
                frame.return_coarity = return_coarity;

                self.ip = code_offset;
            }
            Value::Continuation(continuation) => {
                // save the values passed to the continuation
                let args: Vec<Value> = self.stack[frame_index + 1..].to_vec();

                // restore the frozen machine state
                self.call_frames = continuation.frozen_call_frames.clone();
                self.stack = continuation.frozen_stack.clone();
                self.coarity = continuation.frozen_coarity;

                // deliver the arguments as the return values of the call
                // that captured the continuation
                self.stack.extend(args);
                self.execute_ret()?;
            }
            other => {
                return Err(Error::TypeError(format!(
                    "expected callable at frame index, found {}",
                    other.type_name()
                )));
            }
        }

        Ok(())
    }

    fn execute_ret(&mut self) -> Result<(), Error> {
        let frame = self
            .call_frames
            .last()
            .ok_or_else(|| Error::EvalError("call frame stack empty for ret".to_owned()))?
            .clone();

        self.coarity = frame.return_coarity;

        if self.coarity == Coarity::One {
            let frame_start = frame.frame_index;
            let return_value_start = frame_start + 1 + frame.stack_var_count as usize;

            if return_value_start + 1 != self.stack.len() {
                return Err(Error::EvalError("expected one return value".to_owned()));
            }

            // roll the single return value down over the finished frame
            self.stack.drain(frame_start..return_value_start);
        } else {
            // the whole frame is discarded, return values included
            self.stack.truncate(frame.frame_index);
        }

        self.ip = frame.return_ip;
        self.call_frames.pop();
        Ok(())
    }

    /// Remove every value belonging to the current call frame.
    pub(crate) fn clear_call_frame(&mut self) -> Result<(), Error> {
        let frame_index = self
            .call_frames
            .last()
            .ok_or_else(|| Error::EvalError("no call frame to clear".to_owned()))?
            .frame_index;
        self.stack.truncate(frame_index);
        Ok(())
    }

    /// Trim the current call frame down to `return_value_count` values.
    pub(crate) fn pop_excess(&mut self, return_value_count: usize) -> Result<(), Error> {
        let frame_index = self
            .call_frames
            .last()
            .ok_or_else(|| Error::EvalError("no call frame to trim".to_owned()))?
            .frame_index;
        self.stack.truncate(frame_index + return_value_count);
        Ok(())
    }

    /// Build a pair from the two stack-top values, `dest_from_top` slots
    /// below the cdr.
    pub(crate) fn make_pair(&mut self, dest_from_top: usize) -> Result<(), Error> {
        cons_onto_stack(&mut self.stack, dest_from_top)
    }

    /// External representation of the top stack value.
    pub fn stack_top_to_string(&self, program: &Program) -> Result<String, Error> {
        self.stack
            .last()
            .map(|value| value.external_repr(program.interner()))
            .ok_or_else(|| Error::EvalError("stack empty".to_owned()))
    }

    /// Render the whole value stack, for diagnostics and tests.
    pub fn stack_to_string(&self, program: &Program) -> String {
        let mut out = String::from("[");
        for value in &self.stack {
            out.push_str(&value.external_repr(program.interner()));
            out.push_str(", ");
        }
        out.push(']');
        out
    }

    /// Number of values currently on the stack.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_source;

    /// Run a program and return the rendered final stack.
    fn run_stack(source: &str) -> Result<String, Error> {
        let program = compile_source(source)?;
        let mut vm = Vm::new();
        vm.execute(&program)?;
        Ok(vm.stack_to_string(&program))
    }

    /// Run a program and return the external representation of the final
    /// top-of-stack value.
    fn run(source: &str) -> Result<String, Error> {
        let program = compile_source(source)?;
        let mut vm = Vm::new();
        vm.execute(&program)?;
        vm.stack_top_to_string(&program)
    }

    fn run_programs(label: &str, test_cases: Vec<(&str, &str)>) {
        for (i, (source, expected)) in test_cases.iter().enumerate() {
            let result = run(source)
                .unwrap_or_else(|e| panic!("{label} #{} ({source}) failed: {e}", i + 1));
            assert_eq!(&result, expected, "{label} #{} ({source})", i + 1);
        }
    }

    #[test]
    fn test_specified_scenarios() {
        // Each program leaves exactly its final value on the stack
        let test_cases = vec![
            ("(+ 1 2 3 4 5 (- 5 2 1) (*))", "[18, ]"),
            ("(* (+ -3.2 2) (/ 6.2 2))", "[-3.7200000000000006, ]"),
            ("((if #f + -) 3 (* 5 2))", "[-7, ]"),
            ("((if (odd? (* 5 1)) + -) 3 (* 5 2))", "[13, ]"),
            ("((lambda (x) (* x x)) 5)", "[25, ]"),
            ("((lambda (f) (f 5)) (lambda (x) (* x x)))", "[25, ]"),
            (
                "((((lambda (x) (lambda (y) (lambda (z) (* x y z)))) 5) 6) 2)",
                "[60, ]",
            ),
            ("'(6 . 3)", "[(6 . 3), ]"),
            ("'('6)", "[((quote 6)), ]"),
            ("(quote ((quote 6)))", "[((quote 6)), ]"),
            ("(cons 'a '(b c))", "[(a b c), ]"),
            ("(cons '(1 2 3) 4)", "[((1 2 3) . 4), ]"),
            ("(cons 1 (cons 2 (cons 3 4)))", "[(1 2 3 . 4), ]"),
            ("(car (cdr '(1 . (2 . 3))))", "[2, ]"),
            ("((lambda (x) 3 (* x x)) 5)", "[25, ]"),
            ("((lambda (x) 3 (* 3 3) (* x x)) 5)", "[25, ]"),
            ("(if (call/cc (lambda (c) (c #f) #t)) 1 2)", "[2, ]"),
        ];

        for (i, (source, expected)) in test_cases.iter().enumerate() {
            let result = run_stack(source)
                .unwrap_or_else(|e| panic!("scenario #{} ({source}) failed: {e}", i + 1));
            assert_eq!(&result, expected, "scenario #{} ({source})", i + 1);
        }
    }

    #[test]
    fn test_conditionals() {
        run_programs(
            "if",
            vec![
                ("(if #t 1 2)", "1"),
                ("(if #f 1 2)", "2"),
                // only #f is falsy
                ("(if 0 1 2)", "1"),
                ("(if '() 1 2)", "1"),
                ("(if (cdr '(x)) 1 2)", "1"),
                // missing alternate with true test
                ("(if #t 42)", "42"),
                // nested tests
                ("(if (if #t #f #t) 1 2)", "2"),
                ("(if (< 1 2) (+ 1 2) (- 1 2))", "3"),
            ],
        );
    }

    #[test]
    fn test_lambdas_and_closures() {
        run_programs(
            "closure",
            vec![
                // immediately applied
                ("((lambda () 42))", "42"),
                ("((lambda (a b) (- a b)) 10 4)", "6"),
                // capture survives the creating frame
                ("(((lambda (n) (lambda (m) (+ n m))) 10) 5)", "15"),
                // sibling closures share the captured binding
                (
                    "(((lambda (x) (lambda (ignored) ((lambda () (set! x (+ x 1)))) x)) 10) 0)",
                    "11",
                ),
                // shadowing: the inner formal wins
                ("(((lambda (x) (lambda (x) x)) 1) 2)", "2"),
            ],
        );
    }

    #[test]
    fn test_define_and_set() {
        run_programs(
            "define",
            vec![
                ("(define x 42) x", "42"),
                ("(define x 2) (define y 3) (* x y)", "6"),
                ("(define x 1) (set! x 99) x", "99"),
                // define inside a lambda body
                ("((lambda (a) (define b (* a 2)) (+ a b)) 5)", "15"),
                // set! through a closure is observed by the defining scope
                ("(define x 10) (define bump (lambda () (set! x (+ x 1)))) (bump) (bump) x", "12"),
                // the set! value expression is itself a call
                ("(define x 1) (set! x (* 6 7)) x", "42"),
            ],
        );
    }

    #[test]
    fn test_self_recursion_via_define() {
        run_programs(
            "recursion",
            vec![
                (
                    "(define fact (lambda (n) (if (< n 2) 1 (* n (fact (- n 1)))))) (fact 10)",
                    "3628800",
                ),
                (
                    "(define fib (lambda (n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2)))))) (fib 15)",
                    "610",
                ),
                (
                    "(define len (lambda (l) (if (null? l) 0 (+ 1 (len (cdr l)))))) (len '(a b c d))",
                    "4",
                ),
            ],
        );
    }

    #[test]
    fn test_continuations() {
        run_programs(
            "call/cc",
            vec![
                // continuation unused: equivalent to the body expression
                ("(call/cc (lambda (k) 42))", "42"),
                ("(+ 1 (call/cc (lambda (k) 2)))", "3"),
                // escaping continuation aborts the rest of the computation
                ("(+ 1 (call/cc (lambda (k) (k 10) 99)))", "11"),
                ("(* 2 (call/cc (lambda (k) (+ 1 (k 5)))))", "10"),
                // the continuation value feeds the enclosing test position
                ("(if (call/cc (lambda (c) (c #f) #t)) 1 2)", "2"),
                ("(if (call/cc (lambda (c) #t)) 1 2)", "1"),
            ],
        );
    }

    #[test]
    fn test_coarity_discards_non_final_values() {
        // non-final expressions leave nothing behind on the stack
        let program = compile_source("((lambda (x) 1 2 3 x) 7)").unwrap();
        let mut vm = Vm::new();
        vm.execute(&program).unwrap();
        assert_eq!(vm.stack_len(), 1);
        assert_eq!(vm.stack_top_to_string(&program).unwrap(), "7");

        // non-final calls still run (for effect) but keep no values
        let program =
            compile_source("(define x 0) ((lambda () (set! x (+ x 1)) (set! x (+ x 10)) x))")
                .unwrap();
        let mut vm = Vm::new();
        vm.execute(&program).unwrap();
        assert_eq!(vm.stack_top_to_string(&program).unwrap(), "11");
    }

    #[test]
    fn test_side_effects_in_discarded_positions_happen_once() {
        // the non-final (set! ...) runs exactly once even though its value
        // is discarded
        let source = "(define counter 0)
(define touch (lambda () (set! counter (+ counter 1)) counter))
((lambda () (touch) (touch)))
counter";
        assert_eq!(run(source).unwrap(), "2");
    }

    #[test]
    fn test_shared_cell_invariant() {
        // two closures over the same binding observe each other's writes
        let source = "(define make (lambda (x)
  (cons (lambda () x)
        (lambda (v) (set! x v)))))
(define cell (make 1))
((cdr cell) 42)
((car cell))";
        assert_eq!(run(source).unwrap(), "42");
    }

    #[test]
    fn test_runtime_errors() {
        let error_cases = vec![
            // wrong arity for a fixed-arity lambda
            "((lambda (x) x) 1 2)",
            "((lambda (x y) x) 1)",
            // calling a non-callable
            "(42 1 2)",
            "('a)",
            // unknown identifier is a compile error
            "undefined-name",
            // a non-final expression sequence ending in a 0-value primitive
            // leaves ret without its one value
            "((lambda () (display 0)))",
        ];

        for (i, source) in error_cases.iter().enumerate() {
            assert!(
                run(source).is_err(),
                "error case #{} ({source}) should fail",
                i + 1
            );
        }
    }

    #[test]
    fn test_stack_formatting() {
        let program = compile_source("(cons 1 2)").unwrap();
        let mut vm = Vm::new();
        vm.execute(&program).unwrap();
        assert_eq!(vm.stack_to_string(&program), "[(1 . 2), ]");
        assert_eq!(vm.stack_top_to_string(&program).unwrap(), "(1 . 2)");
    }
}
