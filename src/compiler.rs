//! Single-pass compiler: token stream in, bytecode out.
//!
//! The compiler walks the tokens exactly once, maintaining a stack of
//! per-lambda scope contexts. Each context maps variable names to
//! stack-slot ids (formals and `define`d locals) or shared-slot ids
//! (captured bindings), and carries the coarity stack for toggle-on-
//! transition emission.
//!
//! Lexical capture works by walking the enclosing-scope stack: when a name
//! resolves in an outer scope, a `capture_*` instruction is emitted into
//! *that scope's* code block - which at runtime executes immediately after
//! the inner lambda's constant is pushed there - and a fresh shared slot is
//! allocated at every intermediate scope so captures propagate level by
//! level.

use std::collections::HashMap;

use log::debug;

use crate::builtins::{find_builtin, hand_rolled_name};
use crate::bytecode::{Constant, Opcode, Program};
use crate::scanner::{Token, TokenKind};
use crate::value::Coarity;
use crate::{Error, MAX_VARIABLES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VariableKind {
    /// Formal parameter or local, addressed relative to the frame index
    Stack,
    /// Captured binding, addressed through the closure's capture array
    Shared,
}

/// Compilation context for one lambda currently being compiled.
#[derive(Debug, Default)]
struct LambdaContext<'src> {
    /// Stack variable name -> slot id
    stack_vars: HashMap<&'src str, u8>,
    /// Shared (captured) variable name -> slot id
    shared_vars: HashMap<&'src str, u8>,
    /// Expected coarities, innermost last; toggles are emitted only when
    /// the top changes
    coarity_stack: Vec<Coarity>,
}

struct Compiler<'src, 'tok> {
    program: Program,
    tokens: &'tok [Token<'src>],
    position: usize,
    lambda_stack: Vec<LambdaContext<'src>>,
    /// Source of unique placeholder offsets for lambda constants, replaced
    /// with real offsets during block concatenation
    lambda_offset_placeholder: usize,
}

/// Compile a token stream into an executable program.
pub fn compile(tokens: &[Token<'_>]) -> Result<Program, Error> {
    Compiler::new(tokens).run()
}

impl<'src, 'tok> Compiler<'src, 'tok> {
    fn new(tokens: &'tok [Token<'src>]) -> Self {
        Compiler {
            program: Program::new(),
            tokens,
            position: 0,
            lambda_stack: Vec::new(),
            lambda_offset_placeholder: 0,
        }
    }

    fn run(mut self) -> Result<Program, Error> {
        self.push_lambda()?;

        // The program is the root lambda's body; its last expression
        // delivers the program's final value.
        self.compile_expression_sequence(Coarity::One, false)?;

        self.program.append_opcode(Opcode::Ret)?;
        self.pop_lambda()?;
        self.program.concat_blocks()?;

        debug!("compiled {} tokens", self.tokens.len());
        Ok(self.program)
    }

    fn current(&self) -> Token<'src> {
        self.tokens
            .get(self.position)
            .copied()
            .unwrap_or(Token {
                text: "",
                kind: TokenKind::Eof,
                is_final: false,
            })
    }

    fn at_eof(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn consume(&mut self, kind: TokenKind) -> Result<(), Error> {
        let token = self.current();
        if token.kind != kind {
            return Err(Error::CompileError(format!(
                "unexpected token {:?} ({:?}), expected {kind:?}",
                token.text, token.kind
            )));
        }
        self.advance();
        Ok(())
    }

    fn emit_constant(&mut self, constant: Constant) -> Result<(), Error> {
        let index = self.program.add_constant(constant)?;
        self.program.append_opcode(Opcode::PushConstant)?;
        self.program.append_byte(index)
    }

    /// Compile a sequence of expressions terminated by eof (and `)` when
    /// `stop_at_rparen` is set). With final coarity `one`, every result but
    /// the last is discarded; with `any`, all results are.
    fn compile_expression_sequence(
        &mut self,
        final_coarity: Coarity,
        stop_at_rparen: bool,
    ) -> Result<(), Error> {
        if final_coarity == Coarity::One && self.current().is_final {
            self.push_coarity(Coarity::One)?;
        } else {
            self.push_coarity(Coarity::Any)?;
        }

        self.compile_expression()?;

        while !self.at_eof() && !(stop_at_rparen && self.current().kind == TokenKind::RightParen) {
            if final_coarity == Coarity::One && self.current().is_final {
                self.set_coarity(Coarity::One)?;
            }

            self.compile_expression()?;
        }

        self.pop_coarity()
    }

    fn compile_expression(&mut self) -> Result<(), Error> {
        match self.current().kind {
            TokenKind::Number => self.compile_number(),
            TokenKind::Identifier => self.compile_identifier(),
            TokenKind::BooleanTrue | TokenKind::BooleanFalse => self.compile_boolean(),
            TokenKind::SingleQuote => {
                self.advance();
                self.compile_external_representation_abbr()
            }
            TokenKind::LeftParen => {
                self.advance();

                match self.current().text {
                    "if" => self.compile_if(),
                    "lambda" => self.compile_lambda(),
                    "set!" => self.compile_set(),
                    "define" => self.compile_define(),
                    "quote" => self.compile_external_representation(),
                    _ => self.compile_procedure_call(),
                }
            }
            kind => Err(Error::CompileError(format!("unexpected token: {kind:?}"))),
        }
    }

    fn compile_number(&mut self) -> Result<(), Error> {
        let text = self.current().text;

        let constant = if text.contains('.') {
            let value: f64 = text.parse().map_err(|_| {
                Error::CompileError(format!("couldn't parse float literal: {text}"))
            })?;
            Constant::Float(value)
        } else {
            let value: i64 = text.parse().map_err(|_| {
                Error::CompileError(format!("couldn't parse integer literal: {text}"))
            })?;
            Constant::Int(value)
        };

        self.emit_constant(constant)?;
        self.advance();
        Ok(())
    }

    fn compile_boolean(&mut self) -> Result<(), Error> {
        let constant = Constant::Bool(self.current().kind == TokenKind::BooleanTrue);
        self.emit_constant(constant)?;
        self.advance();
        Ok(())
    }

    fn compile_identifier(&mut self) -> Result<(), Error> {
        let name = self.current().text;

        if let Some(op) = find_builtin(name) {
            self.emit_constant(Constant::Builtin(op))?;
        } else if let Some(static_name) = hand_rolled_name(name) {
            let index = self.program.push_hand_rolled_procedure(static_name)?;
            self.program.append_opcode(Opcode::PushConstant)?;
            self.program.append_byte(index)?;
        } else {
            let (kind, id) = self.resolve_variable(name)?;

            self.program.append_opcode(match kind {
                VariableKind::Stack => Opcode::PushStackVar,
                VariableKind::Shared => Opcode::PushSharedVar,
            })?;
            self.program.append_byte(id)?;
        }

        self.advance();
        Ok(())
    }

    /// Procedure call: open a frame, evaluate the callee then each argument
    /// left to right (all under coarity one), and call. The `call` opcode
    /// itself executes under the surrounding coarity, which is what lets a
    /// discarded call skip or drop its result.
    fn compile_procedure_call(&mut self) -> Result<(), Error> {
        self.push_coarity(Coarity::One)?;

        self.program.append_opcode(Opcode::PushFrameIndex)?;

        // callee expression
        self.compile_expression()?;

        // argument expressions
        while !self.at_eof() && self.current().kind != TokenKind::RightParen {
            self.compile_expression()?;
        }

        if self.at_eof() {
            return Err(Error::CompileError(
                "unexpected eof in procedure call expression".to_owned(),
            ));
        }

        self.pop_coarity()?;

        self.advance();

        self.program.append_opcode(Opcode::Call)
    }

    fn compile_if(&mut self) -> Result<(), Error> {
        self.advance();

        self.push_coarity(Coarity::One)?;
        self.compile_expression()?;
        self.pop_coarity()?;

        let first_backpatch_index = self.program.prepare_backpatch_jump(Opcode::JumpForwardIfNot)?;

        // consequent
        self.compile_expression()?;

        if self.at_eof() {
            return Err(Error::CompileError(
                "unexpected eof after if consequent".to_owned(),
            ));
        }

        // without an alternate the conditional jump lands here
        if self.current().kind == TokenKind::RightParen {
            self.program.backpatch_jump(first_backpatch_index)?;
            self.advance();
            return Ok(());
        }

        // with an alternate the consequent jumps over it unconditionally
        let second_backpatch_index = self.program.prepare_backpatch_jump(Opcode::JumpForward)?;
        self.program.backpatch_jump(first_backpatch_index)?;

        self.compile_expression()?;

        self.program.backpatch_jump(second_backpatch_index)?;

        self.consume(TokenKind::RightParen)
    }

    fn compile_lambda(&mut self) -> Result<(), Error> {
        self.push_lambda()?;

        self.advance();
        self.consume(TokenKind::LeftParen)?;

        let mut argc: u8 = 0;
        while !self.at_eof() && self.current().kind != TokenKind::RightParen {
            if self.current().kind != TokenKind::Identifier {
                return Err(Error::CompileError(
                    "non-identifier in lambda arg list".to_owned(),
                ));
            }

            if argc == u8::MAX {
                return Err(Error::CapacityError("exceeded lambda arg limit".to_owned()));
            }

            self.add_stack_var(self.current().text)?;
            argc += 1;
            self.advance();
        }
        self.consume(TokenKind::RightParen)?;

        self.program.append_opcode(Opcode::ExpectArgc)?;
        self.program.append_byte(argc)?;

        // the body's last expression is the lambda's return value
        self.compile_expression_sequence(Coarity::One, true)?;
        self.consume(TokenKind::RightParen)?;

        self.program.append_opcode(Opcode::Ret)?;

        self.pop_lambda()
    }

    fn compile_set(&mut self) -> Result<(), Error> {
        self.advance();

        if self.at_eof() {
            return Err(Error::CompileError("unexpected eof after set!".to_owned()));
        }

        if self.current().kind != TokenKind::Identifier {
            return Err(Error::CompileError(
                "expected identifier in set!".to_owned(),
            ));
        }

        let (kind, id) = self.resolve_variable(self.current().text)?;

        self.push_coarity(Coarity::One)?;

        self.advance();
        self.compile_expression()?;

        self.program.append_opcode(match kind {
            VariableKind::Stack => Opcode::SetStackVar,
            VariableKind::Shared => Opcode::SetSharedVar,
        })?;
        self.program.append_byte(id)?;

        self.pop_coarity()?;

        self.consume(TokenKind::RightParen)
    }

    fn compile_define(&mut self) -> Result<(), Error> {
        self.advance();

        if self.at_eof() {
            return Err(Error::CompileError(
                "unexpected eof after define".to_owned(),
            ));
        }

        if self.current().kind != TokenKind::Identifier {
            return Err(Error::CompileError(
                "expected identifier in define".to_owned(),
            ));
        }

        // the name is visible inside the value expression, which is what
        // makes self-recursive closures work
        self.add_stack_var(self.current().text)?;

        self.push_coarity(Coarity::One)?;

        self.advance();
        self.compile_expression()?;

        self.program.append_opcode(Opcode::AddStackVar)?;

        self.pop_coarity()?;

        self.consume(TokenKind::RightParen)
    }

    /// `(quote <datum>)`
    fn compile_external_representation(&mut self) -> Result<(), Error> {
        self.advance();
        self.compile_external_representation_abbr()?;
        self.consume(TokenKind::RightParen)
    }

    /// A datum: atoms become constants (identifiers become symbols, not
    /// variable references), lists compile into chains of `cons`.
    fn compile_external_representation_abbr(&mut self) -> Result<(), Error> {
        match self.current().kind {
            TokenKind::Number => self.compile_number(),
            TokenKind::BooleanTrue | TokenKind::BooleanFalse => self.compile_boolean(),
            TokenKind::Identifier => {
                let symbol = self.program.intern_symbol(self.current().text);
                self.emit_constant(Constant::Symbol(symbol))?;
                self.advance();
                Ok(())
            }
            TokenKind::SingleQuote => {
                // a quote inside a datum denotes the two-element list
                // (quote <datum>), built from two cons cells
                let symbol = self.program.intern_symbol("quote");
                self.emit_constant(Constant::Symbol(symbol))?;

                self.advance();
                self.compile_external_representation_abbr()?;

                self.emit_constant(Constant::EmptyList)?;

                self.program.append_opcode(Opcode::Cons)?;
                self.program.append_opcode(Opcode::Cons)
            }
            TokenKind::LeftParen => {
                self.advance();
                self.compile_pair()
            }
            kind => Err(Error::CompileError(format!(
                "unexpected token for external representation: {kind:?}"
            ))),
        }
    }

    /// The elements of a parenthesized datum, consed up right to left. The
    /// tail is the datum after `.` when present, the empty list otherwise.
    fn compile_pair(&mut self) -> Result<(), Error> {
        self.compile_external_representation_abbr()?;

        if self.at_eof() {
            return Err(Error::CompileError("unexpected eof in pair".to_owned()));
        }

        match self.current().kind {
            TokenKind::Dot => {
                self.advance();
                self.compile_external_representation_abbr()?;
                self.consume(TokenKind::RightParen)?;
            }
            TokenKind::RightParen => {
                self.emit_constant(Constant::EmptyList)?;
                self.advance();
            }
            _ => self.compile_pair()?,
        }

        self.program.append_opcode(Opcode::Cons)
    }

    fn resolve_variable(&mut self, name: &'src str) -> Result<(VariableKind, u8), Error> {
        if self.lambda_stack.is_empty() {
            return Err(Error::CompileError(
                "no lambda context to get variable from".to_owned(),
            ));
        }

        let innermost = self.lambda_stack.len() - 1;
        self.resolve_variable_at(name, innermost)
    }

    /// Resolve a name starting at `scope_depth`, recursing outwards. At
    /// every scope that is not the innermost, a `capture_*` instruction is
    /// emitted into that scope's code block - right after the point where
    /// the inner lambda's constant is pushed - and each intermediate scope
    /// gets its own shared slot for the variable.
    fn resolve_variable_at(
        &mut self,
        name: &'src str,
        scope_depth: usize,
    ) -> Result<(VariableKind, u8), Error> {
        let is_current_scope = scope_depth == self.lambda_stack.len() - 1;

        if let Some(&id) = self.lambda_stack[scope_depth].stack_vars.get(name) {
            if !is_current_scope {
                self.program
                    .append_opcode_at_depth(Opcode::CaptureStackVar, scope_depth)?;
                self.program.append_byte_at_depth(id, scope_depth)?;
            }
            return Ok((VariableKind::Stack, id));
        }

        if let Some(&id) = self.lambda_stack[scope_depth].shared_vars.get(name) {
            if !is_current_scope {
                self.program
                    .append_opcode_at_depth(Opcode::CaptureSharedVar, scope_depth)?;
                self.program.append_byte_at_depth(id, scope_depth)?;
            }
            return Ok((VariableKind::Shared, id));
        }

        if scope_depth == 0 {
            return Err(Error::UnknownIdentifier(name.to_owned()));
        }

        self.resolve_variable_at(name, scope_depth - 1)?;

        let new_id = self.add_shared_var(name, scope_depth)?;

        if !is_current_scope {
            self.program
                .append_opcode_at_depth(Opcode::CaptureSharedVar, scope_depth)?;
            self.program.append_byte_at_depth(new_id, scope_depth)?;
        }

        Ok((VariableKind::Shared, new_id))
    }

    fn add_stack_var(&mut self, name: &'src str) -> Result<(), Error> {
        let context = self
            .lambda_stack
            .last_mut()
            .ok_or_else(|| Error::CompileError("no lambda to add stack var to".to_owned()))?;

        if context.stack_vars.contains_key(name) {
            return Err(Error::CompileError(format!(
                "stack var already exists: {name}"
            )));
        }

        let id = context.stack_vars.len();
        if id >= MAX_VARIABLES {
            return Err(Error::CapacityError("stack var limit exceeded".to_owned()));
        }

        context.stack_vars.insert(name, id as u8);
        Ok(())
    }

    fn add_shared_var(&mut self, name: &'src str, scope_depth: usize) -> Result<u8, Error> {
        let context = self.lambda_stack.get_mut(scope_depth).ok_or_else(|| {
            Error::CompileError("adding shared var to non-existent scope".to_owned())
        })?;

        if context.shared_vars.contains_key(name) {
            return Err(Error::CompileError(format!(
                "shared var already exists: {name}"
            )));
        }

        let id = context.shared_vars.len();
        if id >= MAX_VARIABLES {
            return Err(Error::CapacityError("shared var limit exceeded".to_owned()));
        }

        context.shared_vars.insert(name, id as u8);
        Ok(id as u8)
    }

    fn current_context_mut(&mut self) -> Result<&mut LambdaContext<'src>, Error> {
        self.lambda_stack
            .last_mut()
            .ok_or_else(|| Error::CompileError("no lambda context".to_owned()))
    }

    fn append_coarity_toggle(&mut self, coarity: Coarity) -> Result<(), Error> {
        self.program.append_opcode(match coarity {
            Coarity::Any => Opcode::SetCoarityAny,
            Coarity::One => Opcode::SetCoarityOne,
        })
    }

    /// Push an expected coarity, emitting a toggle only when it differs
    /// from the current one.
    fn push_coarity(&mut self, coarity: Coarity) -> Result<(), Error> {
        let needs_toggle = self.current_context_mut()?.coarity_stack.last() != Some(&coarity);

        if needs_toggle {
            self.append_coarity_toggle(coarity)?;
        }

        self.current_context_mut()?.coarity_stack.push(coarity);
        Ok(())
    }

    /// Pop the expected coarity, re-emitting the restored one when it
    /// differs from the popped value.
    fn pop_coarity(&mut self) -> Result<(), Error> {
        let context = self.current_context_mut()?;

        let old = context.coarity_stack.pop().ok_or_else(|| {
            Error::CompileError("can't pop from empty coarity stack".to_owned())
        })?;

        if let Some(&restored) = context.coarity_stack.last()
            && restored != old
        {
            self.append_coarity_toggle(restored)?;
        }

        Ok(())
    }

    /// Overwrite the coarity stack top, emitting a toggle on change. Used
    /// when an expression sequence reaches its final expression.
    fn set_coarity(&mut self, coarity: Coarity) -> Result<(), Error> {
        let context = self.current_context_mut()?;

        let top = context.coarity_stack.last_mut().ok_or_else(|| {
            Error::CompileError("can't set coarity on empty coarity stack".to_owned())
        })?;

        if *top != coarity {
            *top = coarity;
            self.append_coarity_toggle(coarity)?;
        }

        Ok(())
    }

    /// Open a lambda: allocate its placeholder constant, push the constant
    /// in the enclosing block (except for the root), and open a fresh code
    /// block and scope context.
    fn push_lambda(&mut self) -> Result<(), Error> {
        let constant_id = self.program.add_constant(Constant::Lambda {
            code_offset: self.lambda_offset_placeholder,
        })?;
        self.lambda_offset_placeholder += 1;

        if !self.lambda_stack.is_empty() {
            self.program.append_opcode(Opcode::PushConstant)?;
            self.program.append_byte(constant_id)?;
        }

        self.program.push_lambda(constant_id);
        self.lambda_stack.push(LambdaContext::default());
        Ok(())
    }

    fn pop_lambda(&mut self) -> Result<(), Error> {
        self.lambda_stack
            .pop()
            .ok_or_else(|| Error::CompileError("no lambda context to pop".to_owned()))?;
        self.program.pop_lambda()
    }
}
