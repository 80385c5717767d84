use anyhow::Result;

use crate::ast::{
    BinaryOperator, Expression, FunctionDef, Parameter, Program, Statement, UnaryOperator,
};
use crate::token::{Span, Token, TokenKind};

pub struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    current: Token<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(mut tokens: Vec<Token<'a>>) -> Self {
        if tokens.is_empty() {
            tokens.push(Token::new(TokenKind::EOF, Span::default()));
        }
        let current = tokens[0].clone();
        Self {
            tokens,
            pos: 0,
            current,
        }
    }

    pub fn parse_program(mut self) -> Result<Program> {
        let mut statements = Vec::new();
        while !matches!(self.current.kind, TokenKind::EOF) {
            statements.push(self.parse_statement()?);
        }
        Ok(Program { statements })
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.current.kind {
            TokenKind::Function => self.parse_function_def(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Print => self.parse_print(),
            TokenKind::Local => {
                self.advance();
                self.parse_assignment()
            }
            TokenKind::Identifier(_) => {
                if matches!(self.peek_kind(), TokenKind::LParen) {
                    let name = self.expect_identifier()?;
                    self.expect_lparen()?;
                    let args = self.parse_expression_list(TokenKind::RParen)?;
                    self.expect_rparen()?;
                    Ok(Statement::Call { name, args })
                } else {
                    self.parse_assignment()
                }
            }
            _ => Err(self.error("statement")),
        }
    }

    fn parse_function_def(&mut self) -> Result<Statement> {
        self.advance(); // function
        let name = self.expect_identifier()?;
        self.expect_lparen()?;

        let mut params = Vec::new();
        if !matches!(self.current.kind, TokenKind::RParen) {
            loop {
                let name = self.expect_identifier()?;
                let type_annotation = self.parse_type_annotation()?;
                params.push(Parameter {
                    name,
                    type_annotation,
                });
                if !matches!(self.current.kind, TokenKind::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.expect_rparen()?;
        let return_type = self.parse_type_annotation()?;

        let body = self.parse_block()?;
        self.expect_end()?;

        Ok(Statement::FunctionDef(FunctionDef {
            name,
            params,
            return_type,
            body,
        }))
    }

    fn parse_assignment(&mut self) -> Result<Statement> {
        let name = self.expect_identifier()?;
        let type_annotation = self.parse_type_annotation()?;
        self.expect_assign()?;
        let value = self.parse_expression()?;
        Ok(Statement::Assign {
            name,
            type_annotation,
            value,
        })
    }

    /// `: name` after a variable or parameter; the annotation has no
    /// semantic effect.
    fn parse_type_annotation(&mut self) -> Result<Option<String>> {
        if !matches!(self.current.kind, TokenKind::Colon) {
            return Ok(None);
        }
        self.advance();
        match &self.current.kind {
            TokenKind::Identifier(name) => {
                let name = name.to_string();
                self.advance();
                Ok(Some(name))
            }
            TokenKind::Type => {
                self.advance();
                Ok(Some("type".to_string()))
            }
            _ => Err(self.error("type name")),
        }
    }

    fn parse_if(&mut self) -> Result<Statement> {
        self.advance(); // if or elseif
        let condition = self.parse_expression()?;
        self.expect_then()?;
        let then_body = self.parse_block()?;

        let else_body = match self.current.kind {
            TokenKind::Elseif => {
                // An elseif chain is a nested If in the else position; the
                // trailing `end` belongs to the outermost if.
                vec![self.parse_if()?]
            }
            TokenKind::Else => {
                self.advance();
                let body = self.parse_block()?;
                self.expect_end()?;
                body
            }
            _ => {
                self.expect_end()?;
                Vec::new()
            }
        };

        Ok(Statement::If {
            condition,
            then_body,
            else_body,
        })
    }

    fn parse_while(&mut self) -> Result<Statement> {
        self.advance(); // while
        let condition = self.parse_expression()?;
        self.expect_do()?;
        let body = self.parse_block()?;
        self.expect_end()?;
        Ok(Statement::While { condition, body })
    }

    fn parse_return(&mut self) -> Result<Statement> {
        self.advance(); // return
        if matches!(
            self.current.kind,
            TokenKind::End | TokenKind::Else | TokenKind::Elseif | TokenKind::EOF
        ) {
            return Ok(Statement::Return(None));
        }
        let value = self.parse_expression()?;
        Ok(Statement::Return(Some(value)))
    }

    fn parse_print(&mut self) -> Result<Statement> {
        self.advance(); // print
        self.expect_lparen()?;
        let args = self.parse_expression_list(TokenKind::RParen)?;
        self.expect_rparen()?;
        Ok(Statement::Print(args))
    }

    fn parse_block(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        while !matches!(
            self.current.kind,
            TokenKind::End | TokenKind::Else | TokenKind::Elseif | TokenKind::EOF
        ) {
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_expression_list(&mut self, terminator: TokenKind<'a>) -> Result<Vec<Expression>> {
        let mut args = Vec::new();
        if self.current.kind == terminator {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            if !matches!(self.current.kind, TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        Ok(args)
    }

    fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expression> {
        let mut expr = self.parse_and()?;
        while matches!(self.current.kind, TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            expr = binary(BinaryOperator::Or, expr, right);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expression> {
        let mut expr = self.parse_comparison()?;
        while matches!(self.current.kind, TokenKind::And) {
            self.advance();
            let right = self.parse_comparison()?;
            expr = binary(BinaryOperator::And, expr, right);
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expression> {
        let mut expr = self.parse_additive()?;
        loop {
            let op = match self.current.kind {
                TokenKind::EqEq => BinaryOperator::Eq,
                TokenKind::NotEq => BinaryOperator::Ne,
                TokenKind::Less => BinaryOperator::Lt,
                TokenKind::LessEq => BinaryOperator::Le,
                TokenKind::Greater => BinaryOperator::Gt,
                TokenKind::GreaterEq => BinaryOperator::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expression> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinaryOperator::Add,
                TokenKind::Minus => BinaryOperator::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expression> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinaryOperator::Mul,
                TokenKind::Slash => BinaryOperator::Div,
                TokenKind::Percent => BinaryOperator::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        let op = match self.current.kind {
            TokenKind::Not => UnaryOperator::Not,
            TokenKind::Minus => UnaryOperator::Neg,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expression::UnaryOp {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        match &self.current.kind {
            TokenKind::Integer(value) => {
                let value = *value;
                self.advance();
                Ok(Expression::Integer(value))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expression::Boolean(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expression::Boolean(false))
            }
            TokenKind::String(value) => {
                let value = value.clone();
                self.advance();
                Ok(Expression::String(value))
            }
            TokenKind::Identifier(name) => {
                let name = name.to_string();
                self.advance();
                if matches!(self.current.kind, TokenKind::LParen) {
                    self.advance();
                    let args = self.parse_expression_list(TokenKind::RParen)?;
                    self.expect_rparen()?;
                    Ok(Expression::Call { name, args })
                } else {
                    Ok(Expression::Variable(name))
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            _ => Err(self.error("expression")),
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        if let TokenKind::Identifier(name) = &self.current.kind {
            let name = name.to_string();
            self.advance();
            Ok(name)
        } else {
            Err(self.error("identifier"))
        }
    }

    fn expect_assign(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::Assign) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("="))
        }
    }

    fn expect_lparen(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::LParen) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("("))
        }
    }

    fn expect_rparen(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::RParen) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(")"))
        }
    }

    fn expect_then(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::Then) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("then"))
        }
    }

    fn expect_do(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::Do) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("do"))
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::End) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("end"))
        }
    }

    fn advance(&mut self) -> Token<'a> {
        let next = self
            .tokens
            .get(self.pos + 1)
            .cloned()
            .unwrap_or(Token::new(TokenKind::EOF, Span::default()));
        self.pos = self.pos.saturating_add(1);
        std::mem::replace(&mut self.current, next)
    }

    fn peek_kind(&self) -> TokenKind<'a> {
        self.tokens
            .get(self.pos + 1)
            .map(|token| token.kind.clone())
            .unwrap_or(TokenKind::EOF)
    }

    fn error(&self, expected: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "Expected {expected}, got {:?} at position {}",
            self.current.kind,
            self.current.span.start
        )
    }
}

fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Expression {
    Expression::BinaryOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

pub fn parse_tokens(tokens: Vec<Token<'_>>) -> Result<Program> {
    Parser::new(tokens).parse_program()
}
