use crate::ast::*;
use crate::ir::{BinaryOp, UnaryOp};
use crate::lex::{Lexer, Lookahead};
use crate::lower;
use crate::report::{Diagnostic, ErrorCode, Reporter};
use crate::source::{Keyword, Location, Token, TokenKind};

type TokenIter<'input> = std::iter::Filter<Lexer<'input>, fn(&Result<Token, Diagnostic>) -> bool>;

fn not_separator(item: &Result<Token, Diagnostic>) -> bool {
    !matches!(
        item,
        Ok(t) if matches!(t.kind, TokenKind::Newline | TokenKind::Semicolon)
    )
}

/// Parses MDL source into an AST.
///
/// Diagnostics go through `reporter`; a parse fault aborts the current
/// top-level statement and the file, yielding no root.
pub fn parse(uri: &str, bytes: &[u8], reporter: &Reporter) -> Option<ModuleAst> {
    let lexer = Lexer::new(uri, bytes, reporter);
    let filter: fn(&Result<Token, Diagnostic>) -> bool = not_separator;
    let mut parser = Parser {
        tokens: Lookahead::new(lexer.filter(filter)),
        uri: uri.to_string(),
        reporter,
        last_loc: Location::start_of_file(),
    };
    parser.parse_module().ok()
}

/// Recursive-descent parser over the newline/semicolon-filtered token
/// stream, with 8-token lookahead.
struct Parser<'input> {
    tokens: Lookahead<TokenIter<'input>>,
    uri: String,
    reporter: &'input Reporter,
    last_loc: Location,
}

/// Marker for an already-reported parse abort.
type Fail = ();

impl Parser<'_> {
    fn next(&mut self) -> Result<Option<Token>, Fail> {
        let token = self.tokens.next().map_err(|_| ())?;
        if let Some(t) = &token {
            self.last_loc = t.span.end;
        }
        Ok(token)
    }

    fn peek_kind(&mut self, n: usize) -> Result<Option<TokenKind>, Fail> {
        Ok(self.tokens.peek(n).map_err(|_| ())?.map(|t| t.kind))
    }

    fn peek_is(&mut self, n: usize, kind: TokenKind) -> Result<bool, Fail> {
        Ok(self.peek_kind(n)? == Some(kind))
    }

    /// Consumes the next token when it matches `kind`.
    fn eat(&mut self, kind: TokenKind) -> Result<Option<Token>, Fail> {
        if self.peek_is(0, kind)? {
            self.next()
        } else {
            Ok(None)
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, Fail> {
        match self.next()? {
            Some(t) if t.kind == kind => Ok(t),
            found => Err(self.unexpected(found.as_ref(), &kind.to_string())),
        }
    }

    fn expect_identifier(&mut self) -> Result<Token, Fail> {
        self.expect(TokenKind::Identifier)
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<Token, Fail> {
        self.expect(TokenKind::Keyword(kw))
    }

    /// Reports `UnexpectedToken`/`UnexpectedEOF` and yields the abort marker.
    fn unexpected(&mut self, found: Option<&Token>, expected: &str) -> Fail {
        let diagnostic = match found {
            Some(t) => Diagnostic::new(
                ErrorCode::UnexpectedToken,
                format!("expected {expected}, found `{}`", t.text),
            )
            .at(self.uri.clone(), t.span.start),
            None => Diagnostic::new(
                ErrorCode::UnexpectedEof,
                format!("expected {expected}, found end of file"),
            )
            .at(self.uri.clone(), self.last_loc),
        };
        // the file is abandoned either way; fatality only matters to callers
        // still holding other files
        let _ = self.reporter.report(diagnostic);
    }

    fn invalid_literal(&mut self, message: String, at: Location) -> Fail {
        let _ = self
            .reporter
            .report(Diagnostic::new(ErrorCode::InvalidLiteral, message).at(self.uri.clone(), at));
    }

    // module ::= [commentBlock] "syntax" "=" textLit { statement }
    fn parse_module(&mut self) -> Result<ModuleAst, Fail> {
        let comment = self.parse_comment_block()?;
        self.expect_keyword(Keyword::Syntax)?;
        self.expect(TokenKind::Equal)?;
        let syntax = self.expect(TokenKind::Text)?.text;

        let mut statements = Vec::new();
        while let Some(kind) = self.peek_kind(0)? {
            statements.push(self.parse_statement(kind)?);
        }
        Ok(ModuleAst {
            uri: self.uri.clone(),
            syntax,
            comment,
            statements,
        })
    }

    fn parse_statement(&mut self, kind: TokenKind) -> Result<Statement, Fail> {
        match kind {
            TokenKind::Keyword(Keyword::Module) => self.parse_module_meta(),
            TokenKind::Keyword(Keyword::Import) => self.parse_import(),
            TokenKind::Keyword(Keyword::Annotation) => self.parse_annotation_decl(),
            TokenKind::Keyword(Keyword::Const) => self.parse_const(),
            TokenKind::Keyword(Keyword::Enum) => self.parse_enum(),
            TokenKind::Keyword(Keyword::Struct) => self.parse_struct(),
            TokenKind::Keyword(Keyword::Api) => self.parse_api(),
            TokenKind::Keyword(Keyword::Sdk) => self.parse_sdk(),
            TokenKind::Keyword(Keyword::Impl) => self.parse_impl(),
            _ => {
                let found = self.next()?;
                Err(self.unexpected(found.as_ref(), "a top-level statement"))
            }
        }
    }

    // moduleMeta ::= "module" "=" uid [annotationApplication] [commentBlock]
    fn parse_module_meta(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Module)?.span.start;
        self.expect(TokenKind::Equal)?;
        let uid = self.parse_uid()?;
        let annotations = self.parse_annotation_application()?;
        let comment = self.parse_comment_block()?;
        Ok(Statement::ModuleMeta(ModuleMetaStmt {
            uid,
            annotations,
            comment,
            loc,
        }))
    }

    // import ::= "import" textLit "as" (identifier | ".") [commentBlock]
    fn parse_import(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Import)?.span.start;
        let uri = self.expect(TokenKind::Text)?.text;
        self.expect_keyword(Keyword::As)?;
        let alias = match self.next()? {
            Some(t) if t.kind == TokenKind::Identifier => t.text,
            Some(t) if t.kind == TokenKind::Dot => ".".to_string(),
            found => return Err(self.unexpected(found.as_ref(), "an import alias or `.`")),
        };
        let comment = self.parse_comment_block()?;
        Ok(Statement::Import(ImportStmt {
            uri,
            alias,
            comment,
            loc,
        }))
    }

    // annotationDecl ::= "annotation" identifier "(" scopeList ")"
    //                    typeSpecifier [uid] [commentBlock]
    fn parse_annotation_decl(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Annotation)?.span.start;
        let name = self.expect_identifier()?.text;
        self.expect(TokenKind::ParenOpen)?;
        let mut scopes = Vec::new();
        loop {
            match self.next()? {
                Some(t) if t.kind == TokenKind::ParenClose => break,
                Some(t) if t.kind == TokenKind::Identifier => scopes.push(t.text),
                Some(t) if t.kind == TokenKind::Star => scopes.push("*".to_string()),
                Some(t) if matches!(t.kind, TokenKind::Keyword(_)) => scopes.push(t.text),
                found => return Err(self.unexpected(found.as_ref(), "an annotation scope")),
            }
            if self.eat(TokenKind::Comma)?.is_none() {
                self.expect(TokenKind::ParenClose)?;
                break;
            }
        }
        let ty = self.parse_type_specifier()?;
        let uid = if self.peek_is(0, TokenKind::At)? {
            Some(self.parse_uid()?)
        } else {
            None
        };
        let comment = self.parse_comment_block()?;
        Ok(Statement::AnnotationDecl(AnnotationDeclStmt {
            name,
            scopes,
            ty,
            uid,
            comment,
            loc,
        }))
    }

    // const ::= "const" identifier typeSpecifier "=" value metadata
    fn parse_const(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Const)?.span.start;
        let name = self.expect_identifier()?.text;
        let ty = self.parse_type_specifier()?;
        self.expect(TokenKind::Equal)?;
        let value = self.parse_value()?;
        let metadata = self.parse_metadata()?;
        Ok(Statement::Const(ConstStmt {
            name,
            ty,
            value,
            metadata,
            loc,
        }))
    }

    // enum ::= "enum" identifier "{" [commentBlock] { enumerant } "}" metadata
    fn parse_enum(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Enum)?.span.start;
        let name = self.expect_identifier()?.text;
        self.expect(TokenKind::CurlyOpen)?;
        let _inner_comment = self.parse_comment_block()?;
        let mut enumerants = Vec::new();
        while !self.peek_is(0, TokenKind::CurlyClose)? {
            let token = self.expect_identifier()?;
            let metadata = self.parse_metadata()?;
            enumerants.push(EnumerantAst {
                name: token.text,
                metadata,
                loc: token.span.start,
            });
        }
        self.expect(TokenKind::CurlyClose)?;
        let metadata = self.parse_metadata()?;
        Ok(Statement::Enum(EnumStmt {
            name,
            enumerants,
            metadata,
            loc,
        }))
    }

    // struct ::= "struct" typeName "{" [commentBlock] { field | union } "}" metadata
    fn parse_struct(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Struct)?.span.start;
        let name = self.parse_type_name()?;
        self.expect(TokenKind::CurlyOpen)?;
        let _inner_comment = self.parse_comment_block()?;
        let mut elements = Vec::new();
        while !self.peek_is(0, TokenKind::CurlyClose)? {
            if self.peek_is(0, TokenKind::Keyword(Keyword::Union))? {
                elements.push(StructElement::Union(self.parse_union()?));
            } else {
                elements.push(StructElement::Field(self.parse_field()?));
            }
        }
        self.expect(TokenKind::CurlyClose)?;
        let metadata = self.parse_metadata()?;
        Ok(Statement::Struct(StructStmt {
            name,
            elements,
            metadata,
            loc,
        }))
    }

    // field ::= identifier typeSpecifier ["=" value] metadata
    fn parse_field(&mut self) -> Result<FieldAst, Fail> {
        let token = self.expect_identifier()?;
        let ty = self.parse_type_specifier()?;
        let default = if self.eat(TokenKind::Equal)?.is_some() {
            Some(self.parse_value()?)
        } else {
            None
        };
        let metadata = self.parse_metadata()?;
        Ok(FieldAst {
            name: token.text,
            ty,
            default,
            metadata,
            loc: token.span.start,
        })
    }

    // union ::= "union" [identifier] "{" [commentBlock] { field } "}" metadata
    fn parse_union(&mut self) -> Result<UnionAst, Fail> {
        let loc = self.expect_keyword(Keyword::Union)?.span.start;
        let name = match self.eat(TokenKind::Identifier)? {
            Some(t) => t.text,
            None => String::new(),
        };
        self.expect(TokenKind::CurlyOpen)?;
        let _inner_comment = self.parse_comment_block()?;
        let mut fields = Vec::new();
        while !self.peek_is(0, TokenKind::CurlyClose)? {
            fields.push(self.parse_field()?);
        }
        self.expect(TokenKind::CurlyClose)?;
        let metadata = self.parse_metadata()?;
        Ok(UnionAst {
            name,
            fields,
            metadata,
            loc,
        })
    }

    // api ::= "api" typeName [extends] "{" [commentBlock] { apiMethod } "}" metadata
    fn parse_api(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Api)?.span.start;
        let name = self.parse_type_name()?;
        let extends = self.parse_extends()?;
        self.expect(TokenKind::CurlyOpen)?;
        let _inner_comment = self.parse_comment_block()?;
        let mut methods = Vec::new();
        while !self.peek_is(0, TokenKind::CurlyClose)? {
            let token = self.expect_identifier()?;
            self.expect(TokenKind::ParenOpen)?;
            let input = self.parse_type_specifier()?;
            self.expect(TokenKind::ParenClose)?;
            self.expect_keyword(Keyword::Returns)?;
            self.expect(TokenKind::ParenOpen)?;
            let output = self.parse_type_specifier()?;
            self.expect(TokenKind::ParenClose)?;
            let metadata = self.parse_metadata()?;
            methods.push(ApiMethodAst {
                name: token.text,
                input,
                output,
                metadata,
                loc: token.span.start,
            });
        }
        self.expect(TokenKind::CurlyClose)?;
        let metadata = self.parse_metadata()?;
        Ok(Statement::Api(ApiStmt {
            name,
            extends,
            methods,
            metadata,
            loc,
        }))
    }

    // sdk ::= "sdk" typeName [extends] "{" [commentBlock] { sdkMethod } "}" metadata
    fn parse_sdk(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Sdk)?.span.start;
        let name = self.parse_type_name()?;
        let extends = self.parse_extends()?;
        self.expect(TokenKind::CurlyOpen)?;
        let _inner_comment = self.parse_comment_block()?;
        let mut methods = Vec::new();
        while !self.peek_is(0, TokenKind::CurlyClose)? {
            methods.push(self.parse_sdk_method()?);
        }
        self.expect(TokenKind::CurlyClose)?;
        let metadata = self.parse_metadata()?;
        Ok(Statement::Sdk(SdkStmt {
            name,
            extends,
            methods,
            metadata,
            loc,
        }))
    }

    fn parse_sdk_method(&mut self) -> Result<SdkMethodAst, Fail> {
        let token = self.expect_identifier()?;
        let inputs = self.parse_input_list()?;
        let output = if self.eat(TokenKind::Keyword(Keyword::Returns))?.is_some() {
            self.expect(TokenKind::ParenOpen)?;
            let output = self.parse_type_specifier()?;
            self.expect(TokenKind::ParenClose)?;
            Some(output)
        } else {
            None
        };
        let nothrows = self.eat(TokenKind::Keyword(Keyword::Nothrows))?.is_some();
        let metadata = self.parse_metadata()?;
        Ok(SdkMethodAst {
            name: token.text,
            inputs,
            output,
            nothrows,
            metadata,
            loc: token.span.start,
        })
    }

    // "(" [input {"," input} [","]] ")" where input ::= identifier typeSpecifier
    fn parse_input_list(&mut self) -> Result<Vec<SdkInputAst>, Fail> {
        self.expect(TokenKind::ParenOpen)?;
        let mut inputs = Vec::new();
        while !self.peek_is(0, TokenKind::ParenClose)? {
            let token = self.expect_identifier()?;
            let ty = self.parse_type_specifier()?;
            inputs.push(SdkInputAst {
                name: token.text,
                ty,
                loc: token.span.start,
            });
            if self.eat(TokenKind::Comma)?.is_none() {
                break;
            }
        }
        self.expect(TokenKind::ParenClose)?;
        Ok(inputs)
    }

    // extends ::= "extends" "(" typeSpecifier {"," typeSpecifier} [","] ")"
    fn parse_extends(&mut self) -> Result<Vec<TypeSpecifierAst>, Fail> {
        if self.eat(TokenKind::Keyword(Keyword::Extends))?.is_none() {
            return Ok(Vec::new());
        }
        self.expect(TokenKind::ParenOpen)?;
        let mut extends = Vec::new();
        while !self.peek_is(0, TokenKind::ParenClose)? {
            extends.push(self.parse_type_specifier()?);
            if self.eat(TokenKind::Comma)?.is_none() {
                break;
            }
        }
        self.expect(TokenKind::ParenClose)?;
        Ok(extends)
    }

    // impl ::= "impl" typeName "as" "(" typeList ")"
    //          ["requires" "{" {requirement} "}"] "{" {implMethod} "}" metadata
    fn parse_impl(&mut self) -> Result<Statement, Fail> {
        let loc = self.expect_keyword(Keyword::Impl)?.span.start;
        let name = self.parse_type_name()?;
        self.expect_keyword(Keyword::As)?;
        self.expect(TokenKind::ParenOpen)?;
        let mut as_types = Vec::new();
        while !self.peek_is(0, TokenKind::ParenClose)? {
            as_types.push(self.parse_type_specifier()?);
            if self.eat(TokenKind::Comma)?.is_none() {
                break;
            }
        }
        self.expect(TokenKind::ParenClose)?;

        let mut requirements = Vec::new();
        if self.eat(TokenKind::Keyword(Keyword::Requires))?.is_some() {
            self.expect(TokenKind::CurlyOpen)?;
            while !self.peek_is(0, TokenKind::CurlyClose)? {
                let token = self.expect_identifier()?;
                let ty = self.parse_type_specifier()?;
                let _comment = self.parse_comment_block()?;
                requirements.push(SdkInputAst {
                    name: token.text,
                    ty,
                    loc: token.span.start,
                });
            }
            self.expect(TokenKind::CurlyClose)?;
        }

        self.expect(TokenKind::CurlyOpen)?;
        let _inner_comment = self.parse_comment_block()?;
        let mut methods = Vec::new();
        while !self.peek_is(0, TokenKind::CurlyClose)? {
            methods.push(self.parse_impl_method()?);
        }
        self.expect(TokenKind::CurlyClose)?;
        let metadata = self.parse_metadata()?;
        Ok(Statement::Impl(ImplStmt {
            name,
            as_types,
            requirements,
            methods,
            metadata,
            loc,
        }))
    }

    /// Signature of an impl method; the body is consumed as a balanced token
    /// tree and not retained.
    fn parse_impl_method(&mut self) -> Result<ImplMethodAst, Fail> {
        let token = self.expect_identifier()?;
        let inputs = self.parse_input_list()?;
        let output = if self.eat(TokenKind::Keyword(Keyword::Returns))?.is_some() {
            self.expect(TokenKind::ParenOpen)?;
            let output = self.parse_type_specifier()?;
            self.expect(TokenKind::ParenClose)?;
            Some(output)
        } else {
            None
        };
        let nothrows = self.eat(TokenKind::Keyword(Keyword::Nothrows))?.is_some();
        self.expect(TokenKind::CurlyOpen)?;
        let mut depth = 1usize;
        while depth > 0 {
            match self.next()? {
                Some(t) if t.kind == TokenKind::CurlyOpen => depth += 1,
                Some(t) if t.kind == TokenKind::CurlyClose => depth -= 1,
                Some(_) => {}
                None => return Err(self.unexpected(None, "`}`")),
            }
        }
        Ok(ImplMethodAst {
            name: token.text,
            inputs,
            output,
            nothrows,
            loc: token.span.start,
        })
    }

    // typeSpecifier ::= ":" [identifier "."] typeName
    fn parse_type_specifier(&mut self) -> Result<TypeSpecifierAst, Fail> {
        let loc = self.expect(TokenKind::Colon)?.span.start;
        let qualifier = if self.peek_is(0, TokenKind::Identifier)?
            && self.peek_is(1, TokenKind::Dot)?
        {
            let q = self.expect_identifier()?.text;
            self.expect(TokenKind::Dot)?;
            Some(q)
        } else {
            None
        };
        let name = self.parse_type_name()?;
        Ok(TypeSpecifierAst {
            qualifier,
            name,
            loc,
        })
    }

    // typeName ::= identifier ["<" typeSpecifier {"," typeSpecifier} [","] ">"]
    fn parse_type_name(&mut self) -> Result<TypeNameAst, Fail> {
        let name = self.expect_identifier()?.text;
        let mut parameters = Vec::new();
        if self.eat(TokenKind::AngleOpen)?.is_some() {
            while !self.peek_is(0, TokenKind::AngleClose)? {
                parameters.push(self.parse_type_specifier()?);
                if self.eat(TokenKind::Comma)?.is_none() {
                    break;
                }
            }
            self.expect(TokenKind::AngleClose)?;
        }
        Ok(TypeNameAst { name, parameters })
    }

    // value ::= unary | binary | literal | identifier
    fn parse_value(&mut self) -> Result<ValueAst, Fail> {
        let Some(kind) = self.peek_kind(0)? else {
            return Err(self.unexpected(None, "a value"));
        };
        match kind {
            TokenKind::Plus | TokenKind::Minus | TokenKind::Bang => {
                let token = self.next()?.expect("peeked");
                let op = match token.kind {
                    TokenKind::Plus => UnaryOp::Pos,
                    TokenKind::Minus => UnaryOp::Neg,
                    _ => UnaryOp::Not,
                };
                let operand = Box::new(self.parse_value()?);
                Ok(ValueAst::Unary {
                    op,
                    operand,
                    loc: token.span.start,
                })
            }
            TokenKind::ParenOpen => self.parse_binary_value(),
            TokenKind::Keyword(Keyword::True) | TokenKind::Keyword(Keyword::False) => {
                let token = self.next()?.expect("peeked");
                Ok(ValueAst::Bool {
                    value: token.is_keyword(Keyword::True),
                    loc: token.span.start,
                })
            }
            TokenKind::Integer => {
                let token = self.next()?.expect("peeked");
                Ok(ValueAst::Int {
                    text: token.text,
                    loc: token.span.start,
                })
            }
            TokenKind::Float => {
                let token = self.next()?.expect("peeked");
                Ok(ValueAst::Float {
                    text: token.text,
                    loc: token.span.start,
                })
            }
            TokenKind::Text => {
                let token = self.next()?.expect("peeked");
                Ok(ValueAst::Text {
                    value: token.text,
                    loc: token.span.start,
                })
            }
            TokenKind::Prose => {
                let token = self.next()?.expect("peeked");
                Ok(ValueAst::Prose {
                    value: token.text,
                    loc: token.span.start,
                })
            }
            TokenKind::Data => {
                let token = self.next()?.expect("peeked");
                Ok(ValueAst::Data {
                    text: token.text,
                    loc: token.span.start,
                })
            }
            TokenKind::SquareOpen => {
                let loc = self.next()?.expect("peeked").span.start;
                let mut items = Vec::new();
                while !self.peek_is(0, TokenKind::SquareClose)? {
                    items.push(self.parse_value()?);
                    if self.eat(TokenKind::Comma)?.is_none() {
                        break;
                    }
                }
                self.expect(TokenKind::SquareClose)?;
                Ok(ValueAst::List { items, loc })
            }
            TokenKind::CurlyOpen => {
                let loc = self.next()?.expect("peeked").span.start;
                let mut fields = Vec::new();
                while !self.peek_is(0, TokenKind::CurlyClose)? {
                    let token = self.expect_identifier()?;
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_value()?;
                    fields.push((token.text, value, token.span.start));
                    if self.eat(TokenKind::Comma)?.is_none() {
                        break;
                    }
                }
                self.expect(TokenKind::CurlyClose)?;
                Ok(ValueAst::Struct { fields, loc })
            }
            TokenKind::Identifier => {
                let token = self.next()?.expect("peeked");
                let loc = token.span.start;
                let mut names = vec![token.text];
                while self.peek_is(0, TokenKind::Dot)? {
                    self.expect(TokenKind::Dot)?;
                    names.push(self.expect_identifier()?.text);
                }
                Ok(ValueAst::Identifier { names, loc })
            }
            _ => {
                let found = self.next()?;
                Err(self.unexpected(found.as_ref(), "a value"))
            }
        }
    }

    // binary ::= "(" value op value ")"
    fn parse_binary_value(&mut self) -> Result<ValueAst, Fail> {
        let loc = self.expect(TokenKind::ParenOpen)?.span.start;
        let left = Box::new(self.parse_value()?);
        let op = match self.next()? {
            Some(t) => match t.kind {
                TokenKind::EqualEqual => BinaryOp::Eq,
                TokenKind::BangEqual => BinaryOp::Ne,
                TokenKind::AngleOpen => BinaryOp::Lt,
                TokenKind::LessEqual => BinaryOp::Le,
                TokenKind::AngleClose => BinaryOp::Gt,
                TokenKind::GreaterEqual => BinaryOp::Ge,
                TokenKind::Ampersand => BinaryOp::BitAnd,
                TokenKind::Pipe => BinaryOp::BitOr,
                TokenKind::Caret => BinaryOp::BitXor,
                TokenKind::AmpAmp => BinaryOp::And,
                TokenKind::PipePipe => BinaryOp::Or,
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Err(self.unexpected(Some(&t), "a binary operator")),
            },
            None => return Err(self.unexpected(None, "a binary operator")),
        };
        let right = Box::new(self.parse_value()?);
        self.expect(TokenKind::ParenClose)?;
        Ok(ValueAst::Binary {
            op,
            left,
            right,
            loc,
        })
    }

    // metadata ::= [uid] [annotationApplication] [commentBlock]
    fn parse_metadata(&mut self) -> Result<Metadata, Fail> {
        let uid = if self.peek_is(0, TokenKind::At)? {
            Some(self.parse_uid()?)
        } else {
            None
        };
        let annotations = self.parse_annotation_application()?;
        let comment = self.parse_comment_block()?;
        Ok(Metadata {
            uid,
            annotations,
            comment,
        })
    }

    // uid ::= "@" intLit
    fn parse_uid(&mut self) -> Result<u64, Fail> {
        self.expect(TokenKind::At)?;
        let token = self.expect(TokenKind::Integer)?;
        let at = token.span.start;
        match lower::parse_integer_literal(&token.text).and_then(|v| u64::try_from(v).ok()) {
            Some(uid) => Ok(uid),
            None => Err(self.invalid_literal(
                format!("uid `{}` does not fit an unsigned 64-bit integer", token.text),
                at,
            )),
        }
    }

    // annotationApplication ::= "$" "(" instance {"," instance} [","] ")"
    // instance ::= [identifier "."] identifier "(" value ")"
    fn parse_annotation_application(&mut self) -> Result<Vec<AnnotationApplicationAst>, Fail> {
        if self.eat(TokenKind::Dollar)?.is_none() {
            return Ok(Vec::new());
        }
        self.expect(TokenKind::ParenOpen)?;
        let mut annotations = Vec::new();
        while !self.peek_is(0, TokenKind::ParenClose)? {
            let first = self.expect_identifier()?;
            let loc = first.span.start;
            let (qualifier, name) = if self.eat(TokenKind::Dot)?.is_some() {
                (Some(first.text), self.expect_identifier()?.text)
            } else {
                (None, first.text)
            };
            self.expect(TokenKind::ParenOpen)?;
            let value = self.parse_value()?;
            self.expect(TokenKind::ParenClose)?;
            annotations.push(AnnotationApplicationAst {
                qualifier,
                name,
                value,
                loc,
            });
            if self.eat(TokenKind::Comma)?.is_none() {
                break;
            }
        }
        self.expect(TokenKind::ParenClose)?;
        Ok(annotations)
    }

    fn parse_comment_block(&mut self) -> Result<Option<String>, Fail> {
        let mut lines: Vec<String> = Vec::new();
        loop {
            match self.peek_kind(0)? {
                Some(TokenKind::CommentLine) | Some(TokenKind::CommentBlock) => {
                    let token = self.next()?.expect("peeked");
                    lines.push(token.text.trim().to_string());
                }
                _ => break,
            }
        }
        if lines.is_empty() {
            Ok(None)
        } else {
            Ok(Some(lines.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> ModuleAst {
        let reporter = Reporter::new();
        let ast = parse("/test.mgdl", src.as_bytes(), &reporter);
        assert!(
            reporter.is_empty(),
            "unexpected diagnostics: {:?}",
            reporter.diagnostics()
        );
        ast.unwrap()
    }

    #[test]
    fn test_parse_empty_module() {
        let ast = parse_ok("syntax = \"microglot0\"\n");
        assert_eq!(ast.syntax, "microglot0");
        assert!(ast.statements.is_empty());
    }

    #[test]
    fn test_parse_module_meta_and_import() {
        let ast = parse_ok(
            "syntax = \"microglot0\"\nmodule = @10\nimport \"/other.mgdl\" as other\nimport \"/dot.mgdl\" as .\n",
        );
        assert_eq!(ast.statements.len(), 3);
        let Statement::ModuleMeta(meta) = &ast.statements[0] else {
            panic!("expected module meta");
        };
        assert_eq!(meta.uid, 10);
        let Statement::Import(import) = &ast.statements[2] else {
            panic!("expected import");
        };
        assert_eq!(import.alias, ".");
    }

    #[test]
    fn test_parse_const_with_expression() {
        let ast = parse_ok("syntax = \"microglot0\"\nconst Foo :Int32 = (1 + 2)\n");
        let Statement::Const(c) = &ast.statements[0] else {
            panic!("expected const");
        };
        assert_eq!(c.name, "Foo");
        assert_eq!(c.ty.name.name, "Int32");
        let ValueAst::Binary { op, .. } = &c.value else {
            panic!("expected binary value");
        };
        assert_eq!(*op, BinaryOp::Add);
    }

    #[test]
    fn test_parse_struct_with_union_and_defaults() {
        let ast = parse_ok(
            "syntax = \"microglot0\"\n\
             struct Pair<:Text> {\n\
               // the first element\n\
               first :Text = \"none\" @2\n\
               union which {\n\
                 left :Int32\n\
                 right :Int32\n\
               }\n\
             } @7\n",
        );
        let Statement::Struct(st) = &ast.statements[0] else {
            panic!("expected struct");
        };
        assert_eq!(st.name.name, "Pair");
        assert_eq!(st.name.parameters.len(), 1);
        assert_eq!(st.metadata.uid, Some(7));
        let StructElement::Field(field) = &st.elements[0] else {
            panic!("expected field");
        };
        assert_eq!(field.name, "first");
        assert_eq!(field.metadata.uid, Some(2));
        assert!(field.default.is_some());
        assert_eq!(field.metadata.comment, None);
        let StructElement::Union(union) = &st.elements[1] else {
            panic!("expected union");
        };
        assert_eq!(union.name, "which");
        assert_eq!(union.fields.len(), 2);
    }

    #[test]
    fn test_parse_enum() {
        let ast = parse_ok(
            "syntax = \"microglot0\"\nenum Color {\n  Red @1\n  Green\n  Blue\n}\n",
        );
        let Statement::Enum(en) = &ast.statements[0] else {
            panic!("expected enum");
        };
        assert_eq!(en.enumerants.len(), 3);
        assert_eq!(en.enumerants[0].metadata.uid, Some(1));
    }

    #[test]
    fn test_parse_api_and_sdk() {
        let ast = parse_ok(
            "syntax = \"microglot0\"\n\
             api Greeter extends (:Base) {\n\
               Greet(:Request) returns (:Response)\n\
             }\n\
             sdk Tool {\n\
               Run(name :Text, count :UInt32) returns (:Text) nothrows\n\
               Fire(target :Text)\n\
             }\n",
        );
        let Statement::Api(api) = &ast.statements[0] else {
            panic!("expected api");
        };
        assert_eq!(api.extends.len(), 1);
        assert_eq!(api.methods[0].name, "Greet");
        let Statement::Sdk(sdk) = &ast.statements[1] else {
            panic!("expected sdk");
        };
        assert_eq!(sdk.methods[0].inputs.len(), 2);
        assert!(sdk.methods[0].nothrows);
        assert!(sdk.methods[0].output.is_some());
        assert!(sdk.methods[1].output.is_none());
        assert!(!sdk.methods[1].nothrows);
    }

    #[test]
    fn test_parse_annotation_decl_and_application() {
        let ast = parse_ok(
            "syntax = \"microglot0\"\n\
             annotation Version(module, struct, *) :Text @11\n\
             struct Thing {\n\
               one :Bool\n\
             } $(Version(\"1.0\"))\n",
        );
        let Statement::AnnotationDecl(decl) = &ast.statements[0] else {
            panic!("expected annotation decl");
        };
        assert_eq!(decl.scopes, vec!["module", "struct", "*"]);
        assert_eq!(decl.uid, Some(11));
        let Statement::Struct(st) = &ast.statements[1] else {
            panic!("expected struct");
        };
        assert_eq!(st.metadata.annotations.len(), 1);
        assert_eq!(st.metadata.annotations[0].name, "Version");
    }

    #[test]
    fn test_parse_impl_with_skipped_bodies() {
        let ast = parse_ok(
            "syntax = \"microglot0\"\n\
             impl Cache as (:Store) requires {\n\
               clock :Clock\n\
             } {\n\
               Get(key :Text) returns (:Text) {\n\
                 var x :Text\n\
                 if (1 == 1) { return x }\n\
               }\n\
             }\n",
        );
        let Statement::Impl(im) = &ast.statements[0] else {
            panic!("expected impl");
        };
        assert_eq!(im.as_types.len(), 1);
        assert_eq!(im.requirements.len(), 1);
        assert_eq!(im.methods.len(), 1);
        assert_eq!(im.methods[0].name, "Get");
    }

    #[test]
    fn test_parse_list_and_struct_literals() {
        let ast = parse_ok(
            "syntax = \"microglot0\"\n\
             const Values :List<:Int32> = [1, 2, 3,]\n\
             const Point :Coords = { x: 1, y: 2 }\n",
        );
        let Statement::Const(c) = &ast.statements[0] else {
            panic!("expected const");
        };
        let ValueAst::List { items, .. } = &c.value else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_parse_unexpected_token_aborts() {
        let reporter = Reporter::new();
        let ast = parse(
            "/test.mgdl",
            b"syntax = \"microglot0\"\nconst = :Int32\n",
            &reporter,
        );
        assert!(ast.is_none());
        let diags = reporter.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, ErrorCode::UnexpectedToken);
    }

    #[test]
    fn test_parse_eof_reports() {
        let reporter = Reporter::new();
        let ast = parse("/test.mgdl", b"syntax = \"microglot0\"\nstruct Foo {", &reporter);
        assert!(ast.is_none());
        assert_eq!(reporter.diagnostics()[0].code, ErrorCode::UnexpectedEof);
    }
}
