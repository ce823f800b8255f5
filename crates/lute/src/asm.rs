//! Textual assembler and disassembler.
//!
//! The format is line-oriented, whitespace-tolerant, and comment-aware
//! (`#` to end of line, outside string literals). Sections appear in a
//! fixed order:
//!
//! ```text
//! program: [±flag ...]
//!   loads: / names: / globals: / constants:
//!   function: NAME STACK PARAMS KWPARAMS [±varargs] [±kwargs]
//!     locals: / cells: / freevars: / catches: / defers: / code:
//! ```
//!
//! The first `function:` is the toplevel. Constants carry a type tag
//! (`int`, `float`, `bigint`, `string`, `bytes`); catch and defer
//! descriptors are `PC0 PC1 STARTPC` triples. Assembly validates opcode
//! argument presence, jump targets, descriptor ranges, and `cells:`
//! membership in `locals:`; no partial program is ever returned.
//! [`disassemble`] emits the same grammar, so a program round-trips
//! exactly (positions excepted, which the text format does not carry).

use num_bigint::BigInt;

use crate::error::{Error, Result};
use crate::opcode::{self, Opcode};
use crate::program::{Binding, Constant, DeferDesc, Funcode, Program};
use crate::value::{quote_bytes, quote_string};

/// Parse a textual program.
pub fn assemble(text: &str) -> Result<Program> {
    let mut p = Parser::new(text);

    let recursion = p.program_header()?;
    let loads = p.name_section("loads")?;
    let names = p.name_section("names")?;
    let globals = p.name_section("globals")?;
    let constants = p.constants_section()?;

    let mut functions = Vec::new();
    while p.at_function() {
        functions.push(p.function()?);
    }
    if let Some((num, text)) = p.peek() {
        return Err(asm_err("program", num, &format!("unexpected line: {}", text)));
    }
    if functions.is_empty() {
        return Err(Error::Asm(
            "program: expected at least one function".to_string(),
        ));
    }

    let program = Program {
        recursion,
        loads: loads.into_iter().map(Binding::new).collect(),
        names,
        globals: globals.into_iter().map(Binding::new).collect(),
        constants,
        functions,
    };
    program.validate().map_err(|e| match e {
        Error::Internal(msg) => Error::Asm(msg),
        other => other,
    })?;
    Ok(program)
}

/// Render a program in the textual format.
///
/// Fails only if the program itself is malformed; the output always
/// assembles back to an equal program (minus line tables).
pub fn disassemble(program: &Program) -> Result<String> {
    program.validate()?;
    let mut out = String::new();
    out.push_str("program:");
    if program.recursion {
        out.push_str(" +recursion");
    }
    out.push('\n');

    write_names(&mut out, "loads", program.loads.iter().map(|b| b.name.as_str()));
    write_names(&mut out, "names", program.names.iter().map(String::as_str));
    write_names(&mut out, "globals", program.globals.iter().map(|b| b.name.as_str()));
    if !program.constants.is_empty() {
        out.push_str("  constants:\n");
        for c in &program.constants {
            out.push_str("    ");
            match c {
                Constant::Int(i) => out.push_str(&format!("int {}", i)),
                Constant::BigInt(b) => out.push_str(&format!("bigint {}", b)),
                Constant::Float(f) => out.push_str(&format!("float {:?}", f)),
                Constant::Str(s) => out.push_str(&format!("string {}", quote_string(s))),
                Constant::Bytes(b) => out.push_str(&format!("bytes {}", quote_bytes(b))),
            }
            out.push('\n');
        }
    }

    for f in &program.functions {
        out.push_str(&format!(
            "  function: {} {} {} {}",
            f.name, f.max_stack, f.num_params, f.num_kwonly_params
        ));
        if f.has_varargs {
            out.push_str(" +varargs");
        }
        if f.has_kwargs {
            out.push_str(" +kwargs");
        }
        out.push('\n');

        write_names2(&mut out, "locals", f.locals.iter().map(|b| b.name.as_str()));
        write_names2(
            &mut out,
            "cells",
            f.cells.iter().map(|&i| f.locals[i as usize].name.as_str()),
        );
        write_names2(&mut out, "freevars", f.freevars.iter().map(|b| b.name.as_str()));
        for (keyword, descs) in [("catches", &f.catches), ("defers", &f.defers)] {
            if !descs.is_empty() {
                out.push_str(&format!("    {}:\n", keyword));
                for d in descs.iter() {
                    out.push_str(&format!("      {} {} {}\n", d.pc0, d.pc1, d.start_pc));
                }
            }
        }

        out.push_str("    code:\n");
        let mut pc = 0usize;
        while pc < f.code.len() {
            let (op, arg, next) = opcode::decode(&f.code, pc)?;
            if op.has_arg() {
                out.push_str(&format!("      {} {}\n", op.mnemonic(), arg));
            } else {
                out.push_str(&format!("      {}\n", op.mnemonic()));
            }
            pc = next;
        }
    }
    Ok(out)
}

fn write_names<'a>(out: &mut String, keyword: &str, names: impl Iterator<Item = &'a str>) {
    let names: Vec<&str> = names.collect();
    if names.is_empty() {
        return;
    }
    out.push_str(&format!("  {}:\n", keyword));
    for n in names {
        out.push_str(&format!("    {}\n", n));
    }
}

fn write_names2<'a>(out: &mut String, keyword: &str, names: impl Iterator<Item = &'a str>) {
    let names: Vec<&str> = names.collect();
    if names.is_empty() {
        return;
    }
    out.push_str(&format!("    {}:\n", keyword));
    for n in names {
        out.push_str(&format!("      {}\n", n));
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

fn asm_err(section: &str, line: usize, msg: &str) -> Error {
    Error::Asm(format!("{} (line {}): {}", section, line, msg))
}

const SECTION_KEYWORDS: &[&str] = &[
    "loads:", "names:", "globals:", "constants:", "locals:", "cells:", "freevars:", "catches:",
    "defers:", "code:",
];

struct Parser {
    /// (1-based line number, comment-stripped trimmed text), blanks removed.
    lines: Vec<(usize, String)>,
    pos: usize,
}

impl Parser {
    fn new(text: &str) -> Self {
        let lines = text
            .lines()
            .enumerate()
            .filter_map(|(i, raw)| {
                let stripped = strip_comment(raw).trim().to_string();
                if stripped.is_empty() {
                    None
                } else {
                    Some((i + 1, stripped))
                }
            })
            .collect();
        Parser { lines, pos: 0 }
    }

    fn peek(&self) -> Option<(usize, &str)> {
        self.lines.get(self.pos).map(|(n, s)| (*n, s.as_str()))
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn is_header(text: &str) -> bool {
        SECTION_KEYWORDS.contains(&text)
            || text.starts_with("function:")
            || text.starts_with("program:")
    }

    fn at_function(&self) -> bool {
        matches!(self.peek(), Some((_, t)) if t.starts_with("function:"))
    }

    /// `program:` with optional `±recursion` flags.
    fn program_header(&mut self) -> Result<bool> {
        let (num, text) = match self.peek() {
            Some(l) => l,
            None => return Err(Error::Asm("program: empty input".to_string())),
        };
        let rest = match text.strip_prefix("program:") {
            Some(r) => r.to_string(),
            None => return Err(asm_err("program", num, "expected program: header")),
        };
        self.advance();
        let mut recursion = false;
        for tok in rest.split_whitespace() {
            match tok {
                "+recursion" => recursion = true,
                "-recursion" => recursion = false,
                other => {
                    return Err(asm_err(
                        "program",
                        num,
                        &format!("unknown flag {}", other),
                    ));
                }
            }
        }
        Ok(recursion)
    }

    /// An optional section of one name per line.
    fn name_section(&mut self, keyword: &str) -> Result<Vec<String>> {
        if !self.enter_section(keyword) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        while let Some((num, text)) = self.peek() {
            if Self::is_header(text) {
                break;
            }
            if text.split_whitespace().count() != 1 {
                return Err(asm_err(keyword, num, "expected a single name per line"));
            }
            out.push(text.to_string());
            self.advance();
        }
        Ok(out)
    }

    fn enter_section(&mut self, keyword: &str) -> bool {
        let header = format!("{}:", keyword);
        if matches!(self.peek(), Some((_, t)) if t == header) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn constants_section(&mut self) -> Result<Vec<Constant>> {
        if !self.enter_section("constants") {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        while let Some((num, text)) = self.peek() {
            if Self::is_header(text) {
                break;
            }
            let (tag, rest) = match text.split_once(char::is_whitespace) {
                Some((t, r)) => (t, r.trim()),
                None => return Err(asm_err("constants", num, "expected TYPE VALUE")),
            };
            let c = match tag {
                "int" => Constant::Int(rest.parse::<i64>().map_err(|_| {
                    asm_err("constants", num, &format!("invalid int literal {}", rest))
                })?),
                "bigint" => Constant::BigInt(rest.parse::<BigInt>().map_err(|_| {
                    asm_err("constants", num, &format!("invalid bigint literal {}", rest))
                })?),
                "float" => Constant::Float(rest.parse::<f64>().map_err(|_| {
                    asm_err("constants", num, &format!("invalid float literal {}", rest))
                })?),
                "string" => Constant::Str(
                    unquote_string(rest).map_err(|m| asm_err("constants", num, &m))?,
                ),
                "bytes" => Constant::Bytes(
                    unquote_bytes(rest).map_err(|m| asm_err("constants", num, &m))?,
                ),
                other => {
                    return Err(asm_err(
                        "constants",
                        num,
                        &format!("unknown constant type {}", other),
                    ));
                }
            };
            out.push(c);
            self.advance();
        }
        Ok(out)
    }

    fn function(&mut self) -> Result<Funcode> {
        let (num, rest) = match self.peek() {
            Some((num, text)) => (
                num,
                text.strip_prefix("function:").unwrap_or("").to_string(),
            ),
            None => return Err(Error::Asm("function: missing header".to_string())),
        };
        self.advance();

        let toks: Vec<&str> = rest.split_whitespace().collect();
        if toks.len() < 4 {
            return Err(asm_err(
                "function",
                num,
                "expected NAME STACK PARAMS KWPARAMS",
            ));
        }
        let name = toks[0].to_string();
        let nums: Vec<u32> = toks[1..4]
            .iter()
            .map(|t| {
                t.parse::<u32>()
                    .map_err(|_| asm_err("function", num, &format!("invalid number {}", t)))
            })
            .collect::<Result<_>>()?;
        let (max_stack, num_params, num_kwonly_params) = (nums[0], nums[1], nums[2]);
        let mut has_varargs = false;
        let mut has_kwargs = false;
        for t in &toks[4..] {
            match *t {
                "+varargs" => has_varargs = true,
                "-varargs" => has_varargs = false,
                "+kwargs" => has_kwargs = true,
                "-kwargs" => has_kwargs = false,
                other => {
                    return Err(asm_err(
                        "function",
                        num,
                        &format!("unknown function flag {}", other),
                    ));
                }
            }
        }

        let locals = self.name_section("locals")?;
        let cell_names = self.name_section("cells")?;
        let freevars = self.name_section("freevars")?;
        let catches = self.descriptor_section("catches")?;
        let defers = self.descriptor_section("defers")?;

        let mut cells = Vec::with_capacity(cell_names.len());
        for cn in &cell_names {
            match locals.iter().position(|l| l == cn) {
                Some(i) => cells.push(i as u32),
                None => {
                    return Err(asm_err(
                        "cells",
                        num,
                        &format!("cell {} does not name a local", cn),
                    ));
                }
            }
        }

        let code = self.code_section(num)?;

        Ok(Funcode {
            name,
            max_stack,
            num_params,
            num_kwonly_params,
            has_varargs,
            has_kwargs,
            locals: locals.into_iter().map(Binding::new).collect(),
            cells,
            freevars: freevars.into_iter().map(Binding::new).collect(),
            catches,
            defers,
            code,
            line_table: Vec::new(),
        })
    }

    fn descriptor_section(&mut self, keyword: &str) -> Result<Vec<DeferDesc>> {
        if !self.enter_section(keyword) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        while let Some((num, text)) = self.peek() {
            if Self::is_header(text) {
                break;
            }
            let nums: Vec<u32> = text
                .split_whitespace()
                .map(|t| {
                    t.parse::<u32>()
                        .map_err(|_| asm_err(keyword, num, &format!("invalid number {}", t)))
                })
                .collect::<Result<_>>()?;
            if nums.len() != 3 {
                return Err(asm_err(keyword, num, "expected PC0 PC1 STARTPC"));
            }
            out.push(DeferDesc {
                pc0: nums[0],
                pc1: nums[1],
                start_pc: nums[2],
            });
            self.advance();
        }
        Ok(out)
    }

    fn code_section(&mut self, fn_line: usize) -> Result<Vec<u8>> {
        if !self.enter_section("code") {
            return Err(asm_err("code", fn_line, "function has no code: section"));
        }
        let mut code = Vec::new();
        while let Some((num, text)) = self.peek() {
            if Self::is_header(text) {
                break;
            }
            let mut toks = text.split_whitespace();
            // Blank lines were filtered out, so a first token exists.
            let mnemonic = toks.next().unwrap_or_default();
            let op = Opcode::from_mnemonic(mnemonic).ok_or_else(|| {
                asm_err("code", num, &format!("unknown opcode {}", mnemonic))
            })?;
            let arg = toks.next();
            if toks.next().is_some() {
                return Err(asm_err("code", num, "too many operands"));
            }
            match (op.has_arg(), arg) {
                (true, Some(a)) => {
                    let a = a.parse::<u32>().map_err(|_| {
                        asm_err("code", num, &format!("invalid argument {}", a))
                    })?;
                    code.push(op as u8);
                    opcode::encode_varint(&mut code, a);
                }
                (true, None) => {
                    return Err(asm_err(
                        "code",
                        num,
                        &format!("opcode {} requires an argument", mnemonic),
                    ));
                }
                (false, Some(_)) => {
                    return Err(asm_err(
                        "code",
                        num,
                        &format!("opcode {} takes no argument", mnemonic),
                    ));
                }
                (false, None) => code.push(op as u8),
            }
            self.advance();
        }
        Ok(code)
    }
}

/// Cut a `#` comment, honouring double-quoted strings with escapes.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

// ---------------------------------------------------------------------------
// String literals
// ---------------------------------------------------------------------------

/// One decoded element of a quoted literal. `\xNN` stays a raw byte so
/// bytes literals round-trip exactly; string literals widen it to a char.
enum Piece {
    Char(char),
    Byte(u8),
}

fn unquote_string(raw: &str) -> std::result::Result<String, String> {
    let mut out = String::new();
    unquote(raw, |p| match p {
        Piece::Char(c) => out.push(c),
        Piece::Byte(b) => out.push(b as char),
    })?;
    Ok(out)
}

fn unquote_bytes(raw: &str) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::new();
    unquote(raw, |p| match p {
        Piece::Char(c) => {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
        Piece::Byte(b) => out.push(b),
    })?;
    Ok(out)
}

/// Decode a double-quoted literal with standard escapes, feeding each
/// decoded element to `emit`.
fn unquote<F: FnMut(Piece)>(raw: &str, mut emit: F) -> std::result::Result<(), String> {
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| format!("expected a double-quoted literal, got {}", raw))?;
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '"' {
            return Err("unescaped quote inside literal".to_string());
        }
        if c != '\\' {
            emit(Piece::Char(c));
            continue;
        }
        let esc = chars.next().ok_or("trailing backslash in literal")?;
        match esc {
            '\\' => emit(Piece::Char('\\')),
            '"' => emit(Piece::Char('"')),
            '\'' => emit(Piece::Char('\'')),
            'n' => emit(Piece::Char('\n')),
            'r' => emit(Piece::Char('\r')),
            't' => emit(Piece::Char('\t')),
            '0' => emit(Piece::Char('\0')),
            'x' => {
                let hi = chars.next().ok_or("truncated \\x escape")?;
                let lo = chars.next().ok_or("truncated \\x escape")?;
                let code = u8::from_str_radix(&format!("{}{}", hi, lo), 16)
                    .map_err(|_| format!("invalid \\x escape \\x{}{}", hi, lo))?;
                emit(Piece::Byte(code));
            }
            'u' => {
                if chars.next() != Some('{') {
                    return Err("invalid \\u escape: expected {".to_string());
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) => digits.push(d),
                        None => return Err("unterminated \\u escape".to_string()),
                    }
                }
                let code = u32::from_str_radix(&digits, 16)
                    .map_err(|_| format!("invalid \\u escape \\u{{{}}}", digits))?;
                let c = char::from_u32(code)
                    .ok_or_else(|| format!("\\u{{{}}} is not a character", digits))?;
                emit(Piece::Char(c));
            }
            other => return Err(format!("invalid escape \\{}", other)),
        }
    }
    Ok(())
}
