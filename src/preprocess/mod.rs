//! Textual preprocessing: macro definition and expansion, conditional
//! inclusion, and early termination.
//!
//! Runs before the lexer ever sees the source. Directives start with `#`,
//! macro uses with `$`. Conditional regions that are skipped still emit
//! their newlines, so line numbers reported by later stages refer to the
//! original file.

pub mod macros;

use tracing::debug;

use crate::error::CompileError;
use macros::MacroTable;

/// Expansion nesting bound; hitting it means a definition cycle.
const MAX_DEPTH: usize = 64;

/// Expand `source` against (and mutating) `table`.
pub fn preprocess(source: &str, table: &mut MacroTable) -> Result<String, CompileError> {
    Preprocessor::new(source).run(table)
}

/// One open `#ifdef`/`#ifndef` region.
struct Frame {
    parent_active: bool,
    taken: bool,
    active: bool,
    else_seen: bool,
    line: usize,
}

struct Preprocessor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    out: String,
    stack: Vec<Frame>,
}

impl Preprocessor {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            out: String::new(),
            stack: Vec::new(),
        }
    }

    fn active(&self) -> bool {
        self.stack.last().map_or(true, |f| f.active)
    }

    fn run(mut self, table: &mut MacroTable) -> Result<String, CompileError> {
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                    self.out.push('\n');
                }
                ';' => self.copy_comment(),
                '/' if self.peek(1) == Some('/') => self.copy_comment(),
                '"' if self.active() => self.copy_string(),
                '#' => {
                    if self.directive(table)? {
                        return self.finish();
                    }
                }
                '$' => {
                    if self.active() {
                        let mut stack = Vec::new();
                        let (expanded, next) = expand_invocation(
                            &self.chars,
                            self.pos,
                            table,
                            &mut stack,
                            self.line,
                        )?;
                        self.out.push_str(&expanded);
                        self.pos = next;
                    } else {
                        self.pos += 1;
                        self.skip_ident();
                    }
                }
                _ => {
                    if self.active() {
                        self.out.push(c);
                    }
                    self.pos += 1;
                }
            }
        }
        if let Some(frame) = self.stack.last() {
            return Err(CompileError::preprocess(
                "unmatched conditional directive",
                frame.line,
            ));
        }
        self.finish()
    }

    fn finish(self) -> Result<String, CompileError> {
        Ok(self.out)
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    /// Comments pass through untouched; the lexer strips them. Copying
    /// them verbatim keeps `$` and `#` inside comments inert.
    fn copy_comment(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos] != '\n' {
            if self.active() {
                self.out.push(self.chars[self.pos]);
            }
            self.pos += 1;
        }
    }

    /// String literals pass through without expansion.
    fn copy_string(&mut self) {
        self.out.push('"');
        self.pos += 1;
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            self.out.push(c);
            self.pos += 1;
            if c == '\\' {
                if let Some(next) = self.chars.get(self.pos) {
                    self.out.push(*next);
                    self.pos += 1;
                }
                continue;
            }
            if c == '"' || c == '\n' {
                if c == '\n' {
                    self.line += 1;
                }
                break;
            }
        }
    }

    fn read_ident(&mut self) -> String {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn skip_ident(&mut self) {
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
    }

    fn skip_blanks(&mut self) {
        while matches!(self.peek(0), Some(' ' | '\t' | '\r')) {
            self.pos += 1;
        }
    }

    /// Handle one directive. Returns true when processing should stop.
    fn directive(&mut self, table: &mut MacroTable) -> Result<bool, CompileError> {
        self.pos += 1; // '#'
        let word = self.read_ident();
        match word.as_str() {
            "define" => self.define(table).map(|()| false),
            "undef" => {
                self.skip_blanks();
                let name = self.read_ident();
                if name.is_empty() {
                    return Err(CompileError::preprocess("#undef needs a name", self.line));
                }
                if self.active() && !table.undef(&name) {
                    debug!(line = self.line, name, "#undef of an unknown macro");
                }
                Ok(false)
            }
            "ifdef" | "ifndef" => {
                self.skip_blanks();
                let name = self.read_ident();
                if name.is_empty() {
                    return Err(CompileError::preprocess(
                        format!("#{word} needs a name"),
                        self.line,
                    ));
                }
                let met = table.is_defined(&name) == (word == "ifdef");
                let parent = self.active();
                self.stack.push(Frame {
                    parent_active: parent,
                    taken: met,
                    active: parent && met,
                    else_seen: false,
                    line: self.line,
                });
                Ok(false)
            }
            "else" => match self.stack.last_mut() {
                Some(frame) if !frame.else_seen => {
                    frame.else_seen = true;
                    frame.active = frame.parent_active && !frame.taken;
                    Ok(false)
                }
                Some(_) => Err(CompileError::preprocess("duplicate #else", self.line)),
                None => Err(CompileError::preprocess(
                    "#else without matching #ifdef",
                    self.line,
                )),
            },
            "end" | "endif" => {
                if self.stack.pop().is_none() {
                    return Err(CompileError::preprocess(
                        format!("#{word} without matching #ifdef"),
                        self.line,
                    ));
                }
                Ok(false)
            }
            "exit" => {
                if self.active() {
                    debug!(line = self.line, "preprocessing stopped by #exit");
                    return Ok(true);
                }
                Ok(false)
            }
            "include" => Err(CompileError::preprocess(
                "#include is not supported",
                self.line,
            )),
            other => Err(CompileError::preprocess(
                format!("unknown directive `#{other}`"),
                self.line,
            )),
        }
    }

    /// `#define NAME # body #` or `#define NAME(p1'p2) # body #`.
    /// Skipped regions still parse the definition so the body delimiters
    /// cannot leak.
    fn define(&mut self, table: &mut MacroTable) -> Result<(), CompileError> {
        let at = self.line;
        self.skip_blanks();
        let name = self.read_ident();
        if name.is_empty() {
            return Err(CompileError::preprocess("#define needs a name", at));
        }

        let mut params = Vec::new();
        if self.peek(0) == Some('(') {
            self.pos += 1;
            loop {
                self.skip_blanks();
                let param = self.read_ident();
                if param.is_empty() {
                    return Err(CompileError::preprocess(
                        format!("malformed parameter list for macro `{name}`"),
                        at,
                    ));
                }
                params.push(param);
                self.skip_blanks();
                match self.peek(0) {
                    Some('\'') => self.pos += 1,
                    Some(')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => {
                        return Err(CompileError::preprocess(
                            format!("malformed parameter list for macro `{name}`"),
                            at,
                        ));
                    }
                }
            }
        }

        // Body sits between two '#' characters and may span lines.
        while matches!(self.peek(0), Some(' ' | '\t' | '\r' | '\n')) {
            if self.peek(0) == Some('\n') {
                self.line += 1;
                self.out.push('\n');
            }
            self.pos += 1;
        }
        if self.peek(0) != Some('#') {
            return Err(CompileError::preprocess(
                format!("macro `{name}` is missing its `#` body delimiter"),
                at,
            ));
        }
        self.pos += 1;

        let mut body = String::new();
        loop {
            match self.peek(0) {
                None => {
                    return Err(CompileError::preprocess(
                        format!("unterminated body for macro `{name}`"),
                        at,
                    ));
                }
                Some('\\') if self.peek(1) == Some('#') => {
                    body.push('#');
                    self.pos += 2;
                }
                Some('#') => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                        self.out.push('\n');
                    }
                    body.push(c);
                    self.pos += 1;
                }
            }
        }

        if self.active() {
            debug!(name, params = params.len(), "macro defined");
            table.define(&name, params, body);
        }
        Ok(())
    }
}

/// Expand the `$NAME` (or `$NAME(args)`) invocation starting at
/// `input[start]`. Returns the expanded text and the position just past
/// the invocation. `stack` holds the names currently being expanded.
fn expand_invocation(
    input: &[char],
    start: usize,
    table: &MacroTable,
    stack: &mut Vec<String>,
    line: usize,
) -> Result<(String, usize), CompileError> {
    let mut pos = start + 1; // '$'
    let name_start = pos;
    while input
        .get(pos)
        .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
    {
        pos += 1;
    }
    let name: String = input[name_start..pos].iter().collect();
    if name.is_empty() {
        return Err(CompileError::preprocess("stray `$`", line));
    }
    let mac = table.get(&name).ok_or_else(|| {
        CompileError::preprocess(format!("undefined macro `${name}`"), line)
    })?;
    if stack.iter().any(|n| n == &name) || stack.len() >= MAX_DEPTH {
        return Err(CompileError::preprocess(
            format!("recursive expansion of macro `${name}`"),
            line,
        ));
    }

    // Raw arguments, split on top-level `'`.
    let mut raw_args: Vec<String> = Vec::new();
    if !mac.params.is_empty() {
        if input.get(pos) != Some(&'(') {
            return Err(CompileError::preprocess(
                format!("macro `${name}` expects {} argument(s)", mac.params.len()),
                line,
            ));
        }
        pos += 1;
        let mut depth = 1usize;
        let mut current = String::new();
        loop {
            match input.get(pos) {
                None => {
                    return Err(CompileError::preprocess(
                        format!("unterminated arguments for macro `${name}`"),
                        line,
                    ));
                }
                Some('(') => {
                    depth += 1;
                    current.push('(');
                }
                Some(')') => {
                    depth -= 1;
                    if depth == 0 {
                        raw_args.push(current);
                        pos += 1;
                        break;
                    }
                    current.push(')');
                }
                Some('\'') if depth == 1 => {
                    raw_args.push(std::mem::take(&mut current));
                }
                Some(c) => current.push(*c),
            }
            pos += 1;
        }
        if raw_args.len() != mac.params.len() {
            return Err(CompileError::preprocess(
                format!(
                    "macro `${name}` expects {} argument(s), got {}",
                    mac.params.len(),
                    raw_args.len()
                ),
                line,
            ));
        }
    }

    // Arguments expand before substitution.
    let mut args = Vec::with_capacity(raw_args.len());
    for raw in &raw_args {
        args.push(expand_all(raw, table, stack, line)?);
    }

    // Longest parameter name first, so `$freq2` is not eaten by `$freq`.
    let mut ordered: Vec<usize> = (0..mac.params.len()).collect();
    ordered.sort_by_key(|&i| std::cmp::Reverse(mac.params[i].len()));
    let mut body = mac.body.clone();
    for i in ordered {
        body = body.replace(&format!("${}", mac.params[i]), &args[i]);
    }

    stack.push(name);
    let expanded = expand_all(&body, table, stack, line)?;
    stack.pop();
    Ok((expanded, pos))
}

/// Expand every `$` invocation inside `text`.
fn expand_all(
    text: &str,
    table: &MacroTable,
    stack: &mut Vec<String>,
    line: usize,
) -> Result<String, CompileError> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while pos < chars.len() {
        if chars[pos] == '$' {
            let (expanded, next) = expand_invocation(&chars, pos, table, stack, line)?;
            out.push_str(&expanded);
            pos = next;
        } else {
            out.push(chars[pos]);
            pos += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn pp(src: &str) -> Result<String, CompileError> {
        let mut table = MacroTable::with_builtins();
        preprocess(src, &mut table)
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(pp("instr 1\nkx = 1\nendin\n").unwrap(), "instr 1\nkx = 1\nendin\n");
    }

    #[test]
    fn simple_macro_expands() {
        let out = pp("#define FREQ # 440 #\nkx = $FREQ\n").unwrap();
        assert!(out.contains("kx =  440 "));
    }

    #[test]
    fn builtin_pi_expands() {
        let out = pp("kx = $M_PI\n").unwrap();
        assert!(out.contains("3.14159"));
    }

    #[test]
    fn function_macro_substitutes_arguments() {
        let out = pp("#define HALF(x) # $x / 2 #\nkx = $HALF(440)\n").unwrap();
        assert!(out.contains("440 / 2"));
    }

    #[test]
    fn multiple_arguments_split_on_quote() {
        let out = pp("#define MIX(a'b) # $a + $b #\nkx = $MIX(1'2)\n").unwrap();
        assert!(out.contains("1 + 2"));
    }

    #[test]
    fn undef_makes_macro_unknown() {
        let err = pp("#define X # 1 #\n#undef X\nkx = $X\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Preprocess);
        assert!(err.message.contains("undefined macro"));
    }

    #[test]
    fn ifdef_keeps_active_branch() {
        let src = "#define DBG # 1 #\n#ifdef DBG\nkx = 1\n#else\nkx = 2\n#end\n";
        let out = pp(src).unwrap();
        assert!(out.contains("kx = 1"));
        assert!(!out.contains("kx = 2"));
    }

    #[test]
    fn ifndef_keeps_inactive_branch() {
        let src = "#ifndef DBG\nkx = 2\n#end\n";
        let out = pp(src).unwrap();
        assert!(out.contains("kx = 2"));
    }

    #[test]
    fn else_takes_the_other_branch() {
        let src = "#ifdef MISSING\nkx = 1\n#else\nkx = 2\n#endif\n";
        let out = pp(src).unwrap();
        assert!(!out.contains("kx = 1"));
        assert!(out.contains("kx = 2"));
    }

    #[test]
    fn nested_conditionals() {
        let src = "#define A # 1 #\n#ifdef A\n#ifdef B\nkx = 1\n#end\nky = 2\n#end\n";
        let out = pp(src).unwrap();
        assert!(!out.contains("kx = 1"));
        assert!(out.contains("ky = 2"));
    }

    #[test]
    fn unmatched_ifdef_is_fatal() {
        let err = pp("#ifdef DBG\nkx = 1\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Preprocess);
        assert!(err.message.contains("unmatched"));
    }

    #[test]
    fn stray_end_is_fatal() {
        let err = pp("#end\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Preprocess);
    }

    #[test]
    fn exit_truncates_output() {
        let out = pp("kx = 1\n#exit\nky = 2\n").unwrap();
        assert!(out.contains("kx = 1"));
        assert!(!out.contains("ky = 2"));
    }

    #[test]
    fn exit_in_skipped_region_is_ignored() {
        let out = pp("#ifdef MISSING\n#exit\n#end\nky = 2\n").unwrap();
        assert!(out.contains("ky = 2"));
    }

    #[test]
    fn recursive_macro_is_fatal() {
        let err = pp("#define A # $B #\n#define B # $A #\nkx = $A\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Preprocess);
        assert!(err.message.contains("recursive"));
    }

    #[test]
    fn skipped_lines_preserve_numbering() {
        let src = "#ifdef MISSING\nkx = 1\nky = 2\n#end\nkz = 3\n";
        let out = pp(src).unwrap();
        // kz must still land on line 5
        let line_of_kz = out.lines().position(|l| l.contains("kz = 3")).unwrap() + 1;
        assert_eq!(line_of_kz, 5);
    }

    #[test]
    fn comments_are_inert() {
        let out = pp("; $UNDEFINED #end\nkx = 1\n").unwrap();
        assert!(out.contains("$UNDEFINED"));
        assert!(out.contains("kx = 1"));
    }

    #[test]
    fn strings_are_inert() {
        let out = pp("Sname = \"$M_PI\"\n").unwrap();
        assert!(out.contains("\"$M_PI\""));
    }

    #[test]
    fn escaped_hash_in_body() {
        let mut table = MacroTable::new();
        let out = preprocess("#define X # a\\#b #\nkx = $X\n", &mut table).unwrap();
        assert!(out.contains("a#b"));
    }

    #[test]
    fn include_is_rejected() {
        let err = pp("#include \"other.orc\"\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Preprocess);
    }

    #[test]
    fn redefinition_overrides_in_source() {
        let out = pp("#define X # 1 #\n#define X # 2 #\nkx = $X\n").unwrap();
        assert!(out.contains("kx =  2 "));
    }
}
