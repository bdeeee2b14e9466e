//! Compiled statements: SQL text plus positional parameters.

use crate::dialect::Dialect;
use crate::value::SqlValue;

/// Parameterized SQL text and its ordered parameter list.
///
/// The number of placeholders in `sql` always equals `params.len()` for
/// statements produced by the compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Count `?` and `$n` placeholders outside quoted regions.
    pub fn placeholder_count(&self) -> usize {
        let mut count = 0;
        scan_placeholders(&self.sql, |_| count += 1);
        count
    }

    pub fn is_consistent(&self) -> bool {
        self.placeholder_count() == self.params.len()
    }

    /// Render the statement with every parameter substituted as a literal.
    ///
    /// Diagnostic output only; never sent to the server.
    pub fn interpolate(&self, dialect: &dyn Dialect) -> String {
        let mut out = String::with_capacity(self.sql.len() + self.params.len() * 8);
        let mut next = 0usize;
        let mut last = 0usize;
        scan_placeholders(&self.sql, |p| {
            out.push_str(&self.sql[last..p.start]);
            let index = p.index.unwrap_or(next);
            next += 1;
            match self.params.get(index) {
                Some(value) => out.push_str(&dialect.render_literal(value)),
                None => out.push_str(&self.sql[p.start..p.end]),
            }
            last = p.end;
        });
        out.push_str(&self.sql[last..]);
        out
    }
}

/// Location of one placeholder token in SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    pub start: usize,
    pub end: usize,
    /// Zero-based index for `$n` tokens; `None` for positional `?`.
    pub index: Option<usize>,
}

/// Walk `sql`, calling `f` for each placeholder outside quotes and
/// identifiers (`'..'`, `".."`, `` `..` ``).
pub fn scan_placeholders(sql: &str, mut f: impl FnMut(Placeholder)) {
    let bytes = sql.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' && q == b'\'' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'?' => f(Placeholder {
                start: i,
                end: i + 1,
                index: None,
            }),
            b'$' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .count();
                if digits > 0 {
                    let end = i + 1 + digits;
                    let n: usize = sql[i + 1..end].parse().unwrap_or(1);
                    f(Placeholder {
                        start: i,
                        end,
                        index: Some(n.saturating_sub(1)),
                    });
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
}
