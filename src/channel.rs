//! The boundary between the engine and the wire protocol.
//!
//! A [`Channel`] runs one opaque statement and returns either a [`Table`] or
//! an affected-row count. Failures carry the provider's message and error
//! number so [`crate::classify`] can sort them.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Result shape requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Rows,
    Scalar,
    Affected,
}

#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub statement: &'a str,
    pub shape: Shape,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Rows(Table),
    Affected(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ChannelError {
    pub message: String,
    /// Server error number when the failure came from a TDS error token.
    pub code: Option<u32>,
    pub timed_out: bool,
    /// Raised by the client's own transport, not relayed from a hop.
    pub local: bool,
}

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            timed_out: false,
            local: false,
        }
    }

    /// A failure of the connection to the directly connected server.
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            local: true,
            ..Self::new(message)
        }
    }

    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
            timed_out: false,
            local: false,
        }
    }

    pub fn timed_out(seconds: u64) -> Self {
        Self {
            message: format!("statement timed out after {}s", seconds),
            code: None,
            timed_out: true,
            local: false,
        }
    }
}

#[async_trait]
pub trait Channel: Send {
    async fn submit(&mut self, request: Request<'_>) -> Result<Response, ChannelError>;

    /// Open a fresh, independent connection with the same credentials.
    async fn reopen(&self) -> Result<Box<dyn Channel>, ChannelError>;

    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// A nullable cell as decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(v) => Some(*v),
            Cell::Bool(b) => Some(i64::from(*b)),
            Cell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => write!(f, "NULL"),
            Cell::Bool(b) => write!(f, "{}", u8::from(*b)),
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Text(s) => write!(f, "{}", s),
            Cell::Binary(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Ordered columns and rows of one result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// First column of the first row.
    pub fn first(&self) -> Option<&Cell> {
        self.rows.first().and_then(|row| row.first())
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Cell> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }

    /// Every value of the first column rendered as text.
    pub fn first_column(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.first())
            .map(|cell| cell.to_string())
            .collect()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect();

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &rendered {
            for (i, cell) in row.iter().enumerate() {
                let len = cell.chars().count();
                match widths.get_mut(i) {
                    Some(w) => *w = (*w).max(len),
                    None => widths.push(len),
                }
            }
        }

        let line = |f: &mut fmt::Formatter<'_>, cells: &[String]| -> fmt::Result {
            let padded: Vec<String> = cells
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
                .collect();
            writeln!(f, "{}", padded.join(" | ").trim_end())
        };

        line(f, &self.columns)?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        writeln!(f, "{}", rule.join("-+-"))?;
        for row in &rendered {
            line(f, row)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(
            vec!["name".into(), "id".into()],
            vec![
                vec![Cell::Text("master".into()), Cell::Int(1)],
                vec![Cell::Text("tempdb".into()), Cell::Null],
            ],
        )
    }

    #[test]
    fn test_lookup_by_column() {
        let table = sample();
        assert_eq!(table.first(), Some(&Cell::Text("master".into())));
        assert_eq!(table.get(0, "ID"), Some(&Cell::Int(1)));
        assert_eq!(table.get(1, "id"), Some(&Cell::Null));
        assert_eq!(table.get(0, "missing"), None);
        assert_eq!(table.first_column(), vec!["master", "tempdb"]);
    }

    #[test]
    fn test_render() {
        let rendered = sample().to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "name   | id");
        assert_eq!(lines[1], "-------+-----");
        assert_eq!(lines[3], "tempdb | NULL");
    }

    #[test]
    fn test_cell_conversions() {
        assert_eq!(Cell::Text(" 42 ".into()).as_i64(), Some(42));
        assert_eq!(Cell::Bool(true).as_i64(), Some(1));
        assert_eq!(Cell::Binary(vec![0xde, 0xad]).to_string(), "0xDEAD");
        assert!(Cell::Null.is_null());
    }
}
