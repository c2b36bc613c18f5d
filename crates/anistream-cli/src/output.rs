//! Output formatting for CLI

use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "table" => OutputFormat::Table,
            _ => OutputFormat::Text,
        }
    }
}

/// Print rows as JSON, a table, or one line each
pub fn print_rows<T, F>(rows: &[T], format: OutputFormat, line: F) -> anyhow::Result<()>
where
    T: Serialize + Tabled,
    F: Fn(&T) -> String,
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        OutputFormat::Table => println!("{}", Table::new(rows)),
        OutputFormat::Text => {
            for row in rows {
                println!("{}", line(row));
            }
        }
    }
    Ok(())
}

/// Print a single value as JSON, or through its text rendering
pub fn print_value<T: Serialize>(value: &T, format: OutputFormat, text: impl FnOnce(&T) -> String) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table | OutputFormat::Text => println!("{}", text(value)),
    }
    Ok(())
}

/// Seconds as m:ss
pub fn clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!(OutputFormat::from("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from("table"), OutputFormat::Table);
        assert_eq!(OutputFormat::from("anything"), OutputFormat::Text);
    }

    #[test]
    fn test_clock() {
        assert_eq!(clock(0.0), "0:00");
        assert_eq!(clock(95.7), "1:35");
        assert_eq!(clock(1420.0), "23:40");
    }
}
