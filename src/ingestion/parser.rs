use thiserror::Error;

use crate::storage::data::DataError;
use crate::storage::engine::InsertRow;
use crate::storage::schema::SchemaError;

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Invalid input format: {0}")]
    InvalidFormat(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid field type: {0}")]
    InvalidFieldType(String),
    #[error("Invalid value: {0}")]
    Value(#[from] DataError),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    /// Positions of the failing inputs of a batch, with their errors
    #[error("{} batch input(s) failed: {}", .0.len(), describe_failures(.0))]
    Batch(Vec<(usize, ParserError)>),
}

fn describe_failures(failures: &[(usize, ParserError)]) -> String {
    failures
        .iter()
        .map(|(index, e)| format!("#{} {}", index, e))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type ParserResult<T> = Result<T, ParserError>;

/// Turns raw input into rows ready for [`StorageEngine::insert`](crate::storage::StorageEngine::insert)
pub trait RowParser {
    fn parse(&self, input: &[u8]) -> ParserResult<Vec<InsertRow>>;

    /// Parses several inputs as one unit. Rows come back in input order;
    /// if any input fails no rows are returned and every failure is reported
    /// by its position.
    fn parse_batch(&self, inputs: &[&[u8]]) -> ParserResult<Vec<InsertRow>> {
        let mut rows = Vec::new();
        let mut failures = Vec::new();
        for (index, input) in inputs.iter().enumerate() {
            match self.parse(input) {
                Ok(parsed) if failures.is_empty() => rows.extend(parsed),
                Ok(_) => {}
                Err(e) => failures.push((index, e)),
            }
        }
        if failures.is_empty() {
            Ok(rows)
        } else {
            Err(ParserError::Batch(failures))
        }
    }

    /// Input formats this parser reads, as file extensions and media types
    fn supported_formats(&self) -> Vec<&'static str>;

    /// Whether a file with `extension` can be handed to this parser
    fn accepts_extension(&self, extension: &str) -> bool {
        self.supported_formats()
            .iter()
            .any(|format| format.eq_ignore_ascii_case(extension))
    }
}
