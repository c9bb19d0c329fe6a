//! Ingestion: parsing external input into engine rows

pub mod formats;
pub mod parser;

pub use formats::JsonRowParser;
pub use parser::{ParserError, ParserResult, RowParser};
