use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

use super::parser::{ParserError, ParserResult, RowParser};
use crate::storage::data::{SeriesPath, Value};
use crate::storage::engine::InsertRow;
use crate::storage::schema::SchemaCatalog;

/// Parser for JSON rows.
///
/// A row is an object such as
/// `{"device": "d1", "timestamp": 1000, "values": {"temperature": "20.5"}}`;
/// the input is one row or an array of rows. Values are converted to the type
/// the schema catalog holds for each series.
pub struct JsonRowParser {
    schema: Arc<dyn SchemaCatalog>,
    /// Field mapping configuration
    field_mapping: HashMap<String, String>,
}

impl JsonRowParser {
    /// Creates a parser with the default field names
    pub fn new(schema: Arc<dyn SchemaCatalog>) -> Self {
        let mut field_mapping = HashMap::new();
        for field in ["device", "timestamp", "values"] {
            field_mapping.insert(field.to_string(), field.to_string());
        }
        Self {
            schema,
            field_mapping,
        }
    }

    /// Creates a parser reading row fields under custom names. Unmapped
    /// fields keep their default name.
    pub fn with_field_mapping(
        schema: Arc<dyn SchemaCatalog>,
        field_mapping: HashMap<String, String>,
    ) -> Self {
        let mut parser = Self::new(schema);
        parser.field_mapping.extend(field_mapping);
        parser
    }

    fn field<'a>(&self, row: &'a Map<String, JsonValue>, field: &str) -> ParserResult<&'a JsonValue> {
        let field_name = self
            .field_mapping
            .get(field)
            .map(String::as_str)
            .unwrap_or(field);
        row.get(field_name)
            .ok_or_else(|| ParserError::MissingField(field_name.to_string()))
    }

    fn extract_timestamp(&self, row: &Map<String, JsonValue>) -> ParserResult<i64> {
        match self.field(row, "timestamp")? {
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(i)
                } else if let Some(f) = n.as_f64() {
                    Ok(f as i64)
                } else {
                    Err(ParserError::InvalidFieldType("timestamp must be a number".into()))
                }
            }
            _ => Err(ParserError::InvalidFieldType("timestamp must be a number".into())),
        }
    }

    fn parse_row(&self, item: &JsonValue) -> ParserResult<InsertRow> {
        let JsonValue::Object(row) = item else {
            return Err(ParserError::InvalidFormat("row must be a JSON object".into()));
        };
        let device = self
            .field(row, "device")?
            .as_str()
            .ok_or_else(|| ParserError::InvalidFieldType("device must be a string".into()))?
            .to_string();
        let timestamp = self.extract_timestamp(row)?;
        let JsonValue::Object(columns) = self.field(row, "values")? else {
            return Err(ParserError::InvalidFieldType("values must be an object".into()));
        };

        let mut measurements = Vec::with_capacity(columns.len());
        let mut values = Vec::with_capacity(columns.len());
        for (measurement, raw) in columns {
            let text = match raw {
                JsonValue::String(s) => s.clone(),
                JsonValue::Number(n) => n.to_string(),
                JsonValue::Bool(b) => b.to_string(),
                _ => {
                    return Err(ParserError::InvalidFieldType(format!(
                        "value of {} must be a string, number or boolean",
                        measurement
                    )))
                }
            };
            let path = SeriesPath::new(device.clone(), measurement.clone());
            let data_type = self.schema.resolve_series_type(&path)?;
            measurements.push(measurement.clone());
            values.push(Value::parse(data_type, &text)?);
        }

        Ok(InsertRow {
            device,
            timestamp,
            measurements,
            values,
        })
    }
}

impl RowParser for JsonRowParser {
    fn parse(&self, input: &[u8]) -> ParserResult<Vec<InsertRow>> {
        let value: JsonValue =
            serde_json::from_slice(input).map_err(|e| ParserError::InvalidFormat(e.to_string()))?;

        match &value {
            JsonValue::Object(_) => Ok(vec![self.parse_row(&value)?]),
            JsonValue::Array(items) => items.iter().map(|item| self.parse_row(item)).collect(),
            _ => Err(ParserError::InvalidFormat(
                "Input must be a JSON object or array".to_string(),
            )),
        }
    }

    fn supported_formats(&self) -> Vec<&'static str> {
        vec!["application/json", "json"]
    }
}
