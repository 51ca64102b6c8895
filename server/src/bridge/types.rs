//! Mapping between engine values and PostgreSQL wire values
//!
//! Engine column types map onto PostgreSQL type OIDs (TEXT when there is no
//! better match). Values are rendered in text or binary format per column,
//! and bound parameters are decoded according to their declared OIDs.

use crate::error::SqlError;
use crate::protocol::message::FieldDescription;
use bytes::{Bytes, BytesMut};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use duckdb_pgwire_core::sqlstate;
use duckdb_pgwire_core::{Column, LogicalType, Value};
use postgres_protocol::types as wire;
use postgres_types::{Oid, Type};

/// Text format code
pub const TEXT_FORMAT: i16 = 0;

/// Binary format code
pub const BINARY_FORMAT: i16 = 1;

/// Unspecified parameter type in Parse
pub const UNSPECIFIED_OID: Oid = 0;

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_time(NaiveTime::MIN)
}

/// PostgreSQL type reported for an engine column type
pub fn pg_type(logical_type: LogicalType) -> Type {
    match logical_type {
        LogicalType::Boolean => Type::BOOL,
        LogicalType::SmallInt => Type::INT2,
        LogicalType::Integer => Type::INT4,
        LogicalType::BigInt => Type::INT8,
        LogicalType::Float => Type::FLOAT4,
        LogicalType::Double => Type::FLOAT8,
        // Reported as numeric; the engine keeps the value with REAL affinity
        LogicalType::Decimal => Type::NUMERIC,
        LogicalType::Varchar => Type::VARCHAR,
        LogicalType::Blob => Type::BYTEA,
        LogicalType::Date => Type::DATE,
        LogicalType::Time => Type::TIME,
        LogicalType::Timestamp => Type::TIMESTAMP,
        LogicalType::Uuid => Type::UUID,
        LogicalType::Unknown => Type::TEXT,
    }
}

/// `typlen` of a type: fixed width in bytes, or -1 for variable length
pub fn type_size(ty: &Type) -> i16 {
    match *ty {
        Type::BOOL => 1,
        Type::INT2 => 2,
        Type::INT4 | Type::FLOAT4 | Type::DATE => 4,
        Type::INT8 | Type::FLOAT8 | Type::TIME | Type::TIMESTAMP => 8,
        Type::UUID => 16,
        _ => -1,
    }
}

/// Type a client sees for a parameter declared with `oid` in Parse
pub fn parameter_type(oid: Oid) -> Type {
    match oid {
        UNSPECIFIED_OID => Type::TEXT,
        oid => Type::from_oid(oid).unwrap_or(Type::TEXT),
    }
}

/// Expand the format codes of a Bind message to one code per column or parameter
///
/// No codes means all text, a single code applies to every entry, otherwise
/// there must be exactly one code per entry.
pub fn resolve_formats(codes: &[i16], count: usize, what: &str) -> Result<Vec<i16>, SqlError> {
    for code in codes {
        if *code != TEXT_FORMAT && *code != BINARY_FORMAT {
            return Err(SqlError::error(
                sqlstate::PROTOCOL_VIOLATION,
                format!("unsupported format code: {}", code),
            ));
        }
    }
    match codes.len() {
        0 => Ok(vec![TEXT_FORMAT; count]),
        1 => Ok(vec![codes[0]; count]),
        n if n == count => Ok(codes.to_vec()),
        n => Err(SqlError::error(
            sqlstate::PROTOCOL_VIOLATION,
            format!("bind message has {} {} formats but {} {}", n, what, count, what),
        )),
    }
}

/// RowDescription fields for a result
pub fn field_descriptions(columns: &[Column], formats: &[i16]) -> Vec<FieldDescription> {
    columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let ty = pg_type(column.logical_type);
            FieldDescription {
                name: column.name.clone(),
                table_oid: 0,
                column_id: 0,
                data_type_oid: ty.oid(),
                data_type_size: type_size(&ty),
                type_modifier: -1,
                format_code: formats.get(i).copied().unwrap_or(TEXT_FORMAT),
            }
        })
        .collect()
}

/// Encode one row for a DataRow message
pub fn encode_row(row: &[Value], columns: &[Column], formats: &[i16]) -> Result<Vec<Option<Bytes>>, SqlError> {
    row.iter()
        .enumerate()
        .map(|(i, value)| {
            let ty = columns
                .get(i)
                .map(|c| pg_type(c.logical_type))
                .unwrap_or(Type::TEXT);
            encode_value(value, &ty, formats.get(i).copied().unwrap_or(TEXT_FORMAT))
        })
        .collect()
}

/// Encode a single value in the requested format
pub fn encode_value(value: &Value, ty: &Type, format: i16) -> Result<Option<Bytes>, SqlError> {
    if value.is_null() {
        return Ok(None);
    }
    let encoded = if format == BINARY_FORMAT {
        encode_binary(value, ty)?
    } else {
        Bytes::from(encode_text(value, ty))
    };
    Ok(Some(encoded))
}

/// Text rendering of a value as PostgreSQL would print it
pub fn encode_text(value: &Value, ty: &Type) -> String {
    match (ty, value) {
        (&Type::BOOL, Value::Integer(i)) => if *i != 0 { "t" } else { "f" }.to_string(),
        (&Type::BOOL, Value::Real(f)) => if *f != 0.0 { "t" } else { "f" }.to_string(),
        (_, Value::Blob(bytes)) => format!("\\x{}", hex::encode(bytes)),
        (&Type::BYTEA, Value::Text(text)) => format!("\\x{}", hex::encode(text.as_bytes())),
        (_, Value::Real(f)) => format_float(*f),
        (_, other) => other.as_text().unwrap_or_default(),
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        f.to_string()
    }
}

fn encode_binary(value: &Value, ty: &Type) -> Result<Bytes, SqlError> {
    let mut buf = BytesMut::new();
    match *ty {
        Type::BOOL => wire::bool_to_sql(as_bool(value)?, &mut buf),
        Type::INT2 => {
            let v = as_i64(value)?;
            let v = i16::try_from(v).map_err(|_| out_of_range("smallint", v))?;
            wire::int2_to_sql(v, &mut buf)
        }
        Type::INT4 => {
            let v = as_i64(value)?;
            let v = i32::try_from(v).map_err(|_| out_of_range("integer", v))?;
            wire::int4_to_sql(v, &mut buf)
        }
        Type::INT8 => wire::int8_to_sql(as_i64(value)?, &mut buf),
        Type::FLOAT4 => wire::float4_to_sql(as_f64(value)? as f32, &mut buf),
        Type::FLOAT8 => wire::float8_to_sql(as_f64(value)?, &mut buf),
        Type::BYTEA => match value {
            Value::Blob(bytes) => wire::bytea_to_sql(bytes, &mut buf),
            other => wire::bytea_to_sql(other.as_text().unwrap_or_default().as_bytes(), &mut buf),
        },
        Type::DATE => {
            let date = parse_date(&text_of(value))?;
            let days = (date - pg_epoch_date()).num_days();
            let days = i32::try_from(days).map_err(|_| out_of_range("date", days))?;
            wire::date_to_sql(days, &mut buf)
        }
        Type::TIME => {
            let time = parse_time(&text_of(value))?;
            let micros = i64::from(time.num_seconds_from_midnight()) * 1_000_000
                + i64::from(time.nanosecond() / 1_000);
            wire::time_to_sql(micros, &mut buf)
        }
        Type::TIMESTAMP => {
            let timestamp = parse_timestamp(&text_of(value))?;
            let micros = (timestamp - pg_epoch())
                .num_microseconds()
                .ok_or_else(|| out_of_range("timestamp", 0))?;
            wire::timestamp_to_sql(micros, &mut buf)
        }
        Type::NUMERIC => {
            return Err(SqlError::error(
                sqlstate::FEATURE_NOT_SUPPORTED,
                "binary format is not supported for numeric results",
            ))
        }
        Type::UUID => {
            let uuid = match value {
                Value::Blob(bytes) => uuid::Uuid::from_slice(bytes).map_err(|e| invalid_text("uuid", &e.to_string()))?,
                other => {
                    let text = text_of(other);
                    uuid::Uuid::parse_str(&text).map_err(|_| invalid_text("uuid", &text))?
                }
            };
            wire::uuid_to_sql(*uuid.as_bytes(), &mut buf)
        }
        _ => wire::text_to_sql(&encode_text(value, ty), &mut buf),
    }
    Ok(buf.freeze())
}

fn text_of(value: &Value) -> String {
    value.as_text().unwrap_or_default()
}

fn as_bool(value: &Value) -> Result<bool, SqlError> {
    match value {
        Value::Integer(i) => Ok(*i != 0),
        Value::Real(f) => Ok(*f != 0.0),
        other => parse_bool(&text_of(other)),
    }
}

fn as_i64(value: &Value) -> Result<i64, SqlError> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Real(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 => Ok(*f as i64),
        Value::Real(f) => Err(invalid_text("bigint", &f.to_string())),
        other => {
            let text = text_of(other);
            text.trim().parse().map_err(|_| invalid_text("bigint", &text))
        }
    }
}

fn as_f64(value: &Value) -> Result<f64, SqlError> {
    match value {
        Value::Integer(i) => Ok(*i as f64),
        Value::Real(f) => Ok(*f),
        other => {
            let text = text_of(other);
            parse_float(&text)
        }
    }
}

fn parse_bool(text: &str) -> Result<bool, SqlError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "yes" | "y" | "on" | "1" => Ok(true),
        "f" | "false" | "no" | "n" | "off" | "0" => Ok(false),
        _ => Err(invalid_text("boolean", text)),
    }
}

fn parse_float(text: &str) -> Result<f64, SqlError> {
    match text.trim() {
        "NaN" => Ok(f64::NAN),
        "Infinity" | "inf" => Ok(f64::INFINITY),
        "-Infinity" | "-inf" => Ok(f64::NEG_INFINITY),
        other => other.parse().map_err(|_| invalid_text("double precision", text)),
    }
}

fn parse_date(text: &str) -> Result<NaiveDate, SqlError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|_| invalid_text("date", text))
}

fn parse_time(text: &str) -> Result<NaiveTime, SqlError> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M:%S%.f").map_err(|_| invalid_text("time", text))
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime, SqlError> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| parse_date(text).map(|d| d.and_time(NaiveTime::MIN)).map_err(|_| ()))
        .map_err(|_| invalid_text("timestamp", text))
}

/// Decode a bound parameter into an engine value
pub fn decode_parameter(raw: Option<&[u8]>, oid: Oid, format: i16) -> Result<Value, SqlError> {
    let raw = match raw {
        Some(raw) => raw,
        None => return Ok(Value::Null),
    };
    let ty = parameter_type(oid);
    if format == BINARY_FORMAT {
        decode_binary_parameter(raw, &ty)
    } else {
        let text = std::str::from_utf8(raw).map_err(|_| invalid_text(ty.name(), &String::from_utf8_lossy(raw)))?;
        decode_text_parameter(text, &ty)
    }
}

fn decode_text_parameter(text: &str, ty: &Type) -> Result<Value, SqlError> {
    Ok(match *ty {
        Type::BOOL => Value::from(parse_bool(text)?),
        Type::INT2 | Type::INT4 | Type::INT8 => {
            Value::Integer(text.trim().parse().map_err(|_| invalid_text(ty.name(), text))?)
        }
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => Value::Real(parse_float(text)?),
        Type::BYTEA => match text.strip_prefix("\\x") {
            Some(digits) => Value::Blob(hex::decode(digits).map_err(|_| invalid_text("bytea", text))?),
            None => Value::Blob(text.as_bytes().to_vec()),
        },
        _ => Value::Text(text.to_string()),
    })
}

fn decode_binary_parameter(raw: &[u8], ty: &Type) -> Result<Value, SqlError> {
    let bad = |_| invalid_binary(ty);
    Ok(match *ty {
        Type::BOOL => Value::from(wire::bool_from_sql(raw).map_err(bad)?),
        Type::INT2 => Value::Integer(i64::from(wire::int2_from_sql(raw).map_err(bad)?)),
        Type::INT4 => Value::Integer(i64::from(wire::int4_from_sql(raw).map_err(bad)?)),
        Type::INT8 => Value::Integer(wire::int8_from_sql(raw).map_err(bad)?),
        Type::FLOAT4 => Value::Real(f64::from(wire::float4_from_sql(raw).map_err(bad)?)),
        Type::FLOAT8 => Value::Real(wire::float8_from_sql(raw).map_err(bad)?),
        Type::BYTEA => Value::Blob(wire::bytea_from_sql(raw).to_vec()),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Value::Text(wire::text_from_sql(raw).map_err(bad)?.to_string())
        }
        Type::DATE => {
            let days = wire::date_from_sql(raw).map_err(bad)?;
            let date = pg_epoch_date()
                .checked_add_signed(chrono::Duration::days(i64::from(days)))
                .ok_or_else(|| out_of_range("date", i64::from(days)))?;
            Value::Text(date.format("%Y-%m-%d").to_string())
        }
        Type::TIME => {
            let micros = wire::time_from_sql(raw).map_err(bad)?;
            let time = NaiveTime::MIN + chrono::Duration::microseconds(micros);
            Value::Text(time.format("%H:%M:%S%.f").to_string())
        }
        Type::TIMESTAMP => {
            let micros = wire::timestamp_from_sql(raw).map_err(bad)?;
            let timestamp = pg_epoch()
                .checked_add_signed(chrono::Duration::microseconds(micros))
                .ok_or_else(|| out_of_range("timestamp", micros))?;
            Value::Text(timestamp.format("%Y-%m-%d %H:%M:%S%.f").to_string())
        }
        Type::UUID => Value::Text(uuid::Uuid::from_bytes(wire::uuid_from_sql(raw).map_err(bad)?).to_string()),
        _ => {
            return Err(SqlError::error(
                sqlstate::FEATURE_NOT_SUPPORTED,
                format!("binary format is not supported for parameters of type {}", ty.name()),
            ))
        }
    })
}

fn invalid_text(type_name: &str, text: &str) -> SqlError {
    SqlError::error(
        sqlstate::INVALID_TEXT_REPRESENTATION,
        format!("invalid input syntax for type {}: \"{}\"", type_name, text),
    )
}

fn invalid_binary(ty: &Type) -> SqlError {
    SqlError::error(
        sqlstate::INVALID_BINARY_REPRESENTATION,
        format!("incorrect binary data format in parameter of type {}", ty.name()),
    )
}

fn out_of_range(type_name: &str, value: i64) -> SqlError {
    SqlError::error(
        sqlstate::NUMERIC_VALUE_OUT_OF_RANGE,
        format!("value {} is out of range for type {}", value, type_name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(LogicalType::Varchar, 1043, -1)]
    #[case(LogicalType::Float, 700, 4)]
    #[case(LogicalType::Double, 701, 8)]
    #[case(LogicalType::Decimal, 1700, -1)]
    #[case(LogicalType::SmallInt, 21, 2)]
    #[case(LogicalType::Integer, 23, 4)]
    #[case(LogicalType::BigInt, 20, 8)]
    #[case(LogicalType::Boolean, 16, 1)]
    #[case(LogicalType::Date, 1082, 4)]
    #[case(LogicalType::Timestamp, 1114, 8)]
    #[case(LogicalType::Blob, 17, -1)]
    #[case(LogicalType::Unknown, 25, -1)]
    fn test_oid_and_size(#[case] logical: LogicalType, #[case] oid: Oid, #[case] size: i16) {
        let ty = pg_type(logical);
        assert_eq!(ty.oid(), oid);
        assert_eq!(type_size(&ty), size);
    }

    #[rstest]
    #[case(Value::Integer(1), Type::BOOL, "t")]
    #[case(Value::Integer(0), Type::BOOL, "f")]
    #[case(Value::Integer(42), Type::INT4, "42")]
    #[case(Value::Real(1.5), Type::FLOAT8, "1.5")]
    #[case(Value::Real(f64::INFINITY), Type::FLOAT8, "Infinity")]
    #[case(Value::Real(12.5), Type::NUMERIC, "12.5")]
    #[case(Value::Integer(3), Type::NUMERIC, "3")]
    #[case(Value::Blob(vec![0xde, 0xad]), Type::BYTEA, "\\xdead")]
    #[case(Value::from("DuckdbPgwire Sam 🐥"), Type::TEXT, "DuckdbPgwire Sam 🐥")]
    fn test_text_encoding(#[case] value: Value, #[case] ty: Type, #[case] expected: &str) {
        assert_eq!(encode_text(&value, &ty), expected);
    }

    #[test]
    fn test_null_is_encoded_as_none() {
        assert_eq!(encode_value(&Value::Null, &Type::INT4, BINARY_FORMAT).unwrap(), None);
    }

    #[test]
    fn test_binary_integers() {
        let encoded = encode_value(&Value::Integer(7), &Type::INT4, BINARY_FORMAT).unwrap().unwrap();
        assert_eq!(&encoded[..], &7i32.to_be_bytes());

        let err = encode_value(&Value::Integer(70_000), &Type::INT2, BINARY_FORMAT).unwrap_err();
        assert_eq!(err.code, sqlstate::NUMERIC_VALUE_OUT_OF_RANGE);
    }

    #[test]
    fn test_numeric_is_text_only() {
        let err = encode_value(&Value::Real(1.25), &Type::NUMERIC, BINARY_FORMAT).unwrap_err();
        assert_eq!(err.code, sqlstate::FEATURE_NOT_SUPPORTED);
        let text = encode_value(&Value::Real(1.25), &Type::NUMERIC, TEXT_FORMAT).unwrap().unwrap();
        assert_eq!(&text[..], b"1.25");
    }

    #[test]
    fn test_binary_date_is_relative_to_2000() {
        let encoded = encode_value(&Value::from("2000-01-02"), &Type::DATE, BINARY_FORMAT)
            .unwrap()
            .unwrap();
        assert_eq!(&encoded[..], &1i32.to_be_bytes());

        let decoded = decode_parameter(Some(&encoded), Type::DATE.oid(), BINARY_FORMAT).unwrap();
        assert_eq!(decoded, Value::from("2000-01-02"));
    }

    #[test]
    fn test_binary_timestamp_round_trip() {
        let encoded = encode_value(&Value::from("2024-03-01 12:30:00"), &Type::TIMESTAMP, BINARY_FORMAT)
            .unwrap()
            .unwrap();
        let decoded = decode_parameter(Some(&encoded), Type::TIMESTAMP.oid(), BINARY_FORMAT).unwrap();
        assert_eq!(decoded, Value::from("2024-03-01 12:30:00"));
    }

    #[test]
    fn test_bad_text_is_22p02() {
        let err = encode_value(&Value::from("not a date"), &Type::DATE, BINARY_FORMAT).unwrap_err();
        assert_eq!(err.code, sqlstate::INVALID_TEXT_REPRESENTATION);

        let err = decode_parameter(Some(b"abc"), Type::INT4.oid(), TEXT_FORMAT).unwrap_err();
        assert_eq!(err.code, sqlstate::INVALID_TEXT_REPRESENTATION);
    }

    #[test]
    fn test_bad_binary_is_22p03() {
        let err = decode_parameter(Some(&[0, 1]), Type::INT4.oid(), BINARY_FORMAT).unwrap_err();
        assert_eq!(err.code, sqlstate::INVALID_BINARY_REPRESENTATION);
    }

    #[rstest]
    #[case(Some(&b"t"[..]), Type::BOOL.oid(), TEXT_FORMAT, Value::Integer(1))]
    #[case(Some(&b"42"[..]), Type::INT8.oid(), TEXT_FORMAT, Value::Integer(42))]
    #[case(Some(&b"Sam"[..]), UNSPECIFIED_OID, TEXT_FORMAT, Value::from("Sam"))]
    #[case(Some(&b"\\x0102"[..]), Type::BYTEA.oid(), TEXT_FORMAT, Value::Blob(vec![1, 2]))]
    #[case(Some(&42i32.to_be_bytes()[..]), Type::INT4.oid(), BINARY_FORMAT, Value::Integer(42))]
    #[case(None, Type::INT4.oid(), BINARY_FORMAT, Value::Null)]
    fn test_decode_parameter(
        #[case] raw: Option<&[u8]>,
        #[case] oid: Oid,
        #[case] format: i16,
        #[case] expected: Value,
    ) {
        assert_eq!(decode_parameter(raw, oid, format).unwrap(), expected);
    }

    #[test]
    fn test_resolve_formats() {
        assert_eq!(resolve_formats(&[], 3, "result").unwrap(), vec![0, 0, 0]);
        assert_eq!(resolve_formats(&[1], 2, "result").unwrap(), vec![1, 1]);
        assert_eq!(resolve_formats(&[0, 1], 2, "result").unwrap(), vec![0, 1]);
        assert_eq!(
            resolve_formats(&[0, 1], 3, "result").unwrap_err().code,
            sqlstate::PROTOCOL_VIOLATION
        );
        assert!(resolve_formats(&[2], 1, "result").is_err());
    }
}
