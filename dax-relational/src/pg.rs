//! # PostgreSQL Backend
//!
//! Blocking PostgreSQL sessions over the `postgres` crate.
//!
//! - Statements may use `%s` positional placeholders or native `$n`.
//! - A transaction is opened with the first statement of a unit of work.
//! - Parameters are coerced to the prepared statement's parameter types so
//!   integers are written with the width the column expects. A value that
//!   does not fit its parameter type fails the statement.
//! - Result columns decode by type; `numeric` decodes to exact decimal text
//!   and types without a decoder come back as raw bytes.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::num::TryFromIntError;
use std::time::Duration;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::types::{FromSql, IsNull, Kind, ToSql, Type};
use postgres::{Client, Config, NoTls, Row as PgRow};
use tracing::debug;

use dax_common::{BoxError, RelationalConfig, Value};

use crate::backend::{Backend, Connection, ResultSet};

type SqlResult<T> = Result<T, Box<dyn StdError + Sync + Send>>;

/// TCP keepalive settings applied to every connection.
const KEEPALIVES_IDLE: Duration = Duration::from_secs(30);
const KEEPALIVES_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVES_RETRIES: u32 = 5;

/// Opens PostgreSQL connections from a driver `Config`.
#[derive(Clone)]
pub struct PgBackend {
    config: Config,
}

impl PgBackend {
    pub fn from_config(config: &RelationalConfig) -> Self {
        let mut pg = Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(&config.password)
            .keepalives(true)
            .keepalives_idle(KEEPALIVES_IDLE)
            .keepalives_interval(KEEPALIVES_INTERVAL)
            .keepalives_retries(KEEPALIVES_RETRIES);
        if let Some(timeout) = config.connect_timeout() {
            pg.connect_timeout(timeout);
        }
        PgBackend { config: pg }
    }

    pub fn with_config(config: Config) -> Self {
        PgBackend { config }
    }
}

impl Backend for PgBackend {
    type Connection = PgConnection;

    fn connect(&self) -> Result<PgConnection, BoxError> {
        let client = self.config.connect(NoTls)?;
        debug!("opened postgres session");
        Ok(PgConnection {
            client,
            in_transaction: false,
        })
    }
}

/// One PostgreSQL session.
pub struct PgConnection {
    client: Client,
    in_transaction: bool,
}

impl Connection for PgConnection {
    fn execute(&mut self, statement: &str, params: &[Value]) -> Result<ResultSet, BoxError> {
        if !self.in_transaction {
            self.client.batch_execute("BEGIN")?;
            self.in_transaction = true;
        }

        let sql = rewrite_placeholders(statement);
        let prepared = self.client.prepare(&sql)?;
        let bound = params
            .iter()
            .enumerate()
            .map(|(idx, value)| PgParam::for_type(value, prepared.params().get(idx)))
            .collect::<Result<Vec<_>, BoxError>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        if prepared.columns().is_empty() {
            let affected = self.client.execute(&prepared, &refs)?;
            return Ok(ResultSet {
                columns: Vec::new(),
                rows: Vec::new(),
                rows_affected: affected,
            });
        }

        let rows = self.client.query(&prepared, &refs)?;
        let columns = prepared
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect();
        let decoded = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, BoxError>>()?;
        Ok(ResultSet {
            columns,
            rows_affected: decoded.len() as u64,
            rows: decoded,
        })
    }

    fn commit(&mut self) -> Result<(), BoxError> {
        if self.in_transaction {
            self.in_transaction = false;
            self.client.batch_execute("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        if self.in_transaction {
            self.in_transaction = false;
            self.client.batch_execute("ROLLBACK")?;
        }
        Ok(())
    }

    fn is_broken(&mut self) -> bool {
        self.client.is_closed()
    }
}

/// Rewrites `%s` placeholders to `$1, $2, ..` and `%%` to `%`, leaving
/// quoted literals and identifiers untouched.
pub(crate) fn rewrite_placeholders(statement: &str) -> Cow<'_, str> {
    if !statement.contains('%') {
        return Cow::Borrowed(statement);
    }

    let mut out = String::with_capacity(statement.len() + 8);
    let mut chars = statement.chars().peekable();
    let mut index = 0usize;
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            out.push(ch);
            if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                out.push(ch);
            }
            '%' => match chars.peek() {
                Some('s') => {
                    chars.next();
                    index += 1;
                    out.push('$');
                    out.push_str(&index.to_string());
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            },
            _ => out.push(ch),
        }
    }

    Cow::Owned(out)
}

/// Owned parameter matched to the statement's parameter type.
#[derive(Debug, Clone, PartialEq)]
enum PgParam {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    Oid(u32),
    F32(f32),
    F64(f64),
    /// Decimal text sent in the binary `numeric` format.
    Numeric(String),
    Text(String),
    Json(String),
    Uuid([u8; 16]),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Array(Vec<PgParam>),
}

impl PgParam {
    /// Converts `value` for a parameter of type `target`. Values that cannot
    /// be represented in the target type are rejected, never truncated.
    fn for_type(value: &Value, target: Option<&Type>) -> Result<Self, BoxError> {
        Self::coerce(value, target.unwrap_or(&Type::UNKNOWN))
    }

    fn coerce(value: &Value, ty: &Type) -> Result<Self, BoxError> {
        let param = match value {
            Value::Null => PgParam::Null,
            Value::Bool(v) => PgParam::Bool(*v),
            Value::Int(v) => Self::coerce_int(*v, ty)?,
            Value::Float(v) => Self::coerce_float(*v, ty),
            Value::Text(v) => Self::coerce_text(v, ty)?,
            Value::Bytes(v) => PgParam::Bytes(v.clone()),
            Value::Date(v) => PgParam::Date(*v),
            Value::Timestamp(v) => match *ty {
                Type::TIMESTAMPTZ => PgParam::TimestampTz(v.and_utc()),
                _ => PgParam::Timestamp(*v),
            },
            Value::TimestampTz(v) => match *ty {
                Type::TIMESTAMP => PgParam::Timestamp(v.naive_utc()),
                _ => PgParam::TimestampTz(*v),
            },
            Value::Array(items) => {
                let member = match ty.kind() {
                    Kind::Array(member) => member.clone(),
                    _ => Type::UNKNOWN,
                };
                PgParam::Array(
                    items
                        .iter()
                        .map(|item| Self::coerce(item, &member))
                        .collect::<Result<_, _>>()?,
                )
            }
        };
        Ok(param)
    }

    fn coerce_int(value: i64, ty: &Type) -> Result<Self, BoxError> {
        let out_of_range = |_: TryFromIntError| -> BoxError {
            format!("value {value} is out of range for type {ty}").into()
        };
        let param = match *ty {
            Type::INT2 => PgParam::I16(i16::try_from(value).map_err(out_of_range)?),
            Type::INT4 => PgParam::I32(i32::try_from(value).map_err(out_of_range)?),
            Type::OID => PgParam::Oid(u32::try_from(value).map_err(out_of_range)?),
            Type::FLOAT4 => PgParam::F32(value as f32),
            Type::FLOAT8 => PgParam::F64(value as f64),
            Type::NUMERIC => PgParam::Numeric(value.to_string()),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => PgParam::Text(value.to_string()),
            _ => PgParam::I64(value),
        };
        Ok(param)
    }

    fn coerce_float(value: f64, ty: &Type) -> Self {
        match *ty {
            Type::FLOAT4 => PgParam::F32(value as f32),
            Type::NUMERIC => PgParam::Numeric(float_to_decimal(value)),
            _ => PgParam::F64(value),
        }
    }

    fn coerce_text(value: &str, ty: &Type) -> Result<Self, BoxError> {
        let invalid = || -> BoxError { format!("invalid input for type {ty}: {value:?}").into() };
        let trimmed = value.trim();
        let param = match *ty {
            Type::BOOL => PgParam::Bool(parse_bool(trimmed).ok_or_else(invalid)?),
            Type::INT2 => PgParam::I16(trimmed.parse().map_err(|_| invalid())?),
            Type::INT4 => PgParam::I32(trimmed.parse().map_err(|_| invalid())?),
            Type::INT8 => PgParam::I64(trimmed.parse().map_err(|_| invalid())?),
            Type::OID => PgParam::Oid(trimmed.parse().map_err(|_| invalid())?),
            Type::FLOAT4 => PgParam::F32(trimmed.parse().map_err(|_| invalid())?),
            Type::FLOAT8 => PgParam::F64(trimmed.parse().map_err(|_| invalid())?),
            Type::NUMERIC => {
                encode_numeric(trimmed, &mut BytesMut::new()).map_err(|_| invalid())?;
                PgParam::Numeric(trimmed.to_string())
            }
            Type::JSON | Type::JSONB => PgParam::Json(value.to_string()),
            Type::UUID => PgParam::Uuid(parse_uuid(trimmed).ok_or_else(invalid)?),
            Type::DATE => PgParam::Date(
                NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| invalid())?,
            ),
            Type::TIMESTAMP => PgParam::Timestamp(
                NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
                    .map_err(|_| invalid())?,
            ),
            Type::TIMESTAMPTZ => PgParam::TimestampTz(
                DateTime::parse_from_rfc3339(trimmed)
                    .map_err(|_| invalid())?
                    .with_timezone(&Utc),
            ),
            _ => PgParam::Text(value.to_string()),
        };
        Ok(param)
    }
}

fn mismatch(what: &str, ty: &Type) -> BoxError {
    format!("cannot encode {what} as parameter type {ty}").into()
}

// Every variant goes through a checked encoder so a value never lands in a
// column's binary format it does not belong to.
impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> SqlResult<IsNull> {
        match self {
            PgParam::Null => Ok(IsNull::Yes),
            PgParam::Bool(v) => v.to_sql_checked(ty, out),
            PgParam::I16(v) => v.to_sql_checked(ty, out),
            PgParam::I32(v) => v.to_sql_checked(ty, out),
            PgParam::I64(v) => v.to_sql_checked(ty, out),
            PgParam::Oid(v) => v.to_sql_checked(ty, out),
            PgParam::F32(v) => v.to_sql_checked(ty, out),
            PgParam::F64(v) => v.to_sql_checked(ty, out),
            PgParam::Numeric(v) => {
                if *ty != Type::NUMERIC {
                    return Err(mismatch("numeric", ty));
                }
                encode_numeric(v, out)?;
                Ok(IsNull::No)
            }
            PgParam::Text(v) => v.to_sql_checked(ty, out),
            PgParam::Json(v) => {
                match *ty {
                    Type::JSON => {}
                    // jsonb binary format version.
                    Type::JSONB => out.extend_from_slice(&[1]),
                    _ => return Err(mismatch("json", ty)),
                }
                out.extend_from_slice(v.as_bytes());
                Ok(IsNull::No)
            }
            PgParam::Uuid(v) => {
                if *ty != Type::UUID {
                    return Err(mismatch("uuid", ty));
                }
                out.extend_from_slice(v);
                Ok(IsNull::No)
            }
            PgParam::Bytes(v) => v.to_sql_checked(ty, out),
            PgParam::Date(v) => v.to_sql_checked(ty, out),
            PgParam::Timestamp(v) => v.to_sql_checked(ty, out),
            PgParam::TimestampTz(v) => v.to_sql_checked(ty, out),
            PgParam::Array(v) => v.to_sql_checked(ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    postgres::types::to_sql_checked!();
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_uuid(value: &str) -> Option<[u8; 16]> {
    let hex: Vec<u8> = value
        .trim_start_matches('{')
        .trim_end_matches('}')
        .bytes()
        .filter(|b| *b != b'-')
        .collect();
    if hex.len() != 32 || !hex.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let mut out = [0u8; 16];
    for (slot, pair) in out.iter_mut().zip(hex.chunks(2)) {
        let text = std::str::from_utf8(pair).ok()?;
        *slot = u8::from_str_radix(text, 16).ok()?;
    }
    Some(out)
}

fn float_to_decimal(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let text = if value > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else {
        // f64 Display never uses exponent notation.
        value.to_string()
    }
}

/// Raw column payload for types without a dedicated decoder.
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_: &Type, raw: &'a [u8]) -> SqlResult<Self> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>, BoxError> {
    (0..row.len()).map(|idx| decode_value(row, idx)).collect()
}

fn array<T: Into<Value>>(items: Vec<Option<T>>) -> Value {
    Value::Array(items.into_iter().map(Value::from).collect())
}

fn decode_value(row: &PgRow, idx: usize) -> Result<Value, BoxError> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(Value::from),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(Value::from),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        }
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map(|time| Value::Text(time.to_string())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(Value::TimestampTz),
        Type::BOOL_ARRAY => row.try_get::<_, Option<Vec<Option<bool>>>>(idx)?.map(array),
        Type::INT2_ARRAY => row.try_get::<_, Option<Vec<Option<i16>>>>(idx)?.map(array),
        Type::INT4_ARRAY => row.try_get::<_, Option<Vec<Option<i32>>>>(idx)?.map(array),
        Type::INT8_ARRAY => row.try_get::<_, Option<Vec<Option<i64>>>>(idx)?.map(array),
        Type::FLOAT4_ARRAY => row.try_get::<_, Option<Vec<Option<f32>>>>(idx)?.map(array),
        Type::FLOAT8_ARRAY => row.try_get::<_, Option<Vec<Option<f64>>>>(idx)?.map(array),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<Option<String>>>>(idx)?
            .map(array),
        _ => match row.try_get::<_, Option<RawValue>>(idx)? {
            Some(raw) => Some(decode_raw(&ty, raw.0)?),
            None => None,
        },
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Decodes binary payloads of types without a typed decoder. Payloads whose
/// binary format is not text are returned as bytes.
fn decode_raw(ty: &Type, raw: Vec<u8>) -> Result<Value, BoxError> {
    match *ty {
        Type::NUMERIC => Ok(Value::Text(numeric_to_string(&raw)?)),
        Type::UUID => Ok(Value::Text(uuid_to_string(&raw)?)),
        Type::JSON | Type::XML => Ok(Value::Text(String::from_utf8(raw)?)),
        Type::JSONB => match raw.split_first() {
            Some((1, body)) => Ok(Value::Text(String::from_utf8(body.to_vec())?)),
            _ => Err("unsupported jsonb format version".into()),
        },
        _ if matches!(ty.kind(), Kind::Enum(_)) || <String as FromSql<'_>>::accepts(ty) => {
            Ok(Value::Text(String::from_utf8(raw)?))
        }
        _ => {
            debug!(column_type = %ty, "returning undecoded column as bytes");
            Ok(Value::Bytes(raw))
        }
    }
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;
const NUMERIC_MAX_DSCALE: usize = 0x3FFF;

/// Renders the binary `numeric` format (base-10000 digit groups) as text.
fn numeric_to_string(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() < 8 {
        return Err("numeric payload too short".into());
    }
    let header = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
    let ndigits = header(0) as usize;
    let weight = header(2) as i16 as i32;
    let sign = header(4);
    let dscale = header(6) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric payload truncated".into());
    }
    let digit = |pos: i32| -> u16 {
        if pos < 0 || pos as usize >= ndigits {
            0
        } else {
            header(8 + pos as usize * 2)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                out.push_str(&digit(pos).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(pos)));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(pos)));
            pos += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

/// Writes decimal text (`-12.50`, `NaN`, `Infinity`) in the binary
/// `numeric` format.
fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
    let write = |out: &mut BytesMut, ndigits: u16, weight: i16, sign: u16, dscale: u16| {
        out.extend_from_slice(&ndigits.to_be_bytes());
        out.extend_from_slice(&weight.to_be_bytes());
        out.extend_from_slice(&sign.to_be_bytes());
        out.extend_from_slice(&dscale.to_be_bytes());
    };

    let special = match text.to_ascii_lowercase().as_str() {
        "nan" => Some(NUMERIC_NAN),
        "infinity" | "+infinity" | "inf" | "+inf" => Some(NUMERIC_PINF),
        "-infinity" | "-inf" => Some(NUMERIC_NINF),
        _ => None,
    };
    if let Some(sign) = special {
        write(out, 0, 0, sign, 0);
        return Ok(());
    }

    let invalid = || -> BoxError { format!("invalid numeric literal {text:?}").into() };
    let (sign, body) = match text.strip_prefix('-') {
        Some(rest) => (NUMERIC_NEG, rest),
        None => (NUMERIC_POS, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }
    let dscale = frac_part.len();
    if dscale > NUMERIC_MAX_DSCALE {
        return Err(invalid());
    }

    let int_digits = int_part.trim_start_matches('0');
    let int_pad = (4 - int_digits.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let mut padded = String::with_capacity(int_pad + body.len() + frac_pad);
    padded.extend(std::iter::repeat('0').take(int_pad));
    padded.push_str(int_digits);
    padded.push_str(frac_part);
    padded.extend(std::iter::repeat('0').take(frac_pad));

    let mut groups: Vec<u16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
        .collect();
    let mut weight = ((int_pad + int_digits.len()) / 4) as i64 - 1;
    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i64;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    if groups.is_empty() {
        write(out, 0, 0, NUMERIC_POS, dscale as u16);
        return Ok(());
    }
    let ndigits = u16::try_from(groups.len()).map_err(|_| invalid())?;
    let weight = i16::try_from(weight).map_err(|_| invalid())?;
    write(out, ndigits, weight, sign, dscale as u16);
    for group in groups {
        out.extend_from_slice(&group.to_be_bytes());
    }
    Ok(())
}

fn uuid_to_string(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() != 16 {
        return Err("uuid payload must be 16 bytes".into());
    }
    let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}
