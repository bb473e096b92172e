use bytes::Bytes;
use std::collections::HashMap;

use super::constants::column_type;
use super::packet::{get_bytes, get_lenenc_bytes, get_u8, get_u16, get_u32, get_u64};
use crate::core::{ServerError, Value};

/// Server-side prepared statement (COM_STMT_PREPARE).
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub id: u32,
    pub query: String,
    pub param_count: u16,
    /// Types bound by the last COM_STMT_EXECUTE that sent them; clients only
    /// resend them when they change.
    pub param_types: Vec<u16>,
    /// COM_STMT_SEND_LONG_DATA chunks per parameter.
    pub long_data: HashMap<u16, Vec<u8>>,
}

impl PreparedStatement {
    /// Drops long data, as COM_STMT_RESET and each execution do.
    pub fn reset(&mut self) {
        self.long_data.clear();
    }
}

/// Prepared statements of one session, keyed by statement id.
#[derive(Debug)]
pub struct PreparedStatementCache {
    next_id: u32,
    statements: HashMap<u32, PreparedStatement>,
}

impl Default for PreparedStatementCache {
    fn default() -> Self {
        Self {
            next_id: 1,
            statements: HashMap::new(),
        }
    }
}

impl PreparedStatementCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a statement and returns its id.
    pub fn add_statement(&mut self, query: String) -> &PreparedStatement {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let param_count = count_placeholders(&query);
        self.statements.entry(id).or_insert(PreparedStatement {
            id,
            query,
            param_count,
            param_types: Vec::new(),
            long_data: HashMap::new(),
        })
    }

    #[must_use]
    pub fn get_statement(&self, id: u32) -> Option<&PreparedStatement> {
        self.statements.get(&id)
    }

    pub fn get_statement_mut(&mut self, id: u32) -> Option<&mut PreparedStatement> {
        self.statements.get_mut(&id)
    }

    pub fn remove_statement(&mut self, id: u32) -> bool {
        self.statements.remove(&id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn clear(&mut self) {
        self.statements.clear();
    }
}

/// Byte offsets of the `?` placeholders outside quotes and comments.
fn placeholder_positions(query: &str) -> Vec<usize> {
    let bytes = query.as_bytes();
    let mut positions = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q != b'`' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'?' => positions.push(i),
                b'#' => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    positions
}

#[must_use]
pub fn count_placeholders(query: &str) -> u16 {
    u16::try_from(placeholder_positions(query).len()).unwrap_or(u16::MAX)
}

/// Replaces each `?` with the matching parameter as an SQL literal.
#[must_use]
pub fn substitute_parameters(query: &str, params: &[Option<Value>]) -> String {
    let mut result = String::with_capacity(query.len() + params.len() * 8);
    let mut copied = 0;
    for (pos, param) in placeholder_positions(query).into_iter().zip(params) {
        result.push_str(&query[copied..pos]);
        match param {
            None | Some(Value::Null) => result.push_str("NULL"),
            Some(Value::Integer(n)) => result.push_str(&n.to_string()),
            Some(Value::Real(f)) => result.push_str(&f.to_string()),
            Some(Value::Text(s)) => {
                result.push('\'');
                result.push_str(&s.replace('\\', "\\\\").replace('\'', "''"));
                result.push('\'');
            }
        }
        copied = pos + 1;
    }
    result.push_str(&query[copied..]);
    result
}

/// Parameters of a COM_STMT_EXECUTE payload, read after the statement id,
/// flags and iteration count. New parameter types are stored on `stmt`.
pub fn decode_execute_params(
    payload: &mut Bytes,
    stmt: &mut PreparedStatement,
) -> Result<Vec<Option<Value>>, ServerError> {
    let count = usize::from(stmt.param_count);
    if count == 0 {
        return Ok(Vec::new());
    }
    let null_bitmap = get_bytes(payload, count.div_ceil(8))?;
    let new_params_bound = get_u8(payload)?;
    if new_params_bound == 1 {
        stmt.param_types = (0..count)
            .map(|_| get_u16(payload))
            .collect::<Result<_, _>>()?;
    }
    if stmt.param_types.len() != count {
        return Err(ServerError::WrongArguments("mysqld_stmt_execute".to_string()));
    }

    let mut values = Vec::with_capacity(count);
    for (i, ty) in stmt.param_types.iter().enumerate() {
        let index = u16::try_from(i).unwrap_or(u16::MAX);
        if let Some(data) = stmt.long_data.get(&index) {
            values.push(Some(Value::Text(String::from_utf8_lossy(data).into_owned())));
            continue;
        }
        if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
            values.push(None);
            continue;
        }
        values.push(decode_binary_value(payload, *ty)?);
    }
    Ok(values)
}

fn decode_binary_value(payload: &mut Bytes, ty: u16) -> Result<Option<Value>, ServerError> {
    let unsigned = ty & column_type::UNSIGNED_FLAG != 0;
    let base = (ty & 0xff) as u8;
    let value = match base {
        column_type::NULL => return Ok(None),
        column_type::TINY => {
            let v = get_u8(payload)?;
            Value::Integer(if unsigned { i64::from(v) } else { i64::from(v as i8) })
        }
        column_type::SHORT | column_type::YEAR => {
            let v = get_u16(payload)?;
            Value::Integer(if unsigned { i64::from(v) } else { i64::from(v as i16) })
        }
        column_type::LONG | column_type::INT24 => {
            let v = get_u32(payload)?;
            Value::Integer(if unsigned { i64::from(v) } else { i64::from(v as i32) })
        }
        column_type::LONGLONG => {
            let v = get_u64(payload)?;
            if unsigned {
                i64::try_from(v).map_or_else(|_| Value::Text(v.to_string()), Value::Integer)
            } else {
                Value::Integer(v as i64)
            }
        }
        column_type::FLOAT => Value::Real(f64::from(f32::from_bits(get_u32(payload)?))),
        column_type::DOUBLE => Value::Real(f64::from_bits(get_u64(payload)?)),
        column_type::DATE | column_type::DATETIME | column_type::TIMESTAMP => {
            Value::Text(decode_datetime(payload)?)
        }
        column_type::TIME => Value::Text(decode_time(payload)?),
        _ => {
            let raw = get_lenenc_bytes(payload)?;
            Value::Text(String::from_utf8_lossy(&raw).into_owned())
        }
    };
    Ok(Some(value))
}

fn decode_datetime(payload: &mut Bytes) -> Result<String, ServerError> {
    let len = get_u8(payload)?;
    let mut part = get_bytes(payload, usize::from(len))?;
    if len == 0 {
        return Ok("0000-00-00 00:00:00".to_string());
    }
    let year = get_u16(&mut part)?;
    let month = get_u8(&mut part)?;
    let day = get_u8(&mut part)?;
    if len == 4 {
        return Ok(format!("{year:04}-{month:02}-{day:02}"));
    }
    let hour = get_u8(&mut part)?;
    let minute = get_u8(&mut part)?;
    let second = get_u8(&mut part)?;
    let mut text = format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}");
    if len >= 11 {
        text.push_str(&format!(".{:06}", get_u32(&mut part)?));
    }
    Ok(text)
}

fn decode_time(payload: &mut Bytes) -> Result<String, ServerError> {
    let len = get_u8(payload)?;
    let mut part = get_bytes(payload, usize::from(len))?;
    if len == 0 {
        return Ok("00:00:00".to_string());
    }
    let negative = get_u8(&mut part)? == 1;
    let days = get_u32(&mut part)?;
    let hour = get_u8(&mut part)?;
    let minute = get_u8(&mut part)?;
    let second = get_u8(&mut part)?;
    let hours = u64::from(days) * 24 + u64::from(hour);
    let sign = if negative { "-" } else { "" };
    let mut text = format!("{sign}{hours:02}:{minute:02}:{second:02}");
    if len >= 12 {
        text.push_str(&format!(".{:06}", get_u32(&mut part)?));
    }
    Ok(text)
}
