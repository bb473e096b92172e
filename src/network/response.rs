//! Responses and their wire encoding.
//!
//! The dispatch core never writes to a socket. It hands [`Response`] values
//! to a [`ResultWriter`]; the connection task encodes whatever the buffer
//! collected once the command is finished.

use bytes::{BufMut, BytesMut};

use super::constants::{capability, column_type};
use super::packet::{put_lenenc_int, put_lenenc_str, write_frames};
use crate::core::ServerError;

const UTF8_GENERAL_CI: u16 = 33;
const BINARY_CHARSET: u16 = 63;

/// Result set column. Every value travels as text, so most columns are
/// `VAR_STRING`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub column_type: u8,
}

impl Column {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            name: name.into(),
            column_type: column_type::VAR_STRING,
        }
    }

    #[must_use]
    pub fn of_table(schema: &str, table: &str, name: impl Into<String>) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn with_type(mut self, column_type: u8) -> Self {
        self.column_type = column_type;
        self
    }

    fn encode(&self, out: &mut BytesMut, field_list: bool) {
        put_lenenc_str(out, b"def");
        put_lenenc_str(out, self.schema.as_bytes());
        put_lenenc_str(out, self.table.as_bytes());
        put_lenenc_str(out, self.table.as_bytes());
        put_lenenc_str(out, self.name.as_bytes());
        put_lenenc_str(out, self.name.as_bytes());
        put_lenenc_int(out, 0x0c);
        let numeric = matches!(
            self.column_type,
            column_type::TINY | column_type::SHORT | column_type::LONG | column_type::LONGLONG
        );
        out.put_u16_le(if numeric { BINARY_CHARSET } else { UTF8_GENERAL_CI });
        out.put_u32_le(if numeric { 21 } else { 255 });
        out.put_u8(self.column_type);
        out.put_u16_le(0);
        out.put_u8(0);
        out.put_u16_le(0);
        if field_list {
            // no default value
            out.put_u8(0xFB);
        }
    }
}

/// Text rows; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    #[must_use]
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_column_names(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| Column::new(*n)).collect())
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) {
        self.rows.push(row);
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cell lookup by column name, for tests and diagnostics.
    #[must_use]
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(OkPacket),
    Error {
        code: u16,
        sqlstate: String,
        message: String,
    },
    ResultSet {
        result: ResultSet,
        status: u16,
        warnings: u16,
        /// Rows in the prepared-statement (binary) format.
        binary: bool,
    },
    Eof {
        status: u16,
        warnings: u16,
    },
    /// Bare string payload (COM_STATISTICS).
    Text(String),
    /// COM_FIELD_LIST reply.
    FieldList {
        columns: Vec<Column>,
        status: u16,
    },
    /// COM_STMT_PREPARE reply.
    Prepared {
        statement_id: u32,
        params: u16,
        warnings: u16,
    },
}

impl Response {
    #[must_use]
    pub fn error(err: &ServerError) -> Self {
        Self::Error {
            code: err.code(),
            sqlstate: err.sqlstate().to_string(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    #[must_use]
    pub const fn error_code(&self) -> Option<u16> {
        match self {
            Self::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Status flags carried by the response, if it carries any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Ok(ok) => Some(ok.status),
            Self::ResultSet { status, .. }
            | Self::Eof { status, .. }
            | Self::FieldList { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// ORs `bits` into the status word, for responses that carry one.
    pub fn add_status(&mut self, bits: u16) {
        match self {
            Self::Ok(ok) => ok.status |= bits,
            Self::ResultSet { status, .. }
            | Self::Eof { status, .. }
            | Self::FieldList { status, .. } => *status |= bits,
            _ => {}
        }
    }

    #[must_use]
    pub const fn result_set(&self) -> Option<&ResultSet> {
        match self {
            Self::ResultSet { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Appends the framed encoding; returns the next sequence id.
    pub fn encode(&self, out: &mut BytesMut, seq: u8, capabilities: u32) -> u8 {
        let deprecate_eof = capabilities & capability::DEPRECATE_EOF != 0;
        match self {
            Self::Ok(ok) => write_frames(out, &ok_payload(ok, 0x00), seq),
            Self::Error {
                code,
                sqlstate,
                message,
            } => {
                let mut p = BytesMut::with_capacity(9 + message.len());
                p.put_u8(0xFF);
                p.put_u16_le(*code);
                p.put_u8(b'#');
                p.put_slice(sqlstate.as_bytes());
                p.put_slice(message.as_bytes());
                write_frames(out, &p, seq)
            }
            Self::Eof { status, warnings } => write_frames(out, &eof_payload(*status, *warnings), seq),
            Self::Text(text) => write_frames(out, text.as_bytes(), seq),
            Self::ResultSet {
                result,
                status,
                warnings,
                binary,
            } => encode_result_set(out, seq, result, *status, *warnings, *binary, deprecate_eof),
            Self::FieldList { columns, status } => {
                let mut seq = seq;
                for column in columns {
                    let mut p = BytesMut::new();
                    column.encode(&mut p, true);
                    seq = write_frames(out, &p, seq);
                }
                write_frames(out, &eof_payload(*status, 0), seq)
            }
            Self::Prepared {
                statement_id,
                params,
                warnings,
            } => {
                let mut p = BytesMut::with_capacity(12);
                p.put_u8(0x00);
                p.put_u32_le(*statement_id);
                p.put_u16_le(0);
                p.put_u16_le(*params);
                p.put_u8(0);
                p.put_u16_le(*warnings);
                let mut seq = write_frames(out, &p, seq);
                if *params > 0 {
                    for _ in 0..*params {
                        let mut col = BytesMut::new();
                        Column::new("?").encode(&mut col, false);
                        seq = write_frames(out, &col, seq);
                    }
                    if !deprecate_eof {
                        seq = write_frames(out, &eof_payload(0, 0), seq);
                    }
                }
                seq
            }
        }
    }
}

fn ok_payload(ok: &OkPacket, header: u8) -> BytesMut {
    let mut p = BytesMut::with_capacity(16 + ok.info.len());
    p.put_u8(header);
    put_lenenc_int(&mut p, ok.affected_rows);
    put_lenenc_int(&mut p, ok.last_insert_id);
    p.put_u16_le(ok.status);
    p.put_u16_le(ok.warnings);
    p.put_slice(ok.info.as_bytes());
    p
}

fn eof_payload(status: u16, warnings: u16) -> BytesMut {
    let mut p = BytesMut::with_capacity(5);
    p.put_u8(0xFE);
    p.put_u16_le(warnings);
    p.put_u16_le(status);
    p
}

fn encode_result_set(
    out: &mut BytesMut,
    mut seq: u8,
    result: &ResultSet,
    status: u16,
    warnings: u16,
    binary: bool,
    deprecate_eof: bool,
) -> u8 {
    let mut count = BytesMut::new();
    put_lenenc_int(&mut count, result.columns.len() as u64);
    seq = write_frames(out, &count, seq);

    for column in &result.columns {
        let mut p = BytesMut::new();
        column.encode(&mut p, false);
        seq = write_frames(out, &p, seq);
    }
    if !deprecate_eof {
        seq = write_frames(out, &eof_payload(status, warnings), seq);
    }

    for row in &result.rows {
        let mut p = BytesMut::new();
        if binary {
            encode_binary_row(&mut p, row);
        } else {
            for cell in row {
                match cell {
                    Some(value) => put_lenenc_str(&mut p, value.as_bytes()),
                    None => p.put_u8(0xFB),
                }
            }
        }
        seq = write_frames(out, &p, seq);
    }

    if deprecate_eof {
        let ok = OkPacket {
            status,
            warnings,
            ..OkPacket::default()
        };
        write_frames(out, &ok_payload(&ok, 0xFE), seq)
    } else {
        write_frames(out, &eof_payload(status, warnings), seq)
    }
}

/// Binary protocol row: header, NULL bitmap with a 2-bit offset, then the
/// non-NULL values. All columns are strings so every value is length
/// encoded.
fn encode_binary_row(p: &mut BytesMut, row: &[Option<String>]) {
    p.put_u8(0x00);
    let mut bitmap = vec![0u8; (row.len() + 7 + 2) / 8];
    for (i, cell) in row.iter().enumerate() {
        if cell.is_none() {
            let bit = i + 2;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }
    p.put_slice(&bitmap);
    for value in row.iter().flatten() {
        put_lenenc_str(p, value.as_bytes());
    }
}

/// Sink for the responses of one command.
pub trait ResultWriter {
    fn write(&mut self, response: Response);

    fn send_ok(&mut self, ok: OkPacket) {
        self.write(Response::Ok(ok));
    }

    fn send_error(&mut self, err: &ServerError) {
        self.write(Response::error(err));
    }

    fn send_result_set(&mut self, result: ResultSet, status: u16, warnings: u16) {
        self.write(Response::ResultSet {
            result,
            status,
            warnings,
            binary: false,
        });
    }

    fn send_eof(&mut self, status: u16, warnings: u16) {
        self.write(Response::Eof { status, warnings });
    }
}

/// Collects responses in memory.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    responses: Vec<Response>,
}

impl ResponseBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    pub fn take(&mut self) -> Vec<Response> {
        std::mem::take(&mut self.responses)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Response> {
        self.responses.last()
    }

    /// Frames every collected response, starting at `seq`.
    #[must_use]
    pub fn encode(&self, seq: u8, capabilities: u32) -> BytesMut {
        let mut out = BytesMut::new();
        let mut seq = seq;
        for response in &self.responses {
            seq = response.encode(&mut out, seq, capabilities);
        }
        out
    }
}

impl ResultWriter for ResponseBuffer {
    fn write(&mut self, response: Response) {
        self.responses.push(response);
    }
}
