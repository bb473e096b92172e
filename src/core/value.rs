/// Cell value carried by statement literals and the reference engine's rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text-protocol cell: `None` is sent as the NULL marker.
    #[must_use]
    pub fn to_text_cell(&self) -> Option<String> {
        match self {
            Self::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// SQL equality as used by `WHERE col = literal`; NULL never matches.
    #[must_use]
    pub fn sql_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => false,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Real(a), Self::Real(b)) => (a - b).abs() < f64::EPSILON,
            (Self::Integer(a), Self::Real(b)) | (Self::Real(b), Self::Integer(a)) => {
                (*a as f64 - b).abs() < f64::EPSILON
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Text(a), Self::Integer(b)) | (Self::Integer(b), Self::Text(a)) => {
                a.trim().parse::<i64>().is_ok_and(|v| v == *b)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::Integer(42).to_string(), "42");
        assert_eq!(Value::Real(3.5).to_string(), "3.5");
        assert_eq!(Value::Text("hello".to_string()).to_string(), "hello");
    }

    #[test]
    fn test_text_cell_null() {
        assert_eq!(Value::Null.to_text_cell(), None);
        assert_eq!(Value::Integer(7).to_text_cell(), Some("7".to_string()));
    }

    #[test]
    fn test_sql_eq() {
        assert!(Value::Integer(1).sql_eq(&Value::Integer(1)));
        assert!(Value::Text("5".into()).sql_eq(&Value::Integer(5)));
        assert!(!Value::Null.sql_eq(&Value::Null));
        assert!(!Value::Text("a".into()).sql_eq(&Value::Text("b".into())));
    }
}
