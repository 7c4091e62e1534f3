// ABOUTME: MySQL source reader - information_schema discovery and keyset page queries
// ABOUTME: Converts binary-protocol values to engine values and classifies transient errors

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{DriverError, OptsBuilder, Pool, Row};

use crate::error::{Endpoint, Result, SyncError};
use crate::schema::ColumnDescriptor;
use crate::utils::quote_mysql_ident;
use crate::value::{Record, Value};

use super::{PageRequest, SourceReader};

/// Server and client error codes worth retrying: too many connections,
/// shutdown in progress, lock wait timeout, deadlock, cannot connect,
/// server gone away, lost connection.
const TRANSIENT_CODES: &[u16] = &[1040, 1053, 1205, 1213, 2002, 2003, 2006, 2013];

/// Connection parameters for the source, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl MySqlParams {
    /// Read `MYSQL_HOST`, `MYSQL_PORT`, `MYSQL_USER`, `MYSQL_PASSWORD`, and
    /// `MYSQL_DATABASE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`MySqlParams::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match lookup("MYSQL_PORT").filter(|p| !p.is_empty()) {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                SyncError::Config(format!("MYSQL_PORT must be a port number, got '{}'", raw))
            })?,
            None => 3306,
        };

        let database = lookup("MYSQL_DATABASE").unwrap_or_default();
        if database.is_empty() {
            return Err(SyncError::Config("MYSQL_DATABASE is not set".to_string()));
        }

        Ok(Self {
            host: lookup("MYSQL_HOST")
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string()),
            port,
            user: lookup("MYSQL_USER").unwrap_or_default(),
            password: lookup("MYSQL_PASSWORD").unwrap_or_default(),
            database,
        })
    }
}

/// [`SourceReader`] over a MySQL connection pool.
pub struct MySqlReader {
    pool: Pool,
    display: String,
}

impl MySqlReader {
    /// Create a reader. Connections are opened lazily on first use.
    pub fn new(params: &MySqlParams) -> Self {
        let opts = OptsBuilder::default()
            .ip_or_hostname(params.host.clone())
            .tcp_port(params.port)
            .user(Some(params.user.clone()))
            .pass(Some(params.password.clone()))
            .db_name(Some(params.database.clone()));

        Self {
            pool: Pool::new(opts),
            display: format!(
                "mysql://{}@{}:{}/{}",
                params.user, params.host, params.port, params.database
            ),
        }
    }

    /// Close all pooled connections.
    pub async fn close(&self) -> Result<()> {
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(|e| classify(e, "Failed to close source pool"))
    }
}

#[async_trait]
impl SourceReader for MySqlReader {
    fn describe(&self) -> String {
        self.display.clone()
    }

    async fn discover_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| classify(e, "Failed to connect to source"))?;

        let rows: Vec<(String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE
                 FROM information_schema.COLUMNS
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
                 ORDER BY ORDINAL_POSITION",
                (table,),
            )
            .await
            .map_err(|e| classify(e, &format!("Failed to discover columns of {}", table)))?;

        if rows.is_empty() {
            return Err(SyncError::Source(format!(
                "table {} not found or has no columns",
                table
            )));
        }

        Ok(rows
            .into_iter()
            .map(|(name, source_type)| ColumnDescriptor::new(name, source_type))
            .collect())
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Record>> {
        let (query, params) = build_page_query(request);

        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| classify(e, "Failed to connect to source"))?;

        let rows: Vec<Row> = conn
            .exec(query, params)
            .await
            .map_err(|e| classify(e, &format!("Failed to read page from {}", request.table)))?;

        Ok(rows.iter().map(row_to_record).collect())
    }
}

/// Build the keyset query for one page.
///
/// ```sql
/// SELECT `id`, `updated_at` FROM `orders`
/// WHERE `updated_at` >= ? AND `updated_at` <= ?
/// ORDER BY `updated_at` ASC LIMIT 10000
/// ```
///
/// Returns the query and its positional parameters (the bounds, in order).
pub fn build_page_query(request: &PageRequest) -> (String, Vec<String>) {
    let cursor = quote_mysql_ident(&request.incremental_column);
    let projection = if request.columns.is_empty() {
        "*".to_string()
    } else {
        request
            .columns
            .iter()
            .map(|c| quote_mysql_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut predicates = Vec::new();
    let mut params = Vec::new();

    if let Some(lower) = &request.lower_bound {
        let op = if request.inclusive_lower { ">=" } else { ">" };
        predicates.push(format!("{} {} ?", cursor, op));
        params.push(lower.clone());
    }
    if let Some(upper) = &request.upper_bound {
        predicates.push(format!("{} <= ?", cursor));
        params.push(upper.clone());
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    let query = format!(
        "SELECT {} FROM {}{} ORDER BY {} ASC LIMIT {}",
        projection,
        quote_mysql_ident(&request.table),
        where_clause,
        cursor,
        request.limit
    );

    (query, params)
}

fn row_to_record(row: &Row) -> Record {
    let columns = row.columns_ref();
    let mut record = Record::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        let raw = row.as_ref(idx).cloned().unwrap_or(mysql_async::Value::NULL);
        record.insert(&column.name_str(), convert_value(raw, column.column_type()));
    }
    record
}

/// Convert a binary-protocol value.
///
/// DATE and DATETIME share one wire representation, so the column type
/// decides which one comes out. Zero dates become null.
fn convert_value(value: mysql_async::Value, column_type: ColumnType) -> Value {
    use mysql_async::Value as My;

    match value {
        My::NULL => Value::Null,
        My::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        My::Int(n) => Value::Int(n),
        My::UInt(n) => Value::UInt(n),
        My::Float(f) => Value::Float(f as f64),
        My::Double(d) => Value::Float(d),
        My::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                return Value::Null;
            };
            if matches!(
                column_type,
                ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE
            ) {
                return Value::Date(date);
            }
            chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .map(|time| Value::DateTime(date.and_time(time)))
                .unwrap_or(Value::Null)
        }
        My::Time(negative, days, hour, min, sec, micro) => {
            if !negative && days == 0 {
                if let Some(time) =
                    chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                {
                    return Value::Time(time);
                }
            }
            // Durations outside a wall-clock day keep MySQL's own rendering.
            let hours = days * 24 + hour as u32;
            let sign = if negative { "-" } else { "" };
            let fraction = if micro > 0 {
                format!(".{:06}", micro)
            } else {
                String::new()
            };
            Value::String(format!("{}{:02}:{:02}:{:02}{}", sign, hours, min, sec, fraction))
        }
    }
}

fn classify(err: mysql_async::Error, what: &str) -> SyncError {
    let message = format!("{}: {}", what, err);
    let transient = match &err {
        mysql_async::Error::Io(_) => true,
        mysql_async::Error::Driver(DriverError::ConnectionClosed) => true,
        mysql_async::Error::Server(server) => TRANSIENT_CODES.contains(&server.code),
        _ => false,
    };

    if transient {
        SyncError::transient(Endpoint::Source, message)
    } else {
        SyncError::Source(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(lower: Option<&str>, upper: Option<&str>, inclusive: bool) -> PageRequest {
        PageRequest {
            table: "orders".to_string(),
            columns: vec!["id".to_string(), "updated_at".to_string()],
            incremental_column: "updated_at".to_string(),
            lower_bound: lower.map(str::to_string),
            upper_bound: upper.map(str::to_string),
            limit: 10000,
            inclusive_lower: inclusive,
        }
    }

    #[test]
    fn test_build_page_query_first_page_is_inclusive() {
        let (query, params) = build_page_query(&request(Some("2024-01-01 00:00:00"), None, true));
        assert_eq!(
            query,
            "SELECT `id`, `updated_at` FROM `orders` WHERE `updated_at` >= ? \
             ORDER BY `updated_at` ASC LIMIT 10000"
        );
        assert_eq!(params, vec!["2024-01-01 00:00:00"]);
    }

    #[test]
    fn test_build_page_query_later_pages_are_exclusive() {
        let (query, _) = build_page_query(&request(Some("42"), None, false));
        assert!(query.contains("WHERE `updated_at` > ?"));
        assert!(!query.contains(">="));
    }

    #[test]
    fn test_build_page_query_without_lower_bound() {
        let (query, params) = build_page_query(&request(None, None, true));
        assert!(!query.contains("WHERE"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_build_page_query_bounded_window() {
        let (query, params) = build_page_query(&request(Some("10"), Some("20"), true));
        assert!(query.contains("WHERE `updated_at` >= ? AND `updated_at` <= ?"));
        assert_eq!(params, vec!["10", "20"]);
    }

    #[test]
    fn test_convert_date_follows_column_type() {
        let raw = mysql_async::Value::Date(2024, 3, 1, 0, 0, 0, 0);
        assert_eq!(
            convert_value(raw.clone(), ColumnType::MYSQL_TYPE_DATE),
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert!(matches!(
            convert_value(raw, ColumnType::MYSQL_TYPE_DATETIME),
            Value::DateTime(_)
        ));
        assert_eq!(
            convert_value(
                mysql_async::Value::Date(0, 0, 0, 0, 0, 0, 0),
                ColumnType::MYSQL_TYPE_DATETIME
            ),
            Value::Null
        );
    }

    #[test]
    fn test_convert_scalars() {
        assert_eq!(
            convert_value(mysql_async::Value::Bytes(b"abc".to_vec()), ColumnType::MYSQL_TYPE_VAR_STRING),
            Value::String("abc".to_string())
        );
        assert_eq!(
            convert_value(mysql_async::Value::Bytes(vec![0xff]), ColumnType::MYSQL_TYPE_BLOB),
            Value::Bytes(vec![0xff])
        );
        assert_eq!(
            convert_value(mysql_async::Value::Int(-5), ColumnType::MYSQL_TYPE_LONGLONG),
            Value::Int(-5)
        );
        assert_eq!(
            convert_value(mysql_async::Value::Time(true, 1, 2, 3, 4, 0), ColumnType::MYSQL_TYPE_TIME),
            Value::String("-26:03:04".to_string())
        );
    }

    #[test]
    fn test_params_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("MYSQL_USER", "etl"),
            ("MYSQL_PASSWORD", "secret"),
            ("MYSQL_DATABASE", "shop"),
        ]
        .into_iter()
        .collect();

        let params = MySqlParams::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(params.host, "localhost");
        assert_eq!(params.port, 3306);
        assert_eq!(params.database, "shop");
    }

    #[test]
    fn test_params_reject_bad_port_and_missing_database() {
        let bad_port = MySqlParams::from_lookup(|k| match k {
            "MYSQL_PORT" => Some("abc".to_string()),
            "MYSQL_DATABASE" => Some("shop".to_string()),
            _ => None,
        });
        assert!(matches!(bad_port, Err(SyncError::Config(_))));

        let no_db = MySqlParams::from_lookup(|_| None);
        assert!(matches!(no_db, Err(SyncError::Config(_))));
    }
}
